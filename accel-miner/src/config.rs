//! Daemon configuration.
//!
//! Parsed from environment variables, in the same spirit as the rest of the
//! daemon's knobs; there is no config file.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::accel::RegisterLayout;
use crate::error::{Error, Result};
use crate::thermal::DEFAULT_TEMP_PATH;

/// Clock register value programmed before each reset.
pub const DEFAULT_CLOCK_SPEED: u32 = 110;

/// Run-wait tick, which also bounds restart latency.
pub const DEFAULT_WAIT_TICK: Duration = Duration::from_millis(200);

/// Leading zero bits required of demonstration work.
pub const DEFAULT_DIFFICULTY_BITS: u32 = 20;

#[derive(Debug, Clone, PartialEq)]
pub struct AccelConfig {
    /// Character device to drive, if any.
    pub device_path: Option<PathBuf>,

    /// Number of simulated accelerators.
    pub sim_devices: usize,

    pub layout: RegisterLayout,

    pub clock_speed: u32,

    pub wait_tick: Duration,

    pub temp_path: PathBuf,

    pub difficulty_bits: u32,
}

impl Default for AccelConfig {
    fn default() -> Self {
        Self {
            device_path: None,
            sim_devices: 1,
            layout: RegisterLayout::Mask,
            clock_speed: DEFAULT_CLOCK_SPEED,
            wait_tick: DEFAULT_WAIT_TICK,
            temp_path: PathBuf::from(DEFAULT_TEMP_PATH),
            difficulty_bits: DEFAULT_DIFFICULTY_BITS,
        }
    }
}

impl AccelConfig {
    /// Parse configuration from environment variables.
    ///
    /// # Environment Variables
    ///
    /// - `ACCEL_DEVICE`: character device node to drive (Linux only)
    /// - `ACCEL_SIM_DEVICES`: simulated accelerators (default: 1 without
    ///   `ACCEL_DEVICE`, 0 with it)
    /// - `ACCEL_LAYOUT`: `mask` or `count` (default: mask)
    /// - `ACCEL_CLOCK`: clock register value (default: 110)
    /// - `ACCEL_WAIT_TICK_MS`: run-wait tick in milliseconds (default: 200)
    /// - `ACCEL_TEMP_FILE`: temperature file (default: Zynq XADC node)
    /// - `ACCEL_DIFFICULTY_BITS`: leading zero bits of demo work (default: 20)
    pub fn from_env() -> Result<Self> {
        let device_path = std::env::var_os("ACCEL_DEVICE").map(PathBuf::from);
        let default_sims = if device_path.is_some() { 0 } else { 1 };

        let wait_tick_ms: u64 = parse_var("ACCEL_WAIT_TICK_MS", 200)?;
        if wait_tick_ms == 0 {
            return Err(Error::Config("ACCEL_WAIT_TICK_MS must be positive".into()));
        }

        let difficulty_bits = parse_var("ACCEL_DIFFICULTY_BITS", DEFAULT_DIFFICULTY_BITS)?;
        if difficulty_bits > 256 {
            return Err(Error::Config(format!(
                "ACCEL_DIFFICULTY_BITS={} exceeds 256",
                difficulty_bits
            )));
        }

        Ok(Self {
            device_path,
            sim_devices: parse_var("ACCEL_SIM_DEVICES", default_sims)?,
            layout: parse_var("ACCEL_LAYOUT", RegisterLayout::Mask)?,
            clock_speed: parse_var("ACCEL_CLOCK", DEFAULT_CLOCK_SPEED)?,
            wait_tick: Duration::from_millis(wait_tick_ms),
            temp_path: std::env::var_os("ACCEL_TEMP_FILE")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from(DEFAULT_TEMP_PATH)),
            difficulty_bits,
        })
    }

    /// Clock value to program, if the layout has a clock register.
    pub fn clock_for_layout(&self) -> Option<u32> {
        self.layout.has_clock().then_some(self.clock_speed)
    }
}

fn parse_var<T: FromStr>(name: &str, default: T) -> Result<T> {
    match std::env::var(name) {
        Ok(value) => value
            .trim()
            .parse()
            .map_err(|_| Error::Config(format!("{}: invalid value {:?}", name, value))),
        Err(_) => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    const VARS: &[&str] = &[
        "ACCEL_DEVICE",
        "ACCEL_SIM_DEVICES",
        "ACCEL_LAYOUT",
        "ACCEL_CLOCK",
        "ACCEL_WAIT_TICK_MS",
        "ACCEL_TEMP_FILE",
        "ACCEL_DIFFICULTY_BITS",
    ];

    fn clear_env() {
        for var in VARS {
            std::env::remove_var(var);
        }
    }

    #[test]
    #[serial]
    fn test_defaults() {
        clear_env();

        let config = AccelConfig::from_env().unwrap();
        assert_eq!(config, AccelConfig::default());
        assert_eq!(config.clock_for_layout(), Some(110));
    }

    #[test]
    #[serial]
    fn test_device_disables_default_simulators() {
        clear_env();
        std::env::set_var("ACCEL_DEVICE", "/dev/sha256");
        std::env::set_var("ACCEL_LAYOUT", "count");

        let config = AccelConfig::from_env().unwrap();
        assert_eq!(config.device_path, Some(PathBuf::from("/dev/sha256")));
        assert_eq!(config.sim_devices, 0);
        assert_eq!(config.layout, RegisterLayout::ZeroCount);
        assert_eq!(config.clock_for_layout(), None);

        clear_env();
    }

    #[test]
    #[serial]
    fn test_numeric_overrides() {
        clear_env();
        std::env::set_var("ACCEL_SIM_DEVICES", "3");
        std::env::set_var("ACCEL_WAIT_TICK_MS", "50");
        std::env::set_var("ACCEL_DIFFICULTY_BITS", "12");
        std::env::set_var("ACCEL_TEMP_FILE", "/tmp/temp");

        let config = AccelConfig::from_env().unwrap();
        assert_eq!(config.sim_devices, 3);
        assert_eq!(config.wait_tick, Duration::from_millis(50));
        assert_eq!(config.difficulty_bits, 12);
        assert_eq!(config.temp_path, PathBuf::from("/tmp/temp"));

        clear_env();
    }

    #[test]
    #[serial]
    fn test_invalid_values_rejected() {
        clear_env();

        std::env::set_var("ACCEL_LAYOUT", "diagonal");
        assert!(matches!(AccelConfig::from_env(), Err(Error::Config(_))));
        std::env::remove_var("ACCEL_LAYOUT");

        std::env::set_var("ACCEL_WAIT_TICK_MS", "0");
        assert!(matches!(AccelConfig::from_env(), Err(Error::Config(_))));
        std::env::remove_var("ACCEL_WAIT_TICK_MS");

        std::env::set_var("ACCEL_DIFFICULTY_BITS", "300");
        assert!(matches!(AccelConfig::from_env(), Err(Error::Config(_))));

        clear_env();
    }
}
