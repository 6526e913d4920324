//! Core types for accel-miner.
//!
//! Re-exports the rust-bitcoin types the miner works with and defines the
//! small mining-specific value types shared across modules.

pub use bitcoin::block::Header as BlockHeader;
pub use bitcoin::{BlockHash, Target};

use std::fmt;
use std::time::Duration;

use crate::u256::U256;

// Conversions between U256 and bitcoin's Target type. These live here rather
// than in u256.rs to avoid coupling the generic integer type to bitcoin.

impl From<Target> for U256 {
    fn from(target: Target) -> Self {
        Self::from_le_bytes(target.to_le_bytes())
    }
}

impl From<U256> for Target {
    fn from(u: U256) -> Self {
        Target::from_le_bytes(u.to_le_bytes())
    }
}

/// Target whose value has exactly `bits` leading zero bits followed by ones.
///
/// `bits >= 256` gives the zero target, which no hash can meet.
pub fn target_with_leading_zeros(bits: u32) -> Target {
    Target::from(U256::MAX >> bits)
}

/// Hashrate measurement.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct HashRate(pub u64); // hashes per second

impl HashRate {
    /// Rate achieved by `hashes` evaluations over `elapsed`.
    pub fn from_hashes(hashes: u64, elapsed: Duration) -> Self {
        let secs = elapsed.as_secs_f64();
        if secs <= 0.0 {
            return Self(0);
        }
        Self((hashes as f64 / secs) as u64)
    }

    /// Get value as kilohashes per second
    pub fn as_kilohashes(&self) -> f64 {
        self.0 as f64 / 1_000.0
    }

    /// Get value as megahashes per second
    pub fn as_megahashes(&self) -> f64 {
        self.0 as f64 / 1_000_000.0
    }

    /// Format as human-readable string with appropriate units
    pub fn to_human_readable(&self) -> String {
        if self.0 >= 1_000_000 {
            format!("{:.2} MH/s", self.as_megahashes())
        } else if self.0 >= 1_000 {
            format!("{:.2} kH/s", self.as_kilohashes())
        } else {
            format!("{} H/s", self.0)
        }
    }
}

impl fmt::Display for HashRate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_human_readable())
    }
}
