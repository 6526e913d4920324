//! Daemon lifecycle management for accel-miner.
//!
//! This module handles the core daemon functionality including self-test,
//! device setup, task management, signal handling, and graceful shutdown.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tokio::signal::unix::{self, SignalKind};
use tokio::sync::mpsc;
use tokio_util::{sync::CancellationToken, task::TaskTracker};

use crate::tracing::prelude::*;
use crate::{
    accel::Device,
    config::AccelConfig,
    hasher,
    scanner::{ScannerConfig, WorkScanner},
    sim::{SimConfig, SimulatedCore},
    thermal::ThermalSensor,
    thread::{AccelThread, ThreadEvent},
    types::target_with_leading_zeros,
    work::DemoWorkSource,
};

/// How often every thread's status line is logged.
const STATUS_INTERVAL: Duration = Duration::from_secs(30);

/// The main daemon.
pub struct Daemon {
    shutdown: CancellationToken,
    tracker: TaskTracker,
}

impl Daemon {
    /// Create a new daemon instance.
    pub fn new() -> Self {
        Self {
            shutdown: CancellationToken::new(),
            tracker: TaskTracker::new(),
        }
    }

    /// Run the daemon until shutdown is requested.
    pub async fn run(self) -> anyhow::Result<()> {
        hasher::self_test().context("SHA-256 self-test failed")?;
        debug!("SHA-256 self-test passed");

        let config = AccelConfig::from_env()?;
        let devices = build_devices(&config)?;
        if devices.is_empty() {
            anyhow::bail!("No accelerators configured (set ACCEL_DEVICE or ACCEL_SIM_DEVICES)");
        }

        let thermal = Arc::new(ThermalSensor::new(&config.temp_path));
        let scanner_config = ScannerConfig {
            wait_tick: config.wait_tick,
            clock_speed: config.clock_for_layout(),
            ..ScannerConfig::default()
        };

        let mut threads = Vec::with_capacity(devices.len());
        for (index, device) in devices.into_iter().enumerate() {
            info!(
                device = device.name(),
                layout = %device.layout(),
                "Accelerator added"
            );
            let scanner = WorkScanner::new(device, scanner_config.clone())
                .with_thermal(Arc::clone(&thermal));
            let mut thread = AccelThread::spawn(
                format!("accel{}", index),
                scanner,
                &self.tracker,
                self.shutdown.clone(),
            );
            let events = thread
                .take_event_receiver()
                .context("event receiver already taken")?;
            let thread = Arc::new(thread);
            threads.push(Arc::clone(&thread));

            let source = DemoWorkSource::new(target_with_leading_zeros(config.difficulty_bits));
            self.tracker
                .spawn(dispatch(thread, events, source, self.shutdown.clone()));
        }

        self.tracker
            .spawn(report_status(threads, thermal, self.shutdown.clone()));

        self.tracker.close();

        info!("Started.");
        info!("For debugging, set RUST_LOG=accel_miner=debug or trace.");

        // Install signal handlers
        let mut sigint = unix::signal(SignalKind::interrupt())?;
        let mut sigterm = unix::signal(SignalKind::terminate())?;

        // Wait for shutdown signal
        tokio::select! {
            _ = sigint.recv() => {
                info!("Received SIGINT.");
            },
            _ = sigterm.recv() => {
                info!("Received SIGTERM.");
            },
        }

        // Initiate shutdown
        self.shutdown.cancel();

        // Wait for all tasks to complete
        self.tracker.wait().await;
        info!("Exiting.");

        Ok(())
    }
}

impl Default for Daemon {
    fn default() -> Self {
        Self::new()
    }
}

fn build_devices(config: &AccelConfig) -> anyhow::Result<Vec<Arc<dyn Device>>> {
    let mut devices: Vec<Arc<dyn Device>> = Vec::new();

    if let Some(path) = &config.device_path {
        devices.push(char_device(path, config)?);
    }

    for index in 0..config.sim_devices {
        let sim_config = SimConfig {
            layout: config.layout,
            ..SimConfig::default()
        };
        let (driver, _core) = SimulatedCore::with_driver(format!("sim{}", index), sim_config)
            .context("failed to start simulated accelerator")?;
        devices.push(Arc::new(driver));
    }

    Ok(devices)
}

#[cfg(target_os = "linux")]
fn char_device(path: &std::path::Path, config: &AccelConfig) -> anyhow::Result<Arc<dyn Device>> {
    use crate::transport::{chardev::CharDevice, probe_char_device};

    let info = probe_char_device(path)?;
    Ok(Arc::new(CharDevice::new(info.path, config.layout)))
}

#[cfg(not(target_os = "linux"))]
fn char_device(path: &std::path::Path, _config: &AccelConfig) -> anyhow::Result<Arc<dyn Device>> {
    anyhow::bail!(
        "{}: character device accelerators are only supported on Linux",
        path.display()
    )
}

/// Keep one thread supplied with work and log what it finds.
async fn dispatch(
    thread: Arc<AccelThread>,
    mut events: mpsc::Receiver<ThreadEvent>,
    mut source: DemoWorkSource,
    shutdown: CancellationToken,
) {
    let name = thread.name().to_string();

    if let Err(e) = thread.replace_work(source.next_work()).await {
        error!(thread = %name, error = %e, "Failed to assign initial work");
        return;
    }

    loop {
        let event = tokio::select! {
            event = events.recv() => match event {
                Some(event) => event,
                None => break,
            },
            _ = shutdown.cancelled() => break,
        };

        match event {
            ThreadEvent::ShareFound(share) => {
                info!(
                    thread = %name,
                    nonce = format_args!("{:#010x}", share.nonce),
                    hash = %share.hash,
                    "Share found"
                );
            }
            ThreadEvent::FalsePositive { nonce, .. } => {
                debug!(
                    thread = %name,
                    nonce = format_args!("{:#010x}", nonce),
                    "Candidate rejected by target check"
                );
            }
            ThreadEvent::WorkComplete { hashes, .. } => {
                trace!(thread = %name, hashes, "Work complete");
                if let Err(e) = thread.replace_work(source.next_work()).await {
                    debug!(thread = %name, error = %e, "Thread stopped accepting work");
                    break;
                }
            }
            ThreadEvent::Fault(reason) => {
                warn!(thread = %name, %reason, "Accelerator fault");
                // Back off before the completion that follows asks for more
                // work, so a missing or wedged device does not spin
                tokio::select! {
                    _ = tokio::time::sleep(Duration::from_secs(1)) => {}
                    _ = shutdown.cancelled() => break,
                }
            }
            ThreadEvent::StatusUpdate(status) => {
                trace!(
                    thread = %name,
                    hashrate = %status.hashrate.to_human_readable(),
                    shares = status.shares_found,
                    "Status update"
                );
            }
        }
    }
}

async fn report_status(
    threads: Vec<Arc<AccelThread>>,
    thermal: Arc<ThermalSensor>,
    shutdown: CancellationToken,
) {
    let mut interval = tokio::time::interval(STATUS_INTERVAL);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = interval.tick() => {}
            _ = shutdown.cancelled() => break,
        }

        thermal.refresh().await;
        for thread in &threads {
            let status = thread.status();
            info!(
                thread = thread.name(),
                hashrate = %status.hashrate.to_human_readable(),
                shares = status.shares_found,
                false_positives = status.false_positives,
                errors = status.hardware_errors,
                device = %thread.status_line(),
                "Status"
            );
        }
    }
}
