//! Accelerator temperature telemetry.
//!
//! The FPGA's on-die ADC publishes its temperature as plain text in sysfs.
//! Reads are bounded by a timeout and never fail the caller: on any error the
//! last good reading is kept.

use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use crate::tracing::prelude::*;

/// Zynq XADC temperature node.
pub const DEFAULT_TEMP_PATH: &str = "/sys/devices/amba.0/f8007100.ps7-xadc/temp";

const READ_TIMEOUT: Duration = Duration::from_millis(100);

#[derive(Debug)]
pub struct ThermalSensor {
    path: PathBuf,
    last: Mutex<Option<f64>>,
}

impl ThermalSensor {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            last: Mutex::new(None),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Last good reading in degrees Celsius.
    pub fn last(&self) -> Option<f64> {
        *self.last.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Read the sensor, returning the new value or the last good one.
    pub async fn refresh(&self) -> Option<f64> {
        let read = tokio::time::timeout(READ_TIMEOUT, tokio::fs::read_to_string(&self.path)).await;

        let reading = match read {
            Ok(Ok(text)) => parse_temperature(&text),
            Ok(Err(e)) => {
                trace!(path = %self.path.display(), error = %e, "Temperature read failed");
                None
            }
            Err(_) => {
                trace!(path = %self.path.display(), "Temperature read timed out");
                None
            }
        };

        let mut last = self.last.lock().unwrap_or_else(PoisonError::into_inner);
        if reading.is_some() {
            *last = reading;
        }
        *last
    }
}

/// First whitespace-separated token as a float.
fn parse_temperature(text: &str) -> Option<f64> {
    text.split_whitespace()
        .next()?
        .parse::<f64>()
        .ok()
        .filter(|t| t.is_finite())
}
