//! Exclusive accelerator sessions.
//!
//! A [`Device`] hands out at most one open [`Port`] at a time; a second open
//! fails with [`AccelError::Busy`] until the first port is dropped.
//! [`AcceleratorSession`] owns that port, serializes control requests, and
//! rejects configuration issued outside the reset/ready window.

use std::fmt;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use super::{AccelError, CompletionMessage, Difficulty, RegisterLayout, Reply, Request, Status};
use crate::tracing::prelude::*;

/// An open, exclusive handle on an accelerator.
///
/// Dropping the port releases the device.
#[async_trait]
pub trait Port: Send + Sync {
    /// Issue a control request.
    fn request(&self, request: Request) -> Result<Reply, AccelError>;

    /// Copy the oldest completion message into `buf` without waiting.
    ///
    /// Returns the number of bytes copied, at most eight; a message is
    /// consumed even if `buf` is too short to hold all of it. Fails with
    /// [`AccelError::WouldBlock`] when no message is queued.
    fn try_read(&self, buf: &mut [u8]) -> Result<usize, AccelError>;

    /// Like [`try_read`](Self::try_read) but waits for a message.
    ///
    /// Fails with [`AccelError::Interrupted`] if `cancel` fires first.
    async fn read(&self, buf: &mut [u8], cancel: &CancellationToken) -> Result<usize, AccelError>;

    /// Whether a read would succeed without waiting.
    fn poll_readable(&self) -> Result<bool, AccelError>;

    /// Wait until a read would succeed without waiting.
    async fn readable(&self) -> Result<(), AccelError>;
}

/// Something that can be opened to obtain a [`Port`].
pub trait Device: Send + Sync {
    fn name(&self) -> &str;

    fn layout(&self) -> RegisterLayout;

    /// Open the device exclusively.
    fn open(&self) -> Result<Box<dyn Port>, AccelError>;
}

/// Host-side view of where the accelerator is in its protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Opened; nothing known about the core
    Unknown,
    /// Reset issued, READY not yet observed
    Resetting,
    /// READY observed; parameters may be written
    Ready,
    /// START issued
    Running,
    /// RUNNING observed clear after a start
    Stopped,
}

/// An open session on one accelerator.
pub struct AcceleratorSession {
    device: String,
    layout: RegisterLayout,
    port: Box<dyn Port>,
    state: Mutex<SessionState>,
}

impl AcceleratorSession {
    /// Open `device`, failing with [`AccelError::Busy`] if it is held.
    pub fn open(device: &dyn Device) -> Result<Self, AccelError> {
        let port = device.open()?;
        debug!(device = device.name(), "Session opened");
        Ok(Self {
            device: device.name().to_string(),
            layout: device.layout(),
            port,
            state: Mutex::new(SessionState::Unknown),
        })
    }

    pub fn device_name(&self) -> &str {
        &self.device
    }

    pub fn layout(&self) -> RegisterLayout {
        self.layout
    }

    pub fn state(&self) -> SessionState {
        *self.lock()
    }

    fn lock(&self) -> MutexGuard<'_, SessionState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Stop any search and begin a reset. Valid in every state.
    pub fn reset(&self) -> Result<(), AccelError> {
        let mut state = self.lock();
        self.port.request(Request::Reset)?;
        *state = SessionState::Resetting;
        Ok(())
    }

    /// Read the status word, advancing the session state on READY after a
    /// reset and on RUNNING clearing after a start.
    pub fn status(&self) -> Result<Status, AccelError> {
        let mut state = self.lock();
        let status = self.read_status()?;

        match *state {
            SessionState::Resetting if status.is_ready() => *state = SessionState::Ready,
            SessionState::Running if !status.is_running() => *state = SessionState::Stopped,
            _ => {}
        }
        Ok(status)
    }

    fn read_status(&self) -> Result<Status, AccelError> {
        Ok(Status::from_bits_retain(
            self.port.request(Request::GetStatus)?.into_word()?,
        ))
    }

    fn configure(&self, request: Request) -> Result<(), AccelError> {
        let state = self.lock();
        if *state != SessionState::Ready {
            return Err(AccelError::ProtocolViolation(format!(
                "{} while {:?}",
                request.name(),
                *state
            )));
        }
        self.port.request(request)?;
        Ok(())
    }

    /// Load the 32-byte midstate.
    pub fn set_state_in(&self, midstate: &[u8; 32]) -> Result<(), AccelError> {
        self.configure(Request::SetStateIn(*midstate))
    }

    /// Load the 12 header bytes that precede the nonce.
    pub fn set_prefix(&self, prefix: &[u8; 12]) -> Result<(), AccelError> {
        self.configure(Request::SetPrefix(*prefix))
    }

    pub fn set_difficulty(&self, difficulty: Difficulty) -> Result<(), AccelError> {
        self.configure(difficulty.request())
    }

    /// Program the core clock in MHz. Rejected while a search runs.
    pub fn set_clock_speed(&self, mhz: u32) -> Result<(), AccelError> {
        let state = self.lock();
        if *state == SessionState::Running {
            return Err(AccelError::ProtocolViolation(
                "SetClockSpeed while Running".into(),
            ));
        }
        self.port.request(Request::SetClockSpeed(mhz))?;
        Ok(())
    }

    /// Begin the search over the loaded parameters.
    pub fn start(&self) -> Result<(), AccelError> {
        let mut state = self.lock();
        if *state != SessionState::Ready {
            return Err(AccelError::ProtocolViolation(format!(
                "Start while {:?}",
                *state
            )));
        }
        self.port.request(Request::Start)?;
        *state = SessionState::Running;
        Ok(())
    }

    /// Current value of the search counter.
    pub fn current_nonce(&self) -> Result<u32, AccelError> {
        let _state = self.lock();
        self.port.request(Request::GetNonceCurrent)?.into_word()
    }

    /// Advance a halted core by one nonce.
    pub fn step(&self) -> Result<(), AccelError> {
        let _state = self.lock();
        self.port.request(Request::Step)?;
        Ok(())
    }

    pub fn debug_registers(&self) -> Result<Vec<u32>, AccelError> {
        let _state = self.lock();
        self.port.request(Request::GetDebugRegisters)?.into_registers()
    }

    /// Take a completion message if one is queued.
    pub fn try_completion(&self) -> Result<Option<CompletionMessage>, AccelError> {
        let mut buf = [0u8; CompletionMessage::LEN];
        match self.port.try_read(&mut buf) {
            Ok(n) => CompletionMessage::decode(&buf[..n]).map(Some),
            Err(AccelError::WouldBlock) => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Wait up to `timeout` for a completion message.
    pub async fn wait_completion(
        &self,
        timeout: Duration,
    ) -> Result<Option<CompletionMessage>, AccelError> {
        match tokio::time::timeout(timeout, self.port.readable()).await {
            Err(_) => Ok(None),
            Ok(ready) => {
                ready?;
                self.try_completion()
            }
        }
    }

    /// Wait for the next completion message until `cancel` fires.
    pub async fn next_completion(
        &self,
        cancel: &CancellationToken,
    ) -> Result<CompletionMessage, AccelError> {
        let mut buf = [0u8; CompletionMessage::LEN];
        let n = self.port.read(&mut buf, cancel).await?;
        CompletionMessage::decode(&buf[..n])
    }

    /// One-line summary of the live device for status displays. Leaves the
    /// session state untouched.
    pub fn status_line(&self, temperature: Option<f64>) -> String {
        let temperature = DisplayTemperature(temperature);
        let status = {
            let _state = self.lock();
            self.read_status()
        };
        match (status, self.current_nonce()) {
            (Ok(status), Ok(nonce)) => format!(
                "temperature={} status={:08x} curnonce={:08x}",
                temperature,
                status.bits(),
                nonce
            ),
            _ => format!("temperature={} status=unavailable", temperature),
        }
    }
}

impl Drop for AcceleratorSession {
    fn drop(&mut self) {
        trace!(device = %self.device, "Session closed");
    }
}

impl fmt::Debug for AcceleratorSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AcceleratorSession")
            .field("device", &self.device)
            .field("layout", &self.layout)
            .field("state", &self.state())
            .finish()
    }
}

struct DisplayTemperature(Option<f64>);

impl fmt::Display for DisplayTemperature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.0 {
            Some(celsius) => write!(f, "{:.1}", celsius),
            None => f.write_str("n/a"),
        }
    }
}
