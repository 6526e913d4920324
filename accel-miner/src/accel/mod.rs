//! Host-side view of a SHA-256 search accelerator.
//!
//! The accelerator is reached through a control surface with a small command
//! set ([`Request`]), an 8-byte completion message stream, and a readiness
//! signal. Two backends provide that surface: the in-process
//! [`Driver`](crate::driver::Driver) over a register file, and the Linux
//! character device in [`transport::chardev`](crate::transport).
//!
//! [`AcceleratorSession`] wraps an exclusive handle and enforces the
//! reset/ready/configure/start ordering.

pub mod protocol;
pub mod queue;
pub mod session;

pub use protocol::{
    CompletionMessage, Difficulty, RegisterLayout, Reply, Request, RequestCode, Status,
    DEBUG_REGISTER_COUNT,
};
pub use queue::CompletionQueue;
pub use session::{AcceleratorSession, Device, Port, SessionState};

/// Errors from the accelerator control surface.
#[derive(Debug, thiserror::Error)]
pub enum AccelError {
    /// Another session holds the device
    #[error("Device busy")]
    Busy,

    /// Command issued out of order (e.g., configuring before ready)
    #[error("Protocol violation: {0}")]
    ProtocolViolation(String),

    #[error("Request not supported: {0}")]
    Unsupported(String),

    /// Non-blocking read found no completion message
    #[error("No completion available")]
    WouldBlock,

    /// Blocking wait cancelled before a message arrived
    #[error("Wait interrupted")]
    Interrupted,

    #[error("Short read: {got} of {expected} bytes")]
    ShortRead { got: usize, expected: usize },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
