//! Crate-level error type.
//!
//! Device-facing code reports [`AccelError`](crate::accel::AccelError).
//! Configuration, discovery and the self-test report this enum.

#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Bad or unparsable configuration value
    #[error("Configuration error: {0}")]
    Config(String),

    /// Device node missing, wrong kind, or otherwise unusable
    #[error("Device error: {0}")]
    Device(String),

    /// SHA-256 known-answer test mismatch
    #[error("Self-test failed: {0}")]
    SelfTest(String),
}

pub type Result<T> = std::result::Result<T, Error>;
