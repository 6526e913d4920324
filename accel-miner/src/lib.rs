//! Host-side driver and scanner for FPGA SHA-256 nonce search accelerators.

pub mod accel;
pub mod config;
pub mod daemon;
pub mod driver;
pub mod error;
pub mod hasher;
pub mod mask;
pub mod scanner;
pub mod sim;
pub mod thermal;
pub mod thread;
pub mod tracing;
pub mod transport;
pub mod types;
pub mod u256;
pub mod work;
