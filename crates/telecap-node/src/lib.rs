#![forbid(unsafe_code)]
#![cfg_attr(not(test), deny(clippy::expect_used, clippy::unwrap_used))]

pub mod adapter;
pub mod arm;
pub mod camera;
pub mod hub;
pub mod runtime;
pub mod teleop;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum NodeError {
    /// A device could not be opened; surfaced to the supervisor, which fails
    /// startup.
    #[error("node startup failure: {0}")]
    Startup(String),
    /// Three consecutive read/write errors within one second, degraded for
    /// longer than the grace window.
    #[error("node communication failure after {consecutive} consecutive errors: {last}")]
    Communication { consecutive: u32, last: String },
    #[error("device error: {0}")]
    Device(String),
    #[error("wire error: {0}")]
    Wire(#[from] telecap_wire::WireError),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}
