//! Mining work distribution core.
//!
//! Fetches work from getwork-style HTTP servers or persistent socket
//! servers, slices it into nonce ranges for compute kernels and sends
//! winning results back, failing over between backends as needed.

pub mod backend;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod hashing;
pub mod kernel;
pub mod stats;
pub mod work;

pub use config::Config;
pub use coordinator::Coordinator;
pub use error::{MinerError, Result};
