//! Error types for the work distribution core

use thiserror::Error;

#[derive(Debug, Error)]
pub enum MinerError {
    #[error("invalid header: expected {expected} bytes, got {actual}")]
    InvalidHeader { expected: usize, actual: usize },

    #[error("invalid target: expected 32 bytes, got {0}")]
    InvalidTarget(usize),

    #[error("invalid candidate space: {0} nonces")]
    InvalidNonceCount(u64),

    #[error("invalid backend url '{url}': {reason}")]
    InvalidUrl { url: String, reason: String },

    #[error("unsupported backend scheme: {0}")]
    UnsupportedScheme(String),

    #[error("missing credentials for backend {0}")]
    MissingCredentials(String),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("unknown kernel: {0}")]
    UnknownKernel(String),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("not connected")]
    NotConnected,

    #[error(transparent)]
    Http(#[from] reqwest::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Hex(#[from] hex::FromHexError),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Toml(#[from] toml::de::Error),
}

pub type Result<T, E = MinerError> = std::result::Result<T, E>;
