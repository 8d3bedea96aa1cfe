//! Error taxonomy shared by every data service implementation.

use serde::{Deserialize, Serialize};

/// A one-shot `list`/`get` call failed. Surfaced once to the caller; never retried here.
#[derive(Debug, Clone, thiserror::Error, Serialize, Deserialize, PartialEq, Eq)]
pub enum FetchError {
    #[error("not_found: {kind}/{name}")]
    NotFound { kind: String, name: String },
    #[error("forbidden: {0}")]
    Forbidden(String),
    #[error("transport: {0}")]
    Transport(String),
    #[error("decode: {0}")]
    Decode(String),
}

impl FetchError {
    pub fn not_found(kind: &str, name: &str) -> Self {
        Self::NotFound { kind: kind.to_string(), name: name.to_string() }
    }
}

/// A live subscription could not be opened or was interrupted by the transport.
#[derive(Debug, Clone, thiserror::Error, Serialize, Deserialize, PartialEq, Eq)]
pub enum WatchTransportError {
    #[error("establish: {0}")]
    Establish(String),
    #[error("interrupted: {0}")]
    Interrupted(String),
}

/// Invalid runtime configuration read from the environment.
#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("invalid {var}: {value:?} ({reason})")]
    Invalid { var: &'static str, value: String, reason: &'static str },
}
