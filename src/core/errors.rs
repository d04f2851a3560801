// src/core/errors.rs

//! Defines the primary error type shared by the CRM and LRM control loops.

use std::num::ParseIntError;
use std::sync::Arc;
use thiserror::Error;

/// The main error enum for the coordination core. Using `thiserror` gives us
/// clean `Display` impls and automatic `From` conversions for the leaf error
/// types the loops actually encounter.
#[derive(Error, Debug, Clone)]
pub enum ClusterHaError {
    #[error("IO error: {0}")]
    Io(Arc<std::io::Error>),

    #[error("cluster KV error: {0}")]
    Kv(String),

    #[error("lock lost: {0}")]
    LockLost(String),

    #[error("quorum lost, refusing to act")]
    QuorumLost,

    #[error("invalid config: {0}")]
    InvalidConfig(String),

    #[error("unknown resource type '{0}'")]
    UnknownResourceType(String),

    #[error("malformed command: {0}")]
    MalformedCommand(String),

    #[error("fatal misconfiguration: {0}")]
    Fatal(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl From<std::io::Error> for ClusterHaError {
    fn from(e: std::io::Error) -> Self {
        ClusterHaError::Io(Arc::new(e))
    }
}

impl From<toml::de::Error> for ClusterHaError {
    fn from(e: toml::de::Error) -> Self {
        ClusterHaError::InvalidConfig(e.to_string())
    }
}

impl From<serde_json::Error> for ClusterHaError {
    fn from(e: serde_json::Error) -> Self {
        ClusterHaError::Kv(e.to_string())
    }
}

impl From<ParseIntError> for ClusterHaError {
    fn from(e: ParseIntError) -> Self {
        ClusterHaError::InvalidConfig(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, ClusterHaError>;
