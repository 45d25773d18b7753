//! Error types for wiremesh

use thiserror::Error;

/// Result type alias using the wiremesh Error
pub type Result<T> = std::result::Result<T, Error>;

/// Wiremesh error types
#[derive(Error, Debug)]
pub enum Error {
    /// A snapshot arrived with a serial below the last applied one.
    /// The update is rejected without touching any state.
    #[error("stale update: snapshot serial {received} is behind the last applied serial {current}")]
    StaleUpdate { current: u64, received: u64 },

    /// A snapshot is structurally invalid. The whole update is rejected
    /// atomically and the applied serial does not advance.
    #[error("malformed snapshot: {0}")]
    MalformedSnapshot(String),

    /// An update arrived after the reconciler was cancelled.
    #[error("shutdown in progress, update rejected")]
    ShutdownInProgress,

    #[error("dns error: {0}")]
    Dns(String),

    #[error("ssh error: {0}")]
    Ssh(String),

    #[error("connection error for peer {peer}: {reason}")]
    Connection { peer: String, reason: String },

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl Error {
    /// True for the error classes that are surfaced to the snapshot
    /// transport. Per-resource failures are logged inside the reconcilers
    /// and never reach this boundary.
    pub fn is_reportable(&self) -> bool {
        matches!(
            self,
            Error::StaleUpdate { .. } | Error::MalformedSnapshot(_) | Error::ShutdownInProgress
        )
    }
}
