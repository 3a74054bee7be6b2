//! Error types for the convergence core and its adapters.

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

/// Errors from the desired-state store.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("failed to access state file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("state file {path} is corrupt: {source}")]
    Corrupt {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("failed to encode state: {0}")]
    Encode(#[source] serde_json::Error),
}

/// Errors from the container runtime adapter.
#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error("container runtime unavailable: {0}")]
    Unavailable(String),
}

/// Errors from the tunnel service adapter. All of them are transient from
/// the manager's point of view.
#[derive(Debug, Error)]
pub enum TunnelError {
    #[error("tunnel quota exceeded: {0}")]
    QuotaExceeded(String),

    #[error("invalid tunnel target: {0}")]
    InvalidTarget(String),

    #[error("tunnel service unavailable: {0}")]
    ServiceUnavailable(String),
}

/// Errors returned by a convergence pass or by shutdown.
#[derive(Debug, Error)]
pub enum ConvergeError {
    #[error("failed to read intents: {0}")]
    Store(#[from] StoreError),

    #[error(transparent)]
    Runtime(#[from] RuntimeError),

    #[error("failed to list forwarders: {0}")]
    Tunnel(#[from] TunnelError),

    #[error("{what} did not finish within {timeout:?}")]
    Timeout { what: &'static str, timeout: Duration },

    #[error("all {failed} actions failed, last error: {last}")]
    AllFailed { failed: usize, last: String },

    #[error("{failed} forwarders could not be closed during shutdown")]
    Shutdown { failed: usize },
}

/// Errors from a direct tunnel removal.
#[derive(Debug, Error)]
pub enum RemoveError {
    #[error("no tunnel for container {0}")]
    NotFound(String),

    #[error("failed to close forwarder {forwarder_id}: {source}")]
    Close {
        forwarder_id: String,
        #[source]
        source: TunnelError,
    },

    #[error("closing forwarder {0} timed out")]
    Timeout(String),

    #[error(transparent)]
    Store(#[from] StoreError),
}
