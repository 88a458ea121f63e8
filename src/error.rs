//! Process-level error types.
//!
//! Only errors that end the server surface here. Session-level failures
//! (capacity rejections, peer read/write errors, orderly closes) are
//! handled inside the runtimes and never reach `main`.

use crate::config::ConfigError;
use std::io;
use std::net::SocketAddr;
use thiserror::Error;

/// Fatal relay errors.
#[derive(Debug, Error)]
pub enum RelayError {
    /// Listener socket could not be created, bound, or put into listen mode.
    #[error("Failed to bind listener on {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },

    /// The readiness wait primitive reported an OS error.
    #[error("Readiness wait failed: {0}")]
    Wait(#[source] io::Error),

    #[error(transparent)]
    Config(#[from] ConfigError),

    /// Runtime setup failed (poll creation, listener registration, tokio runtime).
    #[error("Runtime error: {0}")]
    Runtime(#[from] io::Error),

    /// The hub actor stopped while connections still needed it.
    #[error("Hub actor has shut down")]
    HubClosed,
}

/// Result type for fatal relay operations.
pub type RelayResult<T> = Result<T, RelayError>;
