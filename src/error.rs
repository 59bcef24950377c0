//! Error types
//!
//! Configuration and lifecycle failures surfaced synchronously to callers.
//! Ring buffer backpressure is not an error: pushes that drop units return
//! `false` and log instead.

use std::io;

use crate::output::TargetId;

/// Result alias used throughout the crate
pub type Result<T> = std::result::Result<T, Error>;

/// Error type for output operations
#[derive(Debug)]
pub enum Error {
    /// Socket or file operation failed
    Io(io::Error),
    /// Target string could not be parsed
    InvalidTarget(String),
    /// Host name did not resolve to an IPv4 address
    Resolve(String),
    /// Stream has no configured target
    NotConfigured,
    /// Stream is already streaming and cannot be reconfigured
    AlreadyStreaming,
    /// Operation needs a running tokio runtime
    NoRuntime,
    /// No target with this id
    TargetNotFound(TargetId),
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Error::Io(e) => write!(f, "I/O error: {}", e),
            Error::InvalidTarget(target) => write!(f, "Invalid target: {}", target),
            Error::Resolve(host) => write!(f, "Failed to resolve host: {}", host),
            Error::NotConfigured => write!(f, "Stream has no target configured"),
            Error::AlreadyStreaming => write!(f, "Stream is already streaming"),
            Error::NoRuntime => write!(f, "No tokio runtime available"),
            Error::TargetNotFound(id) => write!(f, "No such target id: {}", id),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        Error::Io(e)
    }
}
