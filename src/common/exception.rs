use thiserror::Error;

use crate::common::config::VdevId;

/// Terminal outcome of a failed I/O request.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ZioError {
    #[error("device unavailable")]
    DeviceUnavailable,
    #[error("checksum mismatch")]
    ChecksumMismatch,
    #[error("I/O error")]
    Io,
    #[error("out of space")]
    NoSpace,
    #[error("authentication failed")]
    Authentication,
    #[error("not found")]
    NotFound,
    #[error("operation not supported")]
    NotSupported,
    #[error("pool I/O is suspended")]
    Suspended,
    #[error("I/O timed out")]
    TimedOut,
    #[error("corrupt data: {0}")]
    Corrupt(String),
}

impl ZioError {
    /// Position in the severity order. Whole-device failure ranks lowest
    /// because it may be transient; errors we never expect rank highest.
    fn rank(&self) -> u8 {
        match self {
            ZioError::DeviceUnavailable => 1,
            ZioError::ChecksumMismatch => 2,
            ZioError::Io => 3,
            _ => 4,
        }
    }

    /// Returns the worse of two optional errors; `None` is success.
    pub fn worst(a: Option<ZioError>, b: Option<ZioError>) -> Option<ZioError> {
        match (a, b) {
            (None, b) => b,
            (a, None) => a,
            (Some(a), Some(b)) => {
                if a.rank() > b.rank() {
                    Some(a)
                } else {
                    Some(b)
                }
            }
        }
    }
}

/// Errors raised by pool management rather than by an individual request.
#[derive(Error, Debug)]
pub enum PoolError {
    #[error("invalid pool configuration: {0}")]
    InvalidConfig(String),
    #[error("device {0} not found")]
    VdevNotFound(VdevId),
    #[error("request {0} not found")]
    RequestNotFound(String),
    #[error("pool is closed")]
    Closed,
    #[error("illegal pool state transition from {from} on {event}")]
    IllegalTransition { from: &'static str, event: &'static str },
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    #[error("I/O failed: {0}")]
    Io(#[from] ZioError),
    #[error("device I/O failed: {0}")]
    Device(#[from] std::io::Error),
}
