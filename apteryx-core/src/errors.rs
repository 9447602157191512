//! Engine error hierarchy.
//!
//! Errors are layered by concern; the top-level [`Error`] nests the layer
//! enums transparently so callers can match either coarsely or precisely.
//! [`Error::status`] maps any error onto the errno-style wire status.

use std::time::Duration;

use apteryx_proto::ProtocolError;
use apteryx_proto::Status;
use apteryx_proto::UriError;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Configuration loading or validation failures
    #[error(transparent)]
    Config(#[from] ::config::ConfigError),

    /// Tree and operation-level failures
    #[error(transparent)]
    Store(#[from] StoreError),

    /// Callback dispatch failures
    #[error(transparent)]
    Dispatch(#[from] DispatchError),

    /// Transport-level failures
    #[error(transparent)]
    Rpc(#[from] RpcError),
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Path does not start with `/`, or contains an empty segment
    #[error("invalid path: {0}")]
    InvalidPath(String),

    /// A validator vetoed the mutation with the given status
    #[error("refused by validator (status {0})")]
    Refused(i32),

    /// Compare-and-swap guard did not match the current timestamp
    #[error("timestamp mismatch")]
    Busy,

    /// Value did not parse as the requested type
    #[error("value does not parse as requested type")]
    Range,
}

#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    /// Callback exceeded its per-call budget
    #[error("callback timed out after {0:?}")]
    Timeout(Duration),

    /// A watcher waited on its own completion
    #[error("reentrant wait on own watcher")]
    Reentrant,

    /// Callback owner is gone (no local handle, no reachable channel)
    #[error("no handler for callback {guid}")]
    NoHandler { guid: String },
}

#[derive(Debug, thiserror::Error)]
pub enum RpcError {
    /// No reply within the request budget
    #[error("request timed out")]
    Timeout,

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error(transparent)]
    Uri(#[from] UriError),

    /// Remote replied with a non-zero status
    #[error("remote returned status {0}")]
    Remote(i32),

    /// Connection was closed before the reply arrived
    #[error("connection closed")]
    Closed,
}

impl Error {
    /// The errno-style status this error maps to on the wire.
    pub fn status(&self) -> Status {
        match self {
            Error::Store(StoreError::InvalidPath(_)) => Status::Invalid,
            Error::Store(StoreError::Refused(code)) => Status::from_i32(*code),
            Error::Store(StoreError::Busy) => Status::Busy,
            Error::Store(StoreError::Range) => Status::Range,
            Error::Dispatch(DispatchError::Timeout(_)) => Status::Timeout,
            Error::Dispatch(DispatchError::Reentrant) => Status::Timeout,
            Error::Dispatch(DispatchError::NoHandler { .. }) => Status::Timeout,
            Error::Rpc(RpcError::Timeout) => Status::Timeout,
            Error::Rpc(RpcError::Remote(code)) => Status::from_i32(*code),
            Error::Rpc(_) => Status::Errno(-5), // EIO
            Error::Config(_) => Status::Errno(-22),
        }
    }
}
