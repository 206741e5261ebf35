//! Error types for pool, topology and wire-level failures.
use bson::{self, oid, Document};
use thiserror::Error;

use crate::common::WriteConcernError;
use crate::connstring::Host;

use std::{fmt, io, sync};
use std::time::Duration;

/// A type for results generated by driver-core operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Why server selection gave up.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SelectionFailure {
    /// No server in the cluster was reachable.
    NoServers,
    /// Servers were reachable, but none satisfied the selector.
    NoMatchingServers,
}

impl fmt::Display for SelectionFailure {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        match *self {
            SelectionFailure::NoServers => fmt.write_str("no server in the cluster is reachable"),
            SelectionFailure::NoMatchingServers => {
                fmt.write_str("no known server matches the selector")
            }
        }
    }
}

/// The error type for driver-core operations.
#[derive(Debug, Error)]
pub enum Error {
    /// A caller supplied an invalid argument or setting.
    #[error("{0}")]
    ArgumentError(String),
    /// An operation could not be performed in the current state.
    #[error("{0}")]
    OperationError(String),
    /// The server sent a malformed or unexpected response.
    #[error("{0}")]
    ResponseError(String),
    /// The transport failed.
    #[error(transparent)]
    IoError(#[from] io::Error),
    #[error(transparent)]
    EncoderError(#[from] bson::EncoderError),
    #[error(transparent)]
    DecoderError(#[from] bson::DecoderError),
    #[error(transparent)]
    OIDError(#[from] oid::Error),
    /// A shared lock was poisoned by a panicking thread.
    #[error("a lock was poisoned by a panicking thread")]
    PoisonLockError,
    /// The pool was at capacity and its wait queue was already full.
    #[error("the connection pool wait queue for {0} is full")]
    PoolExhausted(Host),
    /// A wait (for a connection or a reply) did not complete in time.
    #[error("timed out after {elapsed:?} while {operation}")]
    Timeout {
        operation: &'static str,
        elapsed: Duration,
    },
    /// The connection pool was disposed.
    #[error("the connection pool for {0} has been disposed")]
    PoolDisposed(Host),
    /// The server was removed from the cluster or disposed.
    #[error("server {0} has been removed from the cluster")]
    ServerRemoved(Host),
    /// The cluster was disposed.
    #[error("the cluster has been disposed")]
    ClusterDisposed,
    /// No server satisfied the selector within the selection timeout.
    #[error("server selection timed out after {timeout:?}: {failure}")]
    ServerSelectionTimeout {
        timeout: Duration,
        failure: SelectionFailure,
    },
    /// A pinned session was asked to run on a server it cannot switch to.
    #[error("the session is bound to {pinned}, which does not satisfy the requested selector")]
    BindingMismatch { pinned: Host },
    /// The caller's cancellation token fired.
    #[error("the operation was cancelled")]
    Cancelled,
    /// The server set the QueryFailure flag on a reply.
    #[error("query failure: {0}")]
    QueryFailure(Document),
    /// The server reported a failed write acknowledgment.
    #[error(transparent)]
    WriteConcernError(WriteConcernError),
}

impl<T> From<sync::PoisonError<T>> for Error {
    fn from(_: sync::PoisonError<T>) -> Error {
        Error::PoisonLockError
    }
}

impl From<WriteConcernError> for Error {
    fn from(err: WriteConcernError) -> Error {
        Error::WriteConcernError(err)
    }
}

impl Error {
    /// Returns true if the error came from the transport or the framing above
    /// it. A connection that produced such an error must not be reused.
    pub fn is_network_error(&self) -> bool {
        match *self {
            Error::IoError(_) | Error::ResponseError(_) | Error::DecoderError(_) => true,
            Error::Timeout { .. } => true,
            _ => false,
        }
    }

    /// Returns true for any of the timeout kinds.
    pub fn is_timeout(&self) -> bool {
        match *self {
            Error::Timeout { .. } | Error::ServerSelectionTimeout { .. } => true,
            Error::IoError(ref err) => {
                err.kind() == io::ErrorKind::TimedOut || err.kind() == io::ErrorKind::WouldBlock
            }
            _ => false,
        }
    }

    pub(crate) fn timeout(operation: &'static str, elapsed: Duration) -> Error {
        Error::Timeout {
            operation: operation,
            elapsed: elapsed,
        }
    }
}
