//! Error types

use crate::session::ClientId;
use std::time::Duration;
use thiserror::Error;


/// Outcome of a wait whose waiter was cancelled before it could be notified
///
/// This may occur when:
///
/// - The connection of the waiting client ended.
/// - The waiter was cancelled explicitly, for instance by aborting its future.
/// - The condition variable was dropped with the waiter still queued.
///
/// A timed wait that expires does not abort, it resolves to `false`.
#[derive(Error, Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[error("wait aborted before being notified")]
pub struct WaitAbortedError;

/// Error for a call rejected by a [`Server`](crate::Server) before reaching a condition variable
#[derive(Error, Debug)]
pub enum Error {
    /// A timed wait was requested with a negative timeout
    #[error("wait timeout must not be negative, got {0}ms")]
    NegativeTimeout(i64),
    /// A timed wait was requested with a timeout above the configured maximum
    #[error("wait timeout of {requested:?} exceeds maximum of {max:?}")]
    TimeoutTooLong {
        /// The requested timeout
        requested: Duration,
        /// The configured maximum
        max: Duration,
    },
    /// A condition variable name was longer than the configured maximum
    #[error("condition variable name is {len} bytes, maximum is {max}")]
    NameTooLong {
        /// Length of the name in bytes
        len: usize,
        /// The configured maximum
        max: usize,
    },
    /// A wait was requested through a session that has already disconnected
    #[error("{0} is disconnected")]
    SessionClosed(ClientId),
    /// No tokio runtime was available to drive timers
    #[error("no tokio runtime to drive timers")]
    NoRuntime(#[from] tokio::runtime::TryCurrentError),
}
