//! Server side of a condition variable whose waiters are remote clients.
//!
//! Clients connected over persistent sessions call `wait`, `wait_for`, `notify_one` and
//! `notify_all`. The server holds the authoritative FIFO queue of waiters and resolves every
//! outstanding wait exactly once, through whichever happens first of a notify, its timeout, or its
//! client's connection ending.
//!
//! - [`ConditionVariable`] is the waiter queue and resolution engine.
//! - [`session`] models client connections and the disconnect slots waits are enrolled with.
//! - [`timer`] is the timer service used to expire timed waits.
//! - [`Server`] holds condition variables by name and validates calls before they reach them.

#[macro_use]
extern crate tracing;

mod condvar;
mod server;
pub mod error;
pub mod session;
pub mod timer;

pub use crate::{
    condvar::api::*,
    server::*,
};

/// Future types
pub mod future {
    pub use crate::condvar::api::future::*;
}
