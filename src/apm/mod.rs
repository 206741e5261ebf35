//! Cluster Monitoring
//!
//! The APM module lets callers observe what the driver core is doing: connections
//! opening, closing and moving in and out of pools, waiters queueing for a
//! connection, and server or cluster descriptions changing. Every event is also
//! logged at debug level. Hooks only observe; nothing they do changes how the
//! pool or the cluster behaves.
mod event;
mod listener;

pub use self::event::ClusterEvent;
pub use self::listener::{EventHook, Listener};
