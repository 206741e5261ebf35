//! Cluster-aware connection core for a MongoDB driver.
//!
//! This crate manages the connections between a driver and a MongoDB
//! deployment: a standalone server, a replica set or a sharded cluster. It
//! keeps a bounded pool of connections per server, monitors every server to
//! learn its role, maintains the resulting topology and selects a server for
//! each operation according to a read preference.
//!
//! ## Connecting
//!
//! ```no_run
//! use mongodb_core::topology::Cluster;
//! use mongodb_core::topology::selector::WritableServerSelector;
//! use mongodb_core::session::{ClusterSession, OperationKind, Session};
//! use mongodb_core::channel::ChannelProvider;
//! use mongodb_core::CancellationToken;
//! use bson::{bson, doc};
//!
//! let cluster = Cluster::from_uri("mongodb://localhost:27017,localhost:27018/?replicaSet=rs0")
//!     .expect("Failed to configure cluster");
//! cluster.initialize().expect("Failed to start monitoring");
//!
//! let session = ClusterSession::new(cluster.clone());
//! let cancel = CancellationToken::none();
//! let provider = session
//!     .create_server_channel_provider(&WritableServerSelector::new(), OperationKind::Write, None, &cancel)
//!     .expect("No writable server");
//!
//! let mut channel = provider.get_channel(None, &cancel).expect("Failed to check out a connection");
//! let reply = channel.run_command("admin", doc! { "ping": 1 }, None, &cancel).expect("Ping failed");
//! println!("{}", reply);
//! ```
//!
//! ## Observing
//!
//! Connection, pool, server and cluster events can be observed by adding hooks
//! to the cluster's `Listener`. Every event is also logged through the `log`
//! facade at debug level.
pub mod apm;
pub mod cancel;
pub mod channel;
pub mod common;
pub mod connection;
pub mod connstring;
pub mod error;
pub mod pool;
pub mod session;
pub mod stream;
pub mod topology;
pub mod wire_protocol;

pub use crate::cancel::CancellationToken;
pub use crate::error::{Error, Result};

/// Reported to servers in the connection handshake.
pub const DRIVER_NAME: &str = "mongodb-core";
