//! Physical connections to a single server.
//!
//! A `Connection` frames and unframes wire messages over one socket. The pool
//! and the monitors only ever see connections through this trait, so tests can
//! stand in an in-memory implementation.
pub mod binary;
pub mod factory;

pub use self::binary::BinaryConnection;
pub use self::factory::{Authenticator, BinaryConnectionFactory, ConnectionFactory, Credential};

use bson::Document;
use serde_derive::{Deserialize, Serialize};

use crate::cancel::CancellationToken;
use crate::error::Error::ResponseError;
use crate::error::Result;
use crate::stream::StreamConnector;
use crate::topology::server::ServerId;
use crate::wire_protocol::{Message, OpQueryFlags, RequestIds};

use std::fmt;
use std::time::Duration;

pub const DEFAULT_CONNECT_TIMEOUT_MS: u64 = 10_000;

/// Identity of one physical connection.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct ConnectionId {
    pub server_id: ServerId,
    /// Unique among the connections one factory has created.
    pub local_value: u64,
}

impl ConnectionId {
    pub fn new(server_id: ServerId, local_value: u64) -> ConnectionId {
        ConnectionId {
            server_id: server_id,
            local_value: local_value,
        }
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        write!(fmt, "{}#{}", self.server_id, self.local_value)
    }
}

/// Transport settings for new connections.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionSettings {
    pub connect_timeout: Duration,
    /// Bounds a single send or receive; `None` waits indefinitely.
    pub socket_timeout: Option<Duration>,
    pub connector: StreamConnector,
    /// Reported to the server in the connection handshake.
    pub app_name: Option<String>,
}

impl Default for ConnectionSettings {
    fn default() -> Self {
        ConnectionSettings {
            connect_timeout: Duration::from_millis(DEFAULT_CONNECT_TIMEOUT_MS),
            socket_timeout: None,
            connector: StreamConnector::default(),
            app_name: None,
        }
    }
}

/// One physical, framed connection to a server.
pub trait Connection: Send {
    fn id(&self) -> &ConnectionId;

    /// False once the connection has been closed or has failed.
    fn is_open(&self) -> bool;

    fn send_message(&mut self, message: &Message) -> Result<()>;

    /// Reads the next reply frame, whatever request it answers. Fails with a
    /// timeout once `timeout` elapses, or `Cancelled` when `cancel` fires; the
    /// connection is closed in both cases.
    fn receive_message(&mut self, timeout: Option<Duration>, cancel: &CancellationToken) -> Result<Message>;

    fn close(&mut self);
}

/// Runs a command on a bare connection and returns its reply document.
///
/// Used before a connection is pooled (handshake, authentication) and by
/// server monitors, which own their connection outright.
pub fn run_command(
    connection: &mut dyn Connection,
    request_ids: &RequestIds,
    db: &str,
    command: Document,
    timeout: Option<Duration>,
    cancel: &CancellationToken,
) -> Result<Document> {
    let request_id = request_ids.next();
    let message = Message::new_command(request_id, db, command, OpQueryFlags::SLAVE_OK)?;
    connection.send_message(&message)?;

    let reply = connection.receive_message(timeout, cancel)?;
    if reply.response_to() != request_id {
        // Nothing else is in flight on a bare connection, so the stream is
        // out of step with us.
        connection.close();
        return Err(ResponseError(format!(
            "Expected a reply to request {} but received one to {}.",
            request_id,
            reply.response_to()
        )));
    }

    reply.into_command_reply()
}
