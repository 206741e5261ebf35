//! Logical channels over pooled connections.
//!
//! A `Channel` owns one checked-out connection for as long as the caller
//! holds it. Requests are correlated with their replies by request id, so
//! several requests may be in flight on one channel; replies that arrive for
//! a different outstanding request are held until that request is received.
use bson::Document;
use log::debug;

use crate::apm::Listener;
use crate::cancel::CancellationToken;
use crate::connection::{Connection, ConnectionFactory, ConnectionId};
use crate::error::Error::{ArgumentError, ResponseError};
use crate::error::Result;
use crate::pool::{ConnectionPool, ConnectionPoolSettings, PooledConnection};
use crate::topology::server::ServerId;
use crate::wire_protocol::{Message, OpQueryFlags, RequestIds};

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Hands out channels bound to a single server.
pub trait ChannelProvider: Send + Sync {
    fn server_id(&self) -> &ServerId;

    fn get_channel(&self, timeout: Option<Duration>, cancel: &CancellationToken) -> Result<Channel>;
}

/// A handle bound to one server through which wire messages travel.
pub struct Channel {
    connection: PooledConnection,
    request_ids: RequestIds,
    outstanding: HashSet<i32>,
    buffered: HashMap<i32, Message>,
}

impl Channel {
    pub fn new(connection: PooledConnection, request_ids: RequestIds) -> Channel {
        Channel {
            connection: connection,
            request_ids: request_ids,
            outstanding: HashSet::new(),
            buffered: HashMap::new(),
        }
    }

    pub fn connection_id(&self) -> &ConnectionId {
        self.connection.id()
    }

    pub fn server_id(&self) -> &ServerId {
        &self.connection.id().server_id
    }

    /// Allocates an id for a message to be sent on this channel.
    pub fn next_request_id(&self) -> i32 {
        self.request_ids.next()
    }

    pub fn is_healthy(&self) -> bool {
        self.connection.is_healthy() && self.connection.is_open()
    }

    /// The underlying connection will be closed instead of pooled.
    pub fn mark_unhealthy(&mut self) {
        self.connection.mark_unhealthy();
    }

    pub fn send(&mut self, message: &Message) -> Result<()> {
        let request_id = message.request_id();
        if message.expects_reply() && self.outstanding.contains(&request_id) {
            return Err(ArgumentError(format!(
                "Request {} is already outstanding on this channel.",
                request_id
            )));
        }

        self.connection.send_message(message)?;
        if message.expects_reply() {
            self.outstanding.insert(request_id);
        }
        Ok(())
    }

    /// Waits for the reply to `request_id`. Fails with a timeout once
    /// `timeout` elapses; the connection is then never reused.
    pub fn receive(
        &mut self,
        request_id: i32,
        timeout: Option<Duration>,
        cancel: &CancellationToken,
    ) -> Result<Message> {
        if let Some(reply) = self.buffered.remove(&request_id) {
            self.outstanding.remove(&request_id);
            return Ok(reply);
        }

        if !self.outstanding.contains(&request_id) {
            return Err(ArgumentError(format!(
                "No request {} is awaiting a reply on this channel.",
                request_id
            )));
        }

        let deadline = timeout.and_then(|t| Instant::now().checked_add(t));
        loop {
            let remaining = deadline.map(|deadline| deadline.saturating_duration_since(Instant::now()));
            let reply = self.connection.receive_message(remaining, cancel)?;
            let response_to = reply.response_to();

            if response_to == request_id {
                self.outstanding.remove(&request_id);
                return Ok(reply);
            }

            if self.outstanding.contains(&response_to) {
                self.buffered.insert(response_to, reply);
                continue;
            }

            self.connection.mark_unhealthy();
            return Err(ResponseError(format!(
                "Received a reply to request {}, which is not outstanding on connection {}.",
                response_to,
                self.connection.id()
            )));
        }
    }

    /// Runs a command against `db.$cmd` and returns the reply document.
    pub fn run_command(
        &mut self,
        db: &str,
        command: Document,
        timeout: Option<Duration>,
        cancel: &CancellationToken,
    ) -> Result<Document> {
        let request_id = self.next_request_id();
        let message = Message::new_command(request_id, db, command, OpQueryFlags::SLAVE_OK)?;
        self.send(&message)?;
        self.receive(request_id, timeout, cancel)?.into_command_reply()
    }
}

impl Drop for Channel {
    fn drop(&mut self) {
        // A reply still on the wire would be read by the next holder.
        if !self.outstanding.is_empty() && !self.outstanding.iter().all(|id| self.buffered.contains_key(id)) {
            debug!(
                "releasing connection {} with {} unanswered requests",
                self.connection.id(),
                self.outstanding.len()
            );
            self.connection.mark_unhealthy();
        }
    }
}

/// A channel provider over a single dedicated connection, for callers that
/// talk to one server directly without a cluster.
pub struct ConnectionChannelProvider {
    pool: ConnectionPool,
    request_ids: RequestIds,
}

impl ConnectionChannelProvider {
    pub fn new(
        server_id: ServerId,
        factory: Arc<dyn ConnectionFactory>,
        listener: Arc<Listener>,
    ) -> Result<ConnectionChannelProvider> {
        let settings = ConnectionPoolSettings {
            min_size: 0,
            max_size: 1,
            ..ConnectionPoolSettings::default()
        };

        let request_ids = factory.request_ids();
        let pool = ConnectionPool::new(server_id, settings, factory, listener)?;
        pool.initialize()?;

        Ok(ConnectionChannelProvider {
            pool: pool,
            request_ids: request_ids,
        })
    }

    pub fn dispose(&self) {
        self.pool.dispose();
    }
}

impl ChannelProvider for ConnectionChannelProvider {
    fn server_id(&self) -> &ServerId {
        self.pool.server_id()
    }

    fn get_channel(&self, timeout: Option<Duration>, cancel: &CancellationToken) -> Result<Channel> {
        let connection = self.pool.get_connection(timeout, cancel)?;
        Ok(Channel::new(connection, self.request_ids.clone()))
    }
}

impl Drop for ConnectionChannelProvider {
    fn drop(&mut self) {
        self.pool.dispose();
    }
}
