use bson::oid;
use chrono::{DateTime, Utc};
use log::debug;

use crate::apm::{ClusterEvent, Listener};
use crate::cancel::CancellationToken;
use crate::channel::{Channel, ChannelProvider};
use crate::common::TagSet;
use crate::connection::ConnectionFactory;
use crate::connstring::Host;
use crate::error::{Error, Result};
use crate::pool::{ConnectionPool, ConnectionPoolSettings};
use crate::wire_protocol::operations::MAX_MESSAGE_SIZE;
use crate::wire_protocol::RequestIds;

use std::{fmt, io};
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use super::monitor::{IsMasterResult, Monitor, MonitorSettings};
use super::ClusterId;

pub const DEFAULT_MAX_DOCUMENT_SIZE: i64 = 16 * 1024 * 1024;

/// Called with every description a server publishes.
pub type DescriptionChangedHandler = Arc<dyn Fn(Arc<ServerDescription>) + Send + Sync>;

/// Identifies a server within one cluster.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ServerId {
    pub cluster_id: ClusterId,
    pub endpoint: Host,
}

impl ServerId {
    pub fn new(cluster_id: ClusterId, endpoint: Host) -> ServerId {
        ServerId {
            cluster_id: cluster_id,
            endpoint: endpoint,
        }
    }
}

impl fmt::Display for ServerId {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        write!(fmt, "{}/{}", self.cluster_id, self.endpoint)
    }
}

/// Describes the server role within a server set.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ServerType {
    /// Server type is currently unknown.
    Unknown,
    /// Standalone server.
    Standalone,
    /// Shard router.
    ShardRouter,
    /// Replica set primary.
    ReplicaSetPrimary,
    /// Replica set secondary.
    ReplicaSetSecondary,
    /// Replica set arbiter.
    ReplicaSetArbiter,
    /// Replica set member of some other type.
    ReplicaSetOther,
    /// Replica set ghost member.
    ReplicaSetGhost,
}

impl FromStr for ServerType {
    type Err = Error;
    fn from_str(s: &str) -> Result<Self> {
        Ok(match s {
            "Standalone" => ServerType::Standalone,
            "Mongos" | "ShardRouter" => ServerType::ShardRouter,
            "RSPrimary" | "ReplicaSetPrimary" => ServerType::ReplicaSetPrimary,
            "RSSecondary" | "ReplicaSetSecondary" => ServerType::ReplicaSetSecondary,
            "RSArbiter" | "ReplicaSetArbiter" => ServerType::ReplicaSetArbiter,
            "RSOther" | "ReplicaSetOther" => ServerType::ReplicaSetOther,
            "RSGhost" | "ReplicaSetGhost" => ServerType::ReplicaSetGhost,
            _ => ServerType::Unknown,
        })
    }
}

impl ServerType {
    /// Whether writes may be routed to a server of this type.
    pub fn is_writable(self) -> bool {
        match self {
            ServerType::Standalone | ServerType::ShardRouter | ServerType::ReplicaSetPrimary => true,
            _ => false,
        }
    }

    pub fn is_replica_set_member(self) -> bool {
        match self {
            ServerType::ReplicaSetPrimary
            | ServerType::ReplicaSetSecondary
            | ServerType::ReplicaSetArbiter
            | ServerType::ReplicaSetOther
            | ServerType::ReplicaSetGhost => true,
            _ => false,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ServerStatus {
    Disconnected,
    Connecting,
    Connected,
}

/// What a replica set member reports about itself and its set.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ReplicaSetInfo {
    pub set_name: String,
    /// The member's opinion of who the primary is.
    pub primary: Option<Host>,
    pub me: Option<Host>,
    pub hosts: Vec<Host>,
    pub passives: Vec<Host>,
    pub arbiters: Vec<Host>,
    pub tags: TagSet,
    /// Set only by a member that believes it is primary.
    pub election_id: Option<oid::ObjectId>,
    pub set_version: Option<i64>,
}

impl ReplicaSetInfo {
    /// Every host the member lists, of any kind.
    pub fn members<'a>(&'a self) -> impl Iterator<Item = &'a Host> + 'a {
        self.hosts.iter().chain(self.passives.iter()).chain(self.arbiters.iter())
    }

    pub fn lists(&self, host: &Host) -> bool {
        self.members().any(|member| member == host)
    }
}

/// An immutable snapshot of what is known about one server.
#[derive(Clone, Debug)]
pub struct ServerDescription {
    pub server_id: ServerId,
    pub server_type: ServerType,
    pub status: ServerStatus,
    /// The moving average of heartbeat round trips.
    pub round_trip_time: Option<Duration>,
    pub max_document_size: i64,
    pub max_message_size: i64,
    pub min_wire_version: i64,
    pub max_wire_version: i64,
    pub replica_set: Option<ReplicaSetInfo>,
    /// The error that left the server in its current state, if any.
    pub error: Option<Arc<Error>>,
    pub last_update_time: DateTime<Utc>,
}

impl ServerDescription {
    /// A description of a server of the given type. Any known type is
    /// Connected; Unknown is Disconnected.
    pub fn new(server_id: ServerId, server_type: ServerType) -> ServerDescription {
        let status = if server_type == ServerType::Unknown {
            ServerStatus::Disconnected
        } else {
            ServerStatus::Connected
        };

        ServerDescription {
            server_id: server_id,
            server_type: server_type,
            status: status,
            round_trip_time: None,
            max_document_size: DEFAULT_MAX_DOCUMENT_SIZE,
            max_message_size: MAX_MESSAGE_SIZE as i64,
            min_wire_version: 0,
            max_wire_version: 0,
            replica_set: None,
            error: None,
            last_update_time: Utc::now(),
        }
    }

    /// Returns a default, unknown server description.
    pub fn unknown(server_id: ServerId) -> ServerDescription {
        ServerDescription::new(server_id, ServerType::Unknown)
    }

    /// The description of a server whose last check failed.
    pub fn with_error(server_id: ServerId, err: Error) -> ServerDescription {
        let mut description = ServerDescription::unknown(server_id);
        description.error = Some(Arc::new(err));
        description
    }

    /// Builds a description from a parsed isMaster reply.
    pub fn from_is_master(
        server_id: ServerId,
        is_master: &IsMasterResult,
        round_trip_time: Option<Duration>,
    ) -> ServerDescription {
        let server_type = is_master.server_type();
        let mut description = ServerDescription::new(server_id, server_type);

        if server_type == ServerType::Unknown {
            description.error = Some(Arc::new(Error::OperationError(String::from(
                "isMaster returned a not-ok response.",
            ))));
            return description;
        }

        description.round_trip_time = round_trip_time;
        description.max_document_size = is_master.max_bson_object_size;
        description.max_message_size = is_master.max_message_size_bytes;
        description.min_wire_version = is_master.min_wire_version;
        description.max_wire_version = is_master.max_wire_version;

        if server_type.is_replica_set_member() {
            description.replica_set = Some(ReplicaSetInfo {
                set_name: is_master.set_name.clone(),
                primary: is_master.primary.clone(),
                me: is_master.me.clone(),
                hosts: is_master.hosts.clone(),
                passives: is_master.passives.clone(),
                arbiters: is_master.arbiters.clone(),
                tags: is_master.tags.clone(),
                election_id: is_master.election_id.clone(),
                set_version: is_master.set_version,
            });
        }

        description
    }

    /// The same server in the Connecting state, with nothing yet known.
    pub fn connecting(&self) -> ServerDescription {
        let mut description = ServerDescription::unknown(self.server_id.clone());
        description.status = ServerStatus::Connecting;
        description
    }

    /// The same server reverted to Unknown, keeping only its identity.
    pub fn invalidated(&self) -> ServerDescription {
        ServerDescription::unknown(self.server_id.clone())
    }

    pub fn with_round_trip_time(mut self, round_trip_time: Option<Duration>) -> ServerDescription {
        self.round_trip_time = round_trip_time;
        self
    }

    pub fn with_replica_set(mut self, replica_set: ReplicaSetInfo) -> ServerDescription {
        self.replica_set = Some(replica_set);
        self
    }

    pub fn with_tags(mut self, tags: TagSet) -> ServerDescription {
        self.replica_set.get_or_insert_with(ReplicaSetInfo::default).tags = tags;
        self
    }

    pub fn endpoint(&self) -> &Host {
        &self.server_id.endpoint
    }

    pub fn is_connected(&self) -> bool {
        self.status == ServerStatus::Connected
    }

    pub fn set_name(&self) -> Option<&str> {
        self.replica_set.as_ref().map(|info| &info.set_name[..])
    }

    /// Member tags; servers outside a replica set have none.
    pub fn tags(&self) -> Option<&TagSet> {
        self.replica_set.as_ref().map(|info| &info.tags)
    }

    pub fn election_id(&self) -> Option<&oid::ObjectId> {
        self.replica_set.as_ref().and_then(|info| info.election_id.as_ref())
    }
}

/// Holds the pool and monitor for a single server.
pub struct Server {
    server_id: ServerId,
    pool: ConnectionPool,
    request_ids: RequestIds,
    description: Arc<RwLock<Arc<ServerDescription>>>,
    monitor: Monitor,
    listener: Arc<Listener>,
    disposed: AtomicBool,
}

impl fmt::Debug for Server {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Server")
            .field("server_id", &self.server_id)
            .field("pool", &self.pool)
            .finish()
    }
}

impl Server {
    /// Returns a new server with the given endpoint. Nothing connects until
    /// `initialize` is called.
    pub fn new(
        server_id: ServerId,
        pool_settings: ConnectionPoolSettings,
        monitor_settings: MonitorSettings,
        factory: Arc<dyn ConnectionFactory>,
        listener: Arc<Listener>,
        on_change: DescriptionChangedHandler,
    ) -> Result<Server> {
        let request_ids = factory.request_ids();
        let pool = ConnectionPool::new(server_id.clone(), pool_settings, factory.clone(), listener.clone())?;
        let description = Arc::new(RwLock::new(Arc::new(ServerDescription::unknown(server_id.clone()))));
        let monitor = Monitor::new(
            server_id.clone(),
            monitor_settings,
            factory,
            pool.clone(),
            description.clone(),
            listener.clone(),
            on_change,
        );

        Ok(Server {
            server_id: server_id,
            pool: pool,
            request_ids: request_ids,
            description: description,
            monitor: monitor,
            listener: listener,
            disposed: AtomicBool::new(false),
        })
    }

    pub fn server_id(&self) -> &ServerId {
        &self.server_id
    }

    pub fn endpoint(&self) -> &Host {
        &self.server_id.endpoint
    }

    pub fn pool(&self) -> &ConnectionPool {
        &self.pool
    }

    /// Opens the pool and starts monitoring.
    pub fn initialize(&self) -> Result<()> {
        if self.is_disposed() {
            return Err(Error::ServerRemoved(self.server_id.endpoint.clone()));
        }

        self.pool.initialize()?;
        if self.monitor.start()? {
            self.listener.emit(&ClusterEvent::ServerOpened {
                server_id: self.server_id.clone(),
            });
        }
        Ok(())
    }

    /// The server's latest description.
    pub fn description(&self) -> Arc<ServerDescription> {
        match self.description.read() {
            Ok(description) => description.clone(),
            Err(_) => Arc::new(ServerDescription::unknown(self.server_id.clone())),
        }
    }

    /// Asks the monitor to check the server now.
    pub fn request_check(&self) {
        self.monitor.request_check();
    }

    /// Marks the server Unknown after an application-side failure, clears
    /// its pool and asks the monitor for a fresh check.
    pub fn invalidate(&self, err: Error) {
        if self.is_disposed() {
            return;
        }

        debug!("invalidating server {}: {}", self.server_id, err);
        self.pool.clear();
        self.monitor.publish(ServerDescription::with_error(self.server_id.clone(), err));
        self.monitor.request_check();
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::SeqCst)
    }

    /// Stops the monitor and closes the pool. Channels still held keep their
    /// connection until dropped; new requests fail with `ServerRemoved`.
    pub fn dispose(&self) {
        if self.disposed.swap(true, Ordering::SeqCst) {
            return;
        }

        self.monitor.stop();
        self.pool.dispose();
        self.listener.emit(&ClusterEvent::ServerClosed {
            server_id: self.server_id.clone(),
        });
    }
}

impl ChannelProvider for Server {
    fn server_id(&self) -> &ServerId {
        &self.server_id
    }

    fn get_channel(&self, timeout: Option<Duration>, cancel: &CancellationToken) -> Result<Channel> {
        if self.is_disposed() {
            return Err(Error::ServerRemoved(self.server_id.endpoint.clone()));
        }

        match self.pool.get_connection(timeout, cancel) {
            Ok(connection) => Ok(Channel::new(connection, self.request_ids.clone())),
            Err(Error::PoolDisposed(_)) => Err(Error::ServerRemoved(self.server_id.endpoint.clone())),
            Err(Error::IoError(err)) => {
                // The server could not be reached at all.
                self.invalidate(Error::IoError(io::Error::new(err.kind(), err.to_string())));
                Err(Error::IoError(err))
            }
            Err(err) => Err(err),
        }
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        self.monitor.stop();
    }
}
