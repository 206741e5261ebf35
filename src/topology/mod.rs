//! Cluster topology: discovery, the topology state machine and server
//! selection.
//!
//! Every server runs a monitor that publishes a fresh `ServerDescription`
//! after each check. The cluster folds each one into a new, immutable
//! `ClusterDescription`, adding and removing servers as replica set members
//! report on each other, and swaps it in whole. Selection reads the current
//! snapshot and, when nothing matches, waits for the next one.
pub mod monitor;
pub mod selector;
pub mod server;

use bson::oid;
use log::{debug, warn};
use rand::seq::SliceRandom;
use rand::thread_rng;
use serde_derive::{Deserialize, Serialize};

use crate::apm::{ClusterEvent, Listener};
use crate::cancel::CancellationToken;
use crate::common::{ReadMode, ReadPreference};
use crate::connection::{Authenticator, BinaryConnectionFactory, ConnectionFactory, ConnectionSettings, Credential};
use crate::connstring::{self, ConnectionString, Host};
use crate::error::Error::{self, ArgumentError, OperationError};
use crate::error::{Result, SelectionFailure};
use crate::pool::ConnectionPoolSettings;
use crate::stream::StreamConnector;

use std::cmp;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, RwLock};
use std::time::{Duration, Instant};

use self::monitor::MonitorSettings;
use self::selector::ServerSelector;
use self::server::{DescriptionChangedHandler, Server, ServerDescription, ServerId, ServerType};

pub const DEFAULT_SERVER_SELECTION_TIMEOUT_MS: u64 = 30_000;

static NEXT_CLUSTER_ID: AtomicU64 = AtomicU64::new(1);

/// Distinguishes clusters within one process.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ClusterId(pub u64);

impl ClusterId {
    pub fn new() -> ClusterId {
        ClusterId(NEXT_CLUSTER_ID.fetch_add(1, Ordering::SeqCst))
    }
}

impl Default for ClusterId {
    fn default() -> Self {
        ClusterId::new()
    }
}

impl fmt::Display for ClusterId {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        write!(fmt, "cluster-{}", self.0)
    }
}

/// Describes the type of topology for a server set.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ClusterType {
    Unknown,
    /// A direct connection to one server, whatever its role.
    Single,
    Standalone,
    ReplicaSet,
    Sharded,
}

impl FromStr for ClusterType {
    type Err = Error;
    fn from_str(s: &str) -> Result<Self> {
        Ok(match s {
            "Single" => ClusterType::Single,
            "Standalone" => ClusterType::Standalone,
            "ReplicaSet" | "ReplicaSetNoPrimary" | "ReplicaSetWithPrimary" => ClusterType::ReplicaSet,
            "Sharded" => ClusterType::Sharded,
            _ => ClusterType::Unknown,
        })
    }
}

/// How the seed list is interpreted.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ClusterConnectionMode {
    /// Direct when there is a single seed and no replica set name,
    /// discovering otherwise.
    Automatic,
    /// Talk to the one seed only; never add or remove servers.
    Direct,
    /// Discover the members of a replica set.
    ReplicaSet,
}

impl FromStr for ClusterConnectionMode {
    type Err = Error;
    fn from_str(s: &str) -> Result<Self> {
        Ok(match &s.to_ascii_lowercase()[..] {
            "automatic" => ClusterConnectionMode::Automatic,
            "direct" => ClusterConnectionMode::Direct,
            "replicaset" => ClusterConnectionMode::ReplicaSet,
            _ => {
                return Err(ArgumentError(format!(
                    "Could not convert '{}' to a connection mode.",
                    s
                )))
            }
        })
    }
}

/// Everything a cluster needs to know up front.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClusterSettings {
    pub seeds: Vec<Host>,
    pub connection_mode: ClusterConnectionMode,
    pub replica_set_name: Option<String>,
    pub server_selection_timeout: Duration,
    /// The read preference sessions use unless told otherwise.
    pub read_preference: ReadPreference,
    pub pool: ConnectionPoolSettings,
    pub monitor: MonitorSettings,
    pub connection: ConnectionSettings,
}

impl Default for ClusterSettings {
    fn default() -> Self {
        ClusterSettings {
            seeds: vec![Host::new("localhost", connstring::DEFAULT_PORT)],
            connection_mode: ClusterConnectionMode::Automatic,
            replica_set_name: None,
            server_selection_timeout: Duration::from_millis(DEFAULT_SERVER_SELECTION_TIMEOUT_MS),
            read_preference: ReadPreference::primary(),
            pool: ConnectionPoolSettings::default(),
            monitor: MonitorSettings::default(),
            connection: ConnectionSettings::default(),
        }
    }
}

fn parse_option<T: FromStr>(key: &str, value: &str) -> Result<T> {
    value
        .parse()
        .map_err(|_| ArgumentError(format!("Invalid value '{}' for option '{}'.", value, key)))
}

fn parse_millis(key: &str, value: &str) -> Result<Duration> {
    parse_option::<u64>(key, value).map(Duration::from_millis)
}

fn parse_bool(key: &str, value: &str) -> Result<bool> {
    match &value.to_ascii_lowercase()[..] {
        "true" => Ok(true),
        "false" => Ok(false),
        _ => Err(ArgumentError(format!("Invalid value '{}' for option '{}'.", value, key))),
    }
}

impl ClusterSettings {
    /// Builds settings from a parsed `mongodb://` connection string.
    pub fn from_connection_string(config: &ConnectionString) -> Result<ClusterSettings> {
        let mut settings = ClusterSettings::default();
        settings.seeds = config.hosts.clone();
        let options = &config.options;

        if let Some(name) = options.get("replicaSet") {
            settings.replica_set_name = Some(name.to_owned());
        }
        if let Some(value) = options.get("connect") {
            settings.connection_mode = value.parse()?;
        }

        if let Some(value) = options.get("minPoolSize") {
            settings.pool.min_size = parse_option("minPoolSize", value)?;
        }
        if let Some(value) = options.get("maxPoolSize") {
            settings.pool.max_size = parse_option("maxPoolSize", value)?;
        }
        if let Some(value) = options.get("waitQueueSize") {
            settings.pool.max_wait_queue_size = parse_option("waitQueueSize", value)?;
        }
        if let Some(value) = options.get("waitQueueMultiple") {
            let multiple: usize = parse_option("waitQueueMultiple", value)?;
            settings.pool.max_wait_queue_size = multiple.checked_mul(settings.pool.max_size).ok_or_else(|| {
                ArgumentError(format!("Invalid value '{}' for option 'waitQueueMultiple'.", value))
            })?;
        }
        if let Some(value) = options.get("maxIdleTimeMS") {
            settings.pool.connection_max_idle_time = Some(parse_millis("maxIdleTimeMS", value)?);
        }
        if let Some(value) = options.get("maxLifeTimeMS") {
            settings.pool.connection_max_life_time = Some(parse_millis("maxLifeTimeMS", value)?);
        }

        if let Some(value) = options.get("connectTimeoutMS") {
            settings.connection.connect_timeout = parse_millis("connectTimeoutMS", value)?;
        }
        if let Some(value) = options.get("socketTimeoutMS") {
            settings.connection.socket_timeout = Some(parse_millis("socketTimeoutMS", value)?);
        }
        if let Some(value) = options.get("appName") {
            settings.connection.app_name = Some(value.to_owned());
        }
        if let Some(value) = options.get("ssl") {
            if parse_bool("ssl", value)? {
                settings.connection.connector = ssl_connector(config)?;
            }
        }

        if let Some(value) = options.get("heartbeatFrequencyMS") {
            settings.monitor.heartbeat_frequency = parse_millis("heartbeatFrequencyMS", value)?;
        }
        if let Some(value) = options.get("serverSelectionTimeoutMS") {
            settings.server_selection_timeout = parse_millis("serverSelectionTimeoutMS", value)?;
        }

        let mode = match options.get("readPreference") {
            Some(value) => value.parse()?,
            None => ReadMode::Primary,
        };
        let tag_sets = options
            .read_pref_tags
            .iter()
            .map(|tags| ReadPreference::parse_tag_set(tags))
            .collect::<Result<Vec<_>>>()?;
        if mode == ReadMode::Primary && !tag_sets.is_empty() {
            return Err(ArgumentError(String::from(
                "Read preference tags cannot be combined with the primary read mode.",
            )));
        }
        settings.read_preference = ReadPreference::new(mode, Some(tag_sets));
        if let Some(value) = options.get("localThresholdMS") {
            let threshold = parse_millis("localThresholdMS", value)?;
            settings.read_preference = settings.read_preference.with_acceptable_latency(Some(threshold));
        }

        settings.validate()?;
        Ok(settings)
    }

    pub fn validate(&self) -> Result<()> {
        if self.seeds.is_empty() {
            return Err(ArgumentError(String::from("At least one seed host is required.")));
        }
        if self.connection_mode == ClusterConnectionMode::Direct && self.seeds.len() > 1 {
            return Err(ArgumentError(String::from(
                "A direct connection cannot be used with multiple seeds.",
            )));
        }
        self.pool.validate()
    }

    /// The mode after resolving `Automatic` against the seed list.
    pub fn effective_connection_mode(&self) -> ClusterConnectionMode {
        match self.connection_mode {
            ClusterConnectionMode::Automatic => {
                if self.replica_set_name.is_some() {
                    ClusterConnectionMode::ReplicaSet
                } else if self.seeds.len() == 1 {
                    ClusterConnectionMode::Direct
                } else {
                    ClusterConnectionMode::Automatic
                }
            }
            mode => mode,
        }
    }
}

#[cfg(feature = "ssl")]
fn ssl_connector(config: &ConnectionString) -> Result<StreamConnector> {
    let options = &config.options;
    let required = |key: &str| {
        options
            .get(key)
            .cloned()
            .ok_or_else(|| ArgumentError(format!("The ssl option requires '{}'.", key)))
    };

    let verify_peer = match options.get("sslVerifyPeer") {
        Some(value) => parse_bool("sslVerifyPeer", value)?,
        None => true,
    };

    Ok(StreamConnector::with_ssl(
        &required("sslCAFile")?,
        &required("sslCertificateFile")?,
        &required("sslKeyFile")?,
        verify_peer,
    ))
}

#[cfg(not(feature = "ssl"))]
fn ssl_connector(_: &ConnectionString) -> Result<StreamConnector> {
    Err(ArgumentError(String::from(
        "The ssl option requires building with the `ssl` feature.",
    )))
}

/// Topology information gathered from server set monitoring.
#[derive(Clone, Debug)]
pub struct ClusterDescription {
    pub cluster_id: ClusterId,
    pub connection_mode: ClusterConnectionMode,
    pub cluster_type: ClusterType,
    /// The replica set name, configured or discovered.
    pub set_name: Option<String>,
    /// The largest election id seen from a primary in the set.
    pub max_election_id: Option<oid::ObjectId>,
    pub servers: BTreeMap<Host, Arc<ServerDescription>>,
}

impl ClusterDescription {
    /// The description of a cluster that has not heard from any seed yet.
    pub fn new(
        cluster_id: ClusterId,
        connection_mode: ClusterConnectionMode,
        set_name: Option<String>,
        seeds: &[Host],
    ) -> ClusterDescription {
        let cluster_type = match connection_mode {
            ClusterConnectionMode::Direct => ClusterType::Single,
            ClusterConnectionMode::ReplicaSet => ClusterType::ReplicaSet,
            ClusterConnectionMode::Automatic => ClusterType::Unknown,
        };

        let servers = seeds
            .iter()
            .map(|host| {
                let server_id = ServerId::new(cluster_id, host.clone());
                (host.clone(), Arc::new(ServerDescription::unknown(server_id)))
            })
            .collect();

        ClusterDescription {
            cluster_id: cluster_id,
            connection_mode: connection_mode,
            cluster_type: cluster_type,
            set_name: set_name,
            max_election_id: None,
            servers: servers,
        }
    }

    pub fn server(&self, host: &Host) -> Option<&Arc<ServerDescription>> {
        self.servers.get(host)
    }

    pub fn server_descriptions(&self) -> Vec<Arc<ServerDescription>> {
        self.servers.values().cloned().collect()
    }

    pub fn primary(&self) -> Option<&Arc<ServerDescription>> {
        self.servers
            .values()
            .find(|s| s.server_type == ServerType::ReplicaSetPrimary)
    }

    pub fn has_primary(&self) -> bool {
        self.primary().is_some()
    }

    /// Folds a newly published server description into the topology.
    /// Descriptions of servers that are no longer members are ignored.
    pub fn apply(&self, description: Arc<ServerDescription>) -> ClusterDescription {
        let mut next = self.clone();
        let host = description.endpoint().clone();
        if !next.servers.contains_key(&host) {
            return next;
        }
        next.servers.insert(host.clone(), description.clone());

        // A direct connection never changes type or membership.
        if self.connection_mode == ClusterConnectionMode::Direct {
            return next;
        }

        match (self.cluster_type, description.server_type) {
            (_, ServerType::Unknown) => (),
            (ClusterType::Sharded, ServerType::ShardRouter) => (),
            (ClusterType::Sharded, _) => {
                next.servers.remove(&host);
            }
            (ClusterType::Unknown, ServerType::ShardRouter) => next.cluster_type = ClusterType::Sharded,
            (ClusterType::Unknown, ServerType::Standalone) => {
                if next.servers.len() == 1 {
                    next.cluster_type = ClusterType::Standalone;
                } else {
                    next.servers.remove(&host);
                }
            }
            (_, ServerType::Standalone) | (_, ServerType::ShardRouter) => {
                next.servers.remove(&host);
            }
            (_, ServerType::ReplicaSetGhost) => (),
            (_, ServerType::ReplicaSetPrimary) => next.update_from_primary(&host, &description),
            (_, _) => {
                if next.has_primary() {
                    next.update_from_member_with_primary(&host, &description);
                } else {
                    next.update_from_member_without_primary(&host, &description);
                }
            }
        }

        next
    }

    // Adopts the member's set name, or removes the member if it disagrees.
    // Returns whether the member was kept.
    fn check_set_name(&mut self, host: &Host, description: &ServerDescription) -> bool {
        let reported = description.set_name().unwrap_or("");
        match self.set_name {
            None => {
                self.set_name = Some(reported.to_owned());
                true
            }
            Some(ref name) if name == reported => true,
            Some(_) => {
                self.servers.remove(host);
                false
            }
        }
    }

    // Begins tracking hosts that are not currently known.
    fn add_missing_hosts(&mut self, description: &ServerDescription) {
        let info = match description.replica_set {
            Some(ref info) => info,
            None => return,
        };

        for member in info.members() {
            if !self.servers.contains_key(member) {
                let server_id = ServerId::new(self.cluster_id, member.clone());
                self.servers
                    .insert(member.clone(), Arc::new(ServerDescription::unknown(server_id)));
            }
        }
    }

    fn update_from_primary(&mut self, host: &Host, description: &Arc<ServerDescription>) {
        self.cluster_type = ClusterType::ReplicaSet;
        if !self.check_set_name(host, description) {
            return;
        }

        if let Some(election_id) = description.election_id() {
            let stale = self
                .max_election_id
                .as_ref()
                .map_or(false, |max| max.bytes() > election_id.bytes());

            if stale {
                let demoted = Arc::new(description.invalidated());
                self.servers.insert(host.clone(), demoted);
                return;
            }
            self.max_election_id = Some(election_id.clone());
        }

        // Invalidate any old primaries
        let old_primaries: Vec<Host> = self
            .servers
            .iter()
            .filter(|&(other, s)| other != host && s.server_type == ServerType::ReplicaSetPrimary)
            .map(|(other, _)| other.clone())
            .collect();
        for other in old_primaries {
            let demoted = match self.servers.get(&other) {
                Some(s) => Arc::new(s.invalidated()),
                None => continue,
            };
            self.servers.insert(other, demoted);
        }

        self.add_missing_hosts(description);

        // Remove hosts that are not reported by the primary.
        if let Some(ref info) = description.replica_set {
            self.servers.retain(|member, _| info.lists(member));
        }
    }

    fn update_from_member_without_primary(&mut self, host: &Host, description: &ServerDescription) {
        self.cluster_type = ClusterType::ReplicaSet;
        if !self.check_set_name(host, description) {
            return;
        }

        self.add_missing_hosts(description);
        self.remove_if_misnamed(host, description);
    }

    fn update_from_member_with_primary(&mut self, host: &Host, description: &ServerDescription) {
        if !self.check_set_name(host, description) {
            return;
        }
        self.remove_if_misnamed(host, description);
    }

    // A member that reports a different `me` than the address it was reached
    // at is tracked under its own name instead.
    fn remove_if_misnamed(&mut self, host: &Host, description: &ServerDescription) {
        let me = description.replica_set.as_ref().and_then(|info| info.me.as_ref());
        if let Some(me) = me {
            if me != host {
                self.servers.remove(host);
            }
        }
    }
}

struct Snapshot {
    description: Arc<ClusterDescription>,
    servers: HashMap<Host, Arc<Server>>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Phase {
    Created,
    Open,
    Disposed,
}

struct ClusterState {
    phase: Phase,
    // Incremented with every new description.
    version: u64,
}

struct ClusterInner {
    cluster_id: ClusterId,
    settings: ClusterSettings,
    factory: Arc<dyn ConnectionFactory>,
    listener: Arc<Listener>,
    // Serializes description updates.
    update_lock: Mutex<()>,
    snapshot: RwLock<Arc<Snapshot>>,
    state: Mutex<ClusterState>,
    // Notified when the description changes or the cluster is disposed.
    changed: Condvar,
}

/// Holds status and connection information about a server set.
#[derive(Clone)]
pub struct Cluster {
    inner: Arc<ClusterInner>,
}

impl fmt::Debug for Cluster {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Cluster")
            .field("cluster_id", &self.inner.cluster_id)
            .field("description", &self.description())
            .finish()
    }
}

impl Cluster {
    /// Returns a new cluster over the configured seeds. Servers are created
    /// but nothing connects until `initialize` is called.
    pub fn new(
        settings: ClusterSettings,
        factory: Arc<dyn ConnectionFactory>,
        listener: Arc<Listener>,
    ) -> Result<Cluster> {
        settings.validate()?;

        let cluster_id = ClusterId::new();
        let description = ClusterDescription::new(
            cluster_id,
            settings.effective_connection_mode(),
            settings.replica_set_name.clone(),
            &settings.seeds,
        );

        let inner = Arc::new(ClusterInner {
            cluster_id: cluster_id,
            settings: settings,
            factory: factory,
            listener: listener,
            update_lock: Mutex::new(()),
            snapshot: RwLock::new(Arc::new(Snapshot {
                description: Arc::new(description.clone()),
                servers: HashMap::new(),
            })),
            state: Mutex::new(ClusterState {
                phase: Phase::Created,
                version: 0,
            }),
            changed: Condvar::new(),
        });

        let mut servers = HashMap::new();
        for host in description.servers.keys() {
            servers.insert(host.clone(), create_server(&inner, host)?);
        }
        *inner.snapshot.write()? = Arc::new(Snapshot {
            description: Arc::new(description),
            servers: servers,
        });

        Ok(Cluster { inner: inner })
    }

    /// A cluster speaking the binary protocol over TCP or TLS.
    pub fn with_settings(settings: ClusterSettings) -> Result<Cluster> {
        let factory = Arc::new(BinaryConnectionFactory::new(settings.connection.clone()));
        Cluster::new(settings, factory, Arc::new(Listener::new()))
    }

    /// A cluster configured from a `mongodb://` connection string. A string
    /// carrying credentials needs `from_uri_with_authenticator` instead.
    pub fn from_uri(uri: &str) -> Result<Cluster> {
        let config = connstring::parse(uri)?;
        if Credential::from_connection_string(&config)?.is_some() {
            return Err(ArgumentError(String::from(
                "The connection string carries credentials, but no authenticator was supplied.",
            )));
        }
        Cluster::with_settings(ClusterSettings::from_connection_string(&config)?)
    }

    /// A cluster configured from a `mongodb://` connection string whose
    /// credentials are presented through `authenticator` on every new
    /// connection.
    pub fn from_uri_with_authenticator(uri: &str, authenticator: Arc<dyn Authenticator>) -> Result<Cluster> {
        let config = connstring::parse(uri)?;
        let settings = ClusterSettings::from_connection_string(&config)?;

        let mut factory = BinaryConnectionFactory::new(settings.connection.clone());
        if let Some(credential) = Credential::from_connection_string(&config)? {
            factory = factory.with_authentication(credential, authenticator)?;
        }
        Cluster::new(settings, Arc::new(factory), Arc::new(Listener::new()))
    }

    pub fn cluster_id(&self) -> ClusterId {
        self.inner.cluster_id
    }

    pub fn settings(&self) -> &ClusterSettings {
        &self.inner.settings
    }

    pub fn listener(&self) -> &Arc<Listener> {
        &self.inner.listener
    }

    /// Starts monitoring every known server.
    pub fn initialize(&self) -> Result<()> {
        {
            let mut state = self.inner.state.lock()?;
            match state.phase {
                Phase::Open => return Ok(()),
                Phase::Disposed => return Err(Error::ClusterDisposed),
                Phase::Created => state.phase = Phase::Open,
            }
        }

        let snapshot = self.inner.current();
        for server in snapshot.servers.values() {
            server.initialize()?;
        }
        Ok(())
    }

    /// The current topology snapshot.
    pub fn description(&self) -> Arc<ClusterDescription> {
        self.inner.current().description.clone()
    }

    /// The server currently tracked for `host`, if any.
    pub fn server(&self, host: &Host) -> Option<Arc<Server>> {
        self.inner.current().servers.get(host).cloned()
    }

    /// Asks every monitor for an immediate check.
    pub fn request_check(&self) {
        for server in self.inner.current().servers.values() {
            server.request_check();
        }
    }

    /// Folds a server description into the topology, as monitors do after
    /// every check.
    pub fn apply_server_description(&self, description: Arc<ServerDescription>) -> Result<()> {
        apply_server_description(&self.inner, description)
    }

    /// Chooses a server for an operation. When no server matches, monitors
    /// are asked to check immediately and selection waits for the topology to
    /// change, until `timeout` (the configured selection timeout if `None`)
    /// passes or `cancel` fires.
    pub fn select_server(
        &self,
        selector: &dyn ServerSelector,
        timeout: Option<Duration>,
        cancel: &CancellationToken,
    ) -> Result<Arc<Server>> {
        let timeout = timeout.unwrap_or(self.inner.settings.server_selection_timeout);
        let start = Instant::now();
        // A timeout too large to represent waits indefinitely.
        let deadline = start.checked_add(timeout);

        let waker = Arc::downgrade(&self.inner);
        let _registration = cancel.register(move || {
            if let Some(inner) = waker.upgrade() {
                let _guard = inner.state.lock();
                inner.changed.notify_all();
            }
        });

        loop {
            let version = {
                let state = self.inner.state.lock()?;
                match state.phase {
                    Phase::Disposed => return Err(Error::ClusterDisposed),
                    Phase::Created => {
                        return Err(OperationError(String::from(
                            "The cluster must be initialized before selecting a server.",
                        )))
                    }
                    Phase::Open => (),
                }
                state.version
            };

            if cancel.is_cancelled() {
                return Err(Error::Cancelled);
            }

            let snapshot = self.inner.current();
            let descriptions = snapshot.description.server_descriptions();
            let candidates: Vec<Arc<Server>> = selector
                .select_servers_in(snapshot.description.cluster_type, &descriptions)
                .iter()
                .filter_map(|d| snapshot.servers.get(d.endpoint()).cloned())
                .collect();

            if let Some(server) = candidates.choose(&mut thread_rng()) {
                return Ok(server.clone());
            }

            let failure = if descriptions.iter().any(|d| d.is_connected()) {
                SelectionFailure::NoMatchingServers
            } else {
                SelectionFailure::NoServers
            };

            debug!(
                "no server in {} matched the selector after {:?}; waiting for a topology change",
                self.inner.cluster_id,
                start.elapsed()
            );
            for server in snapshot.servers.values() {
                server.request_check();
            }

            let state = self.inner.state.lock()?;
            if state.version != version || state.phase != Phase::Open || cancel.is_cancelled() {
                continue;
            }

            let mut wait = self.inner.settings.monitor.min_heartbeat_frequency;
            if let Some(deadline) = deadline {
                let now = Instant::now();
                if now >= deadline {
                    return Err(Error::ServerSelectionTimeout {
                        timeout: timeout,
                        failure: failure,
                    });
                }
                wait = cmp::min(deadline - now, wait);
            }

            let _ = self.inner.changed.wait_timeout(state, wait)?;
        }
    }

    /// Stops every monitor and closes every pool. Selection fails with
    /// `ClusterDisposed` from then on.
    pub fn dispose(&self) {
        let _update = self.inner.update_lock.lock();
        {
            let mut state = match self.inner.state.lock() {
                Ok(state) => state,
                Err(_) => return,
            };
            if state.phase == Phase::Disposed {
                return;
            }
            state.phase = Phase::Disposed;
            self.inner.changed.notify_all();
        }

        for server in self.inner.current().servers.values() {
            server.dispose();
        }
    }
}

impl ClusterInner {
    fn current(&self) -> Arc<Snapshot> {
        match self.snapshot.read() {
            Ok(snapshot) => snapshot.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    fn is_open(&self) -> bool {
        self.state.lock().map(|state| state.phase == Phase::Open).unwrap_or(false)
    }
}

fn create_server(inner: &Arc<ClusterInner>, host: &Host) -> Result<Arc<Server>> {
    let cluster = Arc::downgrade(inner);
    let on_change: DescriptionChangedHandler = Arc::new(move |description| {
        if let Some(inner) = cluster.upgrade() {
            if let Err(err) = apply_server_description(&inner, description) {
                warn!("failed to apply a server description to {}: {}", inner.cluster_id, err);
            }
        }
    });

    let server = Server::new(
        ServerId::new(inner.cluster_id, host.clone()),
        inner.settings.pool.clone(),
        inner.settings.monitor.clone(),
        inner.factory.clone(),
        inner.listener.clone(),
        on_change,
    )?;
    Ok(Arc::new(server))
}

fn apply_server_description(inner: &Arc<ClusterInner>, description: Arc<ServerDescription>) -> Result<()> {
    let _update = inner.update_lock.lock()?;
    if inner.state.lock()?.phase == Phase::Disposed {
        return Ok(());
    }

    let snapshot = inner.current();
    let old = snapshot.description.clone();
    let new = Arc::new(old.apply(description));

    let mut servers = snapshot.servers.clone();
    let mut removed = Vec::new();
    let mut added = Vec::new();
    for host in old.servers.keys().filter(|host| !new.servers.contains_key(*host)) {
        if let Some(server) = servers.remove(host) {
            removed.push(server);
        }
    }
    for host in new.servers.keys().filter(|host| !old.servers.contains_key(*host)) {
        let server = create_server(inner, host)?;
        servers.insert(host.clone(), server.clone());
        added.push(server);
    }

    *inner.snapshot.write()? = Arc::new(Snapshot {
        description: new.clone(),
        servers: servers,
    });

    {
        let mut state = inner.state.lock()?;
        state.version += 1;
        inner.changed.notify_all();
    }

    inner.listener.emit(&ClusterEvent::ClusterDescriptionChanged { old: old, new: new });

    for server in removed {
        debug!("removing {} from {}", server.endpoint(), inner.cluster_id);
        server.dispose();
    }
    if inner.is_open() {
        for server in added {
            debug!("adding {} to {}", server.endpoint(), inner.cluster_id);
            server.initialize()?;
        }
    }
    Ok(())
}
