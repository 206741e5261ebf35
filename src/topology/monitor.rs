//! Server discovery and monitoring using isMaster results.
use bson::{bson, doc, oid, Bson};
use chrono::{DateTime, Utc};
use log::{debug, warn};
use serde_derive::{Deserialize, Serialize};

use crate::apm::{ClusterEvent, Listener};
use crate::cancel::CancellationToken;
use crate::common::TagSet;
use crate::connection::{self, Connection, ConnectionFactory};
use crate::connstring::{self, Host};
use crate::error::Error::{self, ArgumentError, OperationError};
use crate::error::Result;
use crate::pool::ConnectionPool;
use crate::wire_protocol::operations::MAX_MESSAGE_SIZE;
use crate::wire_protocol::RequestIds;

use std::sync::{Arc, Condvar, Mutex, RwLock};
use std::thread;
use std::time::{Duration, Instant};

use super::server::{
    DescriptionChangedHandler, ServerDescription, ServerId, ServerStatus, ServerType, DEFAULT_MAX_DOCUMENT_SIZE,
};

pub const DEFAULT_HEARTBEAT_FREQUENCY_MS: u64 = 10_000;
pub const DEFAULT_MIN_HEARTBEAT_FREQUENCY_MS: u64 = 500;
pub const DEFAULT_HEARTBEAT_TIMEOUT_MS: u64 = 10_000;

// Weight of the newest sample in the round-trip moving average.
const RTT_ALPHA: f64 = 0.2;

/// How often and how patiently a server is probed.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitorSettings {
    pub heartbeat_frequency: Duration,
    /// Requested checks never run closer together than this.
    pub min_heartbeat_frequency: Duration,
    pub heartbeat_timeout: Duration,
}

impl Default for MonitorSettings {
    fn default() -> Self {
        MonitorSettings {
            heartbeat_frequency: Duration::from_millis(DEFAULT_HEARTBEAT_FREQUENCY_MS),
            min_heartbeat_frequency: Duration::from_millis(DEFAULT_MIN_HEARTBEAT_FREQUENCY_MS),
            heartbeat_timeout: Duration::from_millis(DEFAULT_HEARTBEAT_TIMEOUT_MS),
        }
    }
}

/// The result of an isMaster operation.
#[derive(Clone, Debug, PartialEq)]
pub struct IsMasterResult {
    pub ok: bool,
    pub is_master: bool,
    pub max_bson_object_size: i64,
    pub max_message_size_bytes: i64,
    pub local_time: Option<DateTime<Utc>>,
    pub min_wire_version: i64,
    pub max_wire_version: i64,

    /// Shard-specific. Shard routers add this field to the isMaster reply,
    /// and it will contain the value "isdbgrid".
    pub msg: String,

    // Replica Set specific
    pub is_replica_set: bool,
    pub is_secondary: bool,
    pub me: Option<Host>,
    pub hosts: Vec<Host>,
    pub passives: Vec<Host>,
    pub arbiters: Vec<Host>,
    pub arbiter_only: bool,
    pub tags: TagSet,
    pub set_name: String,
    pub set_version: Option<i64>,
    pub election_id: Option<oid::ObjectId>,
    pub primary: Option<Host>,
    pub hidden: bool,
}

// Accepts any of the numeric encodings a server may use.
fn read_i64(value: Option<&Bson>) -> Option<i64> {
    match value {
        Some(&Bson::I32(v)) => Some(i64::from(v)),
        Some(&Bson::I64(v)) => Some(v),
        Some(&Bson::FloatingPoint(v)) => Some(v as i64),
        _ => None,
    }
}

fn read_hosts(value: Option<&Bson>) -> Vec<Host> {
    match value {
        Some(&Bson::Array(ref arr)) => arr
            .iter()
            .filter_map(|bson| match *bson {
                Bson::String(ref s) => connstring::parse_host(s).ok(),
                _ => None,
            })
            .collect(),
        _ => Vec::new(),
    }
}

impl IsMasterResult {
    /// Parses an isMaster response document from the server.
    pub fn new(doc: bson::Document) -> Result<IsMasterResult> {
        let ok = match doc.get("ok") {
            Some(&Bson::Boolean(b)) => b,
            other => match read_i64(other) {
                Some(v) => v != 0,
                None => return Err(ArgumentError(String::from("result does not contain `ok`."))),
            },
        };

        let mut result = IsMasterResult {
            ok: ok,
            is_master: false,
            max_bson_object_size: DEFAULT_MAX_DOCUMENT_SIZE,
            max_message_size_bytes: i64::from(MAX_MESSAGE_SIZE),
            local_time: None,
            min_wire_version: 0,
            max_wire_version: 0,
            msg: String::new(),
            is_secondary: false,
            is_replica_set: false,
            me: None,
            hosts: read_hosts(doc.get("hosts")),
            passives: read_hosts(doc.get("passives")),
            arbiters: read_hosts(doc.get("arbiters")),
            arbiter_only: false,
            tags: TagSet::new(),
            set_name: String::new(),
            set_version: read_i64(doc.get("setVersion")),
            election_id: None,
            primary: None,
            hidden: false,
        };

        if let Some(&Bson::Boolean(b)) = doc.get("ismaster") {
            result.is_master = b;
        }

        if let Some(v) = read_i64(doc.get("maxBsonObjectSize")) {
            result.max_bson_object_size = v;
        }

        if let Some(v) = read_i64(doc.get("maxMessageSizeBytes")) {
            result.max_message_size_bytes = v;
        }

        if let Some(&Bson::UtcDatetime(ref datetime)) = doc.get("localTime") {
            result.local_time = Some(*datetime);
        }

        if let Some(v) = read_i64(doc.get("minWireVersion")) {
            result.min_wire_version = v;
        }

        if let Some(v) = read_i64(doc.get("maxWireVersion")) {
            result.max_wire_version = v;
        }

        if let Some(&Bson::String(ref s)) = doc.get("msg") {
            result.msg = s.to_owned();
        }

        if let Some(&Bson::Boolean(b)) = doc.get("secondary") {
            result.is_secondary = b;
        }

        if let Some(&Bson::Boolean(b)) = doc.get("isreplicaset") {
            result.is_replica_set = b;
        }

        if let Some(&Bson::String(ref s)) = doc.get("setName") {
            result.set_name = s.to_owned();
        }

        if let Some(&Bson::String(ref s)) = doc.get("me") {
            result.me = Some(connstring::parse_host(s)?);
        }

        if let Some(&Bson::String(ref s)) = doc.get("primary") {
            result.primary = Some(connstring::parse_host(s)?);
        }

        if let Some(&Bson::Boolean(b)) = doc.get("arbiterOnly") {
            result.arbiter_only = b;
        }

        if let Some(&Bson::Boolean(b)) = doc.get("hidden") {
            result.hidden = b;
        }

        if let Some(&Bson::Document(ref tags)) = doc.get("tags") {
            for (k, v) in tags.iter() {
                if let Bson::String(ref tag) = *v {
                    result.tags.insert(k.to_owned(), tag.to_owned());
                }
            }
        }

        match doc.get("electionId") {
            Some(&Bson::ObjectId(ref id)) => result.election_id = Some(id.clone()),
            Some(&Bson::Document(ref doc)) => {
                if let Some(&Bson::String(ref s)) = doc.get("$oid") {
                    result.election_id = Some(oid::ObjectId::with_string(s)?);
                }
            }
            _ => (),
        }

        Ok(result)
    }

    /// Classifies the replying server.
    pub fn server_type(&self) -> ServerType {
        let has_set_name = !self.set_name.is_empty();

        if !self.ok {
            ServerType::Unknown
        } else if self.msg == "isdbgrid" {
            ServerType::ShardRouter
        } else if has_set_name && self.is_master {
            ServerType::ReplicaSetPrimary
        } else if has_set_name && self.is_secondary {
            ServerType::ReplicaSetSecondary
        } else if has_set_name && self.arbiter_only {
            ServerType::ReplicaSetArbiter
        } else if has_set_name {
            ServerType::ReplicaSetOther
        } else if self.is_replica_set {
            ServerType::ReplicaSetGhost
        } else {
            ServerType::Standalone
        }
    }
}

/// An exponentially weighted moving average of heartbeat round trips.
#[derive(Clone, Debug, Default)]
pub struct RoundTripTime {
    average_ms: Option<f64>,
}

impl RoundTripTime {
    pub fn new() -> RoundTripTime {
        RoundTripTime { average_ms: None }
    }

    pub fn add_sample(&mut self, sample: Duration) {
        let sample_ms = sample.as_secs() as f64 * 1000.0 + f64::from(sample.subsec_nanos()) / 1_000_000.0;
        self.average_ms = Some(match self.average_ms {
            None => sample_ms,
            Some(average) => RTT_ALPHA * sample_ms + (1.0 - RTT_ALPHA) * average,
        });
    }

    pub fn average_ms(&self) -> Option<f64> {
        self.average_ms
    }

    pub fn average(&self) -> Option<Duration> {
        self.average_ms.map(|ms| Duration::from_micros((ms * 1000.0).round() as u64))
    }

    pub fn reset(&mut self) {
        self.average_ms = None;
    }
}

struct Signal {
    running: bool,
    started: bool,
    check_requested: bool,
}

struct MonitorShared {
    server_id: ServerId,
    settings: MonitorSettings,
    factory: Arc<dyn ConnectionFactory>,
    request_ids: RequestIds,
    // The server's pool, cleared whenever a check fails.
    pool: ConnectionPool,
    description: Arc<RwLock<Arc<ServerDescription>>>,
    listener: Arc<Listener>,
    on_change: DescriptionChangedHandler,
    signal: Mutex<Signal>,
    // Notified to wake the monitor for an immediate check or to stop it.
    condvar: Condvar,
}

/// Monitors a server on a dedicated thread and connection, publishing each
/// new description.
pub struct Monitor {
    shared: Arc<MonitorShared>,
}

impl Monitor {
    pub fn new(
        server_id: ServerId,
        settings: MonitorSettings,
        factory: Arc<dyn ConnectionFactory>,
        pool: ConnectionPool,
        description: Arc<RwLock<Arc<ServerDescription>>>,
        listener: Arc<Listener>,
        on_change: DescriptionChangedHandler,
    ) -> Monitor {
        Monitor {
            shared: Arc::new(MonitorShared {
                server_id: server_id,
                settings: settings,
                request_ids: factory.request_ids(),
                factory: factory,
                pool: pool,
                description: description,
                listener: listener,
                on_change: on_change,
                signal: Mutex::new(Signal {
                    running: false,
                    started: false,
                    check_requested: false,
                }),
                condvar: Condvar::new(),
            }),
        }
    }

    /// Starts the monitor thread. Returns false if it was already started.
    pub fn start(&self) -> Result<bool> {
        {
            let mut signal = self.shared.signal.lock()?;
            if signal.started {
                return Ok(false);
            }
            signal.started = true;
            signal.running = true;
        }

        let shared = self.shared.clone();
        thread::Builder::new()
            .name(format!("monitor-{}", self.shared.server_id.endpoint))
            .spawn(move || shared.run())?;
        Ok(true)
    }

    pub fn request_check(&self) {
        if let Ok(mut signal) = self.shared.signal.lock() {
            signal.check_requested = true;
            self.shared.condvar.notify_all();
        }
    }

    /// Stops the monitor after its current check, if any.
    pub fn stop(&self) {
        if let Ok(mut signal) = self.shared.signal.lock() {
            signal.running = false;
            self.shared.condvar.notify_all();
        }
    }

    /// Publishes a description on behalf of the server.
    pub fn publish(&self, description: ServerDescription) {
        self.shared.publish(description);
    }
}

impl MonitorShared {
    fn is_running(&self) -> bool {
        self.signal.lock().map(|signal| signal.running).unwrap_or(false)
    }

    fn current(&self) -> Arc<ServerDescription> {
        match self.description.read() {
            Ok(description) => description.clone(),
            Err(_) => Arc::new(ServerDescription::unknown(self.server_id.clone())),
        }
    }

    fn publish(&self, description: ServerDescription) {
        let new = Arc::new(description);
        let old = match self.description.write() {
            Ok(mut slot) => std::mem::replace(&mut *slot, new.clone()),
            Err(_) => return,
        };

        self.listener.emit(&ClusterEvent::ServerDescriptionChanged {
            old: old,
            new: new.clone(),
        });
        (self.on_change)(new);
    }

    fn run(&self) {
        let mut connection: Option<Box<dyn Connection>> = None;
        let mut round_trip_time = RoundTripTime::new();

        loop {
            if !self.is_running() {
                break;
            }

            let started = Instant::now();
            self.check(&mut connection, &mut round_trip_time);

            if !self.wait_for_next_check(started) {
                break;
            }
        }

        if let Some(mut connection) = connection {
            connection.close();
        }
        debug!("monitor for {} stopped", self.server_id);
    }

    // Blocks until the heartbeat interval passes or a check is requested, but
    // never less than the minimum interval. Returns false once stopped.
    fn wait_for_next_check(&self, last_check: Instant) -> bool {
        let mut signal = match self.signal.lock() {
            Ok(signal) => signal,
            Err(_) => return false,
        };

        // Intervals too large to represent never come due.
        let earliest = last_check.checked_add(self.settings.min_heartbeat_frequency);
        let scheduled = last_check.checked_add(self.settings.heartbeat_frequency);

        loop {
            if !signal.running {
                return false;
            }

            let now = Instant::now();
            let due = scheduled.map_or(false, |at| now >= at);
            let requested = signal.check_requested && earliest.map_or(false, |at| now >= at);
            if due || requested {
                signal.check_requested = false;
                return true;
            }

            let wake_at = if signal.check_requested { earliest } else { scheduled };
            let waited = match wake_at {
                Some(at) => self.condvar.wait_timeout(signal, at - now).ok().map(|(signal, _)| signal),
                None => self.condvar.wait(signal).ok(),
            };
            signal = match waited {
                Some(signal) => signal,
                None => return false,
            };
        }
    }

    // Executes isMaster and publishes the resulting description.
    fn check(&self, connection: &mut Option<Box<dyn Connection>>, round_trip_time: &mut RoundTripTime) {
        let previous = self.current();
        if previous.status == ServerStatus::Disconnected {
            self.publish(previous.connecting());
        }

        let err = match self.probe(connection, round_trip_time) {
            Ok(description) => return self.publish_if_running(description),
            Err(err) => err,
        };

        warn!("heartbeat to {} failed: {}", self.server_id, err);
        *connection = None;
        round_trip_time.reset();

        // Refresh all connections
        self.pool.clear();

        // A server that stopped answering is not retried; one whose
        // connection broke gets one more probe, once it is marked Unknown.
        let retry = previous.server_type != ServerType::Unknown && !err.is_timeout();
        self.publish_if_running(ServerDescription::with_error(self.server_id.clone(), err));
        if !retry {
            return;
        }

        match self.probe(connection, round_trip_time) {
            Ok(description) => self.publish_if_running(description),
            Err(err) => {
                debug!("retried heartbeat to {} failed: {}", self.server_id, err);
                *connection = None;
                self.publish_if_running(ServerDescription::with_error(self.server_id.clone(), err));
            }
        }
    }

    fn publish_if_running(&self, description: ServerDescription) {
        if self.is_running() {
            self.publish(description);
        }
    }

    // Runs isMaster on the monitor's own connection, opening one if needed.
    fn probe(
        &self,
        connection: &mut Option<Box<dyn Connection>>,
        round_trip_time: &mut RoundTripTime,
    ) -> Result<ServerDescription> {
        if !connection.as_ref().map_or(false, |c| c.is_open()) {
            *connection = Some(self.factory.create_connection(&self.server_id)?);
        }

        let conn = match connection.as_mut() {
            Some(conn) => conn,
            None => return Err(OperationError(format!("No monitor connection to {}.", self.server_id))),
        };

        let start = Instant::now();
        let reply = connection::run_command(
            &mut **conn,
            &self.request_ids,
            "admin",
            doc! { "isMaster": 1i32 },
            Some(self.settings.heartbeat_timeout),
            &CancellationToken::none(),
        );

        let reply = match reply {
            Ok(reply) => reply,
            Err(err) => {
                *connection = None;
                return Err(err);
            }
        };

        round_trip_time.add_sample(start.elapsed());
        let is_master = IsMasterResult::new(reply).map_err(|err| match err {
            Error::ArgumentError(msg) => Error::ResponseError(msg),
            err => err,
        })?;

        Ok(ServerDescription::from_is_master(
            self.server_id.clone(),
            &is_master,
            round_trip_time.average(),
        ))
    }
}
