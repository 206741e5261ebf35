use approx::assert_relative_eq;
use bson::{bson, doc, oid};

use mongodb_core::apm::{ClusterEvent, Listener};
use mongodb_core::connstring::Host;
use mongodb_core::pool::ConnectionPoolSettings;
use mongodb_core::topology::monitor::{IsMasterResult, MonitorSettings, RoundTripTime};
use mongodb_core::topology::server::{Server, ServerDescription, ServerStatus, ServerType};

use crate::mock::{self, MockConnectionFactory, MockServers};

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

fn server_type(doc: bson::Document) -> ServerType {
    IsMasterResult::new(doc).unwrap().server_type()
}

#[test]
fn is_master_reply_fields() {
    let reply = doc! {
        "ok": 1.0,
        "ismaster": false,
        "secondary": true,
        "setName": "rs",
        "setVersion": 3,
        "me": "B:27017",
        "primary": "a:27017",
        "hosts": ["a:27017", "b:27017"],
        "passives": ["c:27017"],
        "arbiters": ["d"],
        "tags": { "dc": "ny" },
        "maxBsonObjectSize": 1024,
        "maxWireVersion": 6,
        "electionId": { "$oid": "000000000000000000000007" }
    };

    let result = IsMasterResult::new(reply).unwrap();
    assert!(result.ok);
    assert!(!result.is_master);
    assert!(result.is_secondary);
    assert_eq!("rs", result.set_name);
    assert_eq!(Some(3), result.set_version);
    assert_eq!(Some(Host::new("b", 27017)), result.me);
    assert_eq!(Some(Host::new("a", 27017)), result.primary);
    assert_eq!(vec![Host::new("a", 27017), Host::new("b", 27017)], result.hosts);
    assert_eq!(vec![Host::new("c", 27017)], result.passives);
    assert_eq!(vec![Host::new("d", 27017)], result.arbiters);
    assert_eq!(Some(&String::from("ny")), result.tags.get("dc"));
    assert_eq!(1024, result.max_bson_object_size);
    assert_eq!(6, result.max_wire_version);
    assert_eq!(
        Some(oid::ObjectId::with_string("000000000000000000000007").unwrap()),
        result.election_id
    );
    assert_eq!(ServerType::ReplicaSetSecondary, result.server_type());
}

#[test]
fn is_master_reply_requires_ok() {
    assert!(IsMasterResult::new(doc! { "ismaster": true }).is_err());
    assert_eq!(ServerType::Unknown, server_type(doc! { "ok": 0, "ismaster": true }));
}

#[test]
fn classifies_servers() {
    assert_eq!(ServerType::Standalone, server_type(mock::standalone()));
    assert_eq!(ServerType::ShardRouter, server_type(mock::shard_router()));
    assert_eq!(
        ServerType::ReplicaSetPrimary,
        server_type(mock::primary("rs", "a:27017", &["a:27017"]))
    );
    assert_eq!(
        ServerType::ReplicaSetSecondary,
        server_type(mock::secondary("rs", "b:27017", &["a:27017", "b:27017"]))
    );
    assert_eq!(
        ServerType::ReplicaSetArbiter,
        server_type(doc! { "ok": 1, "ismaster": false, "arbiterOnly": true, "setName": "rs" })
    );
    assert_eq!(
        ServerType::ReplicaSetOther,
        server_type(doc! { "ok": 1, "ismaster": false, "hidden": true, "setName": "rs" })
    );
    assert_eq!(
        ServerType::ReplicaSetGhost,
        server_type(doc! { "ok": 1, "ismaster": false, "isreplicaset": true })
    );
}

#[test]
fn descriptions_from_is_master() {
    let reply = IsMasterResult::new(mock::primary("rs", "a:27017", &["a:27017", "b:27017"])).unwrap();
    let rtt = Some(Duration::from_millis(12));
    let description = ServerDescription::from_is_master(mock::server_id("a:27017"), &reply, rtt);

    assert_eq!(ServerType::ReplicaSetPrimary, description.server_type);
    assert_eq!(ServerStatus::Connected, description.status);
    assert_eq!(rtt, description.round_trip_time);
    assert_eq!(Some("rs"), description.set_name());
    assert!(description.error.is_none());

    let standalone = IsMasterResult::new(mock::standalone()).unwrap();
    let description = ServerDescription::from_is_master(mock::server_id("a:27017"), &standalone, None);
    assert_eq!(None, description.set_name());
    assert_eq!(None, description.tags());

    let failed = IsMasterResult::new(doc! { "ok": 0 }).unwrap();
    let description = ServerDescription::from_is_master(mock::server_id("a:27017"), &failed, rtt);
    assert_eq!(ServerStatus::Disconnected, description.status);
    assert!(description.error.is_some());
}

#[test]
fn round_trip_time_is_a_moving_average() {
    let mut rtt = RoundTripTime::new();
    assert_eq!(None, rtt.average_ms());

    rtt.add_sample(Duration::from_millis(100));
    assert_relative_eq!(100.0, rtt.average_ms().unwrap(), epsilon = 1e-9);

    rtt.add_sample(Duration::from_millis(50));
    assert_relative_eq!(90.0, rtt.average_ms().unwrap(), epsilon = 1e-9);

    rtt.add_sample(Duration::from_micros(500));
    assert_relative_eq!(72.1, rtt.average_ms().unwrap(), epsilon = 1e-9);
    assert_eq!(Some(Duration::from_micros(72_100)), rtt.average());

    rtt.reset();
    assert_eq!(None, rtt.average());
}

fn monitored(servers: &Arc<MockServers>, address: &str, listener: Arc<Listener>) -> Server {
    let settings = MonitorSettings {
        heartbeat_frequency: Duration::from_secs(10),
        min_heartbeat_frequency: Duration::from_millis(10),
        heartbeat_timeout: Duration::from_secs(1),
    };
    monitored_with(servers, address, listener, settings)
}

fn monitored_with(
    servers: &Arc<MockServers>,
    address: &str,
    listener: Arc<Listener>,
    settings: MonitorSettings,
) -> Server {
    let server = Server::new(
        mock::server_id(address),
        ConnectionPoolSettings::default(),
        settings,
        MockConnectionFactory::new(servers.clone()),
        listener,
        Arc::new(|_: Arc<ServerDescription>| {}),
    )
    .unwrap();
    server.initialize().unwrap();
    server
}

#[test]
fn monitor_publishes_what_the_server_reports() {
    let servers = MockServers::new();
    servers.set("a:27017", mock::standalone());

    let changes = Arc::new(AtomicUsize::new(0));
    let counter = changes.clone();
    let listener = Arc::new(Listener::new());
    listener
        .add_hook(move |event| {
            if let ClusterEvent::ServerDescriptionChanged { .. } = *event {
                counter.fetch_add(1, Ordering::SeqCst);
            }
        })
        .unwrap();

    let server = monitored(&servers, "a:27017", listener);
    assert!(mock::wait_until(Duration::from_secs(5), || {
        server.description().server_type == ServerType::Standalone
    }));
    let description = server.description();
    assert_eq!(ServerStatus::Connected, description.status);
    assert!(description.round_trip_time.is_some());
    // Connecting, then Connected.
    assert!(mock::wait_until(Duration::from_secs(5), || changes.load(Ordering::SeqCst) == 2));

    servers.set("a:27017", mock::shard_router());
    server.request_check();
    assert!(mock::wait_until(Duration::from_secs(5), || {
        server.description().server_type == ServerType::ShardRouter
    }));

    server.dispose();
}

#[test]
fn failed_heartbeat_clears_the_pool() {
    let servers = MockServers::new();
    servers.set("a:27017", mock::standalone());

    let server = monitored(&servers, "a:27017", Arc::new(Listener::new()));
    assert!(mock::wait_until(Duration::from_secs(5), || {
        server.description().server_type == ServerType::Standalone
    }));
    let generation = server.pool().generation();

    servers.kill("a:27017");
    server.request_check();
    assert!(mock::wait_until(Duration::from_secs(5), || {
        server.description().server_type == ServerType::Unknown
    }));

    let description = server.description();
    assert_eq!(ServerStatus::Disconnected, description.status);
    assert!(description.error.is_some());
    assert!(server.pool().generation() > generation);

    server.dispose();
    assert!(server.is_disposed());
}

#[test]
fn silent_server_is_marked_unknown_after_one_timeout() {
    let servers = MockServers::new();
    servers.set("a:27017", mock::standalone());

    let settings = MonitorSettings {
        heartbeat_frequency: Duration::from_secs(10),
        min_heartbeat_frequency: Duration::from_millis(10),
        heartbeat_timeout: Duration::from_millis(300),
    };
    let server = monitored_with(&servers, "a:27017", Arc::new(Listener::new()), settings);
    assert!(mock::wait_until(Duration::from_secs(5), || {
        server.description().server_type == ServerType::Standalone
    }));

    servers.silence("a:27017");
    let sent = servers.is_master_count();
    server.request_check();
    assert!(mock::wait_until(Duration::from_secs(5), || {
        server.description().server_type == ServerType::Unknown
    }));

    let description = server.description();
    assert_eq!(ServerStatus::Disconnected, description.status);
    assert!(description.error.as_ref().map_or(false, |err| err.is_timeout()));
    // The server went Unknown on the first unanswered heartbeat.
    assert_eq!(sent + 1, servers.is_master_count());

    server.dispose();
}
