use bson::{bson, doc};

use mongodb_core::apm::Listener;
use mongodb_core::channel::ChannelProvider;
use mongodb_core::common::{ReadMode, ReadPreference};
use mongodb_core::error::Error;
use mongodb_core::session::{ClusterSession, MonotonicSession, OperationKind, Session};
use mongodb_core::topology::selector::{EndpointServerSelector, ReadPreferenceServerSelector, WritableServerSelector};
use mongodb_core::topology::server::ServerType;
use mongodb_core::topology::{Cluster, ClusterSettings};
use mongodb_core::CancellationToken;

use crate::mock::{self, MockConnectionFactory, MockServers};

use std::sync::Arc;
use std::time::Duration;

const MEMBERS: [&str; 3] = ["a:27017", "b:27017", "c:27017"];

fn wait() -> Option<Duration> {
    Some(Duration::from_secs(5))
}

fn replica_set() -> (Cluster, Arc<MockServers>) {
    let servers = MockServers::new();
    servers.set("a:27017", mock::primary("rs", "a:27017", &MEMBERS));
    servers.set("b:27017", mock::secondary("rs", "b:27017", &MEMBERS));
    servers.set("c:27017", mock::secondary("rs", "c:27017", &MEMBERS));

    let mut settings = ClusterSettings::default();
    settings.seeds = MEMBERS.iter().map(|m| mock::host(m)).collect();
    settings.replica_set_name = Some(String::from("rs"));
    settings.monitor.heartbeat_frequency = Duration::from_millis(100);
    settings.monitor.min_heartbeat_frequency = Duration::from_millis(10);

    let factory = MockConnectionFactory::new(servers.clone());
    let cluster = Cluster::new(settings, factory, Arc::new(Listener::new())).unwrap();
    cluster.initialize().unwrap();

    assert!(mock::wait_until(Duration::from_secs(5), || {
        let description = cluster.description();
        description.servers.len() == 3
            && description.servers.values().all(|s| s.server_type != ServerType::Unknown)
    }));
    (cluster, servers)
}

fn secondary_selector() -> ReadPreferenceServerSelector {
    ReadPreferenceServerSelector::new(ReadPreference::new(ReadMode::Secondary, None))
}

#[test]
fn cluster_session_selects_for_every_operation() {
    let (cluster, _) = replica_set();
    let session = ClusterSession::new(cluster.clone());
    let none = CancellationToken::none();

    let provider = session
        .create_server_channel_provider(&WritableServerSelector::new(), OperationKind::Write, wait(), &none)
        .unwrap();
    assert_eq!(mock::host("a:27017"), *provider.endpoint());

    let provider = session
        .create_server_channel_provider(&secondary_selector(), OperationKind::Read, wait(), &none)
        .unwrap();
    assert!(*provider.endpoint() != mock::host("a:27017"));
    assert_eq!(ServerType::ReplicaSetSecondary, provider.description().server_type);

    let mut channel = provider.get_channel(wait(), &none).unwrap();
    assert!(channel.run_command("admin", doc! { "ping": 1 }, wait(), &none).is_ok());

    cluster.dispose();
}

#[test]
fn monotonic_session_keeps_reading_from_its_pin() {
    let (cluster, _) = replica_set();
    let session = MonotonicSession::new(cluster.clone());
    let none = CancellationToken::none();

    let first = session
        .create_server_channel_provider(&secondary_selector(), OperationKind::Read, wait(), &none)
        .unwrap();
    assert_eq!(Some(first.endpoint().clone()), session.pinned());
    assert!(!session.is_bound_for_writes());

    for _ in 0..10 {
        let next = session
            .create_server_channel_provider(&secondary_selector(), OperationKind::Read, wait(), &none)
            .unwrap();
        assert_eq!(first.endpoint(), next.endpoint());
    }

    cluster.dispose();
}

#[test]
fn monotonic_session_moves_a_read_pin_for_a_write() {
    let (cluster, _) = replica_set();
    let session = MonotonicSession::new(cluster.clone());
    let none = CancellationToken::none();

    session
        .create_server_channel_provider(&secondary_selector(), OperationKind::Read, wait(), &none)
        .unwrap();

    let provider = session
        .create_server_channel_provider(&WritableServerSelector::new(), OperationKind::Write, wait(), &none)
        .unwrap();
    assert_eq!(mock::host("a:27017"), *provider.endpoint());
    assert_eq!(Some(mock::host("a:27017")), session.pinned());
    assert!(session.is_bound_for_writes());

    cluster.dispose();
}

#[test]
fn monotonic_session_stays_on_the_server_it_wrote_to() {
    let (cluster, _) = replica_set();
    let session = MonotonicSession::new(cluster.clone());
    let none = CancellationToken::none();

    session
        .create_server_channel_provider(&WritableServerSelector::new(), OperationKind::Write, wait(), &none)
        .unwrap();

    // The primary satisfies primaryPreferred, so the read stays put.
    let preferred = ReadPreferenceServerSelector::new(ReadPreference::new(ReadMode::PrimaryPreferred, None));
    let provider = session
        .create_server_channel_provider(&preferred, OperationKind::Read, wait(), &none)
        .unwrap();
    assert_eq!(mock::host("a:27017"), *provider.endpoint());

    match session.create_server_channel_provider(&secondary_selector(), OperationKind::Read, wait(), &none) {
        Err(Error::BindingMismatch { ref pinned }) => assert_eq!(mock::host("a:27017"), *pinned),
        other => panic!("Expected BindingMismatch, got {:?}", other),
    }

    session.reset();
    assert_eq!(None, session.pinned());
    let provider = session
        .create_server_channel_provider(&secondary_selector(), OperationKind::Read, wait(), &none)
        .unwrap();
    assert!(*provider.endpoint() != mock::host("a:27017"));

    cluster.dispose();
}

#[test]
fn monotonic_session_reacts_to_removed_servers() {
    let (cluster, servers) = replica_set();
    let none = CancellationToken::none();

    let written = MonotonicSession::new(cluster.clone());
    let on_b = EndpointServerSelector::new(mock::host("b:27017"));
    written
        .create_server_channel_provider(&on_b, OperationKind::Write, wait(), &none)
        .unwrap();

    let read = MonotonicSession::new(cluster.clone());
    read.create_server_channel_provider(&on_b, OperationKind::Read, wait(), &none)
        .unwrap();

    // The primary drops b from the set.
    servers.set("a:27017", mock::primary("rs", "a:27017", &["a:27017", "c:27017"]));
    assert!(mock::wait_until(Duration::from_secs(5), || {
        cluster.request_check();
        cluster.server(&mock::host("b:27017")).is_none()
    }));

    match written.create_server_channel_provider(&on_b, OperationKind::Write, wait(), &none) {
        Err(Error::ServerRemoved(ref host)) => assert_eq!(mock::host("b:27017"), *host),
        other => panic!("Expected ServerRemoved, got {:?}", other),
    }

    let provider = read
        .create_server_channel_provider(&WritableServerSelector::new(), OperationKind::Read, wait(), &none)
        .unwrap();
    assert_eq!(mock::host("a:27017"), *provider.endpoint());
    assert_eq!(Some(mock::host("a:27017")), read.pinned());

    cluster.dispose();
}
