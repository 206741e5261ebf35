use mongodb_core::common::{ReadMode, ReadPreference, TagSet};
use mongodb_core::topology::selector::{
    self, CompositeServerSelector, LatencyLimitingServerSelector, ReadPreferenceServerSelector, ServerSelector,
};
use mongodb_core::topology::server::{ReplicaSetInfo, ServerDescription, ServerType};

use crate::mock;

use std::sync::Arc;
use std::time::Duration;

fn tags(pairs: &[(&str, &str)]) -> TagSet {
    pairs.iter().map(|&(k, v)| (k.to_owned(), v.to_owned())).collect()
}

fn member(address: &str, server_type: ServerType, rtt_ms: u64, member_tags: TagSet) -> Arc<ServerDescription> {
    let description = ServerDescription::new(mock::server_id(address), server_type)
        .with_round_trip_time(Some(Duration::from_millis(rtt_ms)))
        .with_replica_set(ReplicaSetInfo {
            set_name: String::from("rs"),
            ..ReplicaSetInfo::default()
        })
        .with_tags(member_tags);
    Arc::new(description)
}

fn ports(servers: &[Arc<ServerDescription>]) -> Vec<u16> {
    let mut ports: Vec<u16> = servers.iter().map(|s| s.endpoint().port).collect();
    ports.sort();
    ports
}

// Four members on ports 1000-1003, the primary on 1000.
fn four_members() -> Vec<Arc<ServerDescription>> {
    vec![
        member("localhost:1000", ServerType::ReplicaSetPrimary, 10, tags(&[("a", "true"), ("b", "true")])),
        member("localhost:1001", ServerType::ReplicaSetSecondary, 20, tags(&[("a", "true"), ("c", "true")])),
        member("localhost:1002", ServerType::ReplicaSetSecondary, 30, tags(&[("b", "true"), ("c", "true")])),
        member("localhost:1003", ServerType::ReplicaSetSecondary, 40, tags(&[("b", "true"), ("d", "true")])),
    ]
}

#[test]
fn secondary_with_tags_selects_the_single_match() {
    let read_preference = ReadPreference::new(ReadMode::Secondary, Some(vec![tags(&[("a", "true"), ("c", "true")])]));
    let selected = ReadPreferenceServerSelector::new(read_preference).select_servers(&four_members());
    assert_eq!(vec![1001], ports(&selected));
}

#[test]
fn first_matching_tag_set_wins() {
    let servers = four_members();
    let no_match = tags(&[("e", "true")]);
    let one_match = tags(&[("d", "true")]);

    for &mode in &[ReadMode::Secondary, ReadMode::SecondaryPreferred, ReadMode::Nearest, ReadMode::PrimaryPreferred] {
        let read_preference = ReadPreference::new(mode, Some(vec![no_match.clone(), one_match.clone()]))
            .with_acceptable_latency(None);

        let mut selected = ReadPreferenceServerSelector::new(read_preference).select_servers(&servers);
        if mode == ReadMode::PrimaryPreferred {
            assert_eq!(vec![1000], ports(&selected));
            // Without the primary the tag sets apply.
            selected = ReadPreferenceServerSelector::new(ReadPreference::new(mode, Some(vec![no_match.clone(), one_match.clone()])))
                .select_servers(&servers[1..]);
        }
        assert_eq!(vec![1003], ports(&selected), "{:?}", mode);
    }
}

#[test]
fn latency_window_is_measured_from_the_fastest_server() {
    let servers: Vec<Arc<ServerDescription>> = [0, 20, 30, 50]
        .iter()
        .enumerate()
        .map(|(i, &rtt)| member(&format!("localhost:{}", 1000 + i), ServerType::ReplicaSetSecondary, rtt, TagSet::new()))
        .collect();

    let selector = LatencyLimitingServerSelector::new(Some(Duration::from_millis(29)));
    assert_eq!(vec![1000, 1001], ports(&selector.select_servers(&servers)));

    let unlimited = LatencyLimitingServerSelector::new(None);
    assert_eq!(4, unlimited.select_servers(&servers).len());
}

#[test]
fn latency_window_skips_servers_without_a_round_trip_time() {
    let mut servers = four_members();
    servers.push(Arc::new(ServerDescription::new(
        mock::server_id("localhost:1004"),
        ServerType::ReplicaSetSecondary,
    )));

    let selected = selector::limit_latency(&servers, Some(Duration::from_millis(15)));
    assert_eq!(vec![1000, 1001], ports(&selected));
    assert_eq!(5, selector::limit_latency(&servers, None).len());
}

#[test]
fn primary_mode_ignores_tags() {
    let read_preference = ReadPreference::new(ReadMode::Primary, Some(vec![tags(&[("nowhere", "true")])]));
    let selected = ReadPreferenceServerSelector::new(read_preference).select_servers(&four_members());
    assert_eq!(vec![1000], ports(&selected));
}

#[test]
fn selectors_compose_in_order() {
    let only_secondaries: Box<dyn ServerSelector> = Box::new(selector::secondaries);
    let composite = CompositeServerSelector::new(vec![only_secondaries])
        .then(LatencyLimitingServerSelector::new(Some(Duration::from_millis(10))));

    assert_eq!(vec![1001, 1002], ports(&composite.select_servers(&four_members())));
}

#[test]
fn disconnected_servers_are_never_selected() {
    let mut servers = four_members();
    servers[0] = Arc::new(servers[0].connecting());

    let selector = ReadPreferenceServerSelector::new(ReadPreference::new(ReadMode::Primary, None));
    assert!(selector.select_servers(&servers).is_empty());
}
