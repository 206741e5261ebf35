//! Server selection.
//!
//! A selector is a pure filter over server descriptions. Selectors compose by
//! chaining: status first, then role and tags, then the latency window.
use crate::common::{ReadMode, ReadPreference, TagSet};
use crate::connstring::Host;

use std::sync::Arc;
use std::time::Duration;

use super::server::{ServerDescription, ServerType};
use super::ClusterType;

/// Narrows a set of server descriptions to those an operation may use.
pub trait ServerSelector: Send + Sync {
    fn select_servers(&self, servers: &[Arc<ServerDescription>]) -> Vec<Arc<ServerDescription>>;

    /// Selects among the servers of a cluster of the given type.
    fn select_servers_in(
        &self,
        _cluster_type: ClusterType,
        servers: &[Arc<ServerDescription>],
    ) -> Vec<Arc<ServerDescription>> {
        self.select_servers(servers)
    }
}

impl<F> ServerSelector for F
where
    F: Fn(&[Arc<ServerDescription>]) -> Vec<Arc<ServerDescription>> + Send + Sync,
{
    fn select_servers(&self, servers: &[Arc<ServerDescription>]) -> Vec<Arc<ServerDescription>> {
        self(servers)
    }
}

/// Discards descriptions that are not Connected.
pub fn connected(servers: &[Arc<ServerDescription>]) -> Vec<Arc<ServerDescription>> {
    servers.iter().filter(|s| s.is_connected()).cloned().collect()
}

pub fn writable(servers: &[Arc<ServerDescription>]) -> Vec<Arc<ServerDescription>> {
    servers.iter().filter(|s| s.server_type.is_writable()).cloned().collect()
}

pub fn secondaries(servers: &[Arc<ServerDescription>]) -> Vec<Arc<ServerDescription>> {
    servers
        .iter()
        .filter(|s| s.server_type == ServerType::ReplicaSetSecondary)
        .cloned()
        .collect()
}

fn matches_tag_set(server: &ServerDescription, tag_set: &TagSet) -> bool {
    if !server.server_type.is_replica_set_member() {
        return true;
    }

    let tags = match server.tags() {
        Some(tags) => tags,
        None => return tag_set.is_empty(),
    };

    tag_set.iter().all(|(key, value)| tags.get(key) == Some(value))
}

/// Keeps the servers matching the first tag set that matches any server.
/// An empty list of tag sets, or an empty tag set, matches every server.
pub fn filter_by_tag_sets(servers: &[Arc<ServerDescription>], tag_sets: &[TagSet]) -> Vec<Arc<ServerDescription>> {
    if tag_sets.is_empty() {
        return servers.to_vec();
    }

    for tag_set in tag_sets {
        let matching: Vec<Arc<ServerDescription>> = servers
            .iter()
            .filter(|s| matches_tag_set(s, tag_set))
            .cloned()
            .collect();

        if !matching.is_empty() {
            return matching;
        }
    }

    Vec::new()
}

/// Keeps the fastest server and every server within `allowed_latency` of it,
/// ordered fastest first. `None` keeps every server.
pub fn limit_latency(
    servers: &[Arc<ServerDescription>],
    allowed_latency: Option<Duration>,
) -> Vec<Arc<ServerDescription>> {
    let allowed_latency = match allowed_latency {
        Some(allowed) => allowed,
        None => return servers.to_vec(),
    };

    let mut timed: Vec<(Duration, Arc<ServerDescription>)> = servers
        .iter()
        .filter_map(|s| s.round_trip_time.map(|rtt| (rtt, s.clone())))
        .collect();
    timed.sort_by_key(|&(rtt, _)| rtt);

    let fastest = match timed.first() {
        Some(&(rtt, _)) => rtt,
        None => return Vec::new(),
    };

    timed
        .into_iter()
        .take_while(|&(rtt, _)| rtt <= fastest + allowed_latency)
        .map(|(_, server)| server)
        .collect()
}

/// Selects servers that accept writes, nearest first.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WritableServerSelector {
    pub allowed_latency: Option<Duration>,
}

impl Default for WritableServerSelector {
    fn default() -> Self {
        WritableServerSelector {
            allowed_latency: ReadPreference::primary().secondary_acceptable_latency,
        }
    }
}

impl WritableServerSelector {
    pub fn new() -> WritableServerSelector {
        WritableServerSelector::default()
    }
}

impl ServerSelector for WritableServerSelector {
    fn select_servers(&self, servers: &[Arc<ServerDescription>]) -> Vec<Arc<ServerDescription>> {
        limit_latency(&writable(&connected(servers)), self.allowed_latency)
    }
}

/// Selects servers according to a read preference.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ReadPreferenceServerSelector {
    pub read_preference: ReadPreference,
}

impl ReadPreferenceServerSelector {
    pub fn new(read_preference: ReadPreference) -> ReadPreferenceServerSelector {
        ReadPreferenceServerSelector {
            read_preference: read_preference,
        }
    }

    fn select_by_mode(&self, servers: &[Arc<ServerDescription>]) -> Vec<Arc<ServerDescription>> {
        let tag_sets = &self.read_preference.tag_sets;

        match self.read_preference.mode {
            ReadMode::Primary => writable(servers),
            ReadMode::PrimaryPreferred => {
                let primaries = writable(servers);
                if primaries.is_empty() {
                    filter_by_tag_sets(&secondaries(servers), tag_sets)
                } else {
                    primaries
                }
            }
            ReadMode::Secondary => filter_by_tag_sets(&secondaries(servers), tag_sets),
            ReadMode::SecondaryPreferred => {
                let matching = filter_by_tag_sets(&secondaries(servers), tag_sets);
                if matching.is_empty() {
                    writable(servers)
                } else {
                    matching
                }
            }
            ReadMode::Nearest => {
                let candidates: Vec<Arc<ServerDescription>> = servers
                    .iter()
                    .filter(|s| {
                        s.server_type.is_writable() || s.server_type == ServerType::ReplicaSetSecondary
                    })
                    .cloned()
                    .collect();
                filter_by_tag_sets(&candidates, tag_sets)
            }
        }
    }
}

impl ServerSelector for ReadPreferenceServerSelector {
    fn select_servers(&self, servers: &[Arc<ServerDescription>]) -> Vec<Arc<ServerDescription>> {
        let connected = connected(servers);

        // Outside a replica set (a standalone, shard routers) the mode does
        // not apply: any server that takes writes also serves reads.
        let selected = if connected.iter().any(|s| s.server_type.is_replica_set_member()) {
            self.select_by_mode(&connected)
        } else {
            writable(&connected)
        };

        limit_latency(&selected, self.read_preference.secondary_acceptable_latency)
    }

    // A directly connected server serves reads whatever its role.
    fn select_servers_in(
        &self,
        cluster_type: ClusterType,
        servers: &[Arc<ServerDescription>],
    ) -> Vec<Arc<ServerDescription>> {
        if cluster_type == ClusterType::Single {
            connected(servers)
        } else {
            self.select_servers(servers)
        }
    }
}

/// Applies only the latency window.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LatencyLimitingServerSelector {
    pub allowed_latency: Option<Duration>,
}

impl LatencyLimitingServerSelector {
    pub fn new(allowed_latency: Option<Duration>) -> LatencyLimitingServerSelector {
        LatencyLimitingServerSelector {
            allowed_latency: allowed_latency,
        }
    }
}

impl ServerSelector for LatencyLimitingServerSelector {
    fn select_servers(&self, servers: &[Arc<ServerDescription>]) -> Vec<Arc<ServerDescription>> {
        limit_latency(servers, self.allowed_latency)
    }
}

/// Pins selection to one endpoint.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EndpointServerSelector {
    pub endpoint: Host,
}

impl EndpointServerSelector {
    pub fn new(endpoint: Host) -> EndpointServerSelector {
        EndpointServerSelector { endpoint: endpoint }
    }
}

impl ServerSelector for EndpointServerSelector {
    fn select_servers(&self, servers: &[Arc<ServerDescription>]) -> Vec<Arc<ServerDescription>> {
        servers
            .iter()
            .filter(|s| *s.endpoint() == self.endpoint)
            .cloned()
            .collect()
    }
}

/// Runs selectors in sequence, each over the previous one's output.
pub struct CompositeServerSelector {
    selectors: Vec<Box<dyn ServerSelector>>,
}

impl CompositeServerSelector {
    pub fn new(selectors: Vec<Box<dyn ServerSelector>>) -> CompositeServerSelector {
        CompositeServerSelector { selectors: selectors }
    }

    pub fn then<S: ServerSelector + 'static>(mut self, selector: S) -> CompositeServerSelector {
        self.selectors.push(Box::new(selector));
        self
    }
}

impl ServerSelector for CompositeServerSelector {
    fn select_servers(&self, servers: &[Arc<ServerDescription>]) -> Vec<Arc<ServerDescription>> {
        let mut selected = servers.to_vec();
        for selector in &self.selectors {
            if selected.is_empty() {
                break;
            }
            selected = selector.select_servers(&selected);
        }
        selected
    }

    fn select_servers_in(
        &self,
        cluster_type: ClusterType,
        servers: &[Arc<ServerDescription>],
    ) -> Vec<Arc<ServerDescription>> {
        let mut selected = servers.to_vec();
        for selector in &self.selectors {
            if selected.is_empty() {
                break;
            }
            selected = selector.select_servers_in(cluster_type, &selected);
        }
        selected
    }
}
