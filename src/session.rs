//! Sessions decide which server each operation runs on.
//!
//! A `ClusterSession` selects afresh for every operation. A
//! `MonotonicSession` pins the first server it selects so that a caller
//! reads its own writes: the pin may move while only reads have run, but once
//! a write has gone to the pinned server every later operation must run there
//! too.
use log::debug;

use crate::cancel::CancellationToken;
use crate::channel::{Channel, ChannelProvider};
use crate::connstring::Host;
use crate::error::{Error, Result};
use crate::topology::selector::ServerSelector;
use crate::topology::server::{Server, ServerDescription, ServerId};
use crate::topology::{Cluster, ClusterType};

use std::sync::{Arc, Mutex};
use std::time::Duration;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum OperationKind {
    Read,
    Write,
}

/// Channels to the server a session chose for one operation.
#[derive(Clone, Debug)]
pub struct ServerChannelProvider {
    server: Arc<Server>,
}

impl ServerChannelProvider {
    pub fn new(server: Arc<Server>) -> ServerChannelProvider {
        ServerChannelProvider { server: server }
    }

    pub fn server(&self) -> &Arc<Server> {
        &self.server
    }

    pub fn endpoint(&self) -> &Host {
        self.server.endpoint()
    }

    pub fn description(&self) -> Arc<ServerDescription> {
        self.server.description()
    }
}

impl ChannelProvider for ServerChannelProvider {
    fn server_id(&self) -> &ServerId {
        self.server.server_id()
    }

    fn get_channel(&self, timeout: Option<Duration>, cancel: &CancellationToken) -> Result<Channel> {
        self.server.get_channel(timeout, cancel)
    }
}

/// Caller-facing scope for routing operations.
pub trait Session: Send + Sync {
    fn cluster(&self) -> &Cluster;

    /// Chooses the server for an operation of the given kind.
    fn create_server_channel_provider(
        &self,
        selector: &dyn ServerSelector,
        kind: OperationKind,
        timeout: Option<Duration>,
        cancel: &CancellationToken,
    ) -> Result<ServerChannelProvider>;
}

/// Selects a server for every operation.
#[derive(Clone, Debug)]
pub struct ClusterSession {
    cluster: Cluster,
}

impl ClusterSession {
    pub fn new(cluster: Cluster) -> ClusterSession {
        ClusterSession { cluster: cluster }
    }
}

impl Session for ClusterSession {
    fn cluster(&self) -> &Cluster {
        &self.cluster
    }

    fn create_server_channel_provider(
        &self,
        selector: &dyn ServerSelector,
        _: OperationKind,
        timeout: Option<Duration>,
        cancel: &CancellationToken,
    ) -> Result<ServerChannelProvider> {
        let server = self.cluster.select_server(selector, timeout, cancel)?;
        Ok(ServerChannelProvider::new(server))
    }
}

struct Binding {
    server: Arc<Server>,
    // Set once a write has run on the pinned server; the pin is then fixed.
    wrote: bool,
}

/// Pins the first selected server; see the module documentation.
pub struct MonotonicSession {
    cluster: Cluster,
    binding: Mutex<Option<Binding>>,
}

impl MonotonicSession {
    pub fn new(cluster: Cluster) -> MonotonicSession {
        MonotonicSession {
            cluster: cluster,
            binding: Mutex::new(None),
        }
    }

    /// The endpoint currently pinned, if any.
    pub fn pinned(&self) -> Option<Host> {
        match self.binding.lock() {
            Ok(binding) => binding.as_ref().map(|b| b.server.endpoint().clone()),
            Err(_) => None,
        }
    }

    /// Whether a write has fixed the pin.
    pub fn is_bound_for_writes(&self) -> bool {
        match self.binding.lock() {
            Ok(binding) => binding.as_ref().map_or(false, |b| b.wrote),
            Err(_) => false,
        }
    }

    /// Forgets the pin entirely.
    pub fn reset(&self) {
        if let Ok(mut binding) = self.binding.lock() {
            *binding = None;
        }
    }

    // The cluster's view of the pinned server, or None once it has been
    // removed from the cluster.
    fn pinned_description(&self, server: &Arc<Server>) -> Option<(ClusterType, Arc<ServerDescription>)> {
        if server.is_disposed() {
            return None;
        }
        let cluster = self.cluster.description();
        cluster
            .server(server.endpoint())
            .map(|description| (cluster.cluster_type, description.clone()))
    }
}

impl Session for MonotonicSession {
    fn cluster(&self) -> &Cluster {
        &self.cluster
    }

    fn create_server_channel_provider(
        &self,
        selector: &dyn ServerSelector,
        kind: OperationKind,
        timeout: Option<Duration>,
        cancel: &CancellationToken,
    ) -> Result<ServerChannelProvider> {
        let mut binding = self.binding.lock()?;

        if let Some(ref mut pinned) = *binding {
            let endpoint = pinned.server.endpoint().clone();
            match self.pinned_description(&pinned.server) {
                Some((cluster_type, description)) => {
                    if !selector.select_servers_in(cluster_type, &[description]).is_empty() {
                        if kind == OperationKind::Write {
                            pinned.wrote = true;
                        }
                        return Ok(ServerChannelProvider::new(pinned.server.clone()));
                    }
                    if pinned.wrote {
                        return Err(Error::BindingMismatch { pinned: endpoint });
                    }
                }
                None => {
                    if pinned.wrote {
                        return Err(Error::ServerRemoved(endpoint));
                    }
                }
            }
            debug!("session releasing its read pin on {}", endpoint);
        }

        let server = self.cluster.select_server(selector, timeout, cancel)?;
        *binding = Some(Binding {
            server: server.clone(),
            wrote: kind == OperationKind::Write,
        });
        Ok(ServerChannelProvider::new(server))
    }
}
