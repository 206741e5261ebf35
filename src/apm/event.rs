use std::fmt::{Display, Error, Formatter};
use std::sync::Arc;

use crate::connection::ConnectionId;
use crate::topology::server::{ServerDescription, ServerId};
use crate::topology::ClusterDescription;

/// Something observable happened to a pool, a server or the cluster.
#[derive(Clone, Debug)]
pub enum ClusterEvent {
    ConnectionOpened {
        connection_id: ConnectionId,
    },
    ConnectionClosed {
        connection_id: ConnectionId,
    },
    ConnectionCheckedOut {
        connection_id: ConnectionId,
    },
    ConnectionCheckedIn {
        connection_id: ConnectionId,
    },
    WaitQueueEntered {
        server_id: ServerId,
    },
    WaitQueueExited {
        server_id: ServerId,
    },
    ServerOpened {
        server_id: ServerId,
    },
    ServerClosed {
        server_id: ServerId,
    },
    ServerDescriptionChanged {
        old: Arc<ServerDescription>,
        new: Arc<ServerDescription>,
    },
    ClusterDescriptionChanged {
        old: Arc<ClusterDescription>,
        new: Arc<ClusterDescription>,
    },
}

impl Display for ClusterEvent {
    fn fmt(&self, fmt: &mut Formatter) -> Result<(), Error> {
        match *self {
            ClusterEvent::ConnectionOpened { ref connection_id } => {
                write!(fmt, "CONNECTION {} OPENED", connection_id)
            }
            ClusterEvent::ConnectionClosed { ref connection_id } => {
                write!(fmt, "CONNECTION {} CLOSED", connection_id)
            }
            ClusterEvent::ConnectionCheckedOut { ref connection_id } => {
                write!(fmt, "CONNECTION {} CHECKED OUT", connection_id)
            }
            ClusterEvent::ConnectionCheckedIn { ref connection_id } => {
                write!(fmt, "CONNECTION {} CHECKED IN", connection_id)
            }
            ClusterEvent::WaitQueueEntered { ref server_id } => {
                write!(fmt, "POOL {} WAIT QUEUE ENTERED", server_id)
            }
            ClusterEvent::WaitQueueExited { ref server_id } => {
                write!(fmt, "POOL {} WAIT QUEUE EXITED", server_id)
            }
            ClusterEvent::ServerOpened { ref server_id } => write!(fmt, "SERVER {} OPENED", server_id),
            ClusterEvent::ServerClosed { ref server_id } => write!(fmt, "SERVER {} CLOSED", server_id),
            ClusterEvent::ServerDescriptionChanged { ref old, ref new } => write!(
                fmt,
                "SERVER {} CHANGED: {:?}/{:?} -> {:?}/{:?}",
                new.server_id,
                old.server_type,
                old.status,
                new.server_type,
                new.status
            ),
            ClusterEvent::ClusterDescriptionChanged { ref old, ref new } => write!(
                fmt,
                "CLUSTER {} CHANGED: {:?} ({} servers) -> {:?} ({} servers)",
                new.cluster_id,
                old.cluster_type,
                old.servers.len(),
                new.cluster_type,
                new.servers.len()
            ),
        }
    }
}
