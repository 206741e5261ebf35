use mongodb_core::common::TagSet;
use mongodb_core::connstring::{self, Host};
use mongodb_core::topology::server::{ReplicaSetInfo, ServerDescription, ServerId, ServerType};
use mongodb_core::topology::ClusterId;

use serde_json::{Map, Value};

use std::str::FromStr;
use std::time::Duration;

pub struct Server {
    pub host: Host,
    pub rtt: Duration,
    pub tags: TagSet,
    pub stype: ServerType,
}

impl Server {
    pub fn from_json(object: &Map<String, Value>) -> Result<Server, String> {
        let address = val_or_err!(object.get("address"),
                                  Some(&Value::String(ref s)) => s,
                                  "server must have an address.");

        let rtt = val_or_err!(object.get("avg_rtt_ms"),
                              Some(&Value::Number(ref n)) => n.as_u64().unwrap_or(0),
                              "server must have an average rtt.");

        let stype = val_or_err!(object.get("type"),
                                Some(&Value::String(ref s)) =>
                                ServerType::from_str(s).map_err(|err| err.to_string())?,
                                "server must have a type.");

        let mut tags = TagSet::new();
        if let Some(&Value::Object(ref obj)) = object.get("tags") {
            for (key, value) in obj {
                match *value {
                    Value::String(ref s) => {
                        tags.insert(key.to_owned(), s.to_owned());
                    }
                    _ => return Err("tags must be string => string maps.".to_owned()),
                }
            }
        }

        Ok(Server {
            host: connstring::parse_host(address).map_err(|err| err.to_string())?,
            rtt: Duration::from_millis(rtt),
            tags: tags,
            stype: stype,
        })
    }

    /// The description a monitor would have published for this server.
    pub fn to_description(&self, cluster_id: ClusterId) -> ServerDescription {
        let server_id = ServerId::new(cluster_id, self.host.clone());
        let description = ServerDescription::new(server_id, self.stype).with_round_trip_time(Some(self.rtt));

        if self.stype.is_replica_set_member() {
            description.with_replica_set(ReplicaSetInfo {
                set_name: String::from("rs"),
                tags: self.tags.clone(),
                ..ReplicaSetInfo::default()
            })
        } else {
            description
        }
    }
}
