use mongodb_core::connstring::{self, Host};
use mongodb_core::topology::server::ServerType;
use mongodb_core::topology::ClusterType;

use serde_json::{Map, Value};
use std::collections::HashMap;
use std::str::FromStr;

pub struct Server {
    pub set_name: Option<String>,
    pub stype: ServerType,
}

pub struct Outcome {
    pub servers: HashMap<Host, Server>,
    pub set_name: Option<String>,
    pub ttype: ClusterType,
}

impl Outcome {
    pub fn from_json(object: &Map<String, Value>) -> Result<Outcome, String> {
        let mut servers = HashMap::new();

        if let Some(&Value::Object(ref obj)) = object.get("servers") {
            for (host, json) in obj {
                let doc = val_or_err!(*json,
                                      Value::Object(ref obj) => obj,
                                      "`servers` must be an object map.");

                let server_set_name = match doc.get("setName") {
                    Some(&Value::String(ref s)) => Some(s.to_owned()),
                    _ => None,
                };

                let server_type = val_or_err!(doc.get("type"),
                                              Some(&Value::String(ref s)) =>
                                              ServerType::from_str(s).map_err(|err| err.to_string())?,
                                              "`type` must be a string.");

                let server_obj = Server {
                    set_name: server_set_name,
                    stype: server_type,
                };
                let host = connstring::parse_host(host).map_err(|err| err.to_string())?;
                servers.insert(host, server_obj);
            }
        }

        let set_name = match object.get("setName") {
            Some(&Value::String(ref s)) => Some(s.to_owned()),
            _ => None,
        };

        let ttype = match object.get("topologyType") {
            Some(&Value::String(ref s)) => ClusterType::from_str(s).map_err(|err| err.to_string())?,
            _ => ClusterType::Unknown,
        };

        Ok(Outcome {
            servers: servers,
            set_name: set_name,
            ttype: ttype,
        })
    }
}
