use mongodb_core::common::ReadPreference;
use mongodb_core::topology::ClusterType;

use serde_json::Value;

use std::str::FromStr;

use super::read_preference;
use super::server::Server;
use crate::json;

pub struct Suite {
    pub description: String,
    pub in_latency_window: Vec<Server>,
    pub write: bool,
    pub read_preference: ReadPreference,
    pub suitable_servers: Vec<Server>,
    pub servers: Vec<Server>,
    pub ttype: ClusterType,
}

fn get_server_array(vals: &[Value]) -> Result<Vec<Server>, String> {
    let mut servers = Vec::new();

    for json in vals {
        match *json {
            Value::Object(ref obj) => servers.push(Server::from_json(obj)?),
            _ => return Err(String::from("Some servers could not be parsed for topology")),
        }
    }

    Ok(servers)
}

pub trait SuiteContainer: Sized {
    fn from_file(path: &str) -> Result<Self, String>;
    fn get_suite(&self) -> Result<Suite, String>;
}

impl SuiteContainer for Value {
    fn from_file(path: &str) -> Result<Value, String> {
        json::read_file(path)
    }

    fn get_suite(&self) -> Result<Suite, String> {
        let object = val_or_err!(*self,
                                 Value::Object(ref object) => object,
                                 "`get_suite` requires a JSON object");

        let description = match object.get("description") {
            Some(&Value::String(ref s)) => s.clone(),
            _ => String::new(),
        };

        let operation = val_or_err!(object.get("operation"),
                                    Some(&Value::String(ref s)) => s.to_owned(),
                                    "suite requires an operation string.");

        let read_preference = val_or_err!(object.get("read_preference"),
                                          Some(&Value::Object(ref object)) =>
                                          read_preference::from_json(object)?,
                                          "suite requires a read_preference object.");

        let in_latency_window = val_or_err!(object.get("in_latency_window"),
                                            Some(&Value::Array(ref array)) => get_server_array(array)?,
                                            "suite requires an in_latency_window array.");

        let suitable_servers = val_or_err!(object.get("suitable_servers"),
                                           Some(&Value::Array(ref array)) => get_server_array(array)?,
                                           "suite requires a suitable_servers array.");

        let topology_obj = val_or_err!(object.get("topology_description"),
                                       Some(&Value::Object(ref obj)) => obj,
                                       "suite requires a topology_description object.");

        let servers = val_or_err!(topology_obj.get("servers"),
                                  Some(&Value::Array(ref array)) => get_server_array(array)?,
                                  "topology requires an array of servers.");

        let ttype = val_or_err!(topology_obj.get("type"),
                                Some(&Value::String(ref s)) =>
                                ClusterType::from_str(s).map_err(|err| err.to_string())?,
                                "topology requires a type");

        Ok(Suite {
            description: description,
            in_latency_window: in_latency_window,
            write: operation == "write",
            read_preference: read_preference,
            suitable_servers: suitable_servers,
            servers: servers,
            ttype: ttype,
        })
    }
}
