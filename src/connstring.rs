//! Endpoints and `mongodb://` connection string parsing.
use serde_derive::{Deserialize, Serialize};

use crate::error::Error::ArgumentError;
use crate::error::Result;

use std::collections::BTreeMap;
use std::fmt;

pub const DEFAULT_PORT: u16 = 27017;
pub const URI_SCHEME: &str = "mongodb://";

/// The hostname and port of a server.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Host {
    pub host_name: String,
    pub port: u16,
}

impl Host {
    pub fn new<S: Into<String>>(host_name: S, port: u16) -> Host {
        Host {
            host_name: host_name.into().to_ascii_lowercase(),
            port: port,
        }
    }
}

impl fmt::Display for Host {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        if self.host_name.contains(':') {
            write!(fmt, "[{}]:{}", self.host_name, self.port)
        } else {
            write!(fmt, "{}:{}", self.host_name, self.port)
        }
    }
}

/// Connection options and read preference tags, in the order given.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConnectionOptions {
    /// Option keys are stored lowercased.
    pub options: BTreeMap<String, String>,
    pub read_pref_tags: Vec<String>,
}

impl ConnectionOptions {
    /// Case-insensitive option lookup.
    pub fn get(&self, key: &str) -> Option<&String> {
        self.options.get(&key.to_ascii_lowercase())
    }
}

/// A parsed connection string: the seed list plus options.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionString {
    pub hosts: Vec<Host>,
    pub user: Option<String>,
    pub password: Option<String>,
    pub database: Option<String>,
    pub options: ConnectionOptions,
}

impl ConnectionString {
    /// A connection string for a single host and no options.
    pub fn new(host_name: &str, port: u16) -> ConnectionString {
        ConnectionString {
            hosts: vec![Host::new(host_name, port)],
            user: None,
            password: None,
            database: None,
            options: ConnectionOptions::default(),
        }
    }
}

/// Parses `mongodb://[user:password@]host1[:port1][,...hostN[:portN]][/[database][?options]]`.
pub fn parse(address: &str) -> Result<ConnectionString> {
    if !address.starts_with(URI_SCHEME) {
        return Err(ArgumentError(String::from(
            "MongoDB connection string must start with 'mongodb://'.",
        )));
    }

    let addr = &address[URI_SCHEME.len()..];
    let (host_str, path_str) = partition(addr, "/");

    if path_str.is_empty() && host_str.contains('?') {
        return Err(ArgumentError(String::from(
            "A '/' is required between the host list and any options.",
        )));
    }

    let (user, password, hosts) = if host_str.contains('@') {
        let (user_info, host_string) = rpartition(host_str, "@");
        let (u, p) = parse_user_info(user_info)?;
        (Some(u.to_owned()), Some(p.to_owned()), split_hosts(host_string)?)
    } else {
        (None, None, split_hosts(host_str)?)
    };

    let (database, opts) = if path_str.starts_with('?') {
        (None, &path_str[1..])
    } else {
        let (dbase, opts) = partition(path_str, "?");
        let database = if dbase.is_empty() {
            None
        } else {
            Some(dbase.to_owned())
        };
        (database, opts)
    };

    let options = if opts.is_empty() {
        ConnectionOptions::default()
    } else {
        split_options(opts)?
    };

    Ok(ConnectionString {
        hosts: hosts,
        user: user,
        password: password,
        database: database,
        options: options,
    })
}

// Parse user information of the form user:password
fn parse_user_info(user_info: &str) -> Result<(&str, &str)> {
    let (user, password) = rpartition(user_info, ":");
    if user_info.contains('@') || user.contains(':') {
        return Err(ArgumentError(String::from(
            "':' or '@' characters in a username or password must be escaped according to RFC 2396.",
        )));
    }
    if user.is_empty() {
        return Err(ArgumentError(String::from("The empty string is not a valid username.")));
    }
    Ok((user, password))
}

fn parse_port(port: &str) -> Result<u16> {
    port.parse::<u16>()
        .map_err(|_| ArgumentError(format!("Port '{}' must be an unsigned 16-bit integer.", port)))
}

// Parses an IPv6 literal host of the form [host] or [host]:port
fn parse_ipv6_literal_host(entity: &str) -> Result<Host> {
    match entity.find(']') {
        Some(end) => {
            let port = match entity[end + 1..].strip_prefix(":") {
                Some(port) => parse_port(port)?,
                None if end + 1 == entity.len() => DEFAULT_PORT,
                None => {
                    return Err(ArgumentError(format!(
                        "Unexpected characters after IPv6 literal in '{}'.",
                        entity
                    )))
                }
            };
            Ok(Host::new(&entity[1..end], port))
        }
        None => Err(ArgumentError(String::from(
            "An IPv6 address must be enclosed in '[' and ']' according to RFC 2732.",
        ))),
    }
}

/// Parses a host entity of the form host or host:port. Host names are lowercased.
pub fn parse_host(entity: &str) -> Result<Host> {
    if entity.starts_with('[') {
        parse_ipv6_literal_host(entity)
    } else if entity.contains(':') {
        let (host, port) = partition(entity, ":");
        if port.contains(':') {
            return Err(ArgumentError(String::from(
                "Reserved characters such as ':' must be escaped according to RFC 2396. \
                 An IPv6 address literal must be enclosed in '[' and ']' according to RFC 2732.",
            )));
        }
        Ok(Host::new(host, parse_port(port)?))
    } else {
        Ok(Host::new(entity, DEFAULT_PORT))
    }
}

// Splits and parses comma-separated hosts.
fn split_hosts(host_str: &str) -> Result<Vec<Host>> {
    let mut hosts = Vec::new();
    for entity in host_str.split(',') {
        if entity.is_empty() {
            return Err(ArgumentError(String::from("Empty host, or extra comma in host list.")));
        }
        hosts.push(parse_host(entity)?);
    }
    Ok(hosts)
}

// Determines the option delimiter and collects options and read preference tags.
fn split_options(opts: &str) -> Result<ConnectionOptions> {
    let delim = match (opts.contains('&'), opts.contains(';')) {
        (true, true) => {
            return Err(ArgumentError(String::from(
                "Cannot mix '&' and ';' for option separators.",
            )))
        }
        (true, false) => '&',
        (false, true) => ';',
        (false, false) => {
            if !opts.contains('=') {
                return Err(ArgumentError(String::from(
                    "InvalidURI: MongoDB URI options are key=value pairs.",
                )));
            }
            '&'
        }
    };

    let mut options = ConnectionOptions::default();
    for opt in opts.split(delim).filter(|o| !o.is_empty()) {
        let (key, val) = partition(opt, "=");
        let key = key.to_ascii_lowercase();
        if key == "readpreferencetags" {
            options.read_pref_tags.push(val.to_owned());
        } else {
            options.options.insert(key, val.to_owned());
        }
    }

    Ok(options)
}

// Partitions a string around the left-most occurrence of the separator, if it exists.
fn partition<'a>(string: &'a str, sep: &str) -> (&'a str, &'a str) {
    match string.find(sep) {
        Some(idx) => (&string[..idx], &string[idx + sep.len()..]),
        None => (string, ""),
    }
}

// Partitions a string around the right-most occurrence of the separator, if it exists.
fn rpartition<'a>(string: &'a str, sep: &str) -> (&'a str, &'a str) {
    match string.rfind(sep) {
        Some(idx) => (&string[..idx], &string[idx + sep.len()..]),
        None => (string, ""),
    }
}
