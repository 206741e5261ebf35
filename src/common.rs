//! Read preferences and write concerns.
use bson::{bson, doc, Bson, Document};
use serde_derive::{Deserialize, Serialize};

use crate::error::{Error, Result};

use std::collections::BTreeMap;
use std::{error, fmt};
use std::str::FromStr;
use std::time::Duration;

/// The default window, above the fastest eligible server, within which
/// secondaries are considered equally near.
pub const DEFAULT_ACCEPTABLE_LATENCY_MS: u64 = 15;

/// A set of replica-set member labels. The order of pairs is irrelevant.
pub type TagSet = BTreeMap<String, String>;

/// Which class of replica-set member an operation may read from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ReadMode {
    Primary,
    PrimaryPreferred,
    Secondary,
    SecondaryPreferred,
    Nearest,
}

impl FromStr for ReadMode {
    type Err = Error;
    fn from_str(s: &str) -> Result<Self> {
        Ok(match &s.to_ascii_lowercase()[..] {
            "primary" => ReadMode::Primary,
            "primarypreferred" => ReadMode::PrimaryPreferred,
            "secondary" => ReadMode::Secondary,
            "secondarypreferred" => ReadMode::SecondaryPreferred,
            "nearest" => ReadMode::Nearest,
            _ => return Err(Error::ArgumentError(format!("Could not convert '{}' to ReadMode.", s))),
        })
    }
}

impl ReadMode {
    /// Whether secondaries can ever satisfy this mode.
    pub fn allows_secondaries(self) -> bool {
        self != ReadMode::Primary
    }
}

/// Routing rules for a read operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReadPreference {
    pub mode: ReadMode,
    /// Tried in order; the first tag set that matches any server wins.
    pub tag_sets: Vec<TagSet>,
    /// `None` means no latency window is applied.
    pub secondary_acceptable_latency: Option<Duration>,
}

impl Default for ReadPreference {
    fn default() -> Self {
        ReadPreference::new(ReadMode::Primary, None)
    }
}

impl ReadPreference {
    pub fn new(mode: ReadMode, tag_sets: Option<Vec<TagSet>>) -> ReadPreference {
        ReadPreference {
            mode: mode,
            tag_sets: tag_sets.unwrap_or_else(Vec::new),
            secondary_acceptable_latency: Some(Duration::from_millis(DEFAULT_ACCEPTABLE_LATENCY_MS)),
        }
    }

    pub fn primary() -> ReadPreference {
        ReadPreference::new(ReadMode::Primary, None)
    }

    pub fn with_acceptable_latency(mut self, latency: Option<Duration>) -> ReadPreference {
        self.secondary_acceptable_latency = latency;
        self
    }

    /// Parses connection-string `readPreferenceTags` values of the form
    /// `dc:ny,rack:1`. An empty value is the empty (match-all) tag set.
    pub fn parse_tag_set(value: &str) -> Result<TagSet> {
        let mut tags = TagSet::new();
        for pair in value.split(',').filter(|p| !p.is_empty()) {
            match pair.find(':') {
                Some(idx) => {
                    tags.insert(pair[..idx].to_owned(), pair[idx + 1..].to_owned());
                }
                None => {
                    return Err(Error::ArgumentError(format!(
                        "Read preference tag '{}' is not of the form key:value.",
                        pair
                    )))
                }
            }
        }
        Ok(tags)
    }
}

/// The `w` component of a write concern.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Acknowledgment {
    /// Wait for this many members (0 means unacknowledged).
    Nodes(i32),
    /// A named mode such as "majority" or a tag-set rule.
    Mode(String),
}

/// The acknowledgment level requested for a write.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WriteConcern {
    pub w: Acknowledgment,
    /// Used in conjunction with `w`. Propagation timeout in ms.
    pub w_timeout: i32,
    /// Block until write operations have been committed to the journal.
    pub journal: bool,
    /// Block until the server has synced all data files to disk.
    pub fsync: bool,
}

impl Default for WriteConcern {
    fn default() -> Self {
        WriteConcern::new()
    }
}

impl WriteConcern {
    pub fn new() -> WriteConcern {
        WriteConcern {
            w: Acknowledgment::Nodes(1),
            w_timeout: 0,
            journal: false,
            fsync: false,
        }
    }

    pub fn unacknowledged() -> WriteConcern {
        WriteConcern {
            w: Acknowledgment::Nodes(0),
            ..WriteConcern::new()
        }
    }

    /// False only for fire-and-forget writes.
    pub fn is_acknowledged(&self) -> bool {
        self.w != Acknowledgment::Nodes(0) || self.journal || self.fsync
    }

    pub fn to_bson(&self) -> Document {
        let w = match self.w {
            Acknowledgment::Nodes(n) => Bson::I32(n),
            Acknowledgment::Mode(ref mode) => Bson::String(mode.to_owned()),
        };

        let mut doc = doc! {
            "w": w,
            "wtimeout": self.w_timeout,
        };

        if self.journal {
            doc.insert("j", true);
        }
        if self.fsync {
            doc.insert("fsync", true);
        }
        doc
    }

    /// The acknowledgment-fetch command for this concern.
    pub fn get_last_error_command(&self) -> Document {
        let mut cmd = doc! { "getLastError": 1i32 };
        for (key, value) in self.to_bson() {
            cmd.insert(key, value);
        }
        cmd
    }
}

/// A failed write acknowledgment, carrying the server's response.
#[derive(Debug, Clone, PartialEq)]
pub struct WriteConcernError {
    pub code: i32,
    pub message: String,
    pub document: Document,
}

impl fmt::Display for WriteConcernError {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        write!(fmt, "write concern error ({}): {}", self.code, self.message)
    }
}

impl error::Error for WriteConcernError {}

fn read_i32(doc: &Document, key: &str) -> Option<i32> {
    match doc.get(key) {
        Some(&Bson::I32(v)) => Some(v),
        Some(&Bson::I64(v)) => Some(v as i32),
        Some(&Bson::FloatingPoint(v)) => Some(v as i32),
        _ => None,
    }
}

/// Inspects a `getLastError` (or write command) reply and raises any
/// server-reported write failure.
pub fn check_write_concern_reply(reply: &Document) -> Result<()> {
    if let Some(&Bson::Document(ref wc_err)) = reply.get("writeConcernError") {
        let message = match wc_err.get("errmsg") {
            Some(&Bson::String(ref s)) => s.to_owned(),
            _ => String::from("write concern was not satisfied"),
        };
        return Err(WriteConcernError {
            code: read_i32(wc_err, "code").unwrap_or(64),
            message: message,
            document: reply.clone(),
        }
        .into());
    }

    if let Some(&Bson::String(ref err)) = reply.get("err") {
        return Err(WriteConcernError {
            code: read_i32(reply, "code").unwrap_or(8),
            message: err.to_owned(),
            document: reply.clone(),
        }
        .into());
    }

    if let Some(&Bson::Boolean(true)) = reply.get("wtimeout") {
        return Err(WriteConcernError {
            code: read_i32(reply, "code").unwrap_or(64),
            message: String::from("timed out waiting for write concern"),
            document: reply.clone(),
        }
        .into());
    }

    Ok(())
}
