// ferry-protocol: Bus message types and wire codec.
//
// Every message on the fabric (announcements, transfer requests, replies,
// heartbeats) is one line of text: a fixed header followed by a JSON body.
// Subscribers filter on the encoded prefix, so the subject doubles as the
// pub/sub topic.

use chrono::{DateTime, SecondsFormat, Utc};
use serde_json::{Map, Value};

pub mod walk;

// ---------------------------------------------------------------------------
// Shared constants
// ---------------------------------------------------------------------------

/// Magic prefix of every encoded message.
pub const WIRE_MAGIC: &str = "fileferry://";

/// Protocol version token carried in the header.
pub const WIRE_VERSION: &str = "v1";

/// Topic on which servers publish their liveness beats.
pub const SERVER_HEARTBEAT_TOPIC: &str = "/heartbeat/ferry-server";

/// Topic on which deleters announce removed files.
pub const DELETION_TOPIC: &str = "/deletion";

/// Default request/reply timeout in seconds. Transfer requests default to
/// ten times this.
pub const DEFAULT_REQ_TIMEOUT: f64 = 1.0;

/// Default seconds between heartbeats when the beat carries no
/// `min_interval` of its own.
pub const DEFAULT_MIN_INTERVAL: f64 = 30.0;

// ---------------------------------------------------------------------------
// Message type
// ---------------------------------------------------------------------------

/// All message kinds used by the fabric.
///
/// | Kind         | Direction            | Meaning                          |
/// |--------------|----------------------|----------------------------------|
/// | `file`       | announce / reply     | a single file                    |
/// | `dataset`    | announce / reply     | ordered list under `dataset`     |
/// | `collection` | announce / reply     | list of datasets                 |
/// | `push`       | request              | fetch to `destination`           |
/// | `ack`        | request / reply      | schedule delete, no transfer     |
/// | `ping`/`pong`| request / reply      | liveness                         |
/// | `info`       | request / reply      | file-cache inventory             |
/// | `err`        | reply                | request failed                   |
/// | `beat`       | publish              | server heartbeat                 |
/// | `del`        | publish              | file removed                     |
/// | `unknown`    | reply                | unrecognized request             |
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageType {
    File,
    Dataset,
    Collection,
    Push,
    Ack,
    Ping,
    Pong,
    Info,
    Err,
    Beat,
    Del,
    Unknown,
}

impl MessageType {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageType::File => "file",
            MessageType::Dataset => "dataset",
            MessageType::Collection => "collection",
            MessageType::Push => "push",
            MessageType::Ack => "ack",
            MessageType::Ping => "ping",
            MessageType::Pong => "pong",
            MessageType::Info => "info",
            MessageType::Err => "err",
            MessageType::Beat => "beat",
            MessageType::Del => "del",
            MessageType::Unknown => "unknown",
        }
    }

    /// True for the three kinds that carry transferable file entries.
    pub fn is_file_like(&self) -> bool {
        matches!(
            self,
            MessageType::File | MessageType::Dataset | MessageType::Collection
        )
    }
}

impl std::str::FromStr for MessageType {
    type Err = MessageError;

    fn from_str(s: &str) -> Result<Self, MessageError> {
        Ok(match s {
            "file" => MessageType::File,
            "dataset" => MessageType::Dataset,
            "collection" => MessageType::Collection,
            "push" => MessageType::Push,
            "ack" => MessageType::Ack,
            "ping" => MessageType::Ping,
            "pong" => MessageType::Pong,
            "info" => MessageType::Info,
            "err" => MessageType::Err,
            "beat" => MessageType::Beat,
            "del" => MessageType::Del,
            "unknown" => MessageType::Unknown,
            other => return Err(MessageError::UnknownType(other.to_owned())),
        })
    }
}

impl std::fmt::Display for MessageType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Message
// ---------------------------------------------------------------------------

/// A topic-addressed record on the bus.
///
/// `data` is a JSON object for every core type. File entries within it carry
/// `uid` (basename, unique within the message) and `uri` (absolute locator).
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    pub subject: String,
    pub mtype: MessageType,
    pub sender: String,
    pub timestamp: DateTime<Utc>,
    pub data: Value,
}

impl Message {
    /// Build a message stamped now, with the sender derived from the local
    /// hostname.
    pub fn new(subject: &str, mtype: MessageType, data: Value) -> Self {
        Message {
            subject: subject.to_owned(),
            mtype,
            sender: default_sender(),
            timestamp: Utc::now(),
            data,
        }
    }

    /// Shorthand for a message with an empty object body.
    pub fn empty(subject: &str, mtype: MessageType) -> Self {
        Message::new(subject, mtype, Value::Object(Map::new()))
    }

    /// The body as an object, or an empty map for non-object bodies.
    pub fn data_map(&self) -> Map<String, Value> {
        match &self.data {
            Value::Object(map) => map.clone(),
            _ => Map::new(),
        }
    }

    /// A string field of the body, if present.
    pub fn data_str(&self, key: &str) -> Option<&str> {
        self.data.get(key).and_then(Value::as_str)
    }

    /// Encode to the single-line wire form.
    ///
    /// `fileferry://<subject> <type> <sender> <timestamp> v1 application/json <body>`
    pub fn encode(&self) -> String {
        format!(
            "{}{} {} {} {} {} application/json {}",
            WIRE_MAGIC,
            self.subject,
            self.mtype,
            self.sender,
            self.timestamp.to_rfc3339_opts(SecondsFormat::Micros, true),
            WIRE_VERSION,
            self.data
        )
    }

    /// Parse the wire form back into a message.
    pub fn parse(raw: &str) -> Result<Self, MessageError> {
        let line = raw.trim_end_matches(['\r', '\n']);
        let rest = line
            .strip_prefix(WIRE_MAGIC)
            .ok_or_else(|| MessageError::BadHeader(truncate(line)))?;

        let mut parts = rest.splitn(7, ' ');
        let subject = parts.next().filter(|s| !s.is_empty());
        let mtype = parts.next();
        let sender = parts.next();
        let timestamp = parts.next();
        let version = parts.next();
        let mime = parts.next();
        let body = parts.next();

        let (subject, mtype, sender, timestamp, version, _mime, body) =
            match (subject, mtype, sender, timestamp, version, mime, body) {
                (Some(a), Some(b), Some(c), Some(d), Some(e), Some(f), Some(g)) => {
                    (a, b, c, d, e, f, g)
                }
                _ => return Err(MessageError::BadHeader(truncate(line))),
            };

        if version != WIRE_VERSION {
            return Err(MessageError::BadVersion(version.to_owned()));
        }

        let timestamp = DateTime::parse_from_rfc3339(timestamp)
            .map_err(|e| MessageError::BadTimestamp(e.to_string()))?
            .with_timezone(&Utc);
        let data: Value = serde_json::from_str(body)?;

        Ok(Message {
            subject: subject.to_owned(),
            mtype: mtype.parse()?,
            sender: sender.to_owned(),
            timestamp,
            data,
        })
    }

    /// The `min_interval` of a `beat` body, if any.
    pub fn min_interval(&self) -> Option<f64> {
        self.data.get("min_interval").and_then(Value::as_f64)
    }
}

impl std::fmt::Display for Message {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.encode())
    }
}

/// The reply kind mirroring a request's data shape: `file` when the body has
/// a `uri`, `dataset`/`collection` for those keys, otherwise the request's
/// own type.
pub fn reply_shape(msg: &Message) -> MessageType {
    if msg.data.get("uri").is_some() {
        MessageType::File
    } else if msg.data.get("dataset").is_some() {
        MessageType::Dataset
    } else if msg.data.get("collection").is_some() {
        MessageType::Collection
    } else {
        msg.mtype
    }
}

fn default_sender() -> String {
    let host = gethostname::gethostname();
    format!("fileferry@{}", host.to_string_lossy())
}

fn truncate(line: &str) -> String {
    const LIMIT: usize = 120;
    match line.char_indices().nth(LIMIT) {
        Some((idx, _)) => format!("{}...", &line[..idx]),
        None => line.to_owned(),
    }
}

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum MessageError {
    #[error("malformed header: {0}")]
    BadHeader(String),
    #[error("unknown message type: {0}")]
    UnknownType(String),
    #[error("unsupported version: {0}")]
    BadVersion(String),
    #[error("bad timestamp: {0}")]
    BadTimestamp(String),
    #[error("bad body: {0}")]
    BadBody(#[from] serde_json::Error),
}
