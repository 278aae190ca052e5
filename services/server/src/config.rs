//! Server chain configuration.
//!
//! INI, one section per chain. A chain either watches the filesystem
//! (`origin` pattern) or relays upstream announcements (`listen` topic);
//! exactly one of the two must be present, and `topic` always. Incomplete
//! sections are skipped with a warning so one bad chain never takes down
//! the rest.
//!
//! Free-form `connection_parameters__a__b = v` keys fold into a nested map
//! handed to the movers untouched.

use std::collections::BTreeMap;
use std::path::Path;

use configparser::ini::Ini;
use serde_json::{Map, Value};
use tracing::{info, warn};

use ferry_protocol::DEFAULT_REQ_TIMEOUT;

pub const DEFAULT_REMOVE_DELAY: f64 = 30.0;
pub const DEFAULT_WATCHDOG_TIMEOUT: f64 = 1.0;
pub const DEFAULT_INFO_MAX_COUNT: usize = 2256;

// ---------------------------------------------------------------------------
// Chain config
// ---------------------------------------------------------------------------

/// One chain, immutable once loaded. Reload compares whole values to decide
/// whether a running chain must be restarted.
#[derive(Debug, Clone, PartialEq)]
pub struct ChainConfig {
    pub name: String,
    /// Filename pattern to watch (`{field[:format]}` syntax).
    pub origin: Option<String>,
    /// Upstream topic to relay instead of watching.
    pub listen: Option<String>,
    /// Providers for a `listen` chain (`host:port`).
    pub addresses: Vec<String>,
    pub topic: String,
    pub request_port: Option<u16>,
    /// Advertised `host` part of the request address; defaults to the local
    /// hostname.
    pub request_address: Option<String>,
    pub station: String,
    /// Static metadata merged into every announcement.
    pub info: BTreeMap<String, Value>,
    pub compression: Option<String>,
    /// External decompressor for `xrit`.
    pub prog: Option<String>,
    pub working_directory: Option<String>,
    pub delete: bool,
    pub remove_delay: f64,
    pub req_timeout: f64,
    pub transfer_req_timeout: f64,
    /// Polling watcher instead of kernel notifications.
    pub use_polling: bool,
    pub watchdog_timeout: f64,
    pub info_max_count: usize,
    pub ssh_key_filename: Option<String>,
    pub connection_uptime: Option<u64>,
    pub connection_parameters: Map<String, Value>,
}

impl ChainConfig {
    /// Parameters handed to the movers: the nested
    /// `connection_parameters__*` map plus the flat ssh/uptime knobs.
    pub fn mover_params(&self) -> Map<String, Value> {
        let mut params = self.connection_parameters.clone();
        if let Some(key_file) = &self.ssh_key_filename {
            params.insert("ssh_key_filename".into(), Value::from(key_file.clone()));
        }
        if let Some(uptime) = self.connection_uptime {
            params.insert("connection_uptime".into(), Value::from(uptime));
        }
        params
    }

    /// `host:port` advertised in announcements so consumers know where to
    /// send `push`.
    pub fn advertised_request_address(&self) -> Option<String> {
        let port = self.request_port?;
        let host = self
            .request_address
            .clone()
            .unwrap_or_else(ferry_util::own_hostname);
        Some(format!("{host}:{port}"))
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("reading {path}: {reason}")]
    Read { path: String, reason: String },
    #[error("invalid file pattern in {chain}: {reason}")]
    BadPattern { chain: String, reason: String },
}

// ---------------------------------------------------------------------------
// Loading
// ---------------------------------------------------------------------------

/// Load every valid chain section from `path`.
pub fn read_config(path: &Path) -> Result<BTreeMap<String, ChainConfig>, ConfigError> {
    let mut ini = Ini::new_cs();
    let sections = ini.load(path).map_err(|reason| ConfigError::Read {
        path: path.display().to_string(),
        reason,
    })?;

    let mut chains = BTreeMap::new();
    for (name, section) in sections {
        match parse_section(&name, &section) {
            Some(chain) => {
                chains.insert(name, chain);
            }
            None => info!(chain = %name, "ignoring incomplete section"),
        }
    }
    Ok(chains)
}

type RawSection = std::collections::HashMap<String, Option<String>>;

fn parse_section(name: &str, section: &RawSection) -> Option<ChainConfig> {
    let get = |key: &str| -> Option<String> { section.get(key).and_then(|v| v.clone()) };

    let origin = get("origin");
    let listen = get("listen");
    if origin.is_none() && listen.is_none() {
        warn!(chain = %name, "incomplete section: add an 'origin' or 'listen' item");
        return None;
    }
    let Some(topic) = get("topic") else {
        warn!(chain = %name, "incomplete section: add a 'topic' item");
        return None;
    };

    if let Some(pattern) = &origin {
        if let Err(err) = ferry_util::Pattern::new(pattern) {
            warn!(chain = %name, error = %err, "invalid file pattern");
            return None;
        }
    }

    Some(ChainConfig {
        name: name.to_owned(),
        origin,
        listen,
        addresses: get("addresses")
            .map(|v| v.split_whitespace().map(str::to_owned).collect())
            .unwrap_or_default(),
        topic,
        request_port: get("request_port").and_then(|v| v.parse().ok()),
        request_address: get("request_address"),
        station: get("station").unwrap_or_else(|| "unknown".to_owned()),
        info: parse_info(get("info").as_deref().unwrap_or("")),
        compression: get("compression").filter(|v| !v.is_empty() && !is_falsy(v)),
        prog: get("prog"),
        working_directory: get("working_directory"),
        delete: get("delete").map(|v| is_truthy(&v)).unwrap_or(false),
        remove_delay: get("remove_delay")
            .and_then(|v| v.parse().ok())
            .unwrap_or(DEFAULT_REMOVE_DELAY),
        req_timeout: get("req_timeout")
            .and_then(|v| v.parse().ok())
            .unwrap_or(DEFAULT_REQ_TIMEOUT),
        transfer_req_timeout: get("transfer_req_timeout")
            .and_then(|v| v.parse().ok())
            .unwrap_or(10.0 * DEFAULT_REQ_TIMEOUT),
        use_polling: get("use_polling")
            .or_else(|| get("watchdog"))
            .map(|v| is_truthy(&v))
            .unwrap_or(false),
        watchdog_timeout: get("watchdog_timeout")
            .and_then(|v| v.parse().ok())
            .unwrap_or(DEFAULT_WATCHDOG_TIMEOUT),
        info_max_count: get("info_max_count")
            .and_then(|v| v.parse().ok())
            .unwrap_or(DEFAULT_INFO_MAX_COUNT),
        ssh_key_filename: get("ssh_key_filename"),
        connection_uptime: get("connection_uptime").and_then(|v| v.parse().ok()),
        connection_parameters: parse_connection_parameters(section),
    })
}

/// `info=sensors=seviri;stream=eumetcast` → static metadata map.
/// Comma-separated values become lists.
fn parse_info(raw: &str) -> BTreeMap<String, Value> {
    let mut out = BTreeMap::new();
    for item in raw.split(';') {
        let Some((key, value)) = item.split_once('=') else {
            continue;
        };
        let key = key.trim().to_owned();
        let value = value.trim();
        if value.contains(',') {
            out.insert(
                key,
                Value::Array(value.split(',').map(|v| Value::from(v.trim())).collect()),
            );
        } else {
            out.insert(key, Value::from(value));
        }
    }
    out
}

/// Fold `connection_parameters__a__b = v` keys into `{"a": {"b": v}}`.
fn parse_connection_parameters(section: &RawSection) -> Map<String, Value> {
    let mut out = Map::new();
    for (key, value) in section {
        let Some(rest) = key.strip_prefix("connection_parameters__") else {
            continue;
        };
        let Some(value) = value else { continue };
        let mut cursor = &mut out;
        let mut parts = rest.split("__").peekable();
        while let Some(part) = parts.next() {
            if parts.peek().is_none() {
                cursor.insert(part.to_owned(), coerce(value));
            } else {
                cursor = cursor
                    .entry(part.to_owned())
                    .or_insert_with(|| Value::Object(Map::new()))
                    .as_object_mut()
                    .expect("freshly inserted object");
            }
        }
    }
    out
}

fn coerce(value: &str) -> Value {
    if let Ok(b) = value.parse::<bool>() {
        return Value::from(b);
    }
    if let Ok(n) = value.parse::<i64>() {
        return Value::from(n);
    }
    if let Ok(f) = value.parse::<f64>() {
        return Value::from(f);
    }
    Value::from(value)
}

fn is_truthy(value: &str) -> bool {
    matches!(
        value.to_ascii_lowercase().as_str(),
        "1" | "yes" | "true" | "on"
    )
}

fn is_falsy(value: &str) -> bool {
    matches!(
        value.to_ascii_lowercase().as_str(),
        "" | "0" | "no" | "false" | "off"
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn load(ini: &str) -> BTreeMap<String, ChainConfig> {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(ini.as_bytes()).unwrap();
        read_config(file.path()).unwrap()
    }

    #[test]
    fn parses_a_watch_chain() {
        let chains = load(
            "[eumetcast_hrit]\n\
             origin = /in/H-{nominal_time:%Y%m%d%H%M}-__\n\
             topic = /HRIT/L0\n\
             request_port = 9094\n\
             info = sensors=seviri;stream=eumetcast\n\
             delete = True\n",
        );
        let chain = &chains["eumetcast_hrit"];
        assert_eq!(chain.topic, "/HRIT/L0");
        assert_eq!(chain.request_port, Some(9094));
        assert!(chain.delete);
        assert_eq!(chain.info["sensors"], "seviri");
        assert_eq!(chain.advertised_request_address().unwrap().split(':').nth(1), Some("9094"));
    }

    #[test]
    fn section_without_origin_or_listen_is_skipped() {
        let chains = load("[bad]\ntopic = /x\n");
        assert!(chains.is_empty());
    }

    #[test]
    fn section_without_topic_is_skipped() {
        let chains = load("[bad]\norigin = /in/{name}\n");
        assert!(chains.is_empty());
    }

    #[test]
    fn section_with_invalid_pattern_is_skipped() {
        let chains = load("[bad]\norigin = /in/{oops\ntopic = /x\n");
        assert!(chains.is_empty());
    }

    #[test]
    fn listen_chain_is_accepted() {
        let chains = load(
            "[relay]\n\
             listen = /upstream\n\
             topic = /local\n\
             addresses = srv1:9010 srv2:9010\n",
        );
        let chain = &chains["relay"];
        assert_eq!(chain.listen.as_deref(), Some("/upstream"));
        assert_eq!(chain.addresses.len(), 2);
    }

    #[test]
    fn timeouts_have_defaults() {
        let chains = load("[c]\norigin = /in/{name}\ntopic = /x\n");
        let chain = &chains["c"];
        assert_eq!(chain.req_timeout, DEFAULT_REQ_TIMEOUT);
        assert_eq!(chain.transfer_req_timeout, 10.0 * DEFAULT_REQ_TIMEOUT);
        assert_eq!(chain.remove_delay, DEFAULT_REMOVE_DELAY);
        assert_eq!(chain.info_max_count, DEFAULT_INFO_MAX_COUNT);
    }

    #[test]
    fn info_values_with_commas_become_lists() {
        let chains = load("[c]\norigin = /in/{name}\ntopic = /x\ninfo = sensors=a,b\n");
        assert_eq!(
            chains["c"].info["sensors"],
            serde_json::json!(["a", "b"])
        );
    }

    #[test]
    fn connection_parameters_nest() {
        let chains = load(
            "[c]\norigin = /in/{name}\ntopic = /x\n\
             connection_parameters__client_kwargs__endpoint_url = https://s3.example.com\n\
             connection_parameters__secret = VERYBIG\n",
        );
        let params = &chains["c"].connection_parameters;
        assert_eq!(
            params["client_kwargs"]["endpoint_url"],
            "https://s3.example.com"
        );
        assert_eq!(params["secret"], "VERYBIG");
    }

    #[test]
    fn mover_params_include_ssh_key() {
        let chains = load(
            "[c]\norigin = /in/{name}\ntopic = /x\nssh_key_filename = /home/u/.ssh/id\n",
        );
        let params = chains["c"].mover_params();
        assert_eq!(params["ssh_key_filename"], "/home/u/.ssh/id");
    }

    #[test]
    fn identical_sections_compare_equal() {
        let a = load("[c]\norigin = /in/{name}\ntopic = /x\n");
        let b = load("[c]\norigin = /in/{name}\ntopic = /x\n");
        assert_eq!(a["c"], b["c"]);
        let c = load("[c]\norigin = /in/{name}\ntopic = /y\n");
        assert_ne!(a["c"], c["c"]);
    }
}
