//! Client chain configuration.
//!
//! INI, one section per chain. A chain subscribes to `providers`, fetches
//! to `destination`, and optionally republishes on `publish_port`. Sections
//! missing `providers` or `destination` are skipped; a section with no
//! `topic` is only valid when the heartbeat subscription is on.
//!
//! Unrecognized keys whose value looks like `val1:alias1|val2:alias2` are
//! metadata aliases applied to republished messages.

use std::collections::BTreeMap;
use std::path::Path;

use configparser::ini::Ini;
use tracing::{info, warn};

use ferry_protocol::DEFAULT_REQ_TIMEOUT;

// ---------------------------------------------------------------------------
// Chain config
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
pub struct ClientConfig {
    pub name: String,
    /// `host:port`, optionally `host:port/topic` for a per-provider topic.
    pub providers: Vec<Provider>,
    /// Directory URL files are fetched to (e.g. `file:///out` or
    /// `scp://host/out`).
    pub destination: String,
    pub topic: Option<String>,
    pub publish_port: u16,
    pub heartbeat: bool,
    pub heartbeat_alarm_scale: f64,
    /// `user` or `user:pass` embedded in the real push request only.
    pub login: Option<String>,
    /// Local root the destination path is created under.
    pub ftp_root: String,
    /// Unpacker applied to fetched archives (`tar`).
    pub unpack: Option<String>,
    pub delete: bool,
    pub req_timeout: f64,
    pub transfer_req_timeout: f64,
    pub nameservers: Vec<String>,
    /// Per-key value aliases for republished metadata.
    pub aliases: BTreeMap<String, BTreeMap<String, String>>,
    /// Optional statistics file, one line per handled announcement.
    pub statistics_file: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Provider {
    /// `host:port`.
    pub address: String,
    /// Overrides the chain topic for this provider.
    pub topic: Option<String>,
}

impl Provider {
    fn parse(raw: &str) -> Provider {
        match raw.split_once('/') {
            Some((address, topic)) => Provider {
                address: address.to_owned(),
                topic: Some(format!("/{topic}")),
            },
            None => Provider {
                address: raw.to_owned(),
                topic: None,
            },
        }
    }

    /// Topics this provider's subscription covers.
    pub fn topics(&self, config: &ClientConfig) -> Vec<String> {
        let mut topics = Vec::new();
        if let Some(topic) = self.topic.clone().or_else(|| config.topic.clone()) {
            topics.push(topic);
        }
        if config.heartbeat {
            topics.push(ferry_protocol::SERVER_HEARTBEAT_TOPIC.to_owned());
        }
        topics
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("reading {path}: {reason}")]
    Read { path: String, reason: String },
}

// ---------------------------------------------------------------------------
// Loading
// ---------------------------------------------------------------------------

const KNOWN_KEYS: &[&str] = &[
    "providers",
    "destination",
    "topic",
    "publish_port",
    "heartbeat",
    "heartbeat_alarm_scale",
    "login",
    "ftp_root",
    "unpack",
    "compression",
    "delete",
    "req_timeout",
    "transfer_req_timeout",
    "nameservers",
    "working_directory",
    "statistics_file",
];

pub fn read_config(path: &Path) -> Result<BTreeMap<String, ClientConfig>, ConfigError> {
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

fn parse_section(name: &str, section: &RawSection) -> Option<ClientConfig> {
    let get = |key: &str| -> Option<String> { section.get(key).and_then(|v| v.clone()) };

    let Some(providers_raw) = get("providers") else {
        warn!(chain = %name, "incomplete section: add a 'providers' item");
        return None;
    };
    let Some(destination) = get("destination") else {
        warn!(chain = %name, "incomplete section: add a 'destination' item");
        return None;
    };

    let heartbeat = get("heartbeat").map(|v| is_truthy(&v)).unwrap_or(true);
    let topic = get("topic");
    if topic.is_none() && !heartbeat {
        warn!(chain = %name, "incomplete section: add a 'topic' item or enable heartbeat");
        return None;
    }

    let providers: Vec<Provider> = providers_raw
        .split_whitespace()
        .map(Provider::parse)
        .collect();
    if providers.is_empty() {
        warn!(chain = %name, "no providers listed");
        return None;
    }

    Some(ClientConfig {
        name: name.to_owned(),
        providers,
        destination,
        topic,
        publish_port: get("publish_port").and_then(|v| v.parse().ok()).unwrap_or(0),
        heartbeat,
        heartbeat_alarm_scale: get("heartbeat_alarm_scale")
            .and_then(|v| v.parse().ok())
            .unwrap_or(0.0),
        login: get("login"),
        ftp_root: get("ftp_root").unwrap_or_else(|| "/".to_owned()),
        unpack: get("unpack")
            .or_else(|| get("compression"))
            .filter(|v| !v.is_empty() && !is_falsy(v)),
        delete: get("delete").map(|v| is_truthy(&v)).unwrap_or(false),
        req_timeout: get("req_timeout")
            .and_then(|v| v.parse().ok())
            .unwrap_or(DEFAULT_REQ_TIMEOUT),
        transfer_req_timeout: get("transfer_req_timeout")
            .and_then(|v| v.parse().ok())
            .unwrap_or(10.0 * DEFAULT_REQ_TIMEOUT),
        nameservers: get("nameservers")
            .map(|v| v.split_whitespace().map(str::to_owned).collect())
            .unwrap_or_default(),
        aliases: parse_aliases(section),
        statistics_file: get("statistics_file"),
    })
}

/// `key = val1:alias1|val2:alias2` on any unrecognized key.
fn parse_aliases(section: &RawSection) -> BTreeMap<String, BTreeMap<String, String>> {
    let mut out = BTreeMap::new();
    for (key, value) in section {
        if KNOWN_KEYS.contains(&key.as_str()) {
            continue;
        }
        let Some(value) = value else { continue };
        if !value.contains(':') {
            continue;
        }
        let mapping: BTreeMap<String, String> = value
            .split('|')
            .filter_map(|pair| pair.split_once(':'))
            .map(|(from, to)| (from.trim().to_owned(), to.trim().to_owned()))
            .collect();
        if !mapping.is_empty() {
            out.insert(key.clone(), mapping);
        }
    }
    out
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

    fn load(ini: &str) -> BTreeMap<String, ClientConfig> {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(ini.as_bytes()).unwrap();
        read_config(file.path()).unwrap()
    }

    #[test]
    fn parses_a_fetch_chain() {
        let chains = load(
            "[hrit]\n\
             providers = srv1:9010 srv2:9010\n\
             destination = file:///out\n\
             topic = /HRIT\n\
             heartbeat_alarm_scale = 10\n",
        );
        let chain = &chains["hrit"];
        assert_eq!(chain.providers.len(), 2);
        assert_eq!(chain.providers[0].address, "srv1:9010");
        assert_eq!(chain.heartbeat_alarm_scale, 10.0);
        assert!(chain.heartbeat);
    }

    #[test]
    fn provider_topic_override() {
        let chains = load(
            "[c]\nproviders = srv1:9010/special\ndestination = file:///out\ntopic = /base\n",
        );
        let provider = &chains["c"].providers[0];
        assert_eq!(provider.address, "srv1:9010");
        assert_eq!(provider.topic.as_deref(), Some("/special"));
        let topics = provider.topics(&chains["c"]);
        assert_eq!(topics[0], "/special");
        assert!(topics.contains(&ferry_protocol::SERVER_HEARTBEAT_TOPIC.to_owned()));
    }

    #[test]
    fn missing_providers_or_destination_skips_section() {
        assert!(load("[c]\ndestination = file:///out\ntopic = /t\n").is_empty());
        assert!(load("[c]\nproviders = a:1\ntopic = /t\n").is_empty());
    }

    #[test]
    fn topicless_section_requires_heartbeat() {
        assert!(load("[c]\nproviders = a:1\ndestination = file:///o\nheartbeat = off\n").is_empty());
        assert!(!load("[c]\nproviders = a:1\ndestination = file:///o\n").is_empty());
    }

    #[test]
    fn alias_keys_are_collected() {
        let chains = load(
            "[c]\nproviders = a:1\ndestination = file:///o\ntopic = /t\n\
             variant = DR:direct_readout|EARS:ears\n",
        );
        let aliases = &chains["c"].aliases;
        assert_eq!(aliases["variant"]["DR"], "direct_readout");
        assert_eq!(aliases["variant"]["EARS"], "ears");
    }

    #[test]
    fn unpack_falls_back_to_compression_key() {
        let chains = load(
            "[c]\nproviders = a:1\ndestination = file:///o\ntopic = /t\ncompression = tar\n",
        );
        assert_eq!(chains["c"].unpack.as_deref(), Some("tar"));
    }
}
