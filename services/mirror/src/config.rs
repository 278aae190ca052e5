//! Mirror chain configuration: a client-side subscription fused with a
//! server-side request port.

use std::collections::BTreeMap;
use std::path::Path;

use configparser::ini::Ini;
use tracing::{info, warn};

use ferry_protocol::DEFAULT_REQ_TIMEOUT;

#[derive(Debug, Clone, PartialEq)]
pub struct MirrorConfig {
    pub name: String,
    /// Upstream producers (`host:port`, optionally `host:port/topic`).
    pub providers: Vec<client::Provider>,
    /// Topic subscribed upstream.
    pub client_topic: Option<String>,
    /// Topic the mirror re-publishes on.
    pub topic: String,
    pub request_port: u16,
    pub request_address: Option<String>,
    pub station: String,
    /// Where fetched copies land locally.
    pub destination: String,
    pub login: Option<String>,
    pub ftp_root: String,
    /// Seconds to hold a re-publish back.
    pub delay: f64,
    pub heartbeat: bool,
    pub heartbeat_alarm_scale: f64,
    pub delete: bool,
    pub remove_delay: f64,
    pub req_timeout: f64,
    pub transfer_req_timeout: f64,
    pub info_max_count: usize,
}

impl MirrorConfig {
    pub fn advertised_request_address(&self) -> String {
        let host = self
            .request_address
            .clone()
            .unwrap_or_else(ferry_util::own_hostname);
        format!("{host}:{}", self.request_port)
    }

    /// The client-side view used for fetching from upstream producers.
    pub fn as_client_config(&self) -> client::ClientConfig {
        client::ClientConfig {
            name: self.name.clone(),
            providers: self.providers.clone(),
            destination: self.destination.clone(),
            topic: self.client_topic.clone(),
            publish_port: 0,
            heartbeat: self.heartbeat,
            heartbeat_alarm_scale: self.heartbeat_alarm_scale,
            login: self.login.clone(),
            ftp_root: self.ftp_root.clone(),
            unpack: None,
            delete: self.delete,
            req_timeout: self.req_timeout,
            transfer_req_timeout: self.transfer_req_timeout,
            nameservers: vec![],
            aliases: BTreeMap::new(),
            statistics_file: None,
        }
    }

    /// The server-side view used for the request port.
    pub fn as_server_config(&self) -> server::ChainConfig {
        server::ChainConfig {
            name: self.name.clone(),
            origin: None,
            listen: None,
            addresses: vec![],
            topic: self.topic.clone(),
            request_port: Some(self.request_port),
            request_address: self.request_address.clone(),
            station: self.station.clone(),
            info: BTreeMap::new(),
            compression: None,
            prog: None,
            working_directory: None,
            delete: self.delete,
            remove_delay: self.remove_delay,
            req_timeout: self.req_timeout,
            transfer_req_timeout: self.transfer_req_timeout,
            use_polling: false,
            watchdog_timeout: 1.0,
            info_max_count: self.info_max_count,
            ssh_key_filename: None,
            connection_uptime: None,
            connection_parameters: serde_json::Map::new(),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("reading {path}: {reason}")]
    Read { path: String, reason: String },
}

pub fn read_config(path: &Path) -> Result<BTreeMap<String, MirrorConfig>, ConfigError> {
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

fn parse_section(name: &str, section: &RawSection) -> Option<MirrorConfig> {
    let get = |key: &str| -> Option<String> { section.get(key).and_then(|v| v.clone()) };

    let Some(providers_raw) = get("providers") else {
        warn!(chain = %name, "incomplete section: add a 'providers' item");
        return None;
    };
    let Some(topic) = get("topic") else {
        warn!(chain = %name, "incomplete section: add a 'topic' item");
        return None;
    };
    let Some(request_port) = get("request_port").and_then(|v| v.parse().ok()) else {
        warn!(chain = %name, "incomplete section: add a 'request_port' item");
        return None;
    };
    let Some(destination) = get("destination") else {
        warn!(chain = %name, "incomplete section: add a 'destination' item");
        return None;
    };

    let providers: Vec<client::Provider> = providers_raw
        .split_whitespace()
        .map(|raw| match raw.split_once('/') {
            Some((address, topic)) => client::Provider {
                address: address.to_owned(),
                topic: Some(format!("/{topic}")),
            },
            None => client::Provider {
                address: raw.to_owned(),
                topic: None,
            },
        })
        .collect();

    Some(MirrorConfig {
        name: name.to_owned(),
        providers,
        client_topic: get("client_topic"),
        topic,
        request_port,
        request_address: get("request_address"),
        station: get("station").unwrap_or_else(|| "unknown".to_owned()),
        destination,
        login: get("login"),
        ftp_root: get("ftp_root").unwrap_or_else(|| "/".to_owned()),
        delay: get("delay").and_then(|v| v.parse().ok()).unwrap_or(0.0),
        heartbeat: get("heartbeat").map(|v| is_truthy(&v)).unwrap_or(true),
        heartbeat_alarm_scale: get("heartbeat_alarm_scale")
            .and_then(|v| v.parse().ok())
            .unwrap_or(0.0),
        delete: get("delete").map(|v| is_truthy(&v)).unwrap_or(false),
        remove_delay: get("remove_delay").and_then(|v| v.parse().ok()).unwrap_or(30.0),
        req_timeout: get("req_timeout")
            .and_then(|v| v.parse().ok())
            .unwrap_or(DEFAULT_REQ_TIMEOUT),
        transfer_req_timeout: get("transfer_req_timeout")
            .and_then(|v| v.parse().ok())
            .unwrap_or(10.0 * DEFAULT_REQ_TIMEOUT),
        info_max_count: get("info_max_count").and_then(|v| v.parse().ok()).unwrap_or(2256),
    })
}

fn is_truthy(value: &str) -> bool {
    matches!(
        value.to_ascii_lowercase().as_str(),
        "1" | "yes" | "true" | "on"
    )
}
