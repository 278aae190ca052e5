//! Dispatcher configuration.
//!
//! YAML, one top-level key per receiving client:
//!
//! ```yaml
//! target1:
//!   host: ftp://ftp.target1.com
//!   connection_parameters:
//!     connection_uptime: 60
//!   filepattern: '{platform_name}_{start_time}.{format}'
//!   directory: /input_data/{sensor}
//!   subscribe_addresses:
//!     - tcp://127.0.0.1:40000
//!   publish_topic: "/new/topic/{platform_name}"
//!   aliases:
//!     product:
//!       natural_color: dnc
//!       overview: ovw
//!   dispatch_configs:
//!     - topics:
//!         - /level2/viirs
//!         - /level2/avhrr
//!       conditions:
//!         - product: [green_snow, true_color]
//!           sensor: viirs
//!         - product: [green_snow, overview]
//!           sensor: avhrr
//!           except:
//!             platform_name: NOAA-15
//!     - topics:
//!         - /level3/cloudtype
//!       directory: /input/cloud_products
//!       conditions:
//!         - area: omerc_bb
//!           daylight: '<30'
//!           coverage: '>50'
//! ```
//!
//! `host`, `directory` and `filepattern` may be overridden per dispatch
//! item. Conditions are free-form maps checked by the predicate engine.

use std::collections::BTreeMap;
use std::path::Path;

use serde::Deserialize;
use serde_json::Value;

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ClientTarget {
    pub host: String,
    #[serde(default)]
    pub filepattern: Option<String>,
    #[serde(default)]
    pub directory: Option<String>,
    #[serde(default)]
    pub connection_parameters: Option<Value>,
    #[serde(default)]
    pub aliases: BTreeMap<String, Value>,
    #[serde(default)]
    pub publish_topic: Option<String>,
    #[serde(default)]
    pub subscribe_addresses: Vec<String>,
    #[serde(default)]
    pub dispatch_configs: Vec<DispatchItem>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct DispatchItem {
    pub topics: Vec<String>,
    #[serde(default)]
    pub conditions: Option<Vec<Value>>,
    #[serde(default)]
    pub host: Option<String>,
    #[serde(default)]
    pub filepattern: Option<String>,
    #[serde(default)]
    pub directory: Option<String>,
    #[serde(default)]
    pub connection_parameters: Option<Value>,
}

pub type DispatchRoot = BTreeMap<String, ClientTarget>;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("reading {path}: {reason}")]
    Read { path: String, reason: String },
    #[error("invalid YAML in {path}: {reason}")]
    Parse { path: String, reason: String },
}

pub fn read_config(path: &Path) -> Result<DispatchRoot, ConfigError> {
    let content = std::fs::read_to_string(path).map_err(|e| ConfigError::Read {
        path: path.display().to_string(),
        reason: e.to_string(),
    })?;
    parse_config(&content).map_err(|reason| ConfigError::Parse {
        path: path.display().to_string(),
        reason,
    })
}

pub fn parse_config(content: &str) -> Result<DispatchRoot, String> {
    serde_yaml::from_str(content).map_err(|e| e.to_string())
}

/// Every topic any client listens to.
pub fn all_topics(root: &DispatchRoot) -> Vec<String> {
    let mut topics: Vec<String> = root
        .values()
        .flat_map(|client| client.dispatch_configs.iter())
        .flat_map(|item| item.topics.iter().cloned())
        .collect();
    topics.sort();
    topics.dedup();
    topics
}

/// Every subscribe address any client lists.
pub fn all_addresses(root: &DispatchRoot) -> Vec<String> {
    let mut addresses: Vec<String> = root
        .values()
        .flat_map(|client| client.subscribe_addresses.iter().cloned())
        .collect();
    addresses.sort();
    addresses.dedup();
    addresses
}

#[cfg(test)]
mod tests {
    use super::*;

    pub(crate) const EXAMPLE: &str = r#"
target1:
  host: ftp://ftp.target1.com
  connection_parameters:
    connection_uptime: 60
  filepattern: '{platform_name}_{product}.{format}'
  directory: /input_data/{sensor}
  subscribe_addresses:
    - tcp://127.0.0.1:40000
  publish_topic: "/dispatched/{product}"
  aliases:
    product:
      natural_color: dnc
  dispatch_configs:
    - topics:
        - /level2/viirs
        - /level2/avhrr
      conditions:
        - product: [green_snow, true_color]
          sensor: viirs
        - product: [green_snow, overview]
          sensor: avhrr
          except:
            platform_name: NOAA-15
    - topics:
        - /level3/cloudtype
      directory: /input/cloud_products
      conditions:
        - area: omerc_bb
          daylight: '<30'
          coverage: '>50'
"#;

    #[test]
    fn parses_the_reference_layout() {
        let root = parse_config(EXAMPLE).unwrap();
        let client = &root["target1"];
        assert_eq!(client.host, "ftp://ftp.target1.com");
        assert_eq!(client.dispatch_configs.len(), 2);
        assert_eq!(
            client.dispatch_configs[1].directory.as_deref(),
            Some("/input/cloud_products")
        );
        assert_eq!(client.aliases["product"]["natural_color"], "dnc");
    }

    #[test]
    fn collects_topics_and_addresses() {
        let root = parse_config(EXAMPLE).unwrap();
        assert_eq!(
            all_topics(&root),
            vec!["/level2/avhrr", "/level2/viirs", "/level3/cloudtype"]
        );
        assert_eq!(all_addresses(&root), vec!["tcp://127.0.0.1:40000"]);
    }

    #[test]
    fn broken_yaml_is_an_error() {
        assert!(parse_config("target1:\n  host: [unclosed").is_err());
    }
}
