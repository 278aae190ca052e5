//! Destination synthesis and the dispatch loop.

use std::collections::BTreeMap;
use std::path::Path;

use serde_json::{json, Map, Value};
use tracing::{debug, error, info, warn};
use url::Url;

use ferry_movers::{MoverRegistry, Params};
use ferry_protocol::{Message, MessageType};
use ferry_util::{clean_url_str, compose};

use crate::conditions::check_conditions;
use crate::config::{ClientTarget, DispatchItem, DispatchRoot};

/// One resolved destination for one client.
#[derive(Debug, Clone, PartialEq)]
pub struct Destination {
    pub url: String,
    pub connection_parameters: Params,
    pub client: String,
}

// ---------------------------------------------------------------------------
// Destination synthesis
// ---------------------------------------------------------------------------

/// All destinations a message matches, across all clients.
pub fn get_destinations(root: &DispatchRoot, msg: &Message) -> Vec<Destination> {
    let mut destinations = Vec::new();
    for (client, target) in root {
        for item in &target.dispatch_configs {
            if !item
                .topics
                .iter()
                .any(|topic| msg.subject.starts_with(topic.as_str()))
            {
                continue;
            }
            if !check_conditions(&msg.data, item) {
                continue;
            }
            match create_dest_url(msg, client, target, item) {
                Ok(destination) => destinations.push(destination),
                Err(err) => {
                    warn!(client = %client, error = %err, "cannot build destination");
                }
            }
        }
    }
    destinations
}

fn create_dest_url(
    msg: &Message,
    client: &str,
    target: &ClientTarget,
    item: &DispatchItem,
) -> Result<Destination, String> {
    let host = item.host.as_deref().unwrap_or(&target.host);
    let directory = item
        .directory
        .as_deref()
        .or(target.directory.as_deref())
        .ok_or_else(|| "no directory configured".to_owned())?;
    let source_name = source_basename(msg);
    let filepattern = item
        .filepattern
        .as_deref()
        .or(target.filepattern.as_deref())
        .map(str::to_owned)
        .or(source_name)
        .ok_or_else(|| "no filepattern and no source name".to_owned())?;

    let mda = augment_metadata(&msg.data, &target.aliases);
    let path_template = format!("{}/{}", directory.trim_end_matches('/'), filepattern);
    let path = compose(&path_template, &mda).map_err(|e| e.to_string())?;

    let url = match Url::parse(host) {
        Ok(base) => {
            let mut url = base;
            url.set_path(&path);
            url.to_string()
        }
        Err(_) if host.is_empty() => format!("file://{path}"),
        Err(err) => return Err(format!("bad host '{host}': {err}")),
    };

    let connection_parameters = item
        .connection_parameters
        .as_ref()
        .or(target.connection_parameters.as_ref())
        .and_then(Value::as_object)
        .cloned()
        .unwrap_or_default();

    Ok(Destination {
        url,
        connection_parameters,
        client: client.to_owned(),
    })
}

fn source_basename(msg: &Message) -> Option<String> {
    let uri = msg.data_str("uri")?;
    let path = match Url::parse(uri) {
        Ok(url) => url.path().to_owned(),
        Err(_) => uri.to_owned(),
    };
    Path::new(&path)
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
}

/// Message metadata plus the client's aliases. An alias map may carry
/// `_alias_name` to write the aliased value under a new key.
fn augment_metadata(data: &Value, aliases: &BTreeMap<String, Value>) -> Map<String, Value> {
    let mut mda = data.as_object().cloned().unwrap_or_default();
    for (key, alias) in aliases {
        let entries: Vec<&Value> = match alias {
            Value::Array(list) => list.iter().collect(),
            single => vec![single],
        };
        for entry in entries {
            let Some(entry) = entry.as_object() else {
                continue;
            };
            let new_key = entry
                .get("_alias_name")
                .and_then(Value::as_str)
                .unwrap_or(key);
            let Some(value) = data.get(key) else {
                continue;
            };
            let aliased = value
                .as_str()
                .and_then(|v| entry.get(v))
                .cloned()
                .unwrap_or_else(|| value.clone());
            mda.insert(new_key.to_owned(), aliased);
        }
    }
    mda
}

// ---------------------------------------------------------------------------
// Dispatch
// ---------------------------------------------------------------------------

/// Copy `source` to every destination. Returns per-client success.
pub async fn dispatch(
    movers: &MoverRegistry,
    source: &Path,
    destinations: &[Destination],
) -> BTreeMap<String, bool> {
    let mut success = BTreeMap::new();
    if !source.exists() {
        error!(source = %source.display(), "source file for dispatching does not exist");
        for destination in destinations {
            success.insert(destination.client.clone(), false);
        }
        return success;
    }

    for destination in destinations {
        if success.contains_key(&destination.client) {
            warn!(client = %destination.client, "only one destination allowed per client, skipping");
            continue;
        }
        let ok = match Url::parse(&destination.url) {
            Ok(url) => {
                debug!(source = %source.display(), dest = %clean_url_str(&destination.url), "dispatching");
                movers
                    .move_file_to(source, &url, &destination.connection_parameters, &[])
                    .await
                    .map(|_| true)
                    .unwrap_or_else(|err| {
                        error!(
                            dest = %clean_url_str(&destination.url),
                            error = %err,
                            "could not dispatch"
                        );
                        false
                    })
            }
            Err(err) => {
                error!(dest = %clean_url_str(&destination.url), error = %err, "bad destination url");
                false
            }
        };
        success.insert(destination.client.clone(), ok);
    }
    if success.values().all(|ok| *ok) && !success.is_empty() {
        info!("dispatched all files");
    }
    success
}

/// Handle one announcement end to end: match, refuse non-local sources,
/// transfer, publish per successful destination.
pub async fn handle_message(
    root: &DispatchRoot,
    movers: &MoverRegistry,
    publisher: &Option<ferry_bus::PublisherHandle>,
    msg: &Message,
) {
    if msg.mtype != MessageType::File {
        return;
    }
    let destinations = get_destinations(root, msg);
    if destinations.is_empty() {
        return;
    }

    let Some(uri) = msg.data_str("uri") else {
        warn!(subject = %msg.subject, "file message without uri");
        return;
    };
    let source = match Url::parse(uri) {
        Ok(url) => {
            // The dispatcher never proxies: the source must be on this host.
            if !ferry_util::is_local(&url) {
                error!(uri = %clean_url_str(uri), "uri points to another host, refusing to dispatch");
                return;
            }
            std::path::PathBuf::from(url.path())
        }
        Err(_) => std::path::PathBuf::from(uri),
    };

    let success = dispatch(movers, &source, &destinations).await;

    if let Some(publisher) = publisher {
        publish_dispatched(root, publisher, msg, &destinations, &success);
    }
}

fn publish_dispatched(
    root: &DispatchRoot,
    publisher: &ferry_bus::PublisherHandle,
    msg: &Message,
    destinations: &[Destination],
    success: &BTreeMap<String, bool>,
) {
    for destination in destinations {
        if !success.get(&destination.client).copied().unwrap_or(false) {
            continue;
        }
        let Some(target) = root.get(&destination.client) else {
            continue;
        };
        let Some(topic_template) = &target.publish_topic else {
            error!(client = %destination.client, "publish topic not configured");
            continue;
        };

        let mut info = msg.data_map();
        let dest_path = Url::parse(&destination.url)
            .map(|u| u.path().to_owned())
            .unwrap_or_else(|_| destination.url.clone());
        info.insert("uri".into(), json!(dest_path));

        let topic = match compose(topic_template, &info) {
            Ok(topic) => topic,
            Err(err) => {
                error!(client = %destination.client, error = %err, "cannot compose publish topic");
                continue;
            }
        };
        let out = Message::new(&topic, MessageType::File, Value::Object(info));
        debug!(msg = %out, "publishing");
        publisher.send(&out);
    }
}
