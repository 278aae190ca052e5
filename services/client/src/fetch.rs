//! The fetch pipeline: announcement in, local file and republish out.
//!
//! For a first-seen uid the chain sends `push` with the destination (and,
//! only in the real request, the configured login); duplicates from other
//! providers earn an `ack`. A successful reply is unpacked, its uris are
//! rewritten to the local filesystem, aliases applied, and the result
//! republished with `origin` pointing back at the serving producer.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};
use url::Url;

use ferry_bus::PublisherHandle;
use ferry_protocol::walk::{extract_strings, translate_entries};
use ferry_protocol::{Message, MessageType};

use crate::cache::UidCache;
use crate::config::ClientConfig;
use crate::requester::PushRequester;
use crate::stats::StatsCollector;

/// Shared per-chain state handed to every provider listener.
pub struct FetchContext {
    pub config: Arc<ClientConfig>,
    pub cache: UidCache,
    requesters: Mutex<HashMap<String, Arc<PushRequester>>>,
    pub publisher: Option<PublisherHandle>,
    stats: Option<StatsCollector>,
}

impl FetchContext {
    pub fn new(config: Arc<ClientConfig>, publisher: Option<PublisherHandle>) -> FetchContext {
        let stats = config
            .statistics_file
            .as_ref()
            .map(|path| StatsCollector::new(path.clone()));
        FetchContext {
            config,
            cache: UidCache::new(),
            requesters: Mutex::new(HashMap::new()),
            publisher,
            stats,
        }
    }

    async fn requester_for(&self, address: &str) -> Option<Arc<PushRequester>> {
        let mut requesters = self.requesters.lock().await;
        if let Some(existing) = requesters.get(address) {
            return Some(existing.clone());
        }
        let fresh = Arc::new(PushRequester::from_address(address)?);
        requesters.insert(address.to_owned(), fresh.clone());
        Some(fresh)
    }

    /// Handle one announcement from any provider.
    pub async fn handle_announcement(&self, msg: Message) {
        let Some(request_address) = msg.data_str("request_address").map(str::to_owned) else {
            debug!(subject = %msg.subject, "announcement without request_address, ignoring");
            return;
        };
        let Some(requester) = self.requester_for(&request_address).await else {
            warn!(address = %request_address, "unusable request address");
            return;
        };
        let uids = extract_strings(&msg.data, "uid");

        if self.cache.already_received(&uids) {
            self.acknowledge(&msg, &requester).await;
            return;
        }
        self.fetch(&msg, &requester, &request_address, &uids).await;
    }

    /// Duplicate announcement: let local peers see the original, then tell
    /// the provider we are covered.
    async fn acknowledge(&self, msg: &Message, requester: &PushRequester) {
        resend_if_local(msg, &self.publisher);
        let req = Message::new(&msg.subject, MessageType::Ack, msg.data.clone());
        debug!(req = %req, "sending ack");
        let timeout = Duration::from_secs_f64(self.config.req_timeout);
        if requester.send_and_recv(&req, timeout).await.is_none() {
            warn!(subject = %msg.subject, "ack went unanswered");
        }
    }

    async fn fetch(
        &self,
        msg: &Message,
        requester: &PushRequester,
        request_address: &str,
        uids: &[String],
    ) {
        let (req, sanitized) = create_push_req(msg, &self.config.destination, self.config.login.as_deref());
        info!(req = %sanitized, "requesting");

        let local_dir = match create_local_dir(&self.config.destination, &self.config.ftp_root) {
            Ok(dir) => dir,
            Err(err) => {
                error!(error = %err, "cannot create local directory");
                return;
            }
        };

        let timeout = Duration::from_secs_f64(self.config.transfer_req_timeout);
        let response = requester.send_and_recv(&req, timeout).await;

        match response {
            Some(reply) if reply.mtype.is_file_like() => {
                debug!("server done sending file");
                self.cache.record(uids);
                if let Err(err) = self.republish(&reply, &local_dir) {
                    error!(error = %err, "could not unpack");
                    return;
                }
                if let Some(stats) = &self.stats {
                    stats.collect(msg);
                }
            }
            Some(reply) if reply.mtype == MessageType::Ack => {}
            other => {
                error!(
                    address = %request_address,
                    response = %other.map(|m| m.to_string()).unwrap_or_else(|| "none".into()),
                    "failed to get valid response from server"
                );
            }
        }
    }

    fn republish(&self, reply: &Message, local_dir: &Path) -> std::io::Result<()> {
        let (data, mtype) = unpack_and_expand(
            reply.data.clone(),
            reply.mtype,
            local_dir,
            self.config.unpack.as_deref(),
            self.config.delete,
        )?;

        let Some(publisher) = &self.publisher else {
            return Ok(());
        };

        let mut data = make_uris(
            data,
            &self.config.destination,
            self.config.login.as_deref(),
        );
        if let Some(origin) = reply.data.get("request_address") {
            data["origin"] = origin.clone();
        }
        if let Some(map) = data.as_object_mut() {
            map.remove("request_address");
            map.remove("destination");
        }
        let data = apply_aliases(data, &self.config.aliases);

        let local_msg = Message::new(&reply.subject, mtype, data);
        debug!(msg = %local_msg, "publishing");
        publisher.send(&local_msg);
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Pipeline steps
// ---------------------------------------------------------------------------

/// Resend the announcement for local peers, provided every uri is local.
pub fn resend_if_local(msg: &Message, publisher: &Option<PublisherHandle>) {
    let Some(publisher) = publisher else { return };
    for uri in extract_strings(&msg.data, "uri") {
        let local = if uri.starts_with('/') {
            true
        } else {
            Url::parse(&uri)
                .map(|url| ferry_util::is_local(&url))
                .unwrap_or(false)
        };
        if !local {
            return;
        }
    }
    debug!(msg = %msg, "resending for local peers");
    publisher.send(msg);
}

/// Build the `push` request and its credential-free twin for logging.
pub fn create_push_req(msg: &Message, destination: &str, login: Option<&str>) -> (Message, Message) {
    let (scheme, host, path) = split_destination(destination);

    let clean = format!("{scheme}://{host}{path}");
    let mut sanitized = Message::new(&msg.subject, MessageType::Push, msg.data.clone());
    sanitized.data["destination"] = json!(clean);

    let real = match login {
        Some(login) => {
            let mut real = Message::new(&msg.subject, MessageType::Push, msg.data.clone());
            real.data["destination"] = json!(format!("{scheme}://{login}@{host}{path}"));
            real
        }
        None => sanitized.clone(),
    };
    (real, sanitized)
}

/// Scheme defaults to `file`, host to the local machine, and the path is
/// normalized to a directory (trailing slash).
fn split_destination(destination: &str) -> (String, String, String) {
    let (scheme, host, path) = match Url::parse(destination) {
        Ok(url) => (
            url.scheme().to_owned(),
            url.host_str().unwrap_or_default().to_owned(),
            url.path().to_owned(),
        ),
        Err(_) => (String::new(), String::new(), destination.to_owned()),
    };
    let scheme = if scheme.is_empty() { "file".to_owned() } else { scheme };
    let host = if host.is_empty() {
        ferry_util::own_hostname()
    } else {
        host
    };
    let path = if path.ends_with('/') {
        path
    } else {
        format!("{path}/")
    };
    (scheme, host, path)
}

/// Create the receive directory under `ftp_root` and open it wide: the
/// transfer may arrive under a different account.
pub fn create_local_dir(destination: &str, ftp_root: &str) -> std::io::Result<PathBuf> {
    let (_, _, path) = split_destination(destination);
    let mut local_dir = PathBuf::from(ftp_root);
    for part in path.split('/').filter(|p| !p.is_empty()) {
        local_dir.push(part);
    }
    if !local_dir.exists() {
        std::fs::create_dir_all(&local_dir)?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&local_dir, std::fs::Permissions::from_mode(0o777))?;
        }
    }
    Ok(local_dir)
}

/// Expand fetched archives in place: an entry whose uid ends with the
/// unpacker name becomes a `dataset` of its members.
pub fn unpack_and_expand(
    data: Value,
    mtype: MessageType,
    local_dir: &Path,
    unpack: Option<&str>,
    delete: bool,
) -> std::io::Result<(Value, MessageType)> {
    let Some(unpack) = unpack else {
        return Ok((data, mtype));
    };
    if unpack != "tar" {
        warn!(unpack, "unsupported unpacker on the client side, passing through");
        return Ok((data, mtype));
    }

    let mut failure: Option<std::io::Error> = None;
    let data = translate_entries(data, &["uid", "uri"], &mut |mut entry| {
        if failure.is_some() {
            return entry;
        }
        let Some(uid) = entry.get("uid").and_then(Value::as_str).map(str::to_owned) else {
            return entry;
        };
        if !uid.ends_with(unpack) {
            return entry;
        }
        match expand_tar(&local_dir.join(&uid), local_dir, delete) {
            Ok(members) => {
                entry.remove("uid");
                entry.remove("uri");
                entry.insert(
                    "dataset".into(),
                    Value::Array(
                        members
                            .into_iter()
                            .map(|m| {
                                json!({
                                    "uid": m.file_name().map(|n| n.to_string_lossy().into_owned()),
                                    "uri": m.display().to_string(),
                                })
                            })
                            .collect(),
                    ),
                );
            }
            Err(err) => failure = Some(err),
        }
        entry
    });
    if let Some(err) = failure {
        return Err(err);
    }

    let mtype = if data.get("dataset").is_some() {
        MessageType::Dataset
    } else if data.get("collection").is_some() {
        MessageType::Collection
    } else {
        MessageType::File
    };
    Ok((data, mtype))
}

fn expand_tar(archive: &Path, out_dir: &Path, delete: bool) -> std::io::Result<Vec<PathBuf>> {
    let mut tar = tar::Archive::new(std::fs::File::open(archive)?);
    let mut members = Vec::new();
    for entry in tar.entries()? {
        let mut entry = entry?;
        let member = out_dir.join(entry.path()?);
        entry.unpack(&member)?;
        members.push(member);
    }
    if delete {
        std::fs::remove_file(archive)?;
    }
    Ok(members)
}

/// Rewrite every file entry's uri to the destination directory.
pub fn make_uris(data: Value, destination: &str, login: Option<&str>) -> Value {
    let (scheme, host, path) = split_destination(destination);
    let (scheme, host) = if ferry_util::host_is_local(&host) {
        ("ssh".to_owned(), host)
    } else {
        let host = match login {
            // Only the user part; never the password.
            Some(login) => format!("{}@{host}", login.split(':').next().unwrap_or(login)),
            None => host,
        };
        (scheme, host)
    };

    translate_entries(data, &["uid", "uri"], &mut |mut entry| {
        let Some(uid) = entry.get("uid").and_then(Value::as_str).map(str::to_owned) else {
            return entry;
        };
        entry.insert("uri".into(), json!(format!("{scheme}://{host}{path}{uid}")));
        entry
    })
}

/// Apply configured value aliases to top-level metadata.
pub fn apply_aliases(
    mut data: Value,
    aliases: &std::collections::BTreeMap<String, std::collections::BTreeMap<String, String>>,
) -> Value {
    let Some(map) = data.as_object_mut() else {
        return data;
    };
    for (key, mapping) in aliases {
        let Some(value) = map.get(key).and_then(Value::as_str) else {
            continue;
        };
        if let Some(alias) = mapping.get(value) {
            map.insert(key.clone(), json!(alias));
        }
    }
    data
}
