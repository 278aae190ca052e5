//! One running chain: watcher (or upstream relay), announcement publishing,
//! optional request port, and the delete worker behind it.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Map, Value};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use url::Url;

use ferry_bus::{tcp_endpoint, PublisherHandle, Subscriber};
use ferry_movers::MoverRegistry;
use ferry_protocol::walk::{extract_strings, extract_values};
use ferry_protocol::{Message, MessageType};
use ferry_util::Pattern;

use crate::cache::FileCache;
use crate::config::ChainConfig;
use crate::deleter::Deleter;
use crate::request_manager::{RequestManager, ServerRequestHandler};
use crate::unpack;
use crate::watcher::{self, FsWatcher, WatchBackend};

#[derive(Debug, thiserror::Error)]
pub enum ChainError {
    #[error(transparent)]
    Watch(#[from] watcher::WatchError),
    #[error(transparent)]
    Pattern(#[from] ferry_util::PatternError),
    #[error("request port: {0}")]
    Request(String),
    #[error("subscribe: {0}")]
    Subscribe(String),
}

/// A started chain. Stopping joins every task before returning so a reload
/// never leaves two generations running.
pub struct Chain {
    pub config: ChainConfig,
    watcher: Option<FsWatcher>,
    tasks: Vec<JoinHandle<()>>,
    shutdown: watch::Sender<bool>,
    request_manager: Option<RequestManager>,
    deleter: Option<Deleter>,
    cache: FileCache,
}

impl Chain {
    pub async fn start(
        config: ChainConfig,
        publisher: Option<PublisherHandle>,
        movers: MoverRegistry,
    ) -> Result<Chain, ChainError> {
        let (shutdown, shutdown_rx) = watch::channel(false);
        let cache = FileCache::new();
        let mut config = config;
        let mut tasks = Vec::new();

        // Request side: deleter + router socket.
        let (request_manager, deleter) = match config.request_port {
            Some(port) => {
                let deleter = Deleter::spawn(
                    Duration::from_secs_f64(config.remove_delay),
                    publisher.clone(),
                );
                let handler = ServerRequestHandler::new(
                    Arc::new(config.clone()),
                    cache.clone(),
                    deleter.handle(),
                    movers,
                )?;
                let manager = RequestManager::bind(port, Arc::new(handler))
                    .await
                    .map_err(|e| ChainError::Request(e.to_string()))?;
                // Announce the actual bound port (matters for port 0).
                config.request_port = Some(manager.port());
                (Some(manager), Some(deleter))
            }
            None => (None, None),
        };

        // Announce side: filesystem watcher or upstream relay.
        let mut fs_watcher = None;
        if let Some(origin) = &config.origin {
            let pattern = Pattern::new(origin)?;
            let backend = if config.use_polling {
                WatchBackend::Polling {
                    interval: Duration::from_secs_f64(config.watchdog_timeout),
                }
            } else {
                WatchBackend::Kernel
            };
            let (tx, rx) = mpsc::unbounded_channel();
            fs_watcher = Some(watcher::watch_pattern(&pattern, backend, tx)?);
            tasks.push(tokio::spawn(watch_loop(
                rx,
                shutdown_rx.clone(),
                config.clone(),
                publisher.clone(),
                cache.clone(),
            )));
        } else if let Some(listen) = &config.listen {
            let endpoints: Vec<String> =
                config.addresses.iter().map(|a| tcp_endpoint(a)).collect();
            let subscriber = Subscriber::connect(&endpoints, &[listen.clone()])
                .await
                .map_err(|e| ChainError::Subscribe(e.to_string()))?;
            tasks.push(tokio::spawn(relay_loop(
                subscriber,
                shutdown_rx,
                config.clone(),
                publisher,
                cache.clone(),
            )));
        }

        info!(chain = %config.name, topic = %config.topic, "chain started");
        Ok(Chain {
            config,
            watcher: fs_watcher,
            tasks,
            shutdown,
            request_manager,
            deleter,
            cache,
        })
    }

    /// The actual request port (useful when configured as 0 in tests).
    pub fn request_port(&self) -> Option<u16> {
        self.request_manager.as_ref().map(|m| m.port())
    }

    pub fn cache(&self) -> &FileCache {
        &self.cache
    }

    /// Stop the watcher, the request manager and the delete worker, joining
    /// everything.
    pub async fn stop(mut self) {
        let name = self.config.name.clone();
        drop(self.watcher.take());
        let _ = self.shutdown.send(true);
        for task in self.tasks.drain(..) {
            if let Err(err) = task.await {
                warn!(chain = %name, error = %err, "chain task did not join cleanly");
            }
        }
        if let Some(manager) = self.request_manager.take() {
            manager.stop().await;
        }
        if let Some(deleter) = self.deleter.take() {
            deleter.stop().await;
        }
        info!(chain = %name, "chain stopped");
    }

    /// Re-announce files already on disk (start-up backlog).
    pub async fn replay_backlog(&self, publisher: &Option<PublisherHandle>) {
        let Some(origin) = &self.config.origin else {
            return;
        };
        let Ok(pattern) = Pattern::new(origin) else {
            return;
        };
        let glob_pattern = pattern.globify();
        let paths = match glob::glob(&glob_pattern) {
            Ok(paths) => paths,
            Err(err) => {
                warn!(chain = %self.config.name, error = %err, "backlog glob failed");
                return;
            }
        };
        let mut count = 0usize;
        for path in paths.flatten() {
            if !watcher::accepts(&glob_pattern, &path) {
                continue;
            }
            process_notify(&path, &self.config, publisher, &self.cache).await;
            count += 1;
        }
        if count > 0 {
            info!(chain = %self.config.name, count, "replayed backlog");
        }
    }
}

// ---------------------------------------------------------------------------
// Watch loop (origin chains)
// ---------------------------------------------------------------------------

async fn watch_loop(
    mut rx: mpsc::UnboundedReceiver<PathBuf>,
    mut shutdown: watch::Receiver<bool>,
    config: ChainConfig,
    publisher: Option<PublisherHandle>,
    cache: FileCache,
) {
    loop {
        tokio::select! {
            biased;
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    break;
                }
            }
            path = rx.recv() => {
                match path {
                    Some(path) => process_notify(&path, &config, &publisher, &cache).await,
                    None => break,
                }
            }
        }
    }
    debug!(chain = %config.name, "watch loop done");
}

/// Unpack, extract metadata, announce, remember.
pub async fn process_notify(
    orig_path: &Path,
    config: &ChainConfig,
    publisher: &Option<PublisherHandle>,
    cache: &FileCache,
) {
    debug!(path = %orig_path.display(), "we have a match");

    let path = match unpack_if_configured(orig_path, config).await {
        Ok(path) => path,
        Err(err) => {
            error!(path = %orig_path.display(), error = %err, "could not decompress");
            return;
        }
    };

    let Some(msg) = build_announcement(&path, orig_path, config) else {
        return;
    };
    if let Some(publisher) = publisher {
        publisher.send(&msg);
        debug!(msg = %msg, "message sent");
    }
    for uid in extract_strings(&msg.data, "uid") {
        cache.push(&config.topic, &uid);
    }
}

async fn unpack_if_configured(
    orig_path: &Path,
    config: &ChainConfig,
) -> Result<PathBuf, unpack::UnpackError> {
    let Some(compression) = &config.compression else {
        return Ok(orig_path.to_path_buf());
    };
    let unpacker = unpack::unpacker(compression)?;
    let path = orig_path.to_path_buf();
    let working_dir = config.working_directory.clone().map(PathBuf::from);
    let prog = config.prog.clone();
    let delete = config.delete;

    let produced = tokio::task::spawn_blocking(move || {
        let produced = unpacker.unpack(&path, working_dir.as_deref(), prog.as_deref())?;
        if delete {
            std::fs::remove_file(&path)?;
        }
        Ok::<_, unpack::UnpackError>(produced)
    })
    .await
    .map_err(|e| unpack::UnpackError::Program(format!("unpack task died: {e}")))??;

    Ok(produced
        .into_iter()
        .next()
        .unwrap_or_else(|| orig_path.to_path_buf()))
}

fn build_announcement(path: &Path, orig_path: &Path, config: &ChainConfig) -> Option<Message> {
    let origin = config.origin.as_deref()?;
    let pattern = Pattern::new(origin).ok()?;
    let fields = match pattern.parse(&orig_path.to_string_lossy()) {
        Some(fields) => fields,
        None => {
            debug!(path = %orig_path.display(), "basename does not parse, dropping");
            return None;
        }
    };

    let mut data = Map::new();
    for (key, value) in &config.info {
        data.insert(key.clone(), value.clone());
    }
    data.extend(fields);
    data.insert("uri".into(), json!(path.display().to_string()));
    data.insert(
        "uid".into(),
        json!(path.file_name()?.to_string_lossy().into_owned()),
    );

    match config.advertised_request_address() {
        Some(address) => {
            data.insert("request_address".into(), json!(address));
        }
        None => {
            // No request endpoint: embed enough filesystem metadata for a
            // remote peer to fetch the file directly.
            if let Ok(meta) = std::fs::metadata(path) {
                let mut fs_info = Map::new();
                fs_info.insert("host".into(), json!(ferry_util::own_hostname()));
                fs_info.insert("size".into(), json!(meta.len()));
                if let Ok(mtime) = meta.modified() {
                    let mtime: chrono::DateTime<chrono::Utc> = mtime.into();
                    fs_info.insert("mtime".into(), json!(mtime.to_rfc3339()));
                }
                data.insert("filesystem".into(), Value::Object(fs_info));
            }
        }
    }

    Some(Message::new(&config.topic, MessageType::File, Value::Object(data)))
}

// ---------------------------------------------------------------------------
// Relay loop (listen chains)
// ---------------------------------------------------------------------------

async fn relay_loop(
    mut subscriber: Subscriber,
    mut shutdown: watch::Receiver<bool>,
    config: ChainConfig,
    publisher: Option<PublisherHandle>,
    cache: FileCache,
) {
    loop {
        tokio::select! {
            biased;
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    break;
                }
            }
            received = subscriber.recv() => {
                match received {
                    Ok(msg) => relay_message(msg, &config, &publisher, &cache),
                    Err(err) => {
                        warn!(chain = %config.name, error = %err, "relay receive failed");
                    }
                }
            }
        }
    }
    debug!(chain = %config.name, "relay loop done");
}

fn relay_message(
    msg: Message,
    config: &ChainConfig,
    publisher: &Option<PublisherHandle>,
    cache: &FileCache,
) {
    if !files_are_local(&msg) {
        debug!(chain = %config.name, "skipping announcement with non-local files");
        return;
    }

    let mut data = Map::new();
    for (key, value) in &config.info {
        data.insert(key.clone(), value.clone());
    }
    data.extend(msg.data_map());
    if let Some(address) = config.advertised_request_address() {
        data.insert("request_address".into(), json!(address));
    }

    let relayed = Message::new(&config.topic, msg.mtype, Value::Object(data));
    if let Some(publisher) = publisher {
        publisher.send(&relayed);
    }
    for uid in extract_strings(&relayed.data, "uid") {
        cache.push(&config.topic, &uid);
    }
}

fn files_are_local(msg: &Message) -> bool {
    for uri in extract_values(&msg.data, "uri") {
        let Some(uri) = uri.as_str() else {
            return false;
        };
        if uri.starts_with('/') {
            continue;
        }
        match Url::parse(uri) {
            Ok(url) if ferry_util::is_local(&url) => continue,
            _ => return false,
        }
    }
    true
}
