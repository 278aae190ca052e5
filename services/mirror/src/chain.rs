//! A mirror chain: upstream listeners feeding the registry and re-publish,
//! plus a request port that fetches on demand.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use serde_json::json;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use client::fetch::create_local_dir;
use client::{FetchContext, HeartbeatMonitor};
use ferry_bus::{tcp_endpoint, PublisherHandle, Subscriber};
use ferry_movers::MoverRegistry;
use ferry_protocol::{Message, MessageType};
use server::request_manager::{RequestHandler, RequestManager, ServerRequestHandler};
use server::{Deleter, FileCache};

use crate::config::MirrorConfig;
use crate::registry::FileRegistry;

#[derive(Debug, thiserror::Error)]
pub enum MirrorError {
    #[error("request port: {0}")]
    Request(String),
    #[error("local cache dir: {0}")]
    LocalDir(String),
}

pub struct MirrorChain {
    pub config: MirrorConfig,
    pub registry: FileRegistry,
    listeners: Vec<JoinHandle<()>>,
    shutdown: watch::Sender<bool>,
    request_manager: RequestManager,
    deleter: Deleter,
}

impl MirrorChain {
    pub async fn start(
        config: MirrorConfig,
        publisher: PublisherHandle,
        movers: MoverRegistry,
    ) -> Result<MirrorChain, MirrorError> {
        let registry = FileRegistry::new();

        // Fetched copies land here; pruning follows their deletion.
        let local_dir = create_local_dir(&config.destination, &config.ftp_root)
            .map_err(|e| MirrorError::LocalDir(e.to_string()))?;

        let prune_registry = registry.clone();
        let deleter = Deleter::spawn_with_hook(
            Duration::from_secs_f64(config.remove_delay),
            Some(publisher.clone()),
            Some(Arc::new(move |path: &std::path::Path| {
                if let Some(name) = path.file_name().and_then(|n| n.to_str()) {
                    prune_registry.prune(name);
                }
            })),
        );

        let server_config = Arc::new(config.as_server_config());
        let inner = ServerRequestHandler::new(
            server_config,
            FileCache::new(),
            deleter.handle(),
            movers,
        )
        .map_err(|e| MirrorError::Request(e.to_string()))?;
        let fetch = Arc::new(FetchContext::new(Arc::new(config.as_client_config()), None));
        let handler = MirrorRequestHandler {
            inner,
            registry: registry.clone(),
            fetch,
            local_dir,
        };
        let request_manager = RequestManager::bind(config.request_port, Arc::new(handler))
            .await
            .map_err(|e| MirrorError::Request(e.to_string()))?;

        // Re-advertise with the actual bound port (matters for port 0).
        let mut config = config;
        config.request_port = request_manager.port();

        let (shutdown, shutdown_rx) = watch::channel(false);
        let listeners = config
            .providers
            .iter()
            .cloned()
            .map(|provider| {
                tokio::spawn(listen(
                    provider,
                    config.clone(),
                    registry.clone(),
                    publisher.clone(),
                    shutdown_rx.clone(),
                ))
            })
            .collect();

        info!(chain = %config.name, port = config.request_port, "mirror chain started");
        Ok(MirrorChain {
            config,
            registry,
            listeners,
            shutdown,
            request_manager,
            deleter,
        })
    }

    pub fn request_port(&self) -> u16 {
        self.request_manager.port()
    }

    pub async fn stop(mut self) {
        let name = self.config.name.clone();
        let _ = self.shutdown.send(true);
        for task in self.listeners.drain(..) {
            if let Err(err) = task.await {
                warn!(chain = %name, error = %err, "listener did not join cleanly");
            }
        }
        self.request_manager.stop().await;
        self.deleter.stop().await;
        info!(chain = %name, "mirror chain stopped");
    }
}

// ---------------------------------------------------------------------------
// Upstream listener
// ---------------------------------------------------------------------------

async fn listen(
    provider: client::Provider,
    config: MirrorConfig,
    registry: FileRegistry,
    publisher: PublisherHandle,
    mut shutdown: watch::Receiver<bool>,
) {
    let endpoint = tcp_endpoint(&provider.address);
    let mut topics = Vec::new();
    if let Some(topic) = provider.topic.clone().or_else(|| config.client_topic.clone()) {
        topics.push(topic);
    }
    if config.heartbeat {
        topics.push(ferry_protocol::SERVER_HEARTBEAT_TOPIC.to_owned());
    }

    'reconnect: loop {
        if *shutdown.borrow() {
            break;
        }
        info!(provider = %endpoint, topics = ?topics, "starting mirror listener");
        let mut subscriber = match Subscriber::connect(std::slice::from_ref(&endpoint), &topics).await
        {
            Ok(subscriber) => subscriber,
            Err(err) => {
                warn!(provider = %endpoint, error = %err, "subscribe failed, retrying");
                tokio::time::sleep(Duration::from_secs(1)).await;
                continue;
            }
        };

        let mut monitor = HeartbeatMonitor::new(config.heartbeat_alarm_scale);
        loop {
            tokio::select! {
                biased;
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break 'reconnect;
                    }
                }
                received = subscriber.recv() => {
                    match received {
                        Ok(msg) => {
                            monitor.record(&msg);
                            if msg.mtype == MessageType::Beat {
                                continue;
                            }
                            announce(msg, &config, &registry, &publisher);
                        }
                        Err(err) => {
                            warn!(provider = %endpoint, error = %err, "receive failed, restarting listener");
                            tokio::time::sleep(Duration::from_secs(1)).await;
                            continue 'reconnect;
                        }
                    }
                }
                _ = tokio::time::sleep(monitor.alarm_after()), if monitor.enabled() => {
                    warn!(provider = %endpoint, "missing heartbeat, restarting listener");
                    continue 'reconnect;
                }
            }
        }
    }
    debug!(provider = %endpoint, "mirror listener done");
}

/// Record an upstream announcement; the first one per uid is re-published
/// with the mirror's own request address, optionally delayed.
pub fn announce(
    msg: Message,
    config: &MirrorConfig,
    registry: &FileRegistry,
    publisher: &PublisherHandle,
) {
    let Some(uid) = msg.data_str("uid").map(str::to_owned) else {
        debug!(subject = %msg.subject, "announcement without uid, ignoring");
        return;
    };
    if !registry.record(&uid, msg.clone()) {
        debug!(uid = %uid, "already published, keeping as fallback source");
        return;
    }

    let mut mirrored = Message::new(&config.topic, msg.mtype, msg.data.clone());
    mirrored.data["request_address"] = json!(config.advertised_request_address());

    if config.delay > 0.0 {
        let publisher = publisher.clone();
        let delay = Duration::from_secs_f64(config.delay);
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            publisher.send(&mirrored);
        });
    } else {
        debug!(msg = %mirrored, "sending");
        publisher.send(&mirrored);
    }
}

// ---------------------------------------------------------------------------
// Request handler
// ---------------------------------------------------------------------------

/// The server-side handler with `push` interposed: fetch the file from one
/// of its origins first, then serve it downstream from the local copy.
#[derive(Clone)]
pub struct MirrorRequestHandler {
    inner: ServerRequestHandler,
    registry: FileRegistry,
    fetch: Arc<FetchContext>,
    local_dir: PathBuf,
}

impl MirrorRequestHandler {
    async fn push(self, mut message: Message) -> Message {
        let Some(uid) = message.data_str("uid").map(str::to_owned) else {
            return Message::new(&message.subject, MessageType::Err, json!("push without uid"));
        };

        let sources = self.registry.sources(&uid);
        if sources.is_empty() {
            return Message::new(
                &message.subject,
                MessageType::Err,
                json!(format!("no source message found for {uid}")),
            );
        }

        let mut local = None;
        for source in sources {
            self.fetch.handle_announcement(source).await;
            let candidate = self.local_dir.join(&uid);
            if candidate.exists() {
                local = Some(candidate);
                break;
            }
        }
        let Some(local) = local else {
            return Message::new(
                &message.subject,
                MessageType::Err,
                json!(format!("could not fetch {uid} from any source")),
            );
        };

        message.data["uri"] = json!(local.display().to_string());
        self.inner.handle(message).await
    }
}

impl RequestHandler for MirrorRequestHandler {
    fn handle(&self, message: Message) -> BoxFuture<'static, Message> {
        let this = self.clone();
        async move {
            match message.mtype {
                MessageType::Push => this.push(message).await,
                _ => this.inner.handle(message).await,
            }
        }
        .boxed()
    }
}
