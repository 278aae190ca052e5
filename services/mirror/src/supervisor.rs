//! Mirror lifecycle: shared publisher, chain reload, signals, heartbeats.

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use serde_json::json;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::mpsc;
use tracing::{error, info, warn};

use ferry_bus::Publisher;
use ferry_movers::MoverRegistry;
use ferry_protocol::{Message, MessageType, DEFAULT_MIN_INTERVAL, SERVER_HEARTBEAT_TOPIC};

use crate::chain::MirrorChain;
use crate::config::{read_config, ConfigError};

pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);

#[derive(Debug, Clone)]
pub struct MirrorArgs {
    pub config_file: PathBuf,
    pub publish_port: u16,
}

pub struct MoveMirror {
    args: MirrorArgs,
    chains: HashMap<String, MirrorChain>,
    publisher: Publisher,
    movers: MoverRegistry,
}

impl MoveMirror {
    pub async fn new(args: MirrorArgs) -> Result<MoveMirror, ferry_bus::BusError> {
        let publisher = Publisher::bind(args.publish_port).await?;
        info!(port = publisher.port(), "publisher up");
        Ok(MoveMirror {
            args,
            chains: HashMap::new(),
            publisher,
            movers: MoverRegistry::standard(),
        })
    }

    pub fn publish_port(&self) -> u16 {
        self.publisher.port()
    }

    pub async fn reload(&mut self) -> Result<(), ConfigError> {
        let new_configs = read_config(&self.args.config_file)?;

        let stale: Vec<String> = self
            .chains
            .keys()
            .filter(|name| !new_configs.contains_key(*name))
            .cloned()
            .collect();
        for name in stale {
            if let Some(chain) = self.chains.remove(&name) {
                chain.stop().await;
                info!(chain = %name, "removed");
            }
        }

        for (name, config) in new_configs {
            let updating = match self.chains.get(&name) {
                Some(running) if running.config == config => continue,
                Some(_) => {
                    if let Some(old) = self.chains.remove(&name) {
                        old.stop().await;
                    }
                    true
                }
                None => false,
            };
            match MirrorChain::start(config, self.publisher.handle(), self.movers.clone()).await {
                Ok(chain) => {
                    info!(chain = %name, "{}", if updating { "updated" } else { "added" });
                    self.chains.insert(name, chain);
                }
                Err(err) => {
                    error!(chain = %name, error = %err, "could not start chain, skipping");
                }
            }
        }
        info!(config = %self.args.config_file.display(), "reloaded config");
        Ok(())
    }

    pub fn chain_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.chains.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn chain(&self, name: &str) -> Option<&MirrorChain> {
        self.chains.get(name)
    }

    pub async fn run(mut self) -> Result<(), Box<dyn std::error::Error>> {
        let mut sighup = signal(SignalKind::hangup())?;
        let mut sigterm = signal(SignalKind::terminate())?;
        let mut sigint = signal(SignalKind::interrupt())?;

        let (reload_tx, mut reload_rx) = mpsc::unbounded_channel();
        let _config_watch = match ferry_util::watch_file(&self.args.config_file, reload_tx) {
            Ok(guard) => Some(guard),
            Err(err) => {
                warn!(error = %err, "config file watch unavailable, reload via SIGHUP only");
                None
            }
        };

        if let Err(err) = self.reload().await {
            error!(error = %err, "initial config load failed");
        }

        let mut heartbeat = tokio::time::interval(HEARTBEAT_INTERVAL);
        let beat_handle = self.publisher.handle();

        loop {
            tokio::select! {
                _ = sigterm.recv() => {
                    info!("SIGTERM, shutting down");
                    break;
                }
                _ = sigint.recv() => {
                    info!("SIGINT, shutting down");
                    break;
                }
                _ = sighup.recv() => {
                    info!("SIGHUP, reloading config");
                    if let Err(err) = self.reload().await {
                        error!(error = %err, "reload failed, keeping current chains");
                    }
                }
                _ = reload_rx.recv() => {
                    info!("config file changed, reloading");
                    if let Err(err) = self.reload().await {
                        error!(error = %err, "reload failed, keeping current chains");
                    }
                }
                _ = heartbeat.tick() => {
                    let beat = Message::new(
                        SERVER_HEARTBEAT_TOPIC,
                        MessageType::Beat,
                        json!({"min_interval": DEFAULT_MIN_INTERVAL}),
                    );
                    beat_handle.send(&beat);
                }
            }
        }

        self.shutdown().await;
        Ok(())
    }

    pub async fn shutdown(self) {
        for (_, chain) in self.chains {
            chain.stop().await;
        }
        self.movers.close_connections();
        self.publisher.stop().await;
        info!("shutdown complete");
    }
}
