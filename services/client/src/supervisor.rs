//! Client lifecycle: one listener per provider per chain, hot reload,
//! signal handling.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use ferry_bus::Publisher;

use crate::config::{read_config, ClientConfig, ConfigError};
use crate::fetch::FetchContext;
use crate::listener;

#[derive(Debug, Clone)]
pub struct ClientArgs {
    pub config_file: PathBuf,
}

/// A running client chain: its listeners and its (optional) publisher.
pub struct ClientChain {
    pub config: ClientConfig,
    publisher: Option<Publisher>,
    listeners: Vec<JoinHandle<()>>,
    shutdown: watch::Sender<bool>,
    ctx: Arc<FetchContext>,
}

impl ClientChain {
    pub async fn start(config: ClientConfig) -> Result<ClientChain, ferry_bus::BusError> {
        let publisher = if config.topic.is_some() {
            Some(Publisher::bind(config.publish_port).await?)
        } else {
            None
        };
        let handle = publisher.as_ref().map(|p| p.handle());
        let ctx = Arc::new(FetchContext::new(Arc::new(config.clone()), handle));

        let (shutdown, shutdown_rx) = watch::channel(false);
        let listeners = config
            .providers
            .iter()
            .cloned()
            .map(|provider| {
                tokio::spawn(listener::run_listener(
                    provider,
                    ctx.clone(),
                    shutdown_rx.clone(),
                ))
            })
            .collect();

        info!(chain = %config.name, providers = config.providers.len(), "chain started");
        Ok(ClientChain {
            config,
            publisher,
            listeners,
            shutdown,
            ctx,
        })
    }

    pub fn context(&self) -> Arc<FetchContext> {
        self.ctx.clone()
    }

    pub fn publish_port(&self) -> Option<u16> {
        self.publisher.as_ref().map(|p| p.port())
    }

    pub async fn stop(mut self) {
        let name = self.config.name.clone();
        let _ = self.shutdown.send(true);
        for task in self.listeners.drain(..) {
            if let Err(err) = task.await {
                warn!(chain = %name, error = %err, "listener did not join cleanly");
            }
        }
        if let Some(publisher) = self.publisher.take() {
            publisher.stop().await;
        }
        info!(chain = %name, "chain stopped");
    }
}

// ---------------------------------------------------------------------------
// Supervisor
// ---------------------------------------------------------------------------

pub struct MoveClient {
    args: ClientArgs,
    chains: HashMap<String, ClientChain>,
}

impl MoveClient {
    pub fn new(args: ClientArgs) -> MoveClient {
        MoveClient {
            args,
            chains: HashMap::new(),
        }
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
            match ClientChain::start(config).await {
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

    pub fn chain(&self, name: &str) -> Option<&ClientChain> {
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
            }
        }

        self.shutdown().await;
        Ok(())
    }

    pub async fn shutdown(self) {
        for (_, chain) in self.chains {
            chain.stop().await;
        }
        info!("shutdown complete");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_config(path: &std::path::Path, body: &str) {
        let mut file = std::fs::File::create(path).unwrap();
        file.write_all(body.as_bytes()).unwrap();
    }

    #[tokio::test]
    async fn reload_diffs_chains() {
        let dir = tempfile::tempdir().unwrap();
        let config = dir.path().join("client.ini");
        write_config(
            &config,
            "[a]\nproviders = localhost:19001\ndestination = file:///tmp/out\ntopic = /a\n\
             \n[b]\nproviders = localhost:19002\ndestination = file:///tmp/out\ntopic = /b\n",
        );

        let mut client = MoveClient::new(ClientArgs {
            config_file: config.clone(),
        });
        client.reload().await.unwrap();
        assert_eq!(client.chain_names(), vec!["a", "b"]);

        write_config(
            &config,
            "[a]\nproviders = localhost:19001\ndestination = file:///tmp/out\ntopic = /a\n\
             \n[c]\nproviders = localhost:19003\ndestination = file:///tmp/out\ntopic = /c\n",
        );
        client.reload().await.unwrap();
        assert_eq!(client.chain_names(), vec!["a", "c"]);
        client.shutdown().await;
    }
}
