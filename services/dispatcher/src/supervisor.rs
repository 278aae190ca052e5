//! Dispatcher lifecycle: subscription management, reload on SIGUSR1 or
//! config change, graceful shutdown.

use std::path::PathBuf;

use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::mpsc;
use tracing::{error, info, warn};

use ferry_bus::{Publisher, Subscriber};
use ferry_movers::MoverRegistry;

use crate::config::{all_addresses, all_topics, read_config, ConfigError, DispatchRoot};
use crate::dispatch::handle_message;

#[derive(Debug, Clone)]
pub struct DispatcherArgs {
    pub config_file: PathBuf,
    /// `-p`: enable publishing of per-destination messages.
    pub publish_port: Option<u16>,
    /// `-n`: nameservers for the publisher (accepted, recorded, unused by
    /// the direct-connection bus).
    pub publish_nameservers: Vec<String>,
}

pub struct DispatcherService {
    args: DispatcherArgs,
    config: DispatchRoot,
    movers: MoverRegistry,
    publisher: Option<Publisher>,
}

impl DispatcherService {
    pub async fn new(args: DispatcherArgs) -> Result<DispatcherService, ConfigError> {
        let config = read_config(&args.config_file)?;
        let publisher = match args.publish_port {
            Some(port) => match Publisher::bind(port).await {
                Ok(publisher) => {
                    info!(port = publisher.port(), "publisher up");
                    Some(publisher)
                }
                Err(err) => {
                    return Err(ConfigError::Read {
                        path: format!("publish port {port}"),
                        reason: err.to_string(),
                    })
                }
            },
            None => None,
        };
        if !args.publish_nameservers.is_empty() {
            info!(nameservers = ?args.publish_nameservers, "publisher nameservers noted");
        }
        Ok(DispatcherService {
            args,
            config,
            movers: MoverRegistry::standard(),
            publisher,
        })
    }

    /// Re-read the config; an invalid file keeps the old one running.
    fn reload(&mut self) {
        match read_config(&self.args.config_file) {
            Ok(config) => {
                self.config = config;
                info!(config = %self.args.config_file.display(), "reloaded config");
            }
            Err(err) => {
                warn!(error = %err, "invalid config, keeping the old one running");
            }
        }
    }

    async fn subscribe(&self) -> Option<Subscriber> {
        let addresses = all_addresses(&self.config);
        let topics = all_topics(&self.config);
        if addresses.is_empty() {
            warn!("no subscribe_addresses configured, nothing to listen to");
            return None;
        }
        match Subscriber::connect(&addresses, &topics).await {
            Ok(subscriber) => {
                info!(addresses = ?addresses, topics = ?topics, "subscribed");
                Some(subscriber)
            }
            Err(err) => {
                error!(error = %err, "subscribe failed");
                None
            }
        }
    }

    pub async fn run(mut self) -> Result<(), Box<dyn std::error::Error>> {
        let mut sigterm = signal(SignalKind::terminate())?;
        let mut sigint = signal(SignalKind::interrupt())?;
        let mut sigusr1 = signal(SignalKind::user_defined1())?;

        let (reload_tx, mut reload_rx) = mpsc::unbounded_channel();
        let _config_watch = match ferry_util::watch_file(&self.args.config_file, reload_tx) {
            Ok(guard) => Some(guard),
            Err(err) => {
                warn!(error = %err, "config file watch unavailable, reload via SIGUSR1 only");
                None
            }
        };

        let publisher_handle = self.publisher.as_ref().map(|p| p.handle());
        let mut subscriber = self.subscribe().await;

        loop {
            let mut resubscribe = false;
            tokio::select! {
                _ = sigterm.recv() => {
                    info!("SIGTERM, terminating dispatcher");
                    break;
                }
                _ = sigint.recv() => {
                    info!("SIGINT, terminating dispatcher");
                    break;
                }
                _ = sigusr1.recv() => {
                    info!("SIGUSR1, rereading config");
                    let before = (all_addresses(&self.config), all_topics(&self.config));
                    self.reload();
                    resubscribe = before != (all_addresses(&self.config), all_topics(&self.config));
                }
                _ = reload_rx.recv() => {
                    info!("config file changed, rereading");
                    let before = (all_addresses(&self.config), all_topics(&self.config));
                    self.reload();
                    resubscribe = before != (all_addresses(&self.config), all_topics(&self.config));
                }
                received = recv_or_pending(&mut subscriber) => {
                    match received {
                        Ok(msg) => {
                            handle_message(&self.config, &self.movers, &publisher_handle, &msg)
                                .await;
                        }
                        Err(err) => {
                            warn!(error = %err, "receive failed, resubscribing");
                            resubscribe = true;
                        }
                    }
                }
            }
            if resubscribe {
                subscriber = self.subscribe().await;
            }
        }

        if let Some(publisher) = self.publisher.take() {
            publisher.stop().await;
        }
        info!("dispatcher stopped");
        Ok(())
    }
}

async fn recv_or_pending(
    subscriber: &mut Option<Subscriber>,
) -> Result<ferry_protocol::Message, ferry_bus::BusError> {
    match subscriber {
        Some(subscriber) => subscriber.recv().await,
        None => std::future::pending().await,
    }
}
