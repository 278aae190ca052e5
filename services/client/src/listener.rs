//! One listener per provider: a SUB connection feeding the fetch pipeline,
//! supervised by the heartbeat monitor.
//!
//! When the alarm deadline passes without any traffic the connection is
//! torn down and recreated, giving the observable "restarting listener" log line.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing::{debug, info, warn};

use ferry_bus::{tcp_endpoint, Subscriber};
use ferry_protocol::MessageType;

use crate::config::Provider;
use crate::fetch::FetchContext;
use crate::heartbeat::HeartbeatMonitor;

const RECONNECT_BACKOFF: Duration = Duration::from_secs(1);

pub async fn run_listener(
    provider: Provider,
    ctx: Arc<FetchContext>,
    mut shutdown: watch::Receiver<bool>,
) {
    let endpoint = tcp_endpoint(&provider.address);
    let topics = provider.topics(&ctx.config);

    'reconnect: loop {
        if *shutdown.borrow() {
            break;
        }
        info!(provider = %endpoint, topics = ?topics, "starting listener");
        let mut subscriber = match Subscriber::connect(std::slice::from_ref(&endpoint), &topics).await
        {
            Ok(subscriber) => subscriber,
            Err(err) => {
                warn!(provider = %endpoint, error = %err, "subscribe failed, retrying");
                tokio::time::sleep(RECONNECT_BACKOFF).await;
                continue;
            }
        };

        let mut monitor = HeartbeatMonitor::new(ctx.config.heartbeat_alarm_scale);
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
                            debug!(msg = %msg, "receiving (SUB)");
                            monitor.record(&msg);
                            if msg.mtype == MessageType::Beat {
                                continue;
                            }
                            ctx.handle_announcement(msg).await;
                        }
                        Err(err) => {
                            warn!(provider = %endpoint, error = %err, "receive failed, restarting listener");
                            tokio::time::sleep(RECONNECT_BACKOFF).await;
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
    debug!(provider = %endpoint, "listener done");
}
