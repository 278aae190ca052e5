// ferry-bus: pub/sub plumbing over ZMQ-style sockets.
//
// Announcements and heartbeats ride PUB/SUB; the request port (ROUTER/REQ)
// lives with the request manager, not here. Publishers are owned by a task
// so any number of chains can share one bound socket through cloneable
// handles.

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};
use zeromq::prelude::*;
use zeromq::{PubSocket, SubSocket, ZmqMessage};

use ferry_protocol::{Message, WIRE_MAGIC};

#[derive(Debug, thiserror::Error)]
pub enum BusError {
    #[error("socket error: {0}")]
    Socket(String),
    #[error("bus closed")]
    Closed,
    #[error(transparent)]
    Message(#[from] ferry_protocol::MessageError),
}

impl From<zeromq::ZmqError> for BusError {
    fn from(err: zeromq::ZmqError) -> Self {
        BusError::Socket(err.to_string())
    }
}

// ---------------------------------------------------------------------------
// Publisher
// ---------------------------------------------------------------------------

/// A bound PUB socket behind a channel. Clone [`PublisherHandle`]s are given
/// to chains; the socket itself lives on a single task.
pub struct Publisher {
    port: u16,
    tx: mpsc::UnboundedSender<String>,
    task: JoinHandle<()>,
}

/// Cheap cloneable sending end of a [`Publisher`].
#[derive(Clone)]
pub struct PublisherHandle {
    tx: mpsc::UnboundedSender<String>,
}

impl Publisher {
    /// Bind on `tcp://0.0.0.0:<port>`. Port 0 picks an ephemeral port,
    /// readable afterwards via [`Publisher::port`].
    pub async fn bind(port: u16) -> Result<Publisher, BusError> {
        let mut socket = PubSocket::new();
        let endpoint = socket.bind(&format!("tcp://0.0.0.0:{port}")).await?;
        let port = match &endpoint {
            zeromq::Endpoint::Tcp(_, port) => *port,
            _ => port,
        };

        let (tx, mut rx) = mpsc::unbounded_channel::<String>();
        let task = tokio::spawn(async move {
            while let Some(line) = rx.recv().await {
                if let Err(e) = socket.send(ZmqMessage::from(line)).await {
                    warn!(error = %e, "publish failed");
                }
            }
            debug!("publisher task done");
        });

        Ok(Publisher { port, tx, task })
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn handle(&self) -> PublisherHandle {
        PublisherHandle {
            tx: self.tx.clone(),
        }
    }

    /// Close the socket after the queue drains.
    pub async fn stop(self) {
        drop(self.tx);
        let _ = self.task.await;
    }
}

impl PublisherHandle {
    pub fn send(&self, message: &Message) {
        debug!(msg = %message, "publishing");
        if self.tx.send(message.encode()).is_err() {
            warn!("publisher is gone, dropping message");
        }
    }
}

// ---------------------------------------------------------------------------
// Subscriber
// ---------------------------------------------------------------------------

/// A SUB socket connected to one or more providers, filtered by topic
/// prefix.
pub struct Subscriber {
    socket: SubSocket,
}

impl Subscriber {
    /// Connect to every endpoint (`tcp://host:port`) and subscribe to every
    /// topic. An empty topic list subscribes to everything.
    pub async fn connect(endpoints: &[String], topics: &[String]) -> Result<Subscriber, BusError> {
        let mut socket = SubSocket::new();
        for endpoint in endpoints {
            socket.connect(endpoint).await?;
        }
        if topics.is_empty() {
            socket.subscribe("").await?;
        }
        for topic in topics {
            socket.subscribe(&format!("{WIRE_MAGIC}{topic}")).await?;
        }
        Ok(Subscriber { socket })
    }

    /// Receive the next message. Malformed frames surface as
    /// [`BusError::Message`]; callers log and keep receiving.
    pub async fn recv(&mut self) -> Result<Message, BusError> {
        let frame = self.socket.recv().await?;
        let raw = frame
            .get(0)
            .map(|b| String::from_utf8_lossy(b).into_owned())
            .unwrap_or_default();
        Ok(Message::parse(&raw)?)
    }
}

/// `tcp://host:port` for a `host:port` provider entry.
pub fn tcp_endpoint(provider: &str) -> String {
    if provider.starts_with("tcp://") {
        provider.to_owned()
    } else {
        format!("tcp://{provider}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ferry_protocol::MessageType;
    use serde_json::json;
    use std::time::Duration;

    #[tokio::test]
    async fn publish_subscribe_roundtrip() {
        let publisher = Publisher::bind(0).await.unwrap();
        let endpoint = format!("tcp://127.0.0.1:{}", publisher.port());
        let mut sub = Subscriber::connect(&[endpoint], &["/t".to_owned()])
            .await
            .unwrap();
        // Slow-joiner: give the subscription a moment to reach the publisher.
        tokio::time::sleep(Duration::from_millis(200)).await;

        let handle = publisher.handle();
        let msg = Message::new("/t/x", MessageType::File, json!({"uid": "a"}));
        handle.send(&msg);

        let got = tokio::time::timeout(Duration::from_secs(5), sub.recv())
            .await
            .expect("timed out")
            .unwrap();
        assert_eq!(got.subject, "/t/x");
        assert_eq!(got.data["uid"], "a");
        publisher.stop().await;
    }

    #[tokio::test]
    async fn topic_filter_drops_other_subjects() {
        let publisher = Publisher::bind(0).await.unwrap();
        let endpoint = format!("tcp://127.0.0.1:{}", publisher.port());
        let mut sub = Subscriber::connect(&[endpoint], &["/wanted".to_owned()])
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;

        let handle = publisher.handle();
        handle.send(&Message::empty("/other/x", MessageType::File));
        handle.send(&Message::empty("/wanted/x", MessageType::File));

        let got = tokio::time::timeout(Duration::from_secs(5), sub.recv())
            .await
            .expect("timed out")
            .unwrap();
        assert_eq!(got.subject, "/wanted/x");
        publisher.stop().await;
    }

    #[test]
    fn tcp_endpoint_is_idempotent() {
        assert_eq!(tcp_endpoint("h:1"), "tcp://h:1");
        assert_eq!(tcp_endpoint("tcp://h:1"), "tcp://h:1");
    }
}
