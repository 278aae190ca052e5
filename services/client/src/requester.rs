//! Per-peer request socket with retry, reconnect and jam detection.
//!
//! One instance per `(host, port)`. `send_and_recv` serializes callers,
//! polls in short slices so shutdown stays responsive, and rebuilds the
//! socket on every timeout, since a REQ socket that missed its reply is useless
//! until recreated. Five consecutive fully-failed requests mark the peer
//! `jammed`; the flag clears on the next success.

use std::time::Duration;

use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};
use zeromq::prelude::*;
use zeromq::{ReqSocket, ZmqMessage};

use ferry_protocol::Message;

pub const REQUEST_RETRIES: u32 = 3;
pub const JAMMED_THRESHOLD: u32 = 5;
const POLL_SLICE: Duration = Duration::from_millis(100);

pub struct PushRequester {
    endpoint: String,
    inner: Mutex<Inner>,
}

struct Inner {
    socket: Option<ReqSocket>,
    failures: u32,
    jammed: bool,
}

impl PushRequester {
    pub fn new(host: &str, port: u16) -> PushRequester {
        PushRequester {
            endpoint: format!("tcp://{host}:{port}"),
            inner: Mutex::new(Inner {
                socket: None,
                failures: 0,
                jammed: false,
            }),
        }
    }

    pub fn from_address(address: &str) -> Option<PushRequester> {
        let (host, port) = address.rsplit_once(':')?;
        Some(PushRequester::new(host, port.parse().ok()?))
    }

    /// Whether the peer is currently considered jammed.
    pub async fn jammed(&self) -> bool {
        self.inner.lock().await.jammed
    }

    pub async fn failures(&self) -> u32 {
        self.inner.lock().await.failures
    }

    /// Send `msg`, wait up to `timeout` for the reply. Retries with a fresh
    /// socket up to three times before giving up.
    pub async fn send_and_recv(&self, msg: &Message, timeout: Duration) -> Option<Message> {
        let mut inner = self.inner.lock().await;
        let request = msg.encode();

        let mut retries_left = REQUEST_RETRIES;
        while retries_left > 0 {
            let mut socket = match self.take_or_connect(&mut inner).await {
                Some(socket) => socket,
                None => {
                    retries_left -= 1;
                    continue;
                }
            };

            if let Err(err) = socket.send(ZmqMessage::from(request.clone())).await {
                warn!(peer = %self.endpoint, error = %err, "send failed, reconnecting");
                retries_left -= 1;
                continue;
            }

            match self.poll_reply(&mut socket, timeout).await {
                Some(reply) => {
                    inner.socket = Some(socket);
                    inner.failures = 0;
                    inner.jammed = false;
                    debug!(peer = %self.endpoint, reply = %reply, "receiving (REQ)");
                    return Some(reply);
                }
                None => {
                    warn!(peer = %self.endpoint, "timeout, retrying");
                    // Socket is confused; drop it and start over.
                    retries_left -= 1;
                }
            }
        }

        error!(peer = %self.endpoint, "server doesn't answer, abandoning");
        inner.failures += 1;
        if inner.failures == JAMMED_THRESHOLD {
            error!(peer = %self.endpoint, "server jammed");
            inner.jammed = true;
        }
        None
    }

    async fn take_or_connect(&self, inner: &mut Inner) -> Option<ReqSocket> {
        if let Some(socket) = inner.socket.take() {
            return Some(socket);
        }
        let mut socket = ReqSocket::new();
        match socket.connect(&self.endpoint).await {
            Ok(_) => {
                info!(peer = %self.endpoint, "connected");
                Some(socket)
            }
            Err(err) => {
                warn!(peer = %self.endpoint, error = %err, "connect failed");
                None
            }
        }
    }

    /// Poll in 100 ms slices so long transfers do not starve the runtime.
    async fn poll_reply(&self, socket: &mut ReqSocket, timeout: Duration) -> Option<Message> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let now = tokio::time::Instant::now();
            if now >= deadline {
                return None;
            }
            let slice = POLL_SLICE.min(deadline - now);
            match tokio::time::timeout(slice, socket.recv()).await {
                Ok(Ok(frames)) => {
                    let raw = frames
                        .get(0)
                        .map(|b| String::from_utf8_lossy(b).into_owned())
                        .unwrap_or_default();
                    if raw.is_empty() {
                        error!(peer = %self.endpoint, "empty reply");
                        return None;
                    }
                    match Message::parse(&raw) {
                        Ok(reply) => return Some(reply),
                        Err(err) => {
                            error!(peer = %self.endpoint, error = %err, "message error");
                            return None;
                        }
                    }
                }
                Ok(Err(err)) => {
                    warn!(peer = %self.endpoint, error = %err, "receive failed");
                    return None;
                }
                Err(_) => continue,
            }
        }
    }
}
