// ferry-test-utils: shared plumbing for the service and end-to-end suites.

use std::path::{Path, PathBuf};
use std::time::Duration;

use ferry_bus::Subscriber;
use ferry_protocol::Message;

/// Receive with a deadline; `None` on timeout.
pub async fn recv_timeout(subscriber: &mut Subscriber, timeout: Duration) -> Option<Message> {
    match tokio::time::timeout(timeout, subscriber.recv()).await {
        Ok(Ok(msg)) => Some(msg),
        _ => None,
    }
}

/// Poll `cond` until it holds or `timeout` passes.
pub async fn eventually<F: Fn() -> bool>(cond: F, timeout: Duration) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if cond() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}

/// Write an INI config into `dir` and return its path.
pub fn write_ini(dir: &Path, name: &str, body: &str) -> PathBuf {
    let path = dir.join(name);
    std::fs::write(&path, body).expect("writing test config");
    path
}

/// A currently free TCP port, for configs that must name a fixed port.
pub fn free_port() -> u16 {
    std::net::TcpListener::bind("127.0.0.1:0")
        .expect("binding an ephemeral port")
        .local_addr()
        .expect("reading the bound address")
        .port()
}

/// The settle time PUB/SUB needs before a fresh subscription sees traffic.
pub const SLOW_JOINER: Duration = Duration::from_millis(300);
