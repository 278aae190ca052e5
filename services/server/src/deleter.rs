//! Deferred deletion of served files.
//!
//! Accepted paths sit in a deadline queue for `remove_delay` seconds before
//! a single worker removes them. A file already gone is routine (another
//! chain or an operator beat us to it); any other failure is logged and the
//! worker keeps going. Deletions of real files are announced on the
//! deletion topic when a publisher is attached; removing an empty directory
//! is not announced.

use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, warn};

use ferry_bus::PublisherHandle;
use ferry_protocol::{Message, MessageType, DELETION_TOPIC};

/// Ran after a file's removal was attempted (the mirror prunes its
/// registry here).
pub type RemoveHook = Arc<dyn Fn(&std::path::Path) + Send + Sync>;

/// Owning side of the delete worker.
pub struct Deleter {
    tx: mpsc::UnboundedSender<PathBuf>,
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
    delay: Duration,
}

/// Cloneable handle for scheduling removals.
#[derive(Clone)]
pub struct DeleterHandle {
    tx: mpsc::UnboundedSender<PathBuf>,
    delay: Duration,
}

impl Deleter {
    pub fn spawn(remove_delay: Duration, publisher: Option<PublisherHandle>) -> Deleter {
        Self::spawn_with_hook(remove_delay, publisher, None)
    }

    pub fn spawn_with_hook(
        remove_delay: Duration,
        publisher: Option<PublisherHandle>,
        hook: Option<RemoveHook>,
    ) -> Deleter {
        let (tx, rx) = mpsc::unbounded_channel();
        let (shutdown, shutdown_rx) = watch::channel(false);
        let task = tokio::spawn(worker(rx, shutdown_rx, remove_delay, publisher, hook));
        Deleter {
            tx,
            shutdown,
            task,
            delay: remove_delay,
        }
    }

    pub fn handle(&self) -> DeleterHandle {
        DeleterHandle {
            tx: self.tx.clone(),
            delay: self.delay,
        }
    }

    pub async fn stop(self) {
        let _ = self.shutdown.send(true);
        let _ = self.task.await;
    }
}

impl DeleterHandle {
    /// Schedule `path` for removal after the configured delay.
    pub fn add(&self, path: PathBuf) {
        debug!(path = %path.display(), delay = ?self.delay, "scheduling removal");
        if self.tx.send(path).is_err() {
            warn!("delete worker is gone");
        }
    }
}

async fn worker(
    mut rx: mpsc::UnboundedReceiver<PathBuf>,
    mut shutdown: watch::Receiver<bool>,
    delay: Duration,
    publisher: Option<PublisherHandle>,
    hook: Option<RemoveHook>,
) {
    let mut queue: BinaryHeap<Reverse<(Instant, PathBuf)>> = BinaryHeap::new();
    loop {
        let next_deadline = queue.peek().map(|Reverse((at, _))| *at);
        tokio::select! {
            biased;
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    break;
                }
            }
            item = rx.recv() => {
                match item {
                    Some(path) => queue.push(Reverse((Instant::now() + delay, path))),
                    None => break,
                }
            }
            _ = sleep_until_or_forever(next_deadline), if next_deadline.is_some() => {
                if let Some(Reverse((_, path))) = queue.pop() {
                    remove(&path, publisher.as_ref());
                    if let Some(hook) = &hook {
                        hook(&path);
                    }
                }
            }
        }
    }
    debug!("delete worker done");
}

async fn sleep_until_or_forever(deadline: Option<Instant>) {
    match deadline {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}

fn remove(path: &std::path::Path, publisher: Option<&PublisherHandle>) {
    if path.is_dir() {
        match std::fs::remove_dir(path) {
            Ok(()) => debug!(path = %path.display(), "removed empty directory"),
            Err(err) => warn!(path = %path.display(), error = %err, "could not remove directory"),
        }
        return;
    }
    match std::fs::remove_file(path) {
        Ok(()) => {
            debug!(path = %path.display(), "removed");
            if let Some(publisher) = publisher {
                let msg = Message::new(
                    DELETION_TOPIC,
                    MessageType::Del,
                    json!({"uri": path.display().to_string()}),
                );
                publisher.send(&msg);
            }
        }
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            debug!(path = %path.display(), "file already deleted");
        }
        Err(err) => {
            warn!(path = %path.display(), error = %err, "could not remove file");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn removes_after_delay_not_before() {
        let dir = tempfile::tempdir().unwrap();
        let victim = dir.path().join("served.dat");
        std::fs::write(&victim, b"x").unwrap();

        let deleter = Deleter::spawn(Duration::from_millis(300), None);
        deleter.handle().add(victim.clone());

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(victim.exists(), "file must survive the delay window");

        tokio::time::sleep(Duration::from_millis(500)).await;
        assert!(!victim.exists(), "file must be gone after the delay");
        deleter.stop().await;
    }

    #[tokio::test]
    async fn missing_file_is_not_an_error() {
        let deleter = Deleter::spawn(Duration::from_millis(10), None);
        deleter.handle().add(PathBuf::from("/nonexistent/file.dat"));
        tokio::time::sleep(Duration::from_millis(100)).await;
        // Worker must still be alive and accept more work.
        let dir = tempfile::tempdir().unwrap();
        let victim = dir.path().join("x");
        std::fs::write(&victim, b"x").unwrap();
        deleter.handle().add(victim.clone());
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(!victim.exists());
        deleter.stop().await;
    }

    #[tokio::test]
    async fn empty_directory_is_rmdired() {
        let dir = tempfile::tempdir().unwrap();
        let sub = dir.path().join("empty");
        std::fs::create_dir(&sub).unwrap();

        let deleter = Deleter::spawn(Duration::from_millis(10), None);
        deleter.handle().add(sub.clone());
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(!sub.exists());
        deleter.stop().await;
    }
}
