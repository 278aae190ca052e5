//! Shared connection pool for the stateful movers (FTP, SCP).
//!
//! One live connection per `(host, port, user)` at any time. Acquiring an
//! in-use connection blocks until the holder releases it, so concurrent
//! transfers to the same peer serialize. Released connections idle for
//! `connection_uptime` seconds before the pool closes them.

use std::collections::HashMap;
use std::sync::{Condvar, Mutex};
use std::time::{Duration, Instant};

use crate::MoverError;

/// Identity of a pooled peer. Credentials are deliberately not part of the
/// key; they ride along in [`ConnectAuth`] at connect time only.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PeerKey {
    pub host: String,
    pub port: u16,
    pub user: Option<String>,
}

/// Connect-time secrets and knobs. Never logged.
#[derive(Debug, Clone, Default)]
pub struct ConnectAuth {
    pub password: Option<String>,
    pub key_file: Option<std::path::PathBuf>,
    pub timeout: Option<Duration>,
}

/// How a pool opens, probes and closes its connections.
pub trait Connector: Send + Sync {
    type Conn: Send;

    fn connect(&self, key: &PeerKey, auth: &ConnectAuth) -> Result<Self::Conn, MoverError>;

    /// Probe a previously idle connection before reuse.
    fn is_alive(&self, conn: &mut Self::Conn) -> bool;

    fn close(&self, conn: Self::Conn);
}

enum Slot<C> {
    /// Connection parked in the pool since the given instant, to be closed
    /// once it has idled past its uptime.
    Idle {
        conn: C,
        since: Instant,
        uptime: Duration,
    },
    /// Handed out; the next acquire for this key waits.
    Busy,
}

pub struct ConnectionPool<K: Connector> {
    connector: K,
    slots: Mutex<HashMap<PeerKey, Slot<K::Conn>>>,
    released: Condvar,
}

impl<K: Connector> ConnectionPool<K> {
    pub fn new(connector: K) -> Self {
        ConnectionPool {
            connector,
            slots: Mutex::new(HashMap::new()),
            released: Condvar::new(),
        }
    }

    /// Take the connection for `key`, opening one if needed. Blocks while
    /// another caller holds it. `uptime` arms the idle timer used when this
    /// handle is released.
    pub fn acquire(
        &self,
        key: PeerKey,
        uptime: Duration,
        auth: &ConnectAuth,
    ) -> Result<PoolHandle<'_, K>, MoverError> {
        let mut slots = self.slots.lock().unwrap();
        loop {
            match slots.remove(&key) {
                None => break,
                Some(Slot::Idle { conn, since, uptime: armed }) => {
                    let mut conn = conn;
                    let expired = since.elapsed() >= armed;
                    if !expired && self.connector.is_alive(&mut conn) {
                        slots.insert(key.clone(), Slot::Busy);
                        return Ok(PoolHandle {
                            pool: self,
                            key,
                            conn: Some(conn),
                            uptime,
                        });
                    }
                    self.connector.close(conn);
                    break;
                }
                Some(Slot::Busy) => {
                    slots.insert(key.clone(), Slot::Busy);
                    slots = self.released.wait(slots).unwrap();
                }
            }
        }
        slots.insert(key.clone(), Slot::Busy);
        drop(slots);

        match self.connector.connect(&key, auth) {
            Ok(conn) => Ok(PoolHandle {
                pool: self,
                key,
                conn: Some(conn),
                uptime,
            }),
            Err(err) => {
                self.slots.lock().unwrap().remove(&key);
                self.released.notify_all();
                Err(err)
            }
        }
    }

    /// Close idle connections past their uptime. Cheap; called
    /// opportunistically by the movers.
    pub fn reap_idle(&self) {
        let mut slots = self.slots.lock().unwrap();
        let expired: Vec<PeerKey> = slots
            .iter()
            .filter_map(|(key, slot)| match slot {
                Slot::Idle { since, uptime, .. } if since.elapsed() >= *uptime => {
                    Some(key.clone())
                }
                _ => None,
            })
            .collect();
        for key in expired {
            if let Some(Slot::Idle { conn, .. }) = slots.remove(&key) {
                self.connector.close(conn);
            }
        }
    }

    /// Drain every idle connection. Busy connections are closed by their
    /// holders' releases after this returns.
    pub fn shutdown(&self) {
        let mut slots = self.slots.lock().unwrap();
        for (_, slot) in slots.drain() {
            if let Slot::Idle { conn, .. } = slot {
                self.connector.close(conn);
            }
        }
        self.released.notify_all();
    }

    /// Connections currently pooled or handed out (test hook).
    pub fn len(&self) -> usize {
        self.slots.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn release(&self, key: PeerKey, conn: K::Conn, uptime: Duration) {
        let mut slots = self.slots.lock().unwrap();
        slots.insert(
            key,
            Slot::Idle {
                conn,
                since: Instant::now(),
                uptime,
            },
        );
        drop(slots);
        self.released.notify_all();
    }

    fn discard(&self, key: &PeerKey) {
        self.slots.lock().unwrap().remove(key);
        self.released.notify_all();
    }
}

/// A checked-out connection. Returns to the pool on drop; call
/// [`PoolHandle::discard`] instead when the connection errored mid-use.
pub struct PoolHandle<'a, K: Connector> {
    pool: &'a ConnectionPool<K>,
    key: PeerKey,
    conn: Option<K::Conn>,
    uptime: Duration,
}

impl<K: Connector> PoolHandle<'_, K> {
    pub fn conn(&mut self) -> &mut K::Conn {
        self.conn.as_mut().expect("connection taken")
    }

    /// Drop the connection instead of pooling it.
    pub fn discard(mut self) {
        if let Some(conn) = self.conn.take() {
            self.pool.connector.close(conn);
        }
        self.pool.discard(&self.key);
    }
}

impl<K: Connector> Drop for PoolHandle<'_, K> {
    fn drop(&mut self) {
        match self.conn.take() {
            Some(conn) => self.pool.release(self.key.clone(), conn, self.uptime),
            None => self.pool.discard(&self.key),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    struct FakeConnector {
        opened: AtomicUsize,
        closed: AtomicUsize,
    }

    impl FakeConnector {
        fn new() -> Self {
            FakeConnector {
                opened: AtomicUsize::new(0),
                closed: AtomicUsize::new(0),
            }
        }
    }

    impl Connector for Arc<FakeConnector> {
        type Conn = usize;

        fn connect(&self, _key: &PeerKey, _auth: &ConnectAuth) -> Result<usize, MoverError> {
            Ok(self.opened.fetch_add(1, Ordering::SeqCst))
        }

        fn is_alive(&self, _conn: &mut usize) -> bool {
            true
        }

        fn close(&self, _conn: usize) {
            self.closed.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn key() -> PeerKey {
        PeerKey {
            host: "peer".into(),
            port: 21,
            user: Some("u".into()),
        }
    }

    #[test]
    fn reuses_connection_within_uptime() {
        let connector = Arc::new(FakeConnector::new());
        let pool = ConnectionPool::new(connector.clone());
        let uptime = Duration::from_secs(30);

        drop(pool.acquire(key(), uptime, &ConnectAuth::default()).unwrap());
        drop(pool.acquire(key(), uptime, &ConnectAuth::default()).unwrap());
        assert_eq!(connector.opened.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn expired_connection_is_reopened() {
        let connector = Arc::new(FakeConnector::new());
        let pool = ConnectionPool::new(connector.clone());

        drop(pool.acquire(key(), Duration::ZERO, &ConnectAuth::default()).unwrap());
        drop(pool.acquire(key(), Duration::ZERO, &ConnectAuth::default()).unwrap());
        assert_eq!(connector.opened.load(Ordering::SeqCst), 2);
        assert_eq!(connector.closed.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn at_most_one_connection_per_key() {
        let connector = Arc::new(FakeConnector::new());
        let pool = Arc::new(ConnectionPool::new(connector.clone()));
        let uptime = Duration::from_secs(30);

        let handle = pool.acquire(key(), uptime, &ConnectAuth::default()).unwrap();
        assert_eq!(pool.len(), 1);

        // A second acquire must wait for the release, not open a second
        // connection.
        let pool2 = pool.clone();
        let waiter = std::thread::spawn(move || {
            drop(pool2.acquire(key(), uptime, &ConnectAuth::default()).unwrap());
        });
        std::thread::sleep(Duration::from_millis(50));
        drop(handle);
        waiter.join().unwrap();
        assert_eq!(connector.opened.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn distinct_users_get_distinct_connections() {
        let connector = Arc::new(FakeConnector::new());
        let pool = ConnectionPool::new(connector.clone());
        let uptime = Duration::from_secs(30);
        let other = PeerKey {
            user: Some("v".into()),
            ..key()
        };

        let _a = pool.acquire(key(), uptime, &ConnectAuth::default()).unwrap();
        let _b = pool.acquire(other, uptime, &ConnectAuth::default()).unwrap();
        assert_eq!(connector.opened.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn reap_closes_expired_only() {
        let connector = Arc::new(FakeConnector::new());
        let pool = ConnectionPool::new(connector.clone());

        drop(pool.acquire(key(), Duration::ZERO, &ConnectAuth::default()).unwrap());
        pool.reap_idle();
        assert_eq!(connector.closed.load(Ordering::SeqCst), 1);
        assert!(pool.is_empty());
    }

    #[test]
    fn shutdown_drains_idle_connections() {
        let connector = Arc::new(FakeConnector::new());
        let pool = ConnectionPool::new(connector.clone());

        drop(pool.acquire(key(), Duration::from_secs(30), &ConnectAuth::default()).unwrap());
        pool.shutdown();
        assert_eq!(connector.closed.load(Ordering::SeqCst), 1);
        assert!(pool.is_empty());
    }

    #[test]
    fn discard_removes_from_pool() {
        let connector = Arc::new(FakeConnector::new());
        let pool = ConnectionPool::new(connector.clone());

        let handle = pool.acquire(key(), Duration::from_secs(30), &ConnectAuth::default()).unwrap();
        handle.discard();
        assert!(pool.is_empty());
        // Next acquire reconnects.
        drop(pool.acquire(key(), Duration::from_secs(30), &ConnectAuth::default()).unwrap());
        assert_eq!(connector.opened.load(Ordering::SeqCst), 2);
    }
}
