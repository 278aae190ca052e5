//! SCP and SFTP movers over libssh2.
//!
//! SCP keeps sessions pooled and honors `backup_targets`: after three failed
//! connect attempts the destination host is rotated to the next backup and
//! the attempt budget restarts. SFTP opens a fresh session per transfer.

use std::io::{Read, Write};
use std::net::{TcpStream, ToSocketAddrs};
use std::path::{Path, PathBuf};
use std::time::Duration;

use ssh2::Session;
use tracing::{debug, info, warn};
use url::Url;

use crate::pool::{ConnectAuth, ConnectionPool, Connector, PeerKey};
use crate::{MoverError, Mover, Params};

const DEFAULT_SSH_PORT: u16 = 22;
const DEFAULT_CONNECTION_UPTIME: u64 = 30;
const CONNECT_ATTEMPTS: u32 = 3;

// ---------------------------------------------------------------------------
// Backup-target rotation
// ---------------------------------------------------------------------------

/// Swap the destination host for the first backup target. Pure so the retry
/// ladder stays testable: returns the rewritten URL and the remaining
/// backups, or `None` when no backup is left.
pub fn next_destination(current: &Url, backups: &[String]) -> Option<(Url, Vec<String>)> {
    let (next_host, rest) = backups.split_first()?;
    let mut out = current.clone();
    out.set_host(Some(next_host)).ok()?;
    Some((out, rest.to_vec()))
}

// ---------------------------------------------------------------------------
// Session plumbing shared by SCP and SFTP
// ---------------------------------------------------------------------------

fn open_session(key: &PeerKey, auth: &ConnectAuth) -> Result<Session, MoverError> {
    let addr = format!("{}:{}", key.host, key.port);
    let sock_addr = addr
        .to_socket_addrs()
        .map_err(|e| MoverError::Connect(addr.clone(), e.to_string()))?
        .next()
        .ok_or_else(|| MoverError::Connect(addr.clone(), "no address".into()))?;

    let tcp = match auth.timeout {
        Some(timeout) => TcpStream::connect_timeout(&sock_addr, timeout),
        None => TcpStream::connect(sock_addr),
    }
    .map_err(|e| MoverError::Connect(addr.clone(), e.to_string()))?;

    let mut session =
        Session::new().map_err(|e| MoverError::Connect(addr.clone(), e.to_string()))?;
    session.set_tcp_stream(tcp);
    session
        .handshake()
        .map_err(|e| MoverError::Connect(addr.clone(), e.to_string()))?;

    let user = key.user.clone().unwrap_or_else(whoami);
    match &auth.key_file {
        Some(key_file) => session
            .userauth_pubkey_file(&user, None, key_file, None)
            .map_err(|e| MoverError::Connect(addr, format!("pubkey auth: {e}")))?,
        None => session
            .userauth_agent(&user)
            .map_err(|e| MoverError::Connect(addr, format!("agent auth: {e}")))?,
    }
    Ok(session)
}

fn whoami() -> String {
    std::env::var("USER").unwrap_or_else(|_| "root".to_owned())
}

fn auth_from_params(params: &Params) -> ConnectAuth {
    ConnectAuth {
        password: None,
        key_file: params
            .get("ssh_key_filename")
            .and_then(|v| v.as_str())
            .map(PathBuf::from),
        timeout: params
            .get("ssh_connection_timeout")
            .and_then(|v| v.as_f64())
            .map(Duration::from_secs_f64),
    }
}

fn remote_path(origin: &Path, destination: &Url) -> Result<String, MoverError> {
    let path = destination.path();
    if !path.ends_with('/') {
        return Ok(path.to_owned());
    }
    let name = origin
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| MoverError::Transfer("origin has no usable name".into()))?;
    Ok(format!("{path}{name}"))
}

// ---------------------------------------------------------------------------
// SCP
// ---------------------------------------------------------------------------

pub struct ScpMover {
    pool: ConnectionPool<SshConnector>,
}

impl ScpMover {
    pub fn new() -> Self {
        ScpMover {
            pool: ConnectionPool::new(SshConnector),
        }
    }

    /// Connect with the retry/backup ladder: three attempts per target,
    /// rotating through `backup_targets` when a target is exhausted.
    fn connect_with_backups<'p>(
        &'p self,
        destination: &Url,
        params: &Params,
        backup_targets: &[String],
    ) -> Result<(crate::pool::PoolHandle<'p, SshConnector>, Url), MoverError> {
        let auth = auth_from_params(params);
        let uptime = Duration::from_secs(
            params
                .get("connection_uptime")
                .and_then(|v| v.as_u64())
                .unwrap_or(DEFAULT_CONNECTION_UPTIME),
        );

        let mut destination = destination.clone();
        let mut backups = backup_targets.to_vec();
        let mut last_error: Option<MoverError> = None;

        loop {
            let host = destination
                .host_str()
                .ok_or_else(|| MoverError::Transfer("scp destination has no host".into()))?
                .to_owned();
            let key = PeerKey {
                host,
                port: destination.port().unwrap_or(DEFAULT_SSH_PORT),
                user: Some(destination.username())
                    .filter(|u| !u.is_empty())
                    .map(str::to_owned),
            };

            for attempt in 1..=CONNECT_ATTEMPTS {
                self.pool.reap_idle();
                match self.pool.acquire(key.clone(), uptime, &auth) {
                    Ok(handle) => return Ok((handle, destination)),
                    Err(err) => {
                        debug!(host = %key.host, attempt, error = %err, "ssh connect failed");
                        last_error = Some(err);
                        std::thread::sleep(Duration::from_secs(2));
                    }
                }
            }

            match next_destination(&destination, &backups) {
                Some((next, rest)) => {
                    info!(host = %next.host_str().unwrap_or(""), "switching to backup target");
                    destination = next;
                    backups = rest;
                }
                None => {
                    return Err(last_error.unwrap_or_else(|| {
                        MoverError::Transfer("ssh connect failed".into())
                    }))
                }
            }
        }
    }
}

impl Default for ScpMover {
    fn default() -> Self {
        Self::new()
    }
}

impl Mover for ScpMover {
    fn copy(
        &self,
        origin: &Path,
        destination: &Url,
        params: &Params,
        backup_targets: &[String],
    ) -> Result<Url, MoverError> {
        let (mut handle, used_destination) =
            self.connect_with_backups(destination, params, backup_targets)?;

        let result = scp_upload(handle.conn(), origin, &remote_path(origin, &used_destination)?);
        if result.is_err() {
            handle.discard();
        }
        result?;
        Ok(used_destination)
    }

    fn close_connections(&self) {
        self.pool.shutdown();
    }
}

fn scp_upload(session: &mut Session, origin: &Path, remote: &str) -> Result<(), MoverError> {
    let mut local = std::fs::File::open(origin)?;
    let size = local.metadata()?.len();

    let mut channel = session
        .scp_send(Path::new(remote), 0o644, size, None)
        .map_err(|e| MoverError::Transfer(format!("scp_send {remote}: {e}")))?;

    let mut buf = [0u8; 64 * 1024];
    loop {
        let n = local.read(&mut buf)?;
        if n == 0 {
            break;
        }
        channel
            .write_all(&buf[..n])
            .map_err(|e| MoverError::Transfer(format!("scp write: {e}")))?;
    }
    let close = |e: ssh2::Error| MoverError::Transfer(format!("scp close: {e}"));
    channel.send_eof().map_err(close)?;
    channel.wait_eof().map_err(close)?;
    channel.close().map_err(close)?;
    channel.wait_close().map_err(close)?;
    Ok(())
}

pub(crate) struct SshConnector;

impl Connector for SshConnector {
    type Conn = Session;

    fn connect(&self, key: &PeerKey, auth: &ConnectAuth) -> Result<Session, MoverError> {
        open_session(key, auth)
    }

    fn is_alive(&self, conn: &mut Session) -> bool {
        conn.authenticated()
    }

    fn close(&self, conn: Session) {
        if conn
            .disconnect(None, "closing idle connection", None)
            .is_err()
        {
            warn!("ssh session did not disconnect cleanly");
        }
    }
}

// ---------------------------------------------------------------------------
// SFTP
// ---------------------------------------------------------------------------

pub struct SftpMover;

impl Mover for SftpMover {
    fn copy(
        &self,
        origin: &Path,
        destination: &Url,
        params: &Params,
        _backup_targets: &[String],
    ) -> Result<Url, MoverError> {
        let host = destination
            .host_str()
            .ok_or_else(|| MoverError::Transfer("sftp destination has no host".into()))?
            .to_owned();
        let key = PeerKey {
            host,
            port: destination.port().unwrap_or(DEFAULT_SSH_PORT),
            user: Some(destination.username())
                .filter(|u| !u.is_empty())
                .map(str::to_owned),
        };
        let session = open_session(&key, &auth_from_params(params))?;
        let sftp = session
            .sftp()
            .map_err(|e| MoverError::Transfer(format!("sftp subsystem: {e}")))?;

        let remote = remote_path(origin, destination)?;
        let remote = Path::new(&remote);
        if let Some(parent) = remote.parent() {
            mkdir_tree(&sftp, parent);
        }

        let mut local = std::fs::File::open(origin)?;
        let mut out = sftp
            .create(remote)
            .map_err(|e| MoverError::Transfer(format!("sftp create {}: {e}", remote.display())))?;
        std::io::copy(&mut local, &mut out)?;
        Ok(destination.clone())
    }
}

fn mkdir_tree(sftp: &ssh2::Sftp, dir: &Path) {
    if dir.as_os_str().is_empty() || sftp.stat(dir).is_ok() {
        return;
    }
    if let Some(parent) = dir.parent() {
        mkdir_tree(sftp, parent);
    }
    // Races with concurrent creators are fine; the stat above is best-effort.
    let _ = sftp.mkdir(dir, 0o755);
}
