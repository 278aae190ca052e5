//! FTP mover with pooled control connections.
//!
//! Credentials come from the destination URL, falling back to `~/.netrc`
//! when the URL carries none. Anonymous login otherwise.

use std::fs::File;
use std::path::Path;
use std::time::Duration;

use suppaftp::FtpStream;
use tracing::{debug, warn};
use url::Url;

use crate::pool::{ConnectAuth, ConnectionPool, Connector, PeerKey};
use crate::{MoverError, Mover, Params};

const DEFAULT_FTP_PORT: u16 = 21;
const DEFAULT_CONNECTION_UPTIME: u64 = 30;

pub struct FtpMover {
    pool: ConnectionPool<FtpConnector>,
}

impl FtpMover {
    pub fn new() -> Self {
        FtpMover {
            pool: ConnectionPool::new(FtpConnector),
        }
    }

}

impl Default for FtpMover {
    fn default() -> Self {
        Self::new()
    }
}

impl Mover for FtpMover {
    fn copy(
        &self,
        origin: &Path,
        destination: &Url,
        params: &Params,
        _backup_targets: &[String],
    ) -> Result<Url, MoverError> {
        let host = destination
            .host_str()
            .ok_or_else(|| MoverError::Transfer("ftp destination has no host".into()))?
            .to_owned();
        let port = destination.port().unwrap_or(DEFAULT_FTP_PORT);

        let (user, password) = credentials(destination, &host);
        let key = PeerKey {
            host: host.clone(),
            port,
            user: user.clone(),
        };
        let auth = ConnectAuth {
            password,
            ..ConnectAuth::default()
        };
        let uptime = Duration::from_secs(
            params
                .get("connection_uptime")
                .and_then(|v| v.as_u64())
                .unwrap_or(DEFAULT_CONNECTION_UPTIME),
        );

        self.pool.reap_idle();
        let mut handle = self.pool.acquire(key, uptime, &auth)?;

        let result = upload(handle.conn(), origin, destination.path());
        if result.is_err() {
            handle.discard();
        }
        result?;
        Ok(destination.clone())
    }

    fn close_connections(&self) {
        self.pool.shutdown();
    }
}

fn upload(ftp: &mut FtpStream, origin: &Path, dest_path: &str) -> Result<(), MoverError> {
    let (dirname, filename) = match dest_path.rsplit_once('/') {
        Some((dir, name)) => (dir, name),
        None => ("", dest_path),
    };
    cd_tree(ftp, dirname)?;

    let filename = if filename.is_empty() {
        origin
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| MoverError::Transfer("origin has no usable name".into()))?
            .to_owned()
    } else {
        filename.to_owned()
    };

    let mut reader = File::open(origin)?;
    ftp.put_file(&filename, &mut reader)
        .map_err(|e| MoverError::Transfer(format!("STOR {filename}: {e}")))?;
    Ok(())
}

/// Change into `dir`, creating missing components on the way.
fn cd_tree(ftp: &mut FtpStream, dir: &str) -> Result<(), MoverError> {
    if dir.is_empty() {
        return Ok(());
    }
    if ftp.cwd(dir).is_ok() {
        return Ok(());
    }
    let parent = dir.rsplit_once('/').map(|(p, _)| p).unwrap_or("");
    cd_tree(ftp, parent)?;
    ftp.mkdir(dir)
        .map_err(|e| MoverError::Transfer(format!("MKD {dir}: {e}")))?;
    ftp.cwd(dir)
        .map_err(|e| MoverError::Transfer(format!("CWD {dir}: {e}")))?;
    Ok(())
}

fn credentials(destination: &Url, host: &str) -> (Option<String>, Option<String>) {
    let url_user = Some(destination.username())
        .filter(|u| !u.is_empty())
        .map(str::to_owned);
    let url_password = destination.password().map(str::to_owned);
    if url_user.is_some() {
        return (url_user, url_password);
    }
    match netrc_lookup(host) {
        Some((user, password)) => {
            debug!("ftp credentials resolved from netrc");
            (Some(user), password)
        }
        None => (None, None),
    }
}

/// Minimal `~/.netrc` lookup: `machine <host> login <user> password <pass>`,
/// with `default` honored as a catch-all.
fn netrc_lookup(host: &str) -> Option<(String, Option<String>)> {
    let path = dirs::home_dir()?.join(".netrc");
    let content = std::fs::read_to_string(path).ok()?;
    netrc_find(&content, host)
}

fn netrc_find(content: &str, host: &str) -> Option<(String, Option<String>)> {
    let tokens: Vec<&str> = content.split_whitespace().collect();
    let mut fallback = None;
    let mut i = 0;
    while i < tokens.len() {
        let (machine, start) = match tokens[i] {
            "machine" if i + 1 < tokens.len() => (Some(tokens[i + 1]), i + 2),
            "default" => (None, i + 1),
            _ => {
                i += 1;
                continue;
            }
        };
        let mut login = None;
        let mut password = None;
        let mut j = start;
        while j + 1 < tokens.len() {
            match tokens[j] {
                "login" => login = Some(tokens[j + 1].to_owned()),
                "password" => password = Some(tokens[j + 1].to_owned()),
                "machine" | "default" => break,
                _ => {
                    j += 1;
                    continue;
                }
            }
            j += 2;
        }
        match machine {
            Some(m) if m == host => return login.map(|l| (l, password)),
            None => fallback = login.map(|l| (l, password)),
            _ => {}
        }
        i = start;
    }
    fallback
}

pub(crate) struct FtpConnector;

impl Connector for FtpConnector {
    type Conn = FtpStream;

    fn connect(&self, key: &PeerKey, auth: &ConnectAuth) -> Result<FtpStream, MoverError> {
        let addr = format!("{}:{}", key.host, key.port);
        let mut ftp = FtpStream::connect(&addr)
            .map_err(|e| MoverError::Connect(addr.clone(), e.to_string()))?;
        match (&key.user, &auth.password) {
            (Some(user), Some(password)) => ftp
                .login(user, password)
                .map_err(|e| MoverError::Connect(addr, format!("login: {e}")))?,
            (Some(user), None) => ftp
                .login(user.as_str(), "")
                .map_err(|e| MoverError::Connect(addr, format!("login: {e}")))?,
            _ => ftp
                .login("anonymous", "anonymous")
                .map_err(|e| MoverError::Connect(addr, format!("login: {e}")))?,
        }
        Ok(ftp)
    }

    fn is_alive(&self, conn: &mut FtpStream) -> bool {
        conn.noop().is_ok()
    }

    fn close(&self, mut conn: FtpStream) {
        if conn.quit().is_err() {
            warn!("ftp connection did not quit cleanly");
        }
    }
}
