// ferry-movers: scheme-keyed transfer backends.
//
// A mover owns one URL scheme. The registry is built once at startup; no
// runtime name lookup. Transfers are blocking I/O and run on the blocking
// thread pool; `move_file_to` is the single async entry point the services
// call.

use std::path::Path;
use std::sync::Arc;

use serde_json::Value;
use tracing::{debug, info};
use url::Url;

use ferry_util::clean_url;

mod file;
mod ftp;
pub mod pool;
mod s3;
mod ssh;

pub use file::FileMover;
pub use ftp::FtpMover;
pub use s3::S3Mover;
pub use ssh::{next_destination, ScpMover, SftpMover};

/// Free-form connection parameters from the chain config
/// (`connection_parameters__*` keys, already folded into a nested map).
pub type Params = serde_json::Map<String, Value>;

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum MoverError {
    #[error("unsupported protocol '{0}'")]
    UnsupportedScheme(String),
    #[error("connection to {0} failed: {1}")]
    Connect(String, String),
    #[error("transfer failed: {0}")]
    Transfer(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

// ---------------------------------------------------------------------------
// Mover trait and registry
// ---------------------------------------------------------------------------

/// One transfer backend. `copy` must be idempotent, create missing parent
/// directories, and never leak credentials into logs or the returned URL.
pub trait Mover: Send + Sync {
    /// Upload `origin` to `destination`. Returns the destination actually
    /// used (backup-target rotation may change the host).
    fn copy(
        &self,
        origin: &Path,
        destination: &Url,
        params: &Params,
        backup_targets: &[String],
    ) -> Result<Url, MoverError>;

    /// `copy` followed by removal of the origin.
    fn move_file(
        &self,
        origin: &Path,
        destination: &Url,
        params: &Params,
        backup_targets: &[String],
    ) -> Result<Url, MoverError> {
        let dest = self.copy(origin, destination, params, backup_targets)?;
        std::fs::remove_file(origin)?;
        Ok(dest)
    }

    /// Drain pooled connections, when the mover keeps any.
    fn close_connections(&self) {}
}

/// Scheme → mover. Built once, shared by every chain.
#[derive(Clone)]
pub struct MoverRegistry {
    entries: Arc<Vec<(&'static str, Arc<dyn Mover>)>>,
}

impl MoverRegistry {
    /// The standard registry: `file` (and schemeless), `ftp`, `scp`,
    /// `sftp`, `s3`.
    pub fn standard() -> Self {
        let entries: Vec<(&'static str, Arc<dyn Mover>)> = vec![
            ("file", Arc::new(FileMover)),
            ("", Arc::new(FileMover)),
            ("ftp", Arc::new(FtpMover::new())),
            ("scp", Arc::new(ScpMover::new())),
            ("sftp", Arc::new(SftpMover)),
            ("s3", Arc::new(S3Mover)),
        ];
        MoverRegistry {
            entries: Arc::new(entries),
        }
    }

    pub fn get(&self, scheme: &str) -> Result<Arc<dyn Mover>, MoverError> {
        self.entries
            .iter()
            .find(|(s, _)| *s == scheme)
            .map(|(_, m)| m.clone())
            .ok_or_else(|| MoverError::UnsupportedScheme(scheme.to_owned()))
    }

    /// Drain every mover's connection pool (shutdown path).
    pub fn close_connections(&self) {
        for (_, mover) in self.entries.iter() {
            mover.close_connections();
        }
    }

    /// Copy `origin` to `destination` on the blocking pool and return the
    /// credential-stripped destination actually used.
    pub async fn move_file_to(
        &self,
        origin: &Path,
        destination: &Url,
        params: &Params,
        backup_targets: &[String],
    ) -> Result<Url, MoverError> {
        let mover = self.get(destination.scheme())?;
        debug!(
            origin = %origin.display(),
            destination = %clean_url(destination),
            "starting transfer"
        );

        let origin = origin.to_path_buf();
        let destination = destination.clone();
        let params = params.clone();
        let backups = backup_targets.to_vec();
        let result = tokio::task::spawn_blocking(move || {
            mover.copy(&origin, &destination, &params, &backups)
        })
        .await
        .map_err(|e| MoverError::Transfer(format!("transfer task died: {e}")))?;

        match &result {
            Ok(dest) => info!(destination = %clean_url(dest), "transfer done"),
            Err(err) => debug!(error = %err, "transfer failed"),
        }
        result
    }
}

/// Append `rel_path` to a destination URL's path, the way the push handler
/// places files under a requested subdirectory.
pub fn with_rel_path(destination: &Url, rel_path: Option<&str>) -> Url {
    let Some(rel) = rel_path.filter(|r| !r.is_empty()) else {
        return destination.clone();
    };
    let mut out = destination.clone();
    let joined = format!(
        "{}/{}",
        destination.path().trim_end_matches('/'),
        rel.trim_start_matches('/')
    );
    out.set_path(&joined);
    out
}
