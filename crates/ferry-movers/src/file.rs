//! Local filesystem mover (`file://` and schemeless destinations).

use std::fs;
use std::path::{Path, PathBuf};

use url::Url;

use crate::{MoverError, Mover, Params};

pub struct FileMover;

impl Mover for FileMover {
    fn copy(
        &self,
        origin: &Path,
        destination: &Url,
        _params: &Params,
        _backup_targets: &[String],
    ) -> Result<Url, MoverError> {
        let target = resolve_target(origin, destination);
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent)?;
        }
        // Hard link is the cheap path; cross-device links fall back to a
        // plain copy.
        if target.exists() {
            fs::remove_file(&target)?;
        }
        if fs::hard_link(origin, &target).is_err() {
            fs::copy(origin, &target)?;
        }
        Ok(destination.clone())
    }

    fn move_file(
        &self,
        origin: &Path,
        destination: &Url,
        _params: &Params,
        _backup_targets: &[String],
    ) -> Result<Url, MoverError> {
        let target = resolve_target(origin, destination);
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent)?;
        }
        if fs::rename(origin, &target).is_err() {
            fs::copy(origin, &target)?;
            fs::remove_file(origin)?;
        }
        Ok(destination.clone())
    }
}

/// A destination path ending in `/`, or naming an existing directory, means
/// "place the file inside, keeping its name".
pub(crate) fn resolve_target(origin: &Path, destination: &Url) -> PathBuf {
    let path = PathBuf::from(destination.path());
    if destination.path().ends_with('/') || path.is_dir() {
        match origin.file_name() {
            Some(name) => path.join(name),
            None => path,
        }
    } else {
        path
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Map;

    #[test]
    fn copies_into_directory_destination() {
        let dir = tempfile::tempdir().unwrap();
        let out = tempfile::tempdir().unwrap();
        let src = dir.path().join("a.dat");
        fs::write(&src, b"data").unwrap();

        let dest = Url::parse(&format!("file://{}/", out.path().display())).unwrap();
        FileMover.copy(&src, &dest, &Map::new(), &[]).unwrap();

        assert_eq!(fs::read(out.path().join("a.dat")).unwrap(), b"data");
        assert!(src.exists(), "copy must keep the origin");
    }

    #[test]
    fn copies_to_explicit_file_path() {
        let dir = tempfile::tempdir().unwrap();
        let out = tempfile::tempdir().unwrap();
        let src = dir.path().join("a.dat");
        fs::write(&src, b"data").unwrap();

        let target = out.path().join("renamed.dat");
        let dest = Url::parse(&format!("file://{}", target.display())).unwrap();
        FileMover.copy(&src, &dest, &Map::new(), &[]).unwrap();

        assert_eq!(fs::read(&target).unwrap(), b"data");
    }

    #[test]
    fn copy_creates_missing_parents() {
        let dir = tempfile::tempdir().unwrap();
        let out = tempfile::tempdir().unwrap();
        let src = dir.path().join("a.dat");
        fs::write(&src, b"x").unwrap();

        let target = out.path().join("deep/nested/a.dat");
        let dest = Url::parse(&format!("file://{}", target.display())).unwrap();
        FileMover.copy(&src, &dest, &Map::new(), &[]).unwrap();
        assert!(target.exists());
    }

    #[test]
    fn copy_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let out = tempfile::tempdir().unwrap();
        let src = dir.path().join("a.dat");
        fs::write(&src, b"data").unwrap();

        let dest = Url::parse(&format!("file://{}/", out.path().display())).unwrap();
        FileMover.copy(&src, &dest, &Map::new(), &[]).unwrap();
        FileMover.copy(&src, &dest, &Map::new(), &[]).unwrap();
        assert_eq!(fs::read(out.path().join("a.dat")).unwrap(), b"data");
    }

    #[test]
    fn move_removes_origin() {
        let dir = tempfile::tempdir().unwrap();
        let out = tempfile::tempdir().unwrap();
        let src = dir.path().join("a.dat");
        fs::write(&src, b"data").unwrap();

        let dest = Url::parse(&format!("file://{}/", out.path().display())).unwrap();
        FileMover.move_file(&src, &dest, &Map::new(), &[]).unwrap();

        assert!(!src.exists());
        assert!(out.path().join("a.dat").exists());
    }
}
