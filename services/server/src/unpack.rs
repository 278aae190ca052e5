//! Named unpackers.
//!
//! A chain's `compression` key selects one by name from an explicit
//! registry. Unpackers take the packed file and an optional working
//! directory and return the paths they produced; the caller decides whether
//! the original is deleted.

use std::io::Read;
use std::path::{Path, PathBuf};
use std::process::Command;

use tracing::{debug, info};

#[derive(Debug, thiserror::Error)]
pub enum UnpackError {
    #[error("unknown compression '{0}'")]
    Unknown(String),
    #[error("external decompressor failed: {0}")]
    Program(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Resolve an unpacker by its configured name.
pub fn unpacker(name: &str) -> Result<Unpacker, UnpackError> {
    match name.to_ascii_lowercase().as_str() {
        "xrit" => Ok(Unpacker::Xrit),
        "bzip" => Ok(Unpacker::Bzip),
        "tar" => Ok(Unpacker::Tar),
        other => Err(UnpackError::Unknown(other.to_owned())),
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Unpacker {
    Xrit,
    Bzip,
    Tar,
}

impl Unpacker {
    /// Unpack `path` into `working_dir` (defaults to the file's own
    /// directory). Returns the produced paths.
    pub fn unpack(
        &self,
        path: &Path,
        working_dir: Option<&Path>,
        prog: Option<&str>,
    ) -> Result<Vec<PathBuf>, UnpackError> {
        match self {
            Unpacker::Xrit => xrit(path, working_dir, prog).map(|p| vec![p]),
            Unpacker::Bzip => bzip(path, working_dir).map(|p| vec![p]),
            Unpacker::Tar => untar(path, working_dir),
        }
    }
}

/// Run the external xRIT decompressor. The tool writes `<name minus "C_">__`
/// next to its working directory.
fn xrit(path: &Path, working_dir: Option<&Path>, prog: Option<&str>) -> Result<PathBuf, UnpackError> {
    let cmd = prog.unwrap_or("./xRITDecompress");
    let cwd = working_dir
        .map(Path::to_path_buf)
        .or_else(|| path.parent().map(Path::to_path_buf))
        .unwrap_or_else(std::env::temp_dir);

    let output = Command::new(cmd)
        .arg(path)
        .current_dir(&cwd)
        .output()
        .map_err(|e| UnpackError::Program(format!("{cmd}: {e}")))?;
    if !output.status.success() {
        return Err(UnpackError::Program(format!(
            "{cmd} exited with {}: {}",
            output.status,
            String::from_utf8_lossy(&output.stderr)
        )));
    }

    let name = path
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or_default();
    let expected = cwd.join(format!("{}__", &name[..name.len().saturating_sub(2)]));
    info!(from = %path.display(), to = %expected.display(), "xrit decompressed");
    Ok(expected)
}

/// Decompress a `.bz2` file, stripping the suffix.
fn bzip(path: &Path, working_dir: Option<&Path>) -> Result<PathBuf, UnpackError> {
    let name = path
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or_default();
    let out_name = name.strip_suffix(".bz2").unwrap_or(name);
    let out_dir = working_dir
        .map(Path::to_path_buf)
        .or_else(|| path.parent().map(Path::to_path_buf))
        .unwrap_or_else(std::env::temp_dir);
    let out_path = out_dir.join(out_name);
    if out_path.exists() {
        return Ok(out_path);
    }

    let mut decoder = bzip2::read::BzDecoder::new(std::fs::File::open(path)?);
    let mut content = Vec::new();
    decoder.read_to_end(&mut content)?;
    std::fs::write(&out_path, content)?;
    debug!(from = %path.display(), to = %out_path.display(), "bunzipped");
    Ok(out_path)
}

/// Extract a tar archive next to itself, returning the member paths.
fn untar(path: &Path, working_dir: Option<&Path>) -> Result<Vec<PathBuf>, UnpackError> {
    let out_dir = working_dir
        .map(Path::to_path_buf)
        .or_else(|| path.parent().map(Path::to_path_buf))
        .unwrap_or_else(std::env::temp_dir);

    let mut archive = tar::Archive::new(std::fs::File::open(path)?);
    let mut members = Vec::new();
    for entry in archive.entries()? {
        let mut entry = entry?;
        let member = out_dir.join(entry.path()?);
        entry.unpack(&member)?;
        members.push(member);
    }
    debug!(from = %path.display(), members = members.len(), "untarred");
    Ok(members)
}
