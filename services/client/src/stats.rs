//! Optional per-chain statistics file: one line per handled announcement.

use std::io::Write;
use std::path::PathBuf;

use tracing::warn;

use ferry_protocol::Message;

#[derive(Debug, Clone)]
pub struct StatsCollector {
    path: PathBuf,
}

impl StatsCollector {
    pub fn new(path: impl Into<PathBuf>) -> StatsCollector {
        StatsCollector { path: path.into() }
    }

    pub fn collect(&self, msg: &Message) {
        let line = format!("{} - {}\n", chrono::Utc::now().to_rfc3339(), msg);
        let result = std::fs::File::options()
            .create(true)
            .append(true)
            .open(&self.path)
            .and_then(|mut file| file.write_all(line.as_bytes()));
        if let Err(err) = result {
            warn!(path = %self.path.display(), error = %err, "could not write statistics");
        }
    }
}
