use chrono::{Local, Utc};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::PathBuf;
use tracing::warn;

use crate::layout::sanitize;

/// Append-only per-source event log.
///
/// One file per source per day (`<source>_<YYYYMMDD>.log`), one formatted
/// line per processed event, flushed on every write so the file is current
/// even if the process dies mid-run. Logging failures are reported via
/// tracing and never propagate into the request path.
pub struct EventLog {
    dir: PathBuf,
    files: Mutex<HashMap<String, DatedFile>>,
}

struct DatedFile {
    date: String,
    file: File,
}

impl EventLog {
    pub fn new(dir: impl Into<PathBuf>) -> std::io::Result<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)?;
        Ok(Self {
            dir,
            files: Mutex::new(HashMap::new()),
        })
    }

    /// Append one line to the source's log for today
    pub fn append(&self, source: &str, message: &str) {
        if let Err(e) = self.try_append(source, message) {
            warn!(error = %e, source, "Failed to append to event log");
        }
    }

    fn try_append(&self, source: &str, message: &str) -> std::io::Result<()> {
        let source = sanitize(source);
        let date = Local::now().format("%Y%m%d").to_string();

        let mut files = self.files.lock();
        if !matches!(files.get(&source), Some(entry) if entry.date == date) {
            let path = self.dir.join(format!("{source}_{date}.log"));
            let file = OpenOptions::new().create(true).append(true).open(path)?;
            files.insert(source.clone(), DatedFile { date, file });
        }

        if let Some(entry) = files.get_mut(&source) {
            let timestamp = Utc::now().format("%Y-%m-%d %H:%M:%S");
            writeln!(entry.file, "{timestamp} - INFO - {message}")?;
            entry.file.flush()?;
            entry.file.sync_data()?;
        }
        Ok(())
    }

    /// Path of the current log file for a source, for diagnostics
    pub fn current_path(&self, source: &str) -> PathBuf {
        let date = Local::now().format("%Y%m%d");
        self.dir.join(format!("{}_{date}.log", sanitize(source)))
    }
}
