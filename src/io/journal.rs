//! Notification journal - appends notification snapshots to a file
//!
//! Snapshots are written in JSONL format (one JSON object per line): one on
//! first persist and one after every later change to the same notification.
//! Dedup hits are never re-journaled. Replay keeps the latest state per id.
//!
//! Writes are blocking; async callers run them on the blocking pool.

use crate::domain::notification::Notification;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

#[derive(Debug, Clone)]
pub struct Journal {
    file_path: PathBuf,
}

impl Journal {
    pub fn new(file_path: impl Into<PathBuf>) -> Self {
        let file_path = file_path.into();
        info!(file_path = %file_path.display(), "journal_initialized");
        Self { file_path }
    }

    pub fn path(&self) -> &Path {
        &self.file_path
    }

    /// Append one notification snapshot as a JSON line
    pub fn append(&self, notification: &Notification) -> std::io::Result<()> {
        let json = serde_json::to_string(notification)?;
        self.append_line(&json)
    }

    fn append_line(&self, line: &str) -> std::io::Result<()> {
        // Create parent directories if they don't exist
        if let Some(parent) = self.file_path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let mut file = OpenOptions::new().create(true).append(true).open(&self.file_path)?;

        writeln!(file, "{}", line)?;
        debug!(file = %self.file_path.display(), bytes = %line.len(), "journal_written");

        Ok(())
    }

    /// Read every journaled snapshot back in write order, skipping malformed lines
    pub fn load(&self) -> std::io::Result<Vec<Notification>> {
        let content = match std::fs::read_to_string(&self.file_path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e),
        };

        let mut skipped = 0usize;
        let notifications: Vec<Notification> = content
            .lines()
            .filter(|line| !line.trim().is_empty())
            .filter_map(|line| match serde_json::from_str(line) {
                Ok(n) => Some(n),
                Err(_) => {
                    skipped += 1;
                    None
                }
            })
            .collect();

        info!(
            file = %self.file_path.display(),
            loaded = %notifications.len(),
            skipped = %skipped,
            "journal_loaded"
        );
        Ok(notifications)
    }
}
