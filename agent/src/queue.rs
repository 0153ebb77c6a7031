use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tracing::warn;

use growbot_common::QueueEntry;

/// On-disk home of one device's pending action queue. One record per line;
/// rewritten whole on every change via a temp file and rename, so a crash
/// mid-write leaves the previous snapshot intact.
pub struct QueueStore {
    path: PathBuf,
}

impl QueueStore {
    pub fn new(data_dir: &Path, device_id: &str) -> Self {
        Self {
            path: data_dir.join(format!("{device_id}.queue")),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Reads the persisted queue. A missing file is an empty queue; a record
    /// that no longer parses is dropped with a warning rather than taking the
    /// whole queue down. Sequence numbers are reassigned in file order.
    pub async fn load(&self) -> Result<Vec<QueueEntry>> {
        let raw = match tokio::fs::read_to_string(&self.path).await {
            Ok(raw) => raw,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => {
                return Err(err).with_context(|| format!("reading {}", self.path.display()))
            }
        };

        let mut entries = Vec::new();
        for line in raw.lines().filter(|line| !line.trim().is_empty()) {
            match QueueEntry::from_record(line) {
                Ok(mut entry) => {
                    entry.seq = entries.len() as u64;
                    entries.push(entry);
                }
                Err(reason) => {
                    warn!(path = %self.path.display(), %reason, "dropping unreadable queue record");
                }
            }
        }
        Ok(entries)
    }

    pub async fn persist(&self, entries: &[QueueEntry]) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .with_context(|| format!("creating {}", parent.display()))?;
        }

        let mut body = String::new();
        for entry in entries {
            body.push_str(&entry.to_record());
            body.push('\n');
        }

        let staging = self.path.with_extension("queue.tmp");
        tokio::fs::write(&staging, body)
            .await
            .with_context(|| format!("writing {}", staging.display()))?;
        tokio::fs::rename(&staging, &self.path)
            .await
            .with_context(|| format!("replacing {}", self.path.display()))?;
        Ok(())
    }
}
