//! Append-only JSON-lines sink.

use crate::notify::{NotificationSink, NotifyError, VaultEvent};
use async_trait::async_trait;
use serde::Serialize;
use std::path::PathBuf;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

#[derive(Serialize)]
struct Line<'a> {
    at: String,
    #[serde(flatten)]
    event: &'a VaultEvent,
}

pub struct FileSink {
    path: PathBuf,
    /// One writer at a time so lines never interleave.
    lock: Mutex<()>,
}

impl FileSink {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: Mutex::new(()),
        }
    }
}

#[async_trait]
impl NotificationSink for FileSink {
    fn name(&self) -> &'static str {
        "file"
    }

    async fn deliver(&self, event: &VaultEvent) -> Result<(), NotifyError> {
        let mut line = serde_json::to_vec(&Line {
            at: chrono::Utc::now().to_rfc3339(),
            event,
        })?;
        line.push(b'\n');

        let _guard = self.lock.lock().await;
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await?;
        file.write_all(&line).await?;
        file.flush().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vault::sample_record;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_appends_one_line_per_event() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("events.jsonl");
        let sink = FileSink::new(&path);

        let record = sample_record("0xaa", 1000, 0, 10);
        sink.deliver(&VaultEvent::VaultCreated {
            record: record.clone(),
            filled: false,
        })
        .await
        .unwrap();
        sink.deliver(&VaultEvent::VaultFilled { record }).await.unwrap();

        let contents = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<serde_json::Value> = contents
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0]["kind"], "vault_created");
        assert_eq!(lines[0]["filled"], false);
        assert_eq!(lines[1]["kind"], "vault_filled");
        assert!(lines[1]["at"].is_string());
    }
}
