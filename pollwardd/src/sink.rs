use async_trait::async_trait;
use pollward::api::WorkRecord;
use pollward::supervisor::{BoxError, WorkSink};
use std::path::{Path, PathBuf};
use tokio::fs::{File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::debug;

/// Append-only JSON lines file acting as the durable work queue
///
/// A record counts as published once it is synced to disk. Consumers
/// may see the same `update_id` more than once after a failover.
pub struct JsonLinesSink {
    path: PathBuf,
    file: Mutex<File>,
}

impl JsonLinesSink {
    pub async fn open(path: &Path) -> std::io::Result<Self> {
        if let Some(dir) = path.parent() {
            tokio::fs::create_dir_all(dir).await?;
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .await?;
        debug!(path = %path.display(), "Work queue opened");
        Ok(Self {
            path: path.to_owned(),
            file: Mutex::new(file),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl WorkSink for JsonLinesSink {
    async fn publish(&self, work: &WorkRecord) -> Result<(), BoxError> {
        let mut line = serde_json::to_vec(work)?;
        line.push(b'\n');

        let mut file = self.file.lock().await;
        file.write_all(&line).await?;
        file.sync_data().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pollward::api::ContentType;

    fn text(update_id: u64) -> WorkRecord {
        WorkRecord {
            content_type: ContentType::Text,
            update_id,
            user_id: "7".into(),
            source_timestamp: 1_700_000_000,
            received_timestamp_ms: 1_700_000_000_123,
            text: Some("hello".into()),
            media_link: None,
            class_id: None,
        }
    }

    #[tokio::test]
    async fn appends_one_line_per_record() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("queue").join("work.jsonl");

        let sink = JsonLinesSink::open(&path).await?;
        sink.publish(&text(1)).await.map_err(|e| anyhow::anyhow!(e))?;
        sink.publish(&text(2)).await.map_err(|e| anyhow::anyhow!(e))?;
        drop(sink);

        // reopening appends instead of truncating
        let sink = JsonLinesSink::open(&path).await?;
        sink.publish(&text(2)).await.map_err(|e| anyhow::anyhow!(e))?;

        let content = std::fs::read_to_string(sink.path())?;
        let ids: Vec<u64> = content
            .lines()
            .map(|line| serde_json::from_str::<WorkRecord>(line).map(|w| w.update_id))
            .collect::<Result<_, _>>()?;
        assert_eq!(ids, vec![1, 2, 2]);
        assert!(!content.contains("media_link"));
        Ok(())
    }
}
