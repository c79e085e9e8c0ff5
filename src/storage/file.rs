use super::{RecordKind, StateStore, StoredRecord};
use crate::error::{EngineError, Result};
use std::path::{Path, PathBuf};
use tokio::fs as async_fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};

/// One pretty-printed JSON file per record, under `tasks/` and `workflows/`.
///
/// Writes go to a temp file that is synced and then renamed over the target,
/// so a crash never leaves a half-written record behind.
#[derive(Debug, Clone)]
pub struct JsonFileStore {
    root: PathBuf,
}

impl JsonFileStore {
    pub fn new(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        for kind in [RecordKind::Task, RecordKind::Workflow] {
            std::fs::create_dir_all(root.join(Self::dir_name(kind)))?;
        }
        debug!("Opened JSON file store at {:?}", root);
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn dir_name(kind: RecordKind) -> &'static str {
        match kind {
            RecordKind::Task => "tasks",
            RecordKind::Workflow => "workflows",
        }
    }

    fn record_path(&self, kind: RecordKind, id: &str) -> PathBuf {
        self.root
            .join(Self::dir_name(kind))
            .join(format!("{}.json", encode_file_name(id)))
    }

    async fn read_record(path: &Path) -> Result<StoredRecord> {
        let content = async_fs::read(path).await?;
        Ok(serde_json::from_slice(&content)?)
    }
}

/// Percent-encode anything outside `[A-Za-z0-9_-]` so ids map to distinct names
fn encode_file_name(id: &str) -> String {
    let mut name = String::with_capacity(id.len());
    for byte in id.bytes() {
        if byte.is_ascii_alphanumeric() || byte == b'-' || byte == b'_' {
            name.push(byte as char);
        } else {
            name.push_str(&format!("%{:02X}", byte));
        }
    }
    name
}

#[async_trait::async_trait]
impl StateStore for JsonFileStore {
    async fn save(&self, record: &StoredRecord) -> Result<()> {
        let path = self.record_path(record.kind(), record.id());
        let temp_path = path.with_extension(format!("tmp-{}", uuid::Uuid::new_v4()));
        let data = serde_json::to_vec_pretty(record)?;

        let write = async {
            let mut file = async_fs::File::create(&temp_path).await?;
            file.write_all(&data).await?;
            file.sync_all().await?;
            async_fs::rename(&temp_path, &path).await
        };

        if let Err(e) = write.await {
            let _ = async_fs::remove_file(&temp_path).await;
            return Err(EngineError::Storage(format!(
                "failed to write {:?}: {}",
                path, e
            )));
        }
        Ok(())
    }

    async fn load(&self, kind: RecordKind, id: &str) -> Result<Option<StoredRecord>> {
        let path = self.record_path(kind, id);
        if !async_fs::try_exists(&path).await? {
            return Ok(None);
        }
        Self::read_record(&path).await.map(Some)
    }

    async fn delete(&self, kind: RecordKind, id: &str) -> Result<bool> {
        match async_fs::remove_file(self.record_path(kind, id)).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    async fn list_all(&self) -> Result<Vec<StoredRecord>> {
        let mut records = Vec::new();

        for kind in [RecordKind::Task, RecordKind::Workflow] {
            let mut entries = async_fs::read_dir(self.root.join(Self::dir_name(kind))).await?;
            while let Some(entry) = entries.next_entry().await? {
                let path = entry.path();
                if path.extension().and_then(|e| e.to_str()) != Some("json") {
                    continue;
                }
                match Self::read_record(&path).await {
                    Ok(record) => records.push(record),
                    Err(e) => warn!("Skipping unreadable record {:?}: {}", path, e),
                }
            }
        }

        Ok(records)
    }
}
