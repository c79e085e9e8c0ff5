//! Durable write-behind store for tasks and workflows.
//!
//! The in-memory queue and coordinator state stay authoritative for scheduling;
//! a store only records transitions so a later process can replay them.

pub mod file;

pub use file::JsonFileStore;

use crate::error::Result;
use crate::task::types::Task;
use crate::workflow::types::Workflow;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tracing::warn;

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum RecordKind {
    Task,
    Workflow,
}

/// Anything the engine persists
#[derive(Serialize, Deserialize, Clone, Debug)]
#[serde(tag = "kind", content = "record", rename_all = "lowercase")]
pub enum StoredRecord {
    Task(Task),
    Workflow(Workflow),
}

impl StoredRecord {
    pub fn kind(&self) -> RecordKind {
        match self {
            StoredRecord::Task(_) => RecordKind::Task,
            StoredRecord::Workflow(_) => RecordKind::Workflow,
        }
    }

    pub fn id(&self) -> &str {
        match self {
            StoredRecord::Task(task) => &task.id,
            StoredRecord::Workflow(workflow) => &workflow.id,
        }
    }
}

/// Persistence collaborator
#[async_trait::async_trait]
pub trait StateStore: Send + Sync {
    /// Insert or overwrite a record
    async fn save(&self, record: &StoredRecord) -> Result<()>;
    async fn load(&self, kind: RecordKind, id: &str) -> Result<Option<StoredRecord>>;
    /// Returns whether a record was removed
    async fn delete(&self, kind: RecordKind, id: &str) -> Result<bool>;
    async fn list_all(&self) -> Result<Vec<StoredRecord>>;
}

/// Process-local store, mostly for tests and embedding
#[derive(Debug, Default)]
pub struct MemoryStore {
    records: DashMap<(RecordKind, String), StoredRecord>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

#[async_trait::async_trait]
impl StateStore for MemoryStore {
    async fn save(&self, record: &StoredRecord) -> Result<()> {
        self.records
            .insert((record.kind(), record.id().to_string()), record.clone());
        Ok(())
    }

    async fn load(&self, kind: RecordKind, id: &str) -> Result<Option<StoredRecord>> {
        Ok(self
            .records
            .get(&(kind, id.to_string()))
            .map(|entry| entry.value().clone()))
    }

    async fn delete(&self, kind: RecordKind, id: &str) -> Result<bool> {
        Ok(self.records.remove(&(kind, id.to_string())).is_some())
    }

    async fn list_all(&self) -> Result<Vec<StoredRecord>> {
        Ok(self
            .records
            .iter()
            .map(|entry| entry.value().clone())
            .collect())
    }
}

enum WriteOp {
    Save(StoredRecord),
    Flush(oneshot::Sender<()>),
}

/// Ordered write-behind queue in front of a [`StateStore`].
///
/// Records are handed over synchronously, usually while the caller still holds
/// its state lock, and saved by a single worker in submission order. Save
/// failures are logged and otherwise ignored. Must be created inside a tokio
/// runtime.
#[derive(Clone)]
pub struct WriteBehind {
    sender: mpsc::UnboundedSender<WriteOp>,
}

impl WriteBehind {
    pub fn new(store: Arc<dyn StateStore>) -> Self {
        let (sender, mut receiver) = mpsc::unbounded_channel();
        tokio::spawn(async move {
            while let Some(op) = receiver.recv().await {
                match op {
                    WriteOp::Save(record) => {
                        if let Err(e) = store.save(&record).await {
                            warn!(
                                "Failed to persist {:?} {}: {}",
                                record.kind(),
                                record.id(),
                                e
                            );
                        }
                    }
                    WriteOp::Flush(done) => {
                        let _ = done.send(());
                    }
                }
            }
        });
        Self { sender }
    }

    pub fn save(&self, record: StoredRecord) {
        if self.sender.send(WriteOp::Save(record)).is_err() {
            warn!("Write-behind worker has stopped; record dropped");
        }
    }

    /// Resolves once every record handed over before this call has been written
    pub async fn flush(&self) {
        let (done, wait) = oneshot::channel();
        if self.sender.send(WriteOp::Flush(done)).is_ok() {
            let _ = wait.await;
        }
    }
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    #[default]
    None,
    Memory,
    File,
}

/// Which store, if any, backs the manager and coordinator
#[derive(Serialize, Deserialize, Clone, Debug, Default)]
pub struct StorageConfig {
    #[serde(default)]
    pub backend: StorageBackend,
    /// Root of the file store; defaults to `./.taskflow/state`
    #[serde(default)]
    pub path: Option<PathBuf>,
}

impl StorageConfig {
    pub fn resolved_path(&self) -> PathBuf {
        self.path.clone().unwrap_or_else(|| {
            let current_dir = std::env::current_dir().unwrap_or_else(|_| PathBuf::from("."));
            crate::env::state_dir_path(&current_dir)
        })
    }
}

/// Build the store selected by configuration
pub fn store_from_config(config: &StorageConfig) -> Result<Option<Arc<dyn StateStore>>> {
    match config.backend {
        StorageBackend::None => Ok(None),
        StorageBackend::Memory => Ok(Some(Arc::new(MemoryStore::new()))),
        StorageBackend::File => {
            let store = JsonFileStore::new(config.resolved_path())?;
            Ok(Some(Arc::new(store)))
        }
    }
}
