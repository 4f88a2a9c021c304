//! Persistence for items and supervisor control state

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use claimline_types::{Item, ItemId};
use parking_lot::RwLock;
use tracing::{debug, warn};

use crate::config::StorageConfig;
use crate::error::StoreError;
use crate::supervisor::ControlSnapshot;

/// Result type for storage operations
pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// A persisted item document that could not be decoded.
#[derive(Debug, Clone, PartialEq)]
pub struct UnreadableItem {
    pub path: PathBuf,
    /// Taken from the document's file name when it names an item.
    pub id: Option<ItemId>,
    pub error: String,
}

/// Everything found in a store on load.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LoadedItems {
    pub items: Vec<Item>,
    pub unreadable: Vec<UnreadableItem>,
}

/// Durable home of the item table and the supervisor's control state.
#[async_trait]
pub trait EngineStore: Send + Sync {
    /// Every persisted item, plus the documents that failed to decode
    async fn load_items(&self) -> StoreResult<LoadedItems>;

    /// Create or replace an item
    async fn save_item(&self, item: &Item) -> StoreResult<()>;

    async fn load_control(&self) -> StoreResult<Option<ControlSnapshot>>;

    async fn save_control(&self, control: &ControlSnapshot) -> StoreResult<()>;
}

/// In-memory store for testing
#[derive(Default)]
pub struct MemoryStore {
    items: RwLock<HashMap<ItemId, Item>>,
    control: RwLock<Option<ControlSnapshot>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn item(&self, id: ItemId) -> Option<Item> {
        self.items.read().get(&id).cloned()
    }

    pub fn control(&self) -> Option<ControlSnapshot> {
        self.control.read().clone()
    }
}

#[async_trait]
impl EngineStore for MemoryStore {
    async fn load_items(&self) -> StoreResult<LoadedItems> {
        Ok(LoadedItems {
            items: self.items.read().values().cloned().collect(),
            unreadable: Vec::new(),
        })
    }

    async fn save_item(&self, item: &Item) -> StoreResult<()> {
        self.items.write().insert(item.id, item.clone());
        Ok(())
    }

    async fn load_control(&self) -> StoreResult<Option<ControlSnapshot>> {
        Ok(self.control.read().clone())
    }

    async fn save_control(&self, control: &ControlSnapshot) -> StoreResult<()> {
        *self.control.write() = Some(control.clone());
        Ok(())
    }
}

/// One JSON document per item plus `control.json`, under a data directory.
///
/// Writes go to a temporary file that is then renamed over the target, so a
/// crash never leaves a half-written document behind.
pub struct FileStore {
    data_dir: PathBuf,
}

impl FileStore {
    pub async fn open(data_dir: impl Into<PathBuf>) -> StoreResult<Self> {
        let data_dir = data_dir.into();
        let items_dir = data_dir.join("items");
        tokio::fs::create_dir_all(&items_dir)
            .await
            .map_err(|e| StoreError::io(&items_dir, e))?;
        Ok(Self { data_dir })
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    /// Where the integrity ledger's journal lives for this store.
    pub fn audit_journal_path(&self) -> PathBuf {
        self.data_dir.join("audit.jsonl")
    }

    fn items_dir(&self) -> PathBuf {
        self.data_dir.join("items")
    }

    pub fn item_path(&self, id: ItemId) -> PathBuf {
        self.items_dir().join(format!("{}.json", id.0))
    }

    fn control_path(&self) -> PathBuf {
        self.data_dir.join("control.json")
    }

    async fn write_atomic(&self, path: &Path, bytes: Vec<u8>) -> StoreResult<()> {
        let tmp = path.with_extension("json.tmp");
        tokio::fs::write(&tmp, bytes)
            .await
            .map_err(|e| StoreError::io(&tmp, e))?;
        tokio::fs::rename(&tmp, path)
            .await
            .map_err(|e| StoreError::io(path, e))?;
        Ok(())
    }
}

#[async_trait]
impl EngineStore for FileStore {
    async fn load_items(&self) -> StoreResult<LoadedItems> {
        let dir = self.items_dir();
        let mut entries = tokio::fs::read_dir(&dir)
            .await
            .map_err(|e| StoreError::io(&dir, e))?;
        let mut loaded = LoadedItems::default();

        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| StoreError::io(&dir, e))?
        {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let bytes = tokio::fs::read(&path)
                .await
                .map_err(|e| StoreError::io(&path, e))?;
            match serde_json::from_slice::<Item>(&bytes) {
                Ok(item) => loaded.items.push(item),
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "Unreadable item document");
                    let id = path
                        .file_stem()
                        .and_then(|stem| stem.to_str())
                        .and_then(|stem| ItemId::parse(stem).ok());
                    loaded.unreadable.push(UnreadableItem {
                        path,
                        id,
                        error: e.to_string(),
                    });
                }
            }
        }

        debug!(
            count = loaded.items.len(),
            unreadable = loaded.unreadable.len(),
            "Loaded items from {}",
            dir.display()
        );
        Ok(loaded)
    }

    async fn save_item(&self, item: &Item) -> StoreResult<()> {
        let bytes = serde_json::to_vec_pretty(item)?;
        self.write_atomic(&self.item_path(item.id), bytes).await
    }

    async fn load_control(&self) -> StoreResult<Option<ControlSnapshot>> {
        let path = self.control_path();
        match tokio::fs::read(&path).await {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(StoreError::io(path, e)),
        }
    }

    async fn save_control(&self, control: &ControlSnapshot) -> StoreResult<()> {
        let bytes = serde_json::to_vec_pretty(control)?;
        self.write_atomic(&self.control_path(), bytes).await
    }
}

/// Build the store named by a storage configuration.
pub async fn open_store(config: &StorageConfig) -> StoreResult<Arc<dyn EngineStore>> {
    match config {
        StorageConfig::Memory => Ok(Arc::new(MemoryStore::new())),
        StorageConfig::File { data_dir } => Ok(Arc::new(FileStore::open(data_dir.clone()).await?)),
    }
}
