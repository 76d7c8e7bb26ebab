//! File catalog backed by a transactional fjall keyspace

use fjall::{Config, PartitionCreateOptions, PersistMode, TxKeyspace, TxPartitionHandle};
use std::path::Path;
use std::sync::Arc;
use chunkload_core::*;

/// Durable store of published files and the folders they live in
pub trait Catalog: Send + Sync + 'static {
    fn folder_exists(&self, folder_id: &str) -> Result<bool>;

    /// Look up a published file by name, size and folder
    fn find_existing(&self, name: &str, size: u64, folder_id: Option<&str>) -> Result<Option<FileRecord>>;

    fn get_file(&self, id: &SessionId) -> Result<Option<FileRecord>>;

    /// Insert `record` atomically; fails if the id is already taken
    fn insert_file(&self, record: &FileRecord) -> Result<()>;
}

/// Catalog stored in three fjall partitions written through one transaction
#[derive(Clone)]
pub struct FjallCatalog {
    keyspace: Arc<TxKeyspace>,
    files: TxPartitionHandle,
    file_index: TxPartitionHandle,
    folders: TxPartitionHandle,
}

impl FjallCatalog {
    /// Open or create the catalog at `path`
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let keyspace = Config::new(path)
            .open_transactional()
            .map_err(|e| ChunkloadError::Storage(e.to_string()))?;

        let open = |name: &str| {
            keyspace
                .open_partition(name, PartitionCreateOptions::default())
                .map_err(|e| ChunkloadError::Storage(e.to_string()))
        };
        let files = open("files")?;
        let file_index = open("file_index")?;
        let folders = open("folders")?;

        Ok(FjallCatalog {
            keyspace: Arc::new(keyspace),
            files,
            file_index,
            folders,
        })
    }

    /// Create temporary catalog for testing
    #[cfg(any(test, feature = "test-utils"))]
    pub fn temp() -> Result<(Self, tempfile::TempDir)> {
        let temp_dir = tempfile::tempdir().map_err(|e| ChunkloadError::Internal(e.to_string()))?;
        let catalog = Self::open(temp_dir.path())?;
        Ok((catalog, temp_dir))
    }

    pub fn create_folder(&self, folder: &Folder) -> Result<()> {
        if folder.id.is_empty() {
            return Err(ChunkloadError::InvalidRequest("folder id must not be empty".to_string()));
        }
        let value = serde_json::to_vec(folder)?;

        let mut tx = self.keyspace.write_tx();
        tx.insert(&self.folders, folder.id.as_bytes(), value);
        tx.commit().map_err(|e| ChunkloadError::Storage(e.to_string()))?;
        self.persist()
    }

    /// All published files ordered by id, which is creation order
    pub fn list_files(&self) -> Result<Vec<FileRecord>> {
        let tx = self.keyspace.read_tx();
        let mut records = Vec::new();

        for item in tx.iter(&self.files) {
            let (_key, value) = item.map_err(|e| ChunkloadError::Storage(e.to_string()))?;
            records.push(serde_json::from_slice(&value)?);
        }

        Ok(records)
    }

    fn persist(&self) -> Result<()> {
        self.keyspace
            .persist(PersistMode::SyncAll)
            .map_err(|e| ChunkloadError::Storage(e.to_string()))
    }

    // Helper methods for key formatting
    fn index_key(name: &str, size: u64, folder_id: Option<&str>) -> Vec<u8> {
        format!("{}\0{}\0{:020}", folder_id.unwrap_or(""), name, size).into_bytes()
    }

    fn file_key(id: &SessionId) -> Vec<u8> {
        id.to_string().into_bytes()
    }
}

impl Catalog for FjallCatalog {
    fn folder_exists(&self, folder_id: &str) -> Result<bool> {
        let tx = self.keyspace.read_tx();
        tx.contains_key(&self.folders, folder_id.as_bytes())
            .map_err(|e| ChunkloadError::Storage(e.to_string()))
    }

    fn find_existing(&self, name: &str, size: u64, folder_id: Option<&str>) -> Result<Option<FileRecord>> {
        let tx = self.keyspace.read_tx();
        let id = tx
            .get(&self.file_index, Self::index_key(name, size, folder_id))
            .map_err(|e| ChunkloadError::Storage(e.to_string()))?;

        let Some(id) = id else {
            return Ok(None);
        };
        match tx
            .get(&self.files, &*id)
            .map_err(|e| ChunkloadError::Storage(e.to_string()))?
        {
            Some(value) => Ok(Some(serde_json::from_slice(&value)?)),
            None => Ok(None),
        }
    }

    fn get_file(&self, id: &SessionId) -> Result<Option<FileRecord>> {
        let tx = self.keyspace.read_tx();
        match tx
            .get(&self.files, Self::file_key(id))
            .map_err(|e| ChunkloadError::Storage(e.to_string()))?
        {
            Some(value) => Ok(Some(serde_json::from_slice(&value)?)),
            None => Ok(None),
        }
    }

    fn insert_file(&self, record: &FileRecord) -> Result<()> {
        let key = Self::file_key(&record.id);
        let value = serde_json::to_vec(record)?;
        let index_key = Self::index_key(&record.name, record.size, record.folder_id.as_deref());

        let mut tx = self.keyspace.write_tx();
        let existing = tx
            .get(&self.files, &key)
            .map_err(|e| ChunkloadError::Storage(e.to_string()))?;
        if existing.is_some() {
            return Err(ChunkloadError::Storage(format!("file {} already exists", record.id)));
        }

        tx.insert(&self.files, key.clone(), value);
        tx.insert(&self.file_index, index_key, key.clone());
        tx.commit().map_err(|e| ChunkloadError::Storage(e.to_string()))?;

        self.persist()
    }
}
