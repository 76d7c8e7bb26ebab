//! Shared fixtures for engine integration tests

#![allow(dead_code)]

use bytes::Bytes;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use chunkload_core::test_utils::TestDataGenerator;
use chunkload_core::*;
use chunkload_engine::*;

/// Catalog wrapper that counts inserts and can be told to fail them
pub struct InstrumentedCatalog {
    inner: FjallCatalog,
    inserts: AtomicUsize,
    fail_inserts: AtomicBool,
    fail_after_commit: AtomicBool,
}

impl InstrumentedCatalog {
    pub fn new(inner: FjallCatalog) -> Self {
        InstrumentedCatalog {
            inner,
            inserts: AtomicUsize::new(0),
            fail_inserts: AtomicBool::new(false),
            fail_after_commit: AtomicBool::new(false),
        }
    }

    pub fn inner(&self) -> &FjallCatalog {
        &self.inner
    }

    pub fn insert_calls(&self) -> usize {
        self.inserts.load(Ordering::SeqCst)
    }

    pub fn fail_inserts(&self, fail: bool) {
        self.fail_inserts.store(fail, Ordering::SeqCst);
    }

    /// Commit inserts but report an error afterwards
    pub fn fail_after_commit(&self, fail: bool) {
        self.fail_after_commit.store(fail, Ordering::SeqCst);
    }
}

impl Catalog for InstrumentedCatalog {
    fn folder_exists(&self, folder_id: &str) -> Result<bool> {
        self.inner.folder_exists(folder_id)
    }

    fn find_existing(&self, name: &str, size: u64, folder_id: Option<&str>) -> Result<Option<FileRecord>> {
        self.inner.find_existing(name, size, folder_id)
    }

    fn get_file(&self, id: &SessionId) -> Result<Option<FileRecord>> {
        self.inner.get_file(id)
    }

    fn insert_file(&self, record: &FileRecord) -> Result<()> {
        self.inserts.fetch_add(1, Ordering::SeqCst);
        if self.fail_inserts.load(Ordering::SeqCst) {
            return Err(ChunkloadError::Storage("transaction commit failed".to_string()));
        }
        self.inner.insert_file(record)?;
        if self.fail_after_commit.load(Ordering::SeqCst) {
            return Err(ChunkloadError::Storage("journal sync failed".to_string()));
        }
        Ok(())
    }
}

pub struct Harness {
    pub pipeline: Arc<UploadPipeline>,
    pub catalog: Arc<InstrumentedCatalog>,
    pub config: UploadConfig,
    _temp: tempfile::TempDir,
}

/// Pipeline rooted in a temp dir with an instrumented catalog
pub fn harness(chunk_size: u64) -> Harness {
    harness_with(chunk_size, |_| {})
}

/// Like [`harness`], with a hook to adjust the configuration
pub fn harness_with(chunk_size: u64, adjust: impl FnOnce(&mut UploadConfig)) -> Harness {
    let temp = tempfile::tempdir().unwrap();
    let mut config = UploadConfig::with_root(temp.path());
    config.chunk_size = chunk_size;
    config.base_url = "https://media.example.com".to_string();
    adjust(&mut config);

    let catalog = Arc::new(InstrumentedCatalog::new(
        FjallCatalog::open(config.catalog_root()).unwrap(),
    ));
    let pipeline = UploadPipeline::with_catalog(config.clone(), catalog.clone()).unwrap();

    Harness {
        pipeline: Arc::new(pipeline),
        catalog,
        config,
        _temp: temp,
    }
}

/// Upload every chunk of `data` in `order`; returns the completion handle
pub async fn upload_in_order(
    pipeline: &UploadPipeline,
    id: &SessionId,
    data: &[u8],
    plan: &ChunkPlan,
    order: &[u32],
) -> MergeHandle {
    let chunks = TestDataGenerator::split(data, plan);
    let mut completion = None;

    for index in order {
        let bytes = Bytes::copy_from_slice(&chunks[*index as usize].1);
        let receipt = pipeline.upload_chunk(id, *index, bytes).await.unwrap();
        if let Some(handle) = receipt.completion {
            assert!(completion.is_none(), "merge triggered twice");
            completion = Some(handle);
        }
    }

    completion.expect("last chunk should trigger the merge")
}

/// Every regular file below `dir`
pub fn files_under(dir: &std::path::Path) -> Vec<std::path::PathBuf> {
    let mut found = Vec::new();
    let Ok(entries) = std::fs::read_dir(dir) else {
        return found;
    };
    for entry in entries.flatten() {
        let path = entry.path();
        if path.is_dir() {
            found.extend(files_under(&path));
        } else {
            found.push(path);
        }
    }
    found
}
