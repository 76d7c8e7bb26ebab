//! Boundary operations of the resumable upload pipeline

use bytes::Bytes;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};
use chunkload_core::*;
use crate::worker::{MergePool, MergeTask};
use crate::{Catalog, ChunkStore, FjallCatalog, MergeHandle, Merger, Publisher, UploadRegistry};

/// Outcome of one accepted chunk
#[derive(Debug)]
pub struct ChunkReceipt {
    pub session_id: SessionId,
    pub chunk_index: u32,
    pub uploaded_bytes: u64,
    /// Every chunk of the session has been received
    pub complete: bool,
    /// Set only for the call that started the merge
    pub completion: Option<MergeHandle>,
}

/// Initiate, chunk, status and lookup operations over one storage root
pub struct UploadPipeline {
    config: Arc<UploadConfig>,
    store: ChunkStore,
    registry: Arc<UploadRegistry>,
    catalog: Arc<dyn Catalog>,
    pool: MergePool,
}

impl UploadPipeline {
    /// Open the pipeline with the fjall catalog under the configured root.
    /// Must be called inside a tokio runtime.
    pub fn open(config: UploadConfig) -> Result<Self> {
        let catalog = Arc::new(FjallCatalog::open(config.catalog_root())?);
        Self::with_catalog(config, catalog)
    }

    /// Start the pipeline over `catalog`. A relative storage root is resolved
    /// against the current directory once, so published paths are absolute.
    pub fn with_catalog(mut config: UploadConfig, catalog: Arc<dyn Catalog>) -> Result<Self> {
        config.validate()?;
        config.resolve_root()?;
        std::fs::create_dir_all(config.temp_root())?;
        std::fs::create_dir_all(config.merge_root())?;
        std::fs::create_dir_all(config.upload_root())?;

        let config = Arc::new(config);
        let store = ChunkStore::new(config.temp_root());
        let registry = Arc::new(UploadRegistry::new());
        let task = Arc::new(MergeTask {
            registry: registry.clone(),
            merger: Merger::new(store.clone(), config.merge_root(), config.upload_root()),
            publisher: Publisher::new(catalog.clone(), registry.clone(), config.clone()),
        });
        let pool = MergePool::start(config.merge_workers, config.merge_queue_depth, task);

        info!(
            "Upload pipeline ready: root={}, chunk_size={}, merge_workers={}",
            config.root.display(),
            config.chunk_size,
            config.merge_workers
        );

        Ok(UploadPipeline {
            config,
            store,
            registry,
            catalog,
            pool,
        })
    }

    /// Create temporary pipeline for testing
    #[cfg(any(test, feature = "test-utils"))]
    pub fn temp(chunk_size: u64) -> Result<(Self, Arc<FjallCatalog>, tempfile::TempDir)> {
        let temp_dir = tempfile::tempdir().map_err(|e| ChunkloadError::Internal(e.to_string()))?;
        let mut config = UploadConfig::with_root(temp_dir.path());
        config.chunk_size = chunk_size;
        config.max_chunk_size = config.max_chunk_size.max(chunk_size);
        let catalog = Arc::new(FjallCatalog::open(config.catalog_root())?);
        let pipeline = Self::with_catalog(config, catalog.clone())?;
        Ok((pipeline, catalog, temp_dir))
    }

    pub fn config(&self) -> &UploadConfig {
        &self.config
    }

    pub fn registry(&self) -> &UploadRegistry {
        &self.registry
    }

    pub fn chunk_store(&self) -> &ChunkStore {
        &self.store
    }

    /// Start a new upload session and hand back its chunk plan
    pub async fn initiate(&self, request: InitiateRequest) -> Result<InitiateResponse> {
        if request.file_name.trim().is_empty() {
            return Err(ChunkloadError::InvalidRequest("file name must not be empty".to_string()));
        }
        if request.total_size > self.config.max_file_size {
            return Err(ChunkloadError::FileTooLarge {
                size: request.total_size,
                max: self.config.max_file_size,
            });
        }

        let chunk_size = request.chunk_size.unwrap_or(self.config.chunk_size);
        if chunk_size > self.config.max_chunk_size {
            return Err(ChunkloadError::InvalidRequest(format!(
                "chunk size {} exceeds limit of {}",
                chunk_size, self.config.max_chunk_size
            )));
        }
        let plan = ChunkPlan::new(request.total_size, chunk_size)?;

        let folder_id = request.folder_id.filter(|f| !f.is_empty());
        if let Some(folder) = &folder_id {
            if !self.folder_exists(folder).await? {
                return Err(ChunkloadError::FolderNotFound(folder.clone()));
            }
        }

        let expected_digest = match request.expected_digest.as_deref().map(str::trim) {
            Some(hex) if !hex.is_empty() => Some(ContentHash::from_hex(hex)?),
            _ => None,
        };

        let mut session = UploadSession::new(SessionId::new(), request.file_name, plan);
        session.folder_id = folder_id;
        session.expected_digest = expected_digest;
        session.uploader_id = request.uploader_id;

        let session_id = self.registry.create(session)?;
        info!(
            "Initiated upload {}: size={}, chunk_size={}, chunks={}",
            session_id, plan.total_size, plan.chunk_size, plan.chunk_count
        );

        Ok(InitiateResponse {
            session_id,
            chunk_size: plan.chunk_size,
            chunk_count: plan.chunk_count,
        })
    }

    /// Persist one chunk. When it is the last missing chunk, the merge is
    /// queued and its handle returned without waiting for it.
    ///
    /// The merge queue holds `merge_queue_depth` jobs. When it is full, the
    /// call that completes an upload waits for a worker to take a job before
    /// returning; merges themselves are never awaited here.
    pub async fn upload_chunk(&self, id: &SessionId, index: u32, data: Bytes) -> Result<ChunkReceipt> {
        let (plan, already_received) = self.registry.check_chunk(id, index)?;
        let expected = plan.expected_chunk_size(index)?;

        if data.len() as u64 != expected {
            return Err(ChunkloadError::SizeMismatch {
                index,
                expected,
                actual: data.len() as u64,
            });
        }

        if already_received {
            debug!("Chunk {} of {} already received, skipping write", index, id);
            let snapshot = self.registry.snapshot(id)?;
            return Ok(ChunkReceipt {
                session_id: *id,
                chunk_index: index,
                uploaded_bytes: snapshot.uploaded_bytes,
                complete: false,
                completion: None,
            });
        }

        if let Err(e) = self.store.write(id, index, expected, &data[..]).await {
            if matches!(self.registry.snapshot(id), Err(ChunkloadError::SessionNotFound(_))) {
                self.discard_late_chunk(id, index).await;
            }
            return Err(e);
        }

        let complete = match self.registry.mutate_chunk(id, index, true) {
            Ok(complete) => complete,
            // a concurrent duplicate of this chunk already completed the upload
            Err(ChunkloadError::SessionNotAcceptingChunks {
                status: UploadStatus::Merging | UploadStatus::Completed,
                ..
            }) => {
                return Ok(ChunkReceipt {
                    session_id: *id,
                    chunk_index: index,
                    uploaded_bytes: plan.total_size,
                    complete: true,
                    completion: None,
                });
            }
            // published or abandoned while this chunk was written; its
            // directory was already released, so drop what we recreated
            Err(e @ ChunkloadError::SessionNotFound(_)) => {
                self.discard_late_chunk(id, index).await;
                return Err(e);
            }
            Err(e) => return Err(e),
        };

        let uploaded_bytes = if complete {
            plan.total_size
        } else {
            self.registry.snapshot(id)?.uploaded_bytes
        };
        debug!("Accepted chunk {} of {}: {}/{} bytes", index, id, uploaded_bytes, plan.total_size);

        let completion = if complete { self.trigger_merge(id).await? } else { None };

        Ok(ChunkReceipt {
            session_id: *id,
            chunk_index: index,
            uploaded_bytes,
            complete,
            completion,
        })
    }

    async fn discard_late_chunk(&self, id: &SessionId, index: u32) {
        if let Err(e) = self.store.cleanup(id).await {
            warn!("Failed to remove late chunk {} of {}: {}", index, id, e);
        }
    }

    /// Win the single `uploading -> merging` transition and queue the merge.
    /// Losers of the race get `None`.
    async fn trigger_merge(&self, id: &SessionId) -> Result<Option<MergeHandle>> {
        match self.registry.transition(id, UploadStatus::Uploading, UploadStatus::Merging) {
            Ok(()) => {}
            Err(ChunkloadError::InvalidTransition { .. }) => return Ok(None),
            Err(e) => return Err(e),
        }

        info!("All chunks received for {}, queueing merge", id);
        match self.pool.submit(*id).await {
            Ok(handle) => Ok(Some(handle)),
            Err(e) => {
                if let Err(fail_err) = self.registry.fail(id, UploadStatus::Merging, e.to_string()) {
                    warn!("Could not mark session {} failed: {}", id, fail_err);
                }
                Err(e)
            }
        }
    }

    /// Point-in-time progress. A completed upload is no longer here; look it up with `get_file`.
    pub fn get_status(&self, id: &SessionId) -> Result<StatusSnapshot> {
        self.registry.snapshot(id)
    }

    /// Rebuild the bitmap of an `uploading` session from the chunks on disk,
    /// starting the merge if that completes it.
    pub async fn resync(&self, id: &SessionId) -> Result<(StatusSnapshot, Option<MergeHandle>)> {
        let session = self.registry.get(id)?;
        session.ensure_accepting()?;

        let present = self.store.present_chunks(id, &session.plan).await?;
        let mut complete = session.is_complete();
        for (index, on_disk) in present.iter().enumerate() {
            if session.is_received(index as u32) != *on_disk {
                complete = self.registry.mutate_chunk(id, index as u32, *on_disk)?;
            }
        }

        let completion = if complete { self.trigger_merge(id).await? } else { None };
        let snapshot = match self.registry.snapshot(id) {
            Ok(snapshot) => snapshot,
            Err(ChunkloadError::SessionNotFound(_)) if completion.is_some() => {
                let mut snapshot = session.snapshot();
                snapshot.status = UploadStatus::Merging;
                snapshot.uploaded_bytes = session.plan.total_size;
                snapshot.received_chunks = session.plan.chunk_count;
                snapshot.missing_chunks.clear();
                snapshot
            }
            Err(e) => return Err(e),
        };

        info!("Resynced {}: {}/{} chunks on disk", id, snapshot.received_chunks, snapshot.chunk_count);
        Ok((snapshot, completion))
    }

    /// Drop a session that is not merging and remove its chunks
    pub async fn abandon(&self, id: &SessionId) -> Result<()> {
        let session = self.registry.abandon(id)?;
        if let Err(e) = self.store.cleanup(id).await {
            warn!("Failed to remove chunks of abandoned session {}: {}", id, e);
        }
        info!("Abandoned upload {} in state {}", id, session.status());
        Ok(())
    }

    /// Sessions whose last update is older than `older_than`
    pub fn stale_sessions(&self, older_than: Duration) -> Vec<StatusSnapshot> {
        self.registry.stale(older_than)
    }

    /// Whether a file with this name and size is already published in the folder
    pub async fn check_existing(&self, name: &str, size: u64, folder_id: Option<&str>) -> Result<ExistingFile> {
        let catalog = self.catalog.clone();
        let name = name.to_string();
        let folder_id = folder_id.filter(|f| !f.is_empty()).map(str::to_string);

        let found = tokio::task::spawn_blocking(move || catalog.find_existing(&name, size, folder_id.as_deref()))
            .await
            .map_err(|e| ChunkloadError::Internal(e.to_string()))??;

        Ok(match found {
            Some(record) => ExistingFile {
                exists: true,
                file_id: Some(record.id),
                url: Some(record.url),
            },
            None => ExistingFile::absent(),
        })
    }

    /// Published record for a session id
    pub async fn get_file(&self, id: &SessionId) -> Result<Option<FileRecord>> {
        let catalog = self.catalog.clone();
        let id = *id;
        tokio::task::spawn_blocking(move || catalog.get_file(&id))
            .await
            .map_err(|e| ChunkloadError::Internal(e.to_string()))?
    }

    async fn folder_exists(&self, folder_id: &str) -> Result<bool> {
        let catalog = self.catalog.clone();
        let folder_id = folder_id.to_string();
        tokio::task::spawn_blocking(move || catalog.folder_exists(&folder_id))
            .await
            .map_err(|e| ChunkloadError::Internal(e.to_string()))?
    }

    /// Stop the merge workers after queued merges finish
    pub async fn shutdown(self) {
        self.pool.close().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_initiate_validation() {
        let (pipeline, catalog, _temp) = UploadPipeline::temp(1024).unwrap();

        let too_large = pipeline
            .initiate(InitiateRequest::new("big.mp4", pipeline.config().max_file_size + 1))
            .await;
        assert!(matches!(too_large, Err(ChunkloadError::FileTooLarge { .. })));

        let empty = pipeline.initiate(InitiateRequest::new("empty.bin", 0)).await;
        assert!(matches!(empty, Err(ChunkloadError::InvalidRequest(_))));

        let unnamed = pipeline.initiate(InitiateRequest::new("  ", 10)).await;
        assert!(matches!(unnamed, Err(ChunkloadError::InvalidRequest(_))));

        let huge_chunks = pipeline
            .initiate(InitiateRequest::new("a.bin", 10).with_chunk_size(u64::MAX))
            .await;
        assert!(matches!(huge_chunks, Err(ChunkloadError::InvalidRequest(_))));

        let zero_chunks = pipeline
            .initiate(InitiateRequest::new("a.bin", 10).with_chunk_size(0))
            .await;
        assert!(matches!(zero_chunks, Err(ChunkloadError::InvalidRequest(_))));

        let no_folder = pipeline
            .initiate(InitiateRequest::new("a.bin", 10).with_folder("missing"))
            .await;
        assert!(matches!(no_folder, Err(ChunkloadError::FolderNotFound(_))));

        let bad_digest = pipeline
            .initiate(InitiateRequest::new("a.bin", 10).with_expected_digest("zz"))
            .await;
        assert!(matches!(bad_digest, Err(ChunkloadError::InvalidDigest(_))));

        catalog.create_folder(&Folder::new("docs", "Documents")).unwrap();
        let ok = pipeline
            .initiate(InitiateRequest::new("a.bin", 2500).with_folder("docs"))
            .await
            .unwrap();
        assert_eq!(ok.chunk_size, 1024);
        assert_eq!(ok.chunk_count, 3);
        assert!(!pipeline.registry().is_empty());
    }

    #[tokio::test]
    async fn test_upload_chunk_rejections() {
        let (pipeline, _catalog, _temp) = UploadPipeline::temp(10).unwrap();
        let init = pipeline.initiate(InitiateRequest::new("a.bin", 25)).await.unwrap();
        let id = init.session_id;

        assert!(matches!(
            pipeline.upload_chunk(&SessionId::new(), 0, Bytes::from_static(&[0; 10])).await,
            Err(ChunkloadError::SessionNotFound(_))
        ));
        assert!(matches!(
            pipeline.upload_chunk(&id, 3, Bytes::from_static(&[0; 5])).await,
            Err(ChunkloadError::InvalidIndex { index: 3, count: 3 })
        ));
        assert!(matches!(
            pipeline.upload_chunk(&id, 2, Bytes::from_static(&[0; 10])).await,
            Err(ChunkloadError::SizeMismatch { index: 2, expected: 5, actual: 10 })
        ));

        let status = pipeline.get_status(&id).unwrap();
        assert_eq!(status.status, UploadStatus::Uploading);
        assert_eq!(status.uploaded_bytes, 0);
    }

    #[tokio::test]
    async fn test_repeated_chunk_is_not_rewritten() {
        let (pipeline, _catalog, _temp) = UploadPipeline::temp(10).unwrap();
        let id = pipeline.initiate(InitiateRequest::new("a.bin", 25)).await.unwrap().session_id;

        let first = pipeline.upload_chunk(&id, 0, Bytes::from_static(&[1; 10])).await.unwrap();
        assert_eq!(first.uploaded_bytes, 10);
        assert!(!first.complete);

        let again = pipeline.upload_chunk(&id, 0, Bytes::from_static(&[9; 10])).await.unwrap();
        assert_eq!(again.uploaded_bytes, 10);
        assert!(again.completion.is_none());

        let on_disk = std::fs::read(pipeline.chunk_store().session_dir(&id).join("0")).unwrap();
        assert_eq!(on_disk, vec![1; 10]);
    }
}
