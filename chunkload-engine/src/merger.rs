//! Reassembly of uploaded chunks into the final artifact

use chrono::{Datelike, NaiveDate, Utc};
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::{debug, info, warn};
use chunkload_core::*;
use crate::ChunkStore;

const MERGE_BUFFER_SIZE: usize = 64 * 1024;

/// Final artifact produced by a successful merge
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MergeOutcome {
    pub content_hash: ContentHash,
    pub final_path: PathBuf,
    /// Path below the upload root, `/`-separated
    pub relative_path: String,
    pub size: u64,
}

/// Streams chunks into one file and moves it into the permanent tree
#[derive(Debug, Clone)]
pub struct Merger {
    store: ChunkStore,
    merge_root: PathBuf,
    upload_root: PathBuf,
}

impl Merger {
    pub fn new(store: ChunkStore, merge_root: impl Into<PathBuf>, upload_root: impl Into<PathBuf>) -> Self {
        Merger {
            store,
            merge_root: merge_root.into(),
            upload_root: upload_root.into(),
        }
    }

    /// Scratch file a merge writes before it is published by rename
    pub fn scratch_path(&self, id: &SessionId) -> PathBuf {
        self.merge_root.join(format!("{}.tmp", id))
    }

    /// Concatenate chunks `0..n` in index order while hashing, verify the
    /// digest and rename the result to `<upload root>/yyyy/mm/dd/<id><ext>`.
    /// Chunk blobs are left in place; see [`Merger::release_chunks`].
    pub async fn merge(&self, session: &UploadSession) -> Result<MergeOutcome> {
        let id = session.id;
        let mut chunks = self
            .store
            .read_in_order(&id, &session.plan)
            .await
            .map_err(|e| match e {
                ChunkloadError::MissingChunk(_) | ChunkloadError::Corrupt { .. } => {
                    ChunkloadError::IncompleteUpload(e.to_string())
                }
                other => other,
            })?;

        fs::create_dir_all(&self.merge_root).await?;
        let scratch = self.scratch_path(&id);

        info!("Merging {} chunks: session={}, size={}", chunks.len(), id, session.plan.total_size);

        let content_hash = match self.write_scratch(&scratch, &mut chunks, session).await {
            Ok(hash) => hash,
            Err(e) => {
                let _ = fs::remove_file(&scratch).await;
                return Err(e);
            }
        };

        let relative_path = partition_path(&id, &session.extension(), Utc::now().date_naive());
        let final_path = self.upload_root.join(&relative_path);

        if let Err(e) = Self::publish_file(&scratch, &final_path).await {
            let _ = fs::remove_file(&scratch).await;
            return Err(e);
        }

        info!("Merged session {} into {} (digest {})", id, final_path.display(), content_hash);

        Ok(MergeOutcome {
            content_hash,
            final_path,
            relative_path,
            size: session.plan.total_size,
        })
    }

    /// Remove the chunk blobs of a published session. Must run after the
    /// session left the registry so no chunk write can still be accepted.
    pub async fn release_chunks(&self, id: &SessionId) {
        if let Err(e) = self.store.cleanup(id).await {
            warn!("Failed to clean up chunks for session {}: {}", id, e);
        }
    }

    async fn write_scratch(
        &self,
        scratch: &Path,
        chunks: &mut crate::OrderedChunks,
        session: &UploadSession,
    ) -> Result<ContentHash> {
        let mut out = fs::File::create(scratch).await?;
        let mut hasher = ContentHasher::new();
        let mut buf = vec![0u8; MERGE_BUFFER_SIZE];

        while let Some((index, mut chunk)) = chunks.next_chunk().await.map_err(|e| match e {
            ChunkloadError::MissingChunk(_) => ChunkloadError::IncompleteUpload(e.to_string()),
            other => other,
        })? {
            loop {
                let n = chunk.read(&mut buf).await?;
                if n == 0 {
                    break;
                }
                out.write_all(&buf[..n]).await?;
                hasher.update(&buf[..n]);
            }
            debug!("Merged chunk: session={}, index={}", session.id, index);
        }

        out.flush().await?;
        out.sync_all().await?;
        drop(out);

        if hasher.bytes_hashed() != session.plan.total_size {
            return Err(ChunkloadError::IncompleteUpload(format!(
                "merged {} bytes, expected {}",
                hasher.bytes_hashed(),
                session.plan.total_size
            )));
        }

        let computed = hasher.finalize();
        if let Some(expected) = session.expected_digest {
            if expected != computed {
                return Err(ChunkloadError::IntegrityMismatch {
                    expected: expected.to_hex(),
                    actual: computed.to_hex(),
                });
            }
        }

        Ok(computed)
    }

    async fn publish_file(scratch: &Path, final_path: &Path) -> Result<()> {
        if let Some(parent) = final_path.parent() {
            fs::create_dir_all(parent).await?;
        }
        // same filesystem, so the final path never exposes a partial file
        fs::rename(scratch, final_path).await?;
        Ok(())
    }
}

/// Date-partitioned location of a merged file below the upload root
pub fn partition_path(id: &SessionId, extension: &str, date: NaiveDate) -> String {
    format!(
        "{:04}/{:02}/{:02}/{}{}",
        date.year(),
        date.month(),
        date.day(),
        id,
        extension
    )
}
