//! Recording merged files in the catalog and releasing their sessions

use std::sync::Arc;
use std::time::SystemTime;
use tracing::{error, info, warn};
use chunkload_core::*;
use crate::{Catalog, MergeOutcome, UploadRegistry};

pub struct Publisher {
    catalog: Arc<dyn Catalog>,
    registry: Arc<UploadRegistry>,
    config: Arc<UploadConfig>,
}

impl Publisher {
    pub fn new(catalog: Arc<dyn Catalog>, registry: Arc<UploadRegistry>, config: Arc<UploadConfig>) -> Self {
        Publisher {
            catalog,
            registry,
            config,
        }
    }

    /// Build the catalog record for a merged session
    pub fn file_record(&self, session: &UploadSession, outcome: &MergeOutcome) -> FileRecord {
        let (file_type, mime_type) = FileType::classify(&session.file_name);
        FileRecord {
            id: session.id,
            name: session.file_name.clone(),
            path: outcome.final_path.clone(),
            url: self.config.public_url(&outcome.relative_path),
            size: outcome.size,
            file_type,
            mime_type: mime_type.to_string(),
            content_hash: outcome.content_hash,
            folder_id: session.folder_id.clone(),
            uploader_id: session.uploader_id.clone(),
            created_at: session.created_at,
            updated_at: SystemTime::now(),
        }
    }

    /// Insert the file record in one catalog transaction. On success the
    /// session goes `merging -> completed` and leaves the registry; on failure
    /// it goes `merging -> failed` and the merged file stays where it is.
    /// An error raised after the commit (e.g. while syncing the journal)
    /// still counts as published once the record is readable.
    pub async fn publish(&self, session: &UploadSession, outcome: &MergeOutcome) -> Result<FileRecord> {
        let record = self.file_record(session, outcome);
        let id = session.id;

        let catalog = self.catalog.clone();
        let to_insert = record.clone();
        let inserted = tokio::task::spawn_blocking(move || catalog.insert_file(&to_insert))
            .await
            .map_err(|e| ChunkloadError::Internal(format!("catalog task failed: {}", e)))
            .and_then(|r| r);

        let inserted = match inserted {
            Err(e) if self.was_committed(&record).await => {
                warn!("Catalog reported {} after committing file {}, treating as published", e, id);
                Ok(())
            }
            other => other,
        };

        if let Err(e) = inserted {
            error!(
                "Publish failed for session {}: {} (merged file kept at {})",
                id,
                e,
                outcome.final_path.display()
            );
            if let Err(fail_err) = self.registry.fail(&id, UploadStatus::Merging, format!("publish failed: {}", e)) {
                warn!("Could not mark session {} failed: {}", id, fail_err);
            }
            return Err(e);
        }

        if let Err(e) = self.registry.transition(&id, UploadStatus::Merging, UploadStatus::Completed) {
            warn!("Session {} published but not marked completed: {}", id, e);
        }
        self.registry.delete(&id);

        info!("Published file {} ({}, {} bytes) at {}", id, record.name, record.size, record.url);
        Ok(record)
    }

    /// Whether the catalog holds this merge's record
    async fn was_committed(&self, record: &FileRecord) -> bool {
        let catalog = self.catalog.clone();
        let id = record.id;
        match tokio::task::spawn_blocking(move || catalog.get_file(&id)).await {
            Ok(Ok(Some(stored))) => stored.path == record.path && stored.content_hash == record.content_hash,
            _ => false,
        }
    }
}
