//! Progress state of one resumable upload

use serde::{Deserialize, Serialize};
use std::time::SystemTime;

use crate::*;

/// Mutable state of a single upload, owned by the registry until it is terminal.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadSession {
    pub id: SessionId,
    pub file_name: String,
    pub plan: ChunkPlan,
    bitmap: Vec<bool>,
    uploaded_bytes: u64,
    status: UploadStatus,
    error_message: Option<String>,
    pub folder_id: Option<String>,
    pub expected_digest: Option<ContentHash>,
    pub uploader_id: Option<String>,
    pub created_at: SystemTime,
    updated_at: SystemTime,
}

impl UploadSession {
    /// Create a session in `uploading` with every chunk pending
    pub fn new(id: SessionId, file_name: impl Into<String>, plan: ChunkPlan) -> Self {
        let now = SystemTime::now();
        UploadSession {
            id,
            file_name: file_name.into(),
            plan,
            bitmap: vec![false; plan.chunk_count as usize],
            uploaded_bytes: 0,
            status: UploadStatus::Uploading,
            error_message: None,
            folder_id: None,
            expected_digest: None,
            uploader_id: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn status(&self) -> UploadStatus {
        self.status
    }

    pub fn error_message(&self) -> Option<&str> {
        self.error_message.as_deref()
    }

    pub fn uploaded_bytes(&self) -> u64 {
        self.uploaded_bytes
    }

    pub fn updated_at(&self) -> SystemTime {
        self.updated_at
    }

    pub fn bitmap(&self) -> &[bool] {
        &self.bitmap
    }

    pub fn is_received(&self, index: u32) -> bool {
        self.bitmap.get(index as usize).copied().unwrap_or(false)
    }

    pub fn is_complete(&self) -> bool {
        self.bitmap.iter().all(|received| *received)
    }

    pub fn accepts_chunks(&self) -> bool {
        self.status == UploadStatus::Uploading
    }

    /// Fail unless the session is still `uploading`
    pub fn ensure_accepting(&self) -> Result<()> {
        if !self.accepts_chunks() {
            return Err(ChunkloadError::SessionNotAcceptingChunks {
                id: self.id,
                status: self.status,
            });
        }
        Ok(())
    }

    /// Flip one bitmap entry and recompute uploaded bytes.
    /// Returns whether every chunk is now received.
    pub fn mark_chunk(&mut self, index: u32, received: bool) -> Result<bool> {
        self.plan.check_index(index)?;
        self.ensure_accepting()?;

        self.bitmap[index as usize] = received;
        self.uploaded_bytes = self.plan.contribution_of(&self.bitmap);
        self.updated_at = SystemTime::now();

        Ok(self.is_complete())
    }

    /// Compare-and-swap status transition along a state machine edge
    pub fn transition(&mut self, from: UploadStatus, to: UploadStatus) -> Result<()> {
        if self.status != from || !from.can_transition_to(to) {
            return Err(ChunkloadError::InvalidTransition {
                from,
                to,
                actual: self.status,
            });
        }

        self.status = to;
        self.updated_at = SystemTime::now();
        Ok(())
    }

    /// Move to `failed` from `from`, recording the cause
    pub fn fail(&mut self, from: UploadStatus, message: impl Into<String>) -> Result<()> {
        self.transition(from, UploadStatus::Failed)?;
        self.error_message = Some(message.into());
        Ok(())
    }

    pub fn missing_chunks(&self) -> Vec<u32> {
        self.bitmap
            .iter()
            .enumerate()
            .filter(|(_, received)| !**received)
            .map(|(i, _)| i as u32)
            .collect()
    }

    pub fn snapshot(&self) -> StatusSnapshot {
        let missing_chunks = self.missing_chunks();
        StatusSnapshot {
            session_id: self.id,
            file_name: self.file_name.clone(),
            status: self.status,
            uploaded_bytes: self.uploaded_bytes,
            total_size: self.plan.total_size,
            chunk_size: self.plan.chunk_size,
            chunk_count: self.plan.chunk_count,
            received_chunks: self.plan.chunk_count - missing_chunks.len() as u32,
            missing_chunks,
            error: self.error_message.clone(),
            created_at: self.created_at,
            updated_at: self.updated_at,
        }
    }

    /// Extension of the original file name including the dot, or empty
    pub fn extension(&self) -> String {
        std::path::Path::new(&self.file_name)
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| format!(".{}", e.to_ascii_lowercase()))
            .unwrap_or_default()
    }
}
