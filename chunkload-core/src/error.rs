//! Error types for chunkload

use thiserror::Error;

use crate::{SessionId, UploadStatus};

/// Coarse classification of failures, used by callers to decide who retries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Bad input from the caller; never retried by the pipeline.
    Client,
    /// A single chunk write failed; the session keeps accepting chunks.
    Transient,
    /// The assembled upload is unusable; the session is failed.
    Integrity,
    /// The catalog write failed; the merged artifact is left on disk.
    Persistence,
    Internal,
}

#[derive(Error, Debug)]
pub enum ChunkloadError {
    #[error("File too large: {size} bytes exceeds limit of {max} bytes")]
    FileTooLarge { size: u64, max: u64 },

    #[error("Folder not found: {0}")]
    FolderNotFound(String),

    #[error("Upload session not found: {0}")]
    SessionNotFound(SessionId),

    #[error("Chunk index {index} out of range (chunk count {count})")]
    InvalidIndex { index: u32, count: u32 },

    #[error("Chunk {index} size mismatch: expected {expected} bytes, got {actual}")]
    SizeMismatch { index: u32, expected: u64, actual: u64 },

    #[error("Session {id} is {status} and no longer accepts chunks")]
    SessionNotAcceptingChunks { id: SessionId, status: UploadStatus },

    #[error("Invalid status transition {from} -> {to} (current status {actual})")]
    InvalidTransition {
        from: UploadStatus,
        to: UploadStatus,
        actual: UploadStatus,
    },

    #[error("Chunk {0} is missing")]
    MissingChunk(u32),

    #[error("Chunk {index} is corrupt: expected {expected} bytes on disk, found {actual}")]
    Corrupt { index: u32, expected: u64, actual: u64 },

    #[error("Upload incomplete: {0}")]
    IncompleteUpload(String),

    #[error("Integrity check failed: expected digest {expected}, computed {actual}")]
    IntegrityMismatch { expected: String, actual: String },

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Invalid digest: {0}")]
    InvalidDigest(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl ChunkloadError {
    pub fn category(&self) -> ErrorCategory {
        use ChunkloadError::*;

        match self {
            FileTooLarge { .. }
            | FolderNotFound(_)
            | SessionNotFound(_)
            | InvalidIndex { .. }
            | SizeMismatch { .. }
            | SessionNotAcceptingChunks { .. }
            | InvalidRequest(_)
            | InvalidDigest(_) => ErrorCategory::Client,
            Io(_) => ErrorCategory::Transient,
            MissingChunk(_) | Corrupt { .. } | IncompleteUpload(_) | IntegrityMismatch { .. } => {
                ErrorCategory::Integrity
            }
            Storage(_) | Serialization(_) => ErrorCategory::Persistence,
            InvalidTransition { .. } | Internal(_) => ErrorCategory::Internal,
        }
    }

    /// Whether the caller should retry the same request unchanged.
    pub fn is_retryable(&self) -> bool {
        self.category() == ErrorCategory::Transient
    }
}
