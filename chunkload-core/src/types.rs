//! Core data types for chunkload

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::str::FromStr;
use std::time::SystemTime;

/// Upload session identifier using ULID for time-ordering
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SessionId(ulid::Ulid);

impl SessionId {
    /// Generate a new session id with current timestamp
    pub fn new() -> Self {
        SessionId(ulid::Ulid::new())
    }

    /// Create session id from ULID
    pub fn from_ulid(ulid: ulid::Ulid) -> Self {
        SessionId(ulid)
    }

    /// Get the underlying ULID
    pub fn as_ulid(&self) -> ulid::Ulid {
        self.0
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for SessionId {
    type Err = crate::ChunkloadError;

    fn from_str(s: &str) -> crate::Result<Self> {
        ulid::Ulid::from_string(s)
            .map(SessionId)
            .map_err(|e| crate::ChunkloadError::InvalidRequest(format!("bad session id '{}': {}", s, e)))
    }
}

/// Content hash for integrity verification
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ContentHash([u8; 32]);

impl ContentHash {
    /// Create hash from data using BLAKE3
    pub fn new(data: &[u8]) -> Self {
        let hash = blake3::hash(data);
        ContentHash(hash.into())
    }

    /// Create from existing hash bytes
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        ContentHash(bytes)
    }

    /// Parse a lowercase or uppercase hex digest
    pub fn from_hex(hex: &str) -> crate::Result<Self> {
        blake3::Hash::from_hex(hex.trim())
            .map(|h| ContentHash(h.into()))
            .map_err(|e| crate::ChunkloadError::InvalidDigest(format!("'{}': {}", hex, e)))
    }

    /// Get hash as bytes
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Get hash as hex string
    pub fn to_hex(&self) -> String {
        blake3::Hash::from(self.0).to_hex().to_string()
    }
}

impl std::fmt::Display for ContentHash {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.to_hex())
    }
}

/// Incremental BLAKE3 accumulator for streaming digests
#[derive(Default)]
pub struct ContentHasher {
    inner: blake3::Hasher,
    bytes: u64,
}

impl ContentHasher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update(&mut self, data: &[u8]) {
        self.inner.update(data);
        self.bytes += data.len() as u64;
    }

    /// Number of bytes fed so far
    pub fn bytes_hashed(&self) -> u64 {
        self.bytes
    }

    pub fn finalize(&self) -> ContentHash {
        ContentHash(self.inner.finalize().into())
    }
}

/// Lifecycle state of an upload session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UploadStatus {
    Uploading,
    Merging,
    Completed,
    Failed,
}

impl UploadStatus {
    /// Terminal states are never left
    pub fn is_terminal(self) -> bool {
        matches!(self, UploadStatus::Completed | UploadStatus::Failed)
    }

    /// Whether `self -> to` is an edge of the session state machine
    pub fn can_transition_to(self, to: UploadStatus) -> bool {
        use UploadStatus::*;
        matches!(
            (self, to),
            (Uploading, Merging) | (Uploading, Failed) | (Merging, Completed) | (Merging, Failed)
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            UploadStatus::Uploading => "uploading",
            UploadStatus::Merging => "merging",
            UploadStatus::Completed => "completed",
            UploadStatus::Failed => "failed",
        }
    }
}

impl std::fmt::Display for UploadStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Coarse media classification of a published file
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum FileType {
    Image,
    Video,
    Other,
}

impl FileType {
    /// Classify by file name extension, returning the type and a MIME string
    pub fn classify(file_name: &str) -> (FileType, &'static str) {
        let ext = std::path::Path::new(file_name)
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| e.to_ascii_lowercase())
            .unwrap_or_default();

        match ext.as_str() {
            "jpg" | "jpeg" => (FileType::Image, "image/jpeg"),
            "png" => (FileType::Image, "image/png"),
            "gif" => (FileType::Image, "image/gif"),
            "webp" => (FileType::Image, "image/webp"),
            "bmp" => (FileType::Image, "image/bmp"),
            "mp4" => (FileType::Video, "video/mp4"),
            "mov" => (FileType::Video, "video/quicktime"),
            "avi" => (FileType::Video, "video/x-msvideo"),
            "webm" => (FileType::Video, "video/webm"),
            "mkv" => (FileType::Video, "video/x-matroska"),
            _ => (FileType::Other, "application/octet-stream"),
        }
    }
}

/// Catalog folder that published files may belong to
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Folder {
    pub id: String,
    pub name: String,
    pub created_at: SystemTime,
}

impl Folder {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Folder {
            id: id.into(),
            name: name.into(),
            created_at: SystemTime::now(),
        }
    }
}

/// Final artifact recorded in the catalog once an upload is published
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileRecord {
    /// Same id as the upload session that produced it
    pub id: SessionId,
    pub name: String,
    pub path: PathBuf,
    pub url: String,
    pub size: u64,
    pub file_type: FileType,
    pub mime_type: String,
    pub content_hash: ContentHash,
    pub folder_id: Option<String>,
    pub uploader_id: Option<String>,
    pub created_at: SystemTime,
    pub updated_at: SystemTime,
}

/// Client request to start a resumable upload
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct InitiateRequest {
    pub file_name: String,
    pub total_size: u64,
    /// Falls back to the configured default when absent
    pub chunk_size: Option<u64>,
    pub folder_id: Option<String>,
    /// Hex BLAKE3 digest of the whole file; when absent the computed digest is trusted
    pub expected_digest: Option<String>,
    pub uploader_id: Option<String>,
}

impl InitiateRequest {
    pub fn new(file_name: impl Into<String>, total_size: u64) -> Self {
        InitiateRequest {
            file_name: file_name.into(),
            total_size,
            ..Default::default()
        }
    }

    pub fn with_chunk_size(mut self, chunk_size: u64) -> Self {
        self.chunk_size = Some(chunk_size);
        self
    }

    pub fn with_folder(mut self, folder_id: impl Into<String>) -> Self {
        self.folder_id = Some(folder_id.into());
        self
    }

    pub fn with_expected_digest(mut self, digest: impl Into<String>) -> Self {
        self.expected_digest = Some(digest.into());
        self
    }

    pub fn with_uploader(mut self, uploader_id: impl Into<String>) -> Self {
        self.uploader_id = Some(uploader_id.into());
        self
    }
}

/// Reply to a successful initiate
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InitiateResponse {
    pub session_id: SessionId,
    pub chunk_size: u64,
    pub chunk_count: u32,
}

/// Result of probing the catalog for an already-published file
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExistingFile {
    pub exists: bool,
    pub file_id: Option<SessionId>,
    pub url: Option<String>,
}

impl ExistingFile {
    pub fn absent() -> Self {
        ExistingFile {
            exists: false,
            file_id: None,
            url: None,
        }
    }
}

/// Consistent point-in-time view of a session's progress
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusSnapshot {
    pub session_id: SessionId,
    pub file_name: String,
    pub status: UploadStatus,
    pub uploaded_bytes: u64,
    pub total_size: u64,
    pub chunk_size: u64,
    pub chunk_count: u32,
    pub received_chunks: u32,
    /// Pending chunk indexes in ascending order
    pub missing_chunks: Vec<u32>,
    pub error: Option<String>,
    pub created_at: SystemTime,
    pub updated_at: SystemTime,
}

impl StatusSnapshot {
    /// Upload progress in percent
    pub fn progress(&self) -> f64 {
        self.uploaded_bytes as f64 / self.total_size as f64 * 100.0
    }
}
