//! Core data models and types for chunkload

pub mod config;
pub mod error;
pub mod plan;
pub mod session;
pub mod types;

#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;

pub use config::*;
pub use error::*;
pub use plan::*;
pub use session::*;
pub use types::*;

/// Result type alias for chunkload operations
pub type Result<T> = std::result::Result<T, ChunkloadError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_session_id_roundtrip() {
        let id = SessionId::new();
        let parsed: SessionId = id.to_string().parse().unwrap();
        assert_eq!(id, parsed);
        assert!("not-a-ulid".parse::<SessionId>().is_err());
    }

    #[test]
    fn test_content_hash_hex() {
        let hash = ContentHash::new(b"test data");
        let hex = hash.to_hex();
        assert_eq!(hex.len(), 64);
        assert_eq!(ContentHash::from_hex(&hex).unwrap(), hash);
        assert_eq!(ContentHash::from_hex(&hex.to_uppercase()).unwrap(), hash);
        assert!(matches!(
            ContentHash::from_hex("abc"),
            Err(ChunkloadError::InvalidDigest(_))
        ));
    }

    #[test]
    fn test_streaming_hasher_matches_one_shot() {
        let data = b"the quick brown fox jumps over the lazy dog";
        let mut hasher = ContentHasher::new();
        for piece in data.chunks(7) {
            hasher.update(piece);
        }
        assert_eq!(hasher.bytes_hashed(), data.len() as u64);
        assert_eq!(hasher.finalize(), ContentHash::new(data));
    }

    #[test]
    fn test_file_type_classification() {
        assert_eq!(FileType::classify("movie.MP4"), (FileType::Video, "video/mp4"));
        assert_eq!(FileType::classify("photo.jpeg"), (FileType::Image, "image/jpeg"));
        assert_eq!(
            FileType::classify("archive.tar.gz"),
            (FileType::Other, "application/octet-stream")
        );
        assert_eq!(FileType::classify("noext").0, FileType::Other);
    }

    #[test]
    fn test_error_categories() {
        let id = SessionId::new();
        assert_eq!(
            ChunkloadError::SessionNotFound(id).category(),
            ErrorCategory::Client
        );
        assert_eq!(
            ChunkloadError::IntegrityMismatch {
                expected: "a".into(),
                actual: "b".into()
            }
            .category(),
            ErrorCategory::Integrity
        );
        assert_eq!(
            ChunkloadError::Storage("commit failed".into()).category(),
            ErrorCategory::Persistence
        );
        assert!(ChunkloadError::Io(std::io::Error::other("disk full")).is_retryable());
        assert!(!ChunkloadError::MissingChunk(3).is_retryable());
    }
}
