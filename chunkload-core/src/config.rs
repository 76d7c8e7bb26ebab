//! Pipeline configuration

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::{ChunkloadError, Result};

const MIB: u64 = 1024 * 1024;

/// Storage layout and limits for the upload pipeline
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct UploadConfig {
    /// Storage root; every other directory is relative to it
    pub root: PathBuf,
    pub temp_dir: String,
    pub merge_dir: String,
    pub upload_dir: String,
    pub catalog_dir: String,
    /// Default chunk size handed to clients that do not pick one
    pub chunk_size: u64,
    pub max_chunk_size: u64,
    pub max_file_size: u64,
    /// Number of concurrent merges
    pub merge_workers: usize,
    pub merge_queue_depth: usize,
    /// Prefix for public file URLs, e.g. `https://cdn.example.com`
    pub base_url: String,
}

impl Default for UploadConfig {
    fn default() -> Self {
        UploadConfig {
            root: PathBuf::from("./storage"),
            temp_dir: "temp".to_string(),
            merge_dir: "merge".to_string(),
            upload_dir: "uploads".to_string(),
            catalog_dir: "catalog".to_string(),
            chunk_size: 5 * MIB,
            max_chunk_size: 64 * MIB,
            max_file_size: 500 * MIB,
            merge_workers: 2,
            merge_queue_depth: 64,
            base_url: String::new(),
        }
    }
}

impl UploadConfig {
    /// Default configuration rooted at `root`
    pub fn with_root(root: impl Into<PathBuf>) -> Self {
        UploadConfig {
            root: root.into(),
            ..Default::default()
        }
    }

    /// Load from a JSON file; missing fields take their defaults
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let raw = std::fs::read(path.as_ref())?;
        let config: UploadConfig = serde_json::from_slice(&raw)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.chunk_size == 0 || self.max_chunk_size == 0 || self.max_file_size == 0 {
            return Err(ChunkloadError::InvalidRequest(
                "chunk_size, max_chunk_size and max_file_size must be > 0".to_string(),
            ));
        }
        if self.chunk_size > self.max_chunk_size {
            return Err(ChunkloadError::InvalidRequest(format!(
                "chunk_size {} exceeds max_chunk_size {}",
                self.chunk_size, self.max_chunk_size
            )));
        }
        if self.merge_workers == 0 || self.merge_queue_depth == 0 {
            return Err(ChunkloadError::InvalidRequest(
                "merge_workers and merge_queue_depth must be > 0".to_string(),
            ));
        }
        for dir in [&self.temp_dir, &self.merge_dir, &self.upload_dir, &self.catalog_dir] {
            if dir.is_empty() || dir.contains("..") {
                return Err(ChunkloadError::InvalidRequest(format!(
                    "invalid storage subdirectory '{}'",
                    dir
                )));
            }
        }
        Ok(())
    }

    pub fn temp_root(&self) -> PathBuf {
        self.root.join(&self.temp_dir)
    }

    pub fn merge_root(&self) -> PathBuf {
        self.root.join(&self.merge_dir)
    }

    pub fn upload_root(&self) -> PathBuf {
        self.root.join(&self.upload_dir)
    }

    pub fn catalog_root(&self) -> PathBuf {
        self.root.join(&self.catalog_dir)
    }

    /// Anchor a relative root at the current directory so stored paths
    /// stay valid wherever they are read later
    pub fn resolve_root(&mut self) -> Result<()> {
        self.root = std::path::absolute(&self.root)?;
        Ok(())
    }

    /// Public URL of a file stored at `relative` under the upload tree
    pub fn public_url(&self, relative: &str) -> String {
        format!(
            "{}/{}/{}",
            self.base_url.trim_end_matches('/'),
            self.upload_dir,
            relative.trim_start_matches('/')
        )
    }
}
