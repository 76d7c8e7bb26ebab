//! Filesystem storage for chunk blobs of in-flight uploads
//!
//! Layout: `<temp root>/<session id>/<chunk index>`. A chunk is written to a
//! uniquely named staging file, fsynced, size-checked and then renamed into
//! place, so a reader never observes a partially written chunk.

use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tracing::debug;
use chunkload_core::*;

/// Per-session chunk blob storage
#[derive(Debug, Clone)]
pub struct ChunkStore {
    root: PathBuf,
}

impl ChunkStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        ChunkStore { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Temp directory exclusively owned by one session
    pub fn session_dir(&self, id: &SessionId) -> PathBuf {
        self.root.join(id.to_string())
    }

    fn chunk_path(&self, id: &SessionId, index: u32) -> PathBuf {
        self.session_dir(id).join(index.to_string())
    }

    /// Persist chunk `index` durably. Fails with `SizeMismatch` unless exactly
    /// `expected_size` bytes are read; `actual` is capped at `expected_size + 1`.
    /// Writing an index twice replaces the earlier blob.
    pub async fn write<R>(&self, id: &SessionId, index: u32, expected_size: u64, reader: R) -> Result<u64>
    where
        R: AsyncRead + Unpin,
    {
        let dir = self.session_dir(id);
        fs::create_dir_all(&dir).await?;

        let staging = dir.join(format!("{}.{}.part", index, ulid::Ulid::new()));
        let written = match Self::write_staged(&staging, expected_size, reader).await {
            Ok(written) => written,
            Err(e) => {
                let _ = fs::remove_file(&staging).await;
                return Err(e);
            }
        };

        if written != expected_size {
            let _ = fs::remove_file(&staging).await;
            return Err(ChunkloadError::SizeMismatch {
                index,
                expected: expected_size,
                actual: written,
            });
        }

        if let Err(e) = fs::rename(&staging, self.chunk_path(id, index)).await {
            let _ = fs::remove_file(&staging).await;
            return Err(e.into());
        }

        debug!("Stored chunk: session={}, index={}, size={}", id, index, written);
        Ok(written)
    }

    async fn write_staged<R>(path: &Path, expected_size: u64, reader: R) -> Result<u64>
    where
        R: AsyncRead + Unpin,
    {
        let mut file = fs::File::create(path).await?;
        let mut limited = reader.take(expected_size + 1);
        let written = tokio::io::copy(&mut limited, &mut file).await?;
        file.flush().await?;
        file.sync_all().await?;
        Ok(written)
    }

    /// Open chunks `0..chunk_count` for sequential reading. Every chunk is
    /// checked against the plan before the first one is handed out.
    pub async fn read_in_order(&self, id: &SessionId, plan: &ChunkPlan) -> Result<OrderedChunks> {
        let mut paths = Vec::with_capacity(plan.chunk_count as usize);

        for index in 0..plan.chunk_count {
            let path = self.chunk_path(id, index);
            let expected = plan.expected_chunk_size(index)?;

            let metadata = match fs::metadata(&path).await {
                Ok(m) => m,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                    return Err(ChunkloadError::MissingChunk(index));
                }
                Err(e) => return Err(e.into()),
            };

            if metadata.len() != expected {
                return Err(ChunkloadError::Corrupt {
                    index,
                    expected,
                    actual: metadata.len(),
                });
            }
            paths.push(path);
        }

        Ok(OrderedChunks { paths, next: 0 })
    }

    /// Which chunks are on disk with the size the plan expects
    pub async fn present_chunks(&self, id: &SessionId, plan: &ChunkPlan) -> Result<Vec<bool>> {
        let mut present = vec![false; plan.chunk_count as usize];

        let mut entries = match fs::read_dir(self.session_dir(id)).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(present),
            Err(e) => return Err(e.into()),
        };

        while let Some(entry) = entries.next_entry().await? {
            let Some(index) = entry.file_name().to_str().and_then(|n| n.parse::<u32>().ok()) else {
                continue;
            };
            let Ok(expected) = plan.expected_chunk_size(index) else {
                continue;
            };
            let metadata = entry.metadata().await?;
            if metadata.is_file() && metadata.len() == expected {
                present[index as usize] = true;
            }
        }

        Ok(present)
    }

    /// Recursively remove the session's temp directory. A missing directory is not an error.
    pub async fn cleanup(&self, id: &SessionId) -> Result<()> {
        match fs::remove_dir_all(self.session_dir(id)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

/// Chunk files of one session, yielded strictly in index order
#[derive(Debug)]
pub struct OrderedChunks {
    paths: Vec<PathBuf>,
    next: usize,
}

impl OrderedChunks {
    pub fn len(&self) -> usize {
        self.paths.len()
    }

    pub fn is_empty(&self) -> bool {
        self.paths.is_empty()
    }

    /// Open the next chunk, or `None` after the last one
    pub async fn next_chunk(&mut self) -> Result<Option<(u32, fs::File)>> {
        let Some(path) = self.paths.get(self.next) else {
            return Ok(None);
        };
        let index = self.next as u32;

        let file = match fs::File::open(path).await {
            Ok(f) => f,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(ChunkloadError::MissingChunk(index));
            }
            Err(e) => return Err(e.into()),
        };

        self.next += 1;
        Ok(Some((index, file)))
    }
}
