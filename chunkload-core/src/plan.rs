//! Chunk layout of a single upload

use serde::{Deserialize, Serialize};
use std::ops::Range;

use crate::{ChunkloadError, Result};

/// How a file of `total_size` bytes is split into fixed-size chunks.
/// Every chunk is `chunk_size` bytes except the last, which carries the remainder.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkPlan {
    pub total_size: u64,
    pub chunk_size: u64,
    pub chunk_count: u32,
}

impl ChunkPlan {
    pub fn new(total_size: u64, chunk_size: u64) -> Result<Self> {
        if total_size == 0 {
            return Err(ChunkloadError::InvalidRequest("total size must be > 0".to_string()));
        }
        if chunk_size == 0 {
            return Err(ChunkloadError::InvalidRequest("chunk size must be > 0".to_string()));
        }

        let chunk_count = total_size.div_ceil(chunk_size);
        let chunk_count = u32::try_from(chunk_count).map_err(|_| {
            ChunkloadError::InvalidRequest(format!(
                "{} chunks of {} bytes exceeds the chunk index range",
                chunk_count, chunk_size
            ))
        })?;

        Ok(ChunkPlan {
            total_size,
            chunk_size,
            chunk_count,
        })
    }

    pub fn check_index(&self, index: u32) -> Result<()> {
        if index >= self.chunk_count {
            return Err(ChunkloadError::InvalidIndex {
                index,
                count: self.chunk_count,
            });
        }
        Ok(())
    }

    /// Byte length chunk `index` must have on the wire and on disk
    pub fn expected_chunk_size(&self, index: u32) -> Result<u64> {
        let range = self.byte_range(index)?;
        Ok(range.end - range.start)
    }

    /// Offsets of chunk `index` within the assembled file
    pub fn byte_range(&self, index: u32) -> Result<Range<u64>> {
        self.check_index(index)?;
        let start = index as u64 * self.chunk_size;
        let end = (start + self.chunk_size).min(self.total_size);
        Ok(start..end)
    }

    /// Bytes covered by the received entries of `bitmap`
    pub fn contribution_of(&self, bitmap: &[bool]) -> u64 {
        bitmap
            .iter()
            .enumerate()
            .filter(|(_, received)| **received)
            .filter_map(|(i, _)| self.expected_chunk_size(i as u32).ok())
            .sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_concrete_plan() {
        let plan = ChunkPlan::new(2_500_000, 1_000_000).unwrap();
        assert_eq!(plan.chunk_count, 3);
        assert_eq!(plan.expected_chunk_size(0).unwrap(), 1_000_000);
        assert_eq!(plan.expected_chunk_size(1).unwrap(), 1_000_000);
        assert_eq!(plan.expected_chunk_size(2).unwrap(), 500_000);
        assert_eq!(plan.byte_range(2).unwrap(), 2_000_000..2_500_000);
    }

    #[test]
    fn test_exact_multiple_has_full_last_chunk() {
        let plan = ChunkPlan::new(4096, 1024).unwrap();
        assert_eq!(plan.chunk_count, 4);
        assert_eq!(plan.expected_chunk_size(3).unwrap(), 1024);
    }

    #[test]
    fn test_chunk_larger_than_file() {
        let plan = ChunkPlan::new(10, 1024).unwrap();
        assert_eq!(plan.chunk_count, 1);
        assert_eq!(plan.expected_chunk_size(0).unwrap(), 10);
    }

    #[test]
    fn test_rejects_zero_sizes() {
        assert!(matches!(ChunkPlan::new(0, 10), Err(ChunkloadError::InvalidRequest(_))));
        assert!(matches!(ChunkPlan::new(10, 0), Err(ChunkloadError::InvalidRequest(_))));
    }

    #[test]
    fn test_out_of_range_index() {
        let plan = ChunkPlan::new(100, 10).unwrap();
        match plan.expected_chunk_size(10) {
            Err(ChunkloadError::InvalidIndex { index, count }) => {
                assert_eq!(index, 10);
                assert_eq!(count, 10);
            }
            other => panic!("expected InvalidIndex, got {:?}", other),
        }
    }

    #[test]
    fn test_contribution_uses_remainder_for_last_chunk() {
        let plan = ChunkPlan::new(25, 10).unwrap();
        assert_eq!(plan.contribution_of(&[false, false, true]), 5);
        assert_eq!(plan.contribution_of(&[true, false, true]), 15);
        assert_eq!(plan.contribution_of(&[true, true, true]), 25);
    }
}
