//! Test utilities shared by the chunkload crates

use rand::seq::SliceRandom;
use rand::Rng;

use crate::ChunkPlan;

pub struct TestDataGenerator;

impl TestDataGenerator {
    pub fn random_bytes(size: usize) -> Vec<u8> {
        let mut rng = rand::thread_rng();
        (0..size).map(|_| rng.gen()).collect()
    }

    /// Deterministic bytes where every offset is distinguishable from its neighbours
    pub fn patterned_bytes(size: usize) -> Vec<u8> {
        (0..size).map(|i| (i % 251) as u8).collect()
    }

    /// Split `data` along `plan`, returning `(index, bytes)` pairs in index order
    pub fn split(data: &[u8], plan: &ChunkPlan) -> Vec<(u32, Vec<u8>)> {
        (0..plan.chunk_count)
            .map(|i| {
                let range = plan.byte_range(i).expect("index within plan");
                (i, data[range.start as usize..range.end as usize].to_vec())
            })
            .collect()
    }

    /// Chunk indexes `0..count` in random order
    pub fn shuffled_indexes(count: u32) -> Vec<u32> {
        let mut order: Vec<u32> = (0..count).collect();
        order.shuffle(&mut rand::thread_rng());
        order
    }
}
