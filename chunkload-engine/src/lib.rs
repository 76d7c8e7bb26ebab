//! Resumable chunked upload engine
//!
//! Chunks land in a [`ChunkStore`], progress lives in the [`UploadRegistry`],
//! and the [`UploadPipeline`] hands completed uploads to a bounded pool that
//! runs the [`Merger`] and then the [`Publisher`].

pub mod catalog;
pub mod chunk_store;
pub mod merger;
pub mod pipeline;
pub mod publisher;
pub mod registry;
pub mod worker;

pub use catalog::*;
pub use chunk_store::*;
pub use merger::*;
pub use pipeline::*;
pub use publisher::*;
pub use registry::*;
pub use worker::MergeHandle;
