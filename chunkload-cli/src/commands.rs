//! Subcommand implementations. Each returns the JSON document printed on stdout.

use anyhow::{anyhow, Context, Result};
use bytes::Bytes;
use futures::stream::{self, StreamExt, TryStreamExt};
use rand::seq::SliceRandom;
use serde_json::{json, Value};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};
use chunkload_core::*;
use chunkload_engine::{FjallCatalog, UploadPipeline};

pub struct UploadOptions {
    pub path: PathBuf,
    pub folder_id: Option<String>,
    pub chunk_size: Option<u64>,
    pub concurrency: usize,
    pub send_digest: bool,
    pub shuffle: bool,
    pub uploader_id: Option<String>,
}

pub fn open_catalog(config: &UploadConfig) -> Result<Arc<FjallCatalog>> {
    let catalog = FjallCatalog::open(config.catalog_root())
        .with_context(|| format!("failed to open catalog at {}", config.catalog_root().display()))?;
    Ok(Arc::new(catalog))
}

/// Read a local file, push it through the pipeline chunk by chunk and wait
/// for the published record. Files already in the catalog are not re-sent.
pub async fn upload(config: UploadConfig, catalog: Arc<FjallCatalog>, options: UploadOptions) -> Result<Value> {
    let file_name = options
        .path
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| anyhow!("{} has no usable file name", options.path.display()))?
        .to_string();
    let data = tokio::fs::read(&options.path)
        .await
        .with_context(|| format!("failed to read {}", options.path.display()))?;
    let total_size = data.len() as u64;

    let pipeline = Arc::new(UploadPipeline::with_catalog(config, catalog)?);

    let existing = pipeline
        .check_existing(&file_name, total_size, options.folder_id.as_deref())
        .await?;
    if existing.exists {
        info!("{} ({} bytes) is already published, skipping upload", file_name, total_size);
        return Ok(serde_json::to_value(existing)?);
    }

    let mut request = InitiateRequest::new(file_name, total_size);
    request.chunk_size = options.chunk_size;
    request.folder_id = options.folder_id;
    request.uploader_id = options.uploader_id;
    if options.send_digest {
        request.expected_digest = Some(ContentHash::new(&data).to_hex());
    }

    let init = pipeline.initiate(request).await?;
    let id = init.session_id;
    let plan = ChunkPlan::new(total_size, init.chunk_size)?;

    let mut order: Vec<u32> = (0..init.chunk_count).collect();
    if options.shuffle {
        order.shuffle(&mut rand::thread_rng());
    }

    let data = Bytes::from(data);
    let receipts: Vec<_> = stream::iter(order)
        .map(|index| {
            let pipeline = pipeline.clone();
            let data = data.clone();
            async move {
                let range = plan.byte_range(index)?;
                let chunk = data.slice(range.start as usize..range.end as usize);
                pipeline.upload_chunk(&id, index, chunk).await
            }
        })
        .buffer_unordered(options.concurrency.max(1))
        .try_collect()
        .await
        .with_context(|| format!("upload {} failed", id))?;

    let completion = receipts
        .into_iter()
        .find_map(|receipt| receipt.completion)
        .ok_or_else(|| anyhow!("upload {} finished without starting a merge", id))?;

    let record = completion.wait().await.with_context(|| format!("merge of {} failed", id))?;
    info!("Published {} as {}", record.name, record.url);

    match Arc::try_unwrap(pipeline) {
        Ok(pipeline) => pipeline.shutdown().await,
        Err(_) => warn!("Pipeline still shared at exit, skipping graceful shutdown"),
    }

    Ok(serde_json::to_value(record)?)
}

pub async fn check(
    config: UploadConfig,
    catalog: Arc<FjallCatalog>,
    name: &str,
    size: u64,
    folder_id: Option<&str>,
) -> Result<Value> {
    let pipeline = UploadPipeline::with_catalog(config, catalog)?;
    let existing = pipeline.check_existing(name, size, folder_id).await?;
    pipeline.shutdown().await;
    Ok(serde_json::to_value(existing)?)
}

pub fn create_folder(catalog: &FjallCatalog, id: &str, name: &str) -> Result<Value> {
    let folder = Folder::new(id, name);
    catalog.create_folder(&folder)?;
    Ok(serde_json::to_value(folder)?)
}

pub fn list_files(catalog: &FjallCatalog) -> Result<Value> {
    let files = catalog.list_files()?;
    Ok(json!({ "count": files.len(), "files": files }))
}
