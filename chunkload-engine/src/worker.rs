//! Bounded pool of background merge workers
//!
//! A chunk call that completes an upload submits a job here and returns at
//! once; a fixed number of workers drain the queue so concurrent merges never
//! exceed `merge_workers`.

use futures::FutureExt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info};
use chunkload_core::*;
use crate::{Merger, Publisher, UploadRegistry};

struct MergeJob {
    session_id: SessionId,
    done: oneshot::Sender<Result<FileRecord>>,
}

/// Resolves once the merge and publish of one session finished
#[derive(Debug)]
pub struct MergeHandle {
    session_id: SessionId,
    rx: oneshot::Receiver<Result<FileRecord>>,
}

impl MergeHandle {
    pub fn session_id(&self) -> SessionId {
        self.session_id
    }

    /// Wait for the published record, or the error that failed the session
    pub async fn wait(self) -> Result<FileRecord> {
        self.rx
            .await
            .map_err(|_| ChunkloadError::Internal(format!("merge of {} was dropped", self.session_id)))?
    }
}

/// Everything a worker needs to take a session from `merging` to terminal
pub(crate) struct MergeTask {
    pub registry: Arc<UploadRegistry>,
    pub merger: Merger,
    pub publisher: Publisher,
}

impl MergeTask {
    async fn run(&self, id: SessionId) -> Result<FileRecord> {
        let session = self.registry.get(&id)?;

        let outcome = match self.merger.merge(&session).await {
            Ok(outcome) => outcome,
            Err(e) => {
                error!("Merge failed for session {}: {}", id, e);
                self.mark_failed(&id, &e.to_string());
                return Err(e);
            }
        };

        let record = self.publisher.publish(&session, &outcome).await?;
        self.merger.release_chunks(&id).await;
        Ok(record)
    }

    fn mark_failed(&self, id: &SessionId, message: &str) {
        if let Err(e) = self.registry.fail(id, UploadStatus::Merging, message) {
            debug!("Session {} not moved to failed: {}", id, e);
        }
    }
}

pub struct MergePool {
    tx: mpsc::Sender<MergeJob>,
    workers: Vec<JoinHandle<()>>,
}

impl MergePool {
    /// Spawn `workers` tasks on the current tokio runtime
    pub(crate) fn start(workers: usize, queue_depth: usize, task: Arc<MergeTask>) -> Self {
        let (tx, rx) = mpsc::channel::<MergeJob>(queue_depth);
        let rx = Arc::new(Mutex::new(rx));

        let workers = (0..workers)
            .map(|worker_id| {
                let rx = rx.clone();
                let task = task.clone();
                tokio::spawn(async move {
                    loop {
                        let job = { rx.lock().await.recv().await };
                        let Some(job) = job else {
                            break;
                        };
                        Self::run_job(worker_id, &task, job).await;
                    }
                    debug!("Merge worker {} stopped", worker_id);
                })
            })
            .collect();

        MergePool { tx, workers }
    }

    async fn run_job(worker_id: usize, task: &MergeTask, job: MergeJob) {
        let id = job.session_id;
        info!("Merge worker {} picked up session {}", worker_id, id);

        let result = AssertUnwindSafe(task.run(id))
            .catch_unwind()
            .await
            .unwrap_or_else(|panic| {
                let message = panic
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| panic.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "unknown panic".to_string());
                error!("Merge of session {} panicked: {}", id, message);
                task.mark_failed(&id, &format!("merge panicked: {}", message));
                Err(ChunkloadError::Internal(format!("merge panicked: {}", message)))
            });

        // the submitter may have dropped its handle
        let _ = job.done.send(result);
    }

    /// Queue a merge for a session that was just moved to `merging`
    pub(crate) async fn submit(&self, session_id: SessionId) -> Result<MergeHandle> {
        let (done, rx) = oneshot::channel();
        self.tx
            .send(MergeJob { session_id, done })
            .await
            .map_err(|_| ChunkloadError::Internal("merge pool is shut down".to_string()))?;
        Ok(MergeHandle { session_id, rx })
    }

    /// Stop accepting jobs and wait for queued merges to drain
    pub async fn close(self) {
        drop(self.tx);
        for worker in self.workers {
            let _ = worker.await;
        }
    }
}
