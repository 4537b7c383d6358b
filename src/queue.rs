use std::{panic::AssertUnwindSafe, sync::Arc, time::Duration};

use chrono::Utc;
use futures::FutureExt;
use tokio::{
    sync::{mpsc, Semaphore},
    time,
};
use tracing::{error, info, warn};

use crate::{engine::JobEngine, store::JobStore};

/// Work handed from the request path to the background pool.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchTask {
    pub job_id: String,
    pub source_url: String,
    pub quality: String,
    pub format: String,
}

#[derive(Debug, thiserror::Error)]
#[error("Fetch queue is closed; job {0} was not dispatched")]
pub struct QueueClosed(pub String);

/// Submission side of the fetch queue. Enqueueing never waits; tasks beyond
/// the worker count sit in the queue until a slot frees up.
#[derive(Debug, Clone)]
pub struct WorkerPool {
    tx: mpsc::UnboundedSender<FetchTask>,
}

impl WorkerPool {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<FetchTask>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    pub fn enqueue(&self, task: FetchTask) -> Result<(), QueueClosed> {
        self.tx
            .send(task)
            .map_err(|rejected| QueueClosed(rejected.0.job_id))
    }
}

pub fn spawn_fetch_workers(
    engine: Arc<JobEngine>,
    mut queue_rx: mpsc::UnboundedReceiver<FetchTask>,
    worker_count: usize,
) {
    let slots = Arc::new(Semaphore::new(worker_count.max(1)));
    tokio::spawn(async move {
        while let Some(task) = queue_rx.recv().await {
            let Ok(permit) = slots.clone().acquire_owned().await else {
                break;
            };
            info!(job_id = %task.job_id, "Worker picked fetch job");
            let engine = engine.clone();
            tokio::spawn(async move {
                let _permit = permit;
                run_isolated(engine, task).await;
            });
        }
        info!("Fetch queue closed, dispatcher exiting");
    });
}

/// Runs one job, containing panics so other users' jobs keep going.
async fn run_isolated(engine: Arc<JobEngine>, task: FetchTask) {
    let job_id = task.job_id.clone();
    match AssertUnwindSafe(engine.execute(task)).catch_unwind().await {
        Ok(Ok(())) => {}
        Ok(Err(err)) => {
            error!(job_id = %job_id, kind = %err.kind, "Fetch job failed: {}", err.message);
        }
        Err(_) => {
            error!(job_id = %job_id, "Fetch job panicked");
            engine.record_panic(&job_id).await;
        }
    }
}

pub fn spawn_reaper(store: Arc<dyn JobStore>, every: Duration) {
    tokio::spawn(async move {
        let mut interval = time::interval(every);
        loop {
            interval.tick().await;
            match store.purge_expired(Utc::now()).await {
                Ok(0) => {}
                Ok(removed) => info!(removed, "Purged expired job records"),
                Err(err) => warn!("Reaper error: {err:#}"),
            }
        }
    });
}
