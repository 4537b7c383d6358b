//! In-memory collaborators for engine and router tests.

use std::{
    collections::HashMap,
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

use async_trait::async_trait;
use tokio::sync::Notify;

use crate::{
    artifact_store::{BlobError, BlobResult, BlobStore},
    fetcher::{FetchError, FetchResult, Fetcher, FormatSelector},
    models::{JobRecord, JobStatus, VideoInfo},
    store::JobStore,
};

pub fn sample_info(duration: u64) -> VideoInfo {
    VideoInfo {
        title: "Sample".to_string(),
        duration,
        uploader: "Uploader".to_string(),
        view_count: 1_000,
        upload_date: "20240101".to_string(),
        thumbnail: "https://img.example.com/t.jpg".to_string(),
        formats_available: 12,
    }
}

pub async fn wait_for_status(store: &dyn JobStore, job_id: &str, status: JobStatus) -> JobRecord {
    let poll = async {
        loop {
            if let Some(job) = store.get(job_id).await.expect("store read") {
                if job.status == status {
                    return job;
                }
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    };
    tokio::time::timeout(Duration::from_secs(5), poll)
        .await
        .unwrap_or_else(|_| panic!("job {job_id} never reached {status:?}"))
}

pub struct FakeFetcher {
    info: Result<VideoInfo, String>,
    info_delay: Option<Duration>,
    gate: Option<Arc<Notify>>,
    artifact_unavailable: bool,
    panic_url: Option<String>,
    seen: Arc<Mutex<Vec<FormatSelector>>>,
    in_flight: Arc<AtomicUsize>,
    peak_in_flight: Arc<AtomicUsize>,
}

struct InFlight(Arc<AtomicUsize>);

impl Drop for InFlight {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

impl FakeFetcher {
    pub fn new(info: VideoInfo) -> Self {
        Self {
            info: Ok(info),
            info_delay: None,
            gate: None,
            artifact_unavailable: false,
            panic_url: None,
            seen: Arc::new(Mutex::new(Vec::new())),
            in_flight: Arc::new(AtomicUsize::new(0)),
            peak_in_flight: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn failing_info(message: &str) -> Self {
        Self {
            info: Err(message.to_string()),
            ..Self::new(sample_info(0))
        }
    }

    /// Artifact downloads block until `gate().notify_one()`.
    pub fn gated(mut self) -> Self {
        self.gate = Some(Arc::new(Notify::new()));
        self
    }

    pub fn gate(&self) -> Arc<Notify> {
        self.gate.clone().expect("fetcher is not gated")
    }

    pub fn with_info_delay(mut self, delay: Duration) -> Self {
        self.info_delay = Some(delay);
        self
    }

    pub fn failing_artifact_unavailable(mut self) -> Self {
        self.artifact_unavailable = true;
        self
    }

    /// Artifact downloads for `url` panic instead of returning.
    pub fn panicking_on(mut self, url: &str) -> Self {
        self.panic_url = Some(url.to_string());
        self
    }

    pub fn seen_selectors(&self) -> Arc<Mutex<Vec<FormatSelector>>> {
        self.seen.clone()
    }

    /// Artifact downloads currently running.
    pub fn in_flight(&self) -> Arc<AtomicUsize> {
        self.in_flight.clone()
    }

    /// Highest number of artifact downloads seen running at once.
    pub fn peak_in_flight(&self) -> Arc<AtomicUsize> {
        self.peak_in_flight.clone()
    }
}

#[async_trait]
impl Fetcher for FakeFetcher {
    async fn fetch_info(&self, _url: &str) -> FetchResult<VideoInfo> {
        if let Some(delay) = self.info_delay {
            tokio::time::sleep(delay).await;
        }
        self.info.clone().map_err(FetchError::Extraction)
    }

    async fn fetch_artifact(
        &self,
        url: &str,
        selector: FormatSelector,
        format: &str,
        dest_dir: &Path,
    ) -> FetchResult<PathBuf> {
        if self.panic_url.as_deref() == Some(url) {
            panic!("fetcher crashed on {url}");
        }
        self.seen.lock().expect("lock").push(selector);
        let running = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak_in_flight.fetch_max(running, Ordering::SeqCst);
        let _running = InFlight(self.in_flight.clone());
        if let Some(gate) = &self.gate {
            gate.notified().await;
        }
        if self.artifact_unavailable {
            return Err(FetchError::Unavailable("Video unavailable".to_string()));
        }
        let path = dest_dir.join(format!("artifact.{format}"));
        tokio::fs::write(&path, b"media-bytes").await?;
        Ok(path)
    }
}

#[derive(Debug, Clone)]
pub struct RecordedUpload {
    pub key: String,
    pub content_type: String,
    pub metadata: HashMap<String, String>,
}

#[derive(Default)]
pub struct FakeBlobStore {
    fail_uploads: bool,
    unhealthy: bool,
    uploads: Mutex<Vec<RecordedUpload>>,
    last_ttl: Mutex<Option<Duration>>,
}

impl FakeBlobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing_uploads(mut self) -> Self {
        self.fail_uploads = true;
        self
    }

    pub fn unhealthy(mut self) -> Self {
        self.unhealthy = true;
        self
    }

    pub fn uploads(&self) -> Vec<RecordedUpload> {
        self.uploads.lock().expect("lock").clone()
    }

    pub fn last_ttl(&self) -> Option<Duration> {
        *self.last_ttl.lock().expect("lock")
    }
}

#[async_trait]
impl BlobStore for FakeBlobStore {
    async fn upload(
        &self,
        local_path: &Path,
        key: &str,
        content_type: &str,
        metadata: &HashMap<String, String>,
    ) -> BlobResult<()> {
        if self.fail_uploads {
            return Err(BlobError::UploadFailed("bucket rejected object".to_string()));
        }
        tokio::fs::metadata(local_path).await?;
        self.uploads.lock().expect("lock").push(RecordedUpload {
            key: key.to_string(),
            content_type: content_type.to_string(),
            metadata: metadata.clone(),
        });
        Ok(())
    }

    async fn presign_get(&self, key: &str, expires_in: Duration) -> BlobResult<String> {
        *self.last_ttl.lock().expect("lock") = Some(expires_in);
        Ok(format!(
            "https://blobs.example.com/{key}?expires_in={}",
            expires_in.as_secs()
        ))
    }

    async fn health_check(&self) -> BlobResult<()> {
        if self.unhealthy {
            return Err(BlobError::Unreachable("connection refused".to_string()));
        }
        Ok(())
    }
}
