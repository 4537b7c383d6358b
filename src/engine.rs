//! Job lifecycle: submission, metadata enrichment, background fetch and
//! finalization.
//!
//! The synchronous half (`submit`) creates the record, fetches metadata and
//! enqueues a [`FetchTask`]; the asynchronous half (`execute`) runs on the
//! worker pool and is the only writer of the terminal states for jobs that
//! made it past metadata.

use std::{collections::HashMap, path::PathBuf, sync::Arc, time::Duration};

use chrono::Utc;
use serde_json::Value;
use tracing::{info, warn};
use uuid::Uuid;

use crate::{
    artifact_store::{artifact_key, content_type_for, BlobStore},
    errors::{AppError, AppResult, ErrorKind},
    fetcher::{FetchError, Fetcher, FormatSelector},
    models::{
        DownloadRequest, JobPatch, JobRecord, JobStartedResponse, VideoInfo, DEFAULT_FORMAT,
        DEFAULT_QUALITY,
    },
    queue::{FetchTask, WorkerPool},
    store::JobStore,
};

const MIN_ESTIMATE_SECONDS: u64 = 30;

#[derive(Debug, Clone)]
pub struct EngineSettings {
    pub retention: Duration,
    pub download_url_ttl: Duration,
    pub temp_root: PathBuf,
    /// Unset means the metadata call may take as long as the fetcher does.
    pub metadata_timeout: Option<Duration>,
}

pub struct JobEngine {
    store: Arc<dyn JobStore>,
    fetcher: Arc<dyn Fetcher>,
    blobs: Arc<dyn BlobStore>,
    pool: WorkerPool,
    settings: EngineSettings,
}

pub fn estimate_seconds(info: &VideoInfo) -> u64 {
    MIN_ESTIMATE_SECONDS.max(info.duration / 2)
}

fn validate_format(format: &str) -> AppResult<()> {
    let well_formed = (1..=8).contains(&format.len())
        && format.chars().all(|c| c.is_ascii_alphanumeric());
    if !well_formed {
        return Err(
            AppError::new(ErrorKind::UnsupportedFormat, "Unsupported output format")
                .with_detail("format", format),
        );
    }
    Ok(())
}

fn non_empty_or(value: Option<String>, default: &str) -> String {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
        .unwrap_or_else(|| default.to_string())
}

fn download_failed(job_id: &str, cause: impl std::fmt::Display) -> AppError {
    AppError::new(ErrorKind::DownloadFailed, "Failed to initiate download")
        .with_detail("download_id", job_id)
        .with_detail("error", cause.to_string())
}

/// Message stored on a failed record: the error message plus its cause, if any.
fn describe(err: &AppError) -> String {
    match err.details.get("error").and_then(Value::as_str) {
        Some(cause) => format!("{}: {cause}", err.message),
        None => err.message.clone(),
    }
}

fn fetch_failure(err: FetchError) -> AppError {
    let kind = match err {
        FetchError::Unavailable(_) => ErrorKind::VideoUnavailable,
        _ => ErrorKind::DownloadFailed,
    };
    AppError::new(kind, "Failed to download video").with_detail("error", err.to_string())
}

impl JobEngine {
    pub fn new(
        store: Arc<dyn JobStore>,
        fetcher: Arc<dyn Fetcher>,
        blobs: Arc<dyn BlobStore>,
        pool: WorkerPool,
        settings: EngineSettings,
    ) -> Self {
        Self {
            store,
            fetcher,
            blobs,
            pool,
            settings,
        }
    }

    pub async fn submit(
        &self,
        request: DownloadRequest,
        owner_id: &str,
    ) -> AppResult<JobStartedResponse> {
        let source_url = request.url.trim().to_string();
        if source_url.is_empty() {
            return Err(AppError::invalid_request("Video URL is required").with_detail("field", "url"));
        }
        let quality = non_empty_or(request.quality, DEFAULT_QUALITY);
        let format = non_empty_or(request.format, DEFAULT_FORMAT).to_ascii_lowercase();
        validate_format(&format)?;

        let job_id = Uuid::new_v4().to_string();
        info!(job_id = %job_id, owner_id = %owner_id, url = %source_url, %quality, %format, "Download requested");

        let now = Utc::now();
        let retention = chrono::Duration::from_std(self.settings.retention)
            .unwrap_or_else(|_| chrono::Duration::days(7));
        let record = JobRecord::new(
            job_id.clone(),
            owner_id.to_string(),
            source_url.clone(),
            quality.clone(),
            format.clone(),
            now,
            now + retention,
        );
        self.store
            .create(&record)
            .await
            .map_err(|e| download_failed(&job_id, e))?;

        let video_info = match self.fetch_metadata(&source_url).await {
            Ok(info) => info,
            Err(err) => {
                self.mark_failed(&job_id, &describe(&err), err.kind).await;
                return Err(err.with_detail("download_id", job_id.as_str()));
            }
        };

        match self
            .store
            .update(&job_id, &JobPatch::downloading(video_info.clone()))
            .await
        {
            Ok(true) => {}
            Ok(false) => {
                return Err(download_failed(&job_id, "job record was already finalized"));
            }
            Err(e) => {
                let err = download_failed(&job_id, e);
                self.mark_failed(&job_id, &describe(&err), err.kind).await;
                return Err(err);
            }
        }

        let task = FetchTask {
            job_id: job_id.clone(),
            source_url,
            quality,
            format,
        };
        if let Err(e) = self.pool.enqueue(task) {
            let err = download_failed(&job_id, e);
            self.mark_failed(&job_id, &describe(&err), err.kind).await;
            return Err(err);
        }

        let estimated_seconds = estimate_seconds(&video_info);
        info!(job_id = %job_id, estimated_seconds, "Download dispatched");
        Ok(JobStartedResponse {
            job_id,
            status: "started".to_string(),
            video_info,
            estimated_seconds,
        })
    }

    async fn fetch_metadata(&self, url: &str) -> AppResult<VideoInfo> {
        let lookup = self.fetcher.fetch_info(url);
        let result = match self.settings.metadata_timeout {
            Some(limit) => match tokio::time::timeout(limit, lookup).await {
                Ok(result) => result,
                Err(_) => {
                    return Err(AppError::new(
                        ErrorKind::DownloadTimeout,
                        "Timed out extracting video information",
                    )
                    .with_detail("url", url)
                    .with_detail("timeout_seconds", limit.as_secs()));
                }
            },
            None => lookup.await,
        };
        result.map_err(|e| {
            AppError::new(ErrorKind::InvalidUrl, "Failed to extract video information")
                .with_detail("url", url)
                .with_detail("error", e.to_string())
        })
    }

    /// Background half of a job. Failures land in the record; the returned
    /// error is only for the pool's log.
    pub async fn execute(&self, task: FetchTask) -> AppResult<()> {
        info!(job_id = %task.job_id, url = %task.source_url, "Fetch job started");

        let patch = match self.fetch_and_store(&task).await {
            Ok(patch) => patch,
            Err(err) => {
                self.mark_failed(&task.job_id, &describe(&err), err.kind).await;
                return Err(err);
            }
        };

        match self.store.update(&task.job_id, &patch).await {
            Ok(true) => {
                info!(job_id = %task.job_id, "Fetch job completed");
                Ok(())
            }
            Ok(false) => {
                warn!(job_id = %task.job_id, "Completion skipped: record already terminal");
                Ok(())
            }
            Err(e) => Err(AppError::internal("Failed to record job completion")
                .with_detail("download_id", task.job_id.as_str())
                .with_detail("error", e.to_string())),
        }
    }

    async fn fetch_and_store(&self, task: &FetchTask) -> AppResult<JobPatch> {
        let selector = FormatSelector::resolve(&task.quality, &task.format);

        // Removed on drop, whichever way this function exits.
        let scratch = tempfile::Builder::new()
            .prefix(&format!("fetch-{}-", task.job_id))
            .tempdir_in(&self.settings.temp_root)
            .map_err(|e| {
                AppError::internal("Failed to allocate scratch directory")
                    .with_detail("error", e.to_string())
            })?;

        let local_path = self
            .fetcher
            .fetch_artifact(&task.source_url, selector, &task.format, scratch.path())
            .await
            .map_err(fetch_failure)?;

        let key = artifact_key(&task.job_id, &task.format);
        let metadata = HashMap::from([
            ("download-id".to_string(), task.job_id.clone()),
            ("original-url".to_string(), task.source_url.clone()),
            ("format".to_string(), task.format.clone()),
            ("quality".to_string(), task.quality.clone()),
        ]);
        self.blobs
            .upload(&local_path, &key, content_type_for(&task.format), &metadata)
            .await
            .map_err(|e| {
                AppError::new(ErrorKind::DownloadFailed, "Failed to store artifact")
                    .with_detail("error", e.to_string())
            })?;

        let download_url = self
            .blobs
            .presign_get(&key, self.settings.download_url_ttl)
            .await
            .map_err(|e| {
                AppError::internal("Failed to sign download URL").with_detail("error", e.to_string())
            })?;

        if let Err(e) = scratch.close() {
            warn!(job_id = %task.job_id, "Failed removing scratch directory: {e}");
        }

        let now = Utc::now();
        let ttl = chrono::Duration::from_std(self.settings.download_url_ttl)
            .unwrap_or_else(|_| chrono::Duration::hours(24));
        Ok(JobPatch::completed(key, download_url, now + ttl, now))
    }

    pub async fn record_panic(&self, job_id: &str) {
        self.mark_failed(job_id, "Fetch worker crashed", ErrorKind::InternalError)
            .await;
    }

    /// Best-effort: a failure to record a failure is only logged.
    async fn mark_failed(&self, job_id: &str, message: &str, kind: ErrorKind) {
        let patch = JobPatch::failed(message, Some(kind), Utc::now());
        match self.store.update(job_id, &patch).await {
            Ok(true) => info!(job_id = %job_id, kind = %kind, "Job marked failed"),
            Ok(false) => warn!(job_id = %job_id, "Failure not recorded: record already terminal"),
            Err(e) => warn!(job_id = %job_id, "Failed to record job failure: {e}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        models::JobStatus,
        queue::spawn_fetch_workers,
        store::MemoryJobStore,
        testing::{sample_info, wait_for_status, FakeBlobStore, FakeFetcher},
    };

    struct Harness {
        engine: Arc<JobEngine>,
        store: Arc<MemoryJobStore>,
        blobs: Arc<FakeBlobStore>,
        _scratch: tempfile::TempDir,
    }

    fn harness(fetcher: FakeFetcher, blobs: FakeBlobStore) -> Harness {
        let scratch = tempfile::tempdir().expect("tempdir");
        let store = Arc::new(MemoryJobStore::new());
        let blobs = Arc::new(blobs);
        let (pool, rx) = WorkerPool::new();
        let engine = Arc::new(JobEngine::new(
            store.clone(),
            Arc::new(fetcher),
            blobs.clone(),
            pool,
            EngineSettings {
                retention: Duration::from_secs(7 * 24 * 3600),
                download_url_ttl: Duration::from_secs(24 * 3600),
                temp_root: scratch.path().to_path_buf(),
                metadata_timeout: None,
            },
        ));
        spawn_fetch_workers(engine.clone(), rx, 2);
        Harness {
            engine,
            store,
            blobs,
            _scratch: scratch,
        }
    }

    fn request(url: &str) -> DownloadRequest {
        DownloadRequest {
            url: url.to_string(),
            quality: None,
            format: None,
        }
    }

    #[test]
    fn estimate_is_half_duration_with_floor() {
        assert_eq!(estimate_seconds(&sample_info(120)), 60);
        assert_eq!(estimate_seconds(&sample_info(10)), 30);
        assert_eq!(estimate_seconds(&sample_info(61)), 30);
        assert_eq!(estimate_seconds(&sample_info(0)), 30);
    }

    #[tokio::test]
    async fn empty_url_is_rejected_without_record() {
        let h = harness(FakeFetcher::new(sample_info(60)), FakeBlobStore::new());
        let err = h.engine.submit(request("   "), "alice").await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::InvalidRequest);
        assert_eq!(err.details["field"], "url");
        let page = h.store.list_page("alice", 10, 0).await.expect("list");
        assert!(page.records.is_empty());
    }

    #[tokio::test]
    async fn malformed_format_is_unsupported() {
        let h = harness(FakeFetcher::new(sample_info(60)), FakeBlobStore::new());
        let mut req = request("https://example.com/v1");
        req.format = Some("../mp4".into());
        let err = h.engine.submit(req, "alice").await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::UnsupportedFormat);
    }

    #[tokio::test]
    async fn submit_with_defaults_runs_to_completion() {
        let fetcher = FakeFetcher::new(sample_info(120)).gated();
        let gate = fetcher.gate();
        let h = harness(fetcher, FakeBlobStore::new());

        let started = h
            .engine
            .submit(request("https://example.com/v1"), "alice")
            .await
            .expect("submit");
        assert_eq!(started.status, "started");
        assert_eq!(started.estimated_seconds, 60);
        assert_eq!(started.video_info, sample_info(120));

        let pending = h.store.get(&started.job_id).await.expect("get").expect("present");
        assert_eq!(pending.status, JobStatus::Downloading);
        assert_eq!(pending.quality, "720p");
        assert_eq!(pending.format, "mp4");
        assert!(pending.download_url.is_none());

        gate.notify_one();
        let done = wait_for_status(h.store.as_ref(), &started.job_id, JobStatus::Completed).await;
        assert_eq!(done.artifact_key.as_deref(), Some(artifact_key(&started.job_id, "mp4").as_str()));
        assert!(done.download_url.as_deref().is_some_and(|u| !u.is_empty()));
        assert!(done.completed_at.is_some());
        assert!(done.failed_at.is_none());
        assert_eq!(done.video_info, Some(sample_info(120)));

        let uploads = h.blobs.uploads();
        assert_eq!(uploads.len(), 1);
        assert_eq!(uploads[0].content_type, "video/mp4");
        assert_eq!(
            uploads[0].key,
            format!("downloads/{0}/{0}.mp4", started.job_id)
        );
        assert_eq!(uploads[0].metadata["download-id"], started.job_id);
        assert_eq!(uploads[0].metadata["original-url"], "https://example.com/v1");
        assert_eq!(uploads[0].metadata["quality"], "720p");
        assert_eq!(h.blobs.last_ttl(), Some(Duration::from_secs(24 * 3600)));
    }

    #[tokio::test]
    async fn metadata_failure_surfaces_invalid_url_and_fails_record() {
        let h = harness(FakeFetcher::failing_info("Unsupported URL"), FakeBlobStore::new());
        let err = h
            .engine
            .submit(request("not a url"), "alice")
            .await
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::InvalidUrl);
        assert_eq!(err.status(), axum::http::StatusCode::BAD_REQUEST);

        let job_id = err.details["download_id"].as_str().expect("job id").to_string();
        let job = h.store.get(&job_id).await.expect("get").expect("present");
        assert_eq!(job.status, JobStatus::Failed);
        assert!(job.video_info.is_none());
        let error = job.error.expect("error");
        assert_eq!(error.kind, Some(ErrorKind::InvalidUrl));
        assert!(error.message.contains("Unsupported URL"));
    }

    #[tokio::test]
    async fn metadata_timeout_is_reported_as_download_timeout() {
        let scratch = tempfile::tempdir().expect("tempdir");
        let store = Arc::new(MemoryJobStore::new());
        let (pool, _rx) = WorkerPool::new();
        let engine = JobEngine::new(
            store.clone(),
            Arc::new(FakeFetcher::new(sample_info(10)).with_info_delay(Duration::from_secs(5))),
            Arc::new(FakeBlobStore::new()),
            pool,
            EngineSettings {
                retention: Duration::from_secs(60),
                download_url_ttl: Duration::from_secs(60),
                temp_root: scratch.path().to_path_buf(),
                metadata_timeout: Some(Duration::from_millis(20)),
            },
        );
        let err = engine
            .submit(request("https://example.com/slow"), "alice")
            .await
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::DownloadTimeout);
    }

    #[tokio::test]
    async fn background_failure_lands_in_record_only() {
        let h = harness(
            FakeFetcher::new(sample_info(40)),
            FakeBlobStore::new().failing_uploads(),
        );
        let started = h
            .engine
            .submit(request("https://example.com/v2"), "alice")
            .await
            .expect("submit");

        let failed = wait_for_status(h.store.as_ref(), &started.job_id, JobStatus::Failed).await;
        let error = failed.error.expect("error");
        assert_eq!(error.kind, Some(ErrorKind::DownloadFailed));
        assert!(failed.failed_at.is_some());
        assert!(failed.download_url.is_none());
    }

    #[tokio::test]
    async fn unavailable_video_maps_to_video_unavailable() {
        let h = harness(
            FakeFetcher::new(sample_info(40)).failing_artifact_unavailable(),
            FakeBlobStore::new(),
        );
        let started = h
            .engine
            .submit(request("https://example.com/gone"), "alice")
            .await
            .expect("submit");
        let failed = wait_for_status(h.store.as_ref(), &started.job_id, JobStatus::Failed).await;
        assert_eq!(
            failed.error.and_then(|e| e.kind),
            Some(ErrorKind::VideoUnavailable)
        );
    }

    #[tokio::test]
    async fn audio_job_uses_best_audio_and_cleans_scratch() {
        let fetcher = FakeFetcher::new(sample_info(200));
        let seen = fetcher.seen_selectors();
        let h = harness(fetcher, FakeBlobStore::new());
        let mut req = request("https://example.com/song");
        req.quality = Some("best".into());
        req.format = Some("mp3".into());
        let started = h.engine.submit(req, "alice").await.expect("submit");

        wait_for_status(h.store.as_ref(), &started.job_id, JobStatus::Completed).await;
        assert_eq!(seen.lock().expect("lock").as_slice(), &[FormatSelector::BestAudio]);
        assert_eq!(h.blobs.uploads()[0].content_type, "audio/mpeg");

        let leftovers = std::fs::read_dir(h._scratch.path()).expect("read_dir").count();
        assert_eq!(leftovers, 0);
    }

    #[tokio::test]
    async fn completed_job_ignores_late_failure() {
        let h = harness(FakeFetcher::new(sample_info(20)), FakeBlobStore::new());
        let started = h
            .engine
            .submit(request("https://example.com/v3"), "alice")
            .await
            .expect("submit");
        let done = wait_for_status(h.store.as_ref(), &started.job_id, JobStatus::Completed).await;

        h.engine.record_panic(&started.job_id).await;
        let after = h.store.get(&started.job_id).await.expect("get").expect("present");
        assert_eq!(after, done);
    }
}
