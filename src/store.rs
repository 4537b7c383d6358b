//! Durable job records.
//!
//! Every mutation is a merge patch keyed by `job_id`. Both stores enforce the
//! status machine through `JobPatch::applies_to`: a patch against a terminal
//! record, an illegal transition, or completion/failure fields carried under
//! the wrong status is skipped and reported as `Ok(false)`.

use std::{
    collections::HashMap,
    path::Path,
    sync::{Arc, Mutex},
};

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{params, types::Type, Connection, OptionalExtension, Row};
use tokio::sync::RwLock;

use crate::{
    errors::ErrorKind,
    models::{JobError, JobPatch, JobRecord, JobStatus, VideoInfo},
};

pub type StoreResult<T> = Result<T, StoreError>;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Job already exists: {0}")]
    AlreadyExists(String),

    #[error("Job not found: {0}")]
    NotFound(String),

    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Corrupt record {job_id}: {reason}")]
    Corrupt { job_id: String, reason: String },

    #[error("Store task failed: {0}")]
    Task(String),
}

#[derive(Debug, Clone, Default)]
pub struct JobPage {
    pub records: Vec<JobRecord>,
    /// The store saw at least one more matching row past this page.
    pub has_more: bool,
}

#[async_trait]
pub trait JobStore: Send + Sync {
    async fn create(&self, record: &JobRecord) -> StoreResult<()>;

    async fn update(&self, job_id: &str, patch: &JobPatch) -> StoreResult<bool>;

    async fn get(&self, job_id: &str) -> StoreResult<Option<JobRecord>>;

    /// Records owned by `owner_id`, newest first.
    async fn list_page(&self, owner_id: &str, limit: usize, offset: usize)
        -> StoreResult<JobPage>;

    async fn purge_expired(&self, now: DateTime<Utc>) -> StoreResult<usize>;

    /// Fails every non-terminal record. Run once at startup, before any worker
    /// exists, so jobs orphaned by a previous process do not stay open.
    async fn fail_unfinished(&self, now: DateTime<Utc>) -> StoreResult<usize>;

    async fn health_check(&self) -> StoreResult<()>;
}

#[derive(Debug, Default)]
pub struct MemoryJobStore {
    jobs: RwLock<HashMap<String, JobRecord>>,
}

impl MemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl JobStore for MemoryJobStore {
    async fn create(&self, record: &JobRecord) -> StoreResult<()> {
        let mut jobs = self.jobs.write().await;
        if jobs.contains_key(&record.job_id) {
            return Err(StoreError::AlreadyExists(record.job_id.clone()));
        }
        jobs.insert(record.job_id.clone(), record.clone());
        Ok(())
    }

    async fn update(&self, job_id: &str, patch: &JobPatch) -> StoreResult<bool> {
        let mut jobs = self.jobs.write().await;
        let Some(job) = jobs.get_mut(job_id) else {
            return Err(StoreError::NotFound(job_id.to_string()));
        };
        Ok(job.apply(patch))
    }

    async fn get(&self, job_id: &str) -> StoreResult<Option<JobRecord>> {
        Ok(self.jobs.read().await.get(job_id).cloned())
    }

    async fn list_page(
        &self,
        owner_id: &str,
        limit: usize,
        offset: usize,
    ) -> StoreResult<JobPage> {
        // Full scan, then filter by owner.
        let jobs = self.jobs.read().await;
        let mut owned: Vec<&JobRecord> = jobs.values().filter(|j| j.owner_id == owner_id).collect();
        owned.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.job_id.cmp(&a.job_id)));

        let mut window: Vec<JobRecord> = owned
            .into_iter()
            .skip(offset)
            .take(limit.saturating_add(1))
            .cloned()
            .collect();
        let has_more = window.len() > limit;
        window.truncate(limit);
        Ok(JobPage {
            records: window,
            has_more,
        })
    }

    async fn purge_expired(&self, now: DateTime<Utc>) -> StoreResult<usize> {
        let mut jobs = self.jobs.write().await;
        let before = jobs.len();
        jobs.retain(|_, job| job.expires_at > now);
        Ok(before - jobs.len())
    }

    async fn fail_unfinished(&self, now: DateTime<Utc>) -> StoreResult<usize> {
        let patch = orphaned_patch(now);
        let mut jobs = self.jobs.write().await;
        Ok(jobs.values_mut().map(|job| job.apply(&patch)).filter(|applied| *applied).count())
    }

    async fn health_check(&self) -> StoreResult<()> {
        Ok(())
    }
}

const ORPHANED_MESSAGE: &str = "Worker stopped before completion";

fn orphaned_patch(now: DateTime<Utc>) -> JobPatch {
    JobPatch::failed(ORPHANED_MESSAGE, Some(ErrorKind::InternalError), now)
}

const SCHEMA: &str = "
    PRAGMA journal_mode = WAL;
    PRAGMA synchronous = NORMAL;
    CREATE TABLE IF NOT EXISTS jobs (
        job_id TEXT PRIMARY KEY,
        owner_id TEXT NOT NULL,
        source_url TEXT NOT NULL,
        quality TEXT NOT NULL,
        format TEXT NOT NULL,
        status TEXT NOT NULL,
        video_info_json TEXT,
        artifact_key TEXT,
        download_url TEXT,
        download_url_expires_at TEXT,
        error_json TEXT,
        created_at TEXT NOT NULL,
        completed_at TEXT,
        failed_at TEXT,
        expires_at INTEGER NOT NULL
    );
    CREATE INDEX IF NOT EXISTS idx_jobs_owner ON jobs(owner_id, created_at);
    CREATE INDEX IF NOT EXISTS idx_jobs_expires ON jobs(expires_at);
";

const SELECT_COLUMNS: &str = "job_id,owner_id,source_url,quality,format,status,video_info_json,artifact_key,download_url,download_url_expires_at,error_json,created_at,completed_at,failed_at,expires_at";

/// SQLite-backed store. The connection is shared behind a mutex and every
/// call runs on the blocking pool.
#[derive(Clone)]
pub struct SqliteJobStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteJobStore {
    pub fn open(path: &Path) -> StoreResult<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| StoreError::Task(format!("create {}: {e}", parent.display())))?;
            }
        }
        let conn = Connection::open(path)?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    async fn with_conn<T, F>(&self, op: F) -> StoreResult<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection) -> StoreResult<T> + Send + 'static,
    {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || {
            let mut guard = conn
                .lock()
                .map_err(|_| StoreError::Task("job store connection poisoned".to_string()))?;
            op(&mut guard)
        })
        .await
        .map_err(|e| StoreError::Task(e.to_string()))?
    }
}

fn ts(value: &DateTime<Utc>) -> String {
    value.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn opt_ts(value: Option<DateTime<Utc>>) -> Option<String> {
    value.as_ref().map(ts)
}

fn conversion_error(idx: usize, err: impl std::error::Error + Send + Sync + 'static) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(err))
}

fn parse_ts(idx: usize, raw: &str) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|v| v.with_timezone(&Utc))
        .map_err(|e| conversion_error(idx, e))
}

fn parse_opt_ts(idx: usize, raw: Option<String>) -> rusqlite::Result<Option<DateTime<Utc>>> {
    raw.map(|s| parse_ts(idx, &s)).transpose()
}

fn row_to_record(row: &Row<'_>) -> rusqlite::Result<JobRecord> {
    let job_id: String = row.get(0)?;
    let status_raw: String = row.get(5)?;
    let status = JobStatus::parse(&status_raw).ok_or_else(|| {
        conversion_error(
            5,
            StoreError::Corrupt {
                job_id: job_id.clone(),
                reason: format!("unknown status `{status_raw}`"),
            },
        )
    })?;

    let video_info = row
        .get::<_, Option<String>>(6)?
        .map(|s| serde_json::from_str::<VideoInfo>(&s))
        .transpose()
        .map_err(|e| conversion_error(6, e))?;
    let error = row
        .get::<_, Option<String>>(10)?
        .map(|s| serde_json::from_str::<JobError>(&s))
        .transpose()
        .map_err(|e| conversion_error(10, e))?;

    let created_at: String = row.get(11)?;
    let expires_at: i64 = row.get(14)?;

    Ok(JobRecord {
        job_id,
        owner_id: row.get(1)?,
        source_url: row.get(2)?,
        quality: row.get(3)?,
        format: row.get(4)?,
        status,
        video_info,
        artifact_key: row.get(7)?,
        download_url: row.get(8)?,
        download_url_expires_at: parse_opt_ts(9, row.get(9)?)?,
        error,
        created_at: parse_ts(11, &created_at)?,
        completed_at: parse_opt_ts(12, row.get(12)?)?,
        failed_at: parse_opt_ts(13, row.get(13)?)?,
        expires_at: DateTime::from_timestamp(expires_at, 0).unwrap_or_default(),
    })
}

#[async_trait]
impl JobStore for SqliteJobStore {
    async fn create(&self, record: &JobRecord) -> StoreResult<()> {
        let record = record.clone();
        self.with_conn(move |conn| {
            let video_info = record.video_info.as_ref().map(serde_json::to_string).transpose()?;
            let error = record.error.as_ref().map(serde_json::to_string).transpose()?;
            let inserted = conn.execute(
                "INSERT INTO jobs(job_id,owner_id,source_url,quality,format,status,video_info_json,artifact_key,download_url,download_url_expires_at,error_json,created_at,completed_at,failed_at,expires_at) VALUES(?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11,?12,?13,?14,?15)",
                params![
                    record.job_id,
                    record.owner_id,
                    record.source_url,
                    record.quality,
                    record.format,
                    record.status.as_str(),
                    video_info,
                    record.artifact_key,
                    record.download_url,
                    opt_ts(record.download_url_expires_at),
                    error,
                    ts(&record.created_at),
                    opt_ts(record.completed_at),
                    opt_ts(record.failed_at),
                    record.expires_at.timestamp(),
                ],
            );
            match inserted {
                Ok(_) => Ok(()),
                Err(rusqlite::Error::SqliteFailure(e, _))
                    if e.code == rusqlite::ErrorCode::ConstraintViolation =>
                {
                    Err(StoreError::AlreadyExists(record.job_id.clone()))
                }
                Err(e) => Err(e.into()),
            }
        })
        .await
    }

    async fn update(&self, job_id: &str, patch: &JobPatch) -> StoreResult<bool> {
        let job_id = job_id.to_string();
        let patch = patch.clone();
        self.with_conn(move |conn| {
            let tx = conn.transaction()?;
            let current: Option<String> = tx
                .query_row(
                    "SELECT status FROM jobs WHERE job_id = ?1",
                    params![job_id],
                    |row| row.get(0),
                )
                .optional()?;
            let Some(current) = current else {
                return Err(StoreError::NotFound(job_id));
            };
            let current = JobStatus::parse(&current).ok_or_else(|| StoreError::Corrupt {
                job_id: job_id.clone(),
                reason: format!("unknown status `{current}`"),
            })?;

            if !patch.applies_to(current) {
                return Ok(false);
            }

            let video_info = patch.video_info.as_ref().map(serde_json::to_string).transpose()?;
            let error = patch.error.as_ref().map(serde_json::to_string).transpose()?;
            tx.execute(
                "UPDATE jobs SET
                    status = COALESCE(?2, status),
                    video_info_json = COALESCE(?3, video_info_json),
                    artifact_key = COALESCE(?4, artifact_key),
                    download_url = COALESCE(?5, download_url),
                    download_url_expires_at = COALESCE(?6, download_url_expires_at),
                    error_json = COALESCE(?7, error_json),
                    completed_at = COALESCE(?8, completed_at),
                    failed_at = COALESCE(?9, failed_at)
                 WHERE job_id = ?1",
                params![
                    job_id,
                    patch.status.map(|s| s.as_str()),
                    video_info,
                    patch.artifact_key,
                    patch.download_url,
                    opt_ts(patch.download_url_expires_at),
                    error,
                    opt_ts(patch.completed_at),
                    opt_ts(patch.failed_at),
                ],
            )?;
            tx.commit()?;
            Ok(true)
        })
        .await
    }

    async fn get(&self, job_id: &str) -> StoreResult<Option<JobRecord>> {
        let job_id = job_id.to_string();
        self.with_conn(move |conn| {
            let sql = format!("SELECT {SELECT_COLUMNS} FROM jobs WHERE job_id = ?1");
            Ok(conn
                .query_row(&sql, params![job_id], row_to_record)
                .optional()?)
        })
        .await
    }

    async fn list_page(
        &self,
        owner_id: &str,
        limit: usize,
        offset: usize,
    ) -> StoreResult<JobPage> {
        let owner_id = owner_id.to_string();
        self.with_conn(move |conn| {
            let sql = format!(
                "SELECT {SELECT_COLUMNS} FROM jobs WHERE owner_id = ?1 ORDER BY created_at DESC, job_id DESC LIMIT ?2 OFFSET ?3"
            );
            let mut stmt = conn.prepare(&sql)?;
            // SQLite reads a negative OFFSET as zero, so saturate instead of wrapping.
            let window = i64::try_from(limit.saturating_add(1)).unwrap_or(i64::MAX);
            let offset = i64::try_from(offset).unwrap_or(i64::MAX);
            let rows = stmt.query_map(
                params![owner_id, window, offset],
                row_to_record,
            )?;
            let mut records = Vec::new();
            for row in rows {
                records.push(row?);
            }
            let has_more = records.len() > limit;
            records.truncate(limit);
            Ok(JobPage { records, has_more })
        })
        .await
    }

    async fn purge_expired(&self, now: DateTime<Utc>) -> StoreResult<usize> {
        self.with_conn(move |conn| {
            let removed = conn.execute(
                "DELETE FROM jobs WHERE expires_at <= ?1",
                params![now.timestamp()],
            )?;
            Ok(removed)
        })
        .await
    }

    async fn fail_unfinished(&self, now: DateTime<Utc>) -> StoreResult<usize> {
        let error = serde_json::to_string(&JobError {
            message: ORPHANED_MESSAGE.to_string(),
            kind: Some(ErrorKind::InternalError),
        })?;
        self.with_conn(move |conn| {
            let failed = conn.execute(
                "UPDATE jobs SET status = ?1, error_json = ?2, failed_at = ?3
                 WHERE status IN (?4, ?5)",
                params![
                    JobStatus::Failed.as_str(),
                    error,
                    ts(&now),
                    JobStatus::Initiated.as_str(),
                    JobStatus::Downloading.as_str(),
                ],
            )?;
            Ok(failed)
        })
        .await
    }

    async fn health_check(&self) -> StoreResult<()> {
        self.with_conn(|conn| {
            conn.query_row("SELECT 1", [], |row| row.get::<_, i64>(0))?;
            Ok(())
        })
        .await
    }
}
