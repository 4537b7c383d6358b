use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::errors::ErrorKind;

pub const DEFAULT_QUALITY: &str = "720p";
pub const DEFAULT_FORMAT: &str = "mp4";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DownloadRequest {
    #[serde(default)]
    pub url: String,
    #[serde(default)]
    pub quality: Option<String>,
    #[serde(default)]
    pub format: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Initiated,
    Downloading,
    Completed,
    Failed,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Initiated => "initiated",
            Self::Downloading => "downloading",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "initiated" => Some(Self::Initiated),
            "downloading" => Some(Self::Downloading),
            "completed" => Some(Self::Completed),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    /// Allowed edges: initiated to downloading or failed, downloading to
    /// completed or failed. A non-terminal status may be re-applied to itself.
    pub fn can_advance_to(&self, next: JobStatus) -> bool {
        matches!(
            (self, next),
            (Self::Initiated, Self::Initiated)
                | (Self::Initiated, Self::Downloading)
                | (Self::Initiated, Self::Failed)
                | (Self::Downloading, Self::Downloading)
                | (Self::Downloading, Self::Completed)
                | (Self::Downloading, Self::Failed)
        )
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VideoInfo {
    pub title: String,
    pub duration: u64,
    pub uploader: String,
    pub view_count: u64,
    pub upload_date: String,
    pub thumbnail: String,
    pub formats_available: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobError {
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<ErrorKind>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobRecord {
    pub job_id: String,
    pub owner_id: String,
    pub source_url: String,
    pub quality: String,
    pub format: String,
    pub status: JobStatus,
    pub video_info: Option<VideoInfo>,
    pub artifact_key: Option<String>,
    pub download_url: Option<String>,
    pub download_url_expires_at: Option<DateTime<Utc>>,
    pub error: Option<JobError>,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub failed_at: Option<DateTime<Utc>>,
    pub expires_at: DateTime<Utc>,
}

impl JobRecord {
    pub fn new(
        job_id: String,
        owner_id: String,
        source_url: String,
        quality: String,
        format: String,
        created_at: DateTime<Utc>,
        expires_at: DateTime<Utc>,
    ) -> Self {
        Self {
            job_id,
            owner_id,
            source_url,
            quality,
            format,
            status: JobStatus::Initiated,
            video_info: None,
            artifact_key: None,
            download_url: None,
            download_url_expires_at: None,
            error: None,
            created_at,
            completed_at: None,
            failed_at: None,
            expires_at,
        }
    }

    /// Merge a patch into the record. Returns false and leaves the record
    /// untouched when `JobPatch::applies_to` rejects it.
    pub fn apply(&mut self, patch: &JobPatch) -> bool {
        if !patch.applies_to(self.status) {
            return false;
        }
        if let Some(next) = patch.status {
            self.status = next;
        }
        if let Some(info) = &patch.video_info {
            self.video_info = Some(info.clone());
        }
        if let Some(key) = &patch.artifact_key {
            self.artifact_key = Some(key.clone());
        }
        if let Some(url) = &patch.download_url {
            self.download_url = Some(url.clone());
        }
        if let Some(at) = patch.download_url_expires_at {
            self.download_url_expires_at = Some(at);
        }
        if let Some(err) = &patch.error {
            self.error = Some(err.clone());
        }
        if let Some(at) = patch.completed_at {
            self.completed_at = Some(at);
        }
        if let Some(at) = patch.failed_at {
            self.failed_at = Some(at);
        }
        true
    }
}

/// Partial write: only `Some` fields are touched.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct JobPatch {
    pub status: Option<JobStatus>,
    pub video_info: Option<VideoInfo>,
    pub artifact_key: Option<String>,
    pub download_url: Option<String>,
    pub download_url_expires_at: Option<DateTime<Utc>>,
    pub error: Option<JobError>,
    pub completed_at: Option<DateTime<Utc>>,
    pub failed_at: Option<DateTime<Utc>>,
}

impl JobPatch {
    /// Completion fields only travel with `completed`, failure fields only
    /// with `failed`.
    pub fn is_well_formed(&self) -> bool {
        let completion = self.artifact_key.is_some()
            || self.download_url.is_some()
            || self.download_url_expires_at.is_some()
            || self.completed_at.is_some();
        let failure = self.error.is_some() || self.failed_at.is_some();

        (!completion || self.status == Some(JobStatus::Completed))
            && (!failure || self.status == Some(JobStatus::Failed))
    }

    /// Whether this patch may be merged into a record currently in `current`.
    pub fn applies_to(&self, current: JobStatus) -> bool {
        if current.is_terminal() || !self.is_well_formed() {
            return false;
        }
        self.status.map_or(true, |next| current.can_advance_to(next))
    }

    pub fn downloading(video_info: VideoInfo) -> Self {
        Self {
            status: Some(JobStatus::Downloading),
            video_info: Some(video_info),
            ..Self::default()
        }
    }

    pub fn completed(
        artifact_key: String,
        download_url: String,
        url_expires_at: DateTime<Utc>,
        at: DateTime<Utc>,
    ) -> Self {
        Self {
            status: Some(JobStatus::Completed),
            artifact_key: Some(artifact_key),
            download_url: Some(download_url),
            download_url_expires_at: Some(url_expires_at),
            completed_at: Some(at),
            ..Self::default()
        }
    }

    pub fn failed(message: impl Into<String>, kind: Option<ErrorKind>, at: DateTime<Utc>) -> Self {
        Self {
            status: Some(JobStatus::Failed),
            error: Some(JobError {
                message: message.into(),
                kind,
            }),
            failed_at: Some(at),
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobStartedResponse {
    pub job_id: String,
    pub status: String,
    pub video_info: VideoInfo,
    pub estimated_seconds: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobListResponse {
    pub downloads: Vec<JobRecord>,
    pub count: usize,
    pub has_more: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ListQuery {
    pub limit: Option<usize>,
    pub offset: Option<usize>,
}
