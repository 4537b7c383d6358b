//! Remote video extraction.
//!
//! The fetcher is opaque to the engine: it returns metadata for a URL and, on
//! a second call, materializes the media into a caller-owned directory.

use std::{
    path::{Path, PathBuf},
    process::Stdio,
};

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;
use tokio::process::Command;
use tracing::{debug, info};

use crate::models::VideoInfo;

pub type FetchResult<T> = Result<T, FetchError>;

const AUDIO_FORMATS: [&str; 2] = ["mp3", "aac"];
const AUDIO_QUALITY: &str = "192K";

#[derive(Debug, thiserror::Error)]
pub enum FetchError {
    #[error("Failed to extract video information: {0}")]
    Extraction(String),

    #[error("Video unavailable: {0}")]
    Unavailable(String),

    #[error("Fetcher process failed: {0}")]
    Process(String),

    #[error("Fetcher produced no output in {0}")]
    MissingOutput(PathBuf),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid fetcher output: {0}")]
    Json(#[from] serde_json::Error),
}

/// Stream selection policy handed to the fetcher.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FormatSelector {
    BestAudio,
    Best,
    BestAtMost(u32),
    WorstAtMost(u32),
}

impl FormatSelector {
    pub fn resolve(quality: &str, format: &str) -> Self {
        if is_audio_format(format) {
            return Self::BestAudio;
        }
        match quality {
            "144p" => Self::WorstAtMost(144),
            "240p" => Self::WorstAtMost(240),
            "360p" => Self::BestAtMost(360),
            "480p" => Self::BestAtMost(480),
            "720p" => Self::BestAtMost(720),
            "1080p" => Self::BestAtMost(1080),
            "best" => Self::Best,
            _ => Self::BestAtMost(720),
        }
    }

    pub fn as_ytdlp(&self) -> String {
        match self {
            Self::BestAudio => "bestaudio".to_string(),
            Self::Best => "best".to_string(),
            Self::BestAtMost(h) => format!("best[height<={h}]"),
            Self::WorstAtMost(h) => format!("worst[height<={h}]"),
        }
    }

    pub fn is_audio(&self) -> bool {
        matches!(self, Self::BestAudio)
    }
}

pub fn is_audio_format(format: &str) -> bool {
    AUDIO_FORMATS.contains(&format)
}

#[async_trait]
pub trait Fetcher: Send + Sync {
    /// Metadata only, nothing is downloaded.
    async fn fetch_info(&self, url: &str) -> FetchResult<VideoInfo>;

    /// Download into `dest_dir` and return the produced file.
    async fn fetch_artifact(
        &self,
        url: &str,
        selector: FormatSelector,
        format: &str,
        dest_dir: &Path,
    ) -> FetchResult<PathBuf>;
}

#[derive(Debug, Deserialize)]
struct RawInfo {
    title: Option<String>,
    duration: Option<f64>,
    uploader: Option<String>,
    view_count: Option<u64>,
    upload_date: Option<String>,
    thumbnail: Option<String>,
    #[serde(default)]
    formats: Vec<Value>,
}

pub fn video_info_from_json(raw: &str) -> FetchResult<VideoInfo> {
    let parsed: RawInfo = serde_json::from_str(raw)?;
    Ok(VideoInfo {
        title: parsed.title.unwrap_or_else(|| "Unknown".to_string()),
        duration: parsed.duration.map(|d| d.max(0.0) as u64).unwrap_or(0),
        uploader: parsed.uploader.unwrap_or_else(|| "Unknown".to_string()),
        view_count: parsed.view_count.unwrap_or(0),
        upload_date: parsed.upload_date.unwrap_or_default(),
        thumbnail: parsed.thumbnail.unwrap_or_default(),
        formats_available: parsed.formats.len(),
    })
}

/// `yt-dlp` driven as a subprocess.
#[derive(Debug, Clone)]
pub struct YtDlpFetcher {
    binary: String,
}

impl YtDlpFetcher {
    pub fn new(binary: impl Into<String>) -> Self {
        Self {
            binary: binary.into(),
        }
    }

    async fn run(&self, args: &[String]) -> FetchResult<std::process::Output> {
        debug!(binary = %self.binary, ?args, "Invoking fetcher");
        let output = Command::new(&self.binary)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .output()
            .await?;
        Ok(output)
    }
}

fn last_stderr_line(stderr: &[u8]) -> String {
    let text = String::from_utf8_lossy(stderr);
    text.lines()
        .rev()
        .find(|l| !l.trim().is_empty())
        .unwrap_or("Unknown error")
        .trim()
        .to_string()
}

fn is_unavailable(message: &str) -> bool {
    message.contains("Video unavailable")
        || message.contains("Private video")
        || message.contains("This video has been removed")
}

#[async_trait]
impl Fetcher for YtDlpFetcher {
    async fn fetch_info(&self, url: &str) -> FetchResult<VideoInfo> {
        let args = vec![
            "--dump-single-json".to_string(),
            "--no-warnings".to_string(),
            "--no-playlist".to_string(),
            "--".to_string(),
            url.to_string(),
        ];
        let output = self.run(&args).await?;
        if !output.status.success() {
            let message = last_stderr_line(&output.stderr);
            if is_unavailable(&message) {
                return Err(FetchError::Unavailable(message));
            }
            return Err(FetchError::Extraction(message));
        }
        let stdout = String::from_utf8_lossy(&output.stdout);
        video_info_from_json(&stdout)
    }

    async fn fetch_artifact(
        &self,
        url: &str,
        selector: FormatSelector,
        format: &str,
        dest_dir: &Path,
    ) -> FetchResult<PathBuf> {
        let stem = "artifact";
        let template = if selector.is_audio() {
            dest_dir.join(format!("{stem}.%(ext)s"))
        } else {
            dest_dir.join(format!("{stem}.{format}"))
        };

        let mut args = vec![
            "--no-playlist".to_string(),
            "--no-write-info-json".to_string(),
            "--no-write-subs".to_string(),
            "--no-write-auto-subs".to_string(),
            "-f".to_string(),
            selector.as_ytdlp(),
            "-o".to_string(),
            template.to_string_lossy().into_owned(),
        ];
        if selector.is_audio() {
            args.extend([
                "--extract-audio".to_string(),
                "--audio-format".to_string(),
                format.to_string(),
                "--audio-quality".to_string(),
                AUDIO_QUALITY.to_string(),
            ]);
        }
        args.push("--".to_string());
        args.push(url.to_string());

        let output = self.run(&args).await?;
        if !output.status.success() {
            let message = last_stderr_line(&output.stderr);
            if is_unavailable(&message) {
                return Err(FetchError::Unavailable(message));
            }
            return Err(FetchError::Process(message));
        }

        let path = locate_output(dest_dir, stem, format).await?;
        info!(url = %url, output = %path.display(), "Fetched artifact");
        Ok(path)
    }
}

/// The exact `{stem}.{format}` file if present, else the first file sharing the stem.
pub async fn locate_output(dir: &Path, stem: &str, format: &str) -> FetchResult<PathBuf> {
    let expected = dir.join(format!("{stem}.{format}"));
    if tokio::fs::try_exists(&expected).await? {
        return Ok(expected);
    }

    let mut entries = tokio::fs::read_dir(dir).await?;
    while let Some(entry) = entries.next_entry().await? {
        let path = entry.path();
        let matches_stem = path
            .file_stem()
            .map(|s| s.to_string_lossy() == stem)
            .unwrap_or(false);
        if matches_stem && entry.file_type().await?.is_file() {
            return Ok(path);
        }
    }
    Err(FetchError::MissingOutput(dir.to_path_buf()))
}
