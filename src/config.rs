use std::{env, net::SocketAddr, path::PathBuf, time::Duration};

use anyhow::{bail, Result};
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobStoreBackend {
    Sqlite(PathBuf),
    Memory,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BlobBackend {
    S3 {
        bucket: String,
        endpoint_url: Option<String>,
        key_prefix: Option<String>,
    },
    Local {
        root: PathBuf,
        public_base_url: String,
        signing_secret: String,
    },
}

#[derive(Debug, Clone)]
pub struct Config {
    pub bind_addr: SocketAddr,
    pub jwt_secret: String,
    pub jwt_secret_is_fallback: bool,
    pub token_expiry_hours: i64,
    pub job_store: JobStoreBackend,
    pub retention: Duration,
    pub blob_backend: BlobBackend,
    pub download_url_ttl: Duration,
    pub fetch_workers: usize,
    pub fetch_temp_root: PathBuf,
    pub ytdlp_bin: String,
    pub metadata_timeout: Option<Duration>,
    pub submit_rate_limit_per_minute: u32,
    pub submit_rate_limit_burst: u32,
    pub json_logs: bool,
}

fn var_trimmed(key: &str) -> Option<String> {
    env::var(key)
        .ok()
        .map(|v| v.trim().trim_matches('"').trim_matches('\'').to_string())
        .filter(|v| !v.is_empty())
}

fn parse_or<T: std::str::FromStr>(key: &str, default: T) -> T {
    var_trimmed(key)
        .and_then(|v| v.parse::<T>().ok())
        .unwrap_or(default)
}

impl Config {
    pub fn from_env() -> Result<Self> {
        let bind_addr = var_trimmed("VIDEO_FETCH_BIND_ADDR")
            .and_then(|v| v.parse::<SocketAddr>().ok())
            .unwrap_or_else(|| SocketAddr::from(([0, 0, 0, 0], 8080)));

        let (jwt_secret, jwt_secret_is_fallback) = match var_trimmed("JWT_SECRET_KEY") {
            Some(secret) => (secret, false),
            None => {
                eprintln!(
                    "[video-fetch-api] JWT_SECRET_KEY not set. Falling back to generated secret; issued tokens will not survive a restart."
                );
                (format!("fallback-{}", Uuid::new_v4()), true)
            }
        };

        let job_store = match var_trimmed("JOB_STORE").as_deref() {
            Some("memory") => JobStoreBackend::Memory,
            Some("sqlite") | None => JobStoreBackend::Sqlite(PathBuf::from(
                var_trimmed("JOB_STORE_PATH").unwrap_or_else(|| "/data/jobs.sqlite3".to_string()),
            )),
            Some(other) => bail!("Unknown JOB_STORE `{other}` (expected sqlite or memory)"),
        };

        let blob_backend = match var_trimmed("BLOB_BACKEND").as_deref() {
            Some("s3") | None => {
                let Some(bucket) = var_trimmed("S3_BUCKET_NAME") else {
                    bail!("S3_BUCKET_NAME is required when BLOB_BACKEND=s3");
                };
                BlobBackend::S3 {
                    bucket,
                    endpoint_url: var_trimmed("S3_ENDPOINT_URL"),
                    key_prefix: var_trimmed("S3_KEY_PREFIX"),
                }
            }
            Some("local") => BlobBackend::Local {
                root: PathBuf::from(
                    var_trimmed("LOCAL_BLOB_ROOT").unwrap_or_else(|| "/data/blobs".to_string()),
                ),
                public_base_url: var_trimmed("PUBLIC_BASE_URL")
                    .unwrap_or_else(|| format!("http://{bind_addr}")),
                signing_secret: var_trimmed("BLOB_SIGNING_SECRET")
                    .unwrap_or_else(|| jwt_secret.clone()),
            },
            Some(other) => bail!("Unknown BLOB_BACKEND `{other}` (expected s3 or local)"),
        };

        let metadata_timeout = var_trimmed("METADATA_TIMEOUT_SECONDS")
            .and_then(|v| v.parse::<u64>().ok())
            .filter(|secs| *secs > 0)
            .map(Duration::from_secs);

        Ok(Self {
            bind_addr,
            jwt_secret,
            jwt_secret_is_fallback,
            token_expiry_hours: parse_or("TOKEN_EXPIRY_HOURS", 24),
            job_store,
            retention: Duration::from_secs(parse_or("JOB_RETENTION_SECONDS", 7 * 24 * 60 * 60)),
            blob_backend,
            download_url_ttl: Duration::from_secs(parse_or("DOWNLOAD_URL_TTL_SECONDS", 24 * 60 * 60)),
            fetch_workers: parse_or("FETCH_WORKERS", 2usize).max(1),
            fetch_temp_root: var_trimmed("FETCH_TEMP_ROOT")
                .map(PathBuf::from)
                .unwrap_or_else(env::temp_dir),
            ytdlp_bin: var_trimmed("YTDLP_BIN").unwrap_or_else(|| "yt-dlp".to_string()),
            metadata_timeout,
            submit_rate_limit_per_minute: parse_or("SUBMIT_RATE_LIMIT_PER_MINUTE", 30),
            submit_rate_limit_burst: parse_or("SUBMIT_RATE_LIMIT_BURST", 10),
            json_logs: var_trimmed("LOG_FORMAT")
                .map(|v| v.eq_ignore_ascii_case("json"))
                .unwrap_or(false),
        })
    }
}

/// Signing settings for offline token issuance. Requires an explicit secret.
pub fn token_settings_from_env() -> Result<(String, i64)> {
    let Some(secret) = var_trimmed("JWT_SECRET_KEY") else {
        bail!("JWT_SECRET_KEY must be set to issue tokens");
    };
    Ok((secret, parse_or("TOKEN_EXPIRY_HOURS", 24)))
}
