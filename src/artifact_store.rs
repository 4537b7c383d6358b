use std::{
    collections::HashMap,
    path::{Component, Path, PathBuf},
    time::Duration,
};

use anyhow::{Context, Result};
use async_trait::async_trait;
use aws_sdk_s3::{presigning::PresigningConfig, primitives::ByteStream, Client};
use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use chrono::Utc;
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use tokio::fs;
use tracing::{debug, info};

pub type BlobResult<T> = Result<T, BlobError>;

type HmacSha256 = Hmac<Sha256>;

const GENERIC_CONTENT_TYPE: &str = "application/octet-stream";

#[derive(Debug, thiserror::Error)]
pub enum BlobError {
    #[error("Upload failed: {0}")]
    UploadFailed(String),

    #[error("Presign failed: {0}")]
    PresignFailed(String),

    #[error("Blob store unreachable: {0}")]
    Unreachable(String),

    #[error("Object not found: {0}")]
    NotFound(String),

    #[error("Invalid key: {0}")]
    InvalidKey(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

pub fn artifact_key(job_id: &str, format: &str) -> String {
    format!("downloads/{job_id}/{job_id}.{format}")
}

pub fn content_type_for(format: &str) -> &'static str {
    match format {
        "mp4" => "video/mp4",
        "webm" => "video/webm",
        "mkv" => "video/x-matroska",
        "mp3" => "audio/mpeg",
        "aac" => "audio/aac",
        _ => GENERIC_CONTENT_TYPE,
    }
}

#[async_trait]
pub trait BlobStore: Send + Sync {
    async fn upload(
        &self,
        local_path: &Path,
        key: &str,
        content_type: &str,
        metadata: &HashMap<String, String>,
    ) -> BlobResult<()>;

    /// Time-limited GET capability for a single object.
    async fn presign_get(&self, key: &str, expires_in: Duration) -> BlobResult<String>;

    async fn health_check(&self) -> BlobResult<()>;
}

#[derive(Debug, Clone)]
pub struct S3Settings {
    pub bucket: String,
    pub endpoint_url: Option<String>,
    pub key_prefix: Option<String>,
}

#[derive(Clone)]
pub struct S3BlobStore {
    client: Client,
    bucket: String,
    key_prefix: Option<String>,
}

impl S3BlobStore {
    pub async fn new(settings: S3Settings) -> Self {
        let sdk_config = aws_config::load_defaults(aws_config::BehaviorVersion::latest()).await;
        let mut builder = aws_sdk_s3::config::Builder::from(&sdk_config);
        if let Some(endpoint) = &settings.endpoint_url {
            builder = builder.endpoint_url(endpoint).force_path_style(true);
        }
        Self {
            client: Client::from_conf(builder.build()),
            bucket: settings.bucket,
            key_prefix: settings
                .key_prefix
                .map(|p| p.trim_matches('/').to_string())
                .filter(|p| !p.is_empty()),
        }
    }

    fn object_key(&self, key: &str) -> String {
        match &self.key_prefix {
            Some(prefix) => format!("{prefix}/{key}"),
            None => key.to_string(),
        }
    }
}

#[async_trait]
impl BlobStore for S3BlobStore {
    async fn upload(
        &self,
        local_path: &Path,
        key: &str,
        content_type: &str,
        metadata: &HashMap<String, String>,
    ) -> BlobResult<()> {
        let object_key = self.object_key(key);
        debug!("Uploading {} to s3://{}/{}", local_path.display(), self.bucket, object_key);

        let body = ByteStream::from_path(local_path)
            .await
            .map_err(|e| BlobError::UploadFailed(e.to_string()))?;

        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(&object_key)
            .body(body)
            .content_type(content_type)
            .set_metadata(Some(metadata.clone()))
            .send()
            .await
            .map_err(|e| BlobError::UploadFailed(e.to_string()))?;

        info!("Uploaded {} to s3://{}/{}", local_path.display(), self.bucket, object_key);
        Ok(())
    }

    async fn presign_get(&self, key: &str, expires_in: Duration) -> BlobResult<String> {
        let presign_config = PresigningConfig::expires_in(expires_in)
            .map_err(|e| BlobError::PresignFailed(e.to_string()))?;

        let presigned = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(self.object_key(key))
            .presigned(presign_config)
            .await
            .map_err(|e| BlobError::PresignFailed(e.to_string()))?;

        Ok(presigned.uri().to_string())
    }

    async fn health_check(&self) -> BlobResult<()> {
        self.client
            .head_bucket()
            .bucket(&self.bucket)
            .send()
            .await
            .map_err(|e| BlobError::Unreachable(e.to_string()))?;
        Ok(())
    }
}

pub async fn ensure_blob_root(path: &Path) -> Result<()> {
    fs::create_dir_all(path)
        .await
        .with_context(|| format!("Failed to create blob root at {}", path.display()))
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct ObjectMeta {
    content_type: String,
    metadata: HashMap<String, String>,
}

/// Filesystem-backed store. Retrieval URLs point back at this service and
/// carry an HMAC over `key:expires`.
#[derive(Debug, Clone)]
pub struct LocalBlobStore {
    root: PathBuf,
    public_base_url: String,
    signing_secret: String,
}

impl LocalBlobStore {
    pub fn new(root: PathBuf, public_base_url: &str, signing_secret: String) -> Self {
        Self {
            root,
            public_base_url: public_base_url.trim_end_matches('/').to_string(),
            signing_secret,
        }
    }

    fn object_path(&self, key: &str) -> BlobResult<PathBuf> {
        let relative = Path::new(key);
        let safe = !key.is_empty()
            && relative
                .components()
                .all(|c| matches!(c, Component::Normal(_)));
        if !safe {
            return Err(BlobError::InvalidKey(key.to_string()));
        }
        Ok(self.root.join(relative))
    }

    fn meta_path(path: &Path) -> PathBuf {
        let mut raw = path.as_os_str().to_owned();
        raw.push(".meta.json");
        PathBuf::from(raw)
    }

    fn signature(&self, key: &str, expires: i64) -> BlobResult<String> {
        let mut mac = HmacSha256::new_from_slice(self.signing_secret.as_bytes())
            .map_err(|e| BlobError::PresignFailed(format!("Invalid HMAC key: {e}")))?;
        mac.update(format!("{key}:{expires}").as_bytes());
        Ok(URL_SAFE_NO_PAD.encode(mac.finalize().into_bytes()))
    }

    pub fn signed_url(&self, key: &str, expires: i64) -> BlobResult<String> {
        let signature = self.signature(key, expires)?;
        let encoded_key = key
            .split('/')
            .map(|segment| urlencoding::encode(segment).into_owned())
            .collect::<Vec<_>>()
            .join("/");
        Ok(format!(
            "{}/v1/artifacts/{encoded_key}?expires={expires}&signature={signature}",
            self.public_base_url
        ))
    }

    /// Constant-time check of a retrieval signature, rejecting expired links.
    pub fn verify(&self, key: &str, expires: i64, signature: &str, now: i64) -> bool {
        if expires < now {
            return false;
        }
        let Ok(provided) = URL_SAFE_NO_PAD.decode(signature) else {
            return false;
        };
        let Ok(mut mac) = HmacSha256::new_from_slice(self.signing_secret.as_bytes()) else {
            return false;
        };
        mac.update(format!("{key}:{expires}").as_bytes());
        mac.verify_slice(&provided).is_ok()
    }

    /// Returns the object path and its stored content type.
    pub async fn open(&self, key: &str) -> BlobResult<(PathBuf, String)> {
        let path = self.object_path(key)?;
        if !fs::try_exists(&path).await? {
            return Err(BlobError::NotFound(key.to_string()));
        }
        let content_type = match fs::read(Self::meta_path(&path)).await {
            Ok(raw) => serde_json::from_slice::<ObjectMeta>(&raw)?.content_type,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                GENERIC_CONTENT_TYPE.to_string()
            }
            Err(err) => return Err(err.into()),
        };
        Ok((path, content_type))
    }
}

#[async_trait]
impl BlobStore for LocalBlobStore {
    async fn upload(
        &self,
        local_path: &Path,
        key: &str,
        content_type: &str,
        metadata: &HashMap<String, String>,
    ) -> BlobResult<()> {
        let target = self.object_path(key)?;
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent).await?;
        }
        fs::copy(local_path, &target)
            .await
            .map_err(|e| BlobError::UploadFailed(format!("{}: {e}", target.display())))?;

        let meta = ObjectMeta {
            content_type: content_type.to_string(),
            metadata: metadata.clone(),
        };
        fs::write(Self::meta_path(&target), serde_json::to_vec(&meta)?).await?;

        info!("Stored {} as {}", local_path.display(), target.display());
        Ok(())
    }

    async fn presign_get(&self, key: &str, expires_in: Duration) -> BlobResult<String> {
        self.object_path(key)?;
        let expires = Utc::now().timestamp() + expires_in.as_secs() as i64;
        self.signed_url(key, expires)
    }

    async fn health_check(&self) -> BlobResult<()> {
        let meta = fs::metadata(&self.root)
            .await
            .map_err(|e| BlobError::Unreachable(format!("{}: {e}", self.root.display())))?;
        if !meta.is_dir() || meta.permissions().readonly() {
            return Err(BlobError::Unreachable(format!(
                "{} is not a writable directory",
                self.root.display()
            )));
        }
        Ok(())
    }
}
