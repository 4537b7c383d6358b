mod api;
mod artifact_store;
mod auth;
mod cli;
mod config;
mod engine;
mod errors;
mod fetcher;
mod models;
mod query;
mod queue;
mod rate_limit;
mod store;
#[cfg(test)]
mod testing;

use std::{any::Any, sync::Arc, time::Duration};

use anyhow::Result;
use artifact_store::{BlobStore, LocalBlobStore, S3BlobStore, S3Settings};
use auth::JwtVerifier;
use axum::{
    response::{IntoResponse, Response},
    routing::{get, post},
    Router,
};
use config::{BlobBackend, Config, JobStoreBackend};
use engine::{EngineSettings, JobEngine};
use errors::AppError;
use fetcher::YtDlpFetcher;
use query::JobQuery;
use queue::WorkerPool;
use rate_limit::SubmissionLimiter;
use store::{JobStore, MemoryJobStore, SqliteJobStore};
use tower_http::{
    catch_panic::CatchPanicLayer,
    cors::{Any as AnyOrigin, CorsLayer},
    trace::TraceLayer,
};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

const REAPER_INTERVAL: Duration = Duration::from_secs(60);

#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<JobEngine>,
    pub query: JobQuery,
    pub verifier: Arc<JwtVerifier>,
    pub limiter: Arc<SubmissionLimiter>,
    pub blobs: Arc<dyn BlobStore>,
    pub store: Arc<dyn JobStore>,
    /// Set only for the local backend, whose links resolve against this service.
    pub local_blobs: Option<Arc<LocalBlobStore>>,
}

fn handle_panic(panic: Box<dyn Any + Send + 'static>) -> Response {
    let detail = panic
        .downcast_ref::<String>()
        .cloned()
        .or_else(|| panic.downcast_ref::<&str>().map(|s| s.to_string()))
        .unwrap_or_else(|| "unknown panic".to_string());
    error!("Request handler panicked: {detail}");
    AppError::internal("Request handler panicked").into_response()
}

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(api::health))
        .route(
            "/v1/downloads",
            post(api::create_download).get(api::list_downloads),
        )
        .route("/v1/downloads/{job_id}", get(api::get_download))
        .route("/v1/artifacts/{*key}", get(api::download_artifact))
        .fallback(api::not_found)
        .layer(CatchPanicLayer::custom(handle_panic))
        .layer(
            CorsLayer::new()
                .allow_origin(AnyOrigin)
                .allow_methods(AnyOrigin)
                .allow_headers(AnyOrigin),
        )
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "video_fetch_api=info,tower_http=info".into());
    if json {
        tracing_subscriber::fmt().json().with_env_filter(filter).init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}

async fn open_job_store(backend: &JobStoreBackend) -> Result<Arc<dyn JobStore>> {
    Ok(match backend {
        JobStoreBackend::Memory => {
            warn!("Using in-memory job store; records are lost on restart");
            Arc::new(MemoryJobStore::new())
        }
        JobStoreBackend::Sqlite(path) => {
            if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
                tokio::fs::create_dir_all(parent).await?;
            }
            info!("Opening job store at {}", path.display());
            Arc::new(SqliteJobStore::open(path)?)
        }
    })
}

async fn open_blob_store(
    backend: &BlobBackend,
) -> Result<(Arc<dyn BlobStore>, Option<Arc<LocalBlobStore>>)> {
    Ok(match backend {
        BlobBackend::S3 {
            bucket,
            endpoint_url,
            key_prefix,
        } => {
            info!("Using S3 bucket {bucket}");
            let s3 = S3BlobStore::new(S3Settings {
                bucket: bucket.clone(),
                endpoint_url: endpoint_url.clone(),
                key_prefix: key_prefix.clone(),
            })
            .await;
            (Arc::new(s3), None)
        }
        BlobBackend::Local {
            root,
            public_base_url,
            signing_secret,
        } => {
            artifact_store::ensure_blob_root(root).await?;
            info!("Using local blob root {}", root.display());
            let local = Arc::new(LocalBlobStore::new(
                root.clone(),
                public_base_url,
                signing_secret.clone(),
            ));
            (local.clone(), Some(local))
        }
    })
}

#[tokio::main]
async fn main() -> Result<()> {
    let args: Vec<String> = std::env::args().collect();
    if cli::maybe_run_from_cli(&args)? {
        return Ok(());
    }

    let config = Config::from_env()?;
    init_tracing(config.json_logs);
    if config.jwt_secret_is_fallback {
        warn!("JWT_SECRET_KEY is not set; tokens are signed with a per-process secret");
    }

    let store = open_job_store(&config.job_store).await?;
    let orphaned = store.fail_unfinished(chrono::Utc::now()).await?;
    if orphaned > 0 {
        warn!(orphaned, "Marked jobs left open by a previous process as failed");
    }
    let (blobs, local_blobs) = open_blob_store(&config.blob_backend).await?;
    tokio::fs::create_dir_all(&config.fetch_temp_root).await?;

    let (pool, queue_rx) = WorkerPool::new();
    let engine = Arc::new(JobEngine::new(
        store.clone(),
        Arc::new(YtDlpFetcher::new(config.ytdlp_bin.clone())),
        blobs.clone(),
        pool,
        EngineSettings {
            retention: config.retention,
            download_url_ttl: config.download_url_ttl,
            temp_root: config.fetch_temp_root.clone(),
            metadata_timeout: config.metadata_timeout,
        },
    ));

    queue::spawn_fetch_workers(engine.clone(), queue_rx, config.fetch_workers);
    queue::spawn_reaper(store.clone(), REAPER_INTERVAL);

    let state = AppState {
        engine,
        query: JobQuery::new(store.clone()),
        verifier: Arc::new(JwtVerifier::new(&config.jwt_secret, config.token_expiry_hours)),
        limiter: Arc::new(SubmissionLimiter::new(
            config.submit_rate_limit_per_minute,
            config.submit_rate_limit_burst,
        )),
        blobs,
        store,
        local_blobs,
    };
    let app = build_router(state);

    let listener = tokio::net::TcpListener::bind(config.bind_addr).await?;
    info!(
        workers = config.fetch_workers,
        "video-fetch-api listening on {}", config.bind_addr
    );
    axum::serve(listener, app).await?;
    Ok(())
}
