use axum::{
    body::Body,
    extract::{
        rejection::{JsonRejection, QueryRejection},
        Path, Query, State,
    },
    http::{header, HeaderMap, Response, StatusCode},
    response::IntoResponse,
    Json,
};
use chrono::Utc;
use serde::Deserialize;
use serde_json::json;
use tokio::fs;
use tokio_util::io::ReaderStream;
use tracing::{error, info};

use crate::{
    artifact_store::BlobError,
    auth::authenticate,
    errors::{AppError, AppResult, ErrorKind},
    models::{DownloadRequest, JobListResponse, JobRecord, JobStartedResponse, ListQuery},
    AppState,
};

pub async fn health(State(state): State<AppState>) -> impl IntoResponse {
    let blob_check = state.blobs.health_check().await;
    let store_check = state.store.health_check().await;

    match (blob_check, store_check) {
        (Ok(()), Ok(())) => (
            StatusCode::OK,
            Json(json!({
                "status": "healthy",
                "timestamp": Utc::now().to_rfc3339(),
                "services": {
                    "blob_store": "connected",
                    "job_store": "connected"
                }
            })),
        ),
        (blob, store) => {
            let reason = blob
                .err()
                .map(|e| e.to_string())
                .or_else(|| store.err().map(|e| e.to_string()))
                .unwrap_or_default();
            error!("Health check failed: {reason}");
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(json!({
                    "status": "unhealthy",
                    "timestamp": Utc::now().to_rfc3339(),
                    "error": reason
                })),
            )
        }
    }
}

pub async fn create_download(
    State(state): State<AppState>,
    headers: HeaderMap,
    payload: Result<Json<DownloadRequest>, JsonRejection>,
) -> AppResult<Json<JobStartedResponse>> {
    let principal = authenticate(&headers, &state.verifier)?;
    let Json(request) = payload.map_err(|rejection| {
        AppError::invalid_request("Request body must be a JSON object")
            .with_detail("error", rejection.body_text())
    })?;

    state.limiter.check(&principal.subject_id).await?;

    info!(user_id = %principal.subject_id, url = %request.url, "Download request received");
    let started = state.engine.submit(request, &principal.subject_id).await?;
    Ok(Json(started))
}

pub async fn get_download(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(job_id): Path<String>,
) -> AppResult<Json<JobRecord>> {
    let principal = authenticate(&headers, &state.verifier)?;
    let record = state.query.get_status(&job_id, &principal.subject_id).await?;
    Ok(Json(record))
}

pub async fn list_downloads(
    State(state): State<AppState>,
    headers: HeaderMap,
    params: Result<Query<ListQuery>, QueryRejection>,
) -> AppResult<Json<JobListResponse>> {
    let principal = authenticate(&headers, &state.verifier)?;
    let Query(params) = params.map_err(|rejection| {
        AppError::invalid_request("Invalid pagination parameters")
            .with_detail("error", rejection.body_text())
    })?;

    let page = state
        .query
        .list_for_owner(&principal.subject_id, params.limit, params.offset)
        .await?;
    Ok(Json(page))
}

#[derive(Debug, Deserialize)]
pub struct ArtifactParams {
    expires: i64,
    signature: String,
}

/// Serves objects of the local blob backend to holders of a signed link.
pub async fn download_artifact(
    State(state): State<AppState>,
    Path(key): Path<String>,
    params: Result<Query<ArtifactParams>, QueryRejection>,
) -> AppResult<Response<Body>> {
    let Some(blobs) = state.local_blobs.as_ref() else {
        return Err(AppError::not_found("Artifact not found"));
    };
    let Ok(Query(params)) = params else {
        return Err(AppError::forbidden("Missing or malformed signature"));
    };
    if !blobs.verify(&key, params.expires, &params.signature, Utc::now().timestamp()) {
        return Err(AppError::forbidden("Invalid or expired download link"));
    }

    let (path, content_type) = blobs.open(&key).await.map_err(|err| match err {
        BlobError::NotFound(_) | BlobError::InvalidKey(_) => AppError::not_found("Artifact not found"),
        other => AppError::internal("Failed to open artifact").with_detail("error", other.to_string()),
    })?;

    let file = match fs::File::open(&path).await {
        Ok(file) => file,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            return Err(AppError::not_found("Artifact no longer exists"));
        }
        Err(err) => {
            return Err(AppError::internal("Failed to open artifact").with_detail("error", err.to_string()));
        }
    };
    let size = file
        .metadata()
        .await
        .map_err(|e| AppError::internal("Failed to stat artifact").with_detail("error", e.to_string()))?
        .len();

    let file_name = key.rsplit('/').next().unwrap_or("artifact");
    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, content_type)
        .header(header::CONTENT_LENGTH, size)
        .header(
            header::CONTENT_DISPOSITION,
            format!("attachment; filename=\"{file_name}\""),
        )
        .body(Body::from_stream(ReaderStream::new(file)))
        .map_err(|e| AppError::internal("Failed to build download response").with_detail("error", e.to_string()))
}

pub async fn not_found() -> AppError {
    AppError::new(ErrorKind::NotFound, "Route not found")
}
