use std::sync::Arc;

use tracing::error;

use crate::{
    errors::{AppError, AppResult},
    models::{JobListResponse, JobRecord},
    store::{JobStore, StoreError},
};

const DEFAULT_LIMIT: usize = 10;
const MAX_LIMIT: usize = 100;

/// Read-only view over job records, scoped to the requesting principal.
#[derive(Clone)]
pub struct JobQuery {
    store: Arc<dyn JobStore>,
}

fn store_failure(message: &str, err: StoreError) -> AppError {
    error!("{message}: {err}");
    AppError::internal(message).with_detail("error", err.to_string())
}

impl JobQuery {
    pub fn new(store: Arc<dyn JobStore>) -> Self {
        Self { store }
    }

    /// Existence is checked before ownership so a foreign id and a missing id
    /// are distinguishable only to the owner.
    pub async fn get_status(&self, job_id: &str, requester_id: &str) -> AppResult<JobRecord> {
        let record = self
            .store
            .get(job_id)
            .await
            .map_err(|e| store_failure("Failed to retrieve download status", e))?;

        let Some(record) = record else {
            return Err(AppError::not_found("Download not found").with_detail("download_id", job_id));
        };
        if record.owner_id != requester_id {
            return Err(AppError::forbidden("Access denied"));
        }
        Ok(record)
    }

    pub async fn list_for_owner(
        &self,
        requester_id: &str,
        limit: Option<usize>,
        offset: Option<usize>,
    ) -> AppResult<JobListResponse> {
        let limit = limit.unwrap_or(DEFAULT_LIMIT).clamp(1, MAX_LIMIT);
        let offset = offset.unwrap_or(0);

        let page = self
            .store
            .list_page(requester_id, limit, offset)
            .await
            .map_err(|e| store_failure("Failed to retrieve downloads", e))?;

        Ok(JobListResponse {
            count: page.records.len(),
            downloads: page.records,
            has_more: page.has_more,
        })
    }
}
