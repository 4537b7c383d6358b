use std::{collections::HashMap, time::Instant};

use tokio::sync::Mutex;

use crate::errors::{AppError, AppResult, ErrorKind};

#[derive(Debug)]
struct Bucket {
    tokens: f64,
    last_refill: Instant,
}

/// Token bucket per principal, applied to job submissions.
#[derive(Debug)]
pub struct SubmissionLimiter {
    per_minute: u32,
    burst: u32,
    buckets: Mutex<HashMap<String, Bucket>>,
}

impl SubmissionLimiter {
    pub fn new(per_minute: u32, burst: u32) -> Self {
        Self {
            per_minute: per_minute.max(1),
            burst: burst.max(1),
            buckets: Mutex::new(HashMap::new()),
        }
    }

    pub async fn check(&self, subject_id: &str) -> AppResult<()> {
        self.check_at(subject_id, Instant::now()).await
    }

    async fn check_at(&self, subject_id: &str, now: Instant) -> AppResult<()> {
        let refill_per_sec = f64::from(self.per_minute) / 60.0;
        let capacity = f64::from(self.burst);

        let mut guard = self.buckets.lock().await;
        if !guard.contains_key(subject_id) {
            // A bucket idle for a full refill window is full again; dropping it loses nothing.
            let refill_window = capacity / refill_per_sec;
            guard.retain(|_, b| {
                now.saturating_duration_since(b.last_refill).as_secs_f64() < refill_window
            });
        }
        let bucket = guard.entry(subject_id.to_string()).or_insert(Bucket {
            tokens: capacity,
            last_refill: now,
        });

        let elapsed = now.saturating_duration_since(bucket.last_refill).as_secs_f64();
        if elapsed > 0.0 {
            bucket.tokens = (bucket.tokens + elapsed * refill_per_sec).min(capacity);
            bucket.last_refill = now;
        }

        if bucket.tokens >= 1.0 {
            bucket.tokens -= 1.0;
            return Ok(());
        }

        let retry_after = ((1.0 - bucket.tokens) / refill_per_sec).ceil() as u64;
        Err(
            AppError::new(ErrorKind::RateLimitExceeded, "Too many download requests")
                .with_detail("limit_per_minute", self.per_minute)
                .with_detail("retry_after_seconds", retry_after),
        )
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[tokio::test]
    async fn burst_then_reject_then_refill() {
        let limiter = SubmissionLimiter::new(60, 2);
        let start = Instant::now();
        limiter.check_at("alice", start).await.expect("first");
        limiter.check_at("alice", start).await.expect("second");

        let err = limiter.check_at("alice", start).await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::RateLimitExceeded);
        assert_eq!(err.details["retry_after_seconds"], 1);

        limiter
            .check_at("alice", start + Duration::from_secs(1))
            .await
            .expect("refilled");
    }

    #[tokio::test]
    async fn buckets_are_per_subject() {
        let limiter = SubmissionLimiter::new(60, 1);
        let now = Instant::now();
        limiter.check_at("alice", now).await.expect("alice");
        limiter.check_at("bob", now).await.expect("bob");
        assert!(limiter.check_at("alice", now).await.is_err());
    }

    #[tokio::test]
    async fn idle_full_buckets_are_evicted_on_insert() {
        let limiter = SubmissionLimiter::new(60, 2);
        let start = Instant::now();
        limiter.check_at("alice", start).await.expect("alice");
        limiter.check_at("bob", start + Duration::from_secs(1)).await.expect("bob");
        assert_eq!(limiter.buckets.lock().await.len(), 2);

        limiter
            .check_at("carol", start + Duration::from_millis(2500))
            .await
            .expect("carol");
        let tracked = limiter.buckets.lock().await;
        assert!(!tracked.contains_key("alice"));
        assert!(tracked.contains_key("bob"));
        assert!(tracked.contains_key("carol"));
    }
}
