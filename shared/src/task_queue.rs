/// Concurrency limiter and tracker for in-flight media requests.
///
/// Uses a tokio Semaphore to cap how many fetch -> deliver runs execute at
/// once, and keeps per-request metadata for `/status`.
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedSemaphorePermit, Semaphore};
use tracing::{info, warn};
use chrono::Utc;

/// Metadata for one request.
#[derive(Debug, Clone)]
pub struct TrackedRequest {
    pub request_id: String,
    pub chat_id: i64,
    pub url: String,
    pub stage: RequestStage,
    pub enqueued_at: chrono::DateTime<Utc>,
    pub started_at: Option<chrono::DateTime<Utc>>,
    pub finished_at: Option<chrono::DateTime<Utc>>,
}

impl TrackedRequest {
    /// Seconds since the request got a slot, up to `now` or to when it finished.
    pub fn running_secs(&self, now: chrono::DateTime<Utc>) -> Option<i64> {
        let started = self.started_at?;
        let end = self.finished_at.unwrap_or(now);
        Some((end - started).num_seconds().max(0))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestStage {
    Queued,
    Fetching,
    Delivering,
    Done,
    Failed,
}

impl RequestStage {
    pub fn is_finished(&self) -> bool {
        matches!(self, RequestStage::Done | RequestStage::Failed)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            RequestStage::Queued => "queued",
            RequestStage::Fetching => "downloading",
            RequestStage::Delivering => "sending",
            RequestStage::Done => "done",
            RequestStage::Failed => "failed",
        }
    }
}

/// Held while a request runs. Dropping it frees the slot.
pub struct RequestSlot {
    _permit: OwnedSemaphorePermit,
}

pub struct TaskQueue {
    semaphore: Arc<Semaphore>,
    requests: Arc<Mutex<HashMap<String, TrackedRequest>>>,
    max_concurrent: usize,
}

impl TaskQueue {
    pub fn new(max_concurrent: usize) -> Self {
        Self {
            semaphore: Arc::new(Semaphore::new(max_concurrent)),
            requests: Arc::new(Mutex::new(HashMap::new())),
            max_concurrent,
        }
    }

    /// Register a new request and return its generated ID.
    pub async fn enqueue(&self, chat_id: i64, url: &str) -> String {
        let request_id = uuid::Uuid::new_v4().to_string();
        self.requests.lock().await.insert(
            request_id.clone(),
            TrackedRequest {
                request_id: request_id.clone(),
                chat_id,
                url: url.to_string(),
                stage: RequestStage::Queued,
                enqueued_at: Utc::now(),
                started_at: None,
                finished_at: None,
            },
        );
        info!("Request {} enqueued for chat {}", request_id, chat_id);
        request_id
    }

    /// Wait for a free slot. Returns None if the limiter was closed.
    pub async fn acquire(&self, request_id: &str) -> Option<RequestSlot> {
        let permit = match self.semaphore.clone().acquire_owned().await {
            Ok(p) => p,
            Err(_) => {
                warn!("Semaphore closed for request {}", request_id);
                return None;
            }
        };
        if let Some(req) = self.requests.lock().await.get_mut(request_id) {
            req.started_at = Some(Utc::now());
        }
        info!("Request {} acquired slot", request_id);
        Some(RequestSlot { _permit: permit })
    }

    pub async fn set_stage(&self, request_id: &str, stage: RequestStage) {
        if let Some(req) = self.requests.lock().await.get_mut(request_id) {
            req.stage = stage;
            if stage.is_finished() {
                req.finished_at = Some(Utc::now());
            }
        }
    }

    /// Requests of one chat that have not finished yet.
    pub async fn active_for_chat(&self, chat_id: i64) -> Vec<TrackedRequest> {
        let mut active: Vec<TrackedRequest> = self
            .requests
            .lock()
            .await
            .values()
            .filter(|r| r.chat_id == chat_id && !r.stage.is_finished())
            .cloned()
            .collect();
        active.sort_by_key(|r| r.enqueued_at);
        active
    }

    pub async fn stats(&self) -> QueueStats {
        let requests = self.requests.lock().await;
        let count = |stage| requests.values().filter(|r| r.stage == stage).count();
        QueueStats {
            max_concurrent: self.max_concurrent,
            running: self.max_concurrent - self.semaphore.available_permits(),
            queued: count(RequestStage::Queued),
            done: count(RequestStage::Done),
            failed: count(RequestStage::Failed),
        }
    }

    /// Forget finished requests older than `max_age_secs`.
    pub async fn cleanup_finished(&self, max_age_secs: i64) -> usize {
        let cutoff = Utc::now() - chrono::Duration::seconds(max_age_secs);
        let mut requests = self.requests.lock().await;
        let before = requests.len();
        requests.retain(|_, r| match r.finished_at {
            Some(finished) => finished > cutoff,
            None => true,
        });
        before - requests.len()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueStats {
    pub max_concurrent: usize,
    pub running: usize,
    pub queued: usize,
    pub done: usize,
    pub failed: usize,
}
