//! # Background Jobs
//!
//! The scraping, analysis, and notification jobs run outside this layer;
//! what lives here is the narrow contract they are reached through, so the
//! cache can memoize job results without knowing the runner.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

pub type JobId = String;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Running,
    Done { result: Value },
    Failed { error: String },
}

#[async_trait]
pub trait JobQueue: Send + Sync {
    async fn enqueue(&self, job: Value) -> Result<JobId, JobError>;

    async fn status(&self, id: &str) -> Result<JobStatus, JobError>;
}

#[derive(Debug, thiserror::Error)]
pub enum JobError {
    #[error("Unknown job: {0}")]
    UnknownJob(JobId),

    #[error("Job runner unavailable: {0}")]
    Unavailable(String),
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::sync::Mutex;

    use async_trait::async_trait;
    use serde_json::{json, Value};

    use super::{JobError, JobId, JobQueue, JobStatus};

    // Minimal in-memory runner, just enough to exercise the contract.
    #[derive(Default)]
    struct MemoryQueue {
        jobs: Mutex<HashMap<JobId, JobStatus>>,
    }

    #[async_trait]
    impl JobQueue for MemoryQueue {
        async fn enqueue(&self, _job: Value) -> Result<JobId, JobError> {
            let mut jobs = self.jobs.lock().unwrap();
            let id = format!("job-{}", jobs.len());
            jobs.insert(id.clone(), JobStatus::Pending);
            Ok(id)
        }

        async fn status(&self, id: &str) -> Result<JobStatus, JobError> {
            self.jobs
                .lock()
                .unwrap()
                .get(id)
                .cloned()
                .ok_or_else(|| JobError::UnknownJob(id.to_string()))
        }
    }

    #[tokio::test]
    async fn test_enqueue_then_poll() {
        let queue = MemoryQueue::default();

        let id = queue.enqueue(json!({"kind": "scrape"})).await.unwrap();
        assert_eq!(queue.status(&id).await.unwrap(), JobStatus::Pending);

        queue
            .jobs
            .lock()
            .unwrap()
            .insert(id.clone(), JobStatus::Done { result: json!({"ok": true}) });
        assert_eq!(
            queue.status(&id).await.unwrap(),
            JobStatus::Done { result: json!({"ok": true}) }
        );
    }

    #[tokio::test]
    async fn test_unknown_job_errors() {
        let queue = MemoryQueue::default();
        assert!(queue.status("missing").await.is_err());
    }
}
