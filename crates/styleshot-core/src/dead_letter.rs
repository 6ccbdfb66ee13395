//! Terminal failure handling
//!
//! Invoked only after the retry classifier rules a failure permanent or the
//! attempt budget is exhausted. Each step is independently fallible and
//! logged; no step blocks the next. The job-status update is the external
//! trigger for the compensating credit refund, so it runs even when the
//! dead-letter record could not be written.

use crate::error::PipelineError;
use crate::models::{DeadLetterRecord, JobPayload, JobStatus};
use crate::store::{DeadLetterStore, JobStore, NotificationSink};
use chrono::Utc;
use std::sync::Arc;
use tracing::{error, info};

/// Message sent to the account on permanent failure
const FAILURE_NOTICE: &str =
    "We could not finish processing your image. Your credit has been returned.";

/// Records permanently failed jobs and requests the user notification
pub struct DeadLetterHandler {
    dead_letters: Arc<dyn DeadLetterStore>,
    jobs: Arc<dyn JobStore>,
    notifications: Arc<dyn NotificationSink>,
}

impl DeadLetterHandler {
    pub fn new(
        dead_letters: Arc<dyn DeadLetterStore>,
        jobs: Arc<dyn JobStore>,
        notifications: Arc<dyn NotificationSink>,
    ) -> Self {
        Self {
            dead_letters,
            jobs,
            notifications,
        }
    }

    /// Handle a permanent failure for the given payload
    pub async fn handle(&self, payload: &JobPayload, attempts: u32, cause: &PipelineError) {
        let job_id = payload.job_id;
        info!(
            %job_id,
            attempts,
            error_code = cause.error_code(),
            "dead-lettering job"
        );

        let record = DeadLetterRecord {
            job_id,
            error_code: cause.error_code().to_string(),
            error_message: cause.to_string(),
            attempts,
            payload: payload.clone(),
            context: format!("attempt {} of pipeline processing", attempts),
            created_at: Utc::now(),
        };

        if let Err(e) = self.dead_letters.upsert(record).await {
            error!(%job_id, %e, "failed to upsert dead-letter record");
        }

        if let Err(e) = self
            .jobs
            .update_status(
                job_id,
                JobStatus::Failed,
                Some(cause.error_code()),
                Some(&cause.to_string()),
            )
            .await
        {
            error!(%job_id, %e, "failed to mark job failed");
        }

        if let Err(e) = self
            .notifications
            .notify(&payload.account_id, job_id, FAILURE_NOTICE)
            .await
        {
            error!(%job_id, %e, "failed to emit failure notification");
        }
    }
}
