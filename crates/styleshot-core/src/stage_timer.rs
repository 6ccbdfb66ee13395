//! Per-stage wall-clock timing for pipeline attempts
//!
//! Every stage runs under `with_stage` so partial-failure diagnostics always
//! show how far a job got and how long each completed stage took. A fresh
//! timer is constructed per attempt; the persisted map is replaced, never
//! merged, because a retry re-runs the full pipeline.

use crate::error::Result;
use crate::models::{JobId, StageDurations};
use crate::store::JobStore;
use std::future::Future;
use std::time::Instant;
use tracing::{debug, warn};
use uuid::Uuid;

/// Accumulates stage durations for one processing attempt
#[derive(Debug)]
pub struct StageTimer {
    job_id: JobId,
    correlation_id: Uuid,
    durations: StageDurations,
}

impl StageTimer {
    pub fn new(job_id: JobId, correlation_id: Uuid) -> Self {
        Self {
            job_id,
            correlation_id,
            durations: StageDurations::new(),
        }
    }

    /// Run one stage, recording its wall-clock duration whether it succeeds
    /// or fails, then re-raise the error.
    pub async fn with_stage<T, F>(&mut self, name: &str, fut: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        let start = Instant::now();
        let result = fut.await;
        let elapsed_ms = start.elapsed().as_millis() as u64;
        self.durations.insert(name.to_string(), elapsed_ms);

        match &result {
            Ok(_) => debug!(
                job_id = %self.job_id,
                correlation_id = %self.correlation_id,
                stage = name,
                elapsed_ms,
                "stage completed"
            ),
            Err(error) => warn!(
                job_id = %self.job_id,
                correlation_id = %self.correlation_id,
                stage = name,
                elapsed_ms,
                %error,
                "stage failed"
            ),
        }

        result
    }

    pub fn job_id(&self) -> JobId {
        self.job_id
    }

    pub fn correlation_id(&self) -> Uuid {
        self.correlation_id
    }

    pub fn durations(&self) -> &StageDurations {
        &self.durations
    }

    /// Sum of all recorded stage durations in milliseconds
    pub fn total_ms(&self) -> u64 {
        self.durations.values().sum()
    }

    /// Persist the recorded durations to the job record store
    pub async fn flush(&self, store: &dyn JobStore) -> Result<()> {
        store
            .append_stage_durations(self.job_id, &self.durations, self.total_ms())
            .await
    }
}
