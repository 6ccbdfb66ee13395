//! Bounded-concurrency worker pool
//!
//! Each slot pulls one payload at a time, runs the pipeline under a stage
//! timer, and resolves every outcome to ack or nack. Slots share no mutable
//! state beyond the broker's bookkeeping. Programming errors (panics) are
//! contained and routed through nack so a misbehaving job cannot starve the
//! pool.

use crate::broker::{Broker, Delivery, NackOutcome};
use crate::config::WorkerConfig;
use crate::error::PipelineError;
use crate::models::JobStatus;
use crate::pipeline::Pipeline;
use crate::stage_timer::StageTimer;
use crate::store::JobStore;
use futures::FutureExt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// Pool of independent worker slots sharing one broker
pub struct WorkerPool {
    broker: Arc<Broker>,
    pipeline: Arc<Pipeline>,
    jobs: Arc<dyn JobStore>,
    concurrency: usize,
    cancel: CancellationToken,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl WorkerPool {
    pub fn new(
        config: &WorkerConfig,
        broker: Arc<Broker>,
        pipeline: Arc<Pipeline>,
        jobs: Arc<dyn JobStore>,
    ) -> Self {
        Self {
            broker,
            pipeline,
            jobs,
            concurrency: config.concurrency.max(1),
            cancel: CancellationToken::new(),
            handles: Mutex::new(Vec::new()),
        }
    }

    /// Spawn all worker slots
    pub async fn start(&self) {
        let mut handles = self.handles.lock().await;
        for slot in 0..self.concurrency {
            let broker = self.broker.clone();
            let pipeline = self.pipeline.clone();
            let jobs = self.jobs.clone();
            let cancel = self.cancel.clone();
            handles.push(tokio::spawn(async move {
                run_slot(slot, broker, pipeline, jobs, cancel).await;
            }));
        }
        info!(concurrency = self.concurrency, "worker pool started");
    }

    /// Stop delivering new payloads and wait for in-flight work to finish.
    /// There is no mid-pipeline cancellation; a running attempt completes or
    /// fails on its own.
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        let mut handles = self.handles.lock().await;
        for handle in handles.drain(..) {
            if let Err(e) = handle.await {
                error!(%e, "worker slot terminated abnormally");
            }
        }
        info!("worker pool stopped");
    }
}

async fn run_slot(
    slot: usize,
    broker: Arc<Broker>,
    pipeline: Arc<Pipeline>,
    jobs: Arc<dyn JobStore>,
    cancel: CancellationToken,
) {
    info!(slot, "worker slot online");
    loop {
        let delivery = tokio::select! {
            _ = cancel.cancelled() => break,
            delivery = broker.deliver() => delivery,
        };
        process_delivery(slot, &broker, &pipeline, jobs.as_ref(), delivery).await;
    }
    info!(slot, "worker slot offline");
}

async fn process_delivery(
    slot: usize,
    broker: &Broker,
    pipeline: &Pipeline,
    jobs: &dyn JobStore,
    delivery: Delivery,
) {
    let Delivery {
        token,
        payload,
        attempt,
    } = delivery;
    let job_id = payload.job_id;

    info!(slot, %job_id, attempt, "processing job");

    if let Err(e) = jobs
        .update_status(job_id, JobStatus::Processing, None, None)
        .await
    {
        warn!(%job_id, %e, "failed to mark job processing");
    }
    if let Err(e) = jobs.record_attempt(job_id, attempt).await {
        warn!(%job_id, %e, "failed to record attempt");
    }

    let mut timer = StageTimer::new(job_id, payload.correlation_id);
    let outcome = AssertUnwindSafe(pipeline.run(&payload, &mut timer))
        .catch_unwind()
        .await;

    // Durations are persisted for failed attempts too; partial-failure
    // diagnostics rely on them
    if let Err(e) = timer.flush(jobs).await {
        warn!(%job_id, %e, "failed to flush stage durations");
    }

    match outcome {
        Ok(Ok(output)) => {
            if let Err(e) = jobs
                .update_status(job_id, JobStatus::Completed, None, None)
                .await
            {
                error!(%job_id, %e, "failed to mark job completed");
            }
            if let Err(e) = broker.ack(token).await {
                error!(%job_id, %e, "failed to ack delivery");
            }
            info!(slot, %job_id, attempt, object_key = %output.object_key, "job completed");
        }
        Ok(Err(stage_error)) => {
            nack_and_settle(broker, jobs, token, job_id, &stage_error).await;
        }
        Err(panic) => {
            let message = panic
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| panic.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "unknown panic".to_string());
            error!(slot, %job_id, attempt, message, "pipeline panicked");
            let internal = PipelineError::internal(format!("pipeline panicked: {}", message));
            nack_and_settle(broker, jobs, token, job_id, &internal).await;
        }
    }
}

async fn nack_and_settle(
    broker: &Broker,
    jobs: &dyn JobStore,
    token: crate::broker::QueueToken,
    job_id: crate::models::JobId,
    cause: &PipelineError,
) {
    match broker.nack(token, cause).await {
        Ok(NackOutcome::Requeued { delay }) => {
            // The retry re-delivery is the only backwards status edge
            if let Err(e) = jobs
                .update_status(job_id, JobStatus::Queued, None, None)
                .await
            {
                warn!(%job_id, %e, "failed to requeue job status");
            }
            info!(%job_id, delay_ms = delay.as_millis() as u64, "job requeued");
        }
        Ok(NackOutcome::DeadLettered) => {
            info!(%job_id, "job dead-lettered");
        }
        Err(e) => error!(%job_id, %e, "failed to nack delivery"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::BackoffPolicy;
    use crate::config::{AppConfig, QueueConfig};
    use crate::dead_letter::DeadLetterHandler;
    use crate::idempotency::Channel;
    use crate::models::{
        AccountTier, Category, JobPriority, JobSelectors, NewJob,
    };
    use crate::provider::{GenerativeProvider, MockProvider, PromptProfile, ProviderError};
    use crate::storage::MemoryObjectStore;
    use crate::store::{
        DeadLetterStore, MemoryDeadLetterStore, MemoryJobStore, MemoryNotificationSink,
    };
    use async_trait::async_trait;
    use image::{DynamicImage, Rgba, RgbaImage};
    use std::path::PathBuf;
    use std::time::Duration;

    struct Harness {
        jobs: Arc<MemoryJobStore>,
        dead_letters: Arc<MemoryDeadLetterStore>,
        broker: Arc<Broker>,
        pool: WorkerPool,
    }

    fn harness(provider: Arc<dyn GenerativeProvider>) -> Harness {
        let jobs = Arc::new(MemoryJobStore::new());
        let dead_letters = Arc::new(MemoryDeadLetterStore::new());
        let handler = Arc::new(DeadLetterHandler::new(
            dead_letters.clone(),
            jobs.clone(),
            Arc::new(MemoryNotificationSink::new()),
        ));
        let queue_config = QueueConfig {
            backoff_table_ms: vec![5, 10, 20],
            jitter_ms: 0,
            ..QueueConfig::default()
        };
        let broker = Arc::new(Broker::new(
            &queue_config,
            BackoffPolicy::from_config(&queue_config),
            handler,
        ));
        let pipeline = Arc::new(Pipeline::new(
            &AppConfig::default(),
            provider,
            Arc::new(MemoryObjectStore::new()),
        ));
        let pool = WorkerPool::new(
            &crate::config::WorkerConfig { concurrency: 2 },
            broker.clone(),
            pipeline,
            jobs.clone(),
        );
        Harness {
            jobs,
            dead_letters,
            broker,
            pool,
        }
    }

    async fn admit_job(harness: &Harness, dir: &std::path::Path) -> crate::models::Job {
        let path = dir.join("source.png");
        let img = RgbaImage::from_pixel(64, 64, Rgba([220, 220, 220, 255]));
        DynamicImage::ImageRgba8(img).save(&path).unwrap();

        let job = harness
            .jobs
            .create(
                "telegram_bot:msg1",
                NewJob {
                    account_id: "acct-1".to_string(),
                    channel: Channel::TelegramBot,
                    selectors: JobSelectors::new(Category::Clothing, "studio"),
                    tier: AccountTier::Standard,
                    source_path: path,
                    priority: JobPriority::Normal,
                },
            )
            .await
            .unwrap()
            .job()
            .clone();
        harness
            .jobs
            .update_status(job.id, JobStatus::Queued, None, None)
            .await
            .unwrap();
        harness
            .broker
            .enqueue(job.payload(), job.priority, None)
            .await;
        job
    }

    async fn wait_terminal(harness: &Harness, id: crate::models::JobId) -> JobStatus {
        for _ in 0..400 {
            let job = harness.jobs.get(id).await.unwrap().unwrap();
            if job.status.is_terminal() && harness.broker.is_drained().await {
                return job.status;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("job did not reach a terminal status");
    }

    #[tokio::test]
    async fn test_pool_processes_job_to_completion() {
        let temp_dir = tempfile::tempdir().unwrap();
        let harness = harness(Arc::new(MockProvider::new()));
        let job = admit_job(&harness, temp_dir.path()).await;

        harness.pool.start().await;
        let status = wait_terminal(&harness, job.id).await;
        harness.pool.shutdown().await;

        assert_eq!(status, JobStatus::Completed);
        let stored = harness.jobs.get(job.id).await.unwrap().unwrap();
        assert_eq!(stored.attempts, 1);
        assert_eq!(stored.stage_durations.len(), 7);
    }

    struct PanickingProvider;

    #[async_trait]
    impl GenerativeProvider for PanickingProvider {
        fn name(&self) -> &'static str {
            "panicking"
        }

        async fn transform(
            &self,
            _cutout_png: &[u8],
            _profile: &PromptProfile,
            _model: &str,
            _timeout: Duration,
        ) -> std::result::Result<Vec<u8>, ProviderError> {
            panic!("provider contract violated");
        }
    }

    #[tokio::test]
    async fn test_panic_routes_through_nack_without_killing_slot() {
        let temp_dir = tempfile::tempdir().unwrap();
        let harness = harness(Arc::new(PanickingProvider));
        let job = admit_job(&harness, temp_dir.path()).await;

        harness.pool.start().await;
        let status = wait_terminal(&harness, job.id).await;
        harness.pool.shutdown().await;

        // Internal errors retry up to the budget, then dead-letter
        assert_eq!(status, JobStatus::Failed);
        let stored = harness.jobs.get(job.id).await.unwrap().unwrap();
        assert_eq!(stored.attempts, 3);
        assert_eq!(stored.last_error_code.as_deref(), Some("internal_error"));
        assert!(harness.dead_letters.get(job.id).await.unwrap().is_some());
    }
}
