//! Idempotent job admission
//!
//! Admission folds duplicate submissions into one job before any credits
//! move: the store create is idempotent on the derived key, only the
//! `Created` path debits, and only a successful debit enqueues. The broker
//! therefore never sees two payloads for one idempotency key.

use crate::broker::Broker;
use crate::config::CreditsConfig;
use crate::error::{PipelineError, Result};
use crate::idempotency::{derive_key, Channel};
use crate::models::{
    AccountTier, Job, JobPriority, JobSelectors, JobStatus, NewJob,
};
use crate::store::{CreditLedger, DebitOutcome, JobStore};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};

/// One submission from an ingress channel
#[derive(Debug, Clone)]
pub struct SubmitRequest {
    pub channel: Channel,
    pub message_id: Option<String>,
    pub client_request_id: Option<String>,
    pub account_id: String,
    pub tier: AccountTier,
    pub selectors: JobSelectors,
    pub source_path: PathBuf,
    pub priority: JobPriority,
}

/// Outcome of an admission attempt
#[derive(Debug, Clone)]
pub enum AdmissionOutcome {
    /// A new job was admitted, debited and enqueued
    Admitted(Job),
    /// The idempotency key already had a job; nothing was debited or enqueued
    Duplicate(Job),
}

impl AdmissionOutcome {
    pub fn job(&self) -> &Job {
        match self {
            AdmissionOutcome::Admitted(job) | AdmissionOutcome::Duplicate(job) => job,
        }
    }

    pub fn is_duplicate(&self) -> bool {
        matches!(self, AdmissionOutcome::Duplicate(_))
    }
}

/// Admits submissions: derive key, create-or-fold, debit, enqueue
pub struct AdmissionController {
    jobs: Arc<dyn JobStore>,
    ledger: Arc<dyn CreditLedger>,
    broker: Arc<Broker>,
    credits: CreditsConfig,
}

impl AdmissionController {
    pub fn new(
        jobs: Arc<dyn JobStore>,
        ledger: Arc<dyn CreditLedger>,
        broker: Arc<Broker>,
        credits: CreditsConfig,
    ) -> Self {
        Self {
            jobs,
            ledger,
            broker,
            credits,
        }
    }

    /// Admit one submission. Exactly one job exists and exactly one debit
    /// occurs per idempotency key, no matter how often callers resubmit.
    pub async fn submit(&self, request: SubmitRequest) -> Result<AdmissionOutcome> {
        let key = derive_key(
            request.channel,
            request.message_id.as_deref(),
            request.client_request_id.as_deref(),
        )?;

        let attrs = NewJob {
            account_id: request.account_id.clone(),
            channel: request.channel,
            selectors: request.selectors,
            tier: request.tier,
            source_path: request.source_path,
            priority: request.priority,
        };

        let outcome = self.jobs.create(&key, attrs).await?;
        let job = outcome.job().clone();

        if !outcome.is_created() {
            info!(job_id = %job.id, key, "duplicate submission folded into existing job");
            return Ok(AdmissionOutcome::Duplicate(job));
        }

        let cost = self.credits.cost_per_job;
        match self.ledger.debit(&request.account_id, cost, job.id).await? {
            DebitOutcome::Accepted { balance_after } => {
                info!(
                    job_id = %job.id,
                    account_id = %request.account_id,
                    cost,
                    balance_after,
                    "credits debited"
                );
            }
            DebitOutcome::InsufficientCredits { balance } => {
                warn!(
                    job_id = %job.id,
                    account_id = %request.account_id,
                    balance,
                    "admission rejected: insufficient credits"
                );
                let error = PipelineError::InsufficientCredits {
                    account_id: request.account_id.clone(),
                };
                self.jobs
                    .update_status(
                        job.id,
                        JobStatus::Failed,
                        Some(error.error_code()),
                        Some(&error.to_string()),
                    )
                    .await?;
                return Err(error);
            }
        }

        self.broker
            .enqueue(job.payload(), job.priority, None)
            .await;
        self.jobs
            .update_status(job.id, JobStatus::Queued, None, None)
            .await?;

        let mut admitted = job;
        admitted.status = JobStatus::Queued;
        info!(job_id = %admitted.id, key, priority = admitted.priority.as_str(), "job admitted");
        Ok(AdmissionOutcome::Admitted(admitted))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::BackoffPolicy;
    use crate::config::QueueConfig;
    use crate::dead_letter::DeadLetterHandler;
    use crate::models::Category;
    use crate::store::{
        MemoryCreditLedger, MemoryDeadLetterStore, MemoryJobStore, MemoryNotificationSink,
    };

    fn controller() -> (
        AdmissionController,
        Arc<MemoryJobStore>,
        Arc<MemoryCreditLedger>,
        Arc<Broker>,
    ) {
        let jobs = Arc::new(MemoryJobStore::new());
        let ledger = Arc::new(MemoryCreditLedger::new());
        let queue_config = QueueConfig::default();
        let handler = Arc::new(DeadLetterHandler::new(
            Arc::new(MemoryDeadLetterStore::new()),
            jobs.clone(),
            Arc::new(MemoryNotificationSink::new()),
        ));
        let broker = Arc::new(Broker::new(
            &queue_config,
            BackoffPolicy::from_config(&queue_config),
            handler,
        ));
        let controller = AdmissionController::new(
            jobs.clone(),
            ledger.clone(),
            broker.clone(),
            CreditsConfig::default(),
        );
        (controller, jobs, ledger, broker)
    }

    fn request(message_id: &str) -> SubmitRequest {
        SubmitRequest {
            channel: Channel::TelegramBot,
            message_id: Some(message_id.to_string()),
            client_request_id: None,
            account_id: "acct-1".to_string(),
            tier: AccountTier::Standard,
            selectors: JobSelectors::new(Category::Clothing, "studio"),
            source_path: PathBuf::from("input.jpg"),
            priority: JobPriority::Normal,
        }
    }

    #[tokio::test]
    async fn test_admission_creates_debits_and_enqueues() {
        let (controller, jobs, ledger, broker) = controller();
        ledger.grant("acct-1", 5).await;

        let outcome = controller.submit(request("msg1")).await.unwrap();
        assert!(!outcome.is_duplicate());

        let job = jobs.get(outcome.job().id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Queued);
        assert_eq!(ledger.balance("acct-1").await.unwrap(), 4);
        assert_eq!(broker.stats().await.ready, 1);
    }

    #[tokio::test]
    async fn test_duplicate_submission_folds_without_second_debit() {
        let (controller, _, ledger, broker) = controller();
        ledger.grant("acct-1", 5).await;

        let first = controller.submit(request("msg1")).await.unwrap();
        let second = controller.submit(request("msg1")).await.unwrap();

        assert!(second.is_duplicate());
        assert_eq!(second.job().id, first.job().id);
        assert_eq!(ledger.debit_count("acct-1").await, 1);
        assert_eq!(broker.stats().await.ready, 1);
    }

    #[tokio::test]
    async fn test_concurrent_duplicates_admit_exactly_once() {
        let (controller, _, ledger, broker) = controller();
        ledger.grant("acct-1", 50).await;
        let controller = Arc::new(controller);

        let mut handles = Vec::new();
        for _ in 0..16 {
            let controller = controller.clone();
            handles.push(tokio::spawn(async move {
                controller.submit(request("msg1")).await
            }));
        }

        let mut created = 0;
        for handle in handles {
            let outcome = handle.await.unwrap().unwrap();
            if !outcome.is_duplicate() {
                created += 1;
            }
        }

        assert_eq!(created, 1);
        assert_eq!(ledger.debit_count("acct-1").await, 1);
        assert_eq!(broker.stats().await.ready, 1);
    }

    #[tokio::test]
    async fn test_insufficient_credits_fails_job_without_enqueue() {
        let (controller, jobs, _, broker) = controller();

        let error = controller.submit(request("msg1")).await.unwrap_err();
        assert_eq!(error.error_code(), "insufficient_credits");

        let job = jobs.find_by_key("telegram_bot:msg1").await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(broker.stats().await.ready, 0);
    }

    #[tokio::test]
    async fn test_missing_dedup_token_rejected_before_any_side_effect() {
        let (controller, jobs, ledger, _) = controller();
        ledger.grant("acct-1", 5).await;

        let mut bad = request("msg1");
        bad.message_id = None;
        let error = controller.submit(bad).await.unwrap_err();
        assert_eq!(error.error_code(), "invalid_input");
        assert_eq!(ledger.balance("acct-1").await.unwrap(), 5);
        assert!(jobs.find_by_key("telegram_bot:msg1").await.unwrap().is_none());
    }
}
