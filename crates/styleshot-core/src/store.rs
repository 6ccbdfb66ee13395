//! External collaborator interfaces and their in-memory implementations
//!
//! The job record store, credit ledger, dead-letter store and notification
//! sink are owned by external systems. The core only speaks to them through
//! these traits; handles are constructed explicitly and injected, never held
//! in process-wide globals. The in-memory implementations back the tests and
//! the CLI's ephemeral mode.

use crate::error::{PipelineError, Result};
use crate::models::{DeadLetterRecord, Job, JobId, JobStatus, NewJob, StageDurations};
use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use uuid::Uuid;

/// Outcome of an idempotent create
#[derive(Debug, Clone)]
pub enum CreateOutcome {
    /// A new job row was created
    Created(Job),
    /// The idempotency key already had a job; no second row, no second debit
    Existing(Job),
}

impl CreateOutcome {
    pub fn job(&self) -> &Job {
        match self {
            CreateOutcome::Created(job) | CreateOutcome::Existing(job) => job,
        }
    }

    pub fn is_created(&self) -> bool {
        matches!(self, CreateOutcome::Created(_))
    }
}

/// Durable record of job identity, status, attempts and stage timings.
///
/// Must enforce idempotency-key uniqueness: exactly one job per key.
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Create a job for the key, or return the existing one.
    async fn create(&self, idempotency_key: &str, attrs: NewJob) -> Result<CreateOutcome>;

    /// Transition the job status, recording the error context on failure.
    /// Rejects transitions outside the monotonic lifecycle.
    async fn update_status(
        &self,
        id: JobId,
        status: JobStatus,
        error_code: Option<&str>,
        error_message: Option<&str>,
    ) -> Result<()>;

    /// Record the attempt number currently being processed.
    async fn record_attempt(&self, id: JobId, attempt: u32) -> Result<()>;

    /// Persist stage durations for the latest attempt. Replaces the stored
    /// map: a retry re-runs the full pipeline.
    async fn append_stage_durations(
        &self,
        id: JobId,
        durations: &StageDurations,
        total_ms: u64,
    ) -> Result<()>;

    async fn get(&self, id: JobId) -> Result<Option<Job>>;

    async fn find_by_key(&self, idempotency_key: &str) -> Result<Option<Job>>;
}

/// Outcome of a debit attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DebitOutcome {
    Accepted { balance_after: i64 },
    InsufficientCredits { balance: i64 },
}

/// Append-only balance mutations: debit at admission, refund on permanent
/// failure. The refund is triggered by the external system observing a job
/// transition to `failed`, not by the dead-letter handler.
#[async_trait]
pub trait CreditLedger: Send + Sync {
    async fn debit(&self, account_id: &str, amount: i64, job_id: JobId) -> Result<DebitOutcome>;

    /// Compensating credit for a permanently failed job. At most one refund
    /// is recorded per job.
    async fn refund(&self, job_id: JobId, amount: i64) -> Result<()>;

    async fn balance(&self, account_id: &str) -> Result<i64>;
}

/// Operator-facing record of permanently failed jobs
#[async_trait]
pub trait DeadLetterStore: Send + Sync {
    /// Idempotent upsert keyed by job id; the first record wins.
    async fn upsert(&self, record: DeadLetterRecord) -> Result<()>;

    async fn get(&self, job_id: JobId) -> Result<Option<DeadLetterRecord>>;
}

/// Fire-and-forget user notification requests; failures are logged only
#[async_trait]
pub trait NotificationSink: Send + Sync {
    async fn notify(&self, account_id: &str, job_id: JobId, message: &str) -> Result<()>;
}

#[derive(Debug, Default)]
struct MemoryJobState {
    jobs: HashMap<JobId, Job>,
    by_key: HashMap<String, JobId>,
}

/// In-memory job store used by tests and the CLI's ephemeral mode
#[derive(Debug, Default)]
pub struct MemoryJobStore {
    state: Arc<RwLock<MemoryJobState>>,
}

impl MemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl JobStore for MemoryJobStore {
    async fn create(&self, idempotency_key: &str, attrs: NewJob) -> Result<CreateOutcome> {
        // Single write lock keeps the key check and the insert atomic under
        // concurrent duplicate submissions
        let mut state = self.state.write().await;

        if let Some(existing_id) = state.by_key.get(idempotency_key) {
            let job = state.jobs[existing_id].clone();
            return Ok(CreateOutcome::Existing(job));
        }

        let now = Utc::now();
        let job = Job {
            id: Uuid::new_v4(),
            idempotency_key: idempotency_key.to_string(),
            account_id: attrs.account_id,
            channel: attrs.channel,
            selectors: attrs.selectors,
            tier: attrs.tier,
            source_path: attrs.source_path,
            status: JobStatus::Pending,
            priority: attrs.priority,
            attempts: 0,
            last_error_code: None,
            last_error_message: None,
            stage_durations: StageDurations::new(),
            total_duration_ms: 0,
            created_at: now,
            updated_at: now,
        };

        state.by_key.insert(idempotency_key.to_string(), job.id);
        state.jobs.insert(job.id, job.clone());

        Ok(CreateOutcome::Created(job))
    }

    async fn update_status(
        &self,
        id: JobId,
        status: JobStatus,
        error_code: Option<&str>,
        error_message: Option<&str>,
    ) -> Result<()> {
        let mut state = self.state.write().await;
        let job = state
            .jobs
            .get_mut(&id)
            .ok_or_else(|| PipelineError::InvalidInput {
                message: format!("Job {} not found", id),
            })?;

        if !job.status.can_transition_to(status) {
            return Err(PipelineError::internal(format!(
                "Invalid status transition {:?} -> {:?} for job {}",
                job.status, status, id
            )));
        }

        job.status = status;
        job.updated_at = Utc::now();
        if let Some(code) = error_code {
            job.last_error_code = Some(code.to_string());
        }
        if let Some(message) = error_message {
            job.last_error_message = Some(message.to_string());
        }

        Ok(())
    }

    async fn record_attempt(&self, id: JobId, attempt: u32) -> Result<()> {
        let mut state = self.state.write().await;
        let job = state
            .jobs
            .get_mut(&id)
            .ok_or_else(|| PipelineError::InvalidInput {
                message: format!("Job {} not found", id),
            })?;
        job.attempts = attempt;
        job.updated_at = Utc::now();
        Ok(())
    }

    async fn append_stage_durations(
        &self,
        id: JobId,
        durations: &StageDurations,
        total_ms: u64,
    ) -> Result<()> {
        let mut state = self.state.write().await;
        let job = state
            .jobs
            .get_mut(&id)
            .ok_or_else(|| PipelineError::InvalidInput {
                message: format!("Job {} not found", id),
            })?;
        job.stage_durations = durations.clone();
        job.total_duration_ms = total_ms;
        job.updated_at = Utc::now();
        Ok(())
    }

    async fn get(&self, id: JobId) -> Result<Option<Job>> {
        let state = self.state.read().await;
        Ok(state.jobs.get(&id).cloned())
    }

    async fn find_by_key(&self, idempotency_key: &str) -> Result<Option<Job>> {
        let state = self.state.read().await;
        Ok(state
            .by_key
            .get(idempotency_key)
            .and_then(|id| state.jobs.get(id))
            .cloned())
    }
}

/// One balance mutation in the ledger
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreditEntry {
    pub account_id: String,
    pub job_id: JobId,
    pub amount: i64,
    pub kind: CreditEntryKind,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum CreditEntryKind {
    Debit,
    Refund,
}

#[derive(Debug, Default)]
struct MemoryLedgerState {
    balances: HashMap<String, i64>,
    entries: Vec<CreditEntry>,
}

/// In-memory credit ledger used by tests and the CLI's ephemeral mode
#[derive(Debug, Default)]
pub struct MemoryCreditLedger {
    state: Arc<RwLock<MemoryLedgerState>>,
}

impl MemoryCreditLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Grant credits to an account (test/CLI seeding)
    pub async fn grant(&self, account_id: &str, amount: i64) {
        let mut state = self.state.write().await;
        *state.balances.entry(account_id.to_string()).or_insert(0) += amount;
    }

    /// Number of debit entries recorded for an account
    pub async fn debit_count(&self, account_id: &str) -> usize {
        let state = self.state.read().await;
        state
            .entries
            .iter()
            .filter(|e| e.account_id == account_id && e.kind == CreditEntryKind::Debit)
            .count()
    }

    /// Whether a refund entry exists for the job
    pub async fn refunded(&self, job_id: JobId) -> bool {
        let state = self.state.read().await;
        state
            .entries
            .iter()
            .any(|e| e.job_id == job_id && e.kind == CreditEntryKind::Refund)
    }
}

#[async_trait]
impl CreditLedger for MemoryCreditLedger {
    async fn debit(&self, account_id: &str, amount: i64, job_id: JobId) -> Result<DebitOutcome> {
        let mut state = self.state.write().await;
        let balance = state.balances.get(account_id).copied().unwrap_or(0);

        if balance < amount {
            return Ok(DebitOutcome::InsufficientCredits { balance });
        }

        let balance_after = balance - amount;
        state.balances.insert(account_id.to_string(), balance_after);
        state.entries.push(CreditEntry {
            account_id: account_id.to_string(),
            job_id,
            amount,
            kind: CreditEntryKind::Debit,
        });

        Ok(DebitOutcome::Accepted { balance_after })
    }

    async fn refund(&self, job_id: JobId, amount: i64) -> Result<()> {
        let mut state = self.state.write().await;

        if state
            .entries
            .iter()
            .any(|e| e.job_id == job_id && e.kind == CreditEntryKind::Refund)
        {
            return Ok(());
        }

        let account_id = state
            .entries
            .iter()
            .find(|e| e.job_id == job_id && e.kind == CreditEntryKind::Debit)
            .map(|e| e.account_id.clone())
            .ok_or_else(|| PipelineError::InvalidInput {
                message: format!("No debit recorded for job {}", job_id),
            })?;

        *state.balances.entry(account_id.clone()).or_insert(0) += amount;
        state.entries.push(CreditEntry {
            account_id,
            job_id,
            amount,
            kind: CreditEntryKind::Refund,
        });

        Ok(())
    }

    async fn balance(&self, account_id: &str) -> Result<i64> {
        let state = self.state.read().await;
        Ok(state.balances.get(account_id).copied().unwrap_or(0))
    }
}

/// In-memory dead-letter store used by tests and the CLI's ephemeral mode
#[derive(Debug, Default)]
pub struct MemoryDeadLetterStore {
    records: Arc<RwLock<HashMap<JobId, DeadLetterRecord>>>,
}

impl MemoryDeadLetterStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.records.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.records.read().await.is_empty()
    }
}

#[async_trait]
impl DeadLetterStore for MemoryDeadLetterStore {
    async fn upsert(&self, record: DeadLetterRecord) -> Result<()> {
        let mut records = self.records.write().await;
        // First record wins; dead letters are never mutated after creation
        records.entry(record.job_id).or_insert(record);
        Ok(())
    }

    async fn get(&self, job_id: JobId) -> Result<Option<DeadLetterRecord>> {
        Ok(self.records.read().await.get(&job_id).cloned())
    }
}

/// Notification sink that records messages for assertions
#[derive(Debug, Default)]
pub struct MemoryNotificationSink {
    messages: Arc<RwLock<Vec<(String, JobId, String)>>>,
}

impl MemoryNotificationSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn messages(&self) -> Vec<(String, JobId, String)> {
        self.messages.read().await.clone()
    }
}

#[async_trait]
impl NotificationSink for MemoryNotificationSink {
    async fn notify(&self, account_id: &str, job_id: JobId, message: &str) -> Result<()> {
        self.messages
            .write()
            .await
            .push((account_id.to_string(), job_id, message.to_string()));
        Ok(())
    }
}

/// Notification sink that only logs; the default for the CLI
#[derive(Debug, Default)]
pub struct LogNotificationSink;

#[async_trait]
impl NotificationSink for LogNotificationSink {
    async fn notify(&self, account_id: &str, job_id: JobId, message: &str) -> Result<()> {
        tracing::info!(%job_id, account_id, message, "user notification requested");
        Ok(())
    }
}
