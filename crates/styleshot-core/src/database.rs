//! SQLite-backed job records, dead letters and credit ledger

use crate::error::{PipelineError, Result};
use crate::idempotency::Channel;
use crate::models::{
    AccountTier, DeadLetterRecord, Job, JobId, JobSelectors, JobStatus, NewJob, StageDurations,
};
use crate::store::{CreateOutcome, CreditLedger, DeadLetterStore, DebitOutcome, JobStore};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{sqlite::SqlitePoolOptions, Row, SqlitePool};
use std::path::PathBuf;
use std::str::FromStr;
use uuid::Uuid;

/// Database configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    pub database_url: String,
    pub max_connections: u32,
    pub enable_wal_mode: bool,
    pub enable_foreign_keys: bool,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            database_url: "sqlite:./styleshot.db".to_string(),
            max_connections: 10,
            enable_wal_mode: true,
            enable_foreign_keys: true,
        }
    }
}

/// Connection pool plus schema management for the durable stores
#[derive(Debug, Clone)]
pub struct DatabaseManager {
    pool: SqlitePool,
}

impl DatabaseManager {
    /// Create a new database manager with the given configuration
    pub async fn new(config: DatabaseConfig) -> Result<Self> {
        let options = sqlx::sqlite::SqliteConnectOptions::from_str(&config.database_url)?
            .create_if_missing(true)
            .journal_mode(if config.enable_wal_mode {
                sqlx::sqlite::SqliteJournalMode::Wal
            } else {
                sqlx::sqlite::SqliteJournalMode::Delete
            })
            .foreign_keys(config.enable_foreign_keys);

        let pool = SqlitePoolOptions::new()
            .max_connections(config.max_connections)
            .connect_with(options)
            .await?;

        let manager = Self { pool };
        manager.run_migrations().await?;
        Ok(manager)
    }

    /// In-memory database for tests; a single connection keeps the schema
    /// alive for the pool's lifetime
    pub async fn in_memory() -> Result<Self> {
        let options = sqlx::sqlite::SqliteConnectOptions::from_str("sqlite::memory:")?;
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await?;

        let manager = Self { pool };
        manager.run_migrations().await?;
        Ok(manager)
    }

    /// Run schema migrations
    pub async fn run_migrations(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS jobs (
                id TEXT PRIMARY KEY,
                idempotency_key TEXT NOT NULL UNIQUE,
                account_id TEXT NOT NULL,
                channel TEXT NOT NULL,
                selectors TEXT NOT NULL,
                tier TEXT NOT NULL,
                source_path TEXT NOT NULL,
                status TEXT NOT NULL,
                priority TEXT NOT NULL,
                attempts INTEGER NOT NULL DEFAULT 0,
                last_error_code TEXT,
                last_error_message TEXT,
                stage_durations TEXT NOT NULL DEFAULT '{}',
                total_duration_ms INTEGER NOT NULL DEFAULT 0,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS dead_letters (
                job_id TEXT PRIMARY KEY,
                error_code TEXT NOT NULL,
                error_message TEXT NOT NULL,
                attempts INTEGER NOT NULL,
                payload TEXT NOT NULL,
                context TEXT NOT NULL,
                created_at TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS credit_entries (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                account_id TEXT NOT NULL,
                job_id TEXT,
                amount INTEGER NOT NULL,
                kind TEXT NOT NULL,
                created_at TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_credit_entries_account ON credit_entries (account_id)",
        )
        .execute(&self.pool)
        .await?;

        tracing::info!("database migrations completed");
        Ok(())
    }

    /// Grant credits to an account (operator/seeding path)
    pub async fn grant(&self, account_id: &str, amount: i64) -> Result<()> {
        sqlx::query(
            "INSERT INTO credit_entries (account_id, job_id, amount, kind, created_at)
             VALUES (?, NULL, ?, 'grant', ?)",
        )
        .bind(account_id)
        .bind(amount)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn balance_of(
        &self,
        executor: impl sqlx::SqliteExecutor<'_>,
        account_id: &str,
    ) -> Result<i64> {
        let row = sqlx::query(
            r#"
            SELECT COALESCE(SUM(CASE kind WHEN 'debit' THEN -amount ELSE amount END), 0) AS balance
            FROM credit_entries
            WHERE account_id = ?
            "#,
        )
        .bind(account_id)
        .fetch_one(executor)
        .await?;
        Ok(row.get::<i64, _>("balance"))
    }
}

fn tier_to_str(tier: AccountTier) -> &'static str {
    match tier {
        AccountTier::Standard => "standard",
        AccountTier::Premium => "premium",
    }
}

fn tier_from_str(s: &str) -> AccountTier {
    match s {
        "premium" => AccountTier::Premium,
        _ => AccountTier::Standard,
    }
}

fn row_to_job(row: &sqlx::sqlite::SqliteRow) -> Result<Job> {
    let selectors: JobSelectors = serde_json::from_str(&row.get::<String, _>("selectors"))?;
    let stage_durations: StageDurations =
        serde_json::from_str(&row.get::<String, _>("stage_durations"))?;

    let id = Uuid::parse_str(&row.get::<String, _>("id")).map_err(|e| {
        PipelineError::internal(format!("Corrupt job id in database: {}", e))
    })?;

    Ok(Job {
        id,
        idempotency_key: row.get("idempotency_key"),
        account_id: row.get("account_id"),
        channel: row.get::<String, _>("channel").parse::<Channel>()?,
        selectors,
        tier: tier_from_str(&row.get::<String, _>("tier")),
        source_path: PathBuf::from(row.get::<String, _>("source_path")),
        status: row.get::<String, _>("status").parse()?,
        priority: row.get::<String, _>("priority").parse()?,
        attempts: row.get::<i64, _>("attempts") as u32,
        last_error_code: row.get("last_error_code"),
        last_error_message: row.get("last_error_message"),
        stage_durations,
        total_duration_ms: row.get::<i64, _>("total_duration_ms") as u64,
        created_at: row.get::<DateTime<Utc>, _>("created_at"),
        updated_at: row.get::<DateTime<Utc>, _>("updated_at"),
    })
}

#[async_trait]
impl JobStore for DatabaseManager {
    async fn create(&self, idempotency_key: &str, attrs: NewJob) -> Result<CreateOutcome> {
        let id = Uuid::new_v4();
        let now = Utc::now();

        // The UNIQUE constraint folds concurrent duplicates; an ignored
        // insert means another submission won the race
        let inserted = sqlx::query(
            r#"
            INSERT INTO jobs (
                id, idempotency_key, account_id, channel, selectors, tier,
                source_path, status, priority, attempts, stage_durations,
                total_duration_ms, created_at, updated_at
            )
            VALUES (?, ?, ?, ?, ?, ?, ?, 'pending', ?, 0, '{}', 0, ?, ?)
            ON CONFLICT(idempotency_key) DO NOTHING
            "#,
        )
        .bind(id.to_string())
        .bind(idempotency_key)
        .bind(&attrs.account_id)
        .bind(attrs.channel.as_str())
        .bind(serde_json::to_string(&attrs.selectors)?)
        .bind(tier_to_str(attrs.tier))
        .bind(attrs.source_path.to_string_lossy().to_string())
        .bind(attrs.priority.as_str())
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await?
        .rows_affected();

        let job = self
            .find_by_key(idempotency_key)
            .await?
            .ok_or_else(|| PipelineError::internal("job vanished after insert"))?;

        if inserted == 1 {
            Ok(CreateOutcome::Created(job))
        } else {
            Ok(CreateOutcome::Existing(job))
        }
    }

    async fn update_status(
        &self,
        id: JobId,
        status: JobStatus,
        error_code: Option<&str>,
        error_message: Option<&str>,
    ) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        let current: String = sqlx::query("SELECT status FROM jobs WHERE id = ?")
            .bind(id.to_string())
            .fetch_optional(&mut *tx)
            .await?
            .map(|row| row.get("status"))
            .ok_or_else(|| PipelineError::InvalidInput {
                message: format!("Job {} not found", id),
            })?;

        let current: JobStatus = current.parse()?;
        if !current.can_transition_to(status) {
            return Err(PipelineError::internal(format!(
                "Invalid status transition {:?} -> {:?} for job {}",
                current, status, id
            )));
        }

        sqlx::query(
            r#"
            UPDATE jobs
            SET status = ?,
                last_error_code = COALESCE(?, last_error_code),
                last_error_message = COALESCE(?, last_error_message),
                updated_at = ?
            WHERE id = ?
            "#,
        )
        .bind(status.as_str())
        .bind(error_code)
        .bind(error_message)
        .bind(Utc::now())
        .bind(id.to_string())
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(())
    }

    async fn record_attempt(&self, id: JobId, attempt: u32) -> Result<()> {
        sqlx::query("UPDATE jobs SET attempts = ?, updated_at = ? WHERE id = ?")
            .bind(attempt as i64)
            .bind(Utc::now())
            .bind(id.to_string())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn append_stage_durations(
        &self,
        id: JobId,
        durations: &StageDurations,
        total_ms: u64,
    ) -> Result<()> {
        sqlx::query(
            "UPDATE jobs SET stage_durations = ?, total_duration_ms = ?, updated_at = ? WHERE id = ?",
        )
        .bind(serde_json::to_string(durations)?)
        .bind(total_ms as i64)
        .bind(Utc::now())
        .bind(id.to_string())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get(&self, id: JobId) -> Result<Option<Job>> {
        let row = sqlx::query("SELECT * FROM jobs WHERE id = ?")
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(row_to_job).transpose()
    }

    async fn find_by_key(&self, idempotency_key: &str) -> Result<Option<Job>> {
        let row = sqlx::query("SELECT * FROM jobs WHERE idempotency_key = ?")
            .bind(idempotency_key)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(row_to_job).transpose()
    }
}

#[async_trait]
impl DeadLetterStore for DatabaseManager {
    async fn upsert(&self, record: DeadLetterRecord) -> Result<()> {
        // First record wins; dead letters are never mutated after creation
        sqlx::query(
            r#"
            INSERT INTO dead_letters (
                job_id, error_code, error_message, attempts, payload, context, created_at
            )
            VALUES (?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(job_id) DO NOTHING
            "#,
        )
        .bind(record.job_id.to_string())
        .bind(&record.error_code)
        .bind(&record.error_message)
        .bind(record.attempts as i64)
        .bind(serde_json::to_string(&record.payload)?)
        .bind(&record.context)
        .bind(record.created_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get(&self, job_id: JobId) -> Result<Option<DeadLetterRecord>> {
        let row = sqlx::query("SELECT * FROM dead_letters WHERE job_id = ?")
            .bind(job_id.to_string())
            .fetch_optional(&self.pool)
            .await?;

        row.map(|row| {
            let payload = serde_json::from_str(&row.get::<String, _>("payload"))?;
            let job_id = Uuid::parse_str(&row.get::<String, _>("job_id")).map_err(|e| {
                PipelineError::internal(format!("Corrupt job id in dead letter: {}", e))
            })?;
            Ok(DeadLetterRecord {
                job_id,
                error_code: row.get("error_code"),
                error_message: row.get("error_message"),
                attempts: row.get::<i64, _>("attempts") as u32,
                payload,
                context: row.get("context"),
                created_at: row.get::<DateTime<Utc>, _>("created_at"),
            })
        })
        .transpose()
    }
}

#[async_trait]
impl CreditLedger for DatabaseManager {
    async fn debit(&self, account_id: &str, amount: i64, job_id: JobId) -> Result<DebitOutcome> {
        let mut tx = self.pool.begin().await?;

        let balance = self.balance_of(&mut *tx, account_id).await?;
        if balance < amount {
            return Ok(DebitOutcome::InsufficientCredits { balance });
        }

        sqlx::query(
            "INSERT INTO credit_entries (account_id, job_id, amount, kind, created_at)
             VALUES (?, ?, ?, 'debit', ?)",
        )
        .bind(account_id)
        .bind(job_id.to_string())
        .bind(amount)
        .bind(Utc::now())
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(DebitOutcome::Accepted {
            balance_after: balance - amount,
        })
    }

    async fn refund(&self, job_id: JobId, amount: i64) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        let already_refunded = sqlx::query(
            "SELECT 1 AS present FROM credit_entries WHERE job_id = ? AND kind = 'refund'",
        )
        .bind(job_id.to_string())
        .fetch_optional(&mut *tx)
        .await?
        .is_some();
        if already_refunded {
            return Ok(());
        }

        let account_id: String = sqlx::query(
            "SELECT account_id FROM credit_entries WHERE job_id = ? AND kind = 'debit'",
        )
        .bind(job_id.to_string())
        .fetch_optional(&mut *tx)
        .await?
        .map(|row| row.get("account_id"))
        .ok_or_else(|| PipelineError::InvalidInput {
            message: format!("No debit recorded for job {}", job_id),
        })?;

        sqlx::query(
            "INSERT INTO credit_entries (account_id, job_id, amount, kind, created_at)
             VALUES (?, ?, ?, 'refund', ?)",
        )
        .bind(&account_id)
        .bind(job_id.to_string())
        .bind(amount)
        .bind(Utc::now())
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(())
    }

    async fn balance(&self, account_id: &str) -> Result<i64> {
        self.balance_of(&self.pool, account_id).await
    }
}
