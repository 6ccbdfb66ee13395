//! Core data models for job admission and pipeline processing

use crate::error::{PipelineError, Result};
use crate::idempotency::Channel;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::str::FromStr;
use uuid::Uuid;

/// Unique identifier for jobs
pub type JobId = Uuid;

/// Map of stage name to wall-clock duration in milliseconds.
///
/// Overwritten wholesale on each attempt; a retry re-runs the full pipeline.
pub type StageDurations = HashMap<String, u64>;

/// Job lifecycle status
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Queued,
    Processing,
    Completed,
    Failed,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Queued => "queued",
            JobStatus::Processing => "processing",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
        }
    }

    /// Status transitions are monotonic along
    /// `pending -> queued -> processing -> {completed|failed}`;
    /// `processing -> queued` is permitted only as a retry re-delivery.
    pub fn can_transition_to(&self, next: JobStatus) -> bool {
        matches!(
            (self, next),
            (JobStatus::Pending, JobStatus::Queued)
                | (JobStatus::Pending, JobStatus::Failed)
                | (JobStatus::Queued, JobStatus::Processing)
                | (JobStatus::Processing, JobStatus::Completed)
                | (JobStatus::Processing, JobStatus::Failed)
                | (JobStatus::Processing, JobStatus::Queued)
        )
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }
}

impl FromStr for JobStatus {
    type Err = PipelineError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "pending" => Ok(JobStatus::Pending),
            "queued" => Ok(JobStatus::Queued),
            "processing" => Ok(JobStatus::Processing),
            "completed" => Ok(JobStatus::Completed),
            "failed" => Ok(JobStatus::Failed),
            other => Err(PipelineError::InvalidInput {
                message: format!("Unknown job status: {}", other),
            }),
        }
    }
}

/// Coarse scheduling tier; lower weight is delivered first
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum JobPriority {
    Low,
    Normal,
    High,
}

impl JobPriority {
    /// Numeric delivery weight; lower is delivered first
    pub fn weight(&self) -> u8 {
        match self {
            JobPriority::High => 0,
            JobPriority::Normal => 1,
            JobPriority::Low => 2,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            JobPriority::Low => "low",
            JobPriority::Normal => "normal",
            JobPriority::High => "high",
        }
    }
}

impl Default for JobPriority {
    fn default() -> Self {
        JobPriority::Normal
    }
}

impl FromStr for JobPriority {
    type Err = PipelineError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "low" => Ok(JobPriority::Low),
            "normal" => Ok(JobPriority::Normal),
            "high" => Ok(JobPriority::High),
            other => Err(PipelineError::InvalidInput {
                message: format!("Unknown priority: {}", other),
            }),
        }
    }
}

/// Transformation category selecting the prompt profile family
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Category {
    Clothing,
    Portrait,
    Product,
    Pet,
}

impl Category {
    pub fn as_str(&self) -> &'static str {
        match self {
            Category::Clothing => "clothing",
            Category::Portrait => "portrait",
            Category::Product => "product",
            Category::Pet => "pet",
        }
    }
}

impl FromStr for Category {
    type Err = PipelineError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "clothing" => Ok(Category::Clothing),
            "portrait" => Ok(Category::Portrait),
            "product" => Ok(Category::Product),
            "pet" => Ok(Category::Pet),
            other => Err(PipelineError::InvalidInput {
                message: format!("Unknown category: {}", other),
            }),
        }
    }
}

/// Output canvas layout
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Layout {
    Square,
    Portrait45,
    Story916,
}

impl Layout {
    /// Canvas dimensions in pixels
    pub fn canvas(&self) -> (u32, u32) {
        match self {
            Layout::Square => (1080, 1080),
            Layout::Portrait45 => (1080, 1350),
            Layout::Story916 => (1080, 1920),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Layout::Square => "square",
            Layout::Portrait45 => "portrait_4_5",
            Layout::Story916 => "story_9_16",
        }
    }
}

impl Default for Layout {
    fn default() -> Self {
        Layout::Square
    }
}

impl FromStr for Layout {
    type Err = PipelineError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "square" => Ok(Layout::Square),
            "portrait_4_5" => Ok(Layout::Portrait45),
            "story_9_16" => Ok(Layout::Story916),
            other => Err(PipelineError::InvalidInput {
                message: format!("Unknown layout: {}", other),
            }),
        }
    }
}

/// Selectable background matting models
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum MattingModel {
    /// Estimates the background color from the border and masks by distance
    BorderColor,
    /// Masks by luminance split against the border average
    Luminance,
}

impl Default for MattingModel {
    fn default() -> Self {
        MattingModel::BorderColor
    }
}

/// Rendering mode influencing provider model routing
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RenderMode {
    Standard,
    Hd,
}

impl Default for RenderMode {
    fn default() -> Self {
        RenderMode::Standard
    }
}

/// Account tier; elevated tiers skip the watermark stage entirely
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum AccountTier {
    Standard,
    Premium,
}

impl AccountTier {
    pub fn skips_watermark(&self) -> bool {
        matches!(self, AccountTier::Premium)
    }
}

impl Default for AccountTier {
    fn default() -> Self {
        AccountTier::Standard
    }
}

/// Transformation selectors carried by a job; immutable once enqueued
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct JobSelectors {
    pub category: Category,
    pub style: String,
    pub layout: Layout,
    pub mode: RenderMode,
    pub matting_model: MattingModel,
}

impl JobSelectors {
    pub fn new(category: Category, style: impl Into<String>) -> Self {
        Self {
            category,
            style: style.into(),
            layout: Layout::default(),
            mode: RenderMode::default(),
            matting_model: MattingModel::default(),
        }
    }
}

/// One logical image-transformation request tied to one account and one
/// idempotency key
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub idempotency_key: String,
    pub account_id: String,
    pub channel: Channel,
    pub selectors: JobSelectors,
    pub tier: AccountTier,
    pub source_path: PathBuf,
    pub status: JobStatus,
    pub priority: JobPriority,
    pub attempts: u32,
    pub last_error_code: Option<String>,
    pub last_error_message: Option<String>,
    pub stage_durations: StageDurations,
    pub total_duration_ms: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Job {
    /// Serializable projection handed to the broker
    pub fn payload(&self) -> JobPayload {
        JobPayload {
            job_id: self.id,
            account_id: self.account_id.clone(),
            correlation_id: Uuid::new_v4(),
            priority: self.priority,
            selectors: self.selectors.clone(),
            tier: self.tier,
            source_path: self.source_path.clone(),
        }
    }
}

/// Admission attributes for a new job
#[derive(Debug, Clone)]
pub struct NewJob {
    pub account_id: String,
    pub channel: Channel,
    pub selectors: JobSelectors,
    pub tier: AccountTier,
    pub source_path: PathBuf,
    pub priority: JobPriority,
}

/// The projection of a job handed to the broker: owned by the broker between
/// enqueue and delivery, copied into worker-local scope during processing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobPayload {
    pub job_id: JobId,
    pub account_id: String,
    pub correlation_id: Uuid,
    pub priority: JobPriority,
    pub selectors: JobSelectors,
    pub tier: AccountTier,
    pub source_path: PathBuf,
}

/// One record per permanently-failed job, upserted by job id
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeadLetterRecord {
    pub job_id: JobId,
    pub error_code: String,
    pub error_message: String,
    pub attempts: u32,
    pub payload: JobPayload,
    pub context: String,
    pub created_at: DateTime<Utc>,
}
