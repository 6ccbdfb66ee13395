//! # Styleshot Core
//!
//! Asynchronous image-transformation job service: idempotent admission,
//! priority-aware queueing with bounded concurrency, retry/backoff with
//! dead-letter handling, and the ordered multi-stage image pipeline.

pub mod admission;
pub mod background;
pub mod broker;
pub mod compress;
pub mod config;
pub mod database;
pub mod dead_letter;
pub mod error;
pub mod idempotency;
pub mod logging;
pub mod models;
pub mod pipeline;
pub mod preprocess;
pub mod provider;
pub mod retry;
pub mod stage_timer;
pub mod storage;
pub mod store;
pub mod template;
pub mod watermark;
pub mod worker;

// Re-export commonly used types
pub use admission::{AdmissionController, AdmissionOutcome, SubmitRequest};
pub use broker::{BackoffPolicy, Broker, BrokerStats, Delivery, NackOutcome, QueueToken};
pub use config::{AppConfig, ConfigManager};
pub use database::{DatabaseConfig, DatabaseManager};
pub use dead_letter::DeadLetterHandler;
pub use error::{PipelineError, Result};
pub use idempotency::Channel;
pub use models::*;
pub use pipeline::{Pipeline, PipelineOutput, STAGE_NAMES};
pub use provider::{GenerativeProvider, MockProvider, PromptProfile, ProviderError};
pub use stage_timer::StageTimer;
pub use storage::{LocalObjectStore, MemoryObjectStore, ObjectStore};
pub use store::{
    CreateOutcome, CreditLedger, DeadLetterStore, DebitOutcome, JobStore, LogNotificationSink,
    MemoryCreditLedger, MemoryDeadLetterStore, MemoryJobStore, MemoryNotificationSink,
    NotificationSink,
};
pub use worker::WorkerPool;

/// Initialize the core library
pub async fn init() -> Result<()> {
    logging::init_logging()?;

    tracing::info!("Styleshot core initialized successfully");
    Ok(())
}

/// Get the version of the core library
pub fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}
