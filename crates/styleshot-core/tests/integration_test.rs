//! End-to-end scenarios across admission, broker, workers and the pipeline

use image::{DynamicImage, Rgba, RgbaImage};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use styleshot_core::provider::{ProviderError, ProviderErrorKind};
use styleshot_core::{
    AccountTier, AdmissionController, AppConfig, BackoffPolicy, Broker, Category, Channel,
    ConfigManager, CreditLedger, DatabaseManager, DeadLetterHandler, DeadLetterStore, JobId,
    JobPriority, JobSelectors, JobStatus, JobStore, MemoryCreditLedger, MemoryDeadLetterStore,
    MemoryJobStore, MemoryNotificationSink, MemoryObjectStore, MockProvider, Pipeline,
    SubmitRequest, WorkerPool, STAGE_NAMES,
};

struct TestStack {
    jobs: Arc<MemoryJobStore>,
    ledger: Arc<MemoryCreditLedger>,
    dead_letters: Arc<MemoryDeadLetterStore>,
    notifications: Arc<MemoryNotificationSink>,
    object_store: Arc<MemoryObjectStore>,
    broker: Arc<Broker>,
    admission: AdmissionController,
    pool: WorkerPool,
}

/// Queue tuned for test speed; model routes stripped of fallbacks so one
/// provider failure fails one attempt
fn test_config() -> AppConfig {
    let mut config = AppConfig::default();
    config.queue.backoff_table_ms = vec![5, 10, 20];
    config.queue.jitter_ms = 0;
    config.worker.concurrency = 2;
    for route in config.provider.routes.values_mut() {
        route.fallback = None;
    }
    config
}

fn build_stack(provider: Arc<MockProvider>, config: &AppConfig) -> TestStack {
    let jobs = Arc::new(MemoryJobStore::new());
    let ledger = Arc::new(MemoryCreditLedger::new());
    let dead_letters = Arc::new(MemoryDeadLetterStore::new());
    let notifications = Arc::new(MemoryNotificationSink::new());
    let object_store = Arc::new(MemoryObjectStore::new());

    let handler = Arc::new(DeadLetterHandler::new(
        dead_letters.clone(),
        jobs.clone(),
        notifications.clone(),
    ));
    let broker = Arc::new(Broker::new(
        &config.queue,
        BackoffPolicy::from_config(&config.queue),
        handler,
    ));
    let pipeline = Arc::new(Pipeline::new(config, provider, object_store.clone()));
    let pool = WorkerPool::new(&config.worker, broker.clone(), pipeline, jobs.clone());
    let admission = AdmissionController::new(
        jobs.clone(),
        ledger.clone(),
        broker.clone(),
        config.credits.clone(),
    );

    TestStack {
        jobs,
        ledger,
        dead_letters,
        notifications,
        object_store,
        broker,
        admission,
        pool,
    }
}

fn write_source(dir: &Path) -> PathBuf {
    let mut img = RgbaImage::from_pixel(96, 96, Rgba([228, 228, 228, 255]));
    for y in 30..66 {
        for x in 30..66 {
            img.put_pixel(x, y, Rgba([45, 60, 90, 255]));
        }
    }
    let path = dir.join("source.png");
    DynamicImage::ImageRgba8(img).save(&path).unwrap();
    path
}

fn submit_request(source_path: PathBuf) -> SubmitRequest {
    SubmitRequest {
        channel: Channel::TelegramBot,
        message_id: Some("msg123".to_string()),
        client_request_id: None,
        account_id: "acct-1".to_string(),
        tier: AccountTier::Standard,
        selectors: JobSelectors::new(Category::Clothing, "studio"),
        source_path,
        priority: JobPriority::Normal,
    }
}

async fn wait_terminal(stack: &TestStack, id: JobId) -> JobStatus {
    for _ in 0..500 {
        let job = stack.jobs.get(id).await.unwrap().unwrap();
        if job.status.is_terminal() && stack.broker.is_drained().await {
            return job.status;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("job did not reach a terminal status");
}

#[tokio::test]
async fn test_transient_failures_then_success_on_third_attempt() {
    let temp_dir = tempfile::tempdir().unwrap();
    let provider = Arc::new(MockProvider::with_failures(vec![
        ProviderError::new(ProviderErrorKind::ServerError, "upstream 503"),
        ProviderError::new(ProviderErrorKind::Timeout, "slow upstream"),
    ]));
    let config = test_config();
    let stack = build_stack(provider.clone(), &config);
    stack.ledger.grant("acct-1", 5).await;

    let outcome = stack
        .admission
        .submit(submit_request(write_source(temp_dir.path())))
        .await
        .unwrap();
    let job_id = outcome.job().id;
    assert_eq!(outcome.job().idempotency_key, "telegram_bot:msg123");

    stack.pool.start().await;
    let status = wait_terminal(&stack, job_id).await;
    stack.pool.shutdown().await;

    assert_eq!(status, JobStatus::Completed);
    assert_eq!(provider.calls(), 3);

    let job = stack.jobs.get(job_id).await.unwrap().unwrap();
    assert_eq!(job.attempts, 3);
    for stage in STAGE_NAMES {
        assert!(
            job.stage_durations.contains_key(stage),
            "missing stage {}",
            stage
        );
    }
    assert_eq!(job.stage_durations.len(), STAGE_NAMES.len());

    // One uploaded variant; the debit stands, no refund for a success
    assert_eq!(stack.object_store.len().await, 1);
    assert_eq!(stack.ledger.balance("acct-1").await.unwrap(), 4);
    assert!(stack.dead_letters.is_empty().await);
}

#[tokio::test]
async fn test_content_policy_violation_dead_letters_after_one_attempt() {
    let temp_dir = tempfile::tempdir().unwrap();
    let provider = Arc::new(MockProvider::with_failures(vec![ProviderError::new(
        ProviderErrorKind::ContentPolicy,
        "flagged subject",
    )]));
    let config = test_config();
    let stack = build_stack(provider.clone(), &config);
    stack.ledger.grant("acct-1", 5).await;

    let outcome = stack
        .admission
        .submit(submit_request(write_source(temp_dir.path())))
        .await
        .unwrap();
    let job_id = outcome.job().id;

    stack.pool.start().await;
    let status = wait_terminal(&stack, job_id).await;
    stack.pool.shutdown().await;

    assert_eq!(status, JobStatus::Failed);
    // No second attempt was delivered
    assert_eq!(provider.calls(), 1);

    let job = stack.jobs.get(job_id).await.unwrap().unwrap();
    assert_eq!(job.attempts, 1);
    assert_eq!(
        job.last_error_code.as_deref(),
        Some("content_policy_violation")
    );

    let record = stack.dead_letters.get(job_id).await.unwrap().unwrap();
    assert_eq!(record.attempts, 1);
    assert_eq!(record.error_code, "content_policy_violation");

    // The account was told, and nothing was uploaded
    assert_eq!(stack.notifications.messages().await.len(), 1);
    assert!(stack.object_store.is_empty().await);
}

#[tokio::test]
async fn test_duplicate_webhook_delivery_folds_into_one_job() {
    let temp_dir = tempfile::tempdir().unwrap();
    let config = test_config();
    let stack = build_stack(Arc::new(MockProvider::new()), &config);
    stack.ledger.grant("acct-1", 5).await;

    let source = write_source(temp_dir.path());
    let first = stack
        .admission
        .submit(submit_request(source.clone()))
        .await
        .unwrap();
    let second = stack.admission.submit(submit_request(source)).await.unwrap();

    assert!(second.is_duplicate());
    assert_eq!(second.job().id, first.job().id);
    assert_eq!(stack.ledger.debit_count("acct-1").await, 1);
    assert_eq!(stack.broker.stats().await.ready, 1);
}

#[tokio::test]
async fn test_full_stack_against_sqlite_stores() {
    let temp_dir = tempfile::tempdir().unwrap();
    let config = test_config();

    let db = Arc::new(DatabaseManager::in_memory().await.unwrap());
    db.grant("acct-1", 3).await.unwrap();

    let notifications = Arc::new(MemoryNotificationSink::new());
    let object_store = Arc::new(MemoryObjectStore::new());
    let handler = Arc::new(DeadLetterHandler::new(
        db.clone() as Arc<dyn DeadLetterStore>,
        db.clone() as Arc<dyn JobStore>,
        notifications,
    ));
    let broker = Arc::new(Broker::new(
        &config.queue,
        BackoffPolicy::from_config(&config.queue),
        handler,
    ));
    let pipeline = Arc::new(Pipeline::new(
        &config,
        Arc::new(MockProvider::new()),
        object_store.clone(),
    ));
    let pool = WorkerPool::new(
        &config.worker,
        broker.clone(),
        pipeline,
        db.clone() as Arc<dyn JobStore>,
    );
    let admission = AdmissionController::new(
        db.clone() as Arc<dyn JobStore>,
        db.clone() as Arc<dyn CreditLedger>,
        broker.clone(),
        config.credits.clone(),
    );

    let outcome = admission
        .submit(submit_request(write_source(temp_dir.path())))
        .await
        .unwrap();
    let job_id = outcome.job().id;

    pool.start().await;
    let mut status = None;
    for _ in 0..500 {
        let job = JobStore::get(db.as_ref(), job_id).await.unwrap().unwrap();
        if job.status.is_terminal() && broker.is_drained().await {
            status = Some(job.status);
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    pool.shutdown().await;

    assert_eq!(status, Some(JobStatus::Completed));
    assert_eq!(db.balance("acct-1").await.unwrap(), 2);
    assert_eq!(object_store.len().await, 1);
}

#[test]
fn test_config_manager_round_trip() {
    let temp_dir = tempfile::tempdir().unwrap();
    let config_path = temp_dir.path().join("config.toml");

    let mut manager = ConfigManager::with_path(config_path.clone()).unwrap();
    let mut config = manager.config().clone();
    config.queue.max_attempts = 4;
    manager.update_config(config).unwrap();

    let reloaded = ConfigManager::with_path(config_path).unwrap();
    assert_eq!(reloaded.config().queue.max_attempts, 4);
}
