//! Ordered multi-stage image pipeline
//!
//! Stages run in a fixed order under uniform timing and error wrapping; a
//! stage failure aborts the remainder and propagates to the worker for
//! classification.

use crate::background::{self, CutoutResult};
use crate::compress::{self, Codec};
use crate::config::{AppConfig, PipelineConfig, ProviderConfig, StorageConfig};
use crate::error::{PipelineError, Result};
use crate::models::JobPayload;
use crate::preprocess;
use crate::provider::{model_for, route_for, GenerativeProvider, PromptProfile};
use crate::stage_timer::StageTimer;
use crate::storage::{object_key, ObjectStore};
use crate::template;
use crate::watermark;
use image::{DynamicImage, ImageOutputFormat};
use std::io::Cursor;
use std::sync::Arc;
use std::time::Duration;
use tokio::task;
use tracing::{info, instrument, warn};

/// Stage names in execution order, as recorded in the duration map
pub const STAGE_NAMES: [&str; 7] = [
    "preprocess",
    "background_removal",
    "generative_transform",
    "template_composition",
    "watermark",
    "compression",
    "upload",
];

/// Result of a successful pipeline run
#[derive(Debug, Clone)]
pub struct PipelineOutput {
    pub object_key: String,
    pub codec: Codec,
    pub size_bytes: usize,
    pub forced_compression: bool,
    pub halo_flagged: bool,
}

/// Executes the ordered stage list for one job attempt
pub struct Pipeline {
    pipeline_config: PipelineConfig,
    provider_config: ProviderConfig,
    storage_config: StorageConfig,
    provider: Arc<dyn GenerativeProvider>,
    object_store: Arc<dyn ObjectStore>,
}

impl Pipeline {
    pub fn new(
        config: &AppConfig,
        provider: Arc<dyn GenerativeProvider>,
        object_store: Arc<dyn ObjectStore>,
    ) -> Self {
        Self {
            pipeline_config: config.pipeline.clone(),
            provider_config: config.provider.clone(),
            storage_config: config.storage.clone(),
            provider,
            object_store,
        }
    }

    /// Run all stages for one attempt, recording per-stage durations
    #[instrument(skip(self, timer), fields(job_id = %payload.job_id, correlation_id = %payload.correlation_id))]
    pub async fn run(&self, payload: &JobPayload, timer: &mut StageTimer) -> Result<PipelineOutput> {
        let preprocessed = timer
            .with_stage("preprocess", self.preprocess_stage(payload))
            .await?;

        let cutout = timer
            .with_stage(
                "background_removal",
                self.background_stage(preprocessed, payload),
            )
            .await?;
        let halo_flagged = cutout.halo_flagged;

        let styled = timer
            .with_stage(
                "generative_transform",
                self.generative_stage(payload, &cutout),
            )
            .await?;

        let composed = timer
            .with_stage("template_composition", async {
                template::compose(&styled, payload.selectors.layout)
            })
            .await?;

        let marked = timer
            .with_stage("watermark", async {
                watermark::apply(composed, payload.tier, &self.pipeline_config.watermark)
            })
            .await?;

        let compressed = timer
            .with_stage("compression", self.compression_stage(marked))
            .await?;

        let output = timer
            .with_stage("upload", self.upload_stage(payload, &compressed))
            .await?;

        info!(
            object_key = %output.object_key,
            size_bytes = output.size_bytes,
            forced_compression = output.forced_compression,
            halo_flagged,
            "pipeline completed"
        );

        Ok(PipelineOutput {
            halo_flagged,
            ..output
        })
    }

    async fn preprocess_stage(&self, payload: &JobPayload) -> Result<DynamicImage> {
        let bytes = tokio::fs::read(&payload.source_path)
            .await
            .map_err(|e| PipelineError::InvalidInput {
                message: format!(
                    "Failed to read source {}: {}",
                    payload.source_path.display(),
                    e
                ),
            })?;

        let config = self.pipeline_config.clone();
        task::spawn_blocking(move || preprocess::run(&bytes, &config))
            .await
            .map_err(|e| PipelineError::internal(format!("Task join error: {}", e)))?
    }

    async fn background_stage(
        &self,
        img: DynamicImage,
        payload: &JobPayload,
    ) -> Result<CutoutResult> {
        let model = payload.selectors.matting_model;
        let config = self.pipeline_config.mask.clone();
        task::spawn_blocking(move || background::remove_background(&img, model, &config))
            .await
            .map_err(|e| PipelineError::internal(format!("Task join error: {}", e)))?
    }

    async fn generative_stage(
        &self,
        payload: &JobPayload,
        cutout: &CutoutResult,
    ) -> Result<DynamicImage> {
        let profile = PromptProfile::select(payload.selectors.category, &payload.selectors.style);
        let route = route_for(&self.provider_config, payload.selectors.category).ok_or_else(
            || PipelineError::ConfigError {
                message: format!(
                    "No model route configured for category {}",
                    payload.selectors.category.as_str()
                ),
            },
        )?;
        let model = model_for(route, payload.selectors.mode).to_string();
        let timeout = Duration::from_millis(self.provider_config.timeout_ms);

        let cutout_png = encode_png(&cutout.cutout)?;

        match self
            .call_provider(&cutout_png, &profile, &model, timeout)
            .await
        {
            Ok(img) => Ok(img),
            Err(error) if is_transient(&error) => {
                let Some(fallback) = route.fallback.as_deref() else {
                    return Err(error);
                };
                warn!(
                    job_id = %payload.job_id,
                    primary = %model,
                    fallback,
                    %error,
                    "primary model failed; routing to fallback"
                );
                self.call_provider(&cutout_png, &profile, fallback, timeout)
                    .await
            }
            Err(error) => Err(error),
        }
    }

    async fn call_provider(
        &self,
        cutout_png: &[u8],
        profile: &PromptProfile,
        model: &str,
        timeout: Duration,
    ) -> Result<DynamicImage> {
        let outcome = tokio::time::timeout(
            timeout,
            self.provider.transform(cutout_png, profile, model, timeout),
        )
        .await;

        match outcome {
            Err(_) => Err(PipelineError::ProviderTransient {
                message: format!(
                    "Provider {} exceeded {}ms",
                    self.provider.name(),
                    timeout.as_millis()
                ),
            }),
            Ok(Err(provider_error)) => Err(provider_error.into()),
            Ok(Ok(bytes)) => {
                image::load_from_memory(&bytes).map_err(|e| PipelineError::ProviderTransient {
                    message: format!("Provider returned an undecodable image: {}", e),
                })
            }
        }
    }

    async fn compression_stage(&self, img: DynamicImage) -> Result<compress::CompressedImage> {
        let config = self.pipeline_config.compression.clone();
        task::spawn_blocking(move || compress::compress_to_budget(&img, &config))
            .await
            .map_err(|e| PipelineError::internal(format!("Task join error: {}", e)))?
    }

    async fn upload_stage(
        &self,
        payload: &JobPayload,
        compressed: &compress::CompressedImage,
    ) -> Result<PipelineOutput> {
        let key = object_key(
            &self.storage_config.namespace,
            &payload.account_id,
            payload.job_id,
            self.pipeline_config.version,
            payload.selectors.layout.as_str(),
            compressed.codec.extension(),
        );

        self.object_store
            .put(&key, &compressed.bytes, compressed.codec.content_type())
            .await?;

        Ok(PipelineOutput {
            object_key: key,
            codec: compressed.codec,
            size_bytes: compressed.bytes.len(),
            forced_compression: compressed.forced,
            halo_flagged: false,
        })
    }
}

fn is_transient(error: &PipelineError) -> bool {
    matches!(
        error,
        PipelineError::ProviderTransient { .. } | PipelineError::Timeout
    )
}

fn encode_png(img: &image::RgbaImage) -> Result<Vec<u8>> {
    let mut buffer = Cursor::new(Vec::new());
    DynamicImage::ImageRgba8(img.clone())
        .write_to(&mut buffer, ImageOutputFormat::Png)
        .map_err(|e| PipelineError::internal(format!("PNG encode failed: {}", e)))?;
    Ok(buffer.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{
        AccountTier, Category, JobPriority, JobSelectors, Layout, MattingModel, RenderMode,
    };
    use crate::provider::{MockProvider, ProviderError, ProviderErrorKind};
    use crate::storage::{FailingObjectStore, MemoryObjectStore};
    use image::{Rgba, RgbaImage};
    use std::path::PathBuf;
    use uuid::Uuid;

    fn write_source(dir: &std::path::Path) -> PathBuf {
        let mut img = RgbaImage::from_pixel(96, 96, Rgba([230, 230, 230, 255]));
        for y in 32..64 {
            for x in 32..64 {
                img.put_pixel(x, y, Rgba([40, 60, 80, 255]));
            }
        }
        let path = dir.join("source.png");
        DynamicImage::ImageRgba8(img).save(&path).unwrap();
        path
    }

    fn payload(source_path: PathBuf) -> JobPayload {
        JobPayload {
            job_id: Uuid::new_v4(),
            account_id: "acct-1".to_string(),
            correlation_id: Uuid::new_v4(),
            priority: JobPriority::Normal,
            selectors: JobSelectors {
                category: Category::Clothing,
                style: "studio".to_string(),
                layout: Layout::Square,
                mode: RenderMode::Standard,
                matting_model: MattingModel::BorderColor,
            },
            tier: AccountTier::Standard,
            source_path,
        }
    }

    #[tokio::test]
    async fn test_full_run_times_all_stages() {
        let temp_dir = tempfile::tempdir().unwrap();
        let source = write_source(temp_dir.path());
        let object_store = Arc::new(MemoryObjectStore::new());
        let pipeline = Pipeline::new(
            &AppConfig::default(),
            Arc::new(MockProvider::new()),
            object_store.clone(),
        );

        let payload = payload(source);
        let mut timer = StageTimer::new(payload.job_id, payload.correlation_id);

        let output = pipeline.run(&payload, &mut timer).await.unwrap();

        for stage in STAGE_NAMES {
            assert!(
                timer.durations().contains_key(stage),
                "missing stage {}",
                stage
            );
        }
        assert_eq!(object_store.len().await, 1);
        assert!(output.object_key.contains(&payload.job_id.to_string()));
        assert!(output.object_key.starts_with("renders/acct-1/"));
    }

    #[tokio::test]
    async fn test_stage_failure_aborts_remaining_stages() {
        let temp_dir = tempfile::tempdir().unwrap();
        let source = write_source(temp_dir.path());
        let provider = Arc::new(MockProvider::with_failures(vec![ProviderError::new(
            ProviderErrorKind::ContentPolicy,
            "flagged",
        )]));
        let pipeline = Pipeline::new(
            &AppConfig::default(),
            provider,
            Arc::new(MemoryObjectStore::new()),
        );

        let payload = payload(source);
        let mut timer = StageTimer::new(payload.job_id, payload.correlation_id);

        let error = pipeline.run(&payload, &mut timer).await.unwrap_err();
        assert_eq!(error.error_code(), "content_policy_violation");

        // The failed stage is timed; later stages never ran
        assert!(timer.durations().contains_key("generative_transform"));
        assert!(!timer.durations().contains_key("template_composition"));
        assert!(!timer.durations().contains_key("upload"));
    }

    #[tokio::test]
    async fn test_transient_failure_routes_to_fallback_model() {
        let temp_dir = tempfile::tempdir().unwrap();
        let source = write_source(temp_dir.path());
        let provider = Arc::new(MockProvider::with_failures(vec![ProviderError::new(
            ProviderErrorKind::ServerError,
            "503",
        )]));
        let pipeline = Pipeline::new(
            &AppConfig::default(),
            provider.clone(),
            Arc::new(MemoryObjectStore::new()),
        );

        let payload = payload(source);
        let mut timer = StageTimer::new(payload.job_id, payload.correlation_id);

        // Clothing has a fallback route; the second call succeeds within the
        // same attempt
        pipeline.run(&payload, &mut timer).await.unwrap();
        assert_eq!(provider.calls(), 2);
    }

    #[tokio::test]
    async fn test_upload_failure_is_retryable_storage_error() {
        let temp_dir = tempfile::tempdir().unwrap();
        let source = write_source(temp_dir.path());
        let pipeline = Pipeline::new(
            &AppConfig::default(),
            Arc::new(MockProvider::new()),
            Arc::new(FailingObjectStore),
        );

        let payload = payload(source);
        let mut timer = StageTimer::new(payload.job_id, payload.correlation_id);

        let error = pipeline.run(&payload, &mut timer).await.unwrap_err();
        assert_eq!(error.error_code(), "storage_error");
        assert!(timer.durations().contains_key("upload"));
    }

    #[tokio::test]
    async fn test_missing_source_is_invalid_input() {
        let pipeline = Pipeline::new(
            &AppConfig::default(),
            Arc::new(MockProvider::new()),
            Arc::new(MemoryObjectStore::new()),
        );

        let payload = payload(PathBuf::from("/nonexistent/source.png"));
        let mut timer = StageTimer::new(payload.job_id, payload.correlation_id);

        let error = pipeline.run(&payload, &mut timer).await.unwrap_err();
        assert_eq!(error.error_code(), "invalid_input");
    }
}
