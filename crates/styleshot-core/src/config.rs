//! Configuration management for the job service

use crate::error::{PipelineError, Result};
use crate::models::JobPriority;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;

/// Main application configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct AppConfig {
    pub queue: QueueConfig,
    pub worker: WorkerConfig,
    pub credits: CreditsConfig,
    pub provider: ProviderConfig,
    pub storage: StorageConfig,
    pub pipeline: PipelineConfig,
    pub logging: LoggingConfig,
}

/// Queue and retry configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueConfig {
    /// Attempts allowed per job before forced dead-letter
    pub max_attempts: u32,
    /// Escalating re-delivery delays; attempts past the end clamp to the last entry
    pub backoff_table_ms: Vec<u64>,
    /// Upper bound of the random jitter added to each backoff delay
    pub jitter_ms: u64,
    /// Every Nth delivery takes the globally oldest payload regardless of class
    pub fair_share_interval: u64,
    pub priority_weights: PriorityWeights,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff_table_ms: vec![1_000, 2_000, 5_000],
            jitter_ms: 500,
            fair_share_interval: 8,
            priority_weights: PriorityWeights::default(),
        }
    }
}

/// Priority-to-numeric-weight mapping; lower weight is delivered first
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct PriorityWeights {
    pub high: u8,
    pub normal: u8,
    pub low: u8,
}

impl PriorityWeights {
    pub fn weight(&self, priority: JobPriority) -> u8 {
        match priority {
            JobPriority::High => self.high,
            JobPriority::Normal => self.normal,
            JobPriority::Low => self.low,
        }
    }
}

impl Default for PriorityWeights {
    fn default() -> Self {
        Self {
            high: 0,
            normal: 1,
            low: 2,
        }
    }
}

/// Worker pool configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerConfig {
    pub concurrency: usize,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            concurrency: num_cpus::get().clamp(1, 5),
        }
    }
}

/// Credit pricing consumed at admission
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreditsConfig {
    pub cost_per_job: i64,
}

impl Default for CreditsConfig {
    fn default() -> Self {
        Self { cost_per_job: 1 }
    }
}

/// Generative provider configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderConfig {
    /// Bounded timeout applied to each provider attempt
    pub timeout_ms: u64,
    /// Per-category model routing
    pub routes: HashMap<String, ModelRoute>,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        let mut routes = HashMap::new();
        routes.insert(
            "clothing".to_string(),
            ModelRoute::new("studio-v2", Some("studio-v1"), Some("studio-v2-hd")),
        );
        routes.insert(
            "portrait".to_string(),
            ModelRoute::new("portrait-v3", Some("portrait-v2"), Some("portrait-v3-hd")),
        );
        routes.insert(
            "product".to_string(),
            ModelRoute::new("product-v1", None, None),
        );
        routes.insert(
            "pet".to_string(),
            ModelRoute::new("portrait-v3", Some("portrait-v2"), None),
        );
        Self {
            timeout_ms: 30_000,
            routes,
        }
    }
}

/// Primary/fallback model pair for one category
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelRoute {
    pub primary: String,
    pub fallback: Option<String>,
    /// Model used instead of `primary` for HD render mode
    pub hd: Option<String>,
}

impl ModelRoute {
    pub fn new(primary: &str, fallback: Option<&str>, hd: Option<&str>) -> Self {
        Self {
            primary: primary.to_string(),
            fallback: fallback.map(str::to_string),
            hd: hd.map(str::to_string),
        }
    }
}

/// Object storage configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Leading segment of every object key
    pub namespace: String,
    /// Root directory of the local object store
    pub root: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        let base_dir = dirs::cache_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("styleshot");
        Self {
            namespace: "renders".to_string(),
            root: base_dir.join("objects"),
        }
    }
}

/// Image pipeline tuning
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Version segment of the upload key scheme
    pub version: u32,
    /// Square/landscape sources are capped at this dimension; never upscaled
    pub max_dimension: u32,
    /// Portrait sources are fixed to this aspect ratio (width, height)
    pub portrait_aspect: (u32, u32),
    pub denoise: bool,
    pub mask: MaskConfig,
    pub compression: CompressionConfig,
    pub watermark: WatermarkConfig,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            version: 1,
            max_dimension: 1024,
            portrait_aspect: (4, 5),
            denoise: true,
            mask: MaskConfig::default(),
            compression: CompressionConfig::default(),
            watermark: WatermarkConfig::default(),
        }
    }
}

/// Mask post-processing tuning
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MaskConfig {
    /// Pixel radius the mask edge is shrunk by before feathering
    pub erode_radius: u32,
    /// Gaussian sigma used to soften the eroded mask edge
    pub feather_sigma: f32,
}

impl Default for MaskConfig {
    fn default() -> Self {
        Self {
            erode_radius: 2,
            feather_sigma: 1.5,
        }
    }
}

/// Compression search tuning
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompressionConfig {
    /// Target output size in bytes
    pub target_bytes: usize,
    pub start_quality: u8,
    /// Floor below which the search never encodes
    pub min_quality: u8,
    pub quality_step: u8,
}

impl Default for CompressionConfig {
    fn default() -> Self {
        Self {
            target_bytes: 300 * 1024,
            start_quality: 90,
            min_quality: 40,
            quality_step: 10,
        }
    }
}

/// Watermark tuning
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WatermarkConfig {
    pub text: String,
    pub opacity: f32,
    /// Mark width relative to image width
    pub scale: f32,
    /// Margin from the anchored corner in pixels
    pub margin: u32,
}

impl Default for WatermarkConfig {
    fn default() -> Self {
        Self {
            text: "styleshot".to_string(),
            opacity: 0.6,
            scale: 0.25,
            margin: 24,
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    pub level: String,
    pub structured: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            structured: true,
        }
    }
}

/// Configuration manager
pub struct ConfigManager {
    config_path: PathBuf,
    config: AppConfig,
}

impl ConfigManager {
    /// Create a new configuration manager using the platform config path
    pub fn new() -> Result<Self> {
        let config_path = Self::default_config_path()?;
        let config = Self::load_or_create_config(&config_path)?;

        Ok(Self {
            config_path,
            config,
        })
    }

    /// Create a configuration manager with a custom path
    pub fn with_path(config_path: PathBuf) -> Result<Self> {
        let config = Self::load_or_create_config(&config_path)?;

        Ok(Self {
            config_path,
            config,
        })
    }

    /// Get the current configuration
    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    /// Update the configuration
    pub fn update_config(&mut self, config: AppConfig) -> Result<()> {
        self.config = config;
        self.save()
    }

    /// Save the current configuration to disk
    pub fn save(&self) -> Result<()> {
        if let Some(parent) = self.config_path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| PipelineError::ConfigError {
                message: format!("Failed to create config directory: {}", e),
            })?;
        }

        let config_str =
            toml::to_string_pretty(&self.config).map_err(|e| PipelineError::ConfigError {
                message: format!("Failed to serialize config: {}", e),
            })?;

        std::fs::write(&self.config_path, config_str).map_err(|e| PipelineError::ConfigError {
            message: format!("Failed to write config file: {}", e),
        })?;

        tracing::info!("Configuration saved to {:?}", self.config_path);
        Ok(())
    }

    /// Get the default configuration file path
    fn default_config_path() -> Result<PathBuf> {
        let config_dir = dirs::config_dir()
            .ok_or_else(|| PipelineError::ConfigError {
                message: "Could not determine config directory".to_string(),
            })?
            .join("styleshot");

        Ok(config_dir.join("config.toml"))
    }

    /// Load configuration from file or fall back to defaults
    fn load_or_create_config(path: &PathBuf) -> Result<AppConfig> {
        if path.exists() {
            let config_str =
                std::fs::read_to_string(path).map_err(|e| PipelineError::ConfigError {
                    message: format!("Failed to read config file: {}", e),
                })?;

            let config: AppConfig =
                toml::from_str(&config_str).map_err(|e| PipelineError::ConfigError {
                    message: format!("Failed to parse config file: {}", e),
                })?;

            tracing::info!("Configuration loaded from {:?}", path);
            Ok(config)
        } else {
            tracing::info!("Using default configuration");
            Ok(AppConfig::default())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_default_configs() {
        let config = AppConfig::default();
        assert_eq!(config.queue.max_attempts, 3);
        assert_eq!(config.queue.backoff_table_ms, vec![1_000, 2_000, 5_000]);
        assert!(config.worker.concurrency >= 1 && config.worker.concurrency <= 5);
        assert_eq!(config.pipeline.compression.target_bytes, 300 * 1024);
        assert!(config.provider.routes.contains_key("clothing"));
    }

    #[test]
    fn test_priority_weight_mapping() {
        let weights = PriorityWeights::default();
        assert!(weights.weight(JobPriority::High) < weights.weight(JobPriority::Normal));
        assert!(weights.weight(JobPriority::Normal) < weights.weight(JobPriority::Low));
    }

    #[test]
    fn test_config_save_and_load() {
        let temp_dir = tempdir().unwrap();
        let config_path = temp_dir.path().join("test_config.toml");

        let mut manager = ConfigManager::with_path(config_path.clone()).unwrap();
        let mut config = manager.config().clone();
        config.queue.max_attempts = 5;
        config.pipeline.compression.min_quality = 30;

        manager.update_config(config).unwrap();

        let manager2 = ConfigManager::with_path(config_path).unwrap();
        assert_eq!(manager2.config().queue.max_attempts, 5);
        assert_eq!(manager2.config().pipeline.compression.min_quality, 30);
    }

    #[test]
    fn test_config_round_trips_through_toml() {
        let config = AppConfig::default();
        let serialized = toml::to_string_pretty(&config).unwrap();
        let parsed: AppConfig = toml::from_str(&serialized).unwrap();
        assert_eq!(parsed.queue.max_attempts, config.queue.max_attempts);
        assert_eq!(
            parsed.pipeline.portrait_aspect,
            config.pipeline.portrait_aspect
        );
    }
}
