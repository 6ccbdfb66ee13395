//! Error types for the job pipeline

/// Main error type for job admission and pipeline processing
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid input: {message}")]
    InvalidInput { message: String },

    #[error("Bad image: {message}")]
    BadImage { message: String },

    #[error("Content policy violation: {message}")]
    ContentPolicyViolation { message: String },

    #[error("Transient provider failure: {message}")]
    ProviderTransient { message: String },

    #[error("Storage error: {message}")]
    Storage { message: String },

    #[error("Insufficient credits for account {account_id}")]
    InsufficientCredits { account_id: String },

    #[error("Configuration error: {message}")]
    ConfigError { message: String },

    #[error("Logging initialization failed: {message}")]
    LoggingError { message: String },

    #[error("Timeout occurred during operation")]
    Timeout,

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Internal error: {message}")]
    Internal { message: String },
}

impl PipelineError {
    /// Get the stable error code persisted in job records and dead letters
    pub fn error_code(&self) -> &'static str {
        match self {
            PipelineError::Io(_) => "io_error",
            PipelineError::InvalidInput { .. } => "invalid_input",
            PipelineError::BadImage { .. } => "bad_image",
            PipelineError::ContentPolicyViolation { .. } => "content_policy_violation",
            PipelineError::ProviderTransient { .. } => "provider_transient",
            PipelineError::Storage { .. } => "storage_error",
            PipelineError::InsufficientCredits { .. } => "insufficient_credits",
            PipelineError::ConfigError { .. } => "config_error",
            PipelineError::LoggingError { .. } => "logging_error",
            PipelineError::Timeout => "timeout",
            PipelineError::Database(_) => "database_error",
            PipelineError::Serialization(_) => "serialization_error",
            PipelineError::Internal { .. } => "internal_error",
        }
    }

    /// Internal-error constructor for unexpected conditions
    pub fn internal(message: impl Into<String>) -> Self {
        PipelineError::Internal {
            message: message.into(),
        }
    }
}

/// Result type alias for convenience
pub type Result<T> = std::result::Result<T, PipelineError>;
