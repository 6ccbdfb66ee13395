//! Logging configuration and initialization

use crate::error::{PipelineError, Result};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Initialize the logging system
pub fn init_logging() -> Result<()> {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    match tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer())
        .try_init()
    {
        Ok(()) => Ok(()),
        Err(e) => {
            // A second init (tests, embedding binaries) is fine
            let error_msg = e.to_string();
            if error_msg.contains("a global default trace dispatcher has already been set") {
                Ok(())
            } else {
                Err(PipelineError::LoggingError {
                    message: format!("Failed to initialize logging: {}", e),
                })
            }
        }
    }
}
