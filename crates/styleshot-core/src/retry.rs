//! Failure classification driving the broker's requeue/dead-letter decision

use crate::error::PipelineError;

/// Outcome of classifying one failure instance. Never persisted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FailureClassification {
    pub retryable: bool,
    pub code: &'static str,
}

/// Classify a stage failure as retryable or permanent.
///
/// Rules, in order:
/// 1. errors tagged non-retryable (validation, policy, malformed input,
///    insufficient credits) fail fast so the refund is not delayed;
/// 2. an exhausted attempt budget is permanent regardless of the error;
/// 3. everything else is retryable.
pub fn classify(
    error: &PipelineError,
    attempts_made: u32,
    max_attempts: u32,
) -> FailureClassification {
    let code = error.error_code();

    if !is_retryable_kind(error) {
        return FailureClassification {
            retryable: false,
            code,
        };
    }

    if attempts_made >= max_attempts {
        return FailureClassification {
            retryable: false,
            code,
        };
    }

    FailureClassification {
        retryable: true,
        code,
    }
}

fn is_retryable_kind(error: &PipelineError) -> bool {
    match error {
        PipelineError::InvalidInput { .. }
        | PipelineError::BadImage { .. }
        | PipelineError::ContentPolicyViolation { .. }
        | PipelineError::InsufficientCredits { .. }
        | PipelineError::ConfigError { .. }
        | PipelineError::LoggingError { .. }
        | PipelineError::Serialization(_) => false,
        PipelineError::ProviderTransient { .. }
        | PipelineError::Storage { .. }
        | PipelineError::Timeout
        | PipelineError::Io(_)
        | PipelineError::Database(_)
        | PipelineError::Internal { .. } => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_non_retryable_tags_fail_fast() {
        let error = PipelineError::ContentPolicyViolation {
            message: "flagged".to_string(),
        };
        let classification = classify(&error, 1, 3);
        assert!(!classification.retryable);
        assert_eq!(classification.code, "content_policy_violation");

        let error = PipelineError::BadImage {
            message: "truncated".to_string(),
        };
        assert!(!classify(&error, 1, 3).retryable);
    }

    #[test]
    fn test_transient_errors_retry_within_budget() {
        let error = PipelineError::ProviderTransient {
            message: "upstream 503".to_string(),
        };
        assert!(classify(&error, 1, 3).retryable);
        assert!(classify(&error, 2, 3).retryable);
    }

    #[test]
    fn test_exhausted_budget_is_permanent() {
        let error = PipelineError::ProviderTransient {
            message: "upstream 503".to_string(),
        };
        let classification = classify(&error, 3, 3);
        assert!(!classification.retryable);
        assert_eq!(classification.code, "provider_transient");
    }

    #[test]
    fn test_internal_errors_retry_then_exhaust() {
        let error = PipelineError::internal("index out of range");
        assert!(classify(&error, 1, 3).retryable);
        assert!(!classify(&error, 3, 3).retryable);
    }
}
