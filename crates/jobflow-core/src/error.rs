//! Error types shared across the Jobflow crates.

/// Unified error type.
#[derive(Debug, thiserror::Error)]
pub enum JobflowError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid request: {0}")]
    Invalid(String),

    #[error("Store error: {0}")]
    Store(String),

    #[error("Task error: {0}")]
    Task(String),

    #[error("Step error: {0}")]
    Step(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("Timed out: {0}")]
    Timeout(String),

    #[error("HTTP error: {0}")]
    Http(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("{0}")]
    Other(String),
}

impl JobflowError {
    /// Shorthand for step failures raised by workflow steps.
    pub fn step(msg: impl Into<String>) -> Self {
        Self::Step(msg.into())
    }

    /// Shorthand for task failures raised by scheduled tasks.
    pub fn task(msg: impl Into<String>) -> Self {
        Self::Task(msg.into())
    }
}

pub type Result<T> = std::result::Result<T, JobflowError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_prefixes() {
        let err = JobflowError::NotFound("job 7".into());
        assert_eq!(err.to_string(), "Not found: job 7");
        assert_eq!(JobflowError::step("boom").to_string(), "Step error: boom");
    }

    #[test]
    fn test_from_json_error() {
        let parse: std::result::Result<serde_json::Value, _> = serde_json::from_str("{bad");
        let err: JobflowError = parse.unwrap_err().into();
        assert!(matches!(err, JobflowError::Json(_)));
    }
}
