use std::fmt;
use thiserror::Error;

/// Unified error type for the process engine
#[derive(Debug, Error)]
pub enum EngineError {
    /// The execution tree reached a state that must never happen
    #[error("Engine fault: {message}")]
    EngineFault { message: String },

    /// Caller supplied bad input (unknown definition, wrong wait state, ...)
    #[error("Validation failed: {message}")]
    Validation {
        message: String,
        field: Option<String>,
    },

    /// A referenced entity does not exist
    #[error("{kind} not found: {id}")]
    NotFound { kind: &'static str, id: String },

    /// Another transaction modified or deleted the row first
    #[error("Optimistic lock conflict on {entity} {id} (expected revision {expected})")]
    OptimisticLockConflict {
        entity: &'static str,
        id: String,
        expected: u32,
    },

    /// A job handler raised an error
    #[error("Job {job_id} failed: {message}")]
    JobExecutionFailure {
        job_id: String,
        message: String,
        trace: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// Engine wiring problems (missing handler, missing session factory, bad config)
    #[error("Configuration error: {message}")]
    Configuration {
        message: String,
        field: Option<String>,
    },

    /// Anything else, tagged with the command that was running
    #[error("Internal error: {message}")]
    Internal {
        message: String,
        command: Option<String>,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },
}

impl EngineError {
    /// Create an engine fault
    pub fn fault<S: Into<String>>(message: S) -> Self {
        Self::EngineFault {
            message: message.into(),
        }
    }

    /// Create a validation error
    pub fn validation<S: Into<String>>(message: S) -> Self {
        Self::Validation {
            message: message.into(),
            field: None,
        }
    }

    /// Create a validation error with field
    pub fn validation_field<S: Into<String>, F: Into<String>>(message: S, field: F) -> Self {
        Self::Validation {
            message: message.into(),
            field: Some(field.into()),
        }
    }

    pub fn not_found<S: Into<String>>(kind: &'static str, id: S) -> Self {
        Self::NotFound {
            kind,
            id: id.into(),
        }
    }

    pub fn conflict<S: Into<String>>(entity: &'static str, id: S, expected: u32) -> Self {
        Self::OptimisticLockConflict {
            entity,
            id: id.into(),
            expected,
        }
    }

    /// Create a configuration error
    pub fn configuration<S: Into<String>>(message: S) -> Self {
        Self::Configuration {
            message: message.into(),
            field: None,
        }
    }

    /// Create a configuration error with field
    pub fn configuration_field<S: Into<String>, F: Into<String>>(message: S, field: F) -> Self {
        Self::Configuration {
            message: message.into(),
            field: Some(field.into()),
        }
    }

    /// Create an internal error
    pub fn internal<S: Into<String>>(message: S) -> Self {
        Self::Internal {
            message: message.into(),
            command: None,
            source: None,
        }
    }

    /// Create an internal error with source
    pub fn internal_with_source<S: Into<String>, E: std::error::Error + Send + Sync + 'static>(
        message: S,
        source: E,
    ) -> Self {
        Self::Internal {
            message: message.into(),
            command: None,
            source: Some(Box::new(source)),
        }
    }

    /// Wrap a handler error as a job failure, keeping the full cause chain as trace
    pub fn job_failure<S: Into<String>>(job_id: S, error: anyhow::Error) -> Self {
        Self::JobExecutionFailure {
            job_id: job_id.into(),
            message: error.to_string(),
            trace: format!("{:?}", error),
            source: Some(error.into()),
        }
    }

    /// Record the failing command on internal errors that do not carry one yet
    pub fn in_command(mut self, name: &str) -> Self {
        if let Self::Internal { ref mut command, .. } = self {
            if command.is_none() {
                *command = Some(name.to_string());
            }
        }
        self
    }

    /// Command that was running when an internal error was raised
    pub fn command(&self) -> Option<&str> {
        match self {
            Self::Internal { command, .. } => command.as_deref(),
            _ => None,
        }
    }

    /// Check if the error is retryable
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::OptimisticLockConflict { .. } | Self::JobExecutionFailure { .. } | Self::Internal { .. }
        )
    }

    /// Check if the error reports a broken engine invariant
    pub fn is_fault(&self) -> bool {
        matches!(self, Self::EngineFault { .. })
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::OptimisticLockConflict { .. })
    }

    /// Get error category for metrics/logging
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::EngineFault { .. } => ErrorCategory::Fault,
            Self::Validation { .. } | Self::NotFound { .. } => ErrorCategory::Caller,
            Self::OptimisticLockConflict { .. } => ErrorCategory::Concurrency,
            Self::JobExecutionFailure { .. } => ErrorCategory::Job,
            Self::Configuration { .. } => ErrorCategory::Configuration,
            Self::Internal { .. } => ErrorCategory::Internal,
        }
    }

    /// Full trace for stacktrace storage. Job failures keep the trace captured at
    /// the handler boundary; everything else walks the source chain.
    pub fn trace(&self) -> String {
        match self {
            Self::JobExecutionFailure { trace, .. } => trace.clone(),
            other => error_chain(other),
        }
    }
}

/// Render an error and all its sources, one per line
pub fn error_chain(error: &(dyn std::error::Error + 'static)) -> String {
    let mut out = error.to_string();
    let mut current = error.source();
    if current.is_some() {
        out.push_str("\n\nCaused by:");
    }
    let mut depth = 0;
    while let Some(cause) = current {
        out.push_str(&format!("\n    {}: {}", depth, cause));
        depth += 1;
        current = cause.source();
    }
    out
}

/// Error categories for metrics and logging
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCategory {
    Fault,
    Caller,
    Concurrency,
    Job,
    Configuration,
    Internal,
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Fault => write!(f, "fault"),
            Self::Caller => write!(f, "caller"),
            Self::Concurrency => write!(f, "concurrency"),
            Self::Job => write!(f, "job"),
            Self::Configuration => write!(f, "configuration"),
            Self::Internal => write!(f, "internal"),
        }
    }
}

/// Result type alias for the engine
pub type Result<T> = std::result::Result<T, EngineError>;

/// Errors returned by user handlers keep their engine kind when they are one of ours
impl From<anyhow::Error> for EngineError {
    fn from(err: anyhow::Error) -> Self {
        match err.downcast::<EngineError>() {
            Ok(engine_error) => engine_error,
            Err(other) => Self::Internal {
                message: other.to_string(),
                command: None,
                source: Some(other.into()),
            },
        }
    }
}

impl From<serde_yaml::Error> for EngineError {
    fn from(err: serde_yaml::Error) -> Self {
        Self::Configuration {
            message: format!("invalid YAML configuration: {}", err),
            field: None,
        }
    }
}

impl From<serde_json::Error> for EngineError {
    fn from(err: serde_json::Error) -> Self {
        Self::internal_with_source("JSON serialization failed", err)
    }
}

impl From<std::io::Error> for EngineError {
    fn from(err: std::io::Error) -> Self {
        Self::internal_with_source("IO operation failed", err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_creation() {
        let err = EngineError::not_found("Execution", "abc");
        assert_eq!(err.to_string(), "Execution not found: abc");
        assert_eq!(err.category(), ErrorCategory::Caller);
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_in_command_only_tags_internal_once() {
        let err = EngineError::internal("boom").in_command("StartProcessInstance");
        assert_eq!(err.command(), Some("StartProcessInstance"));

        let err = err.in_command("Other");
        assert_eq!(err.command(), Some("StartProcessInstance"));

        let fault = EngineError::fault("bad tree").in_command("CompleteTask");
        assert_eq!(fault.command(), None);
        assert!(fault.is_fault());
    }

    #[test]
    fn test_anyhow_roundtrip_keeps_engine_kind() {
        let original: anyhow::Error = EngineError::conflict("Job", "j1", 3).into();
        let back = EngineError::from(original);
        assert!(back.is_conflict());

        let foreign = anyhow::anyhow!("database offline");
        let wrapped = EngineError::from(foreign);
        assert_eq!(wrapped.category(), ErrorCategory::Internal);
        assert!(wrapped.to_string().contains("database offline"));
    }

    #[test]
    fn test_job_failure_keeps_cause_chain() {
        let err = anyhow::anyhow!("connection refused").context("calling billing service");
        let failure = EngineError::job_failure("job-1", err);
        assert!(failure.is_retryable());
        assert_eq!(failure.to_string(), "Job job-1 failed: calling billing service");
        assert!(failure.trace().contains("connection refused"));
    }

    #[test]
    fn test_error_chain_lists_sources() {
        let io = std::io::Error::new(std::io::ErrorKind::Other, "disk full");
        let err = EngineError::internal_with_source("flush failed", io);
        let chain = error_chain(&err);
        assert!(chain.starts_with("Internal error: flush failed"));
        assert!(chain.contains("0: disk full"));
    }
}
