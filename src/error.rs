//! Error taxonomy for the execution pipeline.
//!
//! Every stage reports one of these kinds. The orchestrator never lets them
//! escape: each is turned into a terminal `ExecutionResult` with the status
//! tag returned by [`ExecutionError::status`].

use std::time::Duration;

use thiserror::Error;

/// Output captured before a stage failed. Returned to the caller best-effort.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PartialOutput {
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
}

impl PartialOutput {
    pub fn new(stdout: impl Into<Vec<u8>>, stderr: impl Into<Vec<u8>>) -> Self {
        Self {
            stdout: stdout.into(),
            stderr: stderr.into(),
        }
    }
}

/// A stage-level failure of one execution.
#[derive(Debug, Error)]
pub enum ExecutionError {
    /// The sandbox instance could not be created.
    #[error("provisioning failed: {0}")]
    Provisioning(String),

    /// The submission could not be written into the instance.
    #[error("injection failed: {0}")]
    Injection(String),

    /// The run command could not be launched.
    #[error("start failed: {0}")]
    Start(String),

    /// The run exceeded its wall-clock bound and was killed.
    #[error("execution timed out after {:?}", .after)]
    Timeout {
        after: Duration,
        partial: PartialOutput,
    },

    /// Waiting for termination or fetching output failed.
    #[error("wait failed: {message}")]
    Wait {
        message: String,
        partial: PartialOutput,
    },

    /// The execution record emitted by the wrapper was malformed.
    #[error("malformed execution record: {message}")]
    RecordParse {
        message: String,
        partial: PartialOutput,
    },

    /// No admission permit became available within the queue bound.
    #[error("too many concurrent executions (waited {:?})", .waited)]
    Overloaded { waited: Duration },
}

impl ExecutionError {
    /// Short machine-readable tag used as the response `status`.
    pub const fn status(&self) -> &'static str {
        match self {
            Self::Provisioning(_) => "provisioning_error",
            Self::Injection(_) => "injection_error",
            Self::Start(_) => "start_error",
            Self::Timeout { .. } => "timeout",
            Self::Wait { .. } => "wait_error",
            Self::RecordParse { .. } => "record_parse_error",
            Self::Overloaded { .. } => "overloaded",
        }
    }

    /// Output captured before the failure, if the stage got that far.
    pub fn partial_output(&self) -> Option<&PartialOutput> {
        match self {
            Self::Timeout { partial, .. }
            | Self::Wait { partial, .. }
            | Self::RecordParse { partial, .. } => Some(partial),
            _ => None,
        }
    }
}

/// A request document that does not satisfy the request schema.
#[derive(Debug, Error)]
pub enum RequestError {
    #[error("malformed request: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error("code is {size} bytes, limit is {limit}")]
    TooLarge { size: usize, limit: usize },
}

impl RequestError {
    pub const fn status(&self) -> &'static str {
        "invalid_request"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_tags_are_distinct() {
        let errors = [
            ExecutionError::Provisioning("x".into()),
            ExecutionError::Injection("x".into()),
            ExecutionError::Start("x".into()),
            ExecutionError::Timeout {
                after: Duration::from_secs(1),
                partial: PartialOutput::default(),
            },
            ExecutionError::Wait {
                message: "x".into(),
                partial: PartialOutput::default(),
            },
            ExecutionError::RecordParse {
                message: "x".into(),
                partial: PartialOutput::default(),
            },
            ExecutionError::Overloaded {
                waited: Duration::from_secs(1),
            },
        ];
        let mut tags: Vec<_> = errors.iter().map(ExecutionError::status).collect();
        tags.sort_unstable();
        tags.dedup();
        assert_eq!(tags.len(), errors.len());
        assert!(!tags.contains(&"ok"));
    }

    #[test]
    fn partial_output_only_for_late_stages() {
        let timeout = ExecutionError::Timeout {
            after: Duration::from_secs(2),
            partial: PartialOutput::new("tick\n", ""),
        };
        assert_eq!(timeout.partial_output().unwrap().stdout, b"tick\n");
        assert!(ExecutionError::Start("spawn".into())
            .partial_output()
            .is_none());
    }
}
