//! Error types for the execution subsystem.
//!
//! Every failure that reaches a caller is one of the [`ExecutionError`]
//! variants. Raw `kube` errors are mapped to [`crate::cluster::ClusterError`]
//! by the cluster adapter and classified here before they leave the crate.

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

/// Classified failure of a single execution.
#[derive(Debug, Error)]
pub enum ExecutionError {
    /// The request or identifier cannot be turned into a compute unit.
    #[error("invalid execution spec: {0}")]
    InvalidSpec(String),

    /// The orchestrator could not place or start the unit (bad image, quota).
    #[error("compute unit {name} could not be scheduled: {reason}")]
    SchedulingFailed { name: String, reason: String },

    /// No terminal phase was observed before the deadline.
    #[error("execution {name} did not finish within {timeout:?}")]
    ExecutionTimeout { name: String, timeout: Duration },

    /// The caller canceled the execution.
    #[error("execution {name} was canceled")]
    Canceled { name: String },

    /// The unit reached a terminal phase but its output could not be read.
    #[error("logs for {name} are unavailable: {reason}")]
    LogUnavailable { name: String, reason: String },

    /// Removing the unit failed.
    #[error("failed to delete {namespace}/{name}: {reason}")]
    DeleteFailed {
        namespace: String,
        name: String,
        reason: String,
    },

    /// An object with the same name is still present in the cluster.
    #[error("compute unit {namespace}/{name} already exists")]
    AlreadyExists { namespace: String, name: String },

    /// The orchestrator API could not be reached or kept failing.
    #[error("cluster unavailable during {operation}: {reason}")]
    ClusterUnavailable {
        operation: &'static str,
        reason: String,
    },
}

impl ExecutionError {
    /// Stable identifier of the failure class, suitable for build logs.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::InvalidSpec(_) => "invalid_spec",
            Self::SchedulingFailed { .. } => "scheduling_failed",
            Self::ExecutionTimeout { .. } => "execution_timeout",
            Self::Canceled { .. } => "canceled",
            Self::LogUnavailable { .. } => "log_unavailable",
            Self::DeleteFailed { .. } => "delete_failed",
            Self::AlreadyExists { .. } => "already_exists",
            Self::ClusterUnavailable { .. } => "cluster_unavailable",
        }
    }

    /// Whether resubmitting the same request could reasonably succeed.
    ///
    /// Caller input errors (bad image, bad identifier) are never retryable.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::ExecutionTimeout { .. }
                | Self::AlreadyExists { .. }
                | Self::ClusterUnavailable { .. }
        )
    }
}

/// Result alias used throughout the crate.
pub type Result<T, E = ExecutionError> = std::result::Result<T, E>;

/// Errors raised while loading configuration or building a cluster client.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config YAML: {0}")]
    Parse(#[from] serde_yaml::Error),

    #[error("invalid value {value:?} for environment variable {var}")]
    Env { var: &'static str, value: String },

    #[error("invalid configuration: {0}")]
    Invalid(String),

    #[error("kubeconfig error: {0}")]
    Kubeconfig(String),
}
