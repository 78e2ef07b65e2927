//! Access to the orchestrator.
//!
//! The execution pipeline only talks to the cluster through [`ClusterClient`].
//! [`KubeCluster`] implements it on top of a `kube::Client`. With the
//! `test-util` feature, `FakeCluster` is an in-memory implementation for
//! tests.

#[cfg(any(test, feature = "test-util"))]
pub mod fake;
pub mod k8s;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::builder::UnitSpec;

#[cfg(any(test, feature = "test-util"))]
pub use fake::{FakeCluster, Scenario};
pub use k8s::KubeCluster;

/// Failure reported by a cluster adapter.
///
/// Adapters translate their library's errors into these classes so the
/// pipeline can classify them without seeing the underlying client.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ClusterError {
    #[error("{0} not found")]
    NotFound(String),

    #[error("{0} already exists")]
    AlreadyExists(String),

    #[error("API error {code}: {message}")]
    Api { code: u16, message: String },

    #[error("transport error: {0}")]
    Transport(String),
}

/// Phase of a compute unit as observed from the orchestrator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum UnitPhase {
    Pending,
    Running,
    Succeeded,
    Failed,
    /// The unit can never start (image pull failure, unschedulable)
    SchedulingFailed,
}

impl UnitPhase {
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::Succeeded | Self::Failed | Self::SchedulingFailed
        )
    }

    /// Position in the `Pending → Running → terminal` progression.
    #[must_use]
    pub fn rank(self) -> u8 {
        match self {
            Self::Pending => 0,
            Self::Running => 1,
            Self::Succeeded | Self::Failed | Self::SchedulingFailed => 2,
        }
    }

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "Pending",
            Self::Running => "Running",
            Self::Succeeded => "Succeeded",
            Self::Failed => "Failed",
            Self::SchedulingFailed => "SchedulingFailed",
        }
    }
}

impl std::fmt::Display for UnitPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Snapshot of a unit's status.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnitStatus {
    pub phase: UnitPhase,
    /// Machine-readable reason reported with the phase, if any
    pub reason: Option<String>,
    /// Exit code of the runner container once it terminated
    pub exit_code: Option<i32>,
}

impl UnitStatus {
    #[must_use]
    pub fn new(phase: UnitPhase) -> Self {
        Self {
            phase,
            reason: None,
            exit_code: None,
        }
    }

    #[must_use]
    pub fn with_reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self
    }

    #[must_use]
    pub fn with_exit_code(mut self, exit_code: i32) -> Self {
        self.exit_code = Some(exit_code);
        self
    }
}

/// Operations the execution pipeline needs from the orchestrator.
///
/// Implementations must be safe for concurrent use: many executions share
/// one client, each touching only its own namespace/name.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ClusterClient: Send + Sync {
    /// Create the namespace if it does not exist yet. Idempotent.
    async fn ensure_namespace(&self, namespace: &str) -> Result<(), ClusterError>;

    /// Submit the unit. Fails with `AlreadyExists` if the name is taken.
    async fn create_unit(&self, spec: &UnitSpec) -> Result<(), ClusterError>;

    /// Current status of the unit.
    async fn unit_status(&self, namespace: &str, name: &str) -> Result<UnitStatus, ClusterError>;

    /// Captured output of the unit's runner container.
    async fn read_logs(&self, namespace: &str, name: &str) -> Result<String, ClusterError>;

    /// Delete the unit and everything it owns.
    async fn delete_unit(&self, namespace: &str, name: &str) -> Result<(), ClusterError>;

    /// Delete a namespace.
    async fn delete_namespace(&self, namespace: &str) -> Result<(), ClusterError>;
}
