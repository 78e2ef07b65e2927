//! Containerized execution of submitted code on Kubernetes.
//!
//! Each execution request (a container image plus shell commands) runs as
//! its own single-attempt Kubernetes Job. The runner waits for the Job's pod
//! to finish, returns the container's combined output verbatim and deletes
//! the Job afterwards. Executions are independent, so any number of them can
//! run concurrently from one [`KubeRunner`].
//!
//! # Usage
//!
//! ```no_run
//! use kube_ci::{CancellationToken, ExecutionId, ExecutionRequest, KubeRunner, RunnerConfig};
//!
//! # async fn example() -> anyhow::Result<()> {
//! let runner = KubeRunner::connect(RunnerConfig::from_env()?).await?;
//!
//! let request = ExecutionRequest::new("alpine:3.20", ["echo -n hello world"]);
//! let result = runner
//!     .run_job(&CancellationToken::new(), &request, &ExecutionId::new("ci0"))
//!     .await?;
//!
//! assert_eq!(result.output, "hello world");
//! # Ok(())
//! # }
//! ```
//!
//! # Architecture
//!
//! - [`builder`] turns a request into a Job manifest
//! - [`lifecycle`] submits the Job and waits for a terminal phase
//! - [`collector`] reads the pod's output
//! - [`reaper`] deletes Jobs (and optionally their namespaces)
//! - [`ClusterClient`] is the seam to the orchestrator; [`KubeCluster`] talks
//!   to a real cluster and, with the `test-util` feature, `FakeCluster`
//!   keeps everything in memory

#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod builder;
pub mod cluster;
pub mod collector;
pub mod config;
pub mod error;
pub mod lifecycle;
pub mod naming;
pub mod reaper;
pub mod request;
mod runner;

pub use builder::UnitSpec;
pub use cluster::{ClusterClient, ClusterError, KubeCluster};
#[cfg(any(test, feature = "test-util"))]
pub use cluster::{FakeCluster, Scenario};
pub use config::{NamespacePolicy, RunnerConfig};
pub use error::{ConfigError, ExecutionError};
pub use request::{ExecutionId, ExecutionRequest, ExecutionResult, Outcome};
pub use runner::KubeRunner;
pub use tokio_util::sync::CancellationToken;
