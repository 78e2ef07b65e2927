//! Output collection.
//!
//! Reads the captured stdout/stderr of a terminal unit's runner container.
//! The output is returned exactly as the container produced it.

use std::time::Duration;

use tracing::{debug, warn};

use crate::builder::UnitSpec;
use crate::cluster::{ClusterClient, ClusterError};
use crate::error::{ExecutionError, Result};

/// Attempts for a log read that fails with a transient error.
const LOG_READ_ATTEMPTS: u32 = 3;
const LOG_RETRY_DELAY: Duration = Duration::from_millis(200);

/// Read the output of a unit that reached `Succeeded` or `Failed`.
///
/// Transport and server errors are retried a few times; a unit or pod that
/// no longer exists is not.
///
/// # Errors
/// Returns `ExecutionError::LogUnavailable` when the logs cannot be read.
pub async fn collect(cluster: &dyn ClusterClient, spec: &UnitSpec) -> Result<String> {
    let mut attempt = 1;
    loop {
        match cluster.read_logs(&spec.namespace, &spec.name).await {
            Ok(output) => {
                debug!(
                    namespace = %spec.namespace,
                    name = %spec.name,
                    bytes = output.len(),
                    "Collected output"
                );
                return Ok(output);
            }
            Err(ClusterError::NotFound(what)) => {
                return Err(ExecutionError::LogUnavailable {
                    name: spec.name.clone(),
                    reason: format!("{what} no longer exists"),
                });
            }
            Err(e) if attempt < LOG_READ_ATTEMPTS && is_transient(&e) => {
                warn!(
                    name = %spec.name,
                    attempt,
                    error = %e,
                    "Log read failed, retrying"
                );
                attempt += 1;
                tokio::time::sleep(LOG_RETRY_DELAY).await;
            }
            Err(e) => {
                return Err(ExecutionError::LogUnavailable {
                    name: spec.name.clone(),
                    reason: e.to_string(),
                });
            }
        }
    }
}

fn is_transient(err: &ClusterError) -> bool {
    match err {
        ClusterError::Transport(_) => true,
        ClusterError::Api { code, .. } => *code >= 500 || *code == 429,
        ClusterError::NotFound(_) | ClusterError::AlreadyExists(_) => false,
    }
}
