//! Execution entry points.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument, warn, Instrument};

use crate::builder;
use crate::cluster::{ClusterClient, KubeCluster};
use crate::collector;
use crate::config::RunnerConfig;
use crate::error::{ConfigError, ExecutionError, Result};
use crate::lifecycle::LifecycleController;
use crate::naming::resource_name;
use crate::reaper::Reaper;
use crate::request::{ExecutionId, ExecutionRequest, ExecutionResult};

/// Runs execution requests as Kubernetes Jobs.
///
/// Cheap to clone; clones share the cluster client. The runner keeps no
/// per-execution state, so any number of executions may run at once as long
/// as their identifiers differ.
#[derive(Clone)]
pub struct KubeRunner {
    cluster: Arc<dyn ClusterClient>,
    config: Arc<RunnerConfig>,
}

impl KubeRunner {
    #[must_use]
    pub fn new(cluster: Arc<dyn ClusterClient>, config: RunnerConfig) -> Self {
        Self {
            cluster,
            config: Arc::new(config),
        }
    }

    /// Validate `config` and connect to the cluster it describes.
    ///
    /// # Errors
    /// Returns `ConfigError` for invalid settings or an unusable kubeconfig.
    pub async fn connect(config: RunnerConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        let cluster = KubeCluster::from_config(&config).await?;
        Ok(Self::new(Arc::new(cluster), config))
    }

    #[must_use]
    pub fn config(&self) -> &RunnerConfig {
        &self.config
    }

    /// Run one request to completion within the configured timeout.
    ///
    /// # Errors
    /// Returns the classified `ExecutionError` of the first step that failed.
    pub async fn run_job(
        &self,
        cancel: &CancellationToken,
        request: &ExecutionRequest,
        execution_id: &ExecutionId,
    ) -> Result<ExecutionResult> {
        let timeout = self.config.timeout();
        let deadline = Instant::now().checked_add(timeout).ok_or_else(|| {
            ExecutionError::InvalidSpec(format!("timeout of {timeout:?} is out of range"))
        })?;
        self.execute(cancel, request, execution_id, deadline, timeout).await
    }

    /// Run one request to completion before `deadline`.
    ///
    /// Submits the unit, waits for it to finish, collects its output and
    /// deletes it. A failed cleanup is logged and never replaces the result.
    ///
    /// # Errors
    /// Returns the classified `ExecutionError` of the first step that failed.
    pub async fn run_job_with_deadline(
        &self,
        cancel: &CancellationToken,
        request: &ExecutionRequest,
        execution_id: &ExecutionId,
        deadline: Instant,
    ) -> Result<ExecutionResult> {
        let timeout = deadline.saturating_duration_since(Instant::now());
        self.execute(cancel, request, execution_id, deadline, timeout).await
    }

    #[instrument(
        skip(self, cancel, request, deadline),
        fields(image = %request.image, commands = request.commands.len())
    )]
    async fn execute(
        &self,
        cancel: &CancellationToken,
        request: &ExecutionRequest,
        execution_id: &ExecutionId,
        deadline: Instant,
        timeout: Duration,
    ) -> Result<ExecutionResult> {
        let spec = builder::build(request, execution_id, &self.config, timeout)?;

        if cancel.is_cancelled() {
            return Err(ExecutionError::Canceled { name: spec.name });
        }

        if request.is_empty() {
            info!("No commands to run");
            return Ok(ExecutionResult::empty());
        }

        let cluster = self.cluster.as_ref();
        let delete_namespace = self.config.cleanup.delete_namespace;

        let outcome = LifecycleController::new(cluster, &self.config.polling, delete_namespace)
            .run(&spec, deadline, timeout, cancel)
            .await?;

        let output = collector::collect(cluster, &spec).await;

        if let Err(e) = Reaper::new(cluster).reap(&spec, delete_namespace).await {
            warn!(error = %e, "Cleanup failed; keeping execution result");
        }

        let result = ExecutionResult {
            output: output?,
            outcome,
        };
        info!(
            namespace = %spec.namespace,
            name = %spec.name,
            outcome = ?result.outcome,
            bytes = result.output.len(),
            "Execution finished"
        );
        Ok(result)
    }

    /// Delete a unit out of band (e.g. one left behind by a crashed run).
    ///
    /// Deleting something that does not exist succeeds.
    ///
    /// # Errors
    /// Returns `ExecutionError::DeleteFailed` if the cluster rejects the delete.
    pub async fn delete_object(&self, namespace: &str, name: &str) -> Result<()> {
        Reaper::new(self.cluster.as_ref())
            .delete(namespace, name)
            .await
    }

    /// Run many requests concurrently and wait for all of them.
    ///
    /// Each request runs on its own task with a child of `cancel`, so
    /// cancelling the batch stops every execution while one execution's
    /// failure leaves the others alone. Results come back in input order.
    /// Identifiers that map to the same unit as an earlier entry fail with
    /// `AlreadyExists` without being submitted.
    pub async fn run_batch(
        &self,
        cancel: &CancellationToken,
        jobs: Vec<(ExecutionId, ExecutionRequest)>,
    ) -> Vec<(ExecutionId, Result<ExecutionResult>)> {
        let mut claimed = HashSet::new();
        let mut ids = Vec::with_capacity(jobs.len());
        let mut handles = Vec::with_capacity(jobs.len());

        for (execution_id, request) in jobs {
            let unit = resource_name(execution_id.as_str())
                .map(|name| (self.config.namespace.namespace_for(&name), name));

            if let Some((namespace, name)) = unit {
                if !claimed.insert((namespace.clone(), name.clone())) {
                    warn!(execution_id = %execution_id, "Duplicate execution id in batch");
                    let err = ExecutionError::AlreadyExists { namespace, name };
                    ids.push(execution_id);
                    handles.push(tokio::spawn(async move { Err(err) }));
                    continue;
                }
            }

            let runner = self.clone();
            let cancel = cancel.child_token();
            let span = tracing::info_span!("batch_execution", execution_id = %execution_id);
            let id = execution_id.clone();
            ids.push(execution_id);
            handles.push(tokio::spawn(
                async move { runner.run_job(&cancel, &request, &id).await }.instrument(span),
            ));
        }

        info!(executions = handles.len(), "Dispatched batch");

        // Completion barrier: every task has finished once join_all resolves
        let joined = join_all(handles).await;

        ids.into_iter()
            .zip(joined)
            .map(|(execution_id, joined)| {
                let result = match joined {
                    Ok(result) => result,
                    Err(e) if e.is_panic() => std::panic::resume_unwind(e.into_panic()),
                    Err(_) => Err(ExecutionError::Canceled {
                        name: execution_id.to_string(),
                    }),
                };
                (execution_id, result)
            })
            .collect()
    }
}
