//! [`ClusterClient`] backed by the Kubernetes API.
//!
//! A unit is a `batch/v1` Job; its status and logs come from the single Pod
//! the Job controller creates for it (found via the `job-name` label and the
//! owner reference back to the Job).

use std::collections::BTreeMap;

use async_trait::async_trait;
use k8s_openapi::api::batch::v1::Job;
use k8s_openapi::api::core::v1::{Namespace, Pod};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::api::{Api, DeleteParams, ListParams, LogParams, PostParams, PropagationPolicy};
use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::Client;
use tracing::{debug, info};

use super::{ClusterClient, ClusterError, UnitPhase, UnitStatus};
use crate::builder::{UnitSpec, CONTAINER_NAME, LABEL_MANAGED_BY, MANAGER};
use crate::config::RunnerConfig;
use crate::error::ConfigError;

/// Container waiting reasons that mean the unit will never start.
const SCHEDULING_FAILURE_REASONS: &[&str] = &[
    "ErrImagePull",
    "ImagePullBackOff",
    "InvalidImageName",
    "ErrImageNeverPull",
    "CreateContainerConfigError",
    "CreateContainerError",
];

/// Kubernetes-backed cluster client.
#[derive(Clone)]
pub struct KubeCluster {
    client: Client,
}

impl KubeCluster {
    #[must_use]
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    /// Build a client from the runner configuration.
    ///
    /// Uses the configured kubeconfig file (and context) when set, otherwise
    /// infers the configuration from the environment or the in-cluster
    /// service account.
    ///
    /// # Errors
    /// Returns `ConfigError::Kubeconfig` if the kubeconfig cannot be loaded
    /// or the client cannot be constructed.
    pub async fn from_config(config: &RunnerConfig) -> Result<Self, ConfigError> {
        let options = KubeConfigOptions {
            context: config.context.clone(),
            ..Default::default()
        };

        let kube_config = match (&config.kubeconfig, &config.context) {
            (Some(path), _) => {
                let kubeconfig = Kubeconfig::read_from(path).map_err(|e| {
                    ConfigError::Kubeconfig(format!("failed to read {}: {e}", path.display()))
                })?;
                kube::Config::from_custom_kubeconfig(kubeconfig, &options)
                    .await
                    .map_err(|e| ConfigError::Kubeconfig(e.to_string()))?
            }
            (None, Some(_)) => kube::Config::from_kubeconfig(&options)
                .await
                .map_err(|e| ConfigError::Kubeconfig(e.to_string()))?,
            (None, None) => kube::Config::infer()
                .await
                .map_err(|e| ConfigError::Kubeconfig(e.to_string()))?,
        };

        info!(cluster_url = %kube_config.cluster_url, "Connecting to Kubernetes");

        let client =
            Client::try_from(kube_config).map_err(|e| ConfigError::Kubeconfig(e.to_string()))?;
        Ok(Self::new(client))
    }

    fn jobs(&self, namespace: &str) -> Api<Job> {
        Api::namespaced(self.client.clone(), namespace)
    }

    fn pods(&self, namespace: &str) -> Api<Pod> {
        Api::namespaced(self.client.clone(), namespace)
    }

    fn namespaces(&self) -> Api<Namespace> {
        Api::all(self.client.clone())
    }

    /// The pod the Job controller created for this `job`, if any yet.
    ///
    /// Pods of an earlier Job with the same name can outlive it (deletes use
    /// background propagation), so pods are matched on the owning Job's uid
    /// and not just on the `job-name` label.
    async fn pod_for(&self, namespace: &str, job: &Job) -> Result<Option<Pod>, ClusterError> {
        let name = job.metadata.name.as_deref().unwrap_or_default();
        let Some(uid) = job.metadata.uid.as_deref() else {
            return Ok(None);
        };

        let lp = ListParams::default().labels(&format!("job-name={name}"));
        let pods = self
            .pods(namespace)
            .list(&lp)
            .await
            .map_err(|e| classify(e, &format!("pods of job {namespace}/{name}")))?;

        Ok(newest_owned_pod(pods.items, uid))
    }

    async fn job(&self, namespace: &str, name: &str) -> Result<Job, ClusterError> {
        self.jobs(namespace)
            .get(name)
            .await
            .map_err(|e| classify(e, &format!("job {namespace}/{name}")))
    }
}

#[async_trait]
impl ClusterClient for KubeCluster {
    async fn ensure_namespace(&self, namespace: &str) -> Result<(), ClusterError> {
        let api = self.namespaces();
        match api.get(namespace).await {
            Ok(existing) if is_terminating(&existing) => {
                return Err(ClusterError::AlreadyExists(format!(
                    "namespace {namespace} (terminating)"
                )));
            }
            Ok(_) => return Ok(()),
            Err(kube::Error::Api(ae)) if ae.code == 404 => {}
            Err(e) => return Err(classify(e, &format!("namespace {namespace}"))),
        }

        let ns = Namespace {
            metadata: ObjectMeta {
                name: Some(namespace.to_string()),
                labels: Some(BTreeMap::from([(
                    LABEL_MANAGED_BY.to_string(),
                    MANAGER.to_string(),
                )])),
                ..Default::default()
            },
            ..Default::default()
        };

        match api.create(&PostParams::default(), &ns).await {
            Ok(_) => {
                info!(namespace = %namespace, "Created namespace");
                Ok(())
            }
            Err(kube::Error::Api(ae)) if ae.code == 409 => {
                debug!(namespace = %namespace, "Namespace created concurrently");
                Ok(())
            }
            Err(e) => Err(classify(e, &format!("namespace {namespace}"))),
        }
    }

    async fn create_unit(&self, spec: &UnitSpec) -> Result<(), ClusterError> {
        let object = format!("job {}/{}", spec.namespace, spec.name);
        match self
            .jobs(&spec.namespace)
            .create(&PostParams::default(), &spec.job)
            .await
        {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(ae))
                if rejected_by_terminating_namespace(ae.code, &ae.message) =>
            {
                Err(ClusterError::AlreadyExists(format!(
                    "{object} (namespace terminating)"
                )))
            }
            Err(e) => Err(classify(e, &object)),
        }
    }

    async fn unit_status(&self, namespace: &str, name: &str) -> Result<UnitStatus, ClusterError> {
        let job = self.job(namespace, name).await?;

        match self.pod_for(namespace, &job).await? {
            Some(pod) => Ok(pod_status(&pod)),
            None => Ok(job_status_without_pod(&job)),
        }
    }

    async fn read_logs(&self, namespace: &str, name: &str) -> Result<String, ClusterError> {
        let job = self.job(namespace, name).await?;
        let pod = self
            .pod_for(namespace, &job)
            .await?
            .ok_or_else(|| ClusterError::NotFound(format!("pod of job {namespace}/{name}")))?;
        let pod_name = pod.metadata.name.unwrap_or_default();

        let lp = LogParams {
            container: Some(CONTAINER_NAME.to_string()),
            ..Default::default()
        };

        self.pods(namespace)
            .logs(&pod_name, &lp)
            .await
            .map_err(|e| classify(e, &format!("logs of pod {namespace}/{pod_name}")))
    }

    async fn delete_unit(&self, namespace: &str, name: &str) -> Result<(), ClusterError> {
        // Background propagation removes the Job now and lets the GC take its pods
        let dp = DeleteParams {
            propagation_policy: Some(PropagationPolicy::Background),
            grace_period_seconds: Some(0),
            ..Default::default()
        };

        self.jobs(namespace)
            .delete(name, &dp)
            .await
            .map_err(|e| classify(e, &format!("job {namespace}/{name}")))?;
        Ok(())
    }

    async fn delete_namespace(&self, namespace: &str) -> Result<(), ClusterError> {
        self.namespaces()
            .delete(namespace, &DeleteParams::default())
            .await
            .map_err(|e| classify(e, &format!("namespace {namespace}")))?;
        Ok(())
    }
}

/// Map a `kube` error onto the adapter-neutral error classes.
fn classify(err: kube::Error, object: &str) -> ClusterError {
    match err {
        kube::Error::Api(ae) if ae.code == 404 => ClusterError::NotFound(object.to_string()),
        kube::Error::Api(ae) if ae.code == 409 => ClusterError::AlreadyExists(object.to_string()),
        kube::Error::Api(ae) => ClusterError::Api {
            code: ae.code,
            message: ae.message,
        },
        other => ClusterError::Transport(other.to_string()),
    }
}

fn is_terminating(namespace: &Namespace) -> bool {
    namespace
        .status
        .as_ref()
        .and_then(|s| s.phase.as_deref())
        == Some("Terminating")
}

/// The API server refuses new objects in a namespace that is being deleted.
fn rejected_by_terminating_namespace(code: u16, message: &str) -> bool {
    code == 403 && message.contains("because it is being terminated")
}

/// Newest pod owned by the Job with `job_uid`.
pub(crate) fn newest_owned_pod(pods: Vec<Pod>, job_uid: &str) -> Option<Pod> {
    // backoffLimit is 0, so there is at most one pod unless the first was evicted
    pods.into_iter()
        .filter(|pod| {
            pod.metadata
                .owner_references
                .iter()
                .flatten()
                .any(|owner| owner.kind == "Job" && owner.uid == job_uid)
        })
        .max_by_key(|pod| pod.metadata.creation_timestamp.as_ref().map(|t| t.0))
}

/// Derive the unit status from its pod.
pub(crate) fn pod_status(pod: &Pod) -> UnitStatus {
    let Some(status) = pod.status.as_ref() else {
        return UnitStatus::new(UnitPhase::Pending);
    };

    let runner = status
        .container_statuses
        .iter()
        .flatten()
        .find(|c| c.name == CONTAINER_NAME);

    let waiting = runner
        .and_then(|c| c.state.as_ref())
        .and_then(|s| s.waiting.as_ref());
    if let Some(reason) = waiting.and_then(|w| w.reason.as_deref()) {
        if SCHEDULING_FAILURE_REASONS.contains(&reason) {
            let detail = waiting
                .and_then(|w| w.message.as_deref())
                .map_or_else(|| reason.to_string(), |m| format!("{reason}: {m}"));
            return UnitStatus::new(UnitPhase::SchedulingFailed).with_reason(detail);
        }
    }

    let unschedulable = status.conditions.iter().flatten().find(|c| {
        c.type_ == "PodScheduled"
            && c.status == "False"
            && c.reason.as_deref() == Some("Unschedulable")
    });
    if let Some(condition) = unschedulable {
        let detail = condition
            .message
            .clone()
            .unwrap_or_else(|| "Unschedulable".to_string());
        return UnitStatus::new(UnitPhase::SchedulingFailed).with_reason(detail);
    }

    let terminated = runner
        .and_then(|c| c.state.as_ref())
        .and_then(|s| s.terminated.as_ref());

    let phase = match status.phase.as_deref() {
        Some("Running" | "Unknown") => UnitPhase::Running,
        Some("Succeeded") => UnitPhase::Succeeded,
        Some("Failed") => UnitPhase::Failed,
        _ => UnitPhase::Pending,
    };

    let mut unit = UnitStatus::new(phase);
    if let Some(terminated) = terminated {
        unit = unit.with_exit_code(terminated.exit_code);
        if let Some(reason) = &terminated.reason {
            unit = unit.with_reason(reason.clone());
        }
    } else if let Some(reason) = &status.reason {
        // e.g. "Evicted"
        unit = unit.with_reason(reason.clone());
    }
    unit
}

/// Status of a Job whose pod does not exist (yet, or any more).
pub(crate) fn job_status_without_pod(job: &Job) -> UnitStatus {
    let finished = job
        .status
        .as_ref()
        .and_then(|s| s.conditions.as_ref())
        .and_then(|conditions| {
            conditions
                .iter()
                .find(|c| (c.type_ == "Failed" || c.type_ == "Complete") && c.status == "True")
        });

    match finished {
        // Pod already garbage-collected; the collector reports the missing logs
        Some(condition) if condition.type_ == "Complete" => {
            UnitStatus::new(UnitPhase::Succeeded).with_reason("PodGone")
        }
        Some(condition) => UnitStatus::new(UnitPhase::Failed).with_reason(
            condition
                .reason
                .clone()
                .unwrap_or_else(|| "JobFailed".to_string()),
        ),
        None => UnitStatus::new(UnitPhase::Pending),
    }
}
