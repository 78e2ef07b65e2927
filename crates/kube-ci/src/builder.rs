//! Job spec builder.
//!
//! Turns an [`ExecutionRequest`] and its [`ExecutionId`] into the `batch/v1`
//! Job that runs it.

use std::collections::BTreeMap;
use std::time::Duration;

use k8s_openapi::api::batch::v1::{Job, JobSpec};
use k8s_openapi::api::core::v1::{
    Container, PodSpec, PodTemplateSpec, ResourceRequirements,
};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

use crate::config::RunnerConfig;
use crate::error::{ExecutionError, Result};
use crate::naming::resource_name;
use crate::request::{ExecutionId, ExecutionRequest};

/// Name of the single container in every unit; logs are read from it.
pub const CONTAINER_NAME: &str = "runner";
/// Shell that runs the joined commands.
pub const SHELL: &str = "/bin/sh";

/// Label marking objects created by this crate
pub const LABEL_MANAGED_BY: &str = "app.kubernetes.io/managed-by";
/// Label carrying the sanitized execution identifier
pub const LABEL_EXECUTION_ID: &str = "kube-ci/execution-id";
/// Value of [`LABEL_MANAGED_BY`]
pub const MANAGER: &str = "kube-ci";

/// Server-side deadline slack on top of the client deadline, so the client
/// always observes the timeout first.
const ACTIVE_DEADLINE_GRACE_SECS: u64 = 30;

/// Everything needed to submit one compute unit.
#[derive(Debug, Clone)]
pub struct UnitSpec {
    /// Sanitized execution identifier, used as the Job name
    pub name: String,
    pub namespace: String,
    /// Whether the namespace is created (and optionally removed) by the runner
    pub manage_namespace: bool,
    pub job: Job,
}

impl UnitSpec {
    fn container(&self) -> Option<&Container> {
        self.job
            .spec
            .as_ref()
            .and_then(|spec| spec.template.spec.as_ref())
            .and_then(|pod| pod.containers.iter().find(|c| c.name == CONTAINER_NAME))
    }

    /// Image of the runner container.
    #[must_use]
    pub fn image(&self) -> Option<&str> {
        self.container().and_then(|c| c.image.as_deref())
    }

    /// Script passed to the shell.
    #[must_use]
    pub fn script(&self) -> Option<&str> {
        self.container()
            .and_then(|c| c.command.as_ref())
            .and_then(|command| command.get(2))
            .map(String::as_str)
    }
}

/// Build the unit spec for one execution.
///
/// # Errors
/// Returns `ExecutionError::InvalidSpec` when the image is empty or the
/// identifier cannot be sanitized into a resource name.
pub fn build(
    request: &ExecutionRequest,
    execution_id: &ExecutionId,
    config: &RunnerConfig,
    timeout: Duration,
) -> Result<UnitSpec> {
    let image = request.image.trim();
    if image.is_empty() {
        return Err(ExecutionError::InvalidSpec(
            "container image must not be empty".to_string(),
        ));
    }

    let name = resource_name(execution_id.as_str()).ok_or_else(|| {
        ExecutionError::InvalidSpec(format!(
            "execution id '{execution_id}' cannot be turned into a resource name"
        ))
    })?;
    let namespace = config.namespace.namespace_for(&name);

    let labels = BTreeMap::from([
        (LABEL_MANAGED_BY.to_string(), MANAGER.to_string()),
        (LABEL_EXECUTION_ID.to_string(), name.clone()),
    ]);

    let container = Container {
        name: CONTAINER_NAME.to_string(),
        image: Some(image.to_string()),
        image_pull_policy: Some(config.pod.image_pull_policy.clone()),
        command: Some(vec![
            SHELL.to_string(),
            "-c".to_string(),
            request.script(),
        ]),
        resources: resource_limits(config),
        ..Default::default()
    };

    let pod_spec = PodSpec {
        containers: vec![container],
        restart_policy: Some("Never".to_string()),
        service_account_name: config.pod.service_account_name.clone(),
        automount_service_account_token: Some(false),
        ..Default::default()
    };

    let job = Job {
        metadata: ObjectMeta {
            name: Some(name.clone()),
            namespace: Some(namespace.clone()),
            labels: Some(labels.clone()),
            ..Default::default()
        },
        spec: Some(JobSpec {
            backoff_limit: Some(0),
            active_deadline_seconds: Some(active_deadline_seconds(timeout)),
            ttl_seconds_after_finished: config.pod.ttl_seconds_after_finished,
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta {
                    labels: Some(labels),
                    ..Default::default()
                }),
                spec: Some(pod_spec),
            },
            ..Default::default()
        }),
        ..Default::default()
    };

    Ok(UnitSpec {
        name,
        namespace,
        manage_namespace: config.namespace.manages_namespace(),
        job,
    })
}

fn resource_limits(config: &RunnerConfig) -> Option<ResourceRequirements> {
    let mut limits = BTreeMap::new();
    if let Some(cpu) = &config.pod.cpu_limit {
        limits.insert("cpu".to_string(), Quantity(cpu.clone()));
    }
    if let Some(memory) = &config.pod.memory_limit {
        limits.insert("memory".to_string(), Quantity(memory.clone()));
    }

    if limits.is_empty() {
        None
    } else {
        Some(ResourceRequirements {
            limits: Some(limits),
            ..Default::default()
        })
    }
}

fn active_deadline_seconds(timeout: Duration) -> i64 {
    let secs = timeout
        .as_secs()
        .saturating_add(u64::from(timeout.subsec_nanos() > 0))
        .saturating_add(ACTIVE_DEADLINE_GRACE_SECS);
    i64::try_from(secs).unwrap_or(i64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::NamespacePolicy;

    fn request(commands: &[&str]) -> ExecutionRequest {
        ExecutionRequest::new("golang", commands.iter().copied())
    }

    fn pod_spec(spec: &UnitSpec) -> &PodSpec {
        spec.job
            .spec
            .as_ref()
            .unwrap()
            .template
            .spec
            .as_ref()
            .unwrap()
    }

    #[test]
    fn commands_run_in_one_shell() {
        let spec = build(
            &request(&["cd /src", "go test ./..."]),
            &ExecutionId::new("ci0"),
            &RunnerConfig::default(),
            Duration::from_secs(60),
        )
        .unwrap();

        let container = &pod_spec(&spec).containers[0];
        assert_eq!(container.name, CONTAINER_NAME);
        assert_eq!(
            container.command.as_deref().unwrap(),
            ["/bin/sh", "-c", "cd /src\ngo test ./..."]
        );
        assert_eq!(spec.script(), Some("cd /src\ngo test ./..."));
        assert_eq!(spec.image(), Some("golang"));
    }

    #[test]
    fn unit_is_never_restarted() {
        let spec = build(
            &request(&["true"]),
            &ExecutionId::new("ci1"),
            &RunnerConfig::default(),
            Duration::from_secs(60),
        )
        .unwrap();

        let job_spec = spec.job.spec.as_ref().unwrap();
        assert_eq!(job_spec.backoff_limit, Some(0));
        assert_eq!(job_spec.active_deadline_seconds, Some(90));
        assert_eq!(pod_spec(&spec).restart_policy.as_deref(), Some("Never"));
        assert_eq!(pod_spec(&spec).automount_service_account_token, Some(false));
    }

    #[test]
    fn name_and_namespace_follow_execution_id() {
        let spec = build(
            &request(&["true"]),
            &ExecutionId::new("Lab1_Run"),
            &RunnerConfig::default(),
            Duration::from_secs(60),
        )
        .unwrap();

        assert_eq!(spec.name, "lab1-run");
        assert_eq!(spec.namespace, "lab1-run");
        assert!(spec.manage_namespace);
        assert_eq!(spec.job.metadata.name.as_deref(), Some("lab1-run"));
        let labels = spec.job.metadata.labels.as_ref().unwrap();
        assert_eq!(labels[LABEL_EXECUTION_ID], "lab1-run");
        assert_eq!(labels[LABEL_MANAGED_BY], MANAGER);
    }

    #[test]
    fn shared_namespace_policy() {
        let config = RunnerConfig {
            namespace: NamespacePolicy::Shared {
                name: "grading".to_string(),
            },
            ..RunnerConfig::default()
        };
        let spec = build(
            &request(&["true"]),
            &ExecutionId::new("ci2"),
            &config,
            Duration::from_secs(60),
        )
        .unwrap();

        assert_eq!(spec.name, "ci2");
        assert_eq!(spec.namespace, "grading");
        assert!(!spec.manage_namespace);
    }

    #[test]
    fn limits_and_ttl_come_from_config() {
        let mut config = RunnerConfig::default();
        config.pod.cpu_limit = Some("500m".to_string());
        config.pod.memory_limit = Some("256Mi".to_string());
        config.pod.ttl_seconds_after_finished = Some(120);
        config.pod.service_account_name = Some("runner".to_string());

        let spec = build(
            &request(&["true"]),
            &ExecutionId::new("ci3"),
            &config,
            Duration::from_millis(1500),
        )
        .unwrap();

        let job_spec = spec.job.spec.as_ref().unwrap();
        assert_eq!(job_spec.ttl_seconds_after_finished, Some(120));
        assert_eq!(job_spec.active_deadline_seconds, Some(32));

        let pod = pod_spec(&spec);
        assert_eq!(pod.service_account_name.as_deref(), Some("runner"));
        let limits = pod.containers[0]
            .resources
            .as_ref()
            .unwrap()
            .limits
            .as_ref()
            .unwrap();
        assert_eq!(limits["cpu"], Quantity("500m".to_string()));
        assert_eq!(limits["memory"], Quantity("256Mi".to_string()));
    }

    #[test]
    fn huge_timeout_saturates_deadline() {
        assert_eq!(active_deadline_seconds(Duration::MAX), i64::MAX);
        assert_eq!(
            active_deadline_seconds(Duration::from_secs(u64::MAX - 10)),
            i64::MAX
        );
    }

    #[test]
    fn rejects_empty_image() {
        let err = build(
            &ExecutionRequest::new("  ", ["true"]),
            &ExecutionId::new("ci4"),
            &RunnerConfig::default(),
            Duration::from_secs(60),
        )
        .unwrap_err();
        assert!(matches!(err, ExecutionError::InvalidSpec(_)));
    }

    #[test]
    fn rejects_unusable_identifier() {
        let err = build(
            &request(&["true"]),
            &ExecutionId::new("___"),
            &RunnerConfig::default(),
            Duration::from_secs(60),
        )
        .unwrap_err();
        assert!(matches!(err, ExecutionError::InvalidSpec(_)));
    }
}
