//! Runner configuration.
//!
//! Passed explicitly to [`crate::KubeRunner`] at construction. Loaded from a
//! YAML file, from the environment, or built in code.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::naming::is_valid_resource_name;

const ENV_KUBECONFIG: &str = "KUBECONFIG";
const ENV_CONTEXT: &str = "KUBE_CI_CONTEXT";
const ENV_NAMESPACE: &str = "KUBE_CI_NAMESPACE";
const ENV_TIMEOUT_SECS: &str = "KUBE_CI_TIMEOUT_SECS";
const ENV_DELETE_NAMESPACE: &str = "KUBE_CI_DELETE_NAMESPACE";

/// Longest accepted execution deadline (24h).
pub const MAX_TIMEOUT_SECONDS: u64 = 24 * 60 * 60;

/// Main runner configuration structure
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RunnerConfig {
    /// Path to a kubeconfig file; inferred (env / in-cluster) when absent
    #[serde(default)]
    pub kubeconfig: Option<PathBuf>,

    /// Kubeconfig context to use instead of the current one
    #[serde(default)]
    pub context: Option<String>,

    /// Where compute units are created
    #[serde(default)]
    pub namespace: NamespacePolicy,

    /// Default execution deadline in seconds
    #[serde(default = "default_timeout_seconds")]
    pub timeout_seconds: u64,

    /// Status polling configuration
    #[serde(default)]
    pub polling: PollingConfig,

    /// Pod template configuration
    #[serde(default)]
    pub pod: PodConfig,

    /// Cleanup configuration
    #[serde(default)]
    pub cleanup: CleanupConfig,
}

/// Namespace placement of compute units.
#[derive(Debug, Clone, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(tag = "mode", rename_all = "camelCase")]
pub enum NamespacePolicy {
    /// One namespace per execution, named after the execution identifier
    #[default]
    PerExecution,
    /// All units share a fixed, pre-existing namespace
    Shared { name: String },
}

impl NamespacePolicy {
    /// Namespace for a unit with the given (sanitized) name.
    #[must_use]
    pub fn namespace_for(&self, unit_name: &str) -> String {
        match self {
            Self::PerExecution => unit_name.to_string(),
            Self::Shared { name } => name.clone(),
        }
    }

    /// Whether the runner creates (and may delete) the namespace itself.
    #[must_use]
    pub fn manages_namespace(&self) -> bool {
        matches!(self, Self::PerExecution)
    }
}

/// Polling configuration
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PollingConfig {
    /// First wait between status queries
    #[serde(default = "default_interval_millis")]
    pub interval_millis: u64,

    /// Upper bound for the backoff between status queries
    #[serde(default = "default_max_interval_millis")]
    pub max_interval_millis: u64,

    /// Consecutive failed status queries tolerated before giving up
    #[serde(default = "default_max_errors")]
    pub max_errors: u32,
}

impl PollingConfig {
    #[must_use]
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_millis)
    }

    #[must_use]
    pub fn max_interval(&self) -> Duration {
        Duration::from_millis(self.max_interval_millis)
    }
}

/// Pod template configuration
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PodConfig {
    #[serde(default = "default_image_pull_policy")]
    pub image_pull_policy: String,

    #[serde(default)]
    pub service_account_name: Option<String>,

    /// CPU limit as a Kubernetes quantity (e.g. "500m")
    #[serde(default)]
    pub cpu_limit: Option<String>,

    /// Memory limit as a Kubernetes quantity (e.g. "512Mi")
    #[serde(default)]
    pub memory_limit: Option<String>,

    /// Let the Job TTL controller remove finished Jobs missed by cleanup
    #[serde(default)]
    pub ttl_seconds_after_finished: Option<i32>,
}

/// Cleanup configuration
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CleanupConfig {
    /// Delete the per-execution namespace after the unit. Shared namespaces
    /// are never deleted.
    #[serde(default = "default_delete_namespace")]
    pub delete_namespace: bool,
}

fn default_timeout_seconds() -> u64 {
    600 // 10 minutes
}

fn default_interval_millis() -> u64 {
    500
}

fn default_max_interval_millis() -> u64 {
    5_000
}

fn default_max_errors() -> u32 {
    5
}

fn default_delete_namespace() -> bool {
    true
}

fn default_image_pull_policy() -> String {
    "IfNotPresent".to_string()
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            kubeconfig: None,
            context: None,
            namespace: NamespacePolicy::default(),
            timeout_seconds: default_timeout_seconds(),
            polling: PollingConfig::default(),
            pod: PodConfig::default(),
            cleanup: CleanupConfig::default(),
        }
    }
}

impl Default for PollingConfig {
    fn default() -> Self {
        Self {
            interval_millis: default_interval_millis(),
            max_interval_millis: default_max_interval_millis(),
            max_errors: default_max_errors(),
        }
    }
}

impl Default for CleanupConfig {
    fn default() -> Self {
        Self {
            delete_namespace: default_delete_namespace(),
        }
    }
}

impl Default for PodConfig {
    fn default() -> Self {
        Self {
            image_pull_policy: default_image_pull_policy(),
            service_account_name: None,
            cpu_limit: None,
            memory_limit: None,
            ttl_seconds_after_finished: None,
        }
    }
}

impl RunnerConfig {
    /// Default execution deadline.
    #[must_use]
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_seconds)
    }

    /// Validate that configuration values are usable
    ///
    /// # Errors
    /// Returns `ConfigError::Invalid` describing the first bad value.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.timeout_seconds == 0 {
            return Err(ConfigError::Invalid(
                "timeoutSeconds must be greater than zero".to_string(),
            ));
        }

        if self.timeout_seconds > MAX_TIMEOUT_SECONDS {
            return Err(ConfigError::Invalid(format!(
                "timeoutSeconds ({}) exceeds the maximum of {MAX_TIMEOUT_SECONDS}",
                self.timeout_seconds
            )));
        }

        if self.polling.interval_millis == 0 {
            return Err(ConfigError::Invalid(
                "polling.intervalMillis must be greater than zero".to_string(),
            ));
        }

        if self.polling.max_interval_millis < self.polling.interval_millis {
            return Err(ConfigError::Invalid(format!(
                "polling.maxIntervalMillis ({}) is smaller than polling.intervalMillis ({})",
                self.polling.max_interval_millis, self.polling.interval_millis
            )));
        }

        if let NamespacePolicy::Shared { name } = &self.namespace {
            if !is_valid_resource_name(name) {
                return Err(ConfigError::Invalid(format!(
                    "shared namespace '{name}' is not a valid resource name"
                )));
            }
        }

        if !matches!(
            self.pod.image_pull_policy.as_str(),
            "Always" | "IfNotPresent" | "Never"
        ) {
            return Err(ConfigError::Invalid(format!(
                "unknown pod.imagePullPolicy '{}'",
                self.pod.image_pull_policy
            )));
        }

        Ok(())
    }

    /// Load configuration from a YAML file
    ///
    /// # Errors
    /// Returns `ConfigError::Read` or `ConfigError::Parse` when the file
    /// cannot be read or parsed.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;

        let config: Self = serde_yaml::from_str(&contents)?;
        Ok(config)
    }

    /// Build configuration from defaults plus environment overrides.
    ///
    /// - `KUBECONFIG`: kubeconfig path
    /// - `KUBE_CI_CONTEXT`: kubeconfig context
    /// - `KUBE_CI_NAMESPACE`: switch to a shared namespace
    /// - `KUBE_CI_TIMEOUT_SECS`: execution deadline
    /// - `KUBE_CI_DELETE_NAMESPACE`: "false"/"0" to keep per-execution namespaces
    ///
    /// # Errors
    /// Returns `ConfigError::Env` when a variable holds an unparsable value.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();
        config.apply_env()?;
        Ok(config)
    }

    /// Apply environment overrides on top of the current values.
    ///
    /// # Errors
    /// Returns `ConfigError::Env` when a variable holds an unparsable value.
    pub fn apply_env(&mut self) -> Result<(), ConfigError> {
        if let Some(path) = non_empty_env(ENV_KUBECONFIG) {
            self.kubeconfig = Some(PathBuf::from(path));
        }

        if let Some(context) = non_empty_env(ENV_CONTEXT) {
            self.context = Some(context);
        }

        if let Some(name) = non_empty_env(ENV_NAMESPACE) {
            self.namespace = NamespacePolicy::Shared { name };
        }

        if let Some(raw) = non_empty_env(ENV_TIMEOUT_SECS) {
            self.timeout_seconds = raw.trim().parse().map_err(|_| ConfigError::Env {
                var: ENV_TIMEOUT_SECS,
                value: raw.clone(),
            })?;
        }

        if let Some(raw) = non_empty_env(ENV_DELETE_NAMESPACE) {
            self.cleanup.delete_namespace = match raw.trim().to_ascii_lowercase().as_str() {
                "true" | "1" => true,
                "false" | "0" => false,
                _ => {
                    return Err(ConfigError::Env {
                        var: ENV_DELETE_NAMESPACE,
                        value: raw,
                    })
                }
            };
        }

        Ok(())
    }
}

fn non_empty_env(var: &str) -> Option<String> {
    std::env::var(var).ok().filter(|value| !value.trim().is_empty())
}
