//! Deletion of compute units and their namespaces.
//!
//! All deletes are idempotent: an object that is already gone counts as
//! deleted.

use tracing::{debug, info, warn};

use crate::builder::UnitSpec;
use crate::cluster::{ClusterClient, ClusterError};
use crate::error::{ExecutionError, Result};

pub struct Reaper<'a> {
    cluster: &'a dyn ClusterClient,
}

impl<'a> Reaper<'a> {
    #[must_use]
    pub fn new(cluster: &'a dyn ClusterClient) -> Self {
        Self { cluster }
    }

    /// Delete one unit.
    ///
    /// # Errors
    /// Returns `ExecutionError::DeleteFailed` if the cluster refuses or
    /// cannot process the delete.
    pub async fn delete(&self, namespace: &str, name: &str) -> Result<()> {
        match self.cluster.delete_unit(namespace, name).await {
            Ok(()) => {
                info!(namespace = %namespace, name = %name, "Deleted compute unit");
                Ok(())
            }
            Err(ClusterError::NotFound(_)) => {
                debug!(namespace = %namespace, name = %name, "Compute unit already gone");
                Ok(())
            }
            Err(e) => Err(ExecutionError::DeleteFailed {
                namespace: namespace.to_string(),
                name: name.to_string(),
                reason: e.to_string(),
            }),
        }
    }

    /// Delete a namespace.
    ///
    /// # Errors
    /// Returns `ExecutionError::DeleteFailed` if the delete is rejected.
    pub async fn delete_namespace(&self, namespace: &str) -> Result<()> {
        match self.cluster.delete_namespace(namespace).await {
            Ok(()) => {
                info!(namespace = %namespace, "Deleted namespace");
                Ok(())
            }
            Err(ClusterError::NotFound(_)) => Ok(()),
            Err(e) => Err(ExecutionError::DeleteFailed {
                namespace: namespace.to_string(),
                name: namespace.to_string(),
                reason: e.to_string(),
            }),
        }
    }

    /// Remove everything created for `spec`.
    ///
    /// The namespace is only removed when the runner owns it and
    /// `delete_namespace` is set. The namespace is still attempted when the
    /// unit delete fails; the first failure is returned.
    ///
    /// # Errors
    /// Returns `ExecutionError::DeleteFailed` for the first failed delete.
    pub async fn reap(&self, spec: &UnitSpec, delete_namespace: bool) -> Result<()> {
        let unit = self.delete(&spec.namespace, &spec.name).await;
        if let Err(e) = &unit {
            warn!(namespace = %spec.namespace, name = %spec.name, error = %e, "Failed to delete compute unit");
        }

        let namespace = if delete_namespace && spec.manage_namespace {
            self.delete_namespace(&spec.namespace).await
        } else {
            Ok(())
        };
        if let Err(e) = &namespace {
            warn!(namespace = %spec.namespace, error = %e, "Failed to delete namespace");
        }

        unit.and(namespace)
    }
}
