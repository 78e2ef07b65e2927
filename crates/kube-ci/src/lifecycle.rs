//! # Pod Lifecycle Controller
//!
//! Submits a unit and follows it to a terminal phase:
//!
//! ```text
//! Pending ──► Running ──► Succeeded | Failed
//!    │           │
//!    └───────────┴──────► SchedulingFailed
//! ```
//!
//! Status is polled with bounded exponential backoff. The deadline and the
//! caller's cancellation token are raced against submission and against the
//! whole poll loop, so either one interrupts a wait or an in-flight API call.
//! On timeout, cancellation, scheduling failure or a cluster that stops
//! answering, the unit is deleted before the error is returned.

use std::future::Future;
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::builder::UnitSpec;
use crate::cluster::{ClusterClient, ClusterError, UnitPhase};
use crate::config::PollingConfig;
use crate::error::{ExecutionError, Result};
use crate::reaper::Reaper;
use crate::request::Outcome;

/// Bounded exponential backoff between status queries.
#[derive(Debug, Clone)]
pub struct Backoff {
    current: Duration,
    max: Duration,
}

impl Backoff {
    #[must_use]
    pub fn new(initial: Duration, max: Duration) -> Self {
        Self {
            current: initial,
            max: max.max(initial),
        }
    }

    #[must_use]
    pub fn from_config(polling: &PollingConfig) -> Self {
        Self::new(polling.interval(), polling.max_interval())
    }

    /// Delay before the next query; doubles up to the maximum.
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current;
        self.current = (self.current * 2).min(self.max);
        delay
    }
}

pub struct LifecycleController<'a> {
    cluster: &'a dyn ClusterClient,
    polling: &'a PollingConfig,
    delete_namespace: bool,
}

impl<'a> LifecycleController<'a> {
    #[must_use]
    pub fn new(
        cluster: &'a dyn ClusterClient,
        polling: &'a PollingConfig,
        delete_namespace: bool,
    ) -> Self {
        Self {
            cluster,
            polling,
            delete_namespace,
        }
    }

    /// Submit the unit and wait for it to finish running.
    ///
    /// Returns the outcome of a unit that ran (`Succeeded` or `Failed`). The
    /// unit is left in place so its output can be collected. `timeout` is
    /// the budget `deadline` was derived from and is only used for reporting.
    ///
    /// # Errors
    /// - `AlreadyExists` if the name is still taken (nothing is deleted)
    /// - `InvalidSpec` if the API rejects the object
    /// - `SchedulingFailed`, `ExecutionTimeout`, `Canceled`,
    ///   `ClusterUnavailable` after the unit has been deleted
    pub async fn run(
        &self,
        spec: &UnitSpec,
        deadline: Instant,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<Outcome> {
        match interruptible(spec, deadline, timeout, cancel, self.submit(spec)).await {
            Ok(()) => {}
            // The create may have reached the API server before the interrupt
            Err(e @ (ExecutionError::Canceled { .. } | ExecutionError::ExecutionTimeout { .. })) => {
                return Err(self.abort(spec, e).await);
            }
            Err(e) => return Err(e),
        }

        match interruptible(spec, deadline, timeout, cancel, self.wait_for_terminal(spec)).await {
            Ok(outcome) => Ok(outcome),
            Err(e) => Err(self.abort(spec, e).await),
        }
    }

    /// Delete what was submitted for `spec` and hand back `err`.
    async fn abort(&self, spec: &UnitSpec, err: ExecutionError) -> ExecutionError {
        warn!(namespace = %spec.namespace, name = %spec.name, error = %err, "Aborting execution");
        // A failed delete is logged by the reaper; the primary error wins
        let _ = Reaper::new(self.cluster)
            .reap(spec, self.delete_namespace)
            .await;
        err
    }

    async fn submit(&self, spec: &UnitSpec) -> Result<()> {
        if spec.manage_namespace {
            match self.cluster.ensure_namespace(&spec.namespace).await {
                Ok(()) => {}
                // Still terminating from an earlier execution with this id
                Err(ClusterError::AlreadyExists(_)) => {
                    return Err(ExecutionError::AlreadyExists {
                        namespace: spec.namespace.clone(),
                        name: spec.name.clone(),
                    });
                }
                Err(e) => {
                    return Err(ExecutionError::ClusterUnavailable {
                        operation: "ensure namespace",
                        reason: e.to_string(),
                    });
                }
            }
        }

        match self.cluster.create_unit(spec).await {
            Ok(()) => {
                info!(namespace = %spec.namespace, name = %spec.name, "Submitted compute unit");
                Ok(())
            }
            Err(ClusterError::AlreadyExists(_)) => Err(ExecutionError::AlreadyExists {
                namespace: spec.namespace.clone(),
                name: spec.name.clone(),
            }),
            Err(ClusterError::Api { code, message }) if code == 400 || code == 422 => {
                Err(ExecutionError::InvalidSpec(message))
            }
            Err(e) => Err(ExecutionError::ClusterUnavailable {
                operation: "submit",
                reason: e.to_string(),
            }),
        }
    }

    async fn wait_for_terminal(&self, spec: &UnitSpec) -> Result<Outcome> {
        let mut backoff = Backoff::from_config(self.polling);
        let mut phase = UnitPhase::Pending;
        let mut consecutive_errors = 0;

        loop {
            match self.cluster.unit_status(&spec.namespace, &spec.name).await {
                Ok(status) if status.phase.rank() < phase.rank() => {
                    debug!(
                        name = %spec.name,
                        current = %phase,
                        observed = %status.phase,
                        "Ignoring stale phase observation"
                    );
                    consecutive_errors = 0;
                }
                Ok(status) => {
                    consecutive_errors = 0;
                    if status.phase != phase {
                        info!(
                            name = %spec.name,
                            from = %phase,
                            to = %status.phase,
                            "Compute unit phase changed"
                        );
                        phase = status.phase;
                    }

                    match status.phase {
                        UnitPhase::Succeeded => return Ok(Outcome::Succeeded),
                        UnitPhase::Failed => {
                            return Ok(Outcome::Failed {
                                exit_code: status.exit_code,
                            })
                        }
                        UnitPhase::SchedulingFailed => {
                            return Err(ExecutionError::SchedulingFailed {
                                name: spec.name.clone(),
                                reason: status
                                    .reason
                                    .unwrap_or_else(|| "unknown reason".to_string()),
                            })
                        }
                        UnitPhase::Pending | UnitPhase::Running => {}
                    }
                }
                Err(e) => {
                    consecutive_errors += 1;
                    if consecutive_errors > self.polling.max_errors {
                        return Err(ExecutionError::ClusterUnavailable {
                            operation: "poll",
                            reason: e.to_string(),
                        });
                    }
                    warn!(
                        name = %spec.name,
                        attempt = consecutive_errors,
                        error = %e,
                        "Status query failed"
                    );
                }
            }

            tokio::time::sleep(backoff.next_delay()).await;
        }
    }
}

/// Run `work` until it finishes, `cancel` fires or `deadline` passes.
async fn interruptible<T>(
    spec: &UnitSpec,
    deadline: Instant,
    timeout: Duration,
    cancel: &CancellationToken,
    work: impl Future<Output = Result<T>>,
) -> Result<T> {
    tokio::select! {
        biased;
        () = cancel.cancelled() => Err(ExecutionError::Canceled {
            name: spec.name.clone(),
        }),
        () = tokio::time::sleep_until(deadline) => Err(ExecutionError::ExecutionTimeout {
            name: spec.name.clone(),
            timeout,
        }),
        result = work => result,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builder::build;
    use crate::cluster::{MockClusterClient, UnitStatus};
    use crate::config::RunnerConfig;
    use crate::request::{ExecutionId, ExecutionRequest};
    use mockall::predicate::eq;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    const BUDGET: Duration = Duration::from_secs(30);

    fn polling() -> PollingConfig {
        PollingConfig {
            interval_millis: 1,
            max_interval_millis: 4,
            max_errors: 2,
        }
    }

    fn spec() -> UnitSpec {
        build(
            &ExecutionRequest::new("golang", ["go test ./..."]),
            &ExecutionId::new("ci0"),
            &RunnerConfig::default(),
            Duration::from_secs(60),
        )
        .unwrap()
    }

    fn accepting_cluster() -> MockClusterClient {
        let mut cluster = MockClusterClient::new();
        cluster.expect_ensure_namespace().returning(|_| Ok(()));
        cluster.expect_create_unit().returning(|_| Ok(()));
        cluster
    }

    fn far_deadline() -> Instant {
        Instant::now() + Duration::from_secs(30)
    }

    #[test]
    fn backoff_doubles_up_to_max() {
        let mut backoff = Backoff::new(Duration::from_millis(100), Duration::from_millis(350));
        let delays: Vec<_> = (0..5).map(|_| backoff.next_delay().as_millis()).collect();
        assert_eq!(delays, vec![100, 200, 350, 350, 350]);
    }

    #[test]
    fn backoff_max_never_below_initial() {
        let mut backoff = Backoff::new(Duration::from_millis(100), Duration::from_millis(10));
        assert_eq!(backoff.next_delay(), Duration::from_millis(100));
        assert_eq!(backoff.next_delay(), Duration::from_millis(100));
    }

    #[tokio::test]
    async fn follows_unit_to_success() {
        let mut cluster = accepting_cluster();
        let phases = [UnitPhase::Pending, UnitPhase::Running, UnitPhase::Succeeded];
        let mut calls = 0;
        cluster
            .expect_unit_status()
            .with(eq("ci0"), eq("ci0"))
            .times(3)
            .returning(move |_, _| {
                let phase = phases[calls];
                calls += 1;
                Ok(UnitStatus::new(phase))
            });

        let polling = polling();
        let controller = LifecycleController::new(&cluster, &polling, false);
        let outcome = controller
            .run(&spec(), far_deadline(), BUDGET, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(outcome, Outcome::Succeeded);
    }

    #[tokio::test]
    async fn failed_unit_reports_exit_code() {
        let mut cluster = accepting_cluster();
        cluster
            .expect_unit_status()
            .returning(|_, _| Ok(UnitStatus::new(UnitPhase::Failed).with_exit_code(1)));

        let polling = polling();
        let outcome = LifecycleController::new(&cluster, &polling, false)
            .run(&spec(), far_deadline(), BUDGET, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(outcome, Outcome::Failed { exit_code: Some(1) });
    }

    #[tokio::test]
    async fn stale_observations_do_not_move_phase_backwards() {
        let mut cluster = accepting_cluster();
        let phases = [
            UnitPhase::Running,
            UnitPhase::Pending,
            UnitPhase::Running,
            UnitPhase::Succeeded,
        ];
        let mut calls = 0;
        cluster.expect_unit_status().times(4).returning(move |_, _| {
            let phase = phases[calls];
            calls += 1;
            Ok(UnitStatus::new(phase))
        });

        let polling = polling();
        let outcome = LifecycleController::new(&cluster, &polling, false)
            .run(&spec(), far_deadline(), BUDGET, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(outcome, Outcome::Succeeded);
    }

    #[tokio::test]
    async fn transient_poll_errors_are_tolerated() {
        let mut cluster = accepting_cluster();
        let mut calls = 0;
        cluster.expect_unit_status().returning(move |_, _| {
            calls += 1;
            match calls {
                1 | 2 => Err(ClusterError::Transport("connection reset".to_string())),
                _ => Ok(UnitStatus::new(UnitPhase::Succeeded)),
            }
        });

        let polling = polling();
        let outcome = LifecycleController::new(&cluster, &polling, false)
            .run(&spec(), far_deadline(), BUDGET, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(outcome, Outcome::Succeeded);
    }

    #[tokio::test]
    async fn unreachable_cluster_fails_and_deletes_unit() {
        let mut cluster = accepting_cluster();
        cluster
            .expect_unit_status()
            .times(3)
            .returning(|_, _| Err(ClusterError::Transport("connection refused".to_string())));
        cluster
            .expect_delete_unit()
            .with(eq("ci0"), eq("ci0"))
            .times(1)
            .returning(|_, _| Ok(()));

        let polling = polling();
        let err = LifecycleController::new(&cluster, &polling, false)
            .run(&spec(), far_deadline(), BUDGET, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            ExecutionError::ClusterUnavailable {
                operation: "poll",
                ..
            }
        ));
    }

    #[tokio::test]
    async fn scheduling_failure_is_not_retried() {
        let mut cluster = accepting_cluster();
        cluster.expect_unit_status().times(1).returning(|_, _| {
            Ok(UnitStatus::new(UnitPhase::SchedulingFailed).with_reason("ErrImagePull"))
        });
        cluster.expect_delete_unit().times(1).returning(|_, _| Ok(()));

        let polling = polling();
        let err = LifecycleController::new(&cluster, &polling, false)
            .run(&spec(), far_deadline(), BUDGET, &CancellationToken::new())
            .await
            .unwrap_err();
        match err {
            ExecutionError::SchedulingFailed { name, reason } => {
                assert_eq!(name, "ci0");
                assert_eq!(reason, "ErrImagePull");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn existing_unit_is_left_alone() {
        let mut cluster = MockClusterClient::new();
        cluster.expect_ensure_namespace().returning(|_| Ok(()));
        cluster
            .expect_create_unit()
            .returning(|spec| Err(ClusterError::AlreadyExists(format!("job {}", spec.name))));
        cluster.expect_unit_status().never();
        cluster.expect_delete_unit().never();

        let polling = polling();
        let err = LifecycleController::new(&cluster, &polling, false)
            .run(&spec(), far_deadline(), BUDGET, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, ExecutionError::AlreadyExists { .. }));
    }

    #[tokio::test]
    async fn rejected_object_is_invalid_spec() {
        let mut cluster = MockClusterClient::new();
        cluster.expect_ensure_namespace().returning(|_| Ok(()));
        cluster.expect_create_unit().returning(|_| {
            Err(ClusterError::Api {
                code: 422,
                message: "spec.template.spec.containers[0].image: Required value".to_string(),
            })
        });

        let polling = polling();
        let err = LifecycleController::new(&cluster, &polling, false)
            .run(&spec(), far_deadline(), BUDGET, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, ExecutionError::InvalidSpec(_)));
    }

    #[tokio::test]
    async fn deadline_deletes_unit() {
        let mut cluster = accepting_cluster();
        cluster
            .expect_unit_status()
            .returning(|_, _| Ok(UnitStatus::new(UnitPhase::Running)));
        cluster.expect_delete_unit().times(1).returning(|_, _| Ok(()));

        let polling = polling();
        let deadline = Instant::now() + Duration::from_millis(50);
        let err = LifecycleController::new(&cluster, &polling, false)
            .run(&spec(), deadline, BUDGET, &CancellationToken::new())
            .await
            .unwrap_err();
        match err {
            ExecutionError::ExecutionTimeout { timeout, .. } => assert_eq!(timeout, BUDGET),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn cancellation_deletes_unit() {
        let mut cluster = accepting_cluster();
        let polls = Arc::new(AtomicU32::new(0));
        let seen = Arc::clone(&polls);
        cluster.expect_unit_status().returning(move |_, _| {
            seen.fetch_add(1, Ordering::SeqCst);
            Ok(UnitStatus::new(UnitPhase::Running))
        });
        cluster.expect_delete_unit().times(1).returning(|_, _| Ok(()));

        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(30)).await;
            trigger.cancel();
        });

        let polling = polling();
        let err = LifecycleController::new(&cluster, &polling, false)
            .run(&spec(), far_deadline(), BUDGET, &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, ExecutionError::Canceled { .. }));
        assert!(polls.load(Ordering::SeqCst) > 0);
    }

    #[tokio::test]
    async fn delete_failure_does_not_mask_timeout() {
        let mut cluster = accepting_cluster();
        cluster
            .expect_unit_status()
            .returning(|_, _| Ok(UnitStatus::new(UnitPhase::Pending)));
        cluster.expect_delete_unit().returning(|_, _| {
            Err(ClusterError::Api {
                code: 403,
                message: "forbidden".to_string(),
            })
        });

        let polling = polling();
        let deadline = Instant::now() + Duration::from_millis(20);
        let err = LifecycleController::new(&cluster, &polling, false)
            .run(&spec(), deadline, BUDGET, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, ExecutionError::ExecutionTimeout { .. }));
    }

    #[tokio::test]
    async fn terminating_namespace_is_already_exists() {
        let mut cluster = MockClusterClient::new();
        cluster
            .expect_ensure_namespace()
            .returning(|ns| Err(ClusterError::AlreadyExists(format!("namespace {ns} (terminating)"))));
        cluster.expect_create_unit().never();
        cluster.expect_delete_unit().never();
        cluster.expect_delete_namespace().never();

        let polling = polling();
        let err = LifecycleController::new(&cluster, &polling, true)
            .run(&spec(), far_deadline(), BUDGET, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, ExecutionError::AlreadyExists { .. }), "{err}");
    }

    /// Cluster whose create call never returns.
    #[derive(Default)]
    struct StalledCreate {
        deletes: AtomicU32,
    }

    #[async_trait::async_trait]
    impl ClusterClient for StalledCreate {
        async fn ensure_namespace(&self, _namespace: &str) -> Result<(), ClusterError> {
            Ok(())
        }

        async fn create_unit(&self, _spec: &UnitSpec) -> Result<(), ClusterError> {
            std::future::pending().await
        }

        async fn unit_status(&self, namespace: &str, name: &str) -> Result<UnitStatus, ClusterError> {
            Err(ClusterError::NotFound(format!("job {namespace}/{name}")))
        }

        async fn read_logs(&self, namespace: &str, name: &str) -> Result<String, ClusterError> {
            Err(ClusterError::NotFound(format!("pod of job {namespace}/{name}")))
        }

        async fn delete_unit(&self, _namespace: &str, _name: &str) -> Result<(), ClusterError> {
            self.deletes.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn delete_namespace(&self, _namespace: &str) -> Result<(), ClusterError> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn cancellation_interrupts_a_stalled_submit() {
        let cluster = StalledCreate::default();
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            trigger.cancel();
        });

        let polling = polling();
        let err = LifecycleController::new(&cluster, &polling, false)
            .run(&spec(), far_deadline(), BUDGET, &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, ExecutionError::Canceled { .. }), "{err}");
        assert_eq!(cluster.deletes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn deadline_interrupts_a_stalled_submit() {
        let cluster = StalledCreate::default();
        let polling = polling();
        let deadline = Instant::now() + Duration::from_millis(20);

        let err = LifecycleController::new(&cluster, &polling, false)
            .run(&spec(), deadline, BUDGET, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, ExecutionError::ExecutionTimeout { .. }), "{err}");
        assert_eq!(cluster.deletes.load(Ordering::SeqCst), 1);
    }
}
