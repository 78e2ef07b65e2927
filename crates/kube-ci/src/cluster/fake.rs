//! In-memory [`ClusterClient`] for tests.
//!
//! Units advance one phase every `polls_per_phase` status queries. What a
//! unit does is decided by a [`Scenario`]; by default the scenario is read
//! off the unit's script, which understands `echo`, `echo -n`, `true`,
//! `false`, `exit N` and `sleep` (a unit that sleeps never finishes).

use std::collections::{BTreeSet, HashMap};

use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::debug;

use super::{ClusterClient, ClusterError, UnitPhase, UnitStatus};
use crate::builder::UnitSpec;

/// How a fake unit behaves.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Scenario {
    /// Runs to completion, printing `output`
    Complete { output: String, exit_code: i32 },
    /// Stays `Running` forever
    Hang,
    /// Never starts; reported as a scheduling failure
    Unschedulable { reason: String },
    /// Succeeds, but its logs are gone by the time they are read
    LogsLost,
}

impl Scenario {
    /// A unit that prints `output` and exits 0.
    #[must_use]
    pub fn succeed(output: impl Into<String>) -> Self {
        Self::Complete {
            output: output.into(),
            exit_code: 0,
        }
    }

    /// Interpret a shell script well enough to drive tests.
    #[must_use]
    pub fn from_script(script: &str) -> Self {
        let mut output = String::new();
        let mut status = 0;

        for line in script.lines().map(str::trim) {
            let (command, args) = line.split_once(' ').unwrap_or((line, ""));
            match command {
                "echo" => {
                    status = 0;
                    match args.strip_prefix("-n") {
                        Some(rest) if rest.is_empty() || rest.starts_with(' ') => {
                            output.push_str(unquote(rest.trim()));
                        }
                        _ => {
                            output.push_str(unquote(args.trim()));
                            output.push('\n');
                        }
                    }
                }
                "true" => status = 0,
                "false" => status = 1,
                "exit" => {
                    status = args.trim().parse().unwrap_or(0);
                    break;
                }
                "sleep" => return Self::Hang,
                _ => {}
            }
        }

        Self::Complete {
            output,
            exit_code: status,
        }
    }
}

fn unquote(arg: &str) -> &str {
    for quote in ['"', '\''] {
        if let Some(inner) = arg
            .strip_prefix(quote)
            .and_then(|rest| rest.strip_suffix(quote))
        {
            return inner;
        }
    }
    arg
}

type ScenarioFn = dyn Fn(&UnitSpec) -> Scenario + Send + Sync;
type UnitKey = (String, String);

struct FakeUnit {
    uid: u64,
    terminating: bool,
}

/// The pod behind a unit. Pods are keyed by unit name, like the `job-name`
/// label, and point back at the unit that owns them.
struct FakePod {
    owner: u64,
    scenario: Scenario,
    polls: u32,
}

#[derive(Default)]
struct FakeState {
    namespaces: BTreeSet<String>,
    terminating_namespaces: BTreeSet<String>,
    units: HashMap<UnitKey, FakeUnit>,
    pods: HashMap<UnitKey, Vec<FakePod>>,
    next_uid: u64,
    created: usize,
    live_peak: usize,
    fail_deletes: bool,
}

impl FakeState {
    fn live_units(&self) -> usize {
        self.units.values().filter(|u| !u.terminating).count()
    }

    /// The pod owned by the unit currently registered under `unit_key`.
    fn pod_of(&mut self, unit_key: &UnitKey) -> Option<&mut FakePod> {
        let uid = self.units.get(unit_key)?.uid;
        self.pods
            .get_mut(unit_key)?
            .iter_mut()
            .rev()
            .find(|pod| pod.owner == uid)
    }

    fn drop_pods_of(&mut self, unit_key: &UnitKey, uid: u64) {
        if let Some(pods) = self.pods.get_mut(unit_key) {
            pods.retain(|pod| pod.owner != uid);
            if pods.is_empty() {
                self.pods.remove(unit_key);
            }
        }
    }
}

/// In-memory cluster.
pub struct FakeCluster {
    scenario: Box<ScenarioFn>,
    polls_per_phase: u32,
    linger_deletes: bool,
    orphan_pods: bool,
    state: Mutex<FakeState>,
}

impl Default for FakeCluster {
    fn default() -> Self {
        Self::new()
    }
}

impl FakeCluster {
    /// A cluster whose units behave as their scripts say.
    #[must_use]
    pub fn new() -> Self {
        Self {
            scenario: Box::new(|spec: &UnitSpec| {
                Scenario::from_script(spec.script().unwrap_or_default())
            }),
            polls_per_phase: 1,
            linger_deletes: false,
            orphan_pods: false,
            state: Mutex::new(FakeState::default()),
        }
    }

    /// Decide unit behaviour with `scenario` instead of the script.
    #[must_use]
    pub fn with_scenario(
        mut self,
        scenario: impl Fn(&UnitSpec) -> Scenario + Send + Sync + 'static,
    ) -> Self {
        self.scenario = Box::new(scenario);
        self
    }

    /// Number of status queries a unit spends in each non-terminal phase.
    #[must_use]
    pub fn with_polls_per_phase(mut self, polls: u32) -> Self {
        self.polls_per_phase = polls.max(1);
        self
    }

    /// Deleted units and namespaces keep their name until
    /// [`FakeCluster::finish_deletions`]. A terminating namespace refuses new
    /// units.
    #[must_use]
    pub fn with_lingering_deletes(mut self) -> Self {
        self.linger_deletes = true;
        self
    }

    /// Pods outlive their deleted unit, as with background propagation before
    /// the garbage collector catches up.
    #[must_use]
    pub fn with_orphaned_pods(mut self) -> Self {
        self.orphan_pods = true;
        self
    }

    /// Pre-create a namespace (for the shared namespace policy).
    #[must_use]
    pub fn with_namespace(mut self, namespace: &str) -> Self {
        self.state
            .get_mut()
            .namespaces
            .insert(namespace.to_string());
        self
    }

    /// Make every delete call fail until switched off again.
    pub async fn fail_deletes(&self, fail: bool) {
        self.state.lock().await.fail_deletes = fail;
    }

    /// Complete all pending (lingering) deletions.
    pub async fn finish_deletions(&self) {
        let mut state = self.state.lock().await;

        for namespace in std::mem::take(&mut state.terminating_namespaces) {
            state.namespaces.remove(&namespace);
            state.units.retain(|(ns, _), _| *ns != namespace);
            state.pods.retain(|(ns, _), _| *ns != namespace);
        }

        let finished: Vec<(UnitKey, u64)> = state
            .units
            .iter()
            .filter(|(_, unit)| unit.terminating)
            .map(|(unit_key, unit)| (unit_key.clone(), unit.uid))
            .collect();
        for (unit_key, uid) in finished {
            state.units.remove(&unit_key);
            if !self.orphan_pods {
                state.drop_pods_of(&unit_key, uid);
            }
        }
    }

    /// True if a live (not terminating) unit exists under that name.
    pub async fn contains_unit(&self, namespace: &str, name: &str) -> bool {
        self.state
            .lock()
            .await
            .units
            .get(&(namespace.to_string(), name.to_string()))
            .is_some_and(|unit| !unit.terminating)
    }

    /// Number of live units.
    pub async fn unit_count(&self) -> usize {
        self.state.lock().await.live_units()
    }

    /// Number of pods, including those left behind by deleted units.
    pub async fn pod_count(&self) -> usize {
        self.state.lock().await.pods.values().map(Vec::len).sum()
    }

    /// True if the namespace exists, terminating or not.
    pub async fn has_namespace(&self, namespace: &str) -> bool {
        self.state.lock().await.namespaces.contains(namespace)
    }

    /// Number of namespaces, terminating ones included.
    pub async fn namespace_count(&self) -> usize {
        self.state.lock().await.namespaces.len()
    }

    /// Total number of units ever created.
    pub async fn created_count(&self) -> usize {
        self.state.lock().await.created
    }

    /// Highest number of units that were live at the same time.
    pub async fn peak_live_units(&self) -> usize {
        self.state.lock().await.live_peak
    }
}

fn key(namespace: &str, name: &str) -> UnitKey {
    (namespace.to_string(), name.to_string())
}

#[async_trait]
impl ClusterClient for FakeCluster {
    async fn ensure_namespace(&self, namespace: &str) -> Result<(), ClusterError> {
        let mut state = self.state.lock().await;
        if state.terminating_namespaces.contains(namespace) {
            return Err(ClusterError::AlreadyExists(format!(
                "namespace {namespace} (terminating)"
            )));
        }
        state.namespaces.insert(namespace.to_string());
        Ok(())
    }

    async fn create_unit(&self, spec: &UnitSpec) -> Result<(), ClusterError> {
        let scenario = (self.scenario)(spec);
        let mut state = self.state.lock().await;

        if !state.namespaces.contains(&spec.namespace) {
            return Err(ClusterError::NotFound(format!(
                "namespace {}",
                spec.namespace
            )));
        }
        if state.terminating_namespaces.contains(&spec.namespace) {
            return Err(ClusterError::AlreadyExists(format!(
                "job {}/{} (namespace terminating)",
                spec.namespace, spec.name
            )));
        }

        let unit_key = key(&spec.namespace, &spec.name);
        if state.units.contains_key(&unit_key) {
            return Err(ClusterError::AlreadyExists(format!(
                "job {}/{}",
                spec.namespace, spec.name
            )));
        }

        debug!(namespace = %spec.namespace, name = %spec.name, ?scenario, "Fake unit created");
        state.next_uid += 1;
        let uid = state.next_uid;
        state.units.insert(
            unit_key.clone(),
            FakeUnit {
                uid,
                terminating: false,
            },
        );
        state.pods.entry(unit_key).or_default().push(FakePod {
            owner: uid,
            scenario,
            polls: 0,
        });
        state.created += 1;
        state.live_peak = state.live_peak.max(state.live_units());
        Ok(())
    }

    async fn unit_status(&self, namespace: &str, name: &str) -> Result<UnitStatus, ClusterError> {
        let step = self.polls_per_phase;
        let unit_key = key(namespace, name);
        let mut state = self.state.lock().await;
        if !state.units.contains_key(&unit_key) {
            return Err(ClusterError::NotFound(format!("job {namespace}/{name}")));
        }
        let Some(pod) = state.pod_of(&unit_key) else {
            return Ok(UnitStatus::new(UnitPhase::Pending));
        };

        pod.polls += 1;
        let polls = pod.polls;

        let status = match &pod.scenario {
            _ if polls <= step => UnitStatus::new(UnitPhase::Pending),
            Scenario::Unschedulable { reason } => {
                UnitStatus::new(UnitPhase::SchedulingFailed).with_reason(reason.clone())
            }
            Scenario::Hang => UnitStatus::new(UnitPhase::Running),
            _ if polls <= 2 * step => UnitStatus::new(UnitPhase::Running),
            Scenario::Complete { exit_code: 0, .. } | Scenario::LogsLost => {
                UnitStatus::new(UnitPhase::Succeeded).with_exit_code(0)
            }
            Scenario::Complete { exit_code, .. } => UnitStatus::new(UnitPhase::Failed)
                .with_reason("Error")
                .with_exit_code(*exit_code),
        };
        Ok(status)
    }

    async fn read_logs(&self, namespace: &str, name: &str) -> Result<String, ClusterError> {
        let mut state = self.state.lock().await;
        let pod = state
            .pod_of(&key(namespace, name))
            .ok_or_else(|| ClusterError::NotFound(format!("pod of job {namespace}/{name}")))?;

        match &pod.scenario {
            Scenario::Complete { output, .. } => Ok(output.clone()),
            Scenario::Hang => Ok(String::new()),
            Scenario::LogsLost => Err(ClusterError::NotFound(format!(
                "pod of job {namespace}/{name}"
            ))),
            Scenario::Unschedulable { .. } => Err(ClusterError::Api {
                code: 400,
                message: format!("container \"runner\" in pod {name} is waiting to start"),
            }),
        }
    }

    async fn delete_unit(&self, namespace: &str, name: &str) -> Result<(), ClusterError> {
        let mut state = self.state.lock().await;
        if state.fail_deletes {
            return Err(ClusterError::Api {
                code: 403,
                message: "jobs.batch is forbidden".to_string(),
            });
        }

        let unit_key = key(namespace, name);
        if self.linger_deletes {
            return match state.units.get_mut(&unit_key) {
                Some(unit) if !unit.terminating => {
                    unit.terminating = true;
                    Ok(())
                }
                _ => Err(ClusterError::NotFound(format!("job {namespace}/{name}"))),
            };
        }

        let unit = state
            .units
            .remove(&unit_key)
            .ok_or_else(|| ClusterError::NotFound(format!("job {namespace}/{name}")))?;
        if !self.orphan_pods {
            state.drop_pods_of(&unit_key, unit.uid);
        }
        Ok(())
    }

    async fn delete_namespace(&self, namespace: &str) -> Result<(), ClusterError> {
        let mut state = self.state.lock().await;
        if state.fail_deletes {
            return Err(ClusterError::Api {
                code: 403,
                message: "namespaces is forbidden".to_string(),
            });
        }

        if !state.namespaces.contains(namespace)
            || state.terminating_namespaces.contains(namespace)
        {
            return Err(ClusterError::NotFound(format!("namespace {namespace}")));
        }

        if self.linger_deletes {
            state.terminating_namespaces.insert(namespace.to_string());
        } else {
            state.namespaces.remove(namespace);
            state.units.retain(|(ns, _), _| ns != namespace);
            state.pods.retain(|(ns, _), _| ns != namespace);
        }
        Ok(())
    }
}
