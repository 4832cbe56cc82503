//! Helper lifecycle: launch a CPU-stress workload on a node, watch it run,
//! and tear it down.
//!
//! Each launched helper gets its own monitor task that owns the helper's
//! `HelperTask` record. Callers hold a `HelperHandle`, which can observe the
//! record and send control requests, but never mutate it.

mod monitor;

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::Instant;
use tracing::{info, warn};

use crate::cluster::{ClusterApi, WorkloadSpec};
use crate::config::{ExperimentConfig, OrchestratorSettings, PullPolicy};
use crate::error::HelperError;
use crate::state::{HelperTask, StateJournal};
use crate::targets::TargetNode;
use crate::types::NodeName;

use monitor::{Control, Monitor, MonitorTiming, teardown_task};

const STRESS_COMMAND: &str = "stress-ng";
const PART_OF_LABEL: &str = "app.kubernetes.io/part-of";
/// Stand-in for a deadline that cannot be represented.
const FAR_FUTURE: Duration = Duration::from_secs(30 * 365 * 24 * 60 * 60);

/// `start + after`, clamped to a far-future instant instead of overflowing.
pub(crate) fn deadline_after(start: Instant, after: Duration) -> Instant {
    start
        .checked_add(after)
        .or_else(|| start.checked_add(FAR_FUTURE))
        .unwrap_or(start)
}

/// Per-run helper parameters, derived once from the experiment config.
#[derive(Debug, Clone)]
pub struct HelperTemplate {
    pub name_prefix: String,
    pub namespace: String,
    pub image: String,
    pub pull_policy: PullPolicy,
    /// 0 sizes each helper to its node's allocatable CPU.
    pub cpu_cores: u32,
    pub cpu_load: u8,
    pub duration: Duration,
    pub timeout: Duration,
    pub termination_grace: Duration,
    pub labels: BTreeMap<String, String>,
}

impl HelperTemplate {
    pub fn from_config(cfg: &ExperimentConfig) -> Self {
        let name_prefix = format!("{}-helper-{}", cfg.experiment_name, cfg.run_id);

        let mut labels = BTreeMap::new();
        labels.insert("app".to_string(), name_prefix.clone());
        labels.insert("name".to_string(), name_prefix.clone());
        labels.insert(PART_OF_LABEL.to_string(), cfg.chaos_lib.clone());
        labels.insert("runID".to_string(), cfg.run_id.to_string());
        for (key, value) in [
            ("chaosUID", &cfg.chaos_uid),
            ("chaosEngine", &cfg.engine_name),
            ("instanceID", &cfg.instance_id),
        ] {
            if !value.is_empty() {
                labels.insert(key.to_string(), value.clone());
            }
        }

        Self {
            name_prefix,
            namespace: cfg.chaos_namespace.clone(),
            image: cfg.image.clone(),
            pull_policy: cfg.image_pull_policy,
            cpu_cores: cfg.cpu_cores,
            cpu_load: cfg.cpu_load,
            duration: cfg.chaos_duration,
            timeout: cfg.timeout,
            termination_grace: cfg.termination_grace_period,
            labels,
        }
    }

    /// Cores to stress on `target`.
    pub fn cores_for(&self, target: &TargetNode) -> u32 {
        if self.cpu_cores > 0 {
            self.cpu_cores
        } else {
            target.allocatable_cpu.unwrap_or(1).max(1)
        }
    }

    pub fn workload_for(&self, target: &TargetNode) -> WorkloadSpec {
        let cores = self.cores_for(target);
        let mut labels = self.labels.clone();
        labels.insert("node".to_string(), target.name.to_string());

        WorkloadSpec {
            name_prefix: self.name_prefix.clone(),
            namespace: self.namespace.clone(),
            node: target.name.clone(),
            image: self.image.clone(),
            pull_policy: self.pull_policy,
            command: vec![STRESS_COMMAND.to_string()],
            args: vec![
                "--cpu".to_string(),
                cores.to_string(),
                "--cpu-load".to_string(),
                self.cpu_load.to_string(),
                "--timeout".to_string(),
                format!("{}s", self.duration.as_secs()),
            ],
            cpu_cores: cores,
            labels,
            termination_grace: self.termination_grace,
            duration: self.duration,
        }
    }
}

/// A launched helper, observed through its monitor.
pub struct HelperHandle {
    node: NodeName,
    state: watch::Receiver<HelperTask>,
    control: mpsc::Sender<Control>,
}

impl HelperHandle {
    pub fn node(&self) -> &NodeName {
        &self.node
    }

    /// Latest snapshot of the helper's record.
    pub fn task(&self) -> HelperTask {
        self.state.borrow().clone()
    }

    /// Wait until the helper has an outcome.
    pub async fn finished(&mut self) -> HelperTask {
        let outcome = self
            .state
            .wait_for(|t| t.phase.is_terminal())
            .await
            .map(|task| (*task).clone());
        match outcome {
            Ok(task) => task,
            Err(_) => self.task(),
        }
    }

    /// Ask the monitor to stop watching. A helper without an outcome is
    /// recorded as failed with `reason`.
    pub async fn stop(&self, reason: impl Into<String>) {
        let _ = self.control.send(Control::Stop(reason.into())).await;
    }
}

pub struct HelperLifecycleManager {
    cluster: Arc<dyn ClusterApi>,
    journal: Arc<StateJournal>,
    settings: OrchestratorSettings,
}

impl HelperLifecycleManager {
    pub fn new(
        cluster: Arc<dyn ClusterApi>,
        journal: Arc<StateJournal>,
        settings: OrchestratorSettings,
    ) -> Self {
        Self {
            cluster,
            journal,
            settings,
        }
    }

    /// Start a helper on `target` and return as soon as the workload exists.
    ///
    /// A workload the cluster refuses to create is recorded as a failed task
    /// and reported as a scheduling error. It is not retried.
    pub async fn launch(
        &self,
        target: &TargetNode,
        template: &HelperTemplate,
    ) -> Result<HelperHandle, HelperError> {
        let spec = template.workload_for(target);

        let workload = match self.cluster.create_workload(&spec).await {
            Ok(id) => id,
            Err(e) => {
                let err = HelperError::Scheduling {
                    node: target.name.clone(),
                    reason: e.to_string(),
                };
                warn!(node = %target.name, error = %e, "helper could not be placed");
                self.journal
                    .record_task(&HelperTask::unscheduled(target.name.clone(), err.to_string()))
                    .await;
                return Err(err);
            }
        };

        info!(
            node = %target.name,
            workload = %workload,
            cores = spec.cpu_cores,
            load = template.cpu_load,
            duration_secs = template.duration.as_secs(),
            "helper launched"
        );

        let task = HelperTask::pending(target.name.clone(), workload.clone());
        self.journal.record_task(&task).await;

        let (state_tx, state_rx) = watch::channel(task.clone());
        let (control_tx, control_rx) = mpsc::channel(8);
        let monitor = Monitor {
            cluster: self.cluster.clone(),
            journal: self.journal.clone(),
            task,
            workload,
            launched: Instant::now(),
            timing: MonitorTiming {
                poll_interval: self.settings.poll_interval,
                duration: template.duration,
                bound: template.duration.saturating_add(template.timeout),
                termination_grace: template.termination_grace,
                teardown_retry: self.settings.teardown_retry.clone(),
            },
            state: state_tx,
            control: control_rx,
        };
        tokio::spawn(monitor.run());

        Ok(HelperHandle {
            node: target.name.clone(),
            state: state_rx,
            control: control_tx,
        })
    }

    /// Remove the helper's workload. Calling this on a cleaned helper is a
    /// no-op.
    pub async fn teardown(&self, handle: &HelperHandle) -> Result<HelperTask, HelperError> {
        let current = handle.task();
        if current.is_cleaned() {
            return Ok(current);
        }

        let (reply_tx, reply_rx) = oneshot::channel();
        if handle.control.send(Control::Teardown(reply_tx)).await.is_ok() {
            if let Ok(result) = reply_rx.await {
                return result;
            }
        }

        let settled = handle.task();
        if settled.is_cleaned() {
            Ok(settled)
        } else {
            Err(HelperError::MonitorGone(handle.node.clone()))
        }
    }

    /// Tear down a helper known only from persisted state.
    pub async fn teardown_detached(
        &self,
        mut task: HelperTask,
        grace: Duration,
    ) -> Result<HelperTask, HelperError> {
        let result = teardown_task(
            self.cluster.as_ref(),
            &self.journal,
            &mut task,
            &self.settings.teardown_retry,
            grace,
            self.settings.poll_interval,
        )
        .await;
        self.journal.record_task(&task).await;
        result.map(|_| task)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::simulated::ClusterEvent;
    use crate::cluster::{NodeBehavior, SimOutcome, SimulatedCluster};
    use crate::config::SequenceMode;
    use crate::config::tests::raw_config;
    use crate::retry::RetryPolicy;
    use crate::state::{ExperimentState, HelperPhase, MemoryStateRecorder};
    use crate::targets::NodeReadiness;
    use crate::types::RunId;

    fn template() -> HelperTemplate {
        HelperTemplate::from_config(&ExperimentConfig::try_from(raw_config()).unwrap())
    }

    fn target(node: &str) -> TargetNode {
        TargetNode {
            name: NodeName::new(node),
            readiness: NodeReadiness::Ready,
            allocatable_cpu: Some(4),
        }
    }

    fn settings() -> OrchestratorSettings {
        OrchestratorSettings {
            poll_interval: Duration::from_secs(1),
            teardown_retry: RetryPolicy::with_max_attempts(3),
        }
    }

    fn setup(cluster: &Arc<SimulatedCluster>) -> (Arc<StateJournal>, HelperLifecycleManager) {
        let journal = Arc::new(StateJournal::new(
            ExperimentState::new(RunId::new("abc123"), "node-cpu-hog", SequenceMode::Parallel),
            Arc::new(MemoryStateRecorder::new()),
        ));
        let manager = HelperLifecycleManager::new(cluster.clone(), journal.clone(), settings());
        (journal, manager)
    }

    fn setup_recorded(
        cluster: &Arc<SimulatedCluster>,
    ) -> (Arc<MemoryStateRecorder>, HelperLifecycleManager) {
        let recorder = Arc::new(MemoryStateRecorder::new());
        let journal = Arc::new(StateJournal::new(
            ExperimentState::new(RunId::new("abc123"), "node-cpu-hog", SequenceMode::Parallel),
            recorder.clone(),
        ));
        let manager = HelperLifecycleManager::new(cluster.clone(), journal, settings());
        (recorder, manager)
    }

    async fn delete_requests(cluster: &SimulatedCluster) -> Vec<Duration> {
        cluster
            .events()
            .await
            .into_iter()
            .filter_map(|(_, ev)| match ev {
                ClusterEvent::DeleteRequested { grace, .. } => Some(grace),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn test_workload_spec_from_template() {
        let spec = template().workload_for(&target("n1"));
        assert_eq!(spec.node.as_str(), "n1");
        assert_eq!(spec.namespace, "litmus");
        assert_eq!(spec.command, vec!["stress-ng".to_string()]);
        assert_eq!(
            spec.args,
            vec!["--cpu", "4", "--cpu-load", "100", "--timeout", "60s"]
        );
        assert_eq!(spec.labels.get("runID").map(String::as_str), Some("abc123"));
        assert_eq!(spec.labels.get("node").map(String::as_str), Some("n1"));
        assert_eq!(spec.labels.get("chaosEngine").map(String::as_str), Some("engine"));
        assert!(!spec.labels.contains_key("instanceID"));
        assert_eq!(spec.termination_grace, Duration::from_secs(5));
    }

    #[tokio::test(start_paused = true)]
    async fn test_deadline_never_overflows() {
        let now = Instant::now();
        assert_eq!(deadline_after(now, Duration::from_secs(5)), now + Duration::from_secs(5));
        assert!(deadline_after(now, Duration::MAX) > now);
    }

    #[test]
    fn test_cpu_cores_auto_sizing() {
        let mut tpl = template();
        assert_eq!(tpl.cores_for(&target("n1")), 4);

        let unknown = TargetNode {
            allocatable_cpu: None,
            ..target("n2")
        };
        assert_eq!(tpl.cores_for(&unknown), 1);

        tpl.cpu_cores = 2;
        assert_eq!(tpl.cores_for(&target("n1")), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_helper_runs_to_success_and_is_cleaned() {
        let cluster = Arc::new(SimulatedCluster::with_nodes(["n1"]));
        let (journal, manager) = setup(&cluster);

        let mut handle = manager.launch(&target("n1"), &template()).await.unwrap();
        assert_eq!(handle.task().phase, HelperPhase::Pending);

        let done = handle.finished().await;
        assert_eq!(done.phase, HelperPhase::Succeeded);

        let cleaned = manager.teardown(&handle).await.unwrap();
        assert_eq!(cleaned.phase, HelperPhase::Cleaned);
        assert_eq!(cleaned.outcome, Some(HelperPhase::Succeeded));
        assert!(cluster.live_workloads().await.is_empty());

        let state = journal.snapshot().await;
        assert_eq!(state.task(&NodeName::new("n1")).unwrap().phase, HelperPhase::Cleaned);
    }

    #[tokio::test(start_paused = true)]
    async fn test_teardown_is_idempotent() {
        let cluster = Arc::new(SimulatedCluster::with_nodes(["n1"]));
        let (_journal, manager) = setup(&cluster);

        let mut handle = manager.launch(&target("n1"), &template()).await.unwrap();
        handle.finished().await;
        manager.teardown(&handle).await.unwrap();
        let requests = delete_requests(&cluster).await.len();

        let again = manager.teardown(&handle).await.unwrap();
        assert_eq!(again.phase, HelperPhase::Cleaned);
        assert_eq!(delete_requests(&cluster).await.len(), requests);
    }

    #[tokio::test(start_paused = true)]
    async fn test_non_zero_exit_is_failed() {
        let cluster = Arc::new(SimulatedCluster::with_nodes(["n1"]));
        cluster
            .set_behavior(
                "n1",
                NodeBehavior::with_outcome(SimOutcome::Exit {
                    after: Duration::from_secs(20),
                    code: 137,
                }),
            )
            .await;
        let (_journal, manager) = setup(&cluster);

        let mut handle = manager.launch(&target("n1"), &template()).await.unwrap();
        let done = handle.finished().await;
        assert_eq!(done.phase, HelperPhase::Failed);
        assert_eq!(done.exit_code, Some(137));
        assert!(done.exit_reason.unwrap().contains("137"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_hanging_helper_times_out() {
        let cluster = Arc::new(SimulatedCluster::with_nodes(["n1"]));
        cluster
            .set_behavior("n1", NodeBehavior::with_outcome(SimOutcome::Hang))
            .await;
        let (_journal, manager) = setup(&cluster);

        let started = Instant::now();
        let mut handle = manager.launch(&target("n1"), &template()).await.unwrap();
        let done = handle.finished().await;
        assert_eq!(done.phase, HelperPhase::TimedOut);
        assert!(started.elapsed() >= Duration::from_secs(90));

        manager.teardown(&handle).await.unwrap();
        assert!(cluster.live_workloads().await.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_rejected_create_is_scheduling_error() {
        let cluster = Arc::new(SimulatedCluster::with_nodes(["n1"]));
        cluster
            .set_behavior(
                "n1",
                NodeBehavior::with_outcome(SimOutcome::RejectCreate("insufficient cpu".into())),
            )
            .await;
        let (journal, manager) = setup(&cluster);

        let err = manager.launch(&target("n1"), &template()).await.err().unwrap();
        assert!(matches!(err, HelperError::Scheduling { .. }));

        let state = journal.snapshot().await;
        let task = state.task(&NodeName::new("n1")).unwrap();
        assert_eq!(task.phase, HelperPhase::Failed);
        assert!(task.workload_id.is_none());
        assert!(task.exit_reason.as_deref().unwrap().contains("insufficient cpu"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_unschedulable_workload_fails() {
        let cluster = Arc::new(SimulatedCluster::with_nodes(["n1"]));
        cluster
            .set_behavior(
                "n1",
                NodeBehavior::with_outcome(SimOutcome::Unschedulable("node is cordoned".into())),
            )
            .await;
        let (_journal, manager) = setup(&cluster);

        let mut handle = manager.launch(&target("n1"), &template()).await.unwrap();
        let done = handle.finished().await;
        assert_eq!(done.phase, HelperPhase::Failed);
        assert!(done.exit_reason.unwrap().contains("node is cordoned"));

        manager.teardown(&handle).await.unwrap();
        assert!(cluster.live_workloads().await.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_stubborn_workload_is_force_deleted() {
        let cluster = Arc::new(SimulatedCluster::with_nodes(["n1"]));
        cluster
            .set_behavior(
                "n1",
                NodeBehavior {
                    ignored_deletes: 1,
                    ..Default::default()
                },
            )
            .await;
        let (_journal, manager) = setup(&cluster);

        let mut handle = manager.launch(&target("n1"), &template()).await.unwrap();
        handle.finished().await;
        manager.teardown(&handle).await.unwrap();

        assert_eq!(
            delete_requests(&cluster).await,
            vec![Duration::from_secs(5), Duration::ZERO]
        );
        assert!(cluster.live_workloads().await.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_teardown_exhaustion_marks_cleanup_pending() {
        let cluster = Arc::new(SimulatedCluster::with_nodes(["n1"]));
        cluster
            .set_behavior(
                "n1",
                NodeBehavior {
                    failing_deletes: 3,
                    ..Default::default()
                },
            )
            .await;
        let (journal, manager) = setup(&cluster);

        let mut handle = manager.launch(&target("n1"), &template()).await.unwrap();
        handle.finished().await;
        let err = manager.teardown(&handle).await.unwrap_err();
        assert!(matches!(err, HelperError::Teardown { attempts: 3, .. }));

        let state = journal.snapshot().await;
        let task = state.task(&NodeName::new("n1")).unwrap().clone();
        assert!(task.cleanup_pending);
        assert!(task.needs_teardown());
        assert_eq!(cluster.live_workloads().await.len(), 1);

        // The cluster recovers; a detached teardown finishes the job.
        let cleaned = manager
            .teardown_detached(task, Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(cleaned.phase, HelperPhase::Cleaned);
        assert!(!cleaned.cleanup_pending);
        assert!(cluster.live_workloads().await.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_marks_running_helper_failed() {
        let cluster = Arc::new(SimulatedCluster::with_nodes(["n1"]));
        let (_journal, manager) = setup(&cluster);

        let mut handle = manager.launch(&target("n1"), &template()).await.unwrap();
        tokio::time::sleep(Duration::from_secs(10)).await;
        handle.stop("aborted").await;

        let done = handle.finished().await;
        assert_eq!(done.phase, HelperPhase::Failed);
        assert_eq!(done.exit_reason.as_deref(), Some("aborted"));
        manager.teardown(&handle).await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_every_transition_is_persisted() {
        let cluster = Arc::new(SimulatedCluster::with_nodes(["n1"]));
        let (recorder, manager) = setup_recorded(&cluster);

        let mut handle = manager.launch(&target("n1"), &template()).await.unwrap();
        handle.finished().await;
        manager.teardown(&handle).await.unwrap();

        assert_eq!(
            recorder
                .persisted_phases(&RunId::new("abc123"), &NodeName::new("n1"))
                .await,
            vec![
                HelperPhase::Pending,
                HelperPhase::Running,
                HelperPhase::Succeeded,
                HelperPhase::Cleaned
            ]
        );
        assert!(recorder.write_count().await >= 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_detached_teardown_persists_failure_before_cleaning() {
        let cluster = Arc::new(SimulatedCluster::with_nodes(["n1"]));
        let (recorder, manager) = setup_recorded(&cluster);

        let workload = cluster
            .create_workload(&template().workload_for(&target("n1")))
            .await
            .unwrap();
        let mut task = HelperTask::pending(NodeName::new("n1"), workload);
        task.transition(HelperPhase::Running);

        let cleaned = manager
            .teardown_detached(task, Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(cleaned.outcome, Some(HelperPhase::Failed));
        assert_eq!(cleaned.exit_reason.as_deref(), Some("torn down before completion"));
        assert_eq!(
            recorder
                .persisted_phases(&RunId::new("abc123"), &NodeName::new("n1"))
                .await,
            vec![HelperPhase::Failed, HelperPhase::Cleaned]
        );
        assert!(cluster.live_workloads().await.is_empty());
    }
}
