//! Final experiment result handed to the reporting collaborator.

use serde::{Deserialize, Serialize};

use crate::state::{ExperimentPhase, ExperimentState, HelperPhase, Verdict};
use crate::types::{NodeName, RunId};

/// Outcome of one launched (or attempted) helper.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TargetDetail {
    pub node: NodeName,
    /// How the helper finished, or its current phase if it never did.
    pub phase: HelperPhase,
    pub exit_reason: Option<String>,
    /// No workload is left on the cluster.
    pub cleaned: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExperimentReport {
    pub run_id: RunId,
    pub experiment_name: String,
    pub result: Verdict,
    pub phase: ExperimentPhase,
    pub reason: Option<String>,
    pub per_target_detail: Vec<TargetDetail>,
}

impl ExperimentReport {
    pub fn from_state(state: &ExperimentState) -> Self {
        // Targets never reached (cancellation) have no task and no detail.
        let per_target_detail = state
            .targets
            .iter()
            .filter_map(|target| state.task(&target.name))
            .map(|task| TargetDetail {
                node: task.node.clone(),
                phase: task.outcome.unwrap_or(task.phase),
                exit_reason: task.exit_reason.clone(),
                cleaned: !task.needs_teardown(),
            })
            .collect();

        let result = match (state.phase, state.verdict) {
            (ExperimentPhase::Completed, Some(Verdict::Pass)) => Verdict::Pass,
            _ => Verdict::Fail,
        };

        Self {
            run_id: state.run_id.clone(),
            experiment_name: state.experiment_name.clone(),
            result,
            phase: state.phase,
            reason: state.failure.clone(),
            per_target_detail,
        }
    }

    pub fn passed(&self) -> bool {
        self.result == Verdict::Pass
    }

    /// Targets whose helper ran the full window.
    pub fn succeeded_targets(&self) -> Vec<&NodeName> {
        self.per_target_detail
            .iter()
            .filter(|d| d.phase == HelperPhase::Succeeded)
            .map(|d| &d.node)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SequenceMode;
    use crate::state::HelperTask;
    use crate::targets::{NodeReadiness, TargetNode};
    use crate::types::WorkloadId;

    fn target(node: &str) -> TargetNode {
        TargetNode {
            name: NodeName::new(node),
            readiness: NodeReadiness::Ready,
            allocatable_cpu: None,
        }
    }

    #[test]
    fn test_partial_success_is_failure_listing_successes() {
        let mut state = ExperimentState::new(RunId::new("r1"), "node-cpu-hog", SequenceMode::Parallel);
        state.targets = vec![target("n1"), target("n2"), target("n3")];

        let mut ok = HelperTask::pending(NodeName::new("n1"), WorkloadId::new("w1"));
        ok.transition(HelperPhase::Running);
        ok.transition(HelperPhase::Succeeded);
        ok.transition(HelperPhase::Cleaned);
        state.upsert_task(ok);
        state.upsert_task(HelperTask::unscheduled(NodeName::new("n2"), "node unreachable"));
        state.verdict = Some(Verdict::Fail);
        state.finish();

        let report = ExperimentReport::from_state(&state);
        assert!(!report.passed());
        assert_eq!(report.phase, ExperimentPhase::Completed);
        assert_eq!(report.succeeded_targets(), vec![&NodeName::new("n1")]);

        let n1 = &report.per_target_detail[0];
        assert_eq!(n1.phase, HelperPhase::Succeeded);
        assert!(n1.cleaned);

        let n2 = &report.per_target_detail[1];
        assert_eq!(n2.phase, HelperPhase::Failed);
        assert_eq!(n2.exit_reason.as_deref(), Some("node unreachable"));

        // n3 was never launched.
        assert_eq!(report.per_target_detail.len(), 2);
    }

    #[test]
    fn test_report_json_shape() {
        let mut state = ExperimentState::new(RunId::new("r1"), "node-cpu-hog", SequenceMode::Serial);
        state.verdict = Some(Verdict::Pass);
        state.finish();

        let json = serde_json::to_value(ExperimentReport::from_state(&state)).unwrap();
        assert_eq!(json["result"], "Pass");
        assert_eq!(json["runId"], "r1");
        assert!(json["perTargetDetail"].as_array().unwrap().is_empty());
    }
}
