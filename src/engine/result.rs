//! Execution result types

use std::collections::BTreeMap;

use serde::Serialize;

use super::planner::InvocationMode;
use crate::workflow::{Phase, ScriptKind};

/// Why a script never ran
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    /// Its kind is not enabled for the flow
    Disabled,
    /// A blocker failed or was itself skipped for that reason
    BlockerFailed,
    /// An earlier phase of the flow failed
    PhaseAborted,
    /// The whole flow was skipped
    FlowSkipped,
}

/// Terminal state of a script
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "state", content = "reason")]
pub enum ScriptStatus {
    Succeeded,
    Failed,
    Skipped(SkipReason),
}

impl ScriptStatus {
    /// Whether dependents may proceed after this script
    pub fn satisfies_dependents(&self) -> bool {
        matches!(
            self,
            ScriptStatus::Succeeded | ScriptStatus::Skipped(SkipReason::Disabled)
        )
    }

    /// Whether this state counts as a failure for reporting
    pub fn is_failure(&self) -> bool {
        matches!(
            self,
            ScriptStatus::Failed | ScriptStatus::Skipped(SkipReason::BlockerFailed)
        )
    }
}

/// Result of a single script
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ScriptResult {
    pub id: String,
    pub phase: Phase,
    pub kind: ScriptKind,
    pub status: ScriptStatus,
    pub error: Option<String>,
    /// Logical clock tick when the script entered RUNNING
    pub started: Option<u64>,
    /// Logical clock tick when the script reached its terminal state
    pub finished: Option<u64>,
}

impl ScriptResult {
    pub fn skipped(id: &str, phase: Phase, kind: ScriptKind, reason: SkipReason) -> Self {
        Self {
            id: id.to_string(),
            phase,
            kind,
            status: ScriptStatus::Skipped(reason),
            error: None,
            started: None,
            finished: None,
        }
    }

}

/// A per-script failure cause
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Failure {
    pub flow_id: String,
    pub script_id: String,
    pub phase: Phase,
    pub message: String,
}

/// Result of one flow, or of one phase of a flow
#[derive(Debug, Clone, Serialize)]
pub struct FlowResult {
    pub flow_id: String,
    pub execution_id: String,
    pub success: bool,
    pub skipped: bool,
    pub scripts: Vec<ScriptResult>,
}

impl FlowResult {
    pub fn skipped(flow_id: &str, execution_id: &str, success: bool) -> Self {
        Self {
            flow_id: flow_id.to_string(),
            execution_id: execution_id.to_string(),
            success,
            skipped: true,
            scripts: Vec::new(),
        }
    }

    pub fn script(&self, id: &str) -> Option<&ScriptResult> {
        self.scripts.iter().find(|s| s.id == id)
    }

    pub fn failures(&self) -> Vec<Failure> {
        self.scripts
            .iter()
            .filter(|s| s.status.is_failure())
            .map(|s| Failure {
                flow_id: self.flow_id.clone(),
                script_id: s.id.clone(),
                phase: s.phase,
                message: s
                    .error
                    .clone()
                    .unwrap_or_else(|| "blocked by a failed script".to_string()),
            })
            .collect()
    }
}

/// Result of a whole batch
#[derive(Debug, Clone, Serialize)]
pub struct BatchResult {
    pub batch_id: String,
    pub success: bool,
    pub flows: BTreeMap<String, FlowResult>,
    pub skipped_flows: Vec<String>,
    /// Flow IDs in the order they were started
    pub execution_order: Vec<String>,
}

impl BatchResult {
    pub fn failures(&self) -> Vec<Failure> {
        self.flows.values().flat_map(FlowResult::failures).collect()
    }
}

/// What an invocation ran
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum InvocationOutcome {
    Batch(BatchResult),
    Flow(FlowResult),
    Phase(FlowResult),
}

/// Result of one invocation
#[derive(Debug, Clone, Serialize)]
pub struct InvocationResult {
    pub mode: InvocationMode,
    pub success: bool,
    pub outcome: InvocationOutcome,
}

impl InvocationResult {
    pub fn failures(&self) -> Vec<Failure> {
        match &self.outcome {
            InvocationOutcome::Batch(batch) => batch.failures(),
            InvocationOutcome::Flow(flow) | InvocationOutcome::Phase(flow) => flow.failures(),
        }
    }

    /// All flow results, whatever the mode
    pub fn flows(&self) -> Vec<&FlowResult> {
        match &self.outcome {
            InvocationOutcome::Batch(batch) => batch.flows.values().collect(),
            InvocationOutcome::Flow(flow) | InvocationOutcome::Phase(flow) => vec![flow],
        }
    }
}
