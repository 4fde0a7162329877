//! Invocation planning
//!
//! Turns an [`InvocationRequest`] into the part of the graph one run executes:
//! the whole batch, one flow, or one phase of one flow. Every check here runs
//! before any script starts.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use serde::Serialize;
use tracing::debug;

use super::scheduler::MAX_PARALLELISM;
use crate::workflow::codec;
use crate::workflow::script::validate_id;
use crate::workflow::{
    BatchGraph, ExecutionContext, ExecutionScript, FlowScript, GraphError, Phase, PropertyStore,
    ScriptError, ScriptKind, StoreError,
};

/// Definition key listing flows to skip
pub const DEF_SKIP_FLOWS: &str = "skipFlows";
/// Definition key forcing one flow at a time
pub const DEF_SERIALIZE_FLOWS: &str = "serializeFlows";
/// Definition key overriding script parallelism
pub const DEF_PARALLELISM: &str = "parallelism";

/// Errors found while planning an invocation
#[derive(Debug, thiserror::Error)]
pub enum PlanError {
    #[error("{mode} mode requires a {field}")]
    MissingField {
        mode: InvocationMode,
        field: &'static str,
    },

    #[error("{mode} mode does not accept a {field}")]
    UnexpectedField {
        mode: InvocationMode,
        field: &'static str,
    },

    #[error("Invalid request: {0}")]
    InvalidId(#[from] ScriptError),

    #[error("Unknown definition '{0}'")]
    UnknownDefinition(String),

    #[error("Invalid definition {key}={value}: {message}")]
    InvalidDefinition {
        key: String,
        value: String,
        message: String,
    },

    #[error("Cannot skip unknown flow '{0}'")]
    UnknownSkipFlow(String),

    #[error("Failed to load graph: {0}")]
    Store(#[from] StoreError),

    #[error("Invalid graph: {0}")]
    Graph(#[from] GraphError),
}

/// Scope of one invocation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum InvocationMode {
    Batch,
    Flow,
    Phase,
}

impl InvocationMode {
    /// The mode implied by the fields that are present
    pub fn infer(flow_id: Option<&str>, phase: Option<Phase>) -> Self {
        match (flow_id, phase) {
            (_, Some(_)) => InvocationMode::Phase,
            (Some(_), None) => InvocationMode::Flow,
            (None, None) => InvocationMode::Batch,
        }
    }
}

impl fmt::Display for InvocationMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            InvocationMode::Batch => "BATCH",
            InvocationMode::Flow => "FLOW",
            InvocationMode::Phase => "PHASE",
        })
    }
}

/// An external request to run part of a batch
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InvocationRequest {
    pub mode: InvocationMode,
    pub batch_id: String,
    pub flow_id: Option<String>,
    pub execution_id: Option<String>,
    pub phase: Option<Phase>,
    pub arguments: BTreeMap<String, String>,
    pub definitions: BTreeMap<String, String>,
}

impl InvocationRequest {
    pub fn new(mode: InvocationMode, batch_id: impl Into<String>) -> Self {
        Self {
            mode,
            batch_id: batch_id.into(),
            flow_id: None,
            execution_id: None,
            phase: None,
            arguments: BTreeMap::new(),
            definitions: BTreeMap::new(),
        }
    }

    pub fn batch(batch_id: impl Into<String>) -> Self {
        Self::new(InvocationMode::Batch, batch_id)
    }

    pub fn flow(batch_id: impl Into<String>, flow_id: impl Into<String>) -> Self {
        Self::new(InvocationMode::Flow, batch_id).with_flow(flow_id)
    }

    pub fn phase(
        batch_id: impl Into<String>,
        flow_id: impl Into<String>,
        execution_id: impl Into<String>,
        phase: Phase,
    ) -> Self {
        Self::new(InvocationMode::Phase, batch_id)
            .with_flow(flow_id)
            .with_execution_id(execution_id)
            .with_phase(phase)
    }

    pub fn with_flow(mut self, flow_id: impl Into<String>) -> Self {
        self.flow_id = Some(flow_id.into());
        self
    }

    pub fn with_execution_id(mut self, execution_id: impl Into<String>) -> Self {
        self.execution_id = Some(execution_id.into());
        self
    }

    pub fn with_phase(mut self, phase: Phase) -> Self {
        self.phase = Some(phase);
        self
    }

    pub fn with_argument(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.arguments.insert(key.into(), value.into());
        self
    }

    pub fn with_definition(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.definitions.insert(key.into(), value.into());
        self
    }

    /// Check the field combination against the mode
    pub fn validate(&self) -> Result<(), PlanError> {
        validate_id("batch", &self.batch_id)?;
        let mode = self.mode;
        let missing = |field| PlanError::MissingField { mode, field };
        let unexpected = |field| PlanError::UnexpectedField { mode, field };

        match mode {
            InvocationMode::Batch => {
                if self.flow_id.is_some() {
                    return Err(unexpected("flow ID"));
                }
                if self.execution_id.is_some() {
                    return Err(unexpected("execution ID"));
                }
                if self.phase.is_some() {
                    return Err(unexpected("phase"));
                }
            }
            InvocationMode::Flow => {
                if self.flow_id.is_none() {
                    return Err(missing("flow ID"));
                }
                if self.phase.is_some() {
                    return Err(unexpected("phase"));
                }
            }
            InvocationMode::Phase => {
                if self.flow_id.is_none() {
                    return Err(missing("flow ID"));
                }
                if self.execution_id.is_none() {
                    return Err(missing("execution ID"));
                }
                if self.phase.is_none() {
                    return Err(missing("phase"));
                }
            }
        }

        if let Some(flow_id) = &self.flow_id {
            validate_id("flow", flow_id)?;
        }
        if let Some(execution_id) = &self.execution_id {
            if execution_id.trim().is_empty() {
                return Err(missing("non-empty execution ID"));
            }
        }
        Ok(())
    }
}

/// Engine tuning given with `-D key=value`
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EngineDefinitions {
    pub skip_flows: BTreeSet<String>,
    pub serialize_flows: bool,
    pub parallelism: Option<usize>,
}

impl EngineDefinitions {
    pub fn parse(definitions: &BTreeMap<String, String>) -> Result<Self, PlanError> {
        let mut parsed = Self::default();
        for (key, value) in definitions {
            let invalid = |message: &str| PlanError::InvalidDefinition {
                key: key.clone(),
                value: value.clone(),
                message: message.to_string(),
            };
            match key.as_str() {
                DEF_SKIP_FLOWS => {
                    parsed.skip_flows = value
                        .split(',')
                        .map(str::trim)
                        .filter(|s| !s.is_empty())
                        .map(str::to_string)
                        .collect();
                }
                DEF_SERIALIZE_FLOWS => {
                    parsed.serialize_flows = match value.trim().to_ascii_lowercase().as_str() {
                        "true" => true,
                        "false" => false,
                        _ => return Err(invalid("expected true or false")),
                    };
                }
                DEF_PARALLELISM => {
                    let n = value
                        .trim()
                        .parse::<usize>()
                        .ok()
                        .filter(|n| *n > 0)
                        .ok_or_else(|| invalid("expected a positive number"))?;
                    if n > MAX_PARALLELISM {
                        return Err(invalid(&format!("must be at most {}", MAX_PARALLELISM)));
                    }
                    parsed.parallelism = Some(n);
                }
                other => return Err(PlanError::UnknownDefinition(other.to_string())),
            }
        }
        Ok(parsed)
    }
}

/// The part of the graph an invocation runs
#[derive(Debug, Clone)]
pub enum PlanScope {
    Batch {
        graph: BatchGraph,
        execution_ids: BTreeMap<String, String>,
    },
    Flow {
        flow: FlowScript,
        context: ExecutionContext,
    },
    Phase {
        enabled_kinds: BTreeSet<ScriptKind>,
        scripts: Vec<ExecutionScript>,
        context: ExecutionContext,
    },
}

/// A validated, ready-to-run invocation
#[derive(Debug, Clone)]
pub struct InvocationPlan {
    pub mode: InvocationMode,
    pub batch_id: String,
    pub arguments: BTreeMap<String, String>,
    pub definitions: EngineDefinitions,
    pub scope: PlanScope,
}

impl InvocationPlan {
    /// Plan a request against a graph store
    pub fn build(request: &InvocationRequest, store: &PropertyStore) -> Result<Self, PlanError> {
        request.validate()?;
        let definitions = EngineDefinitions::parse(&request.definitions)?;

        let known_flows = codec::extract_flow_ids(store);
        if let Some(unknown) = definitions
            .skip_flows
            .iter()
            .find(|f| !known_flows.contains(*f))
        {
            return Err(PlanError::UnknownSkipFlow(unknown.clone()));
        }

        let batch_id = request.batch_id.clone();
        let context_for = |flow_id: &str, execution_id: String| {
            ExecutionContext::new(
                batch_id.as_str(),
                flow_id,
                execution_id,
                None,
                request.arguments.clone(),
            )
        };

        let scope = match request.mode {
            InvocationMode::Batch => {
                let graph = codec::load_batch(store)?;
                let execution_ids = graph
                    .flow_ids()
                    .into_iter()
                    .map(|id| (id.to_string(), ExecutionContext::generate_execution_id()))
                    .collect();
                PlanScope::Batch {
                    graph,
                    execution_ids,
                }
            }
            InvocationMode::Flow => {
                let flow_id = request.flow_id.as_deref().unwrap_or_default();
                let flow = codec::load(store, flow_id)?;
                let execution_id = request
                    .execution_id
                    .clone()
                    .unwrap_or_else(ExecutionContext::generate_execution_id);
                PlanScope::Flow {
                    context: context_for(flow_id, execution_id),
                    flow,
                }
            }
            InvocationMode::Phase => {
                let flow_id = request.flow_id.as_deref().unwrap_or_default();
                let phase = request.phase.unwrap_or(Phase::Main);
                let scripts = codec::load_phase(store, flow_id, phase)?;
                let enabled_kinds = codec::load_enabled_kinds(store, flow_id)?;
                let execution_id = request.execution_id.clone().unwrap_or_default();
                PlanScope::Phase {
                    enabled_kinds,
                    scripts,
                    context: context_for(flow_id, execution_id).with_phase(phase),
                }
            }
        };

        debug!(mode = %request.mode, batch_id = %request.batch_id, "Invocation planned");
        Ok(Self {
            mode: request.mode,
            batch_id: request.batch_id.clone(),
            arguments: request.arguments.clone(),
            definitions,
            scope,
        })
    }

    pub fn is_skipped(&self, flow_id: &str) -> bool {
        self.definitions.skip_flows.contains(flow_id)
    }

    /// Context of a flow in a batch plan, using its pre-generated execution ID
    pub fn flow_context(&self, flow_id: &str) -> ExecutionContext {
        let execution_id = match &self.scope {
            PlanScope::Batch { execution_ids, .. } => {
                execution_ids.get(flow_id).cloned().unwrap_or_default()
            }
            PlanScope::Flow { context, .. } | PlanScope::Phase { context, .. } => {
                context.execution_id().to_string()
            }
        };
        ExecutionContext::new(
            self.batch_id.as_str(),
            flow_id,
            execution_id,
            None,
            self.arguments.clone(),
        )
    }

    /// Enabled scripts that will run, with the context of their flow
    pub fn units(&self) -> Vec<(ExecutionContext, Vec<&ExecutionScript>)> {
        match &self.scope {
            PlanScope::Batch { graph, .. } => graph
                .flows()
                .iter()
                .filter(|flow| !self.is_skipped(flow.id()))
                .map(|flow| (self.flow_context(flow.id()), enabled_scripts(flow)))
                .collect(),
            PlanScope::Flow { flow, context } => {
                if self.is_skipped(flow.id()) {
                    Vec::new()
                } else {
                    vec![(context.clone(), enabled_scripts(flow))]
                }
            }
            PlanScope::Phase {
                enabled_kinds,
                scripts,
                context,
            } => {
                if self.is_skipped(context.flow_id()) {
                    Vec::new()
                } else {
                    let enabled = scripts
                        .iter()
                        .filter(|s| enabled_kinds.contains(&s.kind()))
                        .collect();
                    vec![(context.clone(), enabled)]
                }
            }
        }
    }

    /// Script kinds that need a handler for this plan
    pub fn required_kinds(&self) -> BTreeSet<ScriptKind> {
        self.units()
            .iter()
            .flat_map(|(_, scripts)| scripts.iter().map(|s| s.kind()))
            .collect()
    }
}

fn enabled_scripts(flow: &FlowScript) -> Vec<&ExecutionScript> {
    flow.phases()
        .flat_map(|(_, scripts)| scripts.iter())
        .filter(|s| flow.is_enabled(s.kind()))
        .collect()
}
