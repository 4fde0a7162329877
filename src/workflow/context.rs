//! Execution context for one flow invocation
//!
//! Created once per flow invocation and shared read-only with every handler
//! call made on its behalf.

use std::collections::BTreeMap;

use super::phase::Phase;

/// Variable name carrying the batch ID during script resolution
pub const VAR_BATCH_ID: &str = "batch_id";
/// Variable name carrying the flow ID during script resolution
pub const VAR_FLOW_ID: &str = "flow_id";
/// Variable name carrying the execution ID during script resolution
pub const VAR_EXECUTION_ID: &str = "execution_id";
/// Variable name carrying the current phase during script resolution
pub const VAR_PHASE: &str = "phase";
/// Variable name carrying all batch arguments as a single string
pub const VAR_BATCH_ARGUMENTS: &str = "batch_arguments";

/// Immutable runtime context of a flow invocation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionContext {
    batch_id: String,
    flow_id: String,
    execution_id: String,
    phase: Option<Phase>,
    arguments: BTreeMap<String, String>,
}

impl ExecutionContext {
    pub fn new(
        batch_id: impl Into<String>,
        flow_id: impl Into<String>,
        execution_id: impl Into<String>,
        phase: Option<Phase>,
        arguments: BTreeMap<String, String>,
    ) -> Self {
        Self {
            batch_id: batch_id.into(),
            flow_id: flow_id.into(),
            execution_id: execution_id.into(),
            phase,
            arguments,
        }
    }

    /// Generate a fresh execution ID
    pub fn generate_execution_id() -> String {
        uuid::Uuid::new_v4().to_string()
    }

    /// Copy of this context scoped to a phase
    pub fn with_phase(&self, phase: Phase) -> Self {
        Self {
            phase: Some(phase),
            ..self.clone()
        }
    }

    pub fn batch_id(&self) -> &str {
        &self.batch_id
    }

    pub fn flow_id(&self) -> &str {
        &self.flow_id
    }

    pub fn execution_id(&self) -> &str {
        &self.execution_id
    }

    pub fn phase(&self) -> Option<Phase> {
        self.phase
    }

    pub fn arguments(&self) -> &BTreeMap<String, String> {
        &self.arguments
    }

    /// Arguments flattened as `k1=v1,k2=v2` with `\` escaping `,` `=` and `\`
    pub fn arguments_as_string(&self) -> String {
        fn escape(s: &str) -> String {
            let mut out = String::with_capacity(s.len());
            for c in s.chars() {
                if matches!(c, ',' | '=' | '\\') {
                    out.push('\\');
                }
                out.push(c);
            }
            out
        }

        self.arguments
            .iter()
            .map(|(k, v)| format!("{}={}", escape(k), escape(v)))
            .collect::<Vec<_>>()
            .join(",")
    }

    /// Placeholder table derived from this context.
    ///
    /// Arguments are visible under their own names; the well-known IDs win
    /// over an argument of the same name.
    pub fn variables(&self) -> BTreeMap<String, String> {
        let mut vars = self.arguments.clone();
        vars.insert(VAR_BATCH_ID.to_string(), self.batch_id.clone());
        vars.insert(VAR_FLOW_ID.to_string(), self.flow_id.clone());
        vars.insert(VAR_EXECUTION_ID.to_string(), self.execution_id.clone());
        vars.insert(VAR_BATCH_ARGUMENTS.to_string(), self.arguments_as_string());
        if let Some(phase) = self.phase {
            vars.insert(VAR_PHASE.to_string(), phase.symbol().to_string());
        }
        vars
    }
}
