//! Flow scripts: the scripts of one flow grouped by phase

use std::collections::{BTreeMap, BTreeSet};

use super::graph::{execution_levels, GraphError};
use super::phase::Phase;
use super::script::{validate_id, ExecutionScript, ScriptKind};

/// One flow of a batch
///
/// Phases without scripts are not stored, and each phase's scripts are kept
/// sorted by ID, so two flows with the same content compare equal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlowScript {
    id: String,
    blocker_ids: BTreeSet<String>,
    scripts: BTreeMap<Phase, Vec<ExecutionScript>>,
    enabled_kinds: BTreeSet<ScriptKind>,
}

impl FlowScript {
    /// Build and validate a flow.
    ///
    /// Script IDs must be unique across all phases and every script blocker
    /// must name a script of the same or an earlier phase.
    pub fn new(
        id: impl Into<String>,
        blocker_ids: BTreeSet<String>,
        scripts: BTreeMap<Phase, Vec<ExecutionScript>>,
        enabled_kinds: BTreeSet<ScriptKind>,
    ) -> Result<Self, GraphError> {
        let id = id.into();
        validate_id("flow", &id)?;
        for blocker in &blocker_ids {
            validate_id("flow blocker", blocker)?;
        }

        let mut normalized = BTreeMap::new();
        let mut visible: BTreeSet<String> = BTreeSet::new();
        for (phase, mut phase_scripts) in scripts {
            if phase_scripts.is_empty() {
                continue;
            }
            phase_scripts.sort_by(|a, b| a.id().cmp(b.id()));
            for script in &phase_scripts {
                if visible.contains(script.id()) {
                    return Err(GraphError::Duplicate {
                        what: "script",
                        scope: format!("flow '{}'", id),
                        id: script.id().to_string(),
                    });
                }
            }
            check_phase(&id, phase, &phase_scripts, &visible)?;
            visible.extend(phase_scripts.iter().map(|s| s.id().to_string()));
            normalized.insert(phase, phase_scripts);
        }

        Ok(Self {
            id,
            blocker_ids,
            scripts: normalized,
            enabled_kinds,
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// IDs of the flows that must succeed before this one starts
    pub fn blocker_ids(&self) -> &BTreeSet<String> {
        &self.blocker_ids
    }

    pub fn enabled_kinds(&self) -> &BTreeSet<ScriptKind> {
        &self.enabled_kinds
    }

    pub fn is_enabled(&self, kind: ScriptKind) -> bool {
        self.enabled_kinds.contains(&kind)
    }

    /// Scripts of a phase, sorted by ID; empty when the phase has none
    pub fn scripts(&self, phase: Phase) -> &[ExecutionScript] {
        self.scripts.get(&phase).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Non-empty phases in execution order
    pub fn phases(&self) -> impl Iterator<Item = (Phase, &[ExecutionScript])> {
        self.scripts.iter().map(|(p, s)| (*p, s.as_slice()))
    }

    pub fn script_count(&self) -> usize {
        self.scripts.values().map(Vec::len).sum()
    }

    /// Kinds used by scripts of this flow that are also enabled
    pub fn active_kinds(&self) -> BTreeSet<ScriptKind> {
        self.scripts
            .values()
            .flatten()
            .map(ExecutionScript::kind)
            .filter(|k| self.is_enabled(*k))
            .collect()
    }
}

/// Validate one phase's scripts against the IDs of earlier phases.
///
/// Checks in-phase duplicates, blockers that are neither in this phase nor
/// in `earlier`, and cycles among the scripts of the phase.
pub(crate) fn check_phase(
    flow_id: &str,
    phase: Phase,
    scripts: &[ExecutionScript],
    earlier: &BTreeSet<String>,
) -> Result<(), GraphError> {
    let scope = format!("flow '{}' phase '{}'", flow_id, phase);
    let mut graph: BTreeMap<String, BTreeSet<String>> = BTreeMap::new();
    for script in scripts {
        let previous = graph.insert(script.id().to_string(), script.blocker_ids().clone());
        if previous.is_some() {
            return Err(GraphError::Duplicate {
                what: "script",
                scope,
                id: script.id().to_string(),
            });
        }
    }

    for script in scripts {
        for blocker in script.blocker_ids() {
            if !graph.contains_key(blocker) && !earlier.contains(blocker) {
                return Err(GraphError::MissingDependency {
                    scope,
                    node: script.id().to_string(),
                    blocker: blocker.clone(),
                });
            }
        }
    }

    execution_levels(&graph)
        .map(|_| ())
        .map_err(|members| GraphError::CyclicDependency { scope, members })
}
