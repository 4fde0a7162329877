//! Batch graph: the flows of a batch and their blocker edges

use std::collections::{BTreeMap, BTreeSet};

use super::flow::FlowScript;
use super::graph::{execution_levels, GraphError};

/// The flows of one batch, levelled by their flow blockers
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchGraph {
    flows: Vec<FlowScript>,
    index: BTreeMap<String, usize>,
    execution_levels: Vec<Vec<String>>,
}

impl BatchGraph {
    pub fn build(flows: Vec<FlowScript>) -> Result<Self, GraphError> {
        let mut index = BTreeMap::new();
        for (position, flow) in flows.iter().enumerate() {
            if index.insert(flow.id().to_string(), position).is_some() {
                return Err(GraphError::Duplicate {
                    what: "flow",
                    scope: "batch".to_string(),
                    id: flow.id().to_string(),
                });
            }
        }

        for flow in &flows {
            for blocker in flow.blocker_ids() {
                if !index.contains_key(blocker) {
                    return Err(GraphError::MissingDependency {
                        scope: "batch".to_string(),
                        node: flow.id().to_string(),
                        blocker: blocker.clone(),
                    });
                }
            }
        }

        let edges: BTreeMap<String, BTreeSet<String>> = flows
            .iter()
            .map(|f| (f.id().to_string(), f.blocker_ids().clone()))
            .collect();
        let execution_levels =
            execution_levels(&edges).map_err(|members| GraphError::CyclicDependency {
                scope: "batch".to_string(),
                members,
            })?;

        Ok(Self {
            flows,
            index,
            execution_levels,
        })
    }

    /// Flows in the order they were given
    pub fn flows(&self) -> &[FlowScript] {
        &self.flows
    }

    pub fn get(&self, flow_id: &str) -> Option<&FlowScript> {
        self.index.get(flow_id).map(|&i| &self.flows[i])
    }

    pub fn flow_ids(&self) -> Vec<&str> {
        self.flows.iter().map(FlowScript::id).collect()
    }

    pub fn execution_levels(&self) -> &Vec<Vec<String>> {
        &self.execution_levels
    }

    pub fn len(&self) -> usize {
        self.flows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.flows.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflow::script::ScriptKind;

    fn make_flow(id: &str, blockers: &[&str]) -> FlowScript {
        FlowScript::new(
            id,
            blockers.iter().map(|b| b.to_string()).collect(),
            BTreeMap::new(),
            [ScriptKind::Command].into_iter().collect(),
        )
        .unwrap()
    }

    fn diamond() -> BatchGraph {
        BatchGraph::build(vec![
            make_flow("last", &["left", "right"]),
            make_flow("left", &["testing"]),
            make_flow("right", &["testing"]),
            make_flow("testing", &[]),
        ])
        .unwrap()
    }

    #[test]
    fn test_levels() {
        let batch = diamond();
        assert_eq!(batch.len(), 4);
        assert_eq!(
            batch.execution_levels(),
            &vec![
                vec!["testing".to_string()],
                vec!["left".to_string(), "right".to_string()],
                vec!["last".to_string()],
            ]
        );
        assert_eq!(batch.flow_ids(), vec!["last", "left", "right", "testing"]);
    }

    #[test]
    fn test_missing_dependency() {
        let err = BatchGraph::build(vec![make_flow("tests", &["setup"])]).unwrap_err();
        assert!(matches!(err, GraphError::MissingDependency { .. }));
    }

    #[test]
    fn test_cyclic_dependency() {
        let err = BatchGraph::build(vec![
            make_flow("a", &["c"]),
            make_flow("b", &["a"]),
            make_flow("c", &["b"]),
        ])
        .unwrap_err();
        assert!(matches!(err, GraphError::CyclicDependency { .. }));
    }

    #[test]
    fn test_self_blocker_is_cycle() {
        let err = BatchGraph::build(vec![make_flow("a", &["a"])]).unwrap_err();
        assert!(matches!(err, GraphError::CyclicDependency { .. }));
    }

    #[test]
    fn test_duplicate_flow() {
        let err =
            BatchGraph::build(vec![make_flow("same", &[]), make_flow("same", &[])]).unwrap_err();
        assert!(matches!(err, GraphError::Duplicate { what: "flow", .. }));
    }
}
