//! Dependency levelling shared by scripts and flows
//!
//! Both blocker graphs (scripts inside a flow, flows inside a batch) are
//! levelled with the same Kahn pass: level 0 holds the nodes without blockers,
//! level n+1 the nodes whose last blocker sits in level n.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use super::script::ScriptError;

/// Structural errors in a script or flow graph
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum GraphError {
    #[error("Duplicate {what} ID '{id}' in {scope}")]
    Duplicate {
        what: &'static str,
        scope: String,
        id: String,
    },

    #[error("'{node}' in {scope} is blocked by unknown '{blocker}'")]
    MissingDependency {
        scope: String,
        node: String,
        blocker: String,
    },

    #[error("Cyclic dependency detected in {scope}: {members:?}")]
    CyclicDependency { scope: String, members: Vec<String> },

    #[error(transparent)]
    Script(#[from] ScriptError),
}

/// Compute execution levels over `node -> blockers`.
///
/// Blockers that are not nodes of the map are ignored. Levels are sorted. On
/// a cycle the error holds every node that could not be levelled.
pub fn execution_levels(
    nodes: &BTreeMap<String, BTreeSet<String>>,
) -> Result<Vec<Vec<String>>, Vec<String>> {
    let mut in_degree: HashMap<&str, usize> = HashMap::new();
    let mut dependents: HashMap<&str, Vec<&str>> = HashMap::new();

    for (name, blockers) in nodes {
        in_degree.entry(name.as_str()).or_insert(0);
        for blocker in blockers.iter().filter(|b| nodes.contains_key(*b)) {
            *in_degree.entry(name.as_str()).or_insert(0) += 1;
            dependents
                .entry(blocker.as_str())
                .or_default()
                .push(name.as_str());
        }
    }

    let mut levels: Vec<Vec<String>> = Vec::new();
    let mut current_level: Vec<&str> = in_degree
        .iter()
        .filter(|(_, &deg)| deg == 0)
        .map(|(&name, _)| name)
        .collect();
    current_level.sort_unstable();

    while !current_level.is_empty() {
        let mut next_level = Vec::new();
        for name in &current_level {
            for &dependent in dependents.get(name).into_iter().flatten() {
                if let Some(degree) = in_degree.get_mut(dependent) {
                    *degree -= 1;
                    if *degree == 0 {
                        next_level.push(dependent);
                    }
                }
            }
        }
        next_level.sort_unstable();
        levels.push(current_level.iter().map(|s| s.to_string()).collect());
        current_level = next_level;
    }

    let total_processed: usize = levels.iter().map(Vec::len).sum();
    if total_processed != nodes.len() {
        let levelled: BTreeSet<&str> = levels.iter().flatten().map(String::as_str).collect();
        let remaining = nodes
            .keys()
            .filter(|n| !levelled.contains(n.as_str()))
            .cloned()
            .collect();
        return Err(remaining);
    }

    Ok(levels)
}
