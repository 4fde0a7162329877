//! Encoding of flows into a [`PropertyStore`] and back
//!
//! Key layout, all under `flow.<flowId>.`:
//!
//! ```text
//! blockerIds                  = f1,f2
//! enabledKinds                = command,cluster-job
//! phase.<phase>               = s1,s2
//! script.<id>.kind            = command | cluster-job
//! script.<id>.blockerIds      = a,b
//! script.<id>.env.<NAME>      = value
//! script.<id>.command.<NNNN>  = token
//! script.<id>.class           = job class
//! script.<id>.prop.<key>      = value
//! ```
//!
//! `blockerIds` doubles as the marker that the flow exists.

use std::collections::{BTreeMap, BTreeSet};

use super::batch::BatchGraph;
use super::flow::{check_phase, FlowScript};
use super::phase::Phase;
use super::script::{ExecutionScript, ScriptKind, ScriptPayload};
use super::store::{PropertyStore, StoreError};

const FLOW_PREFIX: &str = "flow.";
const BLOCKERS: &str = "blockerIds";
const ENABLED_KINDS: &str = "enabledKinds";
const KIND: &str = "kind";
const CLASS: &str = "class";
const ENV_PREFIX: &str = "env.";
const COMMAND_PREFIX: &str = "command.";
const PROP_PREFIX: &str = "prop.";

fn flow_key(flow_id: &str, suffix: &str) -> String {
    format!("{}{}.{}", FLOW_PREFIX, flow_id, suffix)
}

fn phase_key(flow_id: &str, phase: Phase) -> String {
    flow_key(flow_id, &format!("phase.{}", phase.symbol()))
}

fn script_prefix(flow_id: &str, script_id: &str) -> String {
    flow_key(flow_id, &format!("script.{}.", script_id))
}

fn join<'a>(items: impl IntoIterator<Item = &'a str>) -> String {
    items.into_iter().collect::<Vec<_>>().join(",")
}

fn split(value: &str) -> BTreeSet<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

/// Split an ID list keeping its order
fn split_ordered(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

/// Write one flow into the store
pub fn encode(flow: &FlowScript, store: &mut PropertyStore) {
    let id = flow.id();
    store.insert(
        flow_key(id, BLOCKERS),
        join(flow.blocker_ids().iter().map(String::as_str)),
    );
    store.insert(
        flow_key(id, ENABLED_KINDS),
        join(flow.enabled_kinds().iter().map(ScriptKind::symbol)),
    );

    for (phase, scripts) in flow.phases() {
        store.insert(phase_key(id, phase), join(scripts.iter().map(|s| s.id())));
        for script in scripts {
            encode_script(id, script, store);
        }
    }
}

fn encode_script(flow_id: &str, script: &ExecutionScript, store: &mut PropertyStore) {
    let prefix = script_prefix(flow_id, script.id());
    store.insert(format!("{}{}", prefix, KIND), script.kind().symbol());
    store.insert(
        format!("{}{}", prefix, BLOCKERS),
        join(script.blocker_ids().iter().map(String::as_str)),
    );
    for (name, value) in script.environment() {
        store.insert(format!("{}{}{}", prefix, ENV_PREFIX, name), value.as_str());
    }
    match script.payload() {
        ScriptPayload::Command { command } => {
            for (index, token) in command.iter().enumerate() {
                store.insert(
                    format!("{}{}{:04}", prefix, COMMAND_PREFIX, index),
                    token.as_str(),
                );
            }
        }
        ScriptPayload::ClusterJob {
            class_name,
            properties,
        } => {
            store.insert(format!("{}{}", prefix, CLASS), class_name.as_str());
            for (key, value) in properties {
                store.insert(format!("{}{}{}", prefix, PROP_PREFIX, key), value.as_str());
            }
        }
    }
}

/// Encode every flow of a batch into a fresh store
pub fn encode_batch(batch: &BatchGraph) -> PropertyStore {
    let mut store = PropertyStore::new();
    for flow in batch.flows() {
        encode(flow, &mut store);
    }
    store
}

/// IDs of all flows recorded in the store, sorted
pub fn extract_flow_ids(store: &PropertyStore) -> Vec<String> {
    store
        .child_keys(FLOW_PREFIX)
        .into_iter()
        .filter(|id| store.contains_key(&flow_key(id, BLOCKERS)))
        .collect()
}

fn require_flow(store: &PropertyStore, flow_id: &str) -> Result<(), StoreError> {
    if store.contains_key(&flow_key(flow_id, BLOCKERS)) {
        Ok(())
    } else {
        Err(StoreError::UnknownFlow(flow_id.to_string()))
    }
}

fn phase_ids(store: &PropertyStore, flow_id: &str, phase: Phase) -> Option<Vec<String>> {
    store
        .get(&phase_key(flow_id, phase))
        .map(split_ordered)
}

/// Decode a whole flow
pub fn load(store: &PropertyStore, flow_id: &str) -> Result<FlowScript, StoreError> {
    require_flow(store, flow_id)?;

    let blocker_ids = split(store.get(&flow_key(flow_id, BLOCKERS)).unwrap_or_default());
    let enabled_kinds = decode_kinds(store, flow_id)?;

    let mut scripts = BTreeMap::new();
    for phase in Phase::ALL {
        if let Some(ids) = phase_ids(store, flow_id, phase) {
            let decoded = ids
                .iter()
                .map(|id| decode_script(store, flow_id, id))
                .collect::<Result<Vec<_>, _>>()?;
            scripts.insert(phase, decoded);
        }
    }

    Ok(FlowScript::new(
        flow_id,
        blocker_ids,
        scripts,
        enabled_kinds,
    )?)
}

/// Decode only the scripts of one phase.
///
/// Reads the flow marker, the ID lists of this and earlier phases, and the
/// entries of the requested scripts. A phase without an entry yields no
/// scripts.
pub fn load_phase(
    store: &PropertyStore,
    flow_id: &str,
    phase: Phase,
) -> Result<Vec<ExecutionScript>, StoreError> {
    require_flow(store, flow_id)?;

    let Some(ids) = phase_ids(store, flow_id, phase) else {
        return Ok(Vec::new());
    };

    let mut scripts = ids
        .iter()
        .map(|id| decode_script(store, flow_id, id))
        .collect::<Result<Vec<_>, _>>()?;
    scripts.sort_by(|a, b| a.id().cmp(b.id()));

    let earlier: BTreeSet<String> = phase
        .predecessors()
        .filter_map(|p| phase_ids(store, flow_id, p))
        .flatten()
        .collect();
    check_phase(flow_id, phase, &scripts, &earlier).map_err(StoreError::Graph)?;

    Ok(scripts)
}

/// Decode every flow in the store into a batch graph
pub fn load_batch(store: &PropertyStore) -> Result<BatchGraph, StoreError> {
    let flows = extract_flow_ids(store)
        .iter()
        .map(|id| load(store, id))
        .collect::<Result<Vec<_>, _>>()?;
    Ok(BatchGraph::build(flows)?)
}

/// Enabled kinds of a flow without decoding its scripts
pub fn load_enabled_kinds(
    store: &PropertyStore,
    flow_id: &str,
) -> Result<BTreeSet<ScriptKind>, StoreError> {
    require_flow(store, flow_id)?;
    decode_kinds(store, flow_id)
}

fn decode_kinds(store: &PropertyStore, flow_id: &str) -> Result<BTreeSet<ScriptKind>, StoreError> {
    let key = flow_key(flow_id, ENABLED_KINDS);
    let value = store.get(&key).unwrap_or_default();
    split(value)
        .iter()
        .map(|symbol| {
            symbol.parse::<ScriptKind>().map_err(|message| StoreError::InvalidValue {
                key: key.clone(),
                value: value.to_string(),
                message,
            })
        })
        .collect()
}

fn decode_script(
    store: &PropertyStore,
    flow_id: &str,
    script_id: &str,
) -> Result<ExecutionScript, StoreError> {
    let prefix = script_prefix(flow_id, script_id);
    let kind_key = format!("{}{}", prefix, KIND);
    let kind_symbol = store
        .get(&kind_key)
        .ok_or_else(|| StoreError::MissingKey(kind_key.clone()))?;
    let kind: ScriptKind = kind_symbol
        .parse()
        .map_err(|message| StoreError::InvalidValue {
            key: kind_key.clone(),
            value: kind_symbol.to_string(),
            message,
        })?;

    let attributes = store.sub_map(&prefix);
    let blocker_ids = split(attributes.get(BLOCKERS).map(String::as_str).unwrap_or_default());
    let environment = strip(&attributes, ENV_PREFIX);

    let payload = match kind {
        ScriptKind::Command => {
            let mut tokens: Vec<(u32, String)> = Vec::new();
            for (index, token) in strip(&attributes, COMMAND_PREFIX) {
                let position = index.parse::<u32>().map_err(|_| StoreError::InvalidValue {
                    key: format!("{}{}{}", prefix, COMMAND_PREFIX, index),
                    value: token.clone(),
                    message: "command token index is not a number".to_string(),
                })?;
                tokens.push((position, token));
            }
            tokens.sort_by_key(|(position, _)| *position);
            ScriptPayload::Command {
                command: tokens.into_iter().map(|(_, t)| t).collect(),
            }
        }
        ScriptKind::ClusterJob => {
            let class_key = format!("{}{}", prefix, CLASS);
            let class_name = attributes
                .get(CLASS)
                .cloned()
                .ok_or(StoreError::MissingKey(class_key))?;
            ScriptPayload::ClusterJob {
                class_name,
                properties: strip(&attributes, PROP_PREFIX),
            }
        }
    };

    Ok(ExecutionScript::new(
        script_id,
        blocker_ids,
        environment,
        payload,
    )?)
}

fn strip(attributes: &BTreeMap<String, String>, prefix: &str) -> BTreeMap<String, String> {
    attributes
        .iter()
        .filter_map(|(k, v)| k.strip_prefix(prefix).map(|rest| (rest.to_string(), v.clone())))
        .collect()
}
