#![allow(dead_code)]

use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use flowgate::engine::{EngineProfile, HandlerError, HandlerRegistry, MonitorGuard, ProfileContext};
use flowgate::engine::ScriptHandler;
use flowgate::workflow::codec;
use flowgate::workflow::{
    BatchGraph, ExecutionContext, ExecutionScript, FlowScript, Phase, PropertyStore, ScriptKind,
    VariableResolver,
};
use tempfile::TempDir;

pub const RECORDING: &str = "recording";

pub fn create_test_dir() -> TempDir {
    tempfile::tempdir().expect("Failed to create temp directory")
}

/// One handler call as seen by [`RecordingHandler`]
#[derive(Debug, Clone)]
pub struct RecordedCall {
    pub batch_id: String,
    pub flow_id: String,
    pub execution_id: String,
    pub phase: Option<Phase>,
    pub script_id: String,
    pub command: Vec<String>,
    pub environment: BTreeMap<String, String>,
    pub start: u64,
    pub end: u64,
}

pub type Recorder = Arc<Mutex<Vec<RecordedCall>>>;

pub fn recorder() -> Recorder {
    Arc::new(Mutex::new(Vec::new()))
}

/// Records every script it runs into an explicit collector
#[derive(Clone)]
pub struct RecordingHandler {
    calls: Recorder,
    sequence: Arc<AtomicU64>,
    fail: Arc<HashSet<String>>,
    delay: Duration,
}

impl RecordingHandler {
    pub fn new(calls: Recorder) -> Self {
        Self {
            calls,
            sequence: Arc::new(AtomicU64::new(0)),
            fail: Arc::new(HashSet::new()),
            delay: Duration::from_millis(10),
        }
    }

    /// Fail the scripts with these IDs
    pub fn failing(mut self, ids: &[&str]) -> Self {
        self.fail = Arc::new(ids.iter().map(|s| s.to_string()).collect());
        self
    }
}

#[async_trait]
impl ScriptHandler for RecordingHandler {
    fn name(&self) -> &str {
        RECORDING
    }

    fn supports(&self, _kind: ScriptKind) -> bool {
        true
    }

    async fn execute(
        &self,
        monitor: &MonitorGuard,
        context: &ExecutionContext,
        script: &ExecutionScript,
    ) -> Result<(), HandlerError> {
        let start = self.sequence.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(self.delay).await;
        let end = self.sequence.fetch_add(1, Ordering::SeqCst);

        self.calls.lock().unwrap().push(RecordedCall {
            batch_id: context.batch_id().to_string(),
            flow_id: context.flow_id().to_string(),
            execution_id: context.execution_id().to_string(),
            phase: context.phase(),
            script_id: script.id().to_string(),
            command: script.command_line().map(<[String]>::to_vec).unwrap_or_default(),
            environment: script.environment().clone(),
            start,
            end,
        });
        monitor.progressed(1);

        if self.fail.contains(script.id()) {
            return Err(HandlerError::Failed(format!("{} failed on purpose", script.id())));
        }
        Ok(())
    }
}

/// Registry with the built-in handlers plus `recording`
pub fn recording_registry(handler: RecordingHandler) -> HandlerRegistry {
    HandlerRegistry::new().with(RECORDING, move || {
        Ok(Box::new(handler.clone()) as Box<dyn ScriptHandler>)
    })
}

/// Profile running both kinds through the recording handler
pub fn recording_profile_store(lock_dir: &Path) -> PropertyStore {
    [
        ("handler.command", RECORDING.to_string()),
        ("handler.cluster-job", RECORDING.to_string()),
        ("handler.command.env.ASAKUSA_HOME", "${ASAKUSA_HOME}".to_string()),
        ("lock.directory", lock_dir.display().to_string()),
        ("lock.pollInterval", "20".to_string()),
    ]
    .into_iter()
    .collect()
}

pub fn load_profile(
    store: &PropertyStore,
    variables: &[(&str, &str)],
) -> Result<EngineProfile, flowgate::engine::ProfileError> {
    let resolver = VariableResolver::new(variables.iter().copied());
    EngineProfile::from_store(store, ProfileContext::new(resolver))
}

pub fn recording_profile(lock_dir: &Path) -> EngineProfile {
    load_profile(
        &recording_profile_store(lock_dir),
        &[("ASAKUSA_HOME", "/opt/asakusa")],
    )
    .expect("Failed to load profile")
}

pub fn command(id: &str, blockers: &[&str], tokens: &[&str]) -> ExecutionScript {
    let env = [("EXECUTION_ID".to_string(), "${execution_id}".to_string())]
        .into_iter()
        .collect();
    ExecutionScript::command(
        id,
        blockers.iter().copied(),
        tokens.iter().map(|t| t.to_string()).collect(),
        env,
    )
    .expect("Invalid script")
}

pub fn cluster_job(id: &str, blockers: &[&str], class_name: &str) -> ExecutionScript {
    ExecutionScript::cluster_job(
        id,
        blockers.iter().copied(),
        class_name,
        BTreeMap::new(),
        BTreeMap::new(),
    )
    .expect("Invalid script")
}

pub fn all_kinds() -> BTreeSet<ScriptKind> {
    ScriptKind::ALL.into_iter().collect()
}

pub fn flow(
    id: &str,
    blockers: &[&str],
    phases: Vec<(Phase, Vec<ExecutionScript>)>,
    enabled_kinds: BTreeSet<ScriptKind>,
) -> FlowScript {
    FlowScript::new(
        id,
        blockers.iter().map(|b| b.to_string()).collect(),
        phases.into_iter().collect(),
        enabled_kinds,
    )
    .expect("Invalid flow")
}

/// A flow with one import, one main and one cleanup script
pub fn standard_flow(id: &str, blockers: &[&str]) -> FlowScript {
    flow(
        id,
        blockers,
        vec![
            (
                Phase::Import,
                vec![command(&format!("{}-import", id), &[], &["import", "${flow_id}"])],
            ),
            (
                Phase::Main,
                vec![command(
                    &format!("{}-main", id),
                    &[],
                    &["${ASAKUSA_HOME}/bin/run.sh", "${flow_id}", "${execution_id}"],
                )],
            ),
            (
                Phase::Cleanup,
                vec![command(&format!("{}-cleanup", id), &[], &["cleanup"])],
            ),
        ],
        all_kinds(),
    )
}

/// `testing` blocks `left` and `right`, which both block `last`
pub fn diamond_batch() -> BatchGraph {
    BatchGraph::build(vec![
        standard_flow("testing", &[]),
        standard_flow("left", &["testing"]),
        standard_flow("right", &["testing"]),
        standard_flow("last", &["left", "right"]),
    ])
    .expect("Invalid batch")
}

pub fn diamond_store() -> PropertyStore {
    codec::encode_batch(&diamond_batch())
}

pub fn calls_of<'a>(calls: &'a [RecordedCall], flow_id: &str) -> Vec<&'a RecordedCall> {
    calls.iter().filter(|c| c.flow_id == flow_id).collect()
}

/// Sequence number of the first start / last end among `calls`
pub fn span(calls: &[&RecordedCall]) -> (u64, u64) {
    let start = calls.iter().map(|c| c.start).min().unwrap_or(u64::MAX);
    let end = calls.iter().map(|c| c.end).max().unwrap_or(0);
    (start, end)
}
