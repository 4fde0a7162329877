//! Script and flow scheduling
//!
//! Scripts of a phase start as soon as their blockers inside the phase have
//! succeeded (eager scheduling), bounded by a semaphore on RUNNING scripts
//! and, when configured, by a semaphore per handler resource ID.
//! Phases of a flow run one after another; once a phase has a failure the
//! remaining phases never start. Flows of a batch are scheduled the same way
//! over their flow blockers.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::{Mutex, Semaphore};
use tokio::task::{JoinError, JoinSet};
use tracing::{debug, error, info, instrument, warn};

use super::handler::{HandlerSet, DEFAULT_RESOURCE_ID};
use super::monitor::{ExecutionMonitor, LoggingMonitor, MonitorGuard, MonitorTarget};
use super::result::{BatchResult, FlowResult, ScriptResult, ScriptStatus, SkipReason};
use crate::workflow::{BatchGraph, ExecutionContext, ExecutionScript, FlowScript, Phase, ScriptKind};

/// Largest accepted parallelism; a semaphore cannot hold more permits
pub const MAX_PARALLELISM: usize = Semaphore::MAX_PERMITS;

#[derive(Debug, PartialEq)]
enum Readiness {
    Ready,
    Waiting,
    Blocked,
}

/// Drives handlers over scripts, flows and batches
#[derive(Clone)]
pub struct Scheduler {
    handlers: HandlerSet,
    monitor: Arc<dyn ExecutionMonitor>,
    permits: Arc<Semaphore>,
    resource_permits: Arc<BTreeMap<String, Arc<Semaphore>>>,
    flow_parallelism: Option<usize>,
    clock: Arc<AtomicU64>,
}

impl Scheduler {
    /// Create a scheduler running at most `parallelism` scripts at once
    pub fn new(handlers: HandlerSet, parallelism: usize) -> Self {
        Self {
            handlers,
            monitor: Arc::new(LoggingMonitor),
            permits: Arc::new(Semaphore::new(parallelism.clamp(1, MAX_PARALLELISM))),
            resource_permits: Arc::new(BTreeMap::new()),
            flow_parallelism: None,
            clock: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn with_monitor(mut self, monitor: Arc<dyn ExecutionMonitor>) -> Self {
        self.monitor = monitor;
        self
    }

    /// Limit running scripts per resource ID.
    ///
    /// Resources without an entry share the [`DEFAULT_RESOURCE_ID`] limit, or
    /// run unlimited when there is none.
    pub fn with_resource_limits(mut self, limits: &BTreeMap<String, usize>) -> Self {
        self.resource_permits = Arc::new(
            limits
                .iter()
                .map(|(resource, &n)| {
                    let permits = Semaphore::new(n.clamp(1, MAX_PARALLELISM));
                    (resource.clone(), Arc::new(permits))
                })
                .collect(),
        );
        self
    }

    fn resource_semaphore(&self, resource: &str) -> Option<Arc<Semaphore>> {
        self.resource_permits
            .get(resource)
            .or_else(|| self.resource_permits.get(DEFAULT_RESOURCE_ID))
            .cloned()
    }

    /// Limit simultaneously running flows; unbounded when `None`
    pub fn with_flow_parallelism(mut self, limit: Option<usize>) -> Self {
        self.flow_parallelism = limit;
        self
    }

    fn tick(&self) -> u64 {
        self.clock.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Run the scripts of one phase.
    ///
    /// Blockers that are not part of `scripts` belong to earlier phases and
    /// are taken as satisfied. Results come back in the order of `scripts`.
    #[instrument(
        skip_all,
        fields(flow_id = %context.flow_id(), execution_id = %context.execution_id(), phase = %phase)
    )]
    pub async fn run_phase(
        &self,
        context: &ExecutionContext,
        phase: Phase,
        scripts: &[ExecutionScript],
        enabled_kinds: &BTreeSet<ScriptKind>,
    ) -> Vec<ScriptResult> {
        let context = Arc::new(context.with_phase(phase));
        let by_id: BTreeMap<&str, &ExecutionScript> = scripts.iter().map(|s| (s.id(), s)).collect();
        let mut pending: BTreeSet<&str> = by_id.keys().copied().collect();
        let mut finished: BTreeMap<String, ScriptResult> = BTreeMap::new();
        let mut running: JoinSet<ScriptResult> = JoinSet::new();

        debug!(scripts = scripts.len(), "Phase started");

        loop {
            // Settle skips first; a skip may block further scripts.
            loop {
                let mut changed = false;
                for id in pending.clone() {
                    let script = by_id[id];
                    if !enabled_kinds.contains(&script.kind()) {
                        debug!(script_id = id, kind = %script.kind(), "Script kind disabled");
                        finished.insert(
                            id.to_string(),
                            ScriptResult::skipped(id, phase, script.kind(), SkipReason::Disabled),
                        );
                        pending.remove(id);
                        changed = true;
                        continue;
                    }
                    match readiness(script, &by_id, &finished) {
                        Readiness::Blocked => {
                            warn!(script_id = id, "Script skipped: a blocker failed");
                            finished.insert(
                                id.to_string(),
                                ScriptResult::skipped(
                                    id,
                                    phase,
                                    script.kind(),
                                    SkipReason::BlockerFailed,
                                ),
                            );
                            pending.remove(id);
                            changed = true;
                        }
                        Readiness::Ready => {
                            pending.remove(id);
                            running.spawn(self.clone().execute_script(
                                context.clone(),
                                phase,
                                script.clone(),
                            ));
                        }
                        Readiness::Waiting => {}
                    }
                }
                if !changed {
                    break;
                }
            }

            match running.join_next().await {
                Some(Ok(result)) => {
                    finished.insert(result.id.clone(), result);
                }
                Some(Err(e)) => {
                    error!(error = %e, "Script task failed");
                }
                None => break,
            }
        }

        scripts
            .iter()
            .map(|s| {
                finished.remove(s.id()).unwrap_or_else(|| ScriptResult {
                    id: s.id().to_string(),
                    phase,
                    kind: s.kind(),
                    status: ScriptStatus::Failed,
                    error: Some("script could not be scheduled".to_string()),
                    started: None,
                    finished: None,
                })
            })
            .collect()
    }

    async fn execute_script(
        self,
        context: Arc<ExecutionContext>,
        phase: Phase,
        script: ExecutionScript,
    ) -> ScriptResult {
        let mut result = ScriptResult {
            id: script.id().to_string(),
            phase,
            kind: script.kind(),
            status: ScriptStatus::Failed,
            error: None,
            started: None,
            finished: None,
        };

        let Some(handler) = self.handlers.get(script.kind()) else {
            result.error = Some(format!("No handler configured for '{}'", script.kind()));
            return result;
        };
        // Resource slot first so a script waiting on its resource holds no global slot
        let resource = handler.resource_id(&context, &script);
        let _resource_permit = match self.resource_semaphore(&resource) {
            Some(permits) => match permits.acquire_owned().await {
                Ok(permit) => Some(permit),
                Err(e) => {
                    result.error = Some(e.to_string());
                    return result;
                }
            },
            None => None,
        };
        let _permit = match self.permits.clone().acquire_owned().await {
            Ok(permit) => permit,
            Err(e) => {
                result.error = Some(e.to_string());
                return result;
            }
        };
        result.started = Some(self.tick());

        let overrides = handler.environment_variables(&context, &script);
        let outcome = match script.resolve(&context, &overrides) {
            Err(e) => Err(format!("Failed to resolve script: {}", e)),
            Ok(resolved) => {
                debug!(script_id = resolved.id(), handler = handler.name(), "Script running");
                let monitor = self.monitor.clone();
                let target = MonitorTarget::new(&context, resolved.id());
                let context = context.clone();
                let task = tokio::spawn(async move {
                    let guard = MonitorGuard::open(monitor, target, 1);
                    handler.execute(&guard, &context, &resolved).await
                });
                match task.await {
                    Ok(Ok(())) => Ok(()),
                    Ok(Err(e)) => Err(e.to_string()),
                    Err(e) => Err(describe_join_error(e)),
                }
            }
        };

        result.finished = Some(self.tick());
        match outcome {
            Ok(()) => {
                result.status = ScriptStatus::Succeeded;
            }
            Err(message) => {
                warn!(script_id = %result.id, error = %message, "Script failed");
                result.error = Some(message);
            }
        }
        result
    }

    /// Run every phase of a flow in order
    #[instrument(
        skip_all,
        fields(flow_id = %flow.id(), execution_id = %context.execution_id())
    )]
    pub async fn run_flow(&self, flow: &FlowScript, context: &ExecutionContext) -> FlowResult {
        info!("Flow started");
        let mut scripts = Vec::with_capacity(flow.script_count());
        let mut aborted = false;

        for (phase, phase_scripts) in flow.phases() {
            if aborted {
                scripts.extend(phase_scripts.iter().map(|s| {
                    ScriptResult::skipped(s.id(), phase, s.kind(), SkipReason::PhaseAborted)
                }));
                continue;
            }
            let results = self
                .run_phase(context, phase, phase_scripts, flow.enabled_kinds())
                .await;
            if results.iter().any(|r| r.status.is_failure()) {
                warn!(phase = %phase, "Phase failed; later phases will not run");
                aborted = true;
            }
            scripts.extend(results);
        }

        if aborted {
            warn!("Flow failed");
        } else {
            info!("Flow completed successfully");
        }
        FlowResult {
            flow_id: flow.id().to_string(),
            execution_id: context.execution_id().to_string(),
            success: !aborted,
            skipped: false,
            scripts,
        }
    }

    /// Run a single phase of a flow as a whole invocation
    pub async fn run_single_phase(
        &self,
        context: &ExecutionContext,
        phase: Phase,
        scripts: &[ExecutionScript],
        enabled_kinds: &BTreeSet<ScriptKind>,
    ) -> FlowResult {
        let results = self.run_phase(context, phase, scripts, enabled_kinds).await;
        FlowResult {
            flow_id: context.flow_id().to_string(),
            execution_id: context.execution_id().to_string(),
            success: !results.iter().any(|r| r.status.is_failure()),
            skipped: false,
            scripts: results,
        }
    }

    /// Run the flows of a batch.
    ///
    /// Flows in `skip` are not run and count as successful. A failed flow
    /// skips every flow that waits on it; unrelated flows still run.
    #[instrument(skip_all, fields(flows = graph.len()))]
    pub async fn run_batch(
        &self,
        batch_id: &str,
        graph: &BatchGraph,
        contexts: &BTreeMap<String, ExecutionContext>,
        skip: &BTreeSet<String>,
    ) -> BatchResult {
        let flow_permits = Arc::new(Semaphore::new(
            self.flow_parallelism
                .unwrap_or(graph.len())
                .clamp(1, MAX_PARALLELISM),
        ));
        let execution_order: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
        let mut pending: BTreeSet<String> =
            graph.flow_ids().into_iter().map(str::to_string).collect();
        let mut results: BTreeMap<String, FlowResult> = BTreeMap::new();
        let mut skipped_flows = Vec::new();
        let mut running: JoinSet<FlowResult> = JoinSet::new();

        let context_of = |flow_id: &str| {
            contexts.get(flow_id).cloned().unwrap_or_else(|| {
                ExecutionContext::new(
                    batch_id,
                    flow_id,
                    ExecutionContext::generate_execution_id(),
                    None,
                    BTreeMap::new(),
                )
            })
        };

        loop {
            loop {
                let mut changed = false;
                for id in pending.clone() {
                    let Some(flow) = graph.get(&id) else {
                        pending.remove(&id);
                        continue;
                    };
                    if skip.contains(&id) {
                        info!(flow_id = %id, "Flow skipped by request");
                        results.insert(id.clone(), skipped_flow(flow, &context_of(&id), true));
                        skipped_flows.push(id.clone());
                        pending.remove(&id);
                        changed = true;
                        continue;
                    }

                    let mut state = Readiness::Ready;
                    for blocker in flow.blocker_ids() {
                        match results.get(blocker) {
                            Some(r) if r.success => {}
                            Some(_) => {
                                state = Readiness::Blocked;
                                break;
                            }
                            None => state = Readiness::Waiting,
                        }
                    }

                    match state {
                        Readiness::Blocked => {
                            warn!(flow_id = %id, "Flow skipped: a blocking flow failed");
                            results.insert(id.clone(), skipped_flow(flow, &context_of(&id), false));
                            skipped_flows.push(id.clone());
                            pending.remove(&id);
                            changed = true;
                        }
                        Readiness::Ready => {
                            pending.remove(&id);
                            let scheduler = self.clone();
                            let flow = flow.clone();
                            let context = context_of(&id);
                            let permits = flow_permits.clone();
                            let order = execution_order.clone();
                            running.spawn(async move {
                                let _permit = permits.acquire_owned().await.ok();
                                order.lock().await.push(flow.id().to_string());
                                scheduler.run_flow(&flow, &context).await
                            });
                        }
                        Readiness::Waiting => {}
                    }
                }
                if !changed {
                    break;
                }
            }

            match running.join_next().await {
                Some(Ok(result)) => {
                    results.insert(result.flow_id.clone(), result);
                }
                Some(Err(e)) => {
                    error!(error = %e, "Flow task failed");
                }
                None => break,
            }
        }

        for flow in graph.flows() {
            if !results.contains_key(flow.id()) {
                let mut lost = skipped_flow(flow, &context_of(flow.id()), false);
                lost.skipped = false;
                results.insert(flow.id().to_string(), lost);
            }
        }

        let success = results.values().all(|r| r.success);
        let execution_order = execution_order.lock().await.clone();
        if success {
            info!(batch_id, "Batch completed successfully");
        } else {
            warn!(batch_id, "Batch failed");
        }
        BatchResult {
            batch_id: batch_id.to_string(),
            success,
            flows: results,
            skipped_flows,
            execution_order,
        }
    }
}

impl std::fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scheduler")
            .field("handlers", &self.handlers)
            .field("available_permits", &self.permits.available_permits())
            .field("resources", &self.resource_permits.keys().collect::<Vec<_>>())
            .field("flow_parallelism", &self.flow_parallelism)
            .finish()
    }
}

fn readiness(
    script: &ExecutionScript,
    phase_scripts: &BTreeMap<&str, &ExecutionScript>,
    finished: &BTreeMap<String, ScriptResult>,
) -> Readiness {
    let mut state = Readiness::Ready;
    for blocker in script.blocker_ids() {
        if !phase_scripts.contains_key(blocker.as_str()) {
            continue;
        }
        match finished.get(blocker) {
            Some(r) if r.status.satisfies_dependents() => {}
            Some(_) => return Readiness::Blocked,
            None => state = Readiness::Waiting,
        }
    }
    state
}

fn skipped_flow(flow: &FlowScript, context: &ExecutionContext, success: bool) -> FlowResult {
    let mut result = FlowResult::skipped(flow.id(), context.execution_id(), success);
    result.scripts = flow
        .phases()
        .flat_map(|(phase, scripts)| {
            scripts
                .iter()
                .map(move |s| ScriptResult::skipped(s.id(), phase, s.kind(), SkipReason::FlowSkipped))
        })
        .collect();
    result
}

fn describe_join_error(e: JoinError) -> String {
    if e.is_panic() {
        let payload = e.into_panic();
        let message = payload
            .downcast_ref::<&str>()
            .map(|s| s.to_string())
            .or_else(|| payload.downcast_ref::<String>().cloned())
            .unwrap_or_else(|| "unknown panic".to_string());
        format!("Handler panicked: {}", message)
    } else {
        format!("Handler task failed: {}", e)
    }
}
