//! Invocation executor - Runs one request against a graph store
//!
//! This is the entry point of the engine that:
//! 1. Plans the request (mode checks, graph loading, execution IDs)
//! 2. Instantiates one handler per script kind in scope
//! 3. Acquires the resource locks of every script in scope
//! 4. Hands the plan to the [`Scheduler`]
//! 5. Releases the locks and reports the result

use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use std::sync::Arc;

use tracing::{info, instrument, warn};

use super::error::ExecutorError;
use super::handler::{HandlerRegistry, HandlerSet};
use super::lock::{LockManager, LockScope};
use super::monitor::{ExecutionMonitor, LoggingMonitor};
use super::planner::{InvocationPlan, InvocationRequest, PlanScope};
use super::profile::EngineProfile;
use super::result::{FlowResult, InvocationOutcome, InvocationResult};
use super::scheduler::Scheduler;
use crate::workflow::{Phase, PropertyStore};

/// Runs invocations with one engine profile
pub struct Executor {
    profile: EngineProfile,
    registry: HandlerRegistry,
    monitor: Arc<dyn ExecutionMonitor>,
}

impl Executor {
    /// Create an executor with the built-in handlers
    pub fn new(profile: EngineProfile) -> Self {
        Self {
            profile,
            registry: HandlerRegistry::new(),
            monitor: Arc::new(LoggingMonitor),
        }
    }

    /// Replace the handler registry
    pub fn with_registry(mut self, registry: HandlerRegistry) -> Self {
        self.registry = registry;
        self
    }

    pub fn with_monitor(mut self, monitor: Arc<dyn ExecutionMonitor>) -> Self {
        self.monitor = monitor;
        self
    }

    pub fn profile(&self) -> &EngineProfile {
        &self.profile
    }

    /// Load a graph store file and run `request` against it
    pub async fn run_file(
        &self,
        request: &InvocationRequest,
        path: impl AsRef<Path>,
    ) -> Result<InvocationResult, ExecutorError> {
        let store = PropertyStore::load(path)?;
        self.run(request, &store).await
    }

    /// Run one invocation.
    ///
    /// Errors are returned only for problems found before any script runs.
    /// Script and flow failures are reported in the result.
    #[instrument(
        skip_all,
        fields(mode = %request.mode, batch_id = %request.batch_id)
    )]
    pub async fn run(
        &self,
        request: &InvocationRequest,
        store: &PropertyStore,
    ) -> Result<InvocationResult, ExecutorError> {
        let plan = InvocationPlan::build(request, store)?;
        let handlers = self
            .profile
            .instantiate(&self.registry, &plan.required_kinds())?;

        let scope = self.profile.lock.scope;
        let keys = lock_keys(&plan, &handlers, scope);
        let manager = LockManager::from_config(&self.profile.lock);
        let guards = manager.acquire_all(scope, keys).await?;

        let parallelism = plan
            .definitions
            .parallelism
            .unwrap_or(self.profile.scheduler.parallelism);
        let flow_parallelism = if plan.definitions.serialize_flows {
            Some(1)
        } else {
            self.profile.scheduler.flow_parallelism
        };
        let scheduler = Scheduler::new(handlers, parallelism)
            .with_monitor(self.monitor.clone())
            .with_resource_limits(&self.profile.scheduler.resource_parallelism)
            .with_flow_parallelism(flow_parallelism);

        info!(parallelism, locks = guards.len(), "Invocation started");
        let outcome = match &plan.scope {
            PlanScope::Batch { graph, .. } => {
                let contexts: BTreeMap<String, _> = graph
                    .flow_ids()
                    .into_iter()
                    .map(|id| (id.to_string(), plan.flow_context(id)))
                    .collect();
                InvocationOutcome::Batch(
                    scheduler
                        .run_batch(
                            &plan.batch_id,
                            graph,
                            &contexts,
                            &plan.definitions.skip_flows,
                        )
                        .await,
                )
            }
            PlanScope::Flow { flow, context } => {
                if plan.is_skipped(flow.id()) {
                    info!(flow_id = flow.id(), "Flow skipped by request");
                    InvocationOutcome::Flow(FlowResult::skipped(
                        flow.id(),
                        context.execution_id(),
                        true,
                    ))
                } else {
                    InvocationOutcome::Flow(scheduler.run_flow(flow, context).await)
                }
            }
            PlanScope::Phase {
                enabled_kinds,
                scripts,
                context,
            } => {
                if plan.is_skipped(context.flow_id()) {
                    info!(flow_id = context.flow_id(), "Flow skipped by request");
                    InvocationOutcome::Phase(FlowResult::skipped(
                        context.flow_id(),
                        context.execution_id(),
                        true,
                    ))
                } else {
                    let phase = context.phase().unwrap_or(Phase::Main);
                    InvocationOutcome::Phase(
                        scheduler
                            .run_single_phase(context, phase, scripts, enabled_kinds)
                            .await,
                    )
                }
            }
        };

        for guard in guards {
            let path = guard.path().to_path_buf();
            if let Err(e) = guard.release() {
                warn!(path = %path.display(), error = %e, "Failed to release lock");
            }
        }

        let success = match &outcome {
            InvocationOutcome::Batch(batch) => batch.success,
            InvocationOutcome::Flow(flow) | InvocationOutcome::Phase(flow) => flow.success,
        };
        if success {
            info!("Invocation completed successfully");
        } else {
            warn!("Invocation failed");
        }

        Ok(InvocationResult {
            mode: plan.mode,
            success,
            outcome,
        })
    }
}

impl std::fmt::Debug for Executor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Executor")
            .field("profile", &self.profile)
            .field("registry", &self.registry)
            .finish()
    }
}

/// Scoped resource keys of every script the plan may run
fn lock_keys(plan: &InvocationPlan, handlers: &HandlerSet, scope: LockScope) -> BTreeSet<String> {
    let mut keys = BTreeSet::new();
    for (context, scripts) in plan.units() {
        for script in scripts {
            if let Some(handler) = handlers.get(script.kind()) {
                keys.insert(scope.qualify(&handler.resource_id(&context, script), &context));
            }
        }
    }
    keys
}
