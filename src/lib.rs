//! # Flowgate
//!
//! A phase-ordered batch workflow engine. A batch is a graph of flows, each
//! flow holds scripts grouped into a fixed sequence of phases, and every
//! script is run by a pluggable handler chosen by its kind.
//!
//! ## Features
//!
//! - **Compiled graph store** - Flows are read from a flat key-value file
//! - **Three invocation modes** - A whole batch, one flow, or one phase
//! - **Eager scheduling** - Scripts start as soon as their blockers succeed
//! - **Strict phase barrier** - A failed phase stops the rest of its flow
//! - **Resource locks** - Conflicting invocations wait for each other
//! - **Placeholders** - `${name}` substitution from the invocation context
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use flowgate::prelude::*;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let profile = EngineProfile::load("engine.properties", VariableResolver::system())?;
//!     let store = PropertyStore::load("batch.properties")?;
//!
//!     let request = InvocationRequest::batch("nightly").with_argument("date", "2024-01-01");
//!     let result = Executor::new(profile).run(&request, &store).await?;
//!
//!     println!("Batch completed: success={}", result.success);
//!     Ok(())
//! }
//! ```

pub mod engine;
pub mod workflow;

// Re-export main types
pub use engine::{
    BatchResult, EngineProfile, ExecutionMonitor, Executor, ExecutorError, Failure, FlowResult,
    HandlerError, HandlerRegistry, InvocationMode, InvocationRequest, InvocationResult,
    LockManager, LockScope, MonitorGuard, ScriptHandler, ScriptResult, ScriptStatus, SkipReason,
};
pub use workflow::{
    BatchGraph, ExecutionContext, ExecutionScript, FlowScript, GraphError, Phase, PropertyStore,
    ScriptKind, ScriptPayload, StoreError, VariableResolver,
};

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::engine::{
        EngineProfile, Executor, HandlerError, HandlerRegistry, InvocationMode, InvocationRequest,
        InvocationResult, MonitorGuard, ScriptHandler, ScriptStatus,
    };
    pub use crate::workflow::codec;
    pub use crate::workflow::{
        BatchGraph, ExecutionContext, ExecutionScript, FlowScript, Phase, PropertyStore,
        ScriptKind, VariableResolver,
    };
}
