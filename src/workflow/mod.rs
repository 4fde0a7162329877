//! Workflow model and persisted graph store
//!
//! This module contains:
//! - `phase` - The fixed phase order of a flow
//! - `script` - ExecutionScript, its kinds and resolution
//! - `flow` - FlowScript, the scripts of one flow by phase
//! - `batch` - BatchGraph, the flows of a batch and their levels
//! - `graph` - Dependency levelling shared by flows and scripts
//! - `store` - Flat key-value text store
//! - `codec` - Encoding of flows into the store and back
//! - `context` - ExecutionContext for one flow invocation
//! - `variables` - `${name}` placeholder substitution

pub mod batch;
pub mod codec;
pub mod context;
pub mod flow;
pub mod graph;
pub mod phase;
pub mod script;
pub mod store;
pub mod variables;

pub use batch::BatchGraph;
pub use context::ExecutionContext;
pub use flow::FlowScript;
pub use graph::GraphError;
pub use phase::Phase;
pub use script::{ExecutionScript, ScriptError, ScriptKind, ScriptPayload};
pub use store::{PropertyStore, StoreError};
pub use variables::{VariableError, VariableResolver};
