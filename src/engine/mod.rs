//! Execution engine module
//!
//! This module contains:
//! - `executor` - Runs one invocation end to end
//! - `planner` - Invocation requests, modes and plans
//! - `scheduler` - Eager script and flow scheduling
//! - `handler` - Script handler trait, registry and instances
//! - `handlers` - Built-in `process`, `launcher` and `noop` handlers
//! - `profile` - Engine profile and handler service profiles
//! - `lock` - File-backed resource locks
//! - `monitor` - Progress monitors
//! - `result` - Script, flow, batch and invocation results
//! - `error` - Executor error types

pub mod error;
pub mod executor;
pub mod handler;
pub mod handlers;
pub mod lock;
pub mod monitor;
pub mod planner;
pub mod profile;
pub mod result;
pub mod scheduler;

pub use error::ExecutorError;
pub use executor::Executor;
pub use handler::{
    HandlerError, HandlerFactory, HandlerInstance, HandlerRegistry, HandlerSet, ScriptHandler,
};
pub use lock::{LockError, LockGuard, LockManager, LockScope};
pub use monitor::{ExecutionMonitor, LoggingMonitor, MonitorGuard, MonitorTarget};
pub use planner::{InvocationMode, InvocationPlan, InvocationRequest, PlanError};
pub use profile::{EngineProfile, ProfileContext, ProfileError, ServiceProfile};
pub use result::{
    BatchResult, Failure, FlowResult, InvocationOutcome, InvocationResult, ScriptResult,
    ScriptStatus, SkipReason,
};
pub use scheduler::Scheduler;
