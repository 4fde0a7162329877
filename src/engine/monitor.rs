//! Progress monitors for script execution
//!
//! A monitor is opened before a handler runs and closed after it returns.
//! [`MonitorGuard`] closes on drop, so the pair holds when the handler fails
//! or panics.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tracing::{debug, info};

use crate::workflow::{ExecutionContext, Phase};

/// The script a monitor reports on
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MonitorTarget {
    pub batch_id: String,
    pub flow_id: String,
    pub execution_id: String,
    pub phase: Option<Phase>,
    pub script_id: String,
}

impl MonitorTarget {
    pub fn new(context: &ExecutionContext, script_id: &str) -> Self {
        Self {
            batch_id: context.batch_id().to_string(),
            flow_id: context.flow_id().to_string(),
            execution_id: context.execution_id().to_string(),
            phase: context.phase(),
            script_id: script_id.to_string(),
        }
    }
}

/// Receives progress of script executions
pub trait ExecutionMonitor: Send + Sync {
    fn open(&self, target: &MonitorTarget, unit_count: u64);

    fn progressed(&self, _target: &MonitorTarget, _units: u64) {}

    fn close(&self, target: &MonitorTarget);
}

/// Reports progress as tracing events
#[derive(Debug, Default)]
pub struct LoggingMonitor;

impl ExecutionMonitor for LoggingMonitor {
    fn open(&self, target: &MonitorTarget, unit_count: u64) {
        info!(
            flow_id = %target.flow_id,
            execution_id = %target.execution_id,
            script_id = %target.script_id,
            units = unit_count,
            "Script started"
        );
    }

    fn progressed(&self, target: &MonitorTarget, units: u64) {
        debug!(script_id = %target.script_id, units, "Script progressed");
    }

    fn close(&self, target: &MonitorTarget) {
        info!(
            flow_id = %target.flow_id,
            execution_id = %target.execution_id,
            script_id = %target.script_id,
            "Script finished"
        );
    }
}

/// An open monitor, closed exactly once when dropped
pub struct MonitorGuard {
    monitor: Arc<dyn ExecutionMonitor>,
    target: MonitorTarget,
    unit_count: u64,
    done: AtomicU64,
}

impl MonitorGuard {
    pub fn open(monitor: Arc<dyn ExecutionMonitor>, target: MonitorTarget, unit_count: u64) -> Self {
        monitor.open(&target, unit_count);
        Self {
            monitor,
            target,
            unit_count,
            done: AtomicU64::new(0),
        }
    }

    /// Report finished units
    pub fn progressed(&self, units: u64) {
        self.done.fetch_add(units, Ordering::Relaxed);
        self.monitor.progressed(&self.target, units);
    }

    pub fn units_done(&self) -> u64 {
        self.done.load(Ordering::Relaxed)
    }
}

impl Drop for MonitorGuard {
    fn drop(&mut self) {
        self.monitor.close(&self.target);
    }
}

impl std::fmt::Debug for MonitorGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MonitorGuard")
            .field("target", &self.target)
            .field("unit_count", &self.unit_count)
            .finish()
    }
}
