//! Handler that only logs what would run

use async_trait::async_trait;
use tracing::info;

use crate::engine::handler::{HandlerError, ScriptHandler};
use crate::engine::monitor::MonitorGuard;
use crate::workflow::{ExecutionContext, ExecutionScript, ScriptKind, ScriptPayload};

#[derive(Debug, Default, Clone, Copy)]
pub struct NoopHandler;

impl NoopHandler {
    pub const SELECTOR: &'static str = "noop";
}

#[async_trait]
impl ScriptHandler for NoopHandler {
    fn name(&self) -> &str {
        Self::SELECTOR
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
        match script.payload() {
            ScriptPayload::Command { command } => info!(
                flow_id = context.flow_id(),
                script_id = script.id(),
                command = ?command,
                "Skipping command (noop)"
            ),
            ScriptPayload::ClusterJob { class_name, .. } => info!(
                flow_id = context.flow_id(),
                script_id = script.id(),
                class_name = %class_name,
                "Skipping cluster job (noop)"
            ),
        }
        monitor.progressed(1);
        Ok(())
    }
}
