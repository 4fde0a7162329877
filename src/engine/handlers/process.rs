//! Handler running command scripts as local processes
//!
//! Profile entries under `handler.command.`:
//! - `workingDirectory` - directory to run in (optional, resolved)

use std::path::PathBuf;

use async_trait::async_trait;

use super::run_process;
use crate::engine::handler::{HandlerError, ScriptHandler};
use crate::engine::monitor::MonitorGuard;
use crate::engine::profile::ServiceProfile;
use crate::workflow::{ExecutionContext, ExecutionScript, ScriptKind};

#[derive(Debug, Default)]
pub struct ProcessHandler {
    working_directory: Option<PathBuf>,
}

impl ProcessHandler {
    pub const SELECTOR: &'static str = "process";
}

#[async_trait]
impl ScriptHandler for ProcessHandler {
    fn name(&self) -> &str {
        Self::SELECTOR
    }

    fn supports(&self, kind: ScriptKind) -> bool {
        kind == ScriptKind::Command
    }

    fn configure(&mut self, profile: &ServiceProfile) -> Result<(), HandlerError> {
        self.working_directory = profile
            .get("workingDirectory", false, true)
            .map_err(|e| HandlerError::Config(e.to_string()))?
            .map(PathBuf::from);
        Ok(())
    }

    async fn execute(
        &self,
        monitor: &MonitorGuard,
        _context: &ExecutionContext,
        script: &ExecutionScript,
    ) -> Result<(), HandlerError> {
        let Some((program, args)) = script.command_line().and_then(|c| c.split_first()) else {
            return Err(HandlerError::Unsupported {
                handler: self.name().to_string(),
                kind: script.kind(),
            });
        };

        run_process(
            program,
            args,
            script.environment(),
            self.working_directory.as_deref(),
        )
        .await?;
        monitor.progressed(1);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::monitor::LoggingMonitor;
    use crate::engine::monitor::MonitorTarget;
    use std::collections::BTreeMap;
    use std::sync::Arc;

    fn context() -> ExecutionContext {
        ExecutionContext::new("b", "f", "e", None, BTreeMap::new())
    }

    fn guard() -> MonitorGuard {
        MonitorGuard::open(
            Arc::new(LoggingMonitor),
            MonitorTarget::new(&context(), "s"),
            1,
        )
    }

    #[tokio::test]
    async fn test_runs_in_working_directory() {
        let dir = tempfile::tempdir().unwrap();
        let handler = ProcessHandler {
            working_directory: Some(dir.path().to_path_buf()),
        };
        let script = ExecutionScript::command(
            "touch",
            Vec::<String>::new(),
            vec!["sh".into(), "-c".into(), "echo $MARK > marker".into()],
            [("MARK".to_string(), "ok".to_string())].into_iter().collect(),
        )
        .unwrap();

        let monitor = guard();
        handler.execute(&monitor, &context(), &script).await.unwrap();

        let written = std::fs::read_to_string(dir.path().join("marker")).unwrap();
        assert_eq!(written.trim(), "ok");
        assert_eq!(monitor.units_done(), 1);
    }

    #[tokio::test]
    async fn test_rejects_cluster_jobs() {
        let script = ExecutionScript::cluster_job(
            "job",
            Vec::<String>::new(),
            "com.example.Job",
            BTreeMap::new(),
            BTreeMap::new(),
        )
        .unwrap();
        let err = ProcessHandler::default()
            .execute(&guard(), &context(), &script)
            .await
            .unwrap_err();
        assert!(matches!(err, HandlerError::Unsupported { .. }));
    }
}
