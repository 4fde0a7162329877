//! Handler delegating cluster jobs to a launcher program
//!
//! The launcher is called as
//! `<launcher> <class> <batchId> <flowId> <executionId> <batchArguments> [-D key=value]...`
//! with the resolved script environment.
//!
//! Profile entries under `handler.cluster-job.`:
//! - `launcher` - launcher program (mandatory, resolved)
//! - `workingDirectory` - directory to run in (optional, resolved)

use std::path::PathBuf;

use async_trait::async_trait;

use super::run_process;
use crate::engine::handler::{HandlerError, ScriptHandler};
use crate::engine::monitor::MonitorGuard;
use crate::engine::profile::ServiceProfile;
use crate::workflow::{ExecutionContext, ExecutionScript, ScriptKind, ScriptPayload};

#[derive(Debug, Default)]
pub struct LauncherHandler {
    launcher: String,
    working_directory: Option<PathBuf>,
}

impl LauncherHandler {
    pub const SELECTOR: &'static str = "launcher";

    pub fn new(launcher: impl Into<String>) -> Self {
        Self {
            launcher: launcher.into(),
            working_directory: None,
        }
    }

    /// Launcher arguments for a cluster job
    pub fn arguments(
        context: &ExecutionContext,
        class_name: &str,
        properties: &std::collections::BTreeMap<String, String>,
    ) -> Vec<String> {
        let mut args = vec![
            class_name.to_string(),
            context.batch_id().to_string(),
            context.flow_id().to_string(),
            context.execution_id().to_string(),
            context.arguments_as_string(),
        ];
        for (key, value) in properties {
            args.push("-D".to_string());
            args.push(format!("{}={}", key, value));
        }
        args
    }
}

#[async_trait]
impl ScriptHandler for LauncherHandler {
    fn name(&self) -> &str {
        Self::SELECTOR
    }

    fn supports(&self, kind: ScriptKind) -> bool {
        kind == ScriptKind::ClusterJob
    }

    fn configure(&mut self, profile: &ServiceProfile) -> Result<(), HandlerError> {
        let config = |e: crate::engine::profile::ProfileError| HandlerError::Config(e.to_string());
        self.launcher = profile
            .get("launcher", true, true)
            .map_err(config)?
            .unwrap_or_default();
        self.working_directory = profile
            .get("workingDirectory", false, true)
            .map_err(config)?
            .map(PathBuf::from);
        Ok(())
    }

    async fn execute(
        &self,
        monitor: &MonitorGuard,
        context: &ExecutionContext,
        script: &ExecutionScript,
    ) -> Result<(), HandlerError> {
        let ScriptPayload::ClusterJob {
            class_name,
            properties,
        } = script.payload()
        else {
            return Err(HandlerError::Unsupported {
                handler: self.name().to_string(),
                kind: script.kind(),
            });
        };
        if self.launcher.is_empty() {
            return Err(HandlerError::Config("launcher is not configured".to_string()));
        }

        let args = Self::arguments(context, class_name, properties);
        run_process(
            &self.launcher,
            &args,
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
    use crate::engine::monitor::{LoggingMonitor, MonitorTarget};
    use std::collections::BTreeMap;
    use std::sync::Arc;

    fn context() -> ExecutionContext {
        let args = [("date".to_string(), "20240101".to_string())]
            .into_iter()
            .collect();
        ExecutionContext::new("batch", "flow", "exec", None, args)
    }

    #[test]
    fn test_arguments() {
        let props = [("a".to_string(), "1".to_string())].into_iter().collect();
        let args = LauncherHandler::arguments(&context(), "com.example.Job", &props);
        assert_eq!(
            args,
            vec!["com.example.Job", "batch", "flow", "exec", "date=20240101", "-D", "a=1"]
        );
    }

    #[tokio::test]
    async fn test_launches_script() {
        // `sh` as launcher runs the job "class", which is a script recording its arguments
        let dir = tempfile::tempdir().unwrap();
        let job = dir.path().join("job.sh");
        let out = dir.path().join("args");
        std::fs::write(&job, format!("echo \"$@\" > {}\n", out.display())).unwrap();

        let handler = LauncherHandler::new("sh");
        let script = ExecutionScript::cluster_job(
            "job",
            Vec::<String>::new(),
            job.display().to_string(),
            [("mode".to_string(), "test".to_string())].into_iter().collect(),
            BTreeMap::new(),
        )
        .unwrap();
        let monitor = MonitorGuard::open(
            Arc::new(LoggingMonitor),
            MonitorTarget::new(&context(), "job"),
            1,
        );

        handler.execute(&monitor, &context(), &script).await.unwrap();
        let written = std::fs::read_to_string(out).unwrap();
        assert_eq!(written.trim(), "batch flow exec date=20240101 -D mode=test");
    }
}
