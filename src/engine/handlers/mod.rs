//! Built-in script handlers
//!
//! - `process` - runs command scripts as local processes
//! - `launcher` - hands cluster jobs to a launcher program
//! - `noop` - logs scripts without running them

pub mod launcher;
pub mod noop;
pub mod process;

pub use launcher::LauncherHandler;
pub use noop::NoopHandler;
pub use process::ProcessHandler;

use std::collections::BTreeMap;
use std::path::Path;
use std::process::Stdio;

use tokio::process::Command;
use tracing::{debug, info};

use super::handler::HandlerError;

/// Run a program to completion; a non-zero exit is an error
pub(crate) async fn run_process(
    program: &str,
    args: &[String],
    environment: &BTreeMap<String, String>,
    working_directory: Option<&Path>,
) -> Result<(), HandlerError> {
    info!(program, args = ?args, "Executing command");

    let mut cmd = Command::new(program);
    cmd.args(args);
    cmd.envs(environment);
    if let Some(dir) = working_directory {
        cmd.current_dir(dir);
    }
    cmd.stdin(Stdio::null());
    cmd.stdout(Stdio::piped());
    cmd.stderr(Stdio::piped());

    let output = cmd.output().await.map_err(|source| HandlerError::Spawn {
        program: program.to_string(),
        source,
    })?;

    let stdout = String::from_utf8_lossy(&output.stdout);
    for line in stdout.lines() {
        debug!(program, "{}", line);
    }

    if output.status.success() {
        info!(program, "Command completed successfully");
        Ok(())
    } else {
        Err(HandlerError::ExitStatus {
            program: program.to_string(),
            code: output.status.code().unwrap_or(-1),
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        })
    }
}
