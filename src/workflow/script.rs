//! Execution scripts: one unit of work in a flow phase
//!
//! Scripts are immutable values. The kind-specific payload is opaque to the
//! scheduler and only inspected by the handler registered for the kind.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use super::context::ExecutionContext;
use super::variables::{VariableError, VariableResolver};

/// Errors raised while constructing a script
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ScriptError {
    #[error("Invalid {what} ID '{id}': must be non-empty and contain only [A-Za-z0-9_-]")]
    InvalidId { what: &'static str, id: String },

    #[error("Command script '{0}' has no command line tokens")]
    EmptyCommand(String),

    #[error("Cluster job script '{0}' has no job class")]
    EmptyClassName(String),
}

/// Check that an identifier is usable as a segment of a store key
pub fn validate_id(what: &'static str, id: &str) -> Result<(), ScriptError> {
    let valid = !id.is_empty()
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-');
    if valid {
        Ok(())
    } else {
        Err(ScriptError::InvalidId {
            what,
            id: id.to_string(),
        })
    }
}

/// Kind tag of a script, selecting the handler that runs it
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "kebab-case")]
pub enum ScriptKind {
    Command,
    ClusterJob,
}

impl ScriptKind {
    pub const ALL: [ScriptKind; 2] = [ScriptKind::Command, ScriptKind::ClusterJob];

    pub fn symbol(&self) -> &'static str {
        match self {
            ScriptKind::Command => "command",
            ScriptKind::ClusterJob => "cluster-job",
        }
    }

    pub fn from_symbol(symbol: &str) -> Option<ScriptKind> {
        ScriptKind::ALL
            .into_iter()
            .find(|k| k.symbol() == symbol.trim())
    }
}

impl fmt::Display for ScriptKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.symbol())
    }
}

impl FromStr for ScriptKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ScriptKind::from_symbol(s).ok_or_else(|| format!("Unknown script kind '{}'", s))
    }
}

/// Kind-specific part of a script
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScriptPayload {
    /// Ordered command line tokens
    Command { command: Vec<String> },

    /// A job class identifier and its job properties
    ClusterJob {
        class_name: String,
        properties: BTreeMap<String, String>,
    },
}

impl ScriptPayload {
    pub fn kind(&self) -> ScriptKind {
        match self {
            ScriptPayload::Command { .. } => ScriptKind::Command,
            ScriptPayload::ClusterJob { .. } => ScriptKind::ClusterJob,
        }
    }
}

/// One executable unit of a flow phase
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionScript {
    id: String,
    blocker_ids: BTreeSet<String>,
    environment: BTreeMap<String, String>,
    payload: ScriptPayload,
}

impl ExecutionScript {
    pub fn new(
        id: impl Into<String>,
        blocker_ids: BTreeSet<String>,
        environment: BTreeMap<String, String>,
        payload: ScriptPayload,
    ) -> Result<Self, ScriptError> {
        let id = id.into();
        validate_id("script", &id)?;
        for blocker in &blocker_ids {
            validate_id("blocker", blocker)?;
        }
        match &payload {
            ScriptPayload::Command { command } if command.is_empty() => {
                return Err(ScriptError::EmptyCommand(id));
            }
            ScriptPayload::ClusterJob { class_name, .. } if class_name.trim().is_empty() => {
                return Err(ScriptError::EmptyClassName(id));
            }
            _ => {}
        }
        Ok(Self {
            id,
            blocker_ids,
            environment,
            payload,
        })
    }

    /// Create a command script
    pub fn command<I, S>(
        id: impl Into<String>,
        blocker_ids: I,
        command: Vec<String>,
        environment: BTreeMap<String, String>,
    ) -> Result<Self, ScriptError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::new(
            id,
            blocker_ids.into_iter().map(Into::into).collect(),
            environment,
            ScriptPayload::Command { command },
        )
    }

    /// Create a cluster job script
    pub fn cluster_job<I, S>(
        id: impl Into<String>,
        blocker_ids: I,
        class_name: impl Into<String>,
        properties: BTreeMap<String, String>,
        environment: BTreeMap<String, String>,
    ) -> Result<Self, ScriptError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::new(
            id,
            blocker_ids.into_iter().map(Into::into).collect(),
            environment,
            ScriptPayload::ClusterJob {
                class_name: class_name.into(),
                properties,
            },
        )
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn kind(&self) -> ScriptKind {
        self.payload.kind()
    }

    pub fn blocker_ids(&self) -> &BTreeSet<String> {
        &self.blocker_ids
    }

    pub fn environment(&self) -> &BTreeMap<String, String> {
        &self.environment
    }

    pub fn payload(&self) -> &ScriptPayload {
        &self.payload
    }

    /// Command line tokens, for command scripts
    pub fn command_line(&self) -> Option<&[String]> {
        match &self.payload {
            ScriptPayload::Command { command } => Some(command),
            _ => None,
        }
    }

    /// Substitute every placeholder of this script.
    ///
    /// The table holds the context variables and the handler overrides;
    /// handler overrides also replace script environment entries of the
    /// same name. The class name of a cluster job is left as is.
    pub fn resolve(
        &self,
        context: &ExecutionContext,
        overrides: &BTreeMap<String, String>,
    ) -> Result<ExecutionScript, VariableError> {
        let mut table = context.variables();
        table.extend(overrides.iter().map(|(k, v)| (k.clone(), v.clone())));
        let resolver = VariableResolver::new(table);

        let mut environment = resolver.replace_values(&self.environment, true)?;
        environment.extend(overrides.iter().map(|(k, v)| (k.clone(), v.clone())));

        let payload = match &self.payload {
            ScriptPayload::Command { command } => ScriptPayload::Command {
                command: command
                    .iter()
                    .map(|token| resolver.replace(token, true))
                    .collect::<Result<_, _>>()?,
            },
            ScriptPayload::ClusterJob {
                class_name,
                properties,
            } => ScriptPayload::ClusterJob {
                class_name: class_name.clone(),
                properties: resolver.replace_values(properties, true)?,
            },
        };

        Ok(ExecutionScript {
            id: self.id.clone(),
            blocker_ids: self.blocker_ids.clone(),
            environment,
            payload,
        })
    }
}
