//! Script handler plugin interface and registry
//!
//! A handler runs the scripts of one kind. Handlers are created through a
//! [`HandlerRegistry`] that maps an implementation selector (the value of a
//! `handler.<kind>` profile entry) to a factory.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;

use super::handlers::{LauncherHandler, NoopHandler, ProcessHandler};
use super::monitor::MonitorGuard;
use super::profile::ServiceProfile;
use crate::workflow::{ExecutionContext, ExecutionScript, ScriptKind};

/// Resource ID used when neither the handler nor its profile names one
pub const DEFAULT_RESOURCE_ID: &str = "default";

/// Errors raised by handlers
#[derive(Debug, thiserror::Error)]
pub enum HandlerError {
    #[error("Handler '{handler}' cannot execute '{kind}' scripts")]
    Unsupported { handler: String, kind: ScriptKind },

    #[error("Failed to launch '{program}': {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("'{program}' exited with code {code}: {stderr}")]
    ExitStatus {
        program: String,
        code: i32,
        stderr: String,
    },

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("{0}")]
    Failed(String),
}

/// Runs scripts of one or more kinds
#[async_trait]
pub trait ScriptHandler: Send + Sync {
    /// Short name used in logs
    fn name(&self) -> &str;

    /// Whether scripts of `kind` can be executed
    fn supports(&self, kind: ScriptKind) -> bool;

    /// Apply the profile this handler was created for
    fn configure(&mut self, _profile: &ServiceProfile) -> Result<(), HandlerError> {
        Ok(())
    }

    /// Name of the exclusion domain the script runs in
    fn resource_id(&self, _context: &ExecutionContext, _script: &ExecutionScript) -> String {
        DEFAULT_RESOURCE_ID.to_string()
    }

    /// Environment entries injected into the script during resolution
    fn environment_variables(
        &self,
        _context: &ExecutionContext,
        _script: &ExecutionScript,
    ) -> BTreeMap<String, String> {
        BTreeMap::new()
    }

    /// Run a resolved script
    async fn execute(
        &self,
        monitor: &MonitorGuard,
        context: &ExecutionContext,
        script: &ExecutionScript,
    ) -> Result<(), HandlerError>;
}

/// Creates an unconfigured handler
pub type HandlerFactory =
    Arc<dyn Fn() -> Result<Box<dyn ScriptHandler>, HandlerError> + Send + Sync>;

/// Selector → factory table
#[derive(Clone)]
pub struct HandlerRegistry {
    factories: BTreeMap<String, HandlerFactory>,
}

impl HandlerRegistry {
    /// An empty registry
    pub fn empty() -> Self {
        Self {
            factories: BTreeMap::new(),
        }
    }

    /// A registry with the built-in `process`, `launcher` and `noop` handlers
    pub fn new() -> Self {
        let mut registry = Self::empty();
        registry.register(ProcessHandler::SELECTOR, || {
            Ok(Box::new(ProcessHandler::default()) as Box<dyn ScriptHandler>)
        });
        registry.register(LauncherHandler::SELECTOR, || {
            Ok(Box::new(LauncherHandler::default()) as Box<dyn ScriptHandler>)
        });
        registry.register(NoopHandler::SELECTOR, || {
            Ok(Box::new(NoopHandler) as Box<dyn ScriptHandler>)
        });
        registry
    }

    pub fn register<F>(&mut self, selector: impl Into<String>, factory: F)
    where
        F: Fn() -> Result<Box<dyn ScriptHandler>, HandlerError> + Send + Sync + 'static,
    {
        self.factories.insert(selector.into(), Arc::new(factory));
    }

    pub fn with<F>(mut self, selector: impl Into<String>, factory: F) -> Self
    where
        F: Fn() -> Result<Box<dyn ScriptHandler>, HandlerError> + Send + Sync + 'static,
    {
        self.register(selector, factory);
        self
    }

    pub fn factory(&self, selector: &str) -> Option<&HandlerFactory> {
        self.factories.get(selector)
    }

    pub fn selectors(&self) -> Vec<&str> {
        self.factories.keys().map(String::as_str).collect()
    }
}

impl Default for HandlerRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandlerRegistry")
            .field("selectors", &self.selectors())
            .finish()
    }
}

/// A configured handler bound to its service profile
pub struct HandlerInstance {
    profile: ServiceProfile,
    handler: Box<dyn ScriptHandler>,
}

impl HandlerInstance {
    pub(crate) fn new(profile: ServiceProfile, handler: Box<dyn ScriptHandler>) -> Self {
        Self { profile, handler }
    }

    pub fn profile(&self) -> &ServiceProfile {
        &self.profile
    }

    pub fn name(&self) -> &str {
        self.handler.name()
    }

    pub fn supports(&self, kind: ScriptKind) -> bool {
        self.handler.supports(kind)
    }

    /// The profile's `resource` entry, or the handler's own resource ID
    pub fn resource_id(&self, context: &ExecutionContext, script: &ExecutionScript) -> String {
        match self.profile.resource_id() {
            Some(resource) => resource.to_string(),
            None => self.handler.resource_id(context, script),
        }
    }

    /// Handler entries overlaid with the profile's `env.*` entries
    pub fn environment_variables(
        &self,
        context: &ExecutionContext,
        script: &ExecutionScript,
    ) -> BTreeMap<String, String> {
        let mut env = self.handler.environment_variables(context, script);
        env.extend(
            self.profile
                .environment()
                .iter()
                .map(|(k, v)| (k.clone(), v.clone())),
        );
        env
    }

    pub async fn execute(
        &self,
        monitor: &MonitorGuard,
        context: &ExecutionContext,
        script: &ExecutionScript,
    ) -> Result<(), HandlerError> {
        self.handler.execute(monitor, context, script).await
    }
}

impl std::fmt::Debug for HandlerInstance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandlerInstance")
            .field("prefix", &self.profile.prefix())
            .field("handler", &self.handler.name())
            .finish()
    }
}

/// One configured handler per script kind
#[derive(Debug, Clone, Default)]
pub struct HandlerSet {
    handlers: BTreeMap<ScriptKind, Arc<HandlerInstance>>,
}

impl HandlerSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, kind: ScriptKind, instance: HandlerInstance) {
        self.handlers.insert(kind, Arc::new(instance));
    }

    pub fn get(&self, kind: ScriptKind) -> Option<Arc<HandlerInstance>> {
        self.handlers.get(&kind).cloned()
    }
}
