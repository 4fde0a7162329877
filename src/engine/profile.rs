//! Engine profile: scheduler, lock and handler configuration
//!
//! The profile is a flat store, loaded once per process:
//!
//! ```text
//! scheduler.parallelism     = 4
//! scheduler.flowParallelism = 2
//! scheduler.parallel.default = 2
//! scheduler.parallel.cluster = 1
//! lock.scope                = batch
//! lock.directory            = ${HOME}/.flowgate/locks
//! lock.pollInterval         = 200
//! handler.command           = process
//! handler.command.env.ASAKUSA_HOME = ${ASAKUSA_HOME}
//! handler.cluster-job       = launcher
//! handler.cluster-job.launcher = ${ASAKUSA_HOME}/bin/launch.sh
//! handler.cluster-job.resource = cluster
//! ```

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tracing::debug;

use super::handler::{
    HandlerError, HandlerInstance, HandlerRegistry, HandlerSet, DEFAULT_RESOURCE_ID,
};
use super::lock::LockScope;
use super::scheduler::MAX_PARALLELISM;
use crate::workflow::{PropertyStore, ScriptKind, StoreError, VariableError, VariableResolver};

/// Key prefix of handler profiles
pub const HANDLER_PREFIX: &str = "handler";
/// Reserved sub-key for environment variable injection
pub const ENV_KEY: &str = "env";
/// Sub-key overriding a handler's resource ID
pub const RESOURCE_KEY: &str = "resource";
/// Key prefix of per-resource script limits
pub const RESOURCE_PARALLELISM_PREFIX: &str = "scheduler.parallel";

const DEFAULT_PARALLELISM: usize = 4;
const DEFAULT_POLL_INTERVAL_MS: u64 = 200;

/// Errors raised while loading a profile or creating handlers
#[derive(Debug, thiserror::Error)]
pub enum ProfileError {
    #[error("Failed to load profile: {0}")]
    Store(#[from] StoreError),

    #[error("Missing mandatory configuration '{0}'")]
    MissingKey(String),

    #[error("Invalid configuration '{key}' = '{value}': {message}")]
    InvalidValue {
        key: String,
        value: String,
        message: String,
    },

    #[error("Failed to resolve configuration '{key}': {source}")]
    Unresolved {
        key: String,
        #[source]
        source: VariableError,
    },

    #[error("Unknown handler implementation '{selector}' for '{prefix}'")]
    UnknownHandler { prefix: String, selector: String },

    #[error("Failed to create handler for '{prefix}': {source}")]
    Handler {
        prefix: String,
        #[source]
        source: HandlerError,
    },

    #[error("No handler configured for script kind '{0}'")]
    MissingHandler(ScriptKind),
}

/// Resolution context shared by every service profile of a load
#[derive(Debug, Clone)]
pub struct ProfileContext {
    resolver: VariableResolver,
    source: Option<PathBuf>,
}

impl ProfileContext {
    pub fn new(resolver: VariableResolver) -> Self {
        Self {
            resolver,
            source: None,
        }
    }

    pub fn with_source(mut self, source: impl Into<PathBuf>) -> Self {
        self.source = Some(source.into());
        self
    }

    pub fn resolver(&self) -> &VariableResolver {
        &self.resolver
    }

    /// File the profile was read from, if any
    pub fn source(&self) -> Option<&Path> {
        self.source.as_deref()
    }

    fn resolve(&self, key: &str, value: &str) -> Result<String, ProfileError> {
        self.resolver
            .replace(value, true)
            .map_err(|source| ProfileError::Unresolved {
                key: key.to_string(),
                source,
            })
    }
}

/// Configuration of one service, e.g. the handler of one script kind
#[derive(Debug, Clone)]
pub struct ServiceProfile {
    prefix: String,
    selector: String,
    configuration: BTreeMap<String, String>,
    environment: BTreeMap<String, String>,
    context: Arc<ProfileContext>,
}

impl ServiceProfile {
    /// Load the service at `prefix`, or `None` when no selector is configured.
    ///
    /// `env.*` entries are resolved strictly here, so a missing variable fails
    /// the load.
    pub fn load(
        store: &PropertyStore,
        prefix: &str,
        context: Arc<ProfileContext>,
    ) -> Result<Option<Self>, ProfileError> {
        let Some(selector) = store.get(prefix) else {
            return Ok(None);
        };

        let sub_prefix = format!("{}.", prefix);
        let env_prefix = format!("{}{}.", sub_prefix, ENV_KEY);
        let mut configuration = BTreeMap::new();
        let mut environment = BTreeMap::new();
        for (key, value) in store.prefixed(&sub_prefix) {
            if let Some(name) = key.strip_prefix(&env_prefix) {
                environment.insert(name.to_string(), context.resolve(key, value)?);
            } else {
                configuration.insert(key[sub_prefix.len()..].to_string(), value.to_string());
            }
        }

        Ok(Some(Self {
            prefix: prefix.to_string(),
            selector: selector.trim().to_string(),
            configuration,
            environment,
            context,
        }))
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// Implementation selector naming the handler factory
    pub fn selector(&self) -> &str {
        &self.selector
    }

    /// Configuration entries with the prefix stripped, unresolved
    pub fn configuration(&self) -> &BTreeMap<String, String> {
        &self.configuration
    }

    /// Resolved environment variable overrides
    pub fn environment(&self) -> &BTreeMap<String, String> {
        &self.environment
    }

    /// Read a configuration entry, optionally resolving its placeholders
    pub fn get(
        &self,
        key: &str,
        mandatory: bool,
        resolve: bool,
    ) -> Result<Option<String>, ProfileError> {
        let full_key = format!("{}.{}", self.prefix, key);
        match self.configuration.get(key).map(|v| v.trim()).filter(|v| !v.is_empty()) {
            None if mandatory => Err(ProfileError::MissingKey(full_key)),
            None => Ok(None),
            Some(value) if resolve => self.context.resolve(&full_key, value).map(Some),
            Some(value) => Ok(Some(value.to_string())),
        }
    }

    /// Resource ID override
    pub fn resource_id(&self) -> Option<&str> {
        self.configuration
            .get(RESOURCE_KEY)
            .map(|v| v.trim())
            .filter(|v| !v.is_empty())
    }

    /// Create and configure a handler for this profile.
    ///
    /// Unknown selectors, factory failures and configuration failures all
    /// surface as a [`ProfileError`].
    pub fn new_instance(&self, registry: &HandlerRegistry) -> Result<HandlerInstance, ProfileError> {
        let factory = registry
            .factory(&self.selector)
            .ok_or_else(|| ProfileError::UnknownHandler {
                prefix: self.prefix.clone(),
                selector: self.selector.clone(),
            })?;
        let wrap = |source| ProfileError::Handler {
            prefix: self.prefix.clone(),
            source,
        };
        let mut handler = factory().map_err(wrap)?;
        handler.configure(self).map_err(wrap)?;
        debug!(prefix = %self.prefix, handler = handler.name(), "Handler configured");
        Ok(HandlerInstance::new(self.clone(), handler))
    }
}

/// Scheduler tuning
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchedulerConfig {
    /// Maximum simultaneously running scripts
    pub parallelism: usize,
    /// Maximum simultaneously running flows; unbounded when `None`
    pub flow_parallelism: Option<usize>,
    /// Maximum simultaneously running scripts per handler resource ID.
    /// Resources without an entry share the `default` limit.
    pub resource_parallelism: BTreeMap<String, usize>,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            parallelism: DEFAULT_PARALLELISM,
            flow_parallelism: None,
            resource_parallelism: BTreeMap::new(),
        }
    }
}

/// Lock manager configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockConfig {
    pub scope: LockScope,
    pub directory: PathBuf,
    pub poll_interval: Duration,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            scope: LockScope::Batch,
            directory: std::env::temp_dir().join("flowgate-locks"),
            poll_interval: Duration::from_millis(DEFAULT_POLL_INTERVAL_MS),
        }
    }
}

/// The whole engine profile
#[derive(Debug, Clone)]
pub struct EngineProfile {
    pub scheduler: SchedulerConfig,
    pub lock: LockConfig,
    handlers: BTreeMap<ScriptKind, ServiceProfile>,
}

impl EngineProfile {
    /// Read a profile file, resolving placeholders with `resolver`
    pub fn load(path: impl AsRef<Path>, resolver: VariableResolver) -> Result<Self, ProfileError> {
        let path = path.as_ref();
        let store = PropertyStore::load(path)?;
        Self::from_store(&store, ProfileContext::new(resolver).with_source(path))
    }

    pub fn from_store(store: &PropertyStore, context: ProfileContext) -> Result<Self, ProfileError> {
        let context = Arc::new(context);

        let mut scheduler = SchedulerConfig::default();
        if let Some(n) = positive(store, "scheduler.parallelism")? {
            scheduler.parallelism = n;
        }
        scheduler.flow_parallelism = positive(store, "scheduler.flowParallelism")?;
        scheduler.resource_parallelism = resource_parallelism(store)?;

        let mut lock = LockConfig::default();
        if let Some(value) = non_empty(store, "lock.scope") {
            lock.scope = value.parse().map_err(|message| ProfileError::InvalidValue {
                key: "lock.scope".to_string(),
                value: value.to_string(),
                message,
            })?;
        }
        if let Some(value) = non_empty(store, "lock.directory") {
            lock.directory = PathBuf::from(context.resolve("lock.directory", value)?);
        }
        if let Some(ms) = number::<u64>(store, "lock.pollInterval")? {
            lock.poll_interval = Duration::from_millis(ms);
        }

        let mut handlers = BTreeMap::new();
        for kind in ScriptKind::ALL {
            let prefix = format!("{}.{}", HANDLER_PREFIX, kind.symbol());
            if let Some(profile) = ServiceProfile::load(store, &prefix, context.clone())? {
                handlers.insert(kind, profile);
            }
        }

        Ok(Self {
            scheduler,
            lock,
            handlers,
        })
    }

    pub fn handler_profile(&self, kind: ScriptKind) -> Option<&ServiceProfile> {
        self.handlers.get(&kind)
    }

    /// Kinds that have a configured handler
    pub fn configured_kinds(&self) -> BTreeSet<ScriptKind> {
        self.handlers.keys().copied().collect()
    }

    /// Create one handler for each of `kinds`
    pub fn instantiate(
        &self,
        registry: &HandlerRegistry,
        kinds: &BTreeSet<ScriptKind>,
    ) -> Result<HandlerSet, ProfileError> {
        let mut set = HandlerSet::new();
        for &kind in kinds {
            let profile = self
                .handlers
                .get(&kind)
                .ok_or(ProfileError::MissingHandler(kind))?;
            let instance = profile.new_instance(registry)?;
            if !instance.supports(kind) {
                return Err(ProfileError::Handler {
                    prefix: profile.prefix().to_string(),
                    source: HandlerError::Unsupported {
                        handler: instance.name().to_string(),
                        kind,
                    },
                });
            }
            set.insert(kind, instance);
        }
        Ok(set)
    }
}

fn non_empty<'a>(store: &'a PropertyStore, key: &str) -> Option<&'a str> {
    store.get(key).map(str::trim).filter(|v| !v.is_empty())
}

fn number<T: std::str::FromStr>(store: &PropertyStore, key: &str) -> Result<Option<T>, ProfileError>
where
    T::Err: std::fmt::Display,
{
    non_empty(store, key)
        .map(|value| {
            value.parse::<T>().map_err(|e| ProfileError::InvalidValue {
                key: key.to_string(),
                value: value.to_string(),
                message: e.to_string(),
            })
        })
        .transpose()
}

fn positive(store: &PropertyStore, key: &str) -> Result<Option<usize>, ProfileError> {
    let invalid = |n: usize, message: String| ProfileError::InvalidValue {
        key: key.to_string(),
        value: n.to_string(),
        message,
    };
    match number::<usize>(store, key)? {
        Some(0) => Err(invalid(0, "must be at least 1".to_string())),
        Some(n) if n > MAX_PARALLELISM => {
            Err(invalid(n, format!("must be at most {}", MAX_PARALLELISM)))
        }
        other => Ok(other),
    }
}

/// `scheduler.parallel.<resource>` limits; once any is set, `default` is mandatory
fn resource_parallelism(store: &PropertyStore) -> Result<BTreeMap<String, usize>, ProfileError> {
    let prefix = format!("{}.", RESOURCE_PARALLELISM_PREFIX);
    let mut limits = BTreeMap::new();
    for (key, _) in store.prefixed(&prefix) {
        if let Some(n) = positive(store, key)? {
            limits.insert(key[prefix.len()..].to_string(), n);
        }
    }
    if !limits.is_empty() && !limits.contains_key(DEFAULT_RESOURCE_ID) {
        return Err(ProfileError::MissingKey(format!(
            "{}{}",
            prefix, DEFAULT_RESOURCE_ID
        )));
    }
    Ok(limits)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn context() -> ProfileContext {
        ProfileContext::new(VariableResolver::new([("ASAKUSA_HOME", "/opt/asakusa")]))
    }

    fn store(entries: &[(&str, &str)]) -> PropertyStore {
        entries.iter().copied().collect()
    }

    #[test]
    fn test_defaults() {
        let profile = EngineProfile::from_store(&PropertyStore::new(), context()).unwrap();
        assert_eq!(profile.scheduler, SchedulerConfig::default());
        assert_eq!(profile.lock.scope, LockScope::Batch);
        assert_eq!(profile.lock.poll_interval, Duration::from_millis(200));
        assert!(profile.configured_kinds().is_empty());
    }

    #[test]
    fn test_engine_settings() {
        let profile = EngineProfile::from_store(
            &store(&[
                ("scheduler.parallelism", "8"),
                ("scheduler.flowParallelism", "2"),
                ("lock.scope", "world"),
                ("lock.directory", "${ASAKUSA_HOME}/locks"),
                ("lock.pollInterval", "50"),
            ]),
            context(),
        )
        .unwrap();
        assert_eq!(profile.scheduler.parallelism, 8);
        assert_eq!(profile.scheduler.flow_parallelism, Some(2));
        assert_eq!(profile.lock.scope, LockScope::World);
        assert_eq!(profile.lock.directory, PathBuf::from("/opt/asakusa/locks"));
        assert_eq!(profile.lock.poll_interval, Duration::from_millis(50));
    }

    #[test]
    fn test_invalid_numbers() {
        let err = EngineProfile::from_store(&store(&[("scheduler.parallelism", "many")]), context())
            .unwrap_err();
        assert!(matches!(err, ProfileError::InvalidValue { .. }));

        let err = EngineProfile::from_store(&store(&[("scheduler.parallelism", "0")]), context())
            .unwrap_err();
        assert!(matches!(err, ProfileError::InvalidValue { .. }));

        let err =
            EngineProfile::from_store(&store(&[("lock.scope", "galaxy")]), context()).unwrap_err();
        assert!(matches!(err, ProfileError::InvalidValue { .. }));
    }

    #[test]
    fn test_parallelism_above_semaphore_capacity() {
        let too_many = (MAX_PARALLELISM + 1).to_string();
        for key in ["scheduler.parallelism", "scheduler.flowParallelism"] {
            let err = EngineProfile::from_store(&store(&[(key, too_many.as_str())]), context())
                .unwrap_err();
            match err {
                ProfileError::InvalidValue { key: k, message, .. } => {
                    assert_eq!(k, key);
                    assert!(message.contains("at most"));
                }
                other => panic!("unexpected error: {}", other),
            }
        }

        let max = MAX_PARALLELISM.to_string();
        let profile =
            EngineProfile::from_store(&store(&[("scheduler.parallelism", max.as_str())]), context())
                .unwrap();
        assert_eq!(profile.scheduler.parallelism, MAX_PARALLELISM);
    }

    #[test]
    fn test_resource_parallelism() {
        let profile = EngineProfile::from_store(
            &store(&[
                ("scheduler.parallel.default", "1"),
                ("scheduler.parallel.cluster", "2"),
            ]),
            context(),
        )
        .unwrap();
        assert_eq!(
            profile.scheduler.resource_parallelism,
            [("cluster".to_string(), 2), ("default".to_string(), 1)]
                .into_iter()
                .collect()
        );

        let profile = EngineProfile::from_store(&PropertyStore::new(), context()).unwrap();
        assert!(profile.scheduler.resource_parallelism.is_empty());
    }

    #[test]
    fn test_resource_parallelism_requires_default() {
        let err = EngineProfile::from_store(&store(&[("scheduler.parallel.cluster", "2")]), context())
            .unwrap_err();
        assert!(matches!(err, ProfileError::MissingKey(ref key) if key == "scheduler.parallel.default"));

        for value in ["0", "INVALID"] {
            let err = EngineProfile::from_store(
                &store(&[
                    ("scheduler.parallel.default", "1"),
                    ("scheduler.parallel.cluster", value),
                ]),
                context(),
            )
            .unwrap_err();
            assert!(matches!(err, ProfileError::InvalidValue { .. }));
        }
    }

    #[test]
    fn test_service_profile_split() {
        let profile = EngineProfile::from_store(
            &store(&[
                ("handler.command", "process"),
                ("handler.command.workingDirectory", "${ASAKUSA_HOME}"),
                ("handler.command.env.ASAKUSA_HOME", "${ASAKUSA_HOME}"),
                ("handler.command.resource", "local"),
            ]),
            context(),
        )
        .unwrap();

        let service = profile.handler_profile(ScriptKind::Command).unwrap();
        assert_eq!(service.selector(), "process");
        assert_eq!(service.prefix(), "handler.command");
        assert_eq!(
            service.environment().get("ASAKUSA_HOME"),
            Some(&"/opt/asakusa".to_string())
        );
        assert!(!service.configuration().contains_key("env.ASAKUSA_HOME"));
        assert_eq!(
            service.get("workingDirectory", true, false).unwrap(),
            Some("${ASAKUSA_HOME}".to_string())
        );
        assert_eq!(
            service.get("workingDirectory", true, true).unwrap(),
            Some("/opt/asakusa".to_string())
        );
        assert_eq!(service.resource_id(), Some("local"));
        assert!(matches!(
            service.get("missing", true, true),
            Err(ProfileError::MissingKey(ref key)) if key == "handler.command.missing"
        ));
        assert_eq!(service.get("missing", false, true).unwrap(), None);
    }

    #[test]
    fn test_unresolved_environment_fails_load() {
        let err = EngineProfile::from_store(
            &store(&[
                ("handler.command", "process"),
                ("handler.command.env.HOME_DIR", "${NOT_DEFINED_ANYWHERE}"),
            ]),
            context(),
        )
        .unwrap_err();
        assert!(matches!(
            err,
            ProfileError::Unresolved { ref key, .. } if key == "handler.command.env.HOME_DIR"
        ));
    }

    #[test]
    fn test_instantiate() {
        let profile = EngineProfile::from_store(
            &store(&[("handler.command", "noop"), ("handler.cluster-job", "mystery")]),
            context(),
        )
        .unwrap();
        let registry = HandlerRegistry::new();

        let set = profile
            .instantiate(&registry, &[ScriptKind::Command].into_iter().collect())
            .unwrap();
        assert!(set.get(ScriptKind::Command).is_some());

        let err = profile
            .instantiate(&registry, &[ScriptKind::ClusterJob].into_iter().collect())
            .unwrap_err();
        assert!(matches!(err, ProfileError::UnknownHandler { .. }));
    }

    #[test]
    fn test_unsupported_kind_rejected() {
        let profile =
            EngineProfile::from_store(&store(&[("handler.cluster-job", "process")]), context())
                .unwrap();
        let err = profile
            .instantiate(
                &HandlerRegistry::new(),
                &[ScriptKind::ClusterJob].into_iter().collect(),
            )
            .unwrap_err();
        assert!(matches!(
            err,
            ProfileError::Handler {
                source: HandlerError::Unsupported { .. },
                ..
            }
        ));
    }

    #[test]
    fn test_missing_handler() {
        let profile = EngineProfile::from_store(&PropertyStore::new(), context()).unwrap();
        let err = profile
            .instantiate(&HandlerRegistry::new(), &[ScriptKind::Command].into_iter().collect())
            .unwrap_err();
        assert!(matches!(err, ProfileError::MissingHandler(ScriptKind::Command)));
    }
}
