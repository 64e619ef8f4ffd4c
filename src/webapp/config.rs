//! Webapp configuration: the [`WebappConfig`] builder, its serde-loadable
//! [`WebappSettings`] counterpart, and the context handed to components at init.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

use super::registration::{FilterRegistration, HandlerRegistration};
use crate::background::DEFAULT_WATCHDOG_INTERVAL;
use crate::chain::{Filter, Handler};
use crate::http::request::DEFAULT_LOCALE;
use crate::router::pattern::PatternError;
use crate::session::{DEFAULT_SESSION_TIMEOUT_SECS, SessionStore};

/// Errors detected while building a configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("component '{component}' registered without URL patterns")]
    NoPatterns { component: String },

    #[error("invalid URL pattern: {0}")]
    InvalidPattern(#[from] PatternError),

    #[error("static resources root '{}' does not exist", path.display())]
    StaticRootMissing { path: PathBuf },

    #[error("static resources root '{}' is not a directory", path.display())]
    StaticRootNotDirectory { path: PathBuf },

    #[error("invalid settings: {0}")]
    Settings(#[from] serde_json::Error),
}

/// Error returned by component and listener init hooks.
#[derive(Debug, Error)]
pub enum ComponentError {
    #[error("missing init parameter '{0}'")]
    MissingParam(String),

    #[error("invalid init parameter '{name}': {reason}")]
    InvalidParam { name: String, reason: String },

    #[error("{0}")]
    Failed(String),
}

/// Name and context-level init parameters of a webapp.
#[derive(Debug, Clone, Default)]
pub struct ContextInfo {
    name: String,
    init_params: HashMap<String, String>,
}

impl ContextInfo {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            init_params: HashMap::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn init_param(&self, name: &str) -> Option<&str> {
        self.init_params.get(name).map(String::as_str)
    }

    pub fn init_params(&self) -> &HashMap<String, String> {
        &self.init_params
    }
}

/// What a filter or handler sees during `init`.
#[derive(Debug, Clone, Copy)]
pub struct ComponentConfig<'a> {
    component_name: &'a str,
    init_params: &'a HashMap<String, String>,
    context: &'a ContextInfo,
}

impl<'a> ComponentConfig<'a> {
    pub fn new(
        component_name: &'a str,
        init_params: &'a HashMap<String, String>,
        context: &'a ContextInfo,
    ) -> Self {
        Self {
            component_name,
            init_params,
            context,
        }
    }

    pub fn component_name(&self) -> &'a str {
        self.component_name
    }

    pub fn init_param(&self, name: &str) -> Option<&'a str> {
        self.init_params.get(name).map(String::as_str)
    }

    /// Like [`init_param`](Self::init_param) but absence is an error.
    pub fn require_param(&self, name: &str) -> Result<&'a str, ComponentError> {
        self.init_param(name)
            .ok_or_else(|| ComponentError::MissingParam(name.to_owned()))
    }

    pub fn init_param_names(&self) -> impl Iterator<Item = &'a str> + use<'a> {
        self.init_params.keys().map(String::as_str)
    }

    pub fn context(&self) -> &'a ContextInfo {
        self.context
    }
}

/// Hooks around the whole webapp lifetime.
pub trait LifecycleListener: Send + Sync {
    /// Called at start, before any filter or handler is initialized.
    fn context_initialized(&self, _context: &ContextInfo) -> Result<(), ComponentError> {
        Ok(())
    }

    /// Called at shutdown, after every handler and filter is destroyed.
    fn context_destroyed(&self, _context: &ContextInfo) {}
}

/// Everything a [`Webapp`](super::Webapp) is started from.
///
/// # Examples
///
/// ```rust
/// use bridgeway::chain::handler_fn;
/// use bridgeway::webapp::WebappConfig;
///
/// let config = WebappConfig::new("shop")
///     .session_timeout(1800)
///     .context_param("currency", "EUR")
///     .add_handler(handler_fn(|_| Ok(())), &["/api/*"])
///     .unwrap();
/// assert_eq!(config.handlers().len(), 1);
/// ```
pub struct WebappConfig {
    pub(crate) context: ContextInfo,
    pub(crate) session_timeout: i64,
    pub(crate) static_root: Option<PathBuf>,
    pub(crate) handlers: Vec<Arc<HandlerRegistration>>,
    pub(crate) filters: Vec<Arc<FilterRegistration>>,
    pub(crate) listeners: Vec<Arc<dyn LifecycleListener>>,
    pub(crate) watchdog_interval: Duration,
    pub(crate) default_locale: String,
    pub(crate) session_store: Option<Arc<dyn SessionStore>>,
}

impl WebappConfig {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            context: ContextInfo::new(name),
            session_timeout: DEFAULT_SESSION_TIMEOUT_SECS,
            static_root: None,
            handlers: Vec::new(),
            filters: Vec::new(),
            listeners: Vec::new(),
            watchdog_interval: DEFAULT_WATCHDOG_INTERVAL,
            default_locale: DEFAULT_LOCALE.to_owned(),
            session_store: None,
        }
    }

    /// Builds a configuration from loaded settings. Components still have to be
    /// added with the builder methods.
    ///
    /// # Errors
    ///
    /// The static root checks of [`static_resources_root`](Self::static_resources_root).
    pub fn from_settings(settings: WebappSettings) -> Result<Self, ConfigError> {
        let mut config = Self::new(settings.name)
            .session_timeout(settings.session_timeout_seconds)
            .watchdog_interval(Duration::from_millis(settings.watchdog_interval_ms))
            .default_locale(settings.default_locale);
        config.context.init_params = settings.context_params;
        if let Some(root) = settings.static_resources_root {
            config = config.static_resources_root(root)?;
        }
        Ok(config)
    }

    /// Inactivity timeout, in seconds, for sessions created by requests.
    #[must_use]
    pub fn session_timeout(mut self, seconds: i64) -> Self {
        self.session_timeout = seconds;
        self
    }

    /// Serves files under `root` when no handler matches.
    ///
    /// # Errors
    ///
    /// [`ConfigError::StaticRootMissing`] or [`ConfigError::StaticRootNotDirectory`].
    pub fn static_resources_root(mut self, root: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = root.as_ref().to_path_buf();
        let metadata = std::fs::metadata(&path)
            .map_err(|_| ConfigError::StaticRootMissing { path: path.clone() })?;
        if !metadata.is_dir() {
            return Err(ConfigError::StaticRootNotDirectory { path });
        }
        self.static_root = Some(path);
        Ok(self)
    }

    #[must_use]
    pub fn context_param(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.context.init_params.insert(name.into(), value.into());
        self
    }

    /// Registers `handler` under `patterns`, after any handler already registered.
    ///
    /// # Errors
    ///
    /// See [`HandlerRegistration::new`].
    pub fn add_handler<H, S>(self, handler: H, patterns: &[S]) -> Result<Self, ConfigError>
    where
        H: Handler + 'static,
        S: AsRef<str>,
    {
        let registration = HandlerRegistration::new(handler, patterns)?;
        Ok(self.register_handler(registration))
    }

    /// Registers `filter` under `patterns`, after any filter already registered.
    ///
    /// # Errors
    ///
    /// See [`FilterRegistration::new`].
    pub fn add_filter<F, S>(self, filter: F, patterns: &[S]) -> Result<Self, ConfigError>
    where
        F: Filter + 'static,
        S: AsRef<str>,
    {
        let registration = FilterRegistration::new(filter, patterns)?;
        Ok(self.register_filter(registration))
    }

    #[must_use]
    pub fn register_handler(mut self, registration: HandlerRegistration) -> Self {
        self.handlers.push(Arc::new(registration));
        self
    }

    #[must_use]
    pub fn register_filter(mut self, registration: FilterRegistration) -> Self {
        self.filters.push(Arc::new(registration));
        self
    }

    #[must_use]
    pub fn add_listener<L: LifecycleListener + 'static>(mut self, listener: L) -> Self {
        self.listeners.push(Arc::new(listener));
        self
    }

    #[must_use]
    pub fn watchdog_interval(mut self, interval: Duration) -> Self {
        self.watchdog_interval = interval;
        self
    }

    /// Locale reported by requests without `Accept-Language`.
    #[must_use]
    pub fn default_locale(mut self, locale: impl Into<String>) -> Self {
        self.default_locale = locale.into();
        self
    }

    /// Replaces the default in-memory session store.
    #[must_use]
    pub fn session_store(mut self, store: Arc<dyn SessionStore>) -> Self {
        self.session_store = Some(store);
        self
    }

    pub fn name(&self) -> &str {
        self.context.name()
    }

    pub fn handlers(&self) -> &[Arc<HandlerRegistration>] {
        &self.handlers
    }

    pub fn filters(&self) -> &[Arc<FilterRegistration>] {
        &self.filters
    }

    pub fn static_root(&self) -> Option<&Path> {
        self.static_root.as_deref()
    }
}

/// Scalar webapp settings as loaded from JSON.
///
/// ```rust
/// use bridgeway::webapp::WebappSettings;
///
/// let settings = WebappSettings::from_json(r#"{ "name": "shop", "session_timeout_seconds": 60 }"#).unwrap();
/// assert_eq!(settings.session_timeout_seconds, 60);
/// assert_eq!(settings.watchdog_interval_ms, 5000);
/// ```
#[derive(Debug, Clone, Deserialize)]
pub struct WebappSettings {
    pub name: String,

    #[serde(default = "default_session_timeout")]
    pub session_timeout_seconds: i64,

    #[serde(default)]
    pub static_resources_root: Option<PathBuf>,

    #[serde(default)]
    pub context_params: HashMap<String, String>,

    #[serde(default = "default_watchdog_interval_ms")]
    pub watchdog_interval_ms: u64,

    #[serde(default = "default_locale")]
    pub default_locale: String,
}

fn default_session_timeout() -> i64 {
    DEFAULT_SESSION_TIMEOUT_SECS
}

fn default_watchdog_interval_ms() -> u64 {
    u64::try_from(DEFAULT_WATCHDOG_INTERVAL.as_millis()).unwrap_or(u64::MAX)
}

fn default_locale() -> String {
    DEFAULT_LOCALE.to_owned()
}

impl WebappSettings {
    /// # Errors
    ///
    /// [`ConfigError::Settings`] when the JSON is malformed or lacks `name`.
    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        Ok(serde_json::from_str(json)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::handler_fn;
    use crate::webapp::Registration;

    #[test]
    fn defaults() {
        let config = WebappConfig::new("app");
        assert_eq!(config.name(), "app");
        assert_eq!(config.session_timeout, 3600);
        assert_eq!(config.watchdog_interval, Duration::from_millis(5000));
        assert!(config.static_root().is_none());
    }

    #[test]
    fn registration_order_is_kept() {
        let config = WebappConfig::new("app")
            .register_handler(HandlerRegistration::catch_all(handler_fn(|_| Ok(()))).named("first"))
            .add_handler(handler_fn(|_| Ok(())), &["/api/*"])
            .unwrap();
        let names: Vec<_> = config
            .handlers()
            .iter()
            .map(|h| h.name().to_owned())
            .collect();
        assert_eq!(names, vec!["first", "FnHandler"]);
    }

    #[test]
    fn static_root_must_be_existing_directory() {
        let dir = tempfile::tempdir().unwrap();
        assert!(WebappConfig::new("a").static_resources_root(dir.path()).is_ok());

        let missing = dir.path().join("nope");
        assert!(matches!(
            WebappConfig::new("a").static_resources_root(&missing),
            Err(ConfigError::StaticRootMissing { .. })
        ));

        let file = dir.path().join("file.txt");
        std::fs::write(&file, "x").unwrap();
        assert!(matches!(
            WebappConfig::new("a").static_resources_root(&file),
            Err(ConfigError::StaticRootNotDirectory { .. })
        ));
    }

    #[test]
    fn settings_apply_to_config() {
        let dir = tempfile::tempdir().unwrap();
        let json = format!(
            r#"{{
                "name": "shop",
                "session_timeout_seconds": 120,
                "static_resources_root": {root},
                "context_params": {{ "currency": "EUR" }},
                "watchdog_interval_ms": 250,
                "default_locale": "de"
            }}"#,
            root = serde_json::to_string(dir.path()).unwrap()
        );
        let settings = WebappSettings::from_json(&json).unwrap();
        let config = WebappConfig::from_settings(settings).unwrap();

        assert_eq!(config.name(), "shop");
        assert_eq!(config.session_timeout, 120);
        assert_eq!(config.static_root(), Some(dir.path()));
        assert_eq!(config.context.init_param("currency"), Some("EUR"));
        assert_eq!(config.watchdog_interval, Duration::from_millis(250));
        assert_eq!(config.default_locale, "de");
    }

    #[test]
    fn settings_require_name() {
        assert!(matches!(
            WebappSettings::from_json("{}"),
            Err(ConfigError::Settings(_))
        ));
    }

    #[test]
    fn component_config_params() {
        let mut params = HashMap::new();
        params.insert("greeting".to_owned(), "hi".to_owned());
        let context = ContextInfo::new("app");
        let config = ComponentConfig::new("hello", &params, &context);

        assert_eq!(config.component_name(), "hello");
        assert_eq!(config.require_param("greeting").unwrap(), "hi");
        assert!(matches!(
            config.require_param("missing"),
            Err(ComponentError::MissingParam(name)) if name == "missing"
        ));
        assert_eq!(config.context().name(), "app");
    }
}
