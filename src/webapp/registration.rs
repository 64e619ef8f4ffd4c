//! Handler and filter registrations.
//!
//! Each registration pairs a component with the URL patterns it answers for and
//! its init parameters, and tracks whether its `init` hook succeeded. Both kinds
//! expose the same [`Registration`] capability so the webapp can drive their
//! lifecycle uniformly.

use std::any::type_name;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tracing::{debug, error};

use super::config::{ComponentConfig, ComponentError, ConfigError, ContextInfo};
use crate::chain::{Filter, Handler};
use crate::router::pattern::UrlMatcher;

/// Lifecycle and matching shared by handler and filter registrations.
pub trait Registration: Send + Sync {
    fn name(&self) -> &str;

    fn matcher(&self) -> &UrlMatcher;

    fn init_params(&self) -> &HashMap<String, String>;

    fn is_initialized(&self) -> bool;

    /// Runs the component's `init` hook and records the outcome.
    fn init(&self, context: &ContextInfo) -> Result<(), ComponentError>;

    fn destroy(&self);

    fn matches_pattern(&self, uri: &str) -> bool {
        self.matcher().matches(uri)
    }
}

fn short_type_name<T: ?Sized>() -> String {
    let full = type_name::<T>();
    let base = full.split('<').next().unwrap_or(full);
    base.rsplit("::").next().unwrap_or(base).to_owned()
}

fn compile_patterns(component: &str, patterns: &[impl AsRef<str>]) -> Result<UrlMatcher, ConfigError> {
    if patterns.is_empty() {
        return Err(ConfigError::NoPatterns {
            component: component.to_owned(),
        });
    }
    Ok(UrlMatcher::new(patterns)?)
}

fn run_init(
    name: &str,
    initialized: &AtomicBool,
    init: impl FnOnce() -> Result<(), ComponentError>,
) -> Result<(), ComponentError> {
    match init() {
        Ok(()) => {
            initialized.store(true, Ordering::Release);
            debug!(component = name, "component initialized");
            Ok(())
        }
        Err(e) => {
            initialized.store(false, Ordering::Release);
            error!(component = name, error = %e, "component failed to initialize");
            Err(e)
        }
    }
}

/// A [`Handler`] bound to URL patterns.
pub struct HandlerRegistration {
    name: String,
    handler: Arc<dyn Handler>,
    matcher: UrlMatcher,
    init_params: HashMap<String, String>,
    initialized: AtomicBool,
}

impl HandlerRegistration {
    /// Registers `handler` under `patterns`.
    ///
    /// # Errors
    ///
    /// [`ConfigError::NoPatterns`] for an empty list, or
    /// [`ConfigError::InvalidPattern`].
    pub fn new<H, S>(handler: H, patterns: &[S]) -> Result<Self, ConfigError>
    where
        H: Handler + 'static,
        S: AsRef<str>,
    {
        let name = short_type_name::<H>();
        Self::from_arc(name, Arc::new(handler), patterns)
    }

    /// Registers a shared handler under an explicit name.
    pub fn from_arc<S: AsRef<str>>(
        name: impl Into<String>,
        handler: Arc<dyn Handler>,
        patterns: &[S],
    ) -> Result<Self, ConfigError> {
        let name = name.into();
        let matcher = compile_patterns(&name, patterns)?;
        Ok(Self {
            name,
            handler,
            matcher,
            init_params: HashMap::new(),
            initialized: AtomicBool::new(false),
        })
    }

    /// Registers `handler` for every URL (`/*`).
    pub fn catch_all<H: Handler + 'static>(handler: H) -> Self {
        Self {
            name: short_type_name::<H>(),
            handler: Arc::new(handler),
            matcher: UrlMatcher::default(),
            init_params: HashMap::new(),
            initialized: AtomicBool::new(false),
        }
    }

    #[must_use]
    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    #[must_use]
    pub fn init_param(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.init_params.insert(name.into(), value.into());
        self
    }

    pub fn handler(&self) -> &dyn Handler {
        self.handler.as_ref()
    }
}

impl Registration for HandlerRegistration {
    fn name(&self) -> &str {
        &self.name
    }

    fn matcher(&self) -> &UrlMatcher {
        &self.matcher
    }

    fn init_params(&self) -> &HashMap<String, String> {
        &self.init_params
    }

    fn is_initialized(&self) -> bool {
        self.initialized.load(Ordering::Acquire)
    }

    fn init(&self, context: &ContextInfo) -> Result<(), ComponentError> {
        let config = ComponentConfig::new(&self.name, &self.init_params, context);
        run_init(&self.name, &self.initialized, || self.handler.init(&config))
    }

    fn destroy(&self) {
        self.handler.destroy();
        self.initialized.store(false, Ordering::Release);
        debug!(component = %self.name, "handler destroyed");
    }
}

/// A [`Filter`] bound to URL patterns.
pub struct FilterRegistration {
    name: String,
    filter: Arc<dyn Filter>,
    matcher: UrlMatcher,
    init_params: HashMap<String, String>,
    initialized: AtomicBool,
}

impl FilterRegistration {
    /// Registers `filter` under `patterns`.
    ///
    /// # Errors
    ///
    /// [`ConfigError::NoPatterns`] for an empty list, or
    /// [`ConfigError::InvalidPattern`].
    pub fn new<F, S>(filter: F, patterns: &[S]) -> Result<Self, ConfigError>
    where
        F: Filter + 'static,
        S: AsRef<str>,
    {
        let name = short_type_name::<F>();
        Self::from_arc(name, Arc::new(filter), patterns)
    }

    pub fn from_arc<S: AsRef<str>>(
        name: impl Into<String>,
        filter: Arc<dyn Filter>,
        patterns: &[S],
    ) -> Result<Self, ConfigError> {
        let name = name.into();
        let matcher = compile_patterns(&name, patterns)?;
        Ok(Self {
            name,
            filter,
            matcher,
            init_params: HashMap::new(),
            initialized: AtomicBool::new(false),
        })
    }

    #[must_use]
    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    #[must_use]
    pub fn init_param(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.init_params.insert(name.into(), value.into());
        self
    }

    pub fn filter(&self) -> &dyn Filter {
        self.filter.as_ref()
    }
}

impl Registration for FilterRegistration {
    fn name(&self) -> &str {
        &self.name
    }

    fn matcher(&self) -> &UrlMatcher {
        &self.matcher
    }

    fn init_params(&self) -> &HashMap<String, String> {
        &self.init_params
    }

    fn is_initialized(&self) -> bool {
        self.initialized.load(Ordering::Acquire)
    }

    fn init(&self, context: &ContextInfo) -> Result<(), ComponentError> {
        let config = ComponentConfig::new(&self.name, &self.init_params, context);
        run_init(&self.name, &self.initialized, || self.filter.init(&config))
    }

    fn destroy(&self) {
        self.filter.destroy();
        self.initialized.store(false, Ordering::Release);
        debug!(component = %self.name, "filter destroyed");
    }
}
