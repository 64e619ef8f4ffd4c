//! Request routing: resolve a URI to the filters and handler that serve it.
//!
//! The [`RouteTable`] is built once when a webapp starts and never changes.
//! [`RouteTable::resolve`] is recomputed for every request:
//!
//! 1. the first handler, in registration order, with a matching pattern wins;
//! 2. every filter with a matching pattern joins the chain, in registration order;
//! 3. with no handler, the request falls back to static files when a static
//!    root is configured, and fails with [`RoutingError::NoRoute`] otherwise.
//!
//! Precedence is purely positional. A catch-all registered before a more
//! specific pattern shadows it.

pub mod pattern;

use std::sync::Arc;

use thiserror::Error;
use tracing::trace;

use crate::chain::DispatchChain;
use crate::webapp::{FilterRegistration, HandlerRegistration, Registration};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RoutingError {
    #[error("no route for '{uri}'")]
    NoRoute { uri: String },
}

/// Outcome of resolving one URI.
#[derive(Debug)]
pub enum Resolution {
    /// A handler matched; run this chain.
    Chain(DispatchChain),
    /// No handler matched; serve from the static root.
    Static,
}

/// Ordered handler and filter registrations.
#[derive(Default)]
pub struct RouteTable {
    handlers: Vec<Arc<HandlerRegistration>>,
    filters: Vec<Arc<FilterRegistration>>,
    static_fallback: bool,
}

impl RouteTable {
    pub fn new(
        handlers: Vec<Arc<HandlerRegistration>>,
        filters: Vec<Arc<FilterRegistration>>,
        static_fallback: bool,
    ) -> Self {
        Self {
            handlers,
            filters,
            static_fallback,
        }
    }

    pub fn handlers(&self) -> &[Arc<HandlerRegistration>] {
        &self.handlers
    }

    pub fn filters(&self) -> &[Arc<FilterRegistration>] {
        &self.filters
    }

    /// Resolves `uri` (path plus optional query string).
    ///
    /// # Errors
    ///
    /// [`RoutingError::NoRoute`] when no handler matches and there is no static
    /// fallback.
    pub fn resolve(&self, uri: &str) -> Result<Resolution, RoutingError> {
        let matched = self.handlers.iter().find_map(|registration| {
            registration
                .matcher()
                .matching_pattern(uri)
                .map(|route_path| (registration, route_path))
        });

        let Some((handler, route_path)) = matched else {
            if self.static_fallback {
                trace!(uri, "no handler, falling back to static files");
                return Ok(Resolution::Static);
            }
            return Err(RoutingError::NoRoute {
                uri: uri.to_owned(),
            });
        };

        let filters: Vec<_> = self
            .filters
            .iter()
            .filter(|registration| registration.matches_pattern(uri))
            .cloned()
            .collect();

        trace!(
            uri,
            handler = handler.name(),
            filters = filters.len(),
            "resolved chain"
        );
        Ok(Resolution::Chain(DispatchChain::new(
            filters,
            Some(Arc::clone(handler)),
            route_path,
        )))
    }
}
