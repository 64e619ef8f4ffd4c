//! Filter and handler capabilities, and the executor that runs a resolved chain.
//!
//! A [`DispatchChain`] is an ordered list of filters followed by at most one
//! handler. Execution starts at the first filter; each filter receives a
//! [`FilterChain`] cursor and must call [`FilterChain::proceed`] to let the rest
//! of the chain run. A filter that returns without proceeding short-circuits the
//! request: later filters and the handler never run.
//!
//! [`FilterChain`] is consumed by `proceed`, so the handler can be reached at
//! most once per execution.
//!
//! # Examples
//!
//! ```rust
//! use bridgeway::chain::{BoxFuture, DispatchError, Filter, FilterChain};
//! use bridgeway::context::Exchange;
//! use bridgeway::http::StatusCode;
//!
//! struct RequireToken;
//!
//! impl Filter for RequireToken {
//!     fn do_filter<'a>(
//!         &'a self,
//!         exchange: &'a mut Exchange,
//!         chain: FilterChain<'a>,
//!     ) -> BoxFuture<'a, Result<(), DispatchError>> {
//!         Box::pin(async move {
//!             if exchange.request.header("x-token").is_none() {
//!                 exchange.response.send_error(StatusCode::Unauthorized, None);
//!                 return Ok(());
//!             }
//!             chain.proceed(exchange).await
//!         })
//!     }
//! }
//! ```

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use thiserror::Error;
use tracing::{debug, trace};

use crate::context::Exchange;
use crate::http::StatusCode;
use crate::http::response::sanitize_message;
use crate::webapp::{
    ComponentConfig, ComponentError, FilterRegistration, HandlerRegistration, Registration,
};

/// Boxed, `Send` future borrowed for `'a`.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Failure raised while running a chain.
#[derive(Debug, Error)]
pub enum DispatchError {
    /// Ends the request with a specific status and message.
    #[error("{status}: {message}")]
    Status { status: StatusCode, message: String },

    #[error("component failed: {source}")]
    Component {
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The exchange was dropped before the chain finished.
    #[error("request processing aborted")]
    Aborted,
}

impl DispatchError {
    pub fn status(status: StatusCode, message: impl Into<String>) -> Self {
        DispatchError::Status {
            status,
            message: message.into(),
        }
    }

    pub fn component<E>(source: E) -> Self
    where
        E: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        DispatchError::Component {
            source: source.into(),
        }
    }

    /// The response status this error maps to.
    pub fn response_status(&self) -> StatusCode {
        match self {
            DispatchError::Status { status, .. } => *status,
            _ => StatusCode::InternalServerError,
        }
    }

    /// Message safe to place in a response body, when the error carries one.
    pub fn sanitized_message(&self) -> Option<String> {
        match self {
            DispatchError::Status { message, .. } => Some(sanitize_message(message)),
            _ => None,
        }
    }
}

/// A unit of pre-processing that runs before the handler.
pub trait Filter: Send + Sync {
    /// Called once at startup. Failure is logged and the filter stays registered.
    fn init(&self, _config: &ComponentConfig) -> Result<(), ComponentError> {
        Ok(())
    }

    fn do_filter<'a>(
        &'a self,
        exchange: &'a mut Exchange,
        chain: FilterChain<'a>,
    ) -> BoxFuture<'a, Result<(), DispatchError>>;

    /// Called once at shutdown.
    fn destroy(&self) {}
}

/// The terminal unit of request processing.
pub trait Handler: Send + Sync {
    fn init(&self, _config: &ComponentConfig) -> Result<(), ComponentError> {
        Ok(())
    }

    fn handle<'a>(&'a self, exchange: &'a mut Exchange) -> BoxFuture<'a, Result<(), DispatchError>>;

    fn destroy(&self) {}
}

/// A [`Handler`] built from a synchronous closure.
pub struct FnHandler<F> {
    f: F,
}

/// Wraps a blocking-style closure as a [`Handler`].
///
/// ```rust
/// use bridgeway::chain::handler_fn;
///
/// let hello = handler_fn(|exchange| {
///     exchange.response.write_str("hello");
///     Ok(())
/// });
/// # let _ = hello;
/// ```
pub fn handler_fn<F>(f: F) -> FnHandler<F>
where
    F: Fn(&mut Exchange) -> Result<(), DispatchError> + Send + Sync + 'static,
{
    FnHandler { f }
}

impl<F> Handler for FnHandler<F>
where
    F: Fn(&mut Exchange) -> Result<(), DispatchError> + Send + Sync + 'static,
{
    fn handle<'a>(&'a self, exchange: &'a mut Exchange) -> BoxFuture<'a, Result<(), DispatchError>> {
        let result = (self.f)(exchange);
        Box::pin(std::future::ready(result))
    }
}

/// Cursor over the part of a chain that has not run yet.
pub struct FilterChain<'a> {
    filters: &'a [Arc<FilterRegistration>],
    handler: Option<&'a HandlerRegistration>,
    completed: &'a AtomicBool,
}

impl<'a> FilterChain<'a> {
    /// Runs the next filter, or the handler once every filter has proceeded.
    pub fn proceed<'b>(self, exchange: &'b mut Exchange) -> BoxFuture<'b, Result<(), DispatchError>>
    where
        'a: 'b,
    {
        Box::pin(async move {
            match self.filters.split_first() {
                Some((current, rest)) => {
                    trace!(filter = current.name(), "running filter");
                    let next = FilterChain {
                        filters: rest,
                        handler: self.handler,
                        completed: self.completed,
                    };
                    current.filter().do_filter(exchange, next).await
                }
                None => {
                    self.completed.store(true, Ordering::Release);
                    match self.handler {
                        Some(handler) => {
                            trace!(handler = handler.name(), "running handler");
                            handler.handler().handle(exchange).await
                        }
                        None => Ok(()),
                    }
                }
            }
        })
    }

    /// Filters left to run after the current one.
    pub fn remaining_filters(&self) -> usize {
        self.filters.len()
    }
}

/// How a chain that did not fail ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChainState {
    /// Every filter proceeded and the handler (if any) ran.
    Done,
    /// A filter returned without proceeding.
    ShortCircuited,
}

/// The resolved filters and handler for one request.
#[derive(Clone, Default)]
pub struct DispatchChain {
    filters: Vec<Arc<FilterRegistration>>,
    handler: Option<Arc<HandlerRegistration>>,
    route_path: String,
}

impl DispatchChain {
    pub fn new(
        filters: Vec<Arc<FilterRegistration>>,
        handler: Option<Arc<HandlerRegistration>>,
        route_path: impl Into<String>,
    ) -> Self {
        Self {
            filters,
            handler,
            route_path: route_path.into(),
        }
    }

    pub fn filters(&self) -> &[Arc<FilterRegistration>] {
        &self.filters
    }

    pub fn handler(&self) -> Option<&Arc<HandlerRegistration>> {
        self.handler.as_ref()
    }

    /// Sanitized pattern of the handler that matched (`""` for catch-alls).
    pub fn route_path(&self) -> &str {
        &self.route_path
    }

    /// Runs the chain against `exchange`.
    ///
    /// # Errors
    ///
    /// The first error returned by a filter or the handler, unchanged.
    pub async fn execute(&self, exchange: &mut Exchange) -> Result<ChainState, DispatchError> {
        let completed = AtomicBool::new(false);
        let chain = FilterChain {
            filters: &self.filters,
            handler: self.handler.as_deref(),
            completed: &completed,
        };

        chain.proceed(exchange).await?;

        let state = if completed.load(Ordering::Acquire) {
            ChainState::Done
        } else {
            ChainState::ShortCircuited
        };
        debug!(?state, path = %exchange.request.path(), "chain finished");
        Ok(state)
    }
}

impl std::fmt::Debug for DispatchChain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DispatchChain")
            .field("filters", &self.filters.iter().map(|r| r.name()).collect::<Vec<_>>())
            .field("handler", &self.handler.as_ref().map(|h| h.name()))
            .field("route_path", &self.route_path)
            .finish()
    }
}
