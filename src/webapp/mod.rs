//! The application context: configuration, routes, sessions and background
//! work for one webapp, owned by the caller rather than held globally.
//!
//! ```rust,no_run
//! use bridgeway::chain::handler_fn;
//! use bridgeway::context::ConnectionInfo;
//! use bridgeway::http::{Method, Request};
//! use bridgeway::webapp::{Webapp, WebappConfig};
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let config = WebappConfig::new("hello").add_handler(
//!     handler_fn(|exchange| {
//!         exchange.response.write_str("hello");
//!         Ok(())
//!     }),
//!     &["/*"],
//! )?;
//!
//! let webapp = Webapp::start(config).await;
//! let response = webapp
//!     .dispatch(Request::new(Method::Get, "/"), ConnectionInfo::new(1))
//!     .await?;
//! assert_eq!(response.buffer(), b"hello");
//! webapp.shutdown().await;
//! # Ok(())
//! # }
//! ```

mod config;
mod registration;

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

pub use config::{
    ComponentConfig, ComponentError, ConfigError, ContextInfo, LifecycleListener, WebappConfig,
    WebappSettings,
};
pub use registration::{FilterRegistration, HandlerRegistration, Registration};

use crate::background::SessionWatchdog;
use crate::context::{ConnectionInfo, Exchange, RequestContext};
use crate::http::response::sanitize_message;
use crate::http::{Request, Response};
use crate::interceptor::{ExchangeScope, InterceptorPipeline};
use crate::router::{Resolution, RouteTable, RoutingError};
use crate::session::{InMemorySessionStore, SessionStore};
use crate::static_files::StaticFiles;

/// A started webapp.
pub struct Webapp {
    context: Arc<ContextInfo>,
    routes: RouteTable,
    interceptors: InterceptorPipeline,
    sessions: Arc<dyn SessionStore>,
    session_timeout: i64,
    static_files: Option<StaticFiles>,
    listeners: Vec<Arc<dyn LifecycleListener>>,
    default_locale: String,
    watchdog_interval: Duration,
    watchdog: Mutex<Option<SessionWatchdog>>,
}

impl Webapp {
    /// Starts a webapp with the default interceptors (connection, then session).
    ///
    /// Lifecycle listeners are notified first, then filters and handlers are
    /// initialized in registration order, then the session watchdog starts.
    /// A component whose `init` fails is logged and stays routable.
    ///
    /// Must be called within a tokio runtime.
    pub async fn start(config: WebappConfig) -> Self {
        Self::start_with_interceptors(config, InterceptorPipeline::with_defaults()).await
    }

    pub async fn start_with_interceptors(config: WebappConfig, interceptors: InterceptorPipeline) -> Self {
        let WebappConfig {
            context,
            session_timeout,
            static_root,
            handlers,
            filters,
            listeners,
            watchdog_interval,
            default_locale,
            session_store,
        } = config;

        let context = Arc::new(context);
        info!(
            webapp = %context.name(),
            handlers = handlers.len(),
            filters = filters.len(),
            "starting webapp"
        );

        for listener in &listeners {
            if let Err(e) = listener.context_initialized(&context) {
                error!(webapp = %context.name(), error = %e, "lifecycle listener failed");
            }
        }
        // Each failure is logged by its registration, which stays routable.
        let mut failed = 0usize;
        for filter in &filters {
            if filter.init(&context).is_err() {
                failed += 1;
            }
        }
        for handler in &handlers {
            if handler.init(&context).is_err() {
                failed += 1;
            }
        }
        if failed > 0 {
            warn!(webapp = %context.name(), failed, "components left uninitialized");
        }

        let sessions =
            session_store.unwrap_or_else(|| Arc::new(InMemorySessionStore::new()) as Arc<dyn SessionStore>);
        let watchdog = SessionWatchdog::spawn(Arc::clone(&sessions), watchdog_interval);
        let static_files = static_root.map(StaticFiles::new);

        Self {
            routes: RouteTable::new(handlers, filters, static_files.is_some()),
            context,
            interceptors,
            sessions,
            session_timeout,
            static_files,
            listeners,
            default_locale,
            watchdog_interval,
            watchdog: Mutex::new(Some(watchdog)),
        }
    }

    pub fn name(&self) -> &str {
        self.context.name()
    }

    pub fn context(&self) -> &ContextInfo {
        &self.context
    }

    pub fn routes(&self) -> &RouteTable {
        &self.routes
    }

    pub fn session_store(&self) -> &Arc<dyn SessionStore> {
        &self.sessions
    }

    pub fn watchdog_interval(&self) -> Duration {
        self.watchdog_interval
    }

    /// Resolves `uri` against the route table.
    ///
    /// # Errors
    ///
    /// [`RoutingError::NoRoute`] when nothing, not even static files, can serve it.
    pub fn resolve(&self, uri: &str) -> Result<Resolution, RoutingError> {
        self.routes.resolve(uri)
    }

    /// Processes one request end to end.
    ///
    /// Chain errors never escape: they become error responses after the
    /// failure interceptors ran. Only a routing failure is returned, and the
    /// transport decides how to answer it.
    ///
    /// # Errors
    ///
    /// [`RoutingError::NoRoute`].
    pub async fn dispatch(&self, mut request: Request, connection: ConnectionInfo) -> Result<Response, RoutingError> {
        let uri = request.uri();
        let chain = match self.resolve(&uri) {
            Ok(Resolution::Chain(chain)) => chain,
            Ok(Resolution::Static) => match &self.static_files {
                Some(files) => return Ok(files.serve(&request).await),
                None => return Err(RoutingError::NoRoute { uri }),
            },
            Err(e) => {
                warn!(uri = %uri, connection = connection.id(), "no route");
                return Err(e);
            }
        };

        request.bind_route(chain.route_path());
        request.set_default_locale(&self.default_locale);
        debug!(
            method = %request.method(),
            uri = %uri,
            connection = connection.id(),
            "dispatching request"
        );

        let ctx = RequestContext::new(
            Arc::clone(&self.sessions),
            self.session_timeout,
            Arc::clone(&self.context),
        );
        let mut scope = ExchangeScope::begin(&self.interceptors, Exchange::new(request, ctx), &connection);

        let outcome = chain.execute(scope.exchange_mut()).await;
        let response = match outcome {
            Ok(_) => scope.succeed(),
            Err(e) => {
                error!(
                    uri = %uri,
                    status = e.response_status().as_u16(),
                    error = %sanitize_message(&e.to_string()),
                    "request failed"
                );
                scope.fail(&e)
            }
        };
        Ok(response)
    }

    /// Stops the watchdog, destroys handlers then filters, and notifies
    /// listeners last. Calls after the first do nothing.
    pub async fn shutdown(&self) {
        let Some(watchdog) = self.watchdog.lock().await.take() else {
            debug!(webapp = %self.context.name(), "webapp already shut down");
            return;
        };
        watchdog.stop().await;

        for handler in self.routes.handlers() {
            handler.destroy();
        }
        for filter in self.routes.filters() {
            filter.destroy();
        }
        for listener in &self.listeners {
            listener.context_destroyed(&self.context);
        }
        info!(webapp = %self.context.name(), "webapp stopped");
    }
}
