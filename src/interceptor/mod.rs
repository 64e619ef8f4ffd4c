//! Lifecycle hooks around every dispatched request.
//!
//! An [`InterceptorPipeline`] runs each [`Interceptor`] in registration order at
//! three points: when a request is received, after its chain succeeds, and
//! after it fails. The built-in [`ConnectionInterceptor`] and
//! [`SessionInterceptor`] use these points to bind and release the connection
//! and session held by the [`RequestContext`].
//!
//! [`ExchangeScope`] ties the success/failure hooks to the lifetime of the
//! exchange: if it is dropped before either ran (the chain panicked or the
//! request future was cancelled), the failure hooks run from `Drop`.

use std::sync::Arc;

use tracing::{debug, trace};

use crate::chain::DispatchError;
use crate::context::{ConnectionInfo, Exchange, RequestContext};
use crate::http::{Cookie, Request, Response, StatusCode};
use crate::session::SESSION_COOKIE_NAME;

/// Hooks invoked around one request.
pub trait Interceptor: Send + Sync {
    /// Before the chain runs.
    fn on_received(&self, ctx: &mut RequestContext, request: &Request, connection: &ConnectionInfo);

    /// After the chain completed (including short-circuits), before the
    /// response is handed to the transport.
    fn on_success(&self, ctx: &mut RequestContext, request: &Request, response: &mut Response);

    /// Instead of [`on_success`](Self::on_success) when the chain failed.
    fn on_failure(&self, ctx: &mut RequestContext, error: &DispatchError, response: &mut Response);
}

/// Binds the transport connection for the duration of a request.
#[derive(Debug, Default, Clone, Copy)]
pub struct ConnectionInterceptor;

impl Interceptor for ConnectionInterceptor {
    fn on_received(&self, ctx: &mut RequestContext, _request: &Request, connection: &ConnectionInfo) {
        ctx.bind_connection(connection.clone());
    }

    fn on_success(&self, ctx: &mut RequestContext, _request: &Request, _response: &mut Response) {
        ctx.unbind_connection();
    }

    fn on_failure(&self, ctx: &mut RequestContext, _error: &DispatchError, _response: &mut Response) {
        ctx.unbind_connection();
    }
}

/// Resolves the session named by the request cookie and issues a cookie for
/// sessions created while processing.
#[derive(Debug, Default, Clone, Copy)]
pub struct SessionInterceptor;

impl Interceptor for SessionInterceptor {
    fn on_received(&self, ctx: &mut RequestContext, request: &Request, _connection: &ConnectionInfo) {
        ctx.unbind_session();

        let store = Arc::clone(ctx.session_store());
        let found = request
            .cookies_named(SESSION_COOKIE_NAME)
            .find_map(|cookie| store.find_session(cookie.value()));

        if let Some(session) = found {
            trace!(session_id = %session.id(), "session resolved from cookie");
            session.mark_joined();
            session.touch();
            ctx.bind_session(session, true);
        }
    }

    fn on_success(&self, ctx: &mut RequestContext, _request: &Request, response: &mut Response) {
        if !ctx.is_session_from_cookie() {
            if let Some(session) = ctx.peek_session() {
                debug!(session_id = %session.id(), "issuing session cookie");
                let cookie = Cookie::new(SESSION_COOKIE_NAME, session.id())
                    .path("/")
                    .http_only(true);
                response.add_cookie(&cookie);
            }
        }
        ctx.unbind_session();
    }

    fn on_failure(&self, ctx: &mut RequestContext, _error: &DispatchError, _response: &mut Response) {
        ctx.unbind_session();
    }
}

/// Ordered set of interceptors.
#[derive(Clone, Default)]
pub struct InterceptorPipeline {
    interceptors: Vec<Arc<dyn Interceptor>>,
}

impl InterceptorPipeline {
    pub fn new() -> Self {
        Self::default()
    }

    /// The connection and session interceptors, in that order.
    pub fn with_defaults() -> Self {
        Self::new()
            .with(ConnectionInterceptor)
            .with(SessionInterceptor)
    }

    #[must_use]
    pub fn with<I: Interceptor + 'static>(mut self, interceptor: I) -> Self {
        self.interceptors.push(Arc::new(interceptor));
        self
    }

    pub fn len(&self) -> usize {
        self.interceptors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.interceptors.is_empty()
    }

    pub fn received(&self, ctx: &mut RequestContext, request: &Request, connection: &ConnectionInfo) {
        for interceptor in &self.interceptors {
            interceptor.on_received(ctx, request, connection);
        }
    }

    pub fn success(&self, ctx: &mut RequestContext, request: &Request, response: &mut Response) {
        for interceptor in &self.interceptors {
            interceptor.on_success(ctx, request, response);
        }
    }

    pub fn failure(&self, ctx: &mut RequestContext, error: &DispatchError, response: &mut Response) {
        for interceptor in &self.interceptors {
            interceptor.on_failure(ctx, error, response);
        }
    }
}

impl std::fmt::Debug for InterceptorPipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InterceptorPipeline")
            .field("len", &self.interceptors.len())
            .finish()
    }
}

/// Owns an [`Exchange`] between the received hooks and the success or failure
/// hooks.
pub struct ExchangeScope<'p> {
    pipeline: &'p InterceptorPipeline,
    exchange: Exchange,
    finished: bool,
}

impl<'p> ExchangeScope<'p> {
    /// Runs the received hooks and takes ownership of `exchange`.
    pub fn begin(pipeline: &'p InterceptorPipeline, mut exchange: Exchange, connection: &ConnectionInfo) -> Self {
        pipeline.received(&mut exchange.context, &exchange.request, connection);
        Self {
            pipeline,
            exchange,
            finished: false,
        }
    }

    pub fn exchange(&self) -> &Exchange {
        &self.exchange
    }

    pub fn exchange_mut(&mut self) -> &mut Exchange {
        &mut self.exchange
    }

    /// Runs the success hooks and hands back the response.
    pub fn succeed(mut self) -> Response {
        let Exchange {
            request,
            response,
            context,
            ..
        } = &mut self.exchange;
        self.pipeline.success(context, request, response);
        self.finished = true;
        std::mem::take(&mut self.exchange.response)
    }

    /// Replaces the response with the error page for `error`, runs the failure
    /// hooks and hands the response back.
    ///
    /// Errors carrying a status keep it and their (sanitized) message; every
    /// other error becomes a bare `500`.
    pub fn fail(mut self, error: &DispatchError) -> Response {
        let status = error.response_status();
        let mut response = Response::new(StatusCode::Ok).keep_alive(self.exchange.response.is_keep_alive());
        response.send_error(status, error.sanitized_message().as_deref());

        self.exchange.response = response;
        self.pipeline
            .failure(&mut self.exchange.context, error, &mut self.exchange.response);
        self.finished = true;
        std::mem::take(&mut self.exchange.response)
    }
}

impl Drop for ExchangeScope<'_> {
    fn drop(&mut self) {
        if !self.finished {
            debug!(path = %self.exchange.request.path(), "exchange dropped before completion");
            self.pipeline.failure(
                &mut self.exchange.context,
                &DispatchError::Aborted,
                &mut self.exchange.response,
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;
    use crate::http::Method;
    use crate::session::{InMemorySessionStore, SessionStore};
    use crate::webapp::ContextInfo;

    fn exchange(store: &Arc<InMemorySessionStore>, request: Request) -> Exchange {
        let ctx = RequestContext::new(store.clone(), 30, Arc::new(ContextInfo::new("t")));
        Exchange::new(request, ctx)
    }

    fn get(uri: &str) -> Request {
        Request::new(Method::Get, uri)
    }

    #[derive(Default)]
    struct Recorder {
        events: Mutex<Vec<&'static str>>,
    }

    impl Interceptor for Arc<Recorder> {
        fn on_received(&self, _: &mut RequestContext, _: &Request, _: &ConnectionInfo) {
            self.events.lock().unwrap().push("received");
        }
        fn on_success(&self, _: &mut RequestContext, _: &Request, _: &mut Response) {
            self.events.lock().unwrap().push("success");
        }
        fn on_failure(&self, _: &mut RequestContext, _: &DispatchError, _: &mut Response) {
            self.events.lock().unwrap().push("failure");
        }
    }

    #[test]
    fn new_session_gets_cookie_on_success() {
        let store = Arc::new(InMemorySessionStore::new());
        let pipeline = InterceptorPipeline::with_defaults();
        let mut scope = ExchangeScope::begin(&pipeline, exchange(&store, get("/")), &ConnectionInfo::new(1));

        assert_eq!(scope.exchange().context.connection().map(ConnectionInfo::id), Some(1));
        let id = scope.exchange_mut().session_or_create().id().to_owned();

        let response = scope.succeed();
        let cookies: Vec<_> = response.headers().get_all("set-cookie").collect();
        assert_eq!(cookies, vec![format!("JSESSIONID={id}; Path=/; HttpOnly")]);
    }

    #[test]
    fn cookie_session_is_reused_without_new_cookie() {
        let store = Arc::new(InMemorySessionStore::new());
        let existing = store.create_session();
        assert!(existing.is_new());

        let pipeline = InterceptorPipeline::with_defaults();
        let request = get("/").with_header("Cookie", format!("JSESSIONID={}", existing.id()));
        let mut scope = ExchangeScope::begin(&pipeline, exchange(&store, request), &ConnectionInfo::new(2));

        let session = scope.exchange_mut().session_or_create();
        assert_eq!(session.id(), existing.id());
        assert!(!session.is_new());
        assert!(scope.exchange().context.is_session_from_cookie());

        let response = scope.succeed();
        assert!(!response.headers().contains("set-cookie"));
        assert_eq!(store.session_count(), 1);
    }

    #[test]
    fn unknown_cookie_is_ignored() {
        let store = Arc::new(InMemorySessionStore::new());
        let pipeline = InterceptorPipeline::with_defaults();
        let request = get("/").with_header("Cookie", "JSESSIONID=stale");
        let scope = ExchangeScope::begin(&pipeline, exchange(&store, request), &ConnectionInfo::new(3));

        assert!(scope.exchange().context.session().is_none());
        assert!(!scope.exchange().context.is_session_from_cookie());
    }

    #[test]
    fn failure_unbinds_and_writes_error_page() {
        let store = Arc::new(InMemorySessionStore::new());
        let pipeline = InterceptorPipeline::with_defaults();
        let mut scope = ExchangeScope::begin(&pipeline, exchange(&store, get("/")), &ConnectionInfo::new(4));
        scope.exchange_mut().session_or_create();
        scope.exchange_mut().response.write_str("partial");

        let err = DispatchError::status(StatusCode::Conflict, "already\nexists");
        let response = scope.fail(&err);

        assert_eq!(response.status(), StatusCode::Conflict);
        assert_eq!(response.buffer(), b"already exists\r\n");
        // No cookie for a failed request; the session itself stays in the store.
        assert!(!response.headers().contains("set-cookie"));
        assert_eq!(store.session_count(), 1);
    }

    #[test]
    fn hooks_run_in_order_and_drop_reports_failure() {
        let recorder = Arc::new(Recorder::default());
        let pipeline = InterceptorPipeline::new().with(recorder.clone());
        let store = Arc::new(InMemorySessionStore::new());

        let scope = ExchangeScope::begin(&pipeline, exchange(&store, get("/")), &ConnectionInfo::new(5));
        let _ = scope.succeed();

        let scope = ExchangeScope::begin(&pipeline, exchange(&store, get("/")), &ConnectionInfo::new(6));
        drop(scope);

        assert_eq!(
            *recorder.events.lock().unwrap(),
            vec!["received", "success", "received", "failure"]
        );
    }

    #[test]
    fn default_pipeline_has_two_hooks() {
        assert_eq!(InterceptorPipeline::with_defaults().len(), 2);
        assert!(InterceptorPipeline::new().is_empty());
    }
}
