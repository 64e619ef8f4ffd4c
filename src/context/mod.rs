//! Per-request state threaded through interceptors, filters and handlers.
//!
//! An [`Exchange`] is created for every dispatched request and owned by exactly
//! one task for the lifetime of that request. It bundles the request, the
//! response being built, the [`RequestContext`] (bound connection and session)
//! and a type-erased [`Extensions`] map for state filters want to hand to later
//! filters or the handler.

use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use tracing::debug;

use crate::http::{Request, Response};
use crate::session::{Session, SessionStore};
use crate::webapp::ContextInfo;

/// Identity of the transport connection a request arrived on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionInfo {
    id: u64,
    peer: Option<SocketAddr>,
    local: Option<SocketAddr>,
    secure: bool,
}

impl ConnectionInfo {
    pub fn new(id: u64) -> Self {
        Self {
            id,
            peer: None,
            local: None,
            secure: false,
        }
    }

    #[must_use]
    pub fn with_peer(mut self, peer: SocketAddr) -> Self {
        self.peer = Some(peer);
        self
    }

    #[must_use]
    pub fn with_local(mut self, local: SocketAddr) -> Self {
        self.local = Some(local);
        self
    }

    #[must_use]
    pub fn with_secure(mut self, secure: bool) -> Self {
        self.secure = secure;
        self
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.peer
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local
    }

    pub fn is_secure(&self) -> bool {
        self.secure
    }
}

/// Ambient state bound for the duration of one request.
///
/// Connection and session are bound and released by the interceptor pipeline;
/// request code reads them through the accessors here.
pub struct RequestContext {
    connection: Option<ConnectionInfo>,
    session: Option<Arc<Session>>,
    session_from_cookie: bool,
    store: Arc<dyn SessionStore>,
    session_timeout: i64,
    context: Arc<ContextInfo>,
}

impl RequestContext {
    pub fn new(store: Arc<dyn SessionStore>, session_timeout: i64, context: Arc<ContextInfo>) -> Self {
        Self {
            connection: None,
            session: None,
            session_from_cookie: false,
            store,
            session_timeout,
            context,
        }
    }

    pub fn connection(&self) -> Option<&ConnectionInfo> {
        self.connection.as_ref()
    }

    pub fn bind_connection(&mut self, connection: ConnectionInfo) {
        self.connection = Some(connection);
    }

    pub fn unbind_connection(&mut self) -> Option<ConnectionInfo> {
        self.connection.take()
    }

    /// The bound session, touched, if there is one.
    pub fn session(&self) -> Option<Arc<Session>> {
        let session = self.session.as_ref()?;
        session.touch();
        Some(Arc::clone(session))
    }

    /// The bound session, creating and binding a new one when absent.
    ///
    /// New sessions take their inactivity interval from the webapp's configured
    /// session timeout.
    pub fn session_or_create(&mut self) -> Arc<Session> {
        if let Some(session) = self.session() {
            return session;
        }
        let session = self.store.create_session();
        session.set_max_inactive_interval(self.session_timeout);
        session.touch();
        self.session = Some(Arc::clone(&session));
        session
    }

    /// Destroys the bound session in the store and unbinds it.
    pub fn invalidate_session(&mut self) {
        if let Some(session) = self.session.take() {
            debug!(session_id = %session.id(), "session invalidated");
            self.store.destroy_session(session.id());
        }
        self.session_from_cookie = false;
    }

    /// `true` when the bound session was resolved from the request's cookie.
    pub fn is_session_from_cookie(&self) -> bool {
        self.session_from_cookie
    }

    pub(crate) fn bind_session(&mut self, session: Arc<Session>, from_cookie: bool) {
        self.session = Some(session);
        self.session_from_cookie = from_cookie;
    }

    pub(crate) fn unbind_session(&mut self) -> Option<Arc<Session>> {
        self.session_from_cookie = false;
        self.session.take()
    }

    /// Bound session without touching it.
    pub(crate) fn peek_session(&self) -> Option<&Arc<Session>> {
        self.session.as_ref()
    }

    pub fn session_store(&self) -> &Arc<dyn SessionStore> {
        &self.store
    }

    pub fn context_info(&self) -> &ContextInfo {
        &self.context
    }
}

impl std::fmt::Debug for RequestContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestContext")
            .field("connection", &self.connection)
            .field("session", &self.session.as_ref().map(|s| s.id()))
            .field("session_from_cookie", &self.session_from_cookie)
            .finish_non_exhaustive()
    }
}

/// Type-erased request extensions, keyed by type.
#[derive(Default)]
pub struct Extensions {
    map: HashMap<TypeId, Box<dyn Any + Send + Sync>>,
}

impl Extensions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts a value, returning the previous one of the same type.
    pub fn insert<T: Send + Sync + 'static>(&mut self, value: T) -> Option<T> {
        self.map
            .insert(TypeId::of::<T>(), Box::new(value))
            .and_then(|prev| prev.downcast::<T>().ok())
            .map(|prev| *prev)
    }

    pub fn get<T: Send + Sync + 'static>(&self) -> Option<&T> {
        self.map
            .get(&TypeId::of::<T>())
            .and_then(|value| value.downcast_ref::<T>())
    }

    pub fn get_mut<T: Send + Sync + 'static>(&mut self) -> Option<&mut T> {
        self.map
            .get_mut(&TypeId::of::<T>())
            .and_then(|value| value.downcast_mut::<T>())
    }

    pub fn remove<T: Send + Sync + 'static>(&mut self) -> Option<T> {
        self.map
            .remove(&TypeId::of::<T>())
            .and_then(|value| value.downcast::<T>().ok())
            .map(|value| *value)
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }
}

impl std::fmt::Debug for Extensions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Extensions").field("len", &self.map.len()).finish()
    }
}

/// Everything one request's filters and handler operate on.
#[derive(Debug)]
pub struct Exchange {
    pub request: Request,
    pub response: Response,
    pub context: RequestContext,
    pub extensions: Extensions,
    attributes: HashMap<String, String>,
}

impl Exchange {
    /// Pairs `request` with a fresh response; keep-alive follows the request.
    pub fn new(request: Request, context: RequestContext) -> Self {
        let mut response = Response::default();
        response.set_keep_alive(request.is_keep_alive());
        Self {
            request,
            response,
            context,
            extensions: Extensions::new(),
            attributes: HashMap::new(),
        }
    }

    /// Request-scoped string attribute.
    pub fn attribute(&self, name: &str) -> Option<&str> {
        self.attributes.get(name).map(String::as_str)
    }

    pub fn set_attribute(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.attributes.insert(name.into(), value.into());
    }

    pub fn remove_attribute(&mut self, name: &str) -> Option<String> {
        self.attributes.remove(name)
    }

    pub fn attribute_names(&self) -> impl Iterator<Item = &str> {
        self.attributes.keys().map(String::as_str)
    }

    pub fn session(&self) -> Option<Arc<Session>> {
        self.context.session()
    }

    pub fn session_or_create(&mut self) -> Arc<Session> {
        self.context.session_or_create()
    }
}
