//! Server-side sessions: the [`Session`] record, the [`SessionStore`] contract and
//! the default concurrent [`InMemorySessionStore`].
//!
//! The store is the only state shared between concurrently processed requests.
//! Sessions are handed out as `Arc<Session>`; every field a request can change is
//! behind an atomic or a short-lived lock, so a session can be read and written
//! from several requests at once without holding anything across an `.await`.

use std::any::Any;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::{Duration, Instant, SystemTime};

use dashmap::DashMap;
use tracing::debug;
use uuid::Uuid;

/// Name of the cookie that carries the session identifier.
pub const SESSION_COOKIE_NAME: &str = "JSESSIONID";

/// Inactivity timeout, in seconds, given to sessions the store creates.
pub const DEFAULT_SESSION_TIMEOUT_SECS: i64 = 3600;

type Attribute = Arc<dyn Any + Send + Sync>;

/// One client session.
///
/// Timestamps are tracked against a monotonic clock taken at creation; the
/// wall-clock accessors derive from the creation [`SystemTime`].
pub struct Session {
    id: String,
    attributes: RwLock<HashMap<String, Attribute>>,
    created_at: SystemTime,
    origin: Instant,
    // Milliseconds since `origin`. Only ever moves forward.
    last_accessed_ms: AtomicU64,
    // Seconds; negative means the session never expires.
    max_inactive_interval: AtomicI64,
    is_new: AtomicBool,
}

impl Session {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            attributes: RwLock::new(HashMap::new()),
            created_at: SystemTime::now(),
            origin: Instant::now(),
            last_accessed_ms: AtomicU64::new(0),
            max_inactive_interval: AtomicI64::new(DEFAULT_SESSION_TIMEOUT_SECS),
            is_new: AtomicBool::new(true),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn creation_time(&self) -> SystemTime {
        self.created_at
    }

    pub fn last_accessed_time(&self) -> SystemTime {
        self.created_at + Duration::from_millis(self.last_accessed_ms.load(Ordering::Acquire))
    }

    /// Seconds of inactivity after which the session may be swept; negative disables expiry.
    pub fn max_inactive_interval(&self) -> i64 {
        self.max_inactive_interval.load(Ordering::Acquire)
    }

    pub fn set_max_inactive_interval(&self, seconds: i64) {
        self.max_inactive_interval.store(seconds, Ordering::Release);
    }

    /// `true` until a client has presented this session's identifier back.
    pub fn is_new(&self) -> bool {
        self.is_new.load(Ordering::Acquire)
    }

    pub(crate) fn mark_joined(&self) {
        self.is_new.store(false, Ordering::Release);
    }

    /// Records an access now.
    ///
    /// Concurrent touches race harmlessly: the larger timestamp always wins.
    pub fn touch(&self) {
        self.touch_at(Instant::now());
    }

    fn touch_at(&self, now: Instant) {
        let elapsed = millis_since(self.origin, now);
        self.last_accessed_ms.fetch_max(elapsed, Ordering::AcqRel);
    }

    /// Whether the session has been idle longer than its interval at `now`.
    pub fn is_expired_at(&self, now: Instant) -> bool {
        let interval = self.max_inactive_interval();
        if interval < 0 {
            return false;
        }
        let idle = millis_since(self.origin, now)
            .saturating_sub(self.last_accessed_ms.load(Ordering::Acquire));
        idle > interval.unsigned_abs().saturating_mul(1000)
    }

    /// Returns the attribute stored under `name` if it holds a `T`.
    pub fn attribute<T: Any + Send + Sync>(&self, name: &str) -> Option<Arc<T>> {
        let attrs = self.attributes.read().unwrap_or_else(PoisonError::into_inner);
        let value = Arc::clone(attrs.get(name)?);
        value.downcast::<T>().ok()
    }

    pub fn set_attribute<T: Any + Send + Sync>(&self, name: impl Into<String>, value: T) {
        let mut attrs = self.attributes.write().unwrap_or_else(PoisonError::into_inner);
        attrs.insert(name.into(), Arc::new(value));
    }

    /// Removes an attribute; returns `true` if it was present.
    pub fn remove_attribute(&self, name: &str) -> bool {
        let mut attrs = self.attributes.write().unwrap_or_else(PoisonError::into_inner);
        attrs.remove(name).is_some()
    }

    pub fn attribute_names(&self) -> Vec<String> {
        let attrs = self.attributes.read().unwrap_or_else(PoisonError::into_inner);
        attrs.keys().cloned().collect()
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("max_inactive_interval", &self.max_inactive_interval())
            .field("is_new", &self.is_new())
            .finish_non_exhaustive()
    }
}

fn millis_since(origin: Instant, now: Instant) -> u64 {
    u64::try_from(now.saturating_duration_since(origin).as_millis()).unwrap_or(u64::MAX)
}

/// Storage and lifecycle of sessions.
///
/// Implementations must tolerate every method being called concurrently,
/// including [`destroy_inactive_sessions`](Self::destroy_inactive_sessions)
/// racing with creation and removal.
pub trait SessionStore: Send + Sync {
    /// Creates and stores a session under a fresh, unguessable identifier.
    fn create_session(&self) -> Arc<Session>;

    fn find_session(&self, id: &str) -> Option<Arc<Session>>;

    /// Removes a session. Unknown identifiers are ignored.
    fn destroy_session(&self, id: &str);

    /// Removes every session idle past its interval; returns how many were removed.
    fn destroy_inactive_sessions(&self) -> usize;

    fn session_count(&self) -> usize;
}

/// Default [`SessionStore`] backed by a sharded concurrent map.
#[derive(Debug, Default)]
pub struct InMemorySessionStore {
    sessions: DashMap<String, Arc<Session>>,
}

impl InMemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn generate_id() -> String {
        Uuid::new_v4().simple().to_string()
    }

    /// Sweep against an explicit instant.
    pub fn destroy_inactive_sessions_at(&self, now: Instant) -> usize {
        let expired: Vec<String> = self
            .sessions
            .iter()
            .filter(|entry| entry.value().is_expired_at(now))
            .map(|entry| entry.key().clone())
            .collect();

        let mut removed = 0;
        for id in expired {
            // A touch may have landed between the scan and the removal.
            if self
                .sessions
                .remove_if(&id, |_, session| session.is_expired_at(now))
                .is_some()
            {
                debug!(session_id = %id, "session expired");
                removed += 1;
            }
        }
        removed
    }
}

impl SessionStore for InMemorySessionStore {
    fn create_session(&self) -> Arc<Session> {
        let session = Arc::new(Session::new(Self::generate_id()));
        debug!(session_id = %session.id(), "creating session");
        self.sessions
            .insert(session.id().to_owned(), Arc::clone(&session));
        session
    }

    fn find_session(&self, id: &str) -> Option<Arc<Session>> {
        self.sessions.get(id).map(|entry| Arc::clone(entry.value()))
    }

    fn destroy_session(&self, id: &str) {
        if self.sessions.remove(id).is_some() {
            debug!(session_id = %id, "destroyed session");
        }
    }

    fn destroy_inactive_sessions(&self) -> usize {
        self.destroy_inactive_sessions_at(Instant::now())
    }

    fn session_count(&self) -> usize {
        self.sessions.len()
    }
}
