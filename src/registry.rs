//! Process-wide table of registered server sessions

use crate::session::{normalize_url, ServerSession};
use parking_lot::Mutex;
use std::sync::Arc;
use tracing::debug;

/// Errors from registry lookups
#[derive(thiserror::Error, Debug)]
pub enum RegistryError {
    #[error("No session registered at index {0}")]
    NoSuchIndex(usize),
}

/// A lookup key for the registry: positional index or server URL
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionQuery {
    Index(usize),
    Url(String),
}

impl From<usize> for SessionQuery {
    fn from(index: usize) -> Self {
        SessionQuery::Index(index)
    }
}

impl From<&str> for SessionQuery {
    fn from(url: &str) -> Self {
        SessionQuery::Url(url.to_string())
    }
}

impl From<String> for SessionQuery {
    fn from(url: String) -> Self {
        SessionQuery::Url(url)
    }
}

/// Table of sessions keyed by normalized server URL.
///
/// Holds at most one session per URL. Insertion order is preserved so that
/// positional lookups stay stable for the life of the registry; registering
/// a URL that is already present replaces the entry in place.
///
/// Constructed once at application start and shared by reference; there is
/// no implicit global instance.
#[derive(Default)]
pub struct SessionRegistry {
    sessions: Mutex<Vec<Arc<ServerSession>>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a session and, when it carries a username, insert or replace
    /// it in the registry.
    ///
    /// The session is returned either way, so callers can construct
    /// throwaway anonymous sessions without polluting the table.
    pub fn register(
        &self,
        url: &str,
        username: &str,
        password: &str,
    ) -> Arc<ServerSession> {
        let session = Arc::new(ServerSession::new(url, username, password));
        if username.is_empty() {
            return session;
        }

        let mut sessions = self.sessions.lock();
        match sessions.iter().position(|s| s.url() == session.url()) {
            Some(index) => {
                debug!(url = %session.url(), index, "Replacing registered session");
                sessions[index] = Arc::clone(&session);
            }
            None => {
                debug!(url = %session.url(), "Registering new session");
                sessions.push(Arc::clone(&session));
            }
        }
        session
    }

    /// Look up a session by URL or positional index; `None` on a miss
    pub fn get(&self, query: impl Into<SessionQuery>) -> Option<Arc<ServerSession>> {
        let sessions = self.sessions.lock();
        match query.into() {
            SessionQuery::Index(index) => sessions.get(index).cloned(),
            SessionQuery::Url(url) => {
                let url = normalize_url(&url);
                sessions.iter().find(|s| s.url() == url).cloned()
            }
        }
    }

    /// Like [`get`](Self::get), but a URL miss yields an anonymous
    /// placeholder session for that URL instead of `None`.
    ///
    /// An out-of-range index is an error: there is no sensible placeholder
    /// for "the Nth session" when none exists.
    pub fn make(
        &self,
        query: impl Into<SessionQuery>,
    ) -> Result<Arc<ServerSession>, RegistryError> {
        let query = query.into();
        if let Some(session) = self.get(query.clone()) {
            return Ok(session);
        }
        match query {
            SessionQuery::Index(index) => Err(RegistryError::NoSuchIndex(index)),
            SessionQuery::Url(url) => Ok(Arc::new(ServerSession::new(url, "", ""))),
        }
    }

    /// Remove every registered session; used mainly to reset state between
    /// independent test scenarios.
    pub fn clear(&self) {
        self.sessions.lock().clear();
    }

    pub fn len(&self) -> usize {
        self.sessions.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.lock().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_register_then_get_round_trip() {
        let registry = SessionRegistry::new();
        registry.register("https://cloud.genepattern.org/gp", "jdoe", "secret");

        let session = registry.get("https://cloud.genepattern.org/gp").unwrap();
        assert_eq!(session.url(), "https://cloud.genepattern.org/gp");
        assert_eq!(session.username(), "jdoe");
        assert_eq!(session.password(), "secret");
    }

    #[test]
    fn test_register_same_url_replaces_in_place() {
        let registry = SessionRegistry::new();
        registry.register("https://a.example/gp", "first", "pw1");
        registry.register("https://b.example/gp", "other", "pw2");
        registry.register("https://a.example/gp", "second", "pw3");

        assert_eq!(registry.len(), 2);
        // Position of the replaced entry is unchanged
        let at_zero = registry.get(0).unwrap();
        assert_eq!(at_zero.url(), "https://a.example/gp");
        assert_eq!(at_zero.username(), "second");
        assert_eq!(at_zero.password(), "pw3");
    }

    #[test]
    fn test_anonymous_sessions_are_never_stored() {
        let registry = SessionRegistry::new();
        let session = registry.register("https://a.example/gp", "", "");
        assert_eq!(session.url(), "https://a.example/gp");
        assert!(registry.get("https://a.example/gp").is_none());
        assert!(registry.get(0).is_none());
        assert!(registry.is_empty());
    }

    #[test]
    fn test_make_returns_placeholder_for_unknown_url() {
        let registry = SessionRegistry::new();
        let session = registry.make("https://unknown.example/gp").unwrap();
        assert_eq!(session.url(), "https://unknown.example/gp");
        assert!(session.is_anonymous());
    }

    #[test]
    fn test_make_prefers_registered_session() {
        let registry = SessionRegistry::new();
        registry.register("https://a.example/gp", "jdoe", "secret");
        let session = registry.make("https://a.example/gp").unwrap();
        assert_eq!(session.username(), "jdoe");
    }

    #[test]
    fn test_make_rejects_out_of_range_index() {
        let registry = SessionRegistry::new();
        registry.register("https://a.example/gp", "jdoe", "secret");
        assert!(matches!(
            registry.make(3),
            Err(RegistryError::NoSuchIndex(3))
        ));
    }

    #[test]
    fn test_get_normalizes_url_query() {
        let registry = SessionRegistry::new();
        registry.register("https://a.example/gp", "jdoe", "secret");
        // Same server spelled without the application path
        assert!(registry.get("https://a.example").is_some());
        assert!(registry.get("https://a.example/gp/").is_some());
    }

    #[test]
    fn test_clear_empties_registry() {
        let registry = SessionRegistry::new();
        registry.register("https://a.example/gp", "jdoe", "secret");
        registry.clear();
        assert!(registry.is_empty());
        assert!(registry.get(0).is_none());
    }
}
