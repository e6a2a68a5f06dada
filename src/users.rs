//! Process-wide mapping from user id to live session.
//!
//! The local map is authoritative for sessions owned by this chat instance.
//! A routing entry in the shared cache mirrors each binding so peers can find
//! the instance that owns a user; cache writes always happen after the map
//! lock is released.

use crate::cache::Cache;
use crate::session::Session;
use crate::Result;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tracing::debug;

#[derive(Debug)]
pub struct UserMap {
    inner: Mutex<HashMap<i64, Arc<Session>>>,
    /// Shared-cache publisher: the cache client plus this instance's name.
    route: Option<(Cache, String)>,
}

impl UserMap {
    /// A map that publishes no routing entries. Used by tests and
    /// single-instance deployments.
    pub fn new() -> UserMap {
        UserMap {
            inner: Mutex::new(HashMap::new()),
            route: None,
        }
    }

    /// A map that mirrors bindings into the shared cache under this
    /// instance's name.
    pub fn with_route(cache: Cache, self_name: String) -> UserMap {
        UserMap {
            inner: Mutex::new(HashMap::new()),
            route: Some((cache, self_name)),
        }
    }

    /// Bind `uid` to `session`, replacing any previous binding.
    pub async fn bind(&self, uid: i64, session: Arc<Session>) -> Result<()> {
        let replaced = {
            let mut map = self.inner.lock().unwrap();
            map.insert(uid, session)
        };
        if let Some(old) = replaced {
            // A second login for the same uid supersedes the first session.
            debug!(uid, old = old.id(), "binding replaced, closing old session");
            old.close();
        }

        if let Some((cache, name)) = &self.route {
            cache.set_route(uid, name).await?;
        }
        Ok(())
    }

    /// Remove the binding for `uid`, but only while it still points at
    /// `session_id`; a newer login's binding is left alone.
    pub async fn unbind(&self, uid: i64, session_id: &str) -> Result<()> {
        let removed = {
            let mut map = self.inner.lock().unwrap();
            match map.get(&uid) {
                Some(current) if current.id() == session_id => {
                    map.remove(&uid);
                    true
                }
                _ => false,
            }
        };

        if removed {
            if let Some((cache, _)) = &self.route {
                cache.del_route(uid).await?;
            }
        }
        Ok(())
    }

    /// The session currently bound to `uid`, if this instance owns one.
    pub fn find(&self, uid: i64) -> Option<Arc<Session>> {
        self.inner.lock().unwrap().get(&uid).cloned()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().unwrap().is_empty()
    }
}

impl Default for UserMap {
    fn default() -> Self {
        UserMap::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_bind_find_unbind() {
        let users = UserMap::new();
        let (session, _rx) = Session::new();

        users.bind(1001, session.clone()).await.unwrap();
        assert_eq!(users.find(1001).unwrap().id(), session.id());
        assert_eq!(users.len(), 1);

        users.unbind(1001, session.id()).await.unwrap();
        assert!(users.find(1001).is_none());
        assert!(users.is_empty());
    }

    #[tokio::test]
    async fn test_rebind_closes_the_old_session() {
        let users = UserMap::new();
        let (first, _rx1) = Session::new();
        let (second, _rx2) = Session::new();

        users.bind(1001, first.clone()).await.unwrap();
        users.bind(1001, second.clone()).await.unwrap();

        assert!(first.is_closed());
        assert!(!second.is_closed());
        assert_eq!(users.find(1001).unwrap().id(), second.id());
    }

    #[tokio::test]
    async fn test_stale_unbind_leaves_newer_binding() {
        let users = UserMap::new();
        let (first, _rx1) = Session::new();
        let (second, _rx2) = Session::new();

        users.bind(1001, first.clone()).await.unwrap();
        users.bind(1001, second.clone()).await.unwrap();

        // The first session's cleanup runs after the second login took over.
        users.unbind(1001, first.id()).await.unwrap();
        assert_eq!(users.find(1001).unwrap().id(), second.id());
    }
}
