//! In-memory session store with TTL expiry.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::RwLock;
use tokio::time::Instant;
use tracing::debug;

use crate::error::StoreError;
use crate::session::SessionState;
use crate::store::traits::SessionStore;

struct Entry {
    /// Serialized state, so callers never share a mutable copy.
    payload: String,
    phone: Option<String>,
    expires_at: Instant,
}

impl Entry {
    fn is_live(&self, now: Instant) -> bool {
        self.expires_at > now
    }
}

#[derive(Default)]
struct Inner {
    entries: HashMap<String, Entry>,
    phone_index: HashMap<String, String>,
}

impl Inner {
    fn remove(&mut self, id: &str) -> bool {
        let Some(entry) = self.entries.remove(id) else {
            return false;
        };
        if let Some(phone) = entry.phone
            && self.phone_index.get(&phone).is_some_and(|owner| owner == id)
        {
            self.phone_index.remove(&phone);
        }
        true
    }
}

/// Session store held in process memory.
pub struct InMemorySessionStore {
    inner: RwLock<Inner>,
}

impl InMemorySessionStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            inner: RwLock::new(Inner::default()),
        })
    }

    /// Number of stored entries, live or not yet purged.
    pub async fn len(&self) -> usize {
        self.inner.read().await.entries.len()
    }
}

#[async_trait]
impl SessionStore for InMemorySessionStore {
    async fn get(&self, id: &str) -> Result<Option<SessionState>, StoreError> {
        let inner = self.inner.read().await;
        match inner.entries.get(id) {
            Some(entry) if entry.is_live(Instant::now()) => {
                SessionState::from_json(&entry.payload).map(Some)
            }
            _ => Ok(None),
        }
    }

    async fn set(&self, id: &str, state: &SessionState, ttl: Duration) -> Result<(), StoreError> {
        let payload = state.to_json()?;
        let phone = state.patient.phone.clone();
        let mut inner = self.inner.write().await;

        let previous_phone = inner.entries.get(id).and_then(|e| e.phone.clone());
        if previous_phone != phone
            && let Some(old) = previous_phone
            && inner.phone_index.get(&old).is_some_and(|owner| owner == id)
        {
            inner.phone_index.remove(&old);
        }
        if let Some(phone) = &phone {
            inner.phone_index.insert(phone.clone(), id.to_string());
        }
        inner.entries.insert(
            id.to_string(),
            Entry {
                payload,
                phone,
                expires_at: Instant::now() + ttl,
            },
        );
        debug!(session_id = %id, ttl_secs = ttl.as_secs(), "Session stored");
        Ok(())
    }

    async fn delete(&self, id: &str) -> Result<bool, StoreError> {
        Ok(self.inner.write().await.remove(id))
    }

    async fn scan(&self, prefix: &str) -> Result<Vec<String>, StoreError> {
        let now = Instant::now();
        let inner = self.inner.read().await;
        let mut ids: Vec<String> = inner
            .entries
            .iter()
            .filter(|(id, entry)| id.starts_with(prefix) && entry.is_live(now))
            .map(|(id, _)| id.clone())
            .collect();
        ids.sort();
        Ok(ids)
    }

    async fn find_by_phone(&self, phone: &str) -> Result<Option<String>, StoreError> {
        let inner = self.inner.read().await;
        let Some(id) = inner.phone_index.get(phone) else {
            return Ok(None);
        };
        let live = inner
            .entries
            .get(id)
            .is_some_and(|e| e.is_live(Instant::now()));
        Ok(live.then(|| id.clone()))
    }

    async fn purge_expired(&self) -> Result<usize, StoreError> {
        let now = Instant::now();
        let mut inner = self.inner.write().await;
        let expired: Vec<String> = inner
            .entries
            .iter()
            .filter(|(_, entry)| !entry.is_live(now))
            .map(|(id, _)| id.clone())
            .collect();
        for id in &expired {
            inner.remove(id);
        }
        Ok(expired.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::phase::CallDirection;

    const TTL: Duration = Duration::from_secs(3600);

    fn make_state(id: &str, phone: Option<&str>) -> SessionState {
        let mut state =
            SessionState::new(id, CallDirection::Inbound, "María", "Transformas", "Cosalud");
        state.patient.phone = phone.map(str::to_string);
        state
    }

    #[tokio::test]
    async fn set_then_get_round_trips() {
        let store = InMemorySessionStore::new();
        let mut state = make_state("s-1", None);
        state.append_user("Hola");
        store.set("s-1", &state, TTL).await.unwrap();

        let loaded = store.get("s-1").await.unwrap().unwrap();
        assert_eq!(loaded, state);
        assert!(store.get("missing").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn zero_ttl_expires_immediately() {
        let store = InMemorySessionStore::new();
        store.set("s-1", &make_state("s-1", Some("3001112222")), Duration::ZERO).await.unwrap();
        assert!(store.get("s-1").await.unwrap().is_none());
        assert!(store.find_by_phone("3001112222").await.unwrap().is_none());
        assert!(store.scan("").await.unwrap().is_empty());

        assert_eq!(store.purge_expired().await.unwrap(), 1);
        assert_eq!(store.len().await, 0);
    }

    #[tokio::test]
    async fn phone_index_follows_set_and_delete() {
        let store = InMemorySessionStore::new();
        store.set("s-1", &make_state("s-1", Some("3001112222")), TTL).await.unwrap();
        assert_eq!(store.find_by_phone("3001112222").await.unwrap().as_deref(), Some("s-1"));

        // A newer session for the same phone takes over the index.
        store.set("s-2", &make_state("s-2", Some("3001112222")), TTL).await.unwrap();
        assert_eq!(store.find_by_phone("3001112222").await.unwrap().as_deref(), Some("s-2"));

        // Deleting the stale one leaves the index alone.
        assert!(store.delete("s-1").await.unwrap());
        assert_eq!(store.find_by_phone("3001112222").await.unwrap().as_deref(), Some("s-2"));

        assert!(store.delete("s-2").await.unwrap());
        assert!(store.find_by_phone("3001112222").await.unwrap().is_none());
        assert!(!store.delete("s-2").await.unwrap());
    }

    #[tokio::test]
    async fn changing_phone_moves_index_entry() {
        let store = InMemorySessionStore::new();
        store.set("s-1", &make_state("s-1", Some("3001112222")), TTL).await.unwrap();
        store.set("s-1", &make_state("s-1", Some("3009998888")), TTL).await.unwrap();
        assert!(store.find_by_phone("3001112222").await.unwrap().is_none());
        assert_eq!(store.find_by_phone("3009998888").await.unwrap().as_deref(), Some("s-1"));
    }

    #[tokio::test]
    async fn scan_filters_by_prefix() {
        let store = InMemorySessionStore::new();
        for id in ["call-b", "call-a", "other"] {
            store.set(id, &make_state(id, None), TTL).await.unwrap();
        }
        assert_eq!(store.scan("call-").await.unwrap(), vec!["call-a", "call-b"]);
    }
}
