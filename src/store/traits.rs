//! Session store trait.

use std::time::Duration;

use async_trait::async_trait;

use crate::error::StoreError;
use crate::session::SessionState;

/// TTL key/value persistence for session state.
///
/// Implementations keep a phone → session index in step with `set` and
/// `delete`, so reverse lookups never scan the key space.
#[async_trait]
pub trait SessionStore: Send + Sync {
    /// Load a live session. Expired entries read as `None`.
    async fn get(&self, id: &str) -> Result<Option<SessionState>, StoreError>;

    /// Insert or replace a session, resetting its time-to-live.
    async fn set(&self, id: &str, state: &SessionState, ttl: Duration) -> Result<(), StoreError>;

    /// Remove a session. Returns whether anything was removed.
    async fn delete(&self, id: &str) -> Result<bool, StoreError>;

    /// Ids of live sessions starting with `prefix`.
    async fn scan(&self, prefix: &str) -> Result<Vec<String>, StoreError>;

    /// Most recently written live session for a normalized phone number.
    async fn find_by_phone(&self, phone: &str) -> Result<Option<String>, StoreError>;

    /// Drop expired sessions. Returns how many were removed.
    async fn purge_expired(&self) -> Result<usize, StoreError>;
}
