//! libSQL session store.
//!
//! One row per session: the serialized state plus the columns needed for
//! expiry and the phone lookup. Expiry is checked on read; `purge_expired`
//! reclaims the rows.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{SecondsFormat, Utc};
use libsql::{Connection, Database as LibSqlDatabase, params};
use tracing::{debug, info};

use crate::error::StoreError;
use crate::session::SessionState;
use crate::store::migrations;
use crate::store::traits::SessionStore;

/// libSQL-backed session store.
///
/// Stores a single connection that is reused for all operations.
pub struct LibSqlSessionStore {
    #[allow(dead_code)]
    db: Arc<LibSqlDatabase>,
    conn: Connection,
}

impl LibSqlSessionStore {
    /// Open (or create) a local database file and run migrations.
    pub async fn new_local(path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent).map_err(|e| {
                StoreError::Connection(format!("Failed to create database directory: {e}"))
            })?;
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(|e| StoreError::Connection(format!("Failed to open libSQL database: {e}")))?;
        let store = Self::from_database(db).await?;
        info!(path = %path.display(), "Session database opened");
        Ok(store)
    }

    /// Create an in-memory database (for tests).
    pub async fn new_memory() -> Result<Self, StoreError> {
        let db = libsql::Builder::new_local(":memory:")
            .build()
            .await
            .map_err(|e| {
                StoreError::Connection(format!("Failed to create in-memory database: {e}"))
            })?;
        Self::from_database(db).await
    }

    async fn from_database(db: LibSqlDatabase) -> Result<Self, StoreError> {
        let conn = db
            .connect()
            .map_err(|e| StoreError::Connection(format!("Failed to create connection: {e}")))?;
        migrations::run_migrations(&conn).await?;
        Ok(Self {
            db: Arc::new(db),
            conn,
        })
    }

    fn conn(&self) -> &Connection {
        &self.conn
    }
}

/// Fixed-width UTC timestamps so string comparison orders correctly.
fn timestamp(at: chrono::DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn now_str() -> String {
    timestamp(Utc::now())
}

fn opt_text(s: Option<&str>) -> libsql::Value {
    match s {
        Some(v) => libsql::Value::Text(v.to_string()),
        None => libsql::Value::Null,
    }
}

#[async_trait]
impl SessionStore for LibSqlSessionStore {
    async fn get(&self, id: &str) -> Result<Option<SessionState>, StoreError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT state FROM sessions WHERE id = ?1 AND expires_at > ?2",
                params![id, now_str()],
            )
            .await
            .map_err(|e| StoreError::Query(format!("get: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => {
                let raw: String = row
                    .get(0)
                    .map_err(|e| StoreError::Query(format!("get row parse: {e}")))?;
                SessionState::from_json(&raw).map(Some)
            }
            Ok(None) => Ok(None),
            Err(e) => Err(StoreError::Query(format!("get: {e}"))),
        }
    }

    async fn set(&self, id: &str, state: &SessionState, ttl: Duration) -> Result<(), StoreError> {
        let payload = state.to_json()?;
        let now = Utc::now();
        let ttl = chrono::Duration::from_std(ttl)
            .map_err(|e| StoreError::Query(format!("set: invalid ttl: {e}")))?;

        self.conn()
            .execute(
                "INSERT INTO sessions (id, phone, direction, phase, state, expires_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
                 ON CONFLICT(id) DO UPDATE SET
                    phone = excluded.phone,
                    direction = excluded.direction,
                    phase = excluded.phase,
                    state = excluded.state,
                    expires_at = excluded.expires_at,
                    updated_at = excluded.updated_at",
                params![
                    id,
                    opt_text(state.patient.phone.as_deref()),
                    state.direction.to_string(),
                    state.current_phase.to_string(),
                    payload,
                    timestamp(now + ttl),
                    timestamp(now),
                ],
            )
            .await
            .map_err(|e| StoreError::Query(format!("set: {e}")))?;

        debug!(session_id = %id, phase = %state.current_phase, "Session stored in DB");
        Ok(())
    }

    async fn delete(&self, id: &str) -> Result<bool, StoreError> {
        let affected = self
            .conn()
            .execute("DELETE FROM sessions WHERE id = ?1", params![id])
            .await
            .map_err(|e| StoreError::Query(format!("delete: {e}")))?;
        Ok(affected > 0)
    }

    async fn scan(&self, prefix: &str) -> Result<Vec<String>, StoreError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT id FROM sessions WHERE substr(id, 1, length(?1)) = ?1 AND expires_at > ?2
                 ORDER BY id",
                params![prefix, now_str()],
            )
            .await
            .map_err(|e| StoreError::Query(format!("scan: {e}")))?;

        let mut ids = Vec::new();
        while let Some(row) = rows
            .next()
            .await
            .map_err(|e| StoreError::Query(format!("scan: {e}")))?
        {
            let id: String = row
                .get(0)
                .map_err(|e| StoreError::Query(format!("scan row parse: {e}")))?;
            ids.push(id);
        }
        Ok(ids)
    }

    async fn find_by_phone(&self, phone: &str) -> Result<Option<String>, StoreError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT id FROM sessions WHERE phone = ?1 AND expires_at > ?2
                 ORDER BY updated_at DESC LIMIT 1",
                params![phone, now_str()],
            )
            .await
            .map_err(|e| StoreError::Query(format!("find_by_phone: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => row
                .get::<String>(0)
                .map(Some)
                .map_err(|e| StoreError::Query(format!("find_by_phone row parse: {e}"))),
            Ok(None) => Ok(None),
            Err(e) => Err(StoreError::Query(format!("find_by_phone: {e}"))),
        }
    }

    async fn purge_expired(&self) -> Result<usize, StoreError> {
        let affected = self
            .conn()
            .execute("DELETE FROM sessions WHERE expires_at <= ?1", params![now_str()])
            .await
            .map_err(|e| StoreError::Query(format!("purge_expired: {e}")))?;
        if affected > 0 {
            info!(count = affected, "Expired sessions purged");
        }
        Ok(affected as usize)
    }
}
