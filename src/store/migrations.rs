//! Version-tracked migrations for the libSQL session store.
//!
//! Each migration has a version number and SQL. `run_migrations()` checks the
//! current version and applies only the new ones, in order.

use libsql::Connection;

use crate::error::StoreError;

/// One schema version.
struct Migration {
    version: i64,
    name: &'static str,
    sql: &'static str,
}

/// Session schema history. Append only.
static MIGRATIONS: &[Migration] = &[Migration {
    version: 1,
    name: "sessions",
    sql: r#"
        CREATE TABLE IF NOT EXISTS sessions (
            id TEXT PRIMARY KEY,
            phone TEXT,
            direction TEXT NOT NULL,
            phase TEXT NOT NULL,
            state TEXT NOT NULL,
            expires_at TEXT NOT NULL,
            updated_at TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_sessions_phone ON sessions(phone);
        CREATE INDEX IF NOT EXISTS idx_sessions_expires_at ON sessions(expires_at);
    "#,
}];

/// Bring the schema up to the latest version.
pub async fn run_migrations(conn: &Connection) -> Result<(), StoreError> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS _migrations (
            version INTEGER PRIMARY KEY,
            name TEXT NOT NULL,
            applied_at TEXT NOT NULL DEFAULT (datetime('now'))
        )",
        (),
    )
    .await
    .map_err(|e| StoreError::Migration(format!("cannot create migration ledger: {e}")))?;

    let applied = applied_version(conn).await?;

    for migration in MIGRATIONS.iter().filter(|m| m.version > applied) {
        tracing::info!(
            version = migration.version,
            name = migration.name,
            "Applying session schema migration"
        );
        conn.execute_batch(migration.sql).await.map_err(|e| {
            StoreError::Migration(format!(
                "schema version {} ({}) failed: {e}",
                migration.version, migration.name
            ))
        })?;
        record_version(conn, migration.version, migration.name).await?;
    }

    Ok(())
}

/// Latest applied version; 0 on a fresh database.
async fn applied_version(conn: &Connection) -> Result<i64, StoreError> {
    let mut rows = conn
        .query("SELECT COALESCE(MAX(version), 0) FROM _migrations", ())
        .await
        .map_err(|e| StoreError::Migration(format!("cannot query schema version: {e}")))?;

    let row = rows
        .next()
        .await
        .map_err(|e| StoreError::Migration(format!("cannot read schema version: {e}")))?;

    match row {
        Some(row) => row
            .get::<i64>(0)
            .map_err(|e| StoreError::Migration(format!("schema version is not an integer: {e}"))),
        None => Ok(0),
    }
}

async fn record_version(conn: &Connection, version: i64, name: &str) -> Result<(), StoreError> {
    conn.execute(
        "INSERT OR IGNORE INTO _migrations (version, name) VALUES (?1, ?2)",
        libsql::params![version, name],
    )
    .await
    .map_err(|e| StoreError::Migration(format!("cannot record schema version {version}: {e}")))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn test_conn() -> Connection {
        let db = libsql::Builder::new_local(":memory:").build().await.unwrap();
        db.connect().unwrap()
    }

    #[tokio::test]
    async fn migrations_create_sessions_table() {
        let conn = test_conn().await;
        run_migrations(&conn).await.unwrap();

        let mut rows = conn
            .query(
                "SELECT COUNT(*) FROM sqlite_master WHERE type='table' AND name=?1",
                libsql::params!["sessions"],
            )
            .await
            .unwrap();
        let row = rows.next().await.unwrap().unwrap();
        let count: i64 = row.get(0).unwrap();
        assert_eq!(count, 1);
    }

    #[tokio::test]
    async fn migrations_are_idempotent() {
        let conn = test_conn().await;
        run_migrations(&conn).await.unwrap();
        run_migrations(&conn).await.unwrap();
        assert_eq!(applied_version(&conn).await.unwrap(), 1);
    }
}
