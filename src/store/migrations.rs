//! Version-tracked database migrations for the libSQL backend.
//!
//! Each migration has a version number and SQL. `run_migrations()` checks
//! the current version and applies only the new ones sequentially.

use libsql::Connection;

use crate::error::DatabaseError;

/// A single migration step.
struct Migration {
    version: i64,
    name: &'static str,
    sql: &'static str,
}

/// All migrations in order. Add new versions to the end.
static MIGRATIONS: &[Migration] = &[
    Migration {
        version: 1,
        name: "initial_schema",
        sql: r#"
            CREATE TABLE IF NOT EXISTS conversations (
                id TEXT PRIMARY KEY,
                external_id TEXT NOT NULL UNIQUE,
                lead_json TEXT NOT NULL,
                sender_id TEXT,
                funnel_stage TEXT NOT NULL DEFAULT 'positive_reply',
                transcript_json TEXT NOT NULL DEFAULT '[]',
                generation_seq INTEGER NOT NULL DEFAULT 0,
                needs_review INTEGER NOT NULL DEFAULT 0,
                archived INTEGER NOT NULL DEFAULT 0,
                last_message_at TEXT,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_conversations_stage ON conversations(funnel_stage);

            CREATE TABLE IF NOT EXISTS ledger_entries (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                conversation_id TEXT NOT NULL REFERENCES conversations(id),
                direction TEXT NOT NULL,
                content TEXT NOT NULL,
                content_key TEXT NOT NULL,
                sent_at TEXT NOT NULL,
                sent_at_ms INTEGER NOT NULL,
                sent_minute INTEGER NOT NULL,
                campaign_id TEXT,
                campaign_name TEXT,
                inserted_at TEXT NOT NULL,
                UNIQUE (conversation_id, direction, content_key, sent_minute)
            );
            CREATE INDEX IF NOT EXISTS idx_ledger_conversation_sent
                ON ledger_entries(conversation_id, sent_at_ms, id);

            CREATE TABLE IF NOT EXISTS drafts (
                id TEXT PRIMARY KEY,
                conversation_id TEXT NOT NULL REFERENCES conversations(id),
                text TEXT NOT NULL,
                stage TEXT NOT NULL,
                stage_rationale TEXT NOT NULL DEFAULT '',
                status TEXT NOT NULL DEFAULT 'pending',
                guidance TEXT,
                model TEXT,
                cost_usd TEXT NOT NULL DEFAULT '0',
                qa_json TEXT,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_drafts_conversation ON drafts(conversation_id);
            CREATE INDEX IF NOT EXISTS idx_drafts_status ON drafts(status);
            CREATE UNIQUE INDEX IF NOT EXISTS idx_drafts_one_pending
                ON drafts(conversation_id) WHERE status = 'pending';
        "#,
    },
    Migration {
        version: 2,
        name: "retry_tasks_and_resources",
        sql: r#"
            CREATE TABLE IF NOT EXISTS retry_tasks (
                id TEXT PRIMARY KEY,
                conversation_id TEXT NOT NULL REFERENCES conversations(id),
                reason TEXT NOT NULL,
                attempts INTEGER NOT NULL DEFAULT 1,
                status TEXT NOT NULL DEFAULT 'open',
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_retry_tasks_status ON retry_tasks(status);
            CREATE UNIQUE INDEX IF NOT EXISTS idx_retry_tasks_one_open
                ON retry_tasks(conversation_id) WHERE status = 'open';

            CREATE TABLE IF NOT EXISTS resource_docs (
                id TEXT PRIMARY KEY,
                title TEXT NOT NULL,
                category TEXT NOT NULL DEFAULT '',
                content TEXT NOT NULL,
                priority INTEGER NOT NULL DEFAULT 0,
                stages_json TEXT NOT NULL DEFAULT '[]',
                is_active INTEGER NOT NULL DEFAULT 1,
                updated_at TEXT NOT NULL DEFAULT (datetime('now'))
            );
            CREATE INDEX IF NOT EXISTS idx_resource_docs_active ON resource_docs(is_active);
        "#,
    },
];

/// Run all pending migrations against the given connection.
///
/// Creates the `_migrations` table if it doesn't exist.
pub async fn run_migrations(conn: &Connection) -> Result<(), DatabaseError> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS _migrations (
            version INTEGER PRIMARY KEY,
            name TEXT NOT NULL,
            applied_at TEXT NOT NULL DEFAULT (datetime('now'))
        )",
        (),
    )
    .await
    .map_err(|e| DatabaseError::Migration(format!("Failed to create _migrations table: {e}")))?;

    let current_version = get_current_version(conn).await?;

    for migration in MIGRATIONS {
        if migration.version > current_version {
            tracing::info!(
                version = migration.version,
                name = migration.name,
                "Applying migration"
            );
            conn.execute_batch(migration.sql).await.map_err(|e| {
                DatabaseError::Migration(format!(
                    "Migration V{} ({}) failed: {e}",
                    migration.version, migration.name
                ))
            })?;
            seed_version(conn, migration.version, migration.name).await?;
        }
    }

    let version = get_current_version(conn).await?;
    tracing::info!(version, "Database migrations complete");
    Ok(())
}

/// Get the highest applied migration version, or 0 if none.
async fn get_current_version(conn: &Connection) -> Result<i64, DatabaseError> {
    let mut rows = conn
        .query("SELECT COALESCE(MAX(version), 0) FROM _migrations", ())
        .await
        .map_err(|e| DatabaseError::Migration(format!("Failed to query migration version: {e}")))?;

    let row = rows
        .next()
        .await
        .map_err(|e| DatabaseError::Migration(format!("Failed to read migration version: {e}")))?;

    match row {
        Some(row) => {
            let version: i64 = row.get(0).map_err(|e| {
                DatabaseError::Migration(format!("Failed to parse migration version: {e}"))
            })?;
            Ok(version)
        }
        None => Ok(0),
    }
}

/// Insert a version record into `_migrations`.
async fn seed_version(conn: &Connection, version: i64, name: &str) -> Result<(), DatabaseError> {
    conn.execute(
        "INSERT OR IGNORE INTO _migrations (version, name) VALUES (?1, ?2)",
        libsql::params![version, name],
    )
    .await
    .map_err(|e| DatabaseError::Migration(format!("Failed to record migration V{version}: {e}")))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn test_conn() -> Connection {
        let db = libsql::Builder::new_local(":memory:")
            .build()
            .await
            .unwrap();
        db.connect().unwrap()
    }

    #[tokio::test]
    async fn migrations_create_all_tables() {
        let conn = test_conn().await;
        run_migrations(&conn).await.unwrap();

        for table in &[
            "_migrations",
            "conversations",
            "ledger_entries",
            "drafts",
            "retry_tasks",
            "resource_docs",
        ] {
            let mut rows = conn
                .query(
                    "SELECT COUNT(*) FROM sqlite_master WHERE type='table' AND name=?1",
                    libsql::params![*table],
                )
                .await
                .unwrap();
            let row = rows.next().await.unwrap().unwrap();
            let count: i64 = row.get(0).unwrap();
            assert_eq!(count, 1, "Table '{}' should exist", table);
        }
    }

    #[tokio::test]
    async fn migrations_are_idempotent() {
        let conn = test_conn().await;
        run_migrations(&conn).await.unwrap();
        run_migrations(&conn).await.unwrap();

        let version = get_current_version(&conn).await.unwrap();
        assert_eq!(version, 2);
    }

    #[tokio::test]
    async fn version_tracking() {
        let conn = test_conn().await;
        run_migrations(&conn).await.unwrap();

        let mut rows = conn
            .query("SELECT version, name FROM _migrations ORDER BY version", ())
            .await
            .unwrap();
        let row1 = rows.next().await.unwrap().unwrap();
        assert_eq!(row1.get::<i64>(0).unwrap(), 1);
        assert_eq!(row1.get::<String>(1).unwrap(), "initial_schema");

        let row2 = rows.next().await.unwrap().unwrap();
        assert_eq!(row2.get::<i64>(0).unwrap(), 2);
        assert_eq!(row2.get::<String>(1).unwrap(), "retry_tasks_and_resources");
    }

    #[tokio::test]
    async fn second_pending_draft_violates_index() {
        let conn = test_conn().await;
        run_migrations(&conn).await.unwrap();
        conn.execute(
            "INSERT INTO conversations (id, external_id, lead_json, created_at, updated_at) VALUES ('c1', 'ext', '{}', 'now', 'now')",
            (),
        )
        .await
        .unwrap();
        let insert = "INSERT INTO drafts (id, conversation_id, text, stage, status, created_at, updated_at) VALUES (?1, 'c1', 'hi', 'pitched', 'pending', 'now', 'now')";
        conn.execute(insert, libsql::params!["d1"]).await.unwrap();
        assert!(conn.execute(insert, libsql::params!["d2"]).await.is_err());
    }
}
