//! Version-tracked database migrations for the libSQL backend.
//!
//! Each migration has a version number and SQL. `run_migrations()` checks
//! the current version and applies only the new ones sequentially.
//!
//! Most of the pipeline's invariants live in the schema itself:
//! - one open conversation per (agent, platform, prospect) via a partial unique index,
//! - append-only turn logs keyed by `(conversation_id, seq)`,
//! - triggers that refuse appends to missing or closed conversations or with a gap in `seq`,
//!   and that activate a pending conversation when its first reply lands,
//! - one lead per conversation with a score constrained to 0–10.

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
            CREATE TABLE IF NOT EXISTS agent_configs (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                system_prompt TEXT NOT NULL,
                qualification_criteria TEXT NOT NULL DEFAULT '{}',
                is_active INTEGER NOT NULL DEFAULT 1,
                access_token TEXT,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS platform_accounts (
                platform TEXT NOT NULL,
                account_id TEXT NOT NULL,
                agent_config_id TEXT NOT NULL REFERENCES agent_configs(id) ON DELETE CASCADE,
                PRIMARY KEY (platform, account_id)
            );

            CREATE TABLE IF NOT EXISTS conversations (
                id TEXT PRIMARY KEY,
                agent_config_id TEXT NOT NULL,
                platform TEXT NOT NULL,
                external_user_id TEXT NOT NULL,
                status TEXT NOT NULL DEFAULT 'pending'
                    CHECK (status IN ('pending', 'active', 'closed')),
                metadata TEXT NOT NULL DEFAULT '{}',
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );
            CREATE UNIQUE INDEX IF NOT EXISTS idx_conversations_open_triple
                ON conversations(agent_config_id, platform, external_user_id)
                WHERE status IN ('pending', 'active');
            CREATE INDEX IF NOT EXISTS idx_conversations_agent ON conversations(agent_config_id);

            CREATE TABLE IF NOT EXISTS conversation_turns (
                conversation_id TEXT NOT NULL REFERENCES conversations(id) ON DELETE CASCADE,
                seq INTEGER NOT NULL,
                role TEXT NOT NULL CHECK (role IN ('user', 'assistant')),
                content TEXT NOT NULL,
                created_at TEXT NOT NULL,
                message_id TEXT,
                PRIMARY KEY (conversation_id, seq)
            );

            CREATE TRIGGER IF NOT EXISTS trg_turns_guard
            BEFORE INSERT ON conversation_turns
            BEGIN
                SELECT RAISE(ABORT, 'conversation not found')
                WHERE NOT EXISTS (SELECT 1 FROM conversations WHERE id = NEW.conversation_id);
                SELECT RAISE(ABORT, 'conversation closed')
                WHERE (SELECT status FROM conversations WHERE id = NEW.conversation_id) = 'closed';
                SELECT RAISE(ABORT, 'turn sequence mismatch')
                WHERE NEW.seq <> (SELECT COUNT(*) FROM conversation_turns
                                  WHERE conversation_id = NEW.conversation_id);
                SELECT RAISE(ABORT, 'turn out of order')
                WHERE NEW.created_at <= (SELECT MAX(created_at) FROM conversation_turns
                                         WHERE conversation_id = NEW.conversation_id);
                SELECT RAISE(ABORT, 'turn role out of turn')
                WHERE NEW.role = COALESCE(
                    (SELECT role FROM conversation_turns
                     WHERE conversation_id = NEW.conversation_id
                     ORDER BY seq DESC LIMIT 1),
                    'assistant');
            END;

            CREATE TRIGGER IF NOT EXISTS trg_turns_activate
            AFTER INSERT ON conversation_turns
            BEGIN
                UPDATE conversations
                SET updated_at = NEW.created_at,
                    status = CASE
                        WHEN NEW.role = 'assistant' AND status = 'pending' THEN 'active'
                        ELSE status
                    END
                WHERE id = NEW.conversation_id;
            END;

            CREATE TABLE IF NOT EXISTS extracted_leads (
                id TEXT PRIMARY KEY,
                conversation_id TEXT NOT NULL UNIQUE REFERENCES conversations(id) ON DELETE CASCADE,
                contact_info TEXT NOT NULL DEFAULT '{}',
                qualification_score INTEGER NOT NULL
                    CHECK (typeof(qualification_score) = 'integer'
                           AND qualification_score >= 0 AND qualification_score <= 10),
                qualification_reason TEXT NOT NULL DEFAULT '',
                next_action TEXT NOT NULL,
                booked_at TEXT,
                meeting_link TEXT,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS jobs (
                seq INTEGER PRIMARY KEY AUTOINCREMENT,
                id TEXT NOT NULL UNIQUE,
                kind TEXT NOT NULL,
                payload TEXT NOT NULL,
                partition_key TEXT NOT NULL,
                agent_config_id TEXT,
                status TEXT NOT NULL DEFAULT 'pending',
                attempts INTEGER NOT NULL DEFAULT 0,
                max_attempts INTEGER NOT NULL,
                available_at TEXT NOT NULL,
                locked_by TEXT,
                locked_until TEXT,
                last_error TEXT,
                outcome TEXT,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_jobs_status_available ON jobs(status, available_at);
            CREATE INDEX IF NOT EXISTS idx_jobs_partition ON jobs(partition_key, seq);
            CREATE INDEX IF NOT EXISTS idx_jobs_agent ON jobs(agent_config_id);
        "#,
    },
    Migration {
        version: 2,
        name: "dispatch_failures",
        sql: r#"
            CREATE TABLE IF NOT EXISTS dispatch_failures (
                id TEXT PRIMARY KEY,
                conversation_id TEXT NOT NULL,
                agent_config_id TEXT NOT NULL,
                platform TEXT NOT NULL,
                recipient_id TEXT NOT NULL,
                reply_text TEXT NOT NULL,
                error TEXT NOT NULL,
                created_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_dispatch_failures_created ON dispatch_failures(created_at);
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
    tracing::debug!(version, "Database migrations complete");

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
