//! Forward-only schema migrations
//!
//! Each migration is identified by an integer version and applied at most
//! once, in order, inside its own transaction. Applied versions are recorded
//! in `schema_version`.

use crate::error::{Result, SessionError};
use rusqlite::{params, Connection, OptionalExtension};

/// One schema step
#[derive(Debug, Clone, Copy)]
pub struct Migration {
    /// Monotonic version number, starting at 1
    pub version: i64,

    /// Human-readable description recorded alongside the version
    pub description: &'static str,

    sql: &'static str,
}

/// All migrations, ascending by version
pub const MIGRATIONS: &[Migration] = &[
    Migration {
        version: 1,
        description: "Initial schema: sessions, conversation events, approvals",
        sql: r#"
        CREATE TABLE sessions (
            id TEXT PRIMARY KEY,
            run_id TEXT NOT NULL UNIQUE,
            claude_session_id TEXT,
            parent_session_id TEXT REFERENCES sessions(id),
            status TEXT NOT NULL CHECK (status IN (
                'draft', 'starting', 'running', 'waiting_input', 'interrupting',
                'interrupted', 'completed', 'failed', 'discarded'
            )),

            query TEXT NOT NULL,
            summary TEXT NOT NULL DEFAULT '',
            title TEXT,
            model TEXT,
            model_id TEXT,
            working_dir TEXT NOT NULL DEFAULT '',

            max_turns INTEGER,
            system_prompt TEXT,
            append_system_prompt TEXT,
            custom_instructions TEXT,
            permission_prompt_tool TEXT,
            allowed_tools TEXT,
            disallowed_tools TEXT,
            additional_directories TEXT,

            created_at INTEGER NOT NULL,
            last_activity_at INTEGER NOT NULL,
            completed_at INTEGER,

            cost_usd REAL,
            duration_ms INTEGER,
            num_turns INTEGER,
            result_content TEXT,
            error_message TEXT,

            input_tokens INTEGER,
            output_tokens INTEGER,
            cache_creation_input_tokens INTEGER,
            cache_read_input_tokens INTEGER,
            effective_context_tokens INTEGER,

            archived INTEGER NOT NULL DEFAULT 0,
            auto_accept_edits INTEGER NOT NULL DEFAULT 0,
            dangerously_skip_permissions INTEGER NOT NULL DEFAULT 0,
            dangerously_skip_permissions_expires_at INTEGER,
            dangerously_skip_permissions_timeout_ms INTEGER,

            proxy_enabled INTEGER NOT NULL DEFAULT 0,
            proxy_base_url TEXT,
            proxy_api_key TEXT,
            proxy_model_override TEXT
        );
        CREATE INDEX idx_sessions_claude ON sessions(claude_session_id);
        CREATE INDEX idx_sessions_status ON sessions(status);
        CREATE INDEX idx_sessions_parent ON sessions(parent_session_id);
        CREATE INDEX idx_sessions_activity ON sessions(last_activity_at);

        CREATE TABLE conversation_events (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            session_id TEXT NOT NULL REFERENCES sessions(id),
            claude_session_id TEXT,
            sequence INTEGER NOT NULL,
            event_type TEXT NOT NULL CHECK (event_type IN (
                'message', 'tool_use', 'tool_result', 'system', 'thinking'
            )),
            created_at INTEGER NOT NULL,

            role TEXT,
            content TEXT,

            tool_id TEXT,
            tool_name TEXT,
            tool_input_json TEXT,
            parent_tool_use_id TEXT,

            tool_result_for_id TEXT,
            tool_result_content TEXT,

            is_completed INTEGER NOT NULL DEFAULT 0,
            approval_status TEXT CHECK (approval_status IS NULL OR approval_status IN (
                'pending', 'approved', 'denied', 'resolved'
            )),
            approval_id TEXT,

            UNIQUE (session_id, sequence)
        );
        CREATE INDEX idx_events_pending_tool
            ON conversation_events(session_id, tool_name, approval_status, sequence);
        CREATE INDEX idx_events_approval ON conversation_events(approval_id);
        CREATE INDEX idx_events_tool_id ON conversation_events(tool_id);

        CREATE TABLE approvals (
            id TEXT PRIMARY KEY,
            run_id TEXT NOT NULL,
            session_id TEXT NOT NULL REFERENCES sessions(id),
            status TEXT NOT NULL CHECK (status IN ('pending', 'approved', 'denied')),
            tool_name TEXT NOT NULL,
            tool_input BLOB NOT NULL,
            comment TEXT,
            created_at INTEGER NOT NULL,
            responded_at INTEGER,
            CHECK ((status = 'pending') = (responded_at IS NULL))
        );
        CREATE INDEX idx_approvals_session ON approvals(session_id, status);
        CREATE INDEX idx_approvals_status ON approvals(status, created_at);
        "#,
    },
    Migration {
        version: 2,
        description: "Session attachments: MCP servers, raw stream lines, file snapshots",
        sql: r#"
        CREATE TABLE mcp_servers (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            session_id TEXT NOT NULL REFERENCES sessions(id),
            name TEXT NOT NULL,
            command TEXT NOT NULL,
            args_json TEXT NOT NULL DEFAULT '[]',
            env_json TEXT NOT NULL DEFAULT '{}',
            created_at INTEGER NOT NULL,
            UNIQUE (session_id, name)
        );

        CREATE TABLE raw_events (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            session_id TEXT NOT NULL REFERENCES sessions(id),
            event_json TEXT NOT NULL,
            created_at INTEGER NOT NULL
        );
        CREATE INDEX idx_raw_events_session ON raw_events(session_id);

        CREATE TABLE file_snapshots (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            tool_id TEXT NOT NULL,
            session_id TEXT NOT NULL REFERENCES sessions(id),
            file_path TEXT NOT NULL,
            content TEXT NOT NULL,
            created_at INTEGER NOT NULL
        );
        CREATE INDEX idx_snapshots_session ON file_snapshots(session_id, created_at);
        "#,
    },
    Migration {
        version: 3,
        description: "Process-wide user settings",
        sql: r#"
        CREATE TABLE user_settings (
            id INTEGER PRIMARY KEY CHECK (id = 1),
            advanced_providers INTEGER NOT NULL DEFAULT 0,
            created_at INTEGER NOT NULL,
            updated_at INTEGER NOT NULL
        );
        "#,
    },
];

/// Latest schema version this build understands
pub fn latest_version() -> i64 {
    MIGRATIONS.last().map_or(0, |m| m.version)
}

/// Version currently recorded in the database (0 if fresh)
pub fn current_version(conn: &Connection) -> Result<i64> {
    let version: Option<i64> = conn
        .query_row("SELECT MAX(version) FROM schema_version", [], |row| row.get(0))
        .optional()?
        .flatten();
    Ok(version.unwrap_or(0))
}

/// Apply every migration newer than the recorded version
///
/// Returns the number of migrations applied. A database written by a newer
/// build is refused rather than downgraded.
pub fn migrate(conn: &mut Connection) -> Result<usize> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS schema_version (
            version INTEGER PRIMARY KEY,
            description TEXT NOT NULL,
            applied_at INTEGER NOT NULL
        )",
    )?;

    let current = current_version(conn)?;
    if current > latest_version() {
        return Err(SessionError::Fatal(format!(
            "database schema v{} is newer than supported v{}",
            current,
            latest_version()
        )));
    }

    let mut applied = 0;
    for migration in MIGRATIONS.iter().filter(|m| m.version > current) {
        let tx = conn.transaction()?;
        tx.execute_batch(migration.sql)?;
        tx.execute(
            "INSERT INTO schema_version (version, description, applied_at) VALUES (?1, ?2, ?3)",
            params![
                migration.version,
                migration.description,
                chrono::Utc::now().timestamp_millis()
            ],
        )?;
        tx.commit()?;
        tracing::info!(
            version = migration.version,
            description = migration.description,
            "Applied schema migration"
        );
        applied += 1;
    }

    Ok(applied)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_versions_ascending() {
        let mut prev = 0;
        for migration in MIGRATIONS {
            assert_eq!(migration.version, prev + 1);
            prev = migration.version;
        }
        assert_eq!(latest_version(), prev);
    }

    #[test]
    fn test_migrate_fresh_and_idempotent() {
        let mut conn = Connection::open_in_memory().unwrap();
        assert_eq!(migrate(&mut conn).unwrap(), MIGRATIONS.len());
        assert_eq!(current_version(&conn).unwrap(), latest_version());

        assert_eq!(migrate(&mut conn).unwrap(), 0);
        assert_eq!(current_version(&conn).unwrap(), latest_version());
    }

    #[test]
    fn test_migrate_resumes_from_partial() {
        let mut conn = Connection::open_in_memory().unwrap();
        conn.execute_batch(
            "CREATE TABLE schema_version (
                version INTEGER PRIMARY KEY,
                description TEXT NOT NULL,
                applied_at INTEGER NOT NULL
            )",
        )
        .unwrap();
        conn.execute_batch(MIGRATIONS[0].sql).unwrap();
        conn.execute(
            "INSERT INTO schema_version VALUES (1, 'initial', 0)",
            [],
        )
        .unwrap();

        assert_eq!(migrate(&mut conn).unwrap(), MIGRATIONS.len() - 1);
        let exists: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name = 'user_settings'",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(exists, 1);
    }

    #[test]
    fn test_newer_database_refused() {
        let mut conn = Connection::open_in_memory().unwrap();
        migrate(&mut conn).unwrap();
        conn.execute(
            "INSERT INTO schema_version VALUES (?1, 'future', 0)",
            params![latest_version() + 1],
        )
        .unwrap();
        assert!(matches!(migrate(&mut conn), Err(SessionError::Fatal(_))));
    }
}
