use super::sessions::session_exists;
use super::{timestamp, SqliteStore};
use crate::error::{Result, SessionError};
use crate::types::{now, FileSnapshot, McpServer, UserSettings};
use rusqlite::{params, OptionalExtension, TransactionBehavior};

// ─── File snapshots ──────────────────────────────────────────────

impl SqliteStore {
    pub fn create_file_snapshot(
        &self,
        session_id: &str,
        tool_id: &str,
        file_path: &str,
        content: &str,
    ) -> Result<FileSnapshot> {
        let conn = self.conn()?;
        if !session_exists(&conn, session_id)? {
            return Err(SessionError::SessionNotFound(session_id.to_string()));
        }
        let created_at = now();
        conn.execute(
            "INSERT INTO file_snapshots (tool_id, session_id, file_path, content, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![tool_id, session_id, file_path, content, created_at.timestamp_millis()],
        )?;
        Ok(FileSnapshot {
            id: conn.last_insert_rowid(),
            tool_id: tool_id.to_string(),
            session_id: session_id.to_string(),
            file_path: file_path.to_string(),
            content: content.to_string(),
            created_at,
        })
    }

    /// Snapshots captured for a session, oldest first
    pub fn get_file_snapshots(&self, session_id: &str) -> Result<Vec<FileSnapshot>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT * FROM file_snapshots WHERE session_id = ?1 ORDER BY created_at ASC, id ASC",
        )?;
        let rows = stmt.query_map([session_id], |row| {
            Ok(FileSnapshot {
                id: row.get("id")?,
                tool_id: row.get("tool_id")?,
                session_id: row.get("session_id")?,
                file_path: row.get("file_path")?,
                content: row.get("content")?,
                created_at: timestamp(row, "created_at")?,
            })
        })?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }
}

// ─── MCP servers ─────────────────────────────────────────────────

impl SqliteStore {
    /// Replace the MCP server definitions attached to a session
    pub fn store_mcp_servers(&self, session_id: &str, servers: &[McpServer]) -> Result<()> {
        let mut conn = self.conn()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        if !session_exists(&tx, session_id)? {
            return Err(SessionError::SessionNotFound(session_id.to_string()));
        }
        tx.execute("DELETE FROM mcp_servers WHERE session_id = ?1", [session_id])?;
        let created_at = now().timestamp_millis();
        for server in servers {
            tx.execute(
                "INSERT INTO mcp_servers (session_id, name, command, args_json, env_json, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    session_id,
                    server.name,
                    server.command,
                    serde_json::to_string(&server.args)?,
                    serde_json::to_string(&server.env)?,
                    created_at,
                ],
            )?;
        }
        tx.commit()?;
        Ok(())
    }

    /// MCP servers of a session in insertion order
    pub fn get_mcp_servers(&self, session_id: &str) -> Result<Vec<McpServer>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT name, command, args_json, env_json FROM mcp_servers
             WHERE session_id = ?1 ORDER BY id ASC",
        )?;
        let rows = stmt.query_map([session_id], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, String>(3)?,
            ))
        })?;

        let mut servers = Vec::new();
        for row in rows {
            let (name, command, args, env) = row?;
            servers.push(McpServer {
                name,
                command,
                args: serde_json::from_str(&args)?,
                env: serde_json::from_str(&env)?,
            });
        }
        Ok(servers)
    }
}

// ─── Raw stream lines ────────────────────────────────────────────

impl SqliteStore {
    /// Keep an unparsed stream line for debugging
    pub fn store_raw_event(&self, session_id: &str, event_json: &str) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO raw_events (session_id, event_json, created_at) VALUES (?1, ?2, ?3)",
            params![session_id, event_json, now().timestamp_millis()],
        )?;
        Ok(())
    }

    pub fn get_raw_events(&self, session_id: &str) -> Result<Vec<String>> {
        let conn = self.conn()?;
        let mut stmt =
            conn.prepare("SELECT event_json FROM raw_events WHERE session_id = ?1 ORDER BY id ASC")?;
        let rows = stmt.query_map([session_id], |row| row.get(0))?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }
}

// ─── User settings ───────────────────────────────────────────────

impl SqliteStore {
    /// Process-wide settings, created with defaults on first read
    pub fn get_user_settings(&self) -> Result<UserSettings> {
        let conn = self.conn()?;
        let stamp = now().timestamp_millis();
        conn.execute(
            "INSERT OR IGNORE INTO user_settings (id, advanced_providers, created_at, updated_at)
             VALUES (1, 0, ?1, ?1)",
            [stamp],
        )?;
        let settings = conn
            .query_row(
                "SELECT advanced_providers, created_at, updated_at FROM user_settings WHERE id = 1",
                [],
                |row| {
                    Ok(UserSettings {
                        advanced_providers: row.get("advanced_providers")?,
                        created_at: timestamp(row, "created_at")?,
                        updated_at: timestamp(row, "updated_at")?,
                    })
                },
            )
            .optional()?;
        settings.ok_or_else(|| SessionError::Fatal("user settings row missing".into()))
    }

    pub fn update_user_settings(&self, advanced_providers: bool) -> Result<UserSettings> {
        {
            let conn = self.conn()?;
            let stamp = now().timestamp_millis();
            conn.execute(
                "INSERT INTO user_settings (id, advanced_providers, created_at, updated_at)
                 VALUES (1, ?1, ?2, ?2)
                 ON CONFLICT(id) DO UPDATE SET
                    advanced_providers = excluded.advanced_providers,
                    updated_at = excluded.updated_at",
                params![advanced_providers, stamp],
            )?;
        }
        self.get_user_settings()
    }
}
