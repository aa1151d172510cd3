use super::{
    enum_column, json_list, on_constraint, opt_timestamp, timestamp, to_json_list, SqliteStore,
};
use crate::error::{Result, SessionError};
use crate::types::{
    now, ProxyConfig, RecentPath, Session, SessionFilter, SessionStatus, SessionUpdate,
};
use chrono::{DateTime, Utc};
use rusqlite::types::Value;
use rusqlite::{params, params_from_iter, Connection, OptionalExtension, Row, TransactionBehavior};

/// Default number of entries returned by `recent_working_dirs`
pub const DEFAULT_RECENT_PATHS: usize = 20;

const INSERT_COLUMNS: &[&str] = &[
    "id",
    "run_id",
    "claude_session_id",
    "parent_session_id",
    "status",
    "query",
    "summary",
    "title",
    "model",
    "model_id",
    "working_dir",
    "max_turns",
    "system_prompt",
    "append_system_prompt",
    "custom_instructions",
    "permission_prompt_tool",
    "allowed_tools",
    "disallowed_tools",
    "additional_directories",
    "created_at",
    "last_activity_at",
    "completed_at",
    "cost_usd",
    "duration_ms",
    "num_turns",
    "result_content",
    "error_message",
    "input_tokens",
    "output_tokens",
    "cache_creation_input_tokens",
    "cache_read_input_tokens",
    "effective_context_tokens",
    "archived",
    "auto_accept_edits",
    "dangerously_skip_permissions",
    "dangerously_skip_permissions_expires_at",
    "dangerously_skip_permissions_timeout_ms",
    "proxy_enabled",
    "proxy_base_url",
    "proxy_api_key",
    "proxy_model_override",
];

/// Result of a session update: the status before the write and the row after it
#[derive(Debug, Clone, PartialEq)]
pub struct SessionChange {
    pub previous_status: SessionStatus,
    pub session: Session,
}

impl SessionChange {
    pub fn status_changed(&self) -> bool {
        self.previous_status != self.session.status
    }
}

fn session_from_row(row: &Row<'_>) -> rusqlite::Result<Session> {
    Ok(Session {
        id: row.get("id")?,
        run_id: row.get("run_id")?,
        claude_session_id: row.get("claude_session_id")?,
        parent_session_id: row.get("parent_session_id")?,
        status: enum_column(row, "status")?,
        query: row.get("query")?,
        summary: row.get("summary")?,
        title: row.get("title")?,
        model: row.get("model")?,
        model_id: row.get("model_id")?,
        working_dir: row.get("working_dir")?,
        max_turns: row.get("max_turns")?,
        system_prompt: row.get("system_prompt")?,
        append_system_prompt: row.get("append_system_prompt")?,
        custom_instructions: row.get("custom_instructions")?,
        permission_prompt_tool: row.get("permission_prompt_tool")?,
        allowed_tools: json_list(row.get("allowed_tools")?),
        disallowed_tools: json_list(row.get("disallowed_tools")?),
        additional_directories: json_list(row.get("additional_directories")?),
        created_at: timestamp(row, "created_at")?,
        last_activity_at: timestamp(row, "last_activity_at")?,
        completed_at: opt_timestamp(row, "completed_at")?,
        cost_usd: row.get("cost_usd")?,
        duration_ms: row.get("duration_ms")?,
        num_turns: row.get("num_turns")?,
        result_content: row.get("result_content")?,
        error_message: row.get("error_message")?,
        input_tokens: row.get("input_tokens")?,
        output_tokens: row.get("output_tokens")?,
        cache_creation_input_tokens: row.get("cache_creation_input_tokens")?,
        cache_read_input_tokens: row.get("cache_read_input_tokens")?,
        effective_context_tokens: row.get("effective_context_tokens")?,
        archived: row.get("archived")?,
        auto_accept_edits: row.get("auto_accept_edits")?,
        dangerously_skip_permissions: row.get("dangerously_skip_permissions")?,
        dangerously_skip_permissions_expires_at: opt_timestamp(
            row,
            "dangerously_skip_permissions_expires_at",
        )?,
        dangerously_skip_permissions_timeout_ms: row
            .get("dangerously_skip_permissions_timeout_ms")?,
        proxy: ProxyConfig {
            enabled: row.get("proxy_enabled")?,
            base_url: row.get("proxy_base_url")?,
            api_key: row.get("proxy_api_key")?,
            model_override: row.get("proxy_model_override")?,
        },
    })
}

fn text(v: &Option<String>) -> Value {
    v.clone().map_or(Value::Null, Value::Text)
}

fn int(v: Option<i64>) -> Value {
    v.map_or(Value::Null, Value::Integer)
}

fn millis(v: Option<DateTime<Utc>>) -> Value {
    int(v.map(|t| t.timestamp_millis()))
}

fn flag(v: bool) -> Value {
    Value::Integer(i64::from(v))
}

pub(super) fn load_session(conn: &Connection, id: &str) -> Result<Session> {
    conn.query_row("SELECT * FROM sessions WHERE id = ?1", [id], session_from_row)
        .optional()?
        .ok_or_else(|| SessionError::SessionNotFound(id.to_string()))
}

pub(super) fn session_exists(conn: &Connection, id: &str) -> Result<bool> {
    let found: Option<i64> = conn
        .query_row("SELECT 1 FROM sessions WHERE id = ?1", [id], |row| row.get(0))
        .optional()?;
    Ok(found.is_some())
}

/// Validate `update` against `current` and write it; returns false if nothing changed
fn apply_update(conn: &Connection, current: &Session, update: &SessionUpdate) -> Result<bool> {
    let next_status = update.status.unwrap_or(current.status);
    if let Some(status) = update.status {
        current.status.check_transition(status)?;
    }

    let mut sets: Vec<(&'static str, Value)> = Vec::new();

    if let Some(status) = update.status {
        if status != current.status {
            sets.push(("status", Value::Text(status.as_str().to_string())));
        }
    }

    if next_status.is_terminal() {
        if current.completed_at.is_none() || update.completed_at.is_some() {
            sets.push(("completed_at", millis(Some(update.completed_at.unwrap_or_else(now)))));
        }
    } else if update.completed_at.is_some() {
        return Err(SessionError::Validation(format!(
            "completed_at can only be set on a terminal status, session is '{}'",
            next_status
        )));
    }

    if let Some(claude_id) = &update.claude_session_id {
        match &current.claude_session_id {
            Some(existing) if existing != claude_id => {
                return Err(SessionError::Validation(format!(
                    "claude_session_id is immutable (already '{}')",
                    existing
                )));
            }
            Some(_) => {}
            None => sets.push(("claude_session_id", Value::Text(claude_id.clone()))),
        }
    }

    let texts: [(&'static str, &Option<String>); 7] = [
        ("query", &update.query),
        ("summary", &update.summary),
        ("title", &update.title),
        ("model", &update.model),
        ("model_id", &update.model_id),
        ("result_content", &update.result_content),
        ("error_message", &update.error_message),
    ];
    for (column, value) in texts {
        if value.is_some() {
            sets.push((column, text(value)));
        }
    }

    let ints: [(&'static str, Option<i64>); 7] = [
        ("duration_ms", update.duration_ms),
        ("num_turns", update.num_turns),
        ("input_tokens", update.input_tokens),
        ("output_tokens", update.output_tokens),
        ("cache_creation_input_tokens", update.cache_creation_input_tokens),
        ("cache_read_input_tokens", update.cache_read_input_tokens),
        ("effective_context_tokens", update.effective_context_tokens),
    ];
    for (column, value) in ints {
        if value.is_some() {
            sets.push((column, int(value)));
        }
    }

    if let Some(cost) = update.cost_usd {
        sets.push(("cost_usd", Value::Real(cost)));
    }
    if let Some(at) = update.last_activity_at {
        sets.push(("last_activity_at", millis(Some(at))));
    }

    let flags: [(&'static str, Option<bool>); 4] = [
        ("archived", update.archived),
        ("auto_accept_edits", update.auto_accept_edits),
        ("dangerously_skip_permissions", update.dangerously_skip_permissions),
        ("proxy_enabled", update.proxy_enabled),
    ];
    for (column, value) in flags {
        if let Some(v) = value {
            sets.push((column, flag(v)));
        }
    }

    if let Some(expires) = update.dangerously_skip_permissions_expires_at {
        sets.push(("dangerously_skip_permissions_expires_at", millis(expires)));
    }
    if let Some(timeout) = update.dangerously_skip_permissions_timeout_ms {
        sets.push(("dangerously_skip_permissions_timeout_ms", int(timeout)));
    }

    let clearable: [(&'static str, &Option<Option<String>>); 3] = [
        ("proxy_base_url", &update.proxy_base_url),
        ("proxy_api_key", &update.proxy_api_key),
        ("proxy_model_override", &update.proxy_model_override),
    ];
    for (column, value) in clearable {
        if let Some(v) = value {
            sets.push((column, text(v)));
        }
    }

    if sets.is_empty() {
        return Ok(false);
    }

    let assignments: Vec<String> = sets
        .iter()
        .enumerate()
        .map(|(i, (column, _))| format!("{} = ?{}", column, i + 1))
        .collect();
    let sql = format!(
        "UPDATE sessions SET {} WHERE id = ?{}",
        assignments.join(", "),
        sets.len() + 1
    );
    let mut values: Vec<Value> = sets.into_iter().map(|(_, v)| v).collect();
    values.push(Value::Text(current.id.clone()));

    let rows = conn.execute(&sql, params_from_iter(values))?;
    if rows == 0 {
        return Err(SessionError::SessionNotFound(current.id.clone()));
    }
    Ok(true)
}

impl SqliteStore {
    /// Insert a new session row
    pub fn create_session(&self, session: &Session) -> Result<()> {
        if session.status.is_terminal() != session.completed_at.is_some() {
            return Err(SessionError::Validation(format!(
                "completed_at must be set iff status is terminal (status '{}')",
                session.status
            )));
        }

        let mut conn = self.conn()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        if let Some(parent) = &session.parent_session_id {
            if !session_exists(&tx, parent)? {
                return Err(SessionError::SessionNotFound(parent.clone()));
            }
        }

        let placeholders: Vec<String> = (1..=INSERT_COLUMNS.len()).map(|i| format!("?{i}")).collect();
        let sql = format!(
            "INSERT INTO sessions ({}) VALUES ({})",
            INSERT_COLUMNS.join(", "),
            placeholders.join(", ")
        );
        let values: Vec<Value> = vec![
            Value::Text(session.id.clone()),
            Value::Text(session.run_id.clone()),
            text(&session.claude_session_id),
            text(&session.parent_session_id),
            Value::Text(session.status.as_str().to_string()),
            Value::Text(session.query.clone()),
            Value::Text(session.summary.clone()),
            text(&session.title),
            text(&session.model),
            text(&session.model_id),
            Value::Text(session.working_dir.clone()),
            int(session.max_turns),
            text(&session.system_prompt),
            text(&session.append_system_prompt),
            text(&session.custom_instructions),
            text(&session.permission_prompt_tool),
            text(&to_json_list(&session.allowed_tools)?),
            text(&to_json_list(&session.disallowed_tools)?),
            text(&to_json_list(&session.additional_directories)?),
            millis(Some(session.created_at)),
            millis(Some(session.last_activity_at)),
            millis(session.completed_at),
            session.cost_usd.map_or(Value::Null, Value::Real),
            int(session.duration_ms),
            int(session.num_turns),
            text(&session.result_content),
            text(&session.error_message),
            int(session.input_tokens),
            int(session.output_tokens),
            int(session.cache_creation_input_tokens),
            int(session.cache_read_input_tokens),
            int(session.effective_context_tokens),
            flag(session.archived),
            flag(session.auto_accept_edits),
            flag(session.dangerously_skip_permissions),
            millis(session.dangerously_skip_permissions_expires_at),
            int(session.dangerously_skip_permissions_timeout_ms),
            flag(session.proxy.enabled),
            text(&session.proxy.base_url),
            text(&session.proxy.api_key),
            text(&session.proxy.model_override),
        ];

        tx.execute(&sql, params_from_iter(values)).map_err(|e| {
            on_constraint(e, || {
                SessionError::Validation(format!(
                    "session '{}' or run id '{}' already exists",
                    session.id, session.run_id
                ))
            })
        })?;
        tx.commit()?;

        tracing::debug!(session_id = %session.id, run_id = %session.run_id, status = %session.status, "Session created");
        Ok(())
    }

    /// Fetch a session by id
    pub fn get_session(&self, id: &str) -> Result<Session> {
        let conn = self.conn()?;
        load_session(&conn, id)
    }

    /// Fetch a session by its run id
    pub fn get_session_by_run_id(&self, run_id: &str) -> Result<Session> {
        let conn = self.conn()?;
        conn.query_row(
            "SELECT * FROM sessions WHERE run_id = ?1",
            [run_id],
            session_from_row,
        )
        .optional()?
        .ok_or_else(|| SessionError::SessionNotFound(format!("run_id {}", run_id)))
    }

    /// Fetch the most recent session carrying an agent-assigned id
    pub fn get_session_by_claude_id(&self, claude_session_id: &str) -> Result<Session> {
        let conn = self.conn()?;
        conn.query_row(
            "SELECT * FROM sessions WHERE claude_session_id = ?1
             ORDER BY created_at DESC LIMIT 1",
            [claude_session_id],
            session_from_row,
        )
        .optional()?
        .ok_or_else(|| {
            SessionError::SessionNotFound(format!("claude_session_id {}", claude_session_id))
        })
    }

    /// Apply a partial patch, validating any status transition
    pub fn update_session(&self, id: &str, update: &SessionUpdate) -> Result<SessionChange> {
        let mut conn = self.conn()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let current = load_session(&tx, id)?;
        apply_update(&tx, &current, update)?;
        let session = load_session(&tx, id)?;
        tx.commit()?;
        Ok(SessionChange {
            previous_status: current.status,
            session,
        })
    }

    /// Apply a patch only while the session is in one of `expected`
    ///
    /// Returns `None` without writing when the current status does not match,
    /// so callers can race the owning supervisor safely.
    pub fn update_session_if(
        &self,
        id: &str,
        expected: &[SessionStatus],
        update: &SessionUpdate,
    ) -> Result<Option<SessionChange>> {
        let mut conn = self.conn()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let current = load_session(&tx, id)?;
        if !expected.contains(&current.status) {
            return Ok(None);
        }
        apply_update(&tx, &current, update)?;
        let session = load_session(&tx, id)?;
        tx.commit()?;
        Ok(Some(SessionChange {
            previous_status: current.status,
            session,
        }))
    }

    /// List sessions, most recently active first
    pub fn list_sessions(&self, filter: &SessionFilter) -> Result<Vec<Session>> {
        let mut sql = String::from("SELECT s.* FROM sessions s WHERE 1 = 1");
        let mut values: Vec<Value> = Vec::new();

        if filter.archived_only {
            sql.push_str(" AND s.archived = 1");
        } else if !filter.include_archived {
            sql.push_str(" AND s.archived = 0");
        }
        if filter.leaves_only {
            sql.push_str(
                " AND NOT EXISTS (SELECT 1 FROM sessions c WHERE c.parent_session_id = s.id)",
            );
        }
        if let Some(status) = filter.status {
            values.push(Value::Text(status.as_str().to_string()));
            sql.push_str(&format!(" AND s.status = ?{}", values.len()));
        }
        sql.push_str(" ORDER BY s.last_activity_at DESC, s.created_at DESC");

        let conn = self.conn()?;
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(params_from_iter(values), session_from_row)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    /// Sessions whose status is any of `statuses`
    pub fn list_sessions_by_status(&self, statuses: &[SessionStatus]) -> Result<Vec<Session>> {
        if statuses.is_empty() {
            return Ok(Vec::new());
        }
        let placeholders: Vec<String> = (1..=statuses.len()).map(|i| format!("?{i}")).collect();
        let sql = format!(
            "SELECT * FROM sessions WHERE status IN ({}) ORDER BY created_at",
            placeholders.join(", ")
        );
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(
            params_from_iter(statuses.iter().map(|s| s.as_str())),
            session_from_row,
        )?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    /// Move every session in an active status to `failed` in one transaction
    pub fn fail_active_sessions(&self, message: &str) -> Result<Vec<SessionChange>> {
        let mut conn = self.conn()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let active: Vec<Session> = {
            let mut stmt = tx.prepare(
                "SELECT * FROM sessions
                 WHERE status IN ('starting', 'running', 'waiting_input', 'interrupting')",
            )?;
            let rows = stmt.query_map([], session_from_row)?;
            rows.collect::<rusqlite::Result<Vec<_>>>()?
        };

        let mut changes = Vec::with_capacity(active.len());
        for current in active {
            apply_update(&tx, &current, &SessionUpdate::failed(message))?;
            changes.push(SessionChange {
                previous_status: current.status,
                session: load_session(&tx, &current.id)?,
            });
        }
        tx.commit()?;
        Ok(changes)
    }

    /// Distinct working directories by most recent use, with usage counts
    pub fn recent_working_dirs(&self, limit: Option<usize>) -> Result<Vec<RecentPath>> {
        let limit = limit.filter(|l| *l > 0).unwrap_or(DEFAULT_RECENT_PATHS);
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT working_dir, MAX(last_activity_at) AS last_used, COUNT(*) AS usage_count
             FROM sessions
             WHERE working_dir != '' AND working_dir != '.'
             GROUP BY working_dir
             ORDER BY last_used DESC
             LIMIT ?1",
        )?;
        let rows = stmt.query_map(params![limit as i64], |row| {
            Ok(RecentPath {
                path: row.get("working_dir")?,
                last_used: timestamp(row, "last_used")?,
                usage_count: row.get::<_, i64>("usage_count")? as u64,
            })
        })?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }
}
