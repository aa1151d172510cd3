use super::sessions::session_exists;
use super::{enum_column, on_constraint, opt_enum_column, timestamp, SqliteStore};
use crate::error::{Result, SessionError};
use crate::types::{
    now, ConversationEvent, ConversationEventType, EventApprovalStatus, NewConversationEvent,
};
use rusqlite::{params, Connection, OptionalExtension, Row, TransactionBehavior};

pub(super) fn event_from_row(row: &Row<'_>) -> rusqlite::Result<ConversationEvent> {
    Ok(ConversationEvent {
        id: row.get("id")?,
        session_id: row.get("session_id")?,
        claude_session_id: row.get("claude_session_id")?,
        sequence: row.get("sequence")?,
        event_type: enum_column(row, "event_type")?,
        created_at: timestamp(row, "created_at")?,
        role: row.get("role")?,
        content: row.get("content")?,
        tool_id: row.get("tool_id")?,
        tool_name: row.get("tool_name")?,
        tool_input_json: row.get("tool_input_json")?,
        parent_tool_use_id: row.get("parent_tool_use_id")?,
        tool_result_for_id: row.get("tool_result_for_id")?,
        tool_result_content: row.get("tool_result_content")?,
        is_completed: row.get("is_completed")?,
        approval_status: opt_enum_column(row, "approval_status")?,
        approval_id: row.get("approval_id")?,
    })
}

pub(super) fn load_event(conn: &Connection, id: i64) -> Result<ConversationEvent> {
    conn.query_row(
        "SELECT * FROM conversation_events WHERE id = ?1",
        [id],
        event_from_row,
    )
    .optional()?
    .ok_or_else(|| SessionError::NotFound(format!("conversation event {}", id)))
}

/// Oldest tool-use event for `(session_id, tool_name)` with no approval attached
pub(super) fn find_uncorrelated_tool_call(
    conn: &Connection,
    session_id: &str,
    tool_name: &str,
) -> Result<Option<ConversationEvent>> {
    Ok(conn
        .query_row(
            "SELECT * FROM conversation_events
             WHERE session_id = ?1
               AND event_type = 'tool_use'
               AND tool_name = ?2
               AND approval_status IS NULL
               AND approval_id IS NULL
               AND is_completed = 0
             ORDER BY sequence ASC
             LIMIT 1",
            params![session_id, tool_name],
            event_from_row,
        )
        .optional()?)
}

/// Attach an approval to a tool-use event
///
/// Succeeds without writing if the event already carries the same approval.
pub(super) fn stamp_event(
    conn: &Connection,
    event_id: i64,
    approval_id: &str,
    status: EventApprovalStatus,
) -> Result<()> {
    let rows = conn.execute(
        "UPDATE conversation_events
         SET approval_status = ?3, approval_id = ?2
         WHERE id = ?1 AND event_type = 'tool_use' AND approval_id IS NULL",
        params![event_id, approval_id, status.as_str()],
    )?;
    if rows == 1 {
        return Ok(());
    }

    let event = load_event(conn, event_id)?;
    match event.approval_id.as_deref() {
        Some(existing) if existing == approval_id => Ok(()),
        Some(existing) => Err(SessionError::Validation(format!(
            "event {} is already correlated with approval '{}'",
            event_id, existing
        ))),
        None => Err(SessionError::Validation(format!(
            "event {} is a '{}' event, not a tool use",
            event_id, event.event_type
        ))),
    }
}

/// Set the approval status on the event carrying `approval_id`
///
/// Terminal values are never reverted; `resolved` only replaces `pending`.
pub(super) fn set_event_approval_status(
    conn: &Connection,
    approval_id: &str,
    status: EventApprovalStatus,
) -> Result<usize> {
    let sql = if status == EventApprovalStatus::Resolved {
        "UPDATE conversation_events SET approval_status = ?2
         WHERE approval_id = ?1 AND approval_status = 'pending'"
    } else {
        "UPDATE conversation_events SET approval_status = ?2
         WHERE approval_id = ?1 AND (approval_status IS NULL OR approval_status = 'pending')"
    };
    Ok(conn.execute(sql, params![approval_id, status.as_str()])?)
}

impl SqliteStore {
    /// Append an event to a session's log, assigning the next sequence
    ///
    /// The session's `last_activity_at` moves to the event time in the same
    /// transaction.
    pub fn append_event(&self, event: &NewConversationEvent) -> Result<ConversationEvent> {
        let mut conn = self.conn()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        if !session_exists(&tx, &event.session_id)? {
            return Err(SessionError::SessionNotFound(event.session_id.clone()));
        }

        if event.event_type == ConversationEventType::ToolResult {
            let for_id = event.tool_result_for_id.as_deref().ok_or_else(|| {
                SessionError::Validation("tool_result requires tool_result_for_id".into())
            })?;
            let known: Option<i64> = tx
                .query_row(
                    "SELECT 1 FROM conversation_events
                     WHERE session_id = ?1 AND event_type = 'tool_use' AND tool_id = ?2
                     LIMIT 1",
                    params![event.session_id, for_id],
                    |row| row.get(0),
                )
                .optional()?;
            if known.is_none() {
                return Err(SessionError::Validation(format!(
                    "tool_result references unknown tool_use '{}'",
                    for_id
                )));
            }
        }

        let sequence: i64 = tx.query_row(
            "SELECT COALESCE(MAX(sequence), 0) + 1 FROM conversation_events WHERE session_id = ?1",
            [&event.session_id],
            |row| row.get(0),
        )?;
        let created_at = now();

        tx.execute(
            "INSERT INTO conversation_events (
                session_id, claude_session_id, sequence, event_type, created_at,
                role, content, tool_id, tool_name, tool_input_json, parent_tool_use_id,
                tool_result_for_id, tool_result_content
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
            params![
                event.session_id,
                event.claude_session_id,
                sequence,
                event.event_type.as_str(),
                created_at.timestamp_millis(),
                event.role,
                event.content,
                event.tool_id,
                event.tool_name,
                event.tool_input_json,
                event.parent_tool_use_id,
                event.tool_result_for_id,
                event.tool_result_content,
            ],
        )
        .map_err(|e| {
            on_constraint(e, || SessionError::DuplicateSequence {
                session_id: event.session_id.clone(),
                sequence,
            })
        })?;
        let id = tx.last_insert_rowid();

        tx.execute(
            "UPDATE sessions SET last_activity_at = ?1 WHERE id = ?2",
            params![created_at.timestamp_millis(), event.session_id],
        )?;
        tx.commit()?;

        Ok(ConversationEvent {
            id,
            session_id: event.session_id.clone(),
            claude_session_id: event.claude_session_id.clone(),
            sequence,
            event_type: event.event_type,
            created_at,
            role: event.role.clone(),
            content: event.content.clone(),
            tool_id: event.tool_id.clone(),
            tool_name: event.tool_name.clone(),
            tool_input_json: event.tool_input_json.clone(),
            parent_tool_use_id: event.parent_tool_use_id.clone(),
            tool_result_for_id: event.tool_result_for_id.clone(),
            tool_result_content: event.tool_result_content.clone(),
            is_completed: false,
            approval_status: None,
            approval_id: None,
        })
    }

    /// A session's full log in sequence order
    pub fn get_conversation(&self, session_id: &str) -> Result<Vec<ConversationEvent>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT * FROM conversation_events WHERE session_id = ?1 ORDER BY sequence ASC",
        )?;
        let rows = stmt.query_map([session_id], event_from_row)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    /// Fetch a single event by id
    pub fn get_event(&self, id: i64) -> Result<ConversationEvent> {
        let conn = self.conn()?;
        load_event(&conn, id)
    }

    /// Oldest tool-use for `(session_id, tool_name)` still awaiting correlation
    pub fn get_uncorrelated_pending_tool_call(
        &self,
        session_id: &str,
        tool_name: &str,
    ) -> Result<Option<ConversationEvent>> {
        let conn = self.conn()?;
        find_uncorrelated_tool_call(&conn, session_id, tool_name)
    }

    /// Stamp a tool-use event with a pending approval id
    pub fn correlate_approval(&self, event_id: i64, approval_id: &str) -> Result<()> {
        let conn = self.conn()?;
        stamp_event(&conn, event_id, approval_id, EventApprovalStatus::Pending)
    }

    /// Set the approval status on the event correlated with `approval_id`
    ///
    /// Returns the number of events updated (0 if uncorrelated).
    pub fn update_event_approval_status(
        &self,
        approval_id: &str,
        status: EventApprovalStatus,
    ) -> Result<usize> {
        let conn = self.conn()?;
        set_event_approval_status(&conn, approval_id, status)
    }

    /// The tool-use event with `tool_id` in a session
    pub fn get_tool_call(
        &self,
        session_id: &str,
        tool_id: &str,
    ) -> Result<Option<ConversationEvent>> {
        let conn = self.conn()?;
        Ok(conn
            .query_row(
                "SELECT * FROM conversation_events
                 WHERE session_id = ?1 AND event_type = 'tool_use' AND tool_id = ?2
                 ORDER BY sequence DESC LIMIT 1",
                params![session_id, tool_id],
                event_from_row,
            )
            .optional()?)
    }

    /// Mark a tool call finished once its result arrives
    pub fn mark_tool_call_completed(&self, session_id: &str, tool_id: &str) -> Result<bool> {
        let conn = self.conn()?;
        let rows = conn.execute(
            "UPDATE conversation_events SET is_completed = 1
             WHERE session_id = ?1 AND event_type = 'tool_use' AND tool_id = ?2",
            params![session_id, tool_id],
        )?;
        Ok(rows > 0)
    }
}
