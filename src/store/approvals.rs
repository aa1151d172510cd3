use super::conversation::{find_uncorrelated_tool_call, load_event, set_event_approval_status, stamp_event};
use super::sessions::session_exists;
use super::{enum_column, on_constraint, opt_timestamp, timestamp, SqliteStore};
use crate::error::{Result, SessionError};
use crate::types::{now, Approval, ApprovalMetrics, ApprovalStatus, ConversationEventType};
use chrono::{DateTime, Utc};
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension, Row, TransactionBehavior};

fn approval_from_row(row: &Row<'_>) -> rusqlite::Result<Approval> {
    let idx = row.as_ref().column_index("tool_input")?;
    let raw: Vec<u8> = row.get(idx)?;
    let tool_input = serde_json::from_slice(&raw)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Blob, Box::new(e)))?;
    Ok(Approval {
        id: row.get("id")?,
        run_id: row.get("run_id")?,
        session_id: row.get("session_id")?,
        status: enum_column(row, "status")?,
        tool_name: row.get("tool_name")?,
        tool_input,
        comment: row.get("comment")?,
        created_at: timestamp(row, "created_at")?,
        responded_at: opt_timestamp(row, "responded_at")?,
    })
}

fn load_approval(conn: &Connection, id: &str) -> Result<Approval> {
    conn.query_row("SELECT * FROM approvals WHERE id = ?1", [id], approval_from_row)
        .optional()?
        .ok_or_else(|| SessionError::NotFound(format!("approval {}", id)))
}

fn query_approvals(
    conn: &Connection,
    sql: &str,
    params: impl rusqlite::Params,
) -> Result<Vec<Approval>> {
    let mut stmt = conn.prepare(sql)?;
    let rows = stmt.query_map(params, approval_from_row)?;
    Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
}

/// Write a decision onto a pending approval and its correlated event
fn record_decision(
    conn: &Connection,
    id: &str,
    status: ApprovalStatus,
    comment: Option<&str>,
) -> Result<Approval> {
    if status == ApprovalStatus::Pending {
        return Err(SessionError::Validation(
            "a decision must approve or deny".into(),
        ));
    }
    let current = load_approval(conn, id)?;
    if !current.is_pending() {
        return Err(SessionError::AlreadyDecided(id.to_string()));
    }

    let responded_at = now();
    conn.execute(
        "UPDATE approvals SET status = ?2, comment = ?3, responded_at = ?4
         WHERE id = ?1 AND status = 'pending'",
        params![id, status.as_str(), comment, responded_at.timestamp_millis()],
    )?;
    set_event_approval_status(conn, id, status.into())?;

    Ok(Approval {
        status,
        comment: comment.map(str::to_string),
        responded_at: Some(responded_at),
        ..current
    })
}

impl SqliteStore {
    /// Insert an approval and bind it to the oldest uncorrelated tool call
    ///
    /// Returns the id of the event it was bound to, if any. Both writes
    /// happen in one transaction.
    pub fn insert_approval(&self, approval: &Approval) -> Result<Option<i64>> {
        let mut conn = self.conn()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        if !session_exists(&tx, &approval.session_id)? {
            return Err(SessionError::SessionNotFound(approval.session_id.clone()));
        }

        let tool_input = serde_json::to_vec(&approval.tool_input)?;
        tx.execute(
            "INSERT INTO approvals (
                id, run_id, session_id, status, tool_name, tool_input,
                comment, created_at, responded_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                approval.id,
                approval.run_id,
                approval.session_id,
                approval.status.as_str(),
                approval.tool_name,
                tool_input,
                approval.comment,
                approval.created_at.timestamp_millis(),
                approval.responded_at.map(|t| t.timestamp_millis()),
            ],
        )
        .map_err(|e| {
            on_constraint(e, || {
                SessionError::Validation(format!(
                    "approval '{}' violates a store constraint",
                    approval.id
                ))
            })
        })?;

        let event_id =
            match find_uncorrelated_tool_call(&tx, &approval.session_id, &approval.tool_name)? {
                Some(event) => {
                    stamp_event(&tx, event.id, &approval.id, approval.status.into())?;
                    Some(event.id)
                }
                None => None,
            };

        tx.commit()?;
        Ok(event_id)
    }

    /// Bind a freshly written tool-use event to an approval that arrived first
    ///
    /// Picks the oldest approval for the event's session and tool that no
    /// event references yet, copying its current status onto the event.
    pub fn correlate_on_write(&self, event_id: i64) -> Result<Option<Approval>> {
        let mut conn = self.conn()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let event = load_event(&tx, event_id)?;
        let tool_name = match (&event.event_type, &event.tool_name, &event.approval_id) {
            (ConversationEventType::ToolUse, Some(name), None) => name.clone(),
            _ => return Ok(None),
        };

        let approval = tx
            .query_row(
                "SELECT * FROM approvals a
                 WHERE a.session_id = ?1 AND a.tool_name = ?2
                   AND NOT EXISTS (
                       SELECT 1 FROM conversation_events e WHERE e.approval_id = a.id
                   )
                 ORDER BY a.created_at ASC, a.rowid ASC
                 LIMIT 1",
                params![event.session_id, tool_name],
                approval_from_row,
            )
            .optional()?;

        if let Some(approval) = &approval {
            stamp_event(&tx, event.id, &approval.id, approval.status.into())?;
        }
        tx.commit()?;
        Ok(approval)
    }

    pub fn get_approval(&self, id: &str) -> Result<Approval> {
        let conn = self.conn()?;
        load_approval(&conn, id)
    }

    /// Pending approvals, oldest first, optionally scoped to one session
    pub fn list_pending_approvals(&self, session_id: Option<&str>) -> Result<Vec<Approval>> {
        let conn = self.conn()?;
        match session_id {
            Some(id) => query_approvals(
                &conn,
                "SELECT * FROM approvals WHERE status = 'pending' AND session_id = ?1
                 ORDER BY created_at ASC, rowid ASC",
                [id],
            ),
            None => query_approvals(
                &conn,
                "SELECT * FROM approvals WHERE status = 'pending'
                 ORDER BY created_at ASC, rowid ASC",
                [],
            ),
        }
    }

    /// Every approval of a session, oldest first
    pub fn list_approvals(&self, session_id: &str) -> Result<Vec<Approval>> {
        let conn = self.conn()?;
        query_approvals(
            &conn,
            "SELECT * FROM approvals WHERE session_id = ?1 ORDER BY created_at ASC, rowid ASC",
            [session_id],
        )
    }

    pub fn count_pending_approvals(&self, session_id: &str) -> Result<u64> {
        let conn = self.conn()?;
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM approvals WHERE session_id = ?1 AND status = 'pending'",
            [session_id],
            |row| row.get(0),
        )?;
        Ok(count as u64)
    }

    /// Record a decision on a pending approval
    ///
    /// The approval row and its correlated event change together or not at
    /// all. Deciding twice yields `AlreadyDecided`.
    pub fn decide_approval(
        &self,
        id: &str,
        status: ApprovalStatus,
        comment: Option<&str>,
    ) -> Result<Approval> {
        let mut conn = self.conn()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let decided = record_decision(&tx, id, status, comment)?;
        tx.commit()?;
        Ok(decided)
    }

    /// Approve every pending approval of a session in one transaction
    pub fn approve_all_pending(&self, session_id: &str, comment: &str) -> Result<Vec<Approval>> {
        let mut conn = self.conn()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let pending = query_approvals(
            &tx,
            "SELECT * FROM approvals WHERE session_id = ?1 AND status = 'pending'
             ORDER BY created_at ASC, rowid ASC",
            [session_id],
        )?;
        let mut decided = Vec::with_capacity(pending.len());
        for approval in pending {
            decided.push(record_decision(
                &tx,
                &approval.id,
                ApprovalStatus::Approved,
                Some(comment),
            )?);
        }
        tx.commit()?;
        Ok(decided)
    }

    /// Pending approvals created before `cutoff` that no event references
    pub fn orphaned_approvals(&self, cutoff: DateTime<Utc>) -> Result<Vec<Approval>> {
        let conn = self.conn()?;
        query_approvals(
            &conn,
            "SELECT * FROM approvals a
             WHERE a.status = 'pending' AND a.created_at < ?1
               AND NOT EXISTS (
                   SELECT 1 FROM conversation_events e WHERE e.approval_id = a.id
               )
             ORDER BY a.created_at ASC, a.rowid ASC",
            [cutoff.timestamp_millis()],
        )
    }

    /// Pending, correlated, and orphaned counts
    pub fn approval_metrics(&self, orphan_cutoff: DateTime<Utc>) -> Result<ApprovalMetrics> {
        let conn = self.conn()?;
        let (pending, correlated, orphaned): (i64, i64, i64) = conn.query_row(
            "SELECT
                COUNT(*),
                COALESCE(SUM(bound), 0),
                COALESCE(SUM(CASE WHEN bound = 0 AND created_at < ?1 THEN 1 ELSE 0 END), 0)
             FROM (
                SELECT a.created_at,
                       EXISTS (
                           SELECT 1 FROM conversation_events e WHERE e.approval_id = a.id
                       ) AS bound
                FROM approvals a
                WHERE a.status = 'pending'
             )",
            [orphan_cutoff.timestamp_millis()],
            |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
        )?;
        Ok(ApprovalMetrics {
            pending: pending as u64,
            correlated: correlated as u64,
            orphaned: orphaned as u64,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{EventApprovalStatus, NewConversationEvent, Session, SessionStatus};
    use serde_json::json;

    fn setup() -> (SqliteStore, Session) {
        let store = SqliteStore::open_in_memory().unwrap();
        let session = Session::new("q", "/w").with_status(SessionStatus::Running);
        store.create_session(&session).unwrap();
        (store, session)
    }

    fn tool_use(store: &SqliteStore, session: &Session, id: &str, name: &str) -> i64 {
        store
            .append_event(&NewConversationEvent::tool_use(&session.id, id, name, "{}"))
            .unwrap()
            .id
    }

    #[test]
    fn test_insert_correlates_oldest_tool_call() {
        let (store, session) = setup();
        let first = tool_use(&store, &session, "t1", "bash");
        tool_use(&store, &session, "t2", "bash");

        let approval = Approval::new(&session.run_id, &session.id, "bash", json!({"cmd": "ls"}));
        assert_eq!(store.insert_approval(&approval).unwrap(), Some(first));

        let event = store.get_event(first).unwrap();
        assert_eq!(event.approval_id.as_deref(), Some(approval.id.as_str()));
        assert_eq!(event.approval_status, Some(EventApprovalStatus::Pending));
        assert_eq!(store.get_approval(&approval.id).unwrap(), approval);
    }

    #[test]
    fn test_insert_without_tool_call_stays_uncorrelated() {
        let (store, session) = setup();
        let approval = Approval::new(&session.run_id, &session.id, "bash", json!({}));
        assert_eq!(store.insert_approval(&approval).unwrap(), None);
        assert_eq!(store.list_pending_approvals(Some(&session.id)).unwrap().len(), 1);
    }

    #[test]
    fn test_insert_missing_session() {
        let store = SqliteStore::open_in_memory().unwrap();
        let approval = Approval::new("run", "ghost", "bash", json!({}));
        assert!(matches!(
            store.insert_approval(&approval),
            Err(SessionError::SessionNotFound(_))
        ));
    }

    #[test]
    fn test_correlate_on_write_binds_early_approval() {
        let (store, session) = setup();
        let approval = Approval::new(&session.run_id, &session.id, "Edit", json!({}));
        store.insert_approval(&approval).unwrap();

        let event_id = tool_use(&store, &session, "t1", "Edit");
        let bound = store.correlate_on_write(event_id).unwrap().unwrap();
        assert_eq!(bound.id, approval.id);
        assert_eq!(
            store.get_event(event_id).unwrap().approval_id.as_deref(),
            Some(approval.id.as_str())
        );

        let second = tool_use(&store, &session, "t2", "Edit");
        assert!(store.correlate_on_write(second).unwrap().is_none());
    }

    #[test]
    fn test_correlate_on_write_copies_decided_status() {
        let (store, session) = setup();
        let approval = Approval::new(&session.run_id, &session.id, "bash", json!({}))
            .auto_approved("auto");
        store.insert_approval(&approval).unwrap();

        let event_id = tool_use(&store, &session, "t1", "bash");
        store.correlate_on_write(event_id).unwrap();
        assert_eq!(
            store.get_event(event_id).unwrap().approval_status,
            Some(EventApprovalStatus::Approved)
        );
    }

    #[test]
    fn test_decide_updates_event_atomically() {
        let (store, session) = setup();
        let event_id = tool_use(&store, &session, "t1", "bash");
        let approval = Approval::new(&session.run_id, &session.id, "bash", json!({}));
        store.insert_approval(&approval).unwrap();

        let decided = store
            .decide_approval(&approval.id, ApprovalStatus::Denied, Some("no"))
            .unwrap();
        assert_eq!(decided.status, ApprovalStatus::Denied);
        assert_eq!(decided.comment.as_deref(), Some("no"));
        assert!(decided.responded_at.is_some());
        assert_eq!(store.get_approval(&approval.id).unwrap(), decided);
        assert_eq!(
            store.get_event(event_id).unwrap().approval_status,
            Some(EventApprovalStatus::Denied)
        );
    }

    #[test]
    fn test_decide_twice_rejected() {
        let (store, session) = setup();
        let approval = Approval::new(&session.run_id, &session.id, "bash", json!({}));
        store.insert_approval(&approval).unwrap();
        store
            .decide_approval(&approval.id, ApprovalStatus::Approved, None)
            .unwrap();
        assert!(matches!(
            store.decide_approval(&approval.id, ApprovalStatus::Denied, None),
            Err(SessionError::AlreadyDecided(_))
        ));
        assert!(matches!(
            store.decide_approval("local-missing", ApprovalStatus::Approved, None),
            Err(SessionError::NotFound(_))
        ));
    }

    #[test]
    fn test_approve_all_pending() {
        let (store, session) = setup();
        for _ in 0..3 {
            store
                .insert_approval(&Approval::new(&session.run_id, &session.id, "bash", json!({})))
                .unwrap();
        }
        let decided = store.approve_all_pending(&session.id, "bulk").unwrap();
        assert_eq!(decided.len(), 3);
        assert_eq!(store.count_pending_approvals(&session.id).unwrap(), 0);
        assert_eq!(store.list_approvals(&session.id).unwrap().len(), 3);
    }

    #[test]
    fn test_orphans_and_metrics() {
        let (store, session) = setup();
        tool_use(&store, &session, "t1", "bash");
        let bound = Approval::new(&session.run_id, &session.id, "bash", json!({}));
        store.insert_approval(&bound).unwrap();

        let mut old = Approval::new(&session.run_id, &session.id, "Write", json!({}));
        old.created_at = now() - chrono::Duration::minutes(10);
        store.insert_approval(&old).unwrap();

        let fresh = Approval::new(&session.run_id, &session.id, "Read", json!({}));
        store.insert_approval(&fresh).unwrap();

        let cutoff = now() - chrono::Duration::minutes(5);
        let orphans = store.orphaned_approvals(cutoff).unwrap();
        assert_eq!(orphans.len(), 1);
        assert_eq!(orphans[0].id, old.id);

        let metrics = store.approval_metrics(cutoff).unwrap();
        assert_eq!(
            metrics,
            ApprovalMetrics {
                pending: 3,
                correlated: 1,
                orphaned: 1
            }
        );
    }
}
