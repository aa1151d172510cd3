//! Cross-component invariants
//!
//! Sequence monotonicity, terminal stickiness, approval/event agreement,
//! bus isolation, crash recovery, and the agent environment allowlist.

mod common;

use a3s_session::config::DEFAULT_ENV_ALLOWLIST;
use a3s_session::types::NewConversationEvent;
use a3s_session::{
    ApprovalStatus, BusEvent, Decision, EventApprovalStatus, EventBus, LaunchRequest,
    SessionError, SessionManager, SessionStatus, SessionUpdate, SqliteStore, SubscriptionFilter,
};
use common::*;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

// ─── Store ───────────────────────────────────────────────────────

#[tokio::test]
async fn test_sequences_are_gapless_under_interleaving() {
    let store = Arc::new(SqliteStore::open_in_memory().unwrap());
    let mut sessions = Vec::new();
    for _ in 0..3 {
        let session = a3s_session::Session::new("q", "/w").with_status(SessionStatus::Running);
        store.create_session(&session).unwrap();
        sessions.push(session.id);
    }

    let mut tasks = Vec::new();
    for id in &sessions {
        let store = store.clone();
        let id = id.clone();
        tasks.push(tokio::spawn(async move {
            for i in 0..25 {
                store
                    .append_event(&NewConversationEvent::message(&id, "assistant", format!("m{i}")))
                    .unwrap();
                tokio::task::yield_now().await;
            }
        }));
    }
    for task in tasks {
        task.await.unwrap();
    }

    for id in &sessions {
        let log = store.get_conversation(id).unwrap();
        let sequences: Vec<i64> = log.iter().map(|e| e.sequence).collect();
        assert_eq!(sequences, (1..=25).collect::<Vec<_>>());
    }
}

#[tokio::test]
async fn test_terminal_status_is_sticky() {
    let h = Harness::new();
    let session = h
        .manager
        .launch(LaunchRequest::new("q", h.working_dir()))
        .unwrap();
    let mut agent = h.launcher.next_agent().await;
    agent.send(init("c-1", "claude-opus-4"));
    agent.send(result("c-1", false));
    agent.finish(0);
    assert_eq!(
        h.manager.wait(&session.id).await,
        Some(SessionStatus::Completed)
    );
    let settled = h.store.get_session(&session.id).unwrap();

    for next in [
        SessionStatus::Running,
        SessionStatus::Failed,
        SessionStatus::Interrupted,
        SessionStatus::Completed,
    ] {
        let err = h
            .store
            .update_session(&session.id, &SessionUpdate::status(next))
            .unwrap_err();
        assert!(matches!(err, SessionError::InvalidTransition { .. }));
    }
    assert_eq!(h.store.get_session(&session.id).unwrap(), settled);
}

// ─── Approvals ───────────────────────────────────────────────────

#[tokio::test]
async fn test_approval_event_bijection() {
    let h = Harness::new();
    let session = h
        .manager
        .launch(LaunchRequest::new("q", h.working_dir()))
        .unwrap();
    let mut agent = h.launcher.next_agent().await;
    agent.send(init("c-2", "claude-opus-4"));
    for (id, tool) in [("t1", "bash"), ("t2", "bash"), ("t3", "Read"), ("t4", "bash")] {
        agent.send(tool_use("c-2", id, tool, json!({"n": id})));
    }
    eventually("tool calls", || {
        h.store.get_tool_call(&session.id, "t4").unwrap().is_some()
    })
    .await;

    let approvals = h.manager.approvals();
    let mut created = Vec::new();
    for tool in ["bash", "bash", "Read", "bash"] {
        created.push(
            approvals
                .create(&session.run_id, tool, json!({}))
                .await
                .unwrap(),
        );
    }
    // Each approval binds to a distinct call, oldest first per tool
    let bound: Vec<String> = ["t1", "t2", "t3", "t4"]
        .iter()
        .map(|t| h.tool_event(&session.id, t).approval_id.unwrap())
        .collect();
    assert_eq!(bound[0], created[0].id);
    assert_eq!(bound[1], created[1].id);
    assert_eq!(bound[2], created[2].id);
    assert_eq!(bound[3], created[3].id);

    approvals
        .decide(&created[0].id, Decision::Approve, None)
        .await
        .unwrap();
    approvals
        .decide(&created[1].id, Decision::Deny, Some("no"))
        .await
        .unwrap();
    approvals
        .decide(&created[2].id, Decision::Approve, Some("fine"))
        .await
        .unwrap();

    for tool_id in ["t1", "t2", "t3", "t4"] {
        let event = h.tool_event(&session.id, tool_id);
        let approval = approvals.get(event.approval_id.as_deref().unwrap()).unwrap();
        assert_eq!(event.approval_status, Some(EventApprovalStatus::from(approval.status)));
    }
    assert_eq!(
        h.store.get_session(&session.id).unwrap().status,
        SessionStatus::WaitingInput
    );

    approvals
        .decide(&created[3].id, Decision::Approve, None)
        .await
        .unwrap();
    assert_eq!(
        h.store.get_session(&session.id).unwrap().status,
        SessionStatus::Running
    );
    agent.finish(0);
}

#[tokio::test]
async fn test_second_decide_fails_and_preserves_row() {
    let h = Harness::new();
    let session = h
        .manager
        .launch(LaunchRequest::new("q", h.working_dir()))
        .unwrap();
    let mut agent = h.launcher.next_agent().await;

    let approvals = h.manager.approvals();
    let approval = approvals
        .create(&session.run_id, "bash", json!({"cmd": "ls"}))
        .await
        .unwrap();
    let first = approvals
        .decide(&approval.id, Decision::Deny, Some("nope"))
        .await
        .unwrap();

    for decision in [Decision::Approve, Decision::Deny] {
        let err = approvals
            .decide(&approval.id, decision, Some("again"))
            .await
            .unwrap_err();
        assert!(matches!(err, SessionError::AlreadyDecided(_)));
    }
    let stored = approvals.get(&approval.id).unwrap();
    assert_eq!(stored, first);
    assert_eq!(stored.status, ApprovalStatus::Denied);

    let err = approvals
        .decide("local-missing", Decision::Approve, None)
        .await
        .unwrap_err();
    assert!(matches!(err, SessionError::NotFound(_)));
    let err = approvals
        .create("no-such-run", "bash", json!({}))
        .await
        .unwrap_err();
    assert!(matches!(err, SessionError::SessionNotFound(_)));
    agent.finish(0);
}

// ─── Bus ─────────────────────────────────────────────────────────

#[tokio::test]
async fn test_stalled_subscriber_does_not_delay_others() {
    let bus = EventBus::new(4);
    let _stalled = bus.subscribe(SubscriptionFilter::default(), CancellationToken::new());
    let mut reader = bus.subscribe(SubscriptionFilter::default(), CancellationToken::new());

    for i in 0..200 {
        bus.publish(BusEvent::conversation_updated(&format!("s{i}"), "r"));
        let event = tokio::time::timeout(Duration::from_millis(100), reader.recv())
            .await
            .expect("reader starved")
            .expect("subscription closed");
        assert_eq!(event.session_id(), Some(format!("s{i}").as_str()));
    }
    assert_eq!(bus.dropped_count(), 196);
    assert_eq!(bus.subscriber_count(), 2);
}

// ─── Recovery ────────────────────────────────────────────────────

#[tokio::test]
async fn test_recovery_after_crash() {
    let dir = tempfile::TempDir::new().unwrap();
    let path = dir.path().join("daemon.db");

    let mut expected = Vec::new();
    {
        let store = SqliteStore::open(&path).unwrap();
        for status in [
            SessionStatus::Draft,
            SessionStatus::Starting,
            SessionStatus::Running,
            SessionStatus::WaitingInput,
            SessionStatus::Interrupting,
            SessionStatus::Completed,
            SessionStatus::Interrupted,
            SessionStatus::Discarded,
        ] {
            let mut session = a3s_session::Session::new("q", "/w").with_status(status);
            if status.is_terminal() {
                session.completed_at = Some(session.created_at);
            }
            store.create_session(&session).unwrap();
            let after = if status.is_active() {
                SessionStatus::Failed
            } else {
                status
            };
            expected.push((session.id, after));
        }
        // Dropped without shutdown
    }

    let config = Arc::new(a3s_session::DaemonConfig::with_database(&path));
    let store = Arc::new(SqliteStore::open(&path).unwrap());
    let manager = SessionManager::new(
        store.clone(),
        EventBus::default(),
        config,
        Arc::new(ScriptedLauncher::new()),
    );
    assert_eq!(manager.recover().unwrap(), 4);

    for (id, status) in expected {
        let session = store.get_session(&id).unwrap();
        assert_eq!(session.status, status, "session {id}");
        if status == SessionStatus::Failed {
            assert_eq!(
                session.error_message.as_deref(),
                Some("daemon restarted while session was active")
            );
            assert!(session.completed_at.is_some());
        }
    }
    assert_eq!(manager.recover().unwrap(), 0);
}

// ─── Environment ─────────────────────────────────────────────────

#[tokio::test]
async fn test_agent_environment_is_allowlisted() {
    let h = Harness::new();
    let session = h
        .manager
        .launch(LaunchRequest::new("q", h.working_dir()))
        .unwrap();
    let mut agent = h.launcher.next_agent().await;

    let env = &agent.spec.env;
    assert!(env
        .iter()
        .all(|(key, _)| DEFAULT_ENV_ALLOWLIST.contains(&key.as_str())));
    let term: Vec<&str> = env
        .iter()
        .filter(|(key, _)| key == "TERM")
        .map(|(_, value)| value.as_str())
        .collect();
    assert_eq!(term.len(), 1);
    assert!(!term[0].is_empty());
    assert_eq!(agent.spec.session_id, session.id);
    assert_eq!(agent.spec.run_id, session.run_id);
    agent.finish(0);
}

#[cfg(unix)]
#[tokio::test]
async fn test_launch_with_non_utf8_daemon_environment() {
    use std::ffi::OsStr;
    use std::os::unix::ffi::OsStrExt;

    let name = "A3S_SESSION_TEST_NON_UTF8";
    std::env::set_var(name, OsStr::from_bytes(b"\xff\xfe"));

    let h = Harness::new();
    let launched = h
        .manager
        .launch(LaunchRequest::new("q", h.working_dir()));
    let session = launched.unwrap();
    let mut agent = h.launcher.next_agent().await;
    std::env::remove_var(name);

    assert!(agent.spec.env.iter().all(|(key, _)| key != name));
    assert!(agent.spec.env.iter().any(|(key, _)| key == "TERM"));
    agent.send(init("c-env", "claude-sonnet-4"));
    agent.send(result("c-env", false));
    agent.finish(0);
    assert_eq!(
        h.manager.wait(&session.id).await,
        Some(SessionStatus::Completed)
    );
}
