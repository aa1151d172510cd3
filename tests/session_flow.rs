//! End-to-end session flows
//!
//! Drives launch, ingestion, approvals, interrupt, and continuation through
//! `SessionManager` with a scripted agent standing in for the CLI.

mod common;

use a3s_session::{
    ApprovalStatus, BusEvent, BusEventType, ContinueRequest, ConversationEventType, Decision,
    EventApprovalStatus, EventBus, LaunchRequest, SessionError, SessionFilter, SessionStatus,
    SettingsPatch, SubscriptionFilter,
};
use common::*;
use serde_json::json;
use tokio_util::sync::CancellationToken;

fn status_change(event: &BusEvent, from: SessionStatus, to: SessionStatus) -> bool {
    event.event_type == BusEventType::SessionStatusChanged
        && event.data["old_status"] == from.as_str()
        && event.data["new_status"] == to.as_str()
}

// ─── Approvals ───────────────────────────────────────────────────

#[tokio::test]
async fn test_happy_path_approval() {
    let h = Harness::new();
    let session = h
        .manager
        .launch(LaunchRequest::new("list the files", h.working_dir()))
        .unwrap();
    let mut events = h.manager.subscribe(
        SubscriptionFilter::for_session(&session.id),
        CancellationToken::new(),
    );

    let mut agent = h.launcher.next_agent().await;
    agent.send(init("claude-1", "claude-opus-4-1"));
    agent.send(assistant_text("claude-1", "Let me look."));
    agent.send(tool_use("claude-1", "t1", "bash", json!({"cmd": "ls"})));

    eventually("tool call t1", || {
        h.store.get_tool_call(&session.id, "t1").unwrap().is_some()
    })
    .await;
    assert_eq!(
        h.manager.get_session(&session.id).unwrap().status,
        SessionStatus::Running
    );
    drain(&mut events);

    let approvals = h.manager.approvals();
    let a1 = approvals
        .create(&session.run_id, "bash", json!({"cmd": "ls"}))
        .await
        .unwrap();
    assert_eq!(a1.status, ApprovalStatus::Pending);

    let t1 = h.tool_event(&session.id, "t1");
    assert_eq!(t1.approval_id.as_deref(), Some(a1.id.as_str()));
    assert_eq!(t1.approval_status, Some(EventApprovalStatus::Pending));
    assert_eq!(
        h.manager.get_session(&session.id).unwrap().status,
        SessionStatus::WaitingInput
    );

    let published = drain(&mut events);
    let new_approval = published
        .iter()
        .position(|e| e.event_type == BusEventType::NewApproval)
        .expect("new_approval published");
    let waiting = published
        .iter()
        .position(|e| status_change(e, SessionStatus::Running, SessionStatus::WaitingInput))
        .expect("running -> waiting_input published");
    assert!(new_approval < waiting);

    let decided = approvals
        .decide(&a1.id, Decision::Approve, Some("ok"))
        .await
        .unwrap();
    assert_eq!(decided.status, ApprovalStatus::Approved);
    assert_eq!(decided.comment.as_deref(), Some("ok"));
    assert_eq!(
        h.tool_event(&session.id, "t1").approval_status,
        Some(EventApprovalStatus::Approved)
    );
    assert_eq!(
        h.manager.get_session(&session.id).unwrap().status,
        SessionStatus::Running
    );

    let published = drain(&mut events);
    let resolved = published
        .iter()
        .find(|e| e.event_type == BusEventType::ApprovalResolved)
        .expect("approval_resolved published");
    assert_eq!(resolved.data["approval_id"], a1.id.as_str());
    assert_eq!(resolved.data["approved"], true);
    assert!(published
        .iter()
        .any(|e| status_change(e, SessionStatus::WaitingInput, SessionStatus::Running)));

    agent.send(tool_result("claude-1", "t1", "Cargo.toml\nsrc"));
    agent.send(result("claude-1", false));
    agent.finish(0);
    assert_eq!(
        h.manager.wait(&session.id).await,
        Some(SessionStatus::Completed)
    );

    let done = h.manager.get_session(&session.id).unwrap();
    assert_eq!(done.claude_session_id.as_deref(), Some("claude-1"));
    assert_eq!(done.model.as_deref(), Some("opus"));
    assert_eq!(done.cost_usd, Some(0.12));
    assert_eq!(done.num_turns, Some(2));
    assert_eq!(done.result_content.as_deref(), Some("done"));
    assert_eq!(done.effective_context_tokens, Some(100));
    assert!(done.completed_at.is_some());
    assert!(h.tool_event(&session.id, "t1").is_completed);

    let log = h.manager.get_messages(&session.id).unwrap();
    assert_eq!(log[0].event_type, ConversationEventType::Message);
    assert_eq!(log[0].role.as_deref(), Some("user"));
    assert_eq!(log[0].content.as_deref(), Some("list the files"));
    let sequences: Vec<i64> = log.iter().map(|e| e.sequence).collect();
    assert_eq!(sequences, (1..=log.len() as i64).collect::<Vec<_>>());
}

#[tokio::test]
async fn test_deny_without_comment() {
    let h = Harness::new();
    let session = h
        .manager
        .launch(LaunchRequest::new("q", h.working_dir()))
        .unwrap();
    let mut agent = h.launcher.next_agent().await;

    let approvals = h.manager.approvals();
    let a1 = approvals
        .create(&session.run_id, "bash", json!({"cmd": "rm -rf /"}))
        .await
        .unwrap();

    for comment in [None, Some(""), Some("   ")] {
        let err = approvals
            .decide(&a1.id, Decision::Deny, comment)
            .await
            .unwrap_err();
        assert!(matches!(err, SessionError::Validation(_)));
    }
    assert_eq!(approvals.get(&a1.id).unwrap(), a1);

    let denied = approvals
        .decide(&a1.id, Decision::Deny, Some("too dangerous"))
        .await
        .unwrap();
    assert_eq!(denied.status, ApprovalStatus::Denied);
    agent.finish(1);
}

#[tokio::test]
async fn test_out_of_order_correlation() {
    let h = Harness::new();
    let session = h
        .manager
        .launch(LaunchRequest::new("q", h.working_dir()))
        .unwrap();
    let mut agent = h.launcher.next_agent().await;
    eventually("session running", || {
        h.manager.get_session(&session.id).unwrap().status == SessionStatus::Running
    })
    .await;

    let approval = h
        .manager
        .approvals()
        .create(&session.run_id, "bash", json!({"cmd": "make"}))
        .await
        .unwrap();
    let metrics = h.manager.approvals().metrics().unwrap();
    assert_eq!(metrics.pending, 1);
    assert_eq!(metrics.correlated, 0);

    agent.send(init("claude-2", "claude-sonnet-4"));
    agent.send(tool_use("claude-2", "t2", "bash", json!({"cmd": "make"})));

    eventually("t2 correlated", || {
        h.store
            .get_tool_call(&session.id, "t2")
            .unwrap()
            .is_some_and(|e| e.approval_id.as_deref() == Some(approval.id.as_str()))
    })
    .await;
    assert_eq!(
        h.tool_event(&session.id, "t2").approval_status,
        Some(EventApprovalStatus::Pending)
    );
    assert_eq!(h.manager.approvals().metrics().unwrap().correlated, 1);
    agent.finish(0);
}

#[tokio::test]
async fn test_bypass_auto_approves() {
    let h = Harness::new();
    let mut request = LaunchRequest::new("q", h.working_dir());
    request.auto_accept_edits = true;
    let session = h.manager.launch(request).unwrap();
    let mut agent = h.launcher.next_agent().await;
    eventually("session running", || {
        h.manager.get_session(&session.id).unwrap().status == SessionStatus::Running
    })
    .await;

    let approvals = h.manager.approvals();
    let edit = approvals
        .create(&session.run_id, "Edit", json!({"file_path": "a.rs"}))
        .await
        .unwrap();
    assert_eq!(edit.status, ApprovalStatus::Approved);
    assert_eq!(
        h.manager.get_session(&session.id).unwrap().status,
        SessionStatus::Running
    );

    let bash = approvals
        .create(&session.run_id, "bash", json!({"cmd": "ls"}))
        .await
        .unwrap();
    assert!(bash.is_pending());
    assert_eq!(
        h.manager.get_session(&session.id).unwrap().status,
        SessionStatus::WaitingInput
    );

    // Switching bypass on settles what is already pending
    h.manager
        .update_settings(
            &session.id,
            SettingsPatch {
                dangerously_skip_permissions: Some(true),
                ..Default::default()
            },
        )
        .unwrap();
    let bash = approvals.get(&bash.id).unwrap();
    assert_eq!(bash.status, ApprovalStatus::Approved);
    assert_eq!(
        bash.comment.as_deref(),
        Some("Auto-accepted (dangerous skip permissions enabled)")
    );
    assert_eq!(
        h.manager.get_session(&session.id).unwrap().status,
        SessionStatus::Running
    );
    agent.finish(0);
}

// ─── Interrupt ───────────────────────────────────────────────────

#[tokio::test]
async fn test_interrupt_while_waiting() {
    let h = Harness::new();
    let session = h
        .manager
        .launch(LaunchRequest::new("q", h.working_dir()))
        .unwrap();
    let agent = h.launcher.next_agent().await;
    agent.send(init("claude-3", "claude-opus-4"));
    agent.send(tool_use("claude-3", "t1", "bash", json!({"cmd": "sleep 60"})));
    eventually("tool call t1", || {
        h.store.get_tool_call(&session.id, "t1").unwrap().is_some()
    })
    .await;

    let approvals = h.manager.approvals();
    let a2 = approvals
        .create(&session.run_id, "bash", json!({"cmd": "sleep 60"}))
        .await
        .unwrap();
    assert_eq!(
        h.manager.get_session(&session.id).unwrap().status,
        SessionStatus::WaitingInput
    );

    let mut events = h.manager.subscribe(
        SubscriptionFilter::for_session(&session.id),
        CancellationToken::new(),
    );
    let interrupting = h.manager.interrupt(&session.id).unwrap();
    assert_eq!(interrupting.status, SessionStatus::Interrupting);
    assert_eq!(
        h.manager.wait(&session.id).await,
        Some(SessionStatus::Interrupted)
    );
    assert!(agent.was_stopped());

    let published = drain(&mut events);
    assert!(published
        .iter()
        .any(|e| status_change(e, SessionStatus::WaitingInput, SessionStatus::Interrupting)));
    assert!(published
        .iter()
        .any(|e| status_change(e, SessionStatus::Interrupting, SessionStatus::Interrupted)));

    assert!(approvals.get(&a2.id).unwrap().is_pending());
    approvals
        .decide(&a2.id, Decision::Approve, None)
        .await
        .unwrap();
    let published = drain(&mut events);
    assert!(published
        .iter()
        .any(|e| e.event_type == BusEventType::ApprovalResolved));
    assert!(!published
        .iter()
        .any(|e| e.event_type == BusEventType::SessionStatusChanged));
    assert_eq!(
        h.manager.get_session(&session.id).unwrap().status,
        SessionStatus::Interrupted
    );

    let err = h.manager.interrupt(&session.id).unwrap_err();
    assert!(matches!(err, SessionError::InvalidTransition { .. }));
}

// ─── Continuation ────────────────────────────────────────────────

#[tokio::test]
async fn test_continuation_fork() {
    let h = Harness::new();
    let mut request = LaunchRequest::new("first", h.working_dir());
    request.system_prompt = Some("be terse".into());
    let parent = h.manager.launch(request).unwrap();
    let mut agent = h.launcher.next_agent().await;
    agent.send(init("claude-parent", "claude-opus-4"));
    agent.send(result("claude-parent", false));
    agent.finish(0);
    assert_eq!(
        h.manager.wait(&parent.id).await,
        Some(SessionStatus::Completed)
    );

    let child = h
        .manager
        .continue_session(&parent.id, ContinueRequest::new("next"))
        .await
        .unwrap();
    assert_eq!(child.parent_session_id.as_deref(), Some(parent.id.as_str()));
    assert_eq!(child.status, SessionStatus::Starting);
    assert_eq!(child.system_prompt.as_deref(), Some("be terse"));
    assert_ne!(child.run_id, parent.run_id);

    let mut resumed = h.launcher.next_agent().await;
    assert_eq!(resumed.spec.resume_session_id.as_deref(), Some("claude-parent"));
    assert_eq!(resumed.spec.query, "next");
    assert_eq!(resumed.spec.session_id, child.id);

    let leaves = h
        .manager
        .list_sessions(&SessionFilter {
            leaves_only: true,
            ..Default::default()
        })
        .unwrap();
    assert!(leaves.iter().any(|s| s.id == child.id));
    assert!(!leaves.iter().any(|s| s.id == parent.id));

    resumed.finish(0);
    // Exit without a result record
    assert_eq!(h.manager.wait(&child.id).await, Some(SessionStatus::Failed));
}

#[tokio::test]
async fn test_continue_running_parent_interrupts_it() {
    let h = Harness::new();
    let parent = h
        .manager
        .launch(LaunchRequest::new("first", h.working_dir()))
        .unwrap();
    let agent = h.launcher.next_agent().await;
    agent.send(init("claude-p", "claude-opus-4"));
    eventually("agent id captured", || {
        h.manager
            .get_session(&parent.id)
            .unwrap()
            .claude_session_id
            .is_some()
    })
    .await;

    let child = h
        .manager
        .continue_session(&parent.id, ContinueRequest::new("next"))
        .await
        .unwrap();
    assert!(agent.was_stopped());
    assert_eq!(
        h.manager.get_session(&parent.id).unwrap().status,
        SessionStatus::Interrupted
    );
    let mut resumed = h.launcher.next_agent().await;
    assert_eq!(resumed.spec.resume_session_id.as_deref(), Some("claude-p"));
    assert_eq!(resumed.spec.session_id, child.id);
    resumed.finish(1);
}

// ─── Ingestion ───────────────────────────────────────────────────

#[tokio::test]
async fn test_read_snapshot_and_bad_lines() {
    let h = Harness::new();
    let file = h.dir.path().join("notes.txt");
    std::fs::write(&file, "alpha\nbeta\ngamma").unwrap();

    let session = h
        .manager
        .launch(LaunchRequest::new("read it", h.working_dir()))
        .unwrap();
    let mut agent = h.launcher.next_agent().await;
    agent.send(init("claude-4", "claude-opus-4"));
    agent.send_raw("this is not json");
    agent.send(tool_use(
        "claude-4",
        "r1",
        "Read",
        json!({"file_path": file.to_string_lossy()}),
    ));
    agent.send(tool_result("claude-4", "r1", "     1→alpha\n     2→beta\n     3→gamma"));
    agent.send(tool_use(
        "claude-4",
        "r2",
        "Read",
        json!({"file_path": "notes.txt", "offset": 2, "limit": 1}),
    ));
    agent.send(tool_result("claude-4", "r2", "     2→beta"));
    // Result for a tool call that never happened
    agent.send(tool_result("claude-4", "ghost", "?"));
    agent.send(result("claude-4", true));
    agent.finish(0);

    assert_eq!(h.manager.wait(&session.id).await, Some(SessionStatus::Failed));

    let snapshots = h.manager.get_snapshots(&session.id).unwrap();
    assert_eq!(snapshots.len(), 2);
    assert_eq!(snapshots[0].tool_id, "r1");
    assert_eq!(snapshots[0].content, "alpha\nbeta\ngamma");
    // Partial reads keep the whole file from disk
    assert_eq!(snapshots[1].tool_id, "r2");
    assert_eq!(snapshots[1].content, "alpha\nbeta\ngamma");

    let log = h.manager.get_messages(&session.id).unwrap();
    assert!(!log
        .iter()
        .any(|e| e.tool_result_for_id.as_deref() == Some("ghost")));
    let raw = h.store.get_raw_events(&session.id).unwrap();
    assert!(raw.iter().any(|line| line == "this is not json"));

    let failed = h.manager.get_session(&session.id).unwrap();
    assert_eq!(failed.error_message.as_deref(), Some("done"));
}

#[tokio::test]
async fn test_invalid_utf8_line_is_skipped() {
    let h = Harness::new();
    let session = h
        .manager
        .launch(LaunchRequest::new("say hi", h.working_dir()))
        .unwrap();
    let mut agent = h.launcher.next_agent().await;
    agent.send(init("claude-5", "claude-sonnet-4"));
    agent.send_bytes(b"\xff\xfe garbage\n");
    agent.send(assistant_text("claude-5", "still here"));
    agent.send(result("claude-5", false));
    agent.finish(0);

    assert_eq!(
        h.manager.wait(&session.id).await,
        Some(SessionStatus::Completed)
    );
    let log = h.manager.get_messages(&session.id).unwrap();
    let contents: Vec<&str> = log.iter().filter_map(|e| e.content.as_deref()).collect();
    assert_eq!(contents, vec!["say hi", "still here"]);
    assert_eq!(h.store.get_raw_events(&session.id).unwrap().len(), 3);
    assert_eq!(h.manager.get_session(&session.id).unwrap().error_message, None);
}

// ─── Bus ─────────────────────────────────────────────────────────

#[tokio::test]
async fn test_subscriber_filter() {
    let bus = EventBus::default();
    let mut sub = bus.subscribe(
        SubscriptionFilter::for_session("S").with_types([BusEventType::NewApproval]),
        CancellationToken::new(),
    );

    bus.publish(BusEvent::new_approval("S", "R", "local-1", "bash"));
    bus.publish(BusEvent::new_approval("S2", "R2", "local-2", "bash"));
    bus.publish(BusEvent::conversation_updated("S", "R"));

    let received = drain(&mut sub);
    assert_eq!(received.len(), 1);
    assert_eq!(received[0].event_type, BusEventType::NewApproval);
    assert_eq!(received[0].session_id(), Some("S"));
}
