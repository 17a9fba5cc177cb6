use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use threadline_contract::testing::{
    agent_item, snapshot_json, turn_json, user_item, ClientCall, ScriptedThreadClient,
};
use threadline_contract::{
    ClientError, Item, ThreadEvent, ThreadNotification, ToolCallStatus, TurnInput, TurnStatus,
};
use threadline_reconcile::EventOutcome;
use threadline_session::{OpenMode, OpenOutcome, SessionConfig, SessionError, ThreadSessions};

fn host(client: &Arc<ScriptedThreadClient>) -> ThreadSessions {
    ThreadSessions::new(client.clone(), SessionConfig::default())
}

fn idle_thread(thread_id: &str) -> Value {
    snapshot_json(
        thread_id,
        None,
        vec![turn_json(
            "t1",
            "completed",
            vec![user_item("u1", "hi"), agent_item("a1", "hello")],
        )],
    )
}

fn notify(event: ThreadEvent) -> ThreadNotification {
    ThreadNotification::new("th", event)
}

fn delta(turn: &str, text: &str) -> ThreadNotification {
    notify(ThreadEvent::MessageDelta {
        turn_id: Some(turn.into()),
        item_id: Some(format!("{turn}-reply")),
        delta: text.into(),
    })
}

#[tokio::test(start_paused = true)]
async fn test_open_resumes_unloaded_thread() {
    let client = Arc::new(ScriptedThreadClient::new());
    client.push_resume(Ok(idle_thread("th")));
    let sessions = host(&client);

    let outcome = sessions.open("th", OpenMode::Open).await;
    let OpenOutcome::Opened {
        merge,
        stale_resume_missing_active_turn,
        refresh_attempts,
    } = outcome
    else {
        panic!("expected opened, got {outcome:?}");
    };
    assert_eq!(merge.unwrap().inserted, 2);
    assert!(!stale_resume_missing_active_turn);
    assert_eq!(refresh_attempts, 1);

    let view = sessions.view();
    assert_eq!(view.thread_id.as_deref(), Some("th"));
    assert_eq!(view.messages.len(), 2);
    assert!(!view.has_active_turn());
    assert_eq!(
        client.calls(),
        vec![ClientCall::ListLoaded, ClientCall::Resume("th".into())]
    );
}

#[tokio::test(start_paused = true)]
async fn test_open_attaches_and_reads_loaded_thread() {
    let client = Arc::new(ScriptedThreadClient::new());
    client.set_loaded(&["th"]);
    client.push_read(Ok(idle_thread("th")));
    let sessions = host(&client);

    assert!(matches!(
        sessions.open("th", OpenMode::Open).await,
        OpenOutcome::Opened { .. }
    ));
    assert_eq!(
        client.calls(),
        vec![
            ClientCall::ListLoaded,
            ClientCall::Attach("th".into()),
            ClientCall::Read("th".into()),
        ]
    );
    assert_eq!(sessions.view().messages.len(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_failed_open_falls_back_to_local_transcript() {
    let client = Arc::new(ScriptedThreadClient::new());
    client.push_resume(Ok(idle_thread("th")));
    client.push_resume(Err(ClientError::Transport("boom".into())));
    let sessions = host(&client);

    sessions.open("th", OpenMode::Open).await;
    let before = sessions.view();
    let outcome = sessions.open("th", OpenMode::Reconnect).await;

    assert_eq!(
        outcome,
        OpenOutcome::Fallback {
            reason: "transport error: boom".into()
        }
    );
    assert_eq!(sessions.view(), before);
}

#[tokio::test(start_paused = true)]
async fn test_malformed_snapshot_falls_back() {
    let client = Arc::new(ScriptedThreadClient::new());
    client.push_resume(Ok(json!({ "thread": { "turns": [] } })));
    let sessions = host(&client);

    let outcome = sessions.open("th", OpenMode::Open).await;
    assert!(matches!(outcome, OpenOutcome::Fallback { .. }));
    assert!(sessions.view().messages.is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_newer_open_supersedes_in_flight_open() {
    let client = Arc::new(ScriptedThreadClient::new());
    client.push_resume_delayed(Duration::from_secs(5), Ok(idle_thread("a")));
    client.push_resume(Ok(snapshot_json(
        "b",
        None,
        vec![turn_json("t1", "completed", vec![user_item("u1", "other")])],
    )));
    let sessions = host(&client);

    let first = {
        let sessions = sessions.clone();
        tokio::spawn(async move { sessions.open("a", OpenMode::Open).await })
    };
    tokio::task::yield_now().await;
    let second = sessions.open("b", OpenMode::Open).await;

    assert_eq!(first.await.unwrap(), OpenOutcome::Superseded);
    assert!(matches!(second, OpenOutcome::Opened { .. }));
    let view = sessions.view();
    assert_eq!(view.thread_id.as_deref(), Some("b"));
    assert_eq!(view.messages.len(), 1);
    assert_eq!(view.messages[0].text(), "other");
}

#[tokio::test(start_paused = true)]
async fn test_switching_back_keeps_thread_state() {
    let client = Arc::new(ScriptedThreadClient::new());
    client.push_resume(Ok(idle_thread("a")));
    client.push_resume(Ok(snapshot_json("b", None, Vec::new())));
    client.push_resume(Err(ClientError::Disconnected));
    let sessions = host(&client);

    sessions.open("a", OpenMode::Open).await;
    sessions.open("b", OpenMode::Open).await;
    assert!(sessions.view().messages.is_empty());

    let outcome = sessions.open("a", OpenMode::Open).await;
    assert!(matches!(outcome, OpenOutcome::Fallback { .. }));
    let view = sessions.view();
    assert_eq!(view.thread_id.as_deref(), Some("a"));
    assert_eq!(view.messages.len(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_refresh_picks_up_lagging_items() {
    let client = Arc::new(ScriptedThreadClient::new());
    client.push_resume(Ok(snapshot_json(
        "th",
        None,
        vec![turn_json("t1", "completed", vec![user_item("u1", "hi")])],
    )));
    client.push_read(Ok(idle_thread("th")));
    let sessions = host(&client);

    sessions.open("th", OpenMode::Open).await;
    assert_eq!(sessions.view().messages.len(), 1);

    tokio::time::sleep(Duration::from_secs(3)).await;
    assert_eq!(sessions.view().messages.len(), 2);
    assert_eq!(sessions.view().messages[1].text(), "hello");

    tokio::time::sleep(Duration::from_secs(10)).await;
    assert_eq!(client.count(|c| matches!(c, ClientCall::Read(_))), 1);
}

#[tokio::test(start_paused = true)]
async fn test_refresh_stops_after_stalled_attempts() {
    let client = Arc::new(ScriptedThreadClient::new());
    client.push_resume(Ok(idle_thread("th")));
    let sessions = host(&client);
    sessions.open("th", OpenMode::Open).await;

    sessions
        .apply_notification(&notify(ThreadEvent::ItemStarted {
            turn_id: Some("t2".into()),
            item: Item::CommandExecution {
                id: Some("c1".into()),
                command: "ls".into(),
                status: ToolCallStatus::InProgress,
                output: None,
                exit_code: None,
            },
        }))
        .await;

    let lagging = snapshot_json(
        "th",
        None,
        vec![
            turn_json(
                "t1",
                "completed",
                vec![user_item("u1", "hi"), agent_item("a1", "hello")],
            ),
            turn_json("t2", "completed", vec![user_item("u2", "list files")]),
        ],
    );
    client.push_resume(Ok(lagging.clone()));
    client.push_read(Ok(lagging));

    let outcome = sessions.open("th", OpenMode::Reconnect).await;
    let OpenOutcome::Opened {
        refresh_attempts, ..
    } = outcome
    else {
        panic!("expected opened, got {outcome:?}");
    };
    assert_eq!(refresh_attempts, 3);
    let view = sessions.view();
    assert!(view.messages.iter().any(|m| m.tool_call_count() == 1));
    assert_eq!(view.active_turn_id.as_deref(), Some("t2"));

    tokio::time::sleep(Duration::from_secs(20)).await;
    assert_eq!(client.count(|c| matches!(c, ClientCall::Read(_))), 2);
    assert!(sessions
        .view()
        .messages
        .iter()
        .any(|m| m.tool_call_count() == 1));
}

#[tokio::test(start_paused = true)]
async fn test_refresh_stops_once_connection_drops() {
    let client = Arc::new(ScriptedThreadClient::new());
    client.push_resume(Ok(idle_thread("th")));
    client.push_read(Ok(idle_thread("th")));
    let sessions = host(&client);

    sessions.open("th", OpenMode::Open).await;
    client.set_connected(false);
    tokio::time::sleep(Duration::from_secs(5)).await;
    assert_eq!(client.count(|c| matches!(c, ClientCall::Read(_))), 0);
}

#[tokio::test(start_paused = true)]
async fn test_send_streams_reply_into_placeholder() {
    let client = Arc::new(ScriptedThreadClient::new());
    client.push_resume(Ok(idle_thread("th")));
    client.push_turn(Ok("t2".into()));
    let sessions = host(&client);
    sessions.open("th", OpenMode::Open).await;

    let turn_id = sessions.send("next", Vec::new()).await.unwrap();
    assert_eq!(turn_id, "t2");
    let view = sessions.view();
    assert_eq!(view.active_turn_id.as_deref(), Some("t2"));
    assert_eq!(view.messages.len(), 4);
    assert_eq!(view.messages[2].text(), "next");
    assert!(view.messages[3].is_streaming);

    let err = sessions.send("again", Vec::new()).await.unwrap_err();
    assert!(matches!(err, SessionError::TurnAlreadyActive(ref t) if t == "t2"));

    sessions.apply_notification(&delta("t2", "Sure")).await;
    let finished = sessions
        .apply_notification(&notify(ThreadEvent::TurnCompleted {
            turn_id: "t2".into(),
            status: TurnStatus::Completed,
        }))
        .await;
    assert_eq!(
        finished,
        Some(EventOutcome::TurnFinished {
            turn_id: "t2".into()
        })
    );

    let view = sessions.view();
    assert!(!view.has_active_turn());
    assert_eq!(view.messages.len(), 4);
    assert_eq!(view.messages[3].text(), "Sure");
    assert!(!view.messages[3].is_streaming);
    assert_eq!(
        client.count(|c| *c == ClientCall::StartTurn("th".into(), TurnInput::text("next"))),
        1
    );
}

#[tokio::test(start_paused = true)]
async fn test_failed_send_leaves_error_entry() {
    let client = Arc::new(ScriptedThreadClient::new());
    client.push_resume(Ok(idle_thread("th")));
    client.push_turn(Err(ClientError::Transport("down".into())));
    let sessions = host(&client);
    sessions.open("th", OpenMode::Open).await;

    let err = sessions.send("hi again", Vec::new()).await.unwrap_err();
    assert!(matches!(err, SessionError::Client(ClientError::Transport(_))));

    let view = sessions.view();
    assert!(!view.has_active_turn());
    assert_eq!(view.messages.len(), 4);
    assert_eq!(view.messages[2].text(), "hi again");
    assert!(view.messages[3].is_error);
    assert!(view.messages.iter().all(|m| !m.is_streaming));
}

#[tokio::test(start_paused = true)]
async fn test_send_requires_open_thread() {
    let client = Arc::new(ScriptedThreadClient::new());
    let sessions = host(&client);
    let err = sessions.send("hello", Vec::new()).await.unwrap_err();
    assert!(matches!(err, SessionError::NoActiveThread));
}

#[tokio::test(start_paused = true)]
async fn test_interrupt_targets_running_turn() {
    let client = Arc::new(ScriptedThreadClient::new());
    client.push_resume(Ok(idle_thread("th")));
    client.push_turn(Ok("t2".into()));
    let sessions = host(&client);
    sessions.open("th", OpenMode::Open).await;

    assert!(!sessions.interrupt().await.unwrap());
    sessions.send("long task", Vec::new()).await.unwrap();
    assert!(sessions.interrupt().await.unwrap());
    assert_eq!(
        client.count(|c| *c == ClientCall::Interrupt("th".into(), "t2".into())),
        1
    );
}

#[tokio::test(start_paused = true)]
async fn test_notifications_for_other_threads_are_dropped() {
    let client = Arc::new(ScriptedThreadClient::new());
    client.push_resume(Ok(idle_thread("th")));
    let sessions = host(&client);
    sessions.open("th", OpenMode::Open).await;

    let stray = ThreadNotification::new(
        "elsewhere",
        ThreadEvent::TurnStarted {
            turn_id: "t9".into(),
        },
    );
    assert_eq!(sessions.apply_notification(&stray).await, None);
    assert_eq!(sessions.view().messages.len(), 2);
    assert!(!sessions.view().has_active_turn());
}

#[tokio::test(start_paused = true)]
async fn test_wire_notifications_decode_and_apply() {
    let client = Arc::new(ScriptedThreadClient::new());
    client.push_resume(Ok(idle_thread("th")));
    let sessions = host(&client);
    sessions.open("th", OpenMode::Open).await;

    let applied = sessions
        .apply_wire_notification(
            "item/agentMessage/delta",
            &json!({ "threadId": "th", "turnId": "t3", "itemId": "a3", "delta": "hey" }),
        )
        .await;
    assert_eq!(applied, Some(EventOutcome::Applied { changed: true }));
    assert_eq!(
        sessions
            .apply_wire_notification("thread/tokenUsage/updated", &json!({ "threadId": "th" }))
            .await,
        None
    );
    assert_eq!(
        sessions
            .apply_wire_notification("item/agentMessage/delta", &json!({ "delta": "x" }))
            .await,
        None
    );
    let view = sessions.view();
    assert_eq!(view.messages.last().unwrap().text(), "hey");
    assert_eq!(view.active_turn_id.as_deref(), Some("t3"));
}

#[tokio::test(start_paused = true)]
async fn test_event_feed_applies_in_order() {
    let client = Arc::new(ScriptedThreadClient::new());
    client.push_resume(Ok(idle_thread("th")));
    let sessions = host(&client);
    sessions.open("th", OpenMode::Open).await;
    let mut views = sessions.subscribe();

    let feed = futures::stream::iter(vec![
        delta("t2", "one "),
        delta("t2", "two"),
        notify(ThreadEvent::ItemCompleted {
            turn_id: Some("t2".into()),
            item: Item::AgentMessage {
                id: Some("t2-reply".into()),
                text: "one two".into(),
            },
        }),
        notify(ThreadEvent::TurnCompleted {
            turn_id: "t2".into(),
            status: TurnStatus::Completed,
        }),
    ]);
    sessions.run_event_feed(feed).await;

    assert!(views.has_changed().unwrap());
    let view = views.borrow_and_update().clone();
    assert_eq!(view.messages.len(), 3);
    assert_eq!(view.messages[2].text(), "one two");
    assert!(!view.has_active_turn());
}

#[tokio::test(start_paused = true)]
async fn test_archive_forgets_thread() {
    let client = Arc::new(ScriptedThreadClient::new());
    client.push_resume(Ok(idle_thread("th")));
    let sessions = host(&client);
    sessions.open("th", OpenMode::Open).await;

    sessions.archive().await.unwrap();
    assert_eq!(client.count(|c| *c == ClientCall::Archive("th".into())), 1);
    assert_eq!(sessions.current_thread().await, None);
    let view = sessions.view();
    assert_eq!(view.thread_id, None);
    assert!(view.messages.is_empty());
    assert!(matches!(
        sessions.archive().await,
        Err(SessionError::NoActiveThread)
    ));
}
