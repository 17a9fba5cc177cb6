use std::time::{Duration, Instant};
use threadline_contract::testing::{agent_item, snapshot_json, turn_json, user_item};
use threadline_contract::{
    decode_snapshot, Item, PlanStep, PlanStepStatus, Role, Segment, ThreadEvent, ToolCallStatus,
    TurnStatus,
};
use threadline_reconcile::{
    ConversationState, EventOutcome, IgnoreReason, ReconcileConfig, TurnState,
};

fn state() -> ConversationState {
    ConversationState::new("th", ReconcileConfig::default())
}

fn delta(turn: &str, item: Option<&str>, text: &str) -> ThreadEvent {
    ThreadEvent::MessageDelta {
        turn_id: Some(turn.into()),
        item_id: item.map(str::to_string),
        delta: text.into(),
    }
}

fn agent_completed(turn: &str, id: &str, text: &str) -> ThreadEvent {
    ThreadEvent::ItemCompleted {
        turn_id: Some(turn.into()),
        item: Item::AgentMessage {
            id: Some(id.into()),
            text: text.into(),
        },
    }
}

fn completed(turn: &str) -> ThreadEvent {
    ThreadEvent::TurnCompleted {
        turn_id: turn.into(),
        status: TurnStatus::Completed,
    }
}

#[test]
fn test_completed_item_extends_streamed_prefix() {
    let mut state = state();
    let now = Instant::now();
    state.apply_event(&delta("t1", Some("a1"), "Hello"), now);
    state.apply_event(&agent_completed("t1", "a1", "Hello world"), now);

    assert_eq!(state.messages().len(), 1);
    assert_eq!(state.messages()[0].text(), "Hello world");
}

#[test]
fn test_completed_item_adopts_unlabelled_streamed_segment() {
    let mut state = state();
    let now = Instant::now();
    state.apply_event(&delta("t1", None, "Hello"), now);
    state.apply_event(&agent_completed("t1", "a1", "Hello world"), now);

    let message = &state.messages()[0];
    assert_eq!(message.segments.len(), 1);
    assert_eq!(message.segments[0].item_id(), Some("a1"));
    assert_eq!(message.text(), "Hello world");
}

#[test]
fn test_repeated_deltas_append_verbatim() {
    let mut state = state();
    let now = Instant::now();
    for piece in ["ha", "ha", "!"] {
        state.apply_event(&delta("t1", Some("a1"), piece), now);
    }
    assert_eq!(state.messages()[0].text(), "haha!");
}

#[test]
fn test_delta_replay_after_snapshot_is_dropped() {
    let mut state = state();
    let now = Instant::now();
    let snap = decode_snapshot(&snapshot_json(
        "th",
        Some("t1"),
        vec![turn_json(
            "t1",
            "inProgress",
            vec![user_item("u1", "hi"), agent_item("a1", "Hello wor")],
        )],
    ))
    .unwrap();
    state.apply_snapshot(&snap, false, now);

    // Buffered deltas the snapshot already covered, then new ones.
    state.apply_event(&delta("t1", Some("a1"), "wor"), now);
    state.apply_event(&delta("t1", Some("a1"), "ld"), now);
    state.apply_event(&delta("t1", Some("a1"), "!"), now);

    assert_eq!(state.messages().len(), 2);
    assert_eq!(state.messages()[1].text(), "Hello world!");
}

#[test]
fn test_tool_calls_upsert_by_id() {
    let mut state = state();
    let now = Instant::now();
    let command = |status: ToolCallStatus, output: Option<&str>| ThreadEvent::ItemCompleted {
        turn_id: Some("t1".into()),
        item: Item::CommandExecution {
            id: Some("c1".into()),
            command: "cargo test".into(),
            status,
            output: output.map(str::to_string),
            exit_code: None,
        },
    };
    state.apply_event(&command(ToolCallStatus::InProgress, None), now);
    state.apply_event(
        &ThreadEvent::ToolOutputDelta {
            turn_id: Some("t1".into()),
            item_id: "c1".into(),
            delta: "running 3 tests\n".into(),
        },
        now,
    );
    state.apply_event(
        &command(ToolCallStatus::Completed, Some("running 3 tests\nok\n")),
        now,
    );
    // A late in-progress update must not regress the status.
    state.apply_event(&command(ToolCallStatus::InProgress, None), now);

    let message = &state.messages()[0];
    assert_eq!(message.tool_call_count(), 1);
    let call = message.tool_calls().next().unwrap();
    assert_eq!(call.status, ToolCallStatus::Completed);
    assert_eq!(call.output.as_deref(), Some("running 3 tests\nok\n"));
}

#[test]
fn test_turn_completion_runs_once() {
    let mut state = state();
    let now = Instant::now();
    state.apply_event(&delta("t1", Some("a1"), "done"), now);
    assert_eq!(
        state.apply_event(&completed("t1"), now),
        EventOutcome::TurnFinished {
            turn_id: "t1".into()
        }
    );
    assert_eq!(state.tracker().state(), &TurnState::Idle);
    assert!(!state.messages()[0].is_streaming);

    assert_eq!(
        state.apply_event(&completed("t1"), now),
        EventOutcome::Ignored { reason: IgnoreReason::FinishedTurn }
    );
    assert_eq!(
        state.apply_event(&delta("t1", Some("a1"), " late"), now),
        EventOutcome::Ignored { reason: IgnoreReason::FinishedTurn }
    );
    assert_eq!(state.messages()[0].text(), "done");
}

#[test]
fn test_terminal_error_appends_error_entry() {
    let mut state = state();
    let now = Instant::now();
    state.apply_event(&delta("t1", None, "partial"), now);
    let outcome = state.apply_event(
        &ThreadEvent::Error {
            turn_id: Some("t1".into()),
            message: "model overloaded".into(),
            will_retry: false,
        },
        now,
    );
    assert_eq!(
        outcome,
        EventOutcome::TurnFinished {
            turn_id: "t1".into()
        }
    );
    let last = state.messages().last().unwrap();
    assert!(last.is_error);
    assert_eq!(last.text(), "model overloaded");
    assert_eq!(
        state.apply_event(&completed("t1"), now),
        EventOutcome::Ignored { reason: IgnoreReason::FinishedTurn }
    );
}

#[test]
fn test_retryable_error_is_a_notice() {
    let mut state = state();
    let now = Instant::now();
    state.apply_event(
        &ThreadEvent::Error {
            turn_id: Some("t1".into()),
            message: "reconnecting".into(),
            will_retry: true,
        },
        now,
    );
    assert!(state.tracker().is_active());
    let message = &state.messages()[0];
    assert!(message.is_streaming);
    assert!(matches!(&message.segments[0], Segment::Notice { text } if text == "reconnecting"));
    assert_eq!(message.content_text(), "");
}

#[test]
fn test_user_item_lands_before_streaming_reply() {
    let mut state = state();
    let now = Instant::now();
    state.apply_event(&delta("t1", Some("a1"), "Sure"), now);
    state.apply_event(
        &ThreadEvent::ItemStarted {
            turn_id: Some("t1".into()),
            item: Item::UserMessage {
                id: Some("u1".into()),
                text: "help".into(),
                attachments: Vec::new(),
            },
        },
        now,
    );
    let roles: Vec<Role> = state.messages().iter().map(|m| m.role).collect();
    assert_eq!(roles, [Role::User, Role::Assistant]);
}

#[test]
fn test_local_prompt_is_not_duplicated_by_user_item() {
    let mut state = state();
    let now = Instant::now();
    let (user_id, placeholder) = state.begin_local_turn("help me", Vec::new()).unwrap();
    state.bind_started_turn("t1", now);
    state.apply_event(
        &ThreadEvent::ItemCompleted {
            turn_id: Some("t1".into()),
            item: Item::UserMessage {
                id: Some("u1".into()),
                text: "help  me".into(),
                attachments: Vec::new(),
            },
        },
        now,
    );
    state.apply_event(&delta("t1", Some("a1"), "ok"), now);

    assert_eq!(state.messages().len(), 2);
    assert_eq!(state.messages()[0].id, user_id);
    assert_eq!(state.messages()[1].id, placeholder);
    assert_eq!(state.messages()[1].text(), "ok");
}

#[test]
fn test_new_turn_supersedes_unfinished_one() {
    let mut state = state();
    let now = Instant::now();
    state.apply_event(&delta("t1", Some("a1"), "first"), now);
    state.apply_event(&delta("t2", Some("b1"), "second"), now + Duration::from_secs(1));

    assert_eq!(state.active_turn_id(), Some("t2"));
    assert_eq!(state.messages().len(), 2);
    assert!(!state.messages()[0].is_streaming);
    assert!(state.messages()[1].is_streaming);
    assert_eq!(state.messages()[1].text(), "second");
}

#[test]
fn test_plan_updates_replace_turn_plan() {
    let mut state = state();
    let now = Instant::now();
    let plan = |status: PlanStepStatus| ThreadEvent::TurnPlanUpdated {
        turn_id: Some("t1".into()),
        explanation: None,
        steps: vec![PlanStep {
            step: "write tests".into(),
            status,
        }],
    };
    state.apply_event(&plan(PlanStepStatus::InProgress), now);
    state.apply_event(&plan(PlanStepStatus::Completed), now);

    let message = &state.messages()[0];
    assert_eq!(message.segments.len(), 1);
    assert!(matches!(&message.segments[0], Segment::Plan { text, .. } if text == "- [x] write tests"));
}

#[test]
fn test_plan_with_removed_step_replaces_previous_rendering() {
    let mut state = state();
    let now = Instant::now();
    let step = |name: &str| PlanStep {
        step: name.into(),
        status: PlanStepStatus::Pending,
    };
    let plan = |steps: Vec<PlanStep>| ThreadEvent::TurnPlanUpdated {
        turn_id: Some("t1".into()),
        explanation: None,
        steps,
    };
    state.apply_event(&plan(vec![step("build"), step("ship")]), now);
    let outcome = state.apply_event(&plan(vec![step("build")]), now);

    assert_eq!(outcome, EventOutcome::Applied { changed: true });
    let message = &state.messages()[0];
    assert_eq!(message.segments.len(), 1);
    assert!(matches!(&message.segments[0], Segment::Plan { text, .. } if text == "- [ ] build"));
}

#[test]
fn test_id_less_command_completion_updates_its_start() {
    let mut state = state();
    let now = Instant::now();
    let command = |status: ToolCallStatus, output: Option<&str>| Item::CommandExecution {
        id: None,
        command: "make deploy".into(),
        status,
        output: output.map(str::to_string),
        exit_code: Some(0),
    };
    state.apply_event(
        &ThreadEvent::ItemStarted {
            turn_id: Some("t1".into()),
            item: command(ToolCallStatus::InProgress, None),
        },
        now,
    );
    state.apply_event(
        &ThreadEvent::ItemCompleted {
            turn_id: Some("t1".into()),
            item: command(ToolCallStatus::Completed, Some("deployed")),
        },
        now,
    );

    let message = &state.messages()[0];
    assert_eq!(message.tool_call_count(), 1);
    let call = message.tool_calls().next().unwrap();
    assert_eq!(call.status, ToolCallStatus::Completed);
    assert_eq!(call.output.as_deref(), Some("deployed"));

    // A later id-less command is a new call.
    state.apply_event(
        &ThreadEvent::ItemStarted {
            turn_id: Some("t1".into()),
            item: command(ToolCallStatus::InProgress, None),
        },
        now,
    );
    assert_eq!(state.messages()[0].tool_call_count(), 2);
}

#[test]
fn test_empty_turn_leaves_no_placeholder() {
    let mut state = state();
    let now = Instant::now();
    state.apply_event(
        &ThreadEvent::TurnStarted {
            turn_id: "t1".into(),
        },
        now,
    );
    assert_eq!(state.messages().len(), 1);
    state.apply_event(
        &ThreadEvent::TurnCompleted {
            turn_id: "t1".into(),
            status: TurnStatus::Interrupted,
        },
        now,
    );
    assert!(state.messages().is_empty());
}

#[test]
fn test_event_without_turn_needs_active_turn() {
    let mut state = state();
    let outcome = state.apply_event(
        &ThreadEvent::MessageDelta {
            turn_id: None,
            item_id: None,
            delta: "orphan".into(),
        },
        Instant::now(),
    );
    assert_eq!(outcome, EventOutcome::Ignored { reason: IgnoreReason::NoActiveTurn });
    assert!(state.messages().is_empty());
}
