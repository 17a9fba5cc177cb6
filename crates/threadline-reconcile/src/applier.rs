//! Live event application.

use crate::candidate::tool_segment;
use crate::conversation::ConversationState;
use crate::key::{turn_prefix, ReconciliationKey};
use crate::text::{merge_delta, merge_full, sanitize_user_text, TextMerge};
use serde::Serialize;
use std::time::Instant;
use threadline_contract::{
    render_plan, Item, ItemKind, Message, MessageId, PlanStep, Role, Segment, ThreadEvent,
    ToolCallKind, ToolCallSegment, ToolCallStatus,
};
use tracing::{debug, warn};

/// Segment carrying the turn-level plan from `turn/plan/updated`.
const TURN_PLAN_ITEM: &str = "turn-plan";

/// What applying one live event did.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum EventOutcome {
    Applied { changed: bool },
    TurnFinished { turn_id: String },
    Ignored { reason: IgnoreReason },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum IgnoreReason {
    /// The event names a turn that already completed.
    FinishedTurn,
    /// The event has no turn id and no turn is running.
    NoActiveTurn,
    UnknownItem,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TextKind {
    Reply,
    Thought,
    Plan,
}

impl TextKind {
    fn matches(self, segment: &Segment) -> bool {
        matches!(
            (self, segment),
            (Self::Reply, Segment::Text { .. })
                | (Self::Thought, Segment::Thought { .. })
                | (Self::Plan, Segment::Plan { .. })
        )
    }

    fn segment(self, text: String, item_id: Option<String>) -> Segment {
        match self {
            Self::Reply => Segment::Text { text, item_id },
            Self::Thought => Segment::Thought { text, item_id },
            Self::Plan => Segment::Plan { text, item_id },
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Source {
    Delta,
    Full,
}

enum Target {
    /// Segment built from the same item.
    Item(usize),
    /// Trailing segment of the same kind that is not tied to another item.
    Trailing(usize),
    Missing,
}

impl ConversationState {
    /// Apply one live event and return what it did.
    pub fn apply_event(&mut self, event: &ThreadEvent, now: Instant) -> EventOutcome {
        let turn_id = match event
            .turn_id()
            .or_else(|| self.tracker.active_turn_id())
            .map(str::to_string)
        {
            Some(turn_id) => turn_id,
            None => {
                if let ThreadEvent::Error {
                    message,
                    will_retry: false,
                    ..
                } = event
                {
                    self.push_error(message);
                    return EventOutcome::Applied { changed: true };
                }
                return EventOutcome::Ignored { reason: IgnoreReason::NoActiveTurn };
            }
        };

        if self.tracker.is_finished(&turn_id) {
            debug!(thread_id = %self.thread_id, %turn_id, "ignoring event for finished turn");
            return EventOutcome::Ignored { reason: IgnoreReason::FinishedTurn };
        }
        self.align_turn(&turn_id, now);
        self.tracker.record_activity(now);

        match event {
            ThreadEvent::MessageDelta { item_id, delta, .. } => {
                self.on_text(&turn_id, TextKind::Reply, item_id.as_deref(), delta, Source::Delta)
            }
            ThreadEvent::ReasoningDelta { item_id, delta, .. } => {
                self.on_text(&turn_id, TextKind::Thought, item_id.as_deref(), delta, Source::Delta)
            }
            ThreadEvent::PlanDelta { item_id, delta, .. } => {
                self.on_text(&turn_id, TextKind::Plan, item_id.as_deref(), delta, Source::Delta)
            }
            ThreadEvent::ToolOutputDelta { item_id, delta, .. } => {
                self.on_tool_output(&turn_id, item_id, delta)
            }
            ThreadEvent::ItemStarted { item, .. } | ThreadEvent::ItemCompleted { item, .. } => {
                self.on_item(&turn_id, item)
            }
            ThreadEvent::TurnPlanUpdated {
                explanation, steps, ..
            } => {
                let text = plan_text(explanation.as_deref(), steps);
                self.on_turn_plan(&turn_id, text)
            }
            ThreadEvent::TurnStarted { .. } => {
                let before = self.store.len();
                self.bind(&turn_id, true);
                EventOutcome::Applied {
                    changed: self.store.len() != before,
                }
            }
            ThreadEvent::TurnCompleted { .. } => self.finish(&turn_id, None),
            ThreadEvent::Error {
                message,
                will_retry: true,
                ..
            } => self.on_notice(&turn_id, message),
            ThreadEvent::Error { message, .. } => self.finish(&turn_id, Some(message)),
        }
    }

    fn on_text(
        &mut self,
        turn_id: &str,
        kind: TextKind,
        item_id: Option<&str>,
        incoming: &str,
        source: Source,
    ) -> EventOutcome {
        let Some(message_id) = self.bind(turn_id, true) else {
            return EventOutcome::Applied { changed: false };
        };
        let snapshot_derived = self.snapshot_backed.contains(&message_id);
        let Some(message) = self.store.get_mut(&message_id) else {
            return EventOutcome::Applied { changed: false };
        };
        let changed = apply_text(message, kind, item_id, incoming, source, snapshot_derived);
        if changed && source == Source::Delta {
            self.snapshot_backed.remove(&message_id);
        }
        EventOutcome::Applied { changed }
    }

    /// The turn plan is re-sent whole on every update and replaces the
    /// previous rendering, even when it shrinks.
    fn on_turn_plan(&mut self, turn_id: &str, text: String) -> EventOutcome {
        let Some(message_id) = self.bind(turn_id, true) else {
            return EventOutcome::Applied { changed: false };
        };
        let Some(message) = self.store.get_mut(&message_id) else {
            return EventOutcome::Applied { changed: false };
        };
        let existing = message.segments.iter_mut().find_map(|s| match s {
            Segment::Plan { text, item_id } if item_id.as_deref() == Some(TURN_PLAN_ITEM) => {
                Some(text)
            }
            _ => None,
        });
        let changed = match existing {
            Some(current) if *current == text => false,
            Some(current) => {
                *current = text;
                true
            }
            None if text.trim().is_empty() => false,
            None => {
                message.segments.push(Segment::Plan {
                    text,
                    item_id: Some(TURN_PLAN_ITEM.to_string()),
                });
                true
            }
        };
        EventOutcome::Applied { changed }
    }

    fn on_notice(&mut self, turn_id: &str, text: &str) -> EventOutcome {
        let Some(message_id) = self.bind(turn_id, true) else {
            return EventOutcome::Applied { changed: false };
        };
        match self.store.get_mut(&message_id) {
            Some(message) => {
                message.segments.push(Segment::Notice {
                    text: text.to_string(),
                });
                EventOutcome::Applied { changed: true }
            }
            None => EventOutcome::Applied { changed: false },
        }
    }

    fn on_item(&mut self, turn_id: &str, item: &Item) -> EventOutcome {
        match item {
            Item::UserMessage { .. } => self.on_user_item(turn_id, item),
            Item::AgentMessage { id, text } => {
                self.on_text(turn_id, TextKind::Reply, id.as_deref(), text, Source::Full)
            }
            Item::Reasoning { id, text } => {
                self.on_text(turn_id, TextKind::Thought, id.as_deref(), text, Source::Full)
            }
            Item::Plan { id, text } => {
                self.on_text(turn_id, TextKind::Plan, id.as_deref(), text, Source::Full)
            }
            Item::Unknown { item_type, .. } => {
                debug!(thread_id = %self.thread_id, %item_type, "ignoring unknown item");
                EventOutcome::Ignored { reason: IgnoreReason::UnknownItem }
            }
            tool => self.on_tool_item(turn_id, tool),
        }
    }

    fn on_tool_item(&mut self, turn_id: &str, item: &Item) -> EventOutcome {
        let Some(message_id) = self.bind(turn_id, true) else {
            return EventOutcome::Applied { changed: false };
        };
        let Some(message) = self.store.get_mut(&message_id) else {
            return EventOutcome::Applied { changed: false };
        };
        let fallback = ReconciliationKey::derive(
            turn_id,
            item.kind(),
            None,
            message.tool_call_count(),
        );
        let Some(mut incoming) = tool_segment(item, fallback.as_str()) else {
            return EventOutcome::Applied { changed: false };
        };
        if item.id().is_none() {
            if let Some(id) = open_fallback_call(message, turn_id, incoming.kind) {
                incoming.id = id;
            }
        }
        let changed = upsert_tool_call(message, incoming);
        EventOutcome::Applied { changed }
    }

    fn on_tool_output(&mut self, turn_id: &str, item_id: &str, delta: &str) -> EventOutcome {
        let Some(message_id) = self.bind(turn_id, true) else {
            return EventOutcome::Applied { changed: false };
        };
        let snapshot_derived = self.snapshot_backed.contains(&message_id);
        let Some(message) = self.store.get_mut(&message_id) else {
            return EventOutcome::Applied { changed: false };
        };
        let existing = message.segments.iter_mut().find_map(|s| match s {
            Segment::ToolCall(call) if call.id == item_id => Some(call),
            _ => None,
        });
        let changed = match existing {
            Some(call) => {
                let current = call.output.get_or_insert_with(String::new);
                match merge_delta(current, delta, snapshot_derived) {
                    TextMerge::Append(suffix) => {
                        current.push_str(&suffix);
                        true
                    }
                    _ => false,
                }
            }
            None if delta.is_empty() => false,
            None => {
                let call = ToolCallSegment::new(item_id, "", ToolCallKind::Command)
                    .with_status(ToolCallStatus::InProgress)
                    .with_output(delta);
                message.segments.push(Segment::ToolCall(call));
                true
            }
        };
        if changed {
            self.snapshot_backed.remove(&message_id);
        }
        EventOutcome::Applied { changed }
    }

    fn on_user_item(&mut self, turn_id: &str, item: &Item) -> EventOutcome {
        let Item::UserMessage {
            id,
            text,
            attachments,
        } = item
        else {
            return EventOutcome::Applied { changed: false };
        };
        let key = id
            .as_deref()
            .map(|id| ReconciliationKey::derive(turn_id, ItemKind::UserMessage, Some(id), 0));
        if let Some(key) = &key {
            if let Some(existing) = self.index.message_for(key) {
                if self.store.contains(existing) {
                    return EventOutcome::Applied { changed: false };
                }
            }
        }

        let wanted = sanitize_user_text(text);
        let local = self
            .store
            .messages()
            .iter()
            .rev()
            .find(|m| {
                m.role == Role::User
                    && self.index.key_for(&m.id).is_none()
                    && sanitize_user_text(&m.text()) == wanted
            })
            .map(|m| m.id.clone());
        if let Some(local) = local {
            if let Some(key) = key {
                self.index.bind(key, local);
            }
            return EventOutcome::Applied { changed: false };
        }

        let mut message = Message::user(text.clone()).with_attachments(attachments.clone());
        message.segments = vec![Segment::Text {
            text: text.clone(),
            item_id: id.clone(),
        }];
        let message_id = message.id.clone();
        let anchor: Option<MessageId> = self
            .tracker
            .binding(turn_id)
            .cloned()
            .or_else(|| self.store.streaming_id().cloned())
            .filter(|id| self.store.contains(id));
        let inserted = match anchor {
            Some(anchor) => self.store.insert_before(&anchor, message),
            None => self.store.push(message),
        };
        if let Err(e) = inserted {
            warn!(thread_id = %self.thread_id, error = %e, "dropping user item");
            return EventOutcome::Applied { changed: false };
        }
        if let Some(key) = key {
            self.index.bind(key, message_id);
        }
        EventOutcome::Applied { changed: true }
    }

    fn finish(&mut self, turn_id: &str, error: Option<&str>) -> EventOutcome {
        let Some(bound) = self.tracker.finish_turn(turn_id) else {
            debug!(thread_id = %self.thread_id, %turn_id, "turn already finished");
            return EventOutcome::Ignored { reason: IgnoreReason::FinishedTurn };
        };
        if let Some(id) = bound {
            if self.store.get(&id).is_some_and(Message::is_empty) {
                self.store.remove(&id);
                self.index.unbind_message(&id);
                self.snapshot_backed.remove(&id);
            }
        }
        self.clear_streaming_except_pending();
        if let Some(text) = error {
            self.push_error(text);
        }
        EventOutcome::TurnFinished {
            turn_id: turn_id.to_string(),
        }
    }
}

fn plan_text(explanation: Option<&str>, steps: &[PlanStep]) -> String {
    let steps = render_plan(steps);
    match explanation.map(str::trim).filter(|e| !e.is_empty()) {
        Some(explanation) if steps.is_empty() => explanation.to_string(),
        Some(explanation) => format!("{explanation}\n{steps}"),
        None => steps,
    }
}

fn locate(segments: &[Segment], kind: TextKind, item_id: Option<&str>) -> Target {
    if let Some(item_id) = item_id {
        if let Some(at) = segments
            .iter()
            .rposition(|s| kind.matches(s) && s.item_id() == Some(item_id))
        {
            return Target::Item(at);
        }
    }
    match segments.last() {
        Some(last) if kind.matches(last) && (item_id.is_none() || last.item_id().is_none()) => {
            Target::Trailing(segments.len() - 1)
        }
        _ => Target::Missing,
    }
}

fn text_parts(segment: &mut Segment) -> Option<(&mut String, &mut Option<String>)> {
    match segment {
        Segment::Text { text, item_id }
        | Segment::Thought { text, item_id }
        | Segment::Plan { text, item_id } => Some((text, item_id)),
        _ => None,
    }
}

/// Fold incoming text into `message`; returns whether anything changed.
fn apply_text(
    message: &mut Message,
    kind: TextKind,
    item_id: Option<&str>,
    incoming: &str,
    source: Source,
    snapshot_derived: bool,
) -> bool {
    let (at, by_item) = match locate(&message.segments, kind, item_id) {
        Target::Item(at) => (at, true),
        Target::Trailing(at) => (at, false),
        Target::Missing => {
            if incoming.is_empty() {
                return false;
            }
            let segment = kind.segment(incoming.to_string(), item_id.map(str::to_string));
            message.segments.push(segment);
            return true;
        }
    };
    let Some((text, segment_item)) = text_parts(&mut message.segments[at]) else {
        return false;
    };
    let merge = match source {
        Source::Delta => merge_delta(text, incoming, snapshot_derived),
        Source::Full => merge_full(text, incoming),
    };
    let adopt_id = !by_item
        && segment_item.is_none()
        && item_id.is_some()
        && merge != TextMerge::Diverged;
    if adopt_id {
        *segment_item = item_id.map(str::to_string);
    }
    match merge {
        TextMerge::Unchanged => adopt_id,
        TextMerge::Append(suffix) => {
            text.push_str(&suffix);
            true
        }
        TextMerge::Diverged if by_item => {
            *text = incoming.to_string();
            true
        }
        TextMerge::Diverged => {
            let segment = kind.segment(incoming.to_string(), item_id.map(str::to_string));
            message.segments.push(segment);
            true
        }
    }
}

/// Id of the latest unfinished call of `kind` that was itself given a
/// fallback id, so an id-less completion lands on its own start.
fn open_fallback_call(message: &Message, turn_id: &str, kind: ToolCallKind) -> Option<String> {
    let prefix = turn_prefix(turn_id);
    message
        .segments
        .iter()
        .rev()
        .filter_map(Segment::as_tool_call)
        .find(|c| c.kind == kind && !c.status.is_terminal() && c.id.starts_with(&prefix))
        .map(|c| c.id.clone())
}

/// Insert or update a tool call by id; returns whether anything changed.
fn upsert_tool_call(message: &mut Message, incoming: ToolCallSegment) -> bool {
    let existing = message.segments.iter_mut().find_map(|s| match s {
        Segment::ToolCall(call) if call.id == incoming.id => Some(call),
        _ => None,
    });
    let Some(call) = existing else {
        message.segments.push(Segment::ToolCall(incoming));
        return true;
    };
    let before = call.clone();
    if !incoming.title.is_empty() {
        call.title = incoming.title;
    }
    call.kind = incoming.kind;
    if !(call.status.is_terminal() && !incoming.status.is_terminal()) {
        call.status = incoming.status;
    }
    if let Some(output) = incoming.output {
        let current = call.output.get_or_insert_with(String::new);
        match merge_full(current, &output) {
            TextMerge::Append(suffix) => current.push_str(&suffix),
            TextMerge::Diverged => *current = output,
            TextMerge::Unchanged => {}
        }
    }
    *call != before
}
