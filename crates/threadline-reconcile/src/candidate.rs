use crate::key::ReconciliationKey;
use threadline_contract::{
    Item, ItemKind, Message, Segment, Snapshot, ToolCallKind, ToolCallSegment,
    ToolCallStatus,
};

/// One snapshot item rendered as a transcript message, with its key.
#[derive(Debug, Clone)]
pub(crate) struct Candidate {
    pub turn_id: String,
    pub key: ReconciliationKey,
    pub message: Message,
}

/// Render every renderable snapshot item, in order.
///
/// Returns the candidates and the number of items skipped as unknown or
/// structurally empty. Positional keys count every item of the turn so
/// skipping one does not shift its neighbours' keys.
pub(crate) fn build_candidates(snapshot: &Snapshot) -> (Vec<Candidate>, usize) {
    let mut candidates = Vec::with_capacity(snapshot.item_count());
    let mut skipped = 0;
    for turn in &snapshot.turns {
        for (index, item) in turn.items.iter().enumerate() {
            let key = ReconciliationKey::derive(&turn.id, item.kind(), item.id(), index);
            match item_message(item, &key) {
                Some(message) => candidates.push(Candidate {
                    turn_id: turn.id.clone(),
                    key,
                    message,
                }),
                None => skipped += 1,
            }
        }
    }
    dedupe_keys(&mut candidates, snapshot);
    (candidates, skipped)
}

// Servers occasionally repeat an item id within a turn; repeated keys fall
// back to the positional form so every candidate stays addressable.
fn dedupe_keys(candidates: &mut [Candidate], snapshot: &Snapshot) {
    let mut seen = std::collections::HashSet::new();
    let mut positions = Vec::with_capacity(candidates.len());
    for turn in &snapshot.turns {
        for (index, item) in turn.items.iter().enumerate() {
            if item_renders(item) {
                positions.push((turn.id.as_str(), item.kind(), index));
            }
        }
    }
    for (candidate, (turn_id, kind, index)) in candidates.iter_mut().zip(positions) {
        if !seen.insert(candidate.key.clone()) {
            candidate.key = ReconciliationKey::derive(turn_id, kind, None, index);
            seen.insert(candidate.key.clone());
        }
    }
}

fn item_renders(item: &Item) -> bool {
    item.kind() != ItemKind::Unknown && !item.is_structurally_empty()
}

fn item_message(item: &Item, key: &ReconciliationKey) -> Option<Message> {
    if !item_renders(item) {
        return None;
    }
    let item_id = item.id().map(str::to_string);
    let message = match item {
        Item::UserMessage {
            text, attachments, ..
        } => {
            let mut message = Message::user(text.clone()).with_attachments(attachments.clone());
            message.segments = vec![Segment::Text {
                text: text.clone(),
                item_id,
            }];
            message
        }
        Item::AgentMessage { text, .. } => Message::assistant_with_segments(vec![Segment::Text {
            text: text.clone(),
            item_id,
        }]),
        Item::Reasoning { text, .. } => Message::assistant_with_segments(vec![Segment::Thought {
            text: text.clone(),
            item_id,
        }]),
        Item::Plan { text, .. } => Message::assistant_with_segments(vec![Segment::Plan {
            text: text.clone(),
            item_id,
        }]),
        tool => {
            let segment = tool_segment(tool, key.as_str())?;
            Message::assistant_with_segments(vec![Segment::ToolCall(segment)])
        }
    };
    Some(message)
}

/// Tool-call segment for a tool-like item; `fallback_id` is used when the
/// item has no id of its own.
pub(crate) fn tool_segment(item: &Item, fallback_id: &str) -> Option<ToolCallSegment> {
    let id = item.id().unwrap_or(fallback_id).to_string();
    let segment = match item {
        Item::CommandExecution {
            command,
            status,
            output,
            exit_code,
            ..
        } => {
            let status = match (*status, exit_code) {
                (ToolCallStatus::Completed, Some(code)) if *code != 0 => ToolCallStatus::Failed,
                (status, _) => status,
            };
            with_output(
                ToolCallSegment::new(id, command.clone(), ToolCallKind::Command).with_status(status),
                output,
            )
        }
        Item::FileChange {
            paths,
            status,
            diff,
            ..
        } => {
            let title = if paths.is_empty() {
                "Edit files".to_string()
            } else {
                format!("Edit {}", paths.join(", "))
            };
            with_output(
                ToolCallSegment::new(id, title, ToolCallKind::FileChange).with_status(*status),
                diff,
            )
        }
        Item::ToolCall {
            name,
            server,
            status,
            output,
            ..
        } => {
            let title = match server {
                Some(server) if !server.is_empty() => format!("{server}.{name}"),
                _ => name.clone(),
            };
            with_output(
                ToolCallSegment::new(id, title, ToolCallKind::Tool).with_status(*status),
                output,
            )
        }
        _ => return None,
    };
    Some(segment)
}

fn with_output(segment: ToolCallSegment, output: &Option<String>) -> ToolCallSegment {
    match output.as_deref().filter(|o| !o.is_empty()) {
        Some(output) => segment.with_output(output),
        None => segment,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use threadline_contract::{Turn, TurnStatus};

    fn agent(id: Option<&str>, text: &str) -> Item {
        Item::AgentMessage {
            id: id.map(str::to_string),
            text: text.into(),
        }
    }

    #[test]
    fn skips_unknown_and_empty_items_without_shifting_keys() {
        let snapshot = Snapshot::new("th").with_turn(
            Turn::new("t1", TurnStatus::Completed)
                .with_item(Item::Unknown {
                    id: Some("x".into()),
                    item_type: "contextCompaction".into(),
                })
                .with_item(agent(None, ""))
                .with_item(agent(None, "done")),
        );
        let (candidates, skipped) = build_candidates(&snapshot);
        assert_eq!(skipped, 2);
        assert_eq!(candidates.len(), 1);
        assert_eq!(candidates[0].key.as_str(), "turn:t1:agent_message:pos:2");
    }

    #[test]
    fn repeated_item_ids_get_positional_keys() {
        let snapshot = Snapshot::new("th").with_turn(
            Turn::new("t1", TurnStatus::Completed)
                .with_item(agent(Some("a"), "one"))
                .with_item(agent(Some("a"), "two")),
        );
        let (candidates, _) = build_candidates(&snapshot);
        assert_eq!(candidates[0].key.as_str(), "turn:t1:agent_message:id:a");
        assert_eq!(candidates[1].key.as_str(), "turn:t1:agent_message:pos:1");
    }

    #[test]
    fn failed_exit_code_marks_command_failed() {
        let item = Item::CommandExecution {
            id: Some("c1".into()),
            command: "cargo test".into(),
            status: ToolCallStatus::Completed,
            output: Some("1 failed".into()),
            exit_code: Some(101),
        };
        let segment = tool_segment(&item, "unused").unwrap();
        assert_eq!(segment.status, ToolCallStatus::Failed);
        assert_eq!(segment.title, "cargo test");
        assert_eq!(segment.output.as_deref(), Some("1 failed"));
    }
}
