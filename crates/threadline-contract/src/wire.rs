//! Decoding of remote JSON payloads into snapshots and notifications.
//!
//! Field lookups accept both camelCase and snake_case spellings.

use crate::error::ProtocolError;
use crate::event::{PlanStep, ThreadEvent, ThreadNotification};
use crate::item::classify;
use crate::snapshot::{Snapshot, Turn, TurnStatus};
use serde_json::Value;

pub const METHOD_MESSAGE_DELTA: &str = "item/agentMessage/delta";
pub const METHOD_REASONING_DELTA: &str = "item/reasoning/textDelta";
pub const METHOD_REASONING_SUMMARY_DELTA: &str = "item/reasoning/summaryTextDelta";
pub const METHOD_PLAN_DELTA: &str = "item/plan/delta";
pub const METHOD_COMMAND_OUTPUT_DELTA: &str = "item/commandExecution/outputDelta";
pub const METHOD_ITEM_STARTED: &str = "item/started";
pub const METHOD_ITEM_COMPLETED: &str = "item/completed";
pub const METHOD_TURN_STARTED: &str = "turn/started";
pub const METHOD_TURN_COMPLETED: &str = "turn/completed";
pub const METHOD_TURN_PLAN_UPDATED: &str = "turn/plan/updated";
pub const METHOD_ERROR: &str = "error";

pub(crate) fn first_value<'a>(value: &'a Value, keys: &[&str]) -> Option<&'a Value> {
    keys.iter()
        .filter_map(|k| value.get(*k))
        .find(|v| !v.is_null())
}

pub(crate) fn first_str<'a>(value: &'a Value, keys: &[&str]) -> Option<&'a str> {
    keys.iter().filter_map(|k| value.get(*k)).find_map(Value::as_str)
}

/// Flatten a string, a list of strings, or a list of `{type:"text", text}` parts.
pub(crate) fn text_from_parts(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Array(parts) => parts
            .iter()
            .filter_map(|part| match part {
                Value::String(s) => Some(s.as_str()),
                Value::Object(_) => {
                    let is_text = part
                        .get("type")
                        .and_then(Value::as_str)
                        .map_or(true, |t| t.eq_ignore_ascii_case("text") || t.ends_with("_text"));
                    if is_text {
                        first_str(part, &["text"])
                    } else {
                        None
                    }
                }
                _ => None,
            })
            .collect::<Vec<_>>()
            .join(""),
        _ => String::new(),
    }
}

fn array_field<'a>(
    value: &'a Value,
    field: &str,
    keys: &[&str],
) -> Result<&'a [Value], ProtocolError> {
    match first_value(value, keys) {
        None => Ok(&[]),
        Some(Value::Array(items)) => Ok(items.as_slice()),
        Some(_) => Err(ProtocolError::invalid(field, "array")),
    }
}

/// Decode a `thread/resume` or `thread/read` result.
///
/// Accepts either `{ "thread": {...} }` or the thread object itself. When the
/// payload has no explicit active turn, the last in-progress turn is used.
pub fn decode_snapshot(value: &Value) -> Result<Snapshot, ProtocolError> {
    let thread = match value.get("thread") {
        Some(thread) if !thread.is_null() => thread,
        _ => value,
    };
    if !thread.is_object() {
        return Err(ProtocolError::invalid("thread", "object"));
    }

    let thread_id = first_str(thread, &["id", "threadId", "thread_id"])
        .ok_or_else(|| ProtocolError::missing("thread.id"))?
        .to_string();

    let mut turns = Vec::new();
    for (index, raw_turn) in array_field(thread, "thread.turns", &["turns"])?
        .iter()
        .enumerate()
    {
        turns.push(decode_turn(raw_turn, index)?);
    }

    let active_turn_id = first_str(thread, &["activeTurnId", "active_turn_id"])
        .or_else(|| first_str(value, &["activeTurnId", "active_turn_id"]))
        .map(str::to_string)
        .or_else(|| {
            turns
                .iter()
                .rev()
                .find(|t| t.status == TurnStatus::InProgress)
                .map(|t| t.id.clone())
        });

    Ok(Snapshot {
        thread_id,
        cwd: first_str(thread, &["cwd"])
            .or_else(|| first_str(value, &["cwd"]))
            .map(str::to_string),
        created_at: first_value(thread, &["createdAt", "created_at"]).and_then(Value::as_i64),
        active_turn_id,
        turns,
    })
}

fn decode_turn(raw: &Value, index: usize) -> Result<Turn, ProtocolError> {
    if !raw.is_object() {
        return Err(ProtocolError::invalid(format!("turns[{index}]"), "object"));
    }
    let id = first_str(raw, &["id", "turnId", "turn_id"])
        .ok_or_else(|| ProtocolError::missing(format!("turns[{index}].id")))?;
    let status = first_str(raw, &["status"])
        .map(TurnStatus::parse)
        .unwrap_or_default();
    let items = array_field(raw, &format!("turns[{index}].items"), &["items"])?
        .iter()
        .map(classify)
        .collect();
    Ok(Turn {
        id: id.to_string(),
        status,
        items,
    })
}

/// Decode one server notification.
///
/// Returns `Ok(None)` for methods this crate does not model.
pub fn decode_notification(
    method: &str,
    params: &Value,
) -> Result<Option<ThreadNotification>, ProtocolError> {
    let turn = params.get("turn");
    let thread_id = first_str(params, &["threadId", "thread_id", "conversationId"])
        .or_else(|| turn.and_then(|t| first_str(t, &["threadId", "thread_id"])));
    let turn_id = first_str(params, &["turnId", "turn_id"])
        .or_else(|| turn.and_then(|t| first_str(t, &["id"])))
        .map(str::to_string);
    let item_id = first_str(params, &["itemId", "item_id"]).map(str::to_string);

    let required_delta = || {
        first_str(params, &["delta", "text"])
            .map(str::to_string)
            .ok_or_else(|| ProtocolError::missing("delta"))
    };
    let required_turn = || {
        turn_id
            .clone()
            .ok_or_else(|| ProtocolError::missing("turnId"))
    };
    let required_item = || {
        params
            .get("item")
            .filter(|i| i.is_object())
            .map(classify)
            .ok_or_else(|| ProtocolError::missing("item"))
    };

    let event = match method {
        METHOD_MESSAGE_DELTA => ThreadEvent::MessageDelta {
            turn_id: turn_id.clone(),
            item_id,
            delta: required_delta()?,
        },
        METHOD_REASONING_DELTA | METHOD_REASONING_SUMMARY_DELTA => ThreadEvent::ReasoningDelta {
            turn_id: turn_id.clone(),
            item_id,
            delta: required_delta()?,
        },
        METHOD_PLAN_DELTA => ThreadEvent::PlanDelta {
            turn_id: turn_id.clone(),
            item_id,
            delta: required_delta()?,
        },
        METHOD_COMMAND_OUTPUT_DELTA => ThreadEvent::ToolOutputDelta {
            turn_id: turn_id.clone(),
            item_id: item_id.ok_or_else(|| ProtocolError::missing("itemId"))?,
            delta: required_delta()?,
        },
        METHOD_ITEM_STARTED => ThreadEvent::ItemStarted {
            turn_id: turn_id.clone(),
            item: required_item()?,
        },
        METHOD_ITEM_COMPLETED => ThreadEvent::ItemCompleted {
            turn_id: turn_id.clone(),
            item: required_item()?,
        },
        METHOD_TURN_STARTED => ThreadEvent::TurnStarted {
            turn_id: required_turn()?,
        },
        METHOD_TURN_COMPLETED => ThreadEvent::TurnCompleted {
            turn_id: required_turn()?,
            status: turn
                .and_then(|t| first_str(t, &["status"]))
                .or_else(|| first_str(params, &["status"]))
                .map(TurnStatus::parse)
                .unwrap_or(TurnStatus::Completed),
        },
        METHOD_TURN_PLAN_UPDATED => {
            let steps = match first_value(params, &["plan", "steps"]) {
                None => Vec::new(),
                Some(raw) => serde_json::from_value::<Vec<PlanStep>>(raw.clone())
                    .map_err(|_| ProtocolError::invalid("plan", "array of plan steps"))?,
            };
            ThreadEvent::TurnPlanUpdated {
                turn_id: turn_id.clone(),
                explanation: first_str(params, &["explanation"]).map(str::to_string),
                steps,
            }
        }
        METHOD_ERROR => {
            let error = params.get("error");
            let message = error
                .and_then(|e| first_str(e, &["message"]).or_else(|| e.as_str()))
                .or_else(|| first_str(params, &["message"]))
                .ok_or_else(|| ProtocolError::missing("error.message"))?;
            ThreadEvent::Error {
                turn_id: turn_id.clone(),
                message: message.to_string(),
                will_retry: first_value(params, &["willRetry", "will_retry"])
                    .and_then(Value::as_bool)
                    .unwrap_or(false),
            }
        }
        _ => return Ok(None),
    };

    let thread_id = thread_id.ok_or_else(|| ProtocolError::missing("threadId"))?;
    Ok(Some(ThreadNotification::new(thread_id, event)))
}
