//! Deterministic replay of recorded snapshots and notifications.
//!
//! A script drives one [`ConversationState`] on a virtual clock, so a captured
//! session can be re-run and its transcript inspected without a server.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use thiserror::Error;
use threadline_contract::{
    decode_notification, decode_snapshot, Attachment, Message, MessageId, ProtocolError,
};
use threadline_reconcile::{
    ConversationState, EventOutcome, ReconcileConfig, SnapshotApply, TranscriptError,
};
use tracing::debug;

#[derive(Debug, Error)]
pub enum ReplayError {
    #[error("failed to read script {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse script (JSON): {0}")]
    Parse(#[from] serde_json::Error),

    #[error("step {step}: {source}")]
    Protocol {
        step: usize,
        #[source]
        source: ProtocolError,
    },

    #[error("step {step}: virtual clock overflow")]
    ClockOverflow { step: usize },

    #[error("step {step}: {source}")]
    Transcript {
        step: usize,
        #[source]
        source: TranscriptError,
    },
}

#[derive(Debug, Clone, Deserialize)]
pub struct Script {
    pub thread_id: String,
    #[serde(default)]
    pub steps: Vec<Step>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Step {
    /// Raw `thread/read` or `thread/resume` result.
    Snapshot {
        payload: Value,
        #[serde(default)]
        prefer_local: bool,
    },
    Notification {
        method: String,
        #[serde(default)]
        params: Value,
    },
    /// Move the virtual clock forward.
    Advance { ms: u64 },
    /// A locally sent prompt, optionally bound to the turn the server started.
    Send {
        text: String,
        #[serde(default)]
        attachments: Vec<Attachment>,
        #[serde(default)]
        turn_id: Option<String>,
    },
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StepReport {
    Snapshot {
        #[serde(flatten)]
        apply: SnapshotApply,
    },
    Notification {
        method: String,
        /// `None` for methods without a model or notifications for other threads.
        outcome: Option<EventOutcome>,
    },
    Advance {
        elapsed_ms: u64,
    },
    Send {
        user_message_id: MessageId,
        placeholder_id: MessageId,
        bound: Option<MessageId>,
    },
}

#[derive(Debug, Clone, Serialize)]
pub struct ReplayReport {
    pub thread_id: String,
    pub active_turn_id: Option<String>,
    pub messages: Vec<Message>,
    pub steps: Vec<StepReport>,
}

pub fn load_script(path: &Path) -> Result<Script, ReplayError> {
    let raw = std::fs::read_to_string(path).map_err(|source| ReplayError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    Ok(serde_json::from_str(&raw)?)
}

/// Run every step of `script` against a fresh conversation.
pub fn run_script(script: &Script, config: ReconcileConfig) -> Result<ReplayReport, ReplayError> {
    let mut state = ConversationState::new(script.thread_id.clone(), config);
    let origin = Instant::now();
    let mut elapsed = Duration::ZERO;
    let mut steps = Vec::with_capacity(script.steps.len());

    for (index, step) in script.steps.iter().enumerate() {
        let now = origin
            .checked_add(elapsed)
            .ok_or(ReplayError::ClockOverflow { step: index })?;
        let report = match step {
            Step::Snapshot {
                payload,
                prefer_local,
            } => {
                let snapshot = decode_snapshot(payload)
                    .map_err(|source| ReplayError::Protocol { step: index, source })?;
                StepReport::Snapshot {
                    apply: state.apply_snapshot(&snapshot, *prefer_local, now),
                }
            }
            Step::Notification { method, params } => {
                let decoded = decode_notification(method, params)
                    .map_err(|source| ReplayError::Protocol { step: index, source })?;
                let outcome = match decoded {
                    Some(n) if n.thread_id == script.thread_id => {
                        Some(state.apply_event(&n.event, now))
                    }
                    Some(n) => {
                        debug!(
                            step = index,
                            thread_id = %n.thread_id,
                            "skipping notification for another thread"
                        );
                        None
                    }
                    None => None,
                };
                StepReport::Notification {
                    method: method.clone(),
                    outcome,
                }
            }
            Step::Advance { ms } => {
                elapsed = elapsed
                    .checked_add(Duration::from_millis(*ms))
                    .ok_or(ReplayError::ClockOverflow { step: index })?;
                StepReport::Advance {
                    elapsed_ms: u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX),
                }
            }
            Step::Send {
                text,
                attachments,
                turn_id,
            } => {
                let (user_message_id, placeholder_id) = state
                    .begin_local_turn(text, attachments.clone())
                    .map_err(|source| ReplayError::Transcript { step: index, source })?;
                let bound = turn_id
                    .as_deref()
                    .and_then(|turn| state.bind_started_turn(turn, now));
                StepReport::Send {
                    user_message_id,
                    placeholder_id,
                    bound,
                }
            }
        };
        steps.push(report);
    }

    Ok(ReplayReport {
        thread_id: script.thread_id.clone(),
        active_turn_id: state.active_turn_id().map(str::to_string),
        messages: state.messages().to_vec(),
        steps,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_script_steps_deserialize_by_type() {
        let script: Script = serde_json::from_value(json!({
            "thread_id": "thr_1",
            "steps": [
                { "type": "advance", "ms": 500 },
                { "type": "send", "text": "hi", "turn_id": "t1" },
                { "type": "notification", "method": "turn/completed", "params": {} }
            ]
        }))
        .unwrap();
        assert_eq!(script.steps.len(), 3);
        assert!(matches!(script.steps[0], Step::Advance { ms: 500 }));
        assert!(matches!(
            &script.steps[1],
            Step::Send { turn_id: Some(t), .. } if t == "t1"
        ));
    }

    #[test]
    fn test_advance_accumulates_virtual_time() {
        let script: Script = serde_json::from_value(json!({
            "thread_id": "thr_1",
            "steps": [{ "type": "advance", "ms": 500 }, { "type": "advance", "ms": 250 }]
        }))
        .unwrap();
        let report = run_script(&script, ReconcileConfig::default()).unwrap();
        assert!(matches!(
            report.steps[1],
            StepReport::Advance { elapsed_ms: 750 }
        ));
        assert!(report.messages.is_empty());
    }
}
