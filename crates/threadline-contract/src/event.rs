//! Live push events delivered for a thread.

use crate::item::Item;
use crate::snapshot::TurnStatus;
use serde::{Deserialize, Serialize};

/// Status of one plan step.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum PlanStepStatus {
    #[default]
    Pending,
    #[serde(alias = "in_progress")]
    InProgress,
    Completed,
}

/// One entry of a turn plan.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlanStep {
    pub step: String,
    #[serde(default)]
    pub status: PlanStepStatus,
}

/// Render plan steps as a markdown checklist.
pub fn render_plan(steps: &[PlanStep]) -> String {
    steps
        .iter()
        .map(|s| {
            let mark = match s.status {
                PlanStepStatus::Completed => "[x]",
                PlanStepStatus::InProgress => "[~]",
                PlanStepStatus::Pending => "[ ]",
            };
            format!("- {mark} {}", s.step)
        })
        .collect::<Vec<_>>()
        .join("\n")
}

/// Thread events for streaming execution.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ThreadEvent {
    /// Agent message text delta.
    MessageDelta {
        turn_id: Option<String>,
        item_id: Option<String>,
        delta: String,
    },
    /// Reasoning text delta.
    ReasoningDelta {
        turn_id: Option<String>,
        item_id: Option<String>,
        delta: String,
    },
    /// Plan item text delta.
    PlanDelta {
        turn_id: Option<String>,
        item_id: Option<String>,
        delta: String,
    },
    /// Streaming output of a command or tool call.
    ToolOutputDelta {
        turn_id: Option<String>,
        item_id: String,
        delta: String,
    },
    /// Item started.
    ItemStarted { turn_id: Option<String>, item: Item },
    /// Item completed.
    ItemCompleted { turn_id: Option<String>, item: Item },
    /// Whole-turn plan replaced.
    TurnPlanUpdated {
        turn_id: Option<String>,
        explanation: Option<String>,
        steps: Vec<PlanStep>,
    },
    /// Turn started.
    TurnStarted { turn_id: String },
    /// Turn reached a terminal status.
    TurnCompleted { turn_id: String, status: TurnStatus },
    /// Error reported by the remote agent.
    Error {
        turn_id: Option<String>,
        message: String,
        /// `true` when the remote will retry on its own; the turn stays active.
        will_retry: bool,
    },
}

impl ThreadEvent {
    pub fn turn_id(&self) -> Option<&str> {
        match self {
            Self::MessageDelta { turn_id, .. }
            | Self::ReasoningDelta { turn_id, .. }
            | Self::PlanDelta { turn_id, .. }
            | Self::ToolOutputDelta { turn_id, .. }
            | Self::ItemStarted { turn_id, .. }
            | Self::ItemCompleted { turn_id, .. }
            | Self::TurnPlanUpdated { turn_id, .. }
            | Self::Error { turn_id, .. } => turn_id.as_deref(),
            Self::TurnStarted { turn_id } | Self::TurnCompleted { turn_id, .. } => Some(turn_id),
        }
    }

    /// Events that close their turn.
    pub fn is_terminal(&self) -> bool {
        match self {
            Self::TurnCompleted { .. } => true,
            Self::Error { will_retry, .. } => !will_retry,
            _ => false,
        }
    }
}

/// A thread event tagged with the thread it belongs to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ThreadNotification {
    pub thread_id: String,
    pub event: ThreadEvent,
}

impl ThreadNotification {
    pub fn new(thread_id: impl Into<String>, event: ThreadEvent) -> Self {
        Self {
            thread_id: thread_id.into(),
            event,
        }
    }
}
