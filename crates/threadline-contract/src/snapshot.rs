//! Remote-authoritative thread snapshots.

use crate::item::{Item, ItemKind};
use serde::{Deserialize, Serialize};

/// Turn progression.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TurnStatus {
    #[default]
    Pending,
    InProgress,
    Completed,
    Interrupted,
    Failed,
}

impl TurnStatus {
    pub fn parse(raw: &str) -> Self {
        let normalized: String = raw
            .chars()
            .filter(|c| c.is_ascii_alphanumeric())
            .flat_map(char::to_lowercase)
            .collect();
        match normalized.as_str() {
            "inprogress" | "running" | "active" | "started" => Self::InProgress,
            "completed" | "complete" | "done" | "finished" => Self::Completed,
            "interrupted" | "cancelled" | "canceled" | "aborted" => Self::Interrupted,
            "failed" | "error" => Self::Failed,
            _ => Self::Pending,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Interrupted | Self::Failed)
    }
}

/// One request/response cycle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Turn {
    pub id: String,
    pub status: TurnStatus,
    #[serde(default)]
    pub items: Vec<Item>,
}

impl Turn {
    pub fn new(id: impl Into<String>, status: TurnStatus) -> Self {
        Self {
            id: id.into(),
            status,
            items: Vec::new(),
        }
    }

    #[must_use]
    pub fn with_item(mut self, item: Item) -> Self {
        self.items.push(item);
        self
    }
}

/// A reconstruction of a thread at one point in time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Snapshot {
    pub thread_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cwd: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<i64>,
    #[serde(default)]
    pub active_turn_id: Option<String>,
    #[serde(default)]
    pub turns: Vec<Turn>,
}

impl Snapshot {
    pub fn new(thread_id: impl Into<String>) -> Self {
        Self {
            thread_id: thread_id.into(),
            cwd: None,
            created_at: None,
            active_turn_id: None,
            turns: Vec::new(),
        }
    }

    #[must_use]
    pub fn with_turn(mut self, turn: Turn) -> Self {
        self.turns.push(turn);
        self
    }

    #[must_use]
    pub fn with_active_turn(mut self, turn_id: impl Into<String>) -> Self {
        self.active_turn_id = Some(turn_id.into());
        self
    }

    pub fn has_turn(&self, turn_id: &str) -> bool {
        self.turns.iter().any(|t| t.id == turn_id)
    }

    pub fn item_count(&self) -> usize {
        self.turns.iter().map(|t| t.items.len()).sum()
    }

    /// Items rendered as tool call segments.
    pub fn tool_call_count(&self) -> usize {
        self.items().filter(|i| i.kind().is_tool_like()).count()
    }

    /// Agent messages with renderable text.
    pub fn assistant_message_count(&self) -> usize {
        self.items()
            .filter(|i| i.kind() == ItemKind::AgentMessage && !i.is_structurally_empty())
            .count()
    }

    fn items(&self) -> impl Iterator<Item = &Item> {
        self.turns.iter().flat_map(|t| t.items.iter())
    }
}
