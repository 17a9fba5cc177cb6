//! Thread items and the classifier that turns untyped remote payloads into them.

use crate::event::{render_plan, PlanStep};
use crate::transcript::{Attachment, ToolCallStatus};
use crate::wire::{first_str, first_value, text_from_parts};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::warn;

/// Closed set of item kinds. Part of every reconciliation key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemKind {
    UserMessage,
    AgentMessage,
    Plan,
    Reasoning,
    CommandExecution,
    FileChange,
    ToolCall,
    Unknown,
}

impl ItemKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::UserMessage => "user_message",
            Self::AgentMessage => "agent_message",
            Self::Plan => "plan",
            Self::Reasoning => "reasoning",
            Self::CommandExecution => "command_execution",
            Self::FileChange => "file_change",
            Self::ToolCall => "tool_call",
            Self::Unknown => "unknown",
        }
    }

    /// Kinds rendered as tool call segments.
    pub fn is_tool_like(self) -> bool {
        matches!(
            self,
            Self::CommandExecution | Self::FileChange | Self::ToolCall
        )
    }
}

impl std::fmt::Display for ItemKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A classified thread item.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Item {
    UserMessage {
        id: Option<String>,
        text: String,
        #[serde(default)]
        attachments: Vec<Attachment>,
    },
    AgentMessage {
        id: Option<String>,
        text: String,
    },
    Plan {
        id: Option<String>,
        text: String,
    },
    Reasoning {
        id: Option<String>,
        text: String,
    },
    CommandExecution {
        id: Option<String>,
        command: String,
        status: ToolCallStatus,
        output: Option<String>,
        exit_code: Option<i64>,
    },
    FileChange {
        id: Option<String>,
        paths: Vec<String>,
        status: ToolCallStatus,
        diff: Option<String>,
    },
    ToolCall {
        id: Option<String>,
        name: String,
        server: Option<String>,
        status: ToolCallStatus,
        output: Option<String>,
    },
    Unknown {
        id: Option<String>,
        item_type: String,
    },
}

impl Item {
    pub fn id(&self) -> Option<&str> {
        match self {
            Self::UserMessage { id, .. }
            | Self::AgentMessage { id, .. }
            | Self::Plan { id, .. }
            | Self::Reasoning { id, .. }
            | Self::CommandExecution { id, .. }
            | Self::FileChange { id, .. }
            | Self::ToolCall { id, .. }
            | Self::Unknown { id, .. } => id.as_deref(),
        }
    }

    pub fn kind(&self) -> ItemKind {
        match self {
            Self::UserMessage { .. } => ItemKind::UserMessage,
            Self::AgentMessage { .. } => ItemKind::AgentMessage,
            Self::Plan { .. } => ItemKind::Plan,
            Self::Reasoning { .. } => ItemKind::Reasoning,
            Self::CommandExecution { .. } => ItemKind::CommandExecution,
            Self::FileChange { .. } => ItemKind::FileChange,
            Self::ToolCall { .. } => ItemKind::ToolCall,
            Self::Unknown { .. } => ItemKind::Unknown,
        }
    }

    /// True when the item carries nothing worth rendering.
    ///
    /// User messages are never considered empty: an attachment-only or blank
    /// prompt still anchors its turn.
    pub fn is_structurally_empty(&self) -> bool {
        match self {
            Self::UserMessage { .. } => false,
            Self::AgentMessage { text, .. } | Self::Plan { text, .. } | Self::Reasoning { text, .. } => {
                text.trim().is_empty()
            }
            Self::CommandExecution {
                command, output, ..
            } => command.trim().is_empty() && is_blank(output),
            Self::FileChange { paths, diff, .. } => paths.is_empty() && is_blank(diff),
            Self::ToolCall { name, output, .. } => name.trim().is_empty() && is_blank(output),
            Self::Unknown { .. } => true,
        }
    }
}

fn is_blank(value: &Option<String>) -> bool {
    value.as_deref().map_or(true, |v| v.trim().is_empty())
}

/// Parse an untyped remote item payload.
///
/// Dispatches on the explicit `type` tag first, then falls back to substring
/// matching on the normalized tag so renamed server item types still land in
/// the right variant. Anything else becomes [`Item::Unknown`].
pub fn classify(raw: &Value) -> Item {
    let id = first_str(raw, &["id", "itemId", "item_id"]).map(str::to_string);
    let item_type = first_str(raw, &["type", "kind", "itemType", "item_type"]).unwrap_or_default();
    let normalized = normalize_type(item_type);

    let kind = match exact_kind(&normalized) {
        Some(kind) => kind,
        None => match fuzzy_kind(&normalized) {
            Some(kind) => kind,
            None => {
                warn!(item_type, item_id = ?id, "unrecognized thread item type");
                return Item::Unknown {
                    id,
                    item_type: item_type.to_string(),
                };
            }
        },
    };

    match kind {
        ItemKind::UserMessage => Item::UserMessage {
            id,
            text: message_text(raw),
            attachments: attachments(raw),
        },
        ItemKind::AgentMessage => Item::AgentMessage {
            id,
            text: message_text(raw),
        },
        ItemKind::Plan => Item::Plan {
            id,
            text: plan_text(raw),
        },
        ItemKind::Reasoning => Item::Reasoning {
            id,
            text: reasoning_text(raw),
        },
        ItemKind::CommandExecution => Item::CommandExecution {
            id,
            command: command_text(raw),
            status: status(raw),
            output: first_str(raw, &["aggregatedOutput", "aggregated_output", "output", "stdout"])
                .map(str::to_string),
            exit_code: first_value(raw, &["exitCode", "exit_code"]).and_then(Value::as_i64),
        },
        ItemKind::FileChange => {
            let (paths, diff) = file_changes(raw);
            Item::FileChange {
                id,
                paths,
                status: status(raw),
                diff,
            }
        }
        ItemKind::ToolCall => Item::ToolCall {
            id,
            name: first_str(raw, &["tool", "name", "toolName", "tool_name"])
                .unwrap_or_default()
                .to_string(),
            server: first_str(raw, &["server", "serverName"]).map(str::to_string),
            status: status(raw),
            output: tool_output(raw),
        },
        ItemKind::Unknown => Item::Unknown {
            id,
            item_type: item_type.to_string(),
        },
    }
}

fn normalize_type(raw: &str) -> String {
    raw.chars()
        .filter(|c| c.is_ascii_alphanumeric())
        .flat_map(char::to_lowercase)
        .collect()
}

fn exact_kind(normalized: &str) -> Option<ItemKind> {
    let kind = match normalized {
        "usermessage" | "userinput" => ItemKind::UserMessage,
        "agentmessage" | "assistantmessage" => ItemKind::AgentMessage,
        "plan" | "todolist" => ItemKind::Plan,
        "reasoning" => ItemKind::Reasoning,
        "commandexecution" => ItemKind::CommandExecution,
        "filechange" => ItemKind::FileChange,
        "mcptoolcall" | "toolcall" | "dynamictoolcall" | "functioncall" | "websearch" => {
            ItemKind::ToolCall
        }
        _ => return None,
    };
    Some(kind)
}

fn fuzzy_kind(normalized: &str) -> Option<ItemKind> {
    if normalized.is_empty() {
        return None;
    }
    let has = |needle: &str| normalized.contains(needle);
    if has("reason") || has("thought") {
        Some(ItemKind::Reasoning)
    } else if has("exec") || has("shell") || has("command") {
        Some(ItemKind::CommandExecution)
    } else if has("file") || has("diff") || has("patch") {
        Some(ItemKind::FileChange)
    } else if has("tool") || has("function") {
        Some(ItemKind::ToolCall)
    } else if has("plan") || has("todo") {
        Some(ItemKind::Plan)
    } else if has("user") {
        Some(ItemKind::UserMessage)
    } else if has("agent") || has("assistant") {
        Some(ItemKind::AgentMessage)
    } else {
        None
    }
}

fn message_text(raw: &Value) -> String {
    if let Some(text) = first_str(raw, &["text", "message"]) {
        return text.to_string();
    }
    raw.get("content").map(text_from_parts).unwrap_or_default()
}

fn attachments(raw: &Value) -> Vec<Attachment> {
    let Some(parts) = raw.get("content").and_then(Value::as_array) else {
        return Vec::new();
    };
    parts
        .iter()
        .filter_map(|part| {
            let part_type = normalize_type(first_str(part, &["type"]).unwrap_or_default());
            if part_type == "text" {
                return None;
            }
            let uri = first_str(part, &["url", "path", "uri", "imageUrl", "image_url"])?;
            let name = first_str(part, &["name", "filename"])
                .map(str::to_string)
                .unwrap_or_else(|| uri.rsplit('/').next().unwrap_or(uri).to_string());
            let mime_type = first_str(part, &["mimeType", "mime_type"])
                .map(str::to_string)
                .or_else(|| part_type.contains("image").then(|| "image/*".to_string()));
            Some(Attachment {
                name,
                mime_type,
                uri: Some(uri.to_string()),
            })
        })
        .collect()
}

fn plan_text(raw: &Value) -> String {
    if let Some(text) = first_str(raw, &["text"]) {
        return text.to_string();
    }
    let steps = first_value(raw, &["steps", "plan", "items"])
        .and_then(|v| serde_json::from_value::<Vec<PlanStep>>(v.clone()).ok())
        .unwrap_or_default();
    render_plan(&steps)
}

fn reasoning_text(raw: &Value) -> String {
    if let Some(text) = first_str(raw, &["text"]) {
        return text.to_string();
    }
    for key in ["summary", "content"] {
        if let Some(value) = raw.get(key) {
            let text = text_from_parts(value);
            if !text.is_empty() {
                return text;
            }
        }
    }
    String::new()
}

fn command_text(raw: &Value) -> String {
    match first_value(raw, &["command", "cmd"]) {
        Some(Value::String(cmd)) => cmd.clone(),
        Some(Value::Array(argv)) => argv
            .iter()
            .filter_map(Value::as_str)
            .collect::<Vec<_>>()
            .join(" "),
        _ => String::new(),
    }
}

fn status(raw: &Value) -> ToolCallStatus {
    first_str(raw, &["status", "state"])
        .map(ToolCallStatus::parse)
        .unwrap_or_default()
}

fn file_changes(raw: &Value) -> (Vec<String>, Option<String>) {
    let mut paths = Vec::new();
    let mut diffs = Vec::new();
    if let Some(changes) = raw.get("changes").and_then(Value::as_array) {
        for change in changes {
            if let Some(path) = first_str(change, &["path", "file"]) {
                paths.push(path.to_string());
            }
            if let Some(diff) = first_str(change, &["diff", "unifiedDiff", "patch"]) {
                diffs.push(diff.to_string());
            }
        }
    } else if let Some(obj) = raw.get("changes").and_then(Value::as_object) {
        // Older payloads key the changes by path.
        let mut keys: Vec<&String> = obj.keys().collect();
        keys.sort();
        paths.extend(keys.into_iter().cloned());
    }
    if let Some(path) = first_str(raw, &["path"]) {
        paths.push(path.to_string());
    }
    let diff = if diffs.is_empty() {
        first_str(raw, &["diff", "patch"]).map(str::to_string)
    } else {
        Some(diffs.join("\n"))
    };
    (paths, diff)
}

fn tool_output(raw: &Value) -> Option<String> {
    if let Some(error) = raw.get("error").filter(|e| !e.is_null()) {
        if let Some(message) = first_str(error, &["message"]).or_else(|| error.as_str()) {
            return Some(message.to_string());
        }
    }
    match first_value(raw, &["result", "output"])? {
        Value::Null => None,
        Value::String(s) => Some(s.clone()),
        other => {
            let text = other.get("content").map(text_from_parts).unwrap_or_default();
            if text.is_empty() {
                Some(other.to_string())
            } else {
                Some(text)
            }
        }
    }
}
