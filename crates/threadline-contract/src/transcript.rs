//! Rendered transcript types: messages and their typed segments.

use serde::{Deserialize, Serialize};

/// Locally unique message identifier.
pub type MessageId = String;

/// Message role.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
    System,
}

/// Lifecycle of a tool call segment.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolCallStatus {
    #[default]
    Pending,
    InProgress,
    Completed,
    Failed,
}

impl ToolCallStatus {
    /// Parse a remote status string. Unknown values map to `InProgress`.
    pub fn parse(raw: &str) -> Self {
        let normalized: String = raw
            .chars()
            .filter(|c| c.is_ascii_alphanumeric())
            .flat_map(char::to_lowercase)
            .collect();
        match normalized.as_str() {
            "pending" | "queued" => Self::Pending,
            "completed" | "complete" | "done" | "success" | "succeeded" => Self::Completed,
            "failed" | "error" | "declined" | "cancelled" | "canceled" => Self::Failed,
            _ => Self::InProgress,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

/// What kind of work a tool call segment represents.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolCallKind {
    Command,
    FileChange,
    #[default]
    Tool,
}

/// A tool invocation rendered inside an assistant message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolCallSegment {
    /// Stable tool call id (the remote item id).
    pub id: String,
    pub title: String,
    pub kind: ToolCallKind,
    pub status: ToolCallStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<String>,
}

impl ToolCallSegment {
    pub fn new(id: impl Into<String>, title: impl Into<String>, kind: ToolCallKind) -> Self {
        Self {
            id: id.into(),
            title: title.into(),
            kind,
            status: ToolCallStatus::Pending,
            output: None,
        }
    }

    #[must_use]
    pub fn with_status(mut self, status: ToolCallStatus) -> Self {
        self.status = status;
        self
    }

    #[must_use]
    pub fn with_output(mut self, output: impl Into<String>) -> Self {
        self.output = Some(output.into());
        self
    }

    /// Whether the call carries non-empty output.
    pub fn has_output(&self) -> bool {
        self.output.as_deref().is_some_and(|o| !o.is_empty())
    }
}

/// A typed fragment of a message.
///
/// Text-like segments remember the remote item they were built from so live
/// updates for that item land on the same segment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Segment {
    Text {
        text: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        item_id: Option<String>,
    },
    Thought {
        text: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        item_id: Option<String>,
    },
    Plan {
        text: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        item_id: Option<String>,
    },
    ToolCall(ToolCallSegment),
    /// Transient informational entry (for example a "will retry" error).
    Notice { text: String },
}

impl Segment {
    pub fn text(text: impl Into<String>) -> Self {
        Self::Text {
            text: text.into(),
            item_id: None,
        }
    }

    /// Text content of text-like segments; `None` for tool calls.
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text { text, .. }
            | Self::Thought { text, .. }
            | Self::Plan { text, .. }
            | Self::Notice { text } => Some(text),
            Self::ToolCall(_) => None,
        }
    }

    pub fn item_id(&self) -> Option<&str> {
        match self {
            Self::Text { item_id, .. } | Self::Thought { item_id, .. } | Self::Plan { item_id, .. } => {
                item_id.as_deref()
            }
            Self::ToolCall(call) => Some(&call.id),
            Self::Notice { .. } => None,
        }
    }

    pub fn as_tool_call(&self) -> Option<&ToolCallSegment> {
        match self {
            Self::ToolCall(call) => Some(call),
            _ => None,
        }
    }

    /// Whether this segment would render anything.
    pub fn is_renderable(&self) -> bool {
        match self {
            Self::ToolCall(_) => true,
            other => other.as_text().is_some_and(|t| !t.trim().is_empty()),
        }
    }
}

/// File or image attached to a user message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attachment {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mime_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uri: Option<String>,
}

/// Generate a time-ordered UUID v7 message identifier.
pub fn gen_message_id() -> MessageId {
    uuid::Uuid::now_v7().to_string()
}

/// A message in the rendered transcript.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    /// Stable message identifier (UUID v7, auto-generated).
    pub id: MessageId,
    pub role: Role,
    #[serde(default)]
    pub segments: Vec<Segment>,
    #[serde(default)]
    pub is_streaming: bool,
    #[serde(default)]
    pub is_error: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub attachments: Vec<Attachment>,
}

impl Message {
    fn with_role(role: Role, segments: Vec<Segment>) -> Self {
        Self {
            id: gen_message_id(),
            role,
            segments,
            is_streaming: false,
            is_error: false,
            attachments: Vec::new(),
        }
    }

    /// Create a user message.
    pub fn user(text: impl Into<String>) -> Self {
        Self::with_role(Role::User, vec![Segment::text(text)])
    }

    /// Create an assistant message with a single text segment.
    pub fn assistant(text: impl Into<String>) -> Self {
        Self::with_role(Role::Assistant, vec![Segment::text(text)])
    }

    /// Create an assistant message from explicit segments.
    pub fn assistant_with_segments(segments: Vec<Segment>) -> Self {
        Self::with_role(Role::Assistant, segments)
    }

    /// Create an empty assistant message marked as streaming.
    pub fn streaming_placeholder() -> Self {
        let mut message = Self::with_role(Role::Assistant, Vec::new());
        message.is_streaming = true;
        message
    }

    /// Create a system message.
    pub fn system(text: impl Into<String>) -> Self {
        Self::with_role(Role::System, vec![Segment::text(text)])
    }

    /// Create a system message flagged as an error entry.
    pub fn error(text: impl Into<String>) -> Self {
        let mut message = Self::system(text);
        message.is_error = true;
        message
    }

    #[must_use]
    pub fn with_id(mut self, id: impl Into<MessageId>) -> Self {
        self.id = id.into();
        self
    }

    #[must_use]
    pub fn with_attachments(mut self, attachments: Vec<Attachment>) -> Self {
        self.attachments = attachments;
        self
    }

    /// Concatenated text of the `Text` segments.
    pub fn text(&self) -> String {
        self.segments
            .iter()
            .filter_map(|s| match s {
                Segment::Text { text, .. } => Some(text.as_str()),
                _ => None,
            })
            .collect::<Vec<_>>()
            .join("\n")
    }

    /// Concatenated text of every text-like segment except notices.
    pub fn content_text(&self) -> String {
        self.segments
            .iter()
            .filter(|s| !matches!(s, Segment::Notice { .. }))
            .filter_map(Segment::as_text)
            .collect::<Vec<_>>()
            .join("\n")
    }

    pub fn tool_calls(&self) -> impl Iterator<Item = &ToolCallSegment> {
        self.segments.iter().filter_map(Segment::as_tool_call)
    }

    pub fn tool_call_count(&self) -> usize {
        self.tool_calls().count()
    }

    pub fn is_renderable(&self) -> bool {
        self.segments.iter().any(Segment::is_renderable) || !self.attachments.is_empty()
    }

    pub fn is_empty(&self) -> bool {
        !self.is_renderable()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tool_call_status_parses_remote_vocabulary() {
        assert_eq!(ToolCallStatus::parse("inProgress"), ToolCallStatus::InProgress);
        assert_eq!(ToolCallStatus::parse("in_progress"), ToolCallStatus::InProgress);
        assert_eq!(ToolCallStatus::parse("completed"), ToolCallStatus::Completed);
        assert_eq!(ToolCallStatus::parse("Declined"), ToolCallStatus::Failed);
        assert_eq!(ToolCallStatus::parse("queued"), ToolCallStatus::Pending);
    }

    #[test]
    fn placeholder_is_streaming_and_empty() {
        let msg = Message::streaming_placeholder();
        assert!(msg.is_streaming);
        assert!(msg.is_empty());
        assert_eq!(msg.role, Role::Assistant);
    }

    #[test]
    fn notice_segments_do_not_count_as_content() {
        let mut msg = Message::assistant("done");
        msg.segments.push(Segment::Notice {
            text: "retrying".into(),
        });
        assert_eq!(msg.content_text(), "done");
    }

    #[test]
    fn segment_serializes_with_kind_tag() {
        let seg = Segment::ToolCall(
            ToolCallSegment::new("c1", "run tests", ToolCallKind::Command)
                .with_status(ToolCallStatus::Completed),
        );
        let json = serde_json::to_value(&seg).unwrap();
        assert_eq!(json["type"], "tool_call");
        assert_eq!(json["kind"], "command");
        assert_eq!(json["id"], "c1");
        assert_eq!(json["status"], "completed");
    }
}
