use crate::error::TranscriptError;
use std::collections::HashSet;
use threadline_contract::{Message, MessageId, Role, Segment};

/// Ordered, rendered transcript of one session.
///
/// Message ids are unique and at most one message is streaming at a time.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TranscriptStore {
    messages: Vec<Message>,
}

impl TranscriptStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_messages(messages: Vec<Message>) -> Result<Self, TranscriptError> {
        check_unique(&messages)?;
        let mut store = Self { messages };
        store.normalize_streaming();
        Ok(store)
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn get(&self, id: &str) -> Option<&Message> {
        self.messages.iter().find(|m| m.id == id)
    }

    pub fn get_mut(&mut self, id: &str) -> Option<&mut Message> {
        self.messages.iter_mut().find(|m| m.id == id)
    }

    pub fn position(&self, id: &str) -> Option<usize> {
        self.messages.iter().position(|m| m.id == id)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.position(id).is_some()
    }

    pub fn push(&mut self, message: Message) -> Result<(), TranscriptError> {
        if self.contains(&message.id) {
            return Err(TranscriptError::DuplicateMessageId(message.id));
        }
        let streaming = message.is_streaming;
        let id = message.id.clone();
        self.messages.push(message);
        if streaming {
            self.set_streaming(&id)?;
        }
        Ok(())
    }

    /// Insert `message` directly before `anchor`.
    pub fn insert_before(&mut self, anchor: &str, message: Message) -> Result<(), TranscriptError> {
        if self.contains(&message.id) {
            return Err(TranscriptError::DuplicateMessageId(message.id));
        }
        let at = self
            .position(anchor)
            .ok_or_else(|| TranscriptError::UnknownMessage(anchor.to_string()))?;
        let streaming = message.is_streaming;
        let id = message.id.clone();
        self.messages.insert(at, message);
        if streaming {
            self.set_streaming(&id)?;
        }
        Ok(())
    }

    pub fn remove(&mut self, id: &str) -> Option<Message> {
        let at = self.position(id)?;
        Some(self.messages.remove(at))
    }

    /// Replace the whole transcript atomically.
    pub fn replace_all(&mut self, messages: Vec<Message>) -> Result<(), TranscriptError> {
        check_unique(&messages)?;
        self.messages = messages;
        self.normalize_streaming();
        Ok(())
    }

    pub fn reset(&mut self) {
        self.messages.clear();
    }

    /// The message currently marked streaming, if any.
    pub fn streaming_id(&self) -> Option<&MessageId> {
        self.messages.iter().find(|m| m.is_streaming).map(|m| &m.id)
    }

    /// Mark `id` as the single streaming message.
    pub fn set_streaming(&mut self, id: &str) -> Result<(), TranscriptError> {
        if !self.contains(id) {
            return Err(TranscriptError::UnknownMessage(id.to_string()));
        }
        for message in &mut self.messages {
            message.is_streaming = message.id == id;
        }
        Ok(())
    }

    pub fn clear_streaming(&mut self) {
        for message in &mut self.messages {
            message.is_streaming = false;
        }
    }

    /// Visible reply texts across assistant messages, counted per remote
    /// item: one live message can stream several agent items, and text
    /// segments sharing an item id count once.
    pub fn assistant_text_count(&self) -> usize {
        self.messages
            .iter()
            .filter(|m| m.role == Role::Assistant)
            .map(reply_text_count)
            .sum()
    }

    pub fn tool_call_count(&self) -> usize {
        self.messages.iter().map(Message::tool_call_count).sum()
    }

    // Keep only the last streaming flag when several are set.
    fn normalize_streaming(&mut self) {
        if let Some(last) = self.messages.iter().rposition(|m| m.is_streaming) {
            for (i, message) in self.messages.iter_mut().enumerate() {
                message.is_streaming = i == last;
            }
        }
    }
}

fn reply_text_count(message: &Message) -> usize {
    let mut seen = HashSet::new();
    message
        .segments
        .iter()
        .filter(|s| matches!(s, Segment::Text { .. }) && s.is_renderable())
        .filter(|s| s.item_id().map_or(true, |id| seen.insert(id)))
        .count()
}

fn check_unique(messages: &[Message]) -> Result<(), TranscriptError> {
    let mut seen = HashSet::with_capacity(messages.len());
    for message in messages {
        if !seen.insert(message.id.as_str()) {
            return Err(TranscriptError::DuplicateMessageId(message.id.clone()));
        }
    }
    Ok(())
}
