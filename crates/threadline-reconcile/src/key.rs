//! Reconciliation keys and the key <-> message index.
//!
//! A key identifies "the same logical entry" across snapshots. The index is a
//! partial bijection: one key per message, one message per key.

use serde::{Deserialize, Serialize};
use std::borrow::Cow;
use std::collections::HashMap;
use std::fmt;
use threadline_contract::{ItemKind, MessageId};

/// Stable identity for one remote item, derived from its turn, kind, and
/// id (or position within the turn when the item has no id).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ReconciliationKey(String);

impl ReconciliationKey {
    pub fn derive(turn_id: &str, kind: ItemKind, item_id: Option<&str>, index: usize) -> Self {
        let turn = escape(turn_id);
        match item_id.filter(|id| !id.is_empty()) {
            Some(id) => Self(format!("turn:{turn}:{}:id:{}", kind.as_str(), escape(id))),
            None => Self(format!("turn:{turn}:{}:pos:{index}", kind.as_str())),
        }
    }

    /// Key for a live message built from events before any snapshot has
    /// described it.
    pub fn live(turn_id: &str) -> Self {
        Self(format!("{}live", turn_prefix(turn_id)))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn belongs_to_turn(&self, turn_id: &str) -> bool {
        self.0.starts_with(&turn_prefix(turn_id))
    }
}

impl fmt::Display for ReconciliationKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Prefix shared by every key derived for `turn_id`.
pub fn turn_prefix(turn_id: &str) -> String {
    format!("turn:{}:", escape(turn_id))
}

// Separators inside ids would make distinct ids collide after formatting.
fn escape(raw: &str) -> Cow<'_, str> {
    if raw.contains([':', '%']) {
        Cow::Owned(raw.replace('%', "%25").replace(':', "%3A"))
    } else {
        Cow::Borrowed(raw)
    }
}

/// Bidirectional key <-> message map.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct KeyIndex {
    by_key: HashMap<ReconciliationKey, MessageId>,
    by_message: HashMap<MessageId, ReconciliationKey>,
}

impl KeyIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.by_key.is_empty()
    }

    pub fn len(&self) -> usize {
        self.by_key.len()
    }

    pub fn message_for(&self, key: &ReconciliationKey) -> Option<&MessageId> {
        self.by_key.get(key)
    }

    pub fn key_for(&self, message_id: &str) -> Option<&ReconciliationKey> {
        self.by_message.get(message_id)
    }

    pub fn contains_key(&self, key: &ReconciliationKey) -> bool {
        self.by_key.contains_key(key)
    }

    /// Bind `key` to `message_id`, evicting any previous binding of either side.
    pub fn bind(&mut self, key: ReconciliationKey, message_id: impl Into<MessageId>) {
        let message_id = message_id.into();
        if let Some(old_key) = self.by_message.remove(&message_id) {
            self.by_key.remove(&old_key);
        }
        if let Some(old_message) = self.by_key.remove(&key) {
            self.by_message.remove(&old_message);
        }
        self.by_message.insert(message_id.clone(), key.clone());
        self.by_key.insert(key, message_id);
    }

    pub fn unbind_message(&mut self, message_id: &str) -> Option<ReconciliationKey> {
        let key = self.by_message.remove(message_id)?;
        self.by_key.remove(&key);
        Some(key)
    }

    pub fn clear(&mut self) {
        self.by_key.clear();
        self.by_message.clear();
    }
}
