//! Turn lifecycle tracking and turn -> streaming message binding.

use crate::key::{KeyIndex, ReconciliationKey};
use crate::store::TranscriptStore;
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};
use threadline_contract::{Message, MessageId, Role, Snapshot};

const FINISHED_TURN_MEMORY: usize = 64;

/// Whether a turn is running.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum TurnState {
    #[default]
    Idle,
    TurnActive(String),
}

/// Turn state change caused by a snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", content = "turn_id", rename_all = "snake_case")]
pub enum SnapshotTransition {
    Unchanged,
    Activated(String),
    Deactivated(String),
}

/// Tracks the running turn, recent activity, and which transcript message
/// each turn streams into.
#[derive(Debug, Clone)]
pub struct TurnLifecycleTracker {
    state: TurnState,
    active_since: Option<Instant>,
    last_activity: Option<Instant>,
    bindings: HashMap<String, MessageId>,
    pending: Option<MessageId>,
    finished: VecDeque<String>,
    recency_window: Duration,
}

impl TurnLifecycleTracker {
    pub fn new(recency_window: Duration) -> Self {
        Self {
            state: TurnState::Idle,
            active_since: None,
            last_activity: None,
            bindings: HashMap::new(),
            pending: None,
            finished: VecDeque::new(),
            recency_window,
        }
    }

    pub fn state(&self) -> &TurnState {
        &self.state
    }

    pub fn active_turn_id(&self) -> Option<&str> {
        match &self.state {
            TurnState::TurnActive(id) => Some(id),
            TurnState::Idle => None,
        }
    }

    pub fn is_active(&self) -> bool {
        matches!(self.state, TurnState::TurnActive(_))
    }

    pub fn is_finished(&self, turn_id: &str) -> bool {
        self.finished.iter().any(|t| t == turn_id)
    }

    /// Message created for a turn whose id is not known yet.
    pub fn pending_message(&self) -> Option<&MessageId> {
        self.pending.as_ref()
    }

    pub fn set_pending(&mut self, message_id: impl Into<MessageId>) {
        self.pending = Some(message_id.into());
    }

    pub fn clear_pending(&mut self) -> Option<MessageId> {
        self.pending.take()
    }

    pub fn binding(&self, turn_id: &str) -> Option<&MessageId> {
        self.bindings.get(turn_id)
    }

    /// Enter `TurnActive(turn_id)`. Returns the previously active turn when
    /// this one supersedes it.
    pub fn start_turn(&mut self, turn_id: &str, now: Instant) -> Option<String> {
        if self.active_turn_id() == Some(turn_id) {
            return None;
        }
        let next = TurnState::TurnActive(turn_id.to_string());
        let previous = match std::mem::replace(&mut self.state, next) {
            TurnState::TurnActive(previous) => {
                self.bindings.remove(&previous);
                Some(previous)
            }
            TurnState::Idle => None,
        };
        self.active_since = Some(now);
        previous
    }

    pub fn record_activity(&mut self, now: Instant) {
        self.last_activity = Some(now);
    }

    /// Streaming events arrived within the recency window.
    pub fn had_recent_activity(&self, now: Instant) -> bool {
        self.last_activity
            .is_some_and(|at| now.saturating_duration_since(at) <= self.recency_window)
    }

    /// A turn is believed active and started or streamed within the window.
    pub fn was_recently_active(&self, now: Instant) -> bool {
        if !self.is_active() {
            return false;
        }
        let latest = match (self.active_since, self.last_activity) {
            (Some(a), Some(b)) => Some(a.max(b)),
            (a, b) => a.or(b),
        };
        latest.is_some_and(|at| now.saturating_duration_since(at) <= self.recency_window)
    }

    /// The snapshot predates our live turn: it reports nothing running and
    /// does not even list the turn we are streaming.
    pub fn is_stale(&self, snapshot: &Snapshot, now: Instant) -> bool {
        match self.active_turn_id() {
            Some(turn_id) => {
                self.was_recently_active(now)
                    && snapshot.active_turn_id.is_none()
                    && !snapshot.has_turn(turn_id)
            }
            None => false,
        }
    }

    /// Fold the snapshot's view of the running turn into local state.
    pub fn observe_snapshot(&mut self, snapshot: &Snapshot, now: Instant) -> SnapshotTransition {
        match (&snapshot.active_turn_id, self.active_turn_id()) {
            (Some(remote), local) if local != Some(remote.as_str()) => {
                if self.is_finished(remote) {
                    return SnapshotTransition::Unchanged;
                }
                let remote = remote.clone();
                self.start_turn(&remote, now);
                SnapshotTransition::Activated(remote)
            }
            (None, Some(local)) if !self.had_recent_activity(now) => {
                let local = local.to_string();
                self.finish_turn(&local);
                SnapshotTransition::Deactivated(local)
            }
            _ => SnapshotTransition::Unchanged,
        }
    }

    /// Leave the turn. Returns `None` when the turn already finished, so
    /// completion side effects run once.
    pub fn finish_turn(&mut self, turn_id: &str) -> Option<Option<MessageId>> {
        if self.is_finished(turn_id) {
            return None;
        }
        if self.active_turn_id() == Some(turn_id) {
            self.state = TurnState::Idle;
            self.active_since = None;
        }
        self.finished.push_back(turn_id.to_string());
        if self.finished.len() > FINISHED_TURN_MEMORY {
            self.finished.pop_front();
        }
        Some(self.bindings.remove(turn_id))
    }

    /// Resolve the message `turn_id` streams into.
    ///
    /// Lookup order: the turn's still-streaming bound message, the pending
    /// or currently streaming message, the last assistant message keyed
    /// under the turn, then (when `ensure`) a fresh placeholder appended to
    /// the transcript. The resolved message becomes the single streaming
    /// message.
    pub fn bind(
        &mut self,
        turn_id: &str,
        ensure: bool,
        store: &mut TranscriptStore,
        index: &mut KeyIndex,
    ) -> Option<MessageId> {
        let found = self
            .bindings
            .get(turn_id)
            .filter(|id| is_streaming(store, id))
            .cloned()
            .or_else(|| self.pending.take().filter(|id| store.contains(id)))
            .or_else(|| store.streaming_id().cloned())
            .or_else(|| {
                store
                    .messages()
                    .iter()
                    .rev()
                    .filter(|m| m.role == Role::Assistant)
                    .find(|m| {
                        index
                            .key_for(&m.id)
                            .is_some_and(|k| k.belongs_to_turn(turn_id))
                    })
                    .map(|m| m.id.clone())
            });

        let id = match found {
            Some(id) => id,
            None if ensure => {
                let placeholder = Message::streaming_placeholder();
                let id = placeholder.id.clone();
                store.push(placeholder).ok()?;
                id
            }
            None => return None,
        };

        store.set_streaming(&id).ok()?;
        if index.key_for(&id).is_none() {
            index.bind(ReconciliationKey::live(turn_id), id.clone());
        }
        self.bindings.insert(turn_id.to_string(), id.clone());
        Some(id)
    }

    /// Forget everything, as when switching threads.
    pub fn reset(&mut self) {
        *self = Self::new(self.recency_window);
    }
}

fn is_streaming(store: &TranscriptStore, id: &str) -> bool {
    store.get(id).is_some_and(|m| m.is_streaming)
}

#[cfg(test)]
mod tests {
    use super::*;
    use threadline_contract::{Turn, TurnStatus};

    fn tracker() -> TurnLifecycleTracker {
        TurnLifecycleTracker::new(Duration::from_secs(15))
    }

    #[test]
    fn test_finish_turn_runs_once() {
        let mut tracker = tracker();
        let now = Instant::now();
        tracker.start_turn("t1", now);
        assert!(tracker.finish_turn("t1").is_some());
        assert_eq!(tracker.state(), &TurnState::Idle);
        assert!(tracker.finish_turn("t1").is_none());
    }

    #[test]
    fn test_stale_snapshot_detection() {
        let mut tracker = tracker();
        let start = Instant::now();
        tracker.start_turn("t9", start);
        let snapshot = Snapshot::new("th").with_turn(Turn::new("t8", TurnStatus::Completed));

        assert!(tracker.is_stale(&snapshot, start + Duration::from_secs(3)));
        assert!(!tracker.is_stale(&snapshot, start + Duration::from_secs(20)));
        let listed = snapshot.clone().with_turn(Turn::new("t9", TurnStatus::InProgress));
        assert!(!tracker.is_stale(&listed, start + Duration::from_secs(3)));
    }

    #[test]
    fn test_observe_snapshot_deactivates_quiet_turn() {
        let mut tracker = tracker();
        let start = Instant::now();
        tracker.start_turn("t1", start);
        tracker.record_activity(start);
        let idle = Snapshot::new("th").with_turn(Turn::new("t1", TurnStatus::Completed));

        let soon = start + Duration::from_secs(1);
        assert_eq!(tracker.observe_snapshot(&idle, soon), SnapshotTransition::Unchanged);
        let later = start + Duration::from_secs(30);
        assert_eq!(
            tracker.observe_snapshot(&idle, later),
            SnapshotTransition::Deactivated("t1".into())
        );
        let active = idle.clone().with_active_turn("t1");
        assert_eq!(tracker.observe_snapshot(&active, later), SnapshotTransition::Unchanged);
    }

    #[test]
    fn test_bind_prefers_streaming_then_creates_placeholder() {
        let mut tracker = tracker();
        let mut store = TranscriptStore::new();
        let mut index = KeyIndex::new();

        assert!(tracker.bind("t1", false, &mut store, &mut index).is_none());
        let id = tracker.bind("t1", true, &mut store, &mut index).unwrap();
        assert_eq!(store.len(), 1);
        assert_eq!(store.streaming_id(), Some(&id));
        assert_eq!(index.key_for(&id), Some(&ReconciliationKey::live("t1")));

        let again = tracker.bind("t1", true, &mut store, &mut index).unwrap();
        assert_eq!(again, id);
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_bind_recovers_message_by_turn_key_after_restart() {
        let mut tracker = tracker();
        let mut store = TranscriptStore::new();
        let mut index = KeyIndex::new();
        store.push(Message::assistant("partial").with_id("a1")).unwrap();
        index.bind(
            ReconciliationKey::derive("t1", threadline_contract::ItemKind::AgentMessage, Some("x"), 0),
            "a1",
        );

        let id = tracker.bind("t1", true, &mut store, &mut index).unwrap();
        assert_eq!(id, "a1");
        assert!(store.get("a1").unwrap().is_streaming);
    }
}
