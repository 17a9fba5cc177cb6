use crate::config::ReconcileConfig;
use crate::error::TranscriptError;
use crate::key::KeyIndex;
use crate::lifecycle::{SnapshotTransition, TurnLifecycleTracker};
use crate::merge::{MergeOptions, MergeOutcome, ReconciliationEngine};
use crate::store::TranscriptStore;
use serde::Serialize;
use std::collections::HashSet;
use std::time::Instant;
use threadline_contract::{Attachment, Message, MessageId, Snapshot};
use tracing::{info, warn};

/// What applying a snapshot did.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SnapshotApply {
    /// `None` when the merge was skipped.
    pub outcome: Option<MergeOutcome>,
    /// The snapshot looked older than the live turn and was not merged.
    pub stale_resume_missing_active_turn: bool,
    pub transition: SnapshotTransition,
}

impl SnapshotApply {
    fn skipped(stale: bool) -> Self {
        Self {
            outcome: None,
            stale_resume_missing_active_turn: stale,
            transition: SnapshotTransition::Unchanged,
        }
    }
}

/// Per-thread reconciliation state: the transcript, its key index and the
/// turn tracker, mutated only through snapshot merges and live events.
#[derive(Debug, Clone)]
pub struct ConversationState {
    pub(crate) thread_id: String,
    pub(crate) store: TranscriptStore,
    pub(crate) index: KeyIndex,
    pub(crate) tracker: TurnLifecycleTracker,
    /// Messages whose text was last set from a snapshot.
    pub(crate) snapshot_backed: HashSet<MessageId>,
    engine: ReconciliationEngine,
}

impl ConversationState {
    pub fn new(thread_id: impl Into<String>, config: ReconcileConfig) -> Self {
        let tracker = TurnLifecycleTracker::new(config.recency_window);
        Self {
            thread_id: thread_id.into(),
            store: TranscriptStore::new(),
            index: KeyIndex::new(),
            tracker,
            snapshot_backed: HashSet::new(),
            engine: ReconciliationEngine::new(config),
        }
    }

    pub fn thread_id(&self) -> &str {
        &self.thread_id
    }

    pub fn messages(&self) -> &[Message] {
        self.store.messages()
    }

    pub fn store(&self) -> &TranscriptStore {
        &self.store
    }

    pub fn index(&self) -> &KeyIndex {
        &self.index
    }

    pub fn tracker(&self) -> &TurnLifecycleTracker {
        &self.tracker
    }

    pub fn active_turn_id(&self) -> Option<&str> {
        self.tracker.active_turn_id()
    }

    /// Merge a snapshot and reapply turn/streaming binding.
    pub fn apply_snapshot(
        &mut self,
        snapshot: &Snapshot,
        prefer_local_richness: bool,
        now: Instant,
    ) -> SnapshotApply {
        if snapshot.thread_id != self.thread_id {
            warn!(
                thread_id = %self.thread_id,
                snapshot_thread_id = %snapshot.thread_id,
                "ignoring snapshot for another thread"
            );
            return SnapshotApply::skipped(false);
        }
        if self.tracker.is_stale(snapshot, now) {
            info!(
                thread_id = %self.thread_id,
                turn_id = ?self.tracker.active_turn_id(),
                "skipping stale snapshot missing the active turn"
            );
            return SnapshotApply::skipped(true);
        }

        let options = MergeOptions {
            prefer_local_richness: prefer_local_richness
                || self.tracker.pending_message().is_some(),
            turn_active: snapshot.active_turn_id.is_some() || self.tracker.is_active(),
        };
        let result = self
            .engine
            .merge(&self.store, &self.index, snapshot, options);
        if let Err(e) = self.store.replace_all(result.messages) {
            warn!(thread_id = %self.thread_id, error = %e, "discarding merge result");
            return SnapshotApply::skipped(false);
        }
        self.index = result.index;
        let store = &self.store;
        self.snapshot_backed.retain(|id| store.contains(id));
        self.snapshot_backed.extend(result.snapshot_backed);

        let transition = self.tracker.observe_snapshot(snapshot, now);
        self.rebind();

        SnapshotApply {
            outcome: Some(result.outcome),
            stale_resume_missing_active_turn: false,
            transition,
        }
    }

    /// Record a locally sent prompt and the placeholder its reply streams
    /// into, before the remote has assigned a turn id.
    pub fn begin_local_turn(
        &mut self,
        text: &str,
        attachments: Vec<Attachment>,
    ) -> Result<(MessageId, MessageId), TranscriptError> {
        let user = Message::user(text).with_attachments(attachments);
        let user_id = user.id.clone();
        self.store.push(user)?;
        let placeholder = Message::streaming_placeholder();
        let placeholder_id = placeholder.id.clone();
        self.store.push(placeholder)?;
        self.tracker.set_pending(placeholder_id.clone());
        Ok((user_id, placeholder_id))
    }

    /// Bind the pending placeholder to the turn the remote started.
    pub fn bind_started_turn(&mut self, turn_id: &str, now: Instant) -> Option<MessageId> {
        if self.tracker.is_finished(turn_id) {
            return None;
        }
        self.align_turn(turn_id, now);
        self.tracker.record_activity(now);
        self.bind(turn_id, true)
    }

    /// Undo a local turn whose start request failed.
    pub fn abandon_local_turn(&mut self, error: &str) {
        if let Some(placeholder) = self.tracker.clear_pending() {
            if self.store.get(&placeholder).is_some_and(Message::is_empty) {
                self.store.remove(&placeholder);
                self.index.unbind_message(&placeholder);
            } else if let Some(message) = self.store.get_mut(&placeholder) {
                message.is_streaming = false;
            }
        }
        self.push_error(error);
    }

    /// Forget the transcript and all turn state.
    pub fn reset(&mut self) {
        self.store.reset();
        self.index.clear();
        self.tracker.reset();
        self.snapshot_backed.clear();
    }

    pub(crate) fn bind(&mut self, turn_id: &str, ensure: bool) -> Option<MessageId> {
        self.tracker
            .bind(turn_id, ensure, &mut self.store, &mut self.index)
    }

    /// Make `turn_id` the active turn; a superseded turn stops streaming.
    pub(crate) fn align_turn(&mut self, turn_id: &str, now: Instant) {
        if self.tracker.active_turn_id() == Some(turn_id) {
            return;
        }
        if self.tracker.start_turn(turn_id, now).is_some() {
            self.clear_streaming_except_pending();
        }
    }

    pub(crate) fn clear_streaming_except_pending(&mut self) {
        self.store.clear_streaming();
        if let Some(pending) = self.tracker.pending_message().cloned() {
            if self.store.set_streaming(&pending).is_err() {
                self.tracker.clear_pending();
            }
        }
    }

    pub(crate) fn push_error(&mut self, text: &str) {
        if let Err(e) = self.store.push(Message::error(text)) {
            warn!(thread_id = %self.thread_id, error = %e, "dropping error entry");
        }
    }

    fn rebind(&mut self) {
        match self.tracker.active_turn_id().map(str::to_string) {
            Some(turn_id) => {
                self.bind(&turn_id, true);
            }
            None => self.clear_streaming_except_pending(),
        }
    }
}
