//! Follow-up fetch policy after an open.
//!
//! A freshly fetched snapshot can lag the live stream, so an open is
//! followed by a few re-fetches merged in carry-forward mode. More attempts
//! are granted when the local transcript visibly runs ahead of the snapshot.

use crate::config::{RefreshBudget, SessionConfig};
use std::time::Instant;
use threadline_contract::{ClientError, Snapshot};
use threadline_reconcile::ConversationState;

/// Attempts granted for a snapshot, judged against the pre-merge state.
pub fn attempt_budget(
    budget: &RefreshBudget,
    snapshot: &Snapshot,
    state: &ConversationState,
    now: Instant,
) -> u32 {
    let store = state.store();
    let richer = store.tool_call_count() > snapshot.tool_call_count()
        || store.assistant_text_count() > snapshot.assistant_message_count();
    if richer {
        return budget.richer;
    }
    let streamed =
        store.streaming_id().is_some() || state.tracker().had_recent_activity(now);
    if snapshot.active_turn_id.is_some() && streamed {
        return budget.streaming;
    }
    budget.base
}

/// Why a refresh loop ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefreshStop {
    Exhausted,
    Cancelled,
    Superseded,
    Disconnected,
    FetchFailed,
    /// The snapshot reports a running turn; live events take over.
    TurnActive,
    Stalled,
}

impl RefreshStop {
    /// Stop reason for a failed re-fetch.
    pub(crate) fn for_fetch_error(error: &ClientError) -> Self {
        if error.is_disconnect() {
            Self::Disconnected
        } else {
            Self::FetchFailed
        }
    }
}

/// Counts consecutive attempts without item growth.
#[derive(Debug, Clone)]
pub(crate) struct StallDetector {
    items: usize,
    stalls: u32,
    limit: u32,
}

impl StallDetector {
    pub(crate) fn new(config: &SessionConfig, items: usize) -> Self {
        Self {
            items,
            stalls: 0,
            limit: config.stall_limit.max(1),
        }
    }

    /// Record an attempt; true once the stall limit is reached.
    pub(crate) fn observe(&mut self, items: usize) -> bool {
        if items > self.items {
            self.items = items;
            self.stalls = 0;
            return false;
        }
        self.stalls += 1;
        self.stalls >= self.limit
    }
}
