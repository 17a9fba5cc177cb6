//! Snapshot-to-transcript merge.
//!
//! The merge is a pure function of the current transcript, the previous key
//! index and a snapshot. The caller commits the result, so a transcript is
//! never observed half-merged.

use crate::candidate::{build_candidates, Candidate};
use crate::config::ReconcileConfig;
use crate::key::{KeyIndex, ReconciliationKey};
use crate::store::TranscriptStore;
use crate::text::{normalize, overlaps, sanitize_user_text};
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use threadline_contract::{Message, MessageId, Role, Segment, Snapshot};
use tracing::debug;

/// Caller-provided merge policy inputs.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MergeOptions {
    /// Force carry-forward mode.
    pub prefer_local_richness: bool,
    /// Whether a turn is believed to be running, locally or remotely.
    pub turn_active: bool,
}

/// Counters describing how a merge resolved.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct MergeOutcome {
    pub turns: usize,
    pub items: usize,
    pub reused: usize,
    pub inserted: usize,
    pub updated: usize,
    pub unchanged: usize,
    /// Unknown or empty items that produced no candidate.
    pub skipped: usize,
    /// Candidates skipped because a local message already shows them.
    pub represented: usize,
    /// Reuses resolved by the positional first-merge mapping.
    pub bootstrapped: usize,
    /// Reuses of unkeyed local user messages matched by text.
    pub adopted: usize,
    /// Local-only messages re-inserted in carry-forward mode.
    pub carried: usize,
    /// Local-only messages discarded outside carry-forward mode.
    pub dropped: usize,
    pub carry_forward: bool,
}

/// Result of [`ReconciliationEngine::merge`], ready to be committed.
#[derive(Debug, Clone)]
pub struct MergeResult {
    pub messages: Vec<Message>,
    pub index: KeyIndex,
    pub outcome: MergeOutcome,
    /// Messages whose content now comes from the snapshot.
    pub snapshot_backed: Vec<MessageId>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum MatchKind {
    Key,
    Bootstrap,
    Adopted,
}

struct Placed {
    message: Message,
    key: Option<ReconciliationKey>,
    /// Pre-merge position of the local message this row came from.
    source: Option<usize>,
    from_candidate: bool,
}

/// Snapshot merge policy.
#[derive(Debug, Clone, Default)]
pub struct ReconciliationEngine {
    config: ReconcileConfig,
}

impl ReconciliationEngine {
    pub fn new(config: ReconcileConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &ReconcileConfig {
        &self.config
    }

    pub fn merge(
        &self,
        store: &TranscriptStore,
        index: &KeyIndex,
        snapshot: &Snapshot,
        options: MergeOptions,
    ) -> MergeResult {
        let (candidates, skipped) = build_candidates(snapshot);
        let existing = store.messages();
        let carry_forward = options.prefer_local_richness
            || (options.turn_active && local_is_richer(store, snapshot));

        let mut outcome = MergeOutcome {
            turns: snapshot.turns.len(),
            items: snapshot.item_count(),
            skipped,
            carry_forward,
            ..MergeOutcome::default()
        };

        let mut used = vec![false; existing.len()];
        let matches = self.match_candidates(existing, index, &candidates, &mut used);

        // Rows resolved against local messages, plus the tool calls they show.
        let mut resolved: Vec<Option<(Message, bool)>> = Vec::with_capacity(candidates.len());
        let mut shown_tool_ids = HashSet::new();
        let mut reused_by_turn: Vec<(String, Message)> = Vec::new();
        for (candidate, matched) in candidates.iter().zip(&matches) {
            let merged = matched.map(|(ei, _)| merge_into(&existing[ei], &candidate.message));
            if let Some((message, _)) = &merged {
                shown_tool_ids.extend(message.tool_calls().map(|c| c.id.clone()));
                reused_by_turn.push((candidate.turn_id.clone(), message.clone()));
            }
            resolved.push(merged);
        }

        let mut placed: Vec<Placed> = Vec::with_capacity(candidates.len() + existing.len());
        let mut represented_keys: HashMap<usize, ReconciliationKey> = HashMap::new();
        let mut snapshot_backed = Vec::new();

        for ((candidate, matched), merged) in candidates.into_iter().zip(matches).zip(resolved) {
            if let (Some((ei, kind)), Some((message, adopted))) = (matched, merged) {
                outcome.reused += 1;
                match kind {
                    MatchKind::Bootstrap => outcome.bootstrapped += 1,
                    MatchKind::Adopted => outcome.adopted += 1,
                    MatchKind::Key if message == existing[ei] => outcome.unchanged += 1,
                    MatchKind::Key => outcome.updated += 1,
                }
                if adopted {
                    snapshot_backed.push(message.id.clone());
                }
                placed.push(Placed {
                    message,
                    key: Some(candidate.key),
                    source: Some(ei),
                    from_candidate: true,
                });
                continue;
            }

            let Candidate {
                turn_id,
                key,
                message,
            } = candidate;
            let tool_ids: Vec<&str> = message.tool_calls().map(|c| c.id.as_str()).collect();
            let tools_shown = tool_ids.iter().all(|id| shown_tool_ids.contains(*id));
            if !tool_ids.is_empty() && message.content_text().trim().is_empty() && tools_shown {
                outcome.represented += 1;
                continue;
            }
            // A live message streams every item of its turn, so a reused row
            // may already show this candidate's text under another key.
            if tools_shown
                && reused_by_turn
                    .iter()
                    .any(|(turn, reused)| *turn == turn_id && shows_text_of(reused, &message))
            {
                outcome.represented += 1;
                continue;
            }
            if carry_forward {
                if let Some(ei) = find_representative(existing, &used, &message) {
                    outcome.represented += 1;
                    represented_keys.entry(ei).or_insert(key);
                    continue;
                }
            }
            outcome.inserted += 1;
            snapshot_backed.push(message.id.clone());
            placed.push(Placed {
                message,
                key: Some(key),
                source: None,
                from_candidate: true,
            });
        }

        if carry_forward {
            for (ei, local) in existing.iter().enumerate() {
                if used[ei] {
                    continue;
                }
                let key = represented_keys
                    .remove(&ei)
                    .or_else(|| index.key_for(&local.id).cloned());
                let row = Placed {
                    message: local.clone(),
                    key,
                    source: Some(ei),
                    from_candidate: false,
                };
                let at = carry_position(&placed, ei, existing.len());
                placed.insert(at, row);
                outcome.carried += 1;
            }
        } else {
            outcome.dropped = used.iter().filter(|u| !**u).count();
        }

        let mut next_index = KeyIndex::new();
        for pass in [true, false] {
            for row in placed.iter().filter(|r| r.from_candidate == pass) {
                if let Some(key) = &row.key {
                    if !next_index.contains_key(key) {
                        next_index.bind(key.clone(), row.message.id.clone());
                    }
                }
            }
        }

        debug!(
            thread_id = %snapshot.thread_id,
            reused = outcome.reused,
            inserted = outcome.inserted,
            updated = outcome.updated,
            represented = outcome.represented,
            carried = outcome.carried,
            dropped = outcome.dropped,
            carry_forward,
            "merged snapshot"
        );

        MergeResult {
            messages: placed.into_iter().map(|r| r.message).collect(),
            index: next_index,
            outcome,
            snapshot_backed,
        }
    }

    /// Pair candidates with local messages: key hits first, then the
    /// positional bootstrap, then unkeyed user messages by text.
    fn match_candidates(
        &self,
        existing: &[Message],
        index: &KeyIndex,
        candidates: &[Candidate],
        used: &mut [bool],
    ) -> Vec<Option<(usize, MatchKind)>> {
        let positions: HashMap<&str, usize> = existing
            .iter()
            .enumerate()
            .map(|(i, m)| (m.id.as_str(), i))
            .collect();
        let mut matches = vec![None; candidates.len()];

        let mut any_known = false;
        for (ci, candidate) in candidates.iter().enumerate() {
            let Some(&ei) = index
                .message_for(&candidate.key)
                .and_then(|id| positions.get(id.as_str()))
            else {
                continue;
            };
            any_known = true;
            if !used[ei] && existing[ei].role == candidate.message.role {
                used[ei] = true;
                matches[ci] = Some((ei, MatchKind::Key));
            }
        }

        let comparable = existing.len().abs_diff(candidates.len())
            <= self.config.bootstrap_length_slack;
        if !any_known && comparable {
            for (i, (candidate, local)) in candidates.iter().zip(existing).enumerate() {
                if !used[i] && matches[i].is_none() && local.role == candidate.message.role {
                    used[i] = true;
                    matches[i] = Some((i, MatchKind::Bootstrap));
                }
            }
        }

        for (ci, candidate) in candidates.iter().enumerate() {
            if matches[ci].is_some() || candidate.message.role != Role::User {
                continue;
            }
            let wanted = sanitize_user_text(&candidate.message.text());
            let found = existing.iter().enumerate().find(|(ei, local)| {
                !used[*ei]
                    && local.role == Role::User
                    && index.key_for(&local.id).is_none()
                    && sanitize_user_text(&local.text()) == wanted
            });
            if let Some((ei, _)) = found {
                used[ei] = true;
                matches[ci] = Some((ei, MatchKind::Adopted));
            }
        }

        matches
    }
}

/// Combine a reused local message with its candidate. The flag reports
/// whether the candidate's content was adopted.
fn merge_into(existing: &Message, candidate: &Message) -> (Message, bool) {
    let keep_local = candidate.is_empty()
        || drops_tool_content(existing, candidate)
        || (is_strict_prefix(&candidate.content_text(), &existing.content_text())
            && !adds_tool_calls(existing, candidate));

    if keep_local {
        let mut merged = existing.clone();
        adopt_terminal_statuses(&mut merged, candidate);
        return (merged, false);
    }

    let attachments = if candidate.attachments.is_empty() {
        existing.attachments.clone()
    } else {
        candidate.attachments.clone()
    };
    let merged = Message {
        id: existing.id.clone(),
        role: existing.role,
        segments: candidate.segments.clone(),
        is_streaming: existing.is_streaming,
        is_error: existing.is_error || candidate.is_error,
        attachments,
    };
    (merged, true)
}

/// Every text-like segment of `candidate` is already shown by `reused`: a
/// segment of the same kind built from the same item, or else an
/// unattributed segment containing the text.
fn shows_text_of(reused: &Message, candidate: &Message) -> bool {
    if reused.role != candidate.role {
        return false;
    }
    let mut wanted = candidate
        .segments
        .iter()
        .filter(|s| s.as_tool_call().is_none() && s.is_renderable())
        .peekable();
    if wanted.peek().is_none() {
        return false;
    }
    wanted.all(|want| {
        let same_kind = |s: &&Segment| std::mem::discriminant(*s) == std::mem::discriminant(want);
        if let Some(id) = want.item_id() {
            if reused
                .segments
                .iter()
                .filter(same_kind)
                .any(|s| s.item_id() == Some(id))
            {
                return true;
            }
        }
        let text = normalize(want.as_text().unwrap_or_default());
        reused
            .segments
            .iter()
            .filter(same_kind)
            .filter(|s| s.item_id().is_none())
            .filter_map(Segment::as_text)
            .any(|have| normalize(have).contains(&text))
    })
}

fn is_strict_prefix(candidate: &str, existing: &str) -> bool {
    existing.len() > candidate.len() && existing.starts_with(candidate)
}

fn adds_tool_calls(existing: &Message, candidate: &Message) -> bool {
    let local: HashSet<&str> = existing.tool_calls().map(|c| c.id.as_str()).collect();
    candidate.tool_calls().any(|c| !local.contains(c.id.as_str()))
}

// Missing tool calls, or output present locally but absent remotely.
fn drops_tool_content(existing: &Message, candidate: &Message) -> bool {
    existing.tool_calls().any(|local| {
        match candidate.tool_calls().find(|c| c.id == local.id) {
            None => true,
            Some(remote) => local.has_output() && !remote.has_output(),
        }
    })
}

// Keeping local content must not pin a finished call at "in progress".
fn adopt_terminal_statuses(merged: &mut Message, candidate: &Message) {
    for segment in &mut merged.segments {
        if let Segment::ToolCall(local) = segment {
            if let Some(remote) = candidate.tool_calls().find(|c| c.id == local.id) {
                if remote.status.is_terminal() {
                    local.status = remote.status;
                }
            }
        }
    }
}

/// Remote-lag heuristic: local shows strictly more than the snapshot.
fn local_is_richer(store: &TranscriptStore, snapshot: &Snapshot) -> bool {
    if snapshot.item_count() == 0 && !store.is_empty() {
        return true;
    }
    store.assistant_text_count() > snapshot.assistant_message_count()
        || store.tool_call_count() > snapshot.tool_call_count()
}

/// First unreused local message that already shows `candidate`.
fn find_representative(existing: &[Message], used: &[bool], candidate: &Message) -> Option<usize> {
    existing
        .iter()
        .enumerate()
        .find(|(i, local)| !used[*i] && represents(local, candidate))
        .map(|(i, _)| i)
}

fn represents(local: &Message, candidate: &Message) -> bool {
    if local.role != candidate.role {
        return false;
    }
    match candidate.role {
        Role::User => sanitize_user_text(&local.text()) == sanitize_user_text(&candidate.text()),
        _ => {
            let wanted = candidate.content_text();
            let have = local.content_text();
            let text_ok = if wanted.trim().is_empty() {
                true
            } else {
                !have.trim().is_empty() && overlaps(&have, &wanted)
            };
            let local_ids: HashSet<&str> = local.tool_calls().map(|c| c.id.as_str()).collect();
            text_ok && candidate.tool_calls().all(|c| local_ids.contains(c.id.as_str()))
        }
    }
}

/// Where to re-insert the local message that sat at `source` before the
/// merge: after its nearest earlier placed neighbour, else before its
/// nearest later one, else at the tail.
fn carry_position(placed: &[Placed], source: usize, len: usize) -> usize {
    let find = |j: usize| placed.iter().position(|p| p.source == Some(j));
    if let Some(at) = (0..source).rev().find_map(find) {
        return at + 1;
    }
    if let Some(at) = (source + 1..len).find_map(find) {
        return at;
    }
    placed.len()
}
