//! Text comparison and incremental-merge rules shared by the merge engine
//! and the event applier.

/// Collapse runs of whitespace and trim.
pub fn normalize(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Normalize user-authored text for equality checks: drops invisible
/// formatting characters and line-ending differences on top of
/// [`normalize`].
pub fn sanitize_user_text(text: &str) -> String {
    let visible: String = text
        .chars()
        .filter(|c| !matches!(c, '\u{200b}' | '\u{200c}' | '\u{200d}' | '\u{feff}'))
        .collect();
    normalize(&visible)
}

/// True when normalized texts are equal or either contains the other.
pub fn overlaps(a: &str, b: &str) -> bool {
    let a = normalize(a);
    let b = normalize(b);
    a == b || a.contains(&b) || b.contains(&a)
}

/// How an incoming fragment combines with the text already present.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TextMerge {
    /// Nothing new.
    Unchanged,
    /// Append this suffix.
    Append(String),
    /// Incoming text disagrees with what is present.
    Diverged,
}

/// Merge a full-text source (completed item, snapshot text).
pub fn merge_full(existing: &str, incoming: &str) -> TextMerge {
    if incoming.is_empty() || existing == incoming {
        return TextMerge::Unchanged;
    }
    if existing.is_empty() {
        return TextMerge::Append(incoming.to_string());
    }
    if existing.starts_with(incoming) || existing.contains(incoming) {
        return TextMerge::Unchanged;
    }
    if let Some(suffix) = incoming.strip_prefix(existing) {
        return TextMerge::Append(suffix.to_string());
    }
    TextMerge::Diverged
}

/// Merge a streaming delta.
///
/// Deltas normally append verbatim. A delta that replays the whole text plus
/// more only contributes its suffix, and while the text came from a snapshot
/// a delta the text already ends with is a replay of content the snapshot
/// already included.
pub fn merge_delta(existing: &str, incoming: &str, snapshot_derived: bool) -> TextMerge {
    if incoming.is_empty() {
        return TextMerge::Unchanged;
    }
    if !existing.is_empty() && incoming.len() > existing.len() {
        if let Some(suffix) = incoming.strip_prefix(existing) {
            return TextMerge::Append(suffix.to_string());
        }
    }
    if snapshot_derived && existing.ends_with(incoming) {
        return TextMerge::Unchanged;
    }
    TextMerge::Append(incoming.to_string())
}
