//! Decides which recently-closed tracked items enter the graph this pass.

use std::collections::HashSet;

use crate::types::TrackedItemRecord;

/// Result of one retention decision.
#[derive(Debug, Default)]
pub struct RetentionOutcome {
    pub retained: Vec<TrackedItemRecord>,
    /// Keys of closed items left out of the graph.
    pub dropped: Vec<String>,
}

/// Keep a closed item iff its key occurs as a substring of the summary or
/// description of at least one open item.
///
/// The decision is made only against `open`; nothing already in the store
/// is consulted. With `enabled == false` every closed item is dropped.
/// Closed records whose key also appears among the open records are dropped
/// since the open copy is the one that gets upserted.
pub fn retain_closed(
    open: &[TrackedItemRecord],
    closed: Vec<TrackedItemRecord>,
    enabled: bool,
) -> RetentionOutcome {
    let open_keys: HashSet<&str> = open.iter().map(|r| r.key.trim()).collect();
    let open_texts: Vec<String> = open.iter().map(TrackedItemRecord::text).collect();

    let mut outcome = RetentionOutcome::default();
    for record in closed {
        let key = record.key.trim();
        let keep = enabled
            && !key.is_empty()
            && !open_keys.contains(key)
            && open_texts.iter().any(|text| text.contains(key));
        if keep {
            outcome.retained.push(record);
        } else {
            outcome.dropped.push(record.key.clone());
        }
    }
    outcome
}

#[cfg(test)]
mod tests {
    use chrono::Utc;

    use super::*;
    use crate::types::{ItemKind, ItemState};

    fn rec(key: &str, state: ItemState, description: Option<&str>) -> TrackedItemRecord {
        TrackedItemRecord {
            key: key.to_string(),
            summary: format!("Item {key}"),
            description: description.map(str::to_string),
            status: String::new(),
            state,
            priority: None,
            kind: ItemKind::Story,
            project: "X".into(),
            created: Utc::now(),
            updated: Utc::now(),
            assignee: None,
            reporter: None,
            labels: vec![],
            components: vec![],
        }
    }

    #[test]
    fn keeps_only_closed_items_mentioned_by_open_ones() {
        let open = vec![rec("X-10", ItemState::Open, Some("blocked by X-1"))];
        let closed = vec![
            rec("X-1", ItemState::Closed, None),
            rec("X-2", ItemState::Closed, None),
        ];
        let outcome = retain_closed(&open, closed, true);
        let kept: Vec<_> = outcome.retained.iter().map(|r| r.key.as_str()).collect();
        assert_eq!(kept, vec!["X-1"]);
        assert_eq!(outcome.dropped, vec!["X-2"]);
    }

    #[test]
    fn summary_mentions_count() {
        let mut o = rec("X-10", ItemState::Open, None);
        o.summary = "Follow-up to X-3".into();
        let outcome = retain_closed(&[o], vec![rec("X-3", ItemState::Closed, None)], true);
        assert_eq!(outcome.retained.len(), 1);
    }

    #[test]
    fn substring_matching_is_literal() {
        // "X-1" is a substring of "X-12": the heuristic keeps it.
        let open = vec![rec("X-10", ItemState::Open, Some("see X-12"))];
        let outcome = retain_closed(&open, vec![rec("X-1", ItemState::Closed, None)], true);
        assert_eq!(outcome.retained.len(), 1);
    }

    #[test]
    fn disabled_drops_everything() {
        let open = vec![rec("X-10", ItemState::Open, Some("X-1"))];
        let outcome = retain_closed(&open, vec![rec("X-1", ItemState::Closed, None)], false);
        assert!(outcome.retained.is_empty());
        assert_eq!(outcome.dropped.len(), 1);
    }

    #[test]
    fn no_open_items_retains_nothing() {
        let outcome = retain_closed(&[], vec![rec("X-1", ItemState::Closed, None)], true);
        assert!(outcome.retained.is_empty());
    }

    #[test]
    fn keyless_closed_items_are_dropped() {
        let open = vec![rec("X-10", ItemState::Open, Some("anything"))];
        let outcome = retain_closed(&open, vec![rec("", ItemState::Closed, None)], true);
        assert!(outcome.retained.is_empty());
    }
}
