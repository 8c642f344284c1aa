use std::collections::HashMap;

use crate::model::{ChangeEvent, EventType};

/// Result of folding a raw event list.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Merged {
    /// At most one event per path, ordered by timestamp then path.
    pub events: Vec<ChangeEvent>,
    /// REINDEX requests, which are not tied to a path.
    pub reindex: Vec<ChangeEvent>,
}

impl Merged {
    pub fn wants_reindex(&self) -> bool {
        !self.reindex.is_empty()
    }
}

/// Fold events per path in timestamp order.
///
/// The first event for a path seeds it. A CREATED followed by MOVED_FROM
/// or DELETED cancels out entirely and the next event, if any, seeds
/// again. Anything else replaces what was there.
pub fn merge_events(events: impl IntoIterator<Item = ChangeEvent>) -> Merged {
    let mut ordered: Vec<ChangeEvent> = Vec::new();
    let mut reindex = Vec::new();
    for event in events {
        if event.event_type == EventType::Reindex {
            reindex.push(event);
        } else {
            ordered.push(event);
        }
    }
    // Stable, so ties keep their arrival order.
    ordered.sort_by_key(|e| e.timestamp);

    let mut by_path: HashMap<String, Option<ChangeEvent>> = HashMap::new();
    for event in ordered {
        let slot = by_path.entry(event.path.clone()).or_default();
        *slot = match slot.take() {
            Some(acc) if cancels(&acc, &event) => None,
            _ => Some(event),
        };
    }

    let mut events: Vec<ChangeEvent> = by_path.into_values().flatten().collect();
    events.sort_by(|a, b| {
        a.timestamp.cmp(&b.timestamp).then_with(|| a.path.cmp(&b.path))
    });
    Merged { events, reindex }
}

fn cancels(acc: &ChangeEvent, next: &ChangeEvent) -> bool {
    acc.event_type == EventType::Created
        && matches!(next.event_type, EventType::MovedFrom | EventType::Deleted)
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    fn ev(t: i64, kind: EventType, path: &str) -> ChangeEvent {
        ChangeEvent::new(t, kind, "r", path)
    }

    #[test]
    fn create_then_delete_cancels() {
        let merged = merge_events([
            ev(10, EventType::Created, "/f1"),
            ev(20, EventType::Deleted, "/f1"),
        ]);
        assert!(merged.events.is_empty());
    }

    #[test]
    fn create_then_move_from_cancels() {
        let merged = merge_events([
            ev(20, EventType::MovedFrom, "/f1"),
            ev(10, EventType::Created, "/f1"),
        ]);
        assert!(merged.events.is_empty());
    }

    #[test]
    fn event_after_cancel_seeds_again() {
        let merged = merge_events([
            ev(1, EventType::Created, "/f"),
            ev(2, EventType::Deleted, "/f"),
            ev(3, EventType::Created, "/f"),
        ]);
        assert_eq!(merged.events, vec![ev(3, EventType::Created, "/f")]);
    }

    #[test]
    fn last_write_wins_otherwise() {
        let merged = merge_events([
            ev(1, EventType::Deleted, "/f"),
            ev(2, EventType::Created, "/f"),
            ev(3, EventType::MovedTo, "/f"),
        ]);
        assert_eq!(merged.events, vec![ev(3, EventType::MovedTo, "/f")]);

        let merged = merge_events([
            ev(1, EventType::MovedTo, "/g"),
            ev(2, EventType::Deleted, "/g"),
        ]);
        assert_eq!(merged.events, vec![ev(2, EventType::Deleted, "/g")]);
    }

    #[test]
    fn ties_keep_arrival_order() {
        let merged = merge_events([
            ev(5, EventType::Deleted, "/f"),
            ev(5, EventType::Created, "/f"),
        ]);
        assert_eq!(merged.events, vec![ev(5, EventType::Created, "/f")]);
    }

    #[test]
    fn reindex_is_kept_aside() {
        let merged = merge_events([
            ev(1, EventType::Created, "/a"),
            ChangeEvent::new(2, EventType::Reindex, "r", ""),
        ]);
        assert!(merged.wants_reindex());
        assert_eq!(merged.events.len(), 1);
    }

    fn arb_event() -> impl Strategy<Value = ChangeEvent> {
        let kind = prop_oneof![
            Just(EventType::Created),
            Just(EventType::Deleted),
            Just(EventType::MovedFrom),
            Just(EventType::MovedTo),
        ];
        let path = prop_oneof![Just("/a"), Just("/b"), Just("/c/d")];
        (0i64..20, kind, path).prop_map(|(t, kind, path)| ev(t, kind, path))
    }

    proptest! {
        #[test]
        fn merge_is_idempotent(events in prop::collection::vec(arb_event(), 0..40)) {
            let once = merge_events(events);
            let twice = merge_events(once.events.clone());
            prop_assert_eq!(once.events, twice.events);
        }

        #[test]
        fn merge_is_path_partitioned(events in prop::collection::vec(arb_event(), 0..40)) {
            let merged = merge_events(events.clone());
            let mut paths: Vec<&str> =
                merged.events.iter().map(|e| e.path.as_str()).collect();
            let total = paths.len();
            paths.sort_unstable();
            paths.dedup();
            prop_assert_eq!(paths.len(), total);

            // Each path merges the same way on its own.
            for event in &merged.events {
                let alone = merge_events(
                    events.iter().filter(|e| e.path == event.path).cloned(),
                );
                prop_assert_eq!(alone.events, vec![event.clone()]);
            }
        }
    }
}
