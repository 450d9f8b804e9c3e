use std::collections::HashSet;

use loom_core::events::TimelineEvent;
use loom_core::ids::EventId;

/// Drop duplicate ids, keeping the first occurrence and relative order.
/// Refresh races can deliver the same event over both the stream and a fetch.
pub fn dedupe_events(events: &[TimelineEvent]) -> Vec<TimelineEvent> {
    let mut seen: HashSet<&EventId> = HashSet::with_capacity(events.len());
    let mut out = Vec::with_capacity(events.len());
    for event in events {
        if seen.insert(&event.id) {
            out.push(event.clone());
        }
    }
    out
}

/// Merge a freshly fetched persisted list with the local one: persisted events
/// first, then local optimistic events the server has not confirmed yet. A
/// refresh must never drop an in-flight optimistic user message.
pub fn merge_events(persisted: &[TimelineEvent], local: &[TimelineEvent]) -> Vec<TimelineEvent> {
    let persisted_ids: HashSet<&EventId> = persisted.iter().map(|e| &e.id).collect();
    let mut out = persisted.to_vec();
    out.extend(
        local
            .iter()
            .filter(|e| e.is_optimistic() && !persisted_ids.contains(&e.id))
            .cloned(),
    );
    out
}
