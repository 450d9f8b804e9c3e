use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde_json::json;

use loom_core::events::{TimelineEvent, TimelineEventType};
use loom_core::ids::{EventId, OPTIMISTIC_PREFIX};

/// Source of locally synthesized event ids: `opt_<millis>_<n>`. The reserved
/// prefix keeps them disjoint from server-issued `evt_` ids.
#[derive(Debug, Default)]
pub struct OptimisticIds {
    counter: AtomicU64,
}

impl OptimisticIds {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn next(&self) -> EventId {
        let n = self.counter.fetch_add(1, Ordering::Relaxed);
        let millis = chrono::Utc::now().timestamp_millis();
        EventId::from_raw(format!("{OPTIMISTIC_PREFIX}{millis}_{n}"))
    }

    /// A user message shown immediately, before the server confirms it.
    pub fn create_optimistic(&self, text: &str) -> TimelineEvent {
        let mut event = TimelineEvent::new(TimelineEventType::UserMessage, json!({ "text": text }));
        event.id = self.next();
        event
    }
}

/// Append to a shared event list, producing a new list. Callers hold
/// `Arc<Vec<_>>` snapshots; lists are replaced, never mutated in place.
pub fn insert(events: &Arc<Vec<TimelineEvent>>, event: TimelineEvent) -> Arc<Vec<TimelineEvent>> {
    let mut next = events.as_ref().clone();
    next.push(event);
    Arc::new(next)
}

/// Swap an optimistic entry for its confirmed counterpart. Returns the new
/// list and whether a swap happened; with no id (or no match) the real event
/// is appended and `false` is returned.
pub fn replace_with_real(
    events: &Arc<Vec<TimelineEvent>>,
    opt_id: Option<&EventId>,
    real: TimelineEvent,
) -> (Arc<Vec<TimelineEvent>>, bool) {
    match opt_id {
        Some(id) => {
            let mut next: Vec<TimelineEvent> =
                events.iter().filter(|e| &e.id != id).cloned().collect();
            let replaced = next.len() < events.len();
            next.push(real);
            (Arc::new(next), replaced)
        }
        None => (insert(events, real), false),
    }
}

/// Remove an optimistic entry (rollback). When nothing matches, or the id is
/// `None`, the original `Arc` is returned unchanged so callers can cheaply
/// detect the no-op by pointer equality.
pub fn remove(
    events: &Arc<Vec<TimelineEvent>>,
    opt_id: Option<&EventId>,
) -> Arc<Vec<TimelineEvent>> {
    let Some(id) = opt_id else {
        return Arc::clone(events);
    };
    if !events.iter().any(|e| &e.id == id) {
        return Arc::clone(events);
    }
    Arc::new(events.iter().filter(|e| &e.id != id).cloned().collect())
}
