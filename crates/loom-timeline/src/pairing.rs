use std::collections::{HashMap, HashSet};

use loom_core::events::{TimelineEvent, TimelineEventType};
use loom_core::ids::{CallId, EventId};

/// One renderable unit of a worldline timeline.
#[derive(Clone, Debug)]
pub enum TimelineCell {
    Message(TimelineEvent),
    Marker(TimelineEvent),
    Exchange {
        call: TimelineEvent,
        result: Option<TimelineEvent>,
    },
    /// A result whose call never appeared in the list.
    OrphanResult(TimelineEvent),
}

/// Group a flat event list into cells. Calls open an `Exchange`; a result
/// attaches to the call whose `id` matches its `parent_event_id`, or for
/// subagent results the payload `parent_tool_call_id` against the call's
/// `call_id`. Results seen before their call are held within the pass and
/// attached when the call arrives; anything still unattached at the end is
/// emitted as `OrphanResult` at its original position.
pub fn pair_cells(events: &[TimelineEvent]) -> Vec<TimelineCell> {
    // Index of the Exchange cell per call event id / call id.
    let mut open_by_event: HashMap<EventId, usize> = HashMap::new();
    let mut open_by_call: HashMap<CallId, usize> = HashMap::new();
    // Results whose call has not appeared yet, with their cell slot.
    let mut pending: Vec<(TimelineEvent, usize)> = Vec::new();

    let mut cells: Vec<Option<TimelineCell>> = Vec::with_capacity(events.len());

    for event in events {
        let t = event.event_type;
        if t.is_call() {
            let idx = cells.len();
            cells.push(Some(TimelineCell::Exchange { call: event.clone(), result: None }));
            open_by_event.insert(event.id.clone(), idx);
            if let Some(call_id) = event.call_id() {
                open_by_call.insert(call_id, idx);
            }
            // A result that streamed in ahead of its call attaches now.
            let mut kept = Vec::new();
            for (result, slot) in pending.drain(..) {
                if attaches(&result, event) {
                    attach(&mut cells, idx, result);
                } else {
                    kept.push((result, slot));
                }
            }
            pending = kept;
        } else if t.is_result() {
            let target = event
                .parent_event_id
                .as_ref()
                .and_then(|id| open_by_event.get(id).copied())
                .or_else(|| {
                    event
                        .parent_tool_call_id()
                        .or_else(|| event.call_id())
                        .and_then(|cid| open_by_call.get(&cid).copied())
                });
            match target {
                Some(idx) if slot_is_open(&cells, idx) => attach(&mut cells, idx, event.clone()),
                _ => {
                    let slot = cells.len();
                    cells.push(None); // placeholder keeps original ordering
                    pending.push((event.clone(), slot));
                }
            }
        } else if t.is_marker() {
            cells.push(Some(TimelineCell::Marker(event.clone())));
        } else {
            cells.push(Some(TimelineCell::Message(event.clone())));
        }
    }

    for (result, slot) in pending {
        cells[slot] = Some(TimelineCell::OrphanResult(result));
    }

    cells.into_iter().flatten().collect()
}

/// Call ids that already have a persisted result in the list. Used to
/// suppress synthetic streaming results once the real one lands.
pub fn confirmed_call_ids(events: &[TimelineEvent]) -> HashSet<CallId> {
    let call_ids_by_event: HashMap<&EventId, CallId> = events
        .iter()
        .filter(|e| e.event_type.is_call())
        .filter_map(|e| e.call_id().map(|cid| (&e.id, cid)))
        .collect();

    events
        .iter()
        .filter(|e| e.event_type.is_result())
        .filter_map(|e| {
            e.parent_tool_call_id().or_else(|| e.call_id()).or_else(|| {
                e.parent_event_id
                    .as_ref()
                    .and_then(|pid| call_ids_by_event.get(pid).cloned())
            })
        })
        .collect()
}

fn attaches(result: &TimelineEvent, call: &TimelineEvent) -> bool {
    if result.parent_event_id.as_ref() == Some(&call.id) {
        return true;
    }
    match (result.parent_tool_call_id().or_else(|| result.call_id()), call.call_id()) {
        (Some(a), Some(b)) => a == b,
        _ => false,
    }
}

fn attach(cells: &mut [Option<TimelineCell>], idx: usize, event: TimelineEvent) {
    if let Some(Some(TimelineCell::Exchange { result, .. })) = cells.get_mut(idx) {
        if result.is_none() {
            *result = Some(event);
        }
    }
}

fn slot_is_open(cells: &[Option<TimelineCell>], idx: usize) -> bool {
    matches!(
        cells.get(idx),
        Some(Some(TimelineCell::Exchange { result: None, .. }))
    )
}
