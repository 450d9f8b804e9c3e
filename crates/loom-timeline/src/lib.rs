//! Pure event-list algebra: id de-duplication, call/result cell pairing, and
//! optimistic event reconciliation. No I/O, no locks.

pub mod dedupe;
pub mod optimistic;
pub mod pairing;

pub use dedupe::{dedupe_events, merge_events};
pub use optimistic::OptimisticIds;
pub use pairing::{confirmed_call_ids, pair_cells, TimelineCell};
