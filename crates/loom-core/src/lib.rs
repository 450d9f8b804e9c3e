//! Shared domain types for the loom workspace client.
//!
//! Everything here is plain data: branded ids, timeline events, worldlines,
//! stream deltas and frames, chat jobs, and the error taxonomy. No I/O.

pub mod delta;
pub mod errors;
pub mod events;
pub mod frames;
pub mod ids;
pub mod jobs;
pub mod transitions;
pub mod worldlines;
