//! Stateful session layer: the workspace API client, worldline bookkeeping,
//! and the orchestrator that folds stream frames into published snapshots.

pub mod api;
pub mod mock;
pub mod orchestrator;
pub mod worldlines;

pub use api::{ApiError, HttpApi, TurnHandle, WorkspaceApi};
pub use mock::MockApi;
pub use orchestrator::{SessionOrchestrator, SessionSignal, SessionSnapshot, TurnPhase};
pub use worldlines::WorldlineManager;
