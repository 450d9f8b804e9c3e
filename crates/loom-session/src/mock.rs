use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use futures::stream;
use parking_lot::Mutex;
use tokio::sync::Notify;

use loom_core::events::TimelineEvent;
use loom_core::frames::StreamFrame;
use loom_core::ids::{EventId, ThreadId, WorldlineId};
use loom_core::jobs::{ChatJob, JobStatus, TurnRequest};
use loom_core::worldlines::Worldline;

use crate::api::{ApiError, TurnHandle, WorkspaceApi};

/// Pre-programmed response for one submit_turn call.
pub enum MockTurn {
    /// Yield these frames in order.
    Frames(Vec<StreamFrame>),
    /// Fail the submit call itself.
    Error(String),
}

/// Scripted server for deterministic orchestrator and manager tests.
/// Responses are consumed in sequence; every call is recorded.
#[derive(Default)]
pub struct MockApi {
    turns: Mutex<VecDeque<MockTurn>>,
    worldlines: Mutex<Vec<Worldline>>,
    events: Mutex<HashMap<WorldlineId, Vec<TimelineEvent>>>,
    jobs: Mutex<Vec<ChatJob>>,
    fail_branch: AtomicBool,
    stall_list: Mutex<Option<Arc<Notify>>>,
    calls: Mutex<Vec<String>>,
    created_count: AtomicUsize,
}

impl MockApi {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_turn(&self, turn: MockTurn) {
        self.turns.lock().push_back(turn);
    }

    pub fn set_worldlines(&self, worldlines: Vec<Worldline>) {
        *self.worldlines.lock() = worldlines;
    }

    pub fn set_events(&self, worldline_id: WorldlineId, events: Vec<TimelineEvent>) {
        self.events.lock().insert(worldline_id, events);
    }

    pub fn set_jobs(&self, jobs: Vec<ChatJob>) {
        *self.jobs.lock() = jobs;
    }

    pub fn fail_next_branch(&self) {
        self.fail_branch.store(true, Ordering::Relaxed);
    }

    /// Hold the next list_worldlines call open until the returned gate is
    /// notified. Lets tests assert what happens while a refresh is in flight.
    pub fn stall_next_list_worldlines(&self) -> Arc<Notify> {
        let gate = Arc::new(Notify::new());
        *self.stall_list.lock() = Some(gate.clone());
        gate
    }

    /// Method names in call order.
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().clone()
    }

    pub fn created_count(&self) -> usize {
        self.created_count.load(Ordering::Relaxed)
    }

    fn record(&self, call: impl Into<String>) {
        self.calls.lock().push(call.into());
    }

    fn insert_worldline(&self, worldline: Worldline) -> Worldline {
        self.created_count.fetch_add(1, Ordering::Relaxed);
        self.worldlines.lock().push(worldline.clone());
        worldline
    }
}

#[async_trait]
impl WorkspaceApi for MockApi {
    async fn submit_turn(&self, request: &TurnRequest) -> Result<TurnHandle, ApiError> {
        self.record(format!("submit_turn:{}", request.worldline_id));
        match self.turns.lock().pop_front() {
            Some(MockTurn::Frames(frames)) => Ok(TurnHandle {
                job: ChatJob::new(request.clone(), JobStatus::Running),
                frames: Box::pin(stream::iter(frames)),
            }),
            Some(MockTurn::Error(message)) => Err(ApiError::Http { status: 500, body: message }),
            None => Err(ApiError::Network("MockApi: no turn scripted".into())),
        }
    }

    async fn queue_turn(&self, request: &TurnRequest) -> Result<ChatJob, ApiError> {
        self.record(format!("queue_turn:{}", request.worldline_id));
        let mut job = ChatJob::new(request.clone(), JobStatus::Queued);
        let outstanding = self
            .jobs
            .lock()
            .iter()
            .filter(|j| j.worldline_id == request.worldline_id && j.status.is_outstanding())
            .count() as u32;
        job.queue_position = Some(outstanding + 1);
        self.jobs.lock().push(job.clone());
        Ok(job)
    }

    async fn list_worldlines(&self, _thread_id: &ThreadId) -> Result<Vec<Worldline>, ApiError> {
        self.record("list_worldlines");
        let gate = self.stall_list.lock().take();
        if let Some(gate) = gate {
            gate.notified().await;
        }
        Ok(self.worldlines.lock().clone())
    }

    async fn create_worldline(
        &self,
        _thread_id: &ThreadId,
        name: &str,
    ) -> Result<Worldline, ApiError> {
        self.record(format!("create_worldline:{name}"));
        let mut worldline = Worldline::placeholder(WorldlineId::new());
        worldline.name = name.to_string();
        worldline.created_at = Some(chrono::Utc::now());
        Ok(self.insert_worldline(worldline))
    }

    async fn branch_from_event(
        &self,
        _thread_id: &ThreadId,
        worldline_id: &WorldlineId,
        event_id: &EventId,
        name: &str,
    ) -> Result<Worldline, ApiError> {
        self.record(format!("branch_from_event:{name}"));
        if self.fail_branch.swap(false, Ordering::Relaxed) {
            return Err(ApiError::Http { status: 409, body: "event not on worldline".into() });
        }
        let mut worldline = Worldline::placeholder(WorldlineId::new());
        worldline.name = name.to_string();
        worldline.parent_worldline_id = Some(worldline_id.clone());
        worldline.forked_from_event_id = Some(event_id.clone());
        worldline.created_at = Some(chrono::Utc::now());
        Ok(self.insert_worldline(worldline))
    }

    async fn fetch_events(
        &self,
        worldline_id: &WorldlineId,
    ) -> Result<Vec<TimelineEvent>, ApiError> {
        self.record(format!("fetch_events:{worldline_id}"));
        Ok(self.events.lock().get(worldline_id).cloned().unwrap_or_default())
    }

    async fn poll_jobs(&self, _thread_id: &ThreadId) -> Result<Vec<ChatJob>, ApiError> {
        self.record("poll_jobs");
        Ok(self.jobs.lock().clone())
    }
}
