//! Folds stream frames into per-worldline state and publishes snapshots.
//!
//! One orchestrator serves one thread. Each streaming turn runs on its own
//! task; all mutation funnels through `handle_frame` so frame order on a
//! worldline is the only ordering that matters.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use dashmap::DashMap;
use futures::StreamExt;
use parking_lot::Mutex;
use tokio::sync::{broadcast, watch};
use tracing::{debug, instrument, warn};

use loom_core::delta::StreamDelta;
use loom_core::errors::UNKNOWN_STREAM_ERROR;
use loom_core::events::{TimelineEvent, TimelineEventType};
use loom_core::frames::StreamFrame;
use loom_core::ids::{EventId, WorldlineId};
use loom_core::jobs::{ChatJob, JobStatus, TurnRequest};
use loom_core::transitions::{RuntimeStateTransition, TransitionTrace};
use loom_core::worldlines::{Worldline, WorldlineHint};
use loom_protocol::aggregator::StreamingState;
use loom_timeline::optimistic::{insert, remove, replace_with_real};
use loom_timeline::{confirmed_call_ids, dedupe_events, OptimisticIds};

use crate::api::{ApiError, WorkspaceApi};
use crate::worldlines::WorldlineManager;

const SIGNAL_CAPACITY: usize = 256;

/// Where a worldline is in its turn lifecycle.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum TurnPhase {
    #[default]
    Idle,
    /// Optimistic insert done, request in flight.
    Sending,
    /// Frames arriving.
    Streaming,
    /// Parked behind an outstanding job on the same worldline.
    Queued,
}

/// Fire-and-forget notifications for a frontend. Losing one is harmless;
/// the snapshot channel always carries the authoritative state.
#[derive(Clone, Debug)]
pub enum SessionSignal {
    Status { worldline_id: WorldlineId, text: String },
    ScrollToBottom,
    ContextRefresh,
    TurnCompleted { worldline_id: WorldlineId },
}

/// A self-contained view of session state, replaced wholesale on every
/// mutation. Event lists are shared `Arc`s so cloning stays cheap.
#[derive(Clone, Debug, Default)]
pub struct SessionSnapshot {
    pub worldlines: Vec<Worldline>,
    pub events: HashMap<WorldlineId, Arc<Vec<TimelineEvent>>>,
    pub streaming: HashMap<WorldlineId, StreamingState>,
    pub traces: HashMap<WorldlineId, TransitionTrace>,
    pub active: Option<WorldlineId>,
    pub phases: HashMap<WorldlineId, TurnPhase>,
}

/// State mutated while folding frames. Guarded by one lock, never held
/// across an await.
#[derive(Default)]
struct TurnState {
    streaming: HashMap<WorldlineId, StreamingState>,
    traces: HashMap<WorldlineId, TransitionTrace>,
    pending_optimistic: HashMap<WorldlineId, EventId>,
    jobs: Vec<ChatJob>,
}

struct Inner {
    api: Arc<dyn WorkspaceApi>,
    manager: Arc<WorldlineManager>,
    signals: broadcast::Sender<SessionSignal>,
    snapshot_tx: watch::Sender<SessionSnapshot>,
    phases: DashMap<WorldlineId, TurnPhase>,
    optimistic: OptimisticIds,
    state: Mutex<TurnState>,
    provider: String,
    model: String,
    max_iterations: u32,
}

/// Cheap-to-clone handle; clones share all state. Stream tasks hold a clone
/// for the lifetime of their turn.
#[derive(Clone)]
pub struct SessionOrchestrator {
    inner: Arc<Inner>,
}

impl SessionOrchestrator {
    pub fn new(
        api: Arc<dyn WorkspaceApi>,
        manager: Arc<WorldlineManager>,
        provider: impl Into<String>,
        model: impl Into<String>,
        max_iterations: u32,
    ) -> Self {
        let (signals, _) = broadcast::channel(SIGNAL_CAPACITY);
        let (snapshot_tx, _) = watch::channel(SessionSnapshot::default());
        Self {
            inner: Arc::new(Inner {
                api,
                manager,
                signals,
                snapshot_tx,
                phases: DashMap::new(),
                optimistic: OptimisticIds::new(),
                state: Mutex::new(TurnState::default()),
                provider: provider.into(),
                model: model.into(),
                max_iterations,
            }),
        }
    }

    pub fn manager(&self) -> &WorldlineManager {
        &self.inner.manager
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionSignal> {
        self.inner.signals.subscribe()
    }

    pub fn watch_snapshot(&self) -> watch::Receiver<SessionSnapshot> {
        self.inner.snapshot_tx.subscribe()
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        self.inner.snapshot_tx.borrow().clone()
    }

    pub fn phase(&self, worldline_id: &WorldlineId) -> TurnPhase {
        self.inner
            .phases
            .get(worldline_id)
            .map(|entry| *entry.value())
            .unwrap_or_default()
    }

    /// Submit a user message on the active worldline.
    ///
    /// With an outstanding job on that worldline the turn is queued server
    /// side; otherwise the message is inserted optimistically and a stream
    /// task is spawned. A transport failure before the first frame rolls the
    /// optimistic event back.
    #[instrument(skip_all, fields(len = text.len()))]
    pub async fn submit(&self, text: &str) -> Result<(), ApiError> {
        let worldline_id = self.inner.manager.ensure().await?;
        let request = TurnRequest {
            thread_id: self.inner.manager.thread_id().clone(),
            worldline_id: worldline_id.clone(),
            message: text.to_string(),
            provider: self.inner.provider.clone(),
            model: self.inner.model.clone(),
            max_iterations: self.inner.max_iterations,
        };

        if self.has_outstanding_job(&worldline_id).await {
            let job = self.inner.api.queue_turn(&request).await?;
            let position = job.queue_position.unwrap_or(1);
            self.inner.state.lock().jobs.push(job);
            self.inner.phases.insert(worldline_id.clone(), TurnPhase::Queued);
            self.status(&worldline_id, format!("Queued (position {position})"));
            self.publish();
            return Ok(());
        }

        let optimistic = self.inner.optimistic.create_optimistic(text);
        let opt_id = optimistic.id.clone();
        let events = self.inner.manager.events(&worldline_id);
        self.inner
            .manager
            .store_events(&worldline_id, insert(&events, optimistic));
        {
            let mut state = self.inner.state.lock();
            state.streaming.remove(&worldline_id);
            state.pending_optimistic.insert(worldline_id.clone(), opt_id);
        }
        self.inner.phases.insert(worldline_id.clone(), TurnPhase::Sending);
        self.status(&worldline_id, "Sending…".to_string());
        self.signal(SessionSignal::ScrollToBottom);
        self.publish();

        match self.inner.api.submit_turn(&request).await {
            Ok(handle) => {
                self.inner.state.lock().jobs.push(handle.job);
                self.inner
                    .phases
                    .insert(worldline_id.clone(), TurnPhase::Streaming);
                self.publish();

                let this = self.clone();
                let submitted = worldline_id.clone();
                let mut frames = handle.frames;
                tokio::spawn(async move {
                    while let Some(frame) = frames.next().await {
                        this.handle_frame(&submitted, frame);
                    }
                    // Stream ended without a terminal frame.
                    if this.phase(&submitted) == TurnPhase::Streaming {
                        this.fail_turn(&submitted, UNKNOWN_STREAM_ERROR);
                    }
                });
                Ok(())
            }
            Err(err) => {
                self.fail_turn(&worldline_id, &err.to_string());
                Err(err)
            }
        }
    }

    /// Whether any known job on this worldline is still queued or running.
    /// Checks local jobs first, then refreshes from the server.
    async fn has_outstanding_job(&self, worldline_id: &WorldlineId) -> bool {
        let outstanding = |jobs: &[ChatJob]| {
            jobs.iter()
                .any(|j| &j.worldline_id == worldline_id && j.status.is_outstanding())
        };
        if outstanding(&self.inner.state.lock().jobs) {
            return true;
        }
        match self.inner.api.poll_jobs(self.inner.manager.thread_id()).await {
            Ok(jobs) => {
                let mut state = self.inner.state.lock();
                state.jobs = jobs;
                outstanding(&state.jobs)
            }
            Err(err) => {
                warn!(error = %err, "job poll failed; assuming no outstanding job");
                false
            }
        }
    }

    /// Fold one frame. Frames carry their own worldline id, which may differ
    /// from the submitted one when a fan-out streams child activity.
    fn handle_frame(&self, submitted: &WorldlineId, frame: StreamFrame) {
        match frame {
            StreamFrame::Event { worldline_id, event, .. } => {
                self.apply_event(&worldline_id, event);
            }
            StreamFrame::Delta { worldline_id, delta, .. } => {
                self.apply_delta(&worldline_id, delta);
            }
            StreamFrame::Done { worldline_id, .. } => {
                self.finish_turn(&worldline_id);
            }
            StreamFrame::Error { message } => {
                self.fail_turn(submitted, &message);
            }
            StreamFrame::ParseError { message } => {
                // One undecodable frame does not end the turn.
                warn!(worldline_id = %submitted, %message, "skipping unparseable frame");
            }
        }
    }

    fn apply_event(&self, worldline_id: &WorldlineId, event: TimelineEvent) {
        self.inner.manager.ensure_visible(worldline_id, None);
        debug!(worldline_id = %worldline_id, event_type = %event.event_type, "event frame");

        {
            let mut state = self.inner.state.lock();
            if let Some(streaming) = state.streaming.get(worldline_id) {
                let cleared = streaming.clear_superseded(&event);
                state.streaming.insert(worldline_id.clone(), cleared);
            }
            if event.event_type == TimelineEventType::AssistantMessage {
                if let Some(persisted) = persisted_transitions(&event) {
                    state
                        .traces
                        .entry(worldline_id.clone())
                        .or_default()
                        .replace_with(persisted);
                }
            }
        }

        let events = self.inner.manager.events(worldline_id);
        let updated = if event.event_type == TimelineEventType::UserMessage {
            let pending = self.inner.state.lock().pending_optimistic.remove(worldline_id);
            let (next, _) = replace_with_real(&events, pending.as_ref(), event.clone());
            next
        } else {
            insert(&events, event.clone())
        };
        self.inner
            .manager
            .store_events(worldline_id, Arc::new(dedupe_events(&updated)));

        if self.is_displayed(worldline_id) {
            if let Some(text) = event_status_text(&event) {
                self.status(worldline_id, text);
            }
            self.signal(SessionSignal::ScrollToBottom);
        }
        self.publish();
    }

    fn apply_delta(&self, worldline_id: &WorldlineId, delta: StreamDelta) {
        self.inner.manager.ensure_visible(worldline_id, None);
        self.hint_fanout_worldlines(&delta);

        // A persisted result is authoritative; drop stragglers for its call.
        if let Some(call_id) = delta_call_id(&delta) {
            let events = self.inner.manager.events(worldline_id);
            if confirmed_call_ids(&events).contains(call_id) {
                debug!(worldline_id = %worldline_id, call_id = %call_id, "delta after persisted result; skipped");
                return;
            }
        }

        if let StreamDelta::StateTransition { transition } = &delta {
            self.inner
                .state
                .lock()
                .traces
                .entry(worldline_id.clone())
                .or_default()
                .push(transition.clone());
            if self.is_displayed(worldline_id) {
                self.status(
                    worldline_id,
                    format!("State: {} → {}", transition.from_state, transition.to_state),
                );
            }
        } else {
            let now = Utc::now();
            {
                let mut state = self.inner.state.lock();
                let folded = state
                    .streaming
                    .get(worldline_id)
                    .cloned()
                    .unwrap_or_default()
                    .apply(&delta, now);
                state.streaming.insert(worldline_id.clone(), folded);
            }
            if self.is_displayed(worldline_id) {
                if let Some(text) = delta_status_text(&delta) {
                    self.status(worldline_id, text);
                }
            }
        }
        self.publish();
    }

    /// Register placeholders for child/result worldlines named by fan-out
    /// progress, so snapshots can show them before any refresh lands.
    fn hint_fanout_worldlines(&self, delta: &StreamDelta) {
        let progress = match delta {
            StreamDelta::ToolCallSubagents { progress, .. }
            | StreamDelta::SubagentProgress { progress, .. } => progress,
            _ => return,
        };
        let parent = self.inner.manager.active();
        let mut changed = false;
        for task in &progress.tasks {
            for id in [&task.child_worldline_id, &task.result_worldline_id]
                .into_iter()
                .flatten()
            {
                let hint = WorldlineHint {
                    name: task.label.clone(),
                    parent_worldline_id: parent.clone(),
                    created_at: None,
                };
                changed |= self.inner.manager.ensure_visible(id, Some(&hint));
            }
        }
        if changed {
            self.signal(SessionSignal::ContextRefresh);
        }
    }

    fn finish_turn(&self, worldline_id: &WorldlineId) {
        {
            let mut state = self.inner.state.lock();
            state.streaming.remove(worldline_id);
            state.pending_optimistic.remove(worldline_id);
            let now = Utc::now();
            for job in state.jobs.iter_mut() {
                if &job.worldline_id == worldline_id && job.status.is_outstanding() {
                    job.status = JobStatus::Completed;
                    job.finished_at = Some(now);
                }
            }
        }
        self.inner.phases.insert(worldline_id.clone(), TurnPhase::Idle);

        if self.is_displayed(worldline_id) {
            self.status(worldline_id, "Done".to_string());
            self.signal(SessionSignal::ScrollToBottom);
        }
        self.signal(SessionSignal::TurnCompleted { worldline_id: worldline_id.clone() });
        self.publish();

        // The turn may have created worldlines; refresh off the frame path.
        let this = self.clone();
        let refreshed = worldline_id.clone();
        tokio::spawn(async move {
            if let Err(err) = this.inner.manager.refresh().await {
                warn!(error = %err, worldline_id = %refreshed, "post-turn refresh failed");
                return;
            }
            this.signal(SessionSignal::ContextRefresh);
            this.publish();
        });
    }

    /// Terminal failure for a turn: drop drafts, roll back the optimistic
    /// event, surface the message, return to idle.
    fn fail_turn(&self, worldline_id: &WorldlineId, message: &str) {
        let pending = {
            let mut state = self.inner.state.lock();
            state.streaming.remove(worldline_id);
            let pending = state.pending_optimistic.remove(worldline_id);
            let now = Utc::now();
            for job in state.jobs.iter_mut() {
                if &job.worldline_id == worldline_id && job.status.is_outstanding() {
                    job.status = JobStatus::Failed;
                    job.finished_at = Some(now);
                }
            }
            pending
        };

        let events = self.inner.manager.events(worldline_id);
        let rolled_back = remove(&events, pending.as_ref());
        if !Arc::ptr_eq(&rolled_back, &events) {
            self.inner.manager.store_events(worldline_id, rolled_back);
        }

        self.inner.phases.insert(worldline_id.clone(), TurnPhase::Idle);
        warn!(worldline_id = %worldline_id, error = message, "turn failed");
        self.status(worldline_id, format!("Error: {message}"));
        self.publish();
    }

    fn is_displayed(&self, worldline_id: &WorldlineId) -> bool {
        self.inner.manager.active().as_ref() == Some(worldline_id)
    }

    fn status(&self, worldline_id: &WorldlineId, text: String) {
        self.signal(SessionSignal::Status { worldline_id: worldline_id.clone(), text });
    }

    fn signal(&self, signal: SessionSignal) {
        // No receivers is fine.
        let _ = self.inner.signals.send(signal);
    }

    fn publish(&self) {
        let (streaming, traces) = {
            let state = self.inner.state.lock();
            (state.streaming.clone(), state.traces.clone())
        };
        let snapshot = SessionSnapshot {
            worldlines: self.inner.manager.worldlines(),
            events: self.inner.manager.all_events(),
            streaming,
            traces,
            active: self.inner.manager.active(),
            phases: self
                .inner
                .phases
                .iter()
                .map(|entry| (entry.key().clone(), *entry.value()))
                .collect(),
        };
        // send_replace updates the stored value even with no receivers, so
        // snapshot() stays current before anyone calls watch_snapshot().
        self.inner.snapshot_tx.send_replace(snapshot);
    }
}

fn delta_call_id(delta: &StreamDelta) -> Option<&loom_core::ids::CallId> {
    match delta {
        StreamDelta::ToolCallSql { call_id, .. }
        | StreamDelta::ToolCallPython { call_id, .. }
        | StreamDelta::ToolCallSubagents { call_id, .. }
        | StreamDelta::SubagentProgress { call_id, .. } => call_id.as_ref(),
        _ => None,
    }
}

/// Transitions persisted in an assistant message payload. These replace the
/// ephemeral trace built from live deltas.
fn persisted_transitions(event: &TimelineEvent) -> Option<Vec<RuntimeStateTransition>> {
    let raw = event.payload.get("state_transitions")?.as_array()?;
    Some(
        raw.iter()
            .filter_map(|value| serde_json::from_value(value.clone()).ok())
            .collect(),
    )
}

fn event_status_text(event: &TimelineEvent) -> Option<String> {
    let text = match event.event_type {
        TimelineEventType::UserMessage => "Message sent",
        TimelineEventType::AssistantMessage => "Answer received",
        TimelineEventType::AssistantPlan => "Plan received",
        TimelineEventType::SqlCall => "Running SQL…",
        TimelineEventType::PythonCall => "Running Python…",
        TimelineEventType::SubagentCall => "Spawning subagents…",
        TimelineEventType::SqlResult
        | TimelineEventType::PythonResult
        | TimelineEventType::SubagentResult => "Result received",
        TimelineEventType::TimeTravel | TimelineEventType::WorldlineCreated => return None,
    };
    Some(text.to_string())
}

fn delta_status_text(delta: &StreamDelta) -> Option<String> {
    match delta {
        StreamDelta::AssistantText { done: false, .. } => Some("Composing…".to_string()),
        StreamDelta::AssistantText { .. } => None,
        StreamDelta::ToolCallSql { skipped: true, skip_reason, .. }
        | StreamDelta::ToolCallPython { skipped: true, skip_reason, .. } => Some(format!(
            "Skipped: {}",
            skip_reason.as_deref().unwrap_or("not needed")
        )),
        StreamDelta::ToolCallSql { .. } => Some("Drafting SQL…".to_string()),
        StreamDelta::ToolCallPython { .. } => Some("Drafting Python…".to_string()),
        StreamDelta::ToolCallSubagents { progress, .. }
        | StreamDelta::SubagentProgress { progress, .. } => {
            match progress.task_count.or(progress.running_count) {
                Some(n) => Some(format!("Running {n} subagent task(s)…")),
                None => Some("Coordinating subagents…".to_string()),
            }
        }
        StreamDelta::StateTransition { .. } => None,
    }
}
