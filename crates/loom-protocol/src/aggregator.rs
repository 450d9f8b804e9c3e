use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use loom_core::delta::StreamDelta;
use loom_core::events::{TimelineEvent, TimelineEventType};
use loom_core::ids::CallId;

use crate::partial_json::{extract_code_field, finalize_code};
use crate::progress::{self, SubagentProgressSnapshot};

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DraftKind {
    Sql,
    Python,
    Subagents,
}

impl DraftKind {
    /// The argument-object field holding the displayable fragment.
    pub fn code_field(self) -> &'static str {
        match self {
            Self::Sql => "sql",
            Self::Python | Self::Subagents => "code",
        }
    }

    fn for_event(event_type: TimelineEventType) -> Option<Self> {
        match event_type {
            TimelineEventType::SqlCall | TimelineEventType::SqlResult => Some(Self::Sql),
            TimelineEventType::PythonCall | TimelineEventType::PythonResult => Some(Self::Python),
            TimelineEventType::SubagentCall | TimelineEventType::SubagentResult => {
                Some(Self::Subagents)
            }
            _ => None,
        }
    }
}

/// Stable address of one in-flight draft for the duration of a turn.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum DraftKey {
    Call(CallId),
    /// Per-kind placeholder used when the server omits call ids.
    Fallback(DraftKind),
}

/// Ephemeral client-side reconstruction of one tool call.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ToolDraft {
    pub kind: DraftKind,
    pub raw_args: String,
    pub code: String,
    pub created_at: DateTime<Utc>,
    /// Creation ordinal within the owning state, for most-recent resolution.
    ordinal: u64,
    pub done: bool,
    pub skipped: bool,
    pub skip_reason: Option<String>,
    pub progress: Option<SubagentProgressSnapshot>,
}

impl ToolDraft {
    fn new(kind: DraftKind, ordinal: u64, now: DateTime<Utc>) -> Self {
        Self {
            kind,
            raw_args: String::new(),
            code: String::new(),
            created_at: now,
            ordinal,
            done: false,
            skipped: false,
            skip_reason: None,
            progress: None,
        }
    }
}

/// Per-worldline live draft of an in-flight turn. Exists only while the turn
/// streams; cleared when the authoritative event arrives or the turn ends.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct StreamingState {
    pub text: String,
    pub text_started_at: Option<DateTime<Utc>>,
    pub tool_calls: BTreeMap<DraftKey, ToolDraft>,
    next_ordinal: u64,
}

/// Resolve the draft key for a tool-call delta.
///
/// Priority: the delta's own call id; the per-kind fallback key when already
/// in use; the most recently created in-flight draft of the kind (so early
/// deltas without ids don't spawn duplicate placeholders); the fallback key.
///
/// Two concurrent same-kind calls without call ids on one worldline are not
/// distinguishable on the wire; both fold into the most recent draft.
pub fn resolve_draft_key(
    state: &StreamingState,
    kind: DraftKind,
    call_id: Option<&CallId>,
) -> DraftKey {
    if let Some(id) = call_id {
        if !id.as_str().is_empty() {
            return DraftKey::Call(id.clone());
        }
    }

    let fallback = DraftKey::Fallback(kind);
    if state.tool_calls.contains_key(&fallback) {
        return fallback;
    }

    state
        .tool_calls
        .iter()
        .filter(|(_, d)| d.kind == kind && !d.done)
        .max_by_key(|(_, d)| d.ordinal)
        .map(|(k, _)| k.clone())
        .unwrap_or(fallback)
}

impl StreamingState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.text.is_empty() && self.tool_calls.is_empty()
    }

    /// Fold one delta into a new state. Never mutates `self`.
    pub fn apply(&self, delta: &StreamDelta, now: DateTime<Utc>) -> Self {
        let mut next = self.clone();
        match delta {
            StreamDelta::AssistantText { delta, done } => {
                if *done {
                    next.text.clear();
                    next.text_started_at = None;
                } else if !delta.is_empty() {
                    if next.text.is_empty() {
                        next.text_started_at = Some(now);
                    }
                    next.text.push_str(delta);
                }
            }

            StreamDelta::ToolCallSql { call_id, delta, done, skipped, skip_reason } => {
                next.fold_tool_call(
                    DraftKind::Sql,
                    call_id.as_ref(),
                    delta,
                    *done,
                    *skipped,
                    skip_reason.as_deref(),
                    now,
                );
            }

            StreamDelta::ToolCallPython { call_id, delta, done, skipped, skip_reason } => {
                next.fold_tool_call(
                    DraftKind::Python,
                    call_id.as_ref(),
                    delta,
                    *done,
                    *skipped,
                    skip_reason.as_deref(),
                    now,
                );
            }

            StreamDelta::ToolCallSubagents { call_id, parent_tool_call_id, progress }
            | StreamDelta::SubagentProgress { call_id, parent_tool_call_id, progress } => {
                let id = call_id.as_ref().or(parent_tool_call_id.as_ref());
                let key = resolve_draft_key(&next, DraftKind::Subagents, id);
                let ordinal = next.take_ordinal();
                let draft = next
                    .tool_calls
                    .entry(key)
                    .or_insert_with(|| ToolDraft::new(DraftKind::Subagents, ordinal, now));
                draft.progress = Some(progress::merge(draft.progress.as_ref(), progress, now));
            }

            // Transitions are traced by the orchestrator, not drafted.
            StreamDelta::StateTransition { .. } => {}
        }
        next
    }

    /// Drop whatever an authoritative persisted event shadows: the text draft
    /// for assistant messages, the matching tool draft for call/result events.
    pub fn clear_superseded(&self, event: &TimelineEvent) -> Self {
        let mut next = self.clone();
        match event.event_type {
            TimelineEventType::AssistantMessage | TimelineEventType::AssistantPlan => {
                next.text.clear();
                next.text_started_at = None;
            }
            t if t.is_call() || t.is_result() => {
                let call_id = event.call_id().or_else(|| event.parent_tool_call_id());
                let removed = match call_id {
                    Some(id) => next.tool_calls.remove(&DraftKey::Call(id)).is_some(),
                    None => false,
                };
                if !removed {
                    if let Some(kind) = DraftKind::for_event(t) {
                        let _ = next.tool_calls.remove(&DraftKey::Fallback(kind));
                    }
                }
            }
            _ => {}
        }
        next
    }

    #[allow(clippy::too_many_arguments)]
    fn fold_tool_call(
        &mut self,
        kind: DraftKind,
        call_id: Option<&CallId>,
        delta: &str,
        done: bool,
        skipped: bool,
        skip_reason: Option<&str>,
        now: DateTime<Utc>,
    ) {
        let key = resolve_draft_key(self, kind, call_id);
        let ordinal = self.take_ordinal();
        let draft = self
            .tool_calls
            .entry(key)
            .or_insert_with(|| ToolDraft::new(kind, ordinal, now));

        if !delta.is_empty() {
            draft.raw_args.push_str(delta);
            if let Some(code) = extract_code_field(&draft.raw_args, kind.code_field()) {
                draft.code = code;
            }
        }
        if done {
            draft.done = true;
            draft.code = finalize_code(&draft.raw_args, kind.code_field());
        }
        if skipped {
            // Kept and rendered as skipped rather than deleted.
            draft.skipped = true;
            draft.skip_reason = skip_reason.map(String::from);
        }
    }

    fn take_ordinal(&mut self) -> u64 {
        let n = self.next_ordinal;
        self.next_ordinal += 1;
        n
    }
}
