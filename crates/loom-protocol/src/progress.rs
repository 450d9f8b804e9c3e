use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use loom_core::delta::{SubagentProgressDelta, SubagentTaskDelta, SubagentTaskStatus};
use loom_core::ids::WorldlineId;

/// Client-side view of one fan-out, folded from `subagent_progress` deltas.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct SubagentProgressSnapshot {
    pub task_count: u32,
    pub phase: Option<String>,
    pub retry_count: Option<u32>,
    pub failure_code: Option<String>,
    pub max_subagents: Option<u32>,
    pub max_parallel_subagents: Option<u32>,
    pub queued_count: Option<u32>,
    pub running_count: Option<u32>,
    pub completed_count: Option<u32>,
    pub failed_count: Option<u32>,
    pub timed_out_count: Option<u32>,
    pub partial_failure: bool,
    /// Always sorted by `task_index`.
    pub tasks: Vec<SubagentTask>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SubagentTask {
    pub task_index: u32,
    pub status: Option<SubagentTaskStatus>,
    pub label: Option<String>,
    pub child_worldline_id: Option<WorldlineId>,
    pub result_worldline_id: Option<WorldlineId>,
    pub preview: Option<String>,
    pub error: Option<String>,
    pub retry_count: Option<u32>,
    pub recovered: Option<bool>,
    pub updated_at: DateTime<Utc>,
}

impl SubagentTask {
    fn from_delta(delta: &SubagentTaskDelta, now: DateTime<Utc>) -> Self {
        Self {
            task_index: delta.task_index,
            status: delta.status,
            label: delta.label.clone(),
            child_worldline_id: delta.child_worldline_id.clone(),
            result_worldline_id: delta.result_worldline_id.clone(),
            preview: delta.preview.clone(),
            error: delta.error.clone(),
            retry_count: delta.retry_count,
            recovered: delta.recovered,
            updated_at: now,
        }
    }

    /// Fields present in the delta overwrite; absent fields are preserved.
    fn merged_with(&self, delta: &SubagentTaskDelta, now: DateTime<Utc>) -> Self {
        Self {
            task_index: self.task_index,
            status: delta.status.or(self.status),
            label: delta.label.clone().or_else(|| self.label.clone()),
            child_worldline_id: delta
                .child_worldline_id
                .clone()
                .or_else(|| self.child_worldline_id.clone()),
            result_worldline_id: delta
                .result_worldline_id
                .clone()
                .or_else(|| self.result_worldline_id.clone()),
            preview: delta.preview.clone().or_else(|| self.preview.clone()),
            error: delta.error.clone().or_else(|| self.error.clone()),
            retry_count: delta.retry_count.or(self.retry_count),
            recovered: delta.recovered.or(self.recovered),
            updated_at: now,
        }
    }
}

/// Merge an incoming progress delta into the prior snapshot.
///
/// Merge is monotonic per task: a delta addressing one task index never
/// alters the recorded fields of any other task.
pub fn merge(
    prev: Option<&SubagentProgressSnapshot>,
    delta: &SubagentProgressDelta,
    now: DateTime<Utc>,
) -> SubagentProgressSnapshot {
    let mut snapshot = prev.cloned().unwrap_or_default();

    if let Some(phase) = &delta.phase {
        snapshot.phase = Some(phase.clone());
    }
    if let Some(v) = delta.retry_count {
        snapshot.retry_count = Some(v);
    }
    if let Some(code) = &delta.failure_code {
        snapshot.failure_code = Some(code.clone());
    }
    if let Some(v) = delta.max_subagents {
        snapshot.max_subagents = Some(v);
    }
    if let Some(v) = delta.max_parallel_subagents {
        snapshot.max_parallel_subagents = Some(v);
    }
    if let Some(v) = delta.queued_count {
        snapshot.queued_count = Some(v);
    }
    if let Some(v) = delta.running_count {
        snapshot.running_count = Some(v);
    }
    if let Some(v) = delta.completed_count {
        snapshot.completed_count = Some(v);
    }
    if let Some(v) = delta.failed_count {
        snapshot.failed_count = Some(v);
    }
    if let Some(v) = delta.timed_out_count {
        snapshot.timed_out_count = Some(v);
    }

    for task_delta in &delta.tasks {
        match snapshot
            .tasks
            .iter_mut()
            .find(|t| t.task_index == task_delta.task_index)
        {
            Some(existing) => *existing = existing.merged_with(task_delta, now),
            None => snapshot.tasks.push(SubagentTask::from_delta(task_delta, now)),
        }
    }
    snapshot.tasks.sort_by_key(|t| t.task_index);

    let declared = delta.task_count.unwrap_or(snapshot.task_count);
    snapshot.task_count = declared.max(snapshot.tasks.len() as u32);
    snapshot.partial_failure = snapshot.failed_count.unwrap_or(0) > 0
        || snapshot.timed_out_count.unwrap_or(0) > 0;

    snapshot
}
