use serde::{Deserialize, Serialize};

use crate::ids::{CallId, WorldlineId};
use crate::transitions::RuntimeStateTransition;

/// One incremental fragment of an in-progress assistant turn.
///
/// Closed tagged union so adding a delta kind is a compile-checked change.
/// Fragment fields default, since the server sends sparse payloads.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StreamDelta {
    AssistantText {
        #[serde(default)]
        delta: String,
        #[serde(default)]
        done: bool,
    },

    ToolCallSql {
        #[serde(default)]
        call_id: Option<CallId>,
        #[serde(default)]
        delta: String,
        #[serde(default)]
        done: bool,
        #[serde(default)]
        skipped: bool,
        #[serde(default)]
        skip_reason: Option<String>,
    },

    ToolCallPython {
        #[serde(default)]
        call_id: Option<CallId>,
        #[serde(default)]
        delta: String,
        #[serde(default)]
        done: bool,
        #[serde(default)]
        skipped: bool,
        #[serde(default)]
        skip_reason: Option<String>,
    },

    ToolCallSubagents {
        #[serde(default)]
        call_id: Option<CallId>,
        #[serde(default)]
        parent_tool_call_id: Option<CallId>,
        #[serde(default)]
        progress: SubagentProgressDelta,
    },

    SubagentProgress {
        #[serde(default)]
        call_id: Option<CallId>,
        #[serde(default)]
        parent_tool_call_id: Option<CallId>,
        #[serde(default)]
        progress: SubagentProgressDelta,
    },

    StateTransition {
        #[serde(flatten)]
        transition: RuntimeStateTransition,
    },
}

impl StreamDelta {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::AssistantText { .. } => "assistant_text",
            Self::ToolCallSql { .. } => "tool_call_sql",
            Self::ToolCallPython { .. } => "tool_call_python",
            Self::ToolCallSubagents { .. } => "tool_call_subagents",
            Self::SubagentProgress { .. } => "subagent_progress",
            Self::StateTransition { .. } => "state_transition",
        }
    }
}

/// Incremental per-fan-out fields. Present fields overwrite the prior
/// snapshot; absent fields are preserved.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct SubagentProgressDelta {
    #[serde(default)]
    pub task_count: Option<u32>,
    #[serde(default)]
    pub phase: Option<String>,
    #[serde(default)]
    pub retry_count: Option<u32>,
    #[serde(default)]
    pub failure_code: Option<String>,
    #[serde(default)]
    pub max_subagents: Option<u32>,
    #[serde(default)]
    pub max_parallel_subagents: Option<u32>,
    #[serde(default)]
    pub queued_count: Option<u32>,
    #[serde(default)]
    pub running_count: Option<u32>,
    #[serde(default)]
    pub completed_count: Option<u32>,
    #[serde(default)]
    pub failed_count: Option<u32>,
    #[serde(default)]
    pub timed_out_count: Option<u32>,
    #[serde(default)]
    pub tasks: Vec<SubagentTaskDelta>,
}

/// Incremental fields for one fan-out task, keyed by `task_index`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SubagentTaskDelta {
    pub task_index: u32,
    #[serde(default)]
    pub status: Option<SubagentTaskStatus>,
    #[serde(default)]
    pub label: Option<String>,
    #[serde(default)]
    pub child_worldline_id: Option<WorldlineId>,
    #[serde(default)]
    pub result_worldline_id: Option<WorldlineId>,
    #[serde(default)]
    pub preview: Option<String>,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub retry_count: Option<u32>,
    #[serde(default)]
    pub recovered: Option<bool>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubagentTaskStatus {
    Pending,
    Queued,
    Running,
    Completed,
    Failed,
    TimedOut,
}

impl SubagentTaskStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::TimedOut)
    }
}
