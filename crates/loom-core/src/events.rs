use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ids::{CallId, EventId};

/// Closed set of persisted timeline event types.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimelineEventType {
    UserMessage,
    AssistantMessage,
    AssistantPlan,
    SqlCall,
    SqlResult,
    PythonCall,
    PythonResult,
    SubagentCall,
    SubagentResult,
    TimeTravel,
    WorldlineCreated,
}

impl TimelineEventType {
    /// Tool-call events open an exchange that a later result closes.
    pub fn is_call(self) -> bool {
        matches!(self, Self::SqlCall | Self::PythonCall | Self::SubagentCall)
    }

    pub fn is_result(self) -> bool {
        matches!(self, Self::SqlResult | Self::PythonResult | Self::SubagentResult)
    }

    /// Markers record worldline surgery rather than conversation content.
    pub fn is_marker(self) -> bool {
        matches!(self, Self::TimeTravel | Self::WorldlineCreated)
    }
}

impl std::fmt::Display for TimelineEventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = serde_json::to_value(self)
            .ok()
            .and_then(|v| v.as_str().map(String::from))
            .unwrap_or_else(|| format!("{self:?}"));
        f.write_str(&s)
    }
}

/// One persisted event on a worldline. Immutable once created; identity is `id`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TimelineEvent {
    pub id: EventId,
    pub parent_event_id: Option<EventId>,
    #[serde(rename = "type")]
    pub event_type: TimelineEventType,
    pub payload: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

impl TimelineEvent {
    pub fn new(event_type: TimelineEventType, payload: serde_json::Value) -> Self {
        Self {
            id: EventId::new(),
            parent_event_id: None,
            event_type,
            payload,
            created_at: Utc::now(),
        }
    }

    /// The tool-call id carried in the payload, when present.
    pub fn call_id(&self) -> Option<CallId> {
        self.payload
            .get("call_id")
            .and_then(|v| v.as_str())
            .filter(|s| !s.is_empty())
            .map(CallId::from_raw)
    }

    /// For subagent results: the explicit parent call linkage in the payload.
    pub fn parent_tool_call_id(&self) -> Option<CallId> {
        self.payload
            .get("parent_tool_call_id")
            .and_then(|v| v.as_str())
            .filter(|s| !s.is_empty())
            .map(CallId::from_raw)
    }

    pub fn is_optimistic(&self) -> bool {
        self.id.is_optimistic()
    }
}
