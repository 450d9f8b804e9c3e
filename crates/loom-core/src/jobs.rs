use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ids::{JobId, ThreadId, WorldlineId};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Queued,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    /// Outstanding jobs block new streaming on the same worldline.
    pub fn is_outstanding(self) -> bool {
        matches!(self, Self::Queued | Self::Running)
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Queued => "queued",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

impl std::str::FromStr for JobStatus {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "queued" => Ok(Self::Queued),
            "running" => Ok(Self::Running),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "cancelled" => Ok(Self::Cancelled),
            other => Err(format!("unknown job status: {other}")),
        }
    }
}

/// The outbound shape of one assistant-turn request.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TurnRequest {
    pub thread_id: ThreadId,
    pub worldline_id: WorldlineId,
    pub message: String,
    pub provider: String,
    pub model: String,
    pub max_iterations: u32,
}

/// One assistant-turn attempt on one worldline.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ChatJob {
    pub id: JobId,
    pub thread_id: ThreadId,
    pub worldline_id: WorldlineId,
    #[serde(default)]
    pub parent_job_id: Option<JobId>,
    #[serde(default)]
    pub fanout_group_id: Option<String>,
    #[serde(default)]
    pub task_label: Option<String>,
    pub status: JobStatus,
    pub request: TurnRequest,
    #[serde(default)]
    pub result_worldline_id: Option<WorldlineId>,
    #[serde(default)]
    pub result_summary: Option<String>,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub finished_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub queue_position: Option<u32>,
}

impl ChatJob {
    pub fn new(request: TurnRequest, status: JobStatus) -> Self {
        Self {
            id: JobId::new(),
            thread_id: request.thread_id.clone(),
            worldline_id: request.worldline_id.clone(),
            parent_job_id: None,
            fanout_group_id: None,
            task_label: None,
            status,
            request,
            result_worldline_id: None,
            result_summary: None,
            created_at: Utc::now(),
            started_at: None,
            finished_at: None,
            queue_position: None,
        }
    }
}
