use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::instrument;

use loom_core::errors::StreamError;
use loom_core::events::TimelineEvent;
use loom_core::ids::{EventId, ThreadId, WorldlineId};
use loom_core::jobs::{ChatJob, JobStatus, TurnRequest};
use loom_core::worldlines::Worldline;
use loom_protocol::transport::{frame_stream, FrameStream};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("server returned {status}: {body}")]
    Http { status: u16, body: String },

    #[error("network error: {0}")]
    Network(String),

    #[error("decode error: {0}")]
    Decode(String),

    #[error(transparent)]
    Stream(#[from] StreamError),
}

/// A started streaming turn: the job record plus its ordered frame stream.
pub struct TurnHandle {
    pub job: ChatJob,
    pub frames: FrameStream,
}

/// Everything the session layer needs from the workspace server.
#[async_trait]
pub trait WorkspaceApi: Send + Sync {
    /// Start a streaming turn on a worldline.
    async fn submit_turn(&self, request: &TurnRequest) -> Result<TurnHandle, ApiError>;

    /// Enqueue a turn behind the worldline's outstanding job instead of
    /// streaming it now.
    async fn queue_turn(&self, request: &TurnRequest) -> Result<ChatJob, ApiError>;

    async fn list_worldlines(&self, thread_id: &ThreadId) -> Result<Vec<Worldline>, ApiError>;

    async fn create_worldline(
        &self,
        thread_id: &ThreadId,
        name: &str,
    ) -> Result<Worldline, ApiError>;

    async fn branch_from_event(
        &self,
        thread_id: &ThreadId,
        worldline_id: &WorldlineId,
        event_id: &EventId,
        name: &str,
    ) -> Result<Worldline, ApiError>;

    async fn fetch_events(
        &self,
        worldline_id: &WorldlineId,
    ) -> Result<Vec<TimelineEvent>, ApiError>;

    async fn poll_jobs(&self, thread_id: &ThreadId) -> Result<Vec<ChatJob>, ApiError>;
}

/// REST + SSE client for a workspace server.
pub struct HttpApi {
    client: Client,
    base_url: String,
}

impl HttpApi {
    pub fn new(base_url: impl Into<String>) -> Result<Self, ApiError> {
        let client = Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .build()
            .map_err(|e| ApiError::Network(e.to_string()))?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.base_url)
    }

    async fn get_json<T: DeserializeOwned>(&self, path: &str) -> Result<T, ApiError> {
        let resp = self
            .client
            .get(self.url(path))
            .send()
            .await
            .map_err(|e| ApiError::Network(e.to_string()))?;
        Self::decode(resp).await
    }

    async fn post_json<B: Serialize, T: DeserializeOwned>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<T, ApiError> {
        let resp = self
            .client
            .post(self.url(path))
            .json(body)
            .send()
            .await
            .map_err(|e| ApiError::Network(e.to_string()))?;
        Self::decode(resp).await
    }

    async fn decode<T: DeserializeOwned>(resp: reqwest::Response) -> Result<T, ApiError> {
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(ApiError::Http { status: status.as_u16(), body });
        }
        resp.json().await.map_err(|e| ApiError::Decode(e.to_string()))
    }
}

#[async_trait]
impl WorkspaceApi for HttpApi {
    #[instrument(skip(self, request), fields(worldline_id = %request.worldline_id))]
    async fn submit_turn(&self, request: &TurnRequest) -> Result<TurnHandle, ApiError> {
        let path = format!(
            "/threads/{}/worldlines/{}/turns",
            request.thread_id, request.worldline_id
        );
        let resp = self
            .client
            .post(self.url(&path))
            .header("accept", "text/event-stream")
            .json(request)
            .send()
            .await
            .map_err(|e| ApiError::Network(e.to_string()))?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(ApiError::Http { status: status.as_u16(), body });
        }

        // The job record for a streamed turn is implicit; the server reports
        // queue placement only through queue_turn and poll_jobs.
        let job = ChatJob::new(request.clone(), JobStatus::Running);
        let frames = frame_stream(resp.bytes_stream());
        Ok(TurnHandle { job, frames })
    }

    #[instrument(skip(self, request), fields(worldline_id = %request.worldline_id))]
    async fn queue_turn(&self, request: &TurnRequest) -> Result<ChatJob, ApiError> {
        let path = format!(
            "/threads/{}/worldlines/{}/queue",
            request.thread_id, request.worldline_id
        );
        self.post_json(&path, request).await
    }

    #[instrument(skip(self))]
    async fn list_worldlines(&self, thread_id: &ThreadId) -> Result<Vec<Worldline>, ApiError> {
        self.get_json(&format!("/threads/{thread_id}/worldlines")).await
    }

    #[instrument(skip(self))]
    async fn create_worldline(
        &self,
        thread_id: &ThreadId,
        name: &str,
    ) -> Result<Worldline, ApiError> {
        let path = format!("/threads/{thread_id}/worldlines");
        self.post_json(&path, &serde_json::json!({ "name": name })).await
    }

    #[instrument(skip(self))]
    async fn branch_from_event(
        &self,
        thread_id: &ThreadId,
        worldline_id: &WorldlineId,
        event_id: &EventId,
        name: &str,
    ) -> Result<Worldline, ApiError> {
        let path = format!("/threads/{thread_id}/worldlines/{worldline_id}/branch");
        self.post_json(&path, &serde_json::json!({ "event_id": event_id, "name": name }))
            .await
    }

    #[instrument(skip(self))]
    async fn fetch_events(
        &self,
        worldline_id: &WorldlineId,
    ) -> Result<Vec<TimelineEvent>, ApiError> {
        self.get_json(&format!("/worldlines/{worldline_id}/events")).await
    }

    #[instrument(skip(self))]
    async fn poll_jobs(&self, thread_id: &ThreadId) -> Result<Vec<ChatJob>, ApiError> {
        self.get_json(&format!("/threads/{thread_id}/jobs")).await
    }
}
