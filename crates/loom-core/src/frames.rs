use serde::{Deserialize, Serialize};

use crate::delta::StreamDelta;
use crate::events::TimelineEvent;
use crate::ids::WorldlineId;

/// One typed frame decoded from the streaming transport.
///
/// The wire form is `event: <kind>\ndata: <json>\n\n`; the decoder in
/// loom-protocol produces these in source order.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "frame", rename_all = "snake_case")]
pub enum StreamFrame {
    Event {
        seq: u64,
        worldline_id: WorldlineId,
        event: TimelineEvent,
    },
    Delta {
        seq: u64,
        worldline_id: WorldlineId,
        delta: StreamDelta,
    },
    Done {
        seq: u64,
        worldline_id: WorldlineId,
    },
    Error {
        message: String,
    },
    /// Synthesized by the decoder when a single frame fails to parse.
    /// Non-terminal: the rest of the stream is still usable.
    ParseError {
        message: String,
    },
}

impl StreamFrame {
    pub fn worldline_id(&self) -> Option<&WorldlineId> {
        match self {
            Self::Event { worldline_id, .. }
            | Self::Delta { worldline_id, .. }
            | Self::Done { worldline_id, .. } => Some(worldline_id),
            Self::Error { .. } | Self::ParseError { .. } => None,
        }
    }

    /// Done and Error frames end a turn.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done { .. } | Self::Error { .. })
    }
}
