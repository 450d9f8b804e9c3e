/// Fallback message for an `error` frame whose payload lacks an `error` field.
pub const UNKNOWN_STREAM_ERROR: &str = "Unknown stream error";

/// Fixed message for a frame whose JSON payload failed to parse.
pub const FRAME_PARSE_ERROR: &str = "Failed to parse stream frame";

/// Typed error taxonomy for the streaming/reconciliation engine.
#[derive(Clone, Debug, thiserror::Error)]
pub enum StreamError {
    /// Connection drop, non-2xx, body read failure.
    #[error("transport error: {0}")]
    Transport(String),

    /// Malformed JSON in a single frame; the stream itself continues.
    #[error("{0}")]
    FrameParse(String),

    /// An explicit server-reported `error` frame, surfaced verbatim.
    #[error("{0}")]
    Server(String),

    /// Worldline creation/forking failed; the attempted state change is not applied.
    #[error("worldline operation failed: {0}")]
    BranchOp(String),

    /// Local cache failure. Never fatal to streaming.
    #[error("store error: {0}")]
    Store(String),
}

impl StreamError {
    /// Short classification string for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Transport(_) => "transport",
            Self::FrameParse(_) => "frame_parse",
            Self::Server(_) => "server",
            Self::BranchOp(_) => "branch_op",
            Self::Store(_) => "store",
        }
    }

    /// Transport failures roll back the optimistic event and return the
    /// worldline to idle; frame parse failures are skipped per frame.
    pub fn is_transport(&self) -> bool {
        matches!(self, Self::Transport(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kinds() {
        assert_eq!(StreamError::Transport("tcp reset".into()).kind(), "transport");
        assert_eq!(StreamError::FrameParse(FRAME_PARSE_ERROR.into()).kind(), "frame_parse");
        assert_eq!(StreamError::Server("overloaded".into()).kind(), "server");
        assert_eq!(StreamError::BranchOp("fork failed".into()).kind(), "branch_op");
    }

    #[test]
    fn server_error_displays_verbatim() {
        let e = StreamError::Server("tool runtime crashed".into());
        assert_eq!(e.to_string(), "tool runtime crashed");
    }

    #[test]
    fn transport_classification() {
        assert!(StreamError::Transport("eof".into()).is_transport());
        assert!(!StreamError::Server("x".into()).is_transport());
    }
}
