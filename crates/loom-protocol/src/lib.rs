//! Wire layer: SSE frame decoding, the pure streaming aggregator, and the
//! HTTP stream transport.

pub mod aggregator;
pub mod decoder;
pub mod partial_json;
pub mod progress;
pub mod transport;

pub use aggregator::{DraftKey, DraftKind, StreamingState, ToolDraft};
pub use decoder::FrameDecoder;
pub use progress::{SubagentProgressSnapshot, SubagentTask};
pub use transport::FrameStream;
