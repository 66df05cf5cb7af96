//! Agent response stream: SSE framing, event decoding and transcript folding.

mod decode;
mod sse;
mod transcript;

pub use decode::decode_frame;
pub use sse::{SseFrame, SseFrameReader};
pub use transcript::{
    Author, EntryKind, EntryMetadata, StepPolicy, Transcript, TranscriptChange, TranscriptEntry,
};
