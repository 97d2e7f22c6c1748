//! Streaming strategy: chunked transcription during capture, ordered
//! assembly at the end.

mod assembler;
mod coordinator;

pub use assembler::TranscriptAssembler;
pub use coordinator::{SessionControl, SessionOutcome, StreamingCoordinator};
