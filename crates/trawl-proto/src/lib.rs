//! Wire types and the event-stream framing spoken between trawl and its search workers.
//!
//! A worker answers a [`SearchRequest`] with a text stream of frames:
//!
//! ```text
//! event: matches
//!
//! data: [{"path": "src/main.rs", ...}]
//!
//! event: done
//!
//! data: {"limit_hit": false, "error": ""}
//!
//! ```
//!
//! There may be any number of `matches` frames; `done` is always last.

mod decode;
mod types;
mod writer;

pub use decode::{read_all, DecodeError, FrameHandler, StreamDecoder};
pub use types::{
    ChunkMatch, DoneEvent, FileMatch, Location, PatternInfo, Range, SearchFrame, SearchRequest,
};
pub use writer::{encode_frame, EventWriter};

/// Event name of a batch of file matches.
pub const MATCHES_EVENT: &str = "matches";
/// Event name of the terminal frame.
pub const DONE_EVENT: &str = "done";

/// Maximum size of a single frame line (`event:` or `data:`), including the line terminator.
///
/// A worker must split larger result sets into several `matches` frames.
pub const MAX_FRAME_BYTES: usize = 32 * 1024 * 1024; // 32 MiB
