//! Local adapters: filesystem, in-process state, wall clock and the ffmpeg binary.

pub mod clock;
pub mod ffmpeg;
pub mod fs;
pub mod memory;

pub use clock::{ManualClock, TokioClock};
pub use ffmpeg::FfmpegConcat;
pub use fs::FileSnapshotStore;
pub use memory::MemorySnapshotStore;
