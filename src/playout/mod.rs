//! Playout: pacing assembled slices out to a sample sink

pub mod pacer;
pub mod samples;
pub mod sink;

pub use pacer::Pacer;
pub use samples::{ChunkOrigin, SampleChunk};
pub use sink::{ChannelSink, QueueSink, SampleSink, SharedSink};
