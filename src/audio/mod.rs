//! Audio ingest subsystem

pub mod framer;
pub mod ring;

pub use framer::{validate_source_format, Framer, FramerStats, FramerStatsSnapshot, PcmFrame};
pub use ring::{shared_ring, AudioChunk, ChunkRing, SharedChunkRing};
