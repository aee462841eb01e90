//! Lock-free ingest ring for speaker audio
//!
//! Single-producer single-consumer ring that decouples the socket task
//! receiving a speaker's PCM chunks from the framer task consuming them.
//! Pushes never block; a full ring drops the incoming chunk and counts it.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use crossbeam::queue::ArrayQueue;

/// One PCM chunk as received from a speaker, any size, rate, or layout.
#[derive(Clone)]
pub struct AudioChunk {
    /// Interleaved samples in [-1.0, 1.0]
    pub samples: Vec<f32>,
    pub sample_rate: u32,
    pub channels: u16,
    /// Wall-clock time the chunk arrived
    pub captured_at: DateTime<Utc>,
}

impl AudioChunk {
    pub fn new(samples: Vec<f32>, sample_rate: u32, channels: u16) -> Self {
        Self {
            samples,
            sample_rate,
            channels,
            captured_at: Utc::now(),
        }
    }

    /// Samples per channel.
    pub fn samples_per_channel(&self) -> usize {
        if self.channels == 0 {
            return 0;
        }
        self.samples.len() / self.channels as usize
    }

    /// Chunk duration in microseconds.
    pub fn duration_us(&self) -> u64 {
        if self.sample_rate == 0 {
            return 0;
        }
        (self.samples_per_channel() as u64 * 1_000_000) / self.sample_rate as u64
    }
}

/// Lock-free SPSC ring of audio chunks.
pub struct ChunkRing {
    queue: ArrayQueue<AudioChunk>,
    dropped_chunks: AtomicUsize,
}

impl ChunkRing {
    pub fn new(capacity: usize) -> Self {
        Self {
            queue: ArrayQueue::new(capacity),
            dropped_chunks: AtomicUsize::new(0),
        }
    }

    /// Push a chunk. Returns false if the ring is full and the chunk
    /// was dropped.
    pub fn push(&self, chunk: AudioChunk) -> bool {
        match self.queue.push(chunk) {
            Ok(()) => true,
            Err(_) => {
                self.dropped_chunks.fetch_add(1, Ordering::Relaxed);
                false
            }
        }
    }

    pub fn pop(&self) -> Option<AudioChunk> {
        self.queue.pop()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn capacity(&self) -> usize {
        self.queue.capacity()
    }

    pub fn dropped_chunks(&self) -> usize {
        self.dropped_chunks.load(Ordering::Relaxed)
    }
}

/// Shared handle to a speaker's ingest ring.
pub type SharedChunkRing = Arc<ChunkRing>;

pub fn shared_ring(capacity: usize) -> SharedChunkRing {
    Arc::new(ChunkRing::new(capacity))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn push_pop_order() {
        let ring = ChunkRing::new(4);
        ring.push(AudioChunk::new(vec![0.0; 160], 16_000, 1));
        ring.push(AudioChunk::new(vec![1.0; 160], 16_000, 1));
        assert_eq!(ring.len(), 2);

        let first = ring.pop().unwrap();
        assert_eq!(first.samples[0], 0.0);
        let second = ring.pop().unwrap();
        assert_eq!(second.samples[0], 1.0);
        assert!(ring.is_empty());
    }

    #[test]
    fn full_ring_drops_and_counts() {
        let ring = ChunkRing::new(2);
        assert!(ring.push(AudioChunk::new(vec![0.0], 16_000, 1)));
        assert!(ring.push(AudioChunk::new(vec![0.0], 16_000, 1)));
        assert!(!ring.push(AudioChunk::new(vec![0.0], 16_000, 1)));
        assert_eq!(ring.dropped_chunks(), 1);
        assert_eq!(ring.len(), 2);
    }

    #[test]
    fn chunk_duration() {
        let chunk = AudioChunk::new(vec![0.0; 960], 48_000, 2);
        assert_eq!(chunk.samples_per_channel(), 480);
        assert_eq!(chunk.duration_us(), 10_000);
    }
}
