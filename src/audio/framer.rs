//! Audio normalization and framing
//!
//! Turns arbitrary caller PCM (any rate, any channel layout, any chunk
//! size) into fixed-duration mono frames at the recognizer's sample
//! rate. Frames that are effectively silent are suppressed, and a
//! bounded pending buffer sheds the oldest audio under backpressure so
//! captions track the live conversation instead of a growing backlog.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::audio::ring::AudioChunk;
use crate::config::FramerConfig;
use crate::error::AudioError;

/// Lowest caller sample rate the framer accepts.
pub const MIN_SOURCE_RATE: u32 = 8_000;
/// Highest caller sample rate the framer accepts.
pub const MAX_SOURCE_RATE: u32 = 96_000;
/// Most interleaved channels the framer will downmix.
pub const MAX_CHANNELS: u16 = 8;

/// Shared check for chunk ingestion and speaker admission.
pub fn validate_source_format(sample_rate: u32, channels: u16) -> Result<(), AudioError> {
    if channels == 0 || channels > MAX_CHANNELS {
        return Err(AudioError::InvalidChannels(channels));
    }
    if !(MIN_SOURCE_RATE..=MAX_SOURCE_RATE).contains(&sample_rate) {
        return Err(AudioError::UnsupportedRate(sample_rate));
    }
    Ok(())
}

/// One recognizer-ready frame: mono PCM16 at the target rate.
#[derive(Debug, Clone)]
pub struct PcmFrame {
    pub samples: Vec<i16>,
    pub sample_rate: u32,
    /// Stamp of the chunk that completed this frame
    pub captured_at: DateTime<Utc>,
}

impl PcmFrame {
    pub fn duration_ms(&self) -> u64 {
        if self.sample_rate == 0 {
            return 0;
        }
        (self.samples.len() as u64 * 1_000) / self.sample_rate as u64
    }

    /// Little-endian byte view for wire transmission.
    pub fn to_le_bytes(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(self.samples.len() * 2);
        for s in &self.samples {
            bytes.extend_from_slice(&s.to_le_bytes());
        }
        bytes
    }
}

/// Counters shared between the framer task and the stats surface.
#[derive(Debug, Default)]
pub struct FramerStats {
    pub chunks_consumed: AtomicU64,
    pub frames_emitted: AtomicU64,
    pub frames_suppressed: AtomicU64,
    pub samples_dropped: AtomicU64,
}

impl FramerStats {
    pub fn snapshot(&self) -> FramerStatsSnapshot {
        FramerStatsSnapshot {
            chunks_consumed: self.chunks_consumed.load(Ordering::Relaxed),
            frames_emitted: self.frames_emitted.load(Ordering::Relaxed),
            frames_suppressed: self.frames_suppressed.load(Ordering::Relaxed),
            samples_dropped: self.samples_dropped.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct FramerStatsSnapshot {
    pub chunks_consumed: u64,
    pub frames_emitted: u64,
    pub frames_suppressed: u64,
    pub samples_dropped: u64,
}

/// Per-speaker framing state machine.
///
/// Owned by a single task; chunks go in, zero or more complete frames
/// come out per call.
pub struct Framer {
    target_rate: u32,
    frame_samples: usize,
    max_pending: usize,
    silence_rms: f32,
    /// Mono samples at the target rate, not yet cut into frames
    pending: VecDeque<f32>,
    /// Source rate of the previous chunk; a change resets interpolation
    src_rate: Option<u32>,
    /// Last input sample of the previous chunk, for interpolation
    /// across chunk boundaries
    prev_sample: Option<f32>,
    /// Fractional read position past `prev_sample`, in source samples
    pos: f64,
    stamp: DateTime<Utc>,
    stats: Arc<FramerStats>,
}

impl Framer {
    pub fn new(config: &FramerConfig) -> Self {
        let frame_samples = config.frame_samples();
        Self {
            target_rate: config.target_sample_rate,
            frame_samples,
            max_pending: frame_samples * config.overflow_factor,
            silence_rms: config.silence_rms,
            pending: VecDeque::with_capacity(frame_samples * config.overflow_factor),
            src_rate: None,
            prev_sample: None,
            pos: 0.0,
            stamp: Utc::now(),
            stats: Arc::new(FramerStats::default()),
        }
    }

    pub fn stats(&self) -> Arc<FramerStats> {
        Arc::clone(&self.stats)
    }

    /// Ingest one chunk, returning every frame it completed.
    ///
    /// Silent frames are counted but not returned. When pending audio
    /// exceeds the configured ceiling the oldest samples are discarded
    /// first.
    pub fn push_chunk(&mut self, chunk: &AudioChunk) -> Result<Vec<PcmFrame>, AudioError> {
        validate_source_format(chunk.sample_rate, chunk.channels)?;
        self.stats.chunks_consumed.fetch_add(1, Ordering::Relaxed);
        if chunk.samples.is_empty() {
            return Ok(Vec::new());
        }
        self.stamp = chunk.captured_at;

        let mono = downmix(&chunk.samples, chunk.channels);
        // A chunk shorter than one interleaved frame downmixes to
        // nothing; the resampler must never see an empty input
        if mono.is_empty() {
            return Ok(Vec::new());
        }

        if chunk.sample_rate == self.target_rate {
            // Passthrough; interpolation state is meaningless across a
            // rate switch, so clear it
            self.src_rate = Some(chunk.sample_rate);
            self.prev_sample = None;
            self.pos = 0.0;
            self.pending.extend(mono.iter().copied());
        } else {
            self.resample_into_pending(&mono, chunk.sample_rate);
        }

        self.shed_overflow();
        Ok(self.cut_frames())
    }

    /// Flush whatever is pending as one final zero-padded frame.
    ///
    /// Used when a speaker disconnects so trailing audio still reaches
    /// the recognizer.
    pub fn flush(&mut self) -> Option<PcmFrame> {
        if self.pending.is_empty() {
            return None;
        }
        let mut frame: Vec<f32> = self.pending.drain(..).collect();
        frame.resize(self.frame_samples, 0.0);
        if rms(&frame) < self.silence_rms {
            self.stats.frames_suppressed.fetch_add(1, Ordering::Relaxed);
            return None;
        }
        self.stats.frames_emitted.fetch_add(1, Ordering::Relaxed);
        Some(self.to_pcm(&frame))
    }

    fn resample_into_pending(&mut self, mono: &[f32], src_rate: u32) {
        if self.src_rate != Some(src_rate) {
            self.src_rate = Some(src_rate);
            self.prev_sample = None;
            self.pos = 0.0;
        }

        // Virtual input stream: last sample of the previous chunk
        // followed by this chunk
        let mut buf = Vec::with_capacity(mono.len() + 1);
        if let Some(prev) = self.prev_sample {
            buf.push(prev);
        }
        buf.extend_from_slice(mono);
        let last = buf.len() - 1;

        let step = src_rate as f64 / self.target_rate as f64;
        let mut pos = self.pos;
        while pos < last as f64 {
            let i = pos as usize;
            let frac = pos - i as f64;
            let a = buf[i] as f64;
            let b = buf[i + 1] as f64;
            self.pending.push_back((a + (b - a) * frac) as f32);
            pos += step;
        }

        self.prev_sample = buf.last().copied();
        self.pos = pos - last as f64;
    }

    fn shed_overflow(&mut self) {
        if self.pending.len() > self.max_pending {
            let drop = self.pending.len() - self.max_pending;
            self.pending.drain(..drop);
            self.stats
                .samples_dropped
                .fetch_add(drop as u64, Ordering::Relaxed);
        }
    }

    fn cut_frames(&mut self) -> Vec<PcmFrame> {
        let mut out = Vec::new();
        while self.pending.len() >= self.frame_samples {
            let frame: Vec<f32> = self.pending.drain(..self.frame_samples).collect();
            if rms(&frame) < self.silence_rms {
                self.stats.frames_suppressed.fetch_add(1, Ordering::Relaxed);
                continue;
            }
            self.stats.frames_emitted.fetch_add(1, Ordering::Relaxed);
            out.push(self.to_pcm(&frame));
        }
        out
    }

    fn to_pcm(&self, frame: &[f32]) -> PcmFrame {
        let samples = frame
            .iter()
            .map(|s| (s.clamp(-1.0, 1.0) * 32_767.0) as i16)
            .collect();
        PcmFrame {
            samples,
            sample_rate: self.target_rate,
            captured_at: self.stamp,
        }
    }
}

fn downmix(samples: &[f32], channels: u16) -> Vec<f32> {
    if channels == 1 {
        return samples.to_vec();
    }
    let ch = channels as usize;
    samples
        .chunks_exact(ch)
        .map(|frame| frame.iter().sum::<f32>() / ch as f32)
        .collect()
}

fn rms(frame: &[f32]) -> f32 {
    if frame.is_empty() {
        return 0.0;
    }
    let sum_sq: f32 = frame.iter().map(|s| s * s).sum();
    (sum_sq / frame.len() as f32).sqrt()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn framer() -> Framer {
        Framer::new(&FramerConfig::default())
    }

    #[test]
    fn passthrough_cuts_frames() {
        let mut f = framer();
        // 960 samples at 16 kHz mono = exactly two 30 ms frames
        let chunk = AudioChunk::new(vec![0.5; 960], 16_000, 1);
        let frames = f.push_chunk(&chunk).unwrap();
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0].samples.len(), 480);
        assert_eq!(frames[0].samples[0], 16_383);
        assert_eq!(frames[0].duration_ms(), 30);
    }

    #[test]
    fn stereo_downmix_averages_channels() {
        let mut f = framer();
        let mut samples = Vec::with_capacity(960);
        for _ in 0..480 {
            samples.push(0.25);
            samples.push(0.75);
        }
        let frames = f.push_chunk(&AudioChunk::new(samples, 16_000, 2)).unwrap();
        assert_eq!(frames.len(), 1);
        // (0.25 + 0.75) / 2 = 0.5
        assert_eq!(frames[0].samples[0], 16_383);
    }

    #[test]
    fn resamples_48k_to_16k() {
        let mut f = framer();
        // 100 ms at 48 kHz resamples to ~1600 samples, three full frames
        let chunk = AudioChunk::new(vec![0.5; 4_800], 48_000, 1);
        let frames = f.push_chunk(&chunk).unwrap();
        assert_eq!(frames.len(), 3);
        for frame in &frames {
            assert_eq!(frame.sample_rate, 16_000);
            assert_eq!(frame.samples[0], 16_383);
        }
    }

    #[test]
    fn resamples_44100_to_16k() {
        let mut f = framer();
        let chunk = AudioChunk::new(vec![0.5; 4_410], 44_100, 1);
        let frames = f.push_chunk(&chunk).unwrap();
        assert_eq!(frames.len(), 3);
    }

    #[test]
    fn resampling_is_continuous_across_chunks() {
        let mut f = framer();
        // Two 50 ms chunks at 48 kHz carry the same audio as one 100 ms
        // chunk, so the emitted frame count must match
        let total = f
            .push_chunk(&AudioChunk::new(vec![0.5; 2_400], 48_000, 1))
            .unwrap()
            .len()
            + f.push_chunk(&AudioChunk::new(vec![0.5; 2_400], 48_000, 1))
                .unwrap()
                .len();
        assert_eq!(total, 3);
    }

    #[test]
    fn silent_frames_are_suppressed() {
        let mut f = framer();
        let frames = f
            .push_chunk(&AudioChunk::new(vec![0.0; 960], 16_000, 1))
            .unwrap();
        assert!(frames.is_empty());
        let snap = f.stats().snapshot();
        assert_eq!(snap.frames_suppressed, 2);
        assert_eq!(snap.frames_emitted, 0);
    }

    #[test]
    fn overflow_sheds_oldest_samples() {
        let mut f = framer();
        // 20 000 samples against a 4 800-sample ceiling
        let samples: Vec<f32> = (0..20_000).map(|i| i as f32 / 32_768.0).collect();
        let frames = f.push_chunk(&AudioChunk::new(samples, 16_000, 1)).unwrap();

        let snap = f.stats().snapshot();
        assert_eq!(snap.samples_dropped, 15_200);
        assert_eq!(frames.len(), 10);
        // The survivors are the newest samples
        assert!(frames[0].samples[0] >= 15_000);
    }

    #[test]
    fn rejects_invalid_input() {
        let mut f = framer();
        let err = f
            .push_chunk(&AudioChunk::new(vec![0.0; 10], 16_000, 0))
            .unwrap_err();
        assert!(matches!(err, AudioError::InvalidChannels(0)));

        let err = f
            .push_chunk(&AudioChunk::new(vec![0.0; 10], 1_000, 1))
            .unwrap_err();
        assert!(matches!(err, AudioError::UnsupportedRate(1_000)));
    }

    #[test]
    fn empty_chunk_is_a_no_op() {
        let mut f = framer();
        let frames = f
            .push_chunk(&AudioChunk::new(Vec::new(), 16_000, 1))
            .unwrap();
        assert!(frames.is_empty());
    }

    #[test]
    fn chunk_shorter_than_one_interleaved_frame_is_dropped() {
        let mut f = framer();
        // A single stereo sample downmixes to nothing; it must neither
        // panic the resampler nor disturb its state
        let frames = f
            .push_chunk(&AudioChunk::new(vec![0.25], 48_000, 2))
            .unwrap();
        assert!(frames.is_empty());

        let frames = f
            .push_chunk(&AudioChunk::new(vec![0.5; 4_800], 48_000, 1))
            .unwrap();
        assert_eq!(frames.len(), 3);
    }

    #[test]
    fn rate_switch_resets_interpolation() {
        let mut f = framer();
        f.push_chunk(&AudioChunk::new(vec![0.5; 4_800], 48_000, 1))
            .unwrap();
        // Switching rates mid-stream must not panic or corrupt output
        let frames = f
            .push_chunk(&AudioChunk::new(vec![0.5; 480], 16_000, 1))
            .unwrap();
        for frame in &frames {
            assert_eq!(frame.samples.len(), 480);
        }
    }

    #[test]
    fn flush_emits_padded_tail() {
        let mut f = framer();
        f.push_chunk(&AudioChunk::new(vec![0.5; 600], 16_000, 1))
            .unwrap();
        // 120 samples pending after one full frame
        let tail = f.flush().unwrap();
        assert_eq!(tail.samples.len(), 480);
        assert_eq!(tail.samples[0], 16_383);
        assert_eq!(tail.samples[479], 0);
        assert!(f.flush().is_none());
    }

    #[test]
    fn pcm_bytes_are_little_endian() {
        let frame = PcmFrame {
            samples: vec![1, -2],
            sample_rate: 16_000,
            captured_at: Utc::now(),
        };
        assert_eq!(frame.to_le_bytes(), vec![0x01, 0x00, 0xFE, 0xFF]);
    }

    mod properties {
        use proptest::prelude::*;

        use super::*;

        proptest! {
            /// Where the caller cuts its chunks must not change the
            /// audio that comes out.
            #[test]
            fn split_points_do_not_change_output(
                split in 1usize..4_799,
                rate in prop_oneof![Just(16_000u32), Just(44_100), Just(48_000)],
            ) {
                let samples = vec![0.5f32; 4_800];
                let expected = framer()
                    .push_chunk(&AudioChunk::new(samples.clone(), rate, 1))
                    .unwrap()
                    .len();

                let mut f = framer();
                let (head, tail) = samples.split_at(split);
                let mut emitted = f
                    .push_chunk(&AudioChunk::new(head.to_vec(), rate, 1))
                    .unwrap()
                    .len();
                emitted += f
                    .push_chunk(&AudioChunk::new(tail.to_vec(), rate, 1))
                    .unwrap()
                    .len();
                prop_assert_eq!(emitted, expected);
            }

            /// Any valid input produces well-formed frames, never a panic.
            #[test]
            fn arbitrary_audio_yields_well_formed_frames(
                samples in proptest::collection::vec(-1.5f32..1.5, 0..2_000),
                rate in 8_000u32..96_000,
                channels in 1u16..4,
            ) {
                let mut f = framer();
                let frames = f
                    .push_chunk(&AudioChunk::new(samples, rate, channels))
                    .unwrap();
                for frame in frames {
                    prop_assert_eq!(frame.samples.len(), 480);
                    prop_assert_eq!(frame.sample_rate, 16_000);
                }
            }
        }
    }
}
