//! Pipeline assembly and speaker/listener lifecycle
//!
//! [`CaptionPipeline`] wires the five stages together: per-speaker audio
//! rings feed framer pumps, frames feed recognition sessions, session
//! output feeds the translation router, and the router publishes through
//! the delivery broadcaster. Callers interact with speakers through a
//! [`SpeakerIngest`] guard and with listeners through subscription calls;
//! everything in between is background tasks.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::audio::{
    shared_ring, validate_source_format, AudioChunk, Framer, FramerStats, FramerStatsSnapshot,
    PcmFrame, SharedChunkRing,
};
use crate::captions::CaptionTracker;
use crate::config::CaptionConfig;
use crate::delivery::{Broadcaster, CaptionReceiver};
use crate::error::{RecognitionError, Result};
use crate::protocol::{LanguageCode, SpeakerInfo, TranslatedCaption};
use crate::recognition::{ConnectionState, RecognitionManager, RecognizerBackend, TcpRecognizer};
use crate::stats::{PipelineStats, StatsSnapshot};
use crate::translation::{
    FallbackTranslator, GtxTranslator, MyMemoryTranslator, TranslationRouter, Translator,
};

/// Session output buffered between recognition and the router.
const OUTPUT_CHANNEL_CAPACITY: usize = 256;
/// How often expired captions are swept out of tracker and replay buffers.
const SWEEP_INTERVAL: std::time::Duration = std::time::Duration::from_secs(1);

struct SpeakerState {
    info: SpeakerInfo,
    sample_rate: u32,
    channels: u16,
    joined_at: DateTime<Utc>,
    generation: u64,
    ring: SharedChunkRing,
    framer_stats: Arc<FramerStats>,
    notify: Arc<Notify>,
    closed: Arc<AtomicBool>,
}

/// Roster entry for the HTTP surface.
#[derive(Debug, Clone, Serialize)]
pub struct SpeakerSnapshot {
    pub speaker_id: String,
    pub speaker_name: String,
    pub source_language: LanguageCode,
    pub sample_rate: u32,
    pub channels: u16,
    pub joined_at: DateTime<Utc>,
    /// None when the recognition session already ended on its own
    pub recognizer_state: Option<ConnectionState>,
    pub framer: FramerStatsSnapshot,
    pub dropped_chunks: usize,
}

/// Push handle for one speaker's audio. Dropping it (or calling
/// [`SpeakerIngest::finish`]) drains pending audio and lets the
/// recognition session close out the last utterance.
pub struct SpeakerIngest {
    speaker_id: String,
    sample_rate: u32,
    channels: u16,
    ring: SharedChunkRing,
    notify: Arc<Notify>,
    closed: Arc<AtomicBool>,
}

impl SpeakerIngest {
    pub fn speaker_id(&self) -> &str {
        &self.speaker_id
    }

    /// Push one binary PCM16-LE payload as received from a speaker socket.
    /// Returns false when the chunk was dropped (ring full or empty input).
    pub fn push_pcm16(&self, payload: &[u8]) -> bool {
        if payload.len() < 2 {
            return false;
        }
        self.push_samples(decode_pcm16_le(payload))
    }

    /// Push interleaved f32 samples in the speaker's announced format.
    pub fn push_samples(&self, samples: Vec<f32>) -> bool {
        if samples.is_empty() {
            return false;
        }
        let pushed = self
            .ring
            .push(AudioChunk::new(samples, self.sample_rate, self.channels));
        self.notify.notify_one();
        pushed
    }

    /// End of audio: the pump flushes the framer tail and closes the
    /// frame channel so the session force-finalizes.
    pub fn finish(&self) {
        self.closed.store(true, Ordering::Release);
        self.notify.notify_one();
    }
}

impl Drop for SpeakerIngest {
    fn drop(&mut self) {
        self.finish();
    }
}

impl std::fmt::Debug for SpeakerIngest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SpeakerIngest")
            .field("speaker_id", &self.speaker_id)
            .field("sample_rate", &self.sample_rate)
            .field("channels", &self.channels)
            .finish_non_exhaustive()
    }
}

fn decode_pcm16_le(payload: &[u8]) -> Vec<f32> {
    payload
        .chunks_exact(2)
        .map(|pair| i16::from_le_bytes([pair[0], pair[1]]) as f32 / 32_768.0)
        .collect()
}

pub struct CaptionPipeline {
    config: CaptionConfig,
    stats: Arc<PipelineStats>,
    tracker: Arc<CaptionTracker>,
    broadcaster: Arc<Broadcaster>,
    manager: RecognitionManager,
    speakers: Arc<DashMap<String, SpeakerState>>,
    next_generation: AtomicU64,
    sweeper: JoinHandle<()>,
}

impl CaptionPipeline {
    /// Production wiring: TCP recognizer, GTX-style HTTP translator with
    /// a MyMemory-style fallback chained behind it.
    pub fn new(config: CaptionConfig) -> Result<Self> {
        let recognizer: Arc<dyn RecognizerBackend> =
            Arc::new(TcpRecognizer::new(&config.recognition));
        let primary: Arc<dyn Translator> = Arc::new(GtxTranslator::new(&config.translation)?);
        let translator: Arc<dyn Translator> = if config.translation.fallback_endpoint.is_empty() {
            primary
        } else {
            Arc::new(FallbackTranslator::new(
                primary,
                Arc::new(MyMemoryTranslator::new(&config.translation)?),
            ))
        };
        Ok(Self::with_backends(config, recognizer, translator))
    }

    /// Same wiring with injected backends.
    pub fn with_backends(
        config: CaptionConfig,
        recognizer: Arc<dyn RecognizerBackend>,
        translator: Arc<dyn Translator>,
    ) -> Self {
        let stats = Arc::new(PipelineStats::default());
        let tracker = Arc::new(CaptionTracker::new(&config.delivery));
        let broadcaster = Arc::new(Broadcaster::new(
            config.delivery.clone(),
            Arc::clone(&stats),
        ));

        let (output_tx, output_rx) = mpsc::channel(OUTPUT_CHANNEL_CAPACITY);
        let router = Arc::new(TranslationRouter::new(
            &config,
            translator,
            Arc::clone(&tracker),
            Arc::clone(&broadcaster),
            Arc::clone(&stats),
        ));
        tokio::spawn(router.run(output_rx));

        let manager = RecognitionManager::new(
            config.recognition.clone(),
            recognizer,
            output_tx,
            Arc::clone(&stats),
        );

        let sweeper = tokio::spawn(sweep_loop(Arc::clone(&tracker), Arc::clone(&broadcaster)));

        Self {
            config,
            stats,
            tracker,
            broadcaster,
            manager,
            speakers: Arc::new(DashMap::new()),
            next_generation: AtomicU64::new(0),
            sweeper,
        }
    }

    /// Admit a speaker: start their recognition session and the audio
    /// pump, and hand back the ingest guard.
    pub fn add_speaker(
        &self,
        info: SpeakerInfo,
        sample_rate: u32,
        channels: u16,
    ) -> Result<SpeakerIngest> {
        validate_source_format(sample_rate, channels)?;
        let frames = self
            .manager
            .start_session(info.clone(), self.config.framer.target_sample_rate)?;

        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
        let framer = Framer::new(&self.config.framer);
        let framer_stats = framer.stats();
        let ring = shared_ring(self.config.framer.ingest_capacity);
        let notify = Arc::new(Notify::new());
        let closed = Arc::new(AtomicBool::new(false));

        let speaker_id = info.speaker_id.clone();
        self.speakers.insert(
            speaker_id.clone(),
            SpeakerState {
                info: info.clone(),
                sample_rate,
                channels,
                joined_at: Utc::now(),
                generation,
                ring: Arc::clone(&ring),
                framer_stats,
                notify: Arc::clone(&notify),
                closed: Arc::clone(&closed),
            },
        );
        self.stats.speaker_joined();

        tokio::spawn(pump_audio(
            speaker_id.clone(),
            generation,
            Arc::clone(&ring),
            Arc::clone(&notify),
            Arc::clone(&closed),
            framer,
            frames,
            Arc::clone(&self.speakers),
            Arc::clone(&self.stats),
        ));

        info!(
            speaker = %speaker_id,
            language = %info.source_language,
            sample_rate,
            channels,
            "speaker joined"
        );
        Ok(SpeakerIngest {
            speaker_id,
            sample_rate,
            channels,
            ring,
            notify,
            closed,
        })
    }

    /// Remove a speaker, force-finalizing any open utterance.
    pub fn remove_speaker(&self, speaker_id: &str) -> Result<SpeakerInfo> {
        let removed = self.speakers.remove(speaker_id).map(|(_, state)| state);
        if let Some(state) = &removed {
            state.closed.store(true, Ordering::Release);
            state.notify.notify_one();
            self.stats.speaker_left();
            self.stats.absorb_framer(
                &state.framer_stats.snapshot(),
                state.ring.dropped_chunks() as u64,
            );
        }
        match (self.manager.stop_session(speaker_id), removed) {
            (Ok(info), _) => {
                info!(speaker = %speaker_id, "speaker left");
                Ok(info)
            }
            // The session already ended on its own (idle timeout,
            // recognizer gave up); leaving is still a success.
            (Err(RecognitionError::NoSession(_)), Some(state)) => {
                info!(speaker = %speaker_id, "speaker left");
                Ok(state.info)
            }
            (Err(err), _) => Err(err.into()),
        }
    }

    pub fn subscribe_listener(
        &self,
        listener_id: &str,
        display_language: LanguageCode,
    ) -> Result<CaptionReceiver> {
        Ok(self.broadcaster.subscribe(listener_id, display_language)?)
    }

    pub fn unsubscribe_listener(&self, listener_id: &str) -> Result<()> {
        Ok(self.broadcaster.unsubscribe(listener_id)?)
    }

    pub fn set_listener_language(
        &self,
        listener_id: &str,
        display_language: LanguageCode,
    ) -> Result<()> {
        Ok(self.broadcaster.set_language(listener_id, display_language)?)
    }

    /// Captions currently visible to one listener.
    pub fn listener_snapshot(&self, listener_id: &str) -> Result<Vec<TranslatedCaption>> {
        Ok(self.broadcaster.snapshot(listener_id)?)
    }

    pub fn active_languages(&self) -> Vec<LanguageCode> {
        self.broadcaster.active_languages()
    }

    pub fn listener_count(&self) -> usize {
        self.broadcaster.listener_count()
    }

    pub fn speaker_count(&self) -> usize {
        self.speakers.len()
    }

    /// Roster with per-speaker framer counters.
    pub fn speakers(&self) -> Vec<SpeakerSnapshot> {
        let mut roster: Vec<SpeakerSnapshot> = self
            .speakers
            .iter()
            .map(|entry| {
                let state = entry.value();
                SpeakerSnapshot {
                    speaker_id: state.info.speaker_id.clone(),
                    speaker_name: state.info.speaker_name.clone(),
                    source_language: state.info.source_language.clone(),
                    sample_rate: state.sample_rate,
                    channels: state.channels,
                    joined_at: state.joined_at,
                    recognizer_state: self.manager.session_state(&state.info.speaker_id),
                    framer: state.framer_stats.snapshot(),
                    dropped_chunks: state.ring.dropped_chunks(),
                }
            })
            .collect();
        roster.sort_by(|a, b| a.speaker_id.cmp(&b.speaker_id));
        roster
    }

    /// Lifetime counters. Departed speakers' framer counters are folded
    /// in at removal; live speakers are added here.
    pub fn stats_snapshot(&self) -> StatsSnapshot {
        let mut snap = self.stats.snapshot();
        for entry in self.speakers.iter() {
            let state = entry.value();
            let framer = state.framer_stats.snapshot();
            snap.frames_emitted += framer.frames_emitted;
            snap.frames_suppressed += framer.frames_suppressed;
            snap.samples_shed += framer.samples_dropped;
            snap.chunks_dropped += state.ring.dropped_chunks() as u64;
        }
        snap
    }

    pub fn active_utterances(&self) -> usize {
        self.tracker.active_count()
    }

    /// Tear down every speaker session. Open utterances are
    /// force-finalized by their sessions on the way out.
    pub fn shutdown(&self) {
        let ids: Vec<String> = self
            .speakers
            .iter()
            .map(|entry| entry.key().clone())
            .collect();
        for speaker_id in ids {
            if let Err(err) = self.remove_speaker(&speaker_id) {
                warn!(speaker = %speaker_id, error = %err, "shutdown: speaker teardown failed");
            }
        }
    }
}

impl Drop for CaptionPipeline {
    fn drop(&mut self) {
        self.sweeper.abort();
    }
}

async fn sweep_loop(tracker: Arc<CaptionTracker>, broadcaster: Arc<Broadcaster>) {
    let mut ticker = tokio::time::interval(SWEEP_INTERVAL);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    loop {
        ticker.tick().await;
        let now = Utc::now();
        tracker.sweep_expired(now);
        broadcaster.sweep_expired(now);
    }
}

/// Drain the speaker's chunk ring through the framer into the session's
/// frame channel. Exits when the ingest guard closes (after flushing the
/// framer tail) or when the session side hangs up.
#[allow(clippy::too_many_arguments)]
async fn pump_audio(
    speaker_id: String,
    generation: u64,
    ring: SharedChunkRing,
    notify: Arc<Notify>,
    closed: Arc<AtomicBool>,
    mut framer: Framer,
    frames: mpsc::Sender<PcmFrame>,
    speakers: Arc<DashMap<String, SpeakerState>>,
    stats: Arc<PipelineStats>,
) {
    'pump: loop {
        let notified = notify.notified();
        tokio::pin!(notified);
        notified.as_mut().enable();

        let mut progressed = false;
        while let Some(chunk) = ring.pop() {
            progressed = true;
            let cut = match framer.push_chunk(&chunk) {
                Ok(cut) => cut,
                Err(err) => {
                    warn!(speaker = %speaker_id, error = %err, "bad audio chunk discarded");
                    continue;
                }
            };
            for frame in cut {
                if frames.send(frame).await.is_err() {
                    debug!(speaker = %speaker_id, "session gone, audio pump stopping");
                    break 'pump;
                }
            }
        }

        if closed.load(Ordering::Acquire) && ring.is_empty() {
            if let Some(tail) = framer.flush() {
                let _ = frames.send(tail).await;
            }
            debug!(speaker = %speaker_id, "audio pump drained");
            break;
        }
        if !progressed {
            notified.await;
        }
    }

    // Self-unregister unless a newer speaker reused the id
    if let Some((_, state)) = speakers.remove_if(&speaker_id, |_, state| state.generation == generation)
    {
        stats.speaker_left();
        stats.absorb_framer(&state.framer_stats.snapshot(), state.ring.dropped_chunks() as u64);
    }
}
