//! Per-speaker recognition session
//!
//! Pumps PCM frames into a recognizer stream and shapes its raw events
//! into transcript segments. The session owns utterance identity: each
//! utterance gets one UUID, a monotonically increasing sequence, and
//! exactly one final segment no matter how the stream ends.
//!
//! Connection loss force-finalizes the open utterance before a
//! reconnect with capped exponential backoff. Audio that buffers up
//! while the recognizer is unreachable is discarded, not replayed. Once
//! the configured number of consecutive attempts fails, the session
//! emits a single unavailability notice and stops.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::audio::PcmFrame;
use crate::config::RecognitionConfig;
use crate::error::RecognitionError;
use crate::protocol::{SpeakerInfo, TranscriptSegment};
use crate::recognition::backend::{RecognizerBackend, RecognizerConnection};
use crate::recognition::{RecognitionEvent, SessionOutput};
use crate::stats::PipelineStats;

/// How long to wait for tail events after half-closing the stream.
const DRAIN_WINDOW: Duration = Duration::from_secs(1);

/// Why the streaming loop returned.
enum StreamEnd {
    /// Frame channel closed, the speaker is gone
    SpeakerGone,
    /// No audio for the idle timeout
    Idle,
    /// Downstream stopped listening
    OutputClosed,
    /// Recognizer connection dropped, reconnect
    ConnectionLost,
}

/// Where a session currently stands with its recognizer, as shown on
/// the speaker roster.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    /// First connect in progress
    Connecting,
    /// Live stream, audio flowing
    Streaming,
    /// Connection lost, retrying with backoff
    Reconnecting,
    /// Gave up after the configured attempts
    Unavailable,
}

/// Shared cell the session task writes and roster queries read.
#[derive(Debug)]
pub struct ConnectionGauge(Mutex<ConnectionState>);

impl ConnectionGauge {
    fn new() -> Arc<Self> {
        Arc::new(Self(Mutex::new(ConnectionState::Connecting)))
    }

    pub fn get(&self) -> ConnectionState {
        *self.0.lock()
    }

    fn set(&self, state: ConnectionState) {
        *self.0.lock() = state;
    }
}

struct OpenUtterance {
    id: Uuid,
    next_sequence: u64,
    /// Most recent interim text, used if the utterance must be closed
    /// without a real final
    last_text: String,
    last_confidence: f32,
}

impl OpenUtterance {
    fn new() -> Self {
        Self {
            id: Uuid::new_v4(),
            next_sequence: 0,
            last_text: String::new(),
            last_confidence: 0.0,
        }
    }
}

pub struct SpeakerSession {
    speaker: SpeakerInfo,
    sample_rate: u32,
    config: RecognitionConfig,
    backend: Arc<dyn RecognizerBackend>,
    frames: mpsc::Receiver<PcmFrame>,
    output: mpsc::Sender<SessionOutput>,
    stats: Arc<PipelineStats>,
    /// Fires when the registry drops its end
    shutdown: oneshot::Receiver<()>,
    utterance: Option<OpenUtterance>,
    /// Capture stamp of the newest frame forwarded to the recognizer;
    /// segments are stamped with audio time, not arrival time
    last_audio_at: Option<DateTime<Utc>>,
    state: Arc<ConnectionGauge>,
}

impl SpeakerSession {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        speaker: SpeakerInfo,
        sample_rate: u32,
        config: RecognitionConfig,
        backend: Arc<dyn RecognizerBackend>,
        frames: mpsc::Receiver<PcmFrame>,
        output: mpsc::Sender<SessionOutput>,
        stats: Arc<PipelineStats>,
        shutdown: oneshot::Receiver<()>,
    ) -> Self {
        Self {
            speaker,
            sample_rate,
            config,
            backend,
            frames,
            output,
            stats,
            shutdown,
            utterance: None,
            last_audio_at: None,
            state: ConnectionGauge::new(),
        }
    }

    /// Shared connection-lifecycle view for roster queries.
    pub fn connection_state(&self) -> Arc<ConnectionGauge> {
        Arc::clone(&self.state)
    }

    /// Drive the session until the speaker leaves, the stream idles
    /// out, or recognition becomes unavailable.
    pub async fn run(mut self) {
        loop {
            let conn = match self.connect_with_backoff().await {
                Ok(conn) => conn,
                Err(err) => {
                    self.state.set(ConnectionState::Unavailable);
                    warn!(speaker = %self.speaker.speaker_id, error = %err, "recognition unavailable");
                    self.force_finalize().await;
                    self.stats
                        .recognizer_unavailable
                        .fetch_add(1, Ordering::Relaxed);
                    let _ = self
                        .output
                        .send(SessionOutput::Unavailable {
                            speaker_id: self.speaker.speaker_id.clone(),
                            speaker_name: self.speaker.speaker_name.clone(),
                        })
                        .await;
                    return;
                }
            };
            self.state.set(ConnectionState::Streaming);

            match self.stream_loop(conn).await {
                StreamEnd::SpeakerGone => {
                    debug!(speaker = %self.speaker.speaker_id, "speaker left, session done");
                    return;
                }
                StreamEnd::Idle => {
                    info!(speaker = %self.speaker.speaker_id, "session idle, shutting down");
                    return;
                }
                StreamEnd::OutputClosed => return,
                StreamEnd::ConnectionLost => {
                    self.state.set(ConnectionState::Reconnecting);
                    // A fresh connection cannot continue the old
                    // hypothesis, so close the utterance now
                    if !self.force_finalize().await {
                        return;
                    }
                }
            }
        }
    }

    async fn connect_with_backoff(&mut self) -> Result<RecognizerConnection, RecognitionError> {
        self.discard_buffered_frames();
        for attempt in 0..self.config.max_consecutive_failures {
            if attempt > 0 {
                self.state.set(ConnectionState::Reconnecting);
                self.stats
                    .recognizer_reconnects
                    .fetch_add(1, Ordering::Relaxed);
                self.discard_frames_during(self.config.backoff_for_attempt(attempt - 1))
                    .await;
            }
            match self.backend.open_stream(&self.speaker, self.sample_rate).await {
                Ok(conn) => {
                    // Frames that piled up while the connect was in
                    // flight are still outage audio
                    self.discard_buffered_frames();
                    return Ok(conn);
                }
                Err(err) => {
                    warn!(
                        speaker = %self.speaker.speaker_id,
                        attempt = attempt + 1,
                        error = %err,
                        "recognizer connect failed"
                    );
                }
            }
        }
        Err(RecognitionError::Unavailable {
            attempts: self.config.max_consecutive_failures,
        })
    }

    /// Throw away whatever audio is queued. A new connection only ever
    /// gets live speech.
    fn discard_buffered_frames(&mut self) {
        let mut dropped = 0usize;
        while self.frames.try_recv().is_ok() {
            dropped += 1;
        }
        if dropped > 0 {
            debug!(
                speaker = %self.speaker.speaker_id,
                frames = dropped,
                "discarded audio buffered during the outage"
            );
        }
    }

    /// Backoff sleep that keeps the frame channel drained while waiting.
    async fn discard_frames_during(&mut self, backoff: Duration) {
        let wait = tokio::time::sleep(backoff);
        tokio::pin!(wait);
        loop {
            tokio::select! {
                _ = &mut wait => return,
                maybe_frame = self.frames.recv() => {
                    if maybe_frame.is_none() {
                        // Channel closed; sleep out the rest normally
                        wait.await;
                        return;
                    }
                }
            }
        }
    }

    async fn stream_loop(&mut self, mut conn: RecognizerConnection) -> StreamEnd {
        let idle = tokio::time::sleep(self.config.idle_timeout());
        tokio::pin!(idle);

        loop {
            tokio::select! {
                maybe_frame = self.frames.recv() => match maybe_frame {
                    Some(frame) => {
                        idle.as_mut()
                            .reset(tokio::time::Instant::now() + self.config.idle_timeout());
                        self.last_audio_at = Some(frame.captured_at);
                        if conn.sink.send_audio(&frame).await.is_err() {
                            debug!(speaker = %self.speaker.speaker_id, "audio write failed");
                            return StreamEnd::ConnectionLost;
                        }
                    }
                    None => {
                        conn.sink.finish().await;
                        if !self.drain_events(&mut conn).await {
                            return StreamEnd::OutputClosed;
                        }
                        self.force_finalize().await;
                        return StreamEnd::SpeakerGone;
                    }
                },
                maybe_event = conn.events.recv() => match maybe_event {
                    Some(event) => {
                        if !self.handle_event(event).await {
                            return StreamEnd::OutputClosed;
                        }
                    }
                    None => {
                        debug!(speaker = %self.speaker.speaker_id, "recognizer stream lost");
                        return StreamEnd::ConnectionLost;
                    }
                },
                _ = &mut self.shutdown => {
                    conn.sink.finish().await;
                    if !self.drain_events(&mut conn).await {
                        return StreamEnd::OutputClosed;
                    }
                    self.force_finalize().await;
                    return StreamEnd::SpeakerGone;
                }
                _ = &mut idle => {
                    conn.sink.finish().await;
                    let _ = self.drain_events(&mut conn).await;
                    self.force_finalize().await;
                    return StreamEnd::Idle;
                }
            }
        }
    }

    /// Collect tail events for a bounded window after half-close.
    /// Returns false when downstream stopped listening.
    async fn drain_events(&mut self, conn: &mut RecognizerConnection) -> bool {
        let deadline = tokio::time::Instant::now() + DRAIN_WINDOW;
        loop {
            match tokio::time::timeout_at(deadline, conn.events.recv()).await {
                Ok(Some(event)) => {
                    if !self.handle_event(event).await {
                        return false;
                    }
                }
                Ok(None) | Err(_) => return true,
            }
        }
    }

    /// Shape one recognizer event into a transcript segment.
    /// Returns false when downstream stopped listening.
    async fn handle_event(&mut self, event: RecognitionEvent) -> bool {
        let text = event.text().trim();
        if text.is_empty() {
            if event.is_final() {
                // A textless final still has to close the utterance
                return self.force_finalize().await;
            }
            return true;
        }

        let is_final = event.is_final();
        let mut utt = self.utterance.take().unwrap_or_else(OpenUtterance::new);
        let segment = TranscriptSegment {
            utterance_id: utt.id,
            speaker_id: self.speaker.speaker_id.clone(),
            sequence: utt.next_sequence,
            text: text.to_string(),
            source_language: self.speaker.source_language.clone(),
            confidence: event.confidence().clamp(0.0, 1.0),
            is_final,
            captured_at: self.last_audio_at.unwrap_or_else(Utc::now),
        };
        utt.next_sequence += 1;
        if !is_final {
            utt.last_text = segment.text.clone();
            utt.last_confidence = segment.confidence;
            self.utterance = Some(utt);
        }

        self.stats.record_segment(is_final);
        self.output
            .send(SessionOutput::Segment {
                segment,
                speaker_name: self.speaker.speaker_name.clone(),
            })
            .await
            .is_ok()
    }

    /// Close the open utterance with its last interim text.
    /// Returns false when downstream stopped listening.
    async fn force_finalize(&mut self) -> bool {
        let Some(utt) = self.utterance.take() else {
            return true;
        };
        if utt.last_text.is_empty() {
            return true;
        }

        let segment = TranscriptSegment {
            utterance_id: utt.id,
            speaker_id: self.speaker.speaker_id.clone(),
            sequence: utt.next_sequence,
            text: utt.last_text,
            source_language: self.speaker.source_language.clone(),
            confidence: utt.last_confidence,
            is_final: true,
            captured_at: self.last_audio_at.unwrap_or_else(Utc::now),
        };
        debug!(
            speaker = %self.speaker.speaker_id,
            utterance = %segment.utterance_id,
            "force-finalizing open utterance"
        );
        self.stats.forced_finals.fetch_add(1, Ordering::Relaxed);
        self.stats.record_segment(true);
        self.output
            .send(SessionOutput::Segment {
                segment,
                speaker_name: self.speaker.speaker_name.clone(),
            })
            .await
            .is_ok()
    }
}
