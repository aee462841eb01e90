//! Recognition session registry
//!
//! Tracks one live session per speaker id. Sessions remove themselves
//! from the registry when their task ends, so a speaker can rejoin
//! after an idle teardown without an explicit stop.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{mpsc, oneshot};
use tracing::info;

use crate::audio::PcmFrame;
use crate::config::RecognitionConfig;
use crate::error::RecognitionError;
use crate::protocol::SpeakerInfo;
use crate::recognition::backend::RecognizerBackend;
use crate::recognition::session::{ConnectionGauge, ConnectionState, SpeakerSession};
use crate::recognition::SessionOutput;
use crate::stats::PipelineStats;

struct SessionHandle {
    speaker: SpeakerInfo,
    generation: u64,
    state: Arc<ConnectionGauge>,
    /// Dropping this tells the session to flush and exit
    _stop: oneshot::Sender<()>,
}

pub struct RecognitionManager {
    config: RecognitionConfig,
    backend: Arc<dyn RecognizerBackend>,
    sessions: Arc<DashMap<String, SessionHandle>>,
    output: mpsc::Sender<SessionOutput>,
    stats: Arc<PipelineStats>,
    next_generation: AtomicU64,
}

impl RecognitionManager {
    pub fn new(
        config: RecognitionConfig,
        backend: Arc<dyn RecognizerBackend>,
        output: mpsc::Sender<SessionOutput>,
        stats: Arc<PipelineStats>,
    ) -> Self {
        Self {
            config,
            backend,
            sessions: Arc::new(DashMap::new()),
            output,
            stats,
            next_generation: AtomicU64::new(0),
        }
    }

    /// Start a session for a speaker and return the frame sender that
    /// feeds it. Fails if the speaker already has a live session.
    pub fn start_session(
        &self,
        speaker: SpeakerInfo,
        sample_rate: u32,
    ) -> Result<mpsc::Sender<PcmFrame>, RecognitionError> {
        use dashmap::mapref::entry::Entry;

        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
        let (frames_tx, frames_rx) = mpsc::channel(self.config.frame_channel_capacity);
        let (stop_tx, stop_rx) = oneshot::channel();

        let session = SpeakerSession::new(
            speaker.clone(),
            sample_rate,
            self.config.clone(),
            Arc::clone(&self.backend),
            frames_rx,
            self.output.clone(),
            Arc::clone(&self.stats),
            stop_rx,
        );

        match self.sessions.entry(speaker.speaker_id.clone()) {
            Entry::Occupied(_) => {
                return Err(RecognitionError::SessionExists(speaker.speaker_id));
            }
            Entry::Vacant(slot) => {
                slot.insert(SessionHandle {
                    speaker: speaker.clone(),
                    generation,
                    state: session.connection_state(),
                    _stop: stop_tx,
                });
            }
        }

        let sessions = Arc::clone(&self.sessions);
        let speaker_id = speaker.speaker_id.clone();
        tokio::spawn(async move {
            session.run().await;
            // Only drop our own entry, not a replacement session
            sessions.remove_if(&speaker_id, |_, handle| handle.generation == generation);
        });

        info!(speaker = %speaker.speaker_id, language = %speaker.source_language, "recognition session started");
        Ok(frames_tx)
    }

    /// Stop a speaker's session. Dropping the frame sender lets the
    /// session flush and force-finalize before exiting.
    pub fn stop_session(&self, speaker_id: &str) -> Result<SpeakerInfo, RecognitionError> {
        match self.sessions.remove(speaker_id) {
            Some((_, handle)) => {
                info!(speaker = %speaker_id, "recognition session stopped");
                Ok(handle.speaker)
            }
            None => Err(RecognitionError::NoSession(speaker_id.to_string())),
        }
    }

    pub fn has_session(&self, speaker_id: &str) -> bool {
        self.sessions.contains_key(speaker_id)
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    /// Connection lifecycle of one speaker's session, if it is live.
    pub fn session_state(&self, speaker_id: &str) -> Option<ConnectionState> {
        self.sessions
            .get(speaker_id)
            .map(|handle| handle.state.get())
    }
}
