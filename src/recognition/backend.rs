//! Recognizer backend abstraction
//!
//! A backend opens one bidirectional stream per speaker: PCM frames go
//! in through the sink, hypothesis events come back on a channel. The
//! channel closing is how a backend signals that the connection is
//! gone.

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::audio::PcmFrame;
use crate::error::RecognitionError;
use crate::protocol::SpeakerInfo;
use crate::recognition::RecognitionEvent;

/// An open per-speaker recognition stream.
pub struct RecognizerConnection {
    /// Write side
    pub sink: Box<dyn RecognizerSink>,
    /// Event side; closes when the connection drops
    pub events: mpsc::Receiver<RecognitionEvent>,
}

impl std::fmt::Debug for RecognizerConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RecognizerConnection").finish_non_exhaustive()
    }
}

/// Write half of a recognition stream.
#[async_trait]
pub trait RecognizerSink: Send {
    /// Stream one frame of audio.
    async fn send_audio(&mut self, frame: &PcmFrame) -> Result<(), RecognitionError>;

    /// Half-close after the last frame so the recognizer can flush its
    /// tail hypotheses.
    async fn finish(&mut self);
}

/// Factory for per-speaker recognition streams.
#[async_trait]
pub trait RecognizerBackend: Send + Sync {
    async fn open_stream(
        &self,
        speaker: &SpeakerInfo,
        sample_rate: u32,
    ) -> Result<RecognizerConnection, RecognitionError>;
}
