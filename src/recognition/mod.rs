//! Streaming speech recognition
//!
//! One session per connected speaker streams PCM frames to a recognizer
//! backend and turns its hypothesis events into sequenced transcript
//! segments with stable utterance identity.

pub mod backend;
pub mod manager;
pub mod session;
pub mod tcp;

pub use backend::{RecognizerBackend, RecognizerConnection, RecognizerSink};
pub use manager::RecognitionManager;
pub use session::{ConnectionGauge, ConnectionState, SpeakerSession};
pub use tcp::TcpRecognizer;

use serde::{Deserialize, Serialize};

use crate::protocol::TranscriptSegment;

fn default_confidence() -> f32 {
    1.0
}

/// One hypothesis event as the recognizer emits it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RecognitionEvent {
    /// Revisable partial hypothesis for the current utterance
    Interim {
        text: String,
        #[serde(default = "default_confidence")]
        confidence: f32,
    },
    /// Committed text; closes the current utterance
    Final {
        text: String,
        #[serde(default = "default_confidence")]
        confidence: f32,
    },
}

impl RecognitionEvent {
    pub fn text(&self) -> &str {
        match self {
            Self::Interim { text, .. } | Self::Final { text, .. } => text,
        }
    }

    pub fn confidence(&self) -> f32 {
        match self {
            Self::Interim { confidence, .. } | Self::Final { confidence, .. } => *confidence,
        }
    }

    pub fn is_final(&self) -> bool {
        matches!(self, Self::Final { .. })
    }
}

/// What a speaker session pushes downstream.
#[derive(Debug, Clone)]
pub enum SessionOutput {
    Segment {
        segment: TranscriptSegment,
        speaker_name: String,
    },
    /// Recognition gave up for this speaker, emitted at most once per
    /// session
    Unavailable {
        speaker_id: String,
        speaker_name: String,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_wire_format() {
        let event: RecognitionEvent =
            serde_json::from_str(r#"{"type":"interim","text":"hel","confidence":0.8}"#).unwrap();
        assert_eq!(event.text(), "hel");
        assert!(!event.is_final());

        // Confidence is optional on the wire
        let event: RecognitionEvent =
            serde_json::from_str(r#"{"type":"final","text":"hello"}"#).unwrap();
        assert!(event.is_final());
        assert_eq!(event.confidence(), 1.0);
    }
}
