//! Shared data model and control messages
//!
//! Everything that crosses a stage boundary or the service surface lives
//! here: transcript segments, translated captions, and the JSON control
//! messages spoken on the WebSocket endpoints.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::stats::StatsSnapshot;

/// Lowercased language code ("en", "vi", "zh").
///
/// Normalized on construction so that map lookups and language matching
/// never depend on the casing a client happened to send.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String")]
pub struct LanguageCode(String);

impl LanguageCode {
    pub fn new(code: impl AsRef<str>) -> Self {
        Self(code.as_ref().trim().to_ascii_lowercase())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<String> for LanguageCode {
    fn from(code: String) -> Self {
        Self::new(code)
    }
}

impl From<&str> for LanguageCode {
    fn from(code: &str) -> Self {
        Self::new(code)
    }
}

impl fmt::Display for LanguageCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Identity of one speaking participant.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpeakerInfo {
    pub speaker_id: String,
    pub speaker_name: String,
    /// Language the speaker talks in; also the recognizer hint
    pub source_language: LanguageCode,
}

/// One revision of one utterance, as emitted by the recognition layer.
///
/// Interim revisions share an `utterance_id` and carry increasing
/// `sequence` values; at most one revision per utterance is final, and the
/// final revision is always the last one emitted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TranscriptSegment {
    pub utterance_id: Uuid,
    pub speaker_id: String,
    /// Monotonic within `utterance_id`, restarts at 0 for each utterance
    pub sequence: u64,
    pub text: String,
    pub source_language: LanguageCode,
    /// Recognition confidence in [0, 1]
    pub confidence: f32,
    pub is_final: bool,
    /// Timestamp of the audio, not of arrival
    pub captured_at: DateTime<Utc>,
}

/// A caption rendered for one target language.
///
/// The `utterance_id` is the stable identity a consumer keys its display
/// on: interim revisions and the in-flight/resolved translation states all
/// update the same caption in place.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TranslatedCaption {
    pub utterance_id: Uuid,
    pub speaker_id: String,
    pub speaker_name: String,
    pub sequence: u64,
    pub source_language: LanguageCode,
    pub target_language: LanguageCode,
    pub display_text: String,
    pub is_final: bool,
    /// True while the backend translation call is still in flight and
    /// `display_text` is the untranslated source text
    pub is_translating: bool,
    /// True when translation failed and the caption settled on the
    /// original text
    pub untranslated: bool,
    /// Recognition confidence, multiplied by translation confidence when
    /// the backend reports one
    pub confidence: f32,
    pub captured_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

/// Event stream item delivered to a subscribed listener.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CaptionEvent {
    Caption(TranslatedCaption),
    /// The recognizer for one speaker gave up; emitted once per failure
    Unavailable {
        speaker_id: String,
        speaker_name: String,
    },
}

impl CaptionEvent {
    /// Utterance this event belongs to, if any.
    pub fn utterance_id(&self) -> Option<Uuid> {
        match self {
            CaptionEvent::Caption(c) => Some(c.utterance_id),
            CaptionEvent::Unavailable { .. } => None,
        }
    }

    /// Events that must never be dropped by queue pressure: finals and
    /// unavailability notices.
    pub fn is_protected(&self) -> bool {
        match self {
            CaptionEvent::Caption(c) => c.is_final,
            CaptionEvent::Unavailable { .. } => true,
        }
    }
}

/// Client-to-server control messages (JSON text frames).
///
/// The speaker socket opens with `SpeakerHello` and then switches to
/// binary PCM16-LE frames; the listener socket opens with `ListenerHello`
/// and stays JSON both ways.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ControlMessage {
    SpeakerHello {
        speaker_id: String,
        speaker_name: String,
        language: LanguageCode,
        /// Native sample rate of the binary frames that follow
        sample_rate: u32,
        channels: u16,
    },
    ListenerHello {
        listener_id: String,
        display_language: LanguageCode,
    },
    /// Live display-language switch; future captions adopt the new target
    SetLanguage { language: LanguageCode },
    Ping,
    /// Request a point-in-time stats snapshot; answered with
    /// [`ServerMessage::Stats`]
    GetStats,
}

/// Server-to-client messages (JSON text frames).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    /// Acknowledges a hello
    Connected,
    Caption(TranslatedCaption),
    Unavailable {
        speaker_id: String,
        speaker_name: String,
    },
    LanguageUpdated { language: LanguageCode },
    Pong,
    Stats { stats: StatsSnapshot },
    Error { message: String },
}

impl From<CaptionEvent> for ServerMessage {
    fn from(event: CaptionEvent) -> Self {
        match event {
            CaptionEvent::Caption(c) => ServerMessage::Caption(c),
            CaptionEvent::Unavailable {
                speaker_id,
                speaker_name,
            } => ServerMessage::Unavailable {
                speaker_id,
                speaker_name,
            },
        }
    }
}
