//! # Polyglot Captions
//!
//! Real-time multilingual caption pipeline for multi-party calls.
//!
//! Each speaker streams PCM audio in; every listener reads captions in
//! their own display language. Recognition runs per speaker, translation
//! runs once per distinct listener language, and delivery keeps each
//! listener behind a bounded queue so one slow client never stalls the
//! call.
//!
//! ## Architecture Overview
//!
//! ```text
//!   Speaker A (WS /ws/speak)            Speaker B (WS /ws/speak)
//!   binary PCM16-LE chunks              binary PCM16-LE chunks
//!          │                                    │
//!          ▼                                    ▼
//!   ┌──────────────┐                     ┌──────────────┐
//!   │ Ingest Ring  │  lock-free, sheds   │ Ingest Ring  │
//!   │ (audio::ring)│  oldest under load  │              │
//!   └──────┬───────┘                     └──────┬───────┘
//!          ▼                                    ▼
//!   ┌──────────────┐                     ┌──────────────┐
//!   │    Framer    │  downmix, resample, │    Framer    │
//!   │(audio::framer│  fixed 30 ms mono   │              │
//!   └──────┬───────┘                     └──────┬───────┘
//!          ▼                                    ▼
//!   ┌──────────────────┐               ┌──────────────────┐
//!   │ Recognition      │   TCP to ASR  │ Recognition      │
//!   │ Session (per     │◀─────────────▶│ Session          │
//!   │ speaker, managed)│               │                  │
//!   └──────┬───────────┘               └──────┬───────────┘
//!          │  interim / final transcript segments
//!          └──────────────────┬────────────────┘
//!                             ▼
//!                  ┌────────────────────┐
//!                  │  Caption Tracker   │  utterance lifecycle,
//!                  │ (captions::tracker)│  stale-result rejection
//!                  └─────────┬──────────┘
//!                            ▼
//!                  ┌────────────────────┐
//!                  │ Translation Router │  one backend call per
//!                  │  cache + in-flight │  DISTINCT listener
//!                  │  coalescing        │  language, cached
//!                  └─────────┬──────────┘
//!                            ▼
//!                  ┌────────────────────┐
//!                  │    Broadcaster     │  per-listener bounded
//!                  │ (delivery module)  │  queues, finals kept
//!                  └─────────┬──────────┘
//!             ┌──────────────┼──────────────┐
//!             ▼              ▼              ▼
//!      Listener "en"   Listener "es"   Listener "vi"
//!      (WS /ws/captions, JSON caption events)
//! ```

pub mod api;
pub mod audio;
pub mod captions;
pub mod config;
pub mod delivery;
pub mod error;
pub mod pipeline;
pub mod protocol;
pub mod recognition;
pub mod stats;
pub mod translation;

pub use error::{Error, Result};
pub use pipeline::{CaptionPipeline, SpeakerIngest};

/// Application-wide constants
pub mod constants {
    /// Sample rate recognition sessions consume
    pub const RECOGNIZER_SAMPLE_RATE: u32 = 16_000;

    /// Default duration of one emitted PCM frame in milliseconds
    pub const DEFAULT_FRAME_MS: u32 = 30;

    /// Default recognizer endpoint
    pub const DEFAULT_RECOGNIZER_ADDR: &str = "127.0.0.1:43007";

    /// Default translation endpoint (GTX wire dialect)
    pub const DEFAULT_TRANSLATE_ENDPOINT: &str =
        "https://translate.googleapis.com/translate_a/single";

    /// Default fallback translation endpoint (MyMemory wire dialect)
    pub const DEFAULT_FALLBACK_ENDPOINT: &str = "https://api.mymemory.translated.net/get";

    /// Default HTTP/WebSocket port
    pub const DEFAULT_HTTP_PORT: u16 = 8766;

    /// Lock-free ingest ring capacity (in chunks)
    pub const INGEST_RING_CAPACITY: usize = 256;
}
