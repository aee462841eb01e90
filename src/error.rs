//! Error types for the caption pipeline

use thiserror::Error;

/// Main error type for the crate
#[derive(Error, Debug)]
pub enum Error {
    #[error("Audio error: {0}")]
    Audio(#[from] AudioError),

    #[error("Recognition error: {0}")]
    Recognition(#[from] RecognitionError),

    #[error("Translation error: {0}")]
    Translation(#[from] TranslationError),

    #[error("Delivery error: {0}")]
    Delivery(#[from] DeliveryError),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Audio framing errors
#[derive(Error, Debug)]
pub enum AudioError {
    #[error("Unsupported sample rate: {0}")]
    UnsupportedRate(u32),

    #[error("Invalid channel count: {0}")]
    InvalidChannels(u16),

    #[error("Ingest ring closed")]
    IngestClosed,
}

/// Recognition session errors
#[derive(Error, Debug)]
pub enum RecognitionError {
    #[error("Connect failed: {0}")]
    ConnectFailed(String),

    #[error("Handshake rejected: {0}")]
    Handshake(String),

    #[error("Recognizer stream closed")]
    StreamClosed,

    #[error("Protocol violation: {0}")]
    Protocol(String),

    #[error("Session already active for speaker {0}")]
    SessionExists(String),

    #[error("No session for speaker {0}")]
    NoSession(String),

    #[error("Recognizer unreachable after {attempts} attempts")]
    Unavailable { attempts: u32 },

    #[error("Timeout")]
    Timeout,
}

/// Translation backend errors
#[derive(Error, Debug)]
pub enum TranslationError {
    #[error("Backend request failed: {0}")]
    Backend(String),

    #[error("Malformed backend response: {0}")]
    InvalidResponse(String),

    // Field can't be named `source`; thiserror would treat it as the
    // error's cause.
    #[error("Unsupported language pair: {from} -> {to}")]
    UnsupportedPair { from: String, to: String },

    #[error("Timeout")]
    Timeout,
}

/// Caption delivery errors
#[derive(Error, Debug)]
pub enum DeliveryError {
    #[error("No subscription for listener {0}")]
    UnknownListener(String),

    #[error("Subscription already exists for listener {0}")]
    AlreadySubscribed(String),

    #[error("Subscription closed")]
    SubscriptionClosed,
}

/// Result type alias for the crate
pub type Result<T> = std::result::Result<T, Error>;
