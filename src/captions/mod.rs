//! Caption state tracking

pub mod tracker;

pub use tracker::{CaptionTracker, UtteranceEntry, Verdict};
