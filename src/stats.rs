//! Pipeline-wide operational counters
//!
//! One shared [`PipelineStats`] is threaded through every stage. Counters
//! are relaxed atomics except the per-language cache table, which sits
//! behind a short-lived mutex. A point-in-time [`StatsSnapshot`] is what
//! the HTTP surface serializes.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::Instant;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

/// Shared counters for the whole pipeline.
#[derive(Debug)]
pub struct PipelineStats {
    /// Currently connected speakers
    pub speakers: AtomicUsize,
    /// Currently connected listeners
    pub listeners: AtomicUsize,
    /// Interim segments produced by recognition
    pub interim_segments: AtomicU64,
    /// Final segments produced by recognition
    pub final_segments: AtomicU64,
    /// Segments synthesized when a speaker vanished mid-utterance
    pub forced_finals: AtomicU64,
    /// Recognizer reconnect attempts
    pub recognizer_reconnects: AtomicU64,
    /// Sessions that gave up and went unavailable
    pub recognizer_unavailable: AtomicU64,
    /// Translation backend calls actually issued
    pub translation_requests: AtomicU64,
    /// Translations served from cache
    pub translation_cache_hits: AtomicU64,
    /// Requests that piggybacked on an identical in-flight call
    pub translation_coalesced: AtomicU64,
    /// Backend calls that returned an error
    pub translation_failures: AtomicU64,
    /// Backend calls that exceeded the request deadline
    pub translation_timeouts: AtomicU64,
    /// Resolved translations discarded because the utterance moved on
    pub translation_stale_discards: AtomicU64,
    /// Captions enqueued across all listeners
    pub captions_enqueued: AtomicU64,
    /// Interim captions discarded by full listener queues
    pub captions_dropped: AtomicU64,
    /// Queued interims replaced in place by a newer revision
    pub interims_superseded: AtomicU64,
    /// Frames handed to recognition, departed speakers included
    pub frames_emitted: AtomicU64,
    /// Silent frames held back from recognition
    pub frames_suppressed: AtomicU64,
    /// Samples shed by framer backpressure
    pub samples_shed: AtomicU64,
    /// Chunks dropped by full ingest rings
    pub chunks_dropped: AtomicU64,
    /// Cache lookups per target language
    by_language: Mutex<HashMap<String, LanguageCounter>>,
    started_at: Instant,
}

#[derive(Debug, Default, Clone, Copy)]
struct LanguageCounter {
    lookups: u64,
    cache_hits: u64,
}

impl Default for PipelineStats {
    fn default() -> Self {
        Self {
            speakers: AtomicUsize::new(0),
            listeners: AtomicUsize::new(0),
            interim_segments: AtomicU64::new(0),
            final_segments: AtomicU64::new(0),
            forced_finals: AtomicU64::new(0),
            recognizer_reconnects: AtomicU64::new(0),
            recognizer_unavailable: AtomicU64::new(0),
            translation_requests: AtomicU64::new(0),
            translation_cache_hits: AtomicU64::new(0),
            translation_coalesced: AtomicU64::new(0),
            translation_failures: AtomicU64::new(0),
            translation_timeouts: AtomicU64::new(0),
            translation_stale_discards: AtomicU64::new(0),
            captions_enqueued: AtomicU64::new(0),
            captions_dropped: AtomicU64::new(0),
            interims_superseded: AtomicU64::new(0),
            frames_emitted: AtomicU64::new(0),
            frames_suppressed: AtomicU64::new(0),
            samples_shed: AtomicU64::new(0),
            chunks_dropped: AtomicU64::new(0),
            by_language: Mutex::new(HashMap::new()),
            started_at: Instant::now(),
        }
    }
}

impl PipelineStats {
    pub fn speaker_joined(&self) {
        self.speakers.fetch_add(1, Ordering::Relaxed);
    }

    pub fn speaker_left(&self) {
        self.speakers.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn listener_joined(&self) {
        self.listeners.fetch_add(1, Ordering::Relaxed);
    }

    pub fn listener_left(&self) {
        self.listeners.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn record_segment(&self, is_final: bool) {
        if is_final {
            self.final_segments.fetch_add(1, Ordering::Relaxed);
        } else {
            self.interim_segments.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Fold a departing speaker's framer counters into the lifetime
    /// totals. Live speakers are added at snapshot time instead.
    pub fn absorb_framer(&self, framer: &crate::audio::FramerStatsSnapshot, chunks_dropped: u64) {
        self.frames_emitted
            .fetch_add(framer.frames_emitted, Ordering::Relaxed);
        self.frames_suppressed
            .fetch_add(framer.frames_suppressed, Ordering::Relaxed);
        self.samples_shed
            .fetch_add(framer.samples_dropped, Ordering::Relaxed);
        self.chunks_dropped
            .fetch_add(chunks_dropped, Ordering::Relaxed);
    }

    /// One call per cache consultation, hit or miss.
    pub fn record_translation_lookup(&self, target_language: &str, cache_hit: bool) {
        let mut table = self.by_language.lock();
        let counter = table.entry(target_language.to_string()).or_default();
        counter.lookups += 1;
        if cache_hit {
            counter.cache_hits += 1;
        }
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        let mut languages: Vec<LanguageHitRate> = self
            .by_language
            .lock()
            .iter()
            .map(|(language, counter)| LanguageHitRate {
                language: language.clone(),
                lookups: counter.lookups,
                cache_hits: counter.cache_hits,
                hit_rate: if counter.lookups == 0 {
                    0.0
                } else {
                    counter.cache_hits as f64 / counter.lookups as f64
                },
            })
            .collect();
        languages.sort_by(|a, b| a.language.cmp(&b.language));

        StatsSnapshot {
            uptime_seconds: self.started_at.elapsed().as_secs(),
            speakers: self.speakers.load(Ordering::Relaxed),
            listeners: self.listeners.load(Ordering::Relaxed),
            interim_segments: self.interim_segments.load(Ordering::Relaxed),
            final_segments: self.final_segments.load(Ordering::Relaxed),
            forced_finals: self.forced_finals.load(Ordering::Relaxed),
            recognizer_reconnects: self.recognizer_reconnects.load(Ordering::Relaxed),
            recognizer_unavailable: self.recognizer_unavailable.load(Ordering::Relaxed),
            translation_requests: self.translation_requests.load(Ordering::Relaxed),
            translation_cache_hits: self.translation_cache_hits.load(Ordering::Relaxed),
            translation_coalesced: self.translation_coalesced.load(Ordering::Relaxed),
            translation_failures: self.translation_failures.load(Ordering::Relaxed),
            translation_timeouts: self.translation_timeouts.load(Ordering::Relaxed),
            translation_stale_discards: self.translation_stale_discards.load(Ordering::Relaxed),
            captions_enqueued: self.captions_enqueued.load(Ordering::Relaxed),
            captions_dropped: self.captions_dropped.load(Ordering::Relaxed),
            interims_superseded: self.interims_superseded.load(Ordering::Relaxed),
            frames_emitted: self.frames_emitted.load(Ordering::Relaxed),
            frames_suppressed: self.frames_suppressed.load(Ordering::Relaxed),
            samples_shed: self.samples_shed.load(Ordering::Relaxed),
            chunks_dropped: self.chunks_dropped.load(Ordering::Relaxed),
            languages,
        }
    }
}

/// Cache effectiveness for one target language.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LanguageHitRate {
    pub language: String,
    pub lookups: u64,
    pub cache_hits: u64,
    pub hit_rate: f64,
}

/// Serializable snapshot of [`PipelineStats`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatsSnapshot {
    pub uptime_seconds: u64,
    pub speakers: usize,
    pub listeners: usize,
    pub interim_segments: u64,
    pub final_segments: u64,
    pub forced_finals: u64,
    pub recognizer_reconnects: u64,
    pub recognizer_unavailable: u64,
    pub translation_requests: u64,
    pub translation_cache_hits: u64,
    pub translation_coalesced: u64,
    pub translation_failures: u64,
    pub translation_timeouts: u64,
    pub translation_stale_discards: u64,
    pub captions_enqueued: u64,
    pub captions_dropped: u64,
    pub interims_superseded: u64,
    pub frames_emitted: u64,
    pub frames_suppressed: u64,
    pub samples_shed: u64,
    pub chunks_dropped: u64,
    pub languages: Vec<LanguageHitRate>,
}
