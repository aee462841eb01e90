//! Utterance admission and lifetime
//!
//! The tracker is the single authority on what the current text of
//! every utterance is. Each utterance is one caption that is updated in
//! place: a segment is admitted only if it advances the utterance's
//! sequence watermark, and nothing is admitted after the final. Expired
//! finals are swept out, and each speaker's tracked utterances are
//! capped so a chatty speaker cannot grow state without bound.

use std::collections::{HashMap, VecDeque};

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use parking_lot::Mutex;
use tracing::{trace, warn};
use uuid::Uuid;

use crate::config::DeliveryConfig;
use crate::protocol::{LanguageCode, TranscriptSegment};

/// Admission decision for one segment.
#[derive(Debug, Clone, PartialEq)]
pub enum Verdict {
    /// Segment advances its utterance; fan it out
    Admit {
        /// Set when the segment finalized the utterance
        expires_at: Option<DateTime<Utc>>,
    },
    /// A newer segment for this utterance was already admitted
    Stale,
    /// The utterance is already finalized
    Finalized,
}

/// Tracked state of one utterance.
#[derive(Debug, Clone)]
pub struct UtteranceEntry {
    pub utterance_id: Uuid,
    pub speaker_id: String,
    pub sequence: u64,
    pub text: String,
    pub source_language: LanguageCode,
    pub is_final: bool,
    pub updated_at: DateTime<Utc>,
    pub expires_at: Option<DateTime<Utc>>,
}

struct TrackerInner {
    utterances: HashMap<Uuid, UtteranceEntry>,
    /// Per speaker, oldest first
    recency: HashMap<String, VecDeque<Uuid>>,
}

pub struct CaptionTracker {
    inner: Mutex<TrackerInner>,
    display_duration: ChronoDuration,
    max_recent_per_speaker: usize,
}

impl CaptionTracker {
    pub fn new(config: &DeliveryConfig) -> Self {
        Self {
            inner: Mutex::new(TrackerInner {
                utterances: HashMap::new(),
                recency: HashMap::new(),
            }),
            display_duration: ChronoDuration::milliseconds(config.display_duration_ms as i64),
            max_recent_per_speaker: config.max_recent_per_speaker,
        }
    }

    /// Decide whether a segment may proceed, updating tracked state if
    /// it does.
    pub fn admit(&self, segment: &TranscriptSegment) -> Verdict {
        let now = Utc::now();
        let mut inner = self.inner.lock();

        if let Some(entry) = inner.utterances.get_mut(&segment.utterance_id) {
            if entry.is_final {
                trace!(utterance = %segment.utterance_id, "segment after final, rejected");
                return Verdict::Finalized;
            }
            if segment.sequence <= entry.sequence {
                // Finality is authoritative even when delivery reordered
                // the final behind an interim
                if segment.is_final {
                    warn!(
                        utterance = %segment.utterance_id,
                        seen = entry.sequence,
                        got = segment.sequence,
                        "final arrived behind the interim watermark, accepting"
                    );
                } else {
                    trace!(
                        utterance = %segment.utterance_id,
                        seen = entry.sequence,
                        got = segment.sequence,
                        "stale segment rejected"
                    );
                    return Verdict::Stale;
                }
            }

            entry.sequence = entry.sequence.max(segment.sequence);
            entry.text = segment.text.clone();
            entry.is_final = segment.is_final;
            entry.updated_at = now;
            if segment.is_final {
                // Display windows run from the audio timestamp, not from
                // when the segment reached us
                entry.expires_at = Some(segment.captured_at + self.display_duration);
            }
            return Verdict::Admit {
                expires_at: entry.expires_at,
            };
        }

        // New utterance
        let expires_at = segment
            .is_final
            .then(|| segment.captured_at + self.display_duration);
        let inner = &mut *inner;
        inner.utterances.insert(
            segment.utterance_id,
            UtteranceEntry {
                utterance_id: segment.utterance_id,
                speaker_id: segment.speaker_id.clone(),
                sequence: segment.sequence,
                text: segment.text.clone(),
                source_language: segment.source_language.clone(),
                is_final: segment.is_final,
                updated_at: now,
                expires_at,
            },
        );

        let order = inner.recency.entry(segment.speaker_id.clone()).or_default();
        order.push_back(segment.utterance_id);
        while order.len() > self.max_recent_per_speaker {
            if let Some(evicted) = order.pop_front() {
                inner.utterances.remove(&evicted);
            }
        }

        Verdict::Admit { expires_at }
    }

    /// True while the given sequence is still the newest admitted for
    /// the utterance and no final has landed. Used to discard interim
    /// translation results that were overtaken while in flight.
    pub fn still_latest(&self, utterance_id: Uuid, sequence: u64) -> bool {
        self.inner
            .lock()
            .utterances
            .get(&utterance_id)
            .is_some_and(|entry| entry.sequence == sequence && !entry.is_final)
    }

    /// True while the utterance is tracked at all. Finals are published
    /// as long as this holds, even if delivery lagged.
    pub fn contains(&self, utterance_id: Uuid) -> bool {
        self.inner.lock().utterances.contains_key(&utterance_id)
    }

    /// Drop finalized utterances whose display window has passed.
    /// Returns how many were removed.
    pub fn sweep_expired(&self, now: DateTime<Utc>) -> usize {
        let mut inner = self.inner.lock();
        let expired: Vec<Uuid> = inner
            .utterances
            .values()
            .filter(|entry| entry.expires_at.is_some_and(|at| at <= now))
            .map(|entry| entry.utterance_id)
            .collect();

        for id in &expired {
            if let Some(entry) = inner.utterances.remove(id) {
                if let Some(order) = inner.recency.get_mut(&entry.speaker_id) {
                    order.retain(|tracked| tracked != id);
                    if order.is_empty() {
                        inner.recency.remove(&entry.speaker_id);
                    }
                }
            }
        }
        expired.len()
    }

    pub fn active_count(&self) -> usize {
        self.inner.lock().utterances.len()
    }

    /// Current entries for one speaker, oldest first.
    pub fn speaker_entries(&self, speaker_id: &str) -> Vec<UtteranceEntry> {
        let inner = self.inner.lock();
        inner
            .recency
            .get(speaker_id)
            .map(|order| {
                order
                    .iter()
                    .filter_map(|id| inner.utterances.get(id).cloned())
                    .collect()
            })
            .unwrap_or_default()
    }
}
