//! Translation fan-out
//!
//! One task owns the transcript stream coming out of recognition. Each
//! admitted segment fans out per distinct display language, never per
//! listener: thirty Spanish listeners cost one backend call. Same-language
//! listeners get the original text synchronously; everyone else gets a
//! provisional caption at once and the resolved translation when it
//! lands.
//!
//! Backend calls run as spawned tasks behind a semaphore. Identical in-flight
//! requests share one future, and results landing after the utterance moved
//! on are discarded rather than delivered out of date.

use std::collections::HashMap;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use futures_util::future::{BoxFuture, Shared};
use futures_util::FutureExt;
use parking_lot::Mutex;
use tokio::sync::{mpsc, Semaphore};
use tracing::{debug, trace, warn};

use crate::captions::{CaptionTracker, Verdict};
use crate::config::CaptionConfig;
use crate::delivery::Broadcaster;
use crate::protocol::{LanguageCode, TranscriptSegment, TranslatedCaption};
use crate::recognition::SessionOutput;
use crate::stats::PipelineStats;
use crate::translation::backend::{Translation, Translator};
use crate::translation::cache::{CacheKey, TranslationCache};

type SharedTranslation = Shared<BoxFuture<'static, Option<Translation>>>;

pub struct TranslationRouter {
    config: crate::config::TranslationConfig,
    backend: Arc<dyn Translator>,
    cache: Arc<TranslationCache>,
    tracker: Arc<CaptionTracker>,
    broadcaster: Arc<Broadcaster>,
    stats: Arc<PipelineStats>,
    limiter: Arc<Semaphore>,
    /// In-flight requests, keyed like the cache so concurrent identical
    /// segments share one backend call.
    pending: Mutex<HashMap<CacheKey, SharedTranslation>>,
    display_duration: ChronoDuration,
}

impl TranslationRouter {
    pub fn new(
        config: &CaptionConfig,
        backend: Arc<dyn Translator>,
        tracker: Arc<CaptionTracker>,
        broadcaster: Arc<Broadcaster>,
        stats: Arc<PipelineStats>,
    ) -> Self {
        Self {
            backend,
            cache: Arc::new(TranslationCache::new(&config.translation)),
            tracker,
            broadcaster,
            stats,
            limiter: Arc::new(Semaphore::new(config.translation.max_in_flight)),
            pending: Mutex::new(HashMap::new()),
            display_duration: ChronoDuration::milliseconds(
                config.delivery.display_duration_ms as i64,
            ),
            config: config.translation.clone(),
        }
    }

    /// Consume session output until every sender is gone.
    pub async fn run(self: Arc<Self>, mut input: mpsc::Receiver<SessionOutput>) {
        while let Some(output) = input.recv().await {
            match output {
                SessionOutput::Segment {
                    segment,
                    speaker_name,
                } => self.route_segment(segment, speaker_name),
                SessionOutput::Unavailable {
                    speaker_id,
                    speaker_name,
                } => {
                    warn!(speaker = %speaker_id, "recognition gave up, notifying listeners");
                    self.broadcaster.publish_unavailable(speaker_id, speaker_name);
                }
            }
        }
        debug!("transcript stream closed, router exiting");
    }

    fn route_segment(self: &Arc<Self>, segment: TranscriptSegment, speaker_name: String) {
        let expires_at = match self.tracker.admit(&segment) {
            Verdict::Admit { expires_at } => {
                expires_at.unwrap_or(segment.captured_at + self.display_duration)
            }
            Verdict::Stale => {
                trace!(utterance = %segment.utterance_id, sequence = segment.sequence, "stale segment skipped");
                return;
            }
            Verdict::Finalized => {
                trace!(utterance = %segment.utterance_id, "segment after final skipped");
                return;
            }
        };

        for target in self.broadcaster.active_languages() {
            if target == segment.source_language {
                self.broadcaster
                    .publish(caption_from(&segment, &speaker_name, target, expires_at));
                continue;
            }
            if !segment.is_final && !self.config.translate_interim {
                continue;
            }
            // The source text shows immediately; the resolved text
            // updates the same caption in place
            let mut provisional =
                caption_from(&segment, &speaker_name, target.clone(), expires_at);
            provisional.is_translating = true;
            self.broadcaster.publish(provisional);

            let router = Arc::clone(self);
            let segment = segment.clone();
            let speaker_name = speaker_name.clone();
            tokio::spawn(async move {
                router
                    .translate_and_publish(segment, speaker_name, target, expires_at)
                    .await;
            });
        }
    }

    async fn translate_and_publish(
        self: Arc<Self>,
        segment: TranscriptSegment,
        speaker_name: String,
        target: LanguageCode,
        expires_at: DateTime<Utc>,
    ) {
        let key = CacheKey {
            source: segment.source_language.clone(),
            target: target.clone(),
            text: segment.text.clone(),
        };
        let translation = self.lookup_or_translate(key).await;

        // The utterance may have moved on while the request was in flight.
        if segment.is_final {
            if !self.tracker.contains(segment.utterance_id) {
                trace!(utterance = %segment.utterance_id, "utterance expired before translation landed");
                self.stats
                    .translation_stale_discards
                    .fetch_add(1, Ordering::Relaxed);
                return;
            }
        } else if !self.tracker.still_latest(segment.utterance_id, segment.sequence) {
            trace!(
                utterance = %segment.utterance_id,
                sequence = segment.sequence,
                "interim overtaken, translation discarded"
            );
            self.stats
                .translation_stale_discards
                .fetch_add(1, Ordering::Relaxed);
            return;
        }

        let mut caption = caption_from(&segment, &speaker_name, target, expires_at);
        match translation {
            Some(resolved) => {
                caption.display_text = resolved.text;
                caption.confidence = (segment.confidence * resolved.confidence).clamp(0.0, 1.0);
            }
            None => caption.untranslated = true,
        }
        self.broadcaster.publish(caption);
    }

    async fn lookup_or_translate(&self, key: CacheKey) -> Option<Translation> {
        if let Some(hit) = self.cache.get(&key) {
            self.stats.translation_cache_hits.fetch_add(1, Ordering::Relaxed);
            self.stats.record_translation_lookup(key.target.as_str(), true);
            return Some(hit);
        }
        self.stats.record_translation_lookup(key.target.as_str(), false);

        let (future, created) = {
            let mut pending = self.pending.lock();
            match pending.get(&key) {
                Some(shared) => {
                    self.stats.translation_coalesced.fetch_add(1, Ordering::Relaxed);
                    (shared.clone(), false)
                }
                None => {
                    let shared = self.translation_future(key.clone());
                    pending.insert(key.clone(), shared.clone());
                    (shared, true)
                }
            }
        };

        let result = future.await;
        if created {
            self.pending.lock().remove(&key);
        }
        result
    }

    fn translation_future(&self, key: CacheKey) -> SharedTranslation {
        let backend = Arc::clone(&self.backend);
        let cache = Arc::clone(&self.cache);
        let limiter = Arc::clone(&self.limiter);
        let stats = Arc::clone(&self.stats);
        let request_timeout = self.config.request_timeout();
        async move {
            let _permit = limiter.acquire_owned().await.ok()?;
            stats.translation_requests.fetch_add(1, Ordering::Relaxed);
            match tokio::time::timeout(
                request_timeout,
                backend.translate(&key.text, &key.source, &key.target),
            )
            .await
            {
                Ok(Ok(translation)) => {
                    cache.insert(key, translation.clone());
                    Some(translation)
                }
                Ok(Err(err)) => {
                    warn!(error = %err, "translation failed");
                    stats.translation_failures.fetch_add(1, Ordering::Relaxed);
                    None
                }
                Err(_) => {
                    warn!("translation timed out");
                    stats.translation_timeouts.fetch_add(1, Ordering::Relaxed);
                    None
                }
            }
        }
        .boxed()
        .shared()
    }
}

fn caption_from(
    segment: &TranscriptSegment,
    speaker_name: &str,
    target: LanguageCode,
    expires_at: DateTime<Utc>,
) -> TranslatedCaption {
    TranslatedCaption {
        utterance_id: segment.utterance_id,
        speaker_id: segment.speaker_id.clone(),
        speaker_name: speaker_name.to_string(),
        sequence: segment.sequence,
        source_language: segment.source_language.clone(),
        target_language: target,
        display_text: segment.text.clone(),
        is_final: segment.is_final,
        is_translating: false,
        untranslated: false,
        confidence: segment.confidence,
        captured_at: segment.captured_at,
        expires_at,
    }
}
