//! Caption fan-out to listeners
//!
//! Routes each translated caption to every listener whose display
//! language matches, keeps a bounded buffer of recent finals per
//! speaker and language, and replays that buffer to late joiners and
//! to listeners switching language mid-call.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::Ordering;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::config::DeliveryConfig;
use crate::delivery::queue::{CaptionQueue, CaptionReceiver, PushOutcome};
use crate::error::DeliveryError;
use crate::protocol::{CaptionEvent, LanguageCode, TranslatedCaption};
use crate::stats::PipelineStats;

struct ListenerHandle {
    display_language: LanguageCode,
    queue: Arc<CaptionQueue>,
}

struct BroadcastState {
    listeners: HashMap<String, ListenerHandle>,
    /// Recent finals per (speaker, language), oldest first
    recent: HashMap<(String, LanguageCode), VecDeque<TranslatedCaption>>,
}

pub struct Broadcaster {
    config: DeliveryConfig,
    stats: Arc<PipelineStats>,
    inner: Mutex<BroadcastState>,
}

impl Broadcaster {
    pub fn new(config: DeliveryConfig, stats: Arc<PipelineStats>) -> Self {
        Self {
            config,
            stats,
            inner: Mutex::new(BroadcastState {
                listeners: HashMap::new(),
                recent: HashMap::new(),
            }),
        }
    }

    /// Register a listener and replay recent finals in their language.
    pub fn subscribe(
        &self,
        listener_id: &str,
        display_language: LanguageCode,
    ) -> Result<CaptionReceiver, DeliveryError> {
        let mut inner = self.inner.lock();
        if inner.listeners.contains_key(listener_id) {
            return Err(DeliveryError::AlreadySubscribed(listener_id.to_string()));
        }

        let queue = CaptionQueue::new(self.config.queue_capacity);
        replay_recent(&inner.recent, &display_language, &queue);
        inner.listeners.insert(
            listener_id.to_string(),
            ListenerHandle {
                display_language: display_language.clone(),
                queue: Arc::clone(&queue),
            },
        );
        drop(inner);

        self.stats.listener_joined();
        debug!(listener = %listener_id, language = %display_language, "listener subscribed");
        Ok(CaptionReceiver::new(queue))
    }

    pub fn unsubscribe(&self, listener_id: &str) -> Result<(), DeliveryError> {
        let handle = self
            .inner
            .lock()
            .listeners
            .remove(listener_id)
            .ok_or_else(|| DeliveryError::UnknownListener(listener_id.to_string()))?;
        handle.queue.close();
        self.stats.listener_left();
        debug!(listener = %listener_id, "listener unsubscribed");
        Ok(())
    }

    /// Switch a listener's display language and replay recent finals
    /// already available in the new language.
    pub fn set_language(
        &self,
        listener_id: &str,
        display_language: LanguageCode,
    ) -> Result<(), DeliveryError> {
        let mut inner = self.inner.lock();
        let Some(handle) = inner.listeners.get_mut(listener_id) else {
            return Err(DeliveryError::UnknownListener(listener_id.to_string()));
        };
        if handle.display_language == display_language {
            return Ok(());
        }
        handle.display_language = display_language.clone();
        let queue = Arc::clone(&handle.queue);
        replay_recent(&inner.recent, &display_language, &queue);
        debug!(listener = %listener_id, language = %display_language, "display language switched");
        Ok(())
    }

    /// Currently visible captions for one listener: the unexpired recent
    /// finals in their display language, oldest first. Used for initial
    /// render and for reattachment after a UI pause.
    pub fn snapshot(&self, listener_id: &str) -> Result<Vec<TranslatedCaption>, DeliveryError> {
        let inner = self.inner.lock();
        let Some(handle) = inner.listeners.get(listener_id) else {
            return Err(DeliveryError::UnknownListener(listener_id.to_string()));
        };
        let now = Utc::now();
        let mut captions: Vec<TranslatedCaption> = inner
            .recent
            .iter()
            .filter(|((_, lang), _)| *lang == handle.display_language)
            .flat_map(|(_, buffer)| buffer.iter())
            .filter(|caption| caption.expires_at > now)
            .cloned()
            .collect();
        captions.sort_by_key(|caption| caption.captured_at);
        Ok(captions)
    }

    /// Distinct display languages across current listeners. This is
    /// the fan-out set: one translation per language, not per listener.
    pub fn active_languages(&self) -> Vec<LanguageCode> {
        let inner = self.inner.lock();
        let mut languages: Vec<LanguageCode> = Vec::new();
        for handle in inner.listeners.values() {
            if !languages.contains(&handle.display_language) {
                languages.push(handle.display_language.clone());
            }
        }
        languages
    }

    pub fn listener_count(&self) -> usize {
        self.inner.lock().listeners.len()
    }

    /// Deliver one caption to all listeners of its target language.
    pub fn publish(&self, caption: TranslatedCaption) {
        let mut inner = self.inner.lock();

        if caption.is_final && !caption.is_translating {
            remember_final(
                &mut inner.recent,
                &caption,
                self.config.max_recent_per_speaker,
            );
        }

        let target = caption.target_language.clone();
        let event = CaptionEvent::Caption(caption);
        for (listener_id, handle) in inner
            .listeners
            .iter()
            .filter(|(_, handle)| handle.display_language == target)
        {
            self.record_outcome(listener_id, handle.queue.push(event.clone()));
        }
    }

    /// Tell every listener that one speaker's recognition gave up.
    pub fn publish_unavailable(&self, speaker_id: String, speaker_name: String) {
        let event = CaptionEvent::Unavailable {
            speaker_id,
            speaker_name,
        };
        let inner = self.inner.lock();
        for (listener_id, handle) in inner.listeners.iter() {
            self.record_outcome(listener_id, handle.queue.push(event.clone()));
        }
    }

    /// Drop expired finals from the replay buffers.
    pub fn sweep_expired(&self, now: DateTime<Utc>) {
        let mut inner = self.inner.lock();
        inner.recent.retain(|_, buffer| {
            buffer.retain(|caption| caption.expires_at > now);
            !buffer.is_empty()
        });
    }

    fn record_outcome(&self, listener_id: &str, outcome: PushOutcome) {
        match outcome {
            PushOutcome::Enqueued => {
                self.stats.captions_enqueued.fetch_add(1, Ordering::Relaxed);
            }
            PushOutcome::Replaced => {
                self.stats.captions_enqueued.fetch_add(1, Ordering::Relaxed);
                self.stats.interims_superseded.fetch_add(1, Ordering::Relaxed);
            }
            PushOutcome::DisplacedInterim => {
                self.stats.captions_enqueued.fetch_add(1, Ordering::Relaxed);
                self.stats.captions_dropped.fetch_add(1, Ordering::Relaxed);
            }
            PushOutcome::DisplacedProtected => {
                self.stats.captions_enqueued.fetch_add(1, Ordering::Relaxed);
                self.stats.captions_dropped.fetch_add(1, Ordering::Relaxed);
                warn!(
                    listener = %listener_id,
                    "queue past its overshoot ceiling, oldest protected event dropped"
                );
            }
            PushOutcome::Rejected => {
                self.stats.captions_dropped.fetch_add(1, Ordering::Relaxed);
            }
            PushOutcome::Closed => {}
        }
    }
}

/// Queue every unexpired recent final in `language`, oldest first.
fn replay_recent(
    recent: &HashMap<(String, LanguageCode), VecDeque<TranslatedCaption>>,
    language: &LanguageCode,
    queue: &CaptionQueue,
) {
    let now = Utc::now();
    let mut captions: Vec<&TranslatedCaption> = recent
        .iter()
        .filter(|((_, lang), _)| lang == language)
        .flat_map(|(_, buffer)| buffer.iter())
        .filter(|caption| caption.expires_at > now)
        .collect();
    captions.sort_by_key(|caption| caption.captured_at);
    for caption in captions {
        queue.push(CaptionEvent::Caption(caption.clone()));
    }
}

/// Record a final in the replay buffer, collapsing revisions of the
/// same utterance into one entry.
fn remember_final(
    recent: &mut HashMap<(String, LanguageCode), VecDeque<TranslatedCaption>>,
    caption: &TranslatedCaption,
    cap: usize,
) {
    let key = (caption.speaker_id.clone(), caption.target_language.clone());
    let buffer = recent.entry(key).or_default();
    if let Some(slot) = buffer
        .iter_mut()
        .find(|queued| queued.utterance_id == caption.utterance_id)
    {
        *slot = caption.clone();
        return;
    }
    buffer.push_back(caption.clone());
    while buffer.len() > cap {
        buffer.pop_front();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration as ChronoDuration;
    use uuid::Uuid;

    fn broadcaster() -> Broadcaster {
        Broadcaster::new(DeliveryConfig::default(), Arc::new(PipelineStats::default()))
    }

    fn caption(
        utterance_id: Uuid,
        speaker: &str,
        target: &str,
        text: &str,
        is_final: bool,
    ) -> TranslatedCaption {
        TranslatedCaption {
            utterance_id,
            speaker_id: speaker.into(),
            speaker_name: speaker.to_uppercase(),
            sequence: 0,
            source_language: LanguageCode::new("en"),
            target_language: LanguageCode::new(target),
            display_text: text.into(),
            is_final,
            is_translating: false,
            untranslated: false,
            confidence: 0.9,
            captured_at: Utc::now(),
            expires_at: Utc::now() + ChronoDuration::seconds(30),
        }
    }

    #[tokio::test]
    async fn routes_by_display_language() {
        let b = broadcaster();
        let mut es = b.subscribe("l-es", LanguageCode::new("es")).unwrap();
        let mut ko = b.subscribe("l-ko", LanguageCode::new("ko")).unwrap();

        b.publish(caption(Uuid::new_v4(), "s1", "es", "hola", true));

        let got = es.recv().await.unwrap();
        match got {
            CaptionEvent::Caption(c) => assert_eq!(c.display_text, "hola"),
            other => panic!("unexpected event: {other:?}"),
        }

        b.unsubscribe("l-ko").unwrap();
        // The Korean listener saw nothing before unsubscribing
        assert!(ko.recv().await.is_none());
    }

    #[test]
    fn duplicate_subscription_rejected() {
        let b = broadcaster();
        let _first = b.subscribe("l1", LanguageCode::new("es")).unwrap();
        let err = b.subscribe("l1", LanguageCode::new("ko")).unwrap_err();
        assert!(matches!(err, DeliveryError::AlreadySubscribed(_)));
        assert_eq!(b.listener_count(), 1);
    }

    #[test]
    fn active_languages_are_distinct() {
        let b = broadcaster();
        let _a = b.subscribe("l1", LanguageCode::new("es")).unwrap();
        let _b = b.subscribe("l2", LanguageCode::new("es")).unwrap();
        let _c = b.subscribe("l3", LanguageCode::new("ko")).unwrap();

        let mut languages = b.active_languages();
        languages.sort_by(|a, b| a.as_str().cmp(b.as_str()));
        assert_eq!(
            languages,
            vec![LanguageCode::new("es"), LanguageCode::new("ko")]
        );
    }

    #[tokio::test]
    async fn unavailable_reaches_every_listener() {
        let b = broadcaster();
        let mut es = b.subscribe("l-es", LanguageCode::new("es")).unwrap();
        let mut ko = b.subscribe("l-ko", LanguageCode::new("ko")).unwrap();

        b.publish_unavailable("s1".into(), "Minh".into());

        assert!(matches!(
            es.recv().await.unwrap(),
            CaptionEvent::Unavailable { .. }
        ));
        assert!(matches!(
            ko.recv().await.unwrap(),
            CaptionEvent::Unavailable { .. }
        ));
    }

    #[tokio::test]
    async fn late_joiner_gets_recent_finals_in_order() {
        let b = broadcaster();
        // A listener must exist for the language so finals are produced
        // at all in a real pipeline; the buffer itself just needs the
        // publishes
        let mut early = caption(Uuid::new_v4(), "s1", "es", "primero", true);
        early.captured_at = Utc::now() - ChronoDuration::seconds(10);
        b.publish(early);
        b.publish(caption(Uuid::new_v4(), "s2", "es", "segundo", true));
        // Interims are not replayed
        b.publish(caption(Uuid::new_v4(), "s1", "es", "escribien", false));

        let mut late = b.subscribe("late", LanguageCode::new("es")).unwrap();
        let first = late.recv().await.unwrap();
        let second = late.recv().await.unwrap();
        match (first, second) {
            (CaptionEvent::Caption(a), CaptionEvent::Caption(c)) => {
                assert_eq!(a.display_text, "primero");
                assert_eq!(c.display_text, "segundo");
            }
            other => panic!("unexpected events: {other:?}"),
        }

        // A joiner in a language with no buffered finals gets nothing
        let mut fr = b.subscribe("late-fr", LanguageCode::new("fr")).unwrap();
        b.unsubscribe("late-fr").unwrap();
        assert!(fr.recv().await.is_none());
    }

    #[tokio::test]
    async fn revised_final_collapses_in_replay_buffer() {
        let b = broadcaster();
        let id = Uuid::new_v4();
        let mut provisional = caption(id, "s1", "es", "hello world", true);
        provisional.is_translating = true;
        b.publish(provisional);
        b.publish(caption(id, "s1", "es", "hola mundo", true));

        let mut late = b.subscribe("late", LanguageCode::new("es")).unwrap();
        match late.recv().await.unwrap() {
            CaptionEvent::Caption(c) => {
                assert_eq!(c.display_text, "hola mundo");
                assert!(!c.is_translating);
            }
            other => panic!("unexpected event: {other:?}"),
        }
        // Only the resolved caption was replayed
        b.unsubscribe("late").unwrap();
        assert!(late.recv().await.is_none());
    }

    #[tokio::test]
    async fn language_switch_changes_routing_and_replays() {
        let b = broadcaster();
        let mut listener = b.subscribe("l1", LanguageCode::new("es")).unwrap();
        b.publish(caption(Uuid::new_v4(), "s1", "ko", "annyeong", true));

        b.set_language("l1", LanguageCode::new("ko")).unwrap();
        // The Korean final published before the switch is replayed
        match listener.recv().await.unwrap() {
            CaptionEvent::Caption(c) => assert_eq!(c.display_text, "annyeong"),
            other => panic!("unexpected event: {other:?}"),
        }

        b.publish(caption(Uuid::new_v4(), "s1", "es", "hola", true));
        b.publish(caption(Uuid::new_v4(), "s1", "ko", "dasi", true));
        match listener.recv().await.unwrap() {
            CaptionEvent::Caption(c) => assert_eq!(c.display_text, "dasi"),
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[test]
    fn snapshot_returns_visible_captions_for_the_listener() {
        let b = broadcaster();
        let _rx = b.subscribe("l-es", LanguageCode::new("es")).unwrap();

        let mut early = caption(Uuid::new_v4(), "s1", "es", "primero", true);
        early.captured_at = Utc::now() - ChronoDuration::seconds(5);
        b.publish(early);
        b.publish(caption(Uuid::new_v4(), "s2", "es", "segundo", true));
        b.publish(caption(Uuid::new_v4(), "s1", "ko", "annyeong", true));
        let mut gone = caption(Uuid::new_v4(), "s1", "es", "viejo", true);
        gone.expires_at = Utc::now() - ChronoDuration::seconds(1);
        b.publish(gone);

        let visible = b.snapshot("l-es").unwrap();
        let texts: Vec<&str> = visible.iter().map(|c| c.display_text.as_str()).collect();
        assert_eq!(texts, vec!["primero", "segundo"]);

        assert!(matches!(
            b.snapshot("nobody"),
            Err(DeliveryError::UnknownListener(_))
        ));
    }

    #[test]
    fn never_draining_listener_stays_bounded() {
        let config = DeliveryConfig {
            queue_capacity: 2,
            ..DeliveryConfig::default()
        };
        let stats = Arc::new(PipelineStats::default());
        let b = Broadcaster::new(config, Arc::clone(&stats));
        let _rx = b.subscribe("slow", LanguageCode::new("es")).unwrap();

        for i in 0..12 {
            b.publish(caption(Uuid::new_v4(), "s1", "es", &format!("f{i}"), true));
        }

        // Eight queued at most; the four past the ceiling each cost an
        // older final
        let snap = stats.snapshot();
        assert_eq!(snap.captions_enqueued, 12);
        assert_eq!(snap.captions_dropped, 4);
    }

    #[tokio::test]
    async fn expired_finals_are_not_replayed() {
        let b = broadcaster();
        let mut stale = caption(Uuid::new_v4(), "s1", "es", "viejo", true);
        stale.expires_at = Utc::now() - ChronoDuration::seconds(1);
        b.publish(stale);

        b.sweep_expired(Utc::now());
        let mut late = b.subscribe("late", LanguageCode::new("es")).unwrap();
        b.unsubscribe("late").unwrap();
        assert!(late.recv().await.is_none());
    }
}
