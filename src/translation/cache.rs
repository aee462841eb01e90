//! TTL cache for translation results
//!
//! Repeated phrases (greetings, fillers) are common in live speech and the
//! backend round-trip dominates caption latency, so completed translations are
//! kept for a configurable window. A mutexed map with lazy expiry, capped so
//! an unbounded vocabulary cannot grow it forever.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use crate::config::TranslationConfig;
use crate::protocol::LanguageCode;
use crate::translation::backend::Translation;

/// Cache identity: the exact text for a language pair.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    pub source: LanguageCode,
    pub target: LanguageCode,
    pub text: String,
}

struct CacheEntry {
    translation: Translation,
    inserted_at: Instant,
}

pub struct TranslationCache {
    entries: Mutex<HashMap<CacheKey, CacheEntry>>,
    ttl: Duration,
    capacity: usize,
}

impl TranslationCache {
    pub fn new(config: &TranslationConfig) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            ttl: config.cache_ttl(),
            capacity: config.cache_capacity,
        }
    }

    /// Expired entries are dropped on access rather than by a sweeper.
    pub fn get(&self, key: &CacheKey) -> Option<Translation> {
        let mut entries = self.entries.lock();
        match entries.get(key) {
            Some(entry) if entry.inserted_at.elapsed() < self.ttl => {
                Some(entry.translation.clone())
            }
            Some(_) => {
                entries.remove(key);
                None
            }
            None => None,
        }
    }

    /// At capacity, expired entries are purged first; if the map is still
    /// full of live entries the new one is simply not cached.
    pub fn insert(&self, key: CacheKey, translation: Translation) {
        let mut entries = self.entries.lock();
        if entries.len() >= self.capacity && !entries.contains_key(&key) {
            let ttl = self.ttl;
            entries.retain(|_, entry| entry.inserted_at.elapsed() < ttl);
            if entries.len() >= self.capacity {
                return;
            }
        }
        entries.insert(
            key,
            CacheEntry {
                translation,
                inserted_at: Instant::now(),
            },
        );
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(text: &str) -> CacheKey {
        CacheKey {
            source: LanguageCode::new("en"),
            target: LanguageCode::new("es"),
            text: text.to_string(),
        }
    }

    fn translation(text: &str) -> Translation {
        Translation {
            text: text.to_string(),
            confidence: 0.8,
        }
    }

    #[test]
    fn returns_cached_translations() {
        let cache = TranslationCache::new(&TranslationConfig::default());
        cache.insert(key("hello"), translation("hola"));
        assert_eq!(cache.get(&key("hello")).unwrap().text, "hola");
        assert!(cache.get(&key("goodbye")).is_none());
    }

    #[test]
    fn entries_expire_after_the_ttl() {
        let config = TranslationConfig {
            cache_ttl_ms: 20,
            ..TranslationConfig::default()
        };
        let cache = TranslationCache::new(&config);
        cache.insert(key("hello"), translation("hola"));
        assert!(cache.get(&key("hello")).is_some());
        std::thread::sleep(Duration::from_millis(40));
        assert!(cache.get(&key("hello")).is_none());
        assert!(cache.is_empty());
    }

    #[test]
    fn live_entries_are_not_displaced_at_capacity() {
        let config = TranslationConfig {
            cache_capacity: 2,
            ..TranslationConfig::default()
        };
        let cache = TranslationCache::new(&config);
        cache.insert(key("one"), translation("uno"));
        cache.insert(key("two"), translation("dos"));
        cache.insert(key("three"), translation("tres"));
        assert_eq!(cache.len(), 2);
        assert!(cache.get(&key("three")).is_none());
        // replacing an existing key is always allowed
        cache.insert(key("one"), translation("1"));
        assert_eq!(cache.get(&key("one")).unwrap().text, "1");
    }

    #[test]
    fn expired_entries_make_room_at_capacity() {
        let config = TranslationConfig {
            cache_capacity: 2,
            cache_ttl_ms: 20,
            ..TranslationConfig::default()
        };
        let cache = TranslationCache::new(&config);
        cache.insert(key("one"), translation("uno"));
        cache.insert(key("two"), translation("dos"));
        std::thread::sleep(Duration::from_millis(40));
        cache.insert(key("three"), translation("tres"));
        assert_eq!(cache.get(&key("three")).unwrap().text, "tres");
        assert!(cache.get(&key("one")).is_none());
    }
}
