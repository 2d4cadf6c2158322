//! Process-lifetime cache of per-model upstream capabilities.
//!
//! Learns, by observing upstream error responses, whether a given
//! `(base_url, model)` pair wants `max_tokens` or `max_completion_tokens` in
//! its chat-completions request. See `proxy::upstream` for the probing logic
//! that populates this cache.

use std::collections::HashMap;
use std::sync::RwLock;

use chrono::{DateTime, Utc};

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    pub base_url: String,
    pub model: String,
}

impl CacheKey {
    pub fn new(base_url: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            model: model.into(),
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct CapabilityRecord {
    pub uses_max_completion_tokens: bool,
    pub last_checked: DateTime<Utc>,
}

/// Readers never block other readers; a write is exclusive but brief
/// (`HashMap::insert` only), satisfying the happens-before guarantee callers
/// rely on.
#[derive(Debug, Default)]
pub struct CapabilityCache {
    entries: RwLock<HashMap<CacheKey, CapabilityRecord>>,
}

impl CapabilityCache {
    pub fn new() -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
        }
    }

    pub fn get(&self, key: &CacheKey) -> Option<CapabilityRecord> {
        self.entries
            .read()
            .expect("capability cache lock poisoned")
            .get(key)
            .copied()
    }

    pub fn put(&self, key: CacheKey, uses_max_completion_tokens: bool) {
        let record = CapabilityRecord {
            uses_max_completion_tokens,
            last_checked: Utc::now(),
        };
        tracing::debug!(
            base_url = %key.base_url,
            model = %key.model,
            uses_max_completion_tokens,
            "capability cache updated"
        );
        self.entries
            .write()
            .expect("capability cache lock poisoned")
            .insert(key, record);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn absent_key_returns_none() {
        let cache = CapabilityCache::new();
        let key = CacheKey::new("https://api.openai.com/v1", "gpt-4o");
        assert!(cache.get(&key).is_none());
    }

    #[test]
    fn put_then_get_round_trips() {
        let cache = CapabilityCache::new();
        let key = CacheKey::new("https://api.openai.com/v1", "gpt-4o");
        cache.put(key.clone(), false);
        let record = cache.get(&key).expect("record present after put");
        assert!(!record.uses_max_completion_tokens);
    }

    #[test]
    fn distinct_models_do_not_collide() {
        let cache = CapabilityCache::new();
        let k1 = CacheKey::new("https://api.openai.com/v1", "gpt-4o");
        let k2 = CacheKey::new("https://api.openai.com/v1", "gpt-5");
        cache.put(k1.clone(), false);
        cache.put(k2.clone(), true);
        assert!(!cache.get(&k1).unwrap().uses_max_completion_tokens);
        assert!(cache.get(&k2).unwrap().uses_max_completion_tokens);
    }

    #[test]
    fn later_put_overwrites_earlier_for_same_key() {
        let cache = CapabilityCache::new();
        let key = CacheKey::new("https://api.openai.com/v1", "gpt-4o");
        cache.put(key.clone(), true);
        cache.put(key.clone(), false);
        assert!(!cache.get(&key).unwrap().uses_max_completion_tokens);
    }

    #[test]
    fn concurrent_reads_and_writes_do_not_panic() {
        use std::sync::Arc;
        use std::thread;

        let cache = Arc::new(CapabilityCache::new());
        let key = CacheKey::new("https://api.openai.com/v1", "gpt-4o");
        cache.put(key.clone(), true);

        let mut handles = Vec::new();
        for i in 0..8 {
            let cache = Arc::clone(&cache);
            let key = key.clone();
            handles.push(thread::spawn(move || {
                if i % 2 == 0 {
                    let _ = cache.get(&key);
                } else {
                    cache.put(key.clone(), i % 4 == 0);
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
        assert!(cache.get(&key).is_some());
    }
}
