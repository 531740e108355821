//! Result Cache
//!
//! Keyed by the normalized question, the explicit reference date (if any)
//! and the schema fingerprint. A reload changes the fingerprint, so entries
//! from older dataset versions can never be hit again.

use crate::result::ResultSet;
use crate::schema::SchemaFingerprint;
use crate::validator::ValidatedQuery;
use chrono::NaiveDate;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tracing::debug;

#[derive(Debug, Clone)]
pub struct CacheEntry {
    pub key: String,
    pub query: ValidatedQuery,
    pub result: ResultSet,
    pub created_at: Instant,
    pub ttl: Duration,
}

impl CacheEntry {
    pub fn is_expired(&self) -> bool {
        self.created_at.elapsed() >= self.ttl
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheStats {
    pub hit_count: u64,
    pub miss_count: u64,
    pub entry_count: usize,
}

/// Lowercased, whitespace-collapsed question text
pub fn normalize_question(question: &str) -> String {
    question
        .split_whitespace()
        .map(|w| w.to_lowercase())
        .collect::<Vec<_>>()
        .join(" ")
}

pub fn cache_key(
    question: &str,
    reference_date: Option<NaiveDate>,
    fingerprint: &SchemaFingerprint,
) -> String {
    let mut hasher = DefaultHasher::new();
    normalize_question(question).hash(&mut hasher);
    reference_date.hash(&mut hasher);
    format!("{}:{:016x}", fingerprint, hasher.finish())
}

pub struct ResultCache {
    entries: DashMap<String, CacheEntry>,
    ttl: Duration,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl ResultCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            entries: DashMap::new(),
            ttl,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    pub fn get(&self, key: &str) -> Option<CacheEntry> {
        self.get_if(key, |_| true)
    }

    /// Hit only if the entry is live and `still_valid` accepts it. Expired or
    /// rejected entries are evicted and count as a miss.
    pub fn get_if(&self, key: &str, still_valid: impl FnOnce(&CacheEntry) -> bool) -> Option<CacheEntry> {
        // Clone out before any removal: a held shard guard would deadlock it
        let found = self.entries.get(key).map(|entry| entry.value().clone());

        let Some(entry) = found else {
            self.misses.fetch_add(1, Ordering::Relaxed);
            return None;
        };
        if entry.is_expired() || !still_valid(&entry) {
            debug!("Evicting cache entry {}", key);
            self.entries.remove(key);
            self.misses.fetch_add(1, Ordering::Relaxed);
            return None;
        }

        self.hits.fetch_add(1, Ordering::Relaxed);
        Some(entry)
    }

    /// Store a complete result. Last writer wins for identical keys.
    pub fn put(&self, key: String, query: ValidatedQuery, result: ResultSet) {
        let entry = CacheEntry {
            key: key.clone(),
            query,
            result,
            created_at: Instant::now(),
            ttl: self.ttl,
        };
        self.entries.insert(key, entry);
    }

    /// Drop entries from other schema versions and expired ones.
    pub fn purge_stale(&self, current: &SchemaFingerprint) -> usize {
        let prefix = format!("{}:", current);
        let before = self.entries.len();
        self.entries
            .retain(|key, entry| key.starts_with(&prefix) && !entry.is_expired());
        let purged = before.saturating_sub(self.entries.len());
        if purged > 0 {
            debug!("Purged {} stale cache entries", purged);
        }
        purged
    }

    pub fn clear(&self) {
        self.entries.clear();
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hit_count: self.hits.load(Ordering::Relaxed),
            miss_count: self.misses.load(Ordering::Relaxed),
            entry_count: self.entries.len(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{ColumnSpec, DisplayUnit, SchemaDescriptor, SemanticType};
    use crate::synth::CandidateQuery;
    use crate::validator::SqlValidator;

    fn validated() -> ValidatedQuery {
        let schema = SchemaDescriptor::new(
            "campaigns",
            vec![ColumnSpec {
                name: "Spend".to_string(),
                semantic_type: SemanticType::NumericAdditive,
                unit: DisplayUnit::Currency,
                ratio: None,
                grain: None,
                distinct_values: Vec::new(),
            }],
            1,
        );
        let candidate = CandidateQuery::generative("SELECT SUM(\"Spend\") AS spend FROM campaigns".to_string());
        SqlValidator::new(100).validate(&candidate, &schema).unwrap()
    }

    fn fingerprint(v: &str) -> SchemaFingerprint {
        SchemaFingerprint(v.to_string())
    }

    #[test]
    fn test_key_normalizes_question() {
        let fp = fingerprint("v1-abc");
        assert_eq!(
            cache_key("What is  CTR\tby platform", None, &fp),
            cache_key("what is ctr by platform", None, &fp)
        );
        assert_ne!(
            cache_key("what is ctr", None, &fp),
            cache_key("what is ctr", None, &fingerprint("v2-abc"))
        );
    }

    #[test]
    fn test_key_includes_explicit_reference_date() {
        let fp = fingerprint("v1-abc");
        let date = NaiveDate::from_ymd_opt(2024, 1, 8);
        assert_ne!(cache_key("spend last week", None, &fp), cache_key("spend last week", date, &fp));
    }

    #[test]
    fn test_miss_is_counted() {
        let cache = ResultCache::new(Duration::from_secs(60));
        assert!(cache.get("missing").is_none());
        let stats = cache.stats();
        assert_eq!(stats.miss_count, 1);
        assert_eq!(stats.hit_count, 0);
        assert_eq!(stats.entry_count, 0);
    }

    #[test]
    fn test_put_then_hit() {
        let cache = ResultCache::new(Duration::from_secs(60));
        cache.put("k".to_string(), validated(), ResultSet::new(Vec::new(), Vec::new()));
        assert!(cache.get("k").is_some());
        assert_eq!(cache.stats().hit_count, 1);
        assert_eq!(cache.stats().entry_count, 1);
    }

    #[test]
    fn test_expired_entry_is_evicted() {
        let cache = ResultCache::new(Duration::ZERO);
        cache.put("k".to_string(), validated(), ResultSet::new(Vec::new(), Vec::new()));
        assert!(cache.get("k").is_none());
        assert_eq!(cache.stats().entry_count, 0);
        assert_eq!(cache.stats().miss_count, 1);
    }

    #[test]
    fn test_rejected_entry_is_evicted() {
        let cache = ResultCache::new(Duration::from_secs(60));
        cache.put("k".to_string(), validated(), ResultSet::new(Vec::new(), Vec::new()));
        assert!(cache.get_if("k", |_| false).is_none());
        assert!(cache.get("k").is_none());
        assert_eq!(cache.stats().miss_count, 2);
    }

    #[test]
    fn test_purge_stale_keeps_current_fingerprint() {
        let cache = ResultCache::new(Duration::from_secs(60));
        let old = fingerprint("v1-aaa");
        let new = fingerprint("v2-bbb");
        cache.put(cache_key("q", None, &old), validated(), ResultSet::new(Vec::new(), Vec::new()));
        cache.put(cache_key("q", None, &new), validated(), ResultSet::new(Vec::new(), Vec::new()));
        assert_eq!(cache.purge_stale(&new), 1);
        assert!(cache.get(&cache_key("q", None, &new)).is_some());
    }
}
