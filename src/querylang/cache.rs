//! Bounded, time-limited cache of parsed queries.

use super::ast::ParsedQuery;
use lru::LruCache;
use std::num::NonZeroUsize;
use std::sync::{Mutex, PoisonError};
use std::time::{Duration, Instant};

pub const DEFAULT_CACHE_CAPACITY: usize = 1000;
pub const DEFAULT_CACHE_TTL: Duration = Duration::from_secs(600);

pub struct QueryCache {
    entries: Mutex<LruCache<String, (Instant, ParsedQuery)>>,
    ttl: Duration,
}

impl QueryCache {
    pub fn new(capacity: usize, ttl: Duration) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self { entries: Mutex::new(LruCache::new(capacity)), ttl }
    }

    pub fn get(&self, input: &str) -> Option<ParsedQuery> {
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        match entries.get(input) {
            Some((inserted, query)) if inserted.elapsed() < self.ttl => return Some(query.clone()),
            Some(_) => {}
            None => return None,
        }
        entries.pop(input);
        None
    }

    pub fn put(&self, input: &str, query: ParsedQuery) {
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        entries.put(input.to_string(), (Instant::now(), query));
    }

    pub fn len(&self) -> usize {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for QueryCache {
    fn default() -> Self {
        Self::new(DEFAULT_CACHE_CAPACITY, DEFAULT_CACHE_TTL)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::querylang::parse_query;

    #[test]
    fn test_capacity_evicts_least_recent() {
        let cache = QueryCache::new(2, DEFAULT_CACHE_TTL);
        for q in ["select a", "select b", "select c"] {
            cache.put(q, parse_query(q).unwrap());
        }
        assert_eq!(cache.len(), 2);
        assert!(cache.get("select a").is_none());
        assert!(cache.get("select c").is_some());
    }

    #[test]
    fn test_expired_entries_are_dropped() {
        let cache = QueryCache::new(10, Duration::ZERO);
        cache.put("select a", parse_query("select a").unwrap());
        assert!(cache.get("select a").is_none());
        assert!(cache.is_empty());
    }
}
