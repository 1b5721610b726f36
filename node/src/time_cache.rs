use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::Duration;
use tokio::time::Instant;

/// A set of strings where each entry lives for a fixed timespan after insertion.
///
/// Expiry is lazy: nothing runs per entry. Every `add` sweeps the oldest end of
/// the insertion queue and stops at the first entry that is still fresh.
pub struct TimeCache {
    timespan: Duration,
    inner: Mutex<TimeCacheInner>,
}

struct TimeCacheInner {
    /// Insertion time of every live entry.
    cache: HashMap<String, Instant>,
    /// Entries in insertion order, oldest at the front.
    indexer: VecDeque<String>,
}

impl TimeCache {
    pub fn new(timespan: Duration) -> Self {
        Self {
            timespan,
            inner: Mutex::new(TimeCacheInner {
                cache: HashMap::new(),
                indexer: VecDeque::new(),
            }),
        }
    }

    /// Adds the item; returns false if it is already present and not yet expired.
    pub fn add(&self, item: &str) -> bool {
        let mut inner = self.inner.lock().unwrap();
        let now = Instant::now();
        inner.sweep(now, self.timespan);
        if inner.cache.contains_key(item) {
            return false;
        }
        inner.cache.insert(item.to_string(), now);
        inner.indexer.push_back(item.to_string());
        true
    }

    pub fn has(&self, item: &str) -> bool {
        let inner = self.inner.lock().unwrap();
        match inner.cache.get(item) {
            Some(inserted) => inserted.elapsed() <= self.timespan,
            None => false,
        }
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().cache.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl TimeCacheInner {
    fn sweep(&mut self, now: Instant, timespan: Duration) {
        while let Some(oldest) = self.indexer.front() {
            let expired = match self.cache.get(oldest) {
                Some(inserted) => now.duration_since(*inserted) > timespan,
                None => true,
            };
            if !expired {
                break;
            }
            if let Some(oldest) = self.indexer.pop_front() {
                self.cache.remove(&oldest);
            }
        }
    }
}
