//! Predictive prefetch cache
//!
//! Items wait in a priority queue (lower priority = sooner expected access,
//! ties in insertion order) and move into a byte-bounded cache when
//! processed. Eviction drops the earliest-cached entries first; hits do
//! not refresh an entry.

use crate::predictor::AccessPredictor;
use ahash::AHashSet;
use lru::LruCache;
use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::sync::Arc;
use tracing::debug;

pub const DEFAULT_PREFETCH_WINDOW: f64 = 60.0;
pub const DEFAULT_PREFETCH_CACHE_SIZE: usize = 64 * 1024 * 1024;

/// Source of upcoming-access forecasts
pub trait AccessForecaster {
    /// `(path, expected_time)` pairs within `threshold` seconds of `now`
    fn hot_files(&self, threshold: f64, now: f64) -> Vec<(String, f64)>;
}

impl AccessForecaster for AccessPredictor {
    fn hot_files(&self, threshold: f64, now: f64) -> Vec<(String, f64)> {
        self.get_hot_files(threshold, now)
    }
}

struct QueuedItem {
    priority: f64,
    seq: u64,
    path: String,
    data: Vec<u8>,
}

// BinaryHeap is a max-heap; invert so the smallest (priority, seq) pops first
impl Ord for QueuedItem {
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .priority
            .total_cmp(&self.priority)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

impl PartialOrd for QueuedItem {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for QueuedItem {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for QueuedItem {}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PrefetchStats {
    pub enqueued: u64,
    pub rejected: u64,
    pub processed: u64,
    pub evictions: u64,
    pub hits: u64,
    pub misses: u64,
    pub queued: usize,
    pub cached_entries: usize,
    pub cached_bytes: usize,
    pub capacity_bytes: usize,
}

pub struct Prefetcher {
    capacity: usize,
    window: f64,
    queue: BinaryHeap<QueuedItem>,
    queued: AHashSet<String>,
    cache: LruCache<String, Arc<[u8]>>,
    cached_bytes: usize,
    next_seq: u64,
    stats: PrefetchStats,
}

impl Prefetcher {
    pub fn new(capacity_bytes: usize, window_secs: f64) -> Self {
        Prefetcher {
            capacity: capacity_bytes,
            window: window_secs,
            queue: BinaryHeap::new(),
            queued: AHashSet::new(),
            cache: LruCache::unbounded(),
            cached_bytes: 0,
            next_seq: 0,
            stats: PrefetchStats::default(),
        }
    }

    pub fn window(&self) -> f64 {
        self.window
    }

    /// Queue `data` for `path`; false if already queued/cached or too large
    pub fn enqueue(&mut self, path: &str, data: Vec<u8>, priority: f64) -> bool {
        if self.queued.contains(path) || self.cache.contains(path) || data.len() > self.capacity
        {
            self.stats.rejected += 1;
            return false;
        }

        self.queued.insert(path.to_string());
        self.queue.push(QueuedItem {
            priority,
            seq: self.next_seq,
            path: path.to_string(),
            data,
        });
        self.next_seq += 1;
        self.stats.enqueued += 1;
        true
    }

    /// Move the most urgent queued item into the cache
    ///
    /// Returns the path that was cached.
    pub fn process_next(&mut self) -> Option<String> {
        let item = self.queue.pop()?;
        self.queued.remove(&item.path);

        while self.cached_bytes + item.data.len() > self.capacity {
            let Some((oldest, evicted)) = self.cache.pop_lru() else {
                break;
            };
            self.cached_bytes -= evicted.len();
            self.stats.evictions += 1;
            debug!("Prefetch cache evicted {}", oldest);
        }

        self.cached_bytes += item.data.len();
        if let Some((_, replaced)) = self.cache.push(item.path.clone(), item.data.into()) {
            self.cached_bytes -= replaced.len();
        }
        self.stats.processed += 1;
        Some(item.path)
    }

    /// Drain the queue; returns how many items were cached
    pub fn process_all(&mut self) -> usize {
        let mut count = 0;
        while self.process_next().is_some() {
            count += 1;
        }
        count
    }

    pub fn should_prefetch(&self, predicted_time: f64, now: f64) -> bool {
        predicted_time - now <= self.window
    }

    pub fn get(&mut self, path: &str) -> Option<Arc<[u8]>> {
        match self.cache.peek(path) {
            Some(data) => {
                self.stats.hits += 1;
                Some(Arc::clone(data))
            }
            None => {
                self.stats.misses += 1;
                None
            }
        }
    }

    pub fn contains(&self, path: &str) -> bool {
        self.cache.contains(path) || self.queued.contains(path)
    }

    /// Drop any cached or queued copy of `path`
    pub fn invalidate(&mut self, path: &str) -> bool {
        let mut removed = false;
        if let Some(data) = self.cache.pop(path) {
            self.cached_bytes -= data.len();
            removed = true;
        }
        if self.queued.remove(path) {
            self.queue.retain(|item| item.path != path);
            removed = true;
        }
        removed
    }

    pub fn clear(&mut self) {
        self.queue.clear();
        self.queued.clear();
        self.cache.clear();
        self.cached_bytes = 0;
    }

    /// Forecast candidates worth loading: `(path, priority)` with priority in
    /// seconds until the expected access
    pub fn candidates(&self, forecaster: &dyn AccessForecaster, now: f64) -> Vec<(String, f64)> {
        forecaster
            .hot_files(self.window, now)
            .into_iter()
            .filter(|(path, at)| self.should_prefetch(*at, now) && !self.contains(path))
            .map(|(path, at)| (path, (at - now).max(0.0)))
            .collect()
    }

    /// Enqueue every forecast candidate that `loader` can produce
    pub fn schedule<F>(&mut self, forecaster: &dyn AccessForecaster, now: f64, mut loader: F) -> usize
    where
        F: FnMut(&str) -> Option<Vec<u8>>,
    {
        let mut scheduled = 0;
        for (path, priority) in self.candidates(forecaster, now) {
            if let Some(data) = loader(&path) {
                if self.enqueue(&path, data, priority) {
                    scheduled += 1;
                }
            }
        }
        scheduled
    }

    pub fn stats(&self) -> PrefetchStats {
        PrefetchStats {
            queued: self.queue.len(),
            cached_entries: self.cache.len(),
            cached_bytes: self.cached_bytes,
            capacity_bytes: self.capacity,
            ..self.stats
        }
    }
}
