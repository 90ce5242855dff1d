/// Time-bounded memoization of upstream results.
///
/// Entries are keyed by a structured [`CacheKey`] (operation plus normalized
/// arguments) and are treated as absent once `now - inserted_at >= duration`.
/// The cache is an optimization only: a cold cache yields the same results as
/// a warm one. A capacity bound evicts the oldest insertion first.
use parking_lot::Mutex;
use std::collections::{BTreeSet, HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Default freshness window for cached upstream results.
pub const DEFAULT_CACHE_DURATION: Duration = Duration::from_secs(3600);

/// Default maximum number of live entries.
pub const DEFAULT_CACHE_CAPACITY: usize = 4096;

/// Operation tag plus normalized arguments.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum CacheKey {
    /// Details for an ordered batch of work item ids
    WorkItems(Vec<u32>),
    /// Update history of one work item
    Updates(u32),
    /// Reporting revisions for one project over one window slice
    Revisions {
        project: String,
        start: i64,
        end: i64,
        types: BTreeSet<String>,
    },
}

/// Source of "now" for expiry checks.
pub trait Clock: Send + Sync {
    fn now(&self) -> Instant;
}

/// Wall clock.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }
}

/// Manually advanced clock for tests.
#[derive(Debug, Clone)]
pub struct ManualClock {
    base: Instant,
    offset: Arc<Mutex<Duration>>,
}

impl ManualClock {
    pub fn new() -> Self {
        Self {
            base: Instant::now(),
            offset: Arc::new(Mutex::new(Duration::ZERO)),
        }
    }

    pub fn advance(&self, by: Duration) {
        *self.offset.lock() += by;
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Instant {
        self.base + *self.offset.lock()
    }
}

struct Entry<V> {
    value: V,
    inserted_at: Instant,
}

struct Inner<V> {
    entries: HashMap<CacheKey, Entry<V>>,
    /// Insertion order, oldest first. May hold keys that were since overwritten.
    order: VecDeque<(CacheKey, Instant)>,
}

/// Hit/miss counters, for logging.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub entries: usize,
}

/// Thread-safe, time-bounded result cache.
pub struct ResultCache<V> {
    inner: Mutex<Inner<V>>,
    duration: Duration,
    capacity: usize,
    clock: Arc<dyn Clock>,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl<V: Clone> ResultCache<V> {
    /// Cache with default duration and capacity on the wall clock.
    pub fn new() -> Self {
        Self::with_settings(
            DEFAULT_CACHE_DURATION,
            DEFAULT_CACHE_CAPACITY,
            Arc::new(SystemClock),
        )
    }

    pub fn with_settings(duration: Duration, capacity: usize, clock: Arc<dyn Clock>) -> Self {
        Self {
            inner: Mutex::new(Inner {
                entries: HashMap::new(),
                order: VecDeque::new(),
            }),
            duration,
            capacity: capacity.max(1),
            clock,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    /// Look up a fresh entry. Stale entries are dropped and reported absent.
    pub fn get(&self, key: &CacheKey) -> Option<V> {
        let now = self.clock.now();
        let mut inner = self.inner.lock();

        let is_fresh = inner
            .entries
            .get(key)
            .map(|entry| now.saturating_duration_since(entry.inserted_at) < self.duration);
        let fresh = match is_fresh {
            Some(true) => inner.entries.get(key).map(|entry| entry.value.clone()),
            Some(false) => {
                inner.entries.remove(key);
                None
            }
            None => None,
        };

        if fresh.is_some() {
            self.hits.fetch_add(1, Ordering::Relaxed);
        } else {
            self.misses.fetch_add(1, Ordering::Relaxed);
        }
        fresh
    }

    /// Insert or replace an entry, evicting the oldest insertions over capacity.
    pub fn put(&self, key: CacheKey, value: V) {
        let now = self.clock.now();
        let mut inner = self.inner.lock();

        inner.order.push_back((key.clone(), now));
        inner.entries.insert(
            key,
            Entry {
                value,
                inserted_at: now,
            },
        );

        while inner.entries.len() > self.capacity {
            let Some((old_key, old_ts)) = inner.order.pop_front() else {
                break;
            };
            // Skip order records superseded by a later put of the same key.
            let current = inner.entries.get(&old_key).map(|e| e.inserted_at);
            if current == Some(old_ts) {
                inner.entries.remove(&old_key);
            }
        }

        // Keep the order queue from growing without bound under repeated puts.
        if inner.order.len() > self.capacity.saturating_mul(2) {
            let Inner { entries, order } = &mut *inner;
            order.retain(|(k, ts)| entries.get(k).map(|e| e.inserted_at) == Some(*ts));
        }
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            entries: self.inner.lock().entries.len(),
        }
    }

    pub fn duration(&self) -> Duration {
        self.duration
    }
}

impl<V: Clone> Default for ResultCache<V> {
    fn default() -> Self {
        Self::new()
    }
}
