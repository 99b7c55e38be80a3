use crate::data_structures::{IssuerInfo, PerSeries, SharedCache};
use std::collections::HashMap;
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

/// Memoization key: (uppercased ticker, range code).
pub type CacheKey = (String, String);

// Backstop only: the in-flight marker is normally released by
// `InFlightGuard`, so this just has to sit above the fetch path's worst
// case (5 attempts x 30s timeout plus backoff and rate-limit waits, twice
// per request) to never take over a slow but live fetch.
const DEFAULT_STALE_AFTER: Duration = Duration::from_secs(15 * 60);

/// Everything worth remembering for one completed request.
#[derive(Debug, Clone, PartialEq)]
pub struct CachedPer {
    pub issuer: IssuerInfo,
    pub series: PerSeries,
}

/// Handed out by `lookup` on a miss; `complete` only stores a result whose
/// ticket is still the latest for its key, so a superseded fetch can never
/// overwrite a newer one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ticket {
    generation: u64,
}

#[derive(Debug)]
pub enum Lookup {
    /// A memoized series; serve it directly.
    Hit(CachedPer),
    /// Nothing cached and nothing in flight; the caller becomes the fetcher.
    Miss(Ticket),
    /// Another request is already fetching this key; poll again shortly.
    Pending,
}

#[derive(Debug, Default)]
struct Entry {
    generation: u64,
    value: Option<CachedPer>,
    in_flight_since: Option<Instant>,
}

/// In-memory request cache. Entries have no TTL; they are replaced when a
/// newer request for the same key completes and dropped on invalidation.
///
/// At most one fetch per key is in flight: concurrent requests see
/// `Pending` until the fetcher completes, fails, or its `InFlightGuard`
/// drops. The stale window exists only for the case where none of those
/// release paths ran (e.g. the release task was lost at shutdown).
#[derive(Debug)]
pub struct SeriesCache {
    entries: HashMap<CacheKey, Entry>,
    stale_after: Duration,
}

impl Default for SeriesCache {
    fn default() -> Self {
        Self::new()
    }
}

impl SeriesCache {
    pub fn new() -> Self {
        Self::with_stale_after(DEFAULT_STALE_AFTER)
    }

    pub fn with_stale_after(stale_after: Duration) -> Self {
        Self {
            entries: HashMap::new(),
            stale_after,
        }
    }

    pub fn lookup(&mut self, key: &CacheKey) -> Lookup {
        let entry = self.entries.entry(key.clone()).or_default();

        if let Some(value) = &entry.value {
            debug!(ticker = %key.0, code = %key.1, "Cache hit");
            return Lookup::Hit(value.clone());
        }

        if let Some(since) = entry.in_flight_since {
            if since.elapsed() < self.stale_after {
                debug!(ticker = %key.0, code = %key.1, "Fetch already in flight");
                return Lookup::Pending;
            }
            debug!(ticker = %key.0, code = %key.1, "Abandoned in-flight fetch, taking over");
        }

        entry.generation += 1;
        entry.in_flight_since = Some(Instant::now());
        debug!(ticker = %key.0, code = %key.1, generation = entry.generation, "Cache miss, issuing ticket");
        Lookup::Miss(Ticket {
            generation: entry.generation,
        })
    }

    /// Store a fetched result. Returns false when the ticket has been
    /// superseded or its key invalidated; the result is discarded then.
    pub fn complete(&mut self, key: &CacheKey, ticket: Ticket, value: CachedPer) -> bool {
        match self.entries.get_mut(key) {
            Some(entry) if entry.generation == ticket.generation => {
                entry.value = Some(value);
                entry.in_flight_since = None;
                debug!(ticker = %key.0, code = %key.1, generation = ticket.generation, "Stored series in cache");
                true
            }
            _ => {
                debug!(ticker = %key.0, code = %key.1, generation = ticket.generation, "Discarding superseded result");
                false
            }
        }
    }

    /// Release the in-flight marker after a failed fetch so the next
    /// request retries instead of waiting out the stale window.
    pub fn fail(&mut self, key: &CacheKey, ticket: Ticket) {
        if let Some(entry) = self.entries.get_mut(key) {
            if entry.generation == ticket.generation {
                entry.in_flight_since = None;
            }
        }
    }

    /// Read-only peek; never issues a ticket or touches in-flight state.
    pub fn get(&self, key: &CacheKey) -> Option<CachedPer> {
        self.entries.get(key).and_then(|e| e.value.clone())
    }

    pub fn invalidate(&mut self, key: &CacheKey) {
        if self.entries.remove(key).is_some() {
            debug!(ticker = %key.0, code = %key.1, "Invalidated cache entry");
        }
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.values().filter(|e| e.value.is_some()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Owns one in-flight fetch. Every exit releases the key: `complete`
/// stores the result, `fail` clears the marker after an error, and Drop
/// clears it when the fetching task is cancelled mid-request (e.g. the
/// client disconnected), so waiting requests never sit out the stale
/// window.
#[derive(Debug)]
pub struct InFlightGuard {
    cache: SharedCache,
    key: CacheKey,
    ticket: Ticket,
    armed: bool,
}

impl InFlightGuard {
    pub fn new(cache: SharedCache, key: CacheKey, ticket: Ticket) -> Self {
        Self {
            cache,
            key,
            ticket,
            armed: true,
        }
    }

    pub async fn complete(mut self, value: CachedPer) -> bool {
        self.armed = false;
        self.cache.lock().await.complete(&self.key, self.ticket, value)
    }

    pub async fn fail(mut self) {
        self.armed = false;
        self.cache.lock().await.fail(&self.key, self.ticket);
    }
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        debug!(ticker = %self.key.0, code = %self.key.1, "Fetch abandoned, releasing in-flight marker");
        let cache = self.cache.clone();
        let key = self.key.clone();
        let ticket = self.ticket;
        tokio::spawn(async move {
            cache.lock().await.fail(&key, ticket);
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data_structures::Quote;
    use crate::series;
    use chrono::NaiveDate;
    use std::sync::Arc;
    use tokio::sync::Mutex;

    fn key() -> CacheKey {
        ("AAPL".to_string(), "1y".to_string())
    }

    fn sample(per_base: f64) -> CachedPer {
        let quotes: Vec<Quote> = (1..=3)
            .map(|day| Quote {
                date: NaiveDate::from_ymd_opt(2024, 1, day).unwrap(),
                close: per_base * day as f64,
            })
            .collect();
        let info = IssuerInfo {
            symbol: "AAPL".to_string(),
            trailing_eps: Some(1.0),
            ..Default::default()
        };
        CachedPer {
            series: series::build(&quotes, &info, 2).unwrap(),
            issuer: info,
        }
    }

    fn expect_ticket(cache: &mut SeriesCache, key: &CacheKey) -> Ticket {
        match cache.lookup(key) {
            Lookup::Miss(ticket) => ticket,
            other => panic!("expected a miss, got {other:?}"),
        }
    }

    #[test]
    fn test_miss_then_hit() {
        let mut cache = SeriesCache::new();
        let ticket = expect_ticket(&mut cache, &key());
        assert!(cache.complete(&key(), ticket, sample(10.0)));

        match cache.lookup(&key()) {
            Lookup::Hit(value) => assert_eq!(value, sample(10.0)),
            other => panic!("expected a hit, got {other:?}"),
        }
        assert_eq!(cache.get(&key()), Some(sample(10.0)));
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_second_lookup_waits_while_in_flight() {
        let mut cache = SeriesCache::new();
        let _ticket = expect_ticket(&mut cache, &key());
        assert!(matches!(cache.lookup(&key()), Lookup::Pending));
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_live_fetch_is_not_taken_over() {
        // A fetch can legitimately run for many minutes (retries, backoff,
        // upstream rate limiting). Concurrent lookups must keep waiting
        // for it instead of starting a second fetch for the same key.
        let mut cache = SeriesCache::new();
        let _ticket = expect_ticket(&mut cache, &key());

        tokio::time::advance(Duration::from_secs(5 * 60)).await;
        assert!(matches!(cache.lookup(&key()), Lookup::Pending));

        tokio::time::advance(Duration::from_secs(9 * 60)).await;
        assert!(matches!(cache.lookup(&key()), Lookup::Pending));

        // Only far beyond any plausible fetch duration does the backstop
        // let the next request take over.
        tokio::time::advance(Duration::from_secs(60 * 60)).await;
        let _takeover = expect_ticket(&mut cache, &key());
    }

    #[test]
    fn test_superseded_result_is_discarded() {
        let mut cache = SeriesCache::with_stale_after(Duration::ZERO);
        // Zero stale window: the second lookup takes over immediately,
        // superseding the first ticket.
        let old_ticket = expect_ticket(&mut cache, &key());
        let new_ticket = expect_ticket(&mut cache, &key());

        assert!(!cache.complete(&key(), old_ticket, sample(10.0)));
        assert!(cache.complete(&key(), new_ticket, sample(20.0)));

        match cache.lookup(&key()) {
            Lookup::Hit(value) => assert_eq!(value, sample(20.0)),
            other => panic!("expected the newer result, got {other:?}"),
        }
    }

    #[test]
    fn test_fail_releases_in_flight_marker() {
        let mut cache = SeriesCache::new();
        let ticket = expect_ticket(&mut cache, &key());
        cache.fail(&key(), ticket);
        // Next lookup fetches again instead of waiting.
        let _retry = expect_ticket(&mut cache, &key());
    }

    #[tokio::test]
    async fn test_dropped_guard_releases_in_flight_marker() {
        let cache: SharedCache = Arc::new(Mutex::new(SeriesCache::new()));

        let ticket = expect_ticket(&mut *cache.lock().await, &key());
        let guard = InFlightGuard::new(cache.clone(), key(), ticket);
        assert!(matches!(cache.lock().await.lookup(&key()), Lookup::Pending));

        // Simulates the fetching task being cancelled mid-request.
        drop(guard);
        tokio::time::sleep(Duration::from_millis(10)).await;

        let _retry = expect_ticket(&mut *cache.lock().await, &key());
    }

    #[tokio::test]
    async fn test_guard_complete_stores_and_disarms() {
        let cache: SharedCache = Arc::new(Mutex::new(SeriesCache::new()));

        let ticket = expect_ticket(&mut *cache.lock().await, &key());
        let guard = InFlightGuard::new(cache.clone(), key(), ticket);
        assert!(guard.complete(sample(10.0)).await);

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(cache.lock().await.get(&key()), Some(sample(10.0)));
    }

    #[test]
    fn test_invalidate_drops_entry_and_in_flight_result() {
        let mut cache = SeriesCache::new();
        let ticket = expect_ticket(&mut cache, &key());
        assert!(cache.complete(&key(), ticket, sample(10.0)));

        cache.invalidate(&key());
        assert!(cache.is_empty());

        // A result completing after invalidation is discarded.
        let stale = Ticket { generation: 1 };
        assert!(!cache.complete(&key(), stale, sample(10.0)));
    }

    #[test]
    fn test_keys_are_independent() {
        let mut cache = SeriesCache::new();
        let yearly = ("AAPL".to_string(), "1y".to_string());
        let monthly = ("AAPL".to_string(), "3mo".to_string());

        let ticket = expect_ticket(&mut cache, &yearly);
        assert!(cache.complete(&yearly, ticket, sample(10.0)));

        // Changing the period component is a different key entirely.
        let _other = expect_ticket(&mut cache, &monthly);
        assert!(matches!(cache.lookup(&yearly), Lookup::Hit(_)));
    }
}
