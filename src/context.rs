//! Published-message context and the LRU-with-age context cache.

use std::collections::HashMap;
use std::collections::VecDeque;
use std::time::{Duration, Instant};

/// Maximum age a cached context may reach before it is evicted on the next
/// `store` call.
pub const MAX_AGE: Duration = Duration::from_secs(60);

/// Publish metadata captured only when a publish opts into `mandatory`
/// routing. Mutated only by [`Context::record_failure`].
#[derive(Debug, Clone)]
pub struct Context {
    pub name: Option<String>,
    pub kind: Option<String>,
    pub from: Option<String>,
    pub token: Option<String>,
    pub one_way: bool,
    pub persistent: bool,
    pub brokers: Vec<String>,
    pub failed: Vec<String>,
}

impl Context {
    pub fn new(brokers: Vec<String>, persistent: bool, one_way: bool) -> Self {
        Self {
            name: None,
            kind: None,
            from: None,
            token: None,
            one_way,
            persistent,
            brokers,
            failed: Vec::new(),
        }
    }

    /// Record that `identity` failed to accept/route the message.
    pub fn record_failure(&mut self, identity: &str) {
        if !self.failed.iter().any(|f| f == identity) {
            self.failed.push(identity.to_string());
        }
    }

    /// Brokers this context still considers eligible, i.e. configured minus
    /// those already recorded as failed.
    pub fn unfailed_brokers(&self) -> Vec<String> {
        self.brokers
            .iter()
            .filter(|b| !self.failed.iter().any(|f| f == *b))
            .cloned()
            .collect()
    }
}

struct Entry {
    fingerprint: [u8; 16],
    last_used: Instant,
    context: Context,
}

/// Bounded cache keyed by the 128-bit MD5 fingerprint of the serialized
/// message, with a recency list for LRU-with-age eviction.
///
/// Invariant: every key in `index` appears exactly once in `order`.
pub struct PublishedCache {
    index: HashMap<[u8; 16], usize>,
    order: VecDeque<Entry>,
    max_age: Duration,
}

fn fingerprint(message: &[u8]) -> [u8; 16] {
    md5::compute(message).0
}

impl Default for PublishedCache {
    fn default() -> Self {
        Self::new(MAX_AGE)
    }
}

impl PublishedCache {
    pub fn new(max_age: Duration) -> Self {
        Self {
            index: HashMap::new(),
            order: VecDeque::new(),
            max_age,
        }
    }

    /// Number of live entries.
    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    /// Store `context` for `message`, touching it if already present, then
    /// evict aged-out entries from the head.
    pub fn store(&mut self, message: &[u8], context: Context) {
        let fp = fingerprint(message);
        self.touch_or_insert(fp, context);
        self.evict_aged(Instant::now());
    }

    /// Look up the context for `message`, touching the entry on hit.
    pub fn fetch(&mut self, message: &[u8]) -> Option<Context> {
        let fp = fingerprint(message);
        let pos = *self.index.get(&fp)?;
        let entry = self.order.remove(pos)?;
        self.reindex_from(pos);
        let context = entry.context.clone();
        self.push_tail(Entry {
            fingerprint: fp,
            last_used: Instant::now(),
            context: entry.context,
        });
        Some(context)
    }

    fn touch_or_insert(&mut self, fp: [u8; 16], context: Context) {
        if let Some(&pos) = self.index.get(&fp) {
            self.order.remove(pos);
            self.reindex_from(pos);
        }
        self.push_tail(Entry {
            fingerprint: fp,
            last_used: Instant::now(),
            context,
        });
    }

    fn push_tail(&mut self, entry: Entry) {
        self.index.insert(entry.fingerprint, self.order.len());
        self.order.push_back(entry);
    }

    /// After removing the element at `removed_pos`, every later element's
    /// index shifted down by one; fix up `index` to match.
    fn reindex_from(&mut self, removed_pos: usize) {
        for (i, entry) in self.order.iter().enumerate().skip(removed_pos) {
            self.index.insert(entry.fingerprint, i);
        }
    }

    fn evict_aged(&mut self, now: Instant) {
        while let Some(front) = self.order.front() {
            if now.duration_since(front.last_used) > self.max_age {
                let evicted = self.order.pop_front().unwrap();
                self.index.remove(&evicted.fingerprint);
                for (i, entry) in self.order.iter().enumerate() {
                    self.index.insert(entry.fingerprint, i);
                }
            } else {
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx() -> Context {
        Context::new(vec!["b0".into()], false, false)
    }

    #[test]
    fn store_then_fetch_hits() {
        let mut cache = PublishedCache::default();
        cache.store(b"m1", ctx());
        let got = cache.fetch(b"m1");
        assert!(got.is_some());
    }

    #[test]
    fn fetch_miss_returns_none() {
        let mut cache = PublishedCache::default();
        assert!(cache.fetch(b"missing").is_none());
    }

    #[test]
    fn aged_entries_are_evicted_on_store() {
        let mut cache = PublishedCache::new(Duration::from_millis(0));
        cache.store(b"m1", ctx());
        // max_age is 0, so the very next store evicts anything already there.
        cache.store(b"m2", ctx());
        assert!(cache.fetch(b"m1").is_none());
        assert!(cache.fetch(b"m2").is_some());
    }

    #[test]
    fn dedupe_by_content_refreshes_recency() {
        let mut cache = PublishedCache::default();
        cache.store(b"same", ctx());
        cache.store(b"same", ctx());
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn record_failure_is_idempotent() {
        let mut c = ctx();
        c.record_failure("b0");
        c.record_failure("b0");
        assert_eq!(c.failed.len(), 1);
    }

    #[test]
    fn unfailed_brokers_excludes_failed() {
        let mut c = Context::new(vec!["b0".into(), "b1".into()], false, false);
        c.record_failure("b0");
        assert_eq!(c.unfailed_brokers(), vec!["b1".to_string()]);
    }
}
