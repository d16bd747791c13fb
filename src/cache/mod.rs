//! Content-addressed artifact cache with single-flight semantics.
//!
//! For any fingerprint, at most one concurrent execution produces the
//! cache entry: the first requester becomes the *leader* and receives a
//! [`LeaderToken`]; concurrent requesters become *followers* that await
//! the leader's result. Failures are never cached; a failed or aborted
//! leader clears the slot and the next requester leads again.

mod fingerprint;

pub use fingerprint::{canonical_json, resolve_key_template, step_fingerprint};

use crate::core::OutputMap;
use crate::utils::Timestamp;
use chrono::Utc;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::debug;

type FlightResult = Option<Result<OutputMap, String>>;

/// A completed cache entry.
#[derive(Debug, Clone)]
pub struct ReadyEntry {
    /// The memoized step outputs.
    pub outputs: OutputMap,
    /// When the entry was published.
    pub completed_at: Timestamp,
}

/// The outcome of a cache lookup.
pub enum CacheDecision {
    /// The fingerprint is cached; use these outputs.
    Hit(OutputMap),
    /// The caller leads: execute, then publish or fail the token.
    Leader(LeaderToken),
    /// Another caller leads; await its result.
    Follower(FollowerHandle),
}

struct CacheInner {
    ready: HashMap<String, ReadyEntry>,
    /// LRU order over `ready`; front is the eviction candidate.
    order: VecDeque<String>,
    in_flight: HashMap<String, watch::Sender<FlightResult>>,
}

/// Process-local memo of step outputs keyed by fingerprint.
pub struct ArtifactCache {
    inner: Mutex<CacheInner>,
    capacity: Option<usize>,
}

impl ArtifactCache {
    /// Creates a cache; `capacity` bounds the number of completed
    /// entries (`None` = unbounded).
    #[must_use]
    pub fn new(capacity: Option<usize>) -> Arc<Self> {
        Arc::new(Self {
            inner: Mutex::new(CacheInner {
                ready: HashMap::new(),
                order: VecDeque::new(),
                in_flight: HashMap::new(),
            }),
            capacity,
        })
    }

    /// Looks up a fingerprint, electing a leader on miss.
    #[must_use]
    pub fn lookup_or_start(self: &Arc<Self>, fingerprint: &str) -> CacheDecision {
        let mut inner = self.inner.lock();

        if let Some(entry) = inner.ready.get(fingerprint) {
            let outputs = entry.outputs.clone();
            touch(&mut inner.order, fingerprint);
            return CacheDecision::Hit(outputs);
        }

        if let Some(tx) = inner.in_flight.get(fingerprint) {
            return CacheDecision::Follower(FollowerHandle {
                rx: tx.subscribe(),
            });
        }

        let (tx, _rx) = watch::channel(None);
        inner.in_flight.insert(fingerprint.to_string(), tx);
        CacheDecision::Leader(LeaderToken {
            cache: Arc::clone(self),
            fingerprint: fingerprint.to_string(),
            finished: false,
        })
    }

    /// Peeks at a completed entry without taking leadership.
    #[must_use]
    pub fn lookup(&self, fingerprint: &str) -> Option<OutputMap> {
        let mut inner = self.inner.lock();
        let outputs = inner.ready.get(fingerprint)?.outputs.clone();
        touch(&mut inner.order, fingerprint);
        Some(outputs)
    }

    /// Removes a completed entry.
    pub fn invalidate(&self, fingerprint: &str) {
        let mut inner = self.inner.lock();
        if inner.ready.remove(fingerprint).is_some() {
            inner.order.retain(|k| k != fingerprint);
        }
    }

    /// Removes all completed entries. In-flight executions are
    /// unaffected and publish normally.
    pub fn clear(&self) {
        let mut inner = self.inner.lock();
        inner.ready.clear();
        inner.order.clear();
    }

    /// Number of completed entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.lock().ready.len()
    }

    /// Whether the cache holds no completed entries.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.inner.lock().ready.is_empty()
    }

    /// Finalizes an in-flight fingerprint and wakes followers.
    fn complete(&self, fingerprint: &str, result: Result<OutputMap, String>) {
        let mut inner = self.inner.lock();
        let Some(tx) = inner.in_flight.remove(fingerprint) else {
            return;
        };

        if let Ok(outputs) = &result {
            inner.ready.insert(
                fingerprint.to_string(),
                ReadyEntry {
                    outputs: outputs.clone(),
                    completed_at: Utc::now(),
                },
            );
            inner.order.push_back(fingerprint.to_string());

            if let Some(capacity) = self.capacity {
                while inner.ready.len() > capacity {
                    if let Some(evicted) = inner.order.pop_front() {
                        inner.ready.remove(&evicted);
                        debug!(fingerprint = %evicted, "cache entry evicted");
                    } else {
                        break;
                    }
                }
            }
        }

        // Send after the map update so late subscribers cannot observe a
        // cleared slot before followers are woken. Failure is fine: it
        // means no follower is waiting.
        let _ = tx.send(Some(result));
    }
}

impl std::fmt::Debug for ArtifactCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("ArtifactCache")
            .field("ready", &inner.ready.len())
            .field("in_flight", &inner.in_flight.len())
            .field("capacity", &self.capacity)
            .finish()
    }
}

fn touch(order: &mut VecDeque<String>, fingerprint: &str) {
    if let Some(pos) = order.iter().position(|k| k == fingerprint) {
        if let Some(key) = order.remove(pos) {
            order.push_back(key);
        }
    }
}

/// Proof of leadership for one fingerprint.
///
/// The leader must call [`LeaderToken::publish`] or [`LeaderToken::fail`].
/// Dropping the token without either clears the slot as a failure so a
/// panicking executor cannot wedge the fingerprint.
pub struct LeaderToken {
    cache: Arc<ArtifactCache>,
    fingerprint: String,
    finished: bool,
}

impl LeaderToken {
    /// The fingerprint this token leads.
    #[must_use]
    pub fn fingerprint(&self) -> &str {
        &self.fingerprint
    }

    /// Publishes the outputs; followers receive them.
    pub fn publish(mut self, outputs: OutputMap) {
        self.finished = true;
        self.cache.complete(&self.fingerprint, Ok(outputs));
    }

    /// Clears the slot; followers observe the error and the next caller
    /// re-enters as leader. Failures are never cached.
    pub fn fail(mut self, error: impl Into<String>) {
        self.finished = true;
        self.cache.complete(&self.fingerprint, Err(error.into()));
    }
}

impl Drop for LeaderToken {
    fn drop(&mut self) {
        if !self.finished {
            self.cache
                .complete(&self.fingerprint, Err("leader aborted".to_string()));
        }
    }
}

impl std::fmt::Debug for LeaderToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LeaderToken")
            .field("fingerprint", &self.fingerprint)
            .finish()
    }
}

/// A follower's wait handle on the leader's result.
pub struct FollowerHandle {
    rx: watch::Receiver<FlightResult>,
}

impl FollowerHandle {
    /// Awaits the leader's outcome.
    ///
    /// # Errors
    ///
    /// Returns the leader's error message when it failed or aborted.
    pub async fn wait(mut self) -> Result<OutputMap, String> {
        loop {
            {
                let current = self.rx.borrow();
                if let Some(result) = current.as_ref() {
                    return result.clone();
                }
            }
            if self.rx.changed().await.is_err() {
                return Err("cache leader disappeared".to_string());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn outputs(v: i64) -> OutputMap {
        let mut m = OutputMap::new();
        m.insert("value".to_string(), serde_json::json!(v));
        m
    }

    #[tokio::test]
    async fn test_miss_then_hit() {
        let cache = ArtifactCache::new(None);

        let CacheDecision::Leader(token) = cache.lookup_or_start("fp1") else {
            panic!("first caller should lead");
        };
        token.publish(outputs(1));

        match cache.lookup_or_start("fp1") {
            CacheDecision::Hit(o) => assert_eq!(o["value"], 1),
            _ => panic!("expected hit"),
        }
        assert_eq!(cache.len(), 1);
    }

    #[tokio::test]
    async fn test_follower_receives_leader_result() {
        let cache = ArtifactCache::new(None);

        let CacheDecision::Leader(token) = cache.lookup_or_start("fp1") else {
            panic!("expected leader");
        };
        let CacheDecision::Follower(handle) = cache.lookup_or_start("fp1") else {
            panic!("expected follower");
        };

        let waiter = tokio::spawn(handle.wait());
        token.publish(outputs(7));

        let result = waiter.await.unwrap().unwrap();
        assert_eq!(result["value"], 7);
    }

    #[tokio::test]
    async fn test_failure_clears_slot_for_next_leader() {
        let cache = ArtifactCache::new(None);

        let CacheDecision::Leader(token) = cache.lookup_or_start("fp1") else {
            panic!("expected leader");
        };
        let CacheDecision::Follower(handle) = cache.lookup_or_start("fp1") else {
            panic!("expected follower");
        };

        token.fail("boom");
        assert_eq!(handle.wait().await.unwrap_err(), "boom");

        // No negative caching: the next caller leads again.
        assert!(matches!(
            cache.lookup_or_start("fp1"),
            CacheDecision::Leader(_)
        ));
        assert!(cache.is_empty());
    }

    #[tokio::test]
    async fn test_dropped_leader_fails_followers() {
        let cache = ArtifactCache::new(None);

        let decision = cache.lookup_or_start("fp1");
        let CacheDecision::Follower(handle) = cache.lookup_or_start("fp1") else {
            panic!("expected follower");
        };

        drop(decision);
        assert!(handle.wait().await.is_err());
        assert!(matches!(
            cache.lookup_or_start("fp1"),
            CacheDecision::Leader(_)
        ));
    }

    #[tokio::test]
    async fn test_invalidate_and_clear() {
        let cache = ArtifactCache::new(None);

        for (fp, v) in [("a", 1), ("b", 2)] {
            let CacheDecision::Leader(token) = cache.lookup_or_start(fp) else {
                panic!("expected leader");
            };
            token.publish(outputs(v));
        }

        cache.invalidate("a");
        assert!(cache.lookup("a").is_none());
        assert!(cache.lookup("b").is_some());

        cache.clear();
        assert!(cache.is_empty());
    }

    #[tokio::test]
    async fn test_lru_eviction() {
        let cache = ArtifactCache::new(Some(2));

        for (fp, v) in [("a", 1), ("b", 2)] {
            let CacheDecision::Leader(token) = cache.lookup_or_start(fp) else {
                panic!("expected leader");
            };
            token.publish(outputs(v));
        }

        // Touch "a" so "b" becomes the eviction candidate.
        assert!(cache.lookup("a").is_some());

        let CacheDecision::Leader(token) = cache.lookup_or_start("c") else {
            panic!("expected leader");
        };
        token.publish(outputs(3));

        assert_eq!(cache.len(), 2);
        assert!(cache.lookup("a").is_some());
        assert!(cache.lookup("b").is_none());
        assert!(cache.lookup("c").is_some());
    }

    #[tokio::test]
    async fn test_follower_after_publish_sees_hit() {
        let cache = ArtifactCache::new(None);
        let CacheDecision::Leader(token) = cache.lookup_or_start("fp1") else {
            panic!("expected leader");
        };
        token.publish(outputs(9));

        // A caller arriving after publication gets a plain hit.
        assert!(matches!(cache.lookup_or_start("fp1"), CacheDecision::Hit(_)));
    }
}
