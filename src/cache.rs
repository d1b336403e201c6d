//! Expiring maps used by the protocol engine.
//!
//! - [`TtlCache`]: bounded map whose entries expire after a fixed window.
//!   Expiry is swept lazily on access, at most once per refresh interval,
//!   instead of scheduling a timer per entry.
//! - [`DedupCache`]: envelope ids already processed by this node.
//! - [`CallbackRegistry`]: one pending-reply slot per outstanding request token.
//!
//! None of these types are internally synchronized; the engine wraps each in
//! a mutex and keeps critical sections free of await points.

use std::hash::Hash;
use std::num::NonZeroUsize;

use lru::LruCache;
use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;
use tokio::time::{Duration, Instant};
use tracing::trace;

use crate::config::duration_secs;
use crate::messages::{Envelope, Message};

/// Default minimum gap between two sweeps.
pub const DEFAULT_REFRESH_INTERVAL: Duration = Duration::from_secs(5);

/// Default entry lifetime for dedup and callback caches.
pub const DEFAULT_EXPIRY: Duration = Duration::from_secs(60);

/// Default entry lifetime for tunnel entries.
pub const DEFAULT_TUNNEL_EXPIRY: Duration = Duration::from_secs(6000);

/// Default hard cap on live entries per cache.
pub const DEFAULT_CAPACITY: usize = 100_000;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TtlConfig {
    /// Sweeps run at most once per this interval.
    #[serde(rename = "refresh_interval_secs", with = "duration_secs")]
    pub refresh_interval: Duration,
    /// Entries older than this are removed by the next sweep.
    #[serde(rename = "expiry_secs", with = "duration_secs")]
    pub expiry: Duration,
    /// Least-recently-used entries are evicted beyond this count.
    pub capacity: usize,
}

impl TtlConfig {
    pub fn with_expiry(expiry: Duration) -> Self {
        Self {
            expiry,
            ..Self::default()
        }
    }

    pub fn tunnels() -> Self {
        Self::with_expiry(DEFAULT_TUNNEL_EXPIRY)
    }
}

impl Default for TtlConfig {
    fn default() -> Self {
        Self {
            refresh_interval: DEFAULT_REFRESH_INTERVAL,
            expiry: DEFAULT_EXPIRY,
            capacity: DEFAULT_CAPACITY,
        }
    }
}

struct TimedEntry<V> {
    inserted_at: Instant,
    value: V,
}

type Factory<V> = Box<dyn Fn() -> V + Send + Sync>;

pub struct TtlCache<K: Hash + Eq, V> {
    entries: LruCache<K, TimedEntry<V>>,
    config: TtlConfig,
    last_sweep: Instant,
    factory: Option<Factory<V>>,
}

impl<K: Hash + Eq + Clone, V> TtlCache<K, V> {
    pub fn new(config: TtlConfig) -> Self {
        let capacity = NonZeroUsize::new(config.capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            entries: LruCache::new(capacity),
            config,
            last_sweep: Instant::now(),
            factory: None,
        }
    }

    /// A cache whose `get` materializes and stores a default for absent keys.
    pub fn with_factory(config: TtlConfig, factory: impl Fn() -> V + Send + Sync + 'static) -> Self {
        let mut cache = Self::new(config);
        cache.factory = Some(Box::new(factory));
        cache
    }

    pub fn config(&self) -> &TtlConfig {
        &self.config
    }

    pub fn get(&mut self, key: &K) -> Option<&V> {
        self.maybe_sweep();
        if !self.entries.contains(key) {
            let value = self.factory.as_ref().map(|factory| factory())?;
            self.put(key.clone(), value);
        }
        self.entries.get(key).map(|entry| &entry.value)
    }

    pub fn set(&mut self, key: K, value: V) {
        self.maybe_sweep();
        self.put(key, value);
    }

    /// Store `value` only when `key` is absent. Returns `true` if stored.
    pub fn insert_if_absent(&mut self, key: K, value: V) -> bool {
        self.maybe_sweep();
        if self.entries.contains(&key) {
            return false;
        }
        self.put(key, value);
        true
    }

    pub fn contains(&mut self, key: &K) -> bool {
        self.maybe_sweep();
        self.entries.contains(key)
    }

    pub fn remove(&mut self, key: &K) -> Option<V> {
        self.maybe_sweep();
        self.entries.pop(key).map(|entry| entry.value)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    /// Remove every entry older than the configured expiry, regardless of
    /// when the last sweep ran. Returns the number of entries removed.
    pub fn sweep(&mut self) -> usize {
        let now = Instant::now();
        self.last_sweep = now;

        let expired: Vec<K> = self
            .entries
            .iter()
            .filter(|(_, entry)| now.duration_since(entry.inserted_at) >= self.config.expiry)
            .map(|(key, _)| key.clone())
            .collect();

        for key in &expired {
            self.entries.pop(key);
        }

        if !expired.is_empty() {
            trace!(
                evicted = expired.len(),
                remaining = self.entries.len(),
                "swept expired cache entries"
            );
        }
        expired.len()
    }

    fn maybe_sweep(&mut self) {
        if self.last_sweep.elapsed() >= self.config.refresh_interval {
            self.sweep();
        }
    }

    fn put(&mut self, key: K, value: V) {
        self.entries.put(
            key,
            TimedEntry {
                inserted_at: Instant::now(),
                value,
            },
        );
    }
}

/// Envelope ids this node has already flooded and processed.
pub struct DedupCache {
    seen: TtlCache<String, Envelope>,
}

impl DedupCache {
    pub fn new(config: TtlConfig) -> Self {
        Self {
            seen: TtlCache::new(config),
        }
    }

    /// Record the envelope's id. Returns `false` if it was already present.
    pub fn record(&mut self, envelope: &Envelope) -> bool {
        self.seen.insert_if_absent(envelope.id().to_string(), envelope.clone())
    }

    pub fn contains(&mut self, id: &str) -> bool {
        self.seen.contains(&id.to_string())
    }

    pub fn len(&self) -> usize {
        self.seen.len()
    }

    pub fn is_empty(&self) -> bool {
        self.seen.is_empty()
    }

    pub fn clear(&mut self) {
        self.seen.clear();
    }
}

/// Single-fulfillment reply slot returned by every outbound send.
///
/// Waiting is bounded by the callback expiry: an unanswered request resolves
/// to `None`, the same as a request whose slot was swept.
#[derive(Debug)]
pub struct PendingReply {
    token: String,
    rx: Option<oneshot::Receiver<Message>>,
    expiry: Duration,
}

impl PendingReply {
    /// A reply handle that never resolves to a message. Returned when the
    /// token already had a pending slot.
    pub fn detached(token: impl Into<String>) -> Self {
        Self {
            token: token.into(),
            rx: None,
            expiry: Duration::ZERO,
        }
    }

    pub fn token(&self) -> &str {
        &self.token
    }

    pub fn is_detached(&self) -> bool {
        self.rx.is_none()
    }

    pub async fn wait(self) -> Option<Message> {
        let rx = self.rx?;
        match tokio::time::timeout(self.expiry, rx).await {
            Ok(Ok(message)) => Some(message),
            Ok(Err(_)) => None,
            Err(_) => {
                trace!(token = %self.token, "pending reply expired");
                None
            }
        }
    }
}

/// Correlation token -> pending reply sender.
pub struct CallbackRegistry {
    pending: TtlCache<String, oneshot::Sender<Message>>,
}

impl CallbackRegistry {
    pub fn new(config: TtlConfig) -> Self {
        Self {
            pending: TtlCache::new(config),
        }
    }

    /// Open a slot for `token`. First registration wins; later ones get a
    /// detached handle.
    pub fn register(&mut self, token: &str) -> PendingReply {
        let (tx, rx) = oneshot::channel();
        if !self.pending.insert_if_absent(token.to_string(), tx) {
            return PendingReply::detached(token);
        }
        PendingReply {
            token: token.to_string(),
            rx: Some(rx),
            expiry: self.pending.config().expiry,
        }
    }

    /// Fulfill the slot for the message's callback token. Returns `true`
    /// if a slot existed; the slot is consumed either way.
    pub fn fulfill(&mut self, message: Message) -> bool {
        let Some(tx) = self.pending.remove(&message.callback) else {
            return false;
        };
        if tx.send(message).is_err() {
            trace!("pending reply receiver dropped before fulfillment");
        }
        true
    }

    pub fn is_pending(&mut self, token: &str) -> bool {
        self.pending.contains(&token.to_string())
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    pub fn clear(&mut self) {
        self.pending.clear();
    }
}
