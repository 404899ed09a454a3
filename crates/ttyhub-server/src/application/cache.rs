//! A concurrent key/value cache whose entries expire.
//!
//! Every entry carries its own TTL (or the cache default).  Expired entries
//! are invisible to readers immediately and are physically removed either
//! lazily on access or by the periodic sweep started with
//! [`ExpiringCache::spawn_sweeper`].
//!
//! Reads come in two flavours:
//!
//! - [`ExpiringCache::get`] leaves the deadline alone.
//! - [`ExpiringCache::get_touch`] / [`ExpiringCache::active`] push the
//!   deadline out by the entry's TTL again (sliding expiration), which keeps
//!   busy proxy sessions alive while idle ones age out.
//!
//! The cache is internally synchronised (sharded `DashMap`) and is meant to
//! be shared behind an `Arc` by any number of tasks.
//!
//! A cache built with [`ExpiringCache::with_expiry_hook`] calls the hook once
//! for every entry that is dropped because its TTL ran out, whichever path
//! noticed it.  Explicit deletes and replacements do not fire it.

use std::borrow::Borrow;
use std::fmt;
use std::hash::Hash;
use std::sync::{Arc, Weak};
use std::time::Duration;

use dashmap::DashMap;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::debug;

#[derive(Debug)]
struct Entry<V> {
    value: V,
    ttl: Duration,
    expires_at: Instant,
}

impl<V> Entry<V> {
    fn is_live(&self, now: Instant) -> bool {
        self.expires_at > now
    }
}

type ExpiryHook<V> = Box<dyn Fn(&V) + Send + Sync>;

pub struct ExpiringCache<K, V>
where
    K: Eq + Hash,
{
    entries: DashMap<K, Entry<V>>,
    default_ttl: Duration,
    on_expire: Option<ExpiryHook<V>>,
}

impl<K, V> fmt::Debug for ExpiringCache<K, V>
where
    K: Eq + Hash,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExpiringCache")
            .field("len", &self.entries.len())
            .field("default_ttl", &self.default_ttl)
            .field("has_expiry_hook", &self.on_expire.is_some())
            .finish()
    }
}

impl<K, V> ExpiringCache<K, V>
where
    K: Eq + Hash + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    pub fn new(default_ttl: Duration) -> Self {
        Self {
            entries: DashMap::new(),
            default_ttl,
            on_expire: None,
        }
    }

    /// A cache that hands every expired value to `hook` as it is dropped.
    ///
    /// The hook may run inside the sweep while a shard is locked, so it must
    /// not call back into the cache.
    pub fn with_expiry_hook<F>(default_ttl: Duration, hook: F) -> Self
    where
        F: Fn(&V) + Send + Sync + 'static,
    {
        Self {
            entries: DashMap::new(),
            default_ttl,
            on_expire: Some(Box::new(hook)),
        }
    }

    fn expired(&self, value: &V) {
        if let Some(hook) = &self.on_expire {
            hook(value);
        }
    }

    fn remove_expired<Q>(&self, key: &Q, now: Instant)
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        if let Some((_, entry)) = self.entries.remove_if(key, |_, entry| !entry.is_live(now)) {
            self.expired(&entry.value);
        }
    }

    /// Stores `value`, replacing any previous entry for `key`.
    pub fn set(&self, key: K, value: V, ttl: Option<Duration>) {
        let ttl = ttl.unwrap_or(self.default_ttl);
        self.entries.insert(
            key,
            Entry {
                value,
                ttl,
                expires_at: Instant::now() + ttl,
            },
        );
    }

    /// Like [`ExpiringCache::set`], but hands back whatever was stored under
    /// `key` before, expired or not.
    pub fn replace(&self, key: K, value: V, ttl: Option<Duration>) -> Option<V> {
        let ttl = ttl.unwrap_or(self.default_ttl);
        self.entries
            .insert(
                key,
                Entry {
                    value,
                    ttl,
                    expires_at: Instant::now() + ttl,
                },
            )
            .map(|previous| previous.value)
    }

    /// Returns the value if it has not expired, without extending it.
    pub fn get<Q>(&self, key: &Q) -> Option<V>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        let now = Instant::now();
        match self.entries.get(key) {
            Some(entry) if entry.is_live(now) => return Some(entry.value.clone()),
            Some(_) => {}
            None => return None,
        }
        self.remove_expired(key, now);
        None
    }

    /// Returns the value and restarts its TTL.
    pub fn get_touch<Q>(&self, key: &Q) -> Option<V>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        let now = Instant::now();
        if let Some(mut entry) = self.entries.get_mut(key) {
            if entry.is_live(now) {
                entry.expires_at = now + entry.ttl;
                return Some(entry.value.clone());
            }
        } else {
            return None;
        }
        self.remove_expired(key, now);
        None
    }

    /// Whether `key` is live; refreshes its TTL if so.
    pub fn active<Q>(&self, key: &Q) -> bool
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        self.get_touch(key).is_some()
    }

    /// Removes `key`.  Deleting a missing key is not an error.
    pub fn del<Q>(&self, key: &Q) -> Option<V>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        let now = Instant::now();
        let (_, entry) = self.entries.remove(key)?;
        if entry.is_live(now) {
            Some(entry.value)
        } else {
            self.expired(&entry.value);
            None
        }
    }

    /// Drops every expired entry and reports how many went.
    pub fn sweep(&self) -> usize {
        let now = Instant::now();
        let before = self.entries.len();
        self.entries.retain(|_, entry| {
            let live = entry.is_live(now);
            if !live {
                self.expired(&entry.value);
            }
            live
        });
        before.saturating_sub(self.entries.len())
    }

    /// Number of stored entries, including expired ones not yet swept.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Starts the background sweep.
    ///
    /// The task holds only a weak reference, so it also ends on its own once
    /// the last `Arc` to the cache is dropped.  Owners should still call
    /// [`SweeperHandle::stop`] during shutdown.
    pub fn spawn_sweeper(self: &Arc<Self>, every: Duration) -> SweeperHandle {
        let cache: Weak<Self> = Arc::downgrade(self);
        let cancel = CancellationToken::new();
        let stop = cancel.clone();

        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // The first tick completes immediately; nothing can be stale yet.
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = stop.cancelled() => break,
                    _ = ticker.tick() => {
                        let Some(cache) = cache.upgrade() else { break };
                        let removed = cache.sweep();
                        if removed > 0 {
                            debug!(removed, remaining = cache.len(), "swept expired cache entries");
                        }
                    }
                }
            }
        });

        SweeperHandle { cancel, task }
    }
}

/// Owner's handle on a running sweep task.
#[derive(Debug)]
pub struct SweeperHandle {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl SweeperHandle {
    pub fn stop(&self) {
        self.cancel.cancel();
    }

    /// Stops the sweep and waits for the task to finish.
    pub async fn shutdown(mut self) {
        self.cancel.cancel();
        let _ = (&mut self.task).await;
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}

impl Drop for SweeperHandle {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
