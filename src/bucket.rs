//! Session registry sharded into buckets.
//!
//! Maps session keys to the live connection's [`Channel`]. Each bucket is an
//! independently locked map so connections registering and leaving in
//! parallel rarely contend.

use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use tracing::{debug, warn};

use crate::channel::Channel;

/// Registry operations consumed by the connection core.
pub trait Registry: Send + Sync {
    /// Register `channel` under `key`, replacing any previous owner.
    fn put(&self, key: &str, channel: Arc<Channel>);

    /// Look up the live channel for `key`.
    fn get(&self, key: &str) -> Option<Arc<Channel>>;

    /// Remove `key` if it is still owned by `channel`.
    ///
    /// Returns whether an entry was removed.
    fn remove(&self, key: &str, channel: &Arc<Channel>) -> bool;

    /// Number of registered sessions.
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Snapshot of every live channel.
    fn channels(&self) -> Vec<Arc<Channel>>;
}

type Bucket = RwLock<HashMap<String, Arc<Channel>>>;

/// Sharded in-process registry.
pub struct Buckets {
    buckets: Box<[Bucket]>,
}

impl Buckets {
    /// Create a registry with `count` buckets (minimum 1).
    pub fn new(count: usize) -> Self {
        let buckets = (0..count.max(1))
            .map(|_| RwLock::new(HashMap::new()))
            .collect::<Vec<_>>()
            .into_boxed_slice();
        debug!(buckets = buckets.len(), "Initializing session registry");
        Self { buckets }
    }

    /// Number of buckets.
    pub fn bucket_count(&self) -> usize {
        self.buckets.len()
    }

    fn bucket(&self, key: &str) -> &Bucket {
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        let idx = (hasher.finish() % self.buckets.len() as u64) as usize;
        &self.buckets[idx]
    }

    fn read(bucket: &Bucket) -> RwLockReadGuard<'_, HashMap<String, Arc<Channel>>> {
        bucket.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(bucket: &Bucket) -> RwLockWriteGuard<'_, HashMap<String, Arc<Channel>>> {
        bucket.write().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Registry for Buckets {
    fn put(&self, key: &str, channel: Arc<Channel>) {
        let replaced = Self::write(self.bucket(key)).insert(key.to_string(), channel);
        if replaced.is_some() {
            warn!(key, "session key re-registered, previous connection replaced");
        }
    }

    fn get(&self, key: &str) -> Option<Arc<Channel>> {
        Self::read(self.bucket(key)).get(key).cloned()
    }

    fn remove(&self, key: &str, channel: &Arc<Channel>) -> bool {
        let mut bucket = Self::write(self.bucket(key));
        match bucket.get(key) {
            Some(current) if Arc::ptr_eq(current, channel) => {
                bucket.remove(key);
                true
            }
            _ => false,
        }
    }

    fn len(&self) -> usize {
        self.buckets.iter().map(|b| Self::read(b).len()).sum()
    }

    fn channels(&self) -> Vec<Arc<Channel>> {
        self.buckets
            .iter()
            .flat_map(|b| Self::read(b).values().cloned().collect::<Vec<_>>())
            .collect()
    }
}
