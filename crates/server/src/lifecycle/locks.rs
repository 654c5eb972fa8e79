//! Per-entity mutual exclusion.
//!
//! Locks are created on first use and forgotten once nobody holds them, so
//! the table stays proportional to in-flight operations rather than to the
//! number of entities ever seen.

use clonedb_core::{ImageId, InstanceId};
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use std::hash::Hash;
use std::sync::{Arc, Weak};
use tokio::sync::{OwnedRwLockReadGuard, OwnedRwLockWriteGuard, RwLock};

/// Held shared access to one entity.
pub type ReadGuard = OwnedRwLockReadGuard<()>;

/// Held exclusive access to one entity.
pub type WriteGuard = OwnedRwLockWriteGuard<()>;

/// Dead entries are swept once the table grows past this size.
const PRUNE_THRESHOLD: usize = 256;

struct KeyedLocks<K> {
    table: DashMap<K, Weak<RwLock<()>>>,
}

impl<K: Eq + Hash + Copy> KeyedLocks<K> {
    fn new() -> Self {
        Self {
            table: DashMap::new(),
        }
    }

    fn handle(&self, key: K) -> Arc<RwLock<()>> {
        // len() and retain() must not run while an entry guard is held.
        if self.table.len() >= PRUNE_THRESHOLD {
            self.prune();
        }

        match self.table.entry(key) {
            Entry::Occupied(mut entry) => {
                if let Some(lock) = entry.get().upgrade() {
                    return lock;
                }
                let lock = Arc::new(RwLock::new(()));
                entry.insert(Arc::downgrade(&lock));
                lock
            }
            Entry::Vacant(entry) => {
                let lock = Arc::new(RwLock::new(()));
                entry.insert(Arc::downgrade(&lock));
                lock
            }
        }
    }

    fn prune(&self) {
        self.table.retain(|_, lock| lock.strong_count() > 0);
    }

    fn len(&self) -> usize {
        self.table.len()
    }
}

/// Keyed reader/writer locks for images and instances.
///
/// Image creation, finalise and destroy take an image exclusively. Instance
/// creation takes its source image shared, so an image cannot be finalised
/// or destroyed underneath it, and the new instance exclusively.
pub struct EntityLocks {
    images: KeyedLocks<ImageId>,
    instances: KeyedLocks<InstanceId>,
}

impl EntityLocks {
    pub fn new() -> Self {
        Self {
            images: KeyedLocks::new(),
            instances: KeyedLocks::new(),
        }
    }

    pub async fn image_read(&self, image_id: ImageId) -> ReadGuard {
        self.images.handle(image_id).read_owned().await
    }

    pub async fn image_write(&self, image_id: ImageId) -> WriteGuard {
        self.images.handle(image_id).write_owned().await
    }

    pub async fn instance_write(&self, instance_id: InstanceId) -> WriteGuard {
        self.instances.handle(instance_id).write_owned().await
    }

    /// Number of locks currently held or awaited.
    pub fn tracked(&self) -> usize {
        self.images.prune();
        self.instances.prune();
        self.images.len() + self.instances.len()
    }
}

impl Default for EntityLocks {
    fn default() -> Self {
        Self::new()
    }
}
