//! Mutation-scoped locking keyed by filesystem path.
//!
//! The engine has no mutual exclusion of its own. Every mutating operation
//! takes a [`LockGuard`] from the injected [`Locker`] right before its
//! existence check and holds it until the commit rename is done.

use super::error::{StorageError, StorageResult};
use async_trait::async_trait;
use std::{
    collections::HashMap,
    fmt::Debug,
    sync::{Arc, Mutex},
};
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Source of named locks. Implementations must allow many callers to contend
/// for the same key; a distributed implementation may also be shared between
/// processes.
#[async_trait]
pub trait Locker: Send + Sync + Debug + 'static {
    /// Block until `key` is held or `cancel` fires.
    async fn lock(&self, key: &str, cancel: &CancellationToken) -> StorageResult<LockGuard>;
}

/// A held lock. Dropping it releases the key.
///
/// `scope()` is cancelled when the guard is released, or earlier if the
/// implementation loses the lock; writers check it right before committing.
pub struct LockGuard {
    scope: CancellationToken,
    release: Option<Box<dyn FnOnce() + Send + Sync>>,
}

impl LockGuard {
    pub fn new(scope: CancellationToken, release: impl FnOnce() + Send + Sync + 'static) -> Self {
        Self {
            scope,
            release: Some(Box::new(release)),
        }
    }

    pub fn scope(&self) -> &CancellationToken {
        &self.scope
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        self.scope.cancel();
        if let Some(release) = self.release.take() {
            release();
        }
    }
}

type KeyTable = Arc<Mutex<HashMap<String, Arc<AsyncMutex<()>>>>>;

/// In-process [`Locker`]: one async mutex per key, dropped from the table
/// once nobody holds or waits for it.
#[derive(Debug, Default, Clone)]
pub struct LocalLocker {
    keys: KeyTable,
}

impl LocalLocker {
    pub fn new() -> Self {
        Self::default()
    }

    fn entry(&self, key: &str) -> Arc<AsyncMutex<()>> {
        let mut keys = self.keys.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        keys.entry(key.to_string())
            .or_insert_with(|| Arc::new(AsyncMutex::new(())))
            .clone()
    }

    fn reclaim(keys: &KeyTable, key: &str) {
        let mut keys = keys.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        // Only the table still references the mutex.
        if keys.get(key).is_some_and(|m| Arc::strong_count(m) == 1) {
            keys.remove(key);
        }
    }
}

#[async_trait]
impl Locker for LocalLocker {
    async fn lock(&self, key: &str, cancel: &CancellationToken) -> StorageResult<LockGuard> {
        let mutex = self.entry(key);
        let acquired: Option<OwnedMutexGuard<()>> = tokio::select! {
            guard = mutex.lock_owned() => Some(guard),
            _ = cancel.cancelled() => None,
        };
        let Some(held) = acquired else {
            Self::reclaim(&self.keys, key);
            return Err(StorageError::Cancelled);
        };
        debug!("lock acquired: {}", key);

        let keys = self.keys.clone();
        let key = key.to_string();
        Ok(LockGuard::new(cancel.child_token(), move || {
            drop(held);
            Self::reclaim(&keys, &key);
            debug!("lock released: {}", key);
        }))
    }
}
