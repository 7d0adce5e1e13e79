//! Exclusive write locks over the coordination store.
//!
//! A lock is an ephemeral node at the lock path whose value names the
//! holder. Contenders are visible to callers so a timed-out acquire can
//! report what is currently in progress.

use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::client::CoordStore;
use crate::error::CoordError;

/// Default wait budget for lock acquisition.
pub const DEFAULT_LOCK_WAIT: Duration = Duration::from_secs(1);

const RETRY_INTERVAL: Duration = Duration::from_millis(50);

/// Registry handing out exclusive locks backed by a `CoordStore`.
pub struct LockRegistry {
    store: Arc<dyn CoordStore>,
    prefix: String,
}

impl LockRegistry {
    /// Creates a registry rooted at `<prefix>/locks`.
    pub fn new(store: Arc<dyn CoordStore>, prefix: &str) -> Self {
        Self {
            store,
            prefix: format!("{}/locks", prefix.trim_end_matches('/')),
        }
    }

    fn lock_path(&self, name: &str) -> String {
        format!("{}/{}", self.prefix, name.trim_start_matches('/'))
    }

    /// Acquires the named lock for `holder`, waiting up to `wait`.
    ///
    /// On timeout the error carries the current holder's identity.
    pub fn acquire(
        &self,
        name: &str,
        holder: &str,
        wait: Duration,
    ) -> Result<CoordLock, CoordError> {
        let path = self.lock_path(name);
        if let Some((parent, _)) = crate::client::split_path(&path) {
            if !self.store.exists(parent)? {
                self.store.create(parent, "", true)?;
            }
        }
        let start = Instant::now();
        loop {
            match self.store.create_ephemeral(&path, holder) {
                Ok(()) => {
                    tracing::debug!("lock {} acquired by {}", path, holder);
                    return Ok(CoordLock {
                        store: Arc::clone(&self.store),
                        path,
                        holder: holder.to_string(),
                        released: false,
                    });
                }
                Err(CoordError::NodeExists(_)) => {
                    let waited = start.elapsed();
                    if waited >= wait {
                        let current = self
                            .holder(name)?
                            .unwrap_or_else(|| "unknown".to_string());
                        return Err(CoordError::LockTimeout {
                            path,
                            holder: current,
                            waited,
                        });
                    }
                    std::thread::sleep(RETRY_INTERVAL.min(wait - waited));
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Returns the identity of the current holder, if any.
    pub fn holder(&self, name: &str) -> Result<Option<String>, CoordError> {
        match self.store.get(&self.lock_path(name)) {
            Ok((value, _)) => Ok(Some(value)),
            Err(CoordError::NodeNotFound(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }
}

/// Guard for an acquired lock. Released on drop.
pub struct CoordLock {
    store: Arc<dyn CoordStore>,
    path: String,
    holder: String,
    released: bool,
}

impl CoordLock {
    /// The lock node path.
    pub fn path(&self) -> &str {
        &self.path
    }

    /// The holder identity recorded in the lock node.
    pub fn holder(&self) -> &str {
        &self.holder
    }

    /// Explicitly releases the lock.
    pub fn release(mut self) {
        self.release_inner();
    }

    fn release_inner(&mut self) {
        if self.released {
            return;
        }
        self.released = true;
        // Only delete the node if we still own it; after a session reset
        // another holder may have re-acquired the same path.
        match self.store.get(&self.path) {
            Ok((value, _)) if value == self.holder => {
                if let Err(e) = self.store.delete(&self.path, false) {
                    tracing::warn!("failed to release lock {}: {}", self.path, e);
                } else {
                    tracing::debug!("lock {} released by {}", self.path, self.holder);
                }
            }
            _ => {}
        }
    }
}

impl Drop for CoordLock {
    fn drop(&mut self) {
        self.release_inner();
    }
}
