//! Bounded monotone counters over the coordination store.
//!
//! Used for per-(project, resource-type) quota enforcement. Increments
//! are CAS loops against the counter node, so concurrent writers in
//! different processes converge without locks.

use std::sync::Arc;

use crate::client::CoordStore;
use crate::error::CoordError;

/// A distributed counter bounded by `max_count`.
///
/// `incr` fails atomically when the increment would pass the bound;
/// `decr` saturates at zero.
pub struct BoundedCounter {
    store: Arc<dyn CoordStore>,
    path: String,
    max_count: u64,
}

impl BoundedCounter {
    /// Binds a counter to `path`, creating the node with `default`
    /// if it does not exist yet.
    pub fn new(
        store: Arc<dyn CoordStore>,
        path: &str,
        max_count: u64,
        default: u64,
    ) -> Result<Self, CoordError> {
        if !store.exists(path)? {
            // Another process may have raced us; losing the CAS is fine.
            let _ = store.compare_and_swap(path, None, &default.to_string())?;
        }
        Ok(Self {
            store,
            path: path.to_string(),
            max_count,
        })
    }

    /// Reads the current value.
    pub fn value(&self) -> Result<u64, CoordError> {
        let (raw, _) = self.store.get(&self.path)?;
        raw.parse::<u64>()
            .map_err(|e| CoordError::Backend(format!("counter {}: {}", self.path, e)))
    }

    /// The configured upper bound.
    pub fn max_count(&self) -> u64 {
        self.max_count
    }

    /// Atomically adds `n`, failing with `OverLimit` if the result
    /// would exceed the bound. Returns the new value.
    pub fn incr(&self, n: u64) -> Result<u64, CoordError> {
        loop {
            let current = self.value()?;
            let next = current.saturating_add(n);
            if next > self.max_count {
                return Err(CoordError::OverLimit {
                    path: self.path.clone(),
                    max: self.max_count,
                });
            }
            if self
                .store
                .compare_and_swap(&self.path, Some(&current.to_string()), &next.to_string())?
            {
                return Ok(next);
            }
            tracing::debug!("counter {} CAS raced, retrying", self.path);
        }
    }

    /// Atomically subtracts `n`, saturating at zero. Returns the new
    /// value.
    pub fn decr(&self, n: u64) -> Result<u64, CoordError> {
        loop {
            let current = self.value()?;
            let next = current.saturating_sub(n);
            if self
                .store
                .compare_and_swap(&self.path, Some(&current.to_string()), &next.to_string())?
            {
                return Ok(next);
            }
        }
    }

    /// Overwrites the stored value. Used when quota limits are
    /// re-initialized after a project quota change.
    pub fn reset(&self, value: u64) -> Result<(), CoordError> {
        self.store.set(&self.path, &value.to_string())
    }
}
