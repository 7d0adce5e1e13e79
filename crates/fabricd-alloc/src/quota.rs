//! Per-(project, resource-type) quota counters.
//!
//! A quota counter is a bounded counter in the coordination store,
//! lazily seeded from the current object count the first time the pair
//! is charged. Limit `-1` means unlimited and skips the store entirely.

use std::sync::Arc;

use fabricd_coord::{BoundedCounter, CoordError, CoordStore};

use crate::error::AllocError;

/// Base path of quota counters in the coordination store.
pub const QUOTA_PATH_PREFIX: &str = "/quota";

/// Quota enforcement for one (project, resource-type) pair.
pub struct QuotaCounter {
    resource_type: String,
    // None when the limit is unlimited.
    counter: Option<BoundedCounter>,
    limit: i64,
}

impl QuotaCounter {
    /// Binds a counter for the pair. `limit < 0` disables enforcement.
    /// `seed` is the current object count, used only if the counter
    /// node does not exist yet.
    pub fn new(
        store: Arc<dyn CoordStore>,
        project_uuid: &str,
        resource_type: &str,
        limit: i64,
        seed: u64,
    ) -> Result<Self, AllocError> {
        let counter = if limit < 0 {
            None
        } else {
            let path = format!("{}/{}/{}", QUOTA_PATH_PREFIX, project_uuid, resource_type);
            Some(BoundedCounter::new(store, &path, limit as u64, seed)?)
        };
        Ok(Self {
            resource_type: resource_type.to_string(),
            counter,
            limit,
        })
    }

    /// The configured limit; negative means unlimited.
    pub fn limit(&self) -> i64 {
        self.limit
    }

    /// Charges `n` units, failing atomically if the limit would be
    /// exceeded.
    pub fn charge(&self, n: u64) -> Result<(), AllocError> {
        let Some(counter) = &self.counter else {
            return Ok(());
        };
        match counter.incr(n) {
            Ok(_) => Ok(()),
            Err(CoordError::OverLimit { .. }) => Err(AllocError::QuotaExceeded {
                resource: self.resource_type.clone(),
                limit: self.limit as u64,
            }),
            Err(e) => Err(e.into()),
        }
    }

    /// Releases `n` units; saturates at zero.
    pub fn release(&self, n: u64) -> Result<(), AllocError> {
        if let Some(counter) = &self.counter {
            counter.decr(n)?;
        }
        Ok(())
    }

    /// Current usage; zero when unlimited.
    pub fn usage(&self) -> Result<u64, AllocError> {
        match &self.counter {
            Some(counter) => Ok(counter.value()?),
            None => Ok(0),
        }
    }

    /// Rewrites the counter to `value`, used when the quota limit
    /// changes and the count must be re-derived from the store.
    pub fn reinitialize(&self, value: u64) -> Result<(), AllocError> {
        if let Some(counter) = &self.counter {
            counter.reset(value)?;
        }
        Ok(())
    }
}
