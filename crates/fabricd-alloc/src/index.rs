//! Integer-range index allocator.

use std::collections::BTreeSet;
use std::sync::{Arc, Mutex};

use fabricd_coord::{CoordError, CoordStore};

use crate::error::AllocError;

/// Zero-padding width of ID znode names; wide enough for 2³².
pub const ID_PAD: usize = 10;

/// An integer-range allocator whose state of record is a set of znodes
/// under a base path.
///
/// The in-process `in_use` set mirrors the store and is refreshed from
/// the store's children at construction. Peer allocations are folded in
/// via [`IndexAllocator::set_in_use`].
pub struct IndexAllocator {
    store: Arc<dyn CoordStore>,
    base_path: String,
    start: u64,
    size: u64,
    reverse: bool,
    in_use: Mutex<BTreeSet<u64>>,
}

impl IndexAllocator {
    /// Creates an allocator over `[start, start + size)` rooted at
    /// `base_path`, loading existing allocations from the store.
    pub fn new(
        store: Arc<dyn CoordStore>,
        base_path: &str,
        start: u64,
        size: u64,
        reverse: bool,
    ) -> Result<Self, AllocError> {
        match store.create(base_path, "", true) {
            Ok(()) | Err(CoordError::NodeExists(_)) => {}
            Err(e) => return Err(e.into()),
        }
        let mut in_use = BTreeSet::new();
        for child in store.children(base_path)? {
            if let Ok(id) = child.parse::<u64>() {
                in_use.insert(id);
            }
        }
        Ok(Self {
            store,
            base_path: base_path.to_string(),
            start,
            size,
            reverse,
            in_use: Mutex::new(in_use),
        })
    }

    /// The allocator's base path in the coordination store.
    pub fn base_path(&self) -> &str {
        &self.base_path
    }

    /// Range start (inclusive).
    pub fn start(&self) -> u64 {
        self.start
    }

    /// Range end (exclusive).
    pub fn end(&self) -> u64 {
        self.start + self.size
    }

    fn id_path(&self, id: u64) -> String {
        format!("{}/{:0pad$}", self.base_path, id, pad = ID_PAD)
    }

    fn check_range(&self, id: u64) -> Result<(), AllocError> {
        if id < self.start || id >= self.end() {
            return Err(AllocError::OutOfRange {
                id,
                start: self.start,
                end: self.end(),
            });
        }
        Ok(())
    }

    /// Allocates the lowest (or, for reverse allocators, highest) free
    /// ID and records `owner` as its value.
    pub fn alloc(&self, owner: &str) -> Result<u64, AllocError> {
        loop {
            let candidate = {
                let in_use = self.in_use.lock().expect("lock poisoned");
                if self.reverse {
                    (self.start..self.end()).rev().find(|id| !in_use.contains(id))
                } else {
                    (self.start..self.end()).find(|id| !in_use.contains(id))
                }
            };
            let id = candidate.ok_or_else(|| AllocError::Exhausted {
                path: self.base_path.clone(),
            })?;
            match self.store.create(&self.id_path(id), owner, false) {
                Ok(()) => {
                    self.in_use.lock().expect("lock poisoned").insert(id);
                    tracing::debug!("allocated id {} at {} for {}", id, self.base_path, owner);
                    return Ok(id);
                }
                // A peer took it between our scan and create; fold it
                // in and retry.
                Err(CoordError::NodeExists(_)) => {
                    self.in_use.lock().expect("lock poisoned").insert(id);
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Claims a specific ID for `owner`. Idempotent for the same owner;
    /// fails with [`AllocError::ResourceExists`] otherwise.
    pub fn reserve(&self, id: u64, owner: &str) -> Result<u64, AllocError> {
        self.check_range(id)?;
        match self.store.create(&self.id_path(id), owner, false) {
            Ok(()) => {
                self.in_use.lock().expect("lock poisoned").insert(id);
                Ok(id)
            }
            Err(CoordError::NodeExists(_)) => {
                self.in_use.lock().expect("lock poisoned").insert(id);
                let (current, _) = self.store.get(&self.id_path(id))?;
                if current == owner {
                    Ok(id)
                } else {
                    Err(AllocError::ResourceExists { id, owner: current })
                }
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Reads the owner of an ID, None if free.
    pub fn read(&self, id: u64) -> Result<Option<String>, AllocError> {
        match self.store.get(&self.id_path(id)) {
            Ok((owner, _)) => Ok(Some(owner)),
            Err(CoordError::NodeNotFound(_)) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Releases an ID. Freeing a free ID is a no-op.
    pub fn free(&self, id: u64) -> Result<(), AllocError> {
        match self.store.delete(&self.id_path(id), false) {
            Ok(()) | Err(CoordError::NodeNotFound(_)) => {}
            Err(e) => return Err(e.into()),
        }
        self.in_use.lock().expect("lock poisoned").remove(&id);
        tracing::debug!("freed id {} at {}", id, self.base_path);
        Ok(())
    }

    /// Marks an ID in use locally (peer allocation seen on the bus).
    pub fn set_in_use(&self, id: u64) {
        if id >= self.start && id < self.end() {
            self.in_use.lock().expect("lock poisoned").insert(id);
        }
    }

    /// Clears the local in-use mark (peer free seen on the bus).
    pub fn reset_in_use(&self, id: u64) {
        self.in_use.lock().expect("lock poisoned").remove(&id);
    }

    /// True if the ID is marked in use locally.
    pub fn is_in_use(&self, id: u64) -> bool {
        self.in_use.lock().expect("lock poisoned").contains(&id)
    }

    /// Number of IDs currently marked in use.
    pub fn in_use_count(&self) -> usize {
        self.in_use.lock().expect("lock poisoned").len()
    }

    /// IDs currently marked in use, ascending.
    pub fn in_use_ids(&self) -> Vec<u64> {
        self.in_use.lock().expect("lock poisoned").iter().copied().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fabricd_coord::MemoryCoordStore;

    fn alloc(start: u64, size: u64, reverse: bool) -> IndexAllocator {
        let store = Arc::new(MemoryCoordStore::new());
        IndexAllocator::new(store, "/id/test", start, size, reverse).unwrap()
    }

    #[test]
    fn test_alloc_sequential_from_start() {
        let a = alloc(1, 10, false);
        assert_eq!(a.alloc("vn-a").unwrap(), 1);
        assert_eq!(a.alloc("vn-b").unwrap(), 2);
        assert_eq!(a.read(1).unwrap().as_deref(), Some("vn-a"));
    }

    #[test]
    fn test_alloc_reverse() {
        let a = alloc(0, 128, true);
        assert_eq!(a.alloc("ae-a").unwrap(), 127);
        assert_eq!(a.alloc("ae-b").unwrap(), 126);
    }

    #[test]
    fn test_free_enables_reuse() {
        let a = alloc(1, 3, false);
        a.alloc("a").unwrap();
        a.alloc("b").unwrap();
        a.free(1).unwrap();
        assert_eq!(a.alloc("c").unwrap(), 1);
    }

    #[test]
    fn test_exhausted() {
        let a = alloc(1, 2, false);
        a.alloc("a").unwrap();
        a.alloc("b").unwrap();
        assert!(matches!(a.alloc("c"), Err(AllocError::Exhausted { .. })));
    }

    #[test]
    fn test_reserve_specific_and_conflict() {
        let a = alloc(0, 100, false);
        assert_eq!(a.reserve(42, "mine").unwrap(), 42);
        // Same owner is idempotent.
        assert_eq!(a.reserve(42, "mine").unwrap(), 42);
        match a.reserve(42, "other") {
            Err(AllocError::ResourceExists { id: 42, owner }) => assert_eq!(owner, "mine"),
            other => panic!("unexpected: {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn test_reserve_out_of_range() {
        let a = alloc(1, 10, false);
        assert!(matches!(a.reserve(0, "x"), Err(AllocError::OutOfRange { .. })));
        assert!(matches!(a.reserve(11, "x"), Err(AllocError::OutOfRange { .. })));
    }

    #[test]
    fn test_set_in_use_skips_id() {
        let a = alloc(1, 10, false);
        a.set_in_use(1);
        assert_eq!(a.alloc("a").unwrap(), 2);
        a.reset_in_use(1);
        assert_eq!(a.alloc("b").unwrap(), 1);
    }

    #[test]
    fn test_two_allocators_share_store() {
        let store = Arc::new(MemoryCoordStore::new());
        let a = IndexAllocator::new(store.clone(), "/id/shared", 1, 10, false).unwrap();
        let id = a.alloc("from-a").unwrap();
        // A second process loads existing allocations at startup.
        let b = IndexAllocator::new(store, "/id/shared", 1, 10, false).unwrap();
        assert_ne!(b.alloc("from-b").unwrap(), id);
    }

    #[test]
    fn test_peer_race_on_alloc() {
        let store = Arc::new(MemoryCoordStore::new());
        let a = IndexAllocator::new(store.clone(), "/id/race", 1, 10, false).unwrap();
        let b = IndexAllocator::new(store, "/id/race", 1, 10, false).unwrap();
        // b grabs id 1 without a noticing; a's create hits NodeExists
        // and rolls forward.
        assert_eq!(b.alloc("peer").unwrap(), 1);
        assert_eq!(a.alloc("local").unwrap(), 2);
    }
}
