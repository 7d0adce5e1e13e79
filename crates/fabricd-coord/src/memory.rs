//! In-memory coordination store.
//!
//! Backs unit tests and single-process deployments. A BTreeMap keyed by
//! full path gives sorted children listings; ephemeral nodes record the
//! session epoch they were created under and vanish when the session is
//! reset.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::RwLock;
use std::time::{SystemTime, UNIX_EPOCH};

use crate::client::{split_path, CoordStore, NodeStat};
use crate::error::CoordError;

#[derive(Clone, Debug)]
struct Node {
    value: String,
    ctime_ms: u64,
    version: u64,
    /// Session epoch for ephemeral nodes, None for durable ones.
    ephemeral_epoch: Option<u64>,
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// In-memory `CoordStore` implementation. Thread-safe via RwLock.
pub struct MemoryCoordStore {
    nodes: RwLock<BTreeMap<String, Node>>,
    session_epoch: AtomicU64,
}

impl MemoryCoordStore {
    /// Creates a store containing only the root node.
    pub fn new() -> Self {
        let mut nodes = BTreeMap::new();
        nodes.insert(
            "/".to_string(),
            Node {
                value: String::new(),
                ctime_ms: now_ms(),
                version: 0,
                ephemeral_epoch: None,
            },
        );
        Self {
            nodes: RwLock::new(nodes),
            session_epoch: AtomicU64::new(1),
        }
    }

    /// Simulates session loss: bumps the epoch and drops every
    /// ephemeral node created under earlier epochs.
    pub fn reset_session(&self) -> u64 {
        let epoch = self.session_epoch.fetch_add(1, Ordering::SeqCst) + 1;
        let mut nodes = self.nodes.write().expect("lock poisoned");
        nodes.retain(|_, n| n.ephemeral_epoch.map_or(true, |e| e >= epoch));
        tracing::info!("coordination session reset, epoch now {}", epoch);
        epoch
    }

    /// Overrides a node's creation time. Test-only hook for exercising
    /// stale-lock takeover.
    pub fn backdate(&self, path: &str, ctime_ms: u64) -> Result<(), CoordError> {
        let mut nodes = self.nodes.write().expect("lock poisoned");
        match nodes.get_mut(&normalize(path)) {
            Some(n) => {
                n.ctime_ms = ctime_ms;
                Ok(())
            }
            None => Err(CoordError::NodeNotFound(path.to_string())),
        }
    }

    fn insert_node(
        nodes: &mut BTreeMap<String, Node>,
        path: String,
        value: &str,
        ephemeral_epoch: Option<u64>,
        makepath: bool,
    ) -> Result<(), CoordError> {
        if nodes.contains_key(&path) {
            return Err(CoordError::NodeExists(path));
        }
        if let Some((parent, _)) = split_path(&path) {
            if !nodes.contains_key(parent) {
                if !makepath {
                    return Err(CoordError::NoParent(path));
                }
                Self::insert_node(nodes, parent.to_string(), "", None, true)?;
            }
        }
        nodes.insert(
            path,
            Node {
                value: value.to_string(),
                ctime_ms: now_ms(),
                version: 0,
                ephemeral_epoch,
            },
        );
        Ok(())
    }
}

impl Default for MemoryCoordStore {
    fn default() -> Self {
        Self::new()
    }
}

fn normalize(path: &str) -> String {
    if path == "/" {
        return path.to_string();
    }
    let trimmed = path.trim_end_matches('/');
    if trimmed.starts_with('/') {
        trimmed.to_string()
    } else {
        format!("/{}", trimmed)
    }
}

impl CoordStore for MemoryCoordStore {
    fn create(&self, path: &str, value: &str, makepath: bool) -> Result<(), CoordError> {
        let mut nodes = self.nodes.write().expect("lock poisoned");
        Self::insert_node(&mut nodes, normalize(path), value, None, makepath)
    }

    fn create_ephemeral(&self, path: &str, value: &str) -> Result<(), CoordError> {
        let epoch = self.session_epoch.load(Ordering::SeqCst);
        let mut nodes = self.nodes.write().expect("lock poisoned");
        Self::insert_node(&mut nodes, normalize(path), value, Some(epoch), false)
    }

    fn get(&self, path: &str) -> Result<(String, NodeStat), CoordError> {
        let nodes = self.nodes.read().expect("lock poisoned");
        match nodes.get(&normalize(path)) {
            Some(n) => Ok((
                n.value.clone(),
                NodeStat {
                    ctime_ms: n.ctime_ms,
                    version: n.version,
                    ephemeral: n.ephemeral_epoch.is_some(),
                },
            )),
            None => Err(CoordError::NodeNotFound(path.to_string())),
        }
    }

    fn set(&self, path: &str, value: &str) -> Result<(), CoordError> {
        let mut nodes = self.nodes.write().expect("lock poisoned");
        match nodes.get_mut(&normalize(path)) {
            Some(n) => {
                n.value = value.to_string();
                n.version += 1;
                Ok(())
            }
            None => Err(CoordError::NodeNotFound(path.to_string())),
        }
    }

    fn delete(&self, path: &str, recursive: bool) -> Result<(), CoordError> {
        let path = normalize(path);
        let mut nodes = self.nodes.write().expect("lock poisoned");
        if !nodes.contains_key(&path) {
            return Ok(());
        }
        let child_prefix = if path == "/" {
            "/".to_string()
        } else {
            format!("{}/", path)
        };
        let has_children = nodes
            .range(child_prefix.clone()..)
            .next()
            .is_some_and(|(k, _)| k.starts_with(&child_prefix));
        if has_children && !recursive {
            return Err(CoordError::NotEmpty(path));
        }
        if recursive {
            let doomed: Vec<String> = nodes
                .range(child_prefix.clone()..)
                .take_while(|(k, _)| k.starts_with(&child_prefix))
                .map(|(k, _)| k.clone())
                .collect();
            for k in doomed {
                nodes.remove(&k);
            }
        }
        nodes.remove(&path);
        Ok(())
    }

    fn children(&self, path: &str) -> Result<Vec<String>, CoordError> {
        let path = normalize(path);
        let nodes = self.nodes.read().expect("lock poisoned");
        if !nodes.contains_key(&path) {
            return Err(CoordError::NodeNotFound(path));
        }
        let prefix = if path == "/" {
            "/".to_string()
        } else {
            format!("{}/", path)
        };
        let mut out = Vec::new();
        for (k, _) in nodes
            .range(prefix.clone()..)
            .take_while(|(k, _)| k.starts_with(&prefix))
        {
            let rest = &k[prefix.len()..];
            if !rest.is_empty() && !rest.contains('/') {
                out.push(rest.to_string());
            }
        }
        Ok(out)
    }

    fn exists(&self, path: &str) -> Result<bool, CoordError> {
        let nodes = self.nodes.read().expect("lock poisoned");
        Ok(nodes.contains_key(&normalize(path)))
    }

    fn compare_and_swap(
        &self,
        path: &str,
        expected: Option<&str>,
        new: &str,
    ) -> Result<bool, CoordError> {
        let path = normalize(path);
        let mut nodes = self.nodes.write().expect("lock poisoned");
        match (nodes.get_mut(&path), expected) {
            (Some(n), Some(exp)) => {
                if n.value == exp {
                    n.value = new.to_string();
                    n.version += 1;
                    Ok(true)
                } else {
                    Ok(false)
                }
            }
            (Some(_), None) => Ok(false),
            (None, Some(_)) => Ok(false),
            (None, None) => {
                Self::insert_node(&mut nodes, path, new, None, true)?;
                Ok(true)
            }
        }
    }

    fn session_epoch(&self) -> u64 {
        self.session_epoch.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_create_get() {
        let store = MemoryCoordStore::new();
        store.create("/a", "one", false).unwrap();
        let (value, stat) = store.get("/a").unwrap();
        assert_eq!(value, "one");
        assert!(!stat.ephemeral);
        assert_eq!(stat.version, 0);
    }

    #[test]
    fn test_create_existing_fails() {
        let store = MemoryCoordStore::new();
        store.create("/a", "one", false).unwrap();
        assert!(matches!(
            store.create("/a", "two", false),
            Err(CoordError::NodeExists(_))
        ));
    }

    #[test]
    fn test_create_without_parent_fails() {
        let store = MemoryCoordStore::new();
        assert!(matches!(
            store.create("/a/b/c", "x", false),
            Err(CoordError::NoParent(_))
        ));
    }

    #[test]
    fn test_create_makepath() {
        let store = MemoryCoordStore::new();
        store.create("/a/b/c", "x", true).unwrap();
        assert!(store.exists("/a").unwrap());
        assert!(store.exists("/a/b").unwrap());
        assert_eq!(store.get("/a/b/c").unwrap().0, "x");
    }

    #[test]
    fn test_set_bumps_version() {
        let store = MemoryCoordStore::new();
        store.create("/a", "one", false).unwrap();
        store.set("/a", "two").unwrap();
        let (value, stat) = store.get("/a").unwrap();
        assert_eq!(value, "two");
        assert_eq!(stat.version, 1);
    }

    #[test]
    fn test_delete_missing_ok() {
        let store = MemoryCoordStore::new();
        store.delete("/nope", false).unwrap();
    }

    #[test]
    fn test_delete_nonempty_requires_recursive() {
        let store = MemoryCoordStore::new();
        store.create("/a/b", "x", true).unwrap();
        assert!(matches!(
            store.delete("/a", false),
            Err(CoordError::NotEmpty(_))
        ));
        store.delete("/a", true).unwrap();
        assert!(!store.exists("/a/b").unwrap());
    }

    #[test]
    fn test_children_sorted() {
        let store = MemoryCoordStore::new();
        store.create("/dir/b", "2", true).unwrap();
        store.create("/dir/a", "1", true).unwrap();
        store.create("/dir/c/d", "deep", true).unwrap();
        assert_eq!(store.children("/dir").unwrap(), vec!["a", "b", "c"]);
    }

    #[test]
    fn test_children_missing_node() {
        let store = MemoryCoordStore::new();
        assert!(store.children("/nope").is_err());
    }

    #[test]
    fn test_ephemeral_dropped_on_session_reset() {
        let store = MemoryCoordStore::new();
        store.create_ephemeral("/lock", "holder-1").unwrap();
        assert!(store.exists("/lock").unwrap());
        store.reset_session();
        assert!(!store.exists("/lock").unwrap());
    }

    #[test]
    fn test_durable_survives_session_reset() {
        let store = MemoryCoordStore::new();
        store.create("/durable", "x", false).unwrap();
        store.reset_session();
        assert!(store.exists("/durable").unwrap());
    }

    #[test]
    fn test_cas_create_when_absent() {
        let store = MemoryCoordStore::new();
        assert!(store.compare_and_swap("/ctr", None, "5").unwrap());
        assert_eq!(store.get("/ctr").unwrap().0, "5");
        // Second create-style CAS must fail: node now exists.
        assert!(!store.compare_and_swap("/ctr", None, "6").unwrap());
    }

    #[test]
    fn test_cas_swap_value() {
        let store = MemoryCoordStore::new();
        store.create("/ctr", "5", false).unwrap();
        assert!(store.compare_and_swap("/ctr", Some("5"), "6").unwrap());
        assert!(!store.compare_and_swap("/ctr", Some("5"), "7").unwrap());
        assert_eq!(store.get("/ctr").unwrap().0, "6");
    }

    #[test]
    fn test_backdate() {
        let store = MemoryCoordStore::new();
        store.create("/a", "x", false).unwrap();
        store.backdate("/a", 1000).unwrap();
        assert_eq!(store.get("/a").unwrap().1.ctime_ms, 1000);
    }
}
