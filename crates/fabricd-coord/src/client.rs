//! Coordination store access trait.
//!
//! Models the subset of a ZooKeeper-style API the control plane needs:
//! durable nodes, ephemeral session-bound nodes, directory listing, and
//! a compare-and-swap primitive used by bounded counters.

use crate::error::CoordError;

/// Metadata returned alongside a node's value.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct NodeStat {
    /// Milliseconds since the Unix epoch at node creation.
    pub ctime_ms: u64,
    /// Node version, bumped on every set.
    pub version: u64,
    /// True if the node is bound to the current session.
    pub ephemeral: bool,
}

/// Hierarchical coordination store.
///
/// Paths are `/`-separated strings rooted at `/`. All operations are
/// linearizable within a session; callers must not cache node values
/// across suspension points.
pub trait CoordStore: Send + Sync {
    /// Creates a node. With `makepath`, missing intermediate nodes are
    /// created with empty values. Fails with `NodeExists` if present.
    fn create(&self, path: &str, value: &str, makepath: bool) -> Result<(), CoordError>;

    /// Creates an ephemeral node bound to the current session.
    fn create_ephemeral(&self, path: &str, value: &str) -> Result<(), CoordError>;

    /// Reads a node's value and stat.
    fn get(&self, path: &str) -> Result<(String, NodeStat), CoordError>;

    /// Overwrites a node's value, bumping its version.
    fn set(&self, path: &str, value: &str) -> Result<(), CoordError>;

    /// Deletes a node. With `recursive`, deletes the whole subtree;
    /// without it, fails with `NotEmpty` when children exist.
    /// Deleting a missing node is not an error.
    fn delete(&self, path: &str, recursive: bool) -> Result<(), CoordError>;

    /// Lists child node names (not full paths), sorted.
    fn children(&self, path: &str) -> Result<Vec<String>, CoordError>;

    /// Returns true if a node exists at the path.
    fn exists(&self, path: &str) -> Result<bool, CoordError>;

    /// Atomically replaces the node value if it currently equals
    /// `expected`. `None` for `expected` means "node must not exist";
    /// in that case the node is created. Returns true on success.
    fn compare_and_swap(
        &self,
        path: &str,
        expected: Option<&str>,
        new: &str,
    ) -> Result<bool, CoordError>;

    /// Current session epoch. Bumped on reconnect; ephemeral nodes from
    /// earlier epochs are gone.
    fn session_epoch(&self) -> u64;
}

/// Splits a path into its parent path and leaf name.
///
/// Returns `None` for the root path.
pub fn split_path(path: &str) -> Option<(&str, &str)> {
    let trimmed = path.trim_end_matches('/');
    if trimmed.is_empty() {
        return None;
    }
    match trimmed.rfind('/') {
        Some(0) => Some(("/", &trimmed[1..])),
        Some(idx) => Some((&trimmed[..idx], &trimmed[idx + 1..])),
        None => None,
    }
}
