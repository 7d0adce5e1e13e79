//! In-memory bus.
//!
//! Cursor-based stream: events carry monotonic sequence numbers, each
//! consumer tracks the last sequence it processed. Events older than
//! every cursor are trimmed on publish.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::RwLock;

use crate::client::{BusClient, BusStats};
use crate::error::BusError;
use crate::message::{BusEvent, BusMessage};

/// Default backlog bound per consumer.
pub const DEFAULT_MAX_PENDING: u64 = 10_000;

/// In-memory [`BusClient`] used by tests and single-process
/// deployments.
pub struct MemoryBus {
    events: RwLock<Vec<BusEvent>>,
    cursors: RwLock<HashMap<String, u64>>,
    next_sequence: AtomicU64,
    max_pending: u64,
    connected: AtomicBool,
    published: AtomicU64,
    consumed: AtomicU64,
    reconnects: AtomicU64,
}

impl MemoryBus {
    /// Creates a bus with the default backlog bound.
    pub fn new() -> Self {
        Self::with_max_pending(DEFAULT_MAX_PENDING)
    }

    /// Creates a bus that rejects publishes once the slowest consumer
    /// is `max_pending` messages behind.
    pub fn with_max_pending(max_pending: u64) -> Self {
        Self {
            events: RwLock::new(Vec::new()),
            cursors: RwLock::new(HashMap::new()),
            next_sequence: AtomicU64::new(1),
            max_pending,
            connected: AtomicBool::new(true),
            published: AtomicU64::new(0),
            consumed: AtomicU64::new(0),
            reconnects: AtomicU64::new(0),
        }
    }

    /// Simulates a broker connection drop. Publish and consume fail
    /// with [`BusError::Disconnected`] until [`Self::reconnect`].
    pub fn disconnect(&self) {
        self.connected.store(false, Ordering::SeqCst);
        tracing::warn!("bus connection lost");
    }

    /// Re-establishes the simulated connection.
    pub fn reconnect(&self) {
        if !self.connected.swap(true, Ordering::SeqCst) {
            self.reconnects.fetch_add(1, Ordering::Relaxed);
            tracing::info!("bus connection re-established");
        }
    }

    fn check_connected(&self) -> Result<(), BusError> {
        if self.connected.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(BusError::Disconnected)
        }
    }

    /// Drops events every registered cursor has passed.
    fn trim(&self, events: &mut Vec<BusEvent>) {
        let cursors = self.cursors.read().expect("lock poisoned");
        if cursors.is_empty() {
            // Nobody listening; keep nothing.
            events.clear();
            return;
        }
        let min_cursor = cursors.values().copied().min().unwrap_or(0);
        events.retain(|e| e.sequence > min_cursor);
    }

    fn slowest_backlog(&self, head: u64) -> u64 {
        let cursors = self.cursors.read().expect("lock poisoned");
        cursors
            .values()
            .map(|c| head.saturating_sub(*c))
            .max()
            .unwrap_or(0)
    }
}

impl Default for MemoryBus {
    fn default() -> Self {
        Self::new()
    }
}

impl BusClient for MemoryBus {
    fn publish(&self, msg: BusMessage) -> Result<u64, BusError> {
        self.check_connected()?;
        let head = self.next_sequence.load(Ordering::SeqCst) - 1;
        let pending = self.slowest_backlog(head);
        if pending >= self.max_pending {
            return Err(BusError::QueueFull {
                pending,
                max: self.max_pending,
            });
        }
        let sequence = self.next_sequence.fetch_add(1, Ordering::SeqCst);
        let mut events = self.events.write().expect("lock poisoned");
        events.push(BusEvent { sequence, message: msg });
        self.trim(&mut events);
        self.published.fetch_add(1, Ordering::Relaxed);
        tracing::debug!("published bus event seq={}", sequence);
        Ok(sequence)
    }

    fn register_consumer(&self, consumer_id: &str) {
        let head = self.next_sequence.load(Ordering::SeqCst) - 1;
        let mut cursors = self.cursors.write().expect("lock poisoned");
        cursors.entry(consumer_id.to_string()).or_insert(head);
        tracing::info!("registered bus consumer {}", consumer_id);
    }

    fn unregister_consumer(&self, consumer_id: &str) -> bool {
        let removed = self
            .cursors
            .write()
            .expect("lock poisoned")
            .remove(consumer_id)
            .is_some();
        if removed {
            tracing::info!("unregistered bus consumer {}", consumer_id);
        }
        removed
    }

    fn consume(&self, consumer_id: &str, max_count: usize) -> Result<Vec<BusEvent>, BusError> {
        self.check_connected()?;
        let mut cursors = self.cursors.write().expect("lock poisoned");
        let cursor = cursors
            .get_mut(consumer_id)
            .ok_or_else(|| BusError::UnknownConsumer(consumer_id.to_string()))?;

        let mut events = self.events.write().expect("lock poisoned");
        let start_idx = match events.binary_search_by(|e| e.sequence.cmp(cursor)) {
            Ok(idx) => idx + 1,
            Err(idx) => idx,
        };
        let end_idx = (start_idx + max_count).min(events.len());
        let result: Vec<BusEvent> = events[start_idx..end_idx].to_vec();
        if let Some(last) = result.last() {
            *cursor = last.sequence;
        }
        drop(cursors);
        self.trim(&mut events);
        self.consumed.fetch_add(result.len() as u64, Ordering::Relaxed);
        Ok(result)
    }

    fn num_pending_messages(&self, consumer_id: &str) -> Result<u64, BusError> {
        let cursors = self.cursors.read().expect("lock poisoned");
        let cursor = cursors
            .get(consumer_id)
            .ok_or_else(|| BusError::UnknownConsumer(consumer_id.to_string()))?;
        let head = self.next_sequence.load(Ordering::SeqCst) - 1;
        Ok(head.saturating_sub(*cursor))
    }

    fn stats(&self) -> BusStats {
        BusStats {
            published: self.published.load(Ordering::Relaxed),
            consumed: self.consumed.load(Ordering::Relaxed),
            reconnects: self.reconnects.load(Ordering::Relaxed),
            connected: self.connected.load(Ordering::SeqCst),
        }
    }
}
