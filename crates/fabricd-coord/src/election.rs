//! Master election over the coordination store.
//!
//! One candidate per process registers under the election root with an
//! ephemeral node; the lowest sequence wins. Registered callbacks are
//! re-armed after session loss so a reconnected process re-enters the
//! election automatically.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use crate::client::CoordStore;
use crate::error::CoordError;

type WinCallback = Box<dyn Fn() + Send + Sync>;

struct Candidate {
    id: String,
    seq: u64,
    on_win: WinCallback,
}

/// Election coordinator rooted at a fixed path.
pub struct MasterElection {
    store: Arc<dyn CoordStore>,
    root: String,
    next_seq: AtomicU64,
    candidates: RwLock<Vec<Candidate>>,
    current_master: Mutex<Option<String>>,
    registered_epoch: AtomicU64,
}

impl MasterElection {
    /// Creates an election at `root` (for example `/api-server-election`).
    pub fn new(store: Arc<dyn CoordStore>, root: &str) -> Result<Self, CoordError> {
        if !store.exists(root)? {
            store.create(root, "", true)?;
        }
        let epoch = store.session_epoch();
        Ok(Self {
            store,
            root: root.to_string(),
            next_seq: AtomicU64::new(1),
            candidates: RwLock::new(Vec::new()),
            current_master: Mutex::new(None),
            registered_epoch: AtomicU64::new(epoch),
        })
    }

    /// Registers a candidate. The callback fires when the candidate
    /// becomes master (possibly immediately).
    pub fn register<F>(&self, candidate_id: &str, on_win: F) -> Result<(), CoordError>
    where
        F: Fn() + Send + Sync + 'static,
    {
        let seq = self.next_seq.fetch_add(1, Ordering::SeqCst);
        let node = format!("{}/candidate-{:010}", self.root, seq);
        self.store.create_ephemeral(&node, candidate_id)?;
        self.candidates.write().expect("lock poisoned").push(Candidate {
            id: candidate_id.to_string(),
            seq,
            on_win: Box::new(on_win),
        });
        tracing::info!("election {}: registered candidate {}", self.root, candidate_id);
        self.evaluate()
    }

    /// Current master candidate id, if any.
    pub fn master(&self) -> Option<String> {
        self.current_master.lock().expect("lock poisoned").clone()
    }

    /// Re-checks election state. Must be called after session changes;
    /// re-registers local candidates whose ephemeral nodes were lost.
    pub fn evaluate(&self) -> Result<(), CoordError> {
        let epoch = self.store.session_epoch();
        if self.registered_epoch.swap(epoch, Ordering::SeqCst) != epoch {
            self.reregister()?;
        }
        let names = self.store.children(&self.root)?;
        let winner_seq = names
            .iter()
            .filter_map(|n| n.strip_prefix("candidate-"))
            .filter_map(|s| s.parse::<u64>().ok())
            .min();
        let candidates = self.candidates.read().expect("lock poisoned");
        let winner = winner_seq.and_then(|seq| candidates.iter().find(|c| c.seq == seq));
        let mut master = self.current_master.lock().expect("lock poisoned");
        if let Some(w) = winner {
            if master.as_deref() != Some(w.id.as_str()) {
                *master = Some(w.id.clone());
                tracing::info!("election {}: {} is master", self.root, w.id);
                (w.on_win)();
            }
        }
        Ok(())
    }

    fn reregister(&self) -> Result<(), CoordError> {
        let mut candidates = self.candidates.write().expect("lock poisoned");
        for c in candidates.iter_mut() {
            let seq = self.next_seq.fetch_add(1, Ordering::SeqCst);
            let node = format!("{}/candidate-{:010}", self.root, seq);
            self.store.create_ephemeral(&node, &c.id)?;
            c.seq = seq;
            tracing::info!("election {}: re-registered {} after session loss", self.root, c.id);
        }
        // Force the win callback to re-fire for the new incarnation.
        *self.current_master.lock().expect("lock poisoned") = None;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryCoordStore;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn test_first_candidate_wins() {
        let store = Arc::new(MemoryCoordStore::new());
        let election = MasterElection::new(store, "/api-server-election").unwrap();
        let wins = Arc::new(AtomicUsize::new(0));
        let w = wins.clone();
        election
            .register("node-1", move || {
                w.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();
        assert_eq!(election.master().as_deref(), Some("node-1"));
        assert_eq!(wins.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_second_candidate_does_not_preempt() {
        let store = Arc::new(MemoryCoordStore::new());
        let election = MasterElection::new(store, "/el").unwrap();
        election.register("node-1", || {}).unwrap();
        let wins = Arc::new(AtomicUsize::new(0));
        let w = wins.clone();
        election
            .register("node-2", move || {
                w.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();
        assert_eq!(election.master().as_deref(), Some("node-1"));
        assert_eq!(wins.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_reregistration_after_session_loss() {
        let store = Arc::new(MemoryCoordStore::new());
        let election = MasterElection::new(store.clone(), "/el").unwrap();
        let wins = Arc::new(AtomicUsize::new(0));
        let w = wins.clone();
        election
            .register("node-1", move || {
                w.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();
        assert_eq!(wins.load(Ordering::SeqCst), 1);

        store.reset_session();
        election.evaluate().unwrap();
        // Candidate node was re-created and the callback re-fired.
        assert_eq!(election.master().as_deref(), Some("node-1"));
        assert_eq!(wins.load(Ordering::SeqCst), 2);
    }
}
