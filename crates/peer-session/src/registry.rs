use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Instant;

use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use uuid::Uuid;

/// Fresh peer identifier: `peer-<uuid v4>`.
pub fn new_peer_id() -> String {
    format!("peer-{}", Uuid::new_v4())
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("peer '{0}' is already registered")]
pub struct DuplicatePeer(pub String);

#[derive(Debug)]
struct PeerEntry {
    connected_at: Instant,
    last_active: Instant,
    cancel: CancellationToken,
}

/// Live peers, keyed by peer ID.
#[derive(Debug, Default)]
pub struct PeerRegistry {
    peers: Mutex<HashMap<String, PeerEntry>>,
}

impl PeerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn peers(&self) -> MutexGuard<'_, HashMap<String, PeerEntry>> {
        self.peers.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Add a peer. Refuses an ID that is already present.
    pub fn register(&self, peer_id: &str, cancel: CancellationToken) -> Result<(), DuplicatePeer> {
        let mut peers = self.peers();
        if peers.contains_key(peer_id) {
            return Err(DuplicatePeer(peer_id.to_string()));
        }
        let now = Instant::now();
        peers.insert(
            peer_id.to_string(),
            PeerEntry {
                connected_at: now,
                last_active: now,
                cancel,
            },
        );
        Ok(())
    }

    pub fn touch(&self, peer_id: &str) {
        if let Some(entry) = self.peers().get_mut(peer_id) {
            entry.last_active = Instant::now();
        }
    }

    pub fn last_active(&self, peer_id: &str) -> Option<Instant> {
        self.peers().get(peer_id).map(|e| e.last_active)
    }

    pub fn contains(&self, peer_id: &str) -> bool {
        self.peers().contains_key(peer_id)
    }

    /// Remove a peer. Returns `false` if it was not registered.
    pub fn deregister(&self, peer_id: &str) -> bool {
        match self.peers().remove(peer_id) {
            Some(entry) => {
                debug!(
                    peer_id,
                    connected_ms = entry.connected_at.elapsed().as_millis() as u64,
                    "peer deregistered"
                );
                true
            }
            None => false,
        }
    }

    pub fn len(&self) -> usize {
        self.peers().len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers().is_empty()
    }

    /// Cancel every registered peer's token.
    pub fn cancel_all(&self) {
        for entry in self.peers().values() {
            entry.cancel.cancel();
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use super::*;

    #[test]
    fn peer_ids_are_unique_and_prefixed() {
        let ids: HashSet<String> = (0..1000).map(|_| new_peer_id()).collect();
        assert_eq!(ids.len(), 1000);
        assert!(ids.iter().all(|id| id.starts_with("peer-")));
    }

    #[test]
    fn duplicate_registration_is_refused() {
        let registry = PeerRegistry::new();
        registry.register("peer-1", CancellationToken::new()).unwrap();
        assert_eq!(
            registry.register("peer-1", CancellationToken::new()),
            Err(DuplicatePeer("peer-1".into()))
        );
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn touch_moves_last_active_forward() {
        let registry = PeerRegistry::new();
        registry.register("peer-1", CancellationToken::new()).unwrap();
        let before = registry.last_active("peer-1").unwrap();
        std::thread::sleep(std::time::Duration::from_millis(2));
        registry.touch("peer-1");
        assert!(registry.last_active("peer-1").unwrap() > before);
    }

    #[test]
    fn deregister_is_idempotent() {
        let registry = PeerRegistry::new();
        registry.register("peer-1", CancellationToken::new()).unwrap();
        assert!(registry.deregister("peer-1"));
        assert!(!registry.deregister("peer-1"));
        assert!(registry.is_empty());
    }

    #[test]
    fn cancel_all_fires_every_token() {
        let registry = PeerRegistry::new();
        let a = CancellationToken::new();
        let b = CancellationToken::new();
        registry.register("peer-a", a.clone()).unwrap();
        registry.register("peer-b", b.clone()).unwrap();

        registry.cancel_all();
        assert!(a.is_cancelled());
        assert!(b.is_cancelled());
    }
}
