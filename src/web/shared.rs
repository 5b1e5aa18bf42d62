//! Shared state for the signaling relay
//!
//! Registered participants, the pairing of participants in a call, and
//! counters for `/metrics`.

use crate::config::Config;
use log::{debug, info};
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;

/// One registered socket
#[derive(Debug, Clone)]
struct Registration {
    connection_id: u64,
    sender: mpsc::UnboundedSender<String>,
}

/// Shared state for the relay
#[derive(Clone)]
pub struct RelayState {
    /// Configuration
    pub config: Arc<Config>,

    /// Participant id -> socket
    registrations: Arc<RwLock<HashMap<String, Registration>>>,

    /// Symmetric pairing of participants in a call
    pairs: Arc<Mutex<HashMap<String, String>>>,

    /// Relay counters
    pub stats: Arc<Mutex<RelayStats>>,

    next_connection_id: Arc<AtomicU64>,

    /// Server start time
    pub start_time: std::time::Instant,
}

impl std::fmt::Debug for RelayState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RelayState")
            .field("config", &self.config)
            .field("participants", &self.connection_count())
            .field("active_pairs", &self.active_pairs())
            .finish()
    }
}

impl RelayState {
    pub fn new(config: Config) -> Self {
        Self {
            config: Arc::new(config),
            registrations: Arc::new(RwLock::new(HashMap::new())),
            pairs: Arc::new(Mutex::new(HashMap::new())),
            stats: Arc::new(Mutex::new(RelayStats::default())),
            next_connection_id: Arc::new(AtomicU64::new(1)),
            start_time: std::time::Instant::now(),
        }
    }

    /// Allocate an id for a new socket
    pub fn next_connection_id(&self) -> u64 {
        self.next_connection_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Register `user` on a socket. A newer registration replaces an older one.
    pub fn register(&self, user: &str, connection_id: u64, sender: mpsc::UnboundedSender<String>) {
        let previous = self
            .registrations
            .write()
            .insert(user.to_string(), Registration { connection_id, sender });
        if previous.is_some() {
            info!("Participant {} re-registered on connection {}", user, connection_id);
        } else {
            info!("Participant {} registered on connection {}", user, connection_id);
        }
    }

    /// Remove `user` if still registered on `connection_id`, dropping any pairing.
    pub fn unregister(&self, user: &str, connection_id: u64) {
        let mut registrations = self.registrations.write();
        let owned = registrations
            .get(user)
            .map(|r| r.connection_id == connection_id)
            .unwrap_or(false);
        if owned {
            registrations.remove(user);
            drop(registrations);
            self.unpair(user);
            info!("Participant {} disconnected", user);
        }
    }

    pub fn is_online(&self, user: &str) -> bool {
        self.registrations.read().contains_key(user)
    }

    /// Queue a text frame for `user`. Returns false if they are not connected.
    pub fn send_to(&self, user: &str, frame: String) -> bool {
        let sender = self.registrations.read().get(user).map(|r| r.sender.clone());
        match sender {
            Some(sender) if sender.send(frame).is_ok() => {
                self.stats.lock().frames_forwarded += 1;
                true
            }
            _ => false,
        }
    }

    /// Pair two participants, replacing any earlier pairing either had
    pub fn pair(&self, a: &str, b: &str) {
        let mut pairs = self.pairs.lock();
        for user in [a, b] {
            if let Some(old) = pairs.remove(user) {
                pairs.remove(&old);
            }
        }
        pairs.insert(a.to_string(), b.to_string());
        pairs.insert(b.to_string(), a.to_string());
        debug!("Paired {} <-> {}", a, b);
    }

    /// Drop the pairing of `user`, returning the former partner
    pub fn unpair(&self, user: &str) -> Option<String> {
        let mut pairs = self.pairs.lock();
        let partner = pairs.remove(user)?;
        pairs.remove(&partner);
        debug!("Unpaired {} <-> {}", user, partner);
        Some(partner)
    }

    pub fn partner(&self, user: &str) -> Option<String> {
        self.pairs.lock().get(user).cloned()
    }

    /// Get server uptime
    pub fn uptime(&self) -> std::time::Duration {
        self.start_time.elapsed()
    }

    /// Number of registered participants
    pub fn connection_count(&self) -> u64 {
        self.registrations.read().len() as u64
    }

    /// Number of participant pairs in a call
    pub fn active_pairs(&self) -> u64 {
        (self.pairs.lock().len() / 2) as u64
    }

    pub fn stats(&self) -> RelayStats {
        self.stats.lock().clone()
    }
}

/// Relay counters
#[derive(Debug, Clone, Default)]
pub struct RelayStats {
    pub frames_forwarded: u64,
    pub offers: u64,
    pub offline_rejections: u64,
    pub invalid_frames: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_newer_registration_wins() {
        let state = RelayState::new(Config::default());
        let (old_tx, mut old_rx) = mpsc::unbounded_channel();
        let (new_tx, mut new_rx) = mpsc::unbounded_channel();
        state.register("alice", 1, old_tx);
        state.register("alice", 2, new_tx);

        assert!(state.send_to("alice", "hello".to_string()));
        assert_eq!(new_rx.try_recv().unwrap(), "hello");
        assert!(old_rx.try_recv().is_err());

        // stale socket closing does not evict the new one
        state.unregister("alice", 1);
        assert!(state.is_online("alice"));
        state.unregister("alice", 2);
        assert!(!state.is_online("alice"));
    }

    #[test]
    fn test_pairing_is_symmetric_and_exclusive() {
        let state = RelayState::new(Config::default());
        state.pair("alice", "bob");
        assert_eq!(state.partner("bob").as_deref(), Some("alice"));
        state.pair("alice", "carol");
        assert_eq!(state.partner("bob"), None);
        assert_eq!(state.partner("carol").as_deref(), Some("alice"));
        assert_eq!(state.active_pairs(), 1);
        assert_eq!(state.unpair("carol").as_deref(), Some("alice"));
        assert_eq!(state.active_pairs(), 0);
    }

    #[test]
    fn test_disconnect_drops_pairing() {
        let state = RelayState::new(Config::default());
        let (tx, _rx) = mpsc::unbounded_channel();
        state.register("alice", 7, tx);
        state.pair("alice", "bob");
        state.unregister("alice", 7);
        assert_eq!(state.partner("bob"), None);
    }
}
