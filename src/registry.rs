use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Mutex;
use std::time::SystemTime;

use crate::identity::PeerId;

#[derive(Debug, Clone)]
pub struct AddressEntry {
    pub addr: SocketAddr,
    pub last_seen: SystemTime,
}

/// Shared store of every peer this node has seen and the addresses it was
/// seen under. This is the single synchronization point between the
/// services, so all operations keep their critical section short and the
/// lock is never held across network I/O.
///
/// Peers are never evicted automatically; `remove` and `clear` exist for
/// explicit lifecycle only.
#[derive(Debug, Default)]
pub struct PeerRegistry {
    peers: Mutex<HashMap<PeerId, Vec<AddressEntry>>>,
}

impl PeerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a sighting of `id` under `addr`. Creates the peer record on
    /// first sighting. A peer keeps one entry per distinct IP; re-sighting
    /// a known IP only refreshes its timestamp, so repeated identical calls
    /// are idempotent. IPv4-mapped IPv6 addresses are canonicalized to IPv4
    /// so the best-address preference below does not mistake them for real
    /// IPv6 reachability.
    pub fn add_address(&self, id: PeerId, addr: SocketAddr, last_seen: SystemTime) {
        let addr = SocketAddr::new(addr.ip().to_canonical(), addr.port());
        let mut peers = self.peers.lock().unwrap();
        let entries = peers.entry(id).or_default();
        match entries.iter_mut().find(|e| e.addr.ip() == addr.ip()) {
            Some(entry) => entry.last_seen = last_seen,
            None => entries.push(AddressEntry { addr, last_seen }),
        }
    }

    pub fn contains(&self, id: PeerId) -> bool {
        self.peers.lock().unwrap().contains_key(&id)
    }

    /// The preferred address for a peer: its first IPv6 entry if it has
    /// one, else its first IPv4 entry. A dual-stack peer is reached over
    /// the richer protocol without any explicit ranking field.
    pub fn best_address(&self, id: PeerId) -> Option<SocketAddr> {
        let peers = self.peers.lock().unwrap();
        let entries = peers.get(&id)?;
        entries
            .iter()
            .find(|e| e.addr.is_ipv6())
            .or_else(|| entries.iter().find(|e| e.addr.is_ipv4()))
            .map(|e| e.addr)
    }

    pub fn remove(&self, id: PeerId) {
        self.peers.lock().unwrap().remove(&id);
    }

    pub fn clear(&self) {
        self.peers.lock().unwrap().clear();
    }

    pub fn len(&self) -> usize {
        self.peers.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.lock().unwrap().is_empty()
    }

    /// Dumps the registry through the logger. Holds the lock while
    /// iterating; callers must not re-enter registry operations from here.
    pub fn log_peers(&self) {
        let peers = self.peers.lock().unwrap();
        tracing::info!("registry holds {} peer(s)", peers.len());
        for (id, entries) in peers.iter() {
            let addresses: Vec<String> = entries.iter().map(|e| e.addr.to_string()).collect();
            tracing::info!("  [{}] {}", id, addresses.join(", "));
        }
    }
}
