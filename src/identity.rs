use std::fmt;

use rand::Rng;

/// Opaque 6-byte peer identity, stable for the process lifetime.
///
/// Derived from the first non-loopback interface's hardware address so a
/// node keeps the same id across restarts on the same machine. If no
/// usable interface exists the id is random instead; this only has to be
/// unique within one broadcast domain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PeerId(pub [u8; 6]);

impl PeerId {
    pub fn generate() -> Self {
        match mac_address::get_mac_address() {
            Ok(Some(mac)) => {
                let id = PeerId(mac.bytes());
                tracing::debug!("peer id derived from hardware address: {}", id);
                id
            }
            Ok(None) | Err(_) => {
                let mut bytes = [0u8; 6];
                rand::thread_rng().fill(&mut bytes);
                let id = PeerId(bytes);
                tracing::warn!("no usable hardware address, using random peer id: {}", id);
                id
            }
        }
    }

    pub fn as_bytes(&self) -> &[u8; 6] {
        &self.0
    }
}

impl From<[u8; 6]> for PeerId {
    fn from(bytes: [u8; 6]) -> Self {
        PeerId(bytes)
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}
