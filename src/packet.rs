use crate::identity::PeerId;

/// Fixed 8-byte protocol magic; anything else on the discovery port is
/// somebody else's traffic.
pub const MAGIC: &[u8; 8] = b"P2PFSYNC";

/// Exact size of a discovery datagram: magic + type + sender id.
pub const PACKET_LEN: usize = 15;

const TYPE_DISCOVER: u8 = 10;
const TYPE_AVAILABLE: u8 = 11;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketType {
    /// Broadcast/multicast announcement of presence.
    Discover,
    /// Unicast reply to a Discover, announcing reachability.
    Available,
}

/// One discovery datagram. The layout is byte-exact so independent
/// implementations interoperate: 8 bytes magic, 1 byte type, 6 bytes id.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Packet {
    pub packet_type: PacketType,
    pub sender_id: PeerId,
}

impl Packet {
    pub fn discover(sender_id: PeerId) -> Self {
        Packet { packet_type: PacketType::Discover, sender_id }
    }

    pub fn available(sender_id: PeerId) -> Self {
        Packet { packet_type: PacketType::Available, sender_id }
    }

    pub fn encode(&self) -> [u8; PACKET_LEN] {
        let mut buf = [0u8; PACKET_LEN];
        buf[..8].copy_from_slice(MAGIC);
        buf[8] = match self.packet_type {
            PacketType::Discover => TYPE_DISCOVER,
            PacketType::Available => TYPE_AVAILABLE,
        };
        buf[9..].copy_from_slice(self.sender_id.as_bytes());
        buf
    }

    /// Decodes a datagram. Returns `None` for anything that is not a valid
    /// packet: wrong length, wrong magic or an unknown type byte. Malformed
    /// datagrams carry no information worth reporting, callers drop them.
    pub fn decode(data: &[u8]) -> Option<Self> {
        if data.len() != PACKET_LEN || &data[..8] != MAGIC {
            return None;
        }
        let packet_type = match data[8] {
            TYPE_DISCOVER => PacketType::Discover,
            TYPE_AVAILABLE => PacketType::Available,
            _ => return None,
        };
        let mut id = [0u8; 6];
        id.copy_from_slice(&data[9..15]);
        Some(Packet { packet_type, sender_id: PeerId(id) })
    }
}
