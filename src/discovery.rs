use std::io;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use ipnetwork::Ipv4Network;
use tokio::net::UdpSocket;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::config::{Config, MULTICAST_GROUP};
use crate::identity::PeerId;
use crate::jobs::{Job, JobSender};
use crate::packet::{Packet, PacketType};
use crate::registry::PeerRegistry;

/// Advertises this node's presence and learns about other peers.
///
/// One UDP socket bound to the discovery port receives everything; an
/// IPv6 socket joined to the link-local multicast group is preferred, an
/// IPv4 socket is the fallback. Discover packets go out every
/// `broadcast_interval` to every IPv4 interface's broadcast address and to
/// the multicast group; replies and sightings flow into the peer registry
/// and, for newly introduced peers, into the listing client's queue.
pub struct DiscoveryService {
    listener: UdpSocket,
    /// Ephemeral IPv4 socket with SO_BROADCAST; the listener cannot send
    /// subnet broadcasts when it is bound as IPv6.
    v4_sender: Option<UdpSocket>,
    own_id: PeerId,
    /// Port peers listen on; also the port recorded for sighted addresses
    /// and targeted by Available replies (the observed source port is an
    /// ephemeral send port, not something a peer can be reached on).
    port: u16,
    broadcast_interval: Duration,
    registry: Arc<PeerRegistry>,
    listing_jobs: JobSender,
}

impl DiscoveryService {
    pub async fn bind(
        own_id: PeerId,
        config: &Config,
        registry: Arc<PeerRegistry>,
        listing_jobs: JobSender,
    ) -> io::Result<Self> {
        let listener = bind_listener(config.discovery_port).await?;

        let v4_sender = match UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0)).await {
            Ok(sock) => match sock.set_broadcast(true) {
                Ok(()) => Some(sock),
                Err(e) => {
                    tracing::warn!("SO_BROADCAST failed, ipv4 broadcasts disabled: {}", e);
                    None
                }
            },
            Err(e) => {
                tracing::warn!("no ipv4 send socket, ipv4 broadcasts disabled: {}", e);
                None
            }
        };

        Ok(Self {
            listener,
            v4_sender,
            own_id,
            port: config.discovery_port,
            broadcast_interval: config.broadcast_interval(),
            registry,
            listing_jobs,
        })
    }

    pub async fn run(self, cancel: CancellationToken) {
        tracing::info!(
            "discovery service listening on {:?}",
            self.listener.local_addr().ok()
        );

        // The first broadcast goes out one full interval after startup, and
        // each following one is measured from the previous send.
        let mut ticker = interval_at(
            Instant::now() + self.broadcast_interval,
            self.broadcast_interval,
        );
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let mut buf = [0u8; 64];
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => self.broadcast_round().await,
                received = self.listener.recv_from(&mut buf) => match received {
                    Ok((len, src)) => self.handle_datagram(&buf[..len], src).await,
                    Err(e) => tracing::warn!("recv_from failed: {}", e),
                },
            }
        }

        tracing::info!("discovery service ended");
    }

    /// One Discover packet per IPv4 interface broadcast address, plus one to
    /// the IPv6 multicast group. A failed interface walk skips the round.
    async fn broadcast_round(&self) {
        let packet = Packet::discover(self.own_id).encode();

        if let Some(v4_sender) = &self.v4_sender {
            match broadcast_targets(self.port) {
                Ok(targets) => {
                    for target in targets {
                        if let Err(e) = v4_sender.send_to(&packet, target).await {
                            tracing::warn!("broadcast to {} failed: {}", target, e);
                        }
                    }
                }
                Err(e) => tracing::warn!("interface enumeration failed, skipping round: {}", e),
            }
        }

        if self.listener.local_addr().map(|a| a.is_ipv6()).unwrap_or(false) {
            let group = SocketAddr::new(MULTICAST_GROUP.into(), self.port);
            if let Err(e) = self.listener.send_to(&packet, group).await {
                tracing::warn!("multicast to {} failed: {}", group, e);
            }
        }
    }

    async fn handle_datagram(&self, data: &[u8], src: SocketAddr) {
        let Some(packet) = classify(self.own_id, data) else {
            // Malformed, foreign or our own looped-back packet.
            return;
        };

        match packet.packet_type {
            PacketType::Discover => {
                record_sighting(
                    &self.registry,
                    &self.listing_jobs,
                    packet.sender_id,
                    src,
                    self.port,
                );
                // Answer unicast so the sender learns about us without
                // another broadcast; replying to an Available would storm.
                let reply = Packet::available(self.own_id).encode();
                let target = SocketAddr::new(src.ip(), self.port);
                if let Err(e) = self.listener.send_to(&reply, target).await {
                    tracing::warn!("available reply to {} failed: {}", target, e);
                }
            }
            PacketType::Available => {
                record_sighting(
                    &self.registry,
                    &self.listing_jobs,
                    packet.sender_id,
                    src,
                    self.port,
                );
            }
        }
    }
}

/// Prefer an IPv6 listener joined to the multicast group; fall back to
/// plain IPv4 when IPv6 is unavailable. An IPv6 socket bound to `[::]`
/// also picks up IPv4 broadcasts as mapped addresses on dual-stack hosts.
async fn bind_listener(port: u16) -> io::Result<UdpSocket> {
    match UdpSocket::bind((Ipv6Addr::UNSPECIFIED, port)).await {
        Ok(sock) => {
            if let Err(e) = sock.join_multicast_v6(&MULTICAST_GROUP, 0) {
                tracing::warn!("joining multicast group failed: {}", e);
            }
            Ok(sock)
        }
        Err(e) => {
            tracing::warn!("no ipv6 listener could be created ({}), trying ipv4", e);
            UdpSocket::bind((Ipv4Addr::UNSPECIFIED, port)).await
        }
    }
}

/// Decodes a datagram and suppresses our own packets; broadcast and
/// multicast loop back on many network stacks.
fn classify(own_id: PeerId, data: &[u8]) -> Option<Packet> {
    let packet = Packet::decode(data)?;
    if packet.sender_id == own_id {
        return None;
    }
    Some(packet)
}

/// The peer-seen protocol. A `PeerSeen` job goes out only while the id is
/// still unknown to the registry, so the listing client walks a peer once
/// per introduction instead of once per packet. The registry update itself
/// is unconditional: it inserts the address or refreshes its timestamp.
fn record_sighting(
    registry: &PeerRegistry,
    listing_jobs: &JobSender,
    peer_id: PeerId,
    src: SocketAddr,
    port: u16,
) {
    let seen = SystemTime::now();
    let addr = SocketAddr::new(src.ip().to_canonical(), port);
    if !registry.contains(peer_id) {
        tracing::info!("new peer {} at {}", peer_id, addr);
        listing_jobs.send(Job::PeerSeen { peer_id, addr, seen });
    }
    registry.add_address(peer_id, addr, seen);
}

/// Per-interface broadcast destinations: `address | !netmask` for every
/// interface with a usable IPv4 address and netmask.
fn broadcast_targets(port: u16) -> io::Result<Vec<SocketAddr>> {
    let mut targets = Vec::new();
    for iface in if_addrs::get_if_addrs()? {
        if let if_addrs::IfAddr::V4(v4) = iface.addr {
            if let Some(broadcast) = broadcast_address(v4.ip, v4.netmask) {
                targets.push(SocketAddr::new(broadcast.into(), port));
            }
        }
    }
    Ok(targets)
}

fn broadcast_address(addr: Ipv4Addr, netmask: Ipv4Addr) -> Option<Ipv4Addr> {
    Ipv4Network::with_netmask(addr, netmask)
        .ok()
        .map(|network| network.broadcast())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs;
    use crate::packet::PACKET_LEN;

    const OWN: PeerId = PeerId([1, 1, 1, 1, 1, 1]);
    const OTHER: PeerId = PeerId([0xaa, 0xbb, 0xcc, 0xdd, 0xee, 0xff]);

    fn src(port: u16) -> SocketAddr {
        SocketAddr::new(Ipv4Addr::new(192, 168, 1, 7).into(), port)
    }

    async fn test_service(
        reply_port: u16,
        registry: Arc<PeerRegistry>,
        listing_jobs: JobSender,
    ) -> DiscoveryService {
        DiscoveryService {
            listener: UdpSocket::bind("127.0.0.1:0").await.unwrap(),
            v4_sender: None,
            own_id: OWN,
            port: reply_port,
            broadcast_interval: Duration::from_secs(10),
            registry,
            listing_jobs,
        }
    }

    #[test]
    fn broadcast_address_math() {
        assert_eq!(
            broadcast_address(
                Ipv4Addr::new(192, 168, 1, 57),
                Ipv4Addr::new(255, 255, 255, 0)
            ),
            Some(Ipv4Addr::new(192, 168, 1, 255))
        );
        assert_eq!(
            broadcast_address(Ipv4Addr::new(10, 2, 3, 4), Ipv4Addr::new(255, 0, 0, 0)),
            Some(Ipv4Addr::new(10, 255, 255, 255))
        );
        // A non-contiguous mask is not a usable netmask.
        assert_eq!(
            broadcast_address(Ipv4Addr::new(10, 2, 3, 4), Ipv4Addr::new(255, 0, 255, 0)),
            None
        );
    }

    #[test]
    fn own_packets_are_suppressed() {
        let own = Packet::discover(OWN).encode();
        assert_eq!(classify(OWN, &own), None);
        let own = Packet::available(OWN).encode();
        assert_eq!(classify(OWN, &own), None);

        let other = Packet::discover(OTHER).encode();
        assert_eq!(classify(OWN, &other), Some(Packet::discover(OTHER)));
    }

    #[test]
    fn malformed_datagrams_are_dropped() {
        assert_eq!(classify(OWN, b""), None);
        assert_eq!(classify(OWN, &[0u8; PACKET_LEN]), None);
        assert_eq!(classify(OWN, b"hello there, anyone"), None);
    }

    #[test]
    fn sighting_emits_one_job_per_introduction() {
        let registry = PeerRegistry::new();
        let (tx, mut rx) = jobs::queue();

        record_sighting(&registry, &tx, OTHER, src(54321), 44700);
        record_sighting(&registry, &tx, OTHER, src(54322), 44700);

        match rx.try_recv().unwrap() {
            Job::PeerSeen { peer_id, addr, .. } => {
                assert_eq!(peer_id, OTHER);
                // The recorded address carries the discovery port, not the
                // ephemeral source port.
                assert_eq!(addr, src(44700));
            }
            other => panic!("unexpected job {:?}", other),
        }
        // The second sighting refreshed the registry but emitted no job.
        assert!(rx.try_recv().is_err());
        assert!(registry.contains(OTHER));
    }

    #[tokio::test]
    async fn discover_gets_an_available_reply_and_registers_the_sender() {
        let remote = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let remote_addr = remote.local_addr().unwrap();

        let registry = Arc::new(PeerRegistry::new());
        let (tx, mut rx) = jobs::queue();
        // Replies are addressed to the "discovery port", which in this test
        // is wherever the remote socket lives.
        let service = test_service(remote_addr.port(), Arc::clone(&registry), tx).await;

        let discover = Packet::discover(OTHER).encode();
        service.handle_datagram(&discover, remote_addr).await;

        let mut buf = [0u8; 64];
        let (len, _) = remote.recv_from(&mut buf).await.unwrap();
        assert_eq!(Packet::decode(&buf[..len]), Some(Packet::available(OWN)));

        assert!(registry.contains(OTHER));
        assert!(matches!(rx.try_recv(), Ok(Job::PeerSeen { peer_id, .. }) if peer_id == OTHER));
    }

    #[tokio::test]
    async fn available_is_recorded_without_a_reply() {
        let remote = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let remote_addr = remote.local_addr().unwrap();

        let registry = Arc::new(PeerRegistry::new());
        let (tx, _rx) = jobs::queue();
        let service = test_service(remote_addr.port(), Arc::clone(&registry), tx).await;

        let available = Packet::available(OTHER).encode();
        service.handle_datagram(&available, remote_addr).await;
        assert!(registry.contains(OTHER));

        // No reply may arrive; give the socket a moment to prove it.
        let mut buf = [0u8; 64];
        let reply = tokio::time::timeout(Duration::from_millis(100), remote.recv_from(&mut buf));
        assert!(reply.await.is_err());
    }
}
