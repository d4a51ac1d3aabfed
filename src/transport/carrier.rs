//! Wire-level endpoints (§6.1). Every carrier wraps one `UdpSocket`; what
//! differs is how a send resolves its destination set. `Multicast` and
//! `Broadcast` resolve to one fixed group address; `Udp` resolves to a
//! fixed peer list; the registry carriers resolve against a membership
//! table learned from a rendezvous server (§9, grounded in madara's
//! `UdpRegistryServer.cpp`/`UdpRegistryClient.cpp`).

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::UdpSocket;

use crate::error::{KnowledgeError, Result};

use super::registry::{RegistryClient, RegistryServer};
use super::settings::{CarrierType, TransportSettings};

pub enum Carrier {
    Multicast { socket: UdpSocket, group: SocketAddr },
    Broadcast { socket: UdpSocket, addr: SocketAddr },
    Udp { socket: UdpSocket, peers: Vec<SocketAddr> },
    RegistryServer { socket: UdpSocket, registry: Arc<RegistryServer> },
    RegistryClient { socket: UdpSocket, registry: Arc<RegistryClient> },
}

impl Carrier {
    /// Binds the local socket named by `settings.hosts[0]` and resolves
    /// whatever else the carrier type needs from the remaining hosts.
    pub async fn bind(settings: &TransportSettings) -> Result<Self> {
        let bind_addr = settings
            .hosts
            .first()
            .ok_or_else(|| KnowledgeError::Transport("transport settings have no hosts".into()))?;

        match settings.carrier_type {
            CarrierType::None => Err(KnowledgeError::Transport("carrier type is None, nothing to bind".into())),
            CarrierType::Multicast => {
                let group: SocketAddr = bind_addr
                    .parse()
                    .map_err(|e| KnowledgeError::Transport(format!("bad multicast group {bind_addr}: {e}")))?;
                let socket = UdpSocket::bind((if group.is_ipv4() { "0.0.0.0" } else { "::" }, group.port()))
                    .await
                    .map_err(KnowledgeError::Io)?;
                match group {
                    SocketAddr::V4(v4) => socket.join_multicast_v4(*v4.ip(), std::net::Ipv4Addr::UNSPECIFIED).map_err(KnowledgeError::Io)?,
                    SocketAddr::V6(v6) => socket.join_multicast_v6(v6.ip(), 0).map_err(KnowledgeError::Io)?,
                }
                Ok(Carrier::Multicast { socket, group })
            }
            CarrierType::Broadcast => {
                let addr: SocketAddr = bind_addr
                    .parse()
                    .map_err(|e| KnowledgeError::Transport(format!("bad broadcast addr {bind_addr}: {e}")))?;
                let socket = UdpSocket::bind(("0.0.0.0", addr.port())).await.map_err(KnowledgeError::Io)?;
                socket.set_broadcast(true).map_err(KnowledgeError::Io)?;
                Ok(Carrier::Broadcast { socket, addr })
            }
            CarrierType::Udp => {
                let socket = UdpSocket::bind(bind_addr).await.map_err(KnowledgeError::Io)?;
                let mut peers = Vec::new();
                for host in &settings.hosts[1..] {
                    peers.push(
                        host.parse()
                            .map_err(|e| KnowledgeError::Transport(format!("bad peer address {host}: {e}")))?,
                    );
                }
                Ok(Carrier::Udp { socket, peers })
            }
            CarrierType::RegistryServer => {
                let socket = UdpSocket::bind(bind_addr).await.map_err(KnowledgeError::Io)?;
                Ok(Carrier::RegistryServer { socket, registry: Arc::new(RegistryServer::new()) })
            }
            CarrierType::RegistryClient => {
                let socket = UdpSocket::bind(bind_addr).await.map_err(KnowledgeError::Io)?;
                let server_addr: SocketAddr = settings
                    .hosts
                    .get(1)
                    .ok_or_else(|| KnowledgeError::Transport("registry client needs hosts[1] = server address".into()))?
                    .parse()
                    .map_err(|e| KnowledgeError::Transport(format!("bad registry server address: {e}")))?;
                Ok(Carrier::RegistryClient {
                    socket,
                    registry: Arc::new(RegistryClient::new(server_addr, settings.originator_id.clone())),
                })
            }
        }
    }

    /// Every address this send should reach, resolved fresh each call so a
    /// registry carrier's membership stays current.
    pub fn destinations(&self) -> Vec<SocketAddr> {
        match self {
            Carrier::Multicast { group, .. } => vec![*group],
            Carrier::Broadcast { addr, .. } => vec![*addr],
            Carrier::Udp { peers, .. } => peers.clone(),
            Carrier::RegistryServer { registry, .. } => registry.snapshot(),
            Carrier::RegistryClient { registry, .. } => registry.known_peers(),
        }
    }

    pub async fn send_to_all(&self, bytes: &[u8]) -> Result<usize> {
        let socket = self.socket();
        let mut sent = 0;
        for addr in self.destinations() {
            sent += socket.send_to(bytes, addr).await.map_err(KnowledgeError::Io)?;
        }
        Ok(sent)
    }

    pub async fn recv_from(&self, buf: &mut [u8]) -> Result<(usize, SocketAddr)> {
        let (len, addr) = self.socket().recv_from(buf).await.map_err(KnowledgeError::Io)?;
        match self {
            Carrier::RegistryServer { registry, .. } => {
                if let Some(reply) = registry.handle_packet(addr, &buf[..len]) {
                    let _ = self.socket().send_to(&reply, addr).await;
                }
            }
            Carrier::RegistryClient { registry, .. } => registry.handle_packet(&buf[..len]),
            _ => {}
        }
        Ok((len, addr))
    }

    /// A registry client re-announces itself; other carriers are no-ops.
    pub async fn heartbeat(&self) -> Result<()> {
        if let Carrier::RegistryClient { socket, registry } = self {
            let packet = registry.announce_packet();
            socket.send_to(&packet, registry.server_addr()).await.map_err(KnowledgeError::Io)?;
        }
        Ok(())
    }

    fn socket(&self) -> &UdpSocket {
        match self {
            Carrier::Multicast { socket, .. }
            | Carrier::Broadcast { socket, .. }
            | Carrier::Udp { socket, .. }
            | Carrier::RegistryServer { socket, .. }
            | Carrier::RegistryClient { socket, .. } => socket,
        }
    }
}
