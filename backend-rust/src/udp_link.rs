//! UDP transport: network-attached robots.
//!
//! One datagram socket serves the whole broadcast domain. Every tick it
//! shouts an `IDENTIFY` probe at the broadcast address; robots answer with
//! their identifier, which makes them peers keyed by source address. A peer
//! that stays silent past the stale threshold is reaped. Delivery is
//! best-effort — this is the fallback path for robots without a USB cable.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use edmo_proto::{encode, try_parse, Instruction};
use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::fused::{EndpointHandle, LinkEvent, LinkKind};

// ── Configuration ─────────────────────────────────────────────────────────────

pub struct UdpConfig {
    pub bind_addr: SocketAddr,
    /// Where the IDENTIFY probe goes; robots listen on this port.
    pub broadcast_addr: SocketAddr,
    /// Peers silent for longer than this are reaped.
    pub stale_after: Duration,
}

impl Default for UdpConfig {
    fn default() -> Self {
        let bind_port = std::env::var("EDMO_UDP_PORT")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(2122);
        let broadcast = std::env::var("EDMO_UDP_BROADCAST")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or_else(|| "255.255.255.255:2121".parse().expect("literal addr"));
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], bind_port)),
            broadcast_addr: broadcast,
            stale_after: Duration::from_secs(5),
        }
    }
}

impl UdpConfig {
    /// Loopback preset: ephemeral local port, probe aimed at `target`.
    /// Used by the simulator harness and tests.
    pub fn loopback_to(target: SocketAddr) -> Self {
        Self {
            bind_addr: "127.0.0.1:0".parse().expect("literal addr"),
            broadcast_addr: target,
            stale_after: Duration::from_secs(5),
        }
    }

    /// Loopback preset with a throwaway probe target.
    pub fn loopback() -> Self {
        Self::loopback_to("127.0.0.1:1".parse().expect("literal addr"))
    }
}

// ── Link ──────────────────────────────────────────────────────────────────────

struct UdpPeer {
    identifier: String,
    last_seen: Instant,
}

pub struct UdpLink {
    socket: Arc<UdpSocket>,
    peers: HashMap<SocketAddr, UdpPeer>,
    inbound_rx: mpsc::UnboundedReceiver<(Vec<u8>, SocketAddr)>,
    recv_task: JoinHandle<()>,
    config: UdpConfig,
}

impl UdpLink {
    /// Bind the shared socket. This is the one startup step that may
    /// legitimately abort the process: without it no networked robot is
    /// reachable.
    pub async fn new(config: UdpConfig) -> anyhow::Result<Self> {
        // Reuse-address and broadcast have to be set before the bind, so the
        // socket is built with socket2 and then handed to tokio.
        let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
        socket.set_reuse_address(true)?;
        socket.set_broadcast(true)?;
        socket.set_nonblocking(true)?;
        socket.bind(&config.bind_addr.into())?;
        let socket = Arc::new(UdpSocket::from_std(socket.into())?);

        info!("📡 UDP link listening on {}", socket.local_addr()?);

        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let recv_socket = socket.clone();
        let recv_task = tokio::spawn(async move {
            let mut buf = vec![0u8; 2048];
            loop {
                match recv_socket.recv_from(&mut buf).await {
                    Ok((len, src)) => {
                        if inbound_tx.send((buf[..len].to_vec(), src)).is_err() {
                            break;
                        }
                    }
                    Err(e) => warn!("udp: recv error: {e}"),
                }
            }
        });

        Ok(Self {
            socket,
            peers: HashMap::new(),
            inbound_rx,
            recv_task,
            config,
        })
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.socket.local_addr().ok()
    }

    /// One tick: probe the broadcast domain, take in whatever arrived, reap
    /// the silent.
    pub fn update(&mut self) -> Vec<LinkEvent> {
        let mut events = Vec::new();

        let probe = encode(Instruction::Identify, b"");
        if let Err(e) = self.socket.try_send_to(&probe, self.config.broadcast_addr) {
            debug!("udp: discovery broadcast failed: {e}");
        }

        while let Ok((data, src)) = self.inbound_rx.try_recv() {
            self.on_datagram(data, src, &mut events);
        }

        let stale: Vec<SocketAddr> = self
            .peers
            .iter()
            .filter(|(_, peer)| peer.last_seen.elapsed() > self.config.stale_after)
            .map(|(addr, _)| *addr)
            .collect();
        for addr in stale {
            if let Some(peer) = self.peers.remove(&addr) {
                info!("udp: robot {} at {addr} timed out", peer.identifier);
                events.push(LinkEvent::Disconnected {
                    identifier: peer.identifier,
                    kind: LinkKind::Udp,
                });
            }
        }

        events
    }

    fn on_datagram(&mut self, data: Vec<u8>, src: SocketAddr, out: &mut Vec<LinkEvent>) {
        let command = try_parse(&data);
        match self.peers.get_mut(&src) {
            None => {
                // Only an identification can introduce a new peer; anything
                // else from an unknown source is dropped.
                if command.instruction != Instruction::Identify {
                    return;
                }
                let identifier = String::from_utf8_lossy(&command.data).trim().to_string();
                info!("udp: robot {identifier} discovered at {src}");
                self.peers.insert(
                    src,
                    UdpPeer {
                        identifier: identifier.clone(),
                        last_seen: Instant::now(),
                    },
                );
                out.push(LinkEvent::Connected {
                    identifier,
                    endpoint: EndpointHandle::Udp {
                        socket: self.socket.clone(),
                        addr: src,
                    },
                });
            }
            Some(peer) => {
                peer.last_seen = Instant::now();
                out.push(LinkEvent::Frame {
                    identifier: peer.identifier.clone(),
                    command,
                });
            }
        }
    }

    pub fn close(&mut self) {
        self.recv_task.abort();
        self.peers.clear();
    }
}

impl Drop for UdpLink {
    fn drop(&mut self) {
        self.recv_task.abort();
    }
}
