//! Fused transport: one logical channel per robot identity.
//!
//! A robot may be reachable over USB serial, over the UDP broadcast domain,
//! or both at once. Both links surface the same [`LinkEvent`] stream; this
//! module merges them into per-identifier [`FusedChannel`]s so the session
//! core never cares which path a robot is on. Serial is preferred for writes
//! when bound: it is local and lossless, UDP is the fallback for
//! network-only robots.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use edmo_proto::Command;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tracing::debug;

use crate::serial_link::{SerialConfig, SerialLink};
use crate::udp_link::{UdpConfig, UdpLink};

// ── Link surface shared by both transports ────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkKind {
    Serial,
    Udp,
}

/// Write path to one endpoint. The two transports share only this capability
/// plus the event surface, so a tagged variant is all the fusion needs.
#[derive(Debug, Clone)]
pub enum EndpointHandle {
    /// Queue into the port's writer task; dropped silently once the port died.
    Serial(mpsc::UnboundedSender<Vec<u8>>),
    /// Datagram to the peer's source address over the shared socket.
    Udp {
        socket: Arc<UdpSocket>,
        addr: SocketAddr,
    },
}

impl EndpointHandle {
    pub fn kind(&self) -> LinkKind {
        match self {
            Self::Serial(_) => LinkKind::Serial,
            Self::Udp { .. } => LinkKind::Udp,
        }
    }

    pub fn write(&self, bytes: &[u8]) {
        match self {
            Self::Serial(tx) => {
                let _ = tx.send(bytes.to_vec());
            }
            Self::Udp { socket, addr } => {
                if let Err(e) = socket.try_send_to(bytes, *addr) {
                    debug!("udp write to {addr} failed: {e}");
                }
            }
        }
    }
}

/// Event stream produced by each transport and consumed by the fusion layer.
#[derive(Debug)]
pub enum LinkEvent {
    Connected {
        identifier: String,
        endpoint: EndpointHandle,
    },
    Disconnected {
        identifier: String,
        kind: LinkKind,
    },
    Frame {
        identifier: String,
        command: Command,
    },
}

// ── Fused channel ─────────────────────────────────────────────────────────────

#[derive(Debug, Default)]
struct Slots {
    serial: Option<EndpointHandle>,
    udp: Option<EndpointHandle>,
}

/// The per-identifier channel handed to sessions. Connected iff at least one
/// endpoint is bound; writes with no endpoint bound are dropped here so the
/// session tick never has to care.
#[derive(Debug)]
pub struct FusedChannel {
    identifier: String,
    slots: Mutex<Slots>,
}

impl FusedChannel {
    pub fn new(identifier: impl Into<String>) -> Self {
        Self {
            identifier: identifier.into(),
            slots: Mutex::new(Slots::default()),
        }
    }

    pub fn identifier(&self) -> &str {
        &self.identifier
    }

    pub fn has_connection(&self) -> bool {
        let slots = self.slots.lock().expect("slots lock poisoned");
        slots.serial.is_some() || slots.udp.is_some()
    }

    /// Serial when bound, else UDP, else dropped.
    pub fn write(&self, bytes: &[u8]) {
        let slots = self.slots.lock().expect("slots lock poisoned");
        if let Some(endpoint) = slots.serial.as_ref().or(slots.udp.as_ref()) {
            endpoint.write(bytes);
        }
    }

    pub fn bind(&self, endpoint: EndpointHandle) {
        let mut slots = self.slots.lock().expect("slots lock poisoned");
        match endpoint.kind() {
            LinkKind::Serial => slots.serial = Some(endpoint),
            LinkKind::Udp => slots.udp = Some(endpoint),
        }
    }

    pub fn unbind(&self, kind: LinkKind) {
        let mut slots = self.slots.lock().expect("slots lock poisoned");
        match kind {
            LinkKind::Serial => slots.serial = None,
            LinkKind::Udp => slots.udp = None,
        }
    }
}

// ── Fusion layer ──────────────────────────────────────────────────────────────

/// What the supervisor sees: robot-level connectivity changes and inbound
/// frames, already keyed by identity.
#[derive(Debug)]
pub enum FusedEvent {
    EdmoConnected(Arc<FusedChannel>),
    EdmoDisconnected(Arc<FusedChannel>),
    Frame {
        identifier: String,
        command: Command,
    },
}

pub struct FusedTransport {
    serial: SerialLink,
    udp: UdpLink,
    channels: HashMap<String, Arc<FusedChannel>>,
}

impl FusedTransport {
    pub async fn new(serial: SerialConfig, udp: UdpConfig) -> anyhow::Result<Self> {
        Ok(Self {
            serial: SerialLink::new(serial),
            udp: UdpLink::new(udp).await?,
            channels: HashMap::new(),
        })
    }

    pub fn channel(&self, identifier: &str) -> Option<Arc<FusedChannel>> {
        self.channels.get(identifier).cloned()
    }

    /// Drop a channel once both endpoints are gone. No-op while either link
    /// still holds the identity.
    pub fn remove_if_dead(&mut self, identifier: &str) {
        if let Some(channel) = self.channels.get(identifier) {
            if !channel.has_connection() {
                self.channels.remove(identifier);
            }
        }
    }

    /// One transport tick: serial port scan plus UDP discovery and reaping,
    /// merged into robot-level events.
    pub async fn update(&mut self) -> Vec<FusedEvent> {
        let mut events = Vec::new();
        for event in self.serial.update().await {
            self.apply(event, &mut events);
        }
        for event in self.udp.update() {
            self.apply(event, &mut events);
        }
        events
    }

    fn apply(&mut self, event: LinkEvent, out: &mut Vec<FusedEvent>) {
        match event {
            LinkEvent::Connected {
                identifier,
                endpoint,
            } => {
                let channel = self
                    .channels
                    .entry(identifier.clone())
                    .or_insert_with(|| Arc::new(FusedChannel::new(identifier)))
                    .clone();
                let previously_connected = channel.has_connection();
                channel.bind(endpoint);
                if !previously_connected {
                    out.push(FusedEvent::EdmoConnected(channel));
                }
            }
            LinkEvent::Disconnected { identifier, kind } => {
                if let Some(channel) = self.channels.get(&identifier) {
                    channel.unbind(kind);
                    if !channel.has_connection() {
                        out.push(FusedEvent::EdmoDisconnected(channel.clone()));
                    }
                }
            }
            LinkEvent::Frame {
                identifier,
                command,
            } => {
                out.push(FusedEvent::Frame {
                    identifier,
                    command,
                });
            }
        }
    }

    pub fn close(&mut self) {
        self.serial.close();
        self.udp.close();
        self.channels.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn serial_endpoint() -> (EndpointHandle, mpsc::UnboundedReceiver<Vec<u8>>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (EndpointHandle::Serial(tx), rx)
    }

    async fn udp_endpoint() -> (EndpointHandle, UdpSocket) {
        let receiver = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let sender = Arc::new(UdpSocket::bind("127.0.0.1:0").await.unwrap());
        let endpoint = EndpointHandle::Udp {
            socket: sender,
            addr: receiver.local_addr().unwrap(),
        };
        (endpoint, receiver)
    }

    #[tokio::test]
    async fn writes_prefer_serial_when_both_are_bound() {
        let channel = FusedChannel::new("R1");
        let (serial, mut serial_rx) = serial_endpoint();
        let (udp, udp_receiver) = udp_endpoint().await;
        channel.bind(serial);
        channel.bind(udp);

        channel.write(b"ping");

        assert_eq!(serial_rx.try_recv().unwrap(), b"ping");
        let mut buf = [0u8; 16];
        assert!(udp_receiver.try_recv(&mut buf).is_err(), "UDP must stay idle");
    }

    #[tokio::test]
    async fn failover_to_udp_without_losing_the_channel() {
        let channel = FusedChannel::new("R1");
        let (serial, serial_rx) = serial_endpoint();
        let (udp, udp_receiver) = udp_endpoint().await;
        channel.bind(serial);
        channel.bind(udp);
        drop(serial_rx); // serial host gone

        channel.unbind(LinkKind::Serial);
        assert!(channel.has_connection());

        channel.write(b"fallback");
        let mut buf = [0u8; 16];
        let len = udp_receiver.recv(&mut buf).await.unwrap();
        assert_eq!(&buf[..len], b"fallback");
    }

    #[test]
    fn write_with_no_endpoint_is_dropped() {
        let channel = FusedChannel::new("R1");
        assert!(!channel.has_connection());
        channel.write(b"nobody home");
    }

    #[tokio::test]
    async fn losing_one_of_two_endpoints_is_not_a_disconnect() {
        let udp = UdpLink::new(UdpConfig::loopback()).await.unwrap();
        let mut transport = FusedTransport {
            serial: SerialLink::new(SerialConfig::default()),
            udp,
            channels: HashMap::new(),
        };

        let (serial, _serial_rx) = serial_endpoint();
        let (udp_ep, _udp_receiver) = udp_endpoint().await;

        let mut out = Vec::new();
        transport.apply(
            LinkEvent::Connected {
                identifier: "R1".into(),
                endpoint: serial,
            },
            &mut out,
        );
        transport.apply(
            LinkEvent::Connected {
                identifier: "R1".into(),
                endpoint: udp_ep,
            },
            &mut out,
        );
        assert!(matches!(out.as_slice(), [FusedEvent::EdmoConnected(_)]));

        out.clear();
        transport.apply(
            LinkEvent::Disconnected {
                identifier: "R1".into(),
                kind: LinkKind::Serial,
            },
            &mut out,
        );
        assert!(out.is_empty(), "channel still has UDP, no disconnect event");
        assert!(transport.channel("R1").unwrap().has_connection());

        out.clear();
        transport.apply(
            LinkEvent::Disconnected {
                identifier: "R1".into(),
                kind: LinkKind::Udp,
            },
            &mut out,
        );
        assert!(matches!(out.as_slice(), [FusedEvent::EdmoDisconnected(_)]));
        transport.remove_if_dead("R1");
        assert!(transport.channel("R1").is_none());
    }
}
