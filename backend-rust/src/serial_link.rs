//! Serial transport: USB-attached robots.
//!
//! Every tick the link re-scans the OS serial ports and opens each one whose
//! USB product string matches the configured device label. A freshly opened
//! port is probed with an `IDENTIFY` frame; the first complete frame coming
//! back carries the robot identifier. Until then the endpoint is inert: it
//! surfaces no events, and a port that dies while still identifying
//! disappears silently.

use std::collections::HashMap;

use edmo_proto::{encode, Command, FrameScanner, Instruction};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio::task::{JoinHandle, JoinSet};
use tokio_serial::{SerialPortBuilderExt, SerialPortType, SerialStream};
use tracing::{debug, info, warn};

use crate::fused::{EndpointHandle, LinkEvent, LinkKind};

// ── Configuration ─────────────────────────────────────────────────────────────

pub struct SerialConfig {
    /// USB product string that marks a robot board.
    pub device_label: String,
    pub baud_rate: u32,
}

impl Default for SerialConfig {
    fn default() -> Self {
        Self {
            device_label: std::env::var("EDMO_SERIAL_LABEL")
                .unwrap_or_else(|_| "Feather M0".to_string()),
            baud_rate: std::env::var("EDMO_SERIAL_BAUD")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(9600),
        }
    }
}

// ── Per-port state ────────────────────────────────────────────────────────────

/// Ready once the identification handshake completed.
enum PortPhase {
    Identifying,
    Ready { identifier: String },
}

struct OpenPort {
    phase: PortPhase,
    writer: mpsc::UnboundedSender<Vec<u8>>,
    reader: JoinHandle<()>,
}

/// Raised by the per-port read tasks, consumed during `update`.
enum PortEvent {
    Identified { device: String, identifier: String },
    Frame { device: String, command: Command },
    Closed { device: String },
}

// ── Link ──────────────────────────────────────────────────────────────────────

pub struct SerialLink {
    config: SerialConfig,
    ports: HashMap<String, OpenPort>,
    events_tx: mpsc::UnboundedSender<PortEvent>,
    events_rx: mpsc::UnboundedReceiver<PortEvent>,
}

impl SerialLink {
    pub fn new(config: SerialConfig) -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        Self {
            config,
            ports: HashMap::new(),
            events_tx,
            events_rx,
        }
    }

    /// One tick: surface whatever the port tasks reported, then rescan and
    /// open any newly attached robots (opens run concurrently and are all
    /// awaited before returning).
    pub async fn update(&mut self) -> Vec<LinkEvent> {
        let mut events = Vec::new();

        while let Ok(event) = self.events_rx.try_recv() {
            self.handle_port_event(event, &mut events);
        }

        self.scan_for_ports().await;
        events
    }

    fn handle_port_event(&mut self, event: PortEvent, out: &mut Vec<LinkEvent>) {
        match event {
            PortEvent::Identified { device, identifier } => {
                let Some(port) = self.ports.get_mut(&device) else {
                    return;
                };
                info!("serial: {device} identified as robot {identifier}");
                port.phase = PortPhase::Ready {
                    identifier: identifier.clone(),
                };
                out.push(LinkEvent::Connected {
                    identifier,
                    endpoint: EndpointHandle::Serial(port.writer.clone()),
                });
            }
            PortEvent::Frame { device, command } => {
                if let Some(OpenPort {
                    phase: PortPhase::Ready { identifier },
                    ..
                }) = self.ports.get(&device)
                {
                    out.push(LinkEvent::Frame {
                        identifier: identifier.clone(),
                        command,
                    });
                }
            }
            PortEvent::Closed { device } => {
                let Some(port) = self.ports.remove(&device) else {
                    return;
                };
                match port.phase {
                    PortPhase::Ready { identifier } => {
                        info!("serial: {device} ({identifier}) closed");
                        out.push(LinkEvent::Disconnected {
                            identifier,
                            kind: LinkKind::Serial,
                        });
                    }
                    // Never identified: it was never announced either.
                    PortPhase::Identifying => debug!("serial: {device} closed while identifying"),
                }
            }
        }
    }

    async fn scan_for_ports(&mut self) {
        let label = self.config.device_label.clone();
        let listing = tokio::task::spawn_blocking(tokio_serial::available_ports).await;
        let ports = match listing {
            Ok(Ok(ports)) => ports,
            Ok(Err(e)) => {
                debug!("serial: port enumeration failed: {e}");
                return;
            }
            Err(e) => {
                warn!("serial: enumeration task failed: {e}");
                return;
            }
        };

        let mut opens = JoinSet::new();
        for port in ports {
            if !matches_label(&port.port_type, &label) || self.ports.contains_key(&port.port_name) {
                continue;
            }
            let device = port.port_name.clone();
            let baud = self.config.baud_rate;
            opens.spawn(async move {
                let opened = tokio::task::spawn_blocking(move || {
                    tokio_serial::new(&device, baud).open_native_async()
                })
                .await;
                (port.port_name, opened)
            });
        }

        while let Some(result) = opens.join_next().await {
            let Ok((device, opened)) = result else {
                continue;
            };
            match opened {
                Ok(Ok(stream)) => self.adopt_port(device, stream),
                Ok(Err(e)) => warn!("serial: could not open {device}: {e}"),
                Err(e) => warn!("serial: open task for {device} failed: {e}"),
            }
        }
    }

    /// Split the stream into a writer task and a reader task running the
    /// identification handshake, and start tracking the port.
    fn adopt_port(&mut self, device: String, stream: SerialStream) {
        let (mut read_half, mut write_half) = tokio::io::split(stream);

        let (writer, mut writer_rx) = mpsc::unbounded_channel::<Vec<u8>>();
        tokio::spawn(async move {
            while let Some(bytes) = writer_rx.recv().await {
                if write_half.write_all(&bytes).await.is_err() {
                    // Port is gone; the reader notices and reports Closed.
                    break;
                }
            }
        });

        // Probe; the first frame back is the robot introducing itself.
        let _ = writer.send(encode(Instruction::Identify, b""));

        let events = self.events_tx.clone();
        let reader_device = device.clone();
        let reader = tokio::spawn(async move {
            let mut scanner = FrameScanner::new();
            let mut identified = false;
            let mut buf = [0u8; 1024];
            loop {
                match read_half.read(&mut buf).await {
                    Ok(0) | Err(_) => break,
                    Ok(n) => {
                        for command in scanner.push(&buf[..n]) {
                            if identified {
                                let _ = events.send(PortEvent::Frame {
                                    device: reader_device.clone(),
                                    command,
                                });
                            } else {
                                identified = true;
                                let identifier =
                                    String::from_utf8_lossy(&command.data).trim().to_string();
                                let _ = events.send(PortEvent::Identified {
                                    device: reader_device.clone(),
                                    identifier,
                                });
                            }
                        }
                    }
                }
            }
            let _ = events.send(PortEvent::Closed {
                device: reader_device,
            });
        });

        debug!("serial: opened {device}, identifying");
        self.ports.insert(
            device,
            OpenPort {
                phase: PortPhase::Identifying,
                writer,
                reader,
            },
        );
    }

    pub fn close(&mut self) {
        for (device, port) in self.ports.drain() {
            debug!("serial: closing {device}");
            port.reader.abort();
            // Dropping the writer sender ends the writer task.
        }
    }
}

fn matches_label(port_type: &SerialPortType, label: &str) -> bool {
    match port_type {
        SerialPortType::UsbPort(usb) => usb.product.as_deref() == Some(label),
        _ => false,
    }
}
