//! Backend supervisor.
//!
//! Owns the fused transport, the set of reachable robots and the map of
//! active sessions, and drives the global tick. Sessions are created lazily
//! on the first player registration for a connected robot and evicted when
//! the last player leaves. Peer hosts (the controller sockets) talk to the
//! supervisor through an event channel that is drained once per tick, which
//! keeps all state mutation on the tick's logical thread.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use thiserror::Error;
use tokio::sync::{mpsc, RwLock};
use tracing::info;

use crate::fused::{FusedChannel, FusedEvent, FusedTransport};
use crate::peer::{PeerEvent, PeerHandle, PlayerId};
use crate::serial_link::SerialConfig;
use crate::session::{EdmoSession, SessionError, MAX_PLAYER_COUNT};
use crate::session_log::SessionLog;
use crate::tasks::TaskCatalog;
use crate::udp_link::UdpConfig;

pub type SharedBackend = Arc<RwLock<EdmoBackend>>;

#[derive(Debug, Error)]
pub enum RegisterError {
    /// No such robot on either transport; HTTP 404.
    #[error("unknown robot")]
    UnknownRobot,
    /// Admission refused; HTTP 401.
    #[error(transparent)]
    Session(#[from] SessionError),
    /// Overrider asked for a motor the robot does not have; HTTP 404.
    #[error("invalid motor number")]
    InvalidSlot,
}

/// Raised by peer hosts, consumed by [`EdmoBackend::update`].
#[derive(Debug)]
pub enum BackendEvent {
    Peer {
        robot: String,
        player: PlayerId,
        event: PeerEvent,
    },
}

pub struct EdmoBackend {
    fused: FusedTransport,
    robots: HashMap<String, Arc<FusedChannel>>,
    sessions: HashMap<String, EdmoSession>,
    catalog: TaskCatalog,
    simple_view: bool,
    log_root: PathBuf,
    events_tx: mpsc::UnboundedSender<BackendEvent>,
    events_rx: mpsc::UnboundedReceiver<BackendEvent>,
}

impl EdmoBackend {
    pub async fn new(
        serial: SerialConfig,
        udp: UdpConfig,
        catalog: TaskCatalog,
        log_root: impl Into<PathBuf>,
    ) -> anyhow::Result<Self> {
        let fused = FusedTransport::new(serial, udp).await?;
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        Ok(Self {
            fused,
            robots: HashMap::new(),
            sessions: HashMap::new(),
            catalog,
            simple_view: false,
            log_root: log_root.into(),
            events_tx,
            events_rx,
        })
    }

    /// Handle for peer hosts to report lifecycle and messages through.
    pub fn event_sender(&self) -> mpsc::UnboundedSender<BackendEvent> {
        self.events_tx.clone()
    }

    /// One global tick: transports first, then queued peer traffic, then
    /// every session's flush to its robot.
    pub async fn update(&mut self) {
        for event in self.fused.update().await {
            self.handle_fused_event(event);
        }
        self.drain_peer_events().await;
        for session in self.sessions.values_mut() {
            session.update().await;
        }
    }

    fn handle_fused_event(&mut self, event: FusedEvent) {
        match event {
            FusedEvent::EdmoConnected(channel) => {
                let identifier = channel.identifier().to_string();
                info!("🤖 robot {identifier} connected");
                self.robots.insert(identifier.clone(), channel);
                // A surviving session realigns the robot clock right away.
                if let Some(session) = self.sessions.get_mut(&identifier) {
                    session.on_robot_reconnect();
                }
            }
            FusedEvent::EdmoDisconnected(channel) => {
                let identifier = channel.identifier().to_string();
                info!("robot {identifier} disconnected");
                self.robots.remove(&identifier);
                // A session still holding this channel keeps it alive, so a
                // reconnect re-binds the same object the session writes to.
                if !self.sessions.contains_key(&identifier) {
                    self.fused.remove_if_dead(&identifier);
                }
            }
            FusedEvent::Frame {
                identifier,
                command,
            } => {
                if let Some(session) = self.sessions.get_mut(&identifier) {
                    session.handle_command(&command);
                }
            }
        }
    }

    async fn drain_peer_events(&mut self) {
        let mut ended = Vec::new();
        while let Ok(BackendEvent::Peer {
            robot,
            player,
            event,
        }) = self.events_rx.try_recv()
        {
            let Some(session) = self.sessions.get_mut(&robot) else {
                continue;
            };
            match event {
                PeerEvent::Open => session.peer_open(player),
                PeerEvent::Message(text) => session.peer_message(player, &text),
                PeerEvent::Disconnected => session.peer_disconnected(player),
                PeerEvent::Closed => {
                    if !session.peer_closed(player) {
                        ended.push(robot);
                    }
                }
            }
        }

        for robot in ended {
            if let Some(mut session) = self.sessions.remove(&robot) {
                info!("session {robot} ended, all players left");
                session.close().await;
            }
            self.fused.remove_if_dead(&robot);
        }
    }

    // ── Admission ─────────────────────────────────────────────────────────────

    pub fn register_player(
        &mut self,
        identifier: &str,
        peer: PeerHandle,
        name: &str,
    ) -> Result<PlayerId, RegisterError> {
        let session = self.session_entry(identifier)?;
        Ok(session.register_player(peer, name)?)
    }

    pub fn register_overrider(
        &mut self,
        identifier: &str,
        peer: PeerHandle,
        number: u8,
    ) -> Result<PlayerId, RegisterError> {
        let session = self.session_entry(identifier)?;
        session
            .register_overrider(peer, number)
            .ok_or(RegisterError::InvalidSlot)
    }

    /// Existing session, or a fresh one if the robot is at least connected.
    fn session_entry(&mut self, identifier: &str) -> Result<&mut EdmoSession, RegisterError> {
        if !self.sessions.contains_key(identifier) {
            let channel = self
                .robots
                .get(identifier)
                .cloned()
                .ok_or(RegisterError::UnknownRobot)?;
            let log = SessionLog::with_root(&self.log_root, identifier);
            let session = EdmoSession::new(channel, MAX_PLAYER_COUNT, &self.catalog, log);
            self.sessions.insert(identifier.to_string(), session);
        }
        self.sessions
            .get_mut(identifier)
            .ok_or(RegisterError::UnknownRobot)
    }

    // ── Operator surface ──────────────────────────────────────────────────────

    pub fn connected_robots(&self) -> Vec<String> {
        self.robots.keys().cloned().collect()
    }

    pub fn is_robot_known(&self, identifier: &str) -> bool {
        self.robots.contains_key(identifier)
    }

    pub fn session(&self, identifier: &str) -> Option<&EdmoSession> {
        self.sessions.get(identifier)
    }

    pub fn session_mut(&mut self, identifier: &str) -> Option<&mut EdmoSession> {
        self.sessions.get_mut(identifier)
    }

    pub fn sessions_info(&self) -> Vec<serde_json::Value> {
        self.sessions.values().map(EdmoSession::session_info).collect()
    }

    pub fn simple_view(&self) -> bool {
        self.simple_view
    }

    /// Global flag; fans out to every session.
    pub fn set_simple_view(&mut self, value: bool) {
        self.simple_view = value;
        for session in self.sessions.values_mut() {
            session.set_simple_view(value);
        }
    }

    /// Graceful shutdown: transports down, every session flushed and its
    /// peers closed.
    pub async fn close(&mut self) {
        self.fused.close();
        self.robots.clear();
        for (_, mut session) in self.sessions.drain() {
            session.close().await;
        }
    }
}
