//! Per-robot session core.
//!
//! A session owns the canonical motor state for one robot, the pool of motor
//! numbers, the player roster (waiting → active → gone) and the overriders
//! shadowing individual motors. It turns player text input into motor
//! parameters, flushes those to the device every tick, keeps the robot clock
//! aligned with the session clock across transport drops, and broadcasts
//! derived state (roster, tasks, help flag, simple-view flag) to everyone
//! connected.

use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::fmt::Write as _;
use std::sync::Arc;

use edmo_proto::{encode, Command, ImuTelemetry, Instruction, MotorTelemetry};
use serde::Serialize;
use serde_json::json;
use thiserror::Error;
use tracing::{debug, info};
use uuid::Uuid;

use crate::fused::FusedChannel;
use crate::motor::Motor;
use crate::peer::{PeerHandle, PlayerId};
use crate::session_log::SessionLog;
use crate::tasks::{TaskCatalog, TaskEntry};

pub const MAX_PLAYER_COUNT: usize = 4;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SessionError {
    /// Every motor number is taken; surfaced to HTTP as 401.
    #[error("session has no free motor slot")]
    Saturated,
}

// ── Players ───────────────────────────────────────────────────────────────────

#[derive(Debug)]
struct Player {
    id: PlayerId,
    /// `None` until activation assigns a motor number.
    number: Option<u8>,
    name: String,
    voted: bool,
    peer: PeerHandle,
}

impl Player {
    fn number_or_unassigned(&self) -> i32 {
        self.number.map(i32::from).unwrap_or(-1)
    }
}

#[derive(Serialize)]
struct RosterEntry {
    number: i32,
    name: String,
    voted: bool,
}

// ── Session ───────────────────────────────────────────────────────────────────

pub struct EdmoSession {
    channel: Arc<FusedChannel>,
    log: SessionLog,
    motors: Vec<Motor>,
    /// Min-heap of unassigned motor numbers.
    free_numbers: BinaryHeap<Reverse<u8>>,
    active: Vec<Player>,
    waiting: Vec<Player>,
    overriders: Vec<Player>,
    /// Robot clock offset, refreshed by GET_TIME responses and replayed to
    /// the device on every reconnect so its log timestamps stay monotonic.
    offset_time: u32,
    tasks: Vec<TaskEntry>,
    help_enabled: bool,
    simple_mode: bool,
}

impl EdmoSession {
    pub fn new(
        channel: Arc<FusedChannel>,
        player_count: usize,
        catalog: &TaskCatalog,
        log: SessionLog,
    ) -> Self {
        let mut session = Self {
            channel,
            log,
            motors: (0..player_count as u8).map(Motor::new).collect(),
            free_numbers: (0..MAX_PLAYER_COUNT as u8).map(Reverse).collect(),
            active: Vec::new(),
            waiting: Vec::new(),
            overriders: Vec::new(),
            offset_time: 0,
            tasks: catalog.session_tasks(),
            help_enabled: false,
            simple_mode: true,
        };
        session.on_robot_reconnect();
        session
    }

    pub fn identifier(&self) -> &str {
        self.channel.identifier()
    }

    pub fn has_players(&self) -> bool {
        !self.active.is_empty() || !self.waiting.is_empty()
    }

    pub fn is_saturated(&self) -> bool {
        self.free_numbers.is_empty()
    }

    pub fn help_enabled(&self) -> bool {
        self.help_enabled
    }

    /// Realign the robot clock with the session clock. Called once at
    /// construction and again whenever the robot's channel regains a
    /// connection.
    pub fn on_robot_reconnect(&mut self) {
        self.channel.write(&encode(
            Instruction::SessionStart,
            &self.offset_time.to_le_bytes(),
        ));
    }

    // ── Admission & lifecycle ─────────────────────────────────────────────────

    /// Admit a player. Registered players wait until their data channel opens
    /// before any motor is assigned.
    pub fn register_player(
        &mut self,
        peer: PeerHandle,
        name: impl Into<String>,
    ) -> Result<PlayerId, SessionError> {
        if self.free_numbers.is_empty() {
            return Err(SessionError::Saturated);
        }
        let id = Uuid::new_v4();
        self.waiting.push(Player {
            id,
            number: None,
            name: name.into(),
            voted: false,
            peer,
        });
        Ok(id)
    }

    /// Bind an operator directly to a motor number, possibly shadowing the
    /// player that holds it. Overriders bypass the free-number pool entirely.
    pub fn register_overrider(&mut self, peer: PeerHandle, number: u8) -> Option<PlayerId> {
        if number as usize >= self.motors.len() {
            return None;
        }
        let id = Uuid::new_v4();
        peer.send(format!("sys.number {number}"));
        peer.send(format!("ID {number}"));
        self.overriders.push(Player {
            id,
            number: Some(number),
            name: "Overrider".to_string(),
            voted: false,
            peer,
        });
        Some(id)
    }

    /// The peer's data channel opened.
    pub fn peer_open(&mut self, id: PlayerId) {
        if let Some(pos) = self.waiting.iter().position(|p| p.id == id) {
            self.activate_player(pos);
        } else if self.overriders.iter().any(|p| p.id == id) {
            self.overrider_connected(id);
        }
    }

    fn activate_player(&mut self, pos: usize) {
        // All numbers can be out while reconnecting players crowd the waiting
        // list; such a player stays waiting until a number frees up.
        let Some(Reverse(number)) = self.free_numbers.pop() else {
            return;
        };
        let mut player = self.waiting.remove(pos);
        player.number = Some(number);
        let peer = player.peer.clone();
        let name = player.name.clone();
        self.active.push(player);

        // The number goes out before the first motor-parameter send; the
        // client addresses its UI by it.
        peer.send(format!("sys.number {number}"));
        peer.send(format!("ID {number}"));

        self.log
            .write("Session", format!("Player {number} connected. ({name})"));
        self.broadcast_player_list();
        self.send_connect_bundle(&peer, number);
    }

    fn overrider_connected(&mut self, id: PlayerId) {
        let Some(overrider) = self.overriders.iter().find(|p| p.id == id) else {
            return;
        };
        let peer = overrider.peer.clone();
        let number = overrider.number.unwrap_or_default();
        peer.send(format!("ID {number}"));

        self.log
            .write("Session", format!("Overrider for {number} connected."));
        self.broadcast_player_list();
        self.send_connect_bundle(&peer, number);
    }

    fn send_connect_bundle(&mut self, peer: &PeerHandle, number: u8) {
        peer.send(format!("TaskInfo {}", self.tasks_json()));
        self.send_motor_params(peer, number);
        peer.send(format!("HelpEnabled {}", flag(self.help_enabled)));
        peer.send(format!("SimpleMode {}", flag(self.simple_mode)));
    }

    /// Transient loss: the player keeps their seat in the waiting list, but
    /// the motor number goes back into the pool.
    pub fn peer_disconnected(&mut self, id: PlayerId) {
        if let Some(pos) = self.active.iter().position(|p| p.id == id) {
            let mut player = self.active.remove(pos);
            self.log.write(
                "Session",
                format!(
                    "Player {} disconnected. ({})",
                    player.number_or_unassigned(),
                    player.name
                ),
            );
            if let Some(number) = player.number.take() {
                self.free_numbers.push(Reverse(number));
            }
            self.waiting.push(player);
            self.broadcast_player_list();
        } else if let Some(pos) = self.overriders.iter().position(|p| p.id == id) {
            let overrider = self.overriders.remove(pos);
            self.log.write(
                "Session",
                format!(
                    "Overrider for {} disconnected.",
                    overrider.number_or_unassigned()
                ),
            );
        }
    }

    /// The connection is gone for good. Returns false once the session has no
    /// players left and should be evicted by the supervisor.
    pub fn peer_closed(&mut self, id: PlayerId) -> bool {
        if let Some(pos) = self.active.iter().position(|p| p.id == id) {
            let mut player = self.active.remove(pos);
            if let Some(number) = player.number.take() {
                self.free_numbers.push(Reverse(number));
            }
            self.log.write(
                "Session",
                format!("Player left for good. ({})", player.name),
            );
            self.broadcast_player_list();
        } else if let Some(pos) = self.waiting.iter().position(|p| p.id == id) {
            self.waiting.remove(pos);
        } else if let Some(pos) = self.overriders.iter().position(|p| p.id == id) {
            self.overriders.remove(pos);
        }
        self.has_players()
    }

    // ── Player input ──────────────────────────────────────────────────────────

    pub fn peer_message(&mut self, id: PlayerId, message: &str) {
        if let Some(player) = self.active.iter().find(|p| p.id == id) {
            let Some(number) = player.number else { return };
            self.log
                .write(&format!("Input_Player{number}"), message);
            self.apply_input(id, number, message, false);
        } else if let Some(overrider) = self.overriders.iter().find(|p| p.id == id) {
            let Some(number) = overrider.number else { return };
            self.log
                .write(&format!("Input_Override{number}"), message);
            self.apply_input(id, number, message, true);
        }
    }

    fn apply_input(&mut self, sender: PlayerId, number: u8, message: &str, from_overrider: bool) {
        let verb = message.split(' ').next().unwrap_or_default();
        match verb {
            "vote" => {
                let voted = message.split(' ').nth(1) == Some("1");
                if let Some(player) = self.player_mut(sender) {
                    player.voted = voted;
                }
                self.broadcast_player_list();
                return;
            }
            "freq" => {
                let Some(value) = parse_value(message) else {
                    return;
                };
                self.set_frequency(value);
                return;
            }
            "phb" => {
                let Some(value) = parse_value(message) else {
                    return;
                };
                self.mirror_phase_shift(number, value);
            }
            _ => {}
        }

        if let Some(motor) = self.motors.get_mut(number as usize) {
            if let Err(e) = motor.adjust_from(message) {
                debug!("session {}: ignored input: {e}", self.identifier());
                return;
            }
        }

        // Keep everyone else steering this motor in sync with its
        // authoritative state.
        let mut shadows: Vec<PeerHandle> = self
            .overriders
            .iter()
            .filter(|p| p.number == Some(number) && p.id != sender)
            .map(|p| p.peer.clone())
            .collect();
        if from_overrider {
            shadows.extend(
                self.active
                    .iter()
                    .filter(|p| p.number == Some(number) && p.id != sender)
                    .map(|p| p.peer.clone()),
            );
        }
        for peer in shadows {
            self.send_motor_params(&peer, number);
        }
    }

    fn player_mut(&mut self, id: PlayerId) -> Option<&mut Player> {
        self.active
            .iter_mut()
            .chain(self.overriders.iter_mut())
            .find(|p| p.id == id)
    }

    /// Frequency is global: one verb drives all motors, and every active
    /// player's UI is told about it.
    fn set_frequency(&mut self, value: f32) {
        for motor in &mut self.motors {
            motor.set_frequency(value);
        }
        let line = format!("freq {value}");
        for player in &self.active {
            player.peer.send(line.clone());
        }
    }

    fn mirror_phase_shift(&self, number: u8, value: f32) {
        let line = format!("phb {number} {value}");
        for player in self.active.iter().filter(|p| p.number != Some(number)) {
            player.peer.send(line.clone());
        }
    }

    fn send_motor_params(&self, peer: &PeerHandle, number: u8) {
        if let Some(motor) = self.motors.get(number as usize) {
            peer.send(format!("amp {}", motor.amplitude()));
            peer.send(format!("freq {}", motor.frequency()));
            peer.send(format!("off {}", motor.offset()));
        }
        for motor in &self.motors {
            peer.send(format!("phb {} {}", motor.index(), motor.phase_shift()));
        }
    }

    // ── Robot telemetry ───────────────────────────────────────────────────────

    pub fn handle_command(&mut self, command: &Command) {
        match command.instruction {
            Instruction::Invalid => {}
            Instruction::GetTime => {
                if let Ok(bytes) = <[u8; 4]>::try_from(command.data.as_slice()) {
                    self.offset_time = u32::from_le_bytes(bytes);
                }
            }
            Instruction::SendMotorData => {
                if let Some(motor) = MotorTelemetry::parse(&command.data) {
                    self.log.write(
                        &format!("Motor{}", motor.index),
                        format!(
                            "Frequency: {}, Amplitude: {}, Offset: {}, Phase Shift: {}, Phase: {}",
                            motor.frequency,
                            motor.amplitude,
                            motor.offset,
                            motor.phase_shift,
                            motor.phase
                        ),
                    );
                }
            }
            Instruction::SendImuData => {
                if let Some(imu) = ImuTelemetry::parse(&command.data) {
                    self.log.write("IMU", format_imu(&imu));
                }
            }
            _ => {}
        }
    }

    // ── Tick ──────────────────────────────────────────────────────────────────

    /// Flush the canonical motor state to the device and ask it for
    /// telemetry. Skipped entirely while the robot is unreachable.
    pub async fn update(&mut self) {
        if !self.channel.has_connection() {
            return;
        }

        for motor in &self.motors {
            self.channel.write(&motor.as_command());
        }
        self.channel.write(&encode(Instruction::SendMotorData, b""));
        self.channel.write(&encode(Instruction::SendImuData, b""));
        self.channel.write(&encode(Instruction::GetTime, b""));

        self.log.update().await;
    }

    // ── Broadcasts & operator surface ─────────────────────────────────────────

    fn broadcast_player_list(&mut self) {
        let roster: Vec<RosterEntry> = self
            .active
            .iter()
            .map(|p| RosterEntry {
                number: p.number_or_unassigned(),
                name: p.name.clone(),
                voted: p.voted,
            })
            .collect();
        let line = format!(
            "PlayerInfo {}",
            serde_json::to_string(&roster).unwrap_or_else(|_| "[]".to_string())
        );
        for player in &self.active {
            player.peer.send(line.clone());
        }
    }

    fn broadcast_task_list(&mut self) {
        let line = format!("TaskInfo {}", self.tasks_json());
        for player in &self.active {
            player.peer.send(line.clone());
        }
    }

    fn tasks_json(&self) -> String {
        serde_json::to_string(&self.tasks).unwrap_or_else(|_| "[]".to_string())
    }

    /// Mark a task; false when the key is unknown.
    pub fn set_task(&mut self, key: &str, completed: bool) -> bool {
        let Some(task) = self.tasks.iter_mut().find(|t| t.key == key) else {
            return false;
        };
        task.completed = completed;
        self.broadcast_task_list();
        true
    }

    pub fn set_help_enabled(&mut self, value: bool) {
        if self.help_enabled == value {
            return;
        }
        self.help_enabled = value;
        if !value {
            // Requests made under the old regime don't linger.
            for player in &mut self.active {
                player.voted = false;
            }
        }
        let line = format!("HelpEnabled {}", flag(value));
        for player in &self.active {
            player.peer.send(line.clone());
        }
    }

    pub fn set_simple_view(&mut self, value: bool) {
        self.simple_mode = value;
        let line = format!("SimpleMode {}", flag(value));
        for player in &self.active {
            player.peer.send(line.clone());
        }
    }

    /// Operator feedback, fanned out to everyone active.
    pub fn send_feedback(&mut self, message: &str) {
        for player in &self.active {
            player.peer.send(format!("Feedback {message}"));
        }
        info!(
            "feedback sent to group {}: {message}",
            self.identifier()
        );
        self.log
            .write("Session", format!("Teacher sent feedback: {message}"));
    }

    pub fn session_info(&self) -> serde_json::Value {
        json!({
            "robotID": self.identifier(),
            "names": self.active.iter().map(|p| p.name.clone()).collect::<Vec<_>>(),
            "HelpNumber": self.active.iter().filter(|p| p.voted).count(),
        })
    }

    pub fn detailed_info(&self) -> serde_json::Value {
        json!({
            "robotID": self.identifier(),
            "players": self.active.iter().map(|p| json!({
                "name": p.name,
                "HelpRequested": p.voted,
            })).collect::<Vec<_>>(),
            "tasks": &self.tasks,
            "helpEnabled": self.help_enabled,
        })
    }

    /// Final flush and peer teardown.
    pub async fn close(&mut self) {
        self.log.flush().await;
        for player in self.active.iter().chain(self.waiting.iter()) {
            player.peer.close();
        }
    }
}

fn flag(value: bool) -> &'static str {
    if value {
        "1"
    } else {
        "0"
    }
}

fn parse_value(message: &str) -> Option<f32> {
    message.split(' ').nth(1)?.trim().parse().ok()
}

fn format_imu(imu: &ImuTelemetry) -> String {
    let mut line = String::with_capacity(256);
    let sensor = |name: &str, s: &edmo_proto::ImuSample| {
        format!(
            "{name}: {{Time: {}, Status: {}, Value: ({},{},{})}}",
            s.time, s.status, s.x, s.y, s.z
        )
    };
    let _ = write!(
        line,
        "{{{},{},{},{}, ",
        sensor("Acceleration", &imu.acceleration),
        sensor("Gyroscope", &imu.gyroscope),
        sensor("Magnetic", &imu.magnetic),
        sensor("Gravity", &imu.gravity),
    );
    let _ = write!(
        line,
        "Rotation: {{Time: {}, Status: {}, Value: ({},{},{}, {})}}}}",
        imu.rotation.time,
        imu.rotation.status,
        imu.rotation.x,
        imu.rotation.y,
        imu.rotation.z,
        imu.rotation_w
    );
    line
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fused::EndpointHandle;
    use std::collections::BTreeSet;
    use tokio::sync::mpsc;

    fn test_log() -> SessionLog {
        let root = std::env::temp_dir().join(format!("edmo-session-{}", Uuid::new_v4()));
        SessionLog::with_root(root, "R1")
    }

    fn session_with_serial() -> (EdmoSession, mpsc::UnboundedReceiver<Vec<u8>>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let channel = Arc::new(FusedChannel::new("R1"));
        channel.bind(EndpointHandle::Serial(tx));
        let session = EdmoSession::new(channel, 4, &TaskCatalog::default(), test_log());
        (session, rx)
    }

    fn join(session: &mut EdmoSession, name: &str) -> (PlayerId, mpsc::UnboundedReceiver<crate::peer::PeerCommand>) {
        let (peer, rx) = PeerHandle::pair();
        let id = session.register_player(peer, name).unwrap();
        session.peer_open(id);
        (id, rx)
    }

    fn assigned_numbers(session: &EdmoSession) -> BTreeSet<u8> {
        session.active.iter().filter_map(|p| p.number).collect()
    }

    fn heap_numbers(session: &EdmoSession) -> BTreeSet<u8> {
        session.free_numbers.iter().map(|Reverse(n)| *n).collect()
    }

    fn assert_conserved(session: &EdmoSession) {
        let mut all = assigned_numbers(session);
        let heap = heap_numbers(session);
        assert_eq!(
            all.len() + heap.len(),
            MAX_PLAYER_COUNT,
            "number duplicated between players and pool"
        );
        all.extend(heap);
        assert_eq!(all, (0..MAX_PLAYER_COUNT as u8).collect::<BTreeSet<_>>());
    }

    #[test]
    fn construction_sends_session_start() {
        let (_session, mut robot) = session_with_serial();
        let frame = robot.try_recv().unwrap();
        let command = edmo_proto::try_parse(&frame);
        assert_eq!(command.instruction, Instruction::SessionStart);
        assert_eq!(command.data, 0u32.to_le_bytes());
    }

    #[test]
    fn numbers_are_conserved_through_churn() {
        let (mut session, _robot) = session_with_serial();
        assert_conserved(&session);

        let (a, _rx_a) = join(&mut session, "Alice");
        let (b, _rx_b) = join(&mut session, "Bob");
        let (c, _rx_c) = join(&mut session, "Carol");
        assert_conserved(&session);
        assert_eq!(assigned_numbers(&session), BTreeSet::from([0, 1, 2]));

        session.peer_disconnected(b);
        assert_conserved(&session);
        assert_eq!(assigned_numbers(&session), BTreeSet::from([0, 2]));

        session.peer_closed(a);
        assert_conserved(&session);

        // Bob comes back and is re-activated.
        session.peer_open(b);
        assert_conserved(&session);
        session.peer_closed(b);
        session.peer_closed(c);
        assert_conserved(&session);
        assert!(!session.has_players());
    }

    #[test]
    fn fifth_registration_is_saturated() {
        let (mut session, _robot) = session_with_serial();
        for name in ["A", "B", "C", "D"] {
            join(&mut session, name);
        }
        let (peer, _rx) = PeerHandle::pair();
        assert_eq!(
            session.register_player(peer, "E"),
            Err(SessionError::Saturated)
        );
    }

    #[test]
    fn freed_slot_goes_to_the_next_player_smallest_first() {
        let (mut session, _robot) = session_with_serial();
        let (_a, _rx_a) = join(&mut session, "A");
        let (_b, _rx_b) = join(&mut session, "B");
        let (c, _rx_c) = join(&mut session, "C");

        session.peer_disconnected(c); // frees number 2
        let (_, mut rx_d) = join(&mut session, "D");

        let mut got = None;
        while let Ok(crate::peer::PeerCommand::Text(text)) = rx_d.try_recv() {
            if let Some(rest) = text.strip_prefix("sys.number ") {
                got = rest.parse::<u8>().ok();
                break;
            }
        }
        assert_eq!(got, Some(2));
    }

    #[test]
    fn malformed_inbound_frame_changes_nothing() {
        let (mut session, _robot) = session_with_serial();
        let before = session.offset_time;
        session.handle_command(&edmo_proto::try_parse(b"ED\xffMO"));
        session.handle_command(&edmo_proto::try_parse(b"garbage"));
        assert_eq!(session.offset_time, before);
        assert!(session.active.is_empty() && session.waiting.is_empty());
    }

    #[test]
    fn get_time_updates_the_clock_offset_and_reconnect_replays_it() {
        let (mut session, mut robot) = session_with_serial();
        while robot.try_recv().is_ok() {}

        session.handle_command(&Command::new(
            Instruction::GetTime,
            1234u32.to_le_bytes().to_vec(),
        ));
        session.on_robot_reconnect();

        let frame = robot.try_recv().unwrap();
        let command = edmo_proto::try_parse(&frame);
        assert_eq!(command.instruction, Instruction::SessionStart);
        assert_eq!(command.data, 1234u32.to_le_bytes());
    }

    #[tokio::test]
    async fn tick_flushes_motors_then_telemetry_requests() {
        let (mut session, mut robot) = session_with_serial();
        while robot.try_recv().is_ok() {}

        let (a, _rx_a) = join(&mut session, "Alice");
        let (b, _rx_b) = join(&mut session, "Bob");
        session.peer_message(a, "amp 1.0");
        session.peer_message(b, "freq 0.5");

        session.update().await;

        let mut frames = Vec::new();
        while let Ok(frame) = robot.try_recv() {
            frames.push(edmo_proto::try_parse(&frame));
        }
        assert_eq!(frames.len(), 7);

        for (i, frame) in frames[..4].iter().enumerate() {
            assert_eq!(frame.instruction, Instruction::UpdateOscillator);
            assert_eq!(frame.data[0], i as u8);
            let freq = f32::from_le_bytes(frame.data[1..5].try_into().unwrap());
            let amp = f32::from_le_bytes(frame.data[5..9].try_into().unwrap());
            let offset = f32::from_le_bytes(frame.data[9..13].try_into().unwrap());
            assert_eq!(freq, 0.5, "freq is global, motor {i}");
            assert_eq!(offset, 90.0);
            assert_eq!(amp, if i == 0 { 1.0 } else { 0.0 });
        }
        assert_eq!(frames[4].instruction, Instruction::SendMotorData);
        assert_eq!(frames[5].instruction, Instruction::SendImuData);
        assert_eq!(frames[6].instruction, Instruction::GetTime);
    }

    #[tokio::test]
    async fn tick_is_silent_without_a_connection() {
        let channel = Arc::new(FusedChannel::new("R1"));
        let mut session = EdmoSession::new(channel, 4, &TaskCatalog::default(), test_log());
        session.update().await; // nothing to assert against: the write sink
                                // is the channel itself, which drops writes
        assert!(!session.channel.has_connection());
    }

    #[test]
    fn vote_toggles_and_help_disable_clears_votes() {
        let (mut session, _robot) = session_with_serial();
        let (a, mut rx_a) = join(&mut session, "Alice");

        session.set_help_enabled(true);
        session.peer_message(a, "vote 1");
        assert!(session.active[0].voted);

        session.set_help_enabled(false);
        assert!(!session.active[0].voted);

        // Same value again is a no-op: no extra HelpEnabled broadcast.
        let drained: Vec<_> = std::iter::from_fn(|| rx_a.try_recv().ok()).collect();
        let help_lines = drained
            .iter()
            .filter(|c| matches!(c, crate::peer::PeerCommand::Text(t) if t.starts_with("HelpEnabled")))
            .count();
        session.set_help_enabled(false);
        let extra = std::iter::from_fn(|| rx_a.try_recv().ok()).count();
        assert!(help_lines >= 2);
        assert_eq!(extra, 0);
    }

    #[test]
    fn phase_shift_is_mirrored_to_the_other_players() {
        let (mut session, _robot) = session_with_serial();
        let (a, mut rx_a) = join(&mut session, "Alice");
        let (_b, mut rx_b) = join(&mut session, "Bob");
        while rx_a.try_recv().is_ok() {}
        while rx_b.try_recv().is_ok() {}

        session.peer_message(a, "phb 0.5");

        assert_eq!(session.motors[0].phase_shift(), 0.5);
        let bob: Vec<String> = std::iter::from_fn(|| rx_b.try_recv().ok())
            .filter_map(|c| match c {
                crate::peer::PeerCommand::Text(t) => Some(t),
                _ => None,
            })
            .collect();
        assert!(bob.contains(&"phb 0 0.5".to_string()));
        let alice_echo = std::iter::from_fn(|| rx_a.try_recv().ok()).count();
        assert_eq!(alice_echo, 0, "sender is not echoed their own phb");
    }

    #[test]
    fn overrider_shadows_a_players_motor() {
        let (mut session, _robot) = session_with_serial();
        let (a, mut rx_a) = join(&mut session, "Alice");

        let (peer, mut rx_o) = PeerHandle::pair();
        let overrider = session.register_overrider(peer, 0).unwrap();
        session.peer_open(overrider);
        while rx_a.try_recv().is_ok() {}
        while rx_o.try_recv().is_ok() {}

        // Player input reaches the overrider's UI…
        session.peer_message(a, "amp 0.75");
        let overrider_saw: Vec<String> = std::iter::from_fn(|| rx_o.try_recv().ok())
            .filter_map(|c| match c {
                crate::peer::PeerCommand::Text(t) => Some(t),
                _ => None,
            })
            .collect();
        assert!(overrider_saw.contains(&"amp 0.75".to_string()));

        // …and overrider input drives the same canonical motor and flows back.
        session.peer_message(overrider, "off 60");
        assert_eq!(session.motors[0].offset(), 60.0);
        let alice_saw: Vec<String> = std::iter::from_fn(|| rx_a.try_recv().ok())
            .filter_map(|c| match c {
                crate::peer::PeerCommand::Text(t) => Some(t),
                _ => None,
            })
            .collect();
        assert!(alice_saw.contains(&"off 60".to_string()));

        // Overriders never hold pool numbers.
        assert_conserved(&session);
    }

    #[test]
    fn unknown_task_key_is_rejected_known_key_broadcasts() {
        let catalog = TaskCatalog::parse(r#"[ { "en": "Wave" } ]"#).unwrap();
        let (tx, _rx) = mpsc::unbounded_channel();
        let channel = Arc::new(FusedChannel::new("R1"));
        channel.bind(EndpointHandle::Serial(tx));
        let mut session = EdmoSession::new(channel, 4, &catalog, test_log());

        let (_a, mut rx_a) = {
            let (peer, rx) = PeerHandle::pair();
            let id = session.register_player(peer, "Alice").unwrap();
            session.peer_open(id);
            (id, rx)
        };
        while rx_a.try_recv().is_ok() {}

        assert!(!session.set_task("Nope", true));
        assert!(session.set_task("Wave", true));

        let task_lines: Vec<String> = std::iter::from_fn(|| rx_a.try_recv().ok())
            .filter_map(|c| match c {
                crate::peer::PeerCommand::Text(t) if t.starts_with("TaskInfo ") => Some(t),
                _ => None,
            })
            .collect();
        assert_eq!(task_lines.len(), 1);
        assert!(task_lines[0].contains("\"completed\":true"));
    }
}
