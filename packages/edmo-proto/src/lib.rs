//! # edmo-proto
//!
//! Shared wire protocol for the EDMO fleet coordinator.
//!
//! These types are used by:
//! - `edmo-backend`: framing outbound motor commands, parsing inbound telemetry
//! - `edmo-sim`: the hardware-free robot simulator
//!
//! ## Wire format
//!
//! ```text
//! 'E' 'D'  instr:u8  escaped_body...  'M' 'O'
//! ```
//!
//! The body is byte-stuffed so the sentinel bigrams `ED` and `MO` never appear
//! literally between the header and footer, which makes the stream
//! self-synchronizing under packet loss on UDP and arbitrary-boundary reads on
//! serial. No length prefix: receivers buffer and scan (see [`FrameScanner`]).
//!
//! Escape, applied byte-wise to the raw body: `\` → `\\`, `ED` → `E\D`,
//! `MO` → `M\O`. Unescape drops every `\` and keeps the following byte
//! verbatim; a trailing `\` terminates input early.

use bytes::Buf;

pub const HEADER: [u8; 2] = *b"ED";
pub const FOOTER: [u8; 2] = *b"MO";

/// Minimum well-formed frame: header + instruction + footer.
const MIN_FRAME_LEN: usize = 5;

// ── Instruction codes ─────────────────────────────────────────────────────────

/// Command instruction carried in the byte after the header.
///
/// `GetTime` is what keeps the robot clock aligned with the session clock
/// across transport drops, so it is part of the scheme even though older
/// firmware revisions predate it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(i8)]
pub enum Instruction {
    Identify = 0,
    SessionStart = 1,
    GetTime = 2,
    UpdateOscillator = 3,
    SendMotorData = 4,
    SendImuData = 5,
    /// Anything that is not one of the codes above.
    Invalid = -1,
}

impl Instruction {
    /// Map a raw wire byte to an instruction; out-of-range bytes become
    /// [`Instruction::Invalid`].
    pub fn sanitize(raw: u8) -> Self {
        match raw {
            0 => Self::Identify,
            1 => Self::SessionStart,
            2 => Self::GetTime,
            3 => Self::UpdateOscillator,
            4 => Self::SendMotorData,
            5 => Self::SendImuData,
            _ => Self::Invalid,
        }
    }

    /// The byte this instruction is framed as.
    pub fn wire_byte(self) -> u8 {
        self as i8 as u8
    }
}

// ── Command ───────────────────────────────────────────────────────────────────

/// A parsed frame: instruction plus unescaped body bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Command {
    pub instruction: Instruction,
    pub data: Vec<u8>,
}

impl Command {
    pub fn new(instruction: Instruction, data: impl Into<Vec<u8>>) -> Self {
        Self {
            instruction,
            data: data.into(),
        }
    }

    /// Frame this command for the wire.
    pub fn to_frame(&self) -> Vec<u8> {
        encode(self.instruction, &self.data)
    }

    fn invalid() -> Self {
        Self {
            instruction: Instruction::Invalid,
            data: Vec::new(),
        }
    }
}

// ── Framing ───────────────────────────────────────────────────────────────────

/// Frame an instruction and raw body: header, instruction byte, escaped body,
/// footer.
pub fn encode(instruction: Instruction, body: &[u8]) -> Vec<u8> {
    let mut frame = Vec::with_capacity(body.len() + MIN_FRAME_LEN);
    frame.extend_from_slice(&HEADER);
    frame.push(instruction.wire_byte());
    escape_into(body, &mut frame);
    frame.extend_from_slice(&FOOTER);
    frame
}

/// Parse one complete frame. Returns an [`Instruction::Invalid`] command with
/// an empty body when the header or footer is absent; unknown instruction
/// bytes are likewise sanitized to `Invalid` (with the body preserved).
pub fn try_parse(frame: &[u8]) -> Command {
    if frame.len() < MIN_FRAME_LEN
        || !frame.starts_with(&HEADER)
        || !frame.ends_with(&FOOTER)
    {
        return Command::invalid();
    }

    let instruction = Instruction::sanitize(frame[2]);
    let data = unescape(&frame[3..frame.len() - 2]);

    Command { instruction, data }
}

/// Byte-stuff `body` into `out`. The backslash case is checked first so the
/// escape markers inserted for `ED`/`MO` are never themselves doubled.
fn escape_into(body: &[u8], out: &mut Vec<u8>) {
    let mut i = 0;
    while i < body.len() {
        match body[i] {
            b'\\' => {
                out.extend_from_slice(b"\\\\");
                i += 1;
            }
            b'E' if body.get(i + 1) == Some(&b'D') => {
                out.extend_from_slice(b"E\\D");
                i += 2;
            }
            b'M' if body.get(i + 1) == Some(&b'O') => {
                out.extend_from_slice(b"M\\O");
                i += 2;
            }
            b => {
                out.push(b);
                i += 1;
            }
        }
    }
}

/// Left-to-right dual of [`escape_into`]: every `\` is dropped and the byte
/// after it is emitted verbatim. A trailing `\` terminates the input early.
fn unescape(data: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(data.len());
    let mut i = 0;
    while i < data.len() {
        if data[i] == b'\\' {
            i += 1;
            if i >= data.len() {
                break;
            }
        }
        out.push(data[i]);
        i += 1;
    }
    out
}

// ── Stream reassembly ─────────────────────────────────────────────────────────

/// Incremental frame extractor for byte streams with arbitrary read
/// boundaries (serial reads, coalesced datagrams).
///
/// Feed chunks with [`push`](Self::push); complete frames come back parsed.
/// Bytes preceding a header are discarded, a partial frame stays buffered
/// until its footer arrives.
#[derive(Debug, Default)]
pub struct FrameScanner {
    buf: Vec<u8>,
}

impl FrameScanner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, chunk: &[u8]) -> Vec<Command> {
        self.buf.extend_from_slice(chunk);

        let mut commands = Vec::new();
        loop {
            let Some(start) = find_pair(&self.buf, HEADER) else {
                // No header anywhere; a dangling 'E' could still be the first
                // half of one, so keep the last byte around.
                let keep = self.buf.len().saturating_sub(1);
                self.buf.drain(..keep);
                break;
            };
            if start > 0 {
                self.buf.drain(..start);
            }

            // The escaped region contains no literal "MO", so the first
            // footer at or after the instruction byte is the real one.
            let Some(end) = self
                .buf
                .get(3..)
                .and_then(|tail| find_pair(tail, FOOTER))
                .map(|i| i + 3)
            else {
                break;
            };

            // A footer-less stray "ED" in line noise must not swallow the
            // next real frame: a body never holds a literal header, so the
            // last header before the footer is the true frame start.
            if let Some(start) = rfind_pair(&self.buf[..end], HEADER) {
                if start > 0 {
                    self.buf.drain(..start);
                    continue;
                }
            }

            commands.push(try_parse(&self.buf[..end + 2]));
            self.buf.drain(..end + 2);
        }
        commands
    }
}

fn find_pair(haystack: &[u8], needle: [u8; 2]) -> Option<usize> {
    haystack.windows(2).position(|w| w == needle)
}

fn rfind_pair(haystack: &[u8], needle: [u8; 2]) -> Option<usize> {
    haystack.windows(2).rposition(|w| w == needle)
}

// ── Telemetry body layouts ────────────────────────────────────────────────────

/// Body of a `SEND_MOTOR_DATA` response: the oscillator state one motor is
/// actually running, plus the phase it observed. Little-endian.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MotorTelemetry {
    pub index: u8,
    pub frequency: f32,
    pub amplitude: f32,
    pub offset: f32,
    pub phase_shift: f32,
    pub phase: f32,
}

impl MotorTelemetry {
    pub const WIRE_LEN: usize = 21;

    pub fn parse(mut data: &[u8]) -> Option<Self> {
        if data.len() != Self::WIRE_LEN {
            return None;
        }
        Some(Self {
            index: data.get_u8(),
            frequency: data.get_f32_le(),
            amplitude: data.get_f32_le(),
            offset: data.get_f32_le(),
            phase_shift: data.get_f32_le(),
            phase: data.get_f32_le(),
        })
    }
}

/// One IMU sensor record: `<time:u32, status:u8, pad:3, x:f32, y:f32, z:f32>`.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct ImuSample {
    pub time: u32,
    pub status: u8,
    pub x: f32,
    pub y: f32,
    pub z: f32,
}

impl ImuSample {
    fn read(data: &mut &[u8]) -> Self {
        let time = data.get_u32_le();
        let status = data.get_u8();
        data.advance(3); // alignment padding
        Self {
            time,
            status,
            x: data.get_f32_le(),
            y: data.get_f32_le(),
            z: data.get_f32_le(),
        }
    }
}

/// Body of a `SEND_IMU_DATA` response: accelerometer, gyroscope, magnetometer
/// and gravity records, then a rotation record carrying a fourth component.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ImuTelemetry {
    pub acceleration: ImuSample,
    pub gyroscope: ImuSample,
    pub magnetic: ImuSample,
    pub gravity: ImuSample,
    pub rotation: ImuSample,
    pub rotation_w: f32,
}

impl ImuTelemetry {
    pub const WIRE_LEN: usize = 104;

    pub fn parse(mut data: &[u8]) -> Option<Self> {
        if data.len() != Self::WIRE_LEN {
            return None;
        }
        let data = &mut data;
        Some(Self {
            acceleration: ImuSample::read(data),
            gyroscope: ImuSample::read(data),
            magnetic: ImuSample::read(data),
            gravity: ImuSample::read(data),
            rotation: ImuSample::read(data),
            rotation_w: data.get_f32_le(),
        })
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
