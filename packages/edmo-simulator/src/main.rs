//! edmo-sim — a hardware-free EDMO robot.
//!
//! Binds the robot-side UDP port, answers the coordinator's IDENTIFY
//! broadcasts with its identifier, runs the oscillator state the coordinator
//! pushes at it, and produces plausible motor and IMU telemetry on request.
//! Lets the whole backend be exercised end-to-end without a board on the
//! desk:
//!
//! ```text
//! cargo run --bin edmo-sim -- --identifier SIM01
//! ```

use std::f32::consts::TAU;
use std::net::SocketAddr;
use std::time::Instant;

use bytes::{Buf, BufMut};
use clap::Parser;
use edmo_proto::{encode, try_parse, Instruction};
use rand::Rng;
use tokio::net::UdpSocket;
use tracing::{debug, info, warn};

#[derive(Parser)]
#[command(name = "edmo-sim", about = "Simulated EDMO robot")]
struct Args {
    /// Identifier reported to the coordinator.
    #[arg(long, default_value = "SIM01")]
    identifier: String,

    /// Robot-side UDP port the coordinator broadcasts to.
    #[arg(long, default_value_t = 2121)]
    port: u16,
}

#[derive(Debug, Clone, Copy, Default)]
struct SimMotor {
    frequency: f32,
    amplitude: f32,
    offset: f32,
    phase_shift: f32,
}

struct SimRobot {
    identifier: String,
    motors: [SimMotor; 4],
    /// Clock offset pushed by SESSION_START, in milliseconds.
    session_offset_ms: u32,
    started: Instant,
}

impl SimRobot {
    fn new(identifier: String) -> Self {
        Self {
            identifier,
            motors: [SimMotor::default(); 4],
            session_offset_ms: 0,
            started: Instant::now(),
        }
    }

    fn clock_ms(&self) -> u32 {
        self.session_offset_ms
            .wrapping_add(self.started.elapsed().as_millis() as u32)
    }

    /// Where the oscillator actually is right now, with a little sensor
    /// jitter so logs do not look suspiciously clean.
    fn observed_phase(&self, motor: &SimMotor) -> f32 {
        let t = self.started.elapsed().as_secs_f32();
        let phase = (t * motor.frequency * TAU) % TAU;
        phase + rand::thread_rng().gen_range(-0.02..0.02)
    }

    fn motor_report(&self, index: usize) -> Vec<u8> {
        let motor = &self.motors[index];
        let mut body = Vec::with_capacity(21);
        body.put_u8(index as u8);
        body.put_f32_le(motor.frequency);
        body.put_f32_le(motor.amplitude);
        body.put_f32_le(motor.offset);
        body.put_f32_le(motor.phase_shift);
        body.put_f32_le(self.observed_phase(motor));
        body
    }

    fn imu_report(&self) -> Vec<u8> {
        let mut rng = rand::thread_rng();
        let time = self.clock_ms();
        let mut body = Vec::with_capacity(104);
        // Accelerometer, gyroscope, magnetometer, gravity.
        for base in [0.0f32, 0.0, 40.0, 9.81] {
            body.put_u32_le(time);
            body.put_u8(3);
            body.put_bytes(0, 3);
            for _ in 0..3 {
                body.put_f32_le(base + rng.gen_range(-0.1..0.1));
            }
        }
        // Rotation quaternion, roughly unit.
        body.put_u32_le(time);
        body.put_u8(3);
        body.put_bytes(0, 3);
        for _ in 0..3 {
            body.put_f32_le(rng.gen_range(-0.05..0.05));
        }
        body.put_f32_le(1.0);
        body
    }

    fn apply_oscillator(&mut self, mut data: &[u8]) {
        if data.len() != 17 {
            debug!("oscillator body of {} bytes ignored", data.len());
            return;
        }
        let index = data.get_u8() as usize;
        let Some(motor) = self.motors.get_mut(index) else {
            return;
        };
        motor.frequency = data.get_f32_le();
        motor.amplitude = data.get_f32_le();
        motor.offset = data.get_f32_le();
        motor.phase_shift = data.get_f32_le();
    }
}

async fn reply(socket: &UdpSocket, frame: &[u8], to: SocketAddr) {
    if let Err(e) = socket.send_to(frame, to).await {
        warn!("send to {to} failed: {e}");
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "edmo_simulator=info".into()),
        )
        .init();

    let args = Args::parse();
    let mut robot = SimRobot::new(args.identifier.clone());

    let socket = UdpSocket::bind(("0.0.0.0", args.port)).await?;
    info!(
        "🤖 {} listening on UDP {}",
        args.identifier,
        socket.local_addr()?
    );

    let mut buf = vec![0u8; 2048];
    loop {
        let (len, src) = match socket.recv_from(&mut buf).await {
            Ok(received) => received,
            Err(e) => {
                warn!("recv error: {e}");
                continue;
            }
        };

        let command = try_parse(&buf[..len]);
        match command.instruction {
            Instruction::Identify => {
                debug!("probed by {src}");
                reply(
                    &socket,
                    &encode(Instruction::Identify, robot.identifier.as_bytes()),
                    src,
                )
                .await;
            }
            Instruction::SessionStart => {
                if let Ok(bytes) = <[u8; 4]>::try_from(command.data.as_slice()) {
                    robot.session_offset_ms = u32::from_le_bytes(bytes);
                    robot.started = Instant::now();
                    info!("session started, clock offset {}ms", robot.session_offset_ms);
                }
            }
            Instruction::GetTime => {
                reply(
                    &socket,
                    &encode(Instruction::GetTime, &robot.clock_ms().to_le_bytes()),
                    src,
                )
                .await;
            }
            Instruction::UpdateOscillator => robot.apply_oscillator(&command.data),
            Instruction::SendMotorData => {
                for index in 0..robot.motors.len() {
                    reply(
                        &socket,
                        &encode(Instruction::SendMotorData, &robot.motor_report(index)),
                        src,
                    )
                    .await;
                }
            }
            Instruction::SendImuData => {
                reply(
                    &socket,
                    &encode(Instruction::SendImuData, &robot.imu_report()),
                    src,
                )
                .await;
            }
            Instruction::Invalid => debug!("malformed datagram from {src} dropped"),
        }
    }
}
