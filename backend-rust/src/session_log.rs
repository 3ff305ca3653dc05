//! Buffered per-channel session log sink.
//!
//! One logger per session, append-only, laid out as
//! `<root>/YYYY.MM.DD/<identifier>/HH.MM.SS/<channel>.log`. Lines are stamped
//! with the time since session start. Writes land in per-channel memory
//! buffers; files are touched at most once per flush interval so high-rate
//! telemetry does not turn into per-line disk I/O.

use std::collections::HashMap;
use std::fmt::Write as _;
use std::path::PathBuf;
use std::time::{Duration, Instant};

use chrono::Local;
use tokio::fs::OpenOptions;
use tokio::io::AsyncWriteExt;
use tracing::warn;

const FLUSH_INTERVAL: Duration = Duration::from_secs(5);

pub struct SessionLog {
    dir: PathBuf,
    started: Instant,
    channels: HashMap<String, String>,
    last_flush: Instant,
}

impl SessionLog {
    pub fn new(identifier: &str) -> Self {
        Self::with_root("./SessionLogs", identifier)
    }

    pub fn with_root(root: impl Into<PathBuf>, identifier: &str) -> Self {
        let now = Local::now();
        let dir = root
            .into()
            .join(now.format("%Y.%m.%d").to_string())
            .join(identifier)
            .join(now.format("%H.%M.%S").to_string());

        if let Err(e) = std::fs::create_dir_all(&dir) {
            warn!("session log: could not create {}: {e}", dir.display());
        }

        let started = Instant::now();
        Self {
            dir,
            started,
            channels: HashMap::new(),
            last_flush: started,
        }
    }

    /// Append one line to a channel, stamped `H:MM:SS.ffffff` relative to
    /// session start.
    pub fn write(&mut self, channel: &str, message: impl AsRef<str>) {
        let stamp = format_elapsed(self.started.elapsed());
        let buf = self.channels.entry(channel.to_string()).or_default();
        let _ = writeln!(buf, "{stamp}: {}", message.as_ref());
    }

    /// Periodic flush, called from the session tick.
    pub async fn update(&mut self) {
        if self.last_flush.elapsed() < FLUSH_INTERVAL {
            return;
        }
        self.flush().await;
    }

    /// Append every non-empty buffer to its channel file. I/O failures are
    /// logged and the buffer discarded; they never surface to the tick.
    pub async fn flush(&mut self) {
        self.last_flush = Instant::now();

        for (channel, content) in &mut self.channels {
            if content.is_empty() {
                continue;
            }
            let path = self.dir.join(format!("{channel}.log"));
            match OpenOptions::new().create(true).append(true).open(&path).await {
                Ok(mut file) => {
                    if let Err(e) = file.write_all(content.as_bytes()).await {
                        warn!("session log: write to {} failed: {e}", path.display());
                    }
                }
                Err(e) => {
                    warn!("session log: could not open {}: {e}", path.display());
                }
            }
            content.clear();
        }
    }
}

fn format_elapsed(elapsed: Duration) -> String {
    let secs = elapsed.as_secs();
    format!(
        "{}:{:02}:{:02}.{:06}",
        secs / 3600,
        secs % 3600 / 60,
        secs % 60,
        elapsed.subsec_micros()
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn elapsed_stamp_matches_session_clock_format() {
        assert_eq!(format_elapsed(Duration::from_micros(0)), "0:00:00.000000");
        assert_eq!(
            format_elapsed(Duration::new(3 * 3600 + 62, 1_500)),
            "3:01:02.000001"
        );
        assert_eq!(
            format_elapsed(Duration::new(59, 123_456_000)),
            "0:00:59.123456"
        );
    }

    #[tokio::test]
    async fn buffers_then_appends_per_channel_files() {
        let root = std::env::temp_dir().join(format!("edmo-log-{}", uuid::Uuid::new_v4()));
        let mut log = SessionLog::with_root(&root, "R1");

        log.write("Session", "Player 0 connected. (Alice)");
        log.write("Motor0", "Frequency: 0.5");
        log.write("Motor0", "Frequency: 0.6");

        // Nothing on disk before an explicit flush.
        assert!(!log.dir.join("Session.log").exists());

        log.flush().await;

        let session = std::fs::read_to_string(log.dir.join("Session.log")).unwrap();
        assert!(session.ends_with("Player 0 connected. (Alice)\n"));
        let motor = std::fs::read_to_string(log.dir.join("Motor0.log")).unwrap();
        assert_eq!(motor.lines().count(), 2);

        // Buffers drain on flush; a second flush appends nothing new.
        log.flush().await;
        let motor_again = std::fs::read_to_string(log.dir.join("Motor0.log")).unwrap();
        assert_eq!(motor_again, motor);

        std::fs::remove_dir_all(&root).ok();
    }
}
