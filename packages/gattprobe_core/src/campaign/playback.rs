//! Fixed command playback with wall-clock step markers
//!
//! Each step is bracketed by `STEP_STARTED` / `STEP_COMPLETED` events that
//! carry the local wall clock, and optionally by a line in a plain-text
//! timestamp file, so the run can be lined up afterwards with a capture
//! taken by an independent sniffer.

use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Local};
use tokio::sync::watch;
use tokio::time::Instant;

use super::catalog::PlaybackStep;
use super::{
    finish, recover, stop_requested, CampaignError, CampaignOutcome, CampaignReport,
    CampaignStats, Recovery,
};
use crate::ble::transport::WriteMode;
use crate::event_log::{EventKind, EventLogError};
use crate::session::controller::pause;
use crate::session::{PayloadOutcome, SessionController};

/// Append-only text file of correlation markers.
#[derive(Debug, Clone)]
pub struct TimestampFile {
    path: PathBuf,
}

impl TimestampFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append `[YYYY-MM-DD HH:MM:SS.mmm] [epoch] EVENT: description`.
    pub fn append(&self, event: &str, description: &str) -> Result<(), EventLogError> {
        let line = format_marker(Local::now(), event, description);
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .map_err(|e| EventLogError::IoError(e.to_string()))?;
        writeln!(file, "{}", line).map_err(|e| EventLogError::IoError(e.to_string()))
    }
}

fn format_marker(at: DateTime<Local>, event: &str, description: &str) -> String {
    format!(
        "[{}] [{:.3}] {}: {}",
        at.format("%Y-%m-%d %H:%M:%S%.3f"),
        at.timestamp_millis() as f64 / 1000.0,
        event,
        description
    )
}

/// One line of a timestamp file, read back.
#[derive(Debug, Clone, PartialEq)]
pub struct Marker {
    pub epoch: f64,
    pub event: String,
    pub description: String,
}

/// Parse a line written by `TimestampFile::append`.
///
/// Returns `None` for anything else, including blank lines.
pub fn parse_marker(line: &str) -> Option<Marker> {
    let rest = line.trim().strip_prefix('[')?;
    let (_, rest) = rest.split_once("] [")?;
    let (epoch, rest) = rest.split_once("] ")?;
    let (event, description) = rest.split_once(':')?;
    let epoch: f64 = epoch.parse().ok()?;
    if event.is_empty() || event.contains(char::is_whitespace) {
        return None;
    }
    Some(Marker {
        epoch,
        event: event.to_string(),
        description: description.trim().to_string(),
    })
}

fn mark(timestamps: Option<&TimestampFile>, event: &str, description: &str) {
    if let Some(file) = timestamps {
        if let Err(e) = file.append(event, description) {
            log::warn!("Could not write timestamp to {}: {}", file.path().display(), e);
        }
    }
}

/// Play `steps` once, in order.
///
/// Commands are written with acknowledgment and given the configured
/// command settle time before the step's own delay. A crash signal gets the
/// same cool-down and single reconnect as fuzzing; a failed reconnect aborts.
pub async fn run_playback(
    controller: &mut SessionController,
    name: &str,
    steps: &[PlaybackStep],
    timestamps: Option<&TimestampFile>,
    stop: &watch::Receiver<bool>,
) -> Result<CampaignReport, CampaignError> {
    controller.connect().await?;

    let started = Instant::now();
    let baseline = controller.anomalies_emitted();
    let settle = controller.config().command_settle();
    mark(
        timestamps,
        "ATTACK_START",
        &format!("Starting '{}' against {}", name, controller.peer()),
    );
    if steps.len() > 1 {
        mark(
            timestamps,
            "ATTACK_SEQUENCE",
            &format!("Sequence of {} commands", steps.len()),
        );
    }

    let mut stats = CampaignStats::default();
    let mut aborted: Option<String> = None;
    let mut step_stop = stop.clone();

    for (i, step) in steps.iter().enumerate() {
        if stop_requested(stop) {
            controller.record(EventKind::StopRequested {
                elapsed_seconds: started.elapsed().as_secs_f64(),
            });
            aborted = Some("stop requested".to_string());
            break;
        }

        let index = i + 1;
        let command = &step.command;
        controller.record(EventKind::StepStarted {
            index,
            command: command.id.clone(),
            description: command.description.clone(),
            wall_clock: Local::now(),
        });
        mark(
            timestamps,
            &format!("CMD_{}", command.id.to_uppercase()),
            &command.description,
        );

        stats.steps += 1;
        let outcome = controller
            .send_command(command, WriteMode::WithResponse, settle)
            .await;
        if outcome.was_sent() {
            stats.payloads_sent += 1;
        }
        controller.record(EventKind::StepCompleted {
            index,
            command: command.id.clone(),
            outcome: outcome.label().to_string(),
            wall_clock: Local::now(),
        });

        if matches!(
            outcome,
            PayloadOutcome::DeviceUnresponsive | PayloadOutcome::LinkDown
        ) {
            if outcome == PayloadOutcome::DeviceUnresponsive {
                stats.crashes_detected += 1;
            }
            match recover(controller, stop).await {
                Recovery::Reconnected => {}
                Recovery::Stopped => {
                    controller.record(EventKind::StopRequested {
                        elapsed_seconds: started.elapsed().as_secs_f64(),
                    });
                    aborted = Some("stop requested".to_string());
                    break;
                }
                Recovery::Failed => {
                    aborted = Some(format!("reconnect failed after {}", command.id));
                    break;
                }
            }
        }

        pause(step.delay, &mut step_stop).await;
    }

    let outcome = match aborted {
        Some(_) => CampaignOutcome::Aborted {
            after_steps: stats.steps,
        },
        None => CampaignOutcome::Completed,
    };
    mark(
        timestamps,
        "ATTACK_END",
        &format!(
            "'{}' {} in {:.3}s",
            name,
            outcome,
            started.elapsed().as_secs_f64()
        ),
    );
    Ok(finish(controller, outcome, stats, baseline, aborted).await)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_marker_format() {
        let at = Local.with_ymd_and_hms(2025, 11, 15, 14, 3, 9).unwrap();
        let line = format_marker(at, "CMD_HIJACK-ECO", "Hijack: force ECO mode");
        assert!(line.starts_with("[2025-11-15 14:03:09.000] ["));
        assert!(line.ends_with("] CMD_HIJACK-ECO: Hijack: force ECO mode"));
        let epoch = format!("[{:.3}]", at.timestamp() as f64);
        assert!(line.contains(&epoch));
    }

    #[test]
    fn test_marker_reads_back() {
        let at = Local.with_ymd_and_hms(2025, 11, 15, 14, 3, 9).unwrap();
        let line = format_marker(at, "ATTACK_START", "Starting 'full' against AA:BB:CC:DD:EE:FF");
        let marker = parse_marker(&line).unwrap();
        assert_eq!(marker.event, "ATTACK_START");
        assert_eq!(marker.description, "Starting 'full' against AA:BB:CC:DD:EE:FF");
        assert!((marker.epoch - at.timestamp() as f64).abs() < 1e-6);

        assert_eq!(parse_marker(""), None);
        assert_eq!(parse_marker("free text: not a marker"), None);
        assert_eq!(parse_marker("[2025-11-15 14:03:09.000] [abc] ATTACK_END: x"), None);
    }

    #[test]
    fn test_timestamp_file_appends() {
        let dir = tempfile::tempdir().unwrap();
        let file = TimestampFile::new(dir.path().join("attack_timestamps.txt"));
        file.append("ATTACK_START", "one").unwrap();
        file.append("ATTACK_END", "two").unwrap();

        let contents = std::fs::read_to_string(file.path()).unwrap();
        let lines: Vec<&str> = contents.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].ends_with("ATTACK_START: one"));
        assert!(lines[1].ends_with("ATTACK_END: two"));
    }
}
