//! Campaign driver
//!
//! A campaign is an ordered run of commands or payloads against the one
//! session a `SessionController` holds. The driver never touches the
//! transport: it only sees `PayloadOutcome`s and decides whether to
//! continue, reconnect once, or abort.
//!
//! Three campaigns exist: holding the link (`hold`), fuzzing the command
//! characteristic (`fuzz`) and fixed command playback (`playback`). Each
//! connects first, always disconnects at the end, and closes the log with
//! `ATTACK_COMPLETE` or `CAMPAIGN_ABORTED`.

pub mod catalog;
pub mod fuzz;
pub mod hold;
pub mod playback;

use thiserror::Error;
use tokio::sync::watch;

use crate::event_log::{EventKind, ReportOutcome, ReportSummary};
use crate::session::controller::pause;
use crate::session::{ConnectError, SessionController};

pub use catalog::{FuzzCategory, FuzzSelection, PlaybackStep};
pub use fuzz::{run_fuzz, FuzzTarget};
pub use hold::{run_hold, HoldParams};
pub use playback::{parse_marker, run_playback, Marker, TimestampFile};

/// User input that cannot be turned into something to send.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("Invalid hex payload {input:?}: {reason}")]
    InvalidHex { input: String, reason: String },

    #[error("Payload is empty")]
    EmptyPayload,

    #[error("Unknown payload category: {0}")]
    UnknownCategory(String),

    #[error("Unknown command: {0}")]
    UnknownCommand(String),
}

/// Why a campaign could not run at all.
#[derive(Error, Debug)]
pub enum CampaignError {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error(transparent)]
    Connect(#[from] ConnectError),
}

/// Decode a user-supplied hex payload.
///
/// Case-insensitive; whitespace anywhere is ignored.
pub fn decode_hex(input: &str) -> Result<Vec<u8>, ValidationError> {
    let compact: String = input.chars().filter(|c| !c.is_whitespace()).collect();
    if compact.is_empty() {
        return Err(ValidationError::EmptyPayload);
    }
    hex::decode(&compact).map_err(|e| ValidationError::InvalidHex {
        input: input.to_string(),
        reason: e.to_string(),
    })
}

/// The `VALIDATION_FAILED` event for `input` that could not be used.
pub fn rejection(input: &str, error: &ValidationError) -> EventKind {
    EventKind::ValidationFailed {
        input: input.to_string(),
        error: error.to_string(),
    }
}

/// Canonical (lower-case, unspaced) hex of `bytes`.
pub fn encode_hex(bytes: &[u8]) -> String {
    hex::encode(bytes)
}

/// How a campaign ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CampaignOutcome {
    Completed,
    Aborted { after_steps: usize },
}

impl CampaignOutcome {
    pub fn is_completed(&self) -> bool {
        matches!(self, CampaignOutcome::Completed)
    }

    pub fn report_outcome(&self) -> ReportOutcome {
        match self {
            CampaignOutcome::Completed => ReportOutcome::Completed,
            CampaignOutcome::Aborted { after_steps } => ReportOutcome::Aborted {
                after_steps: *after_steps,
            },
        }
    }
}

impl std::fmt::Display for CampaignOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CampaignOutcome::Completed => write!(f, "completed"),
            CampaignOutcome::Aborted { after_steps } => {
                write!(f, "aborted after {} steps", after_steps)
            }
        }
    }
}

/// Counters gathered over a campaign window.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CampaignStats {
    /// Steps attempted, whatever their outcome.
    pub steps: usize,
    pub payloads_sent: usize,
    pub crashes_detected: usize,
    pub anomalies_detected: usize,
    pub categories_completed: Vec<String>,
}

/// Result of a campaign that got past its initial connect.
#[derive(Debug, Clone, PartialEq)]
pub struct CampaignReport {
    pub outcome: CampaignOutcome,
    pub stats: CampaignStats,
    pub summary: ReportSummary,
}

/// How a recovery attempt ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Recovery {
    Reconnected,
    Stopped,
    Failed,
}

/// Cool down after a lost link, then try exactly one reconnect.
///
/// A stop request during the cool-down skips the reconnect.
async fn recover(controller: &mut SessionController, stop: &watch::Receiver<bool>) -> Recovery {
    let cooldown = controller.config().crash_cooldown();
    log::info!("[*] Reconnecting in {:.0}s...", cooldown.as_secs_f64());
    let mut stop = stop.clone();
    pause(cooldown, &mut stop).await;
    if stop_requested(&stop) {
        return Recovery::Stopped;
    }
    match controller.reconnect().await {
        Ok(()) => Recovery::Reconnected,
        Err(e) => {
            log::error!("[-] Could not reconnect: {}", e);
            Recovery::Failed
        }
    }
}

fn stop_requested(stop: &watch::Receiver<bool>) -> bool {
    *stop.borrow()
}

/// Disconnect, write the closing event and build the report.
async fn finish(
    controller: &mut SessionController,
    outcome: CampaignOutcome,
    mut stats: CampaignStats,
    anomaly_baseline: usize,
    abort_reason: Option<String>,
) -> CampaignReport {
    controller.disconnect().await;
    let session = controller.summary();
    stats.anomalies_detected = session.anomalies_emitted - anomaly_baseline;
    log::debug!("Session with {} ended {:?}", session.peer, session.state);

    let summary = ReportSummary {
        uptime_seconds: session.uptime.as_secs_f64(),
        keep_alive_count: session.keep_alive_count,
        reconnect_count: session.reconnect_count,
        payloads_sent: stats.payloads_sent,
        crashes_detected: stats.crashes_detected,
        anomalies_detected: stats.anomalies_detected,
    };

    match outcome {
        CampaignOutcome::Completed => controller.record(EventKind::AttackComplete {
            uptime: summary.uptime_seconds,
            keep_alive_count: summary.keep_alive_count,
            reconnect_count: summary.reconnect_count,
            payloads_sent: summary.payloads_sent,
            crashes_detected: summary.crashes_detected,
            anomalies_detected: summary.anomalies_detected,
        }),
        CampaignOutcome::Aborted { after_steps } => controller.record(EventKind::CampaignAborted {
            after_steps,
            reason: abort_reason.unwrap_or_else(|| "aborted".to_string()),
        }),
    }

    CampaignReport {
        outcome,
        stats,
        summary,
    }
}
