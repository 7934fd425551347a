//! Resilient single-peer session control
//!
//! The `SessionController` owns the one BLE link of a run. It drives the
//! connection state machine, paces keep-alives, decides when a lost link
//! is retried or abandoned, and screens every notification for anomalies.
//! Nothing else in the crate touches the transport.

pub mod anomaly;
pub mod config;
pub mod controller;

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::{Serialize, Serializer};
use thiserror::Error;
use tokio::time::Instant;

use crate::ble::transport::BleAddress;

pub use anomaly::{AnomalyHeuristics, AnomalyKind, AnomalySignal};
pub use config::{ConfigError, SessionConfig};
pub use controller::{LoopExit, MaintainOutcome, SessionController};

/// Connection lifecycle.
///
/// `Disconnected → Connecting → Connected → (Monitoring | Degraded) →
/// Disconnected`. `Monitoring` means the hold loop is running on a live
/// link, `Degraded` that a loss was detected and not yet recovered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Disconnected,
    Connecting,
    Connected,
    Monitoring,
    Degraded,
}

/// How long to hold the link.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionDuration {
    Bounded(Duration),
    Unbounded,
}

impl SessionDuration {
    /// Whether `elapsed` has used up the budget.
    pub fn is_expired(&self, elapsed: Duration) -> bool {
        match self {
            SessionDuration::Bounded(limit) => elapsed >= *limit,
            SessionDuration::Unbounded => false,
        }
    }

    /// Budget left after `elapsed`, `None` when unbounded.
    pub fn remaining(&self, elapsed: Duration) -> Option<Duration> {
        match self {
            SessionDuration::Bounded(limit) => Some(limit.saturating_sub(elapsed)),
            SessionDuration::Unbounded => None,
        }
    }
}

impl FromStr for SessionDuration {
    type Err = String;

    /// Accepts a non-negative number of seconds, or `inf` / `unbounded`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        match trimmed.to_ascii_lowercase().as_str() {
            "inf" | "infinite" | "unbounded" => return Ok(SessionDuration::Unbounded),
            _ => {}
        }
        let secs: f64 = trimmed
            .parse()
            .map_err(|_| format!("'{}' is not a number of seconds or 'inf'", s))?;
        if !secs.is_finite() || secs < 0.0 {
            return Err(format!("duration must be a non-negative number, got '{}'", s));
        }
        Duration::try_from_secs_f64(secs)
            .map(SessionDuration::Bounded)
            .map_err(|e| format!("duration '{}' is out of range: {}", s, e))
    }
}

impl fmt::Display for SessionDuration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionDuration::Bounded(d) => write!(f, "{}s", d.as_secs_f64()),
            SessionDuration::Unbounded => write!(f, "unbounded"),
        }
    }
}

impl Serialize for SessionDuration {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            SessionDuration::Bounded(d) => serializer.serialize_f64(d.as_secs_f64()),
            SessionDuration::Unbounded => serializer.serialize_str("infinite"),
        }
    }
}

/// Mutable state of the one session a controller owns.
#[derive(Debug, Clone)]
pub struct Session {
    pub peer: BleAddress,
    pub state: SessionState,
    /// Start of the current connected interval, if connected.
    pub connection_start: Option<Instant>,
    /// Sum of all closed connected intervals.
    pub accumulated_uptime: Duration,
    /// Successful re-establishments after a detected loss.
    pub reconnect_count: u32,
    pub keep_alive_count: u32,
}

impl Session {
    fn new(peer: BleAddress) -> Self {
        Self {
            peer,
            state: SessionState::Disconnected,
            connection_start: None,
            accumulated_uptime: Duration::ZERO,
            reconnect_count: 0,
            keep_alive_count: 0,
        }
    }

    /// Closed intervals plus the one currently open.
    pub fn uptime(&self) -> Duration {
        self.accumulated_uptime
            + self
                .connection_start
                .map(|start| start.elapsed())
                .unwrap_or(Duration::ZERO)
    }

    /// Close the open connected interval, returning its length.
    fn close_interval(&mut self) -> Duration {
        match self.connection_start.take() {
            Some(start) => {
                let interval = start.elapsed();
                self.accumulated_uptime += interval;
                interval
            }
            None => Duration::ZERO,
        }
    }
}

/// Snapshot handed to reports at session end.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionSummary {
    pub peer: BleAddress,
    pub state: SessionState,
    pub uptime: Duration,
    pub reconnect_count: u32,
    pub keep_alive_count: u32,
    pub anomalies_emitted: usize,
}

/// Why a connect attempt failed.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConnectError {
    #[error("Peer {peer} unreachable: {reason}")]
    PeerUnreachable { peer: BleAddress, reason: String },

    #[error("Connecting to {peer} timed out after {after:?}")]
    Timeout { peer: BleAddress, after: Duration },

    #[error("Peer {peer} does not expose the expected GATT layout: {reason}")]
    ProtocolMismatch { peer: BleAddress, reason: String },
}

/// Result of pushing one payload through the session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PayloadOutcome {
    /// Written and the link survived the settle delay.
    Delivered,
    /// The link dropped right after the write: a crash signal.
    DeviceUnresponsive,
    /// The link was already down, nothing was written.
    LinkDown,
    /// The write itself failed while the link stayed up.
    TransportError(String),
}

impl PayloadOutcome {
    pub fn label(&self) -> &'static str {
        match self {
            PayloadOutcome::Delivered => "delivered",
            PayloadOutcome::DeviceUnresponsive => "device_unresponsive",
            PayloadOutcome::LinkDown => "link_down",
            PayloadOutcome::TransportError(_) => "transport_error",
        }
    }

    /// Whether the bytes left this host as far as the session can tell.
    pub fn was_sent(&self) -> bool {
        matches!(
            self,
            PayloadOutcome::Delivered | PayloadOutcome::DeviceUnresponsive
        )
    }
}
