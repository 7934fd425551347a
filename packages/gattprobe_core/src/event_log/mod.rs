//! Append-only structured event log
//!
//! Every state transition and anomaly of a session lands here as an
//! `Event`. Events are immutable once appended and their order is the
//! causal order in which they happened. At session end the log is
//! exported as a single JSON report (see `report`).

pub mod report;

use chrono::{DateTime, Local};
use serde::Serialize;
use tokio::time::Instant;

use crate::ble::transport::ChannelId;
use crate::session::anomaly::AnomalyKind;

pub use report::{AttackType, EventLogError, ReportOutcome, ReportSummary, SessionReport};

/// Everything that can happen during a session.
///
/// Serialized adjacently tagged so each event exports as
/// `{"event": "KIND", "details": {...}}`.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", content = "details", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventKind {
    ConnectionEstablished {
        target: String,
        rssi: Option<i16>,
    },
    ConnectionFailed {
        target: String,
        error: String,
    },
    SubscriptionFailed {
        channel: ChannelId,
        error: String,
    },
    ConnectionLost {
        reason: String,
        uptime_seconds: f64,
    },
    ReconnectionAttempt {
        attempt: u32,
    },
    ReconnectionFailed {
        attempt: u32,
        error: String,
        backoff_seconds: f64,
    },
    KeepAlive {
        count: u32,
        command: String,
    },
    KeepAliveFailed {
        error: String,
    },
    ResponseReceived {
        channel: ChannelId,
        data: String,
        ascii: String,
        size: usize,
    },
    AnomalyDetected {
        #[serde(rename = "type")]
        kind: AnomalyKind,
        description: String,
    },
    PayloadSent {
        name: String,
        size: usize,
        payload_hex: String,
        preview: String,
    },
    DeviceCrash {
        payload: String,
        reason: String,
    },
    SendError {
        payload: String,
        error: String,
    },
    ValidationFailed {
        input: String,
        error: String,
    },
    StepStarted {
        index: usize,
        command: String,
        description: String,
        wall_clock: DateTime<Local>,
    },
    StepCompleted {
        index: usize,
        command: String,
        outcome: String,
        wall_clock: DateTime<Local>,
    },
    CategoryCompleted {
        category: String,
        payloads: usize,
    },
    StopRequested {
        elapsed_seconds: f64,
    },
    Disconnected {
        error: Option<String>,
    },
    CampaignAborted {
        after_steps: usize,
        reason: String,
    },
    AttackComplete {
        uptime: f64,
        keep_alive_count: u32,
        reconnect_count: u32,
        payloads_sent: usize,
        crashes_detected: usize,
        anomalies_detected: usize,
    },
}

impl EventKind {
    /// The exported tag of this kind, e.g. `KEEP_ALIVE`.
    pub fn name(&self) -> &'static str {
        match self {
            EventKind::ConnectionEstablished { .. } => "CONNECTION_ESTABLISHED",
            EventKind::ConnectionFailed { .. } => "CONNECTION_FAILED",
            EventKind::SubscriptionFailed { .. } => "SUBSCRIPTION_FAILED",
            EventKind::ConnectionLost { .. } => "CONNECTION_LOST",
            EventKind::ReconnectionAttempt { .. } => "RECONNECTION_ATTEMPT",
            EventKind::ReconnectionFailed { .. } => "RECONNECTION_FAILED",
            EventKind::KeepAlive { .. } => "KEEP_ALIVE",
            EventKind::KeepAliveFailed { .. } => "KEEP_ALIVE_FAILED",
            EventKind::ResponseReceived { .. } => "RESPONSE_RECEIVED",
            EventKind::AnomalyDetected { .. } => "ANOMALY_DETECTED",
            EventKind::PayloadSent { .. } => "PAYLOAD_SENT",
            EventKind::DeviceCrash { .. } => "DEVICE_CRASH",
            EventKind::SendError { .. } => "SEND_ERROR",
            EventKind::ValidationFailed { .. } => "VALIDATION_FAILED",
            EventKind::StepStarted { .. } => "STEP_STARTED",
            EventKind::StepCompleted { .. } => "STEP_COMPLETED",
            EventKind::CategoryCompleted { .. } => "CATEGORY_COMPLETED",
            EventKind::StopRequested { .. } => "STOP_REQUESTED",
            EventKind::Disconnected { .. } => "DISCONNECTED",
            EventKind::CampaignAborted { .. } => "CAMPAIGN_ABORTED",
            EventKind::AttackComplete { .. } => "ATTACK_COMPLETE",
        }
    }

    /// Write the console line for this event through the `log` facade.
    fn emit(&self) {
        match self {
            EventKind::ConnectionEstablished { target, rssi } => match rssi {
                Some(rssi) => log::info!("[+] Connected to {} ({} dBm)", target, rssi),
                None => log::info!("[+] Connected to {}", target),
            },
            EventKind::ConnectionFailed { target, error } => {
                log::error!("[-] Connection to {} failed: {}", target, error)
            }
            EventKind::SubscriptionFailed { channel, error } => {
                log::warn!("[!] Could not subscribe to {} notifications: {}", channel, error)
            }
            EventKind::ConnectionLost { reason, uptime_seconds } => {
                log::warn!("[-] Connection lost after {:.1}s: {}", uptime_seconds, reason)
            }
            EventKind::ReconnectionAttempt { attempt } => {
                log::info!("[~] Reconnection attempt #{}", attempt)
            }
            EventKind::ReconnectionFailed { attempt, error, backoff_seconds } => log::warn!(
                "[-] Reconnection #{} failed ({}), retrying in {:.0}s",
                attempt,
                error,
                backoff_seconds
            ),
            EventKind::KeepAlive { count, .. } => log::info!("[*] Keep-alive #{} sent", count),
            EventKind::KeepAliveFailed { error } => log::warn!("[!] Keep-alive failed: {}", error),
            EventKind::ResponseReceived { data, .. } => log::info!("[<] Response: {}", data),
            EventKind::AnomalyDetected { kind, description } => {
                log::warn!("[!] ANOMALY {}: {}", kind, description)
            }
            EventKind::PayloadSent { name, size, preview, .. } => {
                log::info!("[>] {}: {} bytes -> {}", name, size, preview)
            }
            EventKind::DeviceCrash { payload, reason } => {
                log::warn!("[!] CRASH after {}: {}", payload, reason)
            }
            EventKind::SendError { payload, error } => {
                log::warn!("[-] Sending {} failed: {}", payload, error)
            }
            EventKind::ValidationFailed { input, error } => {
                log::error!("[-] Rejected input {:?}: {}", input, error)
            }
            EventKind::StepStarted { index, command, .. } => {
                log::info!("[>] Step {}: {}", index, command)
            }
            EventKind::StepCompleted { index, outcome, .. } => {
                log::debug!("Step {} finished: {}", index, outcome)
            }
            EventKind::CategoryCompleted { category, .. } => {
                log::info!("[+] Category '{}' completed", category)
            }
            EventKind::StopRequested { elapsed_seconds } => {
                log::info!("[!] Stop requested after {:.1}s", elapsed_seconds)
            }
            EventKind::Disconnected { error: None } => log::info!("[+] Disconnected"),
            EventKind::Disconnected { error: Some(error) } => {
                log::warn!("[!] Disconnect error: {}", error)
            }
            EventKind::CampaignAborted { after_steps, reason } => {
                log::error!("[-] Campaign aborted after {} steps: {}", after_steps, reason)
            }
            EventKind::AttackComplete { uptime, .. } => {
                log::info!("[+] Session complete: {:.1}s connected", uptime)
            }
        }
    }
}

/// One entry of the event log.
#[derive(Debug, Clone, Serialize)]
pub struct Event {
    /// Seconds since the log was created, from the monotonic clock.
    pub timestamp: f64,
    /// Local wall-clock time the event was recorded.
    pub datetime: DateTime<Local>,
    #[serde(flatten)]
    pub kind: EventKind,
}

/// Ordered, append-only sequence of events.
#[derive(Debug)]
pub struct EventLog {
    started: Instant,
    events: Vec<Event>,
}

impl Default for EventLog {
    fn default() -> Self {
        Self::new()
    }
}

impl EventLog {
    pub fn new() -> Self {
        Self {
            started: Instant::now(),
            events: Vec::new(),
        }
    }

    /// Record an event and echo it to the console log.
    pub fn append(&mut self, kind: EventKind) -> &Event {
        kind.emit();
        self.events.push(Event {
            timestamp: self.started.elapsed().as_secs_f64(),
            datetime: Local::now(),
            kind,
        });
        &self.events[self.events.len() - 1]
    }

    pub fn events(&self) -> &[Event] {
        &self.events
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    /// Number of events whose exported tag is `name`.
    pub fn count(&self, name: &str) -> usize {
        self.events.iter().filter(|e| e.kind.name() == name).count()
    }

    pub fn last(&self) -> Option<&Event> {
        self.events.last()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test(start_paused = true)]
    async fn test_events_keep_append_order_and_monotonic_time() {
        let mut log = EventLog::new();
        log.append(EventKind::ReconnectionAttempt { attempt: 1 });
        tokio::time::sleep(Duration::from_secs(3)).await;
        log.append(EventKind::ReconnectionAttempt { attempt: 2 });

        let events = log.events();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].kind, EventKind::ReconnectionAttempt { attempt: 1 });
        assert_eq!(events[1].kind, EventKind::ReconnectionAttempt { attempt: 2 });
        assert!(events[1].timestamp - events[0].timestamp >= 3.0);
    }

    #[test]
    fn test_event_serializes_as_flat_record() {
        let mut log = EventLog::new();
        log.append(EventKind::KeepAlive {
            count: 3,
            command: "ff000000".into(),
        });

        let value = serde_json::to_value(&log.events()[0]).unwrap();
        assert_eq!(value["event"], "KEEP_ALIVE");
        assert_eq!(value["details"]["count"], 3);
        assert_eq!(value["details"]["command"], "ff000000");
        assert!(value["timestamp"].is_number());
        assert!(value["datetime"].is_string());
    }

    #[test]
    fn test_count_by_name() {
        let mut log = EventLog::new();
        log.append(EventKind::StopRequested { elapsed_seconds: 1.0 });
        log.append(EventKind::Disconnected { error: None });
        log.append(EventKind::Disconnected {
            error: Some("gone".into()),
        });
        assert_eq!(log.count("DISCONNECTED"), 2);
        assert_eq!(log.count("STOP_REQUESTED"), 1);
        assert_eq!(log.count("KEEP_ALIVE"), 0);
        assert_eq!(log.last().unwrap().kind.name(), "DISCONNECTED");
    }

    #[test]
    fn test_anomaly_type_field_name() {
        let value = serde_json::to_value(EventKind::AnomalyDetected {
            kind: AnomalyKind::OversizedResponse,
            description: "big".into(),
        })
        .unwrap();
        assert_eq!(value["event"], "ANOMALY_DETECTED");
        assert_eq!(value["details"]["type"], "OVERSIZED_RESPONSE");
    }
}
