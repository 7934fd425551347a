//! JSON export of a finished session

use std::path::Path;

use serde::Serialize;
use thiserror::Error;

use super::Event;
use crate::session::SessionDuration;

#[derive(Error, Debug)]
pub enum EventLogError {
    #[error("Serialization error: {0}")]
    SerializationError(String),

    #[error("IO error: {0}")]
    IoError(String),
}

/// Which kind of campaign produced the log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum AttackType {
    #[serde(rename = "BLE_CONNECTION_HIJACKING")]
    ConnectionHijacking,
    #[serde(rename = "BLE_PAYLOAD_INJECTION")]
    PayloadInjection,
    #[serde(rename = "BLE_COMMAND_PLAYBACK")]
    CommandPlayback,
}

/// How the run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ReportOutcome {
    Completed,
    Aborted { after_steps: usize },
    ConnectFailed,
}

/// Counters summarizing the run.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ReportSummary {
    pub uptime_seconds: f64,
    pub keep_alive_count: u32,
    pub reconnect_count: u32,
    pub payloads_sent: usize,
    pub crashes_detected: usize,
    pub anomalies_detected: usize,
}

/// The exported document.
#[derive(Debug, Serialize)]
pub struct SessionReport<'a> {
    pub attack_type: AttackType,
    pub target_address: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration: Option<SessionDuration>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mode: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub custom_payload: Option<String>,
    pub keep_alive_enabled: bool,
    pub aggressive_mode: bool,
    pub summary: ReportSummary,
    pub outcome: ReportOutcome,
    pub events: &'a [Event],
}

impl<'a> SessionReport<'a> {
    pub fn to_json(&self) -> Result<String, EventLogError> {
        serde_json::to_string_pretty(self)
            .map_err(|e| EventLogError::SerializationError(e.to_string()))
    }

    /// Write the report to `path`, replacing any existing file.
    pub fn write_to(&self, path: &Path) -> Result<(), EventLogError> {
        let json = self.to_json()?;
        std::fs::write(path, json).map_err(|e| EventLogError::IoError(e.to_string()))?;
        log::info!("[+] Log exported to {}", path.display());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event_log::{EventKind, EventLog};
    use std::time::Duration;

    fn sample_log() -> EventLog {
        let mut log = EventLog::new();
        log.append(EventKind::ConnectionEstablished {
            target: "AA:BB:CC:DD:EE:FF".into(),
            rssi: Some(-50),
        });
        log.append(EventKind::AttackComplete {
            uptime: 10.0,
            keep_alive_count: 0,
            reconnect_count: 0,
            payloads_sent: 0,
            crashes_detected: 0,
            anomalies_detected: 0,
        });
        log
    }

    #[test]
    fn test_report_shape() {
        let log = sample_log();
        let report = SessionReport {
            attack_type: AttackType::ConnectionHijacking,
            target_address: "AA:BB:CC:DD:EE:FF".into(),
            duration: Some(SessionDuration::Bounded(Duration::from_secs(10))),
            mode: None,
            custom_payload: None,
            keep_alive_enabled: false,
            aggressive_mode: false,
            summary: ReportSummary {
                uptime_seconds: 10.0,
                ..Default::default()
            },
            outcome: ReportOutcome::Completed,
            events: log.events(),
        };

        let value: serde_json::Value = serde_json::from_str(&report.to_json().unwrap()).unwrap();
        assert_eq!(value["attack_type"], "BLE_CONNECTION_HIJACKING");
        assert_eq!(value["target_address"], "AA:BB:CC:DD:EE:FF");
        assert_eq!(value["duration"], 10.0);
        assert!(value.get("mode").is_none());
        assert_eq!(value["summary"]["uptime_seconds"], 10.0);
        assert_eq!(value["outcome"]["status"], "completed");
        assert_eq!(value["events"].as_array().unwrap().len(), 2);
        assert_eq!(value["events"][0]["event"], "CONNECTION_ESTABLISHED");
        assert_eq!(value["events"][0]["details"]["rssi"], -50);
    }

    #[test]
    fn test_unbounded_duration_and_aborted_outcome() {
        let log = EventLog::new();
        let report = SessionReport {
            attack_type: AttackType::PayloadInjection,
            target_address: "AA:BB:CC:DD:EE:FF".into(),
            duration: Some(SessionDuration::Unbounded),
            mode: Some("overflow".into()),
            custom_payload: None,
            keep_alive_enabled: false,
            aggressive_mode: false,
            summary: ReportSummary::default(),
            outcome: ReportOutcome::Aborted { after_steps: 4 },
            events: log.events(),
        };

        let value: serde_json::Value = serde_json::from_str(&report.to_json().unwrap()).unwrap();
        assert_eq!(value["duration"], "infinite");
        assert_eq!(value["mode"], "overflow");
        assert_eq!(value["outcome"]["status"], "aborted");
        assert_eq!(value["outcome"]["after_steps"], 4);
    }

    #[test]
    fn test_write_to_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("session.json");
        let log = sample_log();
        let report = SessionReport {
            attack_type: AttackType::CommandPlayback,
            target_address: "AA:BB:CC:DD:EE:FF".into(),
            duration: None,
            mode: Some("full".into()),
            custom_payload: None,
            keep_alive_enabled: false,
            aggressive_mode: false,
            summary: ReportSummary::default(),
            outcome: ReportOutcome::Completed,
            events: log.events(),
        };
        report.write_to(&path).unwrap();

        let written: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(written["attack_type"], "BLE_COMMAND_PLAYBACK");
    }

    #[test]
    fn test_write_to_missing_directory_fails() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("missing").join("session.json");
        let log = EventLog::new();
        let report = SessionReport {
            attack_type: AttackType::CommandPlayback,
            target_address: String::new(),
            duration: None,
            mode: None,
            custom_payload: None,
            keep_alive_enabled: false,
            aggressive_mode: false,
            summary: ReportSummary::default(),
            outcome: ReportOutcome::ConnectFailed,
            events: log.events(),
        };
        assert!(matches!(report.write_to(&path), Err(EventLogError::IoError(_))));
    }
}
