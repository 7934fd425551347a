//! Command extraction from sniffer captures
//!
//! Runs `tshark` over a capture file, keeps the ATT Write Commands
//! (opcode 0x52) and decodes their values against the device's command
//! table. The capture format itself is tshark's business; this module only
//! reads its field output.
//!
//! Given the timestamp file of a playback run, decoded commands are also
//! labelled as attack or normal traffic by their capture epoch.

pub mod decode;
pub mod labels;

use std::path::{Path, PathBuf};

use chrono::{DateTime, Local};
use serde::Serialize;
use thiserror::Error;

pub use decode::{
    assess, decode_rows, parse_rows, AttWrite, CommandDetail, DecodedCommand, Finding, Severity,
};
pub use labels::{classify, load_attack_windows, parse_attack_windows, AttackWindow, TrafficLabel};

#[derive(Error, Debug)]
pub enum ExtractionError {
    #[error("Capture file not found: {0}")]
    MissingCapture(String),

    #[error("Failed to run {tool}: {reason}")]
    Spawn { tool: String, reason: String },

    #[error("{tool} exited with {status}: {stderr}")]
    ToolFailed {
        tool: String,
        status: String,
        stderr: String,
    },

    #[error("Serialization error: {0}")]
    SerializationError(String),

    #[error("IO error: {0}")]
    IoError(String),
}

/// Field separator requested from the tool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldFormat {
    Pipe,
    Csv,
}

impl FieldFormat {
    pub fn separator(&self) -> char {
        match self {
            FieldFormat::Pipe => '|',
            FieldFormat::Csv => ',',
        }
    }
}

/// Invokes tshark with a fixed filter and field list.
#[derive(Debug, Clone)]
pub struct TsharkExtractor {
    tool: PathBuf,
    format: FieldFormat,
}

impl Default for TsharkExtractor {
    fn default() -> Self {
        Self::new("tshark")
    }
}

impl TsharkExtractor {
    pub fn new(tool: impl Into<PathBuf>) -> Self {
        Self {
            tool: tool.into(),
            format: FieldFormat::Pipe,
        }
    }

    pub fn with_format(mut self, format: FieldFormat) -> Self {
        self.format = format;
        self
    }

    /// Arguments passed to the tool for `capture`.
    pub fn args(&self, capture: &Path) -> Vec<String> {
        let mut args = vec![
            "-r".to_string(),
            capture.to_string_lossy().into_owned(),
            "-Y".to_string(),
            "btatt.opcode == 0x52".to_string(),
            "-T".to_string(),
            "fields".to_string(),
        ];
        for field in [
            "frame.number",
            "frame.time_relative",
            "btatt.opcode",
            "btatt.opcode.method",
            "btatt.handle",
            "btatt.value",
            "frame.time_epoch",
        ] {
            args.push("-e".to_string());
            args.push(field.to_string());
        }
        args.push("-E".to_string());
        args.push(format!("separator={}", self.format.separator()));
        args
    }

    /// Run the tool and return its standard output.
    pub async fn run(&self, capture: &Path) -> Result<String, ExtractionError> {
        if !capture.exists() {
            return Err(ExtractionError::MissingCapture(capture.display().to_string()));
        }
        let tool = self.tool.display().to_string();
        log::debug!("Running {} {:?}", tool, self.args(capture));

        let output = tokio::process::Command::new(&self.tool)
            .args(self.args(capture))
            .output()
            .await
            .map_err(|e| ExtractionError::Spawn {
                tool: tool.clone(),
                reason: e.to_string(),
            })?;

        if !output.status.success() {
            return Err(ExtractionError::ToolFailed {
                tool,
                status: output.status.to_string(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    /// Run the tool and decode its output.
    pub async fn extract(&self, capture: &Path) -> Result<ExtractionReport, ExtractionError> {
        let stdout = self.run(capture).await?;
        let report = ExtractionReport::from_output(capture, &stdout, self.format.separator());
        log::info!(
            "[+] {} ATT writes, {} known commands, {} findings",
            report.att_packets,
            report.commands.len(),
            report.findings.len()
        );
        Ok(report)
    }
}

/// How many decoded commands fell on each side of the attack windows.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct LabelCounts {
    pub attack: usize,
    pub normal: usize,
    /// Commands without a capture epoch.
    pub unlabelled: usize,
}

/// Decoded contents of one capture.
#[derive(Debug, Clone, Serialize)]
pub struct ExtractionReport {
    pub capture_file: String,
    pub analysis_timestamp: DateTime<Local>,
    pub att_packets: usize,
    pub commands: Vec<DecodedCommand>,
    pub findings: Vec<Finding>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub attack_windows: Vec<AttackWindow>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub labels: Option<LabelCounts>,
}

impl ExtractionReport {
    pub fn from_output(capture: &Path, output: &str, separator: char) -> Self {
        let rows = parse_rows(output, separator);
        let commands = decode_rows(&rows);
        let findings = assess(&commands);
        Self {
            capture_file: capture.display().to_string(),
            analysis_timestamp: Local::now(),
            att_packets: rows.len(),
            commands,
            findings,
            attack_windows: Vec::new(),
            labels: None,
        }
    }

    /// Label every decoded command against `windows`.
    pub fn label_with(&mut self, windows: Vec<AttackWindow>) {
        let mut counts = LabelCounts::default();
        for command in &mut self.commands {
            command.label = command.epoch.map(|epoch| classify(epoch, &windows));
            match command.label {
                Some(TrafficLabel::Attack) => counts.attack += 1,
                Some(TrafficLabel::Normal) => counts.normal += 1,
                None => counts.unlabelled += 1,
            }
        }
        log::info!(
            "[+] Labelled {} attack / {} normal commands ({} without epoch)",
            counts.attack,
            counts.normal,
            counts.unlabelled
        );
        self.attack_windows = windows;
        self.labels = Some(counts);
    }

    pub fn to_json(&self) -> Result<String, ExtractionError> {
        serde_json::to_string_pretty(self)
            .map_err(|e| ExtractionError::SerializationError(e.to_string()))
    }

    pub fn write_to(&self, path: &Path) -> Result<(), ExtractionError> {
        let json = self.to_json()?;
        std::fs::write(path, json).map_err(|e| ExtractionError::IoError(e.to_string()))
    }
}
