//! Best-effort anomaly heuristics over peer responses
//!
//! These are empirical signals, not proofs: an oversized notification or
//! a pointer-looking byte run may be perfectly benign on a given firmware,
//! and a real memory disclosure can easily slip past both checks. Both
//! thresholds are configurable so they can be tuned per device.

use std::fmt;

use serde::{Deserialize, Serialize};

/// What kind of anomaly was observed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AnomalyKind {
    /// Notification longer than the configured threshold.
    OversizedResponse,
    /// Notification contains the configured pointer-like byte pattern.
    SuspectedMemoryPattern,
    /// Link dropped right after a write.
    UnexpectedDisconnect,
}

impl fmt::Display for AnomalyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AnomalyKind::OversizedResponse => write!(f, "oversized-response"),
            AnomalyKind::SuspectedMemoryPattern => write!(f, "suspected-memory-pattern"),
            AnomalyKind::UnexpectedDisconnect => write!(f, "unexpected-disconnect"),
        }
    }
}

/// A derived, log-only anomaly observation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AnomalySignal {
    pub kind: AnomalyKind,
    pub description: String,
}

impl AnomalySignal {
    pub fn unexpected_disconnect(payload: &str) -> Self {
        Self {
            kind: AnomalyKind::UnexpectedDisconnect,
            description: format!("Link dropped immediately after sending {}", payload),
        }
    }
}

/// Tunable response heuristics.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AnomalyHeuristics {
    /// Responses strictly longer than this many bytes are flagged.
    pub oversized_threshold: usize,
    /// Byte run flagged wherever it appears in a response.
    pub memory_pattern: Vec<u8>,
}

impl Default for AnomalyHeuristics {
    fn default() -> Self {
        Self {
            oversized_threshold: 100,
            memory_pattern: vec![0x00, 0x00, 0x00, 0x08],
        }
    }
}

impl AnomalyHeuristics {
    /// Inspect one notification payload.
    pub fn inspect(&self, data: &[u8]) -> Vec<AnomalySignal> {
        let mut signals = Vec::new();
        if data.len() > self.oversized_threshold {
            signals.push(AnomalySignal {
                kind: AnomalyKind::OversizedResponse,
                description: format!(
                    "Unusually large response: {} bytes (possible memory leak)",
                    data.len()
                ),
            });
        }
        if let Some(offset) = self.find_pattern(data) {
            signals.push(AnomalySignal {
                kind: AnomalyKind::SuspectedMemoryPattern,
                description: format!(
                    "Pointer-like pattern {} at offset {}",
                    hex::encode(&self.memory_pattern),
                    offset
                ),
            });
        }
        signals
    }

    fn find_pattern(&self, data: &[u8]) -> Option<usize> {
        if self.memory_pattern.is_empty() {
            return None;
        }
        data.windows(self.memory_pattern.len())
            .position(|w| w == self.memory_pattern.as_slice())
    }
}
