//! Attack/normal labelling of captured traffic
//!
//! A playback run with a timestamp file brackets each campaign between an
//! `ATTACK_START` and an `ATTACK_END` marker. Reading those markers back
//! gives epoch windows; a captured packet whose `frame.time_epoch` falls
//! inside any window (bounds included) is attack traffic, anything else is
//! normal.

use std::path::Path;

use serde::Serialize;

use super::ExtractionError;
use crate::campaign::playback::parse_marker;

/// Epoch range of one campaign, inclusive at both ends.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AttackWindow {
    pub name: String,
    pub start: f64,
    pub end: f64,
}

impl AttackWindow {
    pub fn contains(&self, epoch: f64) -> bool {
        self.start <= epoch && epoch <= self.end
    }

    pub fn duration_secs(&self) -> f64 {
        self.end - self.start
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TrafficLabel {
    Attack,
    Normal,
}

/// Pair `ATTACK_START` / `ATTACK_END` markers into windows.
///
/// A start replaces any start still open; an end with no open start and a
/// start that is never closed are ignored. Lines that are not markers are
/// skipped.
pub fn parse_attack_windows(contents: &str) -> Vec<AttackWindow> {
    let mut windows = Vec::new();
    let mut open: Option<(f64, String)> = None;

    for marker in contents.lines().filter_map(parse_marker) {
        match marker.event.as_str() {
            "ATTACK_START" => {
                open = Some((marker.epoch, campaign_name(&marker.description)));
            }
            "ATTACK_END" => {
                if let Some((start, name)) = open.take() {
                    windows.push(AttackWindow {
                        name,
                        start,
                        end: marker.epoch,
                    });
                }
            }
            _ => {}
        }
    }
    windows
}

/// The quoted campaign name in `Starting '<name>' against <peer>`.
fn campaign_name(description: &str) -> String {
    description
        .split('\'')
        .nth(1)
        .filter(|name| !name.is_empty())
        .unwrap_or(description)
        .to_string()
}

/// Read and parse a timestamp file.
pub fn load_attack_windows(path: &Path) -> Result<Vec<AttackWindow>, ExtractionError> {
    let contents =
        std::fs::read_to_string(path).map_err(|e| ExtractionError::IoError(e.to_string()))?;
    let windows = parse_attack_windows(&contents);
    log::info!("[+] {} attack window(s) in {}", windows.len(), path.display());
    for (i, window) in windows.iter().enumerate() {
        log::debug!(
            "  window {}: {} {:.3} to {:.3} ({:.3}s)",
            i + 1,
            window.name,
            window.start,
            window.end,
            window.duration_secs()
        );
    }
    Ok(windows)
}

pub fn classify(epoch: f64, windows: &[AttackWindow]) -> TrafficLabel {
    if windows.iter().any(|w| w.contains(epoch)) {
        TrafficLabel::Attack
    } else {
        TrafficLabel::Normal
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MARKERS: &str = concat!(
        "[2025-11-15 14:00:00.000] [1763211600.000] ",
        "ATTACK_START: Starting 'full' against EC:E3:34:B2:E0:C2\n",
        "[2025-11-15 14:00:00.001] [1763211600.001] ATTACK_SEQUENCE: Sequence of 6 commands\n",
        "[2025-11-15 14:00:00.002] [1763211600.002] CMD_DOS-BRIGHTNESS: DoS: brightness to 0\n",
        "[2025-11-15 14:00:20.500] [1763211620.500] ATTACK_END: 'full' completed in 20.500s\n",
        "[2025-11-15 14:05:00.000] [1763211900.000] ",
        "ATTACK_START: Starting 'hijack-eco' against EC:E3:34:B2:E0:C2\n",
        "[2025-11-15 14:05:03.000] [1763211903.000] ATTACK_END: 'hijack-eco' completed in 3.000s\n",
    );

    #[test]
    fn test_windows_from_playback_markers() {
        let windows = parse_attack_windows(MARKERS);
        assert_eq!(windows.len(), 2);
        assert_eq!(windows[0].name, "full");
        assert_eq!(windows[0].start, 1763211600.0);
        assert_eq!(windows[0].end, 1763211620.5);
        assert_eq!(windows[1].name, "hijack-eco");
        assert!((windows[1].duration_secs() - 3.0).abs() < 1e-9);
    }

    #[test]
    fn test_unpaired_markers_are_ignored() {
        let contents = concat!(
            "[2025-11-15 14:00:00.000] [100.000] ATTACK_END: stray end\n",
            "[2025-11-15 14:00:01.000] [101.000] ATTACK_START: Starting 'first' against peer\n",
            "[2025-11-15 14:00:02.000] [102.000] ATTACK_START: Starting 'second' against peer\n",
            "[2025-11-15 14:00:03.000] [103.000] ATTACK_END: done\n",
            "[2025-11-15 14:00:04.000] [104.000] ATTACK_START: Starting 'open' against peer\n",
        );
        let windows = parse_attack_windows(contents);
        assert_eq!(windows.len(), 1);
        assert_eq!(windows[0].name, "second");
        assert_eq!(windows[0].start, 102.0);
    }

    #[test]
    fn test_classify_includes_bounds() {
        let windows = parse_attack_windows(MARKERS);
        assert_eq!(classify(1763211600.0, &windows), TrafficLabel::Attack);
        assert_eq!(classify(1763211610.0, &windows), TrafficLabel::Attack);
        assert_eq!(classify(1763211620.5, &windows), TrafficLabel::Attack);
        assert_eq!(classify(1763211620.6, &windows), TrafficLabel::Normal);
        assert_eq!(classify(1763211599.9, &windows), TrafficLabel::Normal);
        assert_eq!(classify(1763211901.0, &windows), TrafficLabel::Attack);
        assert_eq!(classify(1763211901.0, &[]), TrafficLabel::Normal);
    }

    #[test]
    fn test_load_missing_file() {
        let result = load_attack_windows(Path::new("/nonexistent/attack_timestamps.txt"));
        assert!(matches!(result, Err(ExtractionError::IoError(_))));
    }
}
