//! Reconnaissance: advertisement scan and GATT enumeration
//!
//! A `BleScanner` listens for advertisements for a fixed window and can
//! connect briefly to list a device's services. On top of that this module
//! picks targets out of a scan (`TargetMatcher`, `find_device`) and turns a
//! scan plus optional enumeration into an exportable `ScanReport`.

pub mod profile;

use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Local};
use serde::Serialize;
use thiserror::Error;

use crate::ble::transport::BleAddress;
use crate::ble::BleError;

pub use profile::{
    assess_device, permissions, CharProperty, CharacteristicProfile, DeviceAnalysis,
    DiscoveredDevice, Permission, ScanFinding, ServiceProfile,
};

/// Default advertisement listening window.
pub const DEFAULT_SCAN_WINDOW: Duration = Duration::from_secs(10);

/// Connect timeout used while enumerating a target.
pub const ENUMERATE_TIMEOUT: Duration = Duration::from_secs(15);

/// Pause between enumerating consecutive targets.
const ENUMERATE_GAP: Duration = Duration::from_secs(1);

/// Name fragments that mark a likely target when nothing else is given.
const TARGET_NAME_HINTS: [&str; 2] = ["ESP32", "IoT"];

#[derive(Error, Debug)]
pub enum ScanError {
    #[error(transparent)]
    Ble(#[from] BleError),

    #[error("No device matching {query} among {seen} discovered")]
    NotFound { query: String, seen: usize },

    #[error("Serialization error: {0}")]
    SerializationError(String),

    #[error("IO error: {0}")]
    IoError(String),
}

/// Passive discovery and short-lived GATT enumeration.
#[async_trait]
pub trait BleScanner: Send + Sync {
    /// Listen for `window` and return every device heard, once each.
    async fn scan(&mut self, window: Duration) -> Result<Vec<DiscoveredDevice>, BleError>;

    /// Connect to `address`, list its services, then disconnect.
    async fn enumerate(
        &mut self,
        address: &BleAddress,
        timeout: Duration,
    ) -> Result<Vec<ServiceProfile>, BleError>;
}

/// Which discovered devices count as targets.
///
/// Name fragments match case-insensitively as substrings; addresses match
/// exactly.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TargetMatcher {
    names: Vec<String>,
    addresses: Vec<BleAddress>,
}

impl TargetMatcher {
    pub fn name(fragment: impl Into<String>) -> Self {
        Self {
            names: vec![fragment.into()],
            addresses: Vec::new(),
        }
    }

    pub fn address(address: BleAddress) -> Self {
        Self {
            names: Vec::new(),
            addresses: vec![address],
        }
    }

    /// Devices named like ESP32 or IoT boards.
    pub fn likely_targets() -> Self {
        Self {
            names: TARGET_NAME_HINTS.iter().map(|s| s.to_string()).collect(),
            addresses: Vec::new(),
        }
    }

    pub fn or_address(mut self, address: BleAddress) -> Self {
        self.addresses.push(address);
        self
    }

    pub fn matches(&self, device: &DiscoveredDevice) -> bool {
        if self.addresses.contains(&device.address) {
            return true;
        }
        let Some(name) = device.name.as_deref() else {
            return false;
        };
        let name = name.to_lowercase();
        self.names.iter().any(|n| name.contains(&n.to_lowercase()))
    }

    pub fn describe(&self) -> String {
        let mut parts: Vec<String> =
            self.names.iter().map(|n| format!("name ~ {:?}", n)).collect();
        parts.extend(self.addresses.iter().map(|a| format!("address {}", a)));
        parts.join(" or ")
    }
}

/// Scan for `window` and return the first device `matcher` accepts.
pub async fn find_device(
    scanner: &mut dyn BleScanner,
    matcher: &TargetMatcher,
    window: Duration,
) -> Result<DiscoveredDevice, ScanError> {
    log::info!(
        "[*] Looking for {} ({:.0}s scan)...",
        matcher.describe(),
        window.as_secs_f64()
    );
    let devices = scanner.scan(window).await?;

    if let Some(device) = devices.iter().find(|d| matcher.matches(d)) {
        log::info!("[+] Found {} ({})", device.display_name(), device.address);
        return Ok(device.clone());
    }

    log::error!("[-] No device matching {}", matcher.describe());
    for device in &devices {
        log::info!(
            "    {} ({}) RSSI {}",
            device.display_name(),
            device.address,
            rssi_text(device.rssi)
        );
    }
    Err(ScanError::NotFound {
        query: matcher.describe(),
        seen: devices.len(),
    })
}

fn rssi_text(rssi: Option<i16>) -> String {
    rssi.map(|r| format!("{} dBm", r)).unwrap_or_else(|| "n/a".to_string())
}

/// What a reconnaissance run does.
#[derive(Debug, Clone)]
pub struct ScanOptions {
    pub window: Duration,
    pub matcher: TargetMatcher,
    /// Connect to each target and list its GATT table.
    pub enumerate: bool,
    pub connect_timeout: Duration,
}

impl Default for ScanOptions {
    fn default() -> Self {
        Self {
            window: DEFAULT_SCAN_WINDOW,
            matcher: TargetMatcher::likely_targets(),
            enumerate: false,
            connect_timeout: ENUMERATE_TIMEOUT,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ScanMetadata {
    pub timestamp: DateTime<Local>,
    pub scan_duration: f64,
    pub total_devices: usize,
    pub target_devices: usize,
}

/// Everything a reconnaissance run learned.
#[derive(Debug, Clone, Serialize)]
pub struct ScanReport {
    pub scan_metadata: ScanMetadata,
    pub discovered_devices: Vec<DiscoveredDevice>,
    pub target_analysis: Vec<DeviceAnalysis>,
}

impl ScanReport {
    pub fn to_json(&self) -> Result<String, ScanError> {
        serde_json::to_string_pretty(self)
            .map_err(|e| ScanError::SerializationError(e.to_string()))
    }

    pub fn write_to(&self, path: &Path) -> Result<(), ScanError> {
        let json = self.to_json()?;
        std::fs::write(path, json).map_err(|e| ScanError::IoError(e.to_string()))
    }
}

/// Scan, pick targets, and optionally enumerate each of them.
///
/// A target that cannot be enumerated is logged and left out of
/// `target_analysis`; the run carries on with the next one.
pub async fn run_scan(
    scanner: &mut dyn BleScanner,
    options: &ScanOptions,
) -> Result<ScanReport, ScanError> {
    log::info!("[*] Starting BLE scan ({:.0}s)...", options.window.as_secs_f64());
    let devices = scanner.scan(options.window).await?;

    let targets: Vec<&DiscoveredDevice> =
        devices.iter().filter(|d| options.matcher.matches(d)).collect();
    for device in &devices {
        let tag = if options.matcher.matches(device) {
            "[+] TARGET"
        } else {
            "[i] Device"
        };
        log::info!(
            "{} {} ({}) RSSI {}",
            tag,
            device.display_name(),
            device.address,
            rssi_text(device.rssi)
        );
    }
    let target_count = targets.len();
    log::info!("[*] Scan complete: {} devices, {} targets", devices.len(), target_count);

    let mut analyses = Vec::new();
    if options.enumerate {
        for (i, device) in targets.iter().enumerate() {
            if i > 0 {
                tokio::time::sleep(ENUMERATE_GAP).await;
            }
            log::info!("[*] Enumerating GATT services of {}...", device.address);
            match scanner.enumerate(&device.address, options.connect_timeout).await {
                Ok(services) => {
                    log_services(&services);
                    let analysis = DeviceAnalysis::new((*device).clone(), services);
                    for finding in &analysis.findings {
                        log::warn!("[{}] {}", finding.id, finding.description);
                    }
                    analyses.push(analysis);
                }
                Err(e) => log::error!("[!] Error enumerating {}: {}", device.address, e),
            }
        }
    }

    Ok(ScanReport {
        scan_metadata: ScanMetadata {
            timestamp: Local::now(),
            scan_duration: options.window.as_secs_f64(),
            total_devices: devices.len(),
            target_devices: target_count,
        },
        target_analysis: analyses,
        discovered_devices: devices,
    })
}

fn log_services(services: &[ServiceProfile]) {
    for service in services {
        log::info!("  [Service] {}", service.uuid);
        for characteristic in &service.characteristics {
            let perms: Vec<String> = characteristic
                .permissions
                .iter()
                .map(|p| format!("{:?}", p).to_uppercase())
                .collect();
            log::info!("    [Char] {} {}", characteristic.uuid, perms.join(", "));
            if characteristic.command_response {
                log::warn!("    VULNERABLE: Write + Notify (command/response)");
            }
        }
    }
}
