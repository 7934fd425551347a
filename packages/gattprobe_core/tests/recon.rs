//! Reconnaissance and traffic labelling against a simulated peer
//!
//! Scans and enumerations run over `SimPeripheral` on a paused tokio clock;
//! the labelling test reads back the marker file a real playback run wrote.
//!
//! Run with:
//!   cargo test --test recon

use std::time::Duration;

use gattprobe::ble::simulated::{SimHandle, SimPeripheral};
use gattprobe::campaign::catalog::playback_sequence;
use gattprobe::campaign::{run_playback, TimestampFile};
use gattprobe::extract::{classify, load_attack_windows, TrafficLabel};
use gattprobe::scan::{find_device, run_scan, Permission, ScanError, ScanOptions, TargetMatcher};
use gattprobe::{BleAddress, SessionConfig, SessionController};

use tokio::sync::watch;
use tokio::time::Instant;

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn target() -> BleAddress {
    "AA:BB:CC:DD:EE:FF".parse().unwrap()
}

fn peer_with_neighbours() -> (SimPeripheral, SimHandle) {
    let (peer, handle) = SimPeripheral::new(target());
    handle.add_bystander(BleAddress([0x11; 6]), Some("Headphones"), -80);
    handle.add_bystander(BleAddress([0x22; 6]), Some("Kitchen IoT Bulb"), -72);
    (peer, handle)
}

fn options(enumerate: bool) -> ScanOptions {
    ScanOptions {
        window: Duration::from_secs(5),
        enumerate,
        ..ScanOptions::default()
    }
}

// ---------------------------------------------------------------------------
// Scan
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn test_scan_flags_named_targets_only() {
    let (mut peer, handle) = peer_with_neighbours();
    let started = Instant::now();

    let report = run_scan(&mut peer, &options(false)).await.unwrap();

    assert_eq!(started.elapsed(), Duration::from_secs(5));
    assert_eq!(report.scan_metadata.total_devices, 3);
    assert_eq!(report.scan_metadata.target_devices, 2);
    assert!(report.target_analysis.is_empty());
    assert_eq!(handle.scans(), 1);
    assert_eq!(handle.enumerations(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_enumeration_failure_skips_only_that_target() {
    let (mut peer, handle) = peer_with_neighbours();

    let report = run_scan(&mut peer, &options(true)).await.unwrap();

    // The bulb is a target but cannot be reached; the peer still gets analysed.
    assert_eq!(handle.enumerations(), 2);
    assert_eq!(report.target_analysis.len(), 1);
    let analysis = &report.target_analysis[0];
    assert_eq!(analysis.device.address, target());
    assert_eq!(analysis.device.display_name(), "ESP32_P1");

    let writable: Vec<&str> = analysis
        .services
        .iter()
        .flat_map(|s| s.characteristics.iter())
        .filter(|c| c.permissions.contains(&Permission::Write))
        .map(|c| c.uuid.as_str())
        .collect();
    assert_eq!(writable.len(), 1);

    let ids: Vec<&str> = analysis.findings.iter().map(|f| f.id).collect();
    assert_eq!(ids, vec!["VULN-01", "VULN-02", "VULN-03"]);
}

#[tokio::test(start_paused = true)]
async fn test_scan_report_exports_addresses_as_text() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("scan_results.json");
    let (mut peer, _handle) = peer_with_neighbours();

    let report = run_scan(&mut peer, &options(true)).await.unwrap();
    report.write_to(&path).unwrap();

    let value: serde_json::Value =
        serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
    assert_eq!(value["scan_metadata"]["scan_duration"], 5.0);
    assert_eq!(value["discovered_devices"][0]["address"], "AA:BB:CC:DD:EE:FF");
    assert_eq!(value["discovered_devices"][1]["name"], "Headphones");
    let first_char = &value["target_analysis"][0]["services"][0]["characteristics"][0];
    assert_eq!(first_char["permissions"][0], "READ");
}

// ---------------------------------------------------------------------------
// Finding a target
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn test_find_device_by_name_or_address() {
    let (mut peer, _handle) = peer_with_neighbours();
    let window = Duration::from_secs(2);

    let found = find_device(&mut peer, &TargetMatcher::name("esp32"), window)
        .await
        .unwrap();
    assert_eq!(found.address, target());

    let bulb = BleAddress([0x22; 6]);
    let found = find_device(&mut peer, &TargetMatcher::address(bulb), window)
        .await
        .unwrap();
    assert_eq!(found.name.as_deref(), Some("Kitchen IoT Bulb"));
}

#[tokio::test(start_paused = true)]
async fn test_find_device_misses_a_silent_peer() {
    let (mut peer, handle) = peer_with_neighbours();
    handle.set_unreachable(true);

    let matcher = TargetMatcher::name("ESP32");
    let result = find_device(&mut peer, &matcher, Duration::from_secs(2)).await;

    match result {
        Err(ScanError::NotFound { seen, .. }) => assert_eq!(seen, 2),
        other => panic!("expected NotFound, got {:?}", other.map(|d| d.address)),
    }
}

// ---------------------------------------------------------------------------
// Labelling
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn test_playback_markers_label_traffic() {
    let dir = tempfile::tempdir().unwrap();
    let markers = TimestampFile::new(dir.path().join("attack_timestamps.txt"));
    let (peer, _handle) = SimPeripheral::new(target());
    let mut controller = SessionController::new(target(), Box::new(peer), SessionConfig::default());
    let (_tx, stop) = watch::channel(false);
    let steps = playback_sequence("dos-reset").unwrap();

    run_playback(&mut controller, "dos-reset", &steps, Some(&markers), &stop)
        .await
        .unwrap();
    run_playback(&mut controller, "dos-reset", &steps, Some(&markers), &stop)
        .await
        .unwrap();

    let windows = load_attack_windows(markers.path()).unwrap();
    assert_eq!(windows.len(), 2);
    assert!(windows.iter().all(|w| w.name == "dos-reset"));
    assert!(windows.iter().all(|w| w.start <= w.end));
    assert_eq!(classify(windows[0].start, &windows), TrafficLabel::Attack);
    assert_eq!(classify(windows[1].end, &windows), TrafficLabel::Attack);
    assert_eq!(classify(windows[0].start - 60.0, &windows), TrafficLabel::Normal);
}
