// gattprobe - command-line front end
//
// Finds targets, runs one campaign (hold, fuzz, playback) against a single
// BLE peer, or decodes the command writes in a sniffer capture.

mod radio;

use std::io::{self, BufRead, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use tokio::sync::watch;

use gattprobe::ble::simulated::SimPeripheral;
use gattprobe::campaign::catalog::{device_command_names, playback_sequence};
use gattprobe::campaign::{
    decode_hex, encode_hex, rejection, run_fuzz, run_hold, run_playback, CampaignError,
    CampaignReport, FuzzSelection, FuzzTarget, HoldParams, TimestampFile, ValidationError,
};
use gattprobe::event_log::{
    AttackType, Event, EventLog, ReportOutcome, ReportSummary, SessionReport,
};
use gattprobe::extract::{load_attack_windows, ExtractionReport, FieldFormat, TsharkExtractor};
use gattprobe::scan::{
    find_device, run_scan, ScanOptions, ScanReport, TargetMatcher, DEFAULT_SCAN_WINDOW,
};
use gattprobe::{BleAddress, SessionConfig, SessionController, SessionDuration};

use radio::Radio;

/// Where the simulated peer lives when `--address` is not given.
const SIMULATED_ADDRESS: BleAddress = BleAddress([0xEC, 0xE3, 0x34, 0xB2, 0xE0, 0xC2]);

#[derive(Parser)]
#[command(name = "gattprobe")]
#[command(about = "Recon, connection-hold, fuzzing and playback against a BLE GATT peer")]
#[command(long_about = None)]
#[command(version)]
struct Cli {
    /// Target MAC address, e.g. EC:E3:34:B2:E0:C2
    #[arg(long, global = true)]
    address: Option<String>,

    /// Find the target by (part of) its advertised name instead
    #[arg(long, global = true)]
    target: Option<String>,

    /// Export the event log to this JSON file
    #[arg(long, global = true)]
    log: Option<PathBuf>,

    /// JSON file with session timings and anomaly heuristics
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Run against the in-process simulated peer instead of the radio
    #[arg(long, global = true)]
    simulate: bool,

    /// Skip the authorization prompt
    #[arg(long, global = true)]
    yes: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Discover nearby devices and flag likely targets
    Scan {
        /// Seconds to listen for advertisements
        #[arg(long, default_value_t = 10)]
        duration: u64,
        /// Connect to each target and list its GATT services
        #[arg(long)]
        enumerate: bool,
        /// Write the scan results to this JSON file
        #[arg(short, long)]
        export: Option<PathBuf>,
    },
    /// Hold the peer's only connection slot
    Hijack {
        /// Seconds to hold the link, or "inf"
        #[arg(long, default_value = "300")]
        duration: SessionDuration,
        /// Send periodic no-op writes so the peer does not time out
        #[arg(long)]
        keep_alive: bool,
        /// Reconnect whenever the link is lost
        #[arg(long)]
        aggressive: bool,
    },
    /// Write malformed payloads to the command characteristic
    Inject {
        /// Payload category, or "full" for all of them
        #[arg(long, default_value = "full")]
        mode: String,
        /// Send a single hex payload instead of the catalog
        #[arg(long)]
        custom_payload: Option<String>,
        /// Seconds to wait after each payload before checking the link
        #[arg(long)]
        delay: Option<f64>,
    },
    /// Play back known device commands
    Attack {
        /// Command name, or "full" for the whole sequence
        #[arg(long, default_value = "full")]
        attack: String,
        /// Append correlation markers to this text file
        #[arg(long)]
        timestamps: Option<PathBuf>,
    },
    /// Decode the command writes in a capture file
    Extract {
        /// Capture file (pcap / pcapng)
        pcap: PathBuf,
        /// Path to the tshark binary
        #[arg(long)]
        tshark: Option<PathBuf>,
        /// Ask tshark for comma-separated fields
        #[arg(long)]
        csv: bool,
        /// Label commands as attack or normal from a playback timestamp file
        #[arg(long)]
        timestamps: Option<PathBuf>,
        /// Write the decoded commands and findings to this JSON file
        #[arg(short, long)]
        export: Option<PathBuf>,
    },
}

/// Report metadata that depends on the subcommand.
struct ExportMeta {
    attack_type: AttackType,
    duration: Option<SessionDuration>,
    mode: Option<String>,
    custom_payload: Option<String>,
    keep_alive: bool,
    aggressive: bool,
}

impl ExportMeta {
    fn hold(params: &HoldParams) -> Self {
        Self {
            attack_type: AttackType::ConnectionHijacking,
            duration: Some(params.duration),
            mode: None,
            custom_payload: None,
            keep_alive: params.keep_alive,
            aggressive: params.aggressive,
        }
    }

    fn injection(mode: &str, custom_payload: Option<String>) -> Self {
        Self {
            attack_type: AttackType::PayloadInjection,
            duration: None,
            mode: Some(mode.to_string()),
            custom_payload,
            keep_alive: false,
            aggressive: false,
        }
    }

    fn playback(name: &str) -> Self {
        Self {
            attack_type: AttackType::CommandPlayback,
            duration: None,
            mode: Some(name.to_string()),
            custom_payload: None,
            keep_alive: false,
            aggressive: false,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();
    let radio = open_radio(&cli)?;
    let stdin = io::stdin();
    run(&cli, radio, &mut stdin.lock()).await
}

async fn run(cli: &Cli, radio: Radio, input: &mut impl BufRead) -> Result<()> {
    match &cli.command {
        Commands::Scan {
            duration,
            enumerate,
            export,
        } => {
            let window = Duration::from_secs(*duration);
            cmd_scan(cli, radio, window, *enumerate, export.as_deref()).await
        }
        Commands::Hijack {
            duration,
            keep_alive,
            aggressive,
        } => {
            let params = HoldParams {
                duration: *duration,
                keep_alive: *keep_alive,
                aggressive: *aggressive,
            };
            cmd_hijack(cli, radio, input, params).await
        }
        Commands::Inject {
            mode,
            custom_payload,
            delay,
        } => cmd_inject(cli, radio, input, mode, custom_payload.as_deref(), *delay).await,
        Commands::Attack { attack, timestamps } => {
            cmd_attack(cli, radio, input, attack, timestamps.as_deref()).await
        }
        Commands::Extract {
            pcap,
            tshark,
            csv,
            timestamps,
            export,
        } => {
            cmd_extract(
                pcap,
                tshark.as_deref(),
                *csv,
                timestamps.as_deref(),
                export.as_deref(),
            )
            .await
        }
    }
}

async fn cmd_scan(
    cli: &Cli,
    mut radio: Radio,
    window: Duration,
    enumerate: bool,
    export: Option<&Path>,
) -> Result<()> {
    let config = load_config(cli.config.as_deref(), None)?;
    let mut matcher = match cli.target.as_deref() {
        Some(name) => TargetMatcher::name(name),
        None => TargetMatcher::likely_targets(),
    };
    if let Some(raw) = cli.address.as_deref() {
        matcher = matcher.or_address(parse_address(raw)?);
    }
    let options = ScanOptions {
        window,
        matcher,
        enumerate,
        connect_timeout: config.connect_timeout(),
    };

    let report = run_scan(radio.scanner().await?, &options)
        .await
        .context("Scan failed")?;
    print_scan(&report);

    if let Some(path) = export {
        report
            .write_to(path)
            .with_context(|| format!("Failed to export results to {}", path.display()))?;
        println!("Results exported to {}", path.display());
    }
    Ok(())
}

async fn cmd_hijack(
    cli: &Cli,
    mut radio: Radio,
    input: &mut impl BufRead,
    params: HoldParams,
) -> Result<()> {
    let config = load_config(cli.config.as_deref(), None)?;
    let address = resolve_target(cli, &mut radio).await?;
    if !confirm(cli.yes, "hold the connection slot of", &address, input)? {
        return Ok(());
    }

    let mut controller = SessionController::new(address, radio.into_transport().await?, config);
    let mut stop = stop_on_ctrl_c();
    let meta = ExportMeta::hold(&params);
    let result = run_hold(&mut controller, params, &mut stop).await;
    conclude(&controller, meta, result, cli.log.as_deref())
}

async fn cmd_inject(
    cli: &Cli,
    mut radio: Radio,
    input: &mut impl BufRead,
    mode: &str,
    custom_payload: Option<&str>,
    delay: Option<f64>,
) -> Result<()> {
    let config = load_config(cli.config.as_deref(), delay)?;

    // Reject bad input before anything is asked or sent.
    let checked = match custom_payload {
        Some(hex) => decode_hex(hex)
            .map(|bytes| (FuzzTarget::Custom(hex.to_string()), Some(encode_hex(&bytes)))),
        None => mode
            .parse::<FuzzSelection>()
            .map(|selection| (FuzzTarget::Catalog(selection), None)),
    };
    let (target, canonical) = match checked {
        Ok(checked) => checked,
        Err(e) => {
            let (flag, raw, label) = match custom_payload {
                Some(hex) => ("--custom-payload", hex, "custom"),
                None => ("--mode", mode, mode),
            };
            let meta = ExportMeta::injection(label, custom_payload.map(String::from));
            return reject(cli, meta, raw, e).with_context(|| format!("Invalid {}", flag));
        }
    };

    let address = resolve_target(cli, &mut radio).await?;
    if !confirm(cli.yes, "inject payloads into", &address, input)? {
        return Ok(());
    }

    let mut controller = SessionController::new(address, radio.into_transport().await?, config);
    let stop = stop_on_ctrl_c();
    let result = run_fuzz(&mut controller, &target, &stop).await;
    if let Ok(report) = &result {
        println!(
            "Categories completed: {}",
            if report.stats.categories_completed.is_empty() {
                "none".to_string()
            } else {
                report.stats.categories_completed.join(", ")
            }
        );
    }

    let meta = ExportMeta::injection(target.mode(), canonical);
    conclude(&controller, meta, result, cli.log.as_deref())
}

async fn cmd_attack(
    cli: &Cli,
    mut radio: Radio,
    input: &mut impl BufRead,
    attack: &str,
    timestamps: Option<&Path>,
) -> Result<()> {
    let config = load_config(cli.config.as_deref(), None)?;
    let steps = match playback_sequence(attack) {
        Ok(steps) => steps,
        Err(e) => {
            return reject(cli, ExportMeta::playback(attack), attack, e).with_context(|| {
                format!(
                    "Available commands: full, {}",
                    device_command_names().join(", ")
                )
            });
        }
    };

    let address = resolve_target(cli, &mut radio).await?;
    if !confirm(cli.yes, "send device commands to", &address, input)? {
        return Ok(());
    }

    let mut controller = SessionController::new(address, radio.into_transport().await?, config);
    let stop = stop_on_ctrl_c();
    let markers = timestamps.map(TimestampFile::new);
    let result = run_playback(&mut controller, attack, &steps, markers.as_ref(), &stop).await;
    if let Some(markers) = &markers {
        println!("Timestamps appended to {}", markers.path().display());
    }

    conclude(&controller, ExportMeta::playback(attack), result, cli.log.as_deref())
}

async fn cmd_extract(
    pcap: &Path,
    tshark: Option<&Path>,
    csv: bool,
    timestamps: Option<&Path>,
    export: Option<&Path>,
) -> Result<()> {
    let extractor = match tshark {
        Some(tool) => TsharkExtractor::new(tool),
        None => TsharkExtractor::default(),
    };
    let extractor = if csv {
        extractor.with_format(FieldFormat::Csv)
    } else {
        extractor
    };

    let windows = match timestamps {
        Some(path) => Some(
            load_attack_windows(path)
                .with_context(|| format!("Failed to read timestamps {}", path.display()))?,
        ),
        None => None,
    };

    let mut report = extractor
        .extract(pcap)
        .await
        .with_context(|| format!("Failed to extract commands from {}", pcap.display()))?;
    if let Some(windows) = windows {
        report.label_with(windows);
    }
    print_extraction(&report);

    if let Some(path) = export {
        report
            .write_to(path)
            .with_context(|| format!("Failed to export results to {}", path.display()))?;
        println!("Results exported to {}", path.display());
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn parse_address(raw: &str) -> Result<BleAddress> {
    raw.parse()
        .with_context(|| format!("Invalid --address {:?}", raw))
}

fn open_radio(cli: &Cli) -> Result<Radio> {
    if !cli.simulate {
        return Ok(Radio::hardware());
    }
    let address = match cli.address.as_deref() {
        Some(raw) => parse_address(raw)?,
        None => SIMULATED_ADDRESS,
    };
    let (peer, _handle) = SimPeripheral::new(address);
    Ok(Radio::simulated(peer))
}

/// `--address` if given, otherwise the first device whose name matches `--target`.
async fn resolve_target(cli: &Cli, radio: &mut Radio) -> Result<BleAddress> {
    if let Some(raw) = cli.address.as_deref() {
        return parse_address(raw);
    }
    let Some(name) = cli.target.as_deref() else {
        bail!("--address or --target is required for this command");
    };
    let device = find_device(
        radio.scanner().await?,
        &TargetMatcher::name(name),
        DEFAULT_SCAN_WINDOW,
    )
    .await
    .with_context(|| format!("No device named like {:?} is advertising", name))?;
    Ok(device.address)
}

/// Defaults, then the config file, then command-line overrides.
fn load_config(path: Option<&Path>, delay: Option<f64>) -> Result<SessionConfig> {
    let mut config = match path {
        Some(path) => SessionConfig::from_file(path)
            .with_context(|| format!("Failed to load config {}", path.display()))?,
        None => SessionConfig::default(),
    };
    if let Some(delay) = delay {
        config.settle_delay_secs = delay;
    }
    config.validate().context("Invalid session configuration")?;
    Ok(config)
}

/// Ask for explicit authorization. Anything but "yes" declines.
fn confirm(
    assume_yes: bool,
    action: &str,
    address: &BleAddress,
    input: &mut impl BufRead,
) -> Result<bool> {
    if assume_yes {
        return Ok(true);
    }
    println!();
    println!("WARNING: for authorized testing of devices you own or may test.");
    print!("Confirm you are authorized to {} {} (yes/no): ", action, address);
    io::stdout().flush()?;

    let mut answer = String::new();
    input.read_line(&mut answer)?;
    if answer.trim().eq_ignore_ascii_case("yes") {
        Ok(true)
    } else {
        println!("Cancelled.");
        Ok(false)
    }
}

/// Stop signal that flips on the first Ctrl-C.
fn stop_on_ctrl_c() -> watch::Receiver<bool> {
    let (tx, rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            log::warn!("[!] Interrupted, stopping...");
            let _ = tx.send(true);
        }
    });
    rx
}

fn export_log(
    path: Option<&Path>,
    meta: ExportMeta,
    target_address: String,
    summary: ReportSummary,
    outcome: ReportOutcome,
    events: &[Event],
) {
    let Some(path) = path else {
        return;
    };
    let export = SessionReport {
        attack_type: meta.attack_type,
        target_address,
        duration: meta.duration,
        mode: meta.mode,
        custom_payload: meta.custom_payload,
        keep_alive_enabled: meta.keep_alive,
        aggressive_mode: meta.aggressive,
        summary,
        outcome,
        events,
    };
    if let Err(e) = export.write_to(path) {
        log::error!("[-] Could not export log to {}: {}", path.display(), e);
    }
}

/// Log why the input was refused, export that log, and fail.
fn reject(cli: &Cli, meta: ExportMeta, input: &str, error: ValidationError) -> Result<()> {
    let mut log = EventLog::new();
    log.append(rejection(input, &error));
    let target = cli
        .address
        .clone()
        .or_else(|| cli.target.clone())
        .unwrap_or_default();
    export_log(
        cli.log.as_deref(),
        meta,
        target,
        ReportSummary::default(),
        ReportOutcome::Aborted { after_steps: 0 },
        log.events(),
    );
    println!();
    println!("SUMMARY: aborted after 0 steps");
    Err(CampaignError::from(error).into())
}

/// Export the log whatever happened, then print the summary.
fn conclude(
    controller: &SessionController,
    meta: ExportMeta,
    result: Result<CampaignReport, CampaignError>,
    log_path: Option<&Path>,
) -> Result<()> {
    let (summary, outcome) = match &result {
        Ok(report) => (report.summary.clone(), report.outcome.report_outcome()),
        Err(CampaignError::Connect(_)) => (ReportSummary::default(), ReportOutcome::ConnectFailed),
        Err(CampaignError::Validation(_)) => {
            (ReportSummary::default(), ReportOutcome::Aborted { after_steps: 0 })
        }
    };
    export_log(
        log_path,
        meta,
        controller.peer().to_string(),
        summary,
        outcome,
        controller.log().events(),
    );

    match result {
        Ok(report) => {
            print_summary(&report);
            Ok(())
        }
        Err(e) => {
            println!();
            println!("SUMMARY: aborted after 0 steps");
            Err(e.into())
        }
    }
}

fn print_summary(report: &CampaignReport) {
    let summary = &report.summary;
    println!();
    println!("{}", "=".repeat(60));
    println!("SUMMARY: {}", report.outcome);
    println!("{}", "=".repeat(60));
    println!("  Connected time:     {:.1}s", summary.uptime_seconds);
    println!("  Keep-alives:        {}", summary.keep_alive_count);
    println!("  Reconnections:      {}", summary.reconnect_count);
    println!("  Payloads sent:      {}", summary.payloads_sent);
    println!("  Crashes detected:   {}", summary.crashes_detected);
    println!("  Anomalies detected: {}", summary.anomalies_detected);
}

fn print_scan(report: &ScanReport) {
    let meta = &report.scan_metadata;
    println!();
    println!("{}", "=".repeat(60));
    println!("SCAN SUMMARY");
    println!("{}", "=".repeat(60));
    println!("Total devices discovered: {}", meta.total_devices);
    println!("Target devices:           {}", meta.target_devices);
    for analysis in &report.target_analysis {
        println!();
        println!("{} ({})", analysis.device.display_name(), analysis.device.address);
        for service in &analysis.services {
            println!("  [Service] {}", service.uuid);
            for characteristic in &service.characteristics {
                let perms: Vec<String> = characteristic
                    .permissions
                    .iter()
                    .map(|p| format!("{:?}", p).to_uppercase())
                    .collect();
                println!("    [Char] {}  {}", characteristic.uuid, perms.join(", "));
            }
        }
        if analysis.findings.is_empty() {
            println!("  No obvious vulnerabilities detected");
        }
        for finding in &analysis.findings {
            println!("  [{}] {}", finding.id, finding.description);
        }
    }
}

fn print_extraction(report: &ExtractionReport) {
    println!();
    println!("Capture: {}", report.capture_file);
    println!("ATT write commands: {}", report.att_packets);
    println!("Known commands:     {}", report.commands.len());
    if let Some(labels) = &report.labels {
        println!(
            "Labels:             {} attack, {} normal, {} unlabelled",
            labels.attack, labels.normal, labels.unlabelled
        );
    }
    println!();
    for command in &report.commands {
        let label = match command.label {
            Some(label) => format!("{:?}", label).to_lowercase(),
            None => String::new(),
        };
        println!(
            "  frame {:>6}  t={:>10}s  {:<14} {} {}",
            command.frame, command.time, command.command, command.hex, label
        );
    }
    if report.findings.is_empty() {
        println!();
        println!("No findings.");
        return;
    }
    println!();
    for finding in &report.findings {
        println!(
            "[{:?}] {} {}: {}",
            finding.severity, finding.id, finding.title, finding.description
        );
    }
}
