//! `trackguard` – feeds JSON-lines telemetry through the evaluation pipeline.
//!
//! ```text
//! trackguard [--input FILE]
//! ```
//!
//! Each input line is one normalised telemetry event. Lines are published on
//! the telemetry topic and evaluated by the worker; device commands produced
//! by rules are logged. The process exits after EOF once every queued event
//! has been evaluated, or on Ctrl-C.

mod config;

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use colored::Colorize;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, BufReader};
use tokio::sync::{broadcast::error::RecvError, watch};
use tracing::{error, info, warn};

use trackguard_kernel::{GeofenceStore, InMemoryGeofenceStore, Notifier, NullNotifier, TelegramNotifier};
use trackguard_middleware::{EventBus, GpsTrackerAdapter, Topic};
use trackguard_runtime::{Evaluator, StandardCapabilities, Worker, WorkerStats, init_tracing, jammer_engine};
use trackguard_store::{SqliteAlertAuditStore, SqliteGeofenceStore};
use trackguard_types::{BusMessage, BusPayload, TrackError};

const SOURCE: &str = "trackguard-cli";

#[derive(Debug, Default, PartialEq)]
struct Args {
    input: Option<PathBuf>,
    help: bool,
}

fn parse_args(args: impl IntoIterator<Item = String>) -> Result<Args, String> {
    let mut parsed = Args::default();
    let mut args = args.into_iter();
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "-i" | "--input" => {
                let path = args.next().ok_or_else(|| format!("{arg} needs a file path"))?;
                parsed.input = Some(PathBuf::from(path));
            }
            "-h" | "--help" => parsed.help = true,
            other => return Err(format!("unknown argument '{other}'")),
        }
    }
    Ok(parsed)
}

fn main() -> ExitCode {
    let args = match parse_args(std::env::args().skip(1)) {
        Ok(args) => args,
        Err(e) => {
            eprintln!("{}: {e}", "error".red().bold());
            print_usage();
            return ExitCode::from(2);
        }
    };
    if args.help {
        print_usage();
        return ExitCode::SUCCESS;
    }

    // Before the runtime exists: the span exporter is synchronous.
    let _tracing = init_tracing("trackguard");
    print_banner();

    let cfg = match config::load() {
        Ok(Some(cfg)) => cfg,
        Ok(None) => {
            let cfg = config::Config::default();
            match config::save(&cfg) {
                Ok(()) => info!(path = %config::config_path().display(), "default config written"),
                Err(e) => warn!(error = %e, "could not write default config"),
            }
            cfg
        }
        Err(e) => {
            error!(error = %e, "config unreadable, using defaults");
            config::Config::default()
        }
    };
    info!(config = ?cfg, "configuration loaded");

    let runtime = match tokio::runtime::Builder::new_multi_thread().enable_all().build() {
        Ok(runtime) => runtime,
        Err(e) => {
            error!(error = %e, "failed to start async runtime");
            return ExitCode::FAILURE;
        }
    };

    let outcome = runtime.block_on(run(cfg, args.input));
    // A pending stdin read would otherwise hold the runtime open.
    runtime.shutdown_timeout(Duration::from_millis(500));

    match outcome {
        Ok(stats) => {
            print_summary(&stats);
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!(error = %e, "trackguard stopped");
            ExitCode::FAILURE
        }
    }
}

async fn run(cfg: config::Config, input: Option<PathBuf>) -> Result<WorkerStats, TrackError> {
    let bus = EventBus::new(cfg.bus_capacity);

    let store: Arc<dyn GeofenceStore> = match &cfg.geofence_db {
        Some(path) => {
            let store = SqliteGeofenceStore::open(path)?;
            info!(path = %path.display(), groups = ?store.group_names()?, "geofence database opened");
            Arc::new(store)
        }
        None => {
            warn!("no geofence database configured, every fix is outside all zones");
            Arc::new(InMemoryGeofenceStore::new())
        }
    };

    let notifier_config = cfg.notifier();
    let notifier: Arc<dyn Notifier> = if notifier_config.is_configured() {
        Arc::new(TelegramNotifier::new(notifier_config)?)
    } else {
        info!("chat notifier not configured, alerts are only logged");
        Arc::new(NullNotifier)
    };

    let caps = match &cfg.alert_audit_db {
        Some(path) => {
            let audit = SqliteAlertAuditStore::open(path)?;
            info!(path = %path.display(), rows = audit.count()?, "alert audit database opened");
            StandardCapabilities::with_alert_audit(
                store,
                notifier,
                bus.clone(),
                cfg.capability_options(),
                Arc::new(audit),
            )
        }
        None => StandardCapabilities::new(store, notifier, bus.clone(), cfg.capability_options()),
    };
    let registry = caps.registry()?;
    println!("  Capabilities: {}", registry.names().join(", ").bold());

    let evaluator = Evaluator::new(
        Arc::new(GpsTrackerAdapter::new()),
        Arc::new(registry),
        Arc::new(jammer_engine(cfg.cut_engine_on_jammer)),
        cfg.evaluator(),
    );
    let worker = Worker::new(&bus, Arc::new(evaluator), cfg.workers);
    let progress = worker.progress();

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let shutdown_tx = Arc::new(shutdown_tx);
    let ctrlc_tx = Arc::clone(&shutdown_tx);
    if let Err(e) = ctrlc::set_handler(move || {
        eprintln!("\n{}", "Ctrl-C received, shutting down".yellow().bold());
        let _ = ctrlc_tx.send(true);
    }) {
        warn!(error = %e, "failed to install Ctrl-C handler");
    }

    let command_log = tokio::spawn(log_commands(bus.clone()));
    let worker_task = tokio::spawn(worker.run(shutdown_rx.clone()));

    let reader: Box<dyn AsyncBufRead + Unpin + Send> = match &input {
        Some(path) => {
            let file = tokio::fs::File::open(path)
                .await
                .map_err(|e| TrackError::Config(format!("cannot open {}: {e}", path.display())))?;
            Box::new(BufReader::new(file))
        }
        None => Box::new(BufReader::new(tokio::io::stdin())),
    };

    let published = feed(reader, &bus, &progress, cfg.bus_capacity, shutdown_rx).await;
    info!(published, "input finished, draining");

    let _ = shutdown_tx.send(true);
    let stats = worker_task
        .await
        .map_err(|e| TrackError::Channel(format!("worker task failed: {e}")))?;
    command_log.abort();
    Ok(stats)
}

/// Publish each non-empty line until EOF or shutdown. Keeps at most half the
/// bus capacity in flight so the worker never lags.
async fn feed(
    reader: Box<dyn AsyncBufRead + Unpin + Send>,
    bus: &EventBus,
    progress: &trackguard_runtime::WorkerProgress,
    capacity: usize,
    mut shutdown: watch::Receiver<bool>,
) -> u64 {
    let in_flight = (capacity / 2).max(1) as u64;
    let mut lines = reader.lines();
    let mut published = 0u64;

    loop {
        let line = tokio::select! {
            line = lines.next_line() => line,
            _ = shutdown.changed() => break,
        };
        let line = match line {
            Ok(Some(line)) => line,
            Ok(None) => break,
            Err(e) => {
                error!(error = %e, "failed to read input");
                break;
            }
        };
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        while published.saturating_sub(progress.received()) >= in_flight {
            if *shutdown.borrow() {
                return published;
            }
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
        match bus.publish_to(Topic::Telemetry, BusMessage::new(SOURCE, BusPayload::Telemetry(line.to_string()))) {
            Ok(_) => published += 1,
            Err(e) => {
                error!(error = %e, "telemetry not delivered");
                break;
            }
        }
    }
    published
}

async fn log_commands(bus: EventBus) {
    let mut commands = bus.subscribe_to(Topic::DeviceCommands);
    loop {
        match commands.recv().await {
            Ok(message) => {
                if let BusPayload::DeviceCommand(cmd) = message.payload {
                    info!(imei = %cmd.imei, payload = %cmd.payload, "device command published");
                }
            }
            Err(RecvError::Lagged(n)) => warn!(skipped = n, "command log lagged"),
            Err(RecvError::Closed) => break,
        }
    }
}

fn print_banner() {
    println!();
    println!("{}", "  ┌┬┐┬─┐┌─┐┌─┐┬┌─┌─┐┬ ┬┌─┐┬─┐┌┬┐".bold().cyan());
    println!("{}", "   │ ├┬┘├─┤│  ├┴┐│ ┬│ │├─┤├┬┘ ││".bold().cyan());
    println!("{}", "   ┴ ┴└─┴ ┴└─┘┴ ┴└─┘└─┘┴ ┴┴└──┴┘".bold().cyan());
    println!(
        "  {} {}",
        "trackguard".bold(),
        format!("v{}", env!("CARGO_PKG_VERSION")).dimmed()
    );
    println!("  GPS tracker rule evaluation");
    println!();
}

fn print_usage() {
    println!("usage: trackguard [--input FILE]");
    println!("  reads JSON-lines telemetry from FILE, or stdin when omitted");
    println!("  config: {}", config::config_path().display());
}

fn print_summary(stats: &WorkerStats) {
    println!();
    println!("  {} {} events, {} packets", "✓".green().bold(), stats.messages, stats.packets);
    println!("    rules fired: {}", stats.fired);
    if stats.rejected > 0 {
        println!("    {} {}", "rejected events:".yellow(), stats.rejected);
    }
    if stats.failed > 0 || stats.panicked > 0 {
        println!("    {} {}", "failed cycles:".red(), stats.failed + stats.panicked);
    }
    if stats.lagged > 0 {
        println!("    {} {}", "lost to lag:".red(), stats.lagged);
    }
}
