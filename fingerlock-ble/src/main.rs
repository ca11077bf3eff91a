//! Fingerprint door lock central
//!
//! Scans for the sensor/lock peripheral, connects, and turns every
//! fingerprint the sensor reports into a lock or unlock command.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use fingerlock_ble_controller::{BtleplugTransport, ble};
use fingerlock_session::{
    ChannelSink, ClassLabel, ClassificationError, Classifier, ConnectionSession, EventSender,
    FEATURE_LEN, Inbox, LinearModel, NoModel, ScanOutcome, SessionConfig, SessionEvent,
    SessionHandle, Transport, fingerlock_home, inbox,
};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;

#[derive(Parser)]
#[command(name = "fingerlock-ble")]
#[command(about = "BLE central for the fingerprint door lock")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List nearby BLE devices
    Scan {
        /// Scan duration in seconds
        #[arg(short, long, default_value = "5")]
        duration: u64,
        /// Name substring that marks the lock peripheral
        #[arg(short, long)]
        marker: Option<String>,
    },
    /// Run the interactive lock controller
    Run {
        /// Classifier model (JSON), overrides config.json
        #[arg(long)]
        model: Option<PathBuf>,
        /// Name substring that marks the lock peripheral
        #[arg(short, long)]
        marker: Option<String>,
        /// Scan timeout in milliseconds
        #[arg(long)]
        scan_timeout_ms: Option<u64>,
        /// Scan and connect at startup
        #[arg(long)]
        auto_connect: bool,
        /// Use a simulated peripheral instead of the Bluetooth adapter
        #[arg(long)]
        demo: bool,
    },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();
    let home = fingerlock_home()?;
    let mut config = SessionConfig::load_or_create(&home)?;

    match cli.command {
        Commands::Scan { duration, marker } => {
            let marker = marker.unwrap_or(config.name_marker);
            scan_devices(Duration::from_secs(duration), &marker).await?;
        }
        Commands::Run {
            model,
            marker,
            scan_timeout_ms,
            auto_connect,
            demo,
        } => {
            if let Some(model) = model {
                config.model_path = Some(model);
            }
            if let Some(marker) = marker {
                config.name_marker = marker;
            }
            if let Some(ms) = scan_timeout_ms {
                config.scan_timeout_ms = ms;
            }

            let classifier = Model::load(&config);
            let (events, inbox) = inbox();

            if demo {
                run_demo(events, inbox, classifier, config, auto_connect).await?;
            } else {
                let adapter = ble::get_adapter().await?;
                let transport = BtleplugTransport::new(adapter, events).await?;
                run(inbox, transport, classifier, config, auto_connect, None).await?;
            }
        }
    }

    Ok(())
}

async fn scan_devices(duration: Duration, marker: &str) -> Result<(), Box<dyn std::error::Error>> {
    println!("Scanning for {marker:?} ({} seconds)...", duration.as_secs());

    let devices = ble::scan(duration, marker).await?;

    println!("\nFound {} devices:", devices.len());
    for device in devices {
        let rssi = device
            .rssi
            .map(|r| format!("{r} dBm"))
            .unwrap_or_else(|| "N/A".to_string());
        let tag = if device.is_fingerlock { " [LOCK]" } else { "" };
        println!("  {} ({}) RSSI: {}{}", device.name, device.handle, rssi, tag);
    }

    Ok(())
}

/// Configured classifier, or a stand-in that refuses to classify
enum Model {
    Linear(LinearModel),
    Missing(NoModel),
}

impl Model {
    fn load(config: &SessionConfig) -> Self {
        let Some(path) = &config.model_path else {
            log::warn!("No classifier model configured; fingerprints will not be classified");
            return Model::Missing(NoModel);
        };
        match LinearModel::load(path) {
            Ok(model) => Model::Linear(model),
            Err(e) => {
                log::warn!("Could not load classifier model: {e}");
                Model::Missing(NoModel)
            }
        }
    }
}

impl Classifier for Model {
    fn predict(&self, features: &[f64; FEATURE_LEN]) -> Result<ClassLabel, ClassificationError> {
        match self {
            Model::Linear(model) => model.predict(features),
            Model::Missing(none) => none.predict(features),
        }
    }
}

/// Simulates a finger on the sensor; only the demo peripheral has one
type Touch = Box<dyn Fn() + Send>;

#[cfg(feature = "demo")]
async fn run_demo(
    events: EventSender,
    inbox: Inbox,
    classifier: Model,
    config: SessionConfig,
    auto_connect: bool,
) -> Result<(), Box<dyn std::error::Error>> {
    use fingerlock_session::mock::{Behavior, MockTransport};

    let fingerprint: Vec<u8> = (0..FEATURE_LEN).map(|i| (i * 7 % 256) as u8).collect();
    let mock = MockTransport::new(events, Behavior::fingerlock().with_fingerprint(&fingerprint));
    let sensor = mock.clone();
    let touch: Touch = Box::new(move || sensor.touch());
    run(inbox, mock, classifier, config, auto_connect, Some(touch)).await
}

#[cfg(not(feature = "demo"))]
async fn run_demo(
    _events: EventSender,
    _inbox: Inbox,
    _classifier: Model,
    _config: SessionConfig,
    _auto_connect: bool,
) -> Result<(), Box<dyn std::error::Error>> {
    Err("built without the `demo` feature; rebuild with `--features demo`".into())
}

async fn run<T: Transport>(
    inbox: Inbox,
    transport: T,
    classifier: Model,
    config: SessionConfig,
    auto_connect: bool,
    touch: Option<Touch>,
) -> Result<(), Box<dyn std::error::Error>> {
    let scan_timeout = config.scan_timeout();
    let (sink, events) = ChannelSink::new();
    let (session, handle) = ConnectionSession::new(inbox, transport, classifier, Arc::new(sink), config);
    let worker = tokio::spawn(session.run());
    tokio::spawn(print_events(events));

    if auto_connect {
        spawn_scan(handle.clone(), scan_timeout, true);
    }

    println!("Commands: scan, cancel, connect, disconnect, open, close, status, quit");
    if touch.is_some() {
        println!("Demo mode: 'touch' simulates a finger on the sensor");
    }

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        match line.trim() {
            "" => {}
            "scan" => spawn_scan(handle.clone(), scan_timeout, false),
            "cancel" => handle.cancel_scan()?,
            "connect" => handle.connect()?,
            "disconnect" => handle.disconnect()?,
            "open" => report(handle.force_open().await),
            "close" => report(handle.force_close().await),
            "status" => {
                let snapshot = handle.status().await?;
                let peripheral = snapshot
                    .peripheral
                    .map(|p| p.to_string())
                    .unwrap_or_else(|| "-".to_string());
                println!(
                    "{:?}  peripheral {peripheral}  bound {}/5  gate {}",
                    snapshot.state,
                    snapshot.bound.len(),
                    if snapshot.gate_open { "open" } else { "closed" }
                );
            }
            "touch" => match &touch {
                Some(touch) => touch(),
                None => println!("'touch' is only available with --demo"),
            },
            "quit" | "exit" => break,
            other => println!("Unknown command: {other}"),
        }
    }

    handle.shutdown()?;
    worker.await?;
    Ok(())
}

fn spawn_scan(handle: SessionHandle, timeout: Duration, then_connect: bool) {
    tokio::spawn(async move {
        match handle.start_scan(timeout).await {
            Ok(ScanOutcome::Found) if then_connect => {
                if let Err(e) = handle.connect() {
                    log::error!("Connect failed: {e}");
                }
            }
            Ok(outcome) => log::debug!("Scan finished: {outcome:?}"),
            Err(e) => println!("Scan failed: {e}"),
        }
    });
}

fn report<E: std::fmt::Display>(result: Result<(), E>) {
    if let Err(e) = result {
        println!("Lock write failed: {e}");
    }
}

async fn print_events(mut events: mpsc::UnboundedReceiver<SessionEvent>) {
    while let Some(event) = events.recv().await {
        match event {
            SessionEvent::State(state) => println!("[{state:?}]"),
            SessionEvent::Status(text) => println!("{text}"),
            SessionEvent::Decision(record) => println!("{}  {record}", record.timestamp),
        }
    }
}
