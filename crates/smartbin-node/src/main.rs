//! Smartbin Node - gateway daemon for a smart waste bin
//!
//! Reads telemetry from the bin controller's serial port and forwards it
//! through the bridge:
//! - every reading merges into the bin's state node
//! - every detection appends a log entry
//!
//! The bundled sink is the in-process [`MemoryDatabase`]; its final contents
//! can be dumped on exit with `--dump-state`.

use anyhow::Context;
use clap::Parser;
use std::path::PathBuf;
use std::time::Duration;
use tracing::{info, warn, Level};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use smartbin_bridge::{MemoryDatabase, OverflowPolicy, TelemetryConfig};

#[derive(Parser, Debug)]
#[command(name = "smartbin-node")]
#[command(about = "Forward smart-bin serial telemetry to a real-time database")]
#[command(version)]
struct Args {
    /// JSON configuration file; flags below override it
    #[arg(long, short, env = "SMARTBIN_CONFIG")]
    config: Option<PathBuf>,

    /// Serial port path, or `auto` to pick the first Arduino-like device
    #[arg(long, short, env = "SMARTBIN_PORT")]
    port: Option<PathBuf>,

    /// Serial baud rate
    #[arg(long, short, env = "SMARTBIN_BAUD")]
    baud: Option<u32>,

    /// Serial read timeout in milliseconds
    #[arg(long, env = "SMARTBIN_READ_TIMEOUT_MS")]
    read_timeout_ms: Option<u64>,

    /// Bin identifier used as the database path root
    #[arg(long, env = "SMARTBIN_BIN_ID")]
    bin_id: Option<String>,

    /// Marker that starts every telemetry line
    #[arg(long, env = "SMARTBIN_PREFIX")]
    prefix: Option<String>,

    /// Readings buffered between serial and uplink
    #[arg(long, env = "SMARTBIN_QUEUE_CAPACITY")]
    queue_capacity: Option<usize>,

    /// What to do when the queue is full: `drop-oldest` or `block`
    #[arg(long, env = "SMARTBIN_OVERFLOW", value_parser = parse_overflow)]
    overflow: Option<OverflowPolicy>,

    /// Retries per remote write before dropping the reading (default: unbounded)
    #[arg(long, env = "SMARTBIN_MAX_RETRIES")]
    max_retries: Option<u32>,

    /// List detected serial devices and exit
    #[arg(long)]
    list_devices: bool,

    /// Print the database contents as JSON on exit
    #[arg(long)]
    dump_state: bool,

    /// Enable verbose logging
    #[arg(long, short)]
    verbose: bool,
}

fn parse_overflow(value: &str) -> Result<OverflowPolicy, String> {
    match value {
        "drop-oldest" | "drop_oldest" => Ok(OverflowPolicy::DropOldest),
        "block" => Ok(OverflowPolicy::Block),
        other => Err(format!(
            "unknown overflow policy `{}` (expected drop-oldest or block)",
            other
        )),
    }
}

impl Args {
    /// Load the config file, if any, and apply flag overrides
    fn load_config(&self) -> anyhow::Result<TelemetryConfig> {
        let mut config = match &self.config {
            Some(path) => TelemetryConfig::from_file(path)
                .with_context(|| format!("loading {}", path.display()))?,
            None => TelemetryConfig::default(),
        };

        if let Some(port) = &self.port {
            config.serial.port = port.clone();
        }
        if let Some(baud) = self.baud {
            config.serial.baud_rate = baud;
        }
        if let Some(ms) = self.read_timeout_ms {
            config.serial.read_timeout = Duration::from_millis(ms);
        }
        if let Some(bin_id) = &self.bin_id {
            config.uplink.bin_id = bin_id.clone();
        }
        if let Some(prefix) = &self.prefix {
            config.frame.prefix = prefix.clone();
        }
        if let Some(capacity) = self.queue_capacity {
            config.queue.capacity = capacity;
        }
        if let Some(policy) = self.overflow {
            config.queue.overflow = policy;
        }
        if self.max_retries.is_some() {
            config.uplink.retry.max_retries = self.max_retries;
        }

        config.validate().context("invalid configuration")?;
        Ok(config)
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // Initialize logging; RUST_LOG wins over --verbose
    let level = if args.verbose { Level::DEBUG } else { Level::INFO };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(level.as_str().to_lowercase()));
    let subscriber = FmtSubscriber::builder().with_env_filter(filter).finish();
    tracing::subscriber::set_global_default(subscriber)?;

    if args.list_devices {
        list_devices();
        return Ok(());
    }

    let config = args.load_config()?;
    info!(
        version = smartbin_bridge::VERSION,
        port = %config.serial.port.display(),
        baud = config.serial.baud_rate,
        bin_id = %config.uplink.bin_id,
        "Starting smartbin node"
    );

    let database = std::sync::Arc::new(MemoryDatabase::new());
    run_bridge(database.clone(), config).await?;

    if args.dump_state {
        println!("{}", serde_json::to_string_pretty(&database.snapshot())?);
    }
    Ok(())
}

#[cfg(feature = "serial")]
async fn run_bridge(
    database: std::sync::Arc<MemoryDatabase>,
    config: TelemetryConfig,
) -> anyhow::Result<()> {
    use smartbin_bridge::TelemetryBridge;

    let (bridge, handle) = TelemetryBridge::with_serial(database, config);

    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => handle.shutdown(),
            Err(e) => warn!(error = %e, "Cannot listen for Ctrl-C"),
        }
    });

    let report = bridge.run().await?;
    info!(
        readings = report.ingest.readings,
        malformed = report.ingest.malformed_frames,
        invalid = report.ingest.invalid_readings,
        acked = report.publish.acked,
        retries = report.publish.retries,
        lost = report.lost(),
        "Smartbin node stopped"
    );
    Ok(())
}

#[cfg(not(feature = "serial"))]
async fn run_bridge(
    _database: std::sync::Arc<MemoryDatabase>,
    _config: TelemetryConfig,
) -> anyhow::Result<()> {
    anyhow::bail!("built without the `serial` feature, no serial link available")
}

#[cfg(feature = "serial")]
fn list_devices() {
    let devices = smartbin_bridge::list_available_devices();
    if devices.is_empty() {
        println!("No serial devices found");
    }
    for device in devices {
        println!(
            "{}\t{}\t{}{}",
            device.path,
            device.device_type,
            device.product_name.as_deref().unwrap_or("-"),
            if device.is_likely_controller { "\t(controller)" } else { "" }
        );
    }
}

#[cfg(not(feature = "serial"))]
fn list_devices() {
    warn!("Serial feature not enabled, cannot detect devices");
}
