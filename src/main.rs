//! gate-node - one controller of the vehicle access gate
//!
//! Runs either side of the serial link:
//! - `controller` - distance monitor, gate, authorization and alerts
//! - `vision` - camera capture, plate recognition and remote lookups
//!
//! The controller has no pin-level drivers in this crate; it reads distances
//! (cm) from stdin, one per line. `noecho` simulates a dead sensor and
//! `reset` acknowledges a latched alarm.

use anyhow::Context;
use clap::{Parser, ValueEnum};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::{mpsc, watch};
use tracing::{info, warn};
use tracing_subscriber::fmt::time::UtcTime;
use tracing_subscriber::EnvFilter;
use vehicle_gate::infra::{Config, Metrics};
use vehicle_gate::io::camera::HttpCamera;
use vehicle_gate::io::firebase::FirebaseStore;
use vehicle_gate::io::hardware::{LogIndicators, Reading, SensorHandle, SimulatedSensor, SimulatedServo};
use vehicle_gate::io::ocr::{OcrSpaceRecognizer, Recognizer, SimulatedRecognizer};
use vehicle_gate::io::sms::{AlertGateway, TwilioGateway};
use vehicle_gate::io::{open_serial_transport, LinkSettings, SerialLink};
use vehicle_gate::services::{create_alert_worker, AccessOrchestrator, VisionNode};

/// Resting distance reported before the first stdin reading
const CLEAR_DISTANCE_CM: f32 = 200.0;
/// Simulated servo sweep rate
const SERVO_DEG_PER_SEC: f32 = 180.0;

#[derive(Debug, Clone, Copy, ValueEnum)]
enum Role {
    Controller,
    Vision,
}

/// Vehicle access gate node
#[derive(Parser, Debug)]
#[command(name = "gate-node", version, about)]
struct Args {
    /// Path to TOML configuration file (default: $CONFIG_FILE or config/dev.toml)
    #[arg(short, long)]
    config: Option<String>,

    /// Which controller to run
    #[arg(short, long, value_enum, default_value = "controller")]
    role: Role,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Default: INFO, use RUST_LOG=debug for full event visibility
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_timer(UtcTime::rfc_3339())
        .with_target(false)
        .init();

    let args = Args::parse();
    info!(version = env!("CARGO_PKG_VERSION"), git_hash = env!("GIT_HASH"), role = ?args.role, "gate-node starting");

    let config = match &args.config {
        Some(path) => Config::load_from_path(path),
        None => Config::load(&[]),
    }
    .context("loading configuration")?;
    info!(
        config_file = %config.config_file(),
        site_id = %config.site_id(),
        serial_device = %config.serial_device(),
        serial_baud = %config.serial_baud(),
        tick_ms = %config.tick_interval().as_millis(),
        "config_loaded"
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        info!("shutdown_signal_received");
        let _ = shutdown_tx.send(true);
    });

    match args.role {
        Role::Controller => run_controller(config, shutdown_rx).await?,
        Role::Vision => run_vision(config, shutdown_rx).await?,
    }

    info!("gate-node shutdown complete");
    Ok(())
}

async fn run_controller(config: Config, shutdown: watch::Receiver<bool>) -> anyhow::Result<()> {
    let metrics = Arc::new(Metrics::new());
    let transport =
        open_serial_transport(config.serial_device(), config.serial_baud(), shutdown.clone())?;
    let link = SerialLink::new(
        transport,
        LinkSettings::from_config(&config),
        metrics.clone(),
        std::time::Instant::now(),
    );

    let gateway = TwilioGateway::from_config(&config).map(|g| Arc::new(g) as Arc<dyn AlertGateway>);
    if gateway.is_none() {
        warn!("sms_not_configured");
    }
    let (alerts, alert_worker) = create_alert_worker(gateway, &config, metrics.clone());
    tokio::spawn(alert_worker.run());

    let (sensor, sensor_handle) = SimulatedSensor::new(CLEAR_DISTANCE_CM);
    let (servo, _servo_handle) = SimulatedServo::new(config.closed_angle(), SERVO_DEG_PER_SEC);

    let (reset_tx, reset_rx) = mpsc::channel(4);
    tokio::spawn(read_operator_input(sensor_handle, reset_tx));

    let orchestrator =
        AccessOrchestrator::new(&config, sensor, servo, LogIndicators, link, alerts, metrics);
    orchestrator.run(reset_rx, shutdown).await;
    Ok(())
}

async fn run_vision(config: Config, shutdown: watch::Receiver<bool>) -> anyhow::Result<()> {
    let metrics = Arc::new(Metrics::new());
    let transport =
        open_serial_transport(config.serial_device(), config.serial_baud(), shutdown.clone())?;
    let link = SerialLink::new(
        transport,
        LinkSettings::from_config(&config),
        metrics,
        std::time::Instant::now(),
    );

    let camera = HttpCamera::new(config.camera_url(), config.capture_timeout())
        .context("building camera client")?;
    let recognizer: Arc<dyn Recognizer> = match (config.ocr_enabled(), config.ocr_api_key()) {
        (true, Some(key)) => Arc::new(
            OcrSpaceRecognizer::new(config.ocr_api_url(), key, config.capture_timeout())
                .context("building OCR client")?,
        ),
        (true, None) => {
            warn!(plate = %config.simulated_plate(), "ocr_key_missing_using_simulated");
            Arc::new(SimulatedRecognizer::new(config.simulated_plate()))
        }
        (false, _) => {
            info!(plate = %config.simulated_plate(), "ocr_disabled_using_simulated");
            Arc::new(SimulatedRecognizer::new(config.simulated_plate()))
        }
    };
    let store = FirebaseStore::new(&config).context("building Firebase client")?;

    let node = VisionNode::new(
        link,
        Arc::new(camera),
        recognizer,
        Arc::new(store),
        config.remote_timeout(),
    );
    node.run(config.tick_interval(), shutdown).await;
    Ok(())
}

/// Feed stdin lines to the simulated sensor and the reset channel
async fn read_operator_input(sensor: SensorHandle, resets: mpsc::Sender<()>) {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => {
                info!("operator_input_closed");
                return;
            }
            Err(e) => {
                warn!(error = %e, "operator_input_error");
                return;
            }
        };

        match line.trim() {
            "" => {}
            "reset" => {
                let _ = resets.send(()).await;
            }
            "noecho" => sensor.set_resting(Reading::NoEcho),
            other => match other.parse::<f32>() {
                Ok(cm) => sensor.set_resting(Reading::Distance(cm)),
                Err(_) => warn!(input = %other, "operator_input_unrecognized"),
            },
        }
    }
}
