//! gate-sim - both controllers in one process
//!
//! Wires an actuator controller and a vision node together over an
//! in-memory link, with a simulated sensor, servo, camera, recognizer and
//! remote store, then plays scripted scenarios against them.
//!
//! Usage:
//!   cargo run --bin gate-sim -- --list
//!   cargo run --bin gate-sim -- --scenario remote_timeout

use anyhow::bail;
use clap::Parser;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{info, warn};
use tracing_subscriber::fmt::time::UtcTime;
use tracing_subscriber::EnvFilter;
use vehicle_gate::domain::types::{AlertKind, AuthCategory};
use vehicle_gate::infra::{Config, Metrics};
use vehicle_gate::io::camera::StaticCamera;
use vehicle_gate::io::firebase::{MemoryStore, StoreMode};
use vehicle_gate::io::hardware::{
    LogIndicators, Reading, SensorHandle, ServoHandle, SimulatedSensor, SimulatedServo,
};
use vehicle_gate::io::ocr::SimulatedRecognizer;
use vehicle_gate::io::sms::RecordingGateway;
use vehicle_gate::io::{ChannelTransport, LinkSettings, SerialLink};
use vehicle_gate::services::{create_alert_worker, AccessOrchestrator, VisionNode};

// ============================================================================
// Constants
// ============================================================================

const LINK_CAPACITY: usize = 256;
const CLEAR_CM: f32 = 200.0;
const VEHICLE_CM: f32 = 25.0;
const SERVO_DEG_PER_SEC: f32 = 180.0;
const OUTCOME_POLL: Duration = Duration::from_millis(100);
/// Stand-in JPEG for the static camera
const FAKE_FRAME: &[u8] = &[0xFF, 0xD8, 0xFF, 0xD9];

// ============================================================================
// CLI Args
// ============================================================================

#[derive(Parser, Debug)]
#[command(name = "gate-sim", version, about = "Run scripted gate scenarios in-process")]
struct Args {
    /// Optional TOML config; the link and timing settings apply to both nodes
    #[arg(short, long)]
    config: Option<String>,

    /// Scenario to run (default: all)
    #[arg(short, long)]
    scenario: Option<String>,

    /// List scenarios and exit
    #[arg(long)]
    list: bool,
}

// ============================================================================
// Scenarios
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq)]
enum ScenarioStep {
    /// Vehicle parks at this distance
    Vehicle(f32),
    /// Vehicle drives away
    Clear,
    /// Sensor stops returning echoes
    SensorDead,
    /// Alternating in/out readings that must never trigger
    Noise { samples: usize },
    /// Plate the recognizer will read next
    Plate(&'static str),
    Store(StoreMode),
    Reset,
    Wait(u64),
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum ExpectedOutcome {
    GateOpened,
    GateStayedClosed,
    RecognitionError,
    LocalFallbackGrant,
    Alert(AlertKind),
    NoCycle,
}

#[derive(Debug, Clone)]
struct Scenario {
    name: &'static str,
    description: &'static str,
    steps: &'static [ScenarioStep],
    expected: ExpectedOutcome,
    timeout_ms: u64,
}

const SCENARIOS: &[Scenario] = &[
    Scenario {
        name: "resident",
        description: "Registered resident, remote store online - gate opens",
        steps: &[
            ScenarioStep::Plate("ABC123"),
            ScenarioStep::Vehicle(VEHICLE_CM),
            ScenarioStep::Wait(2000),
            ScenarioStep::Clear,
        ],
        expected: ExpectedOutcome::GateOpened,
        timeout_ms: 5000,
    },
    Scenario {
        name: "remote_timeout",
        description: "Remote store hangs, plate on the local list - local fallback grant",
        steps: &[
            ScenarioStep::Store(StoreMode::Hang),
            ScenarioStep::Plate("ABC123"),
            ScenarioStep::Vehicle(VEHICLE_CM),
        ],
        expected: ExpectedOutcome::LocalFallbackGrant,
        timeout_ms: 15000,
    },
    Scenario {
        name: "unknown_plate",
        description: "Plate in neither store - denied, security alerted",
        steps: &[
            ScenarioStep::Plate("ZZZ999"),
            ScenarioStep::Vehicle(VEHICLE_CM),
            ScenarioStep::Wait(1000),
        ],
        expected: ExpectedOutcome::Alert(AlertKind::UnauthorizedVehicle),
        timeout_ms: 8000,
    },
    Scenario {
        name: "deactivated",
        description: "Record exists but is inactive - gate stays closed",
        steps: &[
            ScenarioStep::Plate("OLD001"),
            ScenarioStep::Vehicle(VEHICLE_CM),
            ScenarioStep::Wait(1500),
        ],
        expected: ExpectedOutcome::GateStayedClosed,
        timeout_ms: 5000,
    },
    Scenario {
        name: "no_plate",
        description: "Nothing readable in frame - error verdict, no alert",
        steps: &[ScenarioStep::Plate(""), ScenarioStep::Vehicle(VEHICLE_CM)],
        expected: ExpectedOutcome::RecognitionError,
        timeout_ms: 5000,
    },
    Scenario {
        name: "noise",
        description: "Readings flicker across the threshold - nothing happens",
        steps: &[ScenarioStep::Noise { samples: 60 }, ScenarioStep::Wait(3500)],
        expected: ExpectedOutcome::NoCycle,
        timeout_ms: 4000,
    },
    Scenario {
        name: "tailgating",
        description: "Second vehicle pulls up while the gate is still open",
        steps: &[
            ScenarioStep::Plate("DEF456"),
            ScenarioStep::Vehicle(VEHICLE_CM),
            ScenarioStep::Wait(1500),
            ScenarioStep::Clear,
            ScenarioStep::Wait(300),
            ScenarioStep::Vehicle(VEHICLE_CM),
        ],
        expected: ExpectedOutcome::Alert(AlertKind::Tailgating),
        timeout_ms: 8000,
    },
    Scenario {
        name: "operator_reset",
        description: "Dead sensor halts the controller, operator resets it",
        steps: &[
            ScenarioStep::Plate("ABC123"),
            ScenarioStep::SensorDead,
            ScenarioStep::Wait(6000),
            ScenarioStep::Vehicle(VEHICLE_CM),
            ScenarioStep::Reset,
        ],
        expected: ExpectedOutcome::GateOpened,
        timeout_ms: 5000,
    },
];

fn get_scenario(name: &str) -> Option<&'static Scenario> {
    SCENARIOS.iter().find(|s| s.name == name)
}

// ============================================================================
// Simulated site
// ============================================================================

/// Handles into a running pair of nodes
struct Site {
    sensor: SensorHandle,
    servo: ServoHandle,
    recognizer: Arc<SimulatedRecognizer>,
    store: Arc<MemoryStore>,
    gateway: RecordingGateway,
    metrics: Arc<Metrics>,
    resets: mpsc::Sender<()>,
    shutdown: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
    open_angle: u8,
}

impl Site {
    fn start(config: &Config) -> Self {
        let now = Instant::now();
        let settings = LinkSettings::from_config(config);
        let (controller_end, vision_end) = ChannelTransport::pair(LINK_CAPACITY);
        let (shutdown, shutdown_rx) = watch::channel(false);
        let mut tasks = Vec::new();

        // Vision controller
        let recognizer = Arc::new(SimulatedRecognizer::new(config.simulated_plate()));
        let store = Arc::new(MemoryStore::new([
            ("ABC123", AuthCategory::Resident),
            ("DEF456", AuthCategory::Temporary),
            ("EMR911", AuthCategory::Emergency),
            ("OLD001", AuthCategory::Denied),
        ]));
        let vision = VisionNode::new(
            SerialLink::new(vision_end, settings, Arc::new(Metrics::new()), now),
            Arc::new(StaticCamera::new(FAKE_FRAME.to_vec())),
            recognizer.clone(),
            store.clone(),
            config.remote_timeout(),
        );
        tasks.push(tokio::spawn(vision.run(config.tick_interval(), shutdown_rx.clone())));

        // Actuator controller
        let metrics = Arc::new(Metrics::new());
        let gateway = RecordingGateway::default();
        let (alerts, worker) =
            create_alert_worker(Some(Arc::new(gateway.clone())), config, metrics.clone());
        tasks.push(tokio::spawn(worker.with_backoff(Duration::from_millis(200)).run()));

        let (sensor, sensor_handle) = SimulatedSensor::new(CLEAR_CM);
        let (servo, servo_handle) = SimulatedServo::new(config.closed_angle(), SERVO_DEG_PER_SEC);
        let (resets, reset_rx) = mpsc::channel(4);
        let orchestrator = AccessOrchestrator::new(
            config,
            sensor,
            servo,
            LogIndicators,
            SerialLink::new(controller_end, settings, metrics.clone(), now),
            alerts,
            metrics.clone(),
        );
        tasks.push(tokio::spawn(orchestrator.run(reset_rx, shutdown_rx)));

        Self {
            sensor: sensor_handle,
            servo: servo_handle,
            recognizer,
            store,
            gateway,
            metrics,
            resets,
            shutdown,
            tasks,
            open_angle: config.open_angle(),
        }
    }

    async fn apply(&self, step: ScenarioStep) {
        info!(step = ?step, "sim_step");
        match step {
            ScenarioStep::Vehicle(cm) => self.sensor.set_resting(Reading::Distance(cm)),
            ScenarioStep::Clear => self.sensor.set_resting(Reading::Distance(CLEAR_CM)),
            ScenarioStep::SensorDead => self.sensor.set_resting(Reading::NoEcho),
            ScenarioStep::Noise { samples } => {
                for i in 0..samples {
                    self.sensor.push_cm(if i % 2 == 0 { 40.0 } else { 20.0 });
                }
            }
            ScenarioStep::Plate(plate) => self.recognizer.set_plate(plate),
            ScenarioStep::Store(mode) => self.store.set_mode(mode),
            ScenarioStep::Reset => {
                let _ = self.resets.send(()).await;
            }
            ScenarioStep::Wait(ms) => tokio::time::sleep(Duration::from_millis(ms)).await,
        }
    }

    fn alerted(&self, kind: AlertKind) -> bool {
        self.gateway.delivered().iter().any(|a| a.kind == kind)
    }

    /// Whether the outcome holds now
    fn check(&self, expected: ExpectedOutcome) -> bool {
        let report = self.metrics.report();
        match expected {
            ExpectedOutcome::GateOpened => self.servo.angle() == self.open_angle,
            ExpectedOutcome::GateStayedClosed => {
                report.denials_total > 0 && report.grants_total == 0
            }
            ExpectedOutcome::RecognitionError => {
                report.recognition_errors_total > 0 && self.gateway.delivered().is_empty()
            }
            ExpectedOutcome::LocalFallbackGrant => {
                report.local_fallbacks_total > 0 && report.grants_total > 0
            }
            ExpectedOutcome::Alert(kind) => self.alerted(kind),
            ExpectedOutcome::NoCycle => report.cycles_total == 0,
        }
    }

    async fn stop(self) {
        let _ = self.shutdown.send(true);
        for task in self.tasks {
            let _ = task.await;
        }
    }
}

// ============================================================================
// Runner
// ============================================================================

async fn run_scenario(scenario: &Scenario, config: &Config) -> bool {
    info!(scenario = scenario.name, description = scenario.description, "scenario_started");
    let site = Site::start(config);
    let started = Instant::now();

    for step in scenario.steps {
        site.apply(*step).await;
    }

    let deadline = Instant::now() + Duration::from_millis(scenario.timeout_ms);
    let mut passed = site.check(scenario.expected);
    while !passed && Instant::now() < deadline {
        tokio::time::sleep(OUTCOME_POLL).await;
        passed = site.check(scenario.expected);
    }

    let summary = site.metrics.report();
    summary.log();
    if passed {
        info!(
            scenario = scenario.name,
            elapsed_ms = %started.elapsed().as_millis(),
            "scenario_passed"
        );
    } else {
        warn!(
            scenario = scenario.name,
            expected = ?scenario.expected,
            alerts = site.gateway.delivered().len(),
            "scenario_failed"
        );
    }
    site.stop().await;
    passed
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_timer(UtcTime::rfc_3339())
        .with_target(false)
        .init();

    let args = Args::parse();

    if args.list {
        for s in SCENARIOS {
            println!("{:<16} {}", s.name, s.description);
        }
        return Ok(());
    }

    let config = match args.config {
        Some(ref path) => Config::load_from_path(path)?,
        None => Config::default(),
    };

    let selected: Vec<&Scenario> = match args.scenario {
        Some(ref name) => match get_scenario(name) {
            Some(s) => vec![s],
            None => bail!("unknown scenario '{}' (try --list)", name),
        },
        None => SCENARIOS.iter().collect(),
    };

    let mut failed = Vec::new();
    for scenario in selected {
        if !run_scenario(scenario, &config).await {
            failed.push(scenario.name);
        }
    }

    if !failed.is_empty() {
        bail!("{} scenario(s) failed: {}", failed.len(), failed.join(", "));
    }
    info!("all scenarios passed");
    Ok(())
}
