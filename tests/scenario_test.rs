//! End-to-end scenarios: actuator controller and vision node over an
//! in-memory link, with injected time on the control side.

use std::sync::Arc;
use std::time::{Duration, Instant};
use vehicle_gate::domain::types::{AccessState, AlertKind, AuthCategory, VerdictSource};
use vehicle_gate::infra::{Config, Metrics};
use vehicle_gate::io::camera::StaticCamera;
use vehicle_gate::io::firebase::{MemoryStore, StoreMode};
use vehicle_gate::io::hardware::{
    Reading, RecordingIndicators, SensorHandle, ServoHandle, SimulatedSensor, SimulatedServo,
};
use vehicle_gate::io::ocr::SimulatedRecognizer;
use vehicle_gate::io::sms::RecordingGateway;
use vehicle_gate::io::{ChannelTransport, LinkSettings, SerialLink};
use vehicle_gate::services::{create_alert_worker, AccessOrchestrator, VisionNode};

const TICK: Duration = Duration::from_millis(50);

type Controller =
    AccessOrchestrator<SimulatedSensor, SimulatedServo, RecordingIndicators, ChannelTransport>;

struct Site {
    controller: Controller,
    vision: VisionNode<ChannelTransport>,
    /// Vision node stops ticking when set
    vision_down: bool,
    sensor: SensorHandle,
    servo: ServoHandle,
    recognizer: Arc<SimulatedRecognizer>,
    store: Arc<MemoryStore>,
    gateway: RecordingGateway,
    metrics: Arc<Metrics>,
    now: Instant,
}

impl Site {
    fn new(camera: StaticCamera) -> Self {
        let config = Config::from_toml_str("[debug]\nenabled = false\n").unwrap();
        let now = Instant::now();
        let settings = LinkSettings::from_config(&config);
        let (controller_end, vision_end) = ChannelTransport::pair(256);
        let metrics = Arc::new(Metrics::new());

        let recognizer = Arc::new(SimulatedRecognizer::new("ABC123"));
        let store = Arc::new(MemoryStore::new([
            ("ABC123", AuthCategory::Resident),
            ("EMR911", AuthCategory::Emergency),
        ]));
        let vision = VisionNode::new(
            SerialLink::new(vision_end, settings, Arc::new(Metrics::new()), now),
            Arc::new(camera),
            recognizer.clone(),
            store.clone(),
            config.remote_timeout(),
        );

        let gateway = RecordingGateway::default();
        let (alerts, worker) =
            create_alert_worker(Some(Arc::new(gateway.clone())), &config, metrics.clone());
        tokio::spawn(worker.with_backoff(Duration::ZERO).run());

        let (sensor, sensor_handle) = SimulatedSensor::new(200.0);
        let (servo, servo_handle) = SimulatedServo::new(config.closed_angle(), 180.0);
        let controller = AccessOrchestrator::new(
            &config,
            sensor,
            servo,
            RecordingIndicators::default(),
            SerialLink::new(controller_end, settings, metrics.clone(), now),
            alerts,
            metrics.clone(),
        );

        Self {
            controller,
            vision,
            vision_down: false,
            sensor: sensor_handle,
            servo: servo_handle,
            recognizer,
            store,
            gateway,
            metrics,
            now,
        }
    }

    async fn step(&mut self) {
        self.now += TICK;
        if !self.vision_down {
            self.vision.tick(self.now);
        }
        // Let spawned capture/lookup and alert tasks run
        for _ in 0..4 {
            tokio::task::yield_now().await;
        }
        self.controller.tick(self.now);
    }

    async fn run_until(&mut self, limit: Duration, pred: impl Fn(&Site) -> bool) -> Duration {
        let start = self.now;
        while !pred(self) {
            assert!(self.now - start < limit, "condition not reached within {limit:?}");
            self.step().await;
        }
        self.now - start
    }

    async fn settle(&mut self) {
        for _ in 0..10 {
            self.step().await;
        }
    }

    fn arrive(&self) {
        self.sensor.set_resting(Reading::Distance(25.0));
    }

    fn verdict_source(&self) -> Option<(AuthCategory, VerdictSource)> {
        self.controller.last_verdict().map(|v| (v.category, v.source))
    }

    fn alert_kinds(&self) -> Vec<AlertKind> {
        self.gateway.delivered().iter().map(|a| a.kind).collect()
    }
}

#[tokio::test]
async fn test_resident_admitted_through_remote_store() {
    let mut site = Site::new(StaticCamera::new(vec![0xFF, 0xD8]));
    site.settle().await;
    site.arrive();

    site.run_until(Duration::from_secs(2), |s| s.controller.state() == AccessState::Open).await;
    assert_eq!(site.verdict_source(), Some((AuthCategory::Resident, VerdictSource::Remote)));

    site.run_until(Duration::from_secs(2), |s| s.servo.angle() == 90).await;
    assert_eq!(site.metrics.grants_total(), 1);
    assert!(site.alert_kinds().is_empty());

    site.run_until(Duration::from_secs(1), |s| !s.store.access_log().is_empty()).await;
    let log = site.store.access_log();
    assert_eq!(log.len(), 1);
    assert_eq!(log[0].plate, "ABC123");
    assert_eq!((log[0].category, log[0].source), (AuthCategory::Resident, VerdictSource::Remote));
}

#[tokio::test]
async fn test_unknown_plate_lands_in_unauthorized_log() {
    let mut site = Site::new(StaticCamera::new(vec![0xFF, 0xD8]));
    site.recognizer.set_plate("ZZZ999");
    site.arrive();

    site.run_until(Duration::from_secs(2), |s| s.controller.last_verdict().is_some()).await;
    assert_eq!(site.verdict_source(), Some((AuthCategory::Denied, VerdictSource::Remote)));

    site.run_until(Duration::from_secs(1), |s| !s.store.access_log().is_empty()).await;
    let log = site.store.access_log();
    assert_eq!(log.len(), 1);
    assert_eq!(log[0].plate, "ZZZ999");
    assert!(!log[0].is_granted());
}

#[tokio::test]
async fn test_hung_store_falls_back_to_local_list() {
    let mut site = Site::new(StaticCamera::new(vec![0xFF, 0xD8]));
    site.store.set_mode(StoreMode::Hang);
    site.arrive();

    site.run_until(Duration::from_secs(2), |s| s.controller.state() == AccessState::Authorizing)
        .await;
    let waited = site
        .run_until(Duration::from_secs(11), |s| s.controller.last_verdict().is_some())
        .await;
    assert!(waited >= Duration::from_secs(10));
    assert_eq!(site.verdict_source(), Some((AuthCategory::Resident, VerdictSource::LocalFallback)));

    // Gate opens, auto-closes, controller returns to idle
    site.run_until(Duration::from_secs(2), |s| s.servo.angle() == 90).await;
    site.sensor.set_resting(Reading::Distance(200.0));
    site.run_until(Duration::from_secs(8), |s| !s.controller.gate().is_open()).await;
    site.run_until(Duration::from_secs(6), |s| s.controller.state() == AccessState::Idle).await;
    assert_eq!(site.metrics.local_fallbacks_total(), 1);
}

#[tokio::test]
async fn test_offline_store_denies_unknown_plate() {
    let mut site = Site::new(StaticCamera::new(vec![0xFF, 0xD8]));
    site.store.set_mode(StoreMode::Offline);
    site.recognizer.set_plate("ZZZ999");
    site.arrive();

    site.run_until(Duration::from_secs(2), |s| s.controller.last_verdict().is_some()).await;
    assert_eq!(site.verdict_source(), Some((AuthCategory::Denied, VerdictSource::LocalFallback)));

    site.run_until(Duration::from_secs(1), |s| !s.gateway.delivered().is_empty()).await;
    assert_eq!(site.alert_kinds(), vec![AlertKind::UnauthorizedVehicle]);
    assert_eq!(site.servo.angle(), 0);
}

#[tokio::test]
async fn test_vision_node_down_denies_without_capture() {
    let mut site = Site::new(StaticCamera::new(vec![0xFF, 0xD8]));
    site.vision_down = true;
    site.run_until(Duration::from_secs(4), |s| !s.controller.is_peer_reachable(s.now)).await;

    site.arrive();
    site.run_until(Duration::from_secs(1), |s| s.controller.last_verdict().is_some()).await;
    let verdict = site.controller.last_verdict().unwrap().clone();
    assert_eq!(verdict.category, AuthCategory::Denied);
    assert_eq!(verdict.plate, None);

    site.run_until(Duration::from_secs(1), |s| !s.gateway.delivered().is_empty()).await;
    assert_eq!(site.alert_kinds(), vec![AlertKind::UnverifiedVehicle]);
}

#[tokio::test]
async fn test_camera_fault_is_error_verdict() {
    let mut site = Site::new(StaticCamera::broken());
    site.arrive();

    site.run_until(Duration::from_secs(2), |s| s.controller.last_verdict().is_some()).await;
    assert_eq!(site.verdict_source(), Some((AuthCategory::Error, VerdictSource::Recognition)));
    assert!(!site.controller.is_alarm_active());

    site.settle().await;
    assert!(site.gateway.delivered().is_empty());
    assert_eq!(site.metrics.report().recognition_errors_total, 1);
}
