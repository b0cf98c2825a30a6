//! Configuration loading from TOML files
//!
//! Config file is selected via:
//! 1. --config <path> command line argument
//! 2. CONFIG_FILE environment variable
//! 3. Default: config/dev.toml
//!
//! Every section is optional; missing values fall back to the firmware
//! defaults (30 cm detection, 20 s process timeout, 7/6/5 s open times...).

use crate::domain::error::ConfigError;
use crate::domain::types::{normalize_plate, AuthCategory};
use anyhow::Context;
use serde::Deserialize;
use std::env;
use std::fs;
use std::io;
use std::path::Path;
use std::time::Duration;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SiteConfig {
    /// Location name used in alert messages
    pub id: String,
}

impl Default for SiteConfig {
    fn default() -> Self {
        Self { id: "entrada_principal".to_string() }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SensorConfig {
    /// Vehicle is present below this distance
    pub detection_cm: f32,
    /// Readings at or below this are noise
    pub min_cm: f32,
    /// HC-SR04 maximum usable range
    pub max_cm: f32,
    pub echo_timeout_ms: u64,
    /// Consecutive invalid samples before the sensor is declared dead
    pub fault_threshold: u32,
}

impl Default for SensorConfig {
    fn default() -> Self {
        Self {
            detection_cm: 30.0,
            min_cm: 5.0,
            max_cm: 400.0,
            echo_timeout_ms: 30,
            fault_threshold: 100,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct GateConfig {
    pub closed_angle: u8,
    pub open_angle: u8,
    pub resident_open_ms: u64,
    pub temporary_open_ms: u64,
    pub emergency_open_ms: u64,
    /// Servo must reach the commanded angle within this window
    pub travel_timeout_ms: u64,
}

impl Default for GateConfig {
    fn default() -> Self {
        Self {
            closed_angle: 0,
            open_angle: 90,
            resident_open_ms: 7000,
            temporary_open_ms: 6000,
            emergency_open_ms: 5000,
            travel_timeout_ms: 2000,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TimingConfig {
    /// Deadline for DETECTED -> verdict
    pub process_timeout_ms: u64,
    pub cooldown_ms: u64,
    pub tick_ms: u64,
    /// Capture-side wait for CAPTURE_RESULT
    pub capture_timeout_ms: u64,
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self { process_timeout_ms: 20000, cooldown_ms: 5000, tick_ms: 50, capture_timeout_ms: 8000 }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LinkConfig {
    pub heartbeat_interval_ms: u64,
    /// Consecutive missed heartbeats before the peer is unreachable
    pub missed_heartbeats: u32,
    pub ack_timeout_ms: u64,
    pub retry_backoff_ms: u64,
    /// Retransmissions after the first attempt
    pub max_retries: u32,
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval_ms: 1000,
            missed_heartbeats: 3,
            ack_timeout_ms: 300,
            retry_backoff_ms: 100,
            max_retries: 3,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SerialConfig {
    pub device: String,
    pub baud: u32,
}

impl Default for SerialConfig {
    fn default() -> Self {
        Self { device: "/dev/ttyUSB0".to_string(), baud: 115200 }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct VisionConfig {
    /// Snapshot endpoint of the camera
    pub camera_url: String,
    /// false = simulated recognition returning `simulated_plate`
    pub ocr_enabled: bool,
    pub simulated_plate: String,
}

impl Default for VisionConfig {
    fn default() -> Self {
        Self {
            camera_url: "http://192.168.4.1/capture".to_string(),
            ocr_enabled: true,
            simulated_plate: "ABC123".to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct FirebaseConfig {
    pub host: String,
    #[serde(default)]
    pub auth: Option<String>,
    pub timeout_ms: u64,
}

impl Default for FirebaseConfig {
    fn default() -> Self {
        Self {
            host: "tu-proyecto-default-rtdb.firebaseio.com".to_string(),
            auth: None,
            timeout_ms: 10000,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct OcrConfig {
    pub api_url: String,
    #[serde(default)]
    pub api_key: Option<String>,
}

impl Default for OcrConfig {
    fn default() -> Self {
        Self { api_url: "https://api.ocr.space/parse/image".to_string(), api_key: None }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AlertsConfig {
    pub twilio_account_sid: Option<String>,
    pub twilio_auth_token: Option<String>,
    pub phone_from: Option<String>,
    pub phone_security: Option<String>,
    /// Per-attempt bound
    pub timeout_ms: u64,
    pub max_attempts: u32,
    pub queue_size: usize,
}

impl Default for AlertsConfig {
    fn default() -> Self {
        Self {
            twilio_account_sid: None,
            twilio_auth_token: None,
            phone_from: None,
            phone_security: None,
            timeout_ms: 15000,
            max_attempts: 3,
            queue_size: 32,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AuthorizationConfig {
    /// Backup list consulted when the remote store is unreachable
    pub local_plates: Vec<String>,
    /// Recognition reads below this are inconclusive
    pub min_confidence: f32,
}

impl Default for AuthorizationConfig {
    fn default() -> Self {
        Self { local_plates: default_local_plates(), min_confidence: 0.5 }
    }
}

fn default_local_plates() -> Vec<String> {
    ["ABC123", "DEF456", "GHI789", "JKL012"].iter().map(|p| p.to_string()).collect()
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DebugConfig {
    pub enabled: bool,
    pub interval_ms: u64,
}

impl Default for DebugConfig {
    fn default() -> Self {
        Self { enabled: true, interval_ms: 5000 }
    }
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct TomlConfig {
    pub site: SiteConfig,
    pub sensor: SensorConfig,
    pub gate: GateConfig,
    pub timing: TimingConfig,
    pub link: LinkConfig,
    pub serial: SerialConfig,
    pub vision: VisionConfig,
    pub firebase: FirebaseConfig,
    pub ocr: OcrConfig,
    pub alerts: AlertsConfig,
    pub authorization: AuthorizationConfig,
    pub debug: DebugConfig,
}

/// Main configuration struct used throughout the application
#[derive(Debug, Clone)]
pub struct Config {
    config_file: String,
    site_id: String,
    sensor: SensorConfig,
    gate: GateConfig,
    timing: TimingConfig,
    link: LinkConfig,
    serial: SerialConfig,
    vision: VisionConfig,
    firebase: FirebaseConfig,
    ocr: OcrConfig,
    alerts: AlertsConfig,
    local_plates: Vec<String>,
    min_confidence: f32,
    debug_enabled: bool,
    debug_interval_ms: u64,
}

impl Default for Config {
    fn default() -> Self {
        let defaults = TomlConfig::default();
        Self {
            config_file: "default".to_string(),
            site_id: defaults.site.id,
            sensor: defaults.sensor,
            gate: defaults.gate,
            timing: defaults.timing,
            link: defaults.link,
            serial: defaults.serial,
            vision: defaults.vision,
            firebase: defaults.firebase,
            ocr: defaults.ocr,
            alerts: defaults.alerts,
            local_plates: defaults.authorization.local_plates,
            min_confidence: defaults.authorization.min_confidence,
            debug_enabled: defaults.debug.enabled,
            debug_interval_ms: defaults.debug.interval_ms,
        }
    }
}

fn is_not_found(err: &anyhow::Error) -> bool {
    err.chain()
        .filter_map(|cause| cause.downcast_ref::<io::Error>())
        .any(|e| e.kind() == io::ErrorKind::NotFound)
}

impl Config {
    /// Determine config file path from args or environment
    pub fn resolve_config_path(args: &[String]) -> String {
        for (i, arg) in args.iter().enumerate() {
            if arg == "--config" {
                if let Some(path) = args.get(i + 1) {
                    return path.clone();
                }
            }
            if let Some(path) = arg.strip_prefix("--config=") {
                return path.to_string();
            }
        }

        if let Ok(path) = env::var("CONFIG_FILE") {
            return path;
        }

        "config/dev.toml".to_string()
    }

    /// Load configuration from a TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;

        let toml_config: TomlConfig = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file {}", path.display()))?;

        Self::from_toml(toml_config, path.display().to_string())
            .with_context(|| format!("Invalid config file {}", path.display()))
    }

    /// Parse configuration from TOML text
    pub fn from_toml_str(content: &str) -> anyhow::Result<Self> {
        let toml_config: TomlConfig = toml::from_str(content).context("Failed to parse config")?;
        Ok(Self::from_toml(toml_config, "inline".to_string())?)
    }

    fn from_toml(toml_config: TomlConfig, config_file: String) -> Result<Self, ConfigError> {
        let local_plates = Self::validate_local_plates(&toml_config.authorization.local_plates)?;

        if toml_config.timing.tick_ms == 0 {
            return Err(ConfigError::ZeroValue("timing.tick_ms"));
        }
        if toml_config.link.heartbeat_interval_ms == 0 {
            return Err(ConfigError::ZeroValue("link.heartbeat_interval_ms"));
        }
        if toml_config.link.missed_heartbeats == 0 {
            return Err(ConfigError::ZeroValue("link.missed_heartbeats"));
        }

        Ok(Self {
            config_file,
            site_id: toml_config.site.id,
            sensor: toml_config.sensor,
            gate: toml_config.gate,
            timing: toml_config.timing,
            link: toml_config.link,
            serial: toml_config.serial,
            vision: toml_config.vision,
            firebase: toml_config.firebase,
            ocr: toml_config.ocr,
            alerts: toml_config.alerts,
            local_plates,
            min_confidence: toml_config.authorization.min_confidence,
            debug_enabled: toml_config.debug.enabled,
            debug_interval_ms: toml_config.debug.interval_ms,
        })
    }

    /// Normalize entries and enforce the non-empty invariant
    fn validate_local_plates(raw: &[String]) -> Result<Vec<String>, ConfigError> {
        let mut plates = Vec::with_capacity(raw.len());
        for entry in raw {
            let plate = normalize_plate(entry);
            if plate.is_empty() || !plate.chars().all(|c| c.is_ascii_alphanumeric()) {
                return Err(ConfigError::InvalidLocalPlate(entry.clone()));
            }
            if !plates.contains(&plate) {
                plates.push(plate);
            }
        }
        if plates.is_empty() {
            return Err(ConfigError::EmptyLocalPlates);
        }
        Ok(plates)
    }

    /// Load configuration - tries TOML file first, falls back to defaults
    /// only when the file does not exist
    pub fn load(args: &[String]) -> anyhow::Result<Self> {
        Self::load_from_path(&Self::resolve_config_path(args))
    }

    /// Load configuration from an explicit path. A missing file yields the
    /// defaults; an unreadable, malformed or invalid file is an error.
    pub fn load_from_path(path: &str) -> anyhow::Result<Self> {
        match Self::from_file(path) {
            Ok(config) => Ok(config),
            Err(e) if is_not_found(&e) => {
                eprintln!("Warning: {:#}. Using defaults.", e);
                Ok(Self::default())
            }
            Err(e) => Err(e),
        }
    }

    /// Open duration for a granting category
    pub fn open_duration(&self, category: AuthCategory) -> Option<Duration> {
        let ms = match category {
            AuthCategory::Resident => self.gate.resident_open_ms,
            AuthCategory::Temporary => self.gate.temporary_open_ms,
            AuthCategory::Emergency => self.gate.emergency_open_ms,
            AuthCategory::Denied | AuthCategory::Error => return None,
        };
        Some(Duration::from_millis(ms))
    }

    pub fn config_file(&self) -> &str {
        &self.config_file
    }

    pub fn site_id(&self) -> &str {
        &self.site_id
    }

    pub fn detection_cm(&self) -> f32 {
        self.sensor.detection_cm
    }

    pub fn min_cm(&self) -> f32 {
        self.sensor.min_cm
    }

    pub fn max_cm(&self) -> f32 {
        self.sensor.max_cm
    }

    pub fn echo_timeout(&self) -> Duration {
        Duration::from_millis(self.sensor.echo_timeout_ms)
    }

    pub fn sensor_fault_threshold(&self) -> u32 {
        self.sensor.fault_threshold
    }

    pub fn closed_angle(&self) -> u8 {
        self.gate.closed_angle
    }

    pub fn open_angle(&self) -> u8 {
        self.gate.open_angle
    }

    pub fn servo_travel_timeout(&self) -> Duration {
        Duration::from_millis(self.gate.travel_timeout_ms)
    }

    pub fn process_timeout(&self) -> Duration {
        Duration::from_millis(self.timing.process_timeout_ms)
    }

    pub fn cooldown(&self) -> Duration {
        Duration::from_millis(self.timing.cooldown_ms)
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.timing.tick_ms)
    }

    pub fn capture_timeout(&self) -> Duration {
        Duration::from_millis(self.timing.capture_timeout_ms)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.link.heartbeat_interval_ms)
    }

    pub fn missed_heartbeats(&self) -> u32 {
        self.link.missed_heartbeats
    }

    pub fn ack_timeout(&self) -> Duration {
        Duration::from_millis(self.link.ack_timeout_ms)
    }

    pub fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.link.retry_backoff_ms)
    }

    pub fn link_max_retries(&self) -> u32 {
        self.link.max_retries
    }

    pub fn serial_device(&self) -> &str {
        &self.serial.device
    }

    pub fn serial_baud(&self) -> u32 {
        self.serial.baud
    }

    pub fn camera_url(&self) -> &str {
        &self.vision.camera_url
    }

    pub fn ocr_enabled(&self) -> bool {
        self.vision.ocr_enabled
    }

    pub fn simulated_plate(&self) -> &str {
        &self.vision.simulated_plate
    }

    pub fn firebase_host(&self) -> &str {
        &self.firebase.host
    }

    pub fn firebase_auth(&self) -> Option<&str> {
        self.firebase.auth.as_deref()
    }

    pub fn remote_timeout(&self) -> Duration {
        Duration::from_millis(self.firebase.timeout_ms)
    }

    pub fn ocr_api_url(&self) -> &str {
        &self.ocr.api_url
    }

    pub fn ocr_api_key(&self) -> Option<&str> {
        self.ocr.api_key.as_deref()
    }

    pub fn twilio_account_sid(&self) -> Option<&str> {
        self.alerts.twilio_account_sid.as_deref()
    }

    pub fn twilio_auth_token(&self) -> Option<&str> {
        self.alerts.twilio_auth_token.as_deref()
    }

    pub fn phone_from(&self) -> Option<&str> {
        self.alerts.phone_from.as_deref()
    }

    pub fn phone_security(&self) -> Option<&str> {
        self.alerts.phone_security.as_deref()
    }

    pub fn sms_timeout(&self) -> Duration {
        Duration::from_millis(self.alerts.timeout_ms)
    }

    pub fn sms_max_attempts(&self) -> u32 {
        self.alerts.max_attempts
    }

    pub fn alert_queue_size(&self) -> usize {
        self.alerts.queue_size.max(1)
    }

    pub fn local_plates(&self) -> &[String] {
        &self.local_plates
    }

    pub fn min_confidence(&self) -> f32 {
        self.min_confidence
    }

    pub fn debug_enabled(&self) -> bool {
        self.debug_enabled
    }

    pub fn debug_interval(&self) -> Duration {
        Duration::from_millis(self.debug_interval_ms)
    }

    /// Builder method for tests to disable the debug emitter
    #[cfg(test)]
    pub fn with_debug_enabled(mut self, enabled: bool) -> Self {
        self.debug_enabled = enabled;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.detection_cm(), 30.0);
        assert_eq!(config.min_cm(), 5.0);
        assert_eq!(config.process_timeout(), Duration::from_millis(20000));
        assert_eq!(config.cooldown(), Duration::from_millis(5000));
        assert_eq!(config.closed_angle(), 0);
        assert_eq!(config.open_angle(), 90);
        assert_eq!(config.remote_timeout(), Duration::from_millis(10000));
        assert_eq!(config.sms_timeout(), Duration::from_millis(15000));
        assert_eq!(config.link_max_retries(), 3);
        assert_eq!(config.local_plates(), &["ABC123", "DEF456", "GHI789", "JKL012"]);
    }

    #[test]
    fn test_open_duration_by_category() {
        let config = Config::default();
        assert_eq!(config.open_duration(AuthCategory::Resident), Some(Duration::from_millis(7000)));
        assert_eq!(config.open_duration(AuthCategory::Temporary), Some(Duration::from_millis(6000)));
        assert_eq!(config.open_duration(AuthCategory::Emergency), Some(Duration::from_millis(5000)));
        assert_eq!(config.open_duration(AuthCategory::Denied), None);
        assert_eq!(config.open_duration(AuthCategory::Error), None);
    }

    #[test]
    fn test_local_plates_are_normalized() {
        let plates = Config::validate_local_plates(&[
            " abc123".to_string(),
            "ABC 123".to_string(),
            "xyz9".to_string(),
        ])
        .unwrap();
        assert_eq!(plates, vec!["ABC123".to_string(), "XYZ9".to_string()]);
    }

    #[test]
    fn test_empty_local_plates_rejected() {
        let err = Config::from_toml_str("[authorization]\nlocal_plates = []\n").unwrap_err();
        assert!(format!("{:#}", err).contains("empty"));
    }

    #[test]
    fn test_punctuated_local_plate_rejected() {
        let result = Config::validate_local_plates(&["AB-123".to_string()]);
        assert!(matches!(result, Err(ConfigError::InvalidLocalPlate(_))));
    }

    #[test]
    fn test_resolve_config_path_default() {
        let args: Vec<String> = vec!["gate-node".to_string()];
        if env::var("CONFIG_FILE").is_err() {
            assert_eq!(Config::resolve_config_path(&args), "config/dev.toml");
        }
    }

    #[test]
    fn test_resolve_config_path_from_arg() {
        let args: Vec<String> =
            vec!["gate-node".to_string(), "--config".to_string(), "config/site.toml".to_string()];
        assert_eq!(Config::resolve_config_path(&args), "config/site.toml");
    }

    #[test]
    fn test_resolve_config_path_from_arg_equals() {
        let args: Vec<String> =
            vec!["gate-node".to_string(), "--config=config/bench.toml".to_string()];
        assert_eq!(Config::resolve_config_path(&args), "config/bench.toml");
    }
}
