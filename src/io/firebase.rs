//! Remote authorization store (Firebase Realtime Database REST)
//!
//! Records live at `/residentes/{plate}`. A missing record reads as `null`.
//! Granted accesses are pushed to `/accesos`, everything else that carried a
//! plate to `/vehiculos_temporales`.

use crate::domain::error::StoreError;
use crate::domain::types::{AccessRecord, AuthCategory, RemoteLookup};
use crate::infra::config::Config;
use async_trait::async_trait;
use chrono::{Local, TimeZone};
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::time::Duration;
use tracing::{debug, warn};

#[async_trait]
pub trait RemoteStore: Send + Sync {
    /// Look up a normalized plate. Never errors: failures map to `Unavailable`.
    async fn lookup(&self, plate: &str) -> RemoteLookup;

    /// Append one entry to the access audit trail
    async fn record_access(&self, record: &AccessRecord) -> Result<(), StoreError>;
}

pub struct FirebaseStore {
    client: reqwest::Client,
    base_url: String,
    auth: Option<String>,
    timeout: Duration,
}

impl FirebaseStore {
    pub fn new(config: &Config) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder().timeout(config.remote_timeout()).build()?;
        Ok(Self {
            client,
            base_url: Self::base_url(config.firebase_host()),
            auth: config.firebase_auth().map(str::to_string),
            timeout: config.remote_timeout(),
        })
    }

    /// Accept either a bare host or a full URL
    fn base_url(host: &str) -> String {
        let host = host.trim_end_matches('/');
        if host.starts_with("http://") || host.starts_with("https://") {
            host.to_string()
        } else {
            format!("https://{host}")
        }
    }

    fn node_url(&self, path: &str) -> String {
        match self.auth {
            Some(ref secret) => format!("{}/{}.json?auth={}", self.base_url, path, secret),
            None => format!("{}/{}.json", self.base_url, path),
        }
    }

    fn record_url(&self, plate: &str) -> String {
        self.node_url(&format!("residentes/{plate}"))
    }

    fn access_log_url(&self, record: &AccessRecord) -> String {
        if record.is_granted() {
            self.node_url("accesos")
        } else {
            self.node_url("vehiculos_temporales")
        }
    }
}

/// Body pushed for an access log entry
fn access_entry(record: &AccessRecord) -> Value {
    let at = match i64::try_from(record.recorded_at_ms) {
        Ok(ms) => Local.timestamp_millis_opt(ms).single(),
        Err(_) => None,
    }
    .unwrap_or_else(Local::now);

    let mut entry = json!({
        "placa": record.plate,
        "timestamp": at.to_rfc3339(),
        "fecha": at.format("%Y-%m-%d %H:%M:%S").to_string(),
        "ubicacion": record.site_id,
        "fuente": record.source.as_str(),
        "procesado_por": "vision_node",
    });
    if record.is_granted() {
        entry["tipo"] = json!(record.category.as_str());
    } else {
        entry["tipo"] = json!("no_autorizado");
        entry["categoria"] = json!(record.category.as_str());
    }
    entry
}

#[async_trait]
impl RemoteStore for FirebaseStore {
    async fn lookup(&self, plate: &str) -> RemoteLookup {
        let request = self.client.get(self.record_url(plate)).send();
        let response = match tokio::time::timeout(self.timeout, request).await {
            Ok(Ok(response)) => response,
            Ok(Err(e)) => {
                warn!(plate = %plate, error = %e, "firebase_request_failed");
                return RemoteLookup::Unavailable;
            }
            Err(_) => {
                warn!(plate = %plate, timeout_ms = %self.timeout.as_millis(), "firebase_timeout");
                return RemoteLookup::Unavailable;
            }
        };

        if !response.status().is_success() {
            warn!(plate = %plate, status = %response.status().as_u16(), "firebase_bad_status");
            return RemoteLookup::Unavailable;
        }

        match response.json::<Value>().await {
            Ok(record) => {
                let lookup = classify_record(&record);
                debug!(plate = %plate, lookup = ?lookup, "firebase_lookup");
                lookup
            }
            Err(e) => {
                warn!(plate = %plate, error = %e, "firebase_bad_body");
                RemoteLookup::Unavailable
            }
        }
    }

    async fn record_access(&self, record: &AccessRecord) -> Result<(), StoreError> {
        let response = self
            .client
            .post(self.access_log_url(record))
            .json(&access_entry(record))
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(StoreError::Status(response.status().as_u16()));
        }
        debug!(plate = %record.plate, granted = record.is_granted(), "firebase_access_recorded");
        Ok(())
    }
}

/// Map a resident record to a lookup outcome
pub fn classify_record(record: &Value) -> RemoteLookup {
    let fields = match record {
        Value::Null => return RemoteLookup::NotFound,
        Value::Bool(false) => return RemoteLookup::Found { category: AuthCategory::Denied },
        Value::Object(fields) => fields,
        // Any other truthy value is a bare "present" marker
        _ => return RemoteLookup::Found { category: AuthCategory::Resident },
    };

    if fields.get("activo").and_then(Value::as_bool) == Some(false) {
        return RemoteLookup::Found { category: AuthCategory::Denied };
    }

    let kind = fields
        .get("tipo")
        .or_else(|| fields.get("categoria"))
        .and_then(Value::as_str)
        .map(str::to_ascii_lowercase);

    let category = match kind.as_deref() {
        Some("temporal") | Some("temporary") => AuthCategory::Temporary,
        Some("emergencia") | Some("emergency") => AuthCategory::Emergency,
        _ => AuthCategory::Resident,
    };
    RemoteLookup::Found { category }
}

/// Behaviour of a `MemoryStore` when asked
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreMode {
    Online,
    /// Answer `Unavailable` immediately
    Offline,
    /// Never answer
    Hang,
}

/// In-process store for the simulator and tests
pub struct MemoryStore {
    records: HashMap<String, AuthCategory>,
    mode: Mutex<StoreMode>,
    access_log: Mutex<Vec<AccessRecord>>,
}

impl MemoryStore {
    pub fn new<I, S>(records: I) -> Self
    where
        I: IntoIterator<Item = (S, AuthCategory)>,
        S: Into<String>,
    {
        Self {
            records: records.into_iter().map(|(p, c)| (p.into(), c)).collect(),
            mode: Mutex::new(StoreMode::Online),
            access_log: Mutex::new(Vec::new()),
        }
    }

    pub fn set_mode(&self, mode: StoreMode) {
        *self.mode.lock() = mode;
    }

    /// Entries recorded so far, oldest first
    pub fn access_log(&self) -> Vec<AccessRecord> {
        self.access_log.lock().clone()
    }
}

#[async_trait]
impl RemoteStore for MemoryStore {
    async fn lookup(&self, plate: &str) -> RemoteLookup {
        let mode = *self.mode.lock();
        match mode {
            StoreMode::Online => match self.records.get(plate) {
                Some(&category) => RemoteLookup::Found { category },
                None => RemoteLookup::NotFound,
            },
            StoreMode::Offline => RemoteLookup::Unavailable,
            StoreMode::Hang => std::future::pending().await,
        }
    }

    async fn record_access(&self, record: &AccessRecord) -> Result<(), StoreError> {
        let mode = *self.mode.lock();
        match mode {
            StoreMode::Online => {
                self.access_log.lock().push(record.clone());
                Ok(())
            }
            StoreMode::Offline => Err(StoreError::Unavailable),
            StoreMode::Hang => std::future::pending().await,
        }
    }
}
