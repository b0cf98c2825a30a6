//! Camera snapshot source

use crate::domain::types::CaptureFailure;
use async_trait::async_trait;
use std::time::Duration;
use tracing::warn;

#[async_trait]
pub trait Camera: Send + Sync {
    /// Grab one JPEG frame
    async fn snapshot(&self) -> Result<Vec<u8>, CaptureFailure>;
}

/// ESP32-CAM style camera serving a JPEG at a fixed URL
pub struct HttpCamera {
    client: reqwest::Client,
    url: String,
}

impl HttpCamera {
    pub fn new(url: &str, timeout: Duration) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self { client, url: url.to_string() })
    }
}

#[async_trait]
impl Camera for HttpCamera {
    async fn snapshot(&self) -> Result<Vec<u8>, CaptureFailure> {
        let response = self.client.get(&self.url).send().await.map_err(|e| {
            warn!(url = %self.url, error = %e, "camera_request_failed");
            CaptureFailure::CameraFault
        })?;

        if !response.status().is_success() {
            warn!(url = %self.url, status = %response.status().as_u16(), "camera_bad_status");
            return Err(CaptureFailure::CameraFault);
        }

        let bytes = response.bytes().await.map_err(|e| {
            warn!(url = %self.url, error = %e, "camera_read_failed");
            CaptureFailure::CameraFault
        })?;

        if bytes.is_empty() {
            return Err(CaptureFailure::CameraFault);
        }
        Ok(bytes.to_vec())
    }
}

/// Camera that always returns the same frame, or always fails
pub struct StaticCamera {
    frame: Option<Vec<u8>>,
}

impl StaticCamera {
    pub fn new(frame: Vec<u8>) -> Self {
        Self { frame: Some(frame) }
    }

    pub fn broken() -> Self {
        Self { frame: None }
    }
}

#[async_trait]
impl Camera for StaticCamera {
    async fn snapshot(&self) -> Result<Vec<u8>, CaptureFailure> {
        self.frame.clone().ok_or(CaptureFailure::CameraFault)
    }
}
