//! Plate recognition: OCR.space client and plate extraction

use crate::domain::types::{epoch_ms, normalize_plate, CaptureFailure, CaptureResult};
use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine};
use parking_lot::Mutex;
use regex::Regex;
use serde::Deserialize;
use std::sync::LazyLock;
use std::time::Duration;
use tracing::{debug, warn};

/// Confidence reported for a full pattern match
const PATTERN_CONFIDENCE: f32 = 0.95;
/// Confidence reported for the alphanumeric-run fallback
const FALLBACK_CONFIDENCE: f32 = 0.6;

#[async_trait]
pub trait Recognizer: Send + Sync {
    async fn recognize(&self, image: &[u8]) -> Result<CaptureResult, CaptureFailure>;
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct OcrResponse {
    #[serde(default)]
    parsed_results: Vec<ParsedResult>,
    #[serde(default)]
    is_errored_on_processing: bool,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct ParsedResult {
    #[serde(default)]
    parsed_text: String,
}

pub struct OcrSpaceRecognizer {
    client: reqwest::Client,
    api_url: String,
    api_key: String,
}

impl OcrSpaceRecognizer {
    pub fn new(api_url: &str, api_key: &str, timeout: Duration) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self { client, api_url: api_url.to_string(), api_key: api_key.to_string() })
    }
}

#[async_trait]
impl Recognizer for OcrSpaceRecognizer {
    async fn recognize(&self, image: &[u8]) -> Result<CaptureResult, CaptureFailure> {
        let encoded = format!("data:image/jpeg;base64,{}", STANDARD.encode(image));
        let form = [
            ("apikey", self.api_key.as_str()),
            ("base64Image", encoded.as_str()),
            ("OCREngine", "2"),
            ("scale", "true"),
        ];

        let response = self.client.post(&self.api_url).form(&form).send().await.map_err(|e| {
            warn!(error = %e, "ocr_request_failed");
            CaptureFailure::ServiceUnavailable
        })?;

        if !response.status().is_success() {
            warn!(status = %response.status().as_u16(), "ocr_bad_status");
            return Err(CaptureFailure::ServiceUnavailable);
        }

        let body: OcrResponse = response.json().await.map_err(|e| {
            warn!(error = %e, "ocr_bad_body");
            CaptureFailure::ServiceUnavailable
        })?;

        if body.is_errored_on_processing {
            return Err(CaptureFailure::ServiceUnavailable);
        }

        let text: String =
            body.parsed_results.iter().map(|r| r.parsed_text.as_str()).collect::<Vec<_>>().join(" ");
        debug!(text = %text.trim(), "ocr_text");

        let (plate_text, confidence) = extract_plate(&text).ok_or(CaptureFailure::NoPlateFound)?;
        Ok(CaptureResult { plate_text, confidence, captured_at_ms: epoch_ms() })
    }
}

/// Recognizer that reads whatever plate it was last given
pub struct SimulatedRecognizer {
    plate: Mutex<String>,
}

impl SimulatedRecognizer {
    pub fn new(plate: &str) -> Self {
        Self { plate: Mutex::new(normalize_plate(plate)) }
    }

    /// Plate for the next reads; empty means "no plate in view"
    pub fn set_plate(&self, plate: &str) {
        *self.plate.lock() = normalize_plate(plate);
    }
}

#[async_trait]
impl Recognizer for SimulatedRecognizer {
    async fn recognize(&self, _image: &[u8]) -> Result<CaptureResult, CaptureFailure> {
        let plate = self.plate.lock().clone();
        if plate.is_empty() {
            return Err(CaptureFailure::NoPlateFound);
        }
        Ok(CaptureResult {
            plate_text: plate,
            confidence: 0.99,
            captured_at_ms: epoch_ms(),
        })
    }
}

/// Plate layouts in priority order: `AAA999`, then `AA9999`
static PLATE_PATTERNS: LazyLock<[Regex; 2]> = LazyLock::new(|| {
    [
        Regex::new(r"[A-Z]{3}[0-9]{3}").expect("invalid plate pattern"),
        Regex::new(r"[A-Z]{2}[0-9]{4}").expect("invalid plate pattern"),
    ]
});

static ALPHANUMERIC_RUN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[A-Z0-9]{6,8}").expect("invalid plate pattern"));

/// Find a plate in raw OCR text.
///
/// Tries `AAA999` then `AA9999` anywhere in the text; failing that, the first
/// six characters of the first alphanumeric run of 6 or more.
pub fn extract_plate(text: &str) -> Option<(String, f32)> {
    let upper = text.to_ascii_uppercase();

    if let Some(m) = PLATE_PATTERNS.iter().find_map(|re| re.find(&upper)) {
        return Some((m.as_str().to_string(), PATTERN_CONFIDENCE));
    }

    ALPHANUMERIC_RUN
        .find(&upper)
        .map(|m| (m.as_str()[..6].to_string(), FALLBACK_CONFIDENCE))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extract_standard_pattern() {
        assert_eq!(extract_plate("abc123"), Some(("ABC123".to_string(), PATTERN_CONFIDENCE)));
        assert_eq!(
            extract_plate("COLOMBIA\nXYZ 987\nDEF456 BOGOTA"),
            Some(("DEF456".to_string(), PATTERN_CONFIDENCE))
        );
    }

    #[test]
    fn test_extract_two_letter_pattern() {
        assert_eq!(extract_plate("AB1234"), Some(("AB1234".to_string(), PATTERN_CONFIDENCE)));
    }

    #[test]
    fn test_three_letter_pattern_preferred() {
        // "AB1234" appears first but AAA999 takes priority
        assert_eq!(
            extract_plate("AB1234 QRS789"),
            Some(("QRS789".to_string(), PATTERN_CONFIDENCE))
        );
    }

    #[test]
    fn test_extract_fallback_run() {
        assert_eq!(extract_plate("A1B2C3D4"), Some(("A1B2C3".to_string(), FALLBACK_CONFIDENCE)));
        assert_eq!(extract_plate("x 9A9A9A9A9A"), Some(("9A9A9A".to_string(), FALLBACK_CONFIDENCE)));
    }

    #[test]
    fn test_fallback_ignores_punctuated_runs() {
        // Separators break the run; "XY-1234567" has a 7-char digit run
        assert_eq!(extract_plate("XY-1234567"), Some(("123456".to_string(), FALLBACK_CONFIDENCE)));
        assert_eq!(extract_plate("AB-12-CD"), None);
    }

    #[test]
    fn test_extract_nothing() {
        assert_eq!(extract_plate(""), None);
        assert_eq!(extract_plate("AB 12"), None);
        assert_eq!(extract_plate("HELLO"), None);
    }

    #[tokio::test]
    async fn test_simulated_recognizer() {
        let recognizer = SimulatedRecognizer::new("abc 123");
        let result = recognizer.recognize(&[]).await.unwrap();
        assert_eq!(result.plate_text, "ABC123");
        assert!(result.confidence > 0.9);

        let blank = SimulatedRecognizer::new("");
        assert_eq!(blank.recognize(&[]).await, Err(CaptureFailure::NoPlateFound));
    }
}
