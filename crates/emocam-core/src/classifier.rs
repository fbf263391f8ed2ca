//! Client for the remote emotion classifier service.
//!
//! Two endpoints: `GET /health` (liveness, any 2xx is connected) and
//! `POST /predict_emotion_stream` with `{ "frame": <JPEG data URL> }`.

use crate::types::{Emotion, EmotionReading};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::time::Duration;
use thiserror::Error;

pub const HEALTH_PATH: &str = "/health";
pub const PREDICT_STREAM_PATH: &str = "/predict_emotion_stream";
pub const DEFAULT_BACKEND_URL: &str = "http://localhost:5000";

#[derive(Error, Debug)]
pub enum ClassifierError {
    #[error("transport error: {0}")]
    Transport(String),
    #[error("HTTP {code}: {body}")]
    Status { code: u16, body: String },
    #[error("classifier rejected frame: {0}")]
    Rejected(String),
    #[error("malformed response: {0}")]
    Malformed(String),
}

/// Body of `GET /health`. Every field is optional; only the status code
/// decides reachability.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HealthReport {
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub model_loaded: Option<bool>,
    #[serde(default)]
    pub face_cascade_loaded: Option<bool>,
    #[serde(default)]
    pub model_type: Option<String>,
    #[serde(default)]
    pub emotion_classes: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct PredictRequest<'a> {
    pub frame: &'a str,
}

/// Raw body of `POST /predict_emotion_stream`. Error bodies only carry
/// `error`, so everything defaults.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct PredictResponse {
    #[serde(default)]
    pub success: bool,
    #[serde(default)]
    pub faces_detected: u32,
    #[serde(default)]
    pub emotion: Option<String>,
    #[serde(default)]
    pub confidence: Option<f32>,
    #[serde(default)]
    pub emotion_distribution: HashMap<String, f32>,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub message: Option<String>,
}

/// Outcome of a successful classification round-trip.
#[derive(Debug, Clone, PartialEq)]
pub enum ClassifyOutcome {
    Face(EmotionReading),
    NoFace,
}

/// Remote classifier seam. Implementations block; callers on an async
/// runtime run them on the blocking pool.
pub trait Classifier: Send + Sync {
    fn health(&self) -> Result<HealthReport, ClassifierError>;
    fn classify(&self, frame_data_url: &str) -> Result<ClassifyOutcome, ClassifierError>;
}

/// Turn a decoded response body into an outcome.
pub fn interpret(response: PredictResponse) -> Result<ClassifyOutcome, ClassifierError> {
    if !response.success {
        let reason = response
            .error
            .or(response.message)
            .unwrap_or_else(|| "success=false".to_string());
        return Err(ClassifierError::Rejected(reason));
    }

    if response.faces_detected == 0 {
        return Ok(ClassifyOutcome::NoFace);
    }

    let label = response
        .emotion
        .ok_or_else(|| ClassifierError::Malformed("missing emotion".into()))?;
    let emotion = label.parse::<Emotion>().unwrap_or_else(|e| {
        tracing::warn!(error = %e, "unrecognized emotion label; falling back to neutral");
        Emotion::Neutral
    });

    let confidence = response
        .confidence
        .ok_or_else(|| ClassifierError::Malformed("missing confidence".into()))?;
    if !confidence.is_finite() {
        return Err(ClassifierError::Malformed(format!(
            "non-finite confidence: {confidence}"
        )));
    }

    let mut distribution = BTreeMap::new();
    for (name, probability) in response.emotion_distribution {
        match name.parse::<Emotion>() {
            Ok(class) if probability.is_finite() => {
                distribution.insert(class, probability.clamp(0.0, 1.0));
            }
            _ => tracing::debug!(class = %name, probability, "ignoring distribution entry"),
        }
    }

    Ok(ClassifyOutcome::Face(EmotionReading {
        emotion,
        confidence: confidence.clamp(0.0, 1.0),
        distribution,
    }))
}

/// Blocking HTTP client for the classifier service.
pub struct HttpClassifier {
    agent: ureq::Agent,
    base_url: String,
}

impl HttpClassifier {
    pub fn new(base_url: &str, timeout: Duration) -> Self {
        let agent = ureq::AgentBuilder::new().timeout(timeout).build();
        Self {
            agent,
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.base_url)
    }
}

fn map_ureq_error(err: ureq::Error) -> ClassifierError {
    match err {
        ureq::Error::Status(code, response) => ClassifierError::Status {
            code,
            body: response.into_string().unwrap_or_default(),
        },
        ureq::Error::Transport(transport) => ClassifierError::Transport(transport.to_string()),
    }
}

impl Classifier for HttpClassifier {
    fn health(&self) -> Result<HealthReport, ClassifierError> {
        let response = self
            .agent
            .get(&self.url(HEALTH_PATH))
            .call()
            .map_err(map_ureq_error)?;

        // Reachability is decided; a body we cannot read is not a failure.
        Ok(response.into_json::<HealthReport>().unwrap_or_else(|e| {
            tracing::debug!(error = %e, "health body not understood");
            HealthReport::default()
        }))
    }

    fn classify(&self, frame_data_url: &str) -> Result<ClassifyOutcome, ClassifierError> {
        let response = self
            .agent
            .post(&self.url(PREDICT_STREAM_PATH))
            .send_json(PredictRequest {
                frame: frame_data_url,
            })
            .map_err(map_ureq_error)?;

        let body: PredictResponse = response
            .into_json()
            .map_err(|e| ClassifierError::Malformed(e.to_string()))?;
        interpret(body)
    }
}
