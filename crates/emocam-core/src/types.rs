use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

/// The closed set of categories produced by the classifier (FER-2013 order).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Emotion {
    Angry,
    Disgust,
    Fear,
    Happy,
    Sad,
    Surprise,
    Neutral,
}

impl Emotion {
    pub const ALL: [Emotion; 7] = [
        Emotion::Angry,
        Emotion::Disgust,
        Emotion::Fear,
        Emotion::Happy,
        Emotion::Sad,
        Emotion::Surprise,
        Emotion::Neutral,
    ];

    /// Wire name used by the classifier service.
    pub fn name(self) -> &'static str {
        match self {
            Emotion::Angry => "angry",
            Emotion::Disgust => "disgust",
            Emotion::Fear => "fear",
            Emotion::Happy => "happy",
            Emotion::Sad => "sad",
            Emotion::Surprise => "surprise",
            Emotion::Neutral => "neutral",
        }
    }

    /// Capitalized display label.
    pub fn label(self) -> &'static str {
        match self {
            Emotion::Angry => "Angry",
            Emotion::Disgust => "Disgust",
            Emotion::Fear => "Fear",
            Emotion::Happy => "Happy",
            Emotion::Sad => "Sad",
            Emotion::Surprise => "Surprise",
            Emotion::Neutral => "Neutral",
        }
    }
}

impl fmt::Display for Emotion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown emotion label: {0}")]
pub struct UnknownEmotion(pub String);

impl FromStr for Emotion {
    type Err = UnknownEmotion;

    /// Case-insensitive; the service reports lowercase names but its class
    /// list on `/health` is capitalized.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let needle = s.trim();
        Emotion::ALL
            .into_iter()
            .find(|e| e.name().eq_ignore_ascii_case(needle))
            .ok_or_else(|| UnknownEmotion(s.to_string()))
    }
}

/// The most recently accepted classification result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmotionReading {
    pub emotion: Emotion,
    /// Confidence of the top class in [0, 1].
    pub confidence: f32,
    /// Per-class probabilities. Need not sum to exactly 1.
    pub distribution: BTreeMap<Emotion, f32>,
}

impl EmotionReading {
    pub fn confidence_percent(&self) -> u8 {
        to_percent(self.confidence)
    }

    /// Probability for one class; classes the service omitted read as 0.
    pub fn probability(&self, emotion: Emotion) -> f32 {
        self.distribution.get(&emotion).copied().unwrap_or(0.0)
    }
}

/// One point on the trend timeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub timestamp: DateTime<Utc>,
    pub emotion: Emotion,
    pub confidence: f32,
}

impl HistoryEntry {
    pub fn confidence_percent(&self) -> u8 {
        to_percent(self.confidence)
    }
}

/// Reachability of the remote classifier.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Connectivity {
    #[default]
    Unknown,
    Connected,
    Disconnected,
}

/// Camera session lifecycle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionState {
    #[default]
    Idle,
    Requesting,
    Active,
    Stopped,
}

impl SessionState {
    pub fn is_running(self) -> bool {
        matches!(self, SessionState::Requesting | SessionState::Active)
    }
}

/// Map a [0, 1] score to a whole percentage, clamping out-of-range input.
pub fn to_percent(value: f32) -> u8 {
    if !value.is_finite() {
        return 0;
    }
    (value.clamp(0.0, 1.0) * 100.0).round() as u8
}
