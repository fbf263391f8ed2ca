//! emocam-core — Emotion types, capture-and-poll state, classifier client.
//!
//! The emotion model itself runs in a remote service; this crate only
//! describes its answers and the loop that asks for them.

pub mod classifier;
pub mod history;
pub mod state;
pub mod types;

pub use classifier::{Classifier, ClassifierError, ClassifyOutcome, HealthReport, HttpClassifier};
pub use history::History;
pub use state::{LoopState, SkipReason, Snapshot, TickDecision, TickOutcome};
pub use types::{Connectivity, Emotion, EmotionReading, HistoryEntry, SessionState};
