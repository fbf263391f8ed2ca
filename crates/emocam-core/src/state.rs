//! Display state for the capture-and-poll loop and its transitions.
//!
//! Every event the controller observes (start, camera grant or denial, feed
//! ready, stop, tick begin, tick result, connectivity probe) is a method on
//! [`LoopState`]. Methods never block and never perform I/O; the controller
//! owns the effects. Each mutation bumps [`LoopState::revision`] so callers
//! can tell whether a re-render is due.

use crate::history::History;
use crate::types::{Connectivity, EmotionReading, HistoryEntry, SessionState};
use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SessionError {
    #[error("session already active")]
    AlreadyActive,
}

/// Why a tick did not issue a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    NoSession,
    InFlight,
    Disconnected,
    ConnectivityUnknown,
}

/// Result of [`LoopState::try_begin_tick`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickDecision {
    /// Proceed; the request belongs to this session epoch.
    Go { epoch: u64 },
    Skip(SkipReason),
}

/// What one tick did to the display state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TickOutcome {
    Skipped(SkipReason),
    /// A reading was accepted and appended to history.
    Applied,
    /// Valid response without a face; last reading retained.
    NoFace,
    /// Request failed; state retained.
    Failed,
    /// Response arrived for a session that is no longer active.
    Discarded,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct TickStats {
    pub requests_sent: u64,
    pub ticks_skipped: u64,
    pub failures: u64,
    pub no_face: u64,
    pub discarded: u64,
}

/// Everything a renderer needs, detached from the live state.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Snapshot {
    pub revision: u64,
    pub session: SessionState,
    pub epoch: u64,
    pub connectivity: Connectivity,
    pub video_ready: bool,
    pub in_flight: bool,
    pub reading: Option<EmotionReading>,
    pub history: Vec<HistoryEntry>,
    pub error: Option<String>,
    pub stats: TickStats,
}

#[derive(Debug, Clone)]
pub struct LoopState {
    session: SessionState,
    epoch: u64,
    connectivity: Connectivity,
    video_ready: bool,
    in_flight: bool,
    reading: Option<EmotionReading>,
    history: History,
    error: Option<String>,
    stats: TickStats,
    revision: u64,
}

impl LoopState {
    pub fn new(history_capacity: usize) -> Self {
        Self {
            session: SessionState::Idle,
            epoch: 0,
            connectivity: Connectivity::Unknown,
            video_ready: false,
            in_flight: false,
            reading: None,
            history: History::with_capacity(history_capacity),
            error: None,
            stats: TickStats::default(),
            revision: 0,
        }
    }

    pub fn session(&self) -> SessionState {
        self.session
    }

    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    pub fn connectivity(&self) -> Connectivity {
        self.connectivity
    }

    pub fn in_flight(&self) -> bool {
        self.in_flight
    }

    pub fn video_ready(&self) -> bool {
        self.video_ready
    }

    pub fn reading(&self) -> Option<&EmotionReading> {
        self.reading.as_ref()
    }

    pub fn history(&self) -> &History {
        &self.history
    }

    pub fn error(&self) -> Option<&str> {
        self.error.as_deref()
    }

    pub fn stats(&self) -> TickStats {
        self.stats
    }

    pub fn revision(&self) -> u64 {
        self.revision
    }

    fn touch(&mut self) {
        self.revision += 1;
    }

    /// User start action: move to `Requesting` while the camera is opened.
    pub fn begin_request(&mut self) -> Result<(), SessionError> {
        if self.session.is_running() {
            return Err(SessionError::AlreadyActive);
        }
        self.session = SessionState::Requesting;
        self.error = None;
        self.video_ready = false;
        self.touch();
        Ok(())
    }

    /// Camera opened. Returns the new session epoch, or `None` if the request
    /// was abandoned (stopped) while the device was being opened.
    pub fn camera_granted(&mut self) -> Option<u64> {
        if self.session != SessionState::Requesting {
            return None;
        }
        self.session = SessionState::Active;
        self.epoch += 1;
        self.touch();
        Some(self.epoch)
    }

    /// Camera refused or missing. Back to `Idle` with a user-visible error.
    pub fn camera_denied(&mut self, message: impl Into<String>) {
        if self.session != SessionState::Requesting {
            return;
        }
        self.session = SessionState::Idle;
        self.error = Some(message.into());
        self.touch();
    }

    /// First frame of `epoch` decoded. Ignored for stale epochs.
    pub fn mark_video_ready(&mut self, epoch: u64) -> bool {
        if self.session != SessionState::Active || self.epoch != epoch || self.video_ready {
            return false;
        }
        self.video_ready = true;
        self.touch();
        true
    }

    /// Returns `false` when there was nothing to stop.
    ///
    /// The in-flight flag is left alone: an outstanding request still counts
    /// against the one-request limit until it settles.
    pub fn stop(&mut self) -> bool {
        if !self.session.is_running() {
            return false;
        }
        self.session = SessionState::Stopped;
        self.video_ready = false;
        self.touch();
        true
    }

    pub fn set_connectivity(&mut self, connectivity: Connectivity) {
        if self.connectivity != connectivity {
            self.connectivity = connectivity;
            self.touch();
        }
    }

    /// Gate for one sampling tick. On `Go` the in-flight flag is raised and
    /// must be cleared by exactly one of the `tick_*` settle methods.
    pub fn try_begin_tick(&mut self) -> TickDecision {
        let skip = if self.in_flight {
            Some(SkipReason::InFlight)
        } else if self.session != SessionState::Active {
            Some(SkipReason::NoSession)
        } else {
            match self.connectivity {
                Connectivity::Connected => None,
                Connectivity::Disconnected => Some(SkipReason::Disconnected),
                Connectivity::Unknown => Some(SkipReason::ConnectivityUnknown),
            }
        };

        if let Some(reason) = skip {
            self.stats.ticks_skipped += 1;
            return TickDecision::Skip(reason);
        }

        self.in_flight = true;
        self.stats.requests_sent += 1;
        self.touch();
        TickDecision::Go { epoch: self.epoch }
    }

    /// Clear the in-flight flag; true when the result may still be applied.
    fn settle(&mut self, epoch: u64) -> bool {
        self.in_flight = false;
        self.touch();
        let current = self.session == SessionState::Active && self.epoch == epoch;
        if !current {
            self.stats.discarded += 1;
        }
        current
    }

    pub fn tick_succeeded(
        &mut self,
        epoch: u64,
        reading: EmotionReading,
        at: DateTime<Utc>,
    ) -> TickOutcome {
        if !self.settle(epoch) {
            return TickOutcome::Discarded;
        }
        self.history.push(HistoryEntry {
            timestamp: at,
            emotion: reading.emotion,
            confidence: reading.confidence,
        });
        self.reading = Some(reading);
        TickOutcome::Applied
    }

    pub fn tick_no_face(&mut self, epoch: u64) -> TickOutcome {
        if !self.settle(epoch) {
            return TickOutcome::Discarded;
        }
        self.stats.no_face += 1;
        TickOutcome::NoFace
    }

    pub fn tick_failed(&mut self, epoch: u64) -> TickOutcome {
        if !self.settle(epoch) {
            return TickOutcome::Discarded;
        }
        self.stats.failures += 1;
        TickOutcome::Failed
    }

    pub fn snapshot(&self) -> Snapshot {
        Snapshot {
            revision: self.revision,
            session: self.session,
            epoch: self.epoch,
            connectivity: self.connectivity,
            video_ready: self.video_ready,
            in_flight: self.in_flight,
            reading: self.reading.clone(),
            history: self.history.to_vec(),
            error: self.error.clone(),
            stats: self.stats,
        }
    }
}

impl Default for LoopState {
    fn default() -> Self {
        Self::new(crate::history::DEFAULT_HISTORY_CAPACITY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Emotion;
    use std::collections::BTreeMap;

    fn reading(emotion: Emotion, confidence: f32) -> EmotionReading {
        let mut distribution = BTreeMap::new();
        distribution.insert(emotion, confidence);
        EmotionReading {
            emotion,
            confidence,
            distribution,
        }
    }

    fn active_connected() -> (LoopState, u64) {
        let mut state = LoopState::default();
        state.set_connectivity(Connectivity::Connected);
        state.begin_request().unwrap();
        let epoch = state.camera_granted().unwrap();
        (state, epoch)
    }

    fn go(state: &mut LoopState) -> u64 {
        match state.try_begin_tick() {
            TickDecision::Go { epoch } => epoch,
            TickDecision::Skip(reason) => panic!("tick skipped: {reason:?}"),
        }
    }

    #[test]
    fn test_start_lifecycle() {
        let mut state = LoopState::default();
        assert_eq!(state.session(), SessionState::Idle);
        state.begin_request().unwrap();
        assert_eq!(state.session(), SessionState::Requesting);
        assert_eq!(state.begin_request(), Err(SessionError::AlreadyActive));
        assert_eq!(state.camera_granted(), Some(1));
        assert_eq!(state.session(), SessionState::Active);
        assert!(state.mark_video_ready(1));
        assert!(state.video_ready());
    }

    #[test]
    fn test_camera_denied_returns_to_idle_with_error() {
        let mut state = LoopState::default();
        state.begin_request().unwrap();
        state.camera_denied("permission denied");
        assert_eq!(state.session(), SessionState::Idle);
        assert_eq!(state.error(), Some("permission denied"));

        state.begin_request().unwrap();
        assert!(state.error().is_none());
    }

    #[test]
    fn test_stop_is_idempotent() {
        let (mut state, _) = active_connected();
        assert!(state.stop());
        let rev = state.revision();
        assert!(!state.stop());
        assert_eq!(state.revision(), rev);
        assert_eq!(state.session(), SessionState::Stopped);
    }

    #[test]
    fn test_stop_on_idle_is_noop() {
        let mut state = LoopState::default();
        assert!(!state.stop());
        assert_eq!(state.session(), SessionState::Idle);
        assert_eq!(state.revision(), 0);
    }

    #[test]
    fn test_grant_after_stop_is_abandoned() {
        let mut state = LoopState::default();
        state.begin_request().unwrap();
        state.stop();
        assert_eq!(state.camera_granted(), None);
        assert_eq!(state.session(), SessionState::Stopped);
    }

    #[test]
    fn test_tick_gates() {
        let mut state = LoopState::default();
        assert_eq!(
            state.try_begin_tick(),
            TickDecision::Skip(SkipReason::NoSession)
        );

        state.begin_request().unwrap();
        state.camera_granted();
        assert_eq!(
            state.try_begin_tick(),
            TickDecision::Skip(SkipReason::ConnectivityUnknown)
        );

        state.set_connectivity(Connectivity::Disconnected);
        assert_eq!(
            state.try_begin_tick(),
            TickDecision::Skip(SkipReason::Disconnected)
        );

        state.set_connectivity(Connectivity::Connected);
        let epoch = go(&mut state);
        assert!(state.in_flight());
        assert_eq!(
            state.try_begin_tick(),
            TickDecision::Skip(SkipReason::InFlight)
        );
        state.tick_failed(epoch);
        assert!(!state.in_flight());
        assert_eq!(state.stats().ticks_skipped, 4);
        assert_eq!(state.stats().requests_sent, 1);
    }

    #[test]
    fn test_success_updates_reading_and_history() {
        let (mut state, _) = active_connected();
        let epoch = go(&mut state);
        let outcome = state.tick_succeeded(epoch, reading(Emotion::Happy, 0.91), Utc::now());
        assert_eq!(outcome, TickOutcome::Applied);
        let current = state.reading().unwrap();
        assert_eq!(current.emotion.label(), "Happy");
        assert_eq!(current.confidence_percent(), 91);
        assert_eq!(state.history().len(), 1);
    }

    #[test]
    fn test_no_face_keeps_last_reading() {
        let (mut state, _) = active_connected();
        let epoch = go(&mut state);
        state.tick_succeeded(epoch, reading(Emotion::Sad, 0.7), Utc::now());

        let epoch = go(&mut state);
        assert_eq!(state.tick_no_face(epoch), TickOutcome::NoFace);
        assert_eq!(state.reading().unwrap().emotion, Emotion::Sad);
        assert_eq!(state.reading().unwrap().confidence_percent(), 70);
        assert_eq!(state.history().len(), 1);
        assert!(!state.in_flight());
    }

    #[test]
    fn test_failure_keeps_state() {
        let (mut state, _) = active_connected();
        let epoch = go(&mut state);
        state.tick_succeeded(epoch, reading(Emotion::Fear, 0.6), Utc::now());
        let before = state.reading().cloned();

        let epoch = go(&mut state);
        assert_eq!(state.tick_failed(epoch), TickOutcome::Failed);
        assert_eq!(state.reading().cloned(), before);
        assert_eq!(state.history().len(), 1);
        assert_eq!(state.stats().failures, 1);
    }

    #[test]
    fn test_late_response_after_stop_is_discarded() {
        let (mut state, _) = active_connected();
        let epoch = go(&mut state);
        state.stop();
        assert!(state.in_flight());

        let outcome = state.tick_succeeded(epoch, reading(Emotion::Angry, 0.9), Utc::now());
        assert_eq!(outcome, TickOutcome::Discarded);
        assert!(state.reading().is_none());
        assert!(state.history().is_empty());
        assert!(!state.in_flight());
        assert_eq!(state.stats().discarded, 1);
    }

    #[test]
    fn test_response_from_previous_epoch_is_discarded() {
        let (mut state, first) = active_connected();
        let stale = go(&mut state);
        state.stop();
        state.begin_request().unwrap();
        let second = state.camera_granted().unwrap();
        assert_eq!(second, first + 1);

        // The old request still holds the slot until it settles.
        assert_eq!(
            state.try_begin_tick(),
            TickDecision::Skip(SkipReason::InFlight)
        );
        let outcome = state.tick_succeeded(stale, reading(Emotion::Happy, 0.5), Utc::now());
        assert_eq!(outcome, TickOutcome::Discarded);
        assert!(state.reading().is_none());
        assert_eq!(go(&mut state), second);
    }

    #[test]
    fn test_history_keeps_last_ten() {
        let (mut state, _) = active_connected();
        for i in 0..15 {
            let epoch = go(&mut state);
            let confidence = i as f32 / 100.0;
            state.tick_succeeded(epoch, reading(Emotion::Neutral, confidence), Utc::now());
        }
        let confidences: Vec<u8> = state
            .history()
            .iter()
            .map(|e| e.confidence_percent())
            .collect();
        assert_eq!(confidences, (5..15).collect::<Vec<u8>>());
    }

    #[test]
    fn test_connectivity_change_bumps_revision_once() {
        let mut state = LoopState::default();
        state.set_connectivity(Connectivity::Connected);
        let rev = state.revision();
        state.set_connectivity(Connectivity::Connected);
        assert_eq!(state.revision(), rev);
    }

    #[test]
    fn test_video_ready_ignores_stale_epoch() {
        let (mut state, epoch) = active_connected();
        assert!(!state.mark_video_ready(epoch + 1));
        assert!(state.mark_video_ready(epoch));
        assert!(!state.mark_video_ready(epoch));
    }

    #[test]
    fn test_snapshot_serializes() {
        let (mut state, _) = active_connected();
        let epoch = go(&mut state);
        state.tick_succeeded(epoch, reading(Emotion::Happy, 0.91), Utc::now());
        let json = serde_json::to_value(state.snapshot()).unwrap();
        assert_eq!(json["session"], "active");
        assert_eq!(json["connectivity"], "connected");
        assert_eq!(json["reading"]["emotion"], "happy");
        assert_eq!(json["history"].as_array().unwrap().len(), 1);
    }
}
