//! The capture-and-poll controller.
//!
//! Owns the camera for the lifetime of a session, fires a sampling tick every
//! period, and feeds classifier answers into [`LoopState`]. Blocking work
//! (device open, capture, JPEG encode, HTTP) runs on the blocking pool so the
//! runtime stays free while a request is outstanding.

use chrono::Utc;
use emocam_core::{
    Classifier, ClassifierError, ClassifyOutcome, Connectivity, LoopState, Snapshot,
    TickDecision, TickOutcome,
};
use emocam_hw::{CameraError, CameraOpener, CaptureRequest, FrameEncoder, FrameError, VideoSource};
use std::sync::{Arc, Weak};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Mutex;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Called with a fresh snapshot after every state change, under the state
/// lock. Must return quickly and must not call back into the controller.
pub type RenderFn = Arc<dyn Fn(&Snapshot) + Send + Sync>;

type SharedSource = Arc<Mutex<Box<dyn VideoSource>>>;

#[derive(Error, Debug)]
pub enum ControllerError {
    #[error("camera unavailable: {0}")]
    CameraUnavailable(#[from] CameraError),
    #[error("session already active")]
    AlreadyActive,
    #[error("session stopped while the camera was opening")]
    StartAbandoned,
}

/// Why a tick produced no reading. Never surfaced to the user.
#[derive(Error, Debug)]
pub enum TickError {
    #[error("capture: {0}")]
    Camera(#[from] CameraError),
    #[error("encode: {0}")]
    Frame(#[from] FrameError),
    #[error("classify: {0}")]
    Classifier(#[from] ClassifierError),
    #[error("tick worker failed: {0}")]
    Worker(String),
}

#[derive(Debug, Clone)]
pub struct LoopSettings {
    pub capture: CaptureRequest,
    pub sample_interval: Duration,
    pub jpeg_quality: u8,
    pub history_capacity: usize,
}

impl Default for LoopSettings {
    fn default() -> Self {
        Self {
            capture: CaptureRequest::default(),
            sample_interval: Duration::from_millis(2000),
            jpeg_quality: emocam_hw::frame::DEFAULT_JPEG_QUALITY,
            history_capacity: emocam_core::history::DEFAULT_HISTORY_CAPACITY,
        }
    }
}

struct Inner {
    state: Mutex<LoopState>,
    camera: Mutex<Option<SharedSource>>,
    encoder: Arc<Mutex<FrameEncoder>>,
    ticker: Mutex<Option<CancellationToken>>,
    opener: Arc<dyn CameraOpener>,
    classifier: Arc<dyn Classifier>,
    render: RenderFn,
    settings: LoopSettings,
}

impl Drop for Inner {
    fn drop(&mut self) {
        if let Some(token) = self.ticker.get_mut().take() {
            token.cancel();
        }
        if self.camera.get_mut().take().is_some() {
            tracing::info!("controller dropped; camera released");
        }
    }
}

/// Clone-safe handle to the capture-and-poll loop.
#[derive(Clone)]
pub struct Controller {
    inner: Arc<Inner>,
}

impl Controller {
    pub fn new(
        opener: Arc<dyn CameraOpener>,
        classifier: Arc<dyn Classifier>,
        settings: LoopSettings,
        render: RenderFn,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(LoopState::new(settings.history_capacity)),
                camera: Mutex::new(None),
                encoder: Arc::new(Mutex::new(FrameEncoder::new(settings.jpeg_quality))),
                ticker: Mutex::new(None),
                opener,
                classifier,
                render,
                settings,
            }),
        }
    }

    pub async fn snapshot(&self) -> Snapshot {
        self.inner.state.lock().await.snapshot()
    }

    /// Force a render of the current state.
    pub async fn render(&self) {
        let state = self.inner.state.lock().await;
        (self.inner.render)(&state.snapshot());
    }

    /// Apply one transition and render if it changed anything.
    async fn update<R>(&self, f: impl FnOnce(&mut LoopState) -> R) -> R {
        let mut state = self.inner.state.lock().await;
        let before = state.revision();
        let result = f(&mut state);
        if state.revision() != before {
            (self.inner.render)(&state.snapshot());
        }
        result
    }

    /// Probe `/health` and record the result. Never fails.
    pub async fn check_connectivity(&self) -> Connectivity {
        let classifier = Arc::clone(&self.inner.classifier);
        let probe = tokio::task::spawn_blocking(move || classifier.health()).await;

        let connectivity = match probe {
            Ok(Ok(report)) => {
                tracing::info!(
                    status = ?report.status,
                    model_loaded = ?report.model_loaded,
                    classes = report.emotion_classes.len(),
                    "classifier reachable"
                );
                Connectivity::Connected
            }
            Ok(Err(err)) => {
                tracing::warn!(error = %err, "classifier unreachable");
                Connectivity::Disconnected
            }
            Err(err) => {
                tracing::warn!(error = %err, "health probe task failed");
                Connectivity::Disconnected
            }
        };

        self.update(|s| s.set_connectivity(connectivity)).await;
        connectivity
    }

    /// Acquire the camera and begin sampling. Returns the session epoch.
    pub async fn start(&self) -> Result<u64, ControllerError> {
        self.update(|s| s.begin_request())
            .await
            .map_err(|_| ControllerError::AlreadyActive)?;

        let session_id = Uuid::new_v4();
        let request = self.inner.settings.capture.clone();
        tracing::info!(
            %session_id,
            device = %request.device,
            width = request.width,
            height = request.height,
            "requesting camera"
        );

        self.check_connectivity().await;

        let opener = Arc::clone(&self.inner.opener);
        let opened = tokio::task::spawn_blocking(move || opener.open(&request))
            .await
            .unwrap_or_else(|e| {
                Err(CameraError::CaptureFailed(format!(
                    "camera open task failed: {e}"
                )))
            });

        let source = match opened {
            Ok(source) => source,
            Err(err) => {
                tracing::error!(%session_id, error = %err, "camera unavailable");
                self.update(|s| s.camera_denied(format!("Camera access denied or error: {err}")))
                    .await;
                return Err(ControllerError::CameraUnavailable(err));
            }
        };

        let description = source.describe();
        let shared: SharedSource = Arc::new(Mutex::new(source));

        // The camera slot is held across grant and ticker install so a
        // concurrent stop() either prevents the grant or sees both installed.
        let epoch = {
            let mut camera = self.inner.camera.lock().await;
            let Some(epoch) = self.update(|s| s.camera_granted()).await else {
                tracing::info!(%session_id, "stopped while opening camera; releasing");
                return Err(ControllerError::StartAbandoned);
            };
            *camera = Some(Arc::clone(&shared));
            self.install_ticker().await;
            epoch
        };

        self.spawn_ready_probe(epoch, shared);
        tracing::info!(
            %session_id,
            epoch,
            camera = %description,
            interval = ?self.inner.settings.sample_interval,
            "session active"
        );
        Ok(epoch)
    }

    /// Cancel sampling and release the camera. Returns `false` if nothing
    /// was running. An outstanding request is left to finish; its answer is
    /// discarded.
    pub async fn stop(&self) -> bool {
        let stopped = self.update(|s| s.stop()).await;
        let released = self.inner.camera.lock().await.take();
        if let Some(token) = self.inner.ticker.lock().await.take() {
            token.cancel();
        }
        if released.is_some() {
            tracing::info!("camera released");
        }
        if stopped {
            tracing::info!("session stopped");
        }
        stopped
    }

    /// One sampling step. Skips instead of queueing when a request is
    /// already outstanding, the classifier is not known to be reachable, or
    /// no session is active.
    pub async fn sample_tick(&self) -> TickOutcome {
        let epoch = match self.update(|s| s.try_begin_tick()).await {
            TickDecision::Go { epoch } => epoch,
            TickDecision::Skip(reason) => {
                tracing::trace!(?reason, "tick skipped");
                return TickOutcome::Skipped(reason);
            }
        };

        match self.capture_and_classify().await {
            Ok(ClassifyOutcome::Face(reading)) => {
                let emotion = reading.emotion;
                let confidence = reading.confidence_percent();
                let outcome = self
                    .update(|s| s.tick_succeeded(epoch, reading, Utc::now()))
                    .await;
                tracing::debug!(?outcome, %emotion, confidence, "classification received");
                outcome
            }
            Ok(ClassifyOutcome::NoFace) => {
                let outcome = self.update(|s| s.tick_no_face(epoch)).await;
                tracing::debug!(?outcome, "no face in frame");
                outcome
            }
            Err(err) => {
                let outcome = self.update(|s| s.tick_failed(epoch)).await;
                tracing::debug!(?outcome, error = %err, "tick failed");
                outcome
            }
        }
    }

    async fn capture_and_classify(&self) -> Result<ClassifyOutcome, TickError> {
        let source = self
            .inner
            .camera
            .lock()
            .await
            .clone()
            .ok_or(CameraError::Released)?;
        let encoder = Arc::clone(&self.inner.encoder);
        let classifier = Arc::clone(&self.inner.classifier);

        tokio::task::spawn_blocking(move || -> Result<ClassifyOutcome, TickError> {
            let frame = source.blocking_lock().capture()?;
            // The device must not outlive stop() while the request is pending.
            drop(source);
            let payload = encoder.blocking_lock().encode_data_url(&frame)?;
            drop(frame);
            Ok(classifier.classify(&payload)?)
        })
        .await
        .map_err(|e| TickError::Worker(e.to_string()))?
    }

    async fn install_ticker(&self) {
        let token = CancellationToken::new();
        if let Some(previous) = self.inner.ticker.lock().await.replace(token.clone()) {
            previous.cancel();
        }
        tokio::spawn(ticker_loop(
            Arc::downgrade(&self.inner),
            token,
            self.inner.settings.sample_interval,
        ));
    }

    /// Confirm the feed yields a decodable frame before calling it ready.
    fn spawn_ready_probe(&self, epoch: u64, source: SharedSource) {
        let controller = self.clone();
        tokio::spawn(async move {
            let probe = tokio::task::spawn_blocking(move || source.blocking_lock().capture()).await;
            match probe {
                Ok(Ok(frame)) => {
                    if controller.update(|s| s.mark_video_ready(epoch)).await {
                        tracing::info!(
                            epoch,
                            width = frame.width,
                            height = frame.height,
                            "video feed ready"
                        );
                    }
                }
                Ok(Err(err)) => tracing::warn!(epoch, error = %err, "first frame not decodable"),
                Err(err) => tracing::warn!(epoch, error = %err, "ready probe task failed"),
            }
        });
    }
}

/// Fires a tick every `period`, first one a full period after start. Each
/// tick runs as its own task so the timer keeps its cadence while a request
/// is outstanding.
async fn ticker_loop(inner: Weak<Inner>, token: CancellationToken, period: Duration) {
    let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = token.cancelled() => break,
            _ = ticker.tick() => {
                let Some(inner) = inner.upgrade() else {
                    break;
                };
                let controller = Controller { inner };
                tokio::spawn(async move {
                    let outcome = controller.sample_tick().await;
                    tracing::trace!(?outcome, "tick finished");
                });
            }
        }
    }
    tracing::debug!("sampling timer stopped");
}
