//! Video source seam between the controller and the camera hardware.

use crate::camera::{Camera, CameraError};
use crate::frame::Frame;

/// What the controller asks for when a session starts. Video only.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CaptureRequest {
    pub device: String,
    pub width: u32,
    pub height: u32,
}

impl Default for CaptureRequest {
    fn default() -> Self {
        Self {
            device: "/dev/video0".to_string(),
            width: 640,
            height: 480,
        }
    }
}

/// A live, exclusively owned video feed. Dropping it releases the device.
pub trait VideoSource: Send {
    /// Grab the current frame. Blocks until the driver hands one over.
    fn capture(&mut self) -> Result<Frame, CameraError>;

    /// Negotiated (width, height).
    fn resolution(&self) -> (u32, u32);

    fn describe(&self) -> String;
}

/// Acquires a [`VideoSource`]. Opening blocks on the driver.
pub trait CameraOpener: Send + Sync {
    fn open(&self, request: &CaptureRequest) -> Result<Box<dyn VideoSource>, CameraError>;
}

impl VideoSource for Camera {
    fn capture(&mut self) -> Result<Frame, CameraError> {
        self.capture_frame()
    }

    fn resolution(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    fn describe(&self) -> String {
        format!("{} ({:?})", self.device_path, self.pixel_format())
    }
}

/// Opens V4L2 devices.
#[derive(Debug, Clone, Copy, Default)]
pub struct V4lOpener;

impl CameraOpener for V4lOpener {
    fn open(&self, request: &CaptureRequest) -> Result<Box<dyn VideoSource>, CameraError> {
        let camera = Camera::open(&request.device, request.width, request.height)?;
        if (camera.width, camera.height) != (request.width, request.height) {
            tracing::warn!(
                requested_width = request.width,
                requested_height = request.height,
                width = camera.width,
                height = camera.height,
                "driver adjusted resolution"
            );
        }
        Ok(Box::new(camera))
    }
}
