//! emocam-hw — Camera capture and frame encoding.
//!
//! Provides V4L2-based camera access, pixel conversion to RGB, and JPEG
//! data-URL encoding for the classifier service.

pub mod camera;
pub mod frame;
pub mod source;

pub use camera::{Camera, CameraError, DeviceInfo, PixelFormat};
pub use frame::{Frame, FrameEncoder, FrameError};
pub use source::{CameraOpener, CaptureRequest, V4lOpener, VideoSource};
