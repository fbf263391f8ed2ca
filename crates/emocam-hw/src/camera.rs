//! V4L2 camera capture via the `v4l` crate.

use crate::frame::{self, Frame};
use std::path::Path;
use thiserror::Error;
use v4l::buffer::Type as BufType;
use v4l::io::traits::CaptureStream;
use v4l::prelude::*;
use v4l::video::Capture;
use v4l::FourCC;

/// `EBUSY` on Linux; another process holds the device.
const EBUSY: i32 = 16;

#[derive(Error, Debug)]
pub enum CameraError {
    #[error("device not found: {0}")]
    DeviceNotFound(String),
    #[error("permission denied: {0}")]
    PermissionDenied(String),
    #[error("device busy")]
    DeviceBusy,
    #[error("capture failed: {0}")]
    CaptureFailed(String),
    #[error("format negotiation failed: {0}")]
    FormatNegotiationFailed(String),
    #[error("streaming not supported")]
    StreamingNotSupported,
    #[error("camera released")]
    Released,
}

/// Info about a discovered V4L2 device.
#[derive(Debug, Clone)]
pub struct DeviceInfo {
    pub path: String,
    pub name: String,
    pub driver: String,
    pub bus: String,
}

/// Negotiated pixel format for the camera.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PixelFormat {
    /// YUYV 4:2:2 packed (2 bytes/pixel).
    Yuyv,
    /// Motion JPEG, one JPEG per buffer.
    Mjpeg,
    /// 8-bit grayscale.
    Grey,
}

impl PixelFormat {
    fn from_fourcc(fourcc: FourCC) -> Option<Self> {
        if fourcc == FourCC::new(b"YUYV") {
            Some(PixelFormat::Yuyv)
        } else if fourcc == FourCC::new(b"MJPG") {
            Some(PixelFormat::Mjpeg)
        } else if fourcc == FourCC::new(b"GREY") {
            Some(PixelFormat::Grey)
        } else {
            None
        }
    }
}

/// V4L2 camera device handle. Dropping it closes the device.
pub struct Camera {
    device: Device,
    pub width: u32,
    pub height: u32,
    pub device_path: String,
    pub fourcc: FourCC,
    pixel_format: PixelFormat,
}

impl Camera {
    /// Open a V4L2 camera (e.g. "/dev/video0") and request `width`x`height`.
    ///
    /// YUYV is requested first; drivers that answer with MJPG or GREY are
    /// accepted too. The driver may round the resolution.
    pub fn open(device_path: &str, width: u32, height: u32) -> Result<Self, CameraError> {
        if !Path::new(device_path).exists() {
            return Err(CameraError::DeviceNotFound(device_path.to_string()));
        }

        let device = Device::with_path(device_path).map_err(|e| match e.kind() {
            std::io::ErrorKind::PermissionDenied => {
                CameraError::PermissionDenied(format!("{device_path}: {e}"))
            }
            _ if e.raw_os_error() == Some(EBUSY) => CameraError::DeviceBusy,
            _ => CameraError::DeviceNotFound(format!("{device_path}: {e}")),
        })?;

        let caps = device.query_caps().map_err(|e| {
            CameraError::CaptureFailed(format!("failed to query capabilities: {e}"))
        })?;

        tracing::info!(
            device = device_path,
            driver = %caps.driver,
            card = %caps.card,
            "opened camera"
        );

        if !caps
            .capabilities
            .contains(v4l::capability::Flags::VIDEO_CAPTURE)
        {
            return Err(CameraError::StreamingNotSupported);
        }

        let mut fmt = device.format().map_err(|e| {
            CameraError::FormatNegotiationFailed(format!("failed to get format: {e}"))
        })?;
        fmt.fourcc = FourCC::new(b"YUYV");
        fmt.width = width;
        fmt.height = height;

        let negotiated = device.set_format(&fmt).map_err(|e| {
            if e.raw_os_error() == Some(EBUSY) {
                CameraError::DeviceBusy
            } else {
                CameraError::FormatNegotiationFailed(format!("failed to set format: {e}"))
            }
        })?;

        let fourcc = negotiated.fourcc;
        let pixel_format = PixelFormat::from_fourcc(fourcc).ok_or_else(|| {
            CameraError::FormatNegotiationFailed(format!(
                "unsupported pixel format: {fourcc:?} (need YUYV, MJPG, or GREY)"
            ))
        })?;

        tracing::info!(
            width = negotiated.width,
            height = negotiated.height,
            fourcc = ?fourcc,
            "negotiated format"
        );

        Ok(Self {
            device,
            width: negotiated.width,
            height: negotiated.height,
            device_path: device_path.to_string(),
            fourcc,
            pixel_format,
        })
    }

    pub fn pixel_format(&self) -> PixelFormat {
        self.pixel_format
    }

    /// Capture a single frame and convert it to RGB.
    pub fn capture_frame(&self) -> Result<Frame, CameraError> {
        let mut stream =
            MmapStream::with_buffers(&self.device, BufType::VideoCapture, 4).map_err(|e| {
                CameraError::CaptureFailed(format!("failed to create mmap stream: {e}"))
            })?;

        let (buf, meta) = stream
            .next()
            .map_err(|e| CameraError::CaptureFailed(format!("failed to dequeue buffer: {e}")))?;

        let (rgb, width, height) = self.buf_to_rgb(buf, meta.bytesused as usize)?;
        Frame::new(rgb, width, height, meta.sequence)
            .map_err(|e| CameraError::CaptureFailed(e.to_string()))
    }

    fn buf_to_rgb(&self, buf: &[u8], bytes_used: usize) -> Result<(Vec<u8>, u32, u32), CameraError> {
        let converted = match self.pixel_format {
            PixelFormat::Yuyv => frame::yuyv_to_rgb(buf, self.width, self.height)
                .map(|rgb| (rgb, self.width, self.height)),
            PixelFormat::Grey => frame::grey_to_rgb(buf, self.width, self.height)
                .map(|rgb| (rgb, self.width, self.height)),
            // Some drivers leave bytesused at zero; fall back to the whole buffer.
            PixelFormat::Mjpeg if bytes_used > 0 => {
                frame::mjpeg_to_rgb(&buf[..bytes_used.min(buf.len())])
            }
            PixelFormat::Mjpeg => frame::mjpeg_to_rgb(buf),
        };
        converted.map_err(|e| {
            CameraError::CaptureFailed(format!("{:?} conversion failed: {e}", self.pixel_format))
        })
    }

    /// List available V4L2 video capture devices.
    pub fn list_devices() -> Vec<DeviceInfo> {
        let mut devices = Vec::new();

        for i in 0..16 {
            let path = format!("/dev/video{i}");
            if !Path::new(&path).exists() {
                continue;
            }
            let Ok(dev) = Device::with_path(&path) else {
                continue;
            };
            let Ok(caps) = dev.query_caps() else {
                continue;
            };
            if !caps
                .capabilities
                .contains(v4l::capability::Flags::VIDEO_CAPTURE)
            {
                continue;
            }
            devices.push(DeviceInfo {
                path,
                name: caps.card.clone(),
                driver: caps.driver.clone(),
                bus: caps.bus.clone(),
            });
        }

        devices
    }
}
