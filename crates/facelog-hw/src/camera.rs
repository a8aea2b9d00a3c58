//! V4L2 camera capture via the `v4l` crate.

use crate::frame::Frame;
use std::time::Duration;
use thiserror::Error;

#[cfg(feature = "v4l2")]
use crate::frame;
#[cfg(feature = "v4l2")]
use std::path::Path;
#[cfg(feature = "v4l2")]
use v4l::buffer::Type as BufType;
#[cfg(feature = "v4l2")]
use v4l::io::traits::CaptureStream;
#[cfg(feature = "v4l2")]
use v4l::prelude::*;
#[cfg(feature = "v4l2")]
use v4l::video::Capture;
#[cfg(feature = "v4l2")]
use v4l::FourCC;

#[derive(Error, Debug)]
pub enum CameraError {
    #[error("device not found: {0}")]
    DeviceNotFound(String),
    #[error("capture failed: {0}")]
    CaptureFailed(String),
    #[error("device busy")]
    DeviceBusy,
    #[error("format negotiation failed: {0}")]
    FormatNegotiationFailed(String),
    #[error("streaming not supported")]
    StreamingNotSupported,
}

/// A failed frame read. Returned rather than raised so the session can
/// decide to release and re-acquire the device.
#[derive(Error, Debug)]
pub enum ReadFailure {
    #[error("device disconnected: {0}")]
    Disconnected(String),
    #[error("device busy")]
    Busy,
    #[error("no frame within the read timeout")]
    Stalled,
    #[error("undecodable frame: {0}")]
    Decode(String),
    #[error("camera already released")]
    Released,
    #[error("read failed: {0}")]
    Io(String),
}

impl From<std::io::Error> for ReadFailure {
    fn from(e: std::io::Error) -> Self {
        if let Some(failure) = classify_errno(&e) {
            return failure;
        }
        if e.kind() == std::io::ErrorKind::TimedOut {
            Self::Stalled
        } else {
            Self::Io(e.to_string())
        }
    }
}

#[cfg(feature = "v4l2")]
fn classify_errno(e: &std::io::Error) -> Option<ReadFailure> {
    match e.raw_os_error()? {
        libc::ENODEV | libc::ENXIO => Some(ReadFailure::Disconnected(e.to_string())),
        libc::EBUSY => Some(ReadFailure::Busy),
        libc::ETIMEDOUT => Some(ReadFailure::Stalled),
        _ => None,
    }
}

#[cfg(not(feature = "v4l2"))]
fn classify_errno(_e: &std::io::Error) -> Option<ReadFailure> {
    None
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
    /// Motion-JPEG, one compressed image per buffer.
    Mjpeg,
    /// YUYV 4:2:2 packed (2 bytes/pixel).
    Yuyv,
    /// 8-bit grayscale (1 byte/pixel).
    Grey,
}

impl PixelFormat {
    pub fn fourcc(self) -> [u8; 4] {
        match self {
            PixelFormat::Mjpeg => *b"MJPG",
            PixelFormat::Yuyv => *b"YUYV",
            PixelFormat::Grey => *b"GREY",
        }
    }

    pub fn from_fourcc(repr: [u8; 4]) -> Option<Self> {
        match &repr {
            b"MJPG" | b"JPEG" => Some(PixelFormat::Mjpeg),
            b"YUYV" => Some(PixelFormat::Yuyv),
            b"GREY" => Some(PixelFormat::Grey),
            _ => None,
        }
    }
}

/// Capture backend: a format-negotiation strategy tried against each device index.
///
/// `Mjpeg` and `Yuyv` only succeed when the driver grants exactly that
/// format; `Any` takes whatever supported format the driver settles on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backend {
    Mjpeg,
    Yuyv,
    Any,
}

impl Backend {
    /// Backend order used when none is configured.
    pub const DEFAULT_ORDER: [Backend; 3] = [Backend::Mjpeg, Backend::Yuyv, Backend::Any];

    pub fn name(self) -> &'static str {
        match self {
            Backend::Mjpeg => "v4l2-mjpeg",
            Backend::Yuyv => "v4l2-yuyv",
            Backend::Any => "v4l2-any",
        }
    }

    /// Format requested from the driver.
    pub fn requested(self) -> PixelFormat {
        match self {
            Backend::Mjpeg => PixelFormat::Mjpeg,
            Backend::Yuyv | Backend::Any => PixelFormat::Yuyv,
        }
    }

    /// Whether this backend can work with what the driver negotiated.
    pub fn accepts(self, negotiated: PixelFormat) -> bool {
        match self {
            Backend::Any => true,
            _ => negotiated == self.requested(),
        }
    }
}

/// Target capture parameters applied to every opened device.
#[derive(Debug, Clone)]
pub struct CaptureSettings {
    pub width: u32,
    pub height: u32,
    pub fps: u32,
    /// A dequeue blocking longer than this is reported as [`ReadFailure::Stalled`].
    pub read_timeout: Duration,
}

impl Default for CaptureSettings {
    fn default() -> Self {
        Self {
            width: 640,
            height: 480,
            fps: 30,
            read_timeout: Duration::from_secs(2),
        }
    }
}

#[cfg(feature = "v4l2")]
struct Streaming {
    stream: MmapStream<'static>,
    #[allow(dead_code)]
    device: Device,
}

/// Open V4L2 camera with an active mmap capture stream.
///
/// Exclusively owns the device until [`release`](Camera::release) or drop.
#[cfg(feature = "v4l2")]
pub struct Camera {
    streaming: Option<Streaming>,
    pub width: u32,
    pub height: u32,
    pub device_path: String,
    pub backend: Backend,
    /// Negotiated pixel format.
    pub pixel_format: PixelFormat,
}

#[cfg(feature = "v4l2")]
impl Camera {
    /// Open a V4L2 device by path (e.g., "/dev/video0") using one backend strategy.
    pub fn open(
        device_path: &str,
        backend: Backend,
        settings: &CaptureSettings,
    ) -> Result<Self, CameraError> {
        if !Path::new(device_path).exists() {
            return Err(CameraError::DeviceNotFound(device_path.to_string()));
        }

        let device = Device::with_path(device_path).map_err(|e| {
            if e.raw_os_error() == Some(libc::EBUSY) || e.to_string().contains("busy") {
                CameraError::DeviceBusy
            } else {
                CameraError::DeviceNotFound(format!("{device_path}: {e}"))
            }
        })?;

        let caps = device.query_caps().map_err(|e| {
            CameraError::CaptureFailed(format!("failed to query capabilities: {e}"))
        })?;
        if !caps
            .capabilities
            .contains(v4l::capability::Flags::VIDEO_CAPTURE)
        {
            return Err(CameraError::StreamingNotSupported);
        }

        let mut fmt = device.format().map_err(|e| {
            CameraError::FormatNegotiationFailed(format!("failed to get format: {e}"))
        })?;
        fmt.fourcc = FourCC::new(&backend.requested().fourcc());
        fmt.width = settings.width;
        fmt.height = settings.height;

        let negotiated = device.set_format(&fmt).map_err(|e| {
            CameraError::FormatNegotiationFailed(format!("failed to set format: {e}"))
        })?;

        let pixel_format = PixelFormat::from_fourcc(negotiated.fourcc.repr).ok_or_else(|| {
            CameraError::FormatNegotiationFailed(format!(
                "unsupported pixel format: {:?} (need MJPG, YUYV, or GREY)",
                negotiated.fourcc
            ))
        })?;
        if !backend.accepts(pixel_format) {
            return Err(CameraError::FormatNegotiationFailed(format!(
                "{} requested {:?}, driver offered {pixel_format:?}",
                backend.name(),
                backend.requested()
            )));
        }

        if settings.fps > 0 {
            let params = v4l::video::capture::Parameters::with_fps(settings.fps);
            if let Err(e) = device.set_params(&params) {
                tracing::warn!(device = device_path, error = %e, "failed to set frame rate");
            }
        }

        let mut stream = MmapStream::with_buffers(&device, BufType::VideoCapture, 4)
            .map_err(|e| CameraError::CaptureFailed(format!("failed to create mmap stream: {e}")))?;
        stream.set_timeout(settings.read_timeout);

        tracing::info!(
            device = device_path,
            card = %caps.card,
            backend = backend.name(),
            width = negotiated.width,
            height = negotiated.height,
            format = ?pixel_format,
            "opened camera"
        );

        Ok(Self {
            streaming: Some(Streaming { stream, device }),
            width: negotiated.width,
            height: negotiated.height,
            device_path: device_path.to_string(),
            backend,
            pixel_format,
        })
    }

    /// Block for the next frame and decode it to RGB.
    pub fn capture_frame(&mut self) -> Result<Frame, ReadFailure> {
        let (width, height, pixel_format) = (self.width, self.height, self.pixel_format);
        let streaming = self.streaming.as_mut().ok_or(ReadFailure::Released)?;

        let (buf, meta) = streaming.stream.next()?;
        let sequence = meta.sequence;
        // Compressed payloads are shorter than the mapped buffer.
        let used = meta.bytesused as usize;
        let buf = if used > 0 && used <= buf.len() { &buf[..used] } else { buf };

        let image = match pixel_format {
            PixelFormat::Mjpeg => image::load_from_memory_with_format(buf, image::ImageFormat::Jpeg)
                .map_err(|e| ReadFailure::Decode(format!("MJPEG: {e}")))?
                .to_rgb8(),
            PixelFormat::Yuyv => frame::yuyv_to_rgb(buf, width, height)
                .map_err(|e| ReadFailure::Decode(format!("YUYV: {e}")))?,
            PixelFormat::Grey => frame::grey_to_rgb(buf, width, height)
                .map_err(|e| ReadFailure::Decode(format!("GREY: {e}")))?,
        };

        Ok(Frame::new(image, sequence))
    }

    /// Stop streaming and close the device. Safe to call more than once.
    pub fn release(&mut self) {
        if self.streaming.take().is_some() {
            tracing::info!(device = %self.device_path, "released camera");
        }
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
            if !caps.capabilities.contains(v4l::capability::Flags::VIDEO_CAPTURE) {
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

#[cfg(feature = "v4l2")]
impl Drop for Camera {
    fn drop(&mut self) {
        self.release();
    }
}

/// List available capture devices. Empty when built without V4L2 support.
pub fn list_devices() -> Vec<DeviceInfo> {
    #[cfg(feature = "v4l2")]
    {
        Camera::list_devices()
    }
    #[cfg(not(feature = "v4l2"))]
    {
        Vec::new()
    }
}
