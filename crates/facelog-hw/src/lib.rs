//! facelog-hw: Camera acquisition for the live recognition pipeline.
//!
//! Provides V4L2 capture with an ordered backend/index fallback, RGB frame
//! decoding, and a bounded release/backoff/re-acquire state machine for
//! streaming sessions.

pub mod camera;
pub mod frame;
pub mod source;

#[cfg(feature = "v4l2")]
pub use camera::Camera;
pub use camera::{
    list_devices, Backend, CameraError, CaptureSettings, DeviceInfo, PixelFormat, ReadFailure,
};
pub use frame::Frame;
pub use source::{
    CameraSource, CameraSupervisor, FrameReader, RetryPolicy, SessionState, V4l2Source,
};
