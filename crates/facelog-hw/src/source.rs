//! Camera Source: device acquisition with backend/index fallback, and the
//! per-session recovery state machine.

use crate::camera::{Backend, CaptureSettings, ReadFailure};
use crate::frame::Frame;
use std::time::Duration;

/// An open, exclusively-owned capture device.
pub trait FrameReader {
    /// Block for the next frame.
    fn read(&mut self) -> Result<Frame, ReadFailure>;

    /// Release the device. Idempotent.
    fn release(&mut self);

    /// Human-readable identity for logs (device path, backend).
    fn describe(&self) -> String;
}

/// Something that can produce an open capture device.
pub trait CameraSource {
    /// Try to open a device. `None` means no device is available; the caller
    /// must treat that as a normal outcome, not an error.
    fn acquire(&mut self) -> Option<Box<dyn FrameReader + Send>>;
}

#[cfg(feature = "v4l2")]
impl FrameReader for crate::camera::Camera {
    fn read(&mut self) -> Result<Frame, ReadFailure> {
        self.capture_frame()
    }

    fn release(&mut self) {
        crate::camera::Camera::release(self);
    }

    fn describe(&self) -> String {
        format!("{} ({})", self.device_path, self.backend.name())
    }
}

/// V4L2 source trying each backend, and for each backend each device index.
#[derive(Debug, Clone)]
pub struct V4l2Source {
    pub backends: Vec<Backend>,
    pub indices: Vec<u32>,
    pub settings: CaptureSettings,
}

impl V4l2Source {
    pub fn new(indices: Vec<u32>, settings: CaptureSettings) -> Self {
        Self {
            backends: Backend::DEFAULT_ORDER.to_vec(),
            indices,
            settings,
        }
    }
}

impl Default for V4l2Source {
    fn default() -> Self {
        Self::new(vec![0, 1], CaptureSettings::default())
    }
}

impl CameraSource for V4l2Source {
    #[cfg(feature = "v4l2")]
    fn acquire(&mut self) -> Option<Box<dyn FrameReader + Send>> {
        for &backend in &self.backends {
            for &index in &self.indices {
                let path = format!("/dev/video{index}");
                match crate::camera::Camera::open(&path, backend, &self.settings) {
                    Ok(camera) => return Some(Box::new(camera)),
                    Err(e) => {
                        tracing::debug!(
                            device = %path,
                            backend = backend.name(),
                            error = %e,
                            "camera open failed"
                        );
                    }
                }
            }
        }
        tracing::warn!(
            indices = ?self.indices,
            backends = ?self.backends,
            "no camera could be opened"
        );
        None
    }

    #[cfg(not(feature = "v4l2"))]
    fn acquire(&mut self) -> Option<Box<dyn FrameReader + Send>> {
        tracing::warn!("built without v4l2 support; no camera available");
        None
    }
}

/// States of one streaming session's camera.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Nothing acquired yet.
    Closed,
    /// Device held, ready to read.
    Open,
    /// A read is in progress.
    Reading,
    /// A read failed and the device was released; `attempt` counts
    /// consecutive failures since the last good frame.
    DegradedRetry { attempt: u32 },
    /// No device can be (re)acquired. Terminal.
    Exhausted,
}

/// Release/backoff/re-acquire policy after a failed read.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub backoff: Duration,
    /// Consecutive failed reads tolerated before the session gives up.
    pub max_reacquire: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            backoff: Duration::from_secs(1),
            max_reacquire: 3,
        }
    }
}

/// Owns one session's camera and drives it through [`SessionState`].
///
/// `next_frame` returns `None` only once the session is exhausted, and
/// every path out of the session (exhaustion, drop, unwinding) releases
/// the device.
pub struct CameraSupervisor {
    source: Box<dyn CameraSource + Send>,
    handle: Option<Box<dyn FrameReader + Send>>,
    state: SessionState,
    policy: RetryPolicy,
    consecutive_failures: u32,
}

impl CameraSupervisor {
    pub fn new(source: Box<dyn CameraSource + Send>, policy: RetryPolicy) -> Self {
        Self {
            source,
            handle: None,
            state: SessionState::Closed,
            policy,
            consecutive_failures: 0,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Advance the state machine until a frame is read or the session is exhausted.
    pub fn next_frame(&mut self) -> Option<Frame> {
        loop {
            match self.state {
                SessionState::Closed => self.acquire(),
                SessionState::Open => self.state = SessionState::Reading,
                SessionState::Reading => {
                    let Some(handle) = self.handle.as_mut() else {
                        self.state = SessionState::Closed;
                        continue;
                    };
                    match handle.read() {
                        Ok(frame) => {
                            self.consecutive_failures = 0;
                            self.state = SessionState::Open;
                            return Some(frame);
                        }
                        Err(e) => {
                            self.consecutive_failures += 1;
                            tracing::warn!(
                                camera = %handle.describe(),
                                error = %e,
                                attempt = self.consecutive_failures,
                                "frame read failed; releasing camera"
                            );
                            self.release();
                            self.state = SessionState::DegradedRetry {
                                attempt: self.consecutive_failures,
                            };
                        }
                    }
                }
                SessionState::DegradedRetry { attempt } => {
                    if attempt > self.policy.max_reacquire {
                        tracing::warn!(attempt, "camera recovery attempts exhausted");
                        self.state = SessionState::Exhausted;
                        continue;
                    }
                    if !self.policy.backoff.is_zero() {
                        std::thread::sleep(self.policy.backoff);
                    }
                    self.acquire();
                }
                SessionState::Exhausted => {
                    self.release();
                    return None;
                }
            }
        }
    }

    fn acquire(&mut self) {
        match self.source.acquire() {
            Some(handle) => {
                tracing::info!(camera = %handle.describe(), "camera acquired");
                self.handle = Some(handle);
                self.state = SessionState::Open;
            }
            None => {
                tracing::warn!("camera unavailable; ending session");
                self.state = SessionState::Exhausted;
            }
        }
    }

    /// Release the held device, if any. Idempotent.
    pub fn release(&mut self) {
        if let Some(mut handle) = self.handle.take() {
            handle.release();
        }
    }
}

impl Drop for CameraSupervisor {
    fn drop(&mut self) {
        self.release();
    }
}
