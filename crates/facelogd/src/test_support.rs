//! Fakes shared by the daemon's unit tests.

use crate::config::Config;
use crate::context::{AppContext, CameraFactory};
use facelog_core::{BoundingBox, FaceDetector, FaceRecognizer, Prediction, RecognizerError};
use facelog_hw::{CameraSource, Frame, FrameReader, ReadFailure};
use facelog_store::Store;
use image::{GrayImage, Rgb, RgbImage};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Reports the same boxes for every frame.
pub struct FixedDetector(pub Vec<BoundingBox>);

impl FaceDetector for FixedDetector {
    fn detect(&self, _gray: &GrayImage) -> Vec<BoundingBox> {
        self.0.clone()
    }
}

/// Returns a fixed prediction, or an error when constructed with `None`.
pub struct FixedRecognizer {
    prediction: Option<Prediction>,
}

impl FixedRecognizer {
    pub fn new(prediction: Option<Prediction>) -> Self {
        Self { prediction }
    }
}

impl FaceRecognizer for FixedRecognizer {
    fn is_trained(&self) -> bool {
        self.prediction.is_some_and(|p| p.identity.is_some())
    }

    fn predict(&self, _face: &GrayImage) -> Result<Prediction, RecognizerError> {
        self.prediction
            .ok_or_else(|| RecognizerError::InvalidInput("scripted failure".into()))
    }
}

/// A camera that yields `frames` grey frames, then fails; it can be
/// acquired once.
pub struct ScriptedCamera {
    frames: usize,
    acquired: bool,
    released: Arc<AtomicBool>,
}

struct ScriptedReader {
    remaining: usize,
    sequence: u32,
    released: Arc<AtomicBool>,
}

impl FrameReader for ScriptedReader {
    fn read(&mut self) -> Result<Frame, ReadFailure> {
        if self.remaining == 0 {
            return Err(ReadFailure::Disconnected("script finished".into()));
        }
        self.remaining -= 1;
        self.sequence += 1;
        Ok(Frame::new(RgbImage::from_pixel(64, 48, Rgb([90, 90, 90])), self.sequence))
    }

    fn release(&mut self) {
        self.released.store(true, Ordering::SeqCst);
    }

    fn describe(&self) -> String {
        "scripted camera".into()
    }
}

impl CameraSource for ScriptedCamera {
    fn acquire(&mut self) -> Option<Box<dyn FrameReader + Send>> {
        if self.frames == 0 || self.acquired {
            return None;
        }
        self.acquired = true;
        Some(Box::new(ScriptedReader {
            remaining: self.frames,
            sequence: 0,
            released: self.released.clone(),
        }))
    }
}

/// Camera factory producing a fresh [`ScriptedCamera`] per session, plus a
/// flag raised when any of its devices is released.
pub fn camera_factory(frames: usize) -> (CameraFactory, Arc<AtomicBool>) {
    let released = Arc::new(AtomicBool::new(false));
    let flag = released.clone();
    let factory: CameraFactory = Arc::new(move || {
        Box::new(ScriptedCamera {
            frames,
            acquired: false,
            released: flag.clone(),
        }) as Box<dyn CameraSource + Send>
    });
    (factory, released)
}

/// Default configuration rooted in `dir`, with no retry backoff.
pub fn config(dir: &Path) -> Config {
    let mut config = Config::from_vars(|_| None);
    config.db_path = dir.join("FaceBase.db");
    config.retry.backoff = Duration::ZERO;
    config
}

pub fn context(
    dir: &Path,
    faces: Vec<BoundingBox>,
    prediction: Option<Prediction>,
    frames: usize,
) -> AppContext {
    let config = config(dir);
    let store = Store::open(&config.db_path).unwrap();
    let (factory, _) = camera_factory(frames);
    AppContext::new(
        config,
        Arc::new(FixedDetector(faces)),
        1,
        Arc::new(FixedRecognizer::new(prediction)),
        store,
        factory,
    )
}

/// A minimal one-stage cascade file.
pub fn write_cascade(dir: &Path) -> PathBuf {
    let xml = r#"<?xml version="1.0"?>
<opencv_storage>
<cascade type_id="opencv-cascade-classifier">
  <stageType>BOOST</stageType>
  <featureType>HAAR</featureType>
  <height>8</height>
  <width>8</width>
  <stages>
    <_>
      <stageThreshold>0.</stageThreshold>
      <weakClassifiers>
        <_>
          <internalNodes>0 -1 0 5.0e-02</internalNodes>
          <leafValues>-1. 1.</leafValues></_></weakClassifiers></_></stages>
  <features>
    <_>
      <rects>
        <_>0 0 8 8 -1.</_>
        <_>0 0 4 8 2.</_></rects></_></features></cascade>
</opencv_storage>
"#;
    let path = dir.join("cascade.xml");
    std::fs::write(&path, xml).unwrap();
    path
}
