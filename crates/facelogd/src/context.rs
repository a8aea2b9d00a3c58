use crate::config::Config;
use crate::pipeline::FrameProcessor;
use anyhow::{Context as _, Result};
use facelog_core::{CascadeDetector, FaceDetector, FaceRecognizer, LbphRecognizer};
use facelog_hw::{CameraSource, CameraSupervisor, V4l2Source};
use facelog_store::{DebounceByIdentity, RecordEveryMatch, RecordPolicy, Store};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Builds a fresh camera source for each streaming session.
pub type CameraFactory = Arc<dyn Fn() -> Box<dyn CameraSource + Send> + Send + Sync>;

/// Shared, read-only state handed to every request handler.
///
/// Detector and recognizer are loaded once at startup and shared; each
/// `/video_feed` session gets its own camera and record policy.
#[derive(Clone)]
pub struct AppContext {
    pub config: Arc<Config>,
    pub detector: Arc<dyn FaceDetector>,
    pub detector_stages: usize,
    pub recognizer: Arc<dyn FaceRecognizer>,
    pub store: Store,
    pub camera_factory: CameraFactory,
    shutting_down: Arc<AtomicBool>,
}

impl AppContext {
    pub fn new(
        config: Config,
        detector: Arc<dyn FaceDetector>,
        detector_stages: usize,
        recognizer: Arc<dyn FaceRecognizer>,
        store: Store,
        camera_factory: CameraFactory,
    ) -> Self {
        Self {
            config: Arc::new(config),
            detector,
            detector_stages,
            recognizer,
            store,
            camera_factory,
            shutting_down: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Load detector, recognizer and store from the configured paths.
    ///
    /// A missing or unusable cascade is fatal. A missing model is not: the
    /// recognizer starts untrained.
    pub fn load(config: Config) -> Result<Self> {
        let detector = CascadeDetector::load(&config.cascade_path, config.detector.clone())
            .with_context(|| {
                format!("failed to load face cascade {}", config.cascade_path.display())
            })?;
        let stages = detector.stage_count();

        let recognizer = LbphRecognizer::load_or_untrained(&config.model_path);

        let store = Store::open(&config.db_path)
            .with_context(|| format!("failed to open database {}", config.db_path.display()))?;

        let indices = config.camera_indices.clone();
        let capture = config.capture.clone();
        let camera_factory: CameraFactory = Arc::new(move || {
            let source = V4l2Source::new(indices.clone(), capture.clone());
            Box::new(source) as Box<dyn CameraSource + Send>
        });

        Ok(Self::new(
            config,
            Arc::new(detector),
            stages,
            Arc::new(recognizer),
            store,
            camera_factory,
        ))
    }

    /// A camera supervisor for one streaming session.
    pub fn open_session(&self) -> CameraSupervisor {
        CameraSupervisor::new((self.camera_factory)(), self.config.retry.clone())
    }

    pub fn record_policy(&self) -> Box<dyn RecordPolicy> {
        if self.config.debounce.is_zero() {
            Box::new(RecordEveryMatch)
        } else {
            Box::new(DebounceByIdentity::new(self.config.debounce))
        }
    }

    pub fn frame_processor(&self) -> FrameProcessor {
        FrameProcessor::new(
            self.detector.clone(),
            self.recognizer.clone(),
            self.store.clone(),
            self.config.acceptance,
            self.record_policy(),
        )
    }

    /// Ask running sessions to stop so graceful shutdown can complete.
    pub fn begin_shutdown(&self) {
        self.shutting_down.store(true, Ordering::SeqCst);
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::SeqCst)
    }
}
