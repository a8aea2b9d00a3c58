use facelog_core::{AcceptanceWindow, DetectorParams};
use facelog_hw::{CaptureSettings, RetryPolicy};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

const DEFAULT_CASCADE_PATH: &str = "haarcascade/haarcascade_frontalface_default.xml";

/// Daemon configuration, loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// HTTP listen address (default: 127.0.0.1:5000).
    pub bind: SocketAddr,
    /// Path to the SQLite event database.
    pub db_path: PathBuf,
    /// Haar cascade XML. Required; startup fails without it.
    pub cascade_path: PathBuf,
    /// Trained LBPH model. Optional; without it faces are never identified.
    pub model_path: PathBuf,
    /// Device indices tried in order for each backend.
    pub camera_indices: Vec<u32>,
    pub capture: CaptureSettings,
    pub detector: DetectorParams,
    /// Distance band in which a prediction is logged and labelled.
    pub acceptance: AcceptanceWindow,
    pub retry: RetryPolicy,
    pub jpeg_quality: u8,
    /// Rows shown by the index page and the detections endpoint.
    pub recent_limit: usize,
    /// Per-identity minimum gap between logged events; zero logs every frame.
    pub debounce: Duration,
}

impl Config {
    /// Load configuration from `FACELOG_*` environment variables with defaults.
    pub fn from_env() -> Self {
        Self::from_vars(|key| std::env::var(key).ok())
    }

    /// Build from an arbitrary variable lookup. Unparseable values fall back
    /// to their defaults.
    pub fn from_vars(get: impl Fn(&str) -> Option<String>) -> Self {
        let default_capture = CaptureSettings::default();
        let default_detector = DetectorParams::default();
        let default_window = AcceptanceWindow::default();
        let default_retry = RetryPolicy::default();

        let bind = parse_or(&get, "FACELOG_BIND", SocketAddr::from(([127, 0, 0, 1], 5000)));

        let db_path = get("FACELOG_DB_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(facelog_store::default_db_path);

        let camera_indices = get("FACELOG_CAMERA_INDICES")
            .and_then(|v| parse_list(&v))
            .unwrap_or_else(|| vec![0, 1]);

        Self {
            bind,
            db_path,
            cascade_path: get("FACELOG_CASCADE_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from(DEFAULT_CASCADE_PATH)),
            model_path: get("FACELOG_MODEL_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("recognizer/trainingdata.yml")),
            camera_indices,
            capture: CaptureSettings {
                width: parse_or(&get, "FACELOG_FRAME_WIDTH", default_capture.width),
                height: parse_or(&get, "FACELOG_FRAME_HEIGHT", default_capture.height),
                fps: parse_or(&get, "FACELOG_FPS", default_capture.fps),
                read_timeout: Duration::from_millis(parse_or(
                    &get,
                    "FACELOG_READ_TIMEOUT_MS",
                    default_capture.read_timeout.as_millis() as u64,
                )),
            },
            detector: DetectorParams {
                scale_factor: parse_or(
                    &get,
                    "FACELOG_SCALE_FACTOR",
                    default_detector.scale_factor,
                ),
                min_neighbors: parse_or(
                    &get,
                    "FACELOG_MIN_NEIGHBORS",
                    default_detector.min_neighbors,
                ),
                min_size: parse_or(&get, "FACELOG_MIN_FACE_SIZE", default_detector.min_size),
                max_size: default_detector.max_size,
            },
            acceptance: AcceptanceWindow::new(
                parse_or(&get, "FACELOG_ACCEPT_MIN", default_window.min),
                parse_or(&get, "FACELOG_ACCEPT_MAX", default_window.max),
            ),
            retry: RetryPolicy {
                backoff: Duration::from_millis(parse_or(
                    &get,
                    "FACELOG_RETRY_BACKOFF_MS",
                    default_retry.backoff.as_millis() as u64,
                )),
                max_reacquire: parse_or(&get, "FACELOG_MAX_REACQUIRE", default_retry.max_reacquire),
            },
            jpeg_quality: parse_or(&get, "FACELOG_JPEG_QUALITY", 95u8).clamp(1, 100),
            recent_limit: parse_or(&get, "FACELOG_RECENT_LIMIT", 10),
            debounce: Duration::from_millis(parse_or(&get, "FACELOG_DEBOUNCE_MS", 0)),
        }
    }
}

fn parse_or<T: FromStr>(get: &impl Fn(&str) -> Option<String>, key: &str, default: T) -> T {
    get(key)
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}

/// Comma-separated list; `None` if empty or any item is malformed.
fn parse_list(value: &str) -> Option<Vec<u32>> {
    let items = value
        .split(',')
        .map(|s| s.trim().parse().ok())
        .collect::<Option<Vec<u32>>>()?;
    (!items.is_empty()).then_some(items)
}
