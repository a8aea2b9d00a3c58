//! facelog-core: Face detection and identification.
//!
//! A Haar cascade locates faces and an LBPH model identifies them. Both load
//! the standard OpenCV file formats and run on the CPU with no native
//! dependencies.

pub mod detector;
pub mod recognizer;
pub mod types;

pub use detector::{CascadeDetector, DetectorError, DetectorParams, FaceDetector};
pub use recognizer::{FaceRecognizer, LbphParams, LbphRecognizer, RecognizerError};
pub use types::{AcceptanceWindow, BoundingBox, Prediction};
