//! LBPH face recognizer.
//!
//! Reads a trained model from an OpenCV `opencv_lbphfaces` YAML file and
//! classifies grayscale face crops by nearest neighbour over spatial
//! histograms of extended (circular) local binary patterns.

use crate::types::Prediction;
use image::GrayImage;
use serde::Deserialize;
use std::path::Path;
use thiserror::Error;

const MODEL_ROOT_KEY: &str = "opencv_lbphfaces";
/// Upper bound on sampling points; the histogram has `2^neighbors` bins.
const MAX_NEIGHBORS: u32 = 16;

#[derive(Error, Debug)]
pub enum RecognizerError {
    #[error("model file not found: {0}")]
    ModelNotFound(String),
    #[error("failed to read model: {0}")]
    Io(#[from] std::io::Error),
    #[error("malformed model YAML: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("invalid model: {0}")]
    InvalidModel(String),
    #[error("invalid input: {0}")]
    InvalidInput(String),
}

/// Identifies a grayscale face crop.
pub trait FaceRecognizer: Send + Sync {
    /// Whether any samples are loaded; untrained recognizers never match.
    fn is_trained(&self) -> bool;

    fn predict(&self, face: &GrayImage) -> Result<Prediction, RecognizerError>;
}

/// LBP operator and grid geometry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LbphParams {
    pub radius: u32,
    pub neighbors: u32,
    pub grid_x: u32,
    pub grid_y: u32,
}

impl Default for LbphParams {
    fn default() -> Self {
        Self {
            radius: 1,
            neighbors: 8,
            grid_x: 8,
            grid_y: 8,
        }
    }
}

impl LbphParams {
    fn bins(&self) -> usize {
        1usize << self.neighbors
    }

    fn histogram_len(&self) -> usize {
        (self.grid_x * self.grid_y) as usize * self.bins()
    }

    fn validate(&self) -> Result<(), RecognizerError> {
        if self.radius == 0 || self.neighbors == 0 || self.neighbors > MAX_NEIGHBORS {
            return Err(RecognizerError::InvalidModel(format!(
                "radius {} / neighbors {} out of range",
                self.radius, self.neighbors
            )));
        }
        if self.grid_x == 0 || self.grid_y == 0 {
            return Err(RecognizerError::InvalidModel("empty histogram grid".into()));
        }
        Ok(())
    }
}

/// OpenCV matrix node, with the `!!opencv-matrix` tag stripped.
#[derive(Debug, Deserialize)]
struct MatrixNode {
    #[serde(default)]
    rows: usize,
    #[serde(default)]
    cols: usize,
    #[serde(default)]
    data: Vec<f64>,
}

#[derive(Debug, Deserialize)]
struct ModelFile {
    #[serde(default = "no_threshold")]
    threshold: f64,
    radius: u32,
    neighbors: u32,
    grid_x: u32,
    grid_y: u32,
    #[serde(default)]
    histograms: Vec<MatrixNode>,
    labels: Option<MatrixNode>,
}

fn no_threshold() -> f64 {
    f64::MAX
}

/// Nearest-neighbour LBPH classifier. Immutable after load.
#[derive(Debug, Clone)]
pub struct LbphRecognizer {
    params: LbphParams,
    threshold: f64,
    histograms: Vec<Vec<f64>>,
    labels: Vec<i64>,
}

impl LbphRecognizer {
    /// A recognizer with no samples.
    pub fn untrained(params: LbphParams) -> Self {
        Self {
            params,
            threshold: f64::MAX,
            histograms: Vec::new(),
            labels: Vec::new(),
        }
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, RecognizerError> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(RecognizerError::ModelNotFound(path.display().to_string()));
        }
        let text = std::fs::read_to_string(path)?;
        let model = Self::from_yaml_str(&text)?;

        tracing::info!(
            path = %path.display(),
            samples = model.sample_count(),
            radius = model.params.radius,
            neighbors = model.params.neighbors,
            grid = ?(model.params.grid_x, model.params.grid_y),
            "loaded LBPH model"
        );
        Ok(model)
    }

    /// Load the model, or fall back to an untrained recognizer if the file
    /// is missing or unreadable. The service keeps detecting either way.
    pub fn load_or_untrained(path: impl AsRef<Path>) -> Self {
        let path = path.as_ref();
        match Self::load(path) {
            Ok(model) => model,
            Err(e) => {
                tracing::warn!(
                    path = %path.display(),
                    error = %e,
                    "recognizer model unavailable; faces will be detected but never identified"
                );
                Self::untrained(LbphParams::default())
            }
        }
    }

    /// Parse OpenCV FileStorage YAML.
    pub fn from_yaml_str(text: &str) -> Result<Self, RecognizerError> {
        // FileStorage writes a non-standard `%YAML:1.0` directive and custom tags.
        let cleaned: String = text
            .lines()
            .filter(|line| !line.trim_start().starts_with("%YAML"))
            .map(|line| line.replace("!!opencv-matrix", ""))
            .collect::<Vec<_>>()
            .join("\n");

        let doc: serde_yaml::Value = serde_yaml::from_str(&cleaned)?;
        let body = doc.get(MODEL_ROOT_KEY).cloned().unwrap_or(doc);
        let file: ModelFile = serde_yaml::from_value(body)?;

        let params = LbphParams {
            radius: file.radius,
            neighbors: file.neighbors,
            grid_x: file.grid_x,
            grid_y: file.grid_y,
        };
        params.validate()?;

        let expected = params.histogram_len();
        let histograms = file
            .histograms
            .into_iter()
            .enumerate()
            .map(|(i, m)| {
                if m.data.len() != expected || m.rows * m.cols != expected {
                    return Err(RecognizerError::InvalidModel(format!(
                        "histogram {i} has {} values ({}x{}), expected {expected}",
                        m.data.len(),
                        m.rows,
                        m.cols
                    )));
                }
                Ok(m.data)
            })
            .collect::<Result<Vec<_>, _>>()?;

        let labels: Vec<i64> = file
            .labels
            .map(|m| m.data.iter().map(|&v| v as i64).collect())
            .unwrap_or_default();
        if labels.len() != histograms.len() {
            return Err(RecognizerError::InvalidModel(format!(
                "{} labels for {} histograms",
                labels.len(),
                histograms.len()
            )));
        }

        Ok(Self {
            params,
            threshold: file.threshold,
            histograms,
            labels,
        })
    }

    pub fn params(&self) -> LbphParams {
        self.params
    }

    pub fn sample_count(&self) -> usize {
        self.histograms.len()
    }

    /// Feature vector for a face crop.
    fn histogram(&self, face: &GrayImage) -> Result<Vec<f64>, RecognizerError> {
        let p = &self.params;
        let (w, h) = face.dimensions();
        let lbp_w = w.saturating_sub(2 * p.radius);
        let lbp_h = h.saturating_sub(2 * p.radius);
        if lbp_w / p.grid_x == 0 || lbp_h / p.grid_y == 0 {
            return Err(RecognizerError::InvalidInput(format!(
                "{w}x{h} crop too small for a {}x{} grid at radius {}",
                p.grid_x, p.grid_y, p.radius
            )));
        }
        let codes = elbp(face, p.radius, p.neighbors);
        Ok(spatial_histogram(&codes, lbp_w as usize, lbp_h as usize, p))
    }
}

impl FaceRecognizer for LbphRecognizer {
    fn is_trained(&self) -> bool {
        !self.histograms.is_empty()
    }

    fn predict(&self, face: &GrayImage) -> Result<Prediction, RecognizerError> {
        if !self.is_trained() {
            return Ok(Prediction::untrained());
        }
        let query = self.histogram(face)?;

        let mut best = Prediction::untrained();
        for (sample, &label) in self.histograms.iter().zip(&self.labels) {
            let dist = chi_square_alt(sample, &query);
            if dist < best.distance && dist < self.threshold {
                best = Prediction {
                    identity: Some(label),
                    distance: dist,
                };
            }
        }
        tracing::trace!(identity = ?best.identity, distance = best.distance, "lbph prediction");
        Ok(best)
    }
}

/// Extended LBP codes, row-major, sized `(w - 2r) x (h - 2r)`.
pub(crate) fn elbp(src: &GrayImage, radius: u32, neighbors: u32) -> Vec<u32> {
    let (w, h) = (src.width() as i64, src.height() as i64);
    let r = radius as i64;
    let (out_w, out_h) = ((w - 2 * r).max(0), (h - 2 * r).max(0));
    let mut codes = vec![0u32; (out_w * out_h) as usize];
    let px = |x: i64, y: i64| src.as_raw()[(y * w + x) as usize] as f32;

    for n in 0..neighbors {
        let angle = 2.0 * std::f64::consts::PI * n as f64 / neighbors as f64;
        let x = (radius as f64 * angle.cos()) as f32;
        let y = (-(radius as f64) * angle.sin()) as f32;
        let (fx, fy) = (x.floor() as i64, y.floor() as i64);
        let (cx, cy) = (x.ceil() as i64, y.ceil() as i64);
        let tx = x - fx as f32;
        let ty = y - fy as f32;
        let w1 = (1.0 - tx) * (1.0 - ty);
        let w2 = tx * (1.0 - ty);
        let w3 = (1.0 - tx) * ty;
        let w4 = tx * ty;

        for i in r..h - r {
            for j in r..w - r {
                let t = w1 * px(j + fx, i + fy)
                    + w2 * px(j + cx, i + fy)
                    + w3 * px(j + fx, i + cy)
                    + w4 * px(j + cx, i + cy);
                let center = px(j, i);
                if t > center || (t - center).abs() < f32::EPSILON {
                    codes[((i - r) * out_w + (j - r)) as usize] |= 1 << n;
                }
            }
        }
    }
    codes
}

/// Concatenated per-cell histograms, each normalised by the cell's pixel count.
/// Cells are `w / grid_x` by `h / grid_y`; remainder columns and rows are ignored.
pub(crate) fn spatial_histogram(
    codes: &[u32],
    w: usize,
    h: usize,
    params: &LbphParams,
) -> Vec<f64> {
    let bins = params.bins();
    let (gx, gy) = (params.grid_x as usize, params.grid_y as usize);
    let (cell_w, cell_h) = (w / gx, h / gy);
    let total = (cell_w * cell_h) as f32;
    let mut out = vec![0.0f64; gx * gy * bins];

    for cy in 0..gy {
        for cx in 0..gx {
            let base = (cy * gx + cx) * bins;
            let mut counts = vec![0u32; bins];
            for y in cy * cell_h..(cy + 1) * cell_h {
                for x in cx * cell_w..(cx + 1) * cell_w {
                    counts[codes[y * w + x] as usize] += 1;
                }
            }
            for (slot, &c) in out[base..base + bins].iter_mut().zip(&counts) {
                *slot = (c as f32 / total) as f64;
            }
        }
    }
    out
}

/// Alternative chi-square distance: `2 * sum((a - b)^2 / (a + b))`.
pub(crate) fn chi_square_alt(a: &[f64], b: &[f64]) -> f64 {
    let sum: f64 = a
        .iter()
        .zip(b)
        .filter_map(|(&x, &y)| {
            let s = x + y;
            (s.abs() > f64::EPSILON).then(|| (x - y) * (x - y) / s)
        })
        .sum();
    2.0 * sum
}
