use serde::{Deserialize, Serialize};

/// Axis-aligned face box in frame pixel coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
    /// Number of raw detector hits merged into this box (0 when ungrouped).
    pub neighbors: u32,
}

impl BoundingBox {
    pub fn new(x: u32, y: u32, width: u32, height: u32) -> Self {
        Self {
            x,
            y,
            width,
            height,
            neighbors: 0,
        }
    }

    /// Clip the box to a `width`×`height` image. `None` if nothing remains.
    pub fn clamp_to(&self, width: u32, height: u32) -> Option<BoundingBox> {
        if self.x >= width || self.y >= height {
            return None;
        }
        let w = self.width.min(width - self.x);
        let h = self.height.min(height - self.y);
        if w == 0 || h == 0 {
            return None;
        }
        Some(BoundingBox {
            width: w,
            height: h,
            ..*self
        })
    }
}

/// Result of classifying one face crop.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Prediction {
    /// Best-matching identity id; `None` when the model holds no samples.
    pub identity: Option<i64>,
    /// Distance to the best match. Lower is a stronger match.
    pub distance: f64,
}

impl Prediction {
    /// What an untrained recognizer reports: no identity, infinite distance.
    pub fn untrained() -> Self {
        Self {
            identity: None,
            distance: f64::INFINITY,
        }
    }
}

/// Inclusive distance band treated as a confident match.
///
/// Distances below `min` are over-confident but still outside the band;
/// distances above `max` are no-match.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AcceptanceWindow {
    pub min: f64,
    pub max: f64,
}

impl Default for AcceptanceWindow {
    fn default() -> Self {
        Self { min: 45.0, max: 85.0 }
    }
}

impl AcceptanceWindow {
    pub fn new(min: f64, max: f64) -> Self {
        Self { min, max }
    }

    /// Identity of the prediction if it falls inside the window.
    pub fn accept(&self, prediction: &Prediction) -> Option<i64> {
        let id = prediction.identity?;
        let d = prediction.distance;
        (d.is_finite() && d >= self.min && d <= self.max).then_some(id)
    }
}
