//! Haar cascade face detector.
//!
//! Loads an OpenCV 3+ boosted Haar cascade (`opencv-cascade-classifier` XML)
//! and scans an image pyramid with variance-normalised stage evaluation,
//! then merges overlapping hits the way `groupRectangles` does.

use crate::types::BoundingBox;
use image::GrayImage;
use roxmltree::Node;
use std::path::Path;
use std::str::FromStr;
use thiserror::Error;

/// Relative tolerance used when clustering raw hits.
const GROUP_EPS: f64 = 0.2;
/// Haar features hold at most this many weighted rectangles.
const MAX_FEATURE_RECTS: usize = 3;

#[derive(Error, Debug)]
pub enum DetectorError {
    #[error("cascade file not found: {0}")]
    CascadeNotFound(String),
    #[error("failed to read cascade: {0}")]
    Io(#[from] std::io::Error),
    #[error("malformed cascade XML: {0}")]
    Xml(#[from] roxmltree::Error),
    #[error("invalid cascade: {0}")]
    InvalidCascade(String),
    #[error("unsupported cascade: {0}")]
    Unsupported(String),
    #[error("invalid detector parameters: {0}")]
    InvalidParams(String),
}

/// Locates face regions in a grayscale frame.
pub trait FaceDetector: Send + Sync {
    /// Face boxes, ordered top-to-bottom then left-to-right.
    fn detect(&self, gray: &GrayImage) -> Vec<BoundingBox>;
}

/// Multi-scale scan parameters.
#[derive(Debug, Clone, PartialEq)]
pub struct DetectorParams {
    /// Pyramid step between scales; must be > 1.
    pub scale_factor: f64,
    /// Raw hits a cluster needs (strictly more than) to be reported.
    pub min_neighbors: u32,
    /// Smallest window edge in pixels; 0 means the cascade's own window.
    pub min_size: u32,
    /// Largest window edge in pixels; 0 means the whole image.
    pub max_size: u32,
}

impl Default for DetectorParams {
    fn default() -> Self {
        Self {
            scale_factor: 1.3,
            min_neighbors: 5,
            min_size: 0,
            max_size: 0,
        }
    }
}

impl DetectorParams {
    fn validate(&self) -> Result<(), DetectorError> {
        if !(self.scale_factor.is_finite() && self.scale_factor > 1.0) {
            return Err(DetectorError::InvalidParams(format!(
                "scale factor must be > 1, got {}",
                self.scale_factor
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy)]
struct WeightedRect {
    x: usize,
    y: usize,
    w: usize,
    h: usize,
    weight: f64,
}

#[derive(Debug, Clone)]
struct HaarFeature {
    rects: Vec<WeightedRect>,
}

impl HaarFeature {
    fn eval(&self, ii: &Integral, x: usize, y: usize) -> f64 {
        self.rects
            .iter()
            .map(|r| r.weight * ii.sum(x + r.x, y + r.y, r.w, r.h) as f64)
            .sum()
    }
}

/// One split of a boosted tree. Child indices `<= 0` are leaves (`-idx`).
#[derive(Debug, Clone, Copy)]
struct TreeNode {
    left: i32,
    right: i32,
    feature: usize,
    threshold: f64,
}

#[derive(Debug, Clone)]
struct WeakClassifier {
    nodes: Vec<TreeNode>,
    leaves: Vec<f64>,
}

#[derive(Debug, Clone)]
struct Stage {
    threshold: f64,
    classifiers: Vec<WeakClassifier>,
}

#[derive(Debug, Clone)]
struct Cascade {
    window_w: usize,
    window_h: usize,
    stages: Vec<Stage>,
    features: Vec<HaarFeature>,
}

/// Outcome of evaluating the cascade at one window position.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WindowResult {
    Face,
    /// Rejected by the stage with this index.
    Rejected(usize),
}

impl Cascade {
    fn eval_window(&self, ii: &Integral, x: usize, y: usize) -> WindowResult {
        // Variance normalisation over the window shrunk by one pixel per side.
        let (nw, nh) = (self.window_w - 2, self.window_h - 2);
        let area = (nw * nh) as f64;
        let s = ii.sum(x + 1, y + 1, nw, nh) as f64;
        let sq = ii.sq_sum(x + 1, y + 1, nw, nh) as f64;
        let nf = area * sq - s * s;
        let inv_norm = if nf > 0.0 { 1.0 / nf.sqrt() } else { 1.0 };

        for (si, stage) in self.stages.iter().enumerate() {
            let mut score = 0.0;
            for wc in &stage.classifiers {
                let mut idx = 0i32;
                loop {
                    let node = &wc.nodes[idx as usize];
                    let value = self.features[node.feature].eval(ii, x, y) * inv_norm;
                    idx = if value < node.threshold { node.left } else { node.right };
                    if idx <= 0 {
                        break;
                    }
                }
                score += wc.leaves[(-idx) as usize];
            }
            if score < stage.threshold {
                return WindowResult::Rejected(si);
            }
        }
        WindowResult::Face
    }
}

/// Summed-area tables for pixel values and squared pixel values.
struct Integral {
    stride: usize,
    sum: Vec<i64>,
    sq: Vec<i64>,
}

impl Integral {
    fn new(gray: &GrayImage) -> Self {
        let (w, h) = (gray.width() as usize, gray.height() as usize);
        let stride = w + 1;
        let mut sum = vec![0i64; stride * (h + 1)];
        let mut sq = vec![0i64; stride * (h + 1)];
        let px = gray.as_raw();

        for y in 0..h {
            let mut row_sum = 0i64;
            let mut row_sq = 0i64;
            for x in 0..w {
                let v = px[y * w + x] as i64;
                row_sum += v;
                row_sq += v * v;
                sum[(y + 1) * stride + x + 1] = sum[y * stride + x + 1] + row_sum;
                sq[(y + 1) * stride + x + 1] = sq[y * stride + x + 1] + row_sq;
            }
        }

        Self { stride, sum, sq }
    }

    fn rect(table: &[i64], stride: usize, x: usize, y: usize, w: usize, h: usize) -> i64 {
        table[(y + h) * stride + x + w] - table[y * stride + x + w] - table[(y + h) * stride + x]
            + table[y * stride + x]
    }

    fn sum(&self, x: usize, y: usize, w: usize, h: usize) -> i64 {
        Self::rect(&self.sum, self.stride, x, y, w, h)
    }

    fn sq_sum(&self, x: usize, y: usize, w: usize, h: usize) -> i64 {
        Self::rect(&self.sq, self.stride, x, y, w, h)
    }
}

/// Raw candidate rectangle in original-image coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Rect {
    x: i64,
    y: i64,
    w: i64,
    h: i64,
}

/// Haar cascade detector, immutable after load and shareable across threads.
pub struct CascadeDetector {
    cascade: Cascade,
    params: DetectorParams,
}

impl CascadeDetector {
    /// Load a cascade XML file.
    pub fn load(path: impl AsRef<Path>, params: DetectorParams) -> Result<Self, DetectorError> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(DetectorError::CascadeNotFound(path.display().to_string()));
        }
        let xml = std::fs::read_to_string(path)?;
        let detector = Self::from_xml(&xml, params)?;

        tracing::info!(
            path = %path.display(),
            stages = detector.stage_count(),
            features = detector.cascade.features.len(),
            window = ?detector.window_size(),
            "loaded Haar cascade"
        );
        Ok(detector)
    }

    /// Parse a cascade from XML text.
    pub fn from_xml(xml: &str, params: DetectorParams) -> Result<Self, DetectorError> {
        params.validate()?;
        let doc = roxmltree::Document::parse(xml)?;
        let cascade = parse_cascade(doc.root_element())?;
        Ok(Self { cascade, params })
    }

    pub fn stage_count(&self) -> usize {
        self.cascade.stages.len()
    }

    pub fn window_size(&self) -> (u32, u32) {
        (self.cascade.window_w as u32, self.cascade.window_h as u32)
    }

    pub fn params(&self) -> &DetectorParams {
        &self.params
    }

    /// Scan every pyramid level and collect raw (ungrouped) hits.
    fn scan(&self, gray: &GrayImage) -> Vec<Rect> {
        let (img_w, img_h) = (gray.width() as f64, gray.height() as f64);
        let (win_w, win_h) = (self.cascade.window_w, self.cascade.window_h);
        let max_size = if self.params.max_size > 0 {
            self.params.max_size as f64
        } else {
            img_w.max(img_h)
        };
        let min_size = self.params.min_size as f64;

        let mut hits = Vec::new();
        let mut factor = 1.0f64;
        loop {
            let scaled_w = (img_w / factor).round() as usize;
            let scaled_h = (img_h / factor).round() as usize;
            if scaled_w <= win_w || scaled_h <= win_h {
                break;
            }
            let window_w = (win_w as f64 * factor).round();
            let window_h = (win_h as f64 * factor).round();
            if window_w > max_size || window_h > max_size {
                break;
            }
            if window_w >= min_size && window_h >= min_size {
                let level = if factor == 1.0 {
                    None
                } else {
                    Some(resize_bilinear(gray, scaled_w, scaled_h))
                };
                let ii = Integral::new(level.as_ref().unwrap_or(gray));
                let step = if factor > 2.0 { 1 } else { 2 };

                let mut y = 0;
                while y + win_h <= scaled_h {
                    let mut x = 0;
                    while x + win_w <= scaled_w {
                        match self.cascade.eval_window(&ii, x, y) {
                            WindowResult::Face => hits.push(Rect {
                                x: (x as f64 * factor).round() as i64,
                                y: (y as f64 * factor).round() as i64,
                                w: window_w as i64,
                                h: window_h as i64,
                            }),
                            // Nothing face-like here; skip the neighbouring position too.
                            WindowResult::Rejected(0) => x += step,
                            WindowResult::Rejected(_) => {}
                        }
                        x += step;
                    }
                    y += step;
                }
            }
            factor *= self.params.scale_factor;
        }

        tracing::trace!(hits = hits.len(), "cascade scan complete");
        hits
    }
}

impl FaceDetector for CascadeDetector {
    fn detect(&self, gray: &GrayImage) -> Vec<BoundingBox> {
        let hits = self.scan(gray);
        let mut faces = group_rectangles(&hits, self.params.min_neighbors, GROUP_EPS);
        faces.sort_by_key(|b| (b.y, b.x));
        faces
    }
}

/// Child element by tag name.
fn child<'a, 'input>(node: Node<'a, 'input>, name: &str) -> Option<Node<'a, 'input>> {
    node.children()
        .find(|n| n.is_element() && n.tag_name().name() == name)
}

/// Element children (the `<_>` entries of an OpenCV sequence).
fn items<'a, 'input>(node: Node<'a, 'input>) -> impl Iterator<Item = Node<'a, 'input>> {
    node.children().filter(|n| n.is_element())
}

fn required<'a, 'input>(
    node: Node<'a, 'input>,
    name: &str,
) -> Result<Node<'a, 'input>, DetectorError> {
    child(node, name).ok_or_else(|| DetectorError::InvalidCascade(format!("missing <{name}>")))
}

fn text_of<'a>(node: Node<'a, '_>) -> &'a str {
    node.text().unwrap_or("").trim()
}

fn parse_field<T: FromStr>(node: Node<'_, '_>, name: &str) -> Result<T, DetectorError> {
    let text = text_of(required(node, name)?);
    text.parse()
        .map_err(|_| DetectorError::InvalidCascade(format!("<{name}> is not a number: {text:?}")))
}

fn parse_numbers<T: FromStr>(text: &str, what: &str) -> Result<Vec<T>, DetectorError> {
    text.split_whitespace()
        .map(|tok| {
            tok.parse()
                .map_err(|_| DetectorError::InvalidCascade(format!("bad number {tok:?} in {what}")))
        })
        .collect()
}

fn parse_cascade(root: Node<'_, '_>) -> Result<Cascade, DetectorError> {
    let node = items(root)
        .find(|n| n.attribute("type_id") == Some("opencv-cascade-classifier"))
        .or_else(|| child(root, "cascade"))
        .ok_or_else(|| {
            DetectorError::Unsupported(
                "no opencv-cascade-classifier node (old-style haar cascades are not supported)"
                    .into(),
            )
        })?;

    let stage_type = text_of(required(node, "stageType")?);
    if stage_type != "BOOST" {
        return Err(DetectorError::Unsupported(format!("stage type {stage_type}")));
    }
    let feature_type = text_of(required(node, "featureType")?);
    if feature_type != "HAAR" {
        return Err(DetectorError::Unsupported(format!("feature type {feature_type}")));
    }

    let window_w: usize = parse_field(node, "width")?;
    let window_h: usize = parse_field(node, "height")?;
    if window_w < 3 || window_h < 3 {
        return Err(DetectorError::InvalidCascade(format!(
            "window {window_w}x{window_h} too small"
        )));
    }

    let features = items(required(node, "features")?)
        .enumerate()
        .map(|(i, f)| parse_feature(f, i, window_w, window_h))
        .collect::<Result<Vec<_>, _>>()?;

    let stages = items(required(node, "stages")?)
        .enumerate()
        .map(|(i, s)| parse_stage(s, i, features.len()))
        .collect::<Result<Vec<_>, _>>()?;
    if stages.is_empty() {
        return Err(DetectorError::InvalidCascade("cascade has no stages".into()));
    }

    Ok(Cascade {
        window_w,
        window_h,
        stages,
        features,
    })
}

fn parse_feature(
    node: Node<'_, '_>,
    index: usize,
    window_w: usize,
    window_h: usize,
) -> Result<HaarFeature, DetectorError> {
    if let Some(tilted) = child(node, "tilted") {
        if text_of(tilted) != "0" {
            return Err(DetectorError::Unsupported(format!(
                "feature {index} is tilted (extended Haar set)"
            )));
        }
    }

    let rects = items(required(node, "rects")?)
        .map(|r| {
            let v: Vec<f64> = parse_numbers(text_of(r), "feature rect")?;
            let [x, y, w, h, weight] = v[..] else {
                return Err(DetectorError::InvalidCascade(format!(
                    "feature {index}: rect needs 5 values, got {}",
                    v.len()
                )));
            };
            if x < 0.0 || y < 0.0 || w < 0.0 || h < 0.0 {
                return Err(DetectorError::InvalidCascade(format!(
                    "feature {index}: negative rect"
                )));
            }
            let rect = WeightedRect {
                x: x as usize,
                y: y as usize,
                w: w as usize,
                h: h as usize,
                weight,
            };
            if rect.x + rect.w > window_w || rect.y + rect.h > window_h {
                return Err(DetectorError::InvalidCascade(format!(
                    "feature {index}: rect outside the {window_w}x{window_h} window"
                )));
            }
            Ok(rect)
        })
        .collect::<Result<Vec<_>, _>>()?;

    if rects.is_empty() || rects.len() > MAX_FEATURE_RECTS {
        return Err(DetectorError::InvalidCascade(format!(
            "feature {index}: {} rects",
            rects.len()
        )));
    }
    Ok(HaarFeature { rects })
}

fn parse_stage(
    node: Node<'_, '_>,
    index: usize,
    n_features: usize,
) -> Result<Stage, DetectorError> {
    let threshold: f64 = parse_field(node, "stageThreshold")?;
    let classifiers = items(required(node, "weakClassifiers")?)
        .map(|wc| parse_weak_classifier(wc, index, n_features))
        .collect::<Result<Vec<_>, _>>()?;
    Ok(Stage {
        threshold,
        classifiers,
    })
}

fn parse_weak_classifier(
    node: Node<'_, '_>,
    stage: usize,
    n_features: usize,
) -> Result<WeakClassifier, DetectorError> {
    let raw: Vec<f64> = parse_numbers(text_of(required(node, "internalNodes")?), "internalNodes")?;
    let leaves: Vec<f64> = parse_numbers(text_of(required(node, "leafValues")?), "leafValues")?;

    if raw.is_empty() || raw.len() % 4 != 0 {
        return Err(DetectorError::InvalidCascade(format!(
            "stage {stage}: internalNodes must be groups of 4, got {}",
            raw.len()
        )));
    }

    let nodes: Vec<TreeNode> = raw
        .chunks_exact(4)
        .map(|c| TreeNode {
            left: c[0] as i32,
            right: c[1] as i32,
            feature: c[2] as usize,
            threshold: c[3],
        })
        .collect();

    // Every branch must land on a leaf or a later node; evaluation indexes
    // unchecked and walks forward until it reaches a leaf.
    let valid_child = |at: usize, idx: i32| {
        if idx > 0 {
            (idx as usize) > at && (idx as usize) < nodes.len()
        } else {
            ((-idx) as usize) < leaves.len()
        }
    };
    for (at, node) in nodes.iter().enumerate() {
        if node.feature >= n_features || !valid_child(at, node.left) || !valid_child(at, node.right)
        {
            return Err(DetectorError::InvalidCascade(format!(
                "stage {stage}: tree node references out of range"
            )));
        }
    }

    Ok(WeakClassifier { nodes, leaves })
}

/// Bilinear resize of a grayscale image (pixel-centre aligned).
fn resize_bilinear(src: &GrayImage, new_w: usize, new_h: usize) -> GrayImage {
    let (width, height) = (src.width() as usize, src.height() as usize);
    let frame = src.as_raw();
    let scale_x = width as f32 / new_w as f32;
    let scale_y = height as f32 / new_h as f32;

    let mut resized = vec![0u8; new_w * new_h];
    for y in 0..new_h {
        let src_y = (y as f32 + 0.5) * scale_y - 0.5;
        let y0 = (src_y.floor() as i32).clamp(0, height as i32 - 1) as usize;
        let y1 = (y0 + 1).min(height - 1);
        let fy = (src_y - src_y.floor()).clamp(0.0, 1.0);

        for x in 0..new_w {
            let src_x = (x as f32 + 0.5) * scale_x - 0.5;
            let x0 = (src_x.floor() as i32).clamp(0, width as i32 - 1) as usize;
            let x1 = (x0 + 1).min(width - 1);
            let fx = (src_x - src_x.floor()).clamp(0.0, 1.0);

            let tl = frame[y0 * width + x0] as f32;
            let tr = frame[y0 * width + x1] as f32;
            let bl = frame[y1 * width + x0] as f32;
            let br = frame[y1 * width + x1] as f32;

            let val = tl * (1.0 - fx) * (1.0 - fy)
                + tr * fx * (1.0 - fy)
                + bl * (1.0 - fx) * fy
                + br * fx * fy;

            resized[y * new_w + x] = val.round().clamp(0.0, 255.0) as u8;
        }
    }

    GrayImage::from_raw(new_w as u32, new_h as u32, resized).unwrap_or_default()
}

fn similar(a: &Rect, b: &Rect, eps: f64) -> bool {
    let delta = eps * (a.w.min(b.w) + a.h.min(b.h)) as f64 * 0.5;
    ((a.x - b.x).abs() as f64) <= delta
        && ((a.y - b.y).abs() as f64) <= delta
        && ((a.x + a.w - b.x - b.w).abs() as f64) <= delta
        && ((a.y + a.h - b.y - b.h).abs() as f64) <= delta
}

/// Equivalence classes under `similar`, labelled in order of first appearance.
fn partition(rects: &[Rect], eps: f64) -> (Vec<usize>, usize) {
    let mut parent: Vec<usize> = (0..rects.len()).collect();

    fn find(parent: &mut [usize], mut i: usize) -> usize {
        while parent[i] != i {
            parent[i] = parent[parent[i]];
            i = parent[i];
        }
        i
    }

    for i in 0..rects.len() {
        for j in (i + 1)..rects.len() {
            if similar(&rects[i], &rects[j], eps) {
                let (ri, rj) = (find(&mut parent, i), find(&mut parent, j));
                if ri != rj {
                    parent[rj] = ri;
                }
            }
        }
    }

    let mut root_label = vec![usize::MAX; rects.len()];
    let mut labels = Vec::with_capacity(rects.len());
    let mut n_classes = 0;
    for i in 0..rects.len() {
        let root = find(&mut parent, i);
        if root_label[root] == usize::MAX {
            root_label[root] = n_classes;
            n_classes += 1;
        }
        labels.push(root_label[root]);
    }
    (labels, n_classes)
}

/// Cluster raw hits, average each cluster, and keep clusters with more than
/// `group_threshold` members that are not nested inside a better-supported one.
fn group_rectangles(rects: &[Rect], group_threshold: u32, eps: f64) -> Vec<BoundingBox> {
    let to_box = |r: &Rect, n: u32| BoundingBox {
        x: r.x.max(0) as u32,
        y: r.y.max(0) as u32,
        width: r.w.max(0) as u32,
        height: r.h.max(0) as u32,
        neighbors: n,
    };

    if group_threshold == 0 || rects.is_empty() {
        return rects.iter().map(|r| to_box(r, 0)).collect();
    }

    let (labels, n_classes) = partition(rects, eps);
    let mut sums = vec![[0i64; 4]; n_classes];
    let mut counts = vec![0u32; n_classes];
    for (r, &label) in rects.iter().zip(&labels) {
        let s = &mut sums[label];
        s[0] += r.x;
        s[1] += r.y;
        s[2] += r.w;
        s[3] += r.h;
        counts[label] += 1;
    }

    let averaged: Vec<Rect> = sums
        .iter()
        .zip(&counts)
        .map(|(s, &n)| {
            let avg = |v: i64| (v as f64 / n as f64).round() as i64;
            Rect {
                x: avg(s[0]),
                y: avg(s[1]),
                w: avg(s[2]),
                h: avg(s[3]),
            }
        })
        .collect();

    let mut out = Vec::new();
    for i in 0..n_classes {
        let n1 = counts[i];
        if n1 <= group_threshold {
            continue;
        }
        let r1 = averaged[i];
        let nested = (0..n_classes).any(|j| {
            let n2 = counts[j];
            if j == i || n2 <= group_threshold {
                return false;
            }
            let r2 = averaged[j];
            let dx = (r2.w as f64 * eps).round() as i64;
            let dy = (r2.h as f64 * eps).round() as i64;
            r1.x >= r2.x - dx
                && r1.y >= r2.y - dy
                && r1.x + r1.w <= r2.x + r2.w + dx
                && r1.y + r1.h <= r2.y + r2.h + dy
                && (n2 > n1.max(3) || n1 < 3)
        });
        if !nested {
            out.push(to_box(&r1, n1));
        }
    }
    out
}
