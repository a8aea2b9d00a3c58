//! Per-frame detect → recognize → log → annotate.

use chrono::Local;
use facelog_core::{AcceptanceWindow, BoundingBox, FaceDetector, FaceRecognizer, Prediction};
use facelog_hw::frame::rgb_to_gray;
use facelog_store::{RecordPolicy, Store};
use font8x8::{UnicodeFonts, BASIC_FONTS, LATIN_FONTS};
use image::{Rgb, RgbImage};
use imageproc::drawing::draw_hollow_rect_mut;
use imageproc::rect::Rect;
use std::sync::Arc;

const BOX_COLOR: Rgb<u8> = Rgb([0, 0, 255]);
const BOX_THICKNESS: u32 = 2;
const LABEL_COLOR: Rgb<u8> = Rgb([0, 255, 150]);
const GLYPH_SIZE: u32 = 8;
const LABEL_SCALE: u32 = 2;
/// Label baseline offset from the box's bottom-left corner.
const LABEL_OFFSET: (i64, i64) = (2, -5);

/// What happened to one detected face.
#[derive(Debug, Clone, PartialEq)]
pub struct FaceOutcome {
    pub bbox: BoundingBox,
    /// `None` when the recognizer rejected the crop.
    pub prediction: Option<Prediction>,
    /// Name drawn on the frame, if the face was accepted and known.
    pub label: Option<String>,
    /// Whether a detection row was written for this face.
    pub recorded: bool,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct FrameReport {
    pub faces: Vec<FaceOutcome>,
}

impl FrameReport {
    pub fn recorded(&self) -> usize {
        self.faces.iter().filter(|f| f.recorded).count()
    }
}

/// Runs detection and recognition on frames of one streaming session.
pub struct FrameProcessor {
    detector: Arc<dyn FaceDetector>,
    recognizer: Arc<dyn FaceRecognizer>,
    store: Store,
    acceptance: AcceptanceWindow,
    policy: Box<dyn RecordPolicy>,
}

impl FrameProcessor {
    pub fn new(
        detector: Arc<dyn FaceDetector>,
        recognizer: Arc<dyn FaceRecognizer>,
        store: Store,
        acceptance: AcceptanceWindow,
        policy: Box<dyn RecordPolicy>,
    ) -> Self {
        Self {
            detector,
            recognizer,
            store,
            acceptance,
            policy,
        }
    }

    /// Annotate `image` in place and log accepted, known identities.
    ///
    /// Every detected face gets a rectangle. Failures for one face (bad crop,
    /// storage error) are logged and never abort the frame.
    pub fn process(&mut self, image: &mut RgbImage) -> FrameReport {
        let gray = rgb_to_gray(image);
        let (width, height) = gray.dimensions();
        let mut report = FrameReport::default();

        for detected in self.detector.detect(&gray) {
            let Some(bbox) = detected.clamp_to(width, height) else {
                continue;
            };
            draw_box(image, &bbox);

            let crop = image::imageops::crop_imm(&gray, bbox.x, bbox.y, bbox.width, bbox.height)
                .to_image();
            let prediction = match self.recognizer.predict(&crop) {
                Ok(p) => p,
                Err(e) => {
                    tracing::warn!(?bbox, error = %e, "recognition failed for face");
                    report.faces.push(FaceOutcome {
                        bbox,
                        prediction: None,
                        label: None,
                        recorded: false,
                    });
                    continue;
                }
            };

            let mut outcome = FaceOutcome {
                bbox,
                prediction: Some(prediction),
                label: None,
                recorded: false,
            };

            match self.acceptance.accept(&prediction) {
                Some(identity) => {
                    if let Some(name) = self.lookup(identity) {
                        outcome.recorded = self.record(identity);
                        draw_label(image, &bbox, &name);
                        outcome.label = Some(name);
                    }
                }
                None => tracing::debug!(
                    identity = ?prediction.identity,
                    distance = prediction.distance,
                    "prediction outside acceptance window"
                ),
            }
            report.faces.push(outcome);
        }
        report
    }

    fn lookup(&self, identity: i64) -> Option<String> {
        match self.store.identity_name(identity) {
            Ok(Some(name)) => Some(name),
            Ok(None) => {
                tracing::warn!(identity, "model label has no users row; event not logged");
                None
            }
            Err(e) => {
                tracing::warn!(identity, error = %e, "identity lookup failed");
                None
            }
        }
    }

    fn record(&mut self, identity: i64) -> bool {
        let now = Local::now();
        if !self.policy.should_record(identity, now) {
            tracing::debug!(identity, "match suppressed by record policy");
            return false;
        }
        match self.store.record(identity, now) {
            Ok(_) => true,
            Err(e) => {
                tracing::warn!(identity, error = %e, "failed to record detection");
                false
            }
        }
    }
}

fn draw_box(image: &mut RgbImage, bbox: &BoundingBox) {
    for inset in 0..BOX_THICKNESS {
        let (w, h) = (
            bbox.width.saturating_sub(2 * inset),
            bbox.height.saturating_sub(2 * inset),
        );
        if w == 0 || h == 0 {
            break;
        }
        let rect = Rect::at((bbox.x + inset) as i32, (bbox.y + inset) as i32).of_size(w, h);
        draw_hollow_rect_mut(image, rect, BOX_COLOR);
    }
}

/// Draw `text` in 8x8 bitmap glyphs with its baseline just inside the box's
/// bottom-left corner. Pixels outside the frame are skipped.
fn draw_label(image: &mut RgbImage, bbox: &BoundingBox, text: &str) {
    let origin_x = bbox.x as i64 + LABEL_OFFSET.0;
    let baseline = (bbox.y + bbox.height) as i64 + LABEL_OFFSET.1;
    let top = baseline - (GLYPH_SIZE * LABEL_SCALE) as i64;
    let advance = (GLYPH_SIZE * LABEL_SCALE) as i64;

    for (i, ch) in text.chars().enumerate() {
        let glyph = BASIC_FONTS
            .get(ch)
            .or_else(|| LATIN_FONTS.get(ch))
            .or_else(|| BASIC_FONTS.get('?'))
            .unwrap_or([0; 8]);
        let left = origin_x + i as i64 * advance;

        for (row, bits) in glyph.iter().enumerate() {
            for col in 0..GLYPH_SIZE as i64 {
                if bits & (1 << col) == 0 {
                    continue;
                }
                for dy in 0..LABEL_SCALE as i64 {
                    for dx in 0..LABEL_SCALE as i64 {
                        let x = left + col * LABEL_SCALE as i64 + dx;
                        let y = top + row as i64 * LABEL_SCALE as i64 + dy;
                        let (Ok(x), Ok(y)) = (u32::try_from(x), u32::try_from(y)) else {
                            continue;
                        };
                        if x < image.width() && y < image.height() {
                            image.put_pixel(x, y, LABEL_COLOR);
                        }
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{FixedDetector, FixedRecognizer};
    use facelog_store::DebounceByIdentity;
    use std::time::Duration;

    struct Fixture {
        _dir: tempfile::TempDir,
        store: Store,
        alice: i64,
    }

    fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(dir.path().join("FaceBase.db")).unwrap();
        let alice = store.add_identity("Alice").unwrap();
        Fixture {
            _dir: dir,
            store,
            alice,
        }
    }

    fn face() -> BoundingBox {
        BoundingBox::new(10, 10, 40, 40)
    }

    fn processor(
        store: &Store,
        faces: Vec<BoundingBox>,
        prediction: Option<Prediction>,
        policy: Box<dyn RecordPolicy>,
    ) -> FrameProcessor {
        FrameProcessor::new(
            Arc::new(FixedDetector(faces)),
            Arc::new(FixedRecognizer::new(prediction)),
            store.clone(),
            AcceptanceWindow::default(),
            policy,
        )
    }

    fn every_match() -> Box<dyn RecordPolicy> {
        Box::new(facelog_store::RecordEveryMatch)
    }

    fn matched(identity: i64, distance: f64) -> Option<Prediction> {
        Some(Prediction {
            identity: Some(identity),
            distance,
        })
    }

    fn frame() -> RgbImage {
        RgbImage::from_pixel(80, 80, Rgb([120, 120, 120]))
    }

    #[test]
    fn test_no_faces_leaves_frame_untouched() {
        let fx = fixture();
        let mut p = processor(&fx.store, vec![], matched(fx.alice, 60.0), every_match());
        let mut image = frame();
        let report = p.process(&mut image);
        assert!(report.faces.is_empty());
        assert_eq!(image, frame());
        assert!(fx.store.recent(10).unwrap().is_empty());
    }

    #[test]
    fn test_accepted_known_face_is_logged_and_labelled() {
        let fx = fixture();
        let mut p = processor(&fx.store, vec![face()], matched(fx.alice, 60.0), every_match());
        let mut image = frame();
        let report = p.process(&mut image);

        assert_eq!(report.faces.len(), 1);
        assert_eq!(report.faces[0].label.as_deref(), Some("Alice"));
        assert!(report.faces[0].recorded);
        assert_eq!(*image.get_pixel(10, 10), BOX_COLOR);
        assert_eq!(*image.get_pixel(11, 11), BOX_COLOR);
        assert!(image.pixels().any(|p| *p == LABEL_COLOR));

        let recent = fx.store.recent(10).unwrap();
        assert_eq!(recent.len(), 1);
        assert_eq!(recent[0].name, "Alice");
    }

    #[test]
    fn test_no_faces_encodes_identically() {
        let fx = fixture();
        let mut p = processor(&fx.store, vec![], None, every_match());
        let mut image = frame();
        p.process(&mut image);
        let expected = crate::stream::encode_jpeg(&frame(), 95).unwrap();
        assert_eq!(crate::stream::encode_jpeg(&image, 95).unwrap(), expected);
    }

    #[test]
    fn test_identity_three_named_alice() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(dir.path().join("FaceBase.db")).unwrap();
        store.add_identity("Carol").unwrap();
        store.add_identity("Dave").unwrap();
        assert_eq!(store.add_identity("Alice").unwrap(), 3);

        let mut p = processor(&store, vec![face()], matched(3, 60.0), every_match());
        let mut image = frame();
        let report = p.process(&mut image);
        assert_eq!(report.recorded(), 1);
        assert_eq!(report.faces[0].label.as_deref(), Some("Alice"));

        // Text sits just above the box's bottom edge (y + h - 5 baseline).
        let label_rows = 10 + 40 - 5 - 16..10 + 40 - 5;
        let text_pixels = label_rows
            .flat_map(|y| (12..80).map(move |x| (x, y)))
            .filter(|&(x, y)| *image.get_pixel(x, y) == LABEL_COLOR)
            .count();
        assert!(text_pixels > 20, "expected label glyphs, found {text_pixels} pixels");
        assert_eq!(store.recent(10).unwrap()[0].name, "Alice");
    }

    #[test]
    fn test_rejected_face_gets_box_only() {
        let fx = fixture();
        let mut p = processor(&fx.store, vec![face()], matched(fx.alice, 90.0), every_match());
        let mut image = frame();
        let report = p.process(&mut image);

        assert_eq!(report.faces[0].label, None);
        assert!(!report.faces[0].recorded);
        assert_eq!(*image.get_pixel(10, 10), BOX_COLOR);
        assert!(!image.pixels().any(|p| *p == LABEL_COLOR));
        assert!(fx.store.recent(10).unwrap().is_empty());
    }

    #[test]
    fn test_untrained_recognizer_never_logs() {
        let fx = fixture();
        let untrained = Some(Prediction::untrained());
        let mut p = processor(&fx.store, vec![face()], untrained, every_match());
        let report = p.process(&mut frame());
        assert!(!report.faces[0].recorded);
        assert!(fx.store.recent(10).unwrap().is_empty());
    }

    #[test]
    fn test_unknown_identity_is_skipped() {
        let fx = fixture();
        let unknown = matched(fx.alice + 40, 60.0);
        let mut p = processor(&fx.store, vec![face()], unknown, every_match());
        let mut image = frame();
        let report = p.process(&mut image);
        assert_eq!(report.faces[0].label, None);
        assert!(!report.faces[0].recorded);
        assert!(!image.pixels().any(|p| *p == LABEL_COLOR));
    }

    #[test]
    fn test_every_frame_is_logged() {
        let fx = fixture();
        let mut p = processor(&fx.store, vec![face()], matched(fx.alice, 50.0), every_match());
        for _ in 0..3 {
            p.process(&mut frame());
        }
        assert_eq!(fx.store.recent(10).unwrap().len(), 3);
    }

    #[test]
    fn test_each_accepted_face_in_a_frame_is_logged() {
        let fx = fixture();
        let faces = vec![face(), BoundingBox::new(50, 10, 25, 25)];
        let mut p = processor(&fx.store, faces, matched(fx.alice, 70.0), every_match());
        let report = p.process(&mut frame());

        assert_eq!(report.faces.len(), 2);
        assert_eq!(report.recorded(), 2);
        let recent = fx.store.recent(10).unwrap();
        assert_eq!(recent.len(), 2);
        assert!(recent.iter().all(|d| d.name == "Alice"));
    }

    #[test]
    fn test_debounce_policy_suppresses_repeats() {
        let fx = fixture();
        let policy = Box::new(DebounceByIdentity::new(Duration::from_secs(3600)));
        let mut p = processor(&fx.store, vec![face()], matched(fx.alice, 50.0), policy);
        let first = p.process(&mut frame());
        let second = p.process(&mut frame());
        assert!(first.faces[0].recorded);
        assert!(!second.faces[0].recorded);
        // Still labelled even when not logged.
        assert_eq!(second.faces[0].label.as_deref(), Some("Alice"));
        assert_eq!(fx.store.recent(10).unwrap().len(), 1);
    }

    #[test]
    fn test_recognizer_error_skips_only_that_face() {
        let fx = fixture();
        let faces = vec![face(), BoundingBox::new(50, 50, 20, 20)];
        let mut p = processor(&fx.store, faces, None, every_match());
        let mut image = frame();
        let report = p.process(&mut image);
        assert_eq!(report.faces.len(), 2);
        assert!(report.faces.iter().all(|f| f.prediction.is_none()));
        assert_eq!(*image.get_pixel(50, 50), BOX_COLOR);
    }

    #[test]
    fn test_storage_failure_does_not_abort_frame() {
        let fx = fixture();
        let mut p = processor(&fx.store, vec![face()], matched(fx.alice, 60.0), every_match());
        let path = fx.store.path().to_path_buf();
        std::fs::remove_file(&path).unwrap();
        std::fs::create_dir(&path).unwrap();

        let mut image = frame();
        let report = p.process(&mut image);
        assert_eq!(report.faces.len(), 1);
        assert!(!report.faces[0].recorded);
        assert_eq!(*image.get_pixel(10, 10), BOX_COLOR);
    }

    #[test]
    fn test_boxes_are_clamped_to_frame() {
        let fx = fixture();
        let faces = vec![BoundingBox::new(70, 70, 40, 40)];
        let mut p = processor(&fx.store, faces, matched(fx.alice, 90.0), every_match());
        let report = p.process(&mut frame());
        assert_eq!(report.faces[0].bbox.width, 10);
    }

    #[test]
    fn test_label_near_top_edge_is_clipped() {
        let mut image = frame();
        draw_label(&mut image, &BoundingBox::new(0, 0, 10, 10), "Bob");
        assert!(image.pixels().any(|p| *p == LABEL_COLOR));
    }
}
