//! Model-free fallback face detection.
//!
//! Simple mode assumes a portrait framing and returns a fixed upper-center
//! region. Advanced mode slides a square window over an image pyramid and
//! scores each window from Haar-like intensity contrasts, skin-colour ratio
//! and a few coarse facial-pattern checks, all evaluated in O(1) per window
//! through integral images.

use crate::backend::InferenceError;
use crate::detector::{DetectorKind, FaceDetector};
use crate::geometry::{nms, Rect};
use crate::raster::ImageBuffer;
use crate::types::FaceBox;
use serde::{Deserialize, Serialize};

const CLASSIFIER_WEIGHT: f32 = 0.5;
const SKIN_WEIGHT: f32 = 0.3;
const PATTERN_WEIGHT: f32 = 0.2;

/// Feature response (in window standard deviations) that saturates a Haar score.
const HAAR_FULL_RESPONSE: f32 = 0.5;
/// Windows flatter than this (gray-level std) carry no structure to classify.
const MIN_WINDOW_STD: f32 = 4.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HeuristicMode {
    Simple,
    #[default]
    Advanced,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HeuristicConfig {
    pub mode: HeuristicMode,
    /// Run simple mode when advanced mode finds nothing.
    pub simple_fallback: bool,
    /// Inclusive width/height range treated as portrait framing.
    pub portrait_min_aspect: f32,
    pub portrait_max_aspect: f32,
    pub region_width_fraction: f32,
    pub region_height_fraction: f32,
    pub region_top_fraction: f32,
    pub simple_confidence: f32,
    pub min_window: u32,
    pub window_scale_step: f32,
    /// Sliding step as a fraction of the window side.
    pub step_fraction: f32,
    pub detection_threshold: f32,
    /// IoU above which overlapping windows are suppressed, as in the cascade.
    pub nms_threshold: f32,
    pub max_detections: usize,
    /// Skin ratio at which the skin score saturates.
    pub skin_target_ratio: f32,
}

impl Default for HeuristicConfig {
    fn default() -> Self {
        Self {
            mode: HeuristicMode::Advanced,
            simple_fallback: true,
            portrait_min_aspect: 0.5,
            portrait_max_aspect: 1.0,
            region_width_fraction: 0.6,
            region_height_fraction: 0.7,
            region_top_fraction: 0.1,
            simple_confidence: 0.8,
            min_window: 24,
            window_scale_step: 1.25,
            step_fraction: 0.1,
            detection_threshold: 0.5,
            nms_threshold: 0.5,
            max_detections: 10,
            skin_target_ratio: 0.4,
        }
    }
}

/// Classic RGB skin rule.
pub fn is_skin([r, g, b]: [u8; 3]) -> bool {
    let (r, g, b) = (r as i32, g as i32, b as i32);
    r > 95 && g > 40 && b > 20 && r > g && g >= b && r - g > 15 && r - b > 15
}

/// Summed-area table with a zero top row and left column.
pub struct IntegralImage {
    width: usize,
    sums: Vec<u64>,
}

impl IntegralImage {
    pub fn new(width: usize, height: usize, values: impl IntoIterator<Item = u64>) -> Self {
        let stride = width + 1;
        let mut sums = vec![0u64; stride * (height + 1)];
        let mut values = values.into_iter();
        for y in 0..height {
            let mut row_sum = 0u64;
            for x in 0..width {
                row_sum += values.next().unwrap_or(0);
                let idx = (y + 1) * stride + (x + 1);
                sums[idx] = sums[idx - stride] + row_sum;
            }
        }
        Self { width, sums }
    }

    /// Sum over `[x0, x1) x [y0, y1)`.
    pub fn sum(&self, x0: usize, y0: usize, x1: usize, y1: usize) -> u64 {
        let stride = self.width + 1;
        self.sums[y1 * stride + x1] + self.sums[y0 * stride + x0]
            - self.sums[y1 * stride + x0]
            - self.sums[y0 * stride + x1]
    }
}

/// Integral tables for one image.
struct WindowStats {
    gray: IntegralImage,
    gray_sq: IntegralImage,
    skin: IntegralImage,
}

/// A square window being scored, with helpers for fractional sub-regions.
struct Window<'a> {
    stats: &'a WindowStats,
    x: usize,
    y: usize,
    side: usize,
}

impl Window<'_> {
    fn bounds(&self, fx0: f32, fy0: f32, fx1: f32, fy1: f32) -> (usize, usize, usize, usize) {
        let s = self.side as f32;
        let x0 = self.x + (fx0 * s) as usize;
        let y0 = self.y + (fy0 * s) as usize;
        let x1 = (self.x + (fx1 * s) as usize).max(x0 + 1);
        let y1 = (self.y + (fy1 * s) as usize).max(y0 + 1);
        (x0, y0, x1, y1)
    }

    /// Mean gray level of a sub-region given in window fractions.
    fn mean(&self, fx0: f32, fy0: f32, fx1: f32, fy1: f32) -> f32 {
        let (x0, y0, x1, y1) = self.bounds(fx0, fy0, fx1, fy1);
        let area = ((x1 - x0) * (y1 - y0)) as f32;
        self.stats.gray.sum(x0, y0, x1, y1) as f32 / area
    }

    fn std(&self) -> f32 {
        let (x0, y0, x1, y1) = (self.x, self.y, self.x + self.side, self.y + self.side);
        let n = (self.side * self.side) as f64;
        let mean = self.stats.gray.sum(x0, y0, x1, y1) as f64 / n;
        let mean_sq = self.stats.gray_sq.sum(x0, y0, x1, y1) as f64 / n;
        (mean_sq - mean * mean).max(0.0).sqrt() as f32
    }

    fn skin_ratio(&self) -> f32 {
        let (x0, y0, x1, y1) = (self.x, self.y, self.x + self.side, self.y + self.side);
        self.stats.skin.sum(x0, y0, x1, y1) as f32 / (self.side * self.side) as f32
    }
}

/// Per-window score components.
#[derive(Debug, Clone, Copy)]
struct WindowScore {
    classifier: f32,
    skin: f32,
    pattern: f32,
}

impl WindowScore {
    fn combined(&self) -> f32 {
        CLASSIFIER_WEIGHT * self.classifier + SKIN_WEIGHT * self.skin + PATTERN_WEIGHT * self.pattern
    }
}

fn saturate(response: f32) -> f32 {
    (response / HAAR_FULL_RESPONSE).clamp(0.0, 1.0)
}

fn score_window(window: &Window<'_>, skin_target: f32) -> WindowScore {
    let forehead = window.mean(0.10, 0.05, 0.90, 0.20);
    let eyes = window.mean(0.10, 0.20, 0.90, 0.45);
    let left_eye = window.mean(0.10, 0.20, 0.45, 0.45);
    let right_eye = window.mean(0.55, 0.20, 0.90, 0.45);
    let nose = window.mean(0.40, 0.20, 0.60, 0.45);
    let cheeks = window.mean(0.10, 0.45, 0.90, 0.70);
    let left_half = window.mean(0.0, 0.0, 0.5, 1.0);
    let right_half = window.mean(0.5, 0.0, 1.0, 1.0);
    let std = window.std();

    let classifier = if std < MIN_WINDOW_STD {
        0.0
    } else {
        // Two-rectangle edge (cheeks vs eye band), three-rectangle line
        // (nose bridge vs eyes) and forehead vs eye band.
        let edge = (cheeks - eyes) / std;
        let line = (nose - (left_eye + right_eye) / 2.0) / std;
        let brow = (forehead - eyes) / std;
        (saturate(edge) + saturate(line) + saturate(brow)) / 3.0
    };

    let skin = if skin_target > 0.0 {
        (window.skin_ratio() / skin_target).clamp(0.0, 1.0)
    } else {
        0.0
    };

    let eyes_darker = eyes < cheeks;
    let nose_brighter = nose > (left_eye + right_eye) / 2.0;
    let symmetric = (left_half - right_half).abs() < 0.5 * std.max(MIN_WINDOW_STD);
    let pattern = [eyes_darker, nose_brighter, symmetric]
        .iter()
        .filter(|&&ok| ok)
        .count() as f32
        / 3.0;

    WindowScore {
        classifier,
        skin,
        pattern,
    }
}

/// Pure-CPU fallback detector; needs no model weights.
pub struct HeuristicDetector {
    mode: HeuristicMode,
    config: HeuristicConfig,
}

impl HeuristicDetector {
    pub fn new(mode: HeuristicMode, config: HeuristicConfig) -> Self {
        Self { mode, config }
    }

    pub fn mode(&self) -> HeuristicMode {
        self.mode
    }

    pub fn detect_faces(&self, image: &ImageBuffer) -> Vec<FaceBox> {
        match self.mode {
            HeuristicMode::Simple => self.detect_simple(image),
            HeuristicMode::Advanced => self.detect_advanced(image),
        }
    }

    fn detect_simple(&self, image: &ImageBuffer) -> Vec<FaceBox> {
        let cfg = &self.config;
        let (w, h) = (image.width() as f32, image.height() as f32);
        let aspect = w / h;
        if aspect < cfg.portrait_min_aspect || aspect > cfg.portrait_max_aspect {
            tracing::debug!(aspect, "simple heuristic: not a portrait framing");
            return Vec::new();
        }
        let fw = w * cfg.region_width_fraction;
        let fh = h * cfg.region_height_fraction;
        let region = Rect::new((w - fw) / 2.0, h * cfg.region_top_fraction, fw, fh);
        match region.clamp_to(w, h) {
            Some(r) => vec![FaceBox::new(r, cfg.simple_confidence)],
            None => Vec::new(),
        }
    }

    fn detect_advanced(&self, image: &ImageBuffer) -> Vec<FaceBox> {
        let cfg = &self.config;
        let (w, h) = (image.width() as usize, image.height() as usize);
        let gray = image.to_gray();
        let stats = WindowStats {
            gray: IntegralImage::new(w, h, gray.iter().map(|&g| g as u64)),
            gray_sq: IntegralImage::new(w, h, gray.iter().map(|&g| (g as u64) * (g as u64))),
            skin: IntegralImage::new(w, h, image.pixels().chunks_exact(3).map(|p| is_skin([p[0], p[1], p[2]]) as u64)),
        };

        let mut candidates = Vec::new();
        let max_side = w.min(h);
        let mut side_f = cfg.min_window.max(8) as f32;
        let growth = cfg.window_scale_step.max(1.05);

        while (side_f as usize) <= max_side {
            let side = side_f as usize;
            let step = ((side as f32 * cfg.step_fraction).round() as usize).max(1);
            let mut y = 0;
            while y + side <= h {
                let mut x = 0;
                while x + side <= w {
                    let window = Window {
                        stats: &stats,
                        x,
                        y,
                        side,
                    };
                    let score = score_window(&window, cfg.skin_target_ratio);
                    let combined = score.combined();
                    if combined > cfg.detection_threshold {
                        candidates.push(FaceBox::new(
                            Rect::new(x as f32, y as f32, side as f32, side as f32),
                            combined.min(1.0),
                        ));
                    }
                    x += step;
                }
                y += step;
            }
            side_f *= growth;
        }

        // Among equally scored windows, keep the largest one explaining the pattern.
        candidates.sort_by(|a, b| b.area().partial_cmp(&a.area()).unwrap_or(std::cmp::Ordering::Equal));
        let mut faces = nms(candidates, cfg.nms_threshold);
        faces.truncate(cfg.max_detections);
        tracing::debug!(count = faces.len(), "advanced heuristic detections");
        faces
    }
}

impl FaceDetector for HeuristicDetector {
    fn kind(&self) -> DetectorKind {
        match self.mode {
            HeuristicMode::Simple => DetectorKind::HeuristicSimple,
            HeuristicMode::Advanced => DetectorKind::HeuristicAdvanced,
        }
    }

    fn detect(&self, image: &ImageBuffer) -> Result<Vec<FaceBox>, InferenceError> {
        Ok(self.detect_faces(image))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SKIN: [u8; 3] = [220, 170, 140];
    const NOSE: [u8; 3] = [240, 190, 160];
    const EYE: [u8; 3] = [60, 40, 30];
    const BACKGROUND: [u8; 3] = [40, 60, 90];

    /// 320x240 frame with a 120x120 synthetic face at (100, 60).
    fn synthetic_face() -> (ImageBuffer, Rect) {
        let face = Rect::new(100.0, 60.0, 120.0, 120.0);
        let img = ImageBuffer::from_fn(320, 240, |x, y| {
            let (x, y) = (x as f32, y as f32);
            let inside = x >= face.x && x < face.right() && y >= face.y && y < face.bottom();
            if !inside {
                return BACKGROUND;
            }
            let (u, v) = ((x - face.x) / face.width, (y - face.y) / face.height);
            let in_eye_rows = (0.25..0.40).contains(&v);
            if in_eye_rows && ((0.18..0.40).contains(&u) || (0.60..0.82).contains(&u)) {
                EYE
            } else if (0.4167..0.5833).contains(&u) && (0.20..0.75).contains(&v) {
                NOSE
            } else {
                SKIN
            }
        })
        .unwrap();
        (img, face)
    }

    #[test]
    fn test_skin_rule() {
        assert!(is_skin(SKIN));
        assert!(is_skin(NOSE));
        assert!(!is_skin(EYE));
        assert!(!is_skin(BACKGROUND));
        assert!(!is_skin([255, 0, 0]));
        assert!(!is_skin([128, 128, 128]));
    }

    #[test]
    fn test_integral_sum_matches_brute_force() {
        let (w, h) = (7usize, 5usize);
        let values: Vec<u64> = (0..(w * h) as u64).map(|v| (v * 13) % 17).collect();
        let ii = IntegralImage::new(w, h, values.iter().copied());
        for (x0, y0, x1, y1) in [(0, 0, 7, 5), (1, 1, 4, 3), (6, 4, 7, 5), (2, 0, 3, 5)] {
            let brute: u64 = (y0..y1).flat_map(|y| (x0..x1).map(move |x| (x, y))).map(|(x, y)| values[y * w + x]).sum();
            assert_eq!(ii.sum(x0, y0, x1, y1), brute);
        }
    }

    #[test]
    fn test_simple_mode_portrait_region() {
        let det = HeuristicDetector::new(HeuristicMode::Simple, HeuristicConfig::default());
        let img = ImageBuffer::filled(480, 640, [10, 10, 10]).unwrap();
        let faces = det.detect_faces(&img);
        assert_eq!(faces.len(), 1);
        let f = &faces[0];
        assert!((f.confidence - 0.8).abs() < 1e-6);
        assert!((f.width - 288.0).abs() < 1e-3);
        assert!((f.height - 448.0).abs() < 1e-3);
        assert!((f.x - 96.0).abs() < 1e-3);
        assert!((f.y - 64.0).abs() < 1e-3);
    }

    #[test]
    fn test_simple_mode_rejects_landscape() {
        let det = HeuristicDetector::new(HeuristicMode::Simple, HeuristicConfig::default());
        let img = ImageBuffer::filled(640, 480, [10, 10, 10]).unwrap();
        assert!(det.detect_faces(&img).is_empty());
    }

    #[test]
    fn test_advanced_finds_synthetic_face() {
        let (img, truth) = synthetic_face();
        let det = HeuristicDetector::new(HeuristicMode::Advanced, HeuristicConfig::default());
        let faces = det.detect_faces(&img);
        assert!(!faces.is_empty(), "expected a detection");
        assert!(faces.iter().all(|f| f.confidence > 0.5));
        let best = &faces[0];
        let c = best.rect().center();
        assert!(
            c.x > truth.x && c.x < truth.right() && c.y > truth.y && c.y < truth.bottom(),
            "best detection {best:?} is not centered on the face"
        );
        assert!(best.rect().iou(&truth) > 0.1);
    }

    #[test]
    fn test_advanced_ignores_flat_background() {
        let det = HeuristicDetector::new(HeuristicMode::Advanced, HeuristicConfig::default());
        let img = ImageBuffer::filled(200, 200, BACKGROUND).unwrap();
        assert!(det.detect_faces(&img).is_empty());
    }

    #[test]
    fn test_advanced_ignores_flat_skin() {
        // Skin colour alone is not a face.
        let det = HeuristicDetector::new(HeuristicMode::Advanced, HeuristicConfig::default());
        let img = ImageBuffer::filled(100, 100, SKIN).unwrap();
        assert!(det.detect_faces(&img).is_empty());
    }

    #[test]
    fn test_window_score_weights() {
        let s = WindowScore {
            classifier: 1.0,
            skin: 1.0,
            pattern: 1.0,
        };
        assert!((s.combined() - 1.0).abs() < 1e-6);
        let s = WindowScore {
            classifier: 0.0,
            skin: 1.0,
            pattern: 0.0,
        };
        assert!((s.combined() - 0.3).abs() < 1e-6);
    }

    #[test]
    fn test_nms_applied_to_detections() {
        let (img, _) = synthetic_face();
        let cfg = HeuristicConfig::default();
        let det = HeuristicDetector::new(HeuristicMode::Advanced, cfg.clone());
        let faces = det.detect_faces(&img);
        for (i, a) in faces.iter().enumerate() {
            for b in &faces[i + 1..] {
                assert!(a.rect().iou(&b.rect()) <= cfg.nms_threshold);
            }
        }
    }

    #[test]
    fn test_nms_threshold_matches_cascade_proposal() {
        let cascade = crate::cascade::CascadeConfig::default();
        assert_eq!(HeuristicConfig::default().nms_threshold, cascade.proposal_nms);
        assert_eq!(HeuristicConfig::default().nms_threshold, 0.5);
    }
}
