//! Axis-aligned rectangles, points, IoU and non-maximum suppression.

use crate::types::FaceBox;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Point {
    pub x: f32,
    pub y: f32,
}

impl Point {
    pub const fn new(x: f32, y: f32) -> Self {
        Self { x, y }
    }
}

/// Rectangle with its top-left corner at (`x`, `y`).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Rect {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
}

impl Rect {
    pub const fn new(x: f32, y: f32, width: f32, height: f32) -> Self {
        Self { x, y, width, height }
    }

    /// Build from edge coordinates.
    pub fn from_edges(left: f32, top: f32, right: f32, bottom: f32) -> Self {
        Self::new(left, top, right - left, bottom - top)
    }

    pub fn right(&self) -> f32 {
        self.x + self.width
    }

    pub fn bottom(&self) -> f32 {
        self.y + self.height
    }

    pub fn center(&self) -> Point {
        Point::new(self.x + self.width / 2.0, self.y + self.height / 2.0)
    }

    pub fn area(&self) -> f32 {
        self.width.max(0.0) * self.height.max(0.0)
    }

    pub fn is_valid(&self) -> bool {
        self.width > 0.0 && self.height > 0.0 && self.x.is_finite() && self.y.is_finite()
    }

    /// Overlapping region, or `None` when the rectangles do not intersect.
    pub fn intersection(&self, other: &Rect) -> Option<Rect> {
        let left = self.x.max(other.x);
        let top = self.y.max(other.y);
        let right = self.right().min(other.right());
        let bottom = self.bottom().min(other.bottom());
        (right > left && bottom > top).then(|| Rect::from_edges(left, top, right, bottom))
    }

    /// Intersection-over-union in [0, 1]. Degenerate rectangles give 0.
    pub fn iou(&self, other: &Rect) -> f32 {
        let inter_area = self.intersection(other).map_or(0.0, |r| r.area());
        let union_area = self.area() + other.area() - inter_area;
        if union_area > 0.0 {
            inter_area / union_area
        } else {
            0.0
        }
    }

    /// Square of side `max(width, height)` sharing this rectangle's center.
    pub fn to_square(&self) -> Rect {
        let side = self.width.max(self.height);
        let c = self.center();
        Rect::new(c.x - side / 2.0, c.y - side / 2.0, side, side)
    }

    /// Grow each side by `fraction` of the corresponding dimension.
    pub fn pad(&self, fraction: f32) -> Rect {
        let dx = self.width * fraction;
        let dy = self.height * fraction;
        Rect::new(self.x - dx, self.y - dy, self.width + 2.0 * dx, self.height + 2.0 * dy)
    }

    /// Clip to `[0, width) x [0, height)`. `None` if nothing is left.
    pub fn clamp_to(&self, width: f32, height: f32) -> Option<Rect> {
        let left = self.x.max(0.0);
        let top = self.y.max(0.0);
        let right = self.right().min(width);
        let bottom = self.bottom().min(height);
        (right > left && bottom > top).then(|| Rect::from_edges(left, top, right, bottom))
    }

    /// Apply bounding-box regression deltas `[dx1, dy1, dx2, dy2]`,
    /// each expressed as a fraction of this box's width or height.
    pub fn regress(&self, deltas: [f32; 4]) -> Rect {
        let [dx1, dy1, dx2, dy2] = deltas;
        Rect::from_edges(
            self.x + dx1 * self.width,
            self.y + dy1 * self.height,
            self.right() + dx2 * self.width,
            self.bottom() + dy2 * self.height,
        )
    }
}

/// Non-Maximum Suppression: keep the most confident box, drop every other
/// box whose IoU with a kept box exceeds `iou_threshold`.
///
/// Output is sorted by confidence, descending.
pub fn nms(mut detections: Vec<FaceBox>, iou_threshold: f32) -> Vec<FaceBox> {
    detections.sort_by(|a, b| {
        b.confidence
            .partial_cmp(&a.confidence)
            .unwrap_or(std::cmp::Ordering::Equal)
    });

    let mut keep: Vec<FaceBox> = Vec::new();
    let mut suppressed = vec![false; detections.len()];

    for i in 0..detections.len() {
        if suppressed[i] {
            continue;
        }
        let rect_i = detections[i].rect();
        for j in (i + 1)..detections.len() {
            if !suppressed[j] && rect_i.iou(&detections[j].rect()) > iou_threshold {
                suppressed[j] = true;
            }
        }
        keep.push(detections[i].clone());
    }

    keep
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_box(x: f32, y: f32, w: f32, h: f32, conf: f32) -> FaceBox {
        FaceBox::new(Rect::new(x, y, w, h), conf)
    }

    #[test]
    fn test_iou_identical() {
        let a = Rect::new(0.0, 0.0, 100.0, 100.0);
        assert!((a.iou(&a) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_iou_no_overlap() {
        let a = Rect::new(0.0, 0.0, 10.0, 10.0);
        let b = Rect::new(20.0, 20.0, 10.0, 10.0);
        assert!(a.iou(&b).abs() < 1e-6);
    }

    #[test]
    fn test_iou_partial() {
        let a = Rect::new(0.0, 0.0, 10.0, 10.0);
        let b = Rect::new(5.0, 0.0, 10.0, 10.0);
        // Overlap: 5x10 = 50, union: 100+100-50 = 150
        assert!((a.iou(&b) - 50.0 / 150.0).abs() < 1e-6);
        assert!((a.iou(&b) - b.iou(&a)).abs() < 1e-6);
    }

    #[test]
    fn test_iou_degenerate() {
        let a = Rect::new(0.0, 0.0, 0.0, 0.0);
        assert_eq!(a.iou(&a), 0.0);
    }

    #[test]
    fn test_to_square_keeps_center() {
        let r = Rect::new(10.0, 20.0, 40.0, 20.0).to_square();
        assert_eq!(r, Rect::new(10.0, 10.0, 40.0, 40.0));
    }

    #[test]
    fn test_pad_and_clamp() {
        let r = Rect::new(10.0, 10.0, 20.0, 40.0).pad(0.5);
        assert_eq!(r, Rect::new(0.0, -10.0, 40.0, 80.0));
        let c = r.clamp_to(30.0, 50.0).unwrap();
        assert_eq!(c, Rect::new(0.0, 0.0, 30.0, 50.0));
        assert!(Rect::new(40.0, 0.0, 5.0, 5.0).clamp_to(30.0, 30.0).is_none());
    }

    #[test]
    fn test_regress_moves_edges_by_fraction() {
        let r = Rect::new(100.0, 100.0, 50.0, 20.0).regress([0.1, -0.5, 0.2, 0.0]);
        assert!((r.x - 105.0).abs() < 1e-4);
        assert!((r.y - 90.0).abs() < 1e-4);
        assert!((r.right() - 160.0).abs() < 1e-4);
        assert!((r.bottom() - 120.0).abs() < 1e-4);
    }

    #[test]
    fn test_nms_suppresses_overlapping() {
        let detections = vec![
            make_box(5.0, 5.0, 100.0, 100.0, 0.8),
            make_box(0.0, 0.0, 100.0, 100.0, 0.9),
            make_box(200.0, 200.0, 50.0, 50.0, 0.7),
        ];
        let result = nms(detections, 0.4);
        assert_eq!(result.len(), 2);
        assert!((result[0].confidence - 0.9).abs() < 1e-6);
        assert!((result[1].confidence - 0.7).abs() < 1e-6);
    }

    #[test]
    fn test_nms_empty() {
        assert!(nms(vec![], 0.4).is_empty());
    }

    #[test]
    fn test_nms_output_never_overlaps_above_threshold() {
        // Deterministic scatter of overlapping boxes.
        let mut detections = Vec::new();
        for i in 0..60u32 {
            let x = ((i * 37) % 90) as f32;
            let y = ((i * 53) % 70) as f32;
            let side = 20.0 + ((i * 11) % 30) as f32;
            let conf = ((i * 29) % 100) as f32 / 100.0;
            detections.push(make_box(x, y, side, side, conf));
        }

        for threshold in [0.3f32, 0.5, 0.7] {
            let kept = nms(detections.clone(), threshold);
            assert!(!kept.is_empty());
            for (i, a) in kept.iter().enumerate() {
                for b in &kept[i + 1..] {
                    let overlap = a.rect().iou(&b.rect());
                    assert!(overlap <= threshold, "iou {overlap} above {threshold}");
                }
            }
            assert!(kept.windows(2).all(|w| w[0].confidence >= w[1].confidence));
        }
    }
}
