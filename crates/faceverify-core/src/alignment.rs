//! Face alignment via 4-DOF similarity transform.
//!
//! Warps a detected face onto the canonical five-point template used by
//! 112x112 face-recognition networks, rescaled to whatever input size the
//! embedding network reports.

use crate::geometry::Point;
use crate::raster::{ImageBuffer, ImageError};
use crate::types::Landmarks;

/// Template landmarks for a 112x112 crop:
/// left eye, right eye, nose, left mouth corner, right mouth corner.
const TEMPLATE_112: [(f32, f32); 5] = [
    (38.2946, 51.6963),
    (73.5318, 51.5014),
    (56.0252, 71.7366),
    (41.5493, 92.3655),
    (70.7299, 92.2041),
];

const TEMPLATE_SIZE: f32 = 112.0;

/// Template landmarks scaled to a `size` x `size` output.
pub fn template(size: u32) -> [Point; 5] {
    let k = size as f32 / TEMPLATE_SIZE;
    TEMPLATE_112.map(|(x, y)| Point::new(x * k, y * k))
}

/// Similarity transform `[a, -b, tx, b, a, ty]`:
/// ```text
/// | a  -b  tx |
/// | b   a  ty |
/// ```
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Similarity {
    pub a: f32,
    pub b: f32,
    pub tx: f32,
    pub ty: f32,
}

impl Similarity {
    pub fn apply(&self, p: Point) -> Point {
        Point::new(
            self.a * p.x - self.b * p.y + self.tx,
            self.b * p.x + self.a * p.y + self.ty,
        )
    }

    /// Inverse mapping, `None` when the transform collapses the plane.
    pub fn invert(&self) -> Option<Similarity> {
        let det = self.a * self.a + self.b * self.b;
        if det.abs() < 1e-12 {
            return None;
        }
        let ia = self.a / det;
        let ib = -self.b / det;
        // p = M^-1 (q - t)
        Some(Similarity {
            a: ia,
            b: ib,
            tx: -(ia * self.tx - ib * self.ty),
            ty: -(ib * self.tx + ia * self.ty),
        })
    }
}

/// Least-squares similarity transform mapping `src` onto `dst`.
pub fn estimate_similarity(src: &[Point; 5], dst: &[Point; 5]) -> Option<Similarity> {
    // Each pair contributes two rows to A * [a, b, tx, ty]^T = B:
    //   sx * a - sy * b + tx = dx
    //   sy * a + sx * b + ty = dy
    let mut ata = [[0.0f64; 4]; 4];
    let mut atb = [0.0f64; 4];

    for (s, d) in src.iter().zip(dst.iter()) {
        let (sx, sy) = (s.x as f64, s.y as f64);
        let r1 = [sx, -sy, 1.0, 0.0];
        let r2 = [sy, sx, 0.0, 1.0];
        for j in 0..4 {
            for k in 0..4 {
                ata[j][k] += r1[j] * r1[k] + r2[j] * r2[k];
            }
            atb[j] += r1[j] * d.x as f64 + r2[j] * d.y as f64;
        }
    }

    let [a, b, tx, ty] = solve_4x4(ata, atb)?;
    Some(Similarity {
        a: a as f32,
        b: b as f32,
        tx: tx as f32,
        ty: ty as f32,
    })
}

/// Gaussian elimination with partial pivoting. `None` for singular systems.
#[allow(clippy::needless_range_loop)]
fn solve_4x4(ata: [[f64; 4]; 4], atb: [f64; 4]) -> Option<[f64; 4]> {
    let mut m = [[0.0f64; 5]; 4];
    for i in 0..4 {
        m[i][..4].copy_from_slice(&ata[i]);
        m[i][4] = atb[i];
    }

    for col in 0..4 {
        let pivot_row = (col..4).max_by(|&r1, &r2| m[r1][col].abs().total_cmp(&m[r2][col].abs()))?;
        m.swap(col, pivot_row);
        let pivot = m[col][col];
        if pivot.abs() < 1e-12 {
            return None;
        }
        for row in (col + 1)..4 {
            let factor = m[row][col] / pivot;
            for j in col..5 {
                m[row][j] -= factor * m[col][j];
            }
        }
    }

    let mut x = [0.0f64; 4];
    for i in (0..4).rev() {
        let mut acc = m[i][4];
        for j in (i + 1)..4 {
            acc -= m[i][j] * x[j];
        }
        x[i] = acc / m[i][i];
    }
    Some(x)
}

/// Bilinear warp of `image` into a `size` x `size` output through `transform`
/// (source -> output). Samples outside the source are black.
pub fn warp(image: &ImageBuffer, transform: &Similarity, size: u32) -> Result<ImageBuffer, ImageError> {
    let inverse = transform.invert().unwrap_or(Similarity {
        a: 0.0,
        b: 0.0,
        tx: -1.0,
        ty: -1.0,
    });
    let (w, h) = (image.width() as i64, image.height() as i64);

    ImageBuffer::from_fn(size, size, |ox, oy| {
        let src = inverse.apply(Point::new(ox as f32, oy as f32));
        let x0 = src.x.floor() as i64;
        let y0 = src.y.floor() as i64;
        let fx = src.x - x0 as f32;
        let fy = src.y - y0 as f32;

        let sample = |x: i64, y: i64| -> [f32; 3] {
            if x >= 0 && x < w && y >= 0 && y < h {
                image.pixel(x as u32, y as u32).map(|c| c as f32)
            } else {
                [0.0; 3]
            }
        };
        let (tl, tr, bl, br) = (sample(x0, y0), sample(x0 + 1, y0), sample(x0, y0 + 1), sample(x0 + 1, y0 + 1));

        std::array::from_fn(|c| {
            let v = tl[c] * (1.0 - fx) * (1.0 - fy)
                + tr[c] * fx * (1.0 - fy)
                + bl[c] * (1.0 - fx) * fy
                + br[c] * fx * fy;
            v.round().clamp(0.0, 255.0) as u8
        })
    })
}

/// Align a face to the canonical template at `size` x `size`.
///
/// Returns `None` when the landmarks are degenerate (e.g. all coincident).
pub fn align_face(image: &ImageBuffer, landmarks: &Landmarks, size: u32) -> Option<ImageBuffer> {
    let transform = estimate_similarity(landmarks.points(), &template(size))?;
    if transform.invert().is_none() {
        return None;
    }
    warp(image, &transform, size).ok()
}
