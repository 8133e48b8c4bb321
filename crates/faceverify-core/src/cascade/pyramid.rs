//! Geometric image pyramid for the proposal stage.

/// One pyramid level: the factor applied to the source image and the
/// resulting dimensions.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScaleLevel {
    pub scale: f32,
    pub width: u32,
    pub height: u32,
}

/// Build the scale pyramid for a `width` x `height` image.
///
/// The first level maps a face of `min_face_size` pixels onto the proposal
/// network's `cell_size` receptive field; each further level shrinks by
/// `factor` until the shorter side would drop below `cell_size`. Levels whose
/// rounded dimensions fall below `cell_size` are skipped.
pub fn scale_pyramid(width: u32, height: u32, min_face_size: f32, factor: f32, cell_size: u32) -> Vec<ScaleLevel> {
    let cell = cell_size.max(1) as f32;
    if width == 0 || height == 0 || !(min_face_size > 0.0) || !(factor > 0.0 && factor < 1.0) {
        return Vec::new();
    }

    let mut scale = cell / min_face_size;
    let mut min_layer = width.min(height) as f32 * scale;
    let mut levels = Vec::new();

    while min_layer >= cell {
        let w = (width as f32 * scale).round() as u32;
        let h = (height as f32 * scale).round() as u32;
        if w >= cell_size && h >= cell_size {
            levels.push(ScaleLevel { scale, width: w, height: h });
        } else {
            tracing::trace!(scale, w, h, "skipping pyramid level below receptive field");
        }
        scale *= factor;
        min_layer *= factor;
    }

    levels
}
