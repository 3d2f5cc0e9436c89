use ndarray::ArrayView2;

/// Result of one tracking pass.
///
/// `positions[0]` is the base; each accepted segment appends its end
/// point and its angle, so `positions.len() == angles.len() + 1`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TailTrace {
    pub positions: Vec<(f64, f64)>,
    pub angles: Vec<f64>,
}

impl TailTrace {
    /// `angles[-1] - angles[0]`, the total tail curvature.
    /// `None` when the chain terminated before its first segment.
    pub fn deflection(&self) -> Option<f64> {
        match (self.angles.first(), self.angles.last()) {
            (Some(first), Some(last)) => Some(last - first),
            _ => None,
        }
    }

    pub fn segments(&self) -> usize {
        self.angles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.angles.is_empty()
    }
}

/// Center-of-mass segment chaining.
///
/// Starting at `base` with the rest direction toward `tip`, each segment
/// looks for the intensity centroid inside a disc of radius `radius`
/// around the guessed end point, then takes a step of exactly
/// `|tip - base| / n_segments` toward that centroid. The chain stops early
/// when the search window leaves the image or holds no intensity.
///
/// Coordinates are `(x, y)` = `(column, row)` of `img`.
pub fn track_tail(
    img: ArrayView2<u8>,
    base: (f64, f64),
    tip: (f64, f64),
    n_segments: usize,
    radius: f64,
) -> TailTrace {
    let mut trace = TailTrace {
        positions: vec![base],
        angles: Vec::with_capacity(n_segments),
    };
    if n_segments == 0 {
        return trace;
    }

    let (mut bx, mut by) = base;
    let mut dx = (tip.0 - bx) / n_segments as f64;
    let mut dy = (tip.1 - by) / n_segments as f64;
    let seg_length = (dx * dx + dy * dy).sqrt();
    if seg_length == 0.0 || !seg_length.is_finite() {
        return trace;
    }

    for _ in 0..n_segments {
        let Some((cx, cy)) = centroid_near(img, bx + dx, by + dy, radius) else {
            break;
        };
        let dist = ((cx - bx).powi(2) + (cy - by).powi(2)).sqrt();
        if dist == 0.0 {
            // 重心が基点と一致すると方向が決まらない
            break;
        }
        let ratio = seg_length / dist;
        dx = (cx - bx) * ratio;
        dy = (cy - by) * ratio;
        bx += dx;
        by += dy;
        trace.angles.push(dx.atan2(dy));
        trace.positions.push((bx, by));
    }
    trace
}

/// Intensity-weighted centroid of the pixels within `radius` of `(gx, gy)`.
fn centroid_near(img: ArrayView2<u8>, gx: f64, gy: f64, radius: f64) -> Option<(f64, f64)> {
    let (rows, cols) = img.dim();
    let clip = |v: f64, hi: usize| v.clamp(0.0, hi as f64) as usize;
    let x0 = clip(gx - radius, cols);
    let x1 = clip(gx + radius, cols);
    let y0 = clip(gy - radius, rows);
    let y1 = clip(gy + radius, rows);
    if x0 >= x1 || y0 >= y1 {
        return None;
    }

    let r2 = radius * radius;
    let mut total = 0.0;
    let mut sum_x = 0.0;
    let mut sum_y = 0.0;
    for y in y0..y1 {
        let ddy = (y as f64 - gy).powi(2);
        if ddy > r2 {
            continue;
        }
        for x in x0..x1 {
            if (x as f64 - gx).powi(2) + ddy > r2 {
                continue;
            }
            let v = img[[y, x]] as f64;
            total += v;
            sum_x += x as f64 * v;
            sum_y += y as f64 * v;
        }
    }
    if total == 0.0 {
        return None;
    }
    Some((sum_x / total, sum_y / total))
}
