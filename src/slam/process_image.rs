//! Direct image alignment used for frame tracking, plus the pixel selection
//! that seeds new keyframes with map points.

use std::sync::Arc;

use image::{GrayImage, Luma};
use nalgebra as na;

use super::calib::GlobalCalib;
use super::frame::CorrectedFrame;
use super::map::keyframe::KeyFrameId;
use crate::settings::PointSelection;

const HUBER_THRESHOLD: f64 = 9.0;
const MIN_INLIERS: usize = 10;
const CONVERGENCE_EPS: f64 = 1e-3;
const BORDER: usize = 2;

/// Row-major float image.
#[derive(Clone, Debug, PartialEq)]
pub struct FloatImage {
    pub width: usize,
    pub height: usize,
    pub data: Vec<f32>,
}

impl FloatImage {
    pub fn new(width: usize, height: usize, data: Vec<f32>) -> Self {
        assert_eq!(data.len(), width * height);
        Self { width, height, data }
    }

    pub fn at(&self, x: usize, y: usize) -> f32 {
        self.data[y * self.width + x]
    }

    fn half(&self) -> FloatImage {
        let (w, h) = (self.width / 2, self.height / 2);
        let mut data = Vec::with_capacity(w * h);
        for y in 0..h {
            for x in 0..w {
                let sum = self.at(2 * x, 2 * y)
                    + self.at(2 * x + 1, 2 * y)
                    + self.at(2 * x, 2 * y + 1)
                    + self.at(2 * x + 1, 2 * y + 1);
                data.push(sum * 0.25);
            }
        }
        FloatImage::new(w, h, data)
    }

    /// Bilinear lookup, `None` outside the image.
    pub fn interpolate(&self, x: f64, y: f64) -> Option<f32> {
        if x < 0.0 || y < 0.0 || x >= (self.width - 1) as f64 || y >= (self.height - 1) as f64 {
            return None;
        }
        let (ix, iy) = (x as usize, y as usize);
        let (dx, dy) = ((x - ix as f64) as f32, (y - iy as f64) as f32);
        let top = self.at(ix, iy) * (1.0 - dx) + self.at(ix + 1, iy) * dx;
        let bottom = self.at(ix, iy + 1) * (1.0 - dx) + self.at(ix + 1, iy + 1) * dx;
        Some(top * (1.0 - dy) + bottom * dy)
    }

    /// Central difference gradient at an interior pixel.
    pub fn gradient(&self, x: usize, y: usize) -> (f32, f32) {
        (
            0.5 * (self.at(x + 1, y) - self.at(x - 1, y)),
            0.5 * (self.at(x, y + 1) - self.at(x, y - 1)),
        )
    }

    /// 8-bit rendering. With a response function the irradiance is mapped
    /// back to raw camera intensities.
    pub fn to_luma8(&self, response: Option<&[f32; 256]>) -> GrayImage {
        GrayImage::from_fn(self.width as u32, self.height as u32, |x, y| {
            let v = self.at(x as usize, y as usize);
            let raw = match response {
                Some(g) => g.partition_point(|&e| e < v) as f32,
                None => v,
            };
            Luma([raw.clamp(0.0, 255.0) as u8])
        })
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct ImagePyramid {
    levels: Vec<FloatImage>,
}

impl ImagePyramid {
    pub fn new(frame: &CorrectedFrame, calib: &GlobalCalib) -> Self {
        assert_eq!(
            (frame.width, frame.height),
            (calib.width(), calib.height()),
            "frame does not match the global calibration"
        );
        let mut levels = vec![FloatImage::new(
            frame.width as usize,
            frame.height as usize,
            frame.pixels.clone(),
        )];
        while levels.len() < calib.levels().len() {
            let next = levels[levels.len() - 1].half();
            levels.push(next);
        }
        Self { levels }
    }

    pub fn level(&self, level: usize) -> &FloatImage {
        &self.levels[level]
    }

    pub fn len(&self) -> usize {
        self.levels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.levels.is_empty()
    }
}

/// Image-plane motion between a reference and a new frame together with the
/// affine brightness change `cur = exp(a) * ref + b`.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct Motion {
    pub shift: na::Vector2<f64>,
    pub a: f64,
    pub b: f64,
}

impl Motion {
    /// Camera motion under the unit-depth assumption.
    pub fn to_pose(&self, calib: &GlobalCalib) -> na::Isometry3<f64> {
        let level = calib.level(0);
        na::Isometry3::translation(-self.shift.x / level.fx, -self.shift.y / level.fy, 0.0)
    }
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct AlignmentResult {
    pub motion: Motion,
    /// Mean absolute photometric residual on the finest level.
    pub residual: f64,
    pub inliers: usize,
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct AlignOptions {
    /// Finest pyramid level to optimize on.
    pub finest_level: usize,
    /// Coarsest level to start from, clamped to the pyramid.
    pub coarsest_level: usize,
    pub min_iterations: usize,
    pub max_iterations: usize,
    pub grad_threshold: f32,
    pub affine_fixed: bool,
}

/// Gauss-Newton alignment of `current` against `reference`, coarse to fine.
/// Returns `None` when too few pixels overlap.
pub fn align(
    reference: &ImagePyramid,
    current: &ImagePyramid,
    init: Motion,
    options: &AlignOptions,
) -> Option<AlignmentResult> {
    let coarsest = options.coarsest_level.min(reference.len() - 1);
    let mut motion = init;
    let mut last = None;

    for level in (options.finest_level..=coarsest).rev() {
        let scale = 0.5f64.powi(level as i32);
        let r = reference.level(level);
        let c = current.level(level);
        let step = if level == 0 { 2 } else { 1 };
        let pixels = select_gradient_pixels(r, options.grad_threshold, step);

        let mut shift = motion.shift * scale;
        for iteration in 0..options.max_iterations.max(1) {
            let (h, g, residual, inliers) =
                accumulate(c, &pixels, shift, motion.a, motion.b, options.affine_fixed);
            if inliers < MIN_INLIERS {
                return None;
            }
            last = Some((residual, inliers));

            let Some(delta) = h.cholesky().map(|ch| -ch.solve(&g)) else {
                break;
            };
            shift += na::Vector2::new(delta[0], delta[1]);
            if !options.affine_fixed {
                motion.a += delta[2];
                motion.b += delta[3];
            }
            if iteration + 1 >= options.min_iterations
                && delta.fixed_rows::<2>(0).norm() < CONVERGENCE_EPS
            {
                break;
            }
        }
        motion.shift = shift / scale;
    }

    last.map(|(residual, inliers)| AlignmentResult {
        motion,
        residual,
        inliers,
    })
}

fn select_gradient_pixels(
    img: &FloatImage,
    threshold: f32,
    step: usize,
) -> Vec<(usize, usize, f32)> {
    let mut pixels = Vec::new();
    for y in (BORDER..img.height.saturating_sub(BORDER)).step_by(step) {
        for x in (BORDER..img.width.saturating_sub(BORDER)).step_by(step) {
            let (gx, gy) = img.gradient(x, y);
            if gx * gx + gy * gy > threshold * threshold {
                pixels.push((x, y, img.at(x, y)));
            }
        }
    }
    pixels
}

fn accumulate(
    current: &FloatImage,
    pixels: &[(usize, usize, f32)],
    shift: na::Vector2<f64>,
    a: f64,
    b: f64,
    affine_fixed: bool,
) -> (na::Matrix4<f64>, na::Vector4<f64>, f64, usize) {
    let mut h = na::Matrix4::zeros();
    let mut g = na::Vector4::zeros();
    let mut abs_sum = 0.0;
    let mut inliers = 0;
    let scale = a.exp();

    for &(x, y, ref_value) in pixels {
        let (qx, qy) = (x as f64 + shift.x, y as f64 + shift.y);
        let (Some(value), Some(left), Some(right), Some(up), Some(down)) = (
            current.interpolate(qx, qy),
            current.interpolate(qx - 1.0, qy),
            current.interpolate(qx + 1.0, qy),
            current.interpolate(qx, qy - 1.0),
            current.interpolate(qx, qy + 1.0),
        ) else {
            continue;
        };

        let predicted = scale * ref_value as f64 + b;
        let r = value as f64 - predicted;
        let mut j = na::Vector4::new(
            0.5 * (right - left) as f64,
            0.5 * (down - up) as f64,
            -scale * ref_value as f64,
            -1.0,
        );
        if affine_fixed {
            j[2] = 0.0;
            j[3] = 0.0;
        }
        let w = if r.abs() <= HUBER_THRESHOLD {
            1.0
        } else {
            HUBER_THRESHOLD / r.abs()
        };

        h += w * j * j.transpose();
        g += w * j * r;
        abs_sum += r.abs();
        inliers += 1;
    }

    // keep the system solvable when brightness is fixed or unobservable
    for i in 0..4 {
        h[(i, i)] += if affine_fixed && i >= 2 { 1.0 } else { 1e-6 };
    }

    let residual = if inliers > 0 { abs_sum / inliers as f64 } else { f64::INFINITY };
    (h, g, residual, inliers)
}

/// Tracks incoming frames against the latest keyframe.
pub struct Tracker {
    options: AlignOptions,
    reference: Option<(KeyFrameId, Arc<ImagePyramid>)>,
    last_motion: Motion,
}

impl Tracker {
    pub fn new(options: AlignOptions) -> Self {
        Self {
            options,
            reference: None,
            last_motion: Motion::default(),
        }
    }

    pub fn reference(&self) -> Option<&(KeyFrameId, Arc<ImagePyramid>)> {
        self.reference.as_ref()
    }

    pub fn set_reference(&mut self, keyframe: KeyFrameId, pyramid: Arc<ImagePyramid>) {
        self.reference = Some((keyframe, pyramid));
        self.last_motion = Motion::default();
    }

    pub fn last_motion(&self) -> Motion {
        self.last_motion
    }

    /// Align a frame against the reference keyframe, starting from the motion
    /// of the previous frame.
    pub fn track(&mut self, pyramid: &ImagePyramid) -> Option<AlignmentResult> {
        let (_, reference) = self.reference.as_ref()?;
        let result = align(reference, pyramid, self.last_motion, &self.options)?;
        self.last_motion = result.motion;
        Some(result)
    }
}

/// Pick up to `count` pixels of the image that will become map points.
pub fn select_points(
    img: &FloatImage,
    strategy: PointSelection,
    count: usize,
    grad_threshold: f32,
) -> Vec<(usize, usize)> {
    if count == 0 || img.width <= 2 * BORDER || img.height <= 2 * BORDER {
        return Vec::new();
    }
    let area = ((img.width - 2 * BORDER) * (img.height - 2 * BORDER)) as f64;
    let block = ((area / count as f64).sqrt().ceil() as usize).max(1);

    let mut points = Vec::new();
    for by in (BORDER..img.height - BORDER).step_by(block) {
        for bx in (BORDER..img.width - BORDER).step_by(block) {
            let x_end = (bx + block).min(img.width - BORDER);
            let y_end = (by + block).min(img.height - BORDER);

            let best = match strategy {
                PointSelection::Uniform => Some(((bx + x_end) / 2, (by + y_end) / 2)),
                PointSelection::Gradient | PointSelection::CornerFavoring => {
                    let mut best: Option<((usize, usize), f32)> = None;
                    for y in by..y_end {
                        for x in bx..x_end {
                            let (gx, gy) = img.gradient(x, y);
                            let grad2 = gx * gx + gy * gy;
                            if grad2 <= grad_threshold * grad_threshold {
                                continue;
                            }
                            let score = if strategy == PointSelection::CornerFavoring {
                                corner_response(img, x, y)
                            } else {
                                grad2
                            };
                            if best.map_or(true, |(_, s)| score > s) {
                                best = Some(((x, y), score));
                            }
                        }
                    }
                    best.map(|(p, _)| p)
                }
            };
            points.extend(best);
        }
    }
    points.truncate(count);
    points
}

/// Smaller eigenvalue of the 3x3 structure tensor.
fn corner_response(img: &FloatImage, x: usize, y: usize) -> f32 {
    let (mut xx, mut xy, mut yy) = (0.0, 0.0, 0.0);
    for v in y - 1..=y + 1 {
        for u in x - 1..=x + 1 {
            if u == 0 || v == 0 || u + 1 >= img.width || v + 1 >= img.height {
                continue;
            }
            let (gx, gy) = img.gradient(u, v);
            xx += gx * gx;
            xy += gx * gy;
            yy += gy * gy;
        }
    }
    let trace_half = 0.5 * (xx + yy);
    let det = xx * yy - xy * xy;
    trace_half - (trace_half * trace_half - det).max(0.0).sqrt()
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    const W: u32 = 160;
    const H: u32 = 120;

    fn pattern(x: f64, y: f64) -> f32 {
        let v = 128.0 + 50.0 * (x / 6.0).sin() + 40.0 * (y / 7.0).cos();
        (v + 20.0 * ((x + y) / 11.0).sin()) as f32
    }

    fn frame(shift: (f64, f64), gain: f32, offset: f32) -> CorrectedFrame {
        let mut pixels = Vec::new();
        for y in 0..H {
            for x in 0..W {
                pixels.push(gain * pattern(x as f64 - shift.0, y as f64 - shift.1) + offset);
            }
        }
        CorrectedFrame {
            width: W,
            height: H,
            pixels,
            exposure: 1.0,
            timestamp: 0.0,
        }
    }

    fn calib() -> GlobalCalib {
        let k = na::Matrix3::new(100.0, 0.0, 79.5, 0.0, 100.0, 59.5, 0.0, 0.0, 1.0);
        GlobalCalib::new(W, H, &k)
    }

    fn options(affine_fixed: bool) -> AlignOptions {
        AlignOptions {
            finest_level: 0,
            coarsest_level: 5,
            min_iterations: 1,
            max_iterations: 30,
            grad_threshold: 3.0,
            affine_fixed,
        }
    }

    #[test]
    fn recovers_image_shift() {
        let calib = calib();
        let reference = ImagePyramid::new(&frame((0.0, 0.0), 1.0, 0.0), &calib);
        let current = ImagePyramid::new(&frame((2.5, -1.5), 1.0, 0.0), &calib);

        let result = align(&reference, &current, Motion::default(), &options(true)).unwrap();
        assert_relative_eq!(result.motion.shift.x, 2.5, epsilon = 0.05);
        assert_relative_eq!(result.motion.shift.y, -1.5, epsilon = 0.05);
        assert!(result.residual < 1.0, "residual {}", result.residual);

        let pose = result.motion.to_pose(&calib);
        assert!(pose.translation.x < 0.0 && pose.translation.y > 0.0);
    }

    #[test]
    fn recovers_affine_brightness() {
        let calib = calib();
        let reference = ImagePyramid::new(&frame((0.0, 0.0), 1.0, 0.0), &calib);
        let current = ImagePyramid::new(&frame((1.0, 0.5), 1.2, -10.0), &calib);

        let result = align(&reference, &current, Motion::default(), &options(false)).unwrap();
        assert_relative_eq!(result.motion.shift.x, 1.0, epsilon = 0.05);
        assert_relative_eq!(result.motion.a.exp(), 1.2, epsilon = 0.02);
        assert_relative_eq!(result.motion.b, -10.0, epsilon = 2.0);
    }

    #[test]
    fn tracker_needs_a_reference() {
        let calib = calib();
        let mut tracker = Tracker::new(options(true));
        let pyramid = Arc::new(ImagePyramid::new(&frame((0.0, 0.0), 1.0, 0.0), &calib));
        assert!(tracker.track(&pyramid).is_none());

        tracker.set_reference(0, Arc::clone(&pyramid));
        let next = ImagePyramid::new(&frame((1.0, 0.0), 1.0, 0.0), &calib);
        let result = tracker.track(&next).unwrap();
        assert_relative_eq!(result.motion.shift.x, 1.0, epsilon = 0.05);
        assert_eq!(tracker.last_motion(), result.motion);
    }

    #[test]
    fn flat_images_cannot_be_tracked() {
        let calib = calib();
        let flat = CorrectedFrame {
            width: W,
            height: H,
            pixels: vec![100.0; (W * H) as usize],
            exposure: 1.0,
            timestamp: 0.0,
        };
        let pyramid = ImagePyramid::new(&flat, &calib);
        assert!(align(&pyramid, &pyramid, Motion::default(), &options(true)).is_none());
        assert!(select_points(pyramid.level(0), PointSelection::Gradient, 100, 3.0).is_empty());
        assert_eq!(
            select_points(pyramid.level(0), PointSelection::Uniform, 100, 3.0).len(),
            100
        );
    }

    #[test]
    fn point_selection_respects_budget() {
        let calib = calib();
        let pyramid = ImagePyramid::new(&frame((0.0, 0.0), 1.0, 0.0), &calib);
        for strategy in [
            PointSelection::Gradient,
            PointSelection::CornerFavoring,
            PointSelection::Uniform,
        ] {
            let points = select_points(pyramid.level(0), strategy, 200, 3.0);
            assert!(!points.is_empty() && points.len() <= 200, "{strategy:?}: {}", points.len());
            assert!(points
                .iter()
                .all(|&(x, y)| x >= BORDER
                    && y >= BORDER
                    && x < W as usize - BORDER
                    && y < H as usize - BORDER));
        }
    }

    #[test]
    fn response_maps_back_to_raw_values() {
        let img = FloatImage::new(2, 1, vec![0.0, 100.0]);
        let mut g = [0.0f32; 256];
        for (i, v) in g.iter_mut().enumerate() {
            *v = i as f32 * 0.5;
        }
        let raw = img.to_luma8(Some(&g));
        assert_eq!(raw.get_pixel(0, 0).0[0], 0);
        assert_eq!(raw.get_pixel(1, 0).0[0], 200);
        assert_eq!(img.to_luma8(None).get_pixel(1, 0).0[0], 100);
    }
}
