//! Geometric undistortion model: a remap table from the output image into the
//! distorted raw image, built once from the calibration files.

use std::path::Path;

use image::GrayImage;
use nalgebra as na;
use rayon::prelude::*;
use tracing::info;

use super::camera::{CameraCalibration, OutputRectification};
use super::frame::CorrectedFrame;
use super::photometric::PhotometricUndistorter;
use crate::error::{Result, SlamError};
use crate::settings::OperatingProfile;

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct UndistortOptions {
    pub target_resolution: Option<(u32, u32)>,
    pub rescale: f32,
    pub multi_threading: bool,
}

impl Default for UndistortOptions {
    fn default() -> Self {
        Self {
            target_resolution: None,
            rescale: 1.0,
            multi_threading: true,
        }
    }
}

impl From<&OperatingProfile> for UndistortOptions {
    fn from(profile: &OperatingProfile) -> Self {
        Self {
            target_resolution: profile.target_resolution,
            rescale: profile.rescale,
            multi_threading: profile.toggles.multi_threading,
        }
    }
}

pub struct Undistorter {
    calibration: CameraCalibration,
    output_size: (u32, u32),
    k: na::Matrix3<f64>,
    /// Raw image location for every output pixel, NaN where the ray leaves the sensor.
    remap: Vec<[f32; 2]>,
    photometric: Option<PhotometricUndistorter>,
    parallel: bool,
}

impl Undistorter {
    pub fn for_calibration_files(
        calib: &Path,
        gamma: &Path,
        vignette: &Path,
        options: &UndistortOptions,
    ) -> Result<Self> {
        let calibration = CameraCalibration::from_file(calib)?;
        let (w, h) = calibration.input_size;
        let photometric = PhotometricUndistorter::load(gamma, vignette, w, h);
        Self::new(calibration, photometric, options)
    }

    pub fn new(
        calibration: CameraCalibration,
        photometric: Option<PhotometricUndistorter>,
        options: &UndistortOptions,
    ) -> Result<Self> {
        let output_size = match options.target_resolution {
            Some(size) => size,
            None => {
                let (w, h) = calibration.output_size;
                (
                    ((w as f32 * options.rescale).round() as u32).max(1),
                    ((h as f32 * options.rescale).round() as u32).max(1),
                )
            }
        };

        let k = output_intrinsics(&calibration, output_size)?;
        let remap = build_remap(&calibration, output_size, &k);

        info!(
            "undistortion {}x{} -> {}x{}, fx {:.2} fy {:.2} cx {:.2} cy {:.2}",
            calibration.input_size.0,
            calibration.input_size.1,
            output_size.0,
            output_size.1,
            k[(0, 0)],
            k[(1, 1)],
            k[(0, 2)],
            k[(1, 2)]
        );

        Ok(Self {
            calibration,
            output_size,
            k,
            remap,
            photometric,
            parallel: options.multi_threading,
        })
    }

    pub fn output_size(&self) -> (u32, u32) {
        self.output_size
    }

    /// Intrinsics of the undistorted output image.
    pub fn intrinsics(&self) -> na::Matrix3<f64> {
        self.k
    }

    pub fn photometric(&self) -> Option<&PhotometricUndistorter> {
        self.photometric.as_ref()
    }

    /// Correct one raw frame. The raw image must match the calibrated input size.
    pub fn undistort(
        &self,
        raw: &GrayImage,
        photometric_level: u8,
        exposure: f32,
        timestamp: f64,
        factor: f32,
    ) -> CorrectedFrame {
        let (in_w, in_h) = self.calibration.input_size;
        assert_eq!(
            raw.dimensions(),
            (in_w, in_h),
            "raw frame size does not match the calibration"
        );

        let irradiance = match &self.photometric {
            Some(p) => p.process(raw.as_raw(), photometric_level, factor),
            None => raw.as_raw().iter().map(|&v| v as f32 * factor).collect(),
        };

        let (out_w, out_h) = (self.output_size.0 as usize, self.output_size.1 as usize);
        let mut pixels = vec![0.0f32; out_w * out_h];
        let fill_row = |(v, row): (usize, &mut [f32])| {
            let lookup = &self.remap[v * out_w..(v + 1) * out_w];
            for (out, [x, y]) in row.iter_mut().zip(lookup) {
                if !x.is_nan() {
                    *out = bilinear(&irradiance, in_w as usize, in_h as usize, *x, *y);
                }
            }
        };
        if self.parallel {
            pixels.par_chunks_mut(out_w).enumerate().for_each(fill_row);
        } else {
            pixels.chunks_mut(out_w).enumerate().for_each(fill_row);
        }

        CorrectedFrame {
            width: self.output_size.0,
            height: self.output_size.1,
            pixels,
            exposure,
            timestamp,
        }
    }
}

fn bilinear(src: &[f32], w: usize, h: usize, x: f32, y: f32) -> f32 {
    let ix = x.floor() as usize;
    let iy = y.floor() as usize;
    let dx = x - ix as f32;
    let dy = y - iy as f32;
    let ix1 = (ix + 1).min(w - 1);
    let iy1 = (iy + 1).min(h - 1);

    let top = src[iy * w + ix] * (1.0 - dx) + src[iy * w + ix1] * dx;
    let bottom = src[iy1 * w + ix] * (1.0 - dx) + src[iy1 * w + ix1] * dx;
    top * (1.0 - dy) + bottom * dy
}

fn output_intrinsics(
    calib: &CameraCalibration,
    (out_w, out_h): (u32, u32),
) -> Result<na::Matrix3<f64>> {
    let cam = &calib.intrinsics;
    let (in_w, in_h) = (calib.input_size.0 as f64, calib.input_size.1 as f64);
    let (out_w, out_h) = (out_w as f64, out_h as f64);

    let (fx, fy, cx, cy) = match calib.rectification {
        OutputRectification::None => {
            let (sx, sy) = (out_w / in_w, out_h / in_h);
            (
                cam.fx * sx,
                cam.fy * sy,
                (cam.cx + 0.5) * sx - 0.5,
                (cam.cy + 0.5) * sy - 0.5,
            )
        }
        OutputRectification::Intrinsics { fx, fy, cx, cy } => {
            (fx * out_w, fy * out_h, cx * out_w - 0.5, cy * out_h - 0.5)
        }
        rect @ (OutputRectification::Crop | OutputRectification::Full) => {
            let (x_min, x_max, y_min, y_max) =
                undistorted_bounds(calib, rect == OutputRectification::Crop);
            if x_max <= x_min || y_max <= y_min {
                return Err(SlamError::Calibration(
                    "distortion leaves no valid output region".into(),
                ));
            }
            let fx = (out_w - 1.0) / (x_max - x_min);
            let fy = (out_h - 1.0) / (y_max - y_min);
            (fx, fy, -x_min * fx, -y_min * fy)
        }
    };

    Ok(na::Matrix3::new(fx, 0.0, cx, 0.0, fy, cy, 0.0, 0.0, 1.0))
}

/// Normalized bounds of the undistorted input border. `crop` returns the
/// inner rectangle, otherwise the outer one.
fn undistorted_bounds(calib: &CameraCalibration, crop: bool) -> (f64, f64, f64, f64) {
    let cam = &calib.intrinsics;
    let (w, h) = (calib.input_size.0 as f64 - 1.0, calib.input_size.1 as f64 - 1.0);
    const SAMPLES: usize = 100;

    let edge = |from: (f64, f64), to: (f64, f64)| {
        (0..=SAMPLES).map(move |i| {
            let t = i as f64 / SAMPLES as f64;
            cam.unproject(from.0 + (to.0 - from.0) * t, from.1 + (to.1 - from.1) * t)
        })
    };
    let left: Vec<_> = edge((0.0, 0.0), (0.0, h)).collect();
    let right: Vec<_> = edge((w, 0.0), (w, h)).collect();
    let top: Vec<_> = edge((0.0, 0.0), (w, 0.0)).collect();
    let bottom: Vec<_> = edge((0.0, h), (w, h)).collect();

    let max = |it: &mut dyn Iterator<Item = f64>| it.fold(f64::MIN, f64::max);
    let min = |it: &mut dyn Iterator<Item = f64>| it.fold(f64::MAX, f64::min);

    if crop {
        (
            max(&mut left.iter().map(|p| p.0)),
            min(&mut right.iter().map(|p| p.0)),
            max(&mut top.iter().map(|p| p.1)),
            min(&mut bottom.iter().map(|p| p.1)),
        )
    } else {
        let all = || left.iter().chain(&right).chain(&top).chain(&bottom);
        (
            min(&mut all().map(|p| p.0)),
            max(&mut all().map(|p| p.0)),
            min(&mut all().map(|p| p.1)),
            max(&mut all().map(|p| p.1)),
        )
    }
}

fn build_remap(
    calib: &CameraCalibration,
    (out_w, out_h): (u32, u32),
    k: &na::Matrix3<f64>,
) -> Vec<[f32; 2]> {
    let cam = &calib.intrinsics;
    let (in_w, in_h) = (calib.input_size.0 as f64, calib.input_size.1 as f64);
    let (fx, fy, cx, cy) = (k[(0, 0)], k[(1, 1)], k[(0, 2)], k[(1, 2)]);

    let mut remap = Vec::with_capacity((out_w * out_h) as usize);
    for v in 0..out_h {
        for u in 0..out_w {
            let (x, y) = ((u as f64 - cx) / fx, (v as f64 - cy) / fy);
            let (ui, vi) = cam.project(x, y);
            if ui >= 0.0 && vi >= 0.0 && ui <= in_w - 1.0 && vi <= in_h - 1.0 {
                remap.push([ui as f32, vi as f32]);
            } else {
                remap.push([f32::NAN, f32::NAN]);
            }
        }
    }
    remap
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::slam::camera::CameraIntrinsics;
    use approx::assert_relative_eq;
    use image::Luma;

    fn pinhole_calibration(rect: OutputRectification) -> CameraCalibration {
        CameraCalibration {
            intrinsics: CameraIntrinsics::pinhole(50.0, 50.0, 31.5, 23.5),
            input_size: (64, 48),
            rectification: rect,
            output_size: (64, 48),
        }
    }

    #[test]
    fn pinhole_without_rectification_is_identity() {
        let undist = Undistorter::new(
            pinhole_calibration(OutputRectification::None),
            None,
            &UndistortOptions::default(),
        )
        .unwrap();
        let raw = GrayImage::from_fn(64, 48, |x, y| Luma([(x * 3 + y) as u8]));
        let frame = undist.undistort(&raw, 2, 1.0, 12.5, 1.0);

        assert_eq!((frame.width, frame.height), (64, 48));
        assert_eq!(frame.timestamp, 12.5);
        for (i, p) in raw.pixels().enumerate() {
            assert_relative_eq!(frame.pixels[i], p.0[0] as f32, epsilon = 1e-3);
        }
    }

    #[test]
    fn rescale_and_target_resolution() {
        let options = UndistortOptions {
            rescale: 0.5,
            ..UndistortOptions::default()
        };
        let calib = pinhole_calibration(OutputRectification::None);
        let undist = Undistorter::new(calib, None, &options).unwrap();
        assert_eq!(undist.output_size(), (32, 24));
        assert_relative_eq!(undist.intrinsics()[(0, 0)], 25.0);

        let options = UndistortOptions {
            target_resolution: Some((40, 30)),
            rescale: 0.5,
            multi_threading: false,
        };
        let calib = pinhole_calibration(OutputRectification::Full);
        let undist = Undistorter::new(calib, None, &options).unwrap();
        assert_eq!(undist.output_size(), (40, 30));
    }

    #[test]
    fn crop_stays_inside_the_sensor() {
        let calib = CameraCalibration {
            intrinsics: CameraIntrinsics::new_euroc(),
            input_size: (752, 480),
            rectification: OutputRectification::Crop,
            output_size: (320, 240),
        };
        let undist = Undistorter::new(calib, None, &UndistortOptions::default()).unwrap();
        let invalid = undist.remap.iter().filter(|p| p[0].is_nan()).count();
        assert!(invalid * 100 < undist.remap.len(), "{invalid} invalid pixels");

        let raw = GrayImage::from_pixel(752, 480, Luma([80]));
        let frame = undist.undistort(&raw, 0, 1.0, 0.0, 1.0);
        let center = frame.pixels[120 * 320 + 160];
        assert_relative_eq!(center, 80.0, epsilon = 1e-3);
    }

    #[test]
    #[should_panic]
    fn wrong_frame_size_is_fatal() {
        let undist = Undistorter::new(
            pinhole_calibration(OutputRectification::None),
            None,
            &UndistortOptions::default(),
        )
        .unwrap();
        undist.undistort(&GrayImage::new(10, 10), 0, 1.0, 0.0, 1.0);
    }
}
