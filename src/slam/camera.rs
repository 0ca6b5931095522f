use std::fs;
use std::path::Path;

use crate::error::{Result, SlamError};

/// Lens distortion acting on normalized image coordinates.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum Distortion {
    None,
    RadTan { k1: f64, k2: f64, p1: f64, p2: f64 },
    Fov { omega: f64 },
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct CameraIntrinsics {
    pub fx: f64,
    pub fy: f64,
    pub cx: f64,
    pub cy: f64,

    pub distortion: Distortion,
}

impl CameraIntrinsics {
    pub fn new_euroc() -> Self {
        Self {
            fx: 458.654,
            fy: 457.296,
            cx: 367.215,
            cy: 248.375,
            distortion: Distortion::RadTan {
                k1: -0.28340811,
                k2: 0.07395907,
                p1: 0.00019359,
                p2: 1.76187114e-05,
            },
        }
    }

    pub fn pinhole(fx: f64, fy: f64, cx: f64, cy: f64) -> Self {
        Self {
            fx,
            fy,
            cx,
            cy,
            distortion: Distortion::None,
        }
    }

    /// Normalized undistorted coordinates to normalized distorted coordinates.
    pub fn distort(&self, x: f64, y: f64) -> (f64, f64) {
        match self.distortion {
            Distortion::None => (x, y),
            Distortion::RadTan { k1, k2, p1, p2 } => {
                let r2 = x * x + y * y;
                let radial = 1.0 + k1 * r2 + k2 * r2 * r2;
                (
                    x * radial + 2.0 * p1 * x * y + p2 * (r2 + 2.0 * x * x),
                    y * radial + p1 * (r2 + 2.0 * y * y) + 2.0 * p2 * x * y,
                )
            }
            Distortion::Fov { omega } => {
                let r = (x * x + y * y).sqrt();
                if omega == 0.0 || r < 1e-8 {
                    return (x, y);
                }
                let factor = (r * 2.0 * (omega / 2.0).tan()).atan() / (r * omega);
                (x * factor, y * factor)
            }
        }
    }

    /// Inverse of [`Self::distort`].
    pub fn undistort(&self, xd: f64, yd: f64) -> (f64, f64) {
        match self.distortion {
            Distortion::None => (xd, yd),
            Distortion::RadTan { k1, k2, p1, p2 } => {
                // fixed point iteration, converges for the usual range of coefficients
                let (mut x, mut y) = (xd, yd);
                for _ in 0..20 {
                    let r2 = x * x + y * y;
                    let radial = 1.0 + k1 * r2 + k2 * r2 * r2;
                    let dx = 2.0 * p1 * x * y + p2 * (r2 + 2.0 * x * x);
                    let dy = p1 * (r2 + 2.0 * y * y) + 2.0 * p2 * x * y;
                    x = (xd - dx) / radial;
                    y = (yd - dy) / radial;
                }
                (x, y)
            }
            Distortion::Fov { omega } => {
                let rd = (xd * xd + yd * yd).sqrt();
                if omega == 0.0 || rd < 1e-8 {
                    return (xd, yd);
                }
                let ru = (rd * omega).tan() / (2.0 * (omega / 2.0).tan());
                (xd * ru / rd, yd * ru / rd)
            }
        }
    }

    /// Pixel in the raw image for a normalized undistorted ray.
    pub fn project(&self, x: f64, y: f64) -> (f64, f64) {
        let (xd, yd) = self.distort(x, y);
        (self.fx * xd + self.cx, self.fy * yd + self.cy)
    }

    /// Normalized undistorted ray for a raw image pixel.
    pub fn unproject(&self, u: f64, v: f64) -> (f64, f64) {
        self.undistort((u - self.cx) / self.fx, (v - self.cy) / self.fy)
    }

    fn relative_to_absolute(&mut self, width: u32, height: u32) {
        self.fx *= width as f64;
        self.fy *= height as f64;
        self.cx = self.cx * width as f64 - 0.5;
        self.cy = self.cy * height as f64 - 0.5;
    }
}

/// How the output intrinsics are chosen from the distorted input.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum OutputRectification {
    /// Largest undistorted rectangle containing only valid pixels.
    Crop,
    /// Smallest undistorted rectangle containing the whole input.
    Full,
    /// Keep the input intrinsics.
    None,
    /// Explicit output intrinsics, relative to the output size.
    Intrinsics { fx: f64, fy: f64, cx: f64, cy: f64 },
}

/// Contents of a four-line camera calibration file.
#[derive(Clone, Debug, PartialEq)]
pub struct CameraCalibration {
    pub intrinsics: CameraIntrinsics,
    pub input_size: (u32, u32),
    pub rectification: OutputRectification,
    pub output_size: (u32, u32),
}

impl CameraCalibration {
    pub fn from_file(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path).map_err(|e| {
            SlamError::Calibration(format!("could not read calibration file {path:?}: {e}"))
        })?;
        Self::parse(&text)
    }

    pub fn parse(text: &str) -> Result<Self> {
        let mut lines = text.lines().map(str::trim).filter(|l| !l.is_empty());
        let mut next_line = |what: &str| {
            lines
                .next()
                .ok_or_else(|| SlamError::Calibration(format!("missing {what} line")))
        };

        let camera_line = next_line("camera")?;
        let input_line = next_line("input size")?;
        let rect_line = next_line("output rectification")?;
        let output_line = next_line("output size")?;

        let input_size = parse_size(input_line)?;
        let output_size = parse_size(output_line)?;

        let mut intrinsics = parse_camera(camera_line)?;
        if intrinsics.cx < 1.0 && intrinsics.cy < 1.0 {
            intrinsics.relative_to_absolute(input_size.0, input_size.1);
        }

        let rectification = match rect_line.to_ascii_lowercase().as_str() {
            "crop" => OutputRectification::Crop,
            "full" => OutputRectification::Full,
            "none" => OutputRectification::None,
            _ => {
                let values = parse_numbers(rect_line)?;
                if values.len() < 4 {
                    return Err(SlamError::Calibration(format!(
                        "could not read output rectification \"{rect_line}\""
                    )));
                }
                OutputRectification::Intrinsics {
                    fx: values[0],
                    fy: values[1],
                    cx: values[2],
                    cy: values[3],
                }
            }
        };

        Ok(Self {
            intrinsics,
            input_size,
            rectification,
            output_size,
        })
    }
}

fn parse_numbers(line: &str) -> Result<Vec<f64>> {
    line.split_whitespace()
        .map(|token| {
            token
                .parse::<f64>()
                .map_err(|_| SlamError::Calibration(format!("invalid number \"{token}\"")))
        })
        .collect()
}

fn parse_size(line: &str) -> Result<(u32, u32)> {
    let mut parts = line.split_whitespace().map(str::parse::<u32>);
    match (parts.next(), parts.next()) {
        (Some(Ok(w)), Some(Ok(h))) if w > 0 && h > 0 => Ok((w, h)),
        _ => Err(SlamError::Calibration(format!("invalid image size \"{line}\""))),
    }
}

fn parse_camera(line: &str) -> Result<CameraIntrinsics> {
    let (model, rest) = match line.split_once(char::is_whitespace) {
        Some((first, rest)) if first.chars().all(char::is_alphabetic) => (Some(first), rest),
        _ => (None, line),
    };
    let v = parse_numbers(rest)?;

    let radtan = |v: &[f64]| CameraIntrinsics {
        distortion: Distortion::RadTan {
            k1: v[4],
            k2: v[5],
            p1: v[6],
            p2: v[7],
        },
        ..CameraIntrinsics::pinhole(v[0], v[1], v[2], v[3])
    };
    let fov = |v: &[f64]| CameraIntrinsics {
        distortion: Distortion::Fov { omega: v[4] },
        ..CameraIntrinsics::pinhole(v[0], v[1], v[2], v[3])
    };

    let camera = match (model, v.len()) {
        (Some("RadTan"), 8) | (None, 8) => radtan(&v),
        (Some("FOV"), 5) => fov(&v),
        (None, 5) if v[4] != 0.0 => fov(&v),
        (Some("Pinhole"), 4 | 5) | (None, 4 | 5) => {
            CameraIntrinsics::pinhole(v[0], v[1], v[2], v[3])
        }
        (model, n) => {
            return Err(SlamError::Calibration(format!(
                "unsupported camera model {model:?} with {n} parameters"
            )))
        }
    };

    if camera.fx <= 0.0 || camera.fy <= 0.0 {
        return Err(SlamError::Calibration(format!(
            "focal length must be positive: \"{line}\""
        )));
    }
    Ok(camera)
}
