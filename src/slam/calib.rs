use nalgebra as na;
use tracing::info;

pub const MAX_PYRAMID_LEVELS: usize = 6;
const MIN_LEVEL_SIZE: u32 = 32;

/// Image size and intrinsics of one pyramid level.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct PyramidLevel {
    pub width: u32,
    pub height: u32,
    pub fx: f64,
    pub fy: f64,
    pub cx: f64,
    pub cy: f64,
}

/// Calibration shared by every frame of a run, derived from the undistorted
/// output size and intrinsics.
#[derive(Clone, Debug, PartialEq)]
pub struct GlobalCalib {
    levels: Vec<PyramidLevel>,
}

impl GlobalCalib {
    pub fn new(width: u32, height: u32, k: &na::Matrix3<f64>) -> Self {
        let mut levels = vec![PyramidLevel {
            width,
            height,
            fx: k[(0, 0)],
            fy: k[(1, 1)],
            cx: k[(0, 2)],
            cy: k[(1, 2)],
        }];

        while levels.len() < MAX_PYRAMID_LEVELS {
            let prev = levels[levels.len() - 1];
            let (w, h) = (prev.width / 2, prev.height / 2);
            if w < MIN_LEVEL_SIZE || h < MIN_LEVEL_SIZE {
                break;
            }
            levels.push(PyramidLevel {
                width: w,
                height: h,
                fx: prev.fx * 0.5,
                fy: prev.fy * 0.5,
                cx: (prev.cx + 0.5) * 0.5 - 0.5,
                cy: (prev.cy + 0.5) * 0.5 - 0.5,
            });
        }

        info!(
            "global calibration {width}x{height}, {} pyramid levels",
            levels.len()
        );
        Self { levels }
    }

    pub fn width(&self) -> u32 {
        self.levels[0].width
    }

    pub fn height(&self) -> u32 {
        self.levels[0].height
    }

    pub fn levels(&self) -> &[PyramidLevel] {
        &self.levels
    }

    pub fn level(&self, level: usize) -> &PyramidLevel {
        &self.levels[level]
    }

    pub fn diagonal(&self) -> f64 {
        let (w, h) = (self.width() as f64, self.height() as f64);
        (w * w + h * h).sqrt()
    }
}
