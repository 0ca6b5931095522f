//! Radiometric correction: inverse camera response and vignette.

use std::fs;
use std::path::Path;

use image::{DynamicImage, GenericImageView};
use tracing::{info, warn};

use crate::error::{Result, SlamError};

pub const RESPONSE_SIZE: usize = 256;

pub struct PhotometricUndistorter {
    /// Inverse response, maps raw intensity to irradiance in 0..255.
    g: [f32; RESPONSE_SIZE],
    /// Per-pixel 1 / vignette, absent when no vignette was given.
    vignette_inv: Option<Vec<f32>>,
    width: u32,
    height: u32,
}

impl PhotometricUndistorter {
    /// Load response and vignette. Returns `Ok(None)` when neither is configured.
    ///
    /// An unreadable or invalid file disables photometric correction with a
    /// warning instead of failing the node.
    pub fn load(gamma: &Path, vignette: &Path, width: u32, height: u32) -> Option<Self> {
        if gamma.as_os_str().is_empty() && vignette.as_os_str().is_empty() {
            info!("no photometric calibration given");
            return None;
        }

        let g = if gamma.as_os_str().is_empty() {
            identity_response()
        } else {
            match read_response(gamma) {
                Ok(g) => g,
                Err(e) => {
                    warn!("photometric calibration disabled: {e}");
                    return None;
                }
            }
        };

        let vignette_inv = if vignette.as_os_str().is_empty() {
            None
        } else {
            match read_vignette(vignette, width, height) {
                Ok(v) => Some(v),
                Err(e) => {
                    warn!("photometric calibration disabled: {e}");
                    return None;
                }
            }
        };

        info!(
            "loaded photometric calibration (response: {}, vignette: {})",
            !gamma.as_os_str().is_empty(),
            vignette_inv.is_some()
        );
        Some(Self::new(g, vignette_inv, width, height))
    }

    fn new(
        g: [f32; RESPONSE_SIZE],
        vignette_inv: Option<Vec<f32>>,
        width: u32,
        height: u32,
    ) -> Self {
        Self {
            g,
            vignette_inv,
            width,
            height,
        }
    }

    pub fn g(&self) -> &[f32; RESPONSE_SIZE] {
        &self.g
    }

    /// Photometrically corrected intensities of a raw image, row-major.
    ///
    /// Level 0 only scales by `factor`; level 1 applies the response; level 2
    /// applies response and vignette.
    pub fn process(&self, raw: &[u8], level: u8, factor: f32) -> Vec<f32> {
        assert_eq!(raw.len(), (self.width * self.height) as usize);
        match (level, &self.vignette_inv) {
            (0, _) => raw.iter().map(|&v| v as f32 * factor).collect(),
            (1, _) | (_, None) => raw.iter().map(|&v| self.g[v as usize]).collect(),
            (_, Some(vinv)) => raw
                .iter()
                .zip(vinv)
                .map(|(&v, &inv)| self.g[v as usize] * inv)
                .collect(),
        }
    }
}

fn identity_response() -> [f32; RESPONSE_SIZE] {
    let mut g = [0.0; RESPONSE_SIZE];
    for (i, v) in g.iter_mut().enumerate() {
        *v = i as f32;
    }
    g
}

fn read_response(path: &Path) -> Result<[f32; RESPONSE_SIZE]> {
    let text = fs::read_to_string(path)
        .map_err(|e| SlamError::Photometric(format!("could not read {path:?}: {e}")))?;
    parse_response(&text)
}

pub fn parse_response(text: &str) -> Result<[f32; RESPONSE_SIZE]> {
    let values = text
        .split_whitespace()
        .map(|t| t.parse::<f32>())
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|e| SlamError::Photometric(format!("invalid response value: {e}")))?;

    if values.len() != RESPONSE_SIZE {
        return Err(SlamError::Photometric(format!(
            "response must have {RESPONSE_SIZE} entries, got {}",
            values.len()
        )));
    }
    if values.windows(2).any(|w| w[1] <= w[0]) {
        return Err(SlamError::Photometric(
            "response is not monotonically increasing".into(),
        ));
    }

    let (min, max) = (values[0], values[RESPONSE_SIZE - 1]);
    let mut g = [0.0; RESPONSE_SIZE];
    for (out, v) in g.iter_mut().zip(&values) {
        *out = 255.0 * (v - min) / (max - min);
    }
    Ok(g)
}

fn read_vignette(path: &Path, width: u32, height: u32) -> Result<Vec<f32>> {
    let img = image::open(path)?;
    vignette_from_image(&img, width, height)
}

pub fn vignette_from_image(img: &DynamicImage, width: u32, height: u32) -> Result<Vec<f32>> {
    if img.dimensions() != (width, height) {
        return Err(SlamError::Photometric(format!(
            "vignette is {:?}, expected {width}x{height}",
            img.dimensions()
        )));
    }

    let values: Vec<f32> = match img {
        DynamicImage::ImageLuma16(buf) => buf.pixels().map(|p| p.0[0] as f32).collect(),
        other => other.to_luma8().pixels().map(|p| p.0[0] as f32).collect(),
    };
    let max = values.iter().cloned().fold(0.0f32, f32::max);
    if max <= 0.0 {
        return Err(SlamError::Photometric("vignette is completely dark".into()));
    }

    Ok(values
        .iter()
        .map(|v| if *v > 0.0 { max / v } else { 0.0 })
        .collect())
}
