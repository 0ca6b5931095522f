//! Operating profile for the node and the directive resolver that builds it.
//!
//! The profile is assembled once at startup from an optional preset followed by
//! an ordered list of `name=value` directives. Later directives overwrite earlier
//! ones, presets included. After resolution the profile is handed out by
//! reference and never changes.

mod directives;
mod presets;

use std::path::PathBuf;

use serde::Serialize;
use tracing::{debug, warn};

use crate::error::{Result, SlamError};

pub use presets::apply_preset;

/// Photometric calibration mode selected with `mode=`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub enum PhotometricMode {
    /// Full response + vignette correction, affine brightness optimized with strong priors.
    Calibrated,
    /// No photometric correction, affine brightness optimized freely.
    UncalibratedOptimizeAffine,
    /// No photometric correction, affine brightness fixed ("perfect images").
    UncalibratedFixedAffine,
}

impl PhotometricMode {
    pub fn from_index(index: i64) -> Option<Self> {
        match index {
            0 => Some(PhotometricMode::Calibrated),
            1 => Some(PhotometricMode::UncalibratedOptimizeAffine),
            2 => Some(PhotometricMode::UncalibratedFixedAffine),
            _ => None,
        }
    }

    /// Level of photometric correction applied to incoming frames.
    /// 0: none, 2: response function and vignette.
    pub fn calibration_level(self) -> u8 {
        match self {
            PhotometricMode::Calibrated => 2,
            _ => 0,
        }
    }

    /// Affine prior weights (a, b). Negative means the parameter is fixed.
    pub fn affine_priors(self) -> (f32, f32) {
        match self {
            PhotometricMode::Calibrated => (1e12, 1e8),
            PhotometricMode::UncalibratedOptimizeAffine => (0.0, 0.0),
            PhotometricMode::UncalibratedFixedAffine => (-1.0, -1.0),
        }
    }

    pub fn affine_fixed(self) -> bool {
        let (a, b) = self.affine_priors();
        a < 0.0 && b < 0.0
    }

    /// Offset added to the gradient histogram threshold during point selection.
    pub fn min_grad_hist_add(self) -> f32 {
        match self {
            PhotometricMode::UncalibratedFixedAffine => 3.0,
            _ => 7.0,
        }
    }
}

/// Strategy the mapping engine uses to pick which pixels become map points.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub enum PointSelection {
    /// Pure gradient magnitude per block.
    Gradient,
    /// Gradient with corner response preferred. Required for loop closing,
    /// because the vocabulary descriptors are built around corners.
    CornerFavoring,
    /// Uniform grid sampling.
    Uniform,
}

impl PointSelection {
    pub fn from_index(index: i64) -> Option<Self> {
        match index {
            0 => Some(PointSelection::Gradient),
            1 => Some(PointSelection::CornerFavoring),
            2 => Some(PointSelection::Uniform),
            _ => None,
        }
    }

    pub fn is_loop_closing_compatible(self) -> bool {
        self == PointSelection::CornerFavoring
    }
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct FeatureToggles {
    pub loop_closing: bool,
    pub reconfigure: bool,
    pub ros: bool,
    pub visualization: bool,
    pub multi_threading: bool,
    pub save_images: bool,
    /// Engine run-quiet mode: per-frame tracking output suppressed.
    pub quiet: bool,
    /// Engine writes its per-frame log files.
    pub log_stuff: bool,
    pub sample_output: bool,
}

impl Default for FeatureToggles {
    fn default() -> Self {
        Self {
            loop_closing: true,
            reconfigure: true,
            ros: true,
            visualization: true,
            multi_threading: true,
            save_images: false,
            quiet: false,
            log_stuff: true,
            sample_output: false,
        }
    }
}

/// Dataset playback window and ordering.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct Playback {
    pub start: usize,
    pub end: usize,
    pub reverse: bool,
    pub prefetch: bool,
    pub preload: bool,
}

impl Default for Playback {
    fn default() -> Self {
        Self {
            start: 0,
            end: 100_000,
            reverse: false,
            prefetch: false,
            preload: false,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct Paths {
    pub source: PathBuf,
    pub calibration: PathBuf,
    pub gamma: PathBuf,
    pub vignette: PathBuf,
    pub vocabulary: PathBuf,
    pub output: PathBuf,
}

impl Default for Paths {
    fn default() -> Self {
        Self {
            source: PathBuf::new(),
            calibration: PathBuf::new(),
            gamma: PathBuf::new(),
            vignette: PathBuf::new(),
            vocabulary: PathBuf::new(),
            output: PathBuf::from("./results.txt"),
        }
    }
}

/// Every scalar setting the node and the mapping engine run with.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct OperatingProfile {
    pub immature_density: f32,
    pub point_density: f32,
    pub min_frames: usize,
    pub max_frames: usize,
    pub min_opt_iterations: usize,
    pub max_opt_iterations: usize,
    /// Output resolution forced by a preset, overrides the calibration file.
    pub target_resolution: Option<(u32, u32)>,
    pub rescale: f32,
    /// 0 plays as fast as possible with tracking and mapping serialized,
    /// otherwise a multiple of realtime on the capture timestamps.
    pub playback_speed: f32,
    pub photometric_mode: PhotometricMode,
    pub point_selection: PointSelection,
    pub toggles: FeatureToggles,
    pub playback: Playback,
    pub paths: Paths,
}

impl Default for OperatingProfile {
    fn default() -> Self {
        Self {
            immature_density: 1500.0,
            point_density: 2000.0,
            min_frames: 5,
            max_frames: 7,
            min_opt_iterations: 1,
            max_opt_iterations: 6,
            target_resolution: None,
            rescale: 1.0,
            playback_speed: 0.0,
            photometric_mode: PhotometricMode::Calibrated,
            point_selection: PointSelection::CornerFavoring,
            toggles: FeatureToggles::default(),
            playback: Playback::default(),
            paths: Paths::default(),
        }
    }
}

impl OperatingProfile {
    /// Tracking and mapping run serialized on the ingestion context.
    pub fn linearize_operation(&self) -> bool {
        self.playback_speed == 0.0
    }

    /// Path of the trajectory written without loop-closure corrections.
    pub fn uncorrected_output(&self) -> PathBuf {
        let mut path = self.paths.output.clone().into_os_string();
        path.push(".noloop");
        PathBuf::from(path)
    }

    fn validate(&self) -> Result<()> {
        if self.toggles.loop_closing && !self.point_selection.is_loop_closing_compatible() {
            return Err(SlamError::Config(format!(
                "loop closing is enabled but point selection is {:?}, use pointselection=1",
                self.point_selection
            )));
        }
        if self.min_frames > self.max_frames {
            return Err(SlamError::Config(format!(
                "active frame window is inverted: {}..{}",
                self.min_frames, self.max_frames
            )));
        }
        if self.min_opt_iterations > self.max_opt_iterations {
            return Err(SlamError::Config(format!(
                "optimization iteration bounds are inverted: {}..{}",
                self.min_opt_iterations, self.max_opt_iterations
            )));
        }
        if self.playback_speed < 0.0 {
            return Err(SlamError::Config(format!(
                "playback speed must not be negative, got {}",
                self.playback_speed
            )));
        }
        Ok(())
    }
}

/// Build the operating profile from an optional preset and ordered directives.
///
/// Unknown or malformed directives are reported and skipped. An inconsistent
/// result (e.g. loop closing without a compatible point selection) is fatal.
pub fn resolve<I, S>(preset: Option<i64>, directives: I) -> Result<OperatingProfile>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut profile = OperatingProfile::default();

    if let Some(preset) = preset {
        if !apply_preset(&mut profile, preset) {
            warn!("unknown preset {preset}, keeping defaults");
        }
    }

    for directive in directives {
        directives::apply(&mut profile, directive.as_ref());
    }

    profile.validate()?;
    debug!(profile = %serde_json::to_string(&profile)?, "resolved operating profile");

    Ok(profile)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn profile(args: &[&str]) -> OperatingProfile {
        resolve(None, args.iter()).expect("profile should resolve")
    }

    #[test]
    fn defaults_without_directives() {
        let p = profile(&[]);
        assert_eq!(p, OperatingProfile::default());
        assert!(p.linearize_operation());
        assert_eq!(p.paths.output, PathBuf::from("./results.txt"));
    }

    #[test]
    fn later_directive_overrides_preset() {
        let p = profile(&["preset=3", "speed=2.5"]);
        assert_eq!(p.playback_speed, 2.5);
        assert_eq!(p.point_density, 800.0);

        let p = profile(&["speed=2.5", "preset=3"]);
        assert_eq!(p.playback_speed, 5.0);

        let p = profile(&["preset=0", "nolog=0"]);
        assert!(p.toggles.log_stuff);
        let p = profile(&["nolog=0", "preset=0"]);
        assert!(!p.toggles.log_stuff);
    }

    #[test]
    fn preset_pairs_differ_only_in_realtime() {
        for (slow, fast) in [(0, 1), (2, 3)] {
            let a = profile(&[format!("preset={slow}").as_str()]);
            let b = profile(&[format!("preset={fast}").as_str()]);
            assert_ne!(a.playback_speed, b.playback_speed);
            assert_eq!(a.immature_density, b.immature_density);
            assert_eq!(a.point_density, b.point_density);
            assert_eq!((a.min_frames, a.max_frames), (b.min_frames, b.max_frames));
            assert_eq!(
                (a.min_opt_iterations, a.max_opt_iterations),
                (b.min_opt_iterations, b.max_opt_iterations)
            );
            assert_eq!(a.target_resolution, b.target_resolution);
        }
        assert_eq!(profile(&["preset=2"]).target_resolution, Some((424, 320)));
        assert_eq!(profile(&["preset=1"]).target_resolution, None);
    }

    #[test]
    fn preset_argument_is_applied_before_directives() {
        let p = resolve(Some(2), ["speed=1"]).unwrap();
        assert_eq!(p.playback_speed, 1.0);
        assert_eq!(p.max_frames, 6);
    }

    #[test]
    fn loop_closing_requires_corner_selection() {
        let err = resolve(None, ["loopclosing=1", "pointselection=0"]).unwrap_err();
        assert!(matches!(err, SlamError::Config(_)));

        let p = profile(&["loopclosing=0", "pointselection=0"]);
        assert_eq!(p.point_selection, PointSelection::Gradient);

        // selection fixed again by a later directive
        let p = profile(&["pointselection=2", "pointselection=1"]);
        assert!(p.toggles.loop_closing);
    }

    #[test]
    fn unknown_and_malformed_directives_are_ignored() {
        let p = profile(&["bogus=1", "noequals", "start=abc", "mode=9", "preset=7", "files="]);
        assert_eq!(p, OperatingProfile::default());
    }

    #[test]
    fn toggles_and_paths() {
        let p = profile(&[
            "noros=1",
            "nogui=1",
            "nomt=1",
            "quiet=1",
            "save=1",
            "reversePlay=1",
            "prefetch=1",
            "start=10",
            "end=20",
            "calib=/tmp/camera.txt",
            "output=out/traj.txt",
            "rescale=0.5",
        ]);
        assert!(!p.toggles.ros);
        assert!(!p.toggles.reconfigure);
        assert!(!p.toggles.visualization);
        assert!(!p.toggles.multi_threading);
        assert!(p.toggles.quiet);
        assert!(p.toggles.save_images);
        assert!(p.playback.reverse && p.playback.prefetch);
        assert_eq!((p.playback.start, p.playback.end), (10, 20));
        assert_eq!(p.paths.calibration, PathBuf::from("/tmp/camera.txt"));
        assert_eq!(p.uncorrected_output(), PathBuf::from("out/traj.txt.noloop"));
        assert_eq!(p.rescale, 0.5);

        let p = profile(&["noros=1", "noros=0"]);
        assert!(p.toggles.ros);
        assert!(!p.toggles.reconfigure);
    }

    #[test]
    fn photometric_modes() {
        let p = profile(&["mode=2"]);
        assert_eq!(p.photometric_mode, PhotometricMode::UncalibratedFixedAffine);
        assert_eq!(p.photometric_mode.calibration_level(), 0);
        assert!(p.photometric_mode.affine_fixed());
        assert_eq!(p.photometric_mode.min_grad_hist_add(), 3.0);

        let p = profile(&["mode=2", "mode=1"]);
        assert_eq!(p.photometric_mode.affine_priors(), (0.0, 0.0));
        assert_eq!(p.photometric_mode.min_grad_hist_add(), 7.0);

        let p = profile(&["mode=1", "mode=0"]);
        assert_eq!(p.photometric_mode.calibration_level(), 2);
    }

    #[test]
    fn invalid_speed_is_fatal() {
        assert!(resolve(None, ["speed=-1"]).is_err());
    }
}
