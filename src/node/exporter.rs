use std::path::{Path, PathBuf};

use tracing::info;

use crate::error::{Result, SlamError};
use crate::settings::OperatingProfile;
use crate::slam::system::MappingEngine;
use crate::visualizer::Viewer;

/// Writes the loop-corrected trajectory, then the uncorrected one.
/// Returns both paths in that order.
pub fn export_trajectories<E: MappingEngine + ?Sized>(
    engine: &mut E,
    profile: &OperatingProfile,
) -> Result<(PathBuf, PathBuf)> {
    let corrected = profile.paths.output.clone();
    let uncorrected = profile.uncorrected_output();

    for (path, apply_loop_correction) in [(&corrected, true), (&uncorrected, false)] {
        engine
            .export_trajectory(path, apply_loop_correction)
            .map_err(|e| SlamError::Export(format!("trajectory {path:?}: {e}")))?;
    }
    info!("trajectories written to {corrected:?} and {uncorrected:?}");

    Ok((corrected, uncorrected))
}

pub fn export_point_cloud(viewer: &dyn Viewer, path: &Path) -> Result<()> {
    viewer
        .save_as_ply(path)
        .map_err(|e| SlamError::Export(format!("point cloud {path:?}: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::testing::{Event, RecordingEngine};
    use crate::settings;

    #[test]
    fn corrected_trajectory_first() {
        let profile = settings::resolve(None, ["output=out/run.txt"]).unwrap();
        let mut engine = RecordingEngine::default();
        let (a, b) = export_trajectories(&mut engine, &profile).unwrap();
        assert_eq!(a, PathBuf::from("out/run.txt"));
        assert_eq!(b, PathBuf::from("out/run.txt.noloop"));
        assert_eq!(
            engine.events(),
            vec![Event::Export(a, true), Event::Export(b, false)]
        );
    }

    #[test]
    fn export_failures_are_reported() {
        let profile = OperatingProfile::default();
        let mut engine = RecordingEngine {
            fail_exports: true,
            ..Default::default()
        };
        let err = export_trajectories(&mut engine, &profile).unwrap_err();
        assert!(matches!(err, SlamError::Export(_)));
        // nothing after the first failure
        assert_eq!(engine.events().len(), 1);
    }
}
