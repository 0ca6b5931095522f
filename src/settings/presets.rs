use tracing::info;

use super::OperatingProfile;

/// Overwrite the preset-controlled cluster of settings.
///
/// Presets 0/1 select the default (accurate) profile, 2/3 the fast one. The odd
/// preset of each pair enforces realtime playback. Returns false for unknown presets,
/// which leave the profile untouched.
pub fn apply_preset(profile: &mut OperatingProfile, preset: i64) -> bool {
    match preset {
        0 | 1 => {
            let realtime = preset == 1;
            info!(
                "preset: DEFAULT settings, {} real-time enforcing, 2000 active points, \
                 5-7 active frames, 1-6 LM iterations each KF, original image resolution",
                if realtime { "1x" } else { "no" }
            );

            profile.playback_speed = if realtime { 1.0 } else { 0.0 };
            profile.playback.preload = realtime;
            profile.immature_density = 1500.0;
            profile.point_density = 2000.0;
            profile.min_frames = 5;
            profile.max_frames = 7;
            profile.max_opt_iterations = 6;
            profile.min_opt_iterations = 1;
            profile.target_resolution = None;
            profile.toggles.log_stuff = false;
            true
        }
        2 | 3 => {
            let realtime = preset == 3;
            info!(
                "preset: FAST settings, {} real-time enforcing, 800 active points, \
                 4-6 active frames, 1-4 LM iterations each KF, 424 x 320 image resolution",
                if realtime { "5x" } else { "no" }
            );

            profile.playback_speed = if realtime { 5.0 } else { 0.0 };
            profile.playback.preload = realtime;
            profile.immature_density = 600.0;
            profile.point_density = 800.0;
            profile.min_frames = 4;
            profile.max_frames = 6;
            profile.max_opt_iterations = 4;
            profile.min_opt_iterations = 1;
            profile.target_resolution = Some((424, 320));
            profile.toggles.log_stuff = false;
            true
        }
        _ => false,
    }
}
