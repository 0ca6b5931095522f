use nalgebra as na;
use tracing::info;

use super::map::keyframe::KeyFrameId;
use super::map::Map;
use super::vocabulary::score;

/// Keyframes closer than this to the current one are never loop candidates.
pub const MIN_KEYFRAME_GAP: usize = 10;
pub const MIN_LOOP_SCORE: f32 = 0.6;

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct LoopCandidate {
    pub keyframe: KeyFrameId,
    pub score: f32,
}

/// Best scoring old keyframe that looks like `current`.
pub fn detect_loop(map: &Map, current: KeyFrameId) -> Option<LoopCandidate> {
    let newest_candidate = current.checked_sub(MIN_KEYFRAME_GAP)?;
    let bow = &map.keyframe(current)?.bow;
    map.keyframes
        .range(..=newest_candidate)
        .map(|(id, kf)| LoopCandidate {
            keyframe: *id,
            score: score(bow, &kf.bow),
        })
        .filter(|c| c.score >= MIN_LOOP_SCORE)
        .max_by(|a, b| a.score.total_cmp(&b.score))
}

/// Move `current` onto the candidate's corrected pose and spread the drift
/// linearly over the keyframes in between. Odometry poses are left alone.
/// Returns the ids of the corrected keyframes.
pub fn close_loop(map: &mut Map, candidate: KeyFrameId, current: KeyFrameId) -> Vec<KeyFrameId> {
    let (Some(target), Some(pose)) = (
        map.keyframe(candidate).map(|kf| kf.corrected_pose),
        map.keyframe(current).map(|kf| kf.corrected_pose),
    ) else {
        return Vec::new();
    };
    if current <= candidate {
        return Vec::new();
    }

    let drift = target * pose.inverse();
    let span = (current - candidate) as f64;
    let mut corrected = Vec::new();

    for (id, kf) in map.keyframes.range_mut(candidate + 1..=current) {
        let s = (id - candidate) as f64 / span;
        let rotation = na::UnitQuaternion::identity()
            .try_slerp(&drift.rotation, s, 1e-9)
            .unwrap_or(drift.rotation);
        let partial = na::Isometry3::from_parts(
            na::Translation3::from(drift.translation.vector * s),
            rotation,
        );
        kf.corrected_pose = partial * kf.corrected_pose;
        corrected.push(*id);
    }

    if let Some(kf) = map.keyframe_mut(current) {
        kf.add_connection(candidate);
    }
    if let Some(kf) = map.keyframe_mut(candidate) {
        kf.add_connection(current);
    }

    info!(
        "closed loop {candidate} <-> {current}, drift {:.3}, {} keyframes corrected",
        drift.translation.vector.norm(),
        corrected.len()
    );
    corrected
}
