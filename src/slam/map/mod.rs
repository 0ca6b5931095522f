pub mod keyframe;
pub mod mappoint;

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};

use keyframe::*;
use mappoint::*;

const MAX_ID: usize = usize::MAX / 2;

/// Monotonic id source for keyframes or map points.
#[derive(Debug, Default)]
pub struct IdGenerator(AtomicUsize);

impl IdGenerator {
    pub fn next_id(&self) -> usize {
        // check twice, a plain increment could wrap
        if self.0.load(Ordering::Relaxed) > MAX_ID {
            panic!("Factory ids overflowed");
        }
        let next_id = self.0.fetch_add(1, Ordering::Relaxed);
        if next_id > MAX_ID {
            panic!("Factory ids overflowed");
        }
        next_id
    }
}

/// Keyframes ordered by creation plus the points they host. Only the newest
/// keyframes stay active, older ones are marginalized.
#[derive(Default)]
pub struct Map {
    pub keyframes: BTreeMap<KeyFrameId, KeyFrame>,
    pub mappoints: HashMap<MapPointId, MapPoint>,
    active: VecDeque<KeyFrameId>,
    point_ids: IdGenerator,
}

impl Map {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert_keyframe(&mut self, keyframe: KeyFrame) {
        self.keyframes.insert(keyframe.id, keyframe);
    }

    pub fn insert_mappoint(&mut self, mappoint: MapPoint) {
        self.mappoints.insert(mappoint.id, mappoint);
    }

    pub fn next_point_id(&self) -> MapPointId {
        self.point_ids.next_id()
    }

    pub fn keyframe(&self, id: KeyFrameId) -> Option<&KeyFrame> {
        self.keyframes.get(&id)
    }

    pub fn keyframe_mut(&mut self, id: KeyFrameId) -> Option<&mut KeyFrame> {
        self.keyframes.get_mut(&id)
    }

    pub fn active_keyframes(&self) -> impl Iterator<Item = KeyFrameId> + '_ {
        self.active.iter().copied()
    }

    /// Add a keyframe to the active window and marginalize the oldest ones
    /// beyond `max_active`. Returns the marginalized ids.
    pub fn activate(&mut self, id: KeyFrameId, max_active: usize) -> Vec<KeyFrameId> {
        self.active.push_back(id);
        let mut marginalized = Vec::new();
        while self.active.len() > max_active.max(1) {
            let Some(old) = self.active.pop_front() else {
                break;
            };
            if let Some(kf) = self.keyframes.get_mut(&old) {
                kf.marginalize();
                for point in &kf.points {
                    if let Some(mp) = self.mappoints.get_mut(point) {
                        mp.active = false;
                    }
                }
            }
            marginalized.push(old);
        }
        marginalized
    }

    /// Deactivate points of the oldest active keyframes until at most
    /// `budget` active points remain.
    pub fn enforce_point_budget(&mut self, budget: usize) -> usize {
        let mut active_points = self.mappoints.values().filter(|p| p.active).count();
        let mut deactivated = 0;
        for id in &self.active {
            if active_points <= budget {
                break;
            }
            let Some(kf) = self.keyframes.get(id) else {
                continue;
            };
            for point in &kf.points {
                if active_points <= budget {
                    break;
                }
                if let Some(mp) = self.mappoints.get_mut(point).filter(|p| p.active) {
                    mp.active = false;
                    active_points -= 1;
                    deactivated += 1;
                }
            }
        }
        deactivated
    }

    pub fn points(&self) -> impl Iterator<Item = &MapPoint> {
        self.mappoints.values()
    }
}
