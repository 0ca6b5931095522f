//! Mapping engine.
//!
//! Tracking runs synchronously inside [`MappingEngine::add_active_frame`].
//! Keyframe work (pose refinement, point selection, loop closing, publishing)
//! is queued for a background mapping thread, or done inline when the engine
//! runs linearized.

use std::collections::VecDeque;
use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::panic::{self, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use nalgebra as na;
use parking_lot::{Condvar, Mutex};
use serde::Serialize;
use tracing::{debug, error, info, trace, warn};

use super::calib::GlobalCalib;
use super::frame::CorrectedFrame;
use super::loop_closing::{close_loop, detect_loop};
use super::map::keyframe::{KeyFrame, KeyFrameId};
use super::map::mappoint::MapPoint;
use super::map::{IdGenerator, Map};
use super::process_image::{align, select_points, AlignOptions, ImagePyramid, Motion, Tracker};
use super::vocabulary::Vocabulary;
use crate::error::{Result, SlamError};
use crate::settings::{OperatingProfile, PointSelection};
use crate::visualizer::message::{CloudPoint, KeyframeMessage};
use crate::visualizer::OutputWrapper;

pub const LOG_DIR: &str = "logs";
pub const IMAGES_DIR: &str = "images_out";

const TRACKING_ITERATIONS: usize = 20;
/// Mean image shift, relative to the diagonal, that makes a new keyframe.
const KEYFRAME_SHIFT: f64 = 0.05;
const KEYFRAME_BRIGHTNESS: f64 = 0.7;

/// Operations the ingestion side needs from a mapping back end.
pub trait MappingEngine {
    fn add_active_frame(&mut self, frame: CorrectedFrame, id: usize);

    /// Blocks until every queued mapping job has been processed.
    fn block_until_mapping_is_finished(&mut self);

    fn export_trajectory(&mut self, path: &Path, apply_loop_correction: bool) -> Result<()>;

    fn set_linearize_operation(&mut self, _linearize: bool) {}

    fn set_gamma_function(&mut self, _g: &[f32; 256]) {}

    fn set_viewer(&mut self, _output: Box<dyn OutputWrapper>) {}
}

#[derive(Clone, Debug)]
struct MapperSettings {
    min_iterations: usize,
    max_iterations: usize,
    max_frames: usize,
    immature_density: usize,
    point_density: usize,
    point_selection: PointSelection,
    grad_threshold: f32,
    affine_fixed: bool,
    loop_closing: bool,
    save_images: bool,
    images_dir: PathBuf,
}

struct MapperContext {
    calib: GlobalCalib,
    settings: MapperSettings,
    vocabulary: Arc<Vocabulary>,
}

struct MappingJob {
    keyframe: KeyFrameId,
    frame_id: usize,
    timestamp: f64,
    parent: Option<(KeyFrameId, Arc<ImagePyramid>)>,
    motion: Motion,
    pyramid: Arc<ImagePyramid>,
}

#[derive(Default)]
struct JobQueue {
    jobs: VecDeque<MappingJob>,
    busy: bool,
    shutdown: bool,
    /// Set when a keyframe job panicked. Nothing is mapped afterwards.
    failed: bool,
}

#[derive(Default)]
struct MapState {
    map: Map,
    gamma: Option<[f32; 256]>,
    loops: usize,
}

#[derive(Default)]
struct Shared {
    queue: Mutex<JobQueue>,
    wake: Condvar,
    idle: Condvar,
    state: Mutex<MapState>,
    outputs: Mutex<Vec<Box<dyn OutputWrapper>>>,
}

/// Pose of one tracked frame, relative to the keyframe it was tracked against.
struct FrameRecord {
    timestamp: f64,
    keyframe: KeyFrameId,
    relative: na::Isometry3<f64>,
}

#[derive(Serialize)]
struct FrameLogRecord {
    frame_id: usize,
    timestamp: f64,
    keyframe: bool,
    reference: KeyFrameId,
    shift_x: f64,
    shift_y: f64,
    affine_a: f64,
    affine_b: f64,
    residual: f64,
}

pub struct FullSystem {
    context: Arc<MapperContext>,
    shared: Arc<Shared>,
    mapper: Option<JoinHandle<()>>,
    linearize: bool,

    tracker: Tracker,
    keyframe_ids: IdGenerator,
    frames_since_keyframe: usize,
    min_frames: usize,
    max_frames: usize,
    records: Vec<FrameRecord>,
    frame_log: Option<csv::Writer<File>>,
    quiet: bool,
}

impl FullSystem {
    pub fn new(
        profile: &OperatingProfile,
        calib: GlobalCalib,
        vocabulary: Arc<Vocabulary>,
    ) -> Result<Self> {
        let mode = profile.photometric_mode;
        let settings = MapperSettings {
            min_iterations: profile.min_opt_iterations,
            max_iterations: profile.max_opt_iterations,
            max_frames: profile.max_frames,
            immature_density: profile.immature_density as usize,
            point_density: profile.point_density as usize,
            point_selection: profile.point_selection,
            grad_threshold: mode.min_grad_hist_add(),
            affine_fixed: mode.affine_fixed(),
            loop_closing: profile.toggles.loop_closing,
            save_images: profile.toggles.save_images,
            images_dir: PathBuf::from(IMAGES_DIR),
        };

        let tracker = Tracker::new(AlignOptions {
            finest_level: 0,
            coarsest_level: calib.levels().len() - 1,
            min_iterations: 1,
            max_iterations: TRACKING_ITERATIONS,
            grad_threshold: settings.grad_threshold,
            affine_fixed: settings.affine_fixed,
        });

        let frame_log = if profile.toggles.log_stuff {
            fs::create_dir_all(LOG_DIR)?;
            Some(csv::Writer::from_path(Path::new(LOG_DIR).join("frames.csv"))?)
        } else {
            None
        };

        let mut system = Self {
            context: Arc::new(MapperContext {
                calib,
                settings,
                vocabulary,
            }),
            shared: Arc::new(Shared::default()),
            mapper: None,
            linearize: true,
            tracker,
            keyframe_ids: IdGenerator::default(),
            frames_since_keyframe: 0,
            min_frames: profile.min_frames,
            max_frames: profile.max_frames,
            records: Vec::new(),
            frame_log,
            quiet: profile.toggles.quiet,
        };
        if !profile.linearize_operation() {
            system.spawn_mapper()?;
            system.linearize = false;
        }
        Ok(system)
    }

    pub fn frame_count(&self) -> usize {
        self.records.len()
    }

    /// Keyframes processed by the mapper so far.
    pub fn keyframe_count(&self) -> usize {
        self.shared.state.lock().map.keyframes.len()
    }

    pub fn loops_closed(&self) -> usize {
        self.shared.state.lock().loops
    }

    fn spawn_mapper(&mut self) -> Result<()> {
        self.shared.queue.lock().shutdown = false;
        let shared = Arc::clone(&self.shared);
        let context = Arc::clone(&self.context);
        let handle = thread::Builder::new()
            .name("mapping".into())
            .spawn(move || mapping_loop(&shared, &context))?;
        self.mapper = Some(handle);
        Ok(())
    }

    fn stop_mapper(&mut self) {
        let Some(handle) = self.mapper.take() else {
            return;
        };
        self.shared.queue.lock().shutdown = true;
        self.shared.wake.notify_all();
        if handle.join().is_err() {
            error!("mapping thread panicked");
        }
    }

    fn needs_keyframe(&self, motion: &Motion) -> bool {
        let diagonal = self.context.calib.diagonal();
        self.frames_since_keyframe >= self.max_frames
            || (self.frames_since_keyframe >= self.min_frames
                && (motion.shift.norm() > KEYFRAME_SHIFT * diagonal
                    || motion.a.abs() > KEYFRAME_BRIGHTNESS))
    }

    fn create_keyframe(
        &mut self,
        frame_id: usize,
        timestamp: f64,
        parent: Option<(KeyFrameId, Arc<ImagePyramid>)>,
        motion: Motion,
        pyramid: Arc<ImagePyramid>,
    ) -> KeyFrameId {
        let keyframe = self.keyframe_ids.next_id();
        self.tracker.set_reference(keyframe, Arc::clone(&pyramid));
        self.frames_since_keyframe = 0;
        self.records.push(FrameRecord {
            timestamp,
            keyframe,
            relative: na::Isometry3::identity(),
        });

        let job = MappingJob {
            keyframe,
            frame_id,
            timestamp,
            parent,
            motion,
            pyramid,
        };
        if self.linearize {
            process_keyframe(&self.shared, &self.context, job);
        } else {
            let mut queue = self.shared.queue.lock();
            if queue.failed {
                trace!("mapping thread is gone, dropping keyframe {keyframe}");
            } else {
                queue.jobs.push_back(job);
                self.shared.wake.notify_one();
            }
        }
        keyframe
    }

    fn log_frame(&mut self, record: FrameLogRecord) {
        if self.quiet {
            trace!(
                "frame {} tracked against keyframe {}, shift ({:.2}, {:.2})",
                record.frame_id,
                record.reference,
                record.shift_x,
                record.shift_y
            );
        } else {
            debug!(
                "frame {} tracked against keyframe {}, shift ({:.2}, {:.2}), affine ({:.3}, {:.1}), residual {:.2}{}",
                record.frame_id,
                record.reference,
                record.shift_x,
                record.shift_y,
                record.affine_a,
                record.affine_b,
                record.residual,
                if record.keyframe { ", new keyframe" } else { "" }
            );
        }
        if let Some(log) = &mut self.frame_log {
            if let Err(e) = log.serialize(&record) {
                warn!("could not write frame log: {e}");
            }
        }
    }
}

impl MappingEngine for FullSystem {
    fn add_active_frame(&mut self, frame: CorrectedFrame, id: usize) {
        let pyramid = Arc::new(ImagePyramid::new(&frame, &self.context.calib));
        let timestamp = frame.timestamp;

        let reference = self
            .tracker
            .reference()
            .map(|(kf, pyr)| (*kf, Arc::clone(pyr)));
        let Some((reference_id, reference_pyramid)) = reference else {
            let keyframe = self.create_keyframe(id, timestamp, None, Motion::default(), pyramid);
            info!("initialized on frame {id} (keyframe {keyframe})");
            return;
        };

        let tracked = self.tracker.track(&pyramid);
        let motion = match &tracked {
            Some(result) => result.motion,
            None => {
                warn!("tracking lost on frame {id}, starting a new keyframe");
                self.tracker.last_motion()
            }
        };
        self.frames_since_keyframe += 1;
        let keyframe = tracked.is_none() || self.needs_keyframe(&motion);

        self.log_frame(FrameLogRecord {
            frame_id: id,
            timestamp,
            keyframe,
            reference: reference_id,
            shift_x: motion.shift.x,
            shift_y: motion.shift.y,
            affine_a: motion.a,
            affine_b: motion.b,
            residual: tracked.map_or(f64::NAN, |r| r.residual),
        });

        if keyframe {
            self.create_keyframe(
                id,
                timestamp,
                Some((reference_id, reference_pyramid)),
                motion,
                pyramid,
            );
        } else {
            let relative = motion.to_pose(&self.context.calib);
            self.records.push(FrameRecord {
                timestamp,
                keyframe: reference_id,
                relative,
            });
        }
    }

    fn block_until_mapping_is_finished(&mut self) {
        let mut queue = self.shared.queue.lock();
        while !queue.failed && (!queue.jobs.is_empty() || queue.busy) {
            self.shared.idle.wait(&mut queue);
        }
    }

    fn export_trajectory(&mut self, path: &Path, apply_loop_correction: bool) -> Result<()> {
        self.block_until_mapping_is_finished();
        if self.shared.queue.lock().failed {
            return Err(SlamError::MapperPanicked);
        }
        if let Some(log) = &mut self.frame_log {
            log.flush()?;
        }
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }

        let state = self.shared.state.lock();
        let mut out = BufWriter::new(File::create(path)?);
        let mut written = 0;
        for record in &self.records {
            let Some(kf) = state.map.keyframe(record.keyframe) else {
                warn!("keyframe {} missing from the map", record.keyframe);
                continue;
            };
            let base = if apply_loop_correction {
                kf.corrected_pose
            } else {
                kf.pose
            };
            let pose = base * record.relative;
            let t = &pose.translation.vector;
            let q = &pose.rotation;
            writeln!(
                out,
                "{} {} {} {} {} {} {} {}",
                format_timestamp(record.timestamp),
                t.x,
                t.y,
                t.z,
                q.i,
                q.j,
                q.k,
                q.w
            )?;
            written += 1;
        }
        out.flush()?;

        info!(
            "saved {written} poses to {path:?}{}",
            if apply_loop_correction { "" } else { " (no loop correction)" }
        );
        Ok(())
    }

    fn set_linearize_operation(&mut self, linearize: bool) {
        if linearize == self.linearize {
            return;
        }
        if linearize {
            self.block_until_mapping_is_finished();
            self.stop_mapper();
        } else if let Err(e) = self.spawn_mapper() {
            error!("could not start mapping thread, staying linearized: {e}");
            return;
        }
        self.linearize = linearize;
        info!("linearized operation {}", if linearize { "on" } else { "off" });
    }

    fn set_gamma_function(&mut self, g: &[f32; 256]) {
        self.shared.state.lock().gamma = Some(*g);
        info!("photometric response attached");
    }

    fn set_viewer(&mut self, output: Box<dyn OutputWrapper>) {
        self.shared.outputs.lock().push(output);
    }
}

impl Drop for FullSystem {
    fn drop(&mut self) {
        self.stop_mapper();
        if let Some(log) = &mut self.frame_log {
            let _ = log.flush();
        }
    }
}

fn mapping_loop(shared: &Shared, context: &MapperContext) {
    loop {
        let job = {
            let mut queue = shared.queue.lock();
            loop {
                if let Some(job) = queue.jobs.pop_front() {
                    queue.busy = true;
                    break job;
                }
                if queue.shutdown {
                    return;
                }
                shared.wake.wait(&mut queue);
            }
        };

        let keyframe = job.keyframe;
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
            process_keyframe(shared, context, job);
        }));

        let mut queue = shared.queue.lock();
        queue.busy = false;
        if outcome.is_err() {
            error!(
                "mapping thread panicked on keyframe {keyframe}, {} queued jobs dropped",
                queue.jobs.len()
            );
            queue.failed = true;
            queue.jobs.clear();
            shared.idle.notify_all();
            return;
        }
        if queue.jobs.is_empty() {
            shared.idle.notify_all();
        }
    }
}

fn process_keyframe(shared: &Shared, context: &MapperContext, job: MappingJob) {
    let settings = &context.settings;
    let calib = &context.calib;

    let relative = match &job.parent {
        Some((_, parent_pyramid)) => {
            let options = AlignOptions {
                finest_level: 0,
                coarsest_level: 0,
                min_iterations: settings.min_iterations,
                max_iterations: settings.max_iterations,
                grad_threshold: settings.grad_threshold,
                affine_fixed: settings.affine_fixed,
            };
            let motion = align(parent_pyramid, &job.pyramid, job.motion, &options)
                .map_or(job.motion, |r| r.motion);
            motion.to_pose(calib)
        }
        None => na::Isometry3::identity(),
    };
    let parent_id = job.parent.as_ref().map(|(id, _)| *id);

    let mut state = shared.state.lock();
    let (pose, corrected_pose) = parent_id
        .and_then(|id| state.map.keyframe(id))
        .map_or((relative, relative), |p| {
            (p.pose * relative, p.corrected_pose * relative)
        });

    let mut kf = KeyFrame::new(job.keyframe, job.frame_id, job.timestamp, parent_id, pose);
    kf.corrected_pose = corrected_pose;
    kf.pyramid = Some(Arc::clone(&job.pyramid));

    let image = job.pyramid.level(0);
    let pixels = select_points(
        image,
        settings.point_selection,
        settings.immature_density,
        settings.grad_threshold,
    );
    let level = calib.level(0);
    for &(x, y) in &pixels {
        let position = na::Vector3::new(
            (x as f64 - level.cx) / level.fx,
            (y as f64 - level.cy) / level.fy,
            1.0,
        );
        let intensity = image.at(x, y).clamp(0.0, 255.0) as u8;
        let mp = MapPoint::new(
            state.map.next_point_id(),
            kf.id,
            (x as f32, y as f32),
            position,
            intensity,
        );
        kf.add_observation(mp.id);
        state.map.insert_mappoint(mp);
    }
    if settings.loop_closing {
        kf.bow = context.vocabulary.transform(image, &pixels);
    }

    let kf_id = kf.id;
    state.map.insert_keyframe(kf);
    for old in state.map.activate(kf_id, settings.max_frames) {
        trace!("marginalized keyframe {old}");
    }
    state.map.enforce_point_budget(settings.point_density);

    let mut changed = vec![kf_id];
    if settings.loop_closing {
        if let Some(candidate) = detect_loop(&state.map, kf_id) {
            info!(
                "loop candidate for keyframe {kf_id}: keyframe {} (score {:.2})",
                candidate.keyframe, candidate.score
            );
            let corrected = close_loop(&mut state.map, candidate.keyframe, kf_id);
            if !corrected.is_empty() {
                state.loops += 1;
                changed = corrected;
            }
        }
    }

    if settings.save_images {
        let path = settings.images_dir.join(format!("{:05}.png", job.frame_id));
        if let Err(e) = image.to_luma8(state.gamma.as_ref()).save(&path) {
            warn!("could not save {path:?}: {e}");
        }
    }

    debug!(
        "mapped keyframe {kf_id} (frame {}) with {} points",
        job.frame_id,
        pixels.len()
    );

    let messages: Vec<_> = changed
        .iter()
        .filter_map(|id| keyframe_message(&state.map, *id))
        .collect();
    drop(state);

    let mut outputs = shared.outputs.lock();
    for message in &messages {
        for output in outputs.iter_mut() {
            output.publish_keyframe(message);
        }
    }
}

fn keyframe_message(map: &Map, id: KeyFrameId) -> Option<KeyframeMessage> {
    let kf = map.keyframe(id)?;
    let points = kf
        .points
        .iter()
        .filter_map(|p| map.mappoints.get(p))
        .map(|mp| {
            let world = mp.world_position(&kf.corrected_pose);
            CloudPoint {
                position: [world.x as f32, world.y as f32, world.z as f32],
                intensity: mp.intensity,
            }
        })
        .collect();
    Some(KeyframeMessage {
        id,
        frame_id: kf.frame_id,
        timestamp: kf.timestamp,
        pose: kf.corrected_pose,
        points,
    })
}

/// Timestamp with 15 significant digits, trailing zeros removed.
fn format_timestamp(t: f64) -> String {
    if t == 0.0 || !t.is_finite() {
        return format!("{t}");
    }
    let int_digits = t.abs().log10().floor() as i32 + 1;
    let decimals = (15 - int_digits).max(0) as usize;
    let s = format!("{t:.decimals$}");
    if s.contains('.') {
        s.trim_end_matches('0').trim_end_matches('.').to_string()
    } else {
        s
    }
}
