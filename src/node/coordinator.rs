//! Node lifecycle: setup, the ingestion worker next to the viewer loop, and
//! the export sequence once the frame stream ends.

use std::fs;
use std::path::PathBuf;
use std::sync::Arc;
use std::thread;

use parking_lot::Mutex;
use tracing::{error, info};

use super::exporter;
use super::pipeline::IngestionPipeline;
use super::transport::{self, FrameSource};
use crate::error::{Result, SlamError};
use crate::settings::{self, OperatingProfile};
use crate::slam::calib::GlobalCalib;
use crate::slam::frame::FrameCorrector;
use crate::slam::system::{FullSystem, MappingEngine, IMAGES_DIR};
use crate::slam::undistort::{UndistortOptions, Undistorter};
use crate::slam::vocabulary::Vocabulary;
use crate::visualizer::{create_viewer, SampleOutputWrapper, Viewer};

pub const POINT_CLOUD_PATH: &str = "./pointcloud.ply";

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Phase {
    Unconfigured,
    Configured,
    Running,
    Draining,
    Terminated,
}

impl Phase {
    fn next(self) -> Option<Phase> {
        match self {
            Phase::Unconfigured => Some(Phase::Configured),
            Phase::Configured => Some(Phase::Running),
            Phase::Running => Some(Phase::Draining),
            Phase::Draining => Some(Phase::Terminated),
            Phase::Terminated => None,
        }
    }
}

/// Current phase, shared between the coordinator and its worker.
#[derive(Debug)]
pub struct Lifecycle(Mutex<Phase>);

impl Lifecycle {
    pub fn new() -> Self {
        Self(Mutex::new(Phase::Unconfigured))
    }

    pub fn phase(&self) -> Phase {
        *self.0.lock()
    }

    /// Panics on anything but the next phase in order.
    pub fn advance(&self, to: Phase) {
        let mut phase = self.0.lock();
        assert!(
            phase.next() == Some(to),
            "illegal lifecycle transition {:?} -> {to:?}",
            *phase
        );
        info!("{:?} -> {to:?}", *phase);
        *phase = to;
    }
}

impl Default for Lifecycle {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct RunReport {
    pub frames: usize,
    pub trajectory: PathBuf,
    pub uncorrected_trajectory: PathBuf,
    pub point_cloud: Option<PathBuf>,
}

/// A configured node: the single owner of the undistortion model, the
/// mapping engine and the viewer.
pub struct Node<E: MappingEngine> {
    profile: OperatingProfile,
    undistorter: Undistorter,
    engine: E,
    viewer: Option<Box<dyn Viewer>>,
    lifecycle: Lifecycle,
    point_cloud_path: PathBuf,
}

impl Node<FullSystem> {
    /// Builds every collaborator from the profile. Any failure is fatal.
    pub fn configure(profile: OperatingProfile) -> Result<Self> {
        let undistorter = Undistorter::for_calibration_files(
            &profile.paths.calibration,
            &profile.paths.gamma,
            &profile.paths.vignette,
            &UndistortOptions::from(&profile),
        )?;
        let (width, height) = undistorter.output_size();
        let calib = GlobalCalib::new(width, height, &undistorter.intrinsics());

        let vocabulary = Arc::new(Vocabulary::load(&profile.paths.vocabulary)?);
        info!("vocabulary with {} words", vocabulary.len());

        if profile.toggles.save_images {
            if let Err(e) = fs::remove_dir_all(IMAGES_DIR) {
                if e.kind() != std::io::ErrorKind::NotFound {
                    return Err(e.into());
                }
            }
            fs::create_dir_all(IMAGES_DIR)?;
        }

        let engine = FullSystem::new(&profile, calib, vocabulary)?;
        let viewer = create_viewer(&profile, width, height);
        Ok(Self::from_parts(profile, undistorter, engine, viewer))
    }
}

impl<E: MappingEngine + Send> Node<E> {
    /// Wires already constructed collaborators together.
    pub fn from_parts(
        profile: OperatingProfile,
        undistorter: Undistorter,
        mut engine: E,
        viewer: Option<Box<dyn Viewer>>,
    ) -> Self {
        let lifecycle = Lifecycle::new();

        engine.set_linearize_operation(profile.linearize_operation());
        if let Some(photometric) = undistorter.photometric() {
            engine.set_gamma_function(photometric.g());
        }
        if let Some(viewer) = &viewer {
            engine.set_viewer(viewer.publisher());
        }
        if profile.toggles.sample_output {
            engine.set_viewer(Box::new(SampleOutputWrapper::default()));
        }

        lifecycle.advance(Phase::Configured);
        Self {
            profile,
            undistorter,
            engine,
            viewer,
            lifecycle,
            point_cloud_path: PathBuf::from(POINT_CLOUD_PATH),
        }
    }

    pub fn with_point_cloud_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.point_cloud_path = path.into();
        self
    }

    pub fn profile(&self) -> &OperatingProfile {
        &self.profile
    }

    pub fn phase(&self) -> Phase {
        self.lifecycle.phase()
    }

    /// Ingests frames from `source` until its stream ends, then exports the
    /// trajectories and, once the worker is joined, the point cloud.
    pub fn run(self, source: Box<dyn FrameSource>) -> Result<RunReport> {
        let Node {
            profile,
            undistorter,
            mut engine,
            viewer,
            lifecycle,
            point_cloud_path,
        } = self;

        lifecycle.advance(Phase::Running);
        let subscription = source.subscribe()?;

        let (profile, undistorter, lifecycle) = (&profile, &undistorter, &lifecycle);
        let engine = &mut engine;
        let viewer = viewer.as_deref();

        let worker_result = thread::scope(|s| -> Result<_> {
            let worker = thread::Builder::new()
                .name("ingestion".into())
                .spawn_scoped(s, move || -> Result<_> {
                    let corrector = FrameCorrector::new(undistorter, profile);
                    let mut pipeline = IngestionPipeline::new(corrector, &mut *engine);
                    for frame in subscription.iter() {
                        pipeline.on_frame(frame);
                    }
                    let frames = pipeline.frames();
                    info!("frame stream ended after {frames} frames");
                    subscription.finish()?;

                    lifecycle.advance(Phase::Draining);
                    let (trajectory, uncorrected) = exporter::export_trajectories(engine, profile)?;
                    Ok((frames, trajectory, uncorrected))
                })?;

            let display = match viewer {
                Some(viewer) if viewer.requires_foreground() => {
                    viewer.run();
                    None
                }
                Some(viewer) => Some(
                    thread::Builder::new()
                        .name("viewer".into())
                        .spawn_scoped(s, move || viewer.run())?,
                ),
                None => None,
            };

            let outcome = worker.join().map_err(|_| SlamError::WorkerPanicked);

            if let Some(viewer) = viewer {
                viewer.close();
            }
            if let Some(display) = display {
                if display.join().is_err() {
                    error!("viewer thread panicked");
                }
            }
            outcome
        })?;
        let (frames, trajectory, uncorrected_trajectory) = worker_result?;

        let point_cloud = match viewer {
            Some(viewer) => {
                exporter::export_point_cloud(viewer, &point_cloud_path)?;
                Some(point_cloud_path)
            }
            None => None,
        };
        lifecycle.advance(Phase::Terminated);

        Ok(RunReport {
            frames,
            trajectory,
            uncorrected_trajectory,
            point_cloud,
        })
    }
}

/// Resolves the configuration and hands the profile to `build`. A fatal
/// configuration error returns before anything is built.
pub fn launch_with<I, S, E, F>(directives: I, build: F) -> Result<RunReport>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
    E: MappingEngine + Send,
    F: FnOnce(OperatingProfile) -> Result<(Node<E>, Box<dyn FrameSource>)>,
{
    let profile = settings::resolve(None, directives)?;
    let (node, source) = build(profile)?;
    node.run(source)
}

/// Runs the node with the full mapping engine and the configured transport.
pub fn launch<I, S>(directives: I) -> Result<RunReport>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    launch_with(directives, |profile| {
        #[cfg(feature = "ros")]
        if profile.toggles.ros {
            rosrust::init("live_slam");
        }
        let node = Node::configure(profile)?;
        let source = transport::select_source(node.profile())?;
        Ok((node, source))
    })
}
