use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::Arc;

use bevy::app::AppExit;
use bevy::prelude::*;
use bevy::winit::WinitSettings;
use bevy_prototype_debug_lines::*;
use crossbeam_channel::{bounded, Receiver, Sender};
use parking_lot::Mutex;
use tracing::{debug, info};

use super::cloud::{PointCloud, DISPLAY_QUEUE};
use super::message::KeyframeMessage;
use super::{MapPublisher, OutputWrapper, Viewer};
use crate::error::Result;

/// Gray levels the point materials are quantized to.
const GRAY_LEVELS: usize = 16;

#[derive(Component)]
struct Body;
#[derive(Component)]
struct Point;

#[derive(Resource, Deref)]
struct KeyframeReceiver(Receiver<KeyframeMessage>);

#[derive(Resource, Deref)]
struct ShutdownReceiver(Receiver<()>);

/// Point entities spawned for every keyframe, replaced on republish.
#[derive(Resource, Default)]
struct IdMap(HashMap<usize, Vec<Entity>>);

#[derive(Resource, Default)]
struct Trajectory(BTreeMap<usize, Vec3>);

#[derive(Resource)]
struct PointAssets {
    mesh: Handle<Mesh>,
    materials: Vec<Handle<StandardMaterial>>,
}

/// Window showing keyframe poses, the trajectory and the point cloud.
pub struct BevyViewer {
    width: u32,
    height: u32,
    cloud: Arc<Mutex<PointCloud>>,
    display_tx: Sender<KeyframeMessage>,
    display_rx: Receiver<KeyframeMessage>,
    shutdown_tx: Sender<()>,
    shutdown_rx: Receiver<()>,
}

impl BevyViewer {
    pub fn new(width: u32, height: u32) -> Self {
        let (display_tx, display_rx) = bounded(DISPLAY_QUEUE);
        let (shutdown_tx, shutdown_rx) = bounded(1);
        Self {
            width,
            height,
            cloud: Arc::new(Mutex::new(PointCloud::default())),
            display_tx,
            display_rx,
            shutdown_tx,
            shutdown_rx,
        }
    }
}

impl Viewer for BevyViewer {
    fn publisher(&self) -> Box<dyn OutputWrapper> {
        Box::new(MapPublisher::new(Arc::clone(&self.cloud), self.display_tx.clone()))
    }

    /// The window event loop has to own the main thread.
    fn requires_foreground(&self) -> bool {
        true
    }

    fn run(&self) {
        info!("opening map viewer for {}x{} frames", self.width, self.height);
        App::new()
            .add_plugins(DefaultPlugins.set(WindowPlugin {
                primary_window: Some(Window {
                    title: "live_slam".into(),
                    resolution: (self.width.max(640) as f32, self.height.max(480) as f32).into(),
                    ..default()
                }),
                ..default()
            }))
            .insert_resource(WinitSettings {
                return_from_run: true,
                ..default()
            })
            .insert_resource(KeyframeReceiver(self.display_rx.clone()))
            .insert_resource(ShutdownReceiver(self.shutdown_rx.clone()))
            .add_plugin(ProcessMsgPlugin)
            .run();
        debug!("map viewer closed");
    }

    fn close(&self) {
        let _ = self.shutdown_tx.try_send(());
    }

    fn save_as_ply(&self, path: &Path) -> Result<()> {
        self.cloud.lock().write_ply(path)
    }
}

struct ProcessMsgPlugin;

impl Plugin for ProcessMsgPlugin {
    fn build(&self, app: &mut App) {
        app.init_resource::<IdMap>()
            .init_resource::<Trajectory>()
            .add_plugin(DebugLinesPlugin::default())
            .add_startup_system(startup)
            .add_system(receive_keyframes)
            .add_system(show_frame)
            .add_system(watch_shutdown);
    }
}

/// Camera frame (x right, y down, z forward) to the viewer's y-up frame.
fn to_view(p: [f32; 3]) -> Vec3 {
    Vec3::new(p[0], -p[1], -p[2])
}

fn startup(
    mut commands: Commands,
    mut meshes: ResMut<Assets<Mesh>>,
    mut materials: ResMut<Assets<StandardMaterial>>,
) {
    commands
        .spawn(PbrBundle {
            mesh: meshes.add(Mesh::from(shape::Box::new(0.06, 0.04, 0.02))),
            material: materials.add(Color::rgb(0.8, 0.7, 0.6).into()),
            ..default()
        })
        .insert(Body);

    commands.spawn(Camera3dBundle {
        transform: Transform::from_xyz(1.5, 1.5, 3.0).looking_at(Vec3::ZERO, Vec3::Y),
        ..default()
    });
    commands.spawn(PointLightBundle {
        transform: Transform::from_xyz(4.0, 8.0, 4.0),
        point_light: PointLight {
            intensity: 1000.0,
            range: 100.0,
            ..default()
        },
        ..default()
    });

    let levels = (0..GRAY_LEVELS)
        .map(|i| {
            let v = (i as f32 + 0.5) / GRAY_LEVELS as f32;
            materials.add(StandardMaterial {
                base_color: Color::rgb(v, v, v),
                unlit: true,
                ..default()
            })
        })
        .collect();
    commands.insert_resource(PointAssets {
        mesh: meshes.add(Mesh::from(shape::Cube { size: 0.005 })),
        materials: levels,
    });
}

fn show_frame(mut lines: ResMut<DebugLines>, trajectory: Res<Trajectory>) {
    lines.line_colored(Vec3::ZERO, Vec3::X * 0.2, 0.0, Color::RED);
    lines.line_colored(Vec3::ZERO, Vec3::Y * 0.2, 0.0, Color::GREEN);
    lines.line_colored(Vec3::ZERO, Vec3::Z * 0.2, 0.0, Color::BLUE);

    let positions: Vec<_> = trajectory.0.values().copied().collect();
    for pair in positions.windows(2) {
        lines.line_colored(pair[0], pair[1], 0.0, Color::YELLOW);
    }
}

fn receive_keyframes(
    mut commands: Commands,
    receiver: Res<KeyframeReceiver>,
    assets: Option<Res<PointAssets>>,
    mut id_map: ResMut<IdMap>,
    mut trajectory: ResMut<Trajectory>,
    mut query: Query<&mut Transform, With<Body>>,
) {
    let Some(assets) = assets else {
        return;
    };
    for keyframe in receiver.try_iter() {
        let position = to_view(keyframe.position());
        let newest = trajectory.0.keys().next_back().map_or(true, |id| keyframe.id >= *id);
        trajectory.0.insert(keyframe.id, position);

        if newest {
            if let Ok(mut body) = query.get_single_mut() {
                let [x, y, z, w] = keyframe.rotation();
                body.translation = position;
                body.rotation = Quat::from_xyzw(x, -y, -z, w);
            }
        }

        if let Some(old) = id_map.0.remove(&keyframe.id) {
            for entity in old {
                commands.entity(entity).despawn();
            }
        }
        let entities = keyframe
            .points
            .iter()
            .map(|p| {
                let level = p.intensity as usize * GRAY_LEVELS / 256;
                commands
                    .spawn(PbrBundle {
                        mesh: assets.mesh.clone(),
                        material: assets.materials[level].clone(),
                        transform: Transform::from_translation(to_view(p.position)),
                        ..default()
                    })
                    .insert(Point)
                    .id()
            })
            .collect();
        id_map.0.insert(keyframe.id, entities);
    }
}

fn watch_shutdown(receiver: Res<ShutdownReceiver>, mut exit: EventWriter<AppExit>) {
    if receiver.try_recv().is_ok() {
        exit.send(AppExit);
    }
}
