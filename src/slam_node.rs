use live_slam::node;
use tracing::info;

fn main() -> live_slam::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("live_slam=info")),
        )
        .init();

    // every argument is a key=value directive, ROS remappings are skipped by the parser
    let args: Vec<String> = std::env::args().skip(1).collect();

    let report = node::launch(&args)?;
    info!(
        "processed {} frames, trajectory in {:?} and {:?}",
        report.frames, report.trajectory, report.uncorrected_trajectory
    );
    if let Some(cloud) = &report.point_cloud {
        info!("point cloud in {cloud:?}");
    }
    Ok(())
}
