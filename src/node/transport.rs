//! Frame delivery. Every source pushes [`RawFrame`]s into a bounded channel;
//! the stream ends when all producers are gone.

use std::path::PathBuf;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam_channel::{bounded, Receiver, Sender};
use tracing::{debug, info, warn};

use crate::error::{Result, SlamError};
use crate::settings::{OperatingProfile, Playback};
use crate::slam::frame::RawFrame;
use crate::slam::load_data::{self, DataSet, DatasetEntry};

/// Frames a source may buffer ahead of the ingestion worker.
pub const FRAME_QUEUE: usize = 2;

pub trait FrameSource: Send {
    fn subscribe(self: Box<Self>) -> Result<Subscription>;
}

/// Live subscription to a frame source.
pub struct Subscription {
    receiver: Receiver<RawFrame>,
    producer: Option<JoinHandle<Result<()>>>,
}

impl Subscription {
    pub fn new(receiver: Receiver<RawFrame>, producer: Option<JoinHandle<Result<()>>>) -> Self {
        Self { receiver, producer }
    }

    /// Frames in arrival order, until end of stream.
    pub fn iter(&self) -> impl Iterator<Item = RawFrame> + '_ {
        self.receiver.iter()
    }

    /// Waits for the producer to exit and reports its outcome.
    pub fn finish(mut self) -> Result<()> {
        let Some(producer) = self.producer.take() else {
            return Ok(());
        };
        drop(self.receiver);
        producer
            .join()
            .map_err(|_| SlamError::Transport("frame producer panicked".into()))?
    }
}

/// Publishing side of an in-process frame channel.
#[derive(Clone)]
pub struct FramePublisher(Sender<RawFrame>);

impl FramePublisher {
    /// Blocks while the channel is full. Fails once the subscriber is gone.
    pub fn publish(&self, frame: RawFrame) -> Result<()> {
        self.0
            .send(frame)
            .map_err(|_| SlamError::Transport("subscriber disconnected".into()))
    }
}

pub struct ChannelSource(Receiver<RawFrame>);

impl FrameSource for ChannelSource {
    fn subscribe(self: Box<Self>) -> Result<Subscription> {
        Ok(Subscription::new(self.0, None))
    }
}

/// In-process transport. Dropping every publisher ends the stream.
pub fn channel(capacity: usize) -> (FramePublisher, ChannelSource) {
    let (tx, rx) = bounded(capacity);
    (FramePublisher(tx), ChannelSource(rx))
}

/// Replays a recorded dataset.
pub struct DatasetSource {
    path: PathBuf,
    data: DataSet,
    playback: Playback,
    speed: f32,
}

impl DatasetSource {
    pub fn open(profile: &OperatingProfile) -> Result<Self> {
        let path = profile.paths.source.clone();
        if path.as_os_str().is_empty() {
            return Err(SlamError::Config(
                "no frame source: files= is not set and ROS input is disabled or not built in"
                    .into(),
            ));
        }
        let data = load_data::load_dataset(&path)?;
        info!("dataset {path:?} with {} images", data.len());
        Ok(Self {
            path,
            data,
            playback: profile.playback.clone(),
            speed: profile.playback_speed,
        })
    }

    fn produce(self, tx: Sender<RawFrame>) -> Result<()> {
        let order = load_data::playback_order(self.data.len(), &self.playback);
        let entries: Vec<_> = order.iter().map(|&i| &self.data[i]).collect();
        let load = |entry: &DatasetEntry| match load_data::load_frame(entry) {
            Ok(frame) => Some(frame),
            Err(e) => {
                warn!("skipping {:?}: {e}", entry.img_name);
                None
            }
        };

        let preloaded: Option<Vec<_>> = if self.playback.prefetch || self.playback.preload {
            info!("loading {} images from {:?}", entries.len(), self.path);
            Some(entries.iter().map(|&e| load(e)).collect())
        } else {
            None
        };

        let start = Instant::now();
        let first_timestamp = entries.first().map_or(0.0, |e| e.timestamp);
        let mut frames = preloaded.map(Vec::into_iter);

        for entry in &entries {
            let frame = match &mut frames {
                Some(frames) => frames.next().flatten(),
                None => load(*entry),
            };
            let Some(frame) = frame else {
                continue;
            };

            if self.speed > 0.0 {
                let due = Duration::from_secs_f64(
                    (entry.timestamp - first_timestamp).abs() / self.speed as f64,
                );
                if let Some(wait) = due.checked_sub(start.elapsed()) {
                    thread::sleep(wait);
                }
            }

            if tx.send(frame).is_err() {
                debug!("subscriber gone, stopping playback");
                break;
            }
        }
        Ok(())
    }
}

impl FrameSource for DatasetSource {
    fn subscribe(self: Box<Self>) -> Result<Subscription> {
        let (tx, rx) = bounded(FRAME_QUEUE);
        let producer = thread::Builder::new()
            .name("playback".into())
            .spawn(move || self.produce(tx))?;
        Ok(Subscription::new(rx, Some(producer)))
    }
}

#[cfg(feature = "ros")]
pub use ros::RosSource;

#[cfg(feature = "ros")]
mod ros {
    use std::sync::Arc;

    use crossbeam_channel::{bounded, Sender};
    use image::{GrayImage, Luma};
    use parking_lot::Mutex;
    use rosrust_msg::sensor_msgs;
    use tracing::{info, warn};

    use super::{FrameSource, Subscription};
    use crate::error::{Result, SlamError};
    use crate::slam::frame::RawFrame;

    pub const IMAGE_TOPIC: &str = "image";

    /// Images from a ROS topic. The stream ends when the node shuts down.
    pub struct RosSource;

    fn to_luma(msg: &sensor_msgs::Image) -> Option<GrayImage> {
        let (w, h, step) = (msg.width, msg.height, msg.step as usize);
        let pixel = |x: u32, y: u32| -> Option<u8> {
            let row = msg.data.get(y as usize * step..)?;
            let x = x as usize;
            match msg.encoding.as_str() {
                "mono8" => row.get(x).copied(),
                "mono16" => {
                    let px = row.get(2 * x..2 * x + 2)?;
                    let v = if msg.is_bigendian != 0 {
                        u16::from_be_bytes([px[0], px[1]])
                    } else {
                        u16::from_le_bytes([px[0], px[1]])
                    };
                    Some((v >> 8) as u8)
                }
                "rgb8" | "bgr8" => {
                    let px = row.get(3 * x..3 * x + 3)?;
                    let (r, b) = if msg.encoding == "rgb8" {
                        (px[0], px[2])
                    } else {
                        (px[2], px[0])
                    };
                    let gray = 0.299 * r as f32 + 0.587 * px[1] as f32 + 0.114 * b as f32;
                    Some(gray.round() as u8)
                }
                _ => None,
            }
        };

        let mut img = GrayImage::new(w, h);
        for y in 0..h {
            for x in 0..w {
                img.put_pixel(x, y, Luma([pixel(x, y)?]));
            }
        }
        Some(img)
    }

    impl FrameSource for RosSource {
        fn subscribe(self: Box<Self>) -> Result<Subscription> {
            let (tx, rx) = bounded(1);
            let sender: Arc<Mutex<Option<Sender<RawFrame>>>> = Arc::new(Mutex::new(Some(tx)));

            let callback_sender = Arc::clone(&sender);
            let subscriber = rosrust::subscribe(IMAGE_TOPIC, 1, move |msg: sensor_msgs::Image| {
                let Some(img) = to_luma(&msg) else {
                    warn!("unsupported image encoding {:?}", msg.encoding);
                    return;
                };
                let timestamp = msg.header.stamp.seconds();
                if let Some(tx) = callback_sender.lock().as_ref() {
                    let _ = tx.send(RawFrame::new(img, timestamp));
                }
            })
            .map_err(|e| {
                SlamError::Transport(format!("could not subscribe to {IMAGE_TOPIC}: {e}"))
            })?;
            info!("subscribed to {IMAGE_TOPIC}");

            let producer = std::thread::Builder::new()
                .name("ros".into())
                .spawn(move || {
                    rosrust::spin();
                    drop(subscriber);
                    sender.lock().take();
                    Ok(())
                })?;
            Ok(Subscription::new(rx, Some(producer)))
        }
    }
}

/// Frame source for this run.
pub fn select_source(profile: &OperatingProfile) -> Result<Box<dyn FrameSource>> {
    #[cfg(feature = "ros")]
    if profile.toggles.ros {
        return Ok(Box::new(RosSource));
    }
    Ok(Box::new(DatasetSource::open(profile)?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::settings;
    use image::{GrayImage, Luma};
    use std::fs;

    fn timestamp(i: usize) -> f64 {
        10.0 + i as f64 * 0.02
    }

    fn write_folder(dir: &std::path::Path, count: usize) {
        let images = dir.join("images");
        fs::create_dir_all(&images).unwrap();
        let mut times = String::new();
        for i in 0..count {
            let name = format!("{i:05}.png");
            GrayImage::from_pixel(8, 6, Luma([i as u8 * 10])).save(images.join(&name)).unwrap();
            times.push_str(&format!("{i:05} {}\n", timestamp(i)));
        }
        fs::write(images.join("times.txt"), times).unwrap();
    }

    fn profile(dir: &std::path::Path, extra: &[&str]) -> OperatingProfile {
        let files = format!("files={}", dir.join("images").display());
        let mut args = vec![files.as_str(), "noros=1"];
        args.extend_from_slice(extra);
        settings::resolve(None, args).unwrap()
    }

    fn timestamps(source: Box<dyn FrameSource>) -> Vec<f64> {
        let subscription = source.subscribe().unwrap();
        let ts = subscription.iter().map(|f| f.timestamp).collect();
        subscription.finish().unwrap();
        ts
    }

    #[test]
    fn channel_ends_when_publishers_drop() {
        let (publisher, source) = channel(4);
        let subscription = Box::new(source).subscribe().unwrap();
        let producer = thread::spawn(move || {
            for i in 0..3 {
                publisher
                    .publish(RawFrame::new(GrayImage::new(4, 4), i as f64))
                    .unwrap();
            }
        });
        let ts: Vec<_> = subscription.iter().map(|f| f.timestamp).collect();
        producer.join().unwrap();
        assert_eq!(ts, vec![0.0, 1.0, 2.0]);
        subscription.finish().unwrap();
    }

    #[test]
    fn dataset_honours_window_and_order() {
        let dir = tempfile::tempdir().unwrap();
        write_folder(dir.path(), 6);

        let source = DatasetSource::open(&profile(dir.path(), &["start=1", "end=4"])).unwrap();
        let ts = timestamps(Box::new(source));
        assert_eq!(ts, (1..4).map(timestamp).collect::<Vec<_>>());

        let source =
            DatasetSource::open(&profile(dir.path(), &["reversePlay=1", "prefetch=1"])).unwrap();
        let ts = timestamps(Box::new(source));
        assert_eq!(ts.len(), 6);
        assert_eq!(ts[0], timestamp(5));
        assert!(ts.windows(2).all(|w| w[0] > w[1]));
    }

    #[test]
    fn unreadable_images_are_skipped_with_or_without_prefetch() {
        let dir = tempfile::tempdir().unwrap();
        write_folder(dir.path(), 5);
        fs::write(dir.path().join("images").join("00002.png"), b"not a png").unwrap();
        let expected: Vec<_> = [0, 1, 3, 4].into_iter().map(timestamp).collect();

        for extra in [&[][..], &["prefetch=1"]] {
            let source = DatasetSource::open(&profile(dir.path(), extra)).unwrap();
            assert_eq!(timestamps(Box::new(source)), expected, "{extra:?}");
        }
    }

    #[test]
    fn realtime_playback_is_paced() {
        let dir = tempfile::tempdir().unwrap();
        write_folder(dir.path(), 4);
        let source = DatasetSource::open(&profile(dir.path(), &["speed=1"])).unwrap();
        let started = Instant::now();
        assert_eq!(timestamps(Box::new(source)).len(), 4);
        assert!(started.elapsed() >= Duration::from_millis(55));
    }

    #[test]
    fn missing_files_is_fatal() {
        let profile = settings::resolve(None, ["noros=1"]).unwrap();
        let Err(SlamError::Config(message)) = DatasetSource::open(&profile) else {
            panic!("expected a configuration error");
        };
        assert!(message.contains("files= is not set"), "{message}");
        assert!(message.contains("not built in"), "{message}");
    }
}
