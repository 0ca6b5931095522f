use std::fs;
use std::path::{Path, PathBuf};

use tracing::{info, warn};

use super::frame::RawFrame;
use crate::error::{Result, SlamError};
use crate::settings::Playback;

/// Frame spacing assumed when an image folder has no `times.txt`.
const DEFAULT_FRAME_INTERVAL: f64 = 0.05;

#[derive(Clone, Debug, PartialEq)]
pub struct DatasetEntry {
    /// Capture time in seconds.
    pub timestamp: f64,
    pub img_name: PathBuf,
}

pub type DataSet = Vec<DatasetEntry>;

/// Load a recorded sequence. A directory with `data.csv` is read as a EuRoC
/// camera folder, anything else as a plain image folder.
pub fn load_dataset(path: &Path) -> Result<DataSet> {
    let data_set = if path.join("data.csv").is_file() {
        load_euroc_data(path)?
    } else {
        load_image_folder(path)?
    };
    info!("found {} images in {path:?}", data_set.len());
    Ok(data_set)
}

/// EuRoC layout: `data.csv` with `timestamp [ns],filename` rows and the
/// images under `data/`.
pub fn load_euroc_data(path: &Path) -> Result<DataSet> {
    let csv_path = path.join("data.csv");
    let img_path = path.join("data");
    let file = fs::File::open(&csv_path)
        .map_err(|e| SlamError::Dataset(format!("could not open {csv_path:?}: {e}")))?;

    let mut reader = csv::ReaderBuilder::new()
        .has_headers(true)
        .trim(csv::Trim::All)
        .from_reader(file);

    let mut data_set = Vec::new();

    for record in reader.records() {
        let line = record?;
        let (Some(timestamp), Some(img_name)) = (line.get(0), line.get(1)) else {
            warn!("skipping short record {:?}", line.position());
            continue;
        };
        let timestamp = match timestamp.parse::<u64>() {
            Ok(timestamp) => timestamp,
            Err(e) => {
                warn!("skipping record with timestamp \"{timestamp}\": {e}");
                continue;
            }
        };

        data_set.push(DatasetEntry {
            timestamp: timestamp as f64 * 1e-9,
            img_name: img_path.join(img_name),
        });
    }

    Ok(data_set)
}

/// Folder of images sorted by name, with optional `times.txt` lines of
/// `name timestamp [exposure]` next to the folder or inside it.
pub fn load_image_folder(path: &Path) -> Result<DataSet> {
    let mut images: Vec<PathBuf> = fs::read_dir(path)
        .map_err(|e| SlamError::Dataset(format!("could not read {path:?}: {e}")))?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|p| is_image(p))
        .collect();
    images.sort();

    let times = [path.join("times.txt"), path.join("../times.txt")]
        .into_iter()
        .find(|p| p.is_file())
        .map(|p| read_times(&p))
        .transpose()?;

    let data_set = images
        .into_iter()
        .enumerate()
        .map(|(i, img_name)| {
            let stem = img_name
                .file_stem()
                .map(|s| s.to_string_lossy().into_owned())
                .unwrap_or_default();
            let timestamp = times
                .as_ref()
                .and_then(|t| {
                    t.iter()
                        .find(|(name, _)| *name == stem)
                        .or_else(|| t.get(i))
                        .map(|(_, ts)| *ts)
                })
                .unwrap_or(i as f64 * DEFAULT_FRAME_INTERVAL);
            DatasetEntry { timestamp, img_name }
        })
        .collect();

    Ok(data_set)
}

fn is_image(path: &Path) -> bool {
    matches!(
        path.extension()
            .and_then(|e| e.to_str())
            .map(str::to_ascii_lowercase)
            .as_deref(),
        Some("png" | "jpg" | "jpeg" | "pgm" | "bmp")
    )
}

fn read_times(path: &Path) -> Result<Vec<(String, f64)>> {
    let text = fs::read_to_string(path)?;
    let mut times = Vec::new();
    for line in text.lines().filter(|l| !l.trim().is_empty() && !l.starts_with('#')) {
        let mut parts = line.split_whitespace();
        match (parts.next(), parts.next().map(str::parse::<f64>)) {
            (Some(name), Some(Ok(ts))) => times.push((name.to_string(), ts)),
            _ => warn!("skipping line \"{line}\" in {path:?}"),
        }
    }
    Ok(times)
}

/// Indices of the entries inside the playback window, in delivery order.
pub fn playback_order(len: usize, playback: &Playback) -> Vec<usize> {
    let end = playback.end.min(len);
    let start = playback.start.min(end);
    if playback.reverse {
        (start..end).rev().collect()
    } else {
        (start..end).collect()
    }
}

/// Read one image and convert it to single-channel 8-bit.
pub fn load_frame(entry: &DatasetEntry) -> Result<RawFrame> {
    let img = image::open(&entry.img_name)?;
    Ok(RawFrame::new(img.into_luma8(), entry.timestamp))
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{GrayImage, Luma, RgbImage};

    #[test]
    fn test_read_csv() -> std::result::Result<(), Box<dyn std::error::Error>> {
        let dir = tempfile::tempdir()?;
        fs::create_dir(dir.path().join("data"))?;
        fs::write(
            dir.path().join("data.csv"),
            "#timestamp [ns],filename\n\
             1403636579763555584,1403636579763555584.png\n\
             bogus,bogus.png\n\
             1403636579813555456,1403636579813555456.png\n",
        )?;

        let data_set = load_dataset(dir.path())?;
        assert_eq!(data_set.len(), 2);
        assert!((data_set[0].timestamp - 1403636579.763555584).abs() < 1e-6);
        assert_eq!(
            data_set[1].img_name,
            dir.path().join("data").join("1403636579813555456.png")
        );

        Ok(())
    }

    #[test]
    fn image_folder_with_times() -> std::result::Result<(), Box<dyn std::error::Error>> {
        let dir = tempfile::tempdir()?;
        let images = dir.path().join("images");
        fs::create_dir(&images)?;
        for name in ["00001", "00000", "00002"] {
            GrayImage::from_pixel(4, 3, Luma([9])).save(images.join(format!("{name}.png")))?;
        }
        fs::write(images.join("notes.txt"), "not an image")?;
        fs::write(
            dir.path().join("times.txt"),
            "00000 10.0 20.5\n00001 10.5 20.5\n00002 11.25 20.5\n",
        )?;

        let data_set = load_dataset(&images)?;
        let stamps: Vec<_> = data_set.iter().map(|e| e.timestamp).collect();
        assert_eq!(stamps, vec![10.0, 10.5, 11.25]);

        let frame = load_frame(&data_set[0])?;
        assert_eq!((frame.width(), frame.height()), (4, 3));
        assert_eq!(frame.timestamp, 10.0);
        Ok(())
    }

    #[test]
    fn color_images_are_converted_to_gray() -> std::result::Result<(), Box<dyn std::error::Error>> {
        let dir = tempfile::tempdir()?;
        RgbImage::from_pixel(5, 5, image::Rgb([200, 10, 10])).save(dir.path().join("a.png"))?;
        let data_set = load_dataset(dir.path())?;
        assert_eq!(data_set[0].timestamp, 0.0);
        let frame = load_frame(&data_set[0])?;
        assert!(frame.image.as_luma8().is_some());
        Ok(())
    }

    #[test]
    fn playback_window_and_direction() {
        let mut playback = Playback {
            start: 2,
            end: 5,
            ..Playback::default()
        };
        assert_eq!(playback_order(10, &playback), vec![2, 3, 4]);
        playback.reverse = true;
        assert_eq!(playback_order(10, &playback), vec![4, 3, 2]);
        assert_eq!(playback_order(3, &playback), vec![2]);
        playback.start = 7;
        assert!(playback_order(3, &playback).is_empty());
    }
}
