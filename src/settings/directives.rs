use std::path::PathBuf;

use tracing::{info, warn};

use super::{apply_preset, OperatingProfile, PhotometricMode, PointSelection};

/// Applies a directive value to the profile under construction.
/// `None` means the value could not be parsed.
type Setter = fn(&mut OperatingProfile, &str) -> Option<()>;

const DIRECTIVES: &[(&str, Setter)] = &[
    ("sampleoutput", sample_output),
    ("quiet", quiet),
    ("preset", preset),
    ("rec", reconfigure),
    ("noros", no_ros),
    ("nolog", no_log),
    ("reversePlay", reverse_play),
    ("nogui", no_gui),
    ("nomt", no_multi_threading),
    ("prefetch", prefetch),
    ("start", start),
    ("end", end),
    ("loopclosing", loop_closing),
    ("pointselection", point_selection),
    ("files", files),
    ("vocab", vocab),
    ("calib", calib),
    ("vignette", vignette),
    ("gamma", gamma),
    ("rescale", rescale),
    ("speed", speed),
    ("output", output),
    ("save", save),
    ("mode", mode),
];

/// Parse a single `name=value` directive into the profile.
///
/// Returns false when the directive was not understood; it is then left out.
pub(super) fn apply(profile: &mut OperatingProfile, arg: &str) -> bool {
    let accepted = arg
        .split_once('=')
        .and_then(|(name, value)| {
            DIRECTIVES
                .iter()
                .find(|(key, _)| *key == name.trim())
                .map(|(_, setter)| (setter, value))
        })
        .and_then(|(setter, value)| setter(profile, value))
        .is_some();

    if !accepted {
        warn!("could not parse argument \"{arg}\"");
    }
    accepted
}

fn parse_int(value: &str) -> Option<i64> {
    value.trim().parse().ok()
}

fn parse_float(value: &str) -> Option<f32> {
    value.trim().parse().ok().filter(|v: &f32| v.is_finite())
}

fn parse_flag(value: &str) -> Option<bool> {
    match parse_int(value)? {
        0 => Some(false),
        1 => Some(true),
        _ => None,
    }
}

fn parse_path(value: &str) -> Option<PathBuf> {
    let value = value.trim();
    (!value.is_empty()).then(|| PathBuf::from(value))
}

fn sample_output(p: &mut OperatingProfile, v: &str) -> Option<()> {
    p.toggles.sample_output = parse_flag(v)?;
    if p.toggles.sample_output {
        info!("using sample output wrapper");
    }
    Some(())
}

fn quiet(p: &mut OperatingProfile, v: &str) -> Option<()> {
    p.toggles.quiet = parse_flag(v)?;
    if p.toggles.quiet {
        info!("quiet mode, per-frame output suppressed");
    }
    Some(())
}

fn preset(p: &mut OperatingProfile, v: &str) -> Option<()> {
    apply_preset(p, parse_int(v)?).then_some(())
}

fn reconfigure(p: &mut OperatingProfile, v: &str) -> Option<()> {
    p.toggles.reconfigure = parse_flag(v)?;
    info!(
        "live reconfiguration {}",
        if p.toggles.reconfigure { "enabled" } else { "disabled" }
    );
    Some(())
}

fn no_ros(p: &mut OperatingProfile, v: &str) -> Option<()> {
    let disable = parse_flag(v)?;
    p.toggles.ros = !disable;
    if disable {
        p.toggles.reconfigure = false;
        info!("ROS transport (and reconfiguration) disabled");
    }
    Some(())
}

fn no_log(p: &mut OperatingProfile, v: &str) -> Option<()> {
    p.toggles.log_stuff = !parse_flag(v)?;
    if !p.toggles.log_stuff {
        info!("engine log files disabled");
    }
    Some(())
}

fn reverse_play(p: &mut OperatingProfile, v: &str) -> Option<()> {
    p.playback.reverse = parse_flag(v)?;
    if p.playback.reverse {
        info!("reverse playback");
    }
    Some(())
}

fn no_gui(p: &mut OperatingProfile, v: &str) -> Option<()> {
    p.toggles.visualization = !parse_flag(v)?;
    if !p.toggles.visualization {
        info!("no gui");
    }
    Some(())
}

fn no_multi_threading(p: &mut OperatingProfile, v: &str) -> Option<()> {
    p.toggles.multi_threading = !parse_flag(v)?;
    if !p.toggles.multi_threading {
        info!("multi-threading disabled");
    }
    Some(())
}

fn prefetch(p: &mut OperatingProfile, v: &str) -> Option<()> {
    p.playback.prefetch = parse_flag(v)?;
    if p.playback.prefetch {
        info!("prefetch enabled");
    }
    Some(())
}

fn start(p: &mut OperatingProfile, v: &str) -> Option<()> {
    p.playback.start = v.trim().parse().ok()?;
    info!("start at {}", p.playback.start);
    Some(())
}

fn end(p: &mut OperatingProfile, v: &str) -> Option<()> {
    p.playback.end = v.trim().parse().ok()?;
    info!("end at {}", p.playback.end);
    Some(())
}

fn loop_closing(p: &mut OperatingProfile, v: &str) -> Option<()> {
    p.toggles.loop_closing = parse_flag(v)?;
    info!(
        "loop closing {}",
        if p.toggles.loop_closing { "enabled" } else { "disabled" }
    );
    Some(())
}

fn point_selection(p: &mut OperatingProfile, v: &str) -> Option<()> {
    p.point_selection = PointSelection::from_index(parse_int(v)?)?;
    info!("point selection {:?}", p.point_selection);
    Some(())
}

fn files(p: &mut OperatingProfile, v: &str) -> Option<()> {
    p.paths.source = parse_path(v)?;
    info!("loading data from {:?}", p.paths.source);
    Some(())
}

fn vocab(p: &mut OperatingProfile, v: &str) -> Option<()> {
    p.paths.vocabulary = parse_path(v)?;
    info!("loading vocabulary from {:?}", p.paths.vocabulary);
    Some(())
}

fn calib(p: &mut OperatingProfile, v: &str) -> Option<()> {
    p.paths.calibration = parse_path(v)?;
    info!("loading calibration from {:?}", p.paths.calibration);
    Some(())
}

fn vignette(p: &mut OperatingProfile, v: &str) -> Option<()> {
    p.paths.vignette = parse_path(v)?;
    info!("loading vignette from {:?}", p.paths.vignette);
    Some(())
}

fn gamma(p: &mut OperatingProfile, v: &str) -> Option<()> {
    p.paths.gamma = parse_path(v)?;
    info!("loading gamma calibration from {:?}", p.paths.gamma);
    Some(())
}

fn rescale(p: &mut OperatingProfile, v: &str) -> Option<()> {
    p.rescale = parse_float(v).filter(|s| *s > 0.0)?;
    info!("rescale {}", p.rescale);
    Some(())
}

fn speed(p: &mut OperatingProfile, v: &str) -> Option<()> {
    p.playback_speed = parse_float(v)?;
    info!("playback speed {}", p.playback_speed);
    Some(())
}

fn output(p: &mut OperatingProfile, v: &str) -> Option<()> {
    p.paths.output = parse_path(v)?;
    info!("output set to {:?}", p.paths.output);
    Some(())
}

fn save(p: &mut OperatingProfile, v: &str) -> Option<()> {
    p.toggles.save_images = parse_flag(v)?;
    if p.toggles.save_images {
        info!("saving keyframe images to images_out/");
    }
    Some(())
}

fn mode(p: &mut OperatingProfile, v: &str) -> Option<()> {
    p.photometric_mode = PhotometricMode::from_index(parse_int(v)?)?;
    match p.photometric_mode {
        PhotometricMode::Calibrated => info!("photometric mode with calibration"),
        PhotometricMode::UncalibratedOptimizeAffine => {
            info!("photometric mode without calibration")
        }
        PhotometricMode::UncalibratedFixedAffine => {
            info!("photometric mode with perfect images")
        }
    }
    Some(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_key_is_unique() {
        for (i, (key, _)) in DIRECTIVES.iter().enumerate() {
            assert!(
                DIRECTIVES[i + 1..].iter().all(|(other, _)| other != key),
                "duplicate directive {key}"
            );
        }
    }

    #[test]
    fn value_may_contain_equals_sign() {
        let mut p = OperatingProfile::default();
        assert!(apply(&mut p, "output=run=1.txt"));
        assert_eq!(p.paths.output, PathBuf::from("run=1.txt"));
    }

    #[test]
    fn rejects_out_of_range_flags() {
        let mut p = OperatingProfile::default();
        assert!(!apply(&mut p, "nogui=2"));
        assert!(p.toggles.visualization);
        assert!(!apply(&mut p, "rescale=0"));
        assert_eq!(p.rescale, 1.0);
    }
}
