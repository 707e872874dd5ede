mod frame_sources;

use anyhow::Context;
use clap::Parser;
use cloud_chamber::parallel_pipeline::ParallelPipeline;
use cloud_chamber::pipeline::{measure_particles, reduce, FrameSource, ParticleRecord};
use cloud_chamber::Config;
use frame_sources::ImageSequence;
use std::fs::File;
use std::io::BufWriter;
use std::path::{Path, PathBuf};

/// Extracts particle tracks from a cloud chamber recording.
#[derive(Parser, Debug)]
#[command(version, about)]
struct Args {
    /// A directory of frame images, or a video file (needs the `video` feature).
    input: PathBuf,

    /// TOML file overriding the default configuration.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Where to write the particle records.
    #[arg(short, long, default_value = "particles.json")]
    output: PathBuf,

    /// Frame rate of an image directory.
    #[arg(long, default_value_t = 25.0)]
    fps: f64,

    /// Preprocessing workers. Defaults to the number of CPUs.
    #[arg(short, long)]
    workers: Option<usize>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // --- 1. Argument Parsing & Setup ---
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();
    let config = load_config(args.config.as_deref())?;

    // --- 2. Pipeline Initialization ---
    let pipeline = match args.workers {
        Some(workers) => ParallelPipeline::with_workers(config.clone(), workers)?,
        None => ParallelPipeline::new(config.clone())?,
    };
    log::info!("Processing {} with {} workers", args.input.display(), pipeline.workers());

    // --- 3. Detection & Association ---
    let (tracks, mut source) = if args.input.is_dir() {
        // Image files decode independently, so the workers read them too.
        let sequence = ImageSequence::open(&args.input, args.fps)?;
        let tracks = pipeline.process_indexed(sequence.len(), sequence.loader()).await?;
        let source: Box<dyn FrameSource> = Box::new(sequence);
        (tracks, source)
    } else {
        let mut video = open_video(&args.input)?;
        let tracks = pipeline.process(video.frames()).await?;
        (tracks, video)
    };

    // --- 4. Particle Reduction ---
    let track_count = tracks.len();
    let mut particles = reduce(tracks, &config);
    measure_particles(&mut particles, source.as_mut(), &config)?;
    log::info!("{} of {track_count} tracks became particles", particles.len());
    for particle in &particles {
        log::info!("{particle}");
    }

    // --- 5. Output ---
    let records: Vec<ParticleRecord> = particles.iter().map(|p| p.record()).collect();
    let file = File::create(&args.output)
        .with_context(|| format!("creating {}", args.output.display()))?;
    serde_json::to_writer_pretty(BufWriter::new(file), &records)?;
    log::info!("Wrote {}", args.output.display());
    Ok(())
}

fn load_config(path: Option<&Path>) -> anyhow::Result<Config> {
    let Some(path) = path else {
        return Ok(Config::default());
    };
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("reading {}", path.display()))?;
    let config: Config =
        toml::from_str(&text).with_context(|| format!("parsing {}", path.display()))?;
    config.validate()?;
    Ok(config)
}

fn open_video(input: &Path) -> anyhow::Result<Box<dyn FrameSource>> {
    #[cfg(feature = "video")]
    {
        Ok(Box::new(frame_sources::VideoFile::open(input)?))
    }
    #[cfg(not(feature = "video"))]
    {
        anyhow::bail!(
            "{} is not a directory; video input needs the `video` feature",
            input.display()
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cloud_chamber::{BgMethod, GateBoundary};

    #[test]
    fn partial_config_keeps_defaults() {
        let config: Config = toml::from_str(
            r#"
                bg_method = "replace_on_quiescence"
                gate = "exclusive"
                track_distance = 40.0

                [crop_box]
                top = 12
            "#,
        )
        .unwrap();
        assert_eq!(config.bg_method, BgMethod::ReplaceOnQuiescence);
        assert_eq!(config.gate, GateBoundary::Exclusive);
        assert_eq!(config.track_distance, 40.0);
        assert_eq!(config.crop_box.top, 12);
        assert_eq!(config.crop_box.left, 0);
        assert_eq!(config.bg_batch_size, Config::default().bg_batch_size);
    }

    #[test]
    fn invalid_config_file_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.toml");
        std::fs::write(&path, "blur_size = 4").unwrap();
        assert!(load_config(Some(path.as_path())).is_err());
        assert!(load_config(None).is_ok());
    }

    #[test]
    fn records_serialize_to_json() {
        let record = ParticleRecord {
            source: "run".to_string(),
            start_index: 3,
            end_index: 12,
            start_time: 0.12,
            end_time: 0.48,
            best_index: 7,
            extent: 9,
            duration: 0.36,
            width: 4.0,
            length: 80.0,
            angle: 12.5,
            curvature: 0.002,
            intensity: None,
        };
        let json = serde_json::to_value(&record).unwrap();
        assert_eq!(json["best_index"], 7);
        assert!(json["intensity"].is_null());
        let back: ParticleRecord = serde_json::from_value(json).unwrap();
        assert_eq!(back, record);
    }
}
