//! Drives the pipeline with a synthetic camera and detector and prints the
//! published events as JSON lines

use anyhow::Context;
use clap::Parser;
use percept_core::{LoggingConfig, Stamp};
use percept_vision::{
    BoundingBox, BoxAnnotator, CameraIntrinsics, DepthImage, Detector, Frame, ImageBuffer, PerceptionPipeline,
    PipelineConfig, RawDetection, VisionError,
};
use serde::Deserialize;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "synthetic_feed")]
#[command(about = "Run the perception pipeline on a synthetic RGB-D feed", long_about = None)]
#[command(version)]
struct Cli {
    /// Configuration file (TOML, YAML or JSON) with `logging` and `pipeline` sections
    #[arg(long, short)]
    config: Option<PathBuf>,

    /// Number of frames to feed
    #[arg(long, default_value = "90")]
    frames: u64,

    /// Feed rate in frames per second
    #[arg(long, default_value = "30")]
    fps: u32,

    /// Start a check-for-objects episode after this many frames
    #[arg(long, default_value = "30")]
    episode_after: u64,

    /// Episode deadline in milliseconds
    #[arg(long)]
    episode_deadline_ms: Option<u64>,

    /// Colour and calibration only
    #[arg(long)]
    monocular: bool,

    /// Log level override (error, warn, info, debug, trace)
    #[arg(long)]
    log_level: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct FeedConfig {
    logging: LoggingConfig,
    pipeline: PipelineConfig,
}

/// A person walking left to right, and a dog that shows up on every third frame
struct SyntheticDetector {
    width: f32,
}

impl Detector for SyntheticDetector {
    fn infer(&self, frame: &Frame) -> Result<Vec<RawDetection>, VisionError> {
        let step = (frame.sequence % 60) as f32 / 60.0;
        let mut detections = vec![RawDetection {
            class_id: 0,
            confidence: 0.85,
            bbox: BoundingBox::new(step * (self.width - 80.0), 200.0, 80.0, 220.0),
        }];
        if frame.sequence % 3 == 0 {
            detections.push(RawDetection {
                class_id: 16,
                confidence: 0.4,
                bbox: BoundingBox::new(40.0, 330.0, 120.0, 90.0),
            });
        }
        // Stand-in for inference latency
        std::thread::sleep(Duration::from_millis(15));
        Ok(detections)
    }
}

fn init_logging(logging: &LoggingConfig) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&logging.level));
    if logging.json {
        tracing_subscriber::fmt().json().with_env_filter(filter).with_target(false).init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).with_target(false).init();
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let mut config: FeedConfig = match &cli.config {
        Some(path) => percept_core::load_config(path)
            .with_context(|| format!("Failed to load {}", path.display()))?,
        None => FeedConfig::default(),
    };
    if let Some(level) = cli.log_level {
        config.logging.level = level;
    }
    if cli.monocular {
        config.pipeline.monocular = true;
    }
    init_logging(&config.logging);

    let pipeline_config = config.pipeline;
    let (width, height) = pipeline_config.resolution;
    let channels = pipeline_config.channels;
    let detector = Arc::new(SyntheticDetector { width: width as f32 });
    let pipeline = Arc::new(
        PerceptionPipeline::new(pipeline_config, detector)?.with_annotator(Arc::new(BoxAnnotator::default())),
    );

    let mut events = pipeline.subscribe();
    let printer = tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(event) => match serde_json::to_string(&event) {
                    Ok(line) => println!("{}", line),
                    Err(e) => warn!("Failed to encode event: {}", e),
                },
                Err(RecvError::Lagged(skipped)) => warn!("Event printer lagged, {} events skipped", skipped),
                Err(RecvError::Closed) => break,
            }
        }
    });

    let input = pipeline.start()?;
    // Camera 1.2 m above a flat floor, y axis pointing down
    pipeline.update_ground_plane([0.0, 1.0, 0.0], 1.2)?;

    let intrinsics = CameraIntrinsics::new(
        width as f64 * 0.8,
        width as f64 * 0.8,
        width as f64 / 2.0,
        height as f64 / 2.0,
    )?;
    let image = ImageBuffer::filled(width, height, channels, 96)?;
    let depth = DepthImage::new(width, height, vec![2.0; (width * height) as usize])?;
    let period = Duration::from_secs_f64(1.0 / cli.fps.max(1) as f64);

    let feeder = {
        let input = input.clone();
        let monocular = pipeline.config().monocular;
        let frames = cli.frames;
        tokio::task::spawn_blocking(move || -> Result<(), VisionError> {
            for i in 0..frames {
                let stamp = Stamp::from(period * i as u32);
                input.push_calibration(stamp, intrinsics.clone())?;
                if !monocular {
                    input.push_depth(stamp, depth.clone())?;
                }
                input.push_color(stamp, image.clone())?;
                std::thread::sleep(period);
            }
            Ok(())
        })
    };

    tokio::time::sleep(period * cli.episode_after.min(u32::MAX as u64) as u32).await;
    let deadline = cli.episode_deadline_ms.map(Duration::from_millis);
    match pipeline.check_for_objects(deadline) {
        Ok(ticket) => {
            let id = ticket.id();
            let result = ticket.result().await?;
            info!("Episode {} finished as {:?} after {:?}", id, result.state, result.elapsed);
            println!("{}", serde_json::to_string(&result)?);
        }
        Err(e) => warn!("Episode rejected: {}", e),
    }

    feeder.await??;
    tokio::time::sleep(Duration::from_millis(200)).await;

    let stopper = Arc::clone(&pipeline);
    tokio::task::spawn_blocking(move || stopper.stop()).await?;
    let metrics = pipeline.metrics();
    println!("{}", serde_json::to_string(&metrics)?);

    drop(pipeline);
    printer.abort();
    Ok(())
}
