use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use emocam_core::classifier::DEFAULT_BACKEND_URL;
use emocam_core::{Classifier, ClassifyOutcome, HttpClassifier};
use emocam_hw::frame::{is_dark_frame, DEFAULT_JPEG_QUALITY};
use emocam_hw::{Camera, CameraOpener, CaptureRequest, Frame, FrameEncoder, V4lOpener, VideoSource};
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Parser)]
#[command(name = "emocam", about = "emocam diagnostics: classifier probe, cameras, one-shot classification")]
struct Cli {
    /// Classifier service root
    #[arg(long, global = true, default_value = DEFAULT_BACKEND_URL)]
    url: String,

    /// Request timeout in seconds
    #[arg(long, global = true, default_value_t = 10)]
    timeout: u64,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Probe the classifier's /health endpoint
    Health,
    /// List V4L2 capture devices
    Devices,
    /// Capture one frame and classify it
    Snap {
        #[arg(short, long, default_value = "/dev/video0")]
        device: String,
        #[arg(long, default_value_t = 640)]
        width: u32,
        #[arg(long, default_value_t = 480)]
        height: u32,
        #[arg(short, long, default_value_t = DEFAULT_JPEG_QUALITY)]
        quality: u8,
        /// Also write the captured JPEG here
        #[arg(short, long)]
        save: Option<PathBuf>,
    },
    /// Classify an image file
    Classify {
        path: PathBuf,
        #[arg(short, long, default_value_t = DEFAULT_JPEG_QUALITY)]
        quality: u8,
    },
}

fn outcome_json(outcome: &ClassifyOutcome) -> serde_json::Value {
    match outcome {
        ClassifyOutcome::Face(reading) => serde_json::json!({
            "faces_detected": 1,
            "emotion": reading.emotion,
            "confidence": reading.confidence,
            "confidence_percent": reading.confidence_percent(),
            "emotion_distribution": reading.distribution,
        }),
        ClassifyOutcome::NoFace => serde_json::json!({ "faces_detected": 0 }),
    }
}

fn load_image(path: &Path) -> Result<Frame> {
    let img = image::open(path)
        .with_context(|| format!("reading image {}", path.display()))?
        .to_rgb8();
    let (width, height) = img.dimensions();
    Ok(Frame::new(img.into_raw(), width, height, 0)?)
}

fn snap(
    classifier: &dyn Classifier,
    request: &CaptureRequest,
    quality: u8,
    save: Option<&PathBuf>,
) -> Result<ClassifyOutcome> {
    let mut source = V4lOpener.open(request)?;
    let frame = source.capture()?;
    tracing::info!(
        camera = %source.describe(),
        width = frame.width,
        height = frame.height,
        brightness = frame.avg_brightness(),
        "frame captured"
    );
    if is_dark_frame(&frame, 0.95) {
        eprintln!("warning: frame is almost entirely dark");
    }

    let mut encoder = FrameEncoder::new(quality);
    if let Some(path) = save {
        let jpeg = encoder.encode_jpeg(&frame)?;
        std::fs::write(path, jpeg).with_context(|| format!("writing {}", path.display()))?;
        eprintln!("saved {}", path.display());
    }
    let payload = encoder.encode_data_url(&frame)?;
    drop(source);

    Ok(classifier.classify(&payload)?)
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let classifier = HttpClassifier::new(&cli.url, Duration::from_secs(cli.timeout));

    match cli.command {
        Commands::Health => {
            let report = tokio::task::spawn_blocking(move || classifier.health())
                .await?
                .with_context(|| format!("classifier at {} unreachable", cli.url))?;
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        Commands::Devices => {
            let devices = tokio::task::spawn_blocking(Camera::list_devices).await?;
            if devices.is_empty() {
                println!("No V4L2 capture devices found");
            }
            for dev in devices {
                println!("{}  {} ({}, {})", dev.path, dev.name, dev.driver, dev.bus);
            }
        }
        Commands::Snap {
            device,
            width,
            height,
            quality,
            save,
        } => {
            let request = CaptureRequest {
                device,
                width,
                height,
            };
            let outcome = tokio::task::spawn_blocking(move || {
                snap(&classifier, &request, quality, save.as_ref())
            })
            .await??;
            println!("{}", serde_json::to_string_pretty(&outcome_json(&outcome))?);
        }
        Commands::Classify { path, quality } => {
            let outcome = tokio::task::spawn_blocking(move || -> Result<ClassifyOutcome> {
                let frame = load_image(&path)?;
                let payload = FrameEncoder::new(quality).encode_data_url(&frame)?;
                Ok(classifier.classify(&payload)?)
            })
            .await??;
            println!("{}", serde_json::to_string_pretty(&outcome_json(&outcome))?);
        }
    }

    Ok(())
}
