//! emotion-relay: classifies the facial expression in camera frames and
//! relays it to a paired device through a realtime database.
//!
//! Usage:
//!   emotion-relay run                       # live camera until Ctrl-C
//!   emotion-relay classify face.jpg --json  # one still image
//!   emotion-relay watch                     # follow the partner's emotion

use clap::{Parser, Subcommand};
use emotion_relay::config::{AppConfig, LocatorKind};
use emotion_relay::error::{EmotionRelayError, Result};
use emotion_relay::locator::{FaceLocator, SeetaLocator};
use emotion_relay::pipeline::FramePipeline;
use emotion_relay::sink::{DeviceSlots, RealtimeDbSink, ResultSink};
use emotion_relay::{Classifier, Frame};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

type DynPipeline = FramePipeline<Box<dyn FaceLocator>, Box<dyn Classifier>>;

#[derive(Parser, Debug)]
#[command(name = "emotion-relay")]
#[command(author, version, about = "Facial emotion classifier relaying results to a paired device", long_about = None)]
struct Cli {
    /// JSON configuration file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Also write logs to this file
    #[arg(long, global = true)]
    log_file: Option<PathBuf>,

    /// Use the unpaired slot assignment (write "1", listen to "2")
    #[arg(long, global = true)]
    unpaired: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Classify live camera frames until interrupted
    Run,
    /// Classify a single image file
    Classify {
        /// Input image file
        image: PathBuf,

        /// Output the decision as JSON
        #[arg(short, long)]
        json: bool,

        /// Also publish the decision to this device's slot
        #[arg(short, long)]
        publish: bool,
    },
    /// Print the partner device's emotion whenever it changes
    Watch {
        /// Polling interval in milliseconds
        #[arg(long, default_value = "1000")]
        interval_ms: u64,
    },
}

/// Console logging filtered by `RUST_LOG`, plus an optional plain-text file
fn init_logging(log_file: Option<&Path>) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let file_layer = match log_file {
        Some(path) => {
            let file = std::fs::File::create(path)?;
            Some(fmt::layer().with_writer(Arc::new(file)).with_ansi(false))
        }
        None => None,
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(file_layer)
        .init();

    Ok(())
}

fn load_config(cli: &Cli) -> Result<AppConfig> {
    let mut config = match &cli.config {
        Some(path) => AppConfig::from_json_file(path)?,
        None => AppConfig::default(),
    };
    if cli.unpaired {
        config.sink.paired = false;
    }
    config.validate()?;
    Ok(config)
}

fn build_locator(config: &AppConfig) -> Result<Box<dyn FaceLocator>> {
    match config.locator {
        LocatorKind::Seeta => Ok(Box::new(SeetaLocator::new(
            &config.seeta_model_path,
            config.detection,
        )?)),
        #[cfg(feature = "opencv")]
        LocatorKind::Haar => Ok(Box::new(emotion_relay::locator::HaarCascadeLocator::new(
            &config.cascade_path.to_string_lossy(),
            config.detection,
        )?)),
        #[cfg(not(feature = "opencv"))]
        LocatorKind::Haar => Err(EmotionRelayError::Config(
            "the haar locator needs a build with the `opencv` feature".to_string(),
        )),
    }
}

#[cfg(feature = "onnx")]
fn build_classifier(config: &AppConfig) -> Result<Box<dyn Classifier>> {
    let classifier = emotion_relay::emotion::OnnxClassifier::new(
        &config.model_path.to_string_lossy(),
        config.execution,
    )?;
    info!("Loaded emotion model from {}", config.model_path.display());
    Ok(Box::new(classifier))
}

#[cfg(not(feature = "onnx"))]
fn build_classifier(_config: &AppConfig) -> Result<Box<dyn Classifier>> {
    Err(EmotionRelayError::ModelLoad(
        "no classifier backend: rebuild with the `onnx` feature".to_string(),
    ))
}

fn build_pipeline(config: &AppConfig) -> Result<DynPipeline> {
    Ok(FramePipeline::new(
        build_locator(config)?,
        build_classifier(config)?,
        config.score_fallback,
    ))
}

#[cfg(feature = "camera")]
fn build_sink(config: &AppConfig) -> Box<dyn ResultSink + Send> {
    match RealtimeDbSink::from_config(&config.sink) {
        Some(sink) => Box::new(sink),
        None => {
            warn!("sink.database_url is not set, results are only logged");
            Box::new(emotion_relay::sink::LogSink)
        }
    }
}

fn remote_sink(config: &AppConfig) -> Result<RealtimeDbSink> {
    RealtimeDbSink::from_config(&config.sink)
        .ok_or_else(|| EmotionRelayError::Config("sink.database_url is not set".to_string()))
}

#[cfg(feature = "camera")]
fn run(config: AppConfig) -> Result<()> {
    use emotion_relay::camera::CameraSource;
    use emotion_relay::pipeline::PipelineWorker;
    use emotion_relay::sink::SinkDispatcher;

    let slots = DeviceSlots::for_toggle(config.sink.paired);
    let dispatcher = SinkDispatcher::spawn(build_sink(&config), config.sink.queue_depth)?;
    let pipeline_config = config.clone();
    let worker = PipelineWorker::spawn(
        move || build_pipeline(&pipeline_config),
        dispatcher,
        slots,
    )?;
    info!("Publishing to {}, partner at {}", slots.write_key(), slots.listen_key());

    let mut camera = CameraSource::open(&config.camera, config.camera_rotation()?)?;
    let mailbox = worker.mailbox();
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;
    let result = runtime.block_on(capture_until_interrupted(&mut camera, &mailbox));

    camera.stop();
    worker.shutdown();
    result
}

#[cfg(feature = "camera")]
async fn capture_until_interrupted(
    camera: &mut emotion_relay::camera::CameraSource,
    mailbox: &emotion_relay::pipeline::FrameMailbox,
) -> Result<()> {
    tokio::select! {
        result = camera.run(mailbox) => result,
        signal = tokio::signal::ctrl_c() => {
            signal?;
            info!("Interrupted, shutting down");
            Ok(())
        }
    }
}

#[cfg(not(feature = "camera"))]
fn run(_config: AppConfig) -> Result<()> {
    Err(EmotionRelayError::CameraInit(
        "live capture needs a build with the `camera` feature".to_string(),
    ))
}

fn classify(config: &AppConfig, image: &Path, json: bool, publish: bool) -> Result<()> {
    let rgb = image::open(image)?.to_rgb8();
    let frame = Frame::from_rgb_image(rgb);
    let mut pipeline = build_pipeline(config)?;

    let Some(decision) = pipeline.process(&frame)? else {
        warn!("{} produced no decision", image.display());
        return Ok(());
    };

    if json {
        println!("{}", serde_json::to_string_pretty(&decision)?);
    } else {
        println!("{}", decision.display_value());
    }

    if publish {
        let slots = DeviceSlots::for_toggle(config.sink.paired);
        remote_sink(config)?.publish(&slots.write_key(), &decision.display_value())?;
        info!("Published to {}", slots.write_key());
    }
    Ok(())
}

fn watch(config: &AppConfig, interval: Duration) -> Result<()> {
    let sink = remote_sink(config)?;
    let key = DeviceSlots::for_toggle(config.sink.paired).listen_key();
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;
    runtime.block_on(poll_partner(&sink, &key, interval))
}

async fn poll_partner(sink: &RealtimeDbSink, key: &str, interval: Duration) -> Result<()> {
    let mut ticker = tokio::time::interval(interval);
    let mut last: Option<String> = None;
    info!("Watching {}", key);

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                match sink.read(key) {
                    Ok(value) if value != last => {
                        println!("{}", value.as_deref().unwrap_or("(unset)"));
                        last = value;
                    }
                    Ok(_) => {}
                    Err(e) => warn!("Failed to read {}: {}", key, e),
                }
            }
            signal = tokio::signal::ctrl_c() => {
                signal?;
                return Ok(());
            }
        }
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.log_file.as_deref())?;
    let config = load_config(&cli)?;

    match cli.command {
        Command::Run => run(config),
        Command::Classify {
            ref image,
            json,
            publish,
        } => classify(&config, image, json, publish),
        Command::Watch { interval_ms } => watch(&config, Duration::from_millis(interval_ms)),
    }
}
