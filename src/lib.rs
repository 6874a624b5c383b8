// Library exports for emotion-relay: camera frames in, emotion labels out

#[cfg(feature = "camera")]
pub mod camera;
pub mod color;
pub mod config;
pub mod emotion;
pub mod error;
pub mod locator;
pub mod models;
pub mod pipeline;
pub mod preprocess;
pub mod sink;

pub use config::AppConfig;
pub use emotion::{decide, Classifier, ExecutionStrategy, ScoreFallback};
pub use error::{EmotionRelayError, Result};
pub use locator::{FaceLocator, LocatorParams};
pub use models::{BoundingBox, Decision, Emotion, Frame, FrameLease, PixelFormat, Rotation, ScoreVector};
pub use pipeline::{FrameMailbox, FramePipeline, PipelineWorker};
pub use sink::{DeviceSlots, ResultSink, SinkDispatcher};
