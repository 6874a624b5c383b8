// Application configuration, loaded from JSON with every field defaulted

use crate::emotion::{ExecutionStrategy, ScoreFallback};
use crate::error::{EmotionRelayError, Result};
use crate::locator::LocatorParams;
use crate::models::Rotation;
use crate::sink::SinkConfig;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::info;

/// Which cascade backend locates faces
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LocatorKind {
    /// OpenCV Haar cascade (needs the `opencv` feature)
    Haar,
    /// Pure-Rust SeetaFace cascade
    Seeta,
}

impl Default for LocatorKind {
    fn default() -> Self {
        if cfg!(feature = "opencv") {
            LocatorKind::Haar
        } else {
            LocatorKind::Seeta
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CameraConfig {
    pub index: u32,
    pub width: u32,
    pub height: u32,
    pub fps: u32,
    /// Clockwise correction from sensor to display orientation, in degrees
    pub rotation: u16,
}

impl Default for CameraConfig {
    fn default() -> Self {
        Self {
            index: 0,
            width: 640,
            height: 480,
            fps: 30,
            rotation: 0,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub cascade_path: PathBuf,
    pub seeta_model_path: PathBuf,
    pub model_path: PathBuf,
    pub locator: LocatorKind,
    pub detection: LocatorParams,
    pub execution: ExecutionStrategy,
    pub score_fallback: ScoreFallback,
    pub sink: SinkConfig,
    pub camera: CameraConfig,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            cascade_path: PathBuf::from("assets/models/haarcascade_frontalface_default.xml"),
            seeta_model_path: PathBuf::from("assets/models/seeta_fd_frontal_v1.0.bin"),
            model_path: PathBuf::from("assets/models/emotion.onnx"),
            locator: LocatorKind::default(),
            detection: LocatorParams::default(),
            execution: ExecutionStrategy::default(),
            score_fallback: ScoreFallback::default(),
            sink: SinkConfig::default(),
            camera: CameraConfig::default(),
        }
    }
}

impl AppConfig {
    /// Reads and validates a JSON config file
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|e| {
            EmotionRelayError::Config(format!("cannot read {}: {e}", path.display()))
        })?;
        let config = Self::from_json_str(&text)?;
        info!("Loaded configuration from {}", path.display());
        Ok(config)
    }

    pub fn from_json_str(text: &str) -> Result<Self> {
        let config: AppConfig = serde_json::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.detection.scale_factor.is_nan() || self.detection.scale_factor <= 1.0 {
            return Err(EmotionRelayError::Config(format!(
                "detection.scale_factor must be greater than 1, got {}",
                self.detection.scale_factor
            )));
        }
        if self.detection.min_neighbors < 0 {
            return Err(EmotionRelayError::Config(
                "detection.min_neighbors cannot be negative".to_string(),
            ));
        }
        if let ExecutionStrategy::CpuThreaded { threads: 0 } = self.execution {
            return Err(EmotionRelayError::Config(
                "execution.threads must be at least 1".to_string(),
            ));
        }
        if self.sink.queue_depth == 0 {
            return Err(EmotionRelayError::Config(
                "sink.queue_depth must be at least 1".to_string(),
            ));
        }
        self.camera_rotation()?;
        if self.locator == LocatorKind::Haar && !cfg!(feature = "opencv") {
            return Err(EmotionRelayError::Config(
                "the haar locator needs a build with the `opencv` feature".to_string(),
            ));
        }
        Ok(())
    }

    pub fn camera_rotation(&self) -> Result<Rotation> {
        Rotation::try_from(self.camera.rotation).map_err(|_| {
            EmotionRelayError::Config(format!(
                "camera.rotation must be 0, 90, 180 or 270, got {}",
                self.camera.rotation
            ))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_object_gives_defaults() {
        let config = AppConfig::from_json_str("{}").unwrap();
        assert_eq!(config, AppConfig::default());
        assert_eq!(config.detection.scale_factor, 1.3);
        assert_eq!(config.detection.min_neighbors, 5);
        assert!(config.sink.paired);
        assert_eq!(config.score_fallback, ScoreFallback::Argmax);
    }

    #[test]
    fn partial_sections_merge_with_defaults() {
        let config = AppConfig::from_json_str(
            r#"{
                "locator": "seeta",
                "execution": {"strategy": "accelerated"},
                "score_fallback": "skip",
                "sink": {"database_url": "https://relay-demo.firebaseio.com", "paired": false},
                "camera": {"rotation": 270}
            }"#,
        )
        .unwrap();
        assert_eq!(config.locator, LocatorKind::Seeta);
        assert_eq!(config.execution, ExecutionStrategy::Accelerated);
        assert_eq!(config.score_fallback, ScoreFallback::Skip);
        assert!(!config.sink.paired);
        assert_eq!(config.sink.queue_depth, 8);
        assert_eq!(config.camera_rotation().unwrap(), Rotation::Deg270);
        assert_eq!(config.camera.width, 640);
    }

    #[test]
    fn invalid_values_are_rejected() {
        let cases = [
            r#"{"locator": "seeta", "detection": {"scale_factor": 1.0}}"#,
            r#"{"locator": "seeta", "execution": {"strategy": "cpu-threaded", "threads": 0}}"#,
            r#"{"locator": "seeta", "sink": {"queue_depth": 0}}"#,
            r#"{"locator": "seeta", "camera": {"rotation": 45}}"#,
        ];
        for case in cases {
            assert!(
                matches!(AppConfig::from_json_str(case), Err(EmotionRelayError::Config(_))),
                "accepted {case}"
            );
        }
    }

    #[test]
    fn malformed_json_is_a_json_error() {
        assert!(matches!(
            AppConfig::from_json_str("{not json"),
            Err(EmotionRelayError::Json(_))
        ));
    }

    #[test]
    fn missing_file_is_a_config_error() {
        assert!(matches!(
            AppConfig::from_json_file("no/such/config.json"),
            Err(EmotionRelayError::Config(_))
        ));
    }
}
