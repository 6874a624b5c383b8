// Error types for the emotion relay

use thiserror::Error;

/// Main error type for the emotion relay
#[derive(Debug, Error)]
pub enum EmotionRelayError {
    #[error("Camera initialization failed: {0}")]
    CameraInit(String),

    #[error("Frame processing failed: {0}")]
    FrameProcessing(String),

    #[error("Model loading failed: {0}")]
    ModelLoad(String),

    #[error("Face detection failed: {0}")]
    FaceDetection(String),

    #[error("Inference failed: {0}")]
    Inference(String),

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("Result sink error: {0}")]
    Sink(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Image decoding error: {0}")]
    ImageDecode(#[from] image::ImageError),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Result type alias for emotion relay operations
pub type Result<T> = std::result::Result<T, EmotionRelayError>;

#[cfg(feature = "camera")]
impl From<nokhwa::NokhwaError> for EmotionRelayError {
    fn from(err: nokhwa::NokhwaError) -> Self {
        match err {
            nokhwa::NokhwaError::StructureError { structure, error } => {
                EmotionRelayError::CameraInit(format!("{structure}: {error}"))
            }
            nokhwa::NokhwaError::OpenDeviceError(device, error) => {
                EmotionRelayError::CameraInit(format!("Device {device}: {error}"))
            }
            nokhwa::NokhwaError::ReadFrameError(error) => {
                EmotionRelayError::FrameProcessing(format!("Read frame: {error}"))
            }
            _ => EmotionRelayError::CameraInit(err.to_string()),
        }
    }
}

#[cfg(feature = "opencv")]
impl From<opencv::Error> for EmotionRelayError {
    fn from(err: opencv::Error) -> Self {
        EmotionRelayError::FaceDetection(err.to_string())
    }
}

#[cfg(feature = "onnx")]
impl From<ort::Error> for EmotionRelayError {
    fn from(err: ort::Error) -> Self {
        EmotionRelayError::Inference(err.to_string())
    }
}

impl From<ureq::Error> for EmotionRelayError {
    fn from(err: ureq::Error) -> Self {
        EmotionRelayError::Sink(err.to_string())
    }
}
