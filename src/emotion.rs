// Emotion classification boundary and per-frame decision

use crate::error::Result;
use crate::models::{Decision, Emotion, ScoreVector};
use crate::preprocess::InputTensor;
use serde::{Deserialize, Serialize};
use tracing::warn;

/// How the inference engine should execute the model
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "strategy", rename_all = "kebab-case")]
pub enum ExecutionStrategy {
    /// GPU execution provider, falling back to the CPU when unavailable
    Accelerated,
    /// CPU execution with a fixed number of intra-op threads
    CpuThreaded { threads: usize },
}

impl Default for ExecutionStrategy {
    fn default() -> Self {
        ExecutionStrategy::CpuThreaded { threads: 4 }
    }
}

/// Opaque frozen model: `[1, 48, 48, 1]` tensor in, 7 scores out
pub trait Classifier {
    fn classify(&mut self, input: &InputTensor) -> Result<ScoreVector>;
}

impl<T: Classifier + ?Sized> Classifier for Box<T> {
    fn classify(&mut self, input: &InputTensor) -> Result<ScoreVector> {
        (**self).classify(input)
    }
}

/// What to report when a face was found but no score is exactly 1.0
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ScoreFallback {
    /// Highest finite score wins; identical to the one-hot index whenever one exists
    #[default]
    Argmax,
    /// Publish "No Face", as the one-hot lookup alone would
    NoFace,
    /// Publish nothing for the frame
    Skip,
}

/// Turns the classifier output into the frame's decision.
///
/// Returns `None` when the frame should produce no output at all.
pub fn decide(
    face_found: bool,
    scores: Option<&ScoreVector>,
    fallback: ScoreFallback,
) -> Option<Decision> {
    if !face_found {
        return Some(Decision::NoFace);
    }
    let Some(scores) = scores else {
        warn!("Face found but no scores available, skipping frame");
        return None;
    };

    if let Some(index) = scores.one_hot_index() {
        return Emotion::from_index(index).map(Decision::Label);
    }

    match fallback {
        ScoreFallback::Argmax => {
            let decision = scores
                .argmax()
                .and_then(Emotion::from_index)
                .map(Decision::Label);
            if decision.is_none() {
                warn!("No finite score in {:?}, skipping frame", scores.as_slice());
            }
            decision
        }
        ScoreFallback::NoFace => Some(Decision::NoFace),
        ScoreFallback::Skip => None,
    }
}

#[cfg(feature = "onnx")]
pub use onnx::OnnxClassifier;

#[cfg(feature = "onnx")]
mod onnx {
    use super::{Classifier, ExecutionStrategy};
    use crate::error::{EmotionRelayError, Result};
    use crate::models::ScoreVector;
    use crate::preprocess::InputTensor;
    use ort::execution_providers::{CPUExecutionProvider, CUDAExecutionProvider};
    use ort::session::Session;
    use ort::value::Tensor;
    use tracing::{error, info, warn};

    /// Emotion classifier using ONNX Runtime
    pub struct OnnxClassifier {
        session: Session,
    }

    impl OnnxClassifier {
        /// Creates a new OnnxClassifier by loading the ONNX model
        pub fn new(model_path: &str, strategy: ExecutionStrategy) -> Result<Self> {
            let session = match strategy {
                ExecutionStrategy::Accelerated => {
                    match Self::accelerated_session(model_path) {
                        Ok(session) => {
                            info!("Emotion model running on the CUDA execution provider");
                            session
                        }
                        Err(e) => {
                            warn!("Accelerated execution unavailable ({}), using CPU", e);
                            Self::cpu_session(model_path, 4)?
                        }
                    }
                }
                ExecutionStrategy::CpuThreaded { threads } => {
                    Self::cpu_session(model_path, threads)?
                }
            };

            Ok(Self { session })
        }

        fn accelerated_session(model_path: &str) -> Result<Session> {
            let cuda = CUDAExecutionProvider::default().build().error_on_failure();
            Ok(Session::builder()?
                .with_execution_providers([cuda])?
                .commit_from_file(model_path)?)
        }

        fn cpu_session(model_path: &str, threads: usize) -> Result<Session> {
            let cpu = CPUExecutionProvider::default().build();
            Session::builder()?
                .with_execution_providers([cpu])?
                .with_intra_threads(threads)?
                .commit_from_file(model_path)
                .map_err(|e| {
                    error!("Failed to load ONNX model: {}", e);
                    EmotionRelayError::ModelLoad(format!("ONNX model load failed: {e}"))
                })
        }
    }

    impl Classifier for OnnxClassifier {
        fn classify(&mut self, input: &InputTensor) -> Result<ScoreVector> {
            let input_tensor = Tensor::from_array(input.array().clone()).map_err(|e| {
                EmotionRelayError::Inference(format!("Failed to create input tensor: {e}"))
            })?;

            let outputs = self.session.run(ort::inputs![input_tensor]).map_err(|e| {
                error!("ONNX inference failed: {}", e);
                EmotionRelayError::Inference(format!("Inference failed: {e}"))
            })?;

            let (_, output_value) = outputs.iter().next().ok_or_else(|| {
                EmotionRelayError::Inference("No output from model".to_string())
            })?;

            let (_, scores) = output_value.try_extract_tensor::<f32>().map_err(|e| {
                EmotionRelayError::Inference(format!("Failed to extract output tensor: {e}"))
            })?;

            ScoreVector::try_from(scores)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn one_hot(index: usize) -> ScoreVector {
        let mut scores = [0.0; 7];
        scores[index] = 1.0;
        ScoreVector(scores)
    }

    #[test]
    fn no_face_ignores_scores() {
        for fallback in [ScoreFallback::Argmax, ScoreFallback::NoFace, ScoreFallback::Skip] {
            assert_eq!(decide(false, None, fallback), Some(Decision::NoFace));
            assert_eq!(
                decide(false, Some(&one_hot(3)), fallback),
                Some(Decision::NoFace)
            );
        }
    }

    #[test]
    fn one_hot_index_selects_label() {
        for (index, emotion) in Emotion::ALL.iter().enumerate() {
            assert_eq!(
                decide(true, Some(&one_hot(index)), ScoreFallback::Skip),
                Some(Decision::Label(*emotion))
            );
        }
    }

    #[test]
    fn happy_scores_produce_happy_glyph() {
        let scores = ScoreVector([0.0, 0.0, 0.0, 1.0, 0.0, 0.0, 0.0]);
        let decision = decide(true, Some(&scores), ScoreFallback::default()).unwrap();
        assert_eq!(decision, Decision::Label(Emotion::Happy));
        assert_eq!(decision.display_value(), "happy   \u{1F601}");
    }

    #[test]
    fn exact_one_beats_a_larger_score() {
        let scores = ScoreVector([3.0, 0.0, 1.0, 0.0, 0.0, 0.0, 0.0]);
        assert_eq!(
            decide(true, Some(&scores), ScoreFallback::Argmax),
            Some(Decision::Label(Emotion::Fear))
        );
    }

    #[test]
    fn soft_scores_follow_the_fallback_policy() {
        let soft = ScoreVector([0.05, 0.05, 0.1, 0.1, 0.6, 0.05, 0.05]);
        assert_eq!(
            decide(true, Some(&soft), ScoreFallback::Argmax),
            Some(Decision::Label(Emotion::Sad))
        );
        assert_eq!(
            decide(true, Some(&soft), ScoreFallback::NoFace),
            Some(Decision::NoFace)
        );
        assert_eq!(decide(true, Some(&soft), ScoreFallback::Skip), None);
    }

    #[test]
    fn all_nan_scores_are_skipped_under_argmax() {
        let broken = ScoreVector([f32::NAN; 7]);
        assert_eq!(decide(true, Some(&broken), ScoreFallback::Argmax), None);
    }

    #[test]
    fn face_without_scores_is_skipped() {
        assert_eq!(decide(true, None, ScoreFallback::Argmax), None);
    }

    #[test]
    fn strategy_parses_from_config_json() {
        let accelerated: ExecutionStrategy =
            serde_json::from_str(r#"{"strategy": "accelerated"}"#).unwrap();
        assert_eq!(accelerated, ExecutionStrategy::Accelerated);

        let cpu: ExecutionStrategy =
            serde_json::from_str(r#"{"strategy": "cpu-threaded", "threads": 2}"#).unwrap();
        assert_eq!(cpu, ExecutionStrategy::CpuThreaded { threads: 2 });

        let fallback: ScoreFallback = serde_json::from_str(r#""no-face""#).unwrap();
        assert_eq!(fallback, ScoreFallback::NoFace);
    }
}
