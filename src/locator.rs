// Face locator: cascade detection over the grayscale raster, single largest face

use crate::error::{EmotionRelayError, Result};
use crate::models::BoundingBox;
use image::GrayImage;
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use tracing::{error, info};

/// Cascade detector tuning
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LocatorParams {
    /// Pyramid step between detection scales
    pub scale_factor: f64,
    /// Overlapping hits needed before a candidate counts as a face
    pub min_neighbors: i32,
    /// Smallest face side, in pixels
    pub min_face_size: u32,
}

impl Default for LocatorParams {
    fn default() -> Self {
        Self {
            scale_factor: 1.3,
            min_neighbors: 5,
            min_face_size: 20,
        }
    }
}

/// Pluggable face detection backend.
///
/// Implementors only report candidates; [`FaceLocator::locate`] applies the
/// single-subject policy on top.
pub trait FaceLocator {
    /// Detects candidate faces in a grayscale raster
    fn detect(&mut self, gray: &GrayImage) -> Result<Vec<BoundingBox>>;

    /// Returns the largest face in `gray`, or `None` when there is no face.
    ///
    /// An empty raster yields `None` without consulting the backend.
    fn locate(&mut self, gray: &GrayImage) -> Result<Option<BoundingBox>> {
        if gray.width() == 0 || gray.height() == 0 {
            return Ok(None);
        }
        Ok(largest_face(self.detect(gray)?))
    }
}

impl<T: FaceLocator + ?Sized> FaceLocator for Box<T> {
    fn detect(&mut self, gray: &GrayImage) -> Result<Vec<BoundingBox>> {
        (**self).detect(gray)
    }

    fn locate(&mut self, gray: &GrayImage) -> Result<Option<BoundingBox>> {
        (**self).locate(gray)
    }
}

/// Picks the candidate with the largest area; on a tie the earlier one wins
pub fn largest_face(candidates: impl IntoIterator<Item = BoundingBox>) -> Option<BoundingBox> {
    candidates
        .into_iter()
        .filter(|candidate| candidate.area() > 0)
        .fold(None, |best: Option<BoundingBox>, candidate| match best {
            Some(current) if current.area() >= candidate.area() => best,
            _ => Some(candidate),
        })
}

/// Face locator backed by the pure-Rust SeetaFace funnel cascade (`rustface`)
pub struct SeetaLocator {
    detector: Box<dyn rustface::Detector>,
}

impl SeetaLocator {
    /// Loads a SeetaFace frontal model file and builds the detector once
    pub fn new(model_path: impl AsRef<Path>, params: LocatorParams) -> Result<Self> {
        let path = model_path.as_ref();
        let file = File::open(path).map_err(|e| {
            error!("Failed to open SeetaFace model {:?}: {}", path, e);
            EmotionRelayError::ModelLoad(format!("SeetaFace model {path:?}: {e}"))
        })?;
        let model = rustface::read_model(BufReader::new(file)).map_err(|e| {
            EmotionRelayError::ModelLoad(format!("SeetaFace model {path:?} is invalid: {e}"))
        })?;

        let mut detector = rustface::create_detector_with_model(model);
        detector.set_min_face_size(params.min_face_size);
        detector.set_score_thresh(2.0);
        // rustface shrinks the image by this factor per pyramid level
        detector.set_pyramid_scale_factor((1.0 / params.scale_factor) as f32);
        detector.set_slide_window_step(4, 4);

        info!("Loaded SeetaFace model from {:?}", path);
        Ok(Self { detector })
    }
}

impl FaceLocator for SeetaLocator {
    fn detect(&mut self, gray: &GrayImage) -> Result<Vec<BoundingBox>> {
        let image = rustface::ImageData::new(gray.as_raw(), gray.width(), gray.height());
        let faces = self.detector.detect(&image);

        Ok(faces
            .iter()
            .map(|face| {
                let bbox = face.bbox();
                BoundingBox::new(
                    bbox.x(),
                    bbox.y(),
                    bbox.width() as i32,
                    bbox.height() as i32,
                )
            })
            .collect())
    }
}

#[cfg(feature = "opencv")]
pub use haar::HaarCascadeLocator;

#[cfg(feature = "opencv")]
mod haar {
    use super::{FaceLocator, LocatorParams};
    use crate::error::{EmotionRelayError, Result};
    use crate::models::BoundingBox;
    use image::GrayImage;
    use opencv::core::{Mat, Rect, Size, Vector};
    use opencv::objdetect::{self, CascadeClassifier};
    use opencv::prelude::*;
    use tracing::{error, info};

    /// Face locator using an OpenCV Haar cascade in biggest-object mode
    pub struct HaarCascadeLocator {
        classifier: CascadeClassifier,
        params: LocatorParams,
    }

    impl HaarCascadeLocator {
        /// Creates a locator by loading the Haar cascade XML
        pub fn new(cascade_path: &str, params: LocatorParams) -> Result<Self> {
            let classifier = CascadeClassifier::new(cascade_path).map_err(|e| {
                error!("Failed to load Haar Cascade: {}", e);
                EmotionRelayError::ModelLoad(format!("Haar Cascade load failed: {e}"))
            })?;

            if classifier.empty()? {
                return Err(EmotionRelayError::ModelLoad(
                    "Haar Cascade classifier is empty".to_string(),
                ));
            }

            info!("Loaded Haar cascade from {}", cascade_path);
            Ok(Self { classifier, params })
        }
    }

    impl FaceLocator for HaarCascadeLocator {
        fn detect(&mut self, gray: &GrayImage) -> Result<Vec<BoundingBox>> {
            let mat = Mat::from_slice(gray.as_raw()).map_err(|e| {
                EmotionRelayError::FaceDetection(format!("Failed to create Mat: {e}"))
            })?;
            let mat = mat.reshape(1, gray.height() as i32).map_err(|e| {
                EmotionRelayError::FaceDetection(format!("Failed to reshape Mat: {e}"))
            })?;

            let min_side = self.params.min_face_size as i32;
            let mut faces = Vector::<Rect>::new();
            self.classifier
                .detect_multi_scale(
                    &mat,
                    &mut faces,
                    self.params.scale_factor,
                    self.params.min_neighbors,
                    objdetect::CASCADE_FIND_BIGGEST_OBJECT,
                    Size::new(min_side, min_side),
                    Size::new(0, 0),
                )
                .map_err(|e| {
                    EmotionRelayError::FaceDetection(format!("Face detection failed: {e}"))
                })?;

            Ok(faces
                .iter()
                .map(|rect| BoundingBox::new(rect.x, rect.y, rect.width, rect.height))
                .collect())
        }
    }
}
