// Face crop preparation and classifier input encoding

use crate::models::BoundingBox;
use image::imageops::{self, FilterType};
use image::RgbImage;
use ndarray::Array4;

/// Side of the square crop the classifier consumes
pub const CROP_SIZE: u32 = 48;

/// Number of values in one classifier input
pub const TENSOR_LEN: usize = (CROP_SIZE * CROP_SIZE) as usize;

/// A face region scaled to exactly 48x48 RGB, aspect ratio not preserved
#[derive(Clone, Debug, PartialEq)]
pub struct NormalizedCrop(RgbImage);

impl NormalizedCrop {
    /// Wraps an image that is already 48x48; returns `None` for any other size
    pub fn from_image(image: RgbImage) -> Option<Self> {
        (image.dimensions() == (CROP_SIZE, CROP_SIZE)).then_some(Self(image))
    }

    pub fn image(&self) -> &RgbImage {
        &self.0
    }
}

/// Cuts the face box out of the upright raster and scales it to 48x48.
///
/// `None` means "no face": either no box was located or the box does not
/// overlap the raster. The box is clamped to the raster, never padded.
pub fn crop_and_resize(rgb: &RgbImage, face: Option<BoundingBox>) -> Option<NormalizedCrop> {
    let (x, y, width, height) = face?.clamp_to(rgb.width(), rgb.height())?;
    let region = imageops::crop_imm(rgb, x, y, width, height);
    let resized = imageops::resize(&*region, CROP_SIZE, CROP_SIZE, FilterType::Triangle);
    Some(NormalizedCrop(resized))
}

/// Classifier input of shape `[1, 48, 48, 1]`, f32
#[derive(Clone, Debug, PartialEq)]
pub struct InputTensor(Array4<f32>);

impl InputTensor {
    pub const SHAPE: [usize; 4] = [1, CROP_SIZE as usize, CROP_SIZE as usize, 1];

    pub fn array(&self) -> &Array4<f32> {
        &self.0
    }

    pub fn into_array(self) -> Array4<f32> {
        self.0
    }

    /// Row-major values; the tensor is always in standard layout
    pub fn values(&self) -> &[f32] {
        self.0.as_slice().unwrap_or(&[])
    }
}

/// Encodes the crop as red-channel intensities in the raw 0-255 range.
///
/// The frozen model was trained on this exact single-channel, unscaled input;
/// green and blue are dropped.
pub fn encode_tensor(crop: &NormalizedCrop) -> InputTensor {
    let size = CROP_SIZE as usize;
    let values = Array4::from_shape_fn((1, size, size, 1), |(_, row, col, _)| {
        f32::from(crop.0.get_pixel(col as u32, row as u32).0[0])
    });
    InputTensor(values)
}
