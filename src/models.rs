// Core data models for the emotion relay

use crate::error::{EmotionRelayError, Result};
use serde::{Deserialize, Serialize};

/// Native pixel layout of a frame as delivered by the capture side
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PixelFormat {
    /// Planar 4:2:0: full Y plane, then quarter-size U and V planes
    I420,
    /// Semi-planar 4:2:0: Y plane, then interleaved U/V pairs
    Nv12,
    /// Semi-planar 4:2:0: Y plane, then interleaved V/U pairs (Android default)
    Nv21,
    /// Packed 4:2:2: Y0 U Y1 V per two pixels (most USB webcams)
    Yuyv,
    /// Interleaved 8-bit RGB
    Rgb8,
}

impl PixelFormat {
    /// Number of bytes a tightly packed frame of this format occupies
    pub fn frame_len(self, width: u32, height: u32) -> usize {
        let (w, h) = (width as usize, height as usize);
        match self {
            PixelFormat::I420 | PixelFormat::Nv12 | PixelFormat::Nv21 => {
                w * h + 2 * w.div_ceil(2) * h.div_ceil(2)
            }
            // Y0 U Y1 V: four bytes per horizontal pixel pair
            PixelFormat::Yuyv => 4 * w.div_ceil(2) * h,
            PixelFormat::Rgb8 => 3 * w * h,
        }
    }
}

/// Clockwise rotation needed to bring a sensor frame upright
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum Rotation {
    #[default]
    Deg0,
    Deg90,
    Deg180,
    Deg270,
}

impl Rotation {
    pub fn degrees(self) -> u16 {
        match self {
            Rotation::Deg0 => 0,
            Rotation::Deg90 => 90,
            Rotation::Deg180 => 180,
            Rotation::Deg270 => 270,
        }
    }

    /// Whether the rotation swaps width and height
    pub fn is_transposing(self) -> bool {
        matches!(self, Rotation::Deg90 | Rotation::Deg270)
    }
}

impl TryFrom<u16> for Rotation {
    type Error = EmotionRelayError;

    fn try_from(degrees: u16) -> Result<Self> {
        match degrees {
            0 => Ok(Rotation::Deg0),
            90 => Ok(Rotation::Deg90),
            180 => Ok(Rotation::Deg180),
            270 => Ok(Rotation::Deg270),
            other => Err(EmotionRelayError::FrameProcessing(format!(
                "unsupported rotation of {other} degrees"
            ))),
        }
    }
}

/// Represents a single camera frame in its native pixel format
#[derive(Clone, Debug)]
pub struct Frame {
    /// Raw pixel data, tightly packed
    pub data: Vec<u8>,
    /// Frame width in pixels
    pub width: u32,
    /// Frame height in pixels
    pub height: u32,
    pub format: PixelFormat,
    pub rotation: Rotation,
}

impl Frame {
    /// Creates a new Frame with the given parameters
    pub fn new(
        data: Vec<u8>,
        width: u32,
        height: u32,
        format: PixelFormat,
        rotation: Rotation,
    ) -> Self {
        Self {
            data,
            width,
            height,
            format,
            rotation,
        }
    }

    /// Wraps an already decoded RGB image, e.g. a still photo
    pub fn from_rgb_image(image: image::RgbImage) -> Self {
        let (width, height) = image.dimensions();
        Self::new(
            image.into_raw(),
            width,
            height,
            PixelFormat::Rgb8,
            Rotation::Deg0,
        )
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty() || self.width == 0 || self.height == 0
    }
}

/// A frame on loan from the capture side.
///
/// Capture stalls until the lease is released, which happens exactly once
/// when the lease is dropped: after processing, when a newer frame replaces
/// it in the mailbox, or at shutdown.
pub struct FrameLease {
    frame: Frame,
    release: Option<Box<dyn FnOnce() + Send>>,
}

impl FrameLease {
    pub fn new(frame: Frame, release: impl FnOnce() + Send + 'static) -> Self {
        Self {
            frame,
            release: Some(Box::new(release)),
        }
    }

    /// A lease whose release signals nobody
    pub fn detached(frame: Frame) -> Self {
        Self {
            frame,
            release: None,
        }
    }

    pub fn frame(&self) -> &Frame {
        &self.frame
    }
}

impl From<Frame> for FrameLease {
    fn from(frame: Frame) -> Self {
        Self::detached(frame)
    }
}

impl Drop for FrameLease {
    fn drop(&mut self) {
        if let Some(release) = self.release.take() {
            release();
        }
    }
}

impl std::fmt::Debug for FrameLease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FrameLease")
            .field("width", &self.frame.width)
            .field("height", &self.frame.height)
            .field("format", &self.frame.format)
            .finish()
    }
}

/// Axis-aligned face region in frame pixel coordinates
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x: i32,
    pub y: i32,
    pub width: i32,
    pub height: i32,
}

impl BoundingBox {
    pub const fn new(x: i32, y: i32, width: i32, height: i32) -> Self {
        Self {
            x,
            y,
            width,
            height,
        }
    }

    pub fn area(&self) -> i64 {
        i64::from(self.width.max(0)) * i64::from(self.height.max(0))
    }

    /// Intersects the box with a `width` x `height` raster.
    ///
    /// Returns `(x, y, w, h)` in unsigned raster coordinates, or `None` when
    /// nothing of the box lies inside the raster.
    pub fn clamp_to(&self, width: u32, height: u32) -> Option<(u32, u32, u32, u32)> {
        let x0 = i64::from(self.x).max(0);
        let y0 = i64::from(self.y).max(0);
        let x1 = (i64::from(self.x) + i64::from(self.width)).min(i64::from(width));
        let y1 = (i64::from(self.y) + i64::from(self.height)).min(i64::from(height));
        if x1 <= x0 || y1 <= y0 {
            return None;
        }
        Some((x0 as u32, y0 as u32, (x1 - x0) as u32, (y1 - y0) as u32))
    }
}

/// Represents the detected emotional state, in the classifier's output order
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Emotion {
    Angry,
    Disgust,
    Fear,
    Happy,
    Sad,
    Surprise,
    Neutral,
}

impl Emotion {
    /// All classes, indexed by classifier output position
    pub const ALL: [Emotion; 7] = [
        Emotion::Angry,
        Emotion::Disgust,
        Emotion::Fear,
        Emotion::Happy,
        Emotion::Sad,
        Emotion::Surprise,
        Emotion::Neutral,
    ];

    pub fn from_index(index: usize) -> Option<Self> {
        Self::ALL.get(index).copied()
    }

    pub fn index(self) -> usize {
        self as usize
    }

    pub fn label(self) -> &'static str {
        match self {
            Emotion::Angry => "angry",
            Emotion::Disgust => "disgust",
            Emotion::Fear => "fear",
            Emotion::Happy => "happy",
            Emotion::Sad => "sad",
            Emotion::Surprise => "surprise",
            Emotion::Neutral => "neutral",
        }
    }

    pub fn glyph(self) -> &'static str {
        match self {
            Emotion::Angry => "\u{1F621}",
            Emotion::Disgust => "\u{1F612}",
            Emotion::Fear => "\u{1F631}",
            Emotion::Happy => "\u{1F601}",
            Emotion::Sad => "\u{2639}",
            Emotion::Surprise => "\u{1F632}",
            Emotion::Neutral => "\u{1F610}",
        }
    }
}

impl std::fmt::Display for Emotion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.label())
    }
}

/// Classifier output, one score per [`Emotion`] in table order
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ScoreVector(pub [f32; 7]);

impl ScoreVector {
    pub const LEN: usize = 7;

    /// Index of the entry exactly equal to 1.0 (the one-hot position)
    pub fn one_hot_index(&self) -> Option<usize> {
        self.0.iter().position(|&score| score == 1.0)
    }

    /// Index of the highest finite score; NaN and infinities are ignored
    pub fn argmax(&self) -> Option<usize> {
        self.0
            .iter()
            .enumerate()
            .filter(|(_, score)| score.is_finite())
            .fold(None, |best: Option<(usize, f32)>, (idx, &score)| match best {
                Some((_, top)) if top >= score => best,
                _ => Some((idx, score)),
            })
            .map(|(idx, _)| idx)
    }

    pub fn as_slice(&self) -> &[f32] {
        &self.0
    }
}

impl TryFrom<&[f32]> for ScoreVector {
    type Error = EmotionRelayError;

    fn try_from(scores: &[f32]) -> Result<Self> {
        let scores: [f32; 7] = scores.try_into().map_err(|_| {
            EmotionRelayError::Inference(format!(
                "expected {} scores, model produced {}",
                Self::LEN,
                scores.len()
            ))
        })?;
        Ok(Self(scores))
    }
}

/// Per-frame outcome published to the paired device
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", content = "emotion", rename_all = "snake_case")]
pub enum Decision {
    Label(Emotion),
    NoFace,
}

impl Decision {
    pub fn label(&self) -> &'static str {
        match self {
            Decision::Label(emotion) => emotion.label(),
            Decision::NoFace => "No Face",
        }
    }

    pub fn glyph(&self) -> &'static str {
        match self {
            Decision::Label(emotion) => emotion.glyph(),
            Decision::NoFace => "None",
        }
    }

    /// Value written to the remote store: label and glyph separated by three spaces
    pub fn display_value(&self) -> String {
        format!("{}   {}", self.label(), self.glyph())
    }
}

impl std::fmt::Display for Decision {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.display_value())
    }
}
