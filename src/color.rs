// Colour-space normalization: native camera formats to upright RGB and grayscale

use crate::error::{EmotionRelayError, Result};
use crate::models::{Frame, PixelFormat, Rotation};
use image::{imageops, GrayImage, RgbImage};
use tracing::debug;

/// Upright rasters produced for one frame, borrowed from the normalizer's scratch buffers
#[derive(Clone, Copy, Debug)]
pub struct NormalizedFrame<'a> {
    pub rgb: &'a RgbImage,
    pub gray: &'a GrayImage,
}

/// Converts frames to interleaved RGB, reusing its buffers across calls.
///
/// Buffers are only re-allocated when the frame dimensions change, so a steady
/// camera stream costs no per-frame allocation.
#[derive(Default)]
pub struct ColorNormalizer {
    sensor: RgbImage,
    oriented: RgbImage,
    gray: GrayImage,
}

impl ColorNormalizer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Converts `frame` and applies its rotation hint.
    ///
    /// Returns `Ok(None)` for a frame without pixel data; that frame is skipped.
    pub fn normalize(&mut self, frame: &Frame) -> Result<Option<NormalizedFrame<'_>>> {
        if frame.is_empty() {
            return Ok(None);
        }

        let needed = frame.format.frame_len(frame.width, frame.height);
        if frame.data.len() < needed {
            return Err(EmotionRelayError::FrameProcessing(format!(
                "{:?} frame of {}x{} needs {} bytes, got {}",
                frame.format,
                frame.width,
                frame.height,
                needed,
                frame.data.len()
            )));
        }

        ensure_dimensions(&mut self.sensor, frame.width, frame.height);
        let (w, h) = (frame.width as usize, frame.height as usize);
        let out: &mut [u8] = &mut self.sensor;
        match frame.format {
            PixelFormat::I420 => {
                let cw = w.div_ceil(2);
                let chroma_len = cw * h.div_ceil(2);
                let (luma, chroma) = frame.data.split_at(w * h);
                let (u_plane, v_plane) = chroma.split_at(chroma_len);
                convert_420(luma, w, h, out, |cx, cy| {
                    let idx = cy * cw + cx;
                    (u_plane[idx], v_plane[idx])
                });
            }
            PixelFormat::Nv12 | PixelFormat::Nv21 => {
                let stride = 2 * w.div_ceil(2);
                let (luma, chroma) = frame.data.split_at(w * h);
                let v_first = frame.format == PixelFormat::Nv21;
                convert_420(luma, w, h, out, |cx, cy| {
                    let idx = cy * stride + 2 * cx;
                    let (a, b) = (chroma[idx], chroma[idx + 1]);
                    if v_first {
                        (b, a)
                    } else {
                        (a, b)
                    }
                });
            }
            PixelFormat::Yuyv => convert_yuyv(&frame.data, w, h, out),
            PixelFormat::Rgb8 => out.copy_from_slice(&frame.data[..needed]),
        }

        let rotated = orient(&self.sensor, &mut self.oriented, frame.rotation)?;
        let rgb = if rotated { &self.oriented } else { &self.sensor };
        debug!(
            width = rgb.width(),
            height = rgb.height(),
            rotation = frame.rotation.degrees(),
            "Normalized frame"
        );

        ensure_gray(&mut self.gray, rgb.width(), rgb.height());
        write_luma(rgb, &mut self.gray);

        Ok(Some(NormalizedFrame {
            rgb,
            gray: &self.gray,
        }))
    }
}

/// Rotates `sensor` clockwise into `oriented`; returns false when no rotation was needed
fn orient(sensor: &RgbImage, oriented: &mut RgbImage, rotation: Rotation) -> Result<bool> {
    let (w, h) = sensor.dimensions();
    let rotated = match rotation {
        Rotation::Deg0 => return Ok(false),
        Rotation::Deg90 => {
            ensure_dimensions(oriented, h, w);
            imageops::rotate90_in(sensor, oriented)
        }
        Rotation::Deg180 => {
            ensure_dimensions(oriented, w, h);
            imageops::rotate180_in(sensor, oriented)
        }
        Rotation::Deg270 => {
            ensure_dimensions(oriented, h, w);
            imageops::rotate270_in(sensor, oriented)
        }
    };
    rotated.map_err(|e| {
        EmotionRelayError::FrameProcessing(format!("Failed to rotate frame: {e}"))
    })?;
    Ok(true)
}

fn ensure_dimensions(buffer: &mut RgbImage, width: u32, height: u32) {
    if buffer.dimensions() != (width, height) {
        debug!(width, height, "Reallocating RGB scratch buffer");
        *buffer = RgbImage::new(width, height);
    }
}

fn ensure_gray(buffer: &mut GrayImage, width: u32, height: u32) {
    if buffer.dimensions() != (width, height) {
        *buffer = GrayImage::new(width, height);
    }
}

/// BT.601 limited-range YUV to RGB, 8.8 fixed point
#[inline]
fn yuv_to_rgb(y: u8, u: u8, v: u8) -> [u8; 3] {
    let c = 298 * (i32::from(y) - 16);
    let d = i32::from(u) - 128;
    let e = i32::from(v) - 128;
    let clamp = |value: i32| ((value + 128) >> 8).clamp(0, 255) as u8;
    [
        clamp(c + 409 * e),
        clamp(c - 100 * d - 208 * e),
        clamp(c + 516 * d),
    ]
}

/// Shared loop for the 4:2:0 layouts; `chroma(cx, cy)` returns `(u, v)` for a 2x2 block
fn convert_420(
    luma: &[u8],
    width: usize,
    height: usize,
    out: &mut [u8],
    chroma: impl Fn(usize, usize) -> (u8, u8),
) {
    for row in 0..height {
        for col in 0..width {
            let (u, v) = chroma(col / 2, row / 2);
            let px = row * width + col;
            out[px * 3..px * 3 + 3].copy_from_slice(&yuv_to_rgb(luma[px], u, v));
        }
    }
}

fn convert_yuyv(data: &[u8], width: usize, height: usize, out: &mut [u8]) {
    let stride = 4 * width.div_ceil(2);
    for row in 0..height {
        for col in 0..width {
            let base = row * stride + 4 * (col / 2);
            let y = data[base + 2 * (col % 2)];
            let (u, v) = (data[base + 1], data[base + 3]);
            let px = row * width + col;
            out[px * 3..px * 3 + 3].copy_from_slice(&yuv_to_rgb(y, u, v));
        }
    }
}

/// BT.601 luma (0.299 R + 0.587 G + 0.114 B), the weighting cascade detectors are trained on
fn write_luma(rgb: &RgbImage, gray: &mut GrayImage) {
    for (dst, px) in gray.iter_mut().zip(rgb.pixels()) {
        let [r, g, b] = px.0;
        let luma = 77 * u32::from(r) + 150 * u32::from(g) + 29 * u32::from(b);
        *dst = ((luma + 128) >> 8) as u8;
    }
}
