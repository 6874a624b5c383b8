// Webcam acquisition feeding the pipeline mailbox

use crate::config::CameraConfig;
use crate::error::{EmotionRelayError, Result};
use crate::models::{Frame, PixelFormat, Rotation};
use crate::pipeline::{CaptureGate, FrameMailbox, LATEST_ONLY_PERMITS};
use nokhwa::pixel_format::RgbFormat;
use nokhwa::utils::{CameraFormat, CameraIndex, FrameFormat, RequestedFormat, RequestedFormatType, Resolution};
use nokhwa::Camera;
use tracing::{debug, error, info, warn};

/// Camera producing [`Frame`]s in the sensor's native layout where possible
pub struct CameraSource {
    camera: Camera,
    rotation: Rotation,
    is_running: bool,
}

impl CameraSource {
    /// Opens the configured camera, falling back to the next index
    pub fn open(config: &CameraConfig, rotation: Rotation) -> Result<Self> {
        let requested_format = RequestedFormat::new::<RgbFormat>(RequestedFormatType::Closest(
            CameraFormat::new(
                Resolution::new(config.width, config.height),
                FrameFormat::YUYV,
                config.fps,
            ),
        ));

        // Some systems number the built-in camera from 1
        let camera = Self::try_open_camera(config.index, requested_format)
            .or_else(|_| Self::try_open_camera(config.index + 1, requested_format))
            .map_err(|e| {
                error!("Failed to initialize camera: {}", e);
                EmotionRelayError::CameraInit(format!(
                    "Could not open camera {} or {}: {e}",
                    config.index,
                    config.index + 1
                ))
            })?;

        info!(
            "Opened camera {} at {}x{}",
            camera.info().human_name(),
            camera.resolution().width(),
            camera.resolution().height()
        );

        Ok(Self {
            camera,
            rotation,
            is_running: false,
        })
    }

    fn try_open_camera(index: u32, requested_format: RequestedFormat) -> Result<Camera> {
        Ok(Camera::new(CameraIndex::Index(index), requested_format)?)
    }

    /// Starts the stream if it is not already running
    pub fn ensure_stream_open(&mut self) -> Result<()> {
        if self.is_running {
            return Ok(());
        }
        self.camera.open_stream()?;
        self.is_running = true;
        Ok(())
    }

    /// Grabs the next frame (blocking).
    ///
    /// YUYV and NV12 buffers pass through untouched; anything else is decoded to RGB.
    pub fn next_frame(&mut self) -> Result<Frame> {
        let buffer = self.camera.frame()?;
        let resolution = buffer.resolution();
        let (width, height) = (resolution.width(), resolution.height());

        let native = match buffer.source_frame_format() {
            FrameFormat::YUYV => Some(PixelFormat::Yuyv),
            FrameFormat::NV12 => Some(PixelFormat::Nv12),
            _ => None,
        };
        let frame = match native {
            Some(format) => Frame::new(
                buffer.buffer().to_vec(),
                width,
                height,
                format,
                self.rotation,
            ),
            None => {
                let decoded = buffer.decode_image::<RgbFormat>().map_err(|e| {
                    EmotionRelayError::FrameProcessing(format!("Failed to decode frame: {e}"))
                })?;
                let (width, height) = (decoded.width(), decoded.height());
                Frame::new(
                    decoded.into_raw(),
                    width,
                    height,
                    PixelFormat::Rgb8,
                    self.rotation,
                )
            }
        };
        Ok(frame)
    }

    /// Feeds frames into `mailbox` until it is closed.
    ///
    /// Capture keeps pace with the camera while the worker is busy; each new
    /// frame replaces the pending one.
    pub async fn run(&mut self, mailbox: &FrameMailbox) -> Result<()> {
        self.ensure_stream_open()?;
        let gate = CaptureGate::new(LATEST_ONLY_PERMITS);
        let mut captured = 0u64;

        while !mailbox.is_closed() {
            let permit = gate.ready().await;
            match self.next_frame() {
                Ok(frame) => {
                    mailbox.post(permit.lease(frame));
                    captured += 1;
                }
                Err(e) => warn!("Failed to capture frame: {}", e),
            }
            // Lets other tasks on this runtime (signal handling) make progress
            tokio::task::yield_now().await;
        }

        debug!(captured, "Capture loop finished");
        Ok(())
    }

    pub fn stop(&mut self) {
        if !self.is_running {
            return;
        }
        self.is_running = false;
        if let Err(e) = self.camera.stop_stream() {
            error!("Error stopping camera stream: {}", e);
        }
    }
}

impl Drop for CameraSource {
    fn drop(&mut self) {
        self.stop();
    }
}
