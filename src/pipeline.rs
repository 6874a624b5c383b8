// Per-frame pipeline, latest-frame mailbox and the worker that drains it

use crate::color::ColorNormalizer;
use crate::emotion::{decide, Classifier, ScoreFallback};
use crate::error::{EmotionRelayError, Result};
use crate::locator::FaceLocator;
use crate::models::{Decision, Frame, FrameLease};
use crate::preprocess::{crop_and_resize, encode_tensor};
use crate::sink::{DeviceSlots, SinkDispatcher};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::JoinHandle;
use tokio::sync::{oneshot, Notify, OwnedSemaphorePermit, Semaphore};
use tracing::{debug, error, info, warn};

/// Frame in, decision out: normalize, locate, crop, encode, classify, decide.
pub struct FramePipeline<L, C> {
    normalizer: ColorNormalizer,
    locator: L,
    classifier: C,
    fallback: ScoreFallback,
}

impl<L: FaceLocator, C: Classifier> FramePipeline<L, C> {
    pub fn new(locator: L, classifier: C, fallback: ScoreFallback) -> Self {
        Self {
            normalizer: ColorNormalizer::new(),
            locator,
            classifier,
            fallback,
        }
    }

    /// Runs one frame through every stage.
    ///
    /// `Ok(None)` and `Err(_)` both mean the frame produces no output; errors
    /// are per-frame and never poison the pipeline. Without a face the
    /// classifier is not invoked.
    pub fn process(&mut self, frame: &Frame) -> Result<Option<Decision>> {
        let Some(normalized) = self.normalizer.normalize(frame)? else {
            debug!("Frame has no pixel data, skipping");
            return Ok(None);
        };

        let face = self.locator.locate(normalized.gray)?;
        let Some(crop) = crop_and_resize(normalized.rgb, face) else {
            return Ok(decide(false, None, self.fallback));
        };

        let tensor = encode_tensor(&crop);
        let scores = self.classifier.classify(&tensor)?;
        debug!(?face, scores = ?scores.as_slice(), "Classified face");
        Ok(decide(true, Some(&scores), self.fallback))
    }
}

struct MailboxInner {
    slot: Mutex<Option<FrameLease>>,
    notify: Notify,
    closed: AtomicBool,
    replaced: AtomicU64,
}

/// Single-slot, keep-only-latest frame hand-off.
///
/// Posting overwrites (and thereby releases) any frame the worker has not
/// picked up yet, so memory stays bounded however slow inference is.
#[derive(Clone)]
pub struct FrameMailbox {
    inner: Arc<MailboxInner>,
}

impl Default for FrameMailbox {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameMailbox {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(MailboxInner {
                slot: Mutex::new(None),
                notify: Notify::new(),
                closed: AtomicBool::new(false),
                replaced: AtomicU64::new(0),
            }),
        }
    }

    /// Stores `lease` as the newest frame; returns true if it replaced a pending one.
    ///
    /// Frames posted after [`FrameMailbox::close`] are released immediately.
    pub fn post(&self, lease: impl Into<FrameLease>) -> bool {
        let lease = lease.into();
        if self.is_closed() {
            return false;
        }
        let previous = self
            .inner
            .slot
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .replace(lease);
        self.inner.notify.notify_one();

        let replaced = previous.is_some();
        if replaced {
            let total = self.inner.replaced.fetch_add(1, Ordering::Relaxed) + 1;
            debug!(total, "Dropped stale frame");
        }
        replaced
    }

    /// Takes the pending frame, if any
    pub fn take(&self) -> Option<FrameLease> {
        self.inner
            .slot
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }

    /// Waits for the next frame; `None` once the mailbox is closed and empty
    pub async fn next(&self) -> Option<FrameLease> {
        loop {
            if let Some(lease) = self.take() {
                return Some(lease);
            }
            if self.is_closed() {
                return None;
            }
            self.inner.notify.notified().await;
        }
    }

    pub fn close(&self) {
        self.inner.closed.store(true, Ordering::SeqCst);
        self.inner.notify.notify_one();
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    /// Frames overwritten before the worker got to them
    pub fn replaced_frames(&self) -> u64 {
        self.inner.replaced.load(Ordering::Relaxed)
    }
}

/// Permits for keep-only-latest capture: one frame in flight, one pending,
/// one being captured. Posting the fresh capture releases the pending frame.
pub const LATEST_ONLY_PERMITS: usize = 3;

/// Limits how many captured frames may be out on loan at once.
///
/// Capture waits for a permit before grabbing the next frame; the permit
/// returns when the frame's lease is released.
#[derive(Clone)]
pub struct CaptureGate {
    permits: Arc<Semaphore>,
}

impl CaptureGate {
    pub fn new(max_outstanding: usize) -> Self {
        Self {
            permits: Arc::new(Semaphore::new(max_outstanding)),
        }
    }

    /// Waits until a frame may be captured
    pub async fn ready(&self) -> CapturePermit {
        // The semaphore is never closed, so acquisition only waits
        match self.permits.clone().acquire_owned().await {
            Ok(permit) => CapturePermit(Some(permit)),
            Err(_) => CapturePermit(None),
        }
    }

    pub fn try_ready(&self) -> Option<CapturePermit> {
        self.permits
            .clone()
            .try_acquire_owned()
            .ok()
            .map(|permit| CapturePermit(Some(permit)))
    }

    pub fn available(&self) -> usize {
        self.permits.available_permits()
    }
}

/// Right to lend one frame to the pipeline
pub struct CapturePermit(Option<OwnedSemaphorePermit>);

impl CapturePermit {
    /// Ties the permit to `frame`; it is returned when the lease is released
    pub fn lease(self, frame: Frame) -> FrameLease {
        let permit = self.0;
        FrameLease::new(frame, move || drop(permit))
    }
}

/// Dedicated thread running a [`FramePipeline`] over the newest mailbox frame
pub struct PipelineWorker {
    mailbox: FrameMailbox,
    handle: Option<JoinHandle<()>>,
}

impl PipelineWorker {
    /// Starts the worker.
    ///
    /// `build` runs on the worker thread, so detector and model handles never
    /// cross threads. Its failure (missing model, bad cascade) is returned here.
    pub fn spawn<L, C, F>(build: F, dispatcher: SinkDispatcher, slots: DeviceSlots) -> Result<Self>
    where
        L: FaceLocator + 'static,
        C: Classifier + 'static,
        F: FnOnce() -> Result<FramePipeline<L, C>> + Send + 'static,
    {
        let mailbox = FrameMailbox::new();
        let worker_mailbox = mailbox.clone();
        let (ready_tx, ready_rx) = oneshot::channel::<Result<()>>();

        let handle = std::thread::Builder::new()
            .name("emotion-pipeline".to_string())
            .spawn(move || {
                let runtime = match tokio::runtime::Builder::new_current_thread().build() {
                    Ok(runtime) => runtime,
                    Err(e) => {
                        let _ = ready_tx.send(Err(e.into()));
                        return;
                    }
                };
                let mut pipeline = match build() {
                    Ok(pipeline) => pipeline,
                    Err(e) => {
                        let _ = ready_tx.send(Err(e));
                        return;
                    }
                };
                let _ = ready_tx.send(Ok(()));

                runtime.block_on(async move {
                    let mut processed = 0u64;
                    while let Some(lease) = worker_mailbox.next().await {
                        match pipeline.process(lease.frame()) {
                            Ok(Some(decision)) => {
                                debug!(%decision, "Frame decision");
                                dispatcher.submit_decision(&slots, &decision);
                            }
                            Ok(None) => debug!("Frame produced no result"),
                            Err(e) => warn!("Skipping frame: {}", e),
                        }
                        // Releasing the lease lets capture deliver the next frame
                        drop(lease);
                        processed += 1;
                    }
                    info!(
                        processed,
                        replaced = worker_mailbox.replaced_frames(),
                        "Pipeline worker stopped"
                    );
                });
            })?;

        let ready = ready_rx.blocking_recv().map_err(|_| {
            EmotionRelayError::ModelLoad("pipeline worker exited during start-up".to_string())
        });
        match ready {
            Ok(Ok(())) => Ok(Self {
                mailbox,
                handle: Some(handle),
            }),
            Ok(Err(e)) | Err(e) => {
                error!("Pipeline failed to start: {}", e);
                let _ = handle.join();
                Err(e)
            }
        }
    }

    /// Handle for the capture side to post frames into
    pub fn mailbox(&self) -> FrameMailbox {
        self.mailbox.clone()
    }

    /// Finishes the pending frame, if any, then stops the worker
    pub fn shutdown(mut self) {
        self.stop();
    }

    fn stop(&mut self) {
        self.mailbox.close();
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                error!("Pipeline worker panicked");
            }
        }
    }
}

impl Drop for PipelineWorker {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{BoundingBox, Emotion, PixelFormat, Rotation, ScoreVector};
    use crate::preprocess::InputTensor;
    use image::GrayImage;
    use std::sync::atomic::AtomicUsize;

    struct FixedLocator(Option<BoundingBox>);

    impl FaceLocator for FixedLocator {
        fn detect(&mut self, _gray: &GrayImage) -> Result<Vec<BoundingBox>> {
            Ok(self.0.into_iter().collect())
        }
    }

    struct CountingClassifier {
        scores: ScoreVector,
        calls: Arc<AtomicUsize>,
    }

    impl Classifier for CountingClassifier {
        fn classify(&mut self, input: &InputTensor) -> Result<ScoreVector> {
            assert_eq!(input.values().len(), 2304);
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(self.scores)
        }
    }

    fn pipeline(
        face: Option<BoundingBox>,
        scores: [f32; 7],
    ) -> (FramePipeline<FixedLocator, CountingClassifier>, Arc<AtomicUsize>) {
        let calls = Arc::new(AtomicUsize::new(0));
        let classifier = CountingClassifier {
            scores: ScoreVector(scores),
            calls: calls.clone(),
        };
        (
            FramePipeline::new(FixedLocator(face), classifier, ScoreFallback::Argmax),
            calls,
        )
    }

    fn gray_frame(width: u32, height: u32) -> Frame {
        let mut data = vec![128u8; (width * height) as usize];
        data.extend(vec![128u8; PixelFormat::Nv21.frame_len(width, height) - data.len()]);
        Frame::new(data, width, height, PixelFormat::Nv21, Rotation::Deg90)
    }

    #[test]
    fn no_face_skips_the_classifier() {
        let (mut pipeline, calls) = pipeline(None, [0.0, 0.0, 0.0, 1.0, 0.0, 0.0, 0.0]);
        let decision = pipeline.process(&gray_frame(64, 48)).unwrap();
        assert_eq!(decision, Some(Decision::NoFace));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn located_face_is_classified() {
        let face = Some(BoundingBox::new(8, 8, 24, 30));
        let (mut pipeline, calls) = pipeline(face, [0.0, 0.0, 0.0, 0.0, 0.0, 1.0, 0.0]);
        let decision = pipeline.process(&gray_frame(64, 48)).unwrap();
        assert_eq!(decision, Some(Decision::Label(Emotion::Surprise)));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn empty_frame_yields_nothing() {
        let (mut pipeline, calls) = pipeline(None, [0.0; 7]);
        let empty = Frame::new(Vec::new(), 0, 0, PixelFormat::Nv21, Rotation::Deg0);
        assert_eq!(pipeline.process(&empty).unwrap(), None);
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn malformed_frame_is_an_error_not_a_panic() {
        let (mut pipeline, _) = pipeline(None, [0.0; 7]);
        let truncated = Frame::new(vec![0; 5], 64, 48, PixelFormat::Nv21, Rotation::Deg0);
        assert!(pipeline.process(&truncated).is_err());
    }

    #[test]
    fn mailbox_keeps_only_the_latest_frame() {
        let mailbox = FrameMailbox::new();
        let released = Arc::new(AtomicUsize::new(0));
        for width in 1..=3u32 {
            let counter = released.clone();
            let data = vec![0; 3 * width as usize];
            let frame = Frame::new(data, width, 1, PixelFormat::Rgb8, Rotation::Deg0);
            mailbox.post(FrameLease::new(frame, move || {
                counter.fetch_add(1, Ordering::SeqCst);
            }));
        }
        // The two overwritten frames were released on replacement
        assert_eq!(released.load(Ordering::SeqCst), 2);
        assert_eq!(mailbox.replaced_frames(), 2);

        let latest = mailbox.take().unwrap();
        assert_eq!(latest.frame().width, 3);
        assert!(mailbox.take().is_none());
        drop(latest);
        assert_eq!(released.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn closed_mailbox_rejects_frames() {
        let mailbox = FrameMailbox::new();
        mailbox.close();
        let frame = Frame::new(vec![0; 3], 1, 1, PixelFormat::Rgb8, Rotation::Deg0);
        assert!(!mailbox.post(frame));
        assert!(mailbox.take().is_none());
    }

    #[test]
    fn capture_waits_for_leases_to_be_released() {
        let gate = CaptureGate::new(2);
        let mailbox = FrameMailbox::new();
        let rgb = || Frame::new(vec![0; 3], 1, 1, PixelFormat::Rgb8, Rotation::Deg0);

        let in_flight = gate.try_ready().unwrap().lease(rgb());
        mailbox.post(gate.try_ready().unwrap().lease(rgb()));
        assert!(gate.try_ready().is_none());

        // A newer frame overwrites the pending one and hands its permit back
        let permit = {
            drop(in_flight);
            gate.try_ready().unwrap()
        };
        mailbox.post(permit.lease(rgb()));
        assert_eq!(gate.available(), 1);

        drop(mailbox.take());
        assert_eq!(gate.available(), 2);
    }

    #[test]
    fn busy_worker_gets_the_newest_capture() {
        let gate = CaptureGate::new(LATEST_ONLY_PERMITS);
        let mailbox = FrameMailbox::new();
        let rgb = |width: u32| {
            Frame::new(vec![0; 3 * width as usize], width, 1, PixelFormat::Rgb8, Rotation::Deg0)
        };

        mailbox.post(gate.try_ready().unwrap().lease(rgb(1)));
        let in_flight = mailbox.take().unwrap();

        // Capture keeps going while the worker is busy with frame 1
        for width in 2..=5 {
            let permit = gate.try_ready().expect("capture stalled behind a busy worker");
            mailbox.post(permit.lease(rgb(width)));
        }
        assert_eq!(mailbox.replaced_frames(), 3);

        drop(in_flight);
        assert_eq!(mailbox.take().unwrap().frame().width, 5);
        assert_eq!(gate.available(), LATEST_ONLY_PERMITS);
    }

    #[test]
    fn worker_start_failure_is_reported() {
        let dispatcher = SinkDispatcher::spawn(crate::sink::LogSink, 1).unwrap();
        let result = PipelineWorker::spawn(
            || -> Result<FramePipeline<FixedLocator, CountingClassifier>> {
                Err(EmotionRelayError::ModelLoad("emotion.onnx not found".to_string()))
            },
            dispatcher,
            DeviceSlots::for_toggle(true),
        );
        assert!(matches!(result, Err(EmotionRelayError::ModelLoad(_))));
    }
}
