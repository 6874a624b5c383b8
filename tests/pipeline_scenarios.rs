//! End-to-end frame scenarios: frame in, published slot value out.
//!
//! Detection and inference are replaced by scripted fakes, so no model files
//! or native backends are needed.

use approx::assert_relative_eq;
use emotion_relay::pipeline::{
    CaptureGate, FrameMailbox, FramePipeline, PipelineWorker, LATEST_ONLY_PERMITS,
};
use emotion_relay::preprocess::{crop_and_resize, encode_tensor, InputTensor, CROP_SIZE};
use emotion_relay::sink::{DeviceSlots, ResultSink, SinkDispatcher};
use emotion_relay::{
    BoundingBox, Classifier, FaceLocator, Frame, PixelFormat, Result, Rotation, ScoreFallback,
    ScoreVector,
};
use image::{GrayImage, Rgb, RgbImage};
use std::sync::{mpsc, Arc, Mutex};

const HAPPY: [f32; 7] = [0.0, 0.0, 0.0, 1.0, 0.0, 0.0, 0.0];

struct ScriptedLocator(Vec<BoundingBox>);

impl FaceLocator for ScriptedLocator {
    fn detect(&mut self, _gray: &GrayImage) -> Result<Vec<BoundingBox>> {
        Ok(self.0.clone())
    }
}

/// Returns fixed scores and keeps every tensor it was given
struct RecordingClassifier {
    scores: ScoreVector,
    inputs: Arc<Mutex<Vec<Vec<f32>>>>,
}

impl Classifier for RecordingClassifier {
    fn classify(&mut self, input: &InputTensor) -> Result<ScoreVector> {
        self.inputs.lock().unwrap().push(input.values().to_vec());
        Ok(self.scores)
    }
}

#[derive(Default)]
struct RecordingSink {
    writes: Mutex<Vec<(String, String)>>,
}

impl ResultSink for RecordingSink {
    fn publish(&self, key: &str, value: &str) -> Result<()> {
        self.writes
            .lock()
            .unwrap()
            .push((key.to_string(), value.to_string()));
        Ok(())
    }
}

fn solid_frame(width: u32, height: u32, red: u8) -> Frame {
    Frame::from_rgb_image(RgbImage::from_pixel(width, height, Rgb([red, 90, 30])))
}

/// Runs `frames` through a worker and returns what reached the sink
fn publish_frames(
    faces: Vec<BoundingBox>,
    scores: [f32; 7],
    paired: bool,
    frames: Vec<Frame>,
) -> (Vec<(String, String)>, Vec<Vec<f32>>) {
    let sink = Arc::new(RecordingSink::default());
    let inputs = Arc::new(Mutex::new(Vec::new()));
    let classifier_inputs = inputs.clone();

    let dispatcher = SinkDispatcher::spawn(sink.clone(), 8).unwrap();
    let worker = PipelineWorker::spawn(
        move || {
            Ok(FramePipeline::new(
                ScriptedLocator(faces),
                RecordingClassifier {
                    scores: ScoreVector(scores),
                    inputs: classifier_inputs,
                },
                ScoreFallback::Argmax,
            ))
        },
        dispatcher,
        DeviceSlots::for_toggle(paired),
    )
    .unwrap();

    let mailbox = worker.mailbox();
    for frame in frames {
        mailbox.post(frame);
    }
    worker.shutdown();

    let writes = sink.writes.lock().unwrap().clone();
    let inputs = inputs.lock().unwrap().clone();
    (writes, inputs)
}

#[test]
fn frame_without_face_publishes_no_face() {
    let (writes, inputs) = publish_frames(Vec::new(), HAPPY, true, vec![solid_frame(64, 48, 10)]);

    assert_eq!(
        writes,
        vec![("emotion/2".to_string(), "No Face   None".to_string())]
    );
    assert!(inputs.is_empty(), "classifier ran without a face");
}

#[test]
fn happy_face_publishes_label_and_glyph() {
    let face = BoundingBox::new(16, 8, 32, 32);
    let (writes, inputs) = publish_frames(vec![face], HAPPY, true, vec![solid_frame(64, 48, 10)]);

    assert_eq!(
        writes,
        vec![("emotion/2".to_string(), "happy   \u{1F601}".to_string())]
    );
    assert_eq!(inputs.len(), 1);
}

#[test]
fn unpaired_device_writes_the_other_slot() {
    let (writes, _) = publish_frames(Vec::new(), HAPPY, false, vec![solid_frame(32, 32, 0)]);
    assert_eq!(writes[0].0, "emotion/1");
}

#[test]
fn small_box_is_resized_to_model_input() {
    let rgb = RgbImage::from_pixel(100, 100, Rgb([77, 0, 0]));
    let crop = crop_and_resize(&rgb, Some(BoundingBox::new(10, 10, 5, 5))).unwrap();
    assert_eq!(crop.image().dimensions(), (CROP_SIZE, CROP_SIZE));

    let tensor = encode_tensor(&crop);
    assert_eq!(tensor.array().shape(), &[1, 48, 48, 1]);
    for value in tensor.values() {
        assert_relative_eq!(*value, 77.0);
    }
}

#[test]
fn largest_of_two_faces_is_classified() {
    // Left half red 200, right half red 50; the larger box covers the right half
    let rgb = RgbImage::from_fn(100, 60, |x, _| {
        if x < 50 {
            Rgb([200, 0, 0])
        } else {
            Rgb([50, 0, 0])
        }
    });
    let small = BoundingBox::new(5, 5, 30, 30);
    let large = BoundingBox::new(55, 5, 40, 40);

    let (writes, inputs) = publish_frames(
        vec![small, large],
        HAPPY,
        true,
        vec![Frame::from_rgb_image(rgb)],
    );

    assert_eq!(writes.len(), 1);
    assert_eq!(inputs.len(), 1);
    assert_eq!(inputs[0].len(), 48 * 48);
    for value in &inputs[0] {
        assert_relative_eq!(*value, 50.0);
    }
}

/// Records the raster width of every frame it is asked about
struct WidthRecordingLocator(Arc<Mutex<Vec<u32>>>);

impl FaceLocator for WidthRecordingLocator {
    fn detect(&mut self, gray: &GrayImage) -> Result<Vec<BoundingBox>> {
        self.0.lock().unwrap().push(gray.width());
        Ok(vec![BoundingBox::new(0, 0, 4, 4)])
    }
}

/// Blocks on its first call until the test lets it go
struct StallingClassifier {
    stall: Option<(mpsc::Sender<()>, mpsc::Receiver<()>)>,
}

impl Classifier for StallingClassifier {
    fn classify(&mut self, _input: &InputTensor) -> Result<ScoreVector> {
        if let Some((started, resume)) = self.stall.take() {
            started.send(()).unwrap();
            resume.recv().unwrap();
        }
        Ok(ScoreVector(HAPPY))
    }
}

#[test]
fn slow_worker_processes_the_newest_frame_next() {
    let sink = Arc::new(RecordingSink::default());
    let seen = Arc::new(Mutex::new(Vec::new()));
    let (started_tx, started_rx) = mpsc::channel();
    let (resume_tx, resume_rx) = mpsc::channel();

    let locator = WidthRecordingLocator(seen.clone());
    let dispatcher = SinkDispatcher::spawn(sink.clone(), 8).unwrap();
    let worker = PipelineWorker::spawn(
        move || {
            Ok(FramePipeline::new(
                locator,
                StallingClassifier {
                    stall: Some((started_tx, resume_rx)),
                },
                ScoreFallback::Argmax,
            ))
        },
        dispatcher,
        DeviceSlots::for_toggle(true),
    )
    .unwrap();

    let gate = CaptureGate::new(LATEST_ONLY_PERMITS);
    let mailbox = worker.mailbox();
    mailbox.post(gate.try_ready().unwrap().lease(solid_frame(10, 10, 0)));
    started_rx.recv().unwrap();

    // The worker is stuck on the first frame; capture must not stall
    for width in 11..=15 {
        let permit = gate.try_ready().expect("capture blocked by a busy worker");
        mailbox.post(permit.lease(solid_frame(width, 10, 0)));
    }
    resume_tx.send(()).unwrap();
    worker.shutdown();

    assert_eq!(*seen.lock().unwrap(), vec![10, 15]);
    assert_eq!(mailbox.replaced_frames(), 4);
    assert_eq!(sink.writes.lock().unwrap().len(), 2);
    assert_eq!(gate.available(), LATEST_ONLY_PERMITS);
}

#[test]
fn rotated_yuv_frame_reaches_the_sink() {
    // 4x2 NV21 sensor frame rotated to portrait
    let (width, height) = (4, 2);
    let data = vec![128u8; PixelFormat::Nv21.frame_len(width, height)];
    let frame = Frame::new(data, width, height, PixelFormat::Nv21, Rotation::Deg270);

    let (writes, _) = publish_frames(Vec::new(), HAPPY, true, vec![frame]);
    assert_eq!(writes.len(), 1);
}

#[test]
fn capture_gate_bounds_outstanding_frames() {
    let gate = CaptureGate::new(2);
    let mailbox = FrameMailbox::new();

    let first = gate.try_ready().unwrap().lease(solid_frame(2, 2, 0));
    mailbox.post(gate.try_ready().unwrap().lease(solid_frame(2, 2, 0)));
    assert!(gate.try_ready().is_none());

    drop(first);
    assert_eq!(gate.available(), 1);
    drop(mailbox.take());
    assert_eq!(gate.available(), 2);
}
