//! [`FaceEncoder`] backed by SCRFD detection and ArcFace recognition.

use std::path::Path;
use std::sync::Mutex;

use ort::session::Session;

use crate::detector::FaceDetector;
use crate::encoder::{EncoderError, FaceEncoder};
use crate::frame::Frame;
use crate::recognizer::FaceRecognizer;
use crate::types::{BoundingBox, Embedding};

/// Open an ONNX session, reporting every failure as `ModelUnavailable`.
pub(crate) fn open_session(model_path: &Path) -> Result<Session, EncoderError> {
    if !model_path.exists() {
        return Err(EncoderError::ModelUnavailable(format!(
            "model file not found: {} (download the insightface buffalo_l pack into the model directory)",
            model_path.display()
        )));
    }

    build_session(model_path).map_err(|err| {
        EncoderError::ModelUnavailable(format!("{}: {err}", model_path.display()))
    })
}

fn build_session(model_path: &Path) -> Result<Session, EncoderError> {
    Ok(Session::builder()?
        .with_intra_threads(2)
        .map_err(ort::Error::from)?
        .commit_from_file(model_path)?)
}

/// SCRFD + ArcFace encoder. Both sessions run behind mutexes so one loaded
/// instance can be shared across worker threads.
pub struct OnnxEncoder {
    detector: Mutex<FaceDetector>,
    recognizer: Mutex<FaceRecognizer>,
}

impl OnnxEncoder {
    pub const DETECTOR_FILE: &'static str = "det_10g.onnx";
    pub const RECOGNIZER_FILE: &'static str = "w600k_r50.onnx";

    /// Load both models from `model_dir`.
    pub fn load(model_dir: &Path) -> Result<Self, EncoderError> {
        let detector = FaceDetector::load(&model_dir.join(Self::DETECTOR_FILE))?;
        let recognizer = FaceRecognizer::load(&model_dir.join(Self::RECOGNIZER_FILE))?;
        Ok(Self {
            detector: Mutex::new(detector),
            recognizer: Mutex::new(recognizer),
        })
    }
}

impl FaceEncoder for OnnxEncoder {
    fn detect(&self, frame: &Frame) -> Result<Vec<BoundingBox>, EncoderError> {
        let mut detector = self
            .detector
            .lock()
            .map_err(|_| EncoderError::InferenceFailed("detector lock poisoned".into()))?;
        detector.detect(frame)
    }

    fn encode(&self, frame: &Frame, face: &BoundingBox) -> Result<Embedding, EncoderError> {
        let mut recognizer = self
            .recognizer
            .lock()
            .map_err(|_| EncoderError::InferenceFailed("recognizer lock poisoned".into()))?;
        recognizer.extract(frame, face)
    }
}
