//! Scripted encoder and a fully wired service graph over a temp directory.

use std::collections::HashMap;
use std::io::Cursor;
use std::sync::Arc;

use image::{ImageFormat, Rgb, RgbImage};
use rollcall_core::{
    BoundingBox, CourseDefaults, Embedding, EncoderError, EnrollmentPolicy, EnrollmentService,
    FaceEncoder, Frame, IdentityStore, MatchingEngine, PhotoArea, SessionLedger, Upload,
};
use tempfile::TempDir;

/// One face per known tag; the tag is the red value of the first pixel.
struct ScriptedEncoder {
    faces: HashMap<u8, Vec<f32>>,
}

impl ScriptedEncoder {
    fn tag(frame: &Frame) -> u8 {
        frame.image().get_pixel(0, 0)[0]
    }
}

impl FaceEncoder for ScriptedEncoder {
    fn detect(&self, frame: &Frame) -> Result<Vec<BoundingBox>, EncoderError> {
        Ok(self
            .faces
            .get(&Self::tag(frame))
            .map(|_| BoundingBox {
                x: 0.0,
                y: 0.0,
                width: 4.0,
                height: 4.0,
                confidence: 0.9,
                landmarks: None,
            })
            .into_iter()
            .collect())
    }

    fn encode(&self, frame: &Frame, _face: &BoundingBox) -> Result<Embedding, EncoderError> {
        self.faces
            .get(&Self::tag(frame))
            .map(|v| Embedding::new(v.clone(), Some("scripted".into())))
            .ok_or_else(|| EncoderError::InferenceFailed("unscripted frame".into()))
    }
}

pub fn png(tag: u8) -> Vec<u8> {
    let mut buf = Cursor::new(Vec::new());
    RgbImage::from_pixel(4, 4, Rgb([tag, 0, 0]))
        .write_to(&mut buf, ImageFormat::Png)
        .unwrap();
    buf.into_inner()
}

pub fn photo(tag: u8) -> Upload {
    Upload::new(format!("photo-{tag}.png"), png(tag))
}

pub struct Fixture {
    pub tmp: TempDir,
    pub store: Arc<IdentityStore>,
    pub ledger: Arc<SessionLedger>,
    pub enrollment: Arc<EnrollmentService>,
    pub matching: Arc<MatchingEngine>,
}

/// Tags 1-3 are three views of one face, 10 is that face in class,
/// 20 is a stranger and anything else has no face.
pub fn fixture() -> Fixture {
    let tmp = TempDir::new().unwrap();
    let encoder: Arc<dyn FaceEncoder> = Arc::new(ScriptedEncoder {
        faces: HashMap::from([
            (1, vec![1.0, 0.1, 0.0]),
            (2, vec![1.0, -0.1, 0.0]),
            (3, vec![1.0, 0.0, 0.0]),
            (10, vec![0.91, 0.41461, 0.0]),
            (20, vec![0.2, 0.9798, 0.0]),
        ]),
    });
    let store = Arc::new(
        IdentityStore::open(
            tmp.path().join("students.json"),
            PhotoArea::new(tmp.path().join("images")),
        )
        .unwrap(),
    );
    let ledger = Arc::new(
        SessionLedger::open(tmp.path().join("sessions.json"), CourseDefaults::default()).unwrap(),
    );
    let enrollment = Arc::new(EnrollmentService::new(
        encoder.clone(),
        store.clone(),
        EnrollmentPolicy::default(),
    ));
    let matching = Arc::new(MatchingEngine::new(encoder, store.clone()));
    Fixture {
        tmp,
        store,
        ledger,
        enrollment,
        matching,
    }
}
