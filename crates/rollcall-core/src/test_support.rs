//! Deterministic encoder double and image helpers for unit tests.

use std::collections::HashMap;
use std::io::Cursor;

use image::{ImageFormat, Rgb, RgbImage};

use crate::encoder::{EncoderError, FaceEncoder};
use crate::frame::Frame;
use crate::types::{BoundingBox, Embedding};
use crate::upload::Upload;

pub const FAKE_MODEL: &str = "fake-v1";

/// A 4×4 PNG whose top-left red channel carries `tag`.
pub fn png(tag: u8) -> Vec<u8> {
    let img = RgbImage::from_pixel(4, 4, Rgb([tag, 0, 0]));
    let mut buf = Cursor::new(Vec::new());
    img.write_to(&mut buf, ImageFormat::Png)
        .expect("encode test png");
    buf.into_inner()
}

pub fn upload(tag: u8) -> Upload {
    Upload::new(format!("photo-{tag}.png"), png(tag))
}

/// Encoder keyed by the frame's tag pixel: each tag maps to the embeddings
/// of the faces "present" in that frame, in detection order.
#[derive(Default)]
pub struct FakeEncoder {
    faces: HashMap<u8, Vec<Vec<f32>>>,
}

impl FakeEncoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_faces(mut self, tag: u8, embeddings: Vec<Vec<f32>>) -> Self {
        self.faces.insert(tag, embeddings);
        self
    }

    fn tag(frame: &Frame) -> u8 {
        frame.image().get_pixel(0, 0)[0]
    }
}

impl FaceEncoder for FakeEncoder {
    fn detect(&self, frame: &Frame) -> Result<Vec<BoundingBox>, EncoderError> {
        let count = self.faces.get(&Self::tag(frame)).map_or(0, Vec::len);
        Ok((0..count)
            .map(|i| BoundingBox {
                x: i as f32,
                y: 0.0,
                width: 1.0,
                height: 1.0,
                confidence: 1.0 - i as f32 * 0.01,
                landmarks: None,
            })
            .collect())
    }

    fn encode(&self, frame: &Frame, face: &BoundingBox) -> Result<Embedding, EncoderError> {
        self.faces
            .get(&Self::tag(frame))
            .and_then(|faces| faces.get(face.x as usize))
            .map(|values| Embedding::new(values.clone(), Some(FAKE_MODEL.into())))
            .ok_or_else(|| EncoderError::InferenceFailed("no such face".into()))
    }
}
