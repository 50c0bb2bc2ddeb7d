//! Face encoder capability: detect faces, embed one face.

use once_cell::sync::OnceCell;
use thiserror::Error;

use crate::frame::Frame;
use crate::types::{BoundingBox, Embedding};

#[derive(Error, Debug)]
pub enum EncoderError {
    #[error("model unavailable: {0}")]
    ModelUnavailable(String),
    #[error("inference failed: {0}")]
    InferenceFailed(String),
    #[error("face has no landmarks; alignment needs the detector keypoints")]
    NoLandmarks,
    #[error("ort: {0}")]
    Ort(#[from] ort::Error),
}

/// Finds faces in a frame and turns a face region into an embedding.
///
/// Implementations must be deterministic for identical input and keep one
/// embedding dimension for their lifetime. `detect` returns faces best-first;
/// callers that need a single face take the first.
pub trait FaceEncoder: Send + Sync {
    fn detect(&self, frame: &Frame) -> Result<Vec<BoundingBox>, EncoderError>;

    fn encode(&self, frame: &Frame, face: &BoundingBox) -> Result<Embedding, EncoderError>;
}

type Loader<E> = Box<dyn Fn() -> Result<E, EncoderError> + Send + Sync>;

/// An encoder loaded exactly once, on first use or on an explicit [`load`](Self::load).
///
/// Concurrent first callers block on the same initialization. A failed load
/// is remembered: every later call reports the same `ModelUnavailable`
/// without touching the model files again.
pub struct LazyEncoder<E> {
    loader: Loader<E>,
    cell: OnceCell<Result<E, String>>,
}

impl<E: FaceEncoder> LazyEncoder<E> {
    pub fn new<F>(loader: F) -> Self
    where
        F: Fn() -> Result<E, EncoderError> + Send + Sync + 'static,
    {
        Self {
            loader: Box::new(loader),
            cell: OnceCell::new(),
        }
    }

    /// Wrap an already constructed encoder.
    pub fn ready(encoder: E) -> Self {
        Self {
            loader: Box::new(|| {
                Err(EncoderError::ModelUnavailable(
                    "encoder was provided pre-loaded".into(),
                ))
            }),
            cell: OnceCell::with_value(Ok(encoder)),
        }
    }

    /// Initialize if needed and return the encoder.
    pub fn load(&self) -> Result<&E, EncoderError> {
        self.cell
            .get_or_init(|| {
                tracing::info!("loading face models");
                let loaded = (self.loader)();
                match &loaded {
                    Ok(_) => tracing::info!("face models ready"),
                    Err(err) => tracing::error!(error = %err, "face models failed to load"),
                }
                loaded.map_err(|err| match err {
                    EncoderError::ModelUnavailable(msg) => msg,
                    other => other.to_string(),
                })
            })
            .as_ref()
            .map_err(|msg| EncoderError::ModelUnavailable(msg.clone()))
    }

    pub fn is_loaded(&self) -> bool {
        matches!(self.cell.get(), Some(Ok(_)))
    }
}

impl<E: FaceEncoder> FaceEncoder for LazyEncoder<E> {
    fn detect(&self, frame: &Frame) -> Result<Vec<BoundingBox>, EncoderError> {
        self.load()?.detect(frame)
    }

    fn encode(&self, frame: &Frame, face: &BoundingBox) -> Result<Embedding, EncoderError> {
        self.load()?.encode(frame, face)
    }
}
