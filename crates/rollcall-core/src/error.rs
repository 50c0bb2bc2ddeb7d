use std::path::PathBuf;

use thiserror::Error;

use crate::encoder::EncoderError;

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Failures surfaced by the registry, enrollment, matching and ledger.
///
/// Everything above [`Error::Storage`] is an expected outcome of a
/// well-formed request and maps to a client-facing rejection; the rest are
/// internal faults.
#[derive(Error, Debug)]
pub enum Error {
    #[error("invalid request: {0}")]
    Validation(String),
    #[error("identity '{0}' is already enrolled")]
    DuplicateIdentity(String),
    #[error("could not detect a face in at least {required} photos (found {found})")]
    InsufficientFaceSamples { found: usize, required: usize },
    #[error("face models unavailable: {0}; check the model directory and restart the daemon")]
    ModelUnavailable(String),
    #[error("identity '{0}' not found")]
    NotFound(String),
    #[error("deadline exceeded before the operation completed")]
    DeadlineExceeded,
    #[error("storage error at {path}: {source}")]
    Storage {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("malformed document {path}: {source}")]
    Document {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("encoder error: {0}")]
    Encoder(EncoderError),
}

impl Error {
    pub(crate) fn storage(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Storage {
            path: path.into(),
            source,
        }
    }

    /// True for rejections caused by the request itself (the 4xx class).
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            Self::Validation(_)
                | Self::DuplicateIdentity(_)
                | Self::InsufficientFaceSamples { .. }
                | Self::NotFound(_)
        )
    }
}

impl From<EncoderError> for Error {
    fn from(err: EncoderError) -> Self {
        match err {
            EncoderError::ModelUnavailable(msg) => Self::ModelUnavailable(msg),
            other => Self::Encoder(other),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn model_unavailable_is_lifted_out_of_encoder_errors() {
        let err = Error::from(EncoderError::ModelUnavailable("det_10g.onnx missing".into()));
        assert!(matches!(err, Error::ModelUnavailable(ref m) if m.contains("det_10g")));
        assert!(!err.is_client_error());

        let err = Error::from(EncoderError::NoLandmarks);
        assert!(matches!(err, Error::Encoder(EncoderError::NoLandmarks)));
    }

    #[test]
    fn client_errors_are_classified() {
        assert!(Error::Validation("x".into()).is_client_error());
        assert!(Error::DuplicateIdentity("S001".into()).is_client_error());
        assert!(Error::InsufficientFaceSamples { found: 2, required: 3 }.is_client_error());
        assert!(Error::NotFound("S001".into()).is_client_error());
        assert!(!Error::DeadlineExceeded.is_client_error());
    }
}
