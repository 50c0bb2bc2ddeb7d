//! rollcall-core: identity enrollment and face matching for attendance.
//!
//! Owns the persisted identity registry, the enrollment workflow that turns
//! a batch of photos into one centroid embedding, the scan workflow that
//! classifies every face in a frame, and the append-only session ledger.
//! Face detection and embedding go through the [`FaceEncoder`] capability;
//! [`OnnxEncoder`] implements it with SCRFD + ArcFace via ONNX Runtime.

pub mod alignment;
pub mod deadline;
pub mod detector;
pub mod encoder;
pub mod enrollment;
pub mod error;
pub mod frame;
pub mod ledger;
pub mod matching;
pub mod onnx;
pub mod photos;
mod persist;
pub mod recognizer;
pub mod store;
pub mod types;
pub mod upload;

#[cfg(test)]
pub(crate) mod test_support;

pub use deadline::Deadline;
pub use encoder::{EncoderError, FaceEncoder, LazyEncoder};
pub use enrollment::{EnrollmentPolicy, EnrollmentRequest, EnrollmentService};
pub use error::{Error, Result};
pub use frame::Frame;
pub use ledger::{CourseDefaults, NewSession, SessionLedger, SessionRecord, Stats};
pub use matching::{MatchingEngine, ScanReport, DEFAULT_SIMILARITY_THRESHOLD};
pub use onnx::OnnxEncoder;
pub use photos::{PhotoArea, StagedPhotos};
pub use store::{IdentityStore, Registry, Snapshot};
pub use types::{
    BoundingBox, CosineMatcher, Embedding, Identity, IdentitySummary, MatchResult, Matcher,
    ScanSummary,
};
pub use upload::Upload;
