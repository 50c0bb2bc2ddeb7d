//! Scan matching: every face in a frame is either an enrolled identity or unknown.

use std::sync::Arc;

use crate::deadline::Deadline;
use crate::encoder::FaceEncoder;
use crate::error::Result;
use crate::frame::Frame;
use crate::store::IdentityStore;
use crate::types::{CosineMatcher, MatchResult, Matcher, ScanSummary};
use crate::upload::{self, Upload, DEFAULT_MAX_UPLOAD_BYTES};

/// A face matches only when its best similarity is strictly above this.
pub const DEFAULT_SIMILARITY_THRESHOLD: f32 = 0.48;

/// Per-face verdicts for one scanned frame, in detection order.
#[derive(Debug, Clone, PartialEq)]
pub struct ScanReport {
    pub total_detected: usize,
    pub matches: Vec<MatchResult>,
}

impl ScanReport {
    pub fn recognized_count(&self) -> usize {
        self.matches.iter().filter(|m| m.is_match()).count()
    }

    pub fn unknown_count(&self) -> usize {
        self.total_detected - self.recognized_count()
    }

    pub fn summary(&self) -> ScanSummary {
        ScanSummary {
            total_detected: self.total_detected,
            recognized: self
                .matches
                .iter()
                .filter_map(|m| m.identity.clone())
                .collect(),
            unknowns: self.unknown_count(),
        }
    }
}

pub struct MatchingEngine {
    encoder: Arc<dyn FaceEncoder>,
    store: Arc<IdentityStore>,
    threshold: f32,
    max_upload_bytes: usize,
}

impl MatchingEngine {
    pub fn new(encoder: Arc<dyn FaceEncoder>, store: Arc<IdentityStore>) -> Self {
        Self {
            encoder,
            store,
            threshold: DEFAULT_SIMILARITY_THRESHOLD,
            max_upload_bytes: DEFAULT_MAX_UPLOAD_BYTES,
        }
    }

    pub fn with_threshold(mut self, threshold: f32) -> Self {
        self.threshold = threshold;
        self
    }

    pub fn with_max_upload_bytes(mut self, max_upload_bytes: usize) -> Self {
        self.max_upload_bytes = max_upload_bytes;
        self
    }

    pub fn threshold(&self) -> f32 {
        self.threshold
    }

    /// Validate and decode an uploaded scan image, then match it.
    pub fn scan(&self, image: &Upload, deadline: Deadline) -> Result<ScanReport> {
        image.checked_extension()?;
        upload::check_total_size(std::slice::from_ref(image), self.max_upload_bytes)?;
        let frame = image.decode()?;
        self.scan_frame(&frame, deadline)
    }

    pub fn scan_frame(&self, frame: &Frame, deadline: Deadline) -> Result<ScanReport> {
        let faces = self.encoder.detect(frame)?;
        let gallery = self.store.list();

        let mut matches = Vec::with_capacity(faces.len());
        for (face_index, face) in faces.iter().enumerate() {
            deadline.check()?;
            let probe = self.encoder.encode(frame, face)?;

            let verdict = match CosineMatcher.best_match(&probe, &gallery) {
                Some((identity, similarity)) if similarity > self.threshold => MatchResult {
                    face_index,
                    identity: Some(identity.summary()),
                    similarity,
                },
                Some((_, similarity)) => MatchResult {
                    face_index,
                    identity: None,
                    similarity,
                },
                None => MatchResult {
                    face_index,
                    identity: None,
                    similarity: 0.0,
                },
            };
            tracing::debug!(
                face_index,
                similarity = verdict.similarity,
                matched = verdict.identity.as_ref().map(|i| i.id.as_str()),
                "face classified"
            );
            matches.push(verdict);
        }

        let report = ScanReport {
            total_detected: faces.len(),
            matches,
        };
        tracing::info!(
            detected = report.total_detected,
            recognized = report.recognized_count(),
            unknown = report.unknown_count(),
            registry = gallery.len(),
            "scan complete"
        );
        Ok(report)
    }
}
