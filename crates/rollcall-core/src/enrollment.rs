//! Enrollment: a batch of photos becomes one committed identity.
//!
//! The attempt is all-or-nothing. Photos are staged while the encoder runs
//! and only move into the identity's photo directory when the registry
//! commit succeeds; every other exit path drops the staging area.

use std::sync::Arc;

use chrono::{SecondsFormat, Utc};

use crate::deadline::Deadline;
use crate::encoder::FaceEncoder;
use crate::error::{Error, Result};
use crate::frame::Frame;
use crate::photos::validate_id;
use crate::store::IdentityStore;
use crate::types::{Embedding, Identity};
use crate::upload::{self, Upload, DEFAULT_MAX_UPLOAD_BYTES};

/// Minimum photos per request, and minimum embeddings to build a centroid.
pub const DEFAULT_MIN_PHOTOS: usize = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EnrollmentPolicy {
    pub min_photos: usize,
    pub max_upload_bytes: usize,
}

impl Default for EnrollmentPolicy {
    fn default() -> Self {
        Self {
            min_photos: DEFAULT_MIN_PHOTOS,
            max_upload_bytes: DEFAULT_MAX_UPLOAD_BYTES,
        }
    }
}

#[derive(Debug, Clone)]
pub struct EnrollmentRequest {
    pub id: String,
    pub name: String,
    pub photos: Vec<Upload>,
}

pub struct EnrollmentService {
    encoder: Arc<dyn FaceEncoder>,
    store: Arc<IdentityStore>,
    policy: EnrollmentPolicy,
}

impl EnrollmentService {
    pub fn new(
        encoder: Arc<dyn FaceEncoder>,
        store: Arc<IdentityStore>,
        policy: EnrollmentPolicy,
    ) -> Self {
        Self {
            encoder,
            store,
            policy,
        }
    }

    pub fn policy(&self) -> EnrollmentPolicy {
        self.policy
    }

    pub fn store(&self) -> &Arc<IdentityStore> {
        &self.store
    }

    pub fn enroll(&self, request: EnrollmentRequest, deadline: Deadline) -> Result<Identity> {
        let id = request.id.trim().to_string();
        let name = request.name.trim().to_string();
        let frames = self.validate(&id, &name, &request.photos)?;

        if self.store.contains(&id) {
            return Err(Error::DuplicateIdentity(id));
        }

        let mut staged = self.store.photos().stage()?;
        let mut samples = Vec::with_capacity(frames.len());

        for (index, (photo, frame)) in request.photos.iter().zip(&frames).enumerate() {
            deadline.check()?;
            let extension = photo.checked_extension()?;
            staged.save(index + 1, &extension, &photo.bytes)?;

            let faces = self.encoder.detect(frame)?;
            let Some(face) = faces.first() else {
                tracing::debug!(id = %id, photo = %photo.filename, "no face detected, skipping photo");
                continue;
            };
            samples.push(self.encoder.encode(frame, face)?);
        }

        if samples.len() < self.policy.min_photos {
            tracing::info!(
                id = %id,
                found = samples.len(),
                required = self.policy.min_photos,
                "enrollment rejected: not enough faces"
            );
            staged.discard()?;
            return Err(Error::InsufficientFaceSamples {
                found: samples.len(),
                required: self.policy.min_photos,
            });
        }

        let embedding = Embedding::centroid(&samples).ok_or_else(|| {
            Error::Validation("encoder returned embeddings of differing dimension".into())
        })?;

        let identity = Identity {
            id,
            name,
            embedding,
            photos: Vec::new(),
            registered_at: Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true),
        };
        let committed = self.store.put_staged(identity, staged, deadline)?;

        tracing::info!(
            id = %committed.id,
            photos = committed.photos.len(),
            samples = samples.len(),
            "identity enrolled"
        );
        Ok(committed)
    }

    /// Request-level checks, done before anything touches the disk.
    /// Returns the decoded frames in submission order.
    fn validate(&self, id: &str, name: &str, photos: &[Upload]) -> Result<Vec<Frame>> {
        if id.is_empty() || name.is_empty() {
            return Err(Error::Validation("name and id are required".into()));
        }
        validate_id(id)?;

        if photos.len() < self.policy.min_photos {
            return Err(Error::Validation(format!(
                "at least {} photos are required (got {})",
                self.policy.min_photos,
                photos.len()
            )));
        }
        for photo in photos {
            photo.checked_extension()?;
        }
        upload::check_total_size(photos, self.policy.max_upload_bytes)?;

        photos.iter().map(Upload::decode).collect()
    }
}
