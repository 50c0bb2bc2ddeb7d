//! Uploaded photo payloads and their acceptance rules.

use std::path::Path;

use crate::error::{Error, Result};
use crate::frame::Frame;

/// File extensions accepted for enrollment photos and scan frames.
pub const ALLOWED_EXTENSIONS: [&str; 3] = ["jpg", "jpeg", "png"];

/// Upper bound on the bytes accepted in one request (16 MiB).
pub const DEFAULT_MAX_UPLOAD_BYTES: usize = 16 * 1024 * 1024;

/// Raw image bytes plus the filename they were submitted under.
#[derive(Clone)]
pub struct Upload {
    pub filename: String,
    pub bytes: Vec<u8>,
}

impl Upload {
    pub fn new(filename: impl Into<String>, bytes: Vec<u8>) -> Self {
        Self {
            filename: filename.into(),
            bytes,
        }
    }

    /// Bytes read from `path`, named by its final component only.
    pub fn from_path(path: &Path, bytes: Vec<u8>) -> Self {
        let filename = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        Self { filename, bytes }
    }

    /// Lowercased extension, if the filename has one.
    pub fn extension(&self) -> Option<String> {
        let (stem, ext) = self.filename.rsplit_once('.')?;
        if stem.is_empty() && ext.is_empty() {
            return None;
        }
        Some(ext.to_ascii_lowercase())
    }

    /// The accepted extension, or a validation error naming the file.
    pub fn checked_extension(&self) -> Result<String> {
        match self.extension() {
            Some(ext) if ALLOWED_EXTENSIONS.contains(&ext.as_str()) => Ok(ext),
            _ => Err(Error::Validation(format!(
                "invalid file: '{}' (accepted: {})",
                self.filename,
                ALLOWED_EXTENSIONS.join(", ")
            ))),
        }
    }

    pub fn decode(&self) -> Result<Frame> {
        Frame::decode(&self.bytes).map_err(|err| {
            Error::Validation(format!("could not decode '{}': {err}", self.filename))
        })
    }
}

impl std::fmt::Debug for Upload {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Upload")
            .field("filename", &self.filename)
            .field("len", &self.bytes.len())
            .finish()
    }
}

/// Reject a batch whose combined size exceeds `max_bytes`.
pub fn check_total_size(uploads: &[Upload], max_bytes: usize) -> Result<()> {
    let total: usize = uploads.iter().map(|u| u.bytes.len()).sum();
    if total > max_bytes {
        return Err(Error::Validation(format!(
            "request body of {total} bytes exceeds the {max_bytes} byte limit"
        )));
    }
    Ok(())
}
