//! Whole-document JSON persistence with atomic replacement.

use std::fs;
use std::io::{BufWriter, Write};
use std::path::Path;

use serde::de::DeserializeOwned;
use serde::Serialize;
use tempfile::NamedTempFile;

use crate::error::{Error, Result};

/// Read a JSON document; a missing file yields `T::default()`.
pub(crate) fn read_json<T>(path: &Path) -> Result<T>
where
    T: DeserializeOwned + Default,
{
    let data = match fs::read(path) {
        Ok(data) => data,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(T::default()),
        Err(source) => return Err(Error::storage(path, source)),
    };

    serde_json::from_slice(&data).map_err(|source| Error::Document {
        path: path.to_path_buf(),
        source,
    })
}

/// Replace `path` with the serialized `value`.
///
/// Writes a temporary file in the same directory, fsyncs it and renames it
/// over the target, so readers see either the old or the new document.
pub(crate) fn write_json_atomic<T>(path: &Path, value: &T) -> Result<()>
where
    T: Serialize + ?Sized,
{
    let parent = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p,
        _ => Path::new("."),
    };
    fs::create_dir_all(parent).map_err(|source| Error::storage(parent, source))?;

    let serialized = serde_json::to_vec_pretty(value).map_err(|source| Error::Document {
        path: path.to_path_buf(),
        source,
    })?;

    let mut tmp = NamedTempFile::new_in(parent).map_err(|source| Error::storage(path, source))?;
    {
        let file = tmp.as_file_mut();
        let mut writer = BufWriter::new(&mut *file);
        writer
            .write_all(&serialized)
            .and_then(|_| writer.write_all(b"\n"))
            .and_then(|_| writer.flush())
            .map_err(|source| Error::storage(path, source))?;
    }
    tmp.as_file()
        .sync_all()
        .map_err(|source| Error::storage(path, source))?;

    tmp.persist(path)
        .map_err(|err| Error::storage(path, err.error))?;
    Ok(())
}
