use crate::error::MvdbError;
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::fs;
use std::io::Write;
use std::path::Path;
use tempfile::NamedTempFile;

/// Writes `value` as pretty JSON to `path` via a temp file in the same
/// directory, so readers see either the old or the new content.
pub fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> Result<(), MvdbError> {
    let dir = path.parent().ok_or_else(|| {
        MvdbError::Validation(format!("path '{}' has no parent directory", path.display()))
    })?;
    fs::create_dir_all(dir)?;
    let bytes = serde_json::to_vec_pretty(value).map_err(|e| MvdbError::Encode(e.to_string()))?;
    let mut tmp = NamedTempFile::new_in(dir)?;
    tmp.write_all(&bytes)?;
    tmp.flush()?;
    tmp.as_file().sync_all()?;
    tmp.persist(path).map_err(|e| MvdbError::Io(e.error))?;
    fsync_dir(dir)?;
    Ok(())
}

/// Reads JSON from `path`. A missing file is `Ok(None)`.
pub fn read_json<T: DeserializeOwned>(path: &Path) -> Result<Option<T>, MvdbError> {
    let bytes = match fs::read(path) {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    decode_json(&bytes).map(Some)
}

pub fn decode_json<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, MvdbError> {
    serde_json::from_slice(bytes).map_err(|e| MvdbError::Decode(e.to_string()))
}

pub fn encode_json<T: Serialize>(value: &T) -> Result<Vec<u8>, MvdbError> {
    serde_json::to_vec_pretty(value).map_err(|e| MvdbError::Encode(e.to_string()))
}

#[cfg(unix)]
fn fsync_dir(path: &Path) -> Result<(), MvdbError> {
    let dir = fs::File::open(path)?;
    dir.sync_all()?;
    Ok(())
}

#[cfg(not(unix))]
fn fsync_dir(_path: &Path) -> Result<(), MvdbError> {
    Ok(())
}
