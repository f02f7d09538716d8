use super::types::CatalogState;
use crate::error::ShardError;
use std::fs;
use std::io::Write;
use std::path::Path;
use tempfile::NamedTempFile;

/// Replaces the snapshot at `path` atomically; the previous version is kept
/// next to it as `<name>.prev`.
pub fn write_state_atomic(state: &CatalogState, path: &Path) -> Result<(), ShardError> {
    let dir = path
        .parent()
        .ok_or_else(|| ShardError::Validation(format!("no parent dir for {}", path.display())))?;
    fs::create_dir_all(dir)?;
    if path.exists() {
        fs::copy(path, prev_path(path))?;
    }
    let bytes = serde_json::to_vec_pretty(state).map_err(ShardError::encode)?;
    let mut tmp = NamedTempFile::new_in(dir)?;
    tmp.write_all(&bytes)?;
    tmp.flush()?;
    tmp.as_file().sync_all()?;
    tmp.persist(path).map_err(|e| ShardError::Io(e.error))?;
    Ok(())
}

/// Loads the snapshot, falling back to the previous version when the
/// primary file is unreadable.
pub fn load_state(path: &Path) -> Result<Option<CatalogState>, ShardError> {
    if !path.exists() {
        return Ok(None);
    }
    match read_state(path) {
        Ok(state) => Ok(Some(state)),
        Err(primary_err) => {
            let prev = prev_path(path);
            if prev.exists() {
                tracing::warn!(
                    path = %path.display(),
                    error = %primary_err,
                    "catalog snapshot unreadable, loading previous version"
                );
                return read_state(&prev).map(Some);
            }
            Err(primary_err)
        }
    }
}

fn read_state(path: &Path) -> Result<CatalogState, ShardError> {
    let bytes = fs::read(path)?;
    serde_json::from_slice(&bytes).map_err(ShardError::decode)
}

fn prev_path(path: &Path) -> std::path::PathBuf {
    let mut name = path.file_name().map(|n| n.to_os_string()).unwrap_or_default();
    name.push(".prev");
    path.with_file_name(name)
}
