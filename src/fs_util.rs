use std::fs;
use std::path::{Path, PathBuf};

use crate::error::DlError;

/// Moves `source` into `dest_dir`, keeping its file name. Falls back to
/// copy + remove when a rename is not possible (e.g. across filesystems).
pub fn move_into(source: &Path, dest_dir: &Path) -> Result<PathBuf, DlError> {
    let name = source.file_name().ok_or_else(|| {
        DlError::Filesystem(format!("cannot move {}: no file name", source.display()))
    })?;
    let target = dest_dir.join(name);
    if source == target {
        return Ok(target);
    }
    fs::create_dir_all(dest_dir).map_err(|err| DlError::Filesystem(err.to_string()))?;
    if fs::rename(source, &target).is_err() {
        fs::copy(source, &target).map_err(|err| {
            DlError::Filesystem(format!(
                "move {} -> {}: {err}",
                source.display(),
                target.display()
            ))
        })?;
        fs::remove_file(source).map_err(|err| DlError::Filesystem(err.to_string()))?;
    }
    Ok(target)
}

/// Files directly inside `dir` with extension `ext` (case-insensitive), sorted.
pub fn list_exts(dir: &Path, ext: &str) -> Result<Vec<PathBuf>, DlError> {
    let mut out = Vec::new();
    let entries = fs::read_dir(dir)
        .map_err(|err| DlError::Filesystem(format!("read {}: {err}", dir.display())))?;
    for entry in entries {
        let path = entry
            .map_err(|err| DlError::Filesystem(err.to_string()))?
            .path();
        if path.is_file() && has_ext(&path, ext) {
            out.push(path);
        }
    }
    out.sort();
    Ok(out)
}

/// Files anywhere below `root` with extension `ext`, sorted.
pub fn find_exts(root: &Path, ext: &str) -> Result<Vec<PathBuf>, DlError> {
    let mut out = Vec::new();
    let mut stack = vec![root.to_path_buf()];
    while let Some(path) = stack.pop() {
        let entries = fs::read_dir(&path)
            .map_err(|err| DlError::Filesystem(format!("read {}: {err}", path.display())))?;
        for entry in entries {
            let path = entry
                .map_err(|err| DlError::Filesystem(err.to_string()))?
                .path();
            if path.is_dir() {
                stack.push(path);
            } else if has_ext(&path, ext) {
                out.push(path);
            }
        }
    }
    out.sort();
    Ok(out)
}

pub fn has_ext(path: &Path, ext: &str) -> bool {
    path.extension()
        .and_then(|value| value.to_str())
        .map(|value| value.eq_ignore_ascii_case(ext))
        .unwrap_or(false)
}

pub fn file_name_lossy(path: &Path) -> String {
    path.file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default()
}
