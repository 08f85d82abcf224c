use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use tracing::{debug, info};
use zip::ZipArchive;

use crate::error::DlError;
use crate::fs_util;

struct PlannedEntry {
    index: usize,
    relative: PathBuf,
    is_dir: bool,
}

/// Extracts `zip_path` into `target_dir` and returns the number of files
/// written. Entry names are all checked before anything is written, so an
/// archive with one entry escaping `target_dir` leaves no partial output.
pub fn extract_zip(zip_path: &Path, target_dir: &Path) -> Result<usize, DlError> {
    let read_err = |err: zip::result::ZipError| {
        DlError::Filesystem(format!("read zip {}: {err}", zip_path.display()))
    };
    let file = fs::File::open(zip_path)
        .map_err(|err| DlError::Filesystem(format!("open zip {}: {err}", zip_path.display())))?;
    let mut archive = ZipArchive::new(file).map_err(read_err)?;

    let mut plan = Vec::with_capacity(archive.len());
    for index in 0..archive.len() {
        let entry = archive.by_index(index).map_err(read_err)?;
        let relative = entry.enclosed_name().map(PathBuf::from).ok_or_else(|| {
            DlError::Filesystem(format!(
                "zip {} entry {:?} escapes the extraction directory (path traversal)",
                zip_path.display(),
                entry.name()
            ))
        })?;
        plan.push(PlannedEntry {
            index,
            relative,
            is_dir: entry.is_dir(),
        });
    }

    let mut written = 0;
    for planned in plan {
        let dest = target_dir.join(&planned.relative);
        let dir = if planned.is_dir {
            Some(dest.as_path())
        } else {
            dest.parent()
        };
        if let Some(dir) = dir {
            fs::create_dir_all(dir)
                .map_err(|err| DlError::Filesystem(format!("create {}: {err}", dir.display())))?;
        }
        if planned.is_dir {
            continue;
        }
        let mut entry = archive.by_index(planned.index).map_err(read_err)?;
        let mut out = fs::File::create(&dest)
            .map_err(|err| DlError::Filesystem(format!("create {}: {err}", dest.display())))?;
        io::copy(&mut entry, &mut out)
            .map_err(|err| DlError::Filesystem(format!("write {}: {err}", dest.display())))?;
        written += 1;
    }
    debug!(zip = %zip_path.display(), files = written, "zip extracted");
    Ok(written)
}

/// Extracts `zip_path` next to itself and removes it unless `keep_zip` is set.
/// Returns the archive path without its extension.
pub fn unzip_in_place(zip_path: &Path, keep_zip: bool) -> Result<PathBuf, DlError> {
    let parent = zip_path.parent().ok_or_else(|| {
        DlError::Filesystem(format!("zip {} has no parent directory", zip_path.display()))
    })?;
    info!("Unzipping {}...", zip_path.display());
    extract_zip(zip_path, parent)?;
    if !keep_zip {
        info!("Removing {}...", zip_path.display());
        fs::remove_file(zip_path).map_err(|err| DlError::Filesystem(err.to_string()))?;
    }
    Ok(zip_path.with_extension(""))
}

/// Unzips every archive below `top_dir`, including archives that appear only
/// after an outer archive is unpacked. Consumed archives are removed.
/// Returns the number of archives extracted.
pub fn recursive_unzip(top_dir: &Path) -> Result<usize, DlError> {
    let mut extracted = 0;
    loop {
        let zips = fs_util::find_exts(top_dir, "zip")?;
        if zips.is_empty() {
            break;
        }
        for zip_path in zips {
            unzip_in_place(&zip_path, false)?;
            extracted += 1;
        }
    }
    debug!(dir = %top_dir.display(), extracted, "recursive unzip finished");
    Ok(extracted)
}
