//! Pairing of NORDIC ancillary files with their DICOM series.
//!
//! Ancillary files carry the truncated scan UID somewhere in their file name.
//! They are matched to series by substring containment, moved into the
//! series' `DICOM` folder and counted against the DICOM instances there.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use regex::Regex;
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::domain::AcquisitionRecord;
use crate::error::DlError;
use crate::fs_util;

pub const DICOM_SUBDIR: &str = "DICOM";
pub const DICOM_EXTENSION: &str = "dcm";
pub const DEFAULT_ANCILLARY_EXTENSION: &str = "dat";

static FIELD_SEPARATORS: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"[-._\s]+").unwrap());

/// An ancillary file belongs to a series when its file name contains the
/// series' truncated UID anywhere. An empty UID matches nothing.
pub fn uid_matches(unique_id: &str, filename: &str) -> bool {
    !unique_id.is_empty() && filename.contains(unique_id)
}

/// A series folder present on disk, i.e. `<session>/<series_id>/DICOM/`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SeriesDirectory {
    pub series_id: String,
    pub dicom_file_count: usize,
    pub filesystem_path: PathBuf,
}

impl SeriesDirectory {
    pub fn dicom_dir(&self) -> PathBuf {
        self.filesystem_path.join(DICOM_SUBDIR)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AncillaryFile {
    pub path: PathBuf,
    pub embedded_identifier: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Remediation {
    None,
    DropOneDicom,
    SkipConversion,
}

/// Count discrepancy that could not be corrected automatically. Logged and
/// reported, never fatal.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ReconciliationAnomaly {
    #[error("{ancillary} ancillary files for {dicom} DICOM files")]
    CountMismatch { dicom: usize, ancillary: usize },

    #[error("expected exactly one DICOM file with instance number {index}, found {candidates}")]
    TrailingInstanceUnresolved { index: usize, candidates: usize },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SeriesAssignment {
    pub series_id: String,
    pub series_path: PathBuf,
    pub unique_id: Option<String>,
    pub assigned_ancillary_files: Vec<PathBuf>,
    pub dicom_count: usize,
    pub ancillary_count: usize,
    pub mismatch: bool,
    pub remediation: Remediation,
    pub removed_dicom: Option<PathBuf>,
    pub anomaly: Option<ReconciliationAnomaly>,
}

impl SeriesAssignment {
    pub fn should_convert(&self) -> bool {
        self.remediation != Remediation::SkipConversion
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ReconciliationReport {
    pub assignments: Vec<SeriesAssignment>,
    /// Pool files that matched no downloaded series. They stay where they are.
    pub unmatched: Vec<PathBuf>,
    /// Manifest scans with no local series folder.
    pub not_downloaded: Vec<String>,
}

impl ReconciliationReport {
    pub fn assignment(&self, series_id: &str) -> Option<&SeriesAssignment> {
        self.assignments
            .iter()
            .find(|assignment| assignment.series_id == series_id)
    }
}

#[derive(Debug, Clone)]
pub struct ReconcileOptions {
    pub skip_short_runs: bool,
    pub ancillary_extension: String,
}

impl Default for ReconcileOptions {
    fn default() -> Self {
        Self {
            skip_short_runs: false,
            ancillary_extension: DEFAULT_ANCILLARY_EXTENSION.to_string(),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct Reconciler {
    options: ReconcileOptions,
}

impl Reconciler {
    pub fn new(options: ReconcileOptions) -> Self {
        Self { options }
    }

    /// Pairs the ancillary files in `pool_dir` with the downloaded series of
    /// `session_dir` and decides, per series, whether it can be converted.
    ///
    /// Matched files are moved into `<series>/DICOM/`. Files already sitting
    /// there from an earlier run are counted as well, so running this twice
    /// over the same tree gives the same result.
    pub fn reconcile(
        &self,
        records: &[AcquisitionRecord],
        session_dir: &Path,
        pool_dir: Option<&Path>,
    ) -> Result<ReconciliationReport, DlError> {
        let ext = self.options.ancillary_extension.as_str();
        let series: HashMap<String, SeriesDirectory> = scan_series_directories(session_dir)?
            .into_iter()
            .map(|dir| (dir.series_id.clone(), dir))
            .collect();

        let (catalog, not_downloaded): (Vec<_>, Vec<_>) = records
            .iter()
            .partition(|record| series.contains_key(&record.id));
        let not_downloaded: Vec<String> = not_downloaded
            .into_iter()
            .map(|record| record.id.clone())
            .collect();
        if !not_downloaded.is_empty() {
            debug!(series = ?not_downloaded, "manifest scans without a local series folder");
        }

        let dicom_dirs: HashSet<PathBuf> = series.values().map(|dir| dir.dicom_dir()).collect();
        let pool = match pool_dir {
            Some(dir) if dir.is_dir() => fs_util::find_exts(dir, ext)?
                .into_iter()
                .filter(|path| {
                    path.parent()
                        .map(|parent| !dicom_dirs.contains(parent))
                        .unwrap_or(true)
                })
                .collect(),
            Some(dir) => {
                warn!(pool = %dir.display(), "ancillary pool directory does not exist");
                Vec::new()
            }
            None => Vec::new(),
        };

        let (mut matched, unmatched) = match_ancillary_files(&catalog, &pool);
        for path in &unmatched {
            debug!(file = %path.display(), "ancillary file matches no downloaded series");
        }

        let mut assignments = Vec::with_capacity(catalog.len());
        for record in catalog {
            let Some(dir) = series.get(&record.id) else {
                continue;
            };
            let dicom_dir = dir.dicom_dir();
            let moved = matched.remove(&record.id).unwrap_or_default();
            for file in &moved {
                fs_util::move_into(&file.path, &dicom_dir)?;
            }

            let ancillary = fs_util::list_exts(&dicom_dir, ext)?;
            if moved.is_empty() && !ancillary.is_empty() {
                info!(
                    series = %record.id,
                    count = ancillary.len(),
                    "using ancillary files already present in the series folder"
                );
            }
            let dicoms = fs_util::list_exts(&dicom_dir, DICOM_EXTENSION)?;
            assignments.push(self.decide(record, dir, dicoms, ancillary)?);
        }

        Ok(ReconciliationReport {
            assignments,
            unmatched,
            not_downloaded,
        })
    }

    fn decide(
        &self,
        record: &AcquisitionRecord,
        dir: &SeriesDirectory,
        dicoms: Vec<PathBuf>,
        ancillary: Vec<PathBuf>,
    ) -> Result<SeriesAssignment, DlError> {
        let dicom_count = dicoms.len();
        let ancillary_count = ancillary.len();
        let mut assignment = SeriesAssignment {
            series_id: record.id.clone(),
            series_path: dir.filesystem_path.clone(),
            unique_id: record.unique_id.clone(),
            assigned_ancillary_files: ancillary,
            dicom_count,
            ancillary_count,
            mismatch: false,
            remediation: Remediation::None,
            removed_dicom: None,
            anomaly: None,
        };

        if ancillary_count == 0 || ancillary_count == dicom_count {
            return Ok(assignment);
        }

        assignment.mismatch = true;
        warn!(
            series = %record.id,
            uid = record.unique_id.as_deref().unwrap_or_default(),
            dats = ancillary_count,
            dcms = dicom_count,
            "number of .dat and .dcm files mismatched; the run may have ended early"
        );

        if self.options.skip_short_runs {
            warn!(series = %record.id, "skipping conversion of mismatched series");
            assignment.remediation = Remediation::SkipConversion;
            assignment.anomaly = Some(ReconciliationAnomaly::CountMismatch {
                dicom: dicom_count,
                ancillary: ancillary_count,
            });
            return Ok(assignment);
        }

        if dicom_count == ancillary_count + 1 && dicom_count > 1 {
            let candidates = locate_trailing_instance(&dicoms, dicom_count);
            if let [extra] = candidates.as_slice() {
                fs::remove_file(extra).map_err(|err| {
                    DlError::Filesystem(format!("remove {}: {err}", extra.display()))
                })?;
                warn!(
                    series = %record.id,
                    file = %extra.display(),
                    "removed trailing DICOM instance captured after the ancillary stream ended"
                );
                assignment.dicom_count = dicom_count - 1;
                assignment.mismatch = false;
                assignment.remediation = Remediation::DropOneDicom;
                assignment.removed_dicom = Some(extra.clone());
                return Ok(assignment);
            }
            let anomaly = ReconciliationAnomaly::TrailingInstanceUnresolved {
                index: dicom_count,
                candidates: candidates.len(),
            };
            warn!(series = %record.id, %anomaly, "converting anyway");
            assignment.anomaly = Some(anomaly);
            return Ok(assignment);
        }

        let anomaly = ReconciliationAnomaly::CountMismatch {
            dicom: dicom_count,
            ancillary: ancillary_count,
        };
        warn!(series = %record.id, %anomaly, "converting anyway");
        assignment.anomaly = Some(anomaly);
        Ok(assignment)
    }
}

/// Lists `<session_dir>/<series>/` folders that contain a `DICOM` folder.
/// A missing session directory has no series.
pub fn scan_series_directories(session_dir: &Path) -> Result<Vec<SeriesDirectory>, DlError> {
    if !session_dir.is_dir() {
        return Ok(Vec::new());
    }
    let entries = fs::read_dir(session_dir)
        .map_err(|err| DlError::Filesystem(format!("read {}: {err}", session_dir.display())))?;
    let mut out = Vec::new();
    for entry in entries {
        let path = entry
            .map_err(|err| DlError::Filesystem(err.to_string()))?
            .path();
        let dicom_dir = path.join(DICOM_SUBDIR);
        if !dicom_dir.is_dir() {
            continue;
        }
        out.push(SeriesDirectory {
            series_id: fs_util::file_name_lossy(&path),
            dicom_file_count: fs_util::list_exts(&dicom_dir, DICOM_EXTENSION)?.len(),
            filesystem_path: path,
        });
    }
    out.sort_by(|a, b| series_order(&a.series_id, &b.series_id));
    Ok(out)
}

/// Assigns each pool file to the record whose UID its name contains. When
/// several UIDs are contained, the longest wins, then manifest order. Records
/// without a UID match nothing. Returns the matches per series id and the
/// files that matched nothing.
pub fn match_ancillary_files(
    records: &[&AcquisitionRecord],
    pool: &[PathBuf],
) -> (BTreeMap<String, Vec<AncillaryFile>>, Vec<PathBuf>) {
    let mut matched: BTreeMap<String, Vec<AncillaryFile>> = BTreeMap::new();
    let mut unmatched = Vec::new();
    for path in pool {
        let name = fs_util::file_name_lossy(path);
        let mut best: Option<(&AcquisitionRecord, &str)> = None;
        for &record in records {
            let Some(unique_id) = record.unique_id.as_deref() else {
                continue;
            };
            let longer = best.is_none_or(|(_, current)| unique_id.len() > current.len());
            if uid_matches(unique_id, &name) && longer {
                best = Some((record, unique_id));
            }
        }
        match best {
            Some((record, unique_id)) => matched
                .entry(record.id.clone())
                .or_default()
                .push(AncillaryFile {
                    path: path.clone(),
                    embedded_identifier: unique_id.to_string(),
                }),
            None => unmatched.push(path.clone()),
        }
    }
    (matched, unmatched)
}

/// Finds the DICOM files whose instance-number field equals `index`.
///
/// File names are split into fields on `-`, `.`, `_` and whitespace. Only
/// purely numeric fields whose value differs between the files of the series
/// are treated as instance numbers; constant fields (UID parts, series
/// number, dates) are ignored. Leading zeros are not significant.
pub fn locate_trailing_instance(dicoms: &[PathBuf], index: usize) -> Vec<PathBuf> {
    let target = index.to_string();
    let fields: Vec<Vec<Option<String>>> = dicoms
        .iter()
        .map(|path| numeric_fields(&fs_util::file_name_lossy(path)))
        .collect();
    let width = fields.iter().map(Vec::len).max().unwrap_or(0);

    let varying: Vec<usize> = (0..width)
        .filter(|&pos| {
            let mut values = fields
                .iter()
                .filter_map(|row| row.get(pos).cloned().flatten());
            match values.next() {
                Some(first) => dicoms.len() == 1 || values.any(|value| value != first),
                None => false,
            }
        })
        .collect();

    dicoms
        .iter()
        .zip(&fields)
        .filter(|(_, row)| {
            varying
                .iter()
                .any(|&pos| row.get(pos).and_then(|value| value.as_deref()) == Some(target.as_str()))
        })
        .map(|(path, _)| path.clone())
        .collect()
}

fn numeric_fields(file_name: &str) -> Vec<Option<String>> {
    let stem = file_name
        .rsplit_once('.')
        .map(|(stem, _)| stem)
        .unwrap_or(file_name);
    FIELD_SEPARATORS
        .split(stem)
        .map(|field| {
            (!field.is_empty() && field.chars().all(|ch| ch.is_ascii_digit())).then(|| {
                let trimmed = field.trim_start_matches('0');
                if trimmed.is_empty() {
                    "0".to_string()
                } else {
                    trimmed.to_string()
                }
            })
        })
        .collect()
}

/// Numeric series ids sort numerically, anything else lexically after them.
fn series_order(a: &str, b: &str) -> std::cmp::Ordering {
    match (a.parse::<u64>(), b.parse::<u64>()) {
        (Ok(x), Ok(y)) => x.cmp(&y),
        (Ok(_), Err(_)) => std::cmp::Ordering::Less,
        (Err(_), Ok(_)) => std::cmp::Ordering::Greater,
        (Err(_), Err(_)) => a.cmp(b),
    }
}
