use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::DlError;

/// Length of the `.0.0.0` suffix XNAT appends to scan UIDs. Ancillary
/// filenames embed the UID without it.
pub const UID_SUFFIX_LEN: usize = 6;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScanQuality {
    Usable,
    Unusable,
    Unknown,
}

impl ScanQuality {
    /// Maps a manifest `<quality>` label. Anything other than `usable` or
    /// `unusable` (including `questionable` and missing labels) is unknown.
    pub fn from_label(label: Option<&str>) -> Self {
        match label.map(|value| value.trim().to_ascii_lowercase()) {
            Some(value) if value == "usable" => ScanQuality::Usable,
            Some(value) if value == "unusable" => ScanQuality::Unusable,
            _ => ScanQuality::Unknown,
        }
    }
}

impl fmt::Display for ScanQuality {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ScanQuality::Usable => write!(f, "usable"),
            ScanQuality::Unusable => write!(f, "unusable"),
            ScanQuality::Unknown => write!(f, "unknown"),
        }
    }
}

/// One scan declared in a session manifest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AcquisitionRecord {
    pub id: String,
    /// Scan UID with the fixed trailing suffix removed. Scans without a UID
    /// (secondary captures, reports) cannot carry ancillary files.
    pub unique_id: Option<String>,
    pub quality: ScanQuality,
    pub kind: String,
    pub description: Option<String>,
    /// Labels of the scan-level resources (`DICOM`, `SNAPSHOTS`, ...).
    pub resources: Vec<String>,
}

/// Drops the trailing [`UID_SUFFIX_LEN`] characters of a scan UID.
pub fn truncate_uid(uid: &str) -> Result<String, DlError> {
    let len = uid.chars().count();
    if len < UID_SUFFIX_LEN {
        return Err(DlError::ManifestFormat(format!(
            "scan UID {uid:?} is shorter than its {UID_SUFFIX_LEN}-character suffix"
        )));
    }
    Ok(uid.chars().take(len - UID_SUFFIX_LEN).collect())
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SessionQuery {
    pub label_or_id: String,
    pub is_experiment_id: bool,
    pub project_id: Option<String>,
}

impl SessionQuery {
    pub fn new(
        label_or_id: impl Into<String>,
        is_experiment_id: bool,
        project_id: Option<String>,
    ) -> Result<Self, DlError> {
        let label_or_id = label_or_id.into().trim().to_string();
        if label_or_id.is_empty() {
            return Err(DlError::InvalidArguments(
                "session identifier must not be empty".to_string(),
            ));
        }
        if !is_experiment_id && project_id.is_none() {
            return Err(DlError::InvalidArguments(
                "--project-id is required when querying by subject label".to_string(),
            ));
        }
        Ok(Self {
            label_or_id,
            is_experiment_id,
            project_id,
        })
    }
}

impl fmt::Display for SessionQuery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = if self.is_experiment_id {
            "experiment"
        } else {
            "subject"
        };
        match &self.project_id {
            Some(project) => write!(f, "{kind} {} in project {project}", self.label_or_id),
            None => write!(f, "{kind} {}", self.label_or_id),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescriptor {
    pub project: String,
    pub subject_id: String,
    pub experiment_id: String,
    pub label: Option<String>,
}
