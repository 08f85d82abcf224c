use std::fs;
use std::path::Path;

use camino::{Utf8Path, Utf8PathBuf};

use crate::error::DlError;
use crate::reconcile::DICOM_SUBDIR;

/// On-disk layout of downloaded sessions:
///
/// ```text
/// <dicom_root>/<session>/<series>/DICOM/*.dcm
/// <dicom_root>/<session>_nii/
/// <xml_root>/<session>.xml
/// ```
#[derive(Debug, Clone)]
pub struct Layout {
    dicom_root: Utf8PathBuf,
    xml_root: Utf8PathBuf,
}

impl Layout {
    pub fn new(dicom_root: Utf8PathBuf, xml_root: Option<Utf8PathBuf>) -> Self {
        let xml_root = xml_root.unwrap_or_else(|| dicom_root.clone());
        Self {
            dicom_root,
            xml_root,
        }
    }

    pub fn from_std(dicom_root: &Path, xml_root: Option<&Path>) -> Result<Self, DlError> {
        let dicom_root = utf8(dicom_root)?;
        let xml_root = xml_root.map(utf8).transpose()?;
        Ok(Self::new(dicom_root, xml_root))
    }

    pub fn dicom_root(&self) -> &Utf8Path {
        &self.dicom_root
    }

    pub fn xml_root(&self) -> &Utf8Path {
        &self.xml_root
    }

    pub fn session_dir(&self, session: &str) -> Utf8PathBuf {
        self.dicom_root.join(session)
    }

    pub fn series_dicom_dir(&self, session: &str, series_id: &str) -> Utf8PathBuf {
        self.session_dir(session).join(series_id).join(DICOM_SUBDIR)
    }

    pub fn nifti_dir(&self, session: &str) -> Utf8PathBuf {
        self.dicom_root.join(format!("{session}_nii"))
    }

    pub fn manifest_path(&self, session: &str) -> Utf8PathBuf {
        self.xml_root.join(format!("{session}.xml"))
    }

    pub fn ancillary_archive_path(&self, session: &str, resource: &str) -> Utf8PathBuf {
        self.session_dir(session).join(format!("{resource}.zip"))
    }

    pub fn ancillary_pool_dir(&self, session: &str, resource: &str) -> Utf8PathBuf {
        self.session_dir(session).join(resource)
    }

    pub fn ensure_roots(&self) -> Result<(), DlError> {
        for root in [&self.dicom_root, &self.xml_root] {
            fs::create_dir_all(root.as_std_path())
                .map_err(|err| DlError::Filesystem(format!("create {root}: {err}")))?;
        }
        Ok(())
    }

    pub fn write_bytes_atomic(path: &Utf8Path, content: &[u8]) -> Result<(), DlError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent.as_std_path())
                .map_err(|err| DlError::Filesystem(err.to_string()))?;
        }
        let tmp_path = path.with_extension("tmp");
        fs::write(tmp_path.as_std_path(), content)
            .map_err(|err| DlError::Filesystem(err.to_string()))?;
        fs::rename(tmp_path.as_std_path(), path.as_std_path())
            .map_err(|err| DlError::Filesystem(err.to_string()))?;
        Ok(())
    }
}

fn utf8(path: &Path) -> Result<Utf8PathBuf, DlError> {
    Utf8PathBuf::from_path_buf(path.to_path_buf())
        .map_err(|_| DlError::Filesystem(format!("non-utf8 path: {}", path.display())))
}
