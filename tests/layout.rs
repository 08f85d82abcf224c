use camino::Utf8PathBuf;

use cnda_dl::layout::Layout;

#[test]
fn layout_paths() {
    let layout = Layout::new(
        Utf8PathBuf::from("/data/dicom"),
        Some(Utf8PathBuf::from("/data/xml")),
    );

    assert_eq!(layout.session_dir("SUBJ01"), Utf8PathBuf::from("/data/dicom/SUBJ01"));
    assert!(layout.series_dicom_dir("SUBJ01", "12").ends_with("SUBJ01/12/DICOM"));
    assert_eq!(layout.nifti_dir("SUBJ01"), Utf8PathBuf::from("/data/dicom/SUBJ01_nii"));
    assert_eq!(layout.manifest_path("SUBJ01"), Utf8PathBuf::from("/data/xml/SUBJ01.xml"));
    assert_eq!(
        layout.ancillary_archive_path("SUBJ01", "NORDIC_VOLUMES"),
        Utf8PathBuf::from("/data/dicom/SUBJ01/NORDIC_VOLUMES.zip")
    );
    assert_eq!(
        layout.ancillary_pool_dir("SUBJ01", "NORDIC_VOLUMES"),
        Utf8PathBuf::from("/data/dicom/SUBJ01/NORDIC_VOLUMES")
    );
}

#[test]
fn ensure_roots_and_atomic_write() {
    let temp = tempfile::tempdir().unwrap();
    let root = Utf8PathBuf::from_path_buf(temp.path().to_path_buf()).unwrap();
    let layout = Layout::new(root.join("dicom"), Some(root.join("xml")));
    layout.ensure_roots().unwrap();
    assert!(layout.dicom_root().is_dir());
    assert!(layout.xml_root().is_dir());

    let path = layout.manifest_path("SUBJ01");
    Layout::write_bytes_atomic(&path, b"<xml/>").unwrap();
    Layout::write_bytes_atomic(&path, b"<xnat:Subject/>").unwrap();
    assert_eq!(std::fs::read(path.as_std_path()).unwrap(), b"<xnat:Subject/>");
    assert!(!path.with_extension("tmp").exists());
}
