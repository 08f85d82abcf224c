use std::collections::HashMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use assert_matches::assert_matches;
use zip::write::SimpleFileOptions;

use cnda_dl::convert::{Converter, ConverterRun};
use cnda_dl::domain::{SessionDescriptor, SessionQuery};
use cnda_dl::error::DlError;
use cnda_dl::layout::Layout;
use cnda_dl::progress::{NullProgress, ProgressEvent, ProgressSink};
use cnda_dl::reconcile::Remediation;
use cnda_dl::session::{
    AncillarySource, Coordinator, SessionOptions, SessionStage, TransferMode,
};
use cnda_dl::xnat::{PayloadFilter, RemoteFile, SessionCatalog};

const SUBJECT_XML: &str = include_str!("fixtures/subject.xml");
const UID_7: &str = "1.3.12.2.1107.5.2.43.66044.2023011716292628500000007";

fn zip_bytes(entries: &[(String, Vec<u8>)]) -> Vec<u8> {
    let mut writer = zip::ZipWriter::new(std::io::Cursor::new(Vec::new()));
    let options =
        SimpleFileOptions::default().compression_method(zip::CompressionMethod::Stored);
    for (name, content) in entries {
        writer.start_file(name.as_str(), options).unwrap();
        writer.write_all(content).unwrap();
    }
    writer.finish().unwrap().into_inner()
}

fn scan_zip(scan_id: &str, count: usize) -> Vec<u8> {
    let entries: Vec<(String, Vec<u8>)> = (1..=count)
        .map(|index| {
            (
                format!(
                    "SUBJ01_MR1/scans/{scan_id}/resources/DICOM/files/SUBJ01.MR.{scan_id}.{index:04}.dcm"
                ),
                b"dcm".to_vec(),
            )
        })
        .collect();
    zip_bytes(&entries)
}

fn nordic_zip(uid: &str, count: usize) -> Vec<u8> {
    let mut entries: Vec<(String, Vec<u8>)> = (1..=count)
        .map(|index| {
            (
                format!("SUBJ01_MR1/resources/NORDIC_VOLUMES/files/meas_MID42_{uid}_{index}.dat"),
                b"dat".to_vec(),
            )
        })
        .collect();
    entries.push((
        "SUBJ01_MR1/resources/NORDIC_VOLUMES/files/phantom_1.2.840.1_1.dat".to_string(),
        b"dat".to_vec(),
    ));
    zip_bytes(&entries)
}

struct MockCatalog {
    manifest: String,
    scans: HashMap<String, Vec<u8>>,
    ancillary: Option<Vec<u8>>,
    broken_scan: Option<&'static str>,
    fetched: Mutex<Vec<PayloadFilter>>,
}

impl MockCatalog {
    fn new() -> Self {
        let scans = [("1", 2), ("7", 6), ("8", 6), ("9", 4)]
            .into_iter()
            .map(|(scan, count)| (scan.to_string(), scan_zip(scan, count)))
            .collect();
        Self {
            manifest: SUBJECT_XML.to_string(),
            scans,
            ancillary: Some(nordic_zip(UID_7, 5)),
            broken_scan: None,
            fetched: Mutex::new(Vec::new()),
        }
    }

    fn fetched_scans(&self) -> Vec<String> {
        self.fetched
            .lock()
            .unwrap()
            .iter()
            .filter_map(|filter| match filter {
                PayloadFilter::ScanResource { scan_id, .. } => Some(scan_id.clone()),
                PayloadFilter::SessionResource { .. } => None,
            })
            .collect()
    }
}

impl SessionCatalog for MockCatalog {
    fn find_session(&self, query: &SessionQuery) -> Result<SessionDescriptor, DlError> {
        if query.label_or_id != "SUBJ01" {
            return Err(DlError::AmbiguousOrMissingSession {
                query: query.to_string(),
                count: 0,
            });
        }
        Ok(SessionDescriptor {
            project: "NP1234".to_string(),
            subject_id: "CNDA_S00001".to_string(),
            experiment_id: "CNDA_E00001".to_string(),
            label: Some("SUBJ01_MR1".to_string()),
        })
    }

    fn fetch_manifest_xml(&self, _session: &SessionDescriptor) -> Result<Vec<u8>, DlError> {
        Ok(self.manifest.as_bytes().to_vec())
    }

    fn list_resource_files(
        &self,
        _session: &SessionDescriptor,
        resource: &str,
    ) -> Result<Vec<RemoteFile>, DlError> {
        Ok(self
            .ancillary
            .iter()
            .map(|bytes| RemoteFile {
                name: format!("{resource}.zip"),
                size: Some(bytes.len() as u64),
                uri: format!("/data/experiments/CNDA_E00001/resources/{resource}"),
            })
            .collect())
    }

    fn fetch_payload(
        &self,
        _session: &SessionDescriptor,
        filter: &PayloadFilter,
        destination: &Path,
    ) -> Result<(), DlError> {
        self.fetched.lock().unwrap().push(filter.clone());
        let bytes = match filter {
            PayloadFilter::ScanResource { scan_id, .. } => {
                if self.broken_scan == Some(scan_id.as_str()) {
                    return Err(DlError::Transfer("connection reset".to_string()));
                }
                self.scans.get(scan_id).cloned()
            }
            PayloadFilter::SessionResource { .. } => self.ancillary.clone(),
        };
        let bytes = bytes.ok_or(DlError::TransferStatus {
            status: 404,
            message: "not found".to_string(),
        })?;
        fs::write(destination, bytes).map_err(|err| DlError::Filesystem(err.to_string()))
    }
}

#[derive(Default)]
struct MockConverter {
    calls: Mutex<Vec<String>>,
}

impl Converter for MockConverter {
    fn is_available(&self) -> bool {
        true
    }

    fn convert(
        &self,
        series_id: &str,
        _series_dir: &Path,
        output_dir: &Path,
    ) -> Result<ConverterRun, DlError> {
        assert!(output_dir.is_dir());
        self.calls.lock().unwrap().push(series_id.to_string());
        Ok(ConverterRun {
            exit_code: Some(0),
            output: Vec::new(),
        })
    }
}

#[derive(Default)]
struct RecordingSink {
    events: Mutex<Vec<ProgressEvent>>,
}

impl ProgressSink for RecordingSink {
    fn event(&self, event: ProgressEvent) {
        self.events.lock().unwrap().push(event);
    }
}

fn layout(root: &Path) -> Layout {
    Layout::from_std(&root.join("dicom"), Some(&root.join("xml"))).unwrap()
}

fn subject_query() -> SessionQuery {
    SessionQuery::new("SUBJ01", false, Some("NP1234".to_string())).unwrap()
}

fn dicom_dir(root: &Path, series: &str) -> PathBuf {
    root.join("dicom/SUBJ01").join(series).join("DICOM")
}

fn count_ext(dir: &Path, ext: &str) -> usize {
    fs::read_dir(dir)
        .map(|entries| {
            entries
                .filter_map(Result::ok)
                .filter(|entry| entry.path().extension().and_then(|e| e.to_str()) == Some(ext))
                .count()
        })
        .unwrap_or(0)
}

#[test]
fn full_session_downloads_reconciles_and_converts() {
    let temp = tempfile::tempdir().unwrap();
    let coordinator = Coordinator::new(layout(temp.path()), MockCatalog::new(), MockConverter::default());
    let options = SessionOptions {
        skip_unusable: true,
        ..SessionOptions::default()
    };

    let report = coordinator
        .run_session(&subject_query(), &options, &NullProgress)
        .unwrap();

    assert_eq!(report.stage, SessionStage::Done);
    assert_eq!(report.experiment_id.as_deref(), Some("CNDA_E00001"));
    assert_eq!(report.downloaded_series, ["1", "7", "9"]);
    assert_eq!(report.skipped_unusable, ["8"]);
    assert!(temp.path().join("xml/SUBJ01.xml").is_file());

    assert_eq!(count_ext(&dicom_dir(temp.path(), "1"), "dcm"), 2);
    assert_eq!(count_ext(&dicom_dir(temp.path(), "9"), "dcm"), 4);
    assert_eq!(count_ext(&dicom_dir(temp.path(), "7"), "dcm"), 5);
    assert_eq!(count_ext(&dicom_dir(temp.path(), "7"), "dat"), 5);
    assert!(!temp.path().join("dicom/SUBJ01/8").exists());
    assert!(!temp.path().join("dicom/SUBJ01/NORDIC_VOLUMES.zip").exists());

    let reconciliation = report.reconciliation.as_ref().unwrap();
    let bold = reconciliation.assignment("7").unwrap();
    assert_eq!(bold.remediation, Remediation::DropOneDicom);
    assert!(!bold.mismatch);
    assert_eq!(reconciliation.unmatched.len(), 1);

    let conversion = report.conversion.as_ref().unwrap();
    assert_eq!(conversion.converted(), ["1", "7", "9"]);
    assert!(temp.path().join("dicom/SUBJ01_nii").is_dir());
}

#[test]
fn failed_session_does_not_stop_the_batch() {
    let temp = tempfile::tempdir().unwrap();
    let converter = MockConverter::default();
    let coordinator = Coordinator::new(layout(temp.path()), MockCatalog::new(), converter);
    let queries = vec![
        SessionQuery::new("GHOST", false, Some("NP1234".to_string())).unwrap(),
        subject_query(),
    ];

    let batch = coordinator.run_batch(&queries, &SessionOptions::default(), &NullProgress);

    assert_eq!(batch.sessions.len(), 2);
    assert_eq!(batch.failed().count(), 1);
    assert_eq!(batch.completed().count(), 1);
    let ghost = &batch.sessions[0];
    assert_eq!(ghost.stage, SessionStage::Failed);
    assert_eq!(ghost.failed_stage, Some(SessionStage::Query));
    assert!(ghost.error.as_deref().unwrap().contains("GHOST"));
    assert_matches!(
        batch.first_error(),
        Some(DlError::AmbiguousOrMissingSession { count: 0, .. })
    );
    assert_eq!(batch.sessions[1].downloaded_series, ["1", "7", "8", "9"]);
}

#[test]
fn transfer_failure_ends_progress_and_fails_payload_stage() {
    let temp = tempfile::tempdir().unwrap();
    let catalog = MockCatalog {
        broken_scan: Some("7"),
        ..MockCatalog::new()
    };
    let coordinator = Coordinator::new(layout(temp.path()), catalog, MockConverter::default());
    let sink = RecordingSink::default();

    let failure = coordinator
        .run_session(&subject_query(), &SessionOptions::default(), &sink)
        .unwrap_err();

    assert_eq!(coordinator.catalog().fetched_scans(), ["1", "7"]);

    assert_eq!(failure.stage, SessionStage::PayloadFetch);
    assert_matches!(failure.error, DlError::Transfer(_));
    assert_eq!(failure.report.downloaded_series, ["1"]);
    let events = sink.events.lock().unwrap();
    assert_matches!(events.last(), Some(ProgressEvent::TransferFinished { .. }));
}

#[test]
fn unknown_start_scan_fails_the_session() {
    let temp = tempfile::tempdir().unwrap();
    let coordinator = Coordinator::new(layout(temp.path()), MockCatalog::new(), MockConverter::default());
    let options = SessionOptions {
        scan_start: Some("42".to_string()),
        ..SessionOptions::default()
    };

    let failure = coordinator
        .run_session(&subject_query(), &options, &NullProgress)
        .unwrap_err();
    assert_matches!(failure.error, DlError::ScanNotFound(scan) if scan == "42");
    assert_eq!(failure.report.failed_stage, Some(SessionStage::PayloadFetch));
}

#[test]
fn start_scan_trims_earlier_scans() {
    let temp = tempfile::tempdir().unwrap();
    let coordinator = Coordinator::new(layout(temp.path()), MockCatalog::new(), MockConverter::default());
    let options = SessionOptions {
        scan_start: Some("8".to_string()),
        mode: TransferMode::DicomOnly,
        ..SessionOptions::default()
    };

    let report = coordinator
        .run_session(&subject_query(), &options, &NullProgress)
        .unwrap();
    assert_eq!(report.downloaded_series, ["8", "9"]);
    assert!(report.reconciliation.is_none());
    assert!(report.conversion.is_none());
}

#[test]
fn xml_only_writes_just_the_manifest() {
    let temp = tempfile::tempdir().unwrap();
    let catalog = MockCatalog::new();
    let coordinator = Coordinator::new(layout(temp.path()), catalog, MockConverter::default());
    let options = SessionOptions {
        mode: TransferMode::XmlOnly,
        ..SessionOptions::default()
    };

    let report = coordinator
        .run_session(&subject_query(), &options, &NullProgress)
        .unwrap();
    assert_eq!(report.stage, SessionStage::Done);
    assert!(temp.path().join("xml/SUBJ01.xml").is_file());
    assert!(!temp.path().join("dicom/SUBJ01").exists());
}

#[test]
fn missing_ancillary_resource_still_converts() {
    let temp = tempfile::tempdir().unwrap();
    let catalog = MockCatalog {
        manifest: SUBJECT_XML.replace("NORDIC_VOLUMES", "SNAPSHOTS"),
        ..MockCatalog::new()
    };
    let coordinator = Coordinator::new(layout(temp.path()), catalog, MockConverter::default());

    let report = coordinator
        .run_session(&subject_query(), &SessionOptions::default(), &NullProgress)
        .unwrap();

    let bold = report.reconciliation.as_ref().unwrap().assignment("7").unwrap();
    assert_eq!(bold.ancillary_count, 0);
    assert_eq!(bold.dicom_count, 6);
    assert_eq!(
        report.conversion.as_ref().unwrap().converted(),
        ["1", "7", "8", "9"]
    );
}

#[test]
fn ancillary_only_uses_series_already_on_disk() {
    let temp = tempfile::tempdir().unwrap();
    let series = dicom_dir(temp.path(), "7");
    fs::create_dir_all(&series).unwrap();
    for index in 1..=5 {
        fs::write(series.join(format!("SUBJ01.MR.7.{index:04}.dcm")), b"dcm").unwrap();
    }
    let catalog = MockCatalog::new();
    let coordinator = Coordinator::new(layout(temp.path()), catalog, MockConverter::default());
    let options = SessionOptions {
        mode: TransferMode::AncillaryOnly,
        ..SessionOptions::default()
    };

    let report = coordinator
        .run_session(&subject_query(), &options, &NullProgress)
        .unwrap();

    assert!(report.downloaded_series.is_empty());
    let bold = report.reconciliation.as_ref().unwrap().assignment("7").unwrap();
    assert_eq!(bold.ancillary_count, 5);
    assert!(!bold.mismatch);
    assert_eq!(report.conversion.as_ref().unwrap().converted(), ["7"]);
}

#[test]
fn prestaged_pool_is_used_instead_of_the_remote_resource() {
    let temp = tempfile::tempdir().unwrap();
    let pool = temp.path().join("staged");
    fs::create_dir_all(&pool).unwrap();
    for index in 1..=5 {
        fs::write(pool.join(format!("meas_MID42_{UID_7}_{index}.dat")), b"dat").unwrap();
    }
    let catalog = MockCatalog {
        ancillary: None,
        ..MockCatalog::new()
    };
    let coordinator = Coordinator::new(layout(temp.path()), catalog, MockConverter::default());
    let options = SessionOptions {
        ancillary: AncillarySource::Prestaged(pool.clone()),
        skip_unusable: true,
        ..SessionOptions::default()
    };

    let report = coordinator
        .run_session(&subject_query(), &options, &NullProgress)
        .unwrap();

    let bold = report.reconciliation.as_ref().unwrap().assignment("7").unwrap();
    assert_eq!(bold.remediation, Remediation::DropOneDicom);
    assert_eq!(count_ext(&pool, "dat"), 0);
}
