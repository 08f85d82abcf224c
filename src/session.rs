use std::fmt;
use std::fs;
use std::path::PathBuf;

use indicatif::HumanBytes;
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::archive;
use crate::convert::{ConversionOrchestrator, ConversionSummary, Converter};
use crate::domain::{AcquisitionRecord, ScanQuality, SessionDescriptor, SessionQuery};
use crate::error::DlError;
use crate::fs_util;
use crate::layout::Layout;
use crate::manifest::Manifest;
use crate::progress::{ProgressEvent, ProgressSink};
use crate::reconcile::{DICOM_EXTENSION, ReconcileOptions, ReconciliationReport, Reconciler};
use crate::xnat::{PayloadFilter, SessionCatalog};

pub const DICOM_RESOURCE: &str = "DICOM";
pub const DEFAULT_ANCILLARY_RESOURCE: &str = "NORDIC_VOLUMES";

/// Per-session state machine:
/// `query -> manifest_fetch -> payload_fetch -> extract -> reconcile -> convert -> done`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStage {
    Query,
    ManifestFetch,
    PayloadFetch,
    Extract,
    Reconcile,
    Convert,
    Done,
    Failed,
}

impl fmt::Display for SessionStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            SessionStage::Query => "query",
            SessionStage::ManifestFetch => "manifest_fetch",
            SessionStage::PayloadFetch => "payload_fetch",
            SessionStage::Extract => "extract",
            SessionStage::Reconcile => "reconcile",
            SessionStage::Convert => "convert",
            SessionStage::Done => "done",
            SessionStage::Failed => "failed",
        };
        write!(f, "{label}")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TransferMode {
    #[default]
    All,
    AncillaryOnly,
    DicomOnly,
    XmlOnly,
}

impl TransferMode {
    fn fetches_dicom(self) -> bool {
        matches!(self, TransferMode::All | TransferMode::DicomOnly)
    }

    fn fetches_ancillary(self) -> bool {
        matches!(self, TransferMode::All | TransferMode::AncillaryOnly)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AncillarySource {
    Remote { resource: String },
    Prestaged(PathBuf),
}

#[derive(Debug, Clone)]
pub struct SessionOptions {
    pub mode: TransferMode,
    pub skip_unusable: bool,
    pub scan_start: Option<String>,
    pub ancillary: AncillarySource,
    pub reconcile: ReconcileOptions,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            mode: TransferMode::All,
            skip_unusable: false,
            scan_start: None,
            ancillary: AncillarySource::Remote {
                resource: DEFAULT_ANCILLARY_RESOURCE.to_string(),
            },
            reconcile: ReconcileOptions::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SessionReport {
    pub session: String,
    pub experiment_id: Option<String>,
    pub stage: SessionStage,
    pub failed_stage: Option<SessionStage>,
    pub downloaded_series: Vec<String>,
    pub skipped_unusable: Vec<String>,
    pub reconciliation: Option<ReconciliationReport>,
    pub conversion: Option<ConversionSummary>,
    pub error: Option<String>,
    pub started_at: String,
    pub finished_at: Option<String>,
}

impl SessionReport {
    fn new(session: &str) -> Self {
        Self {
            session: session.to_string(),
            experiment_id: None,
            stage: SessionStage::Query,
            failed_stage: None,
            downloaded_series: Vec::new(),
            skipped_unusable: Vec::new(),
            reconciliation: None,
            conversion: None,
            error: None,
            started_at: iso_timestamp(),
            finished_at: None,
        }
    }
}

#[derive(Debug, Error)]
#[error("session {session} failed during {stage}: {error}")]
pub struct SessionFailure {
    pub session: String,
    pub stage: SessionStage,
    #[source]
    pub error: DlError,
    pub report: SessionReport,
}

#[derive(Debug, Default, Serialize)]
pub struct BatchReport {
    pub sessions: Vec<SessionReport>,
    #[serde(skip)]
    pub errors: Vec<(String, DlError)>,
}

impl BatchReport {
    pub fn completed(&self) -> impl Iterator<Item = &SessionReport> {
        self.sessions
            .iter()
            .filter(|report| report.stage == SessionStage::Done)
    }

    pub fn failed(&self) -> impl Iterator<Item = &SessionReport> {
        self.sessions
            .iter()
            .filter(|report| report.stage == SessionStage::Failed)
    }

    pub fn first_error(&self) -> Option<&DlError> {
        self.errors.first().map(|(_, error)| error)
    }
}

/// Drives each session end to end. One session's failure never stops the
/// batch.
pub struct Coordinator<C: SessionCatalog, V: Converter> {
    layout: Layout,
    catalog: C,
    converter: V,
}

impl<C: SessionCatalog, V: Converter> Coordinator<C, V> {
    pub fn new(layout: Layout, catalog: C, converter: V) -> Self {
        Self {
            layout,
            catalog,
            converter,
        }
    }

    pub fn layout(&self) -> &Layout {
        &self.layout
    }

    pub fn catalog(&self) -> &C {
        &self.catalog
    }

    pub fn run_batch(
        &self,
        queries: &[SessionQuery],
        options: &SessionOptions,
        sink: &dyn ProgressSink,
    ) -> BatchReport {
        let mut batch = BatchReport::default();
        for query in queries {
            info!(session = %query.label_or_id, "Starting download of session {}...", query.label_or_id);
            match self.run_session(query, options, sink) {
                Ok(report) => {
                    info!(session = %report.session, "session finished");
                    batch.sessions.push(report);
                }
                Err(failure) => {
                    let SessionFailure {
                        session,
                        error,
                        report,
                        ..
                    } = failure;
                    batch.errors.push((session, error));
                    batch.sessions.push(report);
                }
            }
        }
        batch
    }

    pub fn run_session(
        &self,
        query: &SessionQuery,
        options: &SessionOptions,
        sink: &dyn ProgressSink,
    ) -> Result<SessionReport, SessionFailure> {
        let mut report = SessionReport::new(&query.label_or_id);
        let result = self.drive(query, options, sink, &mut report);
        report.finished_at = Some(iso_timestamp());
        match result {
            Ok(()) => {
                enter(&mut report, SessionStage::Done, sink);
                Ok(report)
            }
            Err(error) => {
                let stage = report.stage;
                error!(
                    session = %report.session,
                    %stage,
                    error = %error,
                    "session abandoned; continuing with the next session"
                );
                report.failed_stage = Some(stage);
                report.stage = SessionStage::Failed;
                report.error = Some(error.to_string());
                Err(SessionFailure {
                    session: report.session.clone(),
                    stage,
                    error,
                    report,
                })
            }
        }
    }

    fn drive(
        &self,
        query: &SessionQuery,
        options: &SessionOptions,
        sink: &dyn ProgressSink,
        report: &mut SessionReport,
    ) -> Result<(), DlError> {
        let session = query.label_or_id.as_str();

        enter(report, SessionStage::Query, sink);
        let descriptor = self.catalog.find_session(query)?;
        info!(
            session,
            project = %descriptor.project,
            subject = %descriptor.subject_id,
            experiment = %descriptor.experiment_id,
            "resolved session"
        );
        report.experiment_id = Some(descriptor.experiment_id.clone());

        enter(report, SessionStage::ManifestFetch, sink);
        info!(session, "Downloading session xml...");
        let xml = self.catalog.fetch_manifest_xml(&descriptor)?;
        let manifest_path = self.layout.manifest_path(session);
        Layout::write_bytes_atomic(&manifest_path, &xml)?;
        debug!(session, path = %manifest_path, "saved session manifest");
        let manifest = Manifest::parse_experiment(&xml, &descriptor.experiment_id)?;
        if options.mode == TransferMode::XmlOnly {
            return Ok(());
        }

        enter(report, SessionStage::PayloadFetch, sink);
        let session_dir = self.layout.session_dir(session);
        fs::create_dir_all(session_dir.as_std_path())
            .map_err(|err| DlError::Filesystem(format!("create {session_dir}: {err}")))?;
        if options.mode.fetches_dicom() {
            let scans = select_scans(&manifest, options, report)?;
            self.download_dicom(&descriptor, session, &scans, sink, report)?;
        }
        if !options.mode.fetches_ancillary() {
            return Ok(());
        }
        let ancillary = self.fetch_ancillary(&descriptor, &manifest, session, &options.ancillary)?;

        enter(report, SessionStage::Extract, sink);
        let pool_dir = match ancillary {
            Some(Ancillary::Archive { archive: zip_path, pool }) => {
                info!(session, "Unzipping {}...", zip_path.display());
                archive::extract_zip(&zip_path, &pool)?;
                fs::remove_file(&zip_path).map_err(|err| DlError::Filesystem(err.to_string()))?;
                archive::recursive_unzip(&pool)?;
                Some(pool)
            }
            Some(Ancillary::Directory(dir)) => {
                if dir.is_dir() {
                    archive::recursive_unzip(&dir)?;
                }
                Some(dir)
            }
            None => None,
        };

        enter(report, SessionStage::Reconcile, sink);
        let reconciler = Reconciler::new(options.reconcile.clone());
        let reconciliation =
            reconciler.reconcile(&manifest.records, session_dir.as_std_path(), pool_dir.as_deref())?;
        if reconciliation.assignments.is_empty() {
            warn!(session, "no downloaded series found under {session_dir}");
        }
        for path in &reconciliation.unmatched {
            debug!(session, file = %path.display(), "left unmatched ancillary file in place");
        }

        enter(report, SessionStage::Convert, sink);
        let nifti_dir = self.layout.nifti_dir(session);
        let summary = ConversionOrchestrator::new(&self.converter).run(
            session,
            &reconciliation.assignments,
            nifti_dir.as_std_path(),
        )?;
        report.reconciliation = Some(reconciliation);
        report.conversion = Some(summary);
        Ok(())
    }

    fn download_dicom(
        &self,
        descriptor: &SessionDescriptor,
        session: &str,
        scans: &[&AcquisitionRecord],
        sink: &dyn ProgressSink,
        report: &mut SessionReport,
    ) -> Result<(), DlError> {
        let session_dir = self.layout.session_dir(session);
        let staging = tempfile::Builder::new()
            .prefix("cnda-dl-scans")
            .tempdir_in(session_dir.as_std_path())
            .map_err(|err| DlError::Filesystem(err.to_string()))?;
        let _transfer = TransferScope::start(sink, session, scans.len());

        for record in scans {
            let scan_id = record.id.as_str();
            sink.event(ProgressEvent::ScanStarted {
                scan_id: scan_id.to_string(),
            });
            info!(session, scan = scan_id, "Downloading scan {scan_id}...");
            let zip_path = staging.path().join(format!("scan-{scan_id}.zip"));
            self.catalog.fetch_payload(
                descriptor,
                &PayloadFilter::ScanResource {
                    scan_id: scan_id.to_string(),
                    resource: DICOM_RESOURCE.to_string(),
                },
                &zip_path,
            )?;

            let unpack_dir = staging.path().join(format!("scan-{scan_id}"));
            archive::extract_zip(&zip_path, &unpack_dir)?;
            fs::remove_file(&zip_path).map_err(|err| DlError::Filesystem(err.to_string()))?;
            archive::recursive_unzip(&unpack_dir)?;

            let dicoms = fs_util::find_exts(&unpack_dir, DICOM_EXTENSION)?;
            let series_dir = self.layout.series_dicom_dir(session, scan_id);
            for dicom in &dicoms {
                fs_util::move_into(dicom, series_dir.as_std_path())?;
            }
            if dicoms.is_empty() {
                warn!(session, scan = scan_id, "scan archive contained no DICOM files");
            } else {
                report.downloaded_series.push(scan_id.to_string());
            }
            sink.event(ProgressEvent::ScanFinished {
                scan_id: scan_id.to_string(),
                files: dicoms.len(),
            });
        }
        Ok(())
    }

    fn fetch_ancillary(
        &self,
        descriptor: &SessionDescriptor,
        manifest: &Manifest,
        session: &str,
        source: &AncillarySource,
    ) -> Result<Option<Ancillary>, DlError> {
        let resource = match source {
            AncillarySource::Prestaged(dir) => {
                info!(session, pool = %dir.display(), "using pre-staged ancillary files");
                return Ok(Some(Ancillary::Directory(dir.clone())));
            }
            AncillarySource::Remote { resource } => resource.as_str(),
        };

        if !manifest.has_session_resource(resource) {
            warn!(session, "no {resource} resource found for this session");
            return Ok(None);
        }
        let files = self.catalog.list_resource_files(descriptor, resource)?;
        if files.is_empty() {
            warn!(session, "{resource} resource has no files");
            return Ok(None);
        }
        let total: u64 = files.iter().filter_map(|file| file.size).sum();
        info!(
            session,
            files = files.len(),
            "Downloading {resource} ({})...",
            HumanBytes(total)
        );
        let archive_path = self.layout.ancillary_archive_path(session, resource);
        self.catalog.fetch_payload(
            descriptor,
            &PayloadFilter::SessionResource {
                resource: resource.to_string(),
            },
            archive_path.as_std_path(),
        )?;
        Ok(Some(Ancillary::Archive {
            archive: archive_path.into_std_path_buf(),
            pool: self
                .layout
                .ancillary_pool_dir(session, resource)
                .into_std_path_buf(),
        }))
    }
}

enum Ancillary {
    Archive { archive: PathBuf, pool: PathBuf },
    Directory(PathBuf),
}

/// Scans to download, in manifest order: optionally starting at `scan_start`,
/// without `unusable` scans when requested, and without scans that have
/// resources but no DICOM resource.
fn select_scans<'m>(
    manifest: &'m Manifest,
    options: &SessionOptions,
    report: &mut SessionReport,
) -> Result<Vec<&'m AcquisitionRecord>, DlError> {
    let start = match &options.scan_start {
        Some(scan_id) => manifest
            .records
            .iter()
            .position(|record| &record.id == scan_id)
            .ok_or_else(|| DlError::ScanNotFound(scan_id.clone()))?,
        None => 0,
    };

    let mut scans = Vec::new();
    for record in &manifest.records[start..] {
        if options.skip_unusable && record.quality == ScanQuality::Unusable {
            info!("Not downloading scan {} (marked unusable)", record.id);
            report.skipped_unusable.push(record.id.clone());
            continue;
        }
        if !record.resources.is_empty() && !record.resources.iter().any(|r| r == DICOM_RESOURCE) {
            debug!(scan = %record.id, "scan has no DICOM resource");
            continue;
        }
        scans.push(record);
    }
    Ok(scans)
}

fn enter(report: &mut SessionReport, stage: SessionStage, sink: &dyn ProgressSink) {
    debug!(session = %report.session, %stage, "entering stage");
    report.stage = stage;
    sink.event(ProgressEvent::Stage {
        session: report.session.clone(),
        stage,
    });
}

/// Emits `TransferFinished` when dropped so the progress display (and its
/// quiet mode) ends on every exit path.
struct TransferScope<'a> {
    sink: &'a dyn ProgressSink,
    session: String,
}

impl<'a> TransferScope<'a> {
    fn start(sink: &'a dyn ProgressSink, session: &str, scans: usize) -> Self {
        sink.event(ProgressEvent::TransferStarted {
            session: session.to_string(),
            scans: scans as u64,
        });
        Self {
            sink,
            session: session.to_string(),
        }
    }
}

impl Drop for TransferScope<'_> {
    fn drop(&mut self) {
        self.sink.event(ProgressEvent::TransferFinished {
            session: std::mem::take(&mut self.session),
        });
    }
}

fn iso_timestamp() -> String {
    chrono::Utc::now().to_rfc3339()
}
