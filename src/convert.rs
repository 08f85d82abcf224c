use std::collections::BTreeMap;
use std::fs;
use std::io::{BufRead, BufReader, Read};
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::sync::{Arc, Mutex};
use std::thread;

use serde::Serialize;
use tracing::{error, info, warn};

use crate::error::DlError;
use crate::reconcile::{Remediation, SeriesAssignment};

pub const CONVERTER_PROGRAM: &str = "dcmdat2niix";
pub const DEFAULT_CONVERTER_FLAGS: &[&str] = &["-ba", "n", "-z", "o", "-w", "1"];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConverterRun {
    pub exit_code: Option<i32>,
    /// stdout and stderr lines in the order they were read.
    pub output: Vec<String>,
}

impl ConverterRun {
    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }
}

pub trait Converter: Send + Sync {
    fn is_available(&self) -> bool;
    fn convert(
        &self,
        series_id: &str,
        series_dir: &Path,
        output_dir: &Path,
    ) -> Result<ConverterRun, DlError>;
}

/// Runs the converter binary as `<program> <flags...> -o <output> <series>`.
#[derive(Debug, Clone)]
pub struct SystemConverter {
    program: Option<PathBuf>,
    flags: Vec<String>,
}

impl SystemConverter {
    /// Looks up [`CONVERTER_PROGRAM`] on `PATH` with the default flags.
    pub fn new() -> Self {
        Self {
            program: find_in_path(CONVERTER_PROGRAM),
            flags: default_flags(),
        }
    }

    /// Uses `program` (a path, or a name resolved on `PATH`) with `flags`.
    pub fn with_program(program: &str, flags: Vec<String>) -> Self {
        let candidate = PathBuf::from(program);
        let program = if candidate.components().count() > 1 {
            candidate.exists().then_some(candidate)
        } else {
            find_in_path(program)
        };
        Self { program, flags }
    }

    pub fn program(&self) -> Option<&Path> {
        self.program.as_deref()
    }
}

impl Default for SystemConverter {
    fn default() -> Self {
        Self::new()
    }
}

impl Converter for SystemConverter {
    fn is_available(&self) -> bool {
        self.program.is_some()
    }

    fn convert(
        &self,
        series_id: &str,
        series_dir: &Path,
        output_dir: &Path,
    ) -> Result<ConverterRun, DlError> {
        let program = self
            .program
            .as_ref()
            .ok_or_else(|| DlError::MissingTool(CONVERTER_PROGRAM.to_string()))?;
        let mut child = Command::new(program)
            .args(&self.flags)
            .arg("-o")
            .arg(output_dir)
            .arg(series_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|err| {
                DlError::MissingTool(format!("failed to start {}: {err}", program.display()))
            })?;

        // Both pipes are drained while the child runs so neither can fill up.
        let output = Arc::new(Mutex::new(Vec::new()));
        let stderr_reader = child.stderr.take().map(|stderr| {
            let output = Arc::clone(&output);
            let series = series_id.to_string();
            thread::spawn(move || drain_lines(stderr, &series, &output))
        });
        if let Some(stdout) = child.stdout.take() {
            drain_lines(stdout, series_id, &output);
        }
        if let Some(handle) = stderr_reader {
            join_reader(handle, series_id);
        }

        let status = child
            .wait()
            .map_err(|err| DlError::Filesystem(format!("wait for converter: {err}")))?;
        let output = take_output(&output, series_id);
        Ok(ConverterRun {
            exit_code: status.code(),
            output,
        })
    }
}

fn drain_lines<R: Read>(reader: R, series_id: &str, output: &Mutex<Vec<String>>) {
    let mut reader = BufReader::new(reader);
    let mut buf = Vec::new();
    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf) {
            Ok(0) => break,
            Err(err) => {
                warn!(series = %series_id, error = %err, "stopped reading converter output");
                break;
            }
            Ok(_) => {
                let line = String::from_utf8_lossy(&buf).trim_end().to_string();
                info!(target: "converter", series = %series_id, "{line}");
                match output.lock() {
                    Ok(mut lines) => lines.push(line),
                    Err(poisoned) => poisoned.into_inner().push(line),
                }
            }
        }
    }
}

/// Waits for the stderr reader. Returns false when the reader panicked, in
/// which case the captured output is missing its stderr tail.
fn join_reader(handle: thread::JoinHandle<()>, series_id: &str) -> bool {
    if handle.join().is_ok() {
        return true;
    }
    warn!(
        series = %series_id,
        "converter stderr reader panicked; captured output may be incomplete"
    );
    false
}

fn take_output(output: &Mutex<Vec<String>>, series_id: &str) -> Vec<String> {
    match output.lock() {
        Ok(lines) => lines.clone(),
        Err(poisoned) => {
            warn!(
                series = %series_id,
                "converter output buffer was poisoned; keeping the lines captured so far"
            );
            poisoned.into_inner().clone()
        }
    }
}

pub fn default_flags() -> Vec<String> {
    DEFAULT_CONVERTER_FLAGS
        .iter()
        .map(|flag| flag.to_string())
        .collect()
}

pub(crate) fn find_in_path(name: &str) -> Option<PathBuf> {
    let path_var = std::env::var_os("PATH")?;
    for path in std::env::split_paths(&path_var) {
        let exe = path.join(format!("{name}.exe"));
        if exe.is_file() {
            return Some(exe);
        }
        let plain = path.join(name);
        if plain.is_file() {
            return Some(plain);
        }
    }
    None
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", content = "reason", rename_all = "snake_case")]
pub enum SeriesOutcome {
    Success,
    ConverterError(String),
    Unconverted(String),
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ConversionSummary {
    pub converter_available: bool,
    pub output_dir: Option<PathBuf>,
    pub outcomes: BTreeMap<String, SeriesOutcome>,
}

impl ConversionSummary {
    pub fn converted(&self) -> Vec<&str> {
        self.select(|outcome| matches!(outcome, SeriesOutcome::Success))
            .map(|(series, _)| series)
            .collect()
    }

    pub fn unconverted(&self) -> Vec<(&str, &str)> {
        self.select(|outcome| matches!(outcome, SeriesOutcome::Unconverted(_)))
            .collect()
    }

    pub fn errored(&self) -> Vec<(&str, &str)> {
        self.select(|outcome| matches!(outcome, SeriesOutcome::ConverterError(_)))
            .collect()
    }

    fn select(
        &self,
        keep: impl Fn(&SeriesOutcome) -> bool,
    ) -> impl Iterator<Item = (&str, &str)> {
        self.outcomes
            .iter()
            .filter(move |(_, outcome)| keep(outcome))
            .map(|(series, outcome)| {
                let reason = match outcome {
                    SeriesOutcome::Success => "",
                    SeriesOutcome::ConverterError(reason) | SeriesOutcome::Unconverted(reason) => {
                        reason.as_str()
                    }
                };
                (series.as_str(), reason)
            })
    }
}

/// Runs the converter once per reconciled series and classifies each run.
pub struct ConversionOrchestrator<'a, V: Converter> {
    converter: &'a V,
}

impl<'a, V: Converter> ConversionOrchestrator<'a, V> {
    pub fn new(converter: &'a V) -> Self {
        Self { converter }
    }

    pub fn run(
        &self,
        session: &str,
        assignments: &[SeriesAssignment],
        output_dir: &Path,
    ) -> Result<ConversionSummary, DlError> {
        let available = self.converter.is_available();
        let mut summary = ConversionSummary {
            converter_available: available,
            output_dir: available.then(|| output_dir.to_path_buf()),
            outcomes: BTreeMap::new(),
        };

        for assignment in assignments
            .iter()
            .filter(|assignment| assignment.remediation == Remediation::SkipConversion)
        {
            let reason = format!(
                "{} .dat files for {} .dcm files",
                assignment.ancillary_count, assignment.dicom_count
            );
            summary.outcomes.insert(
                assignment.series_id.clone(),
                SeriesOutcome::Unconverted(reason),
            );
        }

        if !available {
            warn!(
                session,
                "{CONVERTER_PROGRAM} not installed or not on PATH; cannot convert series to NIFTI"
            );
            self.report(session, &summary);
            return Ok(summary);
        }

        fs::create_dir_all(output_dir).map_err(|err| {
            DlError::Filesystem(format!("create {}: {err}", output_dir.display()))
        })?;
        info!(session, "NIFTI output will be stored at {}", output_dir.display());

        for assignment in assignments.iter().filter(|assignment| assignment.should_convert()) {
            let series = assignment.series_id.as_str();
            info!(session, series, "running {CONVERTER_PROGRAM}");
            let outcome = match self
                .converter
                .convert(series, &assignment.series_path, output_dir)
            {
                Ok(run) if run.success() => SeriesOutcome::Success,
                Ok(run) => {
                    let failure = DlError::ConverterFailure {
                        series: series.to_string(),
                        code: run.exit_code,
                    };
                    error!(session, series, "{failure}");
                    SeriesOutcome::ConverterError(failure.to_string())
                }
                Err(err) => {
                    error!(session, series, error = %err, "converter could not be run");
                    SeriesOutcome::ConverterError(err.to_string())
                }
            };
            summary.outcomes.insert(series.to_string(), outcome);
        }

        self.report(session, &summary);
        Ok(summary)
    }

    fn report(&self, session: &str, summary: &ConversionSummary) {
        let unconverted = summary.unconverted();
        if !unconverted.is_empty() {
            let listing = describe(&unconverted);
            warn!(
                session,
                "series not converted to NIFTI due to inconsistent number of DICOM and dat files: {listing}"
            );
        }
        let errored = summary.errored();
        if !errored.is_empty() {
            let listing = describe(&errored);
            error!(session, "series whose conversion failed: {listing}");
        }
    }
}

fn describe(entries: &[(&str, &str)]) -> String {
    entries
        .iter()
        .map(|(series, reason)| format!("{series} ({reason})"))
        .collect::<Vec<_>>()
        .join(", ")
}
