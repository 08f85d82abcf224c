use std::io::{self, BufRead, Write};
use std::path::{Path, PathBuf};
use std::process::ExitCode;

use clap::{ArgGroup, Parser};
use miette::IntoDiagnostic;
use tracing::info;

use cnda_dl::config::ConfigLoader;
use cnda_dl::convert::SystemConverter;
use cnda_dl::domain::SessionQuery;
use cnda_dl::error::DlError;
use cnda_dl::layout::Layout;
use cnda_dl::logging;
use cnda_dl::output::{self, JsonOutput};
use cnda_dl::progress::{ConsoleProgress, ProgressSink};
use cnda_dl::reconcile::ReconcileOptions;
use cnda_dl::session::{AncillarySource, Coordinator, SessionOptions, TransferMode};
use cnda_dl::xnat::XnatHttpClient;

#[derive(Parser)]
#[command(name = "cnda-dl")]
#[command(about = "Download MRI sessions from CNDA/XNAT and convert NORDIC series to NIFTI")]
#[command(version, author)]
#[command(group(ArgGroup::new("mode").args(["ancillary_only", "dicom_only", "xml_only"])))]
struct Cli {
    /// Subject labels (or experiment IDs with -e) to download.
    #[arg(required = true)]
    sessions: Vec<String>,

    #[arg(short = 'd', long)]
    dicom_dir: PathBuf,

    /// Where session manifests are written (defaults to the DICOM directory).
    #[arg(short = 'x', long)]
    xml_dir: Option<PathBuf>,

    /// Treat the positional arguments as experiment IDs.
    #[arg(short = 'e', long)]
    experiment_id: bool,

    #[arg(short = 'p', long)]
    project_id: Option<String>,

    /// Start downloading from this scan ID (single session only).
    #[arg(short = 's', long)]
    scan_number: Option<String>,

    #[arg(long)]
    skip_unusable: bool,

    /// Leave series with mismatched DICOM/.dat counts unconverted.
    #[arg(long)]
    skip_short_runs: bool,

    #[arg(long)]
    ancillary_only: bool,

    #[arg(long)]
    dicom_only: bool,

    #[arg(long)]
    xml_only: bool,

    /// Use a local directory of ancillary files instead of the remote resource.
    #[arg(long)]
    prestaged_dir: Option<PathBuf>,

    #[arg(long)]
    log_dir: Option<PathBuf>,

    #[arg(long)]
    config: Option<String>,

    #[arg(long)]
    non_interactive: bool,

    #[arg(long)]
    json: bool,
}

fn main() -> ExitCode {
    if let Err(report) = run() {
        eprintln!("{report:?}");
        if let Some(error) = report.downcast_ref::<DlError>() {
            return ExitCode::from(map_exit_code(error));
        }
        return ExitCode::from(1);
    }
    ExitCode::SUCCESS
}

fn map_exit_code(error: &DlError) -> u8 {
    match error {
        DlError::AmbiguousOrMissingSession { .. } | DlError::ScanNotFound(_) => 2,
        DlError::Transfer(_)
        | DlError::TransferStatus { .. }
        | DlError::MissingTool(_)
        | DlError::ConverterFailure { .. } => 3,
        _ => 1,
    }
}

fn run() -> miette::Result<()> {
    let cli = Cli::parse();
    let config = ConfigLoader::resolve(cli.config.as_deref())?;

    let log_dir = cli.log_dir.clone().or_else(|| config.log_dir.clone());
    let _log_guard = logging::init_logging(log_dir.as_deref())?;

    if cli.scan_number.is_some() && cli.sessions.len() > 1 {
        return Err(DlError::InvalidArguments(
            "--scan-number can only be used with a single session".to_string(),
        )
        .into());
    }
    let queries = cli
        .sessions
        .iter()
        .map(|session| SessionQuery::new(session, cli.experiment_id, cli.project_id.clone()))
        .collect::<Result<Vec<_>, DlError>>()?;

    let interactive = !cli.non_interactive;
    for dir in std::iter::once(&cli.dicom_dir).chain(cli.xml_dir.iter()) {
        if !ensure_dir(dir, interactive)? {
            return Ok(());
        }
    }
    let layout = Layout::from_std(&cli.dicom_dir, cli.xml_dir.as_deref())?;
    layout.ensure_roots()?;

    let catalog = XnatHttpClient::new(config.require_server_url()?)?;
    let converter =
        SystemConverter::with_program(&config.converter.program, config.converter.flags.clone());
    info!(server = catalog.base_url(), "using XNAT server");

    let options = SessionOptions {
        mode: transfer_mode(&cli),
        skip_unusable: cli.skip_unusable,
        scan_start: cli.scan_number.clone(),
        ancillary: match &cli.prestaged_dir {
            Some(dir) => AncillarySource::Prestaged(dir.clone()),
            None => AncillarySource::Remote {
                resource: config.ancillary_resource.clone(),
            },
        },
        reconcile: ReconcileOptions {
            skip_short_runs: cli.skip_short_runs,
            ancillary_extension: config.ancillary_extension.clone(),
        },
    };

    let coordinator = Coordinator::new(layout, catalog, converter);
    let console = ConsoleProgress::new();
    let sink: &dyn ProgressSink = if cli.json { &JsonOutput } else { &console };
    let mut batch = coordinator.run_batch(&queries, &options, sink);

    if cli.json {
        JsonOutput::print_report(&batch).into_diagnostic()?;
    } else {
        output::print_summary(&batch);
    }

    if batch.errors.is_empty() {
        return Ok(());
    }
    let (_, error) = batch.errors.remove(0);
    Err(error.into())
}

fn transfer_mode(cli: &Cli) -> TransferMode {
    if cli.ancillary_only {
        TransferMode::AncillaryOnly
    } else if cli.dicom_only {
        TransferMode::DicomOnly
    } else if cli.xml_only {
        TransferMode::XmlOnly
    } else {
        TransferMode::All
    }
}

/// Returns `false` when the user declines to create a missing directory.
fn ensure_dir(dir: &Path, interactive: bool) -> miette::Result<bool> {
    if dir.is_dir() {
        return Ok(true);
    }
    if interactive && !confirm(&format!("{} does not exist. Create it? (y/n) ", dir.display()))? {
        return Ok(false);
    }
    std::fs::create_dir_all(dir)
        .map_err(|err| DlError::Filesystem(format!("create {}: {err}", dir.display())))?;
    Ok(true)
}

fn confirm(prompt: &str) -> miette::Result<bool> {
    let stdin = io::stdin();
    loop {
        print!("{prompt}");
        io::stdout().flush().into_diagnostic()?;
        let mut answer = String::new();
        if stdin.lock().read_line(&mut answer).into_diagnostic()? == 0 {
            return Ok(false);
        }
        match answer.trim().to_ascii_lowercase().as_str() {
            "y" | "yes" => return Ok(true),
            "n" | "no" => return Ok(false),
            _ => println!("Please answer y or n."),
        }
    }
}
