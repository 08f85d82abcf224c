use std::path::PathBuf;

use miette::Diagnostic;
use thiserror::Error;

#[derive(Debug, Error, Diagnostic)]
pub enum DlError {
    #[error("malformed session manifest: {0}")]
    ManifestFormat(String),

    #[error("session lookup for {query} returned {count} results (expected exactly one)")]
    AmbiguousOrMissingSession { query: String, count: usize },

    #[error("XNAT request failed: {0}")]
    Transfer(String),

    #[error("XNAT returned status {status}: {message}")]
    TransferStatus { status: u16, message: String },

    #[error("converter exited with {} for series {series}", exit_description(.code))]
    ConverterFailure { series: String, code: Option<i32> },

    #[error("scan {0} does not exist for this session")]
    ScanNotFound(String),

    #[error("filesystem error: {0}")]
    Filesystem(String),

    #[error("required tool not found: {0}")]
    MissingTool(String),

    #[error("CNDADL_XNAT_URL environment variable not found")]
    #[diagnostic(help(
        "add `export CNDADL_XNAT_URL=\"<url-to-xnat-database>\"` to your ~/.bashrc file"
    ))]
    MissingServerUrl,

    #[error("failed to read config file at {0}")]
    ConfigRead(PathBuf),

    #[error("failed to parse JSON config: {0}")]
    ConfigParse(String),

    #[error("invalid arguments: {0}")]
    InvalidArguments(String),
}

fn exit_description(code: &Option<i32>) -> String {
    match code {
        Some(code) => format!("exit code {code}"),
        None => "no exit code (terminated by signal)".to_string(),
    }
}
