use std::sync::Mutex;
use std::time::Duration;

use indicatif::{ProgressBar, ProgressStyle};

use crate::output::QuietGuard;
use crate::session::SessionStage;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProgressEvent {
    Stage { session: String, stage: SessionStage },
    TransferStarted { session: String, scans: u64 },
    ScanStarted { scan_id: String },
    ScanFinished { scan_id: String, files: usize },
    TransferFinished { session: String },
}

pub trait ProgressSink {
    fn event(&self, event: ProgressEvent);
}

pub struct NullProgress;

impl ProgressSink for NullProgress {
    fn event(&self, _event: ProgressEvent) {}
}

const BAR_TEMPLATE: &str = "[{elapsed_precise}] {prefix:.bold} {bar:40.blue} {pos}/{len} {wide_msg}";
const STEADY_TICK_MS: u64 = 100;

/// Draws one progress bar per DICOM transfer. Console logging is held in
/// quiet mode while the bar is visible.
#[derive(Default)]
pub struct ConsoleProgress {
    active: Mutex<Option<(ProgressBar, QuietGuard)>>,
}

impl ConsoleProgress {
    pub fn new() -> Self {
        Self::default()
    }

    fn new_bar(session: &str, scans: u64) -> ProgressBar {
        let bar = ProgressBar::new(scans);
        if let Ok(style) = ProgressStyle::with_template(BAR_TEMPLATE) {
            bar.set_style(style.progress_chars("█▓▒░  "));
        }
        bar.set_prefix(session.to_string());
        bar.enable_steady_tick(Duration::from_millis(STEADY_TICK_MS));
        bar
    }
}

impl ProgressSink for ConsoleProgress {
    fn event(&self, event: ProgressEvent) {
        let Ok(mut active) = self.active.lock() else {
            return;
        };
        match event {
            ProgressEvent::TransferStarted { session, scans } => {
                let quiet = QuietGuard::acquire();
                *active = Some((Self::new_bar(&session, scans), quiet));
            }
            ProgressEvent::ScanStarted { scan_id } => {
                if let Some((bar, _)) = active.as_ref() {
                    bar.set_message(format!("downloading scan {scan_id}"));
                }
            }
            ProgressEvent::ScanFinished { scan_id, files } => {
                if let Some((bar, _)) = active.as_ref() {
                    bar.println(format!("scan {scan_id}: {files} DICOM files"));
                    bar.inc(1);
                }
            }
            ProgressEvent::TransferFinished { .. } => {
                if let Some((bar, quiet)) = active.take() {
                    bar.finish_and_clear();
                    drop(quiet);
                }
            }
            ProgressEvent::Stage { .. } => {}
        }
    }
}
