use std::io::{self, Write};
use std::sync::atomic::{AtomicUsize, Ordering};

use serde::Serialize;

use crate::progress::{ProgressEvent, ProgressSink};
use crate::session::{BatchReport, SessionReport, SessionStage};

static QUIET_DEPTH: AtomicUsize = AtomicUsize::new(0);

/// While any guard is alive, console log output is suppressed (the log file
/// keeps receiving everything). Dropping the guard restores output, including
/// on early returns and unwinding.
#[must_use = "quiet mode ends as soon as the guard is dropped"]
pub struct QuietGuard {
    _private: (),
}

impl QuietGuard {
    pub fn acquire() -> Self {
        QUIET_DEPTH.fetch_add(1, Ordering::SeqCst);
        Self { _private: () }
    }
}

impl Drop for QuietGuard {
    fn drop(&mut self) {
        QUIET_DEPTH.fetch_sub(1, Ordering::SeqCst);
    }
}

pub fn console_enabled() -> bool {
    QUIET_DEPTH.load(Ordering::SeqCst) == 0
}

pub struct JsonOutput;

impl JsonOutput {
    pub fn print_report(report: &BatchReport) -> io::Result<()> {
        Self::print_json(report)
    }

    fn print_json<T: Serialize>(value: &T) -> io::Result<()> {
        let json = serde_json::to_string_pretty(value).map_err(io::Error::other)?;
        let mut stdout = io::stdout();
        stdout.write_all(json.as_bytes())?;
        stdout.write_all(b"\n")?;
        Ok(())
    }
}

impl ProgressSink for JsonOutput {
    fn event(&self, _event: ProgressEvent) {}
}

pub fn print_summary(report: &BatchReport) {
    let green = "\x1b[32m";
    let yellow = "\x1b[33m";
    let cyan = "\x1b[36m";
    let red = "\x1b[31m";
    let reset = "\x1b[0m";

    println!("{cyan}cnda-dl summary{reset}");
    println!(
        "{green}sessions completed: {}{reset}",
        report.completed().count()
    );
    let failed = report.failed().count();
    let color = if failed == 0 { green } else { red };
    println!("{color}sessions failed: {failed}{reset}");

    for session in &report.sessions {
        print_session(session, (green, yellow, red, reset));
    }
}

fn print_session(session: &SessionReport, (green, yellow, red, reset): (&str, &str, &str, &str)) {
    if session.stage == SessionStage::Failed {
        println!(
            "{red}x {} failed during {}: {}{reset}",
            session.session,
            session
                .failed_stage
                .map(|stage| stage.to_string())
                .unwrap_or_default(),
            session.error.as_deref().unwrap_or("unknown error")
        );
        return;
    }

    println!(
        "{green}- {} ({} series downloaded){reset}",
        session.session,
        session.downloaded_series.len()
    );
    if !session.skipped_unusable.is_empty() {
        println!(
            "{yellow}   skipped as unusable: {}{reset}",
            session.skipped_unusable.join(", ")
        );
    }
    if let Some(conversion) = &session.conversion {
        println!(
            "{green}   converted: {}{reset}",
            conversion.converted().join(", ")
        );
        for (series, reason) in conversion.unconverted() {
            println!("{yellow}   not converted: {series} ({reason}){reset}");
        }
        for (series, reason) in conversion.errored() {
            println!("{red}   conversion failed: {series} ({reason}){reset}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quiet_guard_restores_console_on_drop() {
        let outer = QuietGuard::acquire();
        assert!(!console_enabled());
        {
            let _inner = QuietGuard::acquire();
            assert!(!console_enabled());
        }
        assert!(!console_enabled());
        drop(outer);
        assert!(console_enabled());
    }
}
