use std::io::{self, Write};
use std::time::Duration;

use serde::Serialize;

use crate::catalog::CatalogReport;
use crate::mirror::MirrorSummary;
use crate::object_store::ObjectDownload;
use crate::pipeline::{ProgressEvent, ProgressSink, RunSummary};

#[derive(Debug, Clone, Copy)]
pub enum OutputMode {
    Text,
    Json,
}

pub struct JsonOutput;

impl JsonOutput {
    pub fn print_sync(result: &RunSummary) -> io::Result<()> {
        Self::print_json(result)
    }

    pub fn print_mirror(result: &MirrorSummary) -> io::Result<()> {
        Self::print_json(result)
    }

    pub fn print_catalog(result: &CatalogReport) -> io::Result<()> {
        Self::print_json(result)
    }

    pub fn print_download(result: &ObjectDownload) -> io::Result<()> {
        Self::print_json(result)
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

/// Prints progress lines to stderr, keeping stdout for results.
pub struct StderrProgress;

impl ProgressSink for StderrProgress {
    fn event(&self, event: ProgressEvent) {
        match event.elapsed {
            Some(elapsed) => eprintln!("{} ({})", event.message, format_elapsed(elapsed)),
            None => eprintln!("  {}", event.message),
        }
    }
}

pub fn format_elapsed(elapsed: Duration) -> String {
    let secs = elapsed.as_secs();
    if secs >= 3600 {
        format!("{}h{:02}m", secs / 3600, (secs % 3600) / 60)
    } else if secs >= 60 {
        format!("{}m{:02}s", secs / 60, secs % 60)
    } else {
        format!("{:.1}s", elapsed.as_secs_f64())
    }
}
