use std::io::{self, Write};

use serde::Serialize;

use crate::app::{DownloadResult, ListResult, TourStatus, UsageResult};
use crate::cache::{DownloadProgress, DownloadSink, DownloadStatus};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputMode {
    Human,
    Json,
}

pub struct JsonOutput;

impl JsonOutput {
    pub fn print_download(result: &DownloadResult) -> io::Result<()> {
        Self::print_json(result)
    }

    pub fn print_status(result: &TourStatus) -> io::Result<()> {
        Self::print_json(result)
    }

    pub fn print_list(result: &ListResult) -> io::Result<()> {
        Self::print_json(result)
    }

    pub fn print_usage(result: &UsageResult) -> io::Result<()> {
        Self::print_json(result)
    }

    pub fn print_json<T: Serialize>(value: &T) -> io::Result<()> {
        let json = serde_json::to_string_pretty(value).map_err(io::Error::other)?;
        let mut stdout = io::stdout();
        stdout.write_all(json.as_bytes())?;
        stdout.write_all(b"\n")?;
        Ok(())
    }
}

/// JSON mode keeps stdout clean for the final document.
impl DownloadSink for JsonOutput {
    fn progress(&self, _update: &DownloadProgress) {}
}

/// One line per finished file on stderr.
pub struct StderrProgress;

impl DownloadSink for StderrProgress {
    fn progress(&self, update: &DownloadProgress) {
        eprintln!("{}", progress_line(update));
    }
}

fn progress_line(update: &DownloadProgress) -> String {
    let percent = (update.fraction() * 100.0).round();
    match update.status {
        DownloadStatus::Downloading => format!(
            "[{}/{}] {percent:>3}% {}",
            update.done, update.total, update.label
        ),
        DownloadStatus::Completed => match &update.message {
            Some(message) => format!("{} cached offline ({message})", update.tour_id),
            None => format!("{} cached offline", update.tour_id),
        },
        DownloadStatus::Cancelled => format!("{} download cancelled", update.tour_id),
        DownloadStatus::Error => format!(
            "{} download failed: {}",
            update.tour_id,
            update.message.as_deref().unwrap_or("unknown error")
        ),
    }
}
