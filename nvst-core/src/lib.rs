use std::path::{Path, PathBuf};

use chrono::{DateTime, Local, Utc};
use nvst_sdk::{DeviceRecord, ReportContext};
use serde::Serialize;
use std::time::{SystemTime, UNIX_EPOCH};
use thiserror::Error;
use tracing::info;

mod discover;
mod normalize;
mod render;
pub mod schema;
mod summary;
mod writer;

pub use discover::{LogFileInfo, discover_logs, list_logs};
pub use normalize::{device_name, extract_record, load_device, normalize};
pub use render::{StatusBadge, status_badge};
pub use summary::{LinkDescriptor, PeakAverage, ReportSummary, pcie_generation, query_link};
pub use writer::write_atomic;

pub use nvst_sdk::ReportContext as Context;

#[derive(Debug, Error)]
pub enum ReportError {
    #[error("no {prefix}*.log files found in {}", .dir.display())]
    NoInput { dir: PathBuf, prefix: String },
    #[error("failed to scan {}", .dir.display())]
    Discover {
        dir: PathBuf,
        #[source]
        source: walkdir::Error,
    },
    #[error("failed to inspect {}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to render report")]
    Render(#[from] askama::Error),
    #[error("failed to write report to {}", .path.display())]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

#[derive(Debug, Serialize)]
pub struct ReportMetadata {
    pub generated_at: String,
    pub devices: usize,
    pub include_peak: bool,
    pub test_label: String,
    pub duration_label: String,
}

impl ReportMetadata {
    pub fn generated_at_utc(&self) -> Option<DateTime<Utc>> {
        let seconds = self.generated_at.parse::<i64>().ok()?;
        DateTime::<Utc>::from_timestamp(seconds, 0)
    }

    pub fn generated_at_iso8601(&self) -> String {
        self.generated_at_utc()
            .map(|dt| dt.to_rfc3339())
            .unwrap_or_else(|| "unknown".to_string())
    }

    /// Footer timestamp in local time.
    pub fn generated_at_local(&self) -> String {
        self.generated_at_utc()
            .map(|dt| {
                dt.with_timezone(&Local)
                    .format("%Y-%m-%d %H:%M:%S")
                    .to_string()
            })
            .unwrap_or_else(|| "unknown".to_string())
    }
}

#[derive(Debug, Serialize)]
pub struct Report {
    pub metadata: ReportMetadata,
    pub devices: Vec<DeviceRecord>,
    pub summary: ReportSummary,
}

impl Report {
    pub fn new(devices: Vec<DeviceRecord>, link: LinkDescriptor, ctx: &ReportContext) -> Self {
        let generated_at = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs().to_string())
            .unwrap_or_else(|_| "0".to_string());

        let summary = ReportSummary::build(&devices, link);

        Self {
            metadata: ReportMetadata {
                generated_at,
                devices: devices.len(),
                include_peak: ctx.include_peak(),
                test_label: ctx.test_label().to_string(),
                duration_label: ctx.duration_label().to_string(),
            },
            devices,
            summary,
        }
    }

    /// Pins the generation timestamp (unix seconds).
    pub fn with_generated_at(mut self, seconds: i64) -> Self {
        self.metadata.generated_at = seconds.to_string();
        self
    }

    pub fn to_json_value(&self) -> serde_json::Value {
        let devices: Vec<serde_json::Value> = self
            .devices
            .iter()
            .map(|device| {
                let mut value = serde_json::json!(device);
                value["passed"] = serde_json::Value::Bool(device.passed());
                value
            })
            .collect();

        let mut summary = serde_json::json!(self.summary);
        summary["link_label"] = serde_json::Value::String(self.summary.link.label());

        serde_json::json!({
            "metadata": {
                "generated_at": self.metadata.generated_at_iso8601(),
                "devices": self.metadata.devices,
                "include_peak": self.metadata.include_peak,
                "test_label": self.metadata.test_label,
                "duration_label": self.metadata.duration_label,
            },
            "summary": summary,
            "devices": devices,
        })
    }

    pub fn to_markdown(&self) -> Result<String, ReportError> {
        render::render_markdown(self).map_err(Into::into)
    }

    pub fn to_html(&self) -> Result<String, ReportError> {
        render::render_html(self).map_err(Into::into)
    }

    /// Renders HTML and atomically replaces `path`.
    pub fn write_html(&self, path: &Path) -> Result<(), ReportError> {
        let html = self.to_html()?;
        write_atomic(path, &html)?;
        info!(path = %path.display(), devices = self.devices.len(), "report written");
        Ok(())
    }
}

/// Batch progress, reported in discovery order.
#[derive(Debug)]
pub enum Progress<'a> {
    Found(usize),
    Parsing(&'a Path),
    Parsed(&'a DeviceRecord),
}

pub fn collect_report(ctx: &ReportContext) -> Result<Report, ReportError> {
    collect_report_with_progress(ctx, |_| {})
}

/// Discovers logs, extracts one record per device and aggregates them.
///
/// Unreadable logs degrade to default records; only an empty log set fails.
pub fn collect_report_with_progress<F>(ctx: &ReportContext, mut progress: F) -> Result<Report, ReportError>
where
    F: FnMut(Progress<'_>),
{
    let logs = discover_logs(ctx.log_dir(), ctx.log_prefix())?;
    if logs.is_empty() {
        return Err(ReportError::NoInput {
            dir: ctx.log_dir().to_path_buf(),
            prefix: ctx.log_prefix().to_string(),
        });
    }
    progress(Progress::Found(logs.len()));

    let mut devices = Vec::with_capacity(logs.len());
    for path in &logs {
        progress(Progress::Parsing(path));
        let record = load_device(path, ctx);
        progress(Progress::Parsed(&record));
        devices.push(record);
    }

    let link = query_link(ctx.sysfs_root());
    Ok(Report::new(devices, link, ctx))
}
