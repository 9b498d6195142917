use askama::Template;
use nvst_sdk::{DeviceRecord, UNKNOWN};

use super::Report;

#[derive(Template)]
#[template(path = "report.md", escape = "none")]
struct MarkdownReport {
    summary: SummaryView,
    devices: Vec<DeviceView>,
    include_peak: bool,
    generated_at: String,
}

#[derive(Template)]
#[template(path = "report.html")]
struct HtmlReport {
    summary: SummaryView,
    devices: Vec<DeviceView>,
    include_peak: bool,
    generated_at: String,
}

pub fn render_markdown(report: &Report) -> askama::Result<String> {
    MarkdownReport {
        summary: SummaryView::new(report),
        devices: build_device_views(&report.devices),
        include_peak: report.metadata.include_peak,
        generated_at: report.metadata.generated_at_local(),
    }
    .render()
}

pub fn render_html(report: &Report) -> askama::Result<String> {
    HtmlReport {
        summary: SummaryView::new(report),
        devices: build_device_views(&report.devices),
        include_peak: report.metadata.include_peak,
        generated_at: report.metadata.generated_at_local(),
    }
    .render()
}

/// Per-drive status badge. Derived from [`DeviceRecord::passed`] only.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusBadge {
    Passed,
    Check,
}

impl StatusBadge {
    pub fn class(&self) -> &'static str {
        match self {
            StatusBadge::Passed => "status-passed",
            StatusBadge::Check => "status-failed",
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            StatusBadge::Passed => "PASSED ✓",
            StatusBadge::Check => "CHECK",
        }
    }
}

pub fn status_badge(record: &DeviceRecord) -> StatusBadge {
    if record.passed() {
        StatusBadge::Passed
    } else {
        StatusBadge::Check
    }
}

const MODEL_DISPLAY_LIMIT: usize = 30;

#[derive(Debug)]
struct SummaryView {
    total: usize,
    passed: usize,
    link_label: String,
    link_speed: String,
    test_label: String,
    duration_label: String,
    avg_peak_read: String,
    avg_peak_write: String,
}

impl SummaryView {
    fn new(report: &Report) -> Self {
        let summary = &report.summary;
        Self {
            total: summary.total,
            passed: summary.passed,
            link_label: summary.link.label(),
            link_speed: summary.link.speed.clone(),
            test_label: report.metadata.test_label.clone(),
            duration_label: report.metadata.duration_label.clone(),
            avg_peak_read: summary.peak_read.display(),
            avg_peak_write: summary.peak_write.display(),
        }
    }
}

#[derive(Debug)]
struct DeviceView {
    name: String,
    status_class: &'static str,
    status_label: &'static str,
    model: String,
    model_display: String,
    specs: Vec<KeyValue>,
    peak: Vec<Metric>,
    workload: Vec<Metric>,
    temperatures: Vec<KeyValue>,
}

#[derive(Debug)]
struct KeyValue {
    key: String,
    value: String,
}

#[derive(Debug)]
struct Metric {
    label: String,
    value: String,
    subtext: Option<String>,
}

impl DeviceView {
    fn new(record: &DeviceRecord) -> Self {
        let badge = status_badge(record);

        let specs = vec![
            kv("Serial Number", &record.serial),
            kv("Capacity", &record.capacity),
            kv("Firmware", &record.firmware),
            kv("NVMe Version", &record.nvme_version),
            kv("Health Status", &record.health_status),
            kv("Percentage Used", with_unit(&record.percentage_used, "%")),
            kv("Error Count", record.errors.to_string()),
        ];

        let peak = vec![
            metric(
                "Peak Read Speed",
                peak_display(record.peak_read),
                Some("Sequential Read"),
            ),
            metric(
                "Peak Write Speed",
                peak_display(record.peak_write),
                Some("Sequential Write"),
            ),
        ];

        let workload = vec![
            metric("Read Bandwidth", record.read_bw.clone(), Some("Mixed Random/Seq")),
            metric("Read IOPS", record.read_iops.clone(), None),
            metric("Write Bandwidth", record.write_bw.clone(), Some("Mixed Random/Seq")),
            metric("Write IOPS", record.write_iops.clone(), None),
            metric(
                "Checkpoint Write",
                record.checkpoint_write_bw.clone(),
                Some("Large Sequential"),
            ),
            metric("Checkpoint IOPS", record.checkpoint_write_iops.clone(), None),
            metric("Data Read", record.data_read.clone(), None),
            metric("Data Written", record.data_written.clone(), None),
        ];

        let mut temperatures = vec![
            kv("Before Test", with_unit(&record.temp_before, "°C")),
            kv("After Test", with_unit(&record.temp_after, "°C")),
        ];
        temperatures.extend(
            record
                .sensors_after
                .iter()
                .map(|sensor| kv(&sensor.label, with_unit(&sensor.celsius, "°C"))),
        );

        Self {
            name: record.name.to_uppercase(),
            status_class: badge.class(),
            status_label: badge.label(),
            model: record.model.clone(),
            model_display: shorten(&record.model, MODEL_DISPLAY_LIMIT),
            specs,
            peak,
            workload,
            temperatures,
        }
    }
}

/// Cards sorted by device name; ties keep input order.
fn build_device_views(records: &[DeviceRecord]) -> Vec<DeviceView> {
    let mut sorted: Vec<&DeviceRecord> = records.iter().collect();
    sorted.sort_by(|a, b| a.name.cmp(&b.name));
    sorted.into_iter().map(DeviceView::new).collect()
}

fn kv<K: Into<String>, V: Into<String>>(key: K, value: V) -> KeyValue {
    KeyValue {
        key: key.into(),
        value: value.into(),
    }
}

fn metric<L: Into<String>>(label: L, value: String, subtext: Option<&str>) -> Metric {
    Metric {
        label: label.into(),
        value,
        subtext: subtext.map(ToOwned::to_owned),
    }
}

fn peak_display(value: Option<nvst_sdk::Bandwidth>) -> String {
    value
        .map(|bw| bw.to_string())
        .unwrap_or_else(|| "N/A".to_string())
}

fn with_unit(value: &str, unit: &str) -> String {
    if value == UNKNOWN {
        value.to_string()
    } else {
        format!("{}{}", value, unit)
    }
}

fn shorten(input: &str, limit: usize) -> String {
    if input.chars().count() > limit {
        let head: String = input.chars().take(limit - 3).collect();
        format!("{}...", head)
    } else {
        input.to_string()
    }
}
