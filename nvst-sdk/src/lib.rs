use anyhow::Result;
use serde::Serialize;
use std::fmt;
use std::path::{Path, PathBuf};

mod rules;

pub use rules::{FieldRule, RuleSet, Scope, group};

/// Placeholder for any field that was never extracted.
pub const UNKNOWN: &str = "Unknown";

/// Literal separating the pre-test and post-test SMART dumps in a device log.
pub const AFTER_TEST_MARKER: &str = "after test";

/// File name of the rendered HTML report inside the log directory.
pub const REPORT_FILE_NAME: &str = "nvme_stress_test_report.html";

/// Report generation context; can be extended with environment parameters.
#[derive(Debug, Clone)]
pub struct ReportContext {
    log_dir: PathBuf,
    log_prefix: String,
    output: Option<PathBuf>,
    include_peak: bool,
    sysfs_root: PathBuf,
    test_label: String,
    duration_label: String,
}

impl Default for ReportContext {
    fn default() -> Self {
        Self {
            log_dir: PathBuf::from("."),
            log_prefix: "nvme".to_string(),
            output: None,
            include_peak: false,
            sysfs_root: PathBuf::from("/sys"),
            test_label: "AI Workload".to_string(),
            duration_label: "10 min".to_string(),
        }
    }
}

impl ReportContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_log_dir<P: Into<PathBuf>>(mut self, dir: P) -> Self {
        self.log_dir = dir.into();
        self
    }

    pub fn with_log_prefix<S: Into<String>>(mut self, prefix: S) -> Self {
        self.log_prefix = prefix.into();
        self
    }

    pub fn with_output<P: Into<PathBuf>>(mut self, output: Option<P>) -> Self {
        self.output = output.map(Into::into);
        self
    }

    pub fn with_peak(mut self, include_peak: bool) -> Self {
        self.include_peak = include_peak;
        self
    }

    pub fn with_sysfs_root<P: Into<PathBuf>>(mut self, root: P) -> Self {
        self.sysfs_root = root.into();
        self
    }

    pub fn with_labels<T: Into<String>, D: Into<String>>(mut self, test: T, duration: D) -> Self {
        self.test_label = test.into();
        self.duration_label = duration.into();
        self
    }

    pub fn log_dir(&self) -> &Path {
        &self.log_dir
    }

    pub fn log_prefix(&self) -> &str {
        &self.log_prefix
    }

    /// Explicit output path, or the default report file inside the log directory.
    pub fn output_path(&self) -> PathBuf {
        self.output
            .clone()
            .unwrap_or_else(|| self.log_dir.join(REPORT_FILE_NAME))
    }

    pub fn include_peak(&self) -> bool {
        self.include_peak
    }

    pub fn sysfs_root(&self) -> &Path {
        &self.sysfs_root
    }

    pub fn test_label(&self) -> &str {
        &self.test_label
    }

    pub fn duration_label(&self) -> &str {
        &self.duration_label
    }
}

/// Sequential bandwidth kept as a number; formatted only for display.
#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq, PartialOrd, Ord)]
pub struct Bandwidth {
    pub mib_per_sec: u64,
}

impl Bandwidth {
    pub fn from_mib(mib_per_sec: u64) -> Self {
        Self { mib_per_sec }
    }

    /// Converts a KB/s figure to whole MiB/s. Zero and non-finite inputs yield `None`.
    pub fn from_kib_per_sec(kib: f64) -> Option<Self> {
        if !kib.is_finite() || kib <= 0.0 {
            return None;
        }
        let mib = (kib / 1024.0).trunc() as u64;
        if mib == 0 {
            return None;
        }
        Some(Self { mib_per_sec: mib })
    }
}

impl fmt::Display for Bandwidth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} MiB/s", self.mib_per_sec)
    }
}

/// One post-test temperature sensor, in discovery order.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct SensorReading {
    pub label: String,
    pub celsius: String,
}

/// Raw values produced by extractors. `None` means no rule matched.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExtractedFields {
    pub model: Option<String>,
    pub serial: Option<String>,
    pub firmware: Option<String>,
    pub capacity: Option<String>,
    pub nvme_version: Option<String>,
    pub health_status: Option<String>,
    pub errors: Option<u64>,
    pub percentage_used: Option<String>,
    pub temp_before: Option<String>,
    pub temp_after: Option<String>,
    pub sensors_after: Vec<SensorReading>,
    pub data_read: Option<String>,
    pub data_written: Option<String>,
    pub read_bw: Option<String>,
    pub read_iops: Option<String>,
    pub write_bw: Option<String>,
    pub write_iops: Option<String>,
    pub checkpoint_write_bw: Option<String>,
    pub checkpoint_write_iops: Option<String>,
    pub peak_read: Option<Bandwidth>,
    pub peak_write: Option<Bandwidth>,
}

/// Normalized per-drive record; every string field falls back to [`UNKNOWN`].
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct DeviceRecord {
    pub name: String,
    pub model: String,
    pub serial: String,
    pub firmware: String,
    pub capacity: String,
    pub nvme_version: String,
    pub health_status: String,
    pub errors: u64,
    pub percentage_used: String,
    pub temp_before: String,
    pub temp_after: String,
    pub sensors_after: Vec<SensorReading>,
    pub data_read: String,
    pub data_written: String,
    pub read_bw: String,
    pub read_iops: String,
    pub write_bw: String,
    pub write_iops: String,
    pub checkpoint_write_bw: String,
    pub checkpoint_write_iops: String,
    pub peak_read: Option<Bandwidth>,
    pub peak_write: Option<Bandwidth>,
}

impl DeviceRecord {
    /// Record with every field at its default; used when a log cannot be read.
    pub fn empty<S: Into<String>>(name: S) -> Self {
        let unknown = || UNKNOWN.to_string();
        Self {
            name: name.into(),
            model: unknown(),
            serial: unknown(),
            firmware: unknown(),
            capacity: unknown(),
            nvme_version: unknown(),
            health_status: unknown(),
            errors: 0,
            percentage_used: unknown(),
            temp_before: unknown(),
            temp_after: unknown(),
            sensors_after: Vec::new(),
            data_read: unknown(),
            data_written: unknown(),
            read_bw: unknown(),
            read_iops: unknown(),
            write_bw: unknown(),
            write_iops: unknown(),
            checkpoint_write_bw: unknown(),
            checkpoint_write_iops: unknown(),
            peak_read: None,
            peak_write: None,
        }
    }

    /// Pass predicate shared by the summary counters and the status badge.
    pub fn passed(&self) -> bool {
        self.health_status == "PASSED" && self.errors == 0
    }
}

/// Input handed to every extractor for one device.
#[derive(Debug, Clone, Copy)]
pub struct DeviceSource<'a> {
    pub name: &'a str,
    pub text: &'a str,
    /// Directory holding companion artifacts; `None` disables artifact merging.
    pub artifact_dir: Option<&'a Path>,
}

impl<'a> DeviceSource<'a> {
    pub fn new(name: &'a str, text: &'a str) -> Self {
        Self {
            name,
            text,
            artifact_dir: None,
        }
    }

    pub fn with_artifacts(mut self, dir: &'a Path) -> Self {
        self.artifact_dir = Some(dir);
        self
    }

    /// Text following the last `after test` marker, if any.
    pub fn after_test(&self) -> Option<&'a str> {
        self.text
            .rfind(AFTER_TEST_MARKER)
            .map(|idx| &self.text[idx + AFTER_TEST_MARKER.len()..])
    }
}

/// Extractor metadata used for logging.
#[derive(Debug, Clone, Copy)]
pub struct ExtractorMetadata {
    pub id: &'static str,
    pub title: &'static str,
    pub description: &'static str,
}

/// Common interface for field extraction modules.
pub trait Extractor: Send + Sync + 'static {
    fn metadata(&self) -> ExtractorMetadata;
    fn extract(&self, source: &DeviceSource<'_>, fields: &mut ExtractedFields) -> Result<()>;
}

/// Descriptor of a compile-time registry entry.
pub struct ExtractorRegistration {
    pub constructor: fn() -> Box<dyn Extractor>,
}

inventory::collect!(ExtractorRegistration);

pub use inventory;

/// Helper macro to register an extractor inside a module.
#[macro_export]
macro_rules! register_extractor {
    ($ctor:expr) => {
        ::nvst_sdk::inventory::submit! {
            ::nvst_sdk::ExtractorRegistration {
                constructor: $ctor,
            }
        }
    };
}

pub fn iter_registered_extractors() -> impl Iterator<Item = &'static ExtractorRegistration> {
    inventory::iter::<ExtractorRegistration>.into_iter()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn after_test_uses_last_marker() {
        let text = "Temperature: 40 Celsius\nafter test\nTemperature: 50 Celsius\nafter test\nTemperature: 55 Celsius";
        let source = DeviceSource::new("nvme0", text);
        let tail = source.after_test().expect("marker present");
        assert!(tail.contains("55"));
        assert!(!tail.contains("50"));
    }

    #[test]
    fn after_test_absent_without_marker() {
        let source = DeviceSource::new("nvme0", "Temperature: 40 Celsius");
        assert!(source.after_test().is_none());
    }

    #[test]
    fn bandwidth_truncates_and_drops_zero() {
        assert_eq!(
            Bandwidth::from_kib_per_sec(2_048_000.0),
            Some(Bandwidth::from_mib(2000))
        );
        assert_eq!(
            Bandwidth::from_kib_per_sec(2_048_999.0),
            Some(Bandwidth::from_mib(2000))
        );
        assert_eq!(Bandwidth::from_kib_per_sec(0.0), None);
        assert_eq!(Bandwidth::from_kib_per_sec(512.0), None);
        assert_eq!(Bandwidth::from_mib(3712).to_string(), "3712 MiB/s");
    }

    #[test]
    fn empty_record_uses_sentinels() {
        let record = DeviceRecord::empty("nvme3");
        assert_eq!(record.model, UNKNOWN);
        assert_eq!(record.errors, 0);
        assert!(record.sensors_after.is_empty());
        assert!(!record.passed());
    }

    #[test]
    fn passed_requires_zero_errors() {
        let mut record = DeviceRecord::empty("nvme0");
        record.health_status = "PASSED".into();
        assert!(record.passed());
        record.errors = 1;
        assert!(!record.passed());
    }

    #[test]
    fn context_defaults_output_into_log_dir() {
        let ctx = ReportContext::new().with_log_dir("/tmp/logs");
        assert_eq!(
            ctx.output_path(),
            PathBuf::from("/tmp/logs").join(REPORT_FILE_NAME)
        );
        let ctx = ctx.with_output(Some("/tmp/out.html"));
        assert_eq!(ctx.output_path(), PathBuf::from("/tmp/out.html"));
    }
}
