use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context as _, Result, anyhow};
use nvst_sdk::{DeviceRecord, UNKNOWN};
use serde::Serialize;
use tracing::{debug, warn};
use walkdir::WalkDir;

/// Host PCIe link as reported by sysfs for the first NVMe controller.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct LinkDescriptor {
    pub generation: String,
    pub width: String,
    pub speed: String,
}

impl LinkDescriptor {
    pub fn unknown() -> Self {
        Self {
            generation: UNKNOWN.to_string(),
            width: UNKNOWN.to_string(),
            speed: UNKNOWN.to_string(),
        }
    }

    pub fn from_raw(speed: &str, width: &str) -> Self {
        Self {
            generation: pcie_generation(speed).to_string(),
            width: width.trim().to_string(),
            speed: speed.trim().to_string(),
        }
    }

    /// `"PCIe 4.0 x4"`, or `"Unknown"` when the query failed.
    pub fn label(&self) -> String {
        if self.generation == UNKNOWN && self.width == UNKNOWN {
            return UNKNOWN.to_string();
        }
        format!("{} x{}", self.generation, self.width)
    }
}

/// Maps a raw `current_link_speed` value to a PCIe generation label.
pub fn pcie_generation(speed: &str) -> &'static str {
    fn contains_any(speed: &str, candidates: &[&str]) -> bool {
        candidates.iter().any(|c| speed.contains(c))
    }

    if contains_any(speed, &["32.0 GT/s", "32 GT/s"]) {
        "PCIe 5.0"
    } else if contains_any(speed, &["16.0 GT/s", "16 GT/s"]) {
        "PCIe 4.0"
    } else if contains_any(speed, &["8.0 GT/s", "8 GT/s"]) {
        "PCIe 3.0"
    } else {
        UNKNOWN
    }
}

/// Queries the link once per report. Never fails; errors yield [`LinkDescriptor::unknown`].
pub fn query_link(sysfs_root: &Path) -> LinkDescriptor {
    match read_link(sysfs_root) {
        Ok(link) => {
            debug!(speed = %link.speed, width = %link.width, "pcie link detected");
            link
        }
        Err(err) => {
            warn!("pcie link query failed: {err:#}");
            LinkDescriptor::unknown()
        }
    }
}

fn read_link(sysfs_root: &Path) -> Result<LinkDescriptor> {
    let class_dir = sysfs_root.join("class").join("nvme");

    let controllers: Vec<PathBuf> = WalkDir::new(&class_dir)
        .min_depth(1)
        .max_depth(1)
        .sort_by_file_name()
        .into_iter()
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.path().join("device"))
        .collect();

    for device in controllers {
        let Ok(speed) = fs::read_to_string(device.join("current_link_speed")) else {
            continue;
        };
        let width = fs::read_to_string(device.join("current_link_width"))
            .with_context(|| format!("failed to read link width under {}", device.display()))?;
        return Ok(LinkDescriptor::from_raw(&speed, &width));
    }

    Err(anyhow!(
        "no NVMe controller with link information under {}",
        class_dir.display()
    ))
}

/// Mean of present peak values; `samples == 0` means no device reported one.
#[derive(Debug, Clone, Copy, Serialize, PartialEq)]
pub struct PeakAverage {
    pub mean_mib_per_sec: f64,
    pub samples: usize,
}

impl PeakAverage {
    fn from_values<I: IntoIterator<Item = u64>>(values: I) -> Self {
        let (sum, samples) = values
            .into_iter()
            .fold((0u64, 0usize), |(sum, n), v| (sum.saturating_add(v), n + 1));
        Self {
            mean_mib_per_sec: sum as f64 / samples.max(1) as f64,
            samples,
        }
    }

    pub fn display(&self) -> String {
        if self.samples == 0 {
            "N/A".to_string()
        } else {
            format!("{:.0} MiB/s", self.mean_mib_per_sec)
        }
    }
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct ReportSummary {
    pub total: usize,
    pub passed: usize,
    pub link: LinkDescriptor,
    pub peak_read: PeakAverage,
    pub peak_write: PeakAverage,
}

impl ReportSummary {
    pub fn build(records: &[DeviceRecord], link: LinkDescriptor) -> Self {
        Self {
            total: records.len(),
            passed: records.iter().filter(|r| r.passed()).count(),
            link,
            peak_read: PeakAverage::from_values(
                records.iter().filter_map(|r| r.peak_read).map(|bw| bw.mib_per_sec),
            ),
            peak_write: PeakAverage::from_values(
                records.iter().filter_map(|r| r.peak_write).map(|bw| bw.mib_per_sec),
            ),
        }
    }
}
