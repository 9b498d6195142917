use std::fs;
use std::process::Command;

use anyhow::{Context as _, Result, anyhow};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, warn};

const PROC_MOUNTS: &str = "/proc/mounts";

#[derive(Debug, Error)]
pub enum DeviceError {
    #[error("failed to read /proc/mounts")]
    Mounts(#[source] std::io::Error),
    #[error("failed to unmount {partition}")]
    Unmount {
        partition: String,
        #[source]
        source: rustix::io::Errno,
    },
}

/// An NVMe namespace block device as reported by `lsblk`.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct NvmeDevice {
    pub name: String,
    pub size: String,
    pub model: String,
    pub path: String,
}

#[derive(Debug, Deserialize)]
struct LsblkOutput {
    #[serde(default)]
    blockdevices: Vec<LsblkDevice>,
}

#[derive(Debug, Deserialize)]
struct LsblkDevice {
    name: Option<String>,
    size: Option<String>,
    model: Option<String>,
}

/// Lists NVMe block devices. Failures are logged and yield an empty list.
pub fn discover_devices() -> Vec<NvmeDevice> {
    match run_lsblk() {
        Ok(devices) => devices,
        Err(err) => {
            warn!("device discovery failed: {err:#}");
            Vec::new()
        }
    }
}

fn run_lsblk() -> Result<Vec<NvmeDevice>> {
    let output = Command::new("lsblk")
        .args(["-d", "-o", "NAME,SIZE,MODEL", "-J"])
        .output()
        .context("failed to execute lsblk")?;

    if !output.status.success() {
        return Err(anyhow!(
            "lsblk exited with status {}",
            output.status.code().unwrap_or_default()
        ));
    }

    let stdout = String::from_utf8(output.stdout).context("lsblk returned invalid UTF-8")?;
    parse_lsblk(&stdout)
}

fn parse_lsblk(content: &str) -> Result<Vec<NvmeDevice>> {
    let parsed: LsblkOutput =
        serde_json::from_str(content).context("failed to parse lsblk JSON")?;

    Ok(parsed
        .blockdevices
        .into_iter()
        .filter_map(|device| {
            let name = device.name?;
            if !name.contains("nvme") {
                return None;
            }
            let known = |value: Option<String>| {
                value
                    .map(|v| v.trim().to_string())
                    .filter(|v| !v.is_empty())
                    .unwrap_or_else(|| "Unknown".to_string())
            };
            Some(NvmeDevice {
                path: format!("/dev/{}", name),
                size: known(device.size),
                model: known(device.model),
                name,
            })
        })
        .collect())
}

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Failed,
    Unknown,
    Error,
}

impl HealthStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            HealthStatus::Healthy => "Healthy",
            HealthStatus::Failed => "Failed",
            HealthStatus::Unknown => "Unknown",
            HealthStatus::Error => "Error",
        }
    }
}

/// Quick verdict from `smartctl -H`.
pub fn health_summary(device_path: &str) -> HealthStatus {
    match Command::new("smartctl").args(["-H", device_path]).output() {
        Ok(output) => {
            let mut combined = String::from_utf8_lossy(&output.stdout).into_owned();
            combined.push_str(&String::from_utf8_lossy(&output.stderr));
            classify_health(&combined)
        }
        Err(err) => {
            warn!(device = device_path, "failed to execute smartctl: {err}");
            HealthStatus::Error
        }
    }
}

fn classify_health(output: &str) -> HealthStatus {
    let lower = output.to_lowercase();
    if lower.contains("overall-health self-assessment test result: passed")
        || lower.contains("health status: ok")
    {
        HealthStatus::Healthy
    } else if lower.contains("overall-health self-assessment test result: failed") {
        HealthStatus::Failed
    } else {
        HealthStatus::Unknown
    }
}

/// Full `smartctl -a` dump; stderr is returned when stdout is empty.
pub fn smart_report(device_path: &str) -> Result<String> {
    let output = Command::new("smartctl")
        .args(["-a", device_path])
        .output()
        .with_context(|| format!("failed to execute smartctl -a {}", device_path))?;

    let stdout = String::from_utf8_lossy(&output.stdout);
    if stdout.trim().is_empty() {
        Ok(String::from_utf8_lossy(&output.stderr).into_owned())
    } else {
        Ok(stdout.into_owned())
    }
}

/// Mount sources in `/proc/mounts` that belong to `device_path`.
pub fn mounted_partitions(device_path: &str) -> Result<Vec<String>, DeviceError> {
    let contents = fs::read_to_string(PROC_MOUNTS).map_err(DeviceError::Mounts)?;
    Ok(partitions_in(&contents, device_path))
}

pub fn is_mounted(device_name: &str) -> bool {
    match mounted_partitions(&format!("/dev/{}", device_name)) {
        Ok(parts) => !parts.is_empty(),
        Err(err) => {
            warn!(device = device_name, "mount check failed: {err}");
            false
        }
    }
}

fn partitions_in(contents: &str, device_path: &str) -> Vec<String> {
    let mut parts = Vec::new();
    for line in contents.lines() {
        let Some(source) = line.split_whitespace().next() else {
            continue;
        };
        if belongs_to(source, device_path) && !parts.iter().any(|p| p == source) {
            parts.push(source.to_string());
        }
    }
    parts
}

/// Unmounts every mounted partition of `device_path`; stops at the first failure.
pub fn unmount_all(device_path: &str) -> Result<Vec<String>, DeviceError> {
    let contents = fs::read_to_string(PROC_MOUNTS).map_err(DeviceError::Mounts)?;
    let targets = mount_targets_in(&contents, device_path);

    let mut unmounted = Vec::new();
    for (partition, target) in targets {
        rustix::mount::unmount(target.as_str(), rustix::mount::UnmountFlags::empty()).map_err(
            |source| DeviceError::Unmount {
                partition: partition.clone(),
                source,
            },
        )?;
        info!(partition = %partition, target = %target, "unmounted");
        unmounted.push(partition);
    }
    Ok(unmounted)
}

/// `(source, mount point)` pairs for `device_path`, in `/proc/mounts` order.
fn mount_targets_in(contents: &str, device_path: &str) -> Vec<(String, String)> {
    contents
        .lines()
        .filter_map(|line| {
            let mut fields = line.split_whitespace();
            let source = fields.next()?;
            let target = fields.next()?;
            belongs_to(source, device_path)
                .then(|| (source.to_string(), unescape_mount_path(target)))
        })
        .collect()
}

/// `source` is the device itself or one of its partitions (`p<N>`, or `<N>`
/// when the device name does not end in a digit).
fn belongs_to(source: &str, device_path: &str) -> bool {
    let Some(rest) = source.strip_prefix(device_path) else {
        return false;
    };
    let all_digits = |s: &str| !s.is_empty() && s.bytes().all(|b| b.is_ascii_digit());

    if rest.is_empty() {
        return true;
    }
    if device_path.ends_with(|c: char| c.is_ascii_digit()) {
        rest.strip_prefix('p').is_some_and(all_digits)
    } else {
        all_digits(rest)
    }
}

/// `/proc/mounts` encodes whitespace in paths as octal escapes.
fn unescape_mount_path(raw: &str) -> String {
    raw.replace("\\040", " ")
        .replace("\\011", "\t")
        .replace("\\012", "\n")
        .replace("\\134", "\\")
}
