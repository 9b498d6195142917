use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context as _, Result};
use nvst_sdk::{
    Bandwidth, DeviceSource, ExtractedFields, Extractor, ExtractorMetadata, FieldRule, RuleSet,
    Scope, group, register_extractor,
};
use once_cell::sync::Lazy;
use serde::Deserialize;
use tracing::{debug, info, warn};

/// fio job name of the large sequential write phase.
pub const CHECKPOINT_JOB: &str = "ai_model_checkpoint";

struct FioExtractor;

impl Extractor for FioExtractor {
    fn metadata(&self) -> ExtractorMetadata {
        ExtractorMetadata {
            id: "fio",
            title: "fio workload summary",
            description: "Mixed workload and checkpoint bandwidth/IOPS from fio text output",
        }
    }

    fn extract(&self, source: &DeviceSource<'_>, fields: &mut ExtractedFields) -> Result<()> {
        let matched = RULES.apply(source, fields);
        debug!(device = source.name, matched = matched.len(), "fio fields extracted");
        Ok(())
    }
}

struct PeakExtractor;

impl Extractor for PeakExtractor {
    fn metadata(&self) -> ExtractorMetadata {
        ExtractorMetadata {
            id: "fio-peak",
            title: "Peak sequential bandwidth",
            description: "First-job bandwidth from <device>_read.json / <device>_write.json",
        }
    }

    fn extract(&self, source: &DeviceSource<'_>, fields: &mut ExtractedFields) -> Result<()> {
        let Some(dir) = source.artifact_dir else {
            return Ok(());
        };
        merge_peak_artifacts(dir, source.name, fields);
        Ok(())
    }
}

fn create_fio_extractor() -> Box<dyn Extractor> {
    Box::new(FioExtractor)
}

fn create_peak_extractor() -> Box<dyn Extractor> {
    Box::new(PeakExtractor)
}

register_extractor!(create_fio_extractor);
register_extractor!(create_peak_extractor);

const FIO_RULES: &[FieldRule] = &[
    FieldRule {
        name: "read_bw",
        scope: Scope::Whole,
        pattern: r"(?s)Run status group 0.*?READ:\s+bw=(\d+)MiB/s",
        assign: |f, caps| f.read_bw = group(caps, 1).map(|bw| format!("{bw} MiB/s")),
    },
    FieldRule {
        name: "write_bw",
        scope: Scope::Whole,
        pattern: r"(?s)Run status group 0.*?WRITE:\s+bw=(\d+)MiB/s",
        assign: |f, caps| f.write_bw = group(caps, 1).map(|bw| format!("{bw} MiB/s")),
    },
    FieldRule {
        name: "read_iops",
        scope: Scope::Whole,
        pattern: r"read: IOPS=([\d.]+[kM]?),",
        assign: |f, caps| f.read_iops = group(caps, 1),
    },
    FieldRule {
        name: "write_iops",
        scope: Scope::Whole,
        pattern: r"write: IOPS=([\d.]+[kM]?),",
        assign: |f, caps| f.write_iops = group(caps, 1),
    },
    FieldRule {
        name: "checkpoint_write_bw",
        scope: Scope::Whole,
        pattern: r"(?s)Run status group 1.*?WRITE:\s+bw=(\d+)MiB/s",
        assign: |f, caps| f.checkpoint_write_bw = group(caps, 1).map(|bw| format!("{bw} MiB/s")),
    },
    FieldRule {
        name: "checkpoint_write_iops",
        scope: Scope::Whole,
        pattern: r"(?s)ai_model_checkpoint.*?write: IOPS=([\d.]+[kM]?)",
        assign: |f, caps| f.checkpoint_write_iops = group(caps, 1),
    },
];

static RULES: Lazy<RuleSet> =
    Lazy::new(|| RuleSet::compile(FIO_RULES).expect("fio rule patterns must compile"));

pub fn extract_fio(source: &DeviceSource<'_>, fields: &mut ExtractedFields) {
    RULES.apply(source, fields);
}

pub fn rule_names() -> impl Iterator<Item = &'static str> {
    RULES.names()
}

/// Transfer direction of a peak sequential run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Read,
    Write,
}

impl Direction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::Read => "read",
            Direction::Write => "write",
        }
    }
}

/// `<dir>/<device>_<direction>.json`
pub fn artifact_path(dir: &Path, device: &str, direction: Direction) -> PathBuf {
    dir.join(format!("{}_{}.json", device, direction.as_str()))
}

#[derive(Debug, Deserialize)]
struct FioReport {
    #[serde(default)]
    jobs: Vec<FioJob>,
}

#[derive(Debug, Deserialize)]
struct FioJob {
    read: Option<FioDirection>,
    write: Option<FioDirection>,
}

#[derive(Debug, Deserialize)]
struct FioDirection {
    bw: Option<f64>,
}

/// Bandwidth of the first job for `direction`; zero or absent values yield `None`.
pub fn parse_peak_json(content: &str, direction: Direction) -> Result<Option<Bandwidth>> {
    let report: FioReport =
        serde_json::from_str(content).context("failed to parse fio JSON output")?;

    let Some(job) = report.jobs.first() else {
        return Ok(None);
    };

    let stats = match direction {
        Direction::Read => job.read.as_ref(),
        Direction::Write => job.write.as_ref(),
    };

    Ok(stats
        .and_then(|s| s.bw)
        .and_then(Bandwidth::from_kib_per_sec))
}

fn read_peak_artifact(path: &Path, direction: Direction) -> Result<Option<Bandwidth>> {
    let content = fs::read_to_string(path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    parse_peak_json(&content, direction)
        .with_context(|| format!("failed to parse {}", path.display()))
}

/// Merges both peak artifacts for `device` when present. Failures leave the field unset.
pub fn merge_peak_artifacts(dir: &Path, device: &str, fields: &mut ExtractedFields) {
    for direction in [Direction::Read, Direction::Write] {
        let path = artifact_path(dir, device, direction);
        if !path.exists() {
            continue;
        }

        let peak = match read_peak_artifact(&path, direction) {
            Ok(peak) => peak,
            Err(err) => {
                warn!(device, path = %path.display(), "skipping peak artifact: {err:#}");
                None
            }
        };

        if let Some(bw) = peak {
            info!(device, direction = direction.as_str(), %bw, "peak bandwidth merged");
        }

        match direction {
            Direction::Read => fields.peak_read = peak,
            Direction::Write => fields.peak_write = peak,
        }
    }
}
