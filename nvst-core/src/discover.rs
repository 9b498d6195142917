use std::path::{Path, PathBuf};

use chrono::{DateTime, Local};
use serde::Serialize;
use walkdir::WalkDir;

use crate::ReportError;

/// `<prefix>*.log` files directly inside `dir`, sorted by file name.
pub fn discover_logs(dir: &Path, prefix: &str) -> Result<Vec<PathBuf>, ReportError> {
    let mut logs = Vec::new();

    for entry in WalkDir::new(dir)
        .min_depth(1)
        .max_depth(1)
        .sort_by_file_name()
    {
        let entry = entry.map_err(|source| ReportError::Discover {
            dir: dir.to_path_buf(),
            source,
        })?;

        if !entry.file_type().is_file() {
            continue;
        }

        let name = entry.file_name().to_string_lossy();
        if name.starts_with(prefix) && name.ends_with(".log") {
            logs.push(entry.into_path());
        }
    }

    Ok(logs)
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct LogFileInfo {
    pub name: String,
    pub size_bytes: u64,
    pub modified: String,
}

/// Every `*.log` in `dir`, newest first.
pub fn list_logs(dir: &Path) -> Result<Vec<LogFileInfo>, ReportError> {
    let mut logs = Vec::new();

    for path in discover_logs(dir, "")? {
        let metadata = std::fs::metadata(&path).map_err(|source| ReportError::Io {
            path: path.clone(),
            source,
        })?;
        let modified = metadata
            .modified()
            .map(DateTime::<Local>::from)
            .map_err(|source| ReportError::Io {
                path: path.clone(),
                source,
            })?;

        logs.push((
            modified,
            LogFileInfo {
                name: path
                    .file_name()
                    .map(|n| n.to_string_lossy().into_owned())
                    .unwrap_or_default(),
                size_bytes: metadata.len(),
                modified: modified.format("%Y-%m-%d %H:%M:%S").to_string(),
            },
        ));
    }

    logs.sort_by(|a, b| b.0.cmp(&a.0));
    Ok(logs.into_iter().map(|(_, info)| info).collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn discover_filters_by_prefix_and_extension() {
        let dir = tempfile::tempdir().expect("tempdir");
        for name in ["nvme1.log", "nvme0.log", "nvme0_read.json", "other.log", "nvme2.txt"] {
            fs::write(dir.path().join(name), "").expect("write");
        }
        fs::create_dir(dir.path().join("nvme9.log")).expect("mkdir");

        let logs = discover_logs(dir.path(), "nvme").expect("discover");
        let names: Vec<_> = logs
            .iter()
            .map(|p| p.file_name().unwrap().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, vec!["nvme0.log", "nvme1.log"]);
    }

    #[test]
    fn discover_missing_dir_is_an_error() {
        let dir = tempfile::tempdir().expect("tempdir");
        let missing = dir.path().join("absent");
        assert!(matches!(
            discover_logs(&missing, "nvme"),
            Err(ReportError::Discover { .. })
        ));
    }

    #[test]
    fn list_logs_reports_sizes() {
        let dir = tempfile::tempdir().expect("tempdir");
        fs::write(dir.path().join("a.log"), "12345").expect("write");
        fs::write(dir.path().join("notes.txt"), "x").expect("write");

        let logs = list_logs(dir.path()).expect("list");
        assert_eq!(logs.len(), 1);
        assert_eq!(logs[0].name, "a.log");
        assert_eq!(logs[0].size_bytes, 5);
    }
}
