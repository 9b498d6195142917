use std::fs;
use std::path::Path;

use nvst_sdk::{DeviceRecord, DeviceSource, ExtractedFields, ReportContext, UNKNOWN};
use tracing::{debug, warn};

/// Device name used in the report: the log file's stem.
pub fn device_name(path: &Path) -> String {
    path.file_stem()
        .map(|stem| stem.to_string_lossy().into_owned())
        .unwrap_or_else(|| UNKNOWN.to_string())
}

/// Reads and extracts one device log. An unreadable file yields a default record.
pub fn load_device(path: &Path, ctx: &ReportContext) -> DeviceRecord {
    let name = device_name(path);

    let text = match fs::read(path) {
        Ok(bytes) => String::from_utf8_lossy(&bytes).into_owned(),
        Err(err) => {
            warn!(device = %name, path = %path.display(), "failed to read log: {err}");
            return DeviceRecord::empty(name);
        }
    };

    let artifact_dir = if ctx.include_peak() {
        Some(path.parent().unwrap_or(ctx.log_dir()))
    } else {
        None
    };

    extract_record(&name, &text, artifact_dir)
}

/// Runs every registered extractor over `text` and normalizes the result.
///
/// Extraction is pure with respect to `text`; artifacts are only consulted when
/// `artifact_dir` is set. Any extractor failure degrades to a default record.
pub fn extract_record(name: &str, text: &str, artifact_dir: Option<&Path>) -> DeviceRecord {
    let mut source = DeviceSource::new(name, text);
    if let Some(dir) = artifact_dir {
        source = source.with_artifacts(dir);
    }

    let mut fields = ExtractedFields::default();
    for entry in nvst_sdk::iter_registered_extractors() {
        let extractor = (entry.constructor)();
        let metadata = extractor.metadata();

        if let Err(err) = extractor.extract(&source, &mut fields) {
            warn!(device = name, extractor = metadata.id, "extraction failed: {err:#}");
            return DeviceRecord::empty(name);
        }
        debug!(device = name, extractor = metadata.id, "extractor finished");
    }

    normalize(name, fields)
}

/// Assigns extracted values into the fixed record shape.
pub fn normalize(name: &str, fields: ExtractedFields) -> DeviceRecord {
    let or_unknown = |value: Option<String>| value.unwrap_or_else(|| UNKNOWN.to_string());

    DeviceRecord {
        name: name.to_string(),
        model: or_unknown(fields.model),
        serial: or_unknown(fields.serial),
        firmware: or_unknown(fields.firmware),
        capacity: or_unknown(fields.capacity),
        nvme_version: or_unknown(fields.nvme_version),
        health_status: or_unknown(fields.health_status),
        errors: fields.errors.unwrap_or(0),
        percentage_used: or_unknown(fields.percentage_used),
        temp_before: or_unknown(fields.temp_before),
        temp_after: or_unknown(fields.temp_after),
        sensors_after: fields.sensors_after,
        data_read: or_unknown(fields.data_read),
        data_written: or_unknown(fields.data_written),
        read_bw: or_unknown(fields.read_bw),
        read_iops: or_unknown(fields.read_iops),
        write_bw: or_unknown(fields.write_bw),
        write_iops: or_unknown(fields.write_iops),
        checkpoint_write_bw: or_unknown(fields.checkpoint_write_bw),
        checkpoint_write_iops: or_unknown(fields.checkpoint_write_iops),
        peak_read: fields.peak_read,
        peak_write: fields.peak_write,
    }
}
