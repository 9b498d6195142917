use anyhow::Result;
use nvst_sdk::{
    DeviceSource, ExtractedFields, Extractor, ExtractorMetadata, FieldRule, RuleSet, Scope,
    SensorReading, group, register_extractor,
};
use once_cell::sync::Lazy;
use regex::Regex;
use tracing::debug;

struct SmartExtractor;

impl Extractor for SmartExtractor {
    fn metadata(&self) -> ExtractorMetadata {
        ExtractorMetadata {
            id: "smart",
            title: "SMART telemetry",
            description: "Identity, health and thermal fields from smartctl output",
        }
    }

    fn extract(&self, source: &DeviceSource<'_>, fields: &mut ExtractedFields) -> Result<()> {
        extract_smart(source, fields);
        Ok(())
    }
}

fn create_extractor() -> Box<dyn Extractor> {
    Box::new(SmartExtractor)
}

register_extractor!(create_extractor);

const SMART_RULES: &[FieldRule] = &[
    FieldRule {
        name: "model",
        scope: Scope::Whole,
        pattern: r"Model Number:\s+(.+)",
        assign: |f, caps| f.model = group(caps, 1),
    },
    FieldRule {
        name: "serial",
        scope: Scope::Whole,
        pattern: r"Serial Number:\s+(.+)",
        assign: |f, caps| f.serial = group(caps, 1),
    },
    FieldRule {
        name: "firmware",
        scope: Scope::Whole,
        pattern: r"Firmware Version:\s+(.+)",
        assign: |f, caps| f.firmware = group(caps, 1),
    },
    FieldRule {
        name: "capacity",
        scope: Scope::Whole,
        pattern: r"Total NVM Capacity:\s+[\d,]+\s+\[(.+?)\]",
        assign: |f, caps| f.capacity = group(caps, 1),
    },
    FieldRule {
        name: "nvme_version",
        scope: Scope::Whole,
        pattern: r"NVMe Version:\s+(.+)",
        assign: |f, caps| f.nvme_version = group(caps, 1),
    },
    FieldRule {
        name: "health_status",
        scope: Scope::Whole,
        pattern: r"SMART overall-health self-assessment test result:\s+(.+)",
        assign: |f, caps| f.health_status = group(caps, 1),
    },
    FieldRule {
        name: "temp_before",
        scope: Scope::Whole,
        pattern: r"Temperature:\s+(\d+)\s+Celsius",
        assign: |f, caps| f.temp_before = group(caps, 1),
    },
    FieldRule {
        name: "percentage_used",
        scope: Scope::Whole,
        pattern: r"Percentage Used:\s+(.+?)%",
        assign: |f, caps| f.percentage_used = group(caps, 1),
    },
    FieldRule {
        name: "errors",
        scope: Scope::Whole,
        pattern: r"Error Information Log Entries:\s+(\d+)",
        assign: |f, caps| f.errors = group(caps, 1).and_then(|v| v.parse().ok()),
    },
    FieldRule {
        name: "temp_after",
        scope: Scope::AfterTest,
        pattern: r"Temperature:\s+(\d+)\s+Celsius",
        assign: |f, caps| f.temp_after = group(caps, 1),
    },
    FieldRule {
        name: "data_read",
        scope: Scope::AfterTest,
        pattern: r"Data Units Read:\s+[\d,]+\s+\[(.+?)\]",
        assign: |f, caps| f.data_read = group(caps, 1),
    },
    FieldRule {
        name: "data_written",
        scope: Scope::AfterTest,
        pattern: r"Data Units Written:\s+[\d,]+\s+\[(.+?)\]",
        assign: |f, caps| f.data_written = group(caps, 1),
    },
];

static RULES: Lazy<RuleSet> =
    Lazy::new(|| RuleSet::compile(SMART_RULES).expect("SMART rule patterns must compile"));

static SENSOR_PATTERN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"Temperature Sensor (\d+):\s+(\d+)\s+Celsius")
        .expect("sensor pattern must compile")
});

/// Applies every SMART rule and collects the post-test sensor list.
pub fn extract_smart(source: &DeviceSource<'_>, fields: &mut ExtractedFields) {
    let matched = RULES.apply(source, fields);
    fields.sensors_after = source.after_test().map(collect_sensors).unwrap_or_default();
    debug!(
        device = source.name,
        matched = matched.len(),
        sensors = fields.sensors_after.len(),
        "smart fields extracted"
    );
}

pub fn rule_names() -> impl Iterator<Item = &'static str> {
    RULES.names()
}

fn collect_sensors(section: &str) -> Vec<SensorReading> {
    SENSOR_PATTERN
        .captures_iter(section)
        .map(|caps| SensorReading {
            label: format!("Sensor {}", &caps[1]),
            celsius: caps[2].to_string(),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    const SMART_DUMP: &str = "\
=== START OF INFORMATION SECTION ===
Model Number:                       Samsung SSD 990 PRO 4TB
Serial Number:                      S7DPNU0X123456
Firmware Version:                   4B2QJXD7
Total NVM Capacity:                 4,000,787,030,016 [4.00 TB]
NVMe Version:                       2.0

=== START OF SMART DATA SECTION ===
SMART overall-health self-assessment test result: PASSED
Temperature:                        40 Celsius
Percentage Used:                    1%
Data Units Read:                    1,000 [512 MB]
Data Units Written:                 2,000 [1.02 GB]
Error Information Log Entries:      0
Temperature Sensor 1:               40 Celsius
Temperature Sensor 2:               44 Celsius

==== SMART data after test ====
SMART overall-health self-assessment test result: PASSED
Temperature:                        55 Celsius
Percentage Used:                    1%
Data Units Read:                    9,876,543 [5.05 TB]
Data Units Written:                 12,345,678 [6.32 TB]
Error Information Log Entries:      0
Temperature Sensor 1:               55 Celsius
Temperature Sensor 2:               61 Celsius
";

    fn extract(text: &str) -> ExtractedFields {
        let mut fields = ExtractedFields::default();
        extract_smart(&DeviceSource::new("nvme0", text), &mut fields);
        fields
    }

    #[test]
    fn identity_fields_are_trimmed() {
        let fields = extract(SMART_DUMP);
        assert_eq!(fields.model.as_deref(), Some("Samsung SSD 990 PRO 4TB"));
        assert_eq!(fields.serial.as_deref(), Some("S7DPNU0X123456"));
        assert_eq!(fields.firmware.as_deref(), Some("4B2QJXD7"));
        assert_eq!(fields.capacity.as_deref(), Some("4.00 TB"));
        assert_eq!(fields.nvme_version.as_deref(), Some("2.0"));
    }

    #[test]
    fn health_and_wear_come_from_first_block() {
        let fields = extract(SMART_DUMP);
        assert_eq!(fields.health_status.as_deref(), Some("PASSED"));
        assert_eq!(fields.percentage_used.as_deref(), Some("1"));
        assert_eq!(fields.errors, Some(0));
    }

    #[test]
    fn temperatures_respect_after_test_marker() {
        let fields = extract(SMART_DUMP);
        assert_eq!(fields.temp_before.as_deref(), Some("40"));
        assert_eq!(fields.temp_after.as_deref(), Some("55"));
    }

    #[test]
    fn data_units_read_from_post_test_block() {
        let fields = extract(SMART_DUMP);
        assert_eq!(fields.data_read.as_deref(), Some("5.05 TB"));
        assert_eq!(fields.data_written.as_deref(), Some("6.32 TB"));
    }

    #[test]
    fn sensors_only_from_post_test_block_in_order() {
        let fields = extract(SMART_DUMP);
        assert_eq!(
            fields.sensors_after,
            vec![
                SensorReading {
                    label: "Sensor 1".into(),
                    celsius: "55".into()
                },
                SensorReading {
                    label: "Sensor 2".into(),
                    celsius: "61".into()
                },
            ]
        );
    }

    #[test]
    fn last_marker_is_authoritative() {
        let text = "Temperature: 40 Celsius\nafter test\nTemperature: 50 Celsius\nafter test\nTemperature: 57 Celsius\n";
        let fields = extract(text);
        assert_eq!(fields.temp_before.as_deref(), Some("40"));
        assert_eq!(fields.temp_after.as_deref(), Some("57"));
    }

    #[test]
    fn missing_marker_leaves_post_test_fields_unset() {
        let fields = extract("Temperature: 40 Celsius\nData Units Read: 1 [512 kB]\n");
        assert_eq!(fields.temp_before.as_deref(), Some("40"));
        assert_eq!(fields.temp_after, None);
        assert_eq!(fields.data_read, None);
        assert!(fields.sensors_after.is_empty());
    }

    #[test]
    fn error_count_parses_nonzero() {
        let fields = extract("Error Information Log Entries:      17\n");
        assert_eq!(fields.errors, Some(17));
    }

    #[test]
    fn empty_input_matches_nothing() {
        assert_eq!(extract(""), ExtractedFields::default());
    }

    #[test]
    fn rule_table_names_are_unique() {
        let mut names: Vec<_> = rule_names().collect();
        let total = names.len();
        names.sort_unstable();
        names.dedup();
        assert_eq!(names.len(), total);
    }
}
