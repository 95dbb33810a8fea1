//! InfluxDB line protocol output formatter.

use crate::reading::Reading;
use crate::sink::OutputFormatter;
use std::collections::BTreeMap;
use std::fmt;
use std::time::SystemTime;

/// Default measurement name in the line protocol.
pub const DEFAULT_MEASUREMENT_NAME: &str = "blood_pressure";

/// Field values for InfluxDB line protocol
#[derive(Debug, PartialEq)]
pub enum FieldValue {
    Integer(i64),
}

impl fmt::Display for FieldValue {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            FieldValue::Integer(num) => write!(f, "{num}i"),
        }
    }
}

/// Data point in InfluxDB line protocol
#[derive(Debug)]
pub struct DataPoint {
    pub measurement: String,
    pub tag_set: BTreeMap<String, String>,
    pub field_set: BTreeMap<String, FieldValue>,
    pub timestamp: Option<SystemTime>,
}

fn escape(value: &str, special: &[char]) -> String {
    let mut escaped = String::with_capacity(value.len());
    for c in value.chars() {
        if special.contains(&c) {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped
}

/// Escape commas, equals signs and spaces in tag keys and values.
fn escape_tag(value: &str) -> String {
    escape(value, &[',', '=', ' '])
}

/// Measurement names only escape commas and spaces.
fn escape_measurement(value: &str) -> String {
    escape(value, &[',', ' '])
}

fn fmt_tags(data_point: &DataPoint, fmt: &mut fmt::Formatter) -> fmt::Result {
    for (key, value) in data_point.tag_set.iter() {
        write!(fmt, ",{}={}", escape_tag(key), escape_tag(value))?;
    }
    Ok(())
}

fn fmt_fields(data_point: &DataPoint, fmt: &mut fmt::Formatter) -> fmt::Result {
    let mut first = true;
    for (key, value) in data_point.field_set.iter() {
        if first {
            first = false;
        } else {
            write!(fmt, ",")?;
        }
        write!(fmt, "{}={}", key, value)?;
    }
    Ok(())
}

fn fmt_timestamp(data_point: &DataPoint, fmt: &mut fmt::Formatter) -> fmt::Result {
    if let Some(since_epoch) = data_point
        .timestamp
        .and_then(|time| time.duration_since(SystemTime::UNIX_EPOCH).ok())
    {
        write!(fmt, " {}", since_epoch.as_nanos())?;
    }
    Ok(())
}

impl fmt::Display for DataPoint {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        write!(fmt, "{}", escape_measurement(&self.measurement))?;
        fmt_tags(self, fmt)?;
        write!(fmt, " ")?;
        fmt_fields(self, fmt)?;
        fmt_timestamp(self, fmt)
    }
}

/// InfluxDB line protocol formatter.
///
/// One line per reading, tagged with the device identity:
///
/// ```text
/// blood_pressure,manufacturer=Qardio,model=QardioARM diastolic=80i,pulse=72i,systolic=120i 1700000000000000000
/// ```
pub struct InfluxDbFormatter {
    measurement_name: String,
}

impl InfluxDbFormatter {
    pub fn new(measurement_name: String) -> Self {
        Self { measurement_name }
    }

    fn tag_set(reading: &Reading) -> BTreeMap<String, String> {
        let mut tags = BTreeMap::new();
        tags.insert(
            "manufacturer".to_string(),
            reading.identity.manufacturer.clone(),
        );
        tags.insert("model".to_string(), reading.identity.model.clone());
        tags
    }

    fn field_set(reading: &Reading) -> BTreeMap<String, FieldValue> {
        let mut fields = BTreeMap::new();
        fields.insert(
            "systolic".into(),
            FieldValue::Integer(reading.systolic_mmhg.into()),
        );
        fields.insert(
            "diastolic".into(),
            FieldValue::Integer(reading.diastolic_mmhg.into()),
        );
        fields.insert("pulse".into(), FieldValue::Integer(reading.pulse_bpm.into()));
        fields
    }

    fn to_data_point(&self, reading: &Reading) -> DataPoint {
        DataPoint {
            measurement: self.measurement_name.clone(),
            tag_set: Self::tag_set(reading),
            field_set: Self::field_set(reading),
            timestamp: Some(reading.timestamp),
        }
    }
}

impl Default for InfluxDbFormatter {
    fn default() -> Self {
        Self::new(DEFAULT_MEASUREMENT_NAME.to_string())
    }
}

impl OutputFormatter for InfluxDbFormatter {
    fn format(&self, reading: &Reading) -> String {
        self.to_data_point(reading).to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reading::DeviceIdentity;
    use crate::test_utils::reading;
    use std::time::Duration;

    #[test]
    fn test_field_value_display() {
        assert_eq!(FieldValue::Integer(120).to_string(), "120i");
        assert_eq!(FieldValue::Integer(-3).to_string(), "-3i");
    }

    #[test]
    fn test_data_point_format() {
        let mut tags = BTreeMap::new();
        tags.insert("model".to_string(), "QardioARM".to_string());

        let mut fields = BTreeMap::new();
        fields.insert("systolic".to_string(), FieldValue::Integer(120));
        fields.insert("pulse".to_string(), FieldValue::Integer(72));

        let data_point = DataPoint {
            measurement: "bp".to_string(),
            tag_set: tags,
            field_set: fields,
            timestamp: Some(SystemTime::UNIX_EPOCH + Duration::from_secs(1_000_000_000)),
        };

        assert_eq!(
            data_point.to_string(),
            "bp,model=QardioARM pulse=72i,systolic=120i 1000000000000000000"
        );
    }

    #[test]
    fn test_data_point_without_timestamp() {
        let mut fields = BTreeMap::new();
        fields.insert("pulse".to_string(), FieldValue::Integer(60));

        let data_point = DataPoint {
            measurement: "bp".to_string(),
            tag_set: BTreeMap::new(),
            field_set: fields,
            timestamp: None,
        };
        assert_eq!(data_point.to_string(), "bp pulse=60i");
    }

    #[test]
    fn test_formatter_reading() {
        let formatter = InfluxDbFormatter::default();
        let mut r = reading(120, 80, 72);
        r.timestamp = SystemTime::UNIX_EPOCH + Duration::from_secs(1_000_000_000);

        assert_eq!(
            formatter.format(&r),
            "blood_pressure,manufacturer=Qardio,model=QardioARM \
             diastolic=80i,pulse=72i,systolic=120i 1000000000000000000"
        );
    }

    #[test]
    fn test_formatter_escapes_identity_tags() {
        let formatter = InfluxDbFormatter::new("bp".to_string());
        let mut r = reading(120, 80, 72);
        r.identity = DeviceIdentity::new("Qardio, Inc.", "ARM=A100");

        let line = formatter.format(&r);
        assert!(line.contains("manufacturer=Qardio\\,\\ Inc."));
        assert!(line.contains("model=ARM\\=A100"));
    }

    #[test]
    fn test_measurement_name_keeps_equals_sign() {
        let formatter = InfluxDbFormatter::new("home bp,a=b".to_string());
        let line = formatter.format(&reading(120, 80, 72));
        assert!(line.starts_with("home\\ bp\\,a=b,manufacturer=Qardio,"));
    }
}
