//! JSON lines output formatter.

use crate::reading::Reading;
use crate::sink::OutputFormatter;
use serde_json::json;
use std::time::SystemTime;

/// Formats each reading as one JSON object; `timestamp` is milliseconds
/// since the Unix epoch.
#[derive(Debug, Default, Clone, Copy)]
pub struct JsonFormatter;

impl OutputFormatter for JsonFormatter {
    fn format(&self, reading: &Reading) -> String {
        let timestamp = reading
            .timestamp
            .duration_since(SystemTime::UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or_default();

        json!({
            "systolic_mmhg": reading.systolic_mmhg,
            "diastolic_mmhg": reading.diastolic_mmhg,
            "pulse_bpm": reading.pulse_bpm,
            "timestamp": timestamp,
            "manufacturer": reading.identity.manufacturer,
            "model": reading.identity.model,
        })
        .to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::reading;
    use std::time::Duration;

    #[test]
    fn test_json_line() {
        let mut r = reading(120, 80, 72);
        r.timestamp = SystemTime::UNIX_EPOCH + Duration::from_millis(1_700_000_000_123);

        let line = JsonFormatter.format(&r);
        assert!(!line.contains('\n'));

        let value: serde_json::Value = serde_json::from_str(&line).unwrap();
        assert_eq!(value["systolic_mmhg"], 120);
        assert_eq!(value["diastolic_mmhg"], 80);
        assert_eq!(value["pulse_bpm"], 72);
        assert_eq!(value["timestamp"], 1_700_000_000_123u64);
        assert_eq!(value["manufacturer"], "Qardio");
        assert_eq!(value["model"], "QardioARM");
    }
}
