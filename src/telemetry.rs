//! Typed telemetry snapshot carried by a wake report.
//!
//! Devices report a flat JSON object (BME680 environmentals plus battery and
//! radio figures). Known fields get named columns; anything else rides along
//! in the `extra` map so newer firmware never loses data on older servers.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Telemetry {
    pub temperature_c: Option<f64>,
    pub humidity_pct: Option<f64>,
    pub pressure_hpa: Option<f64>,
    pub gas_resistance_kohm: Option<f64>,
    pub battery_v: Option<f64>,
    pub signal_dbm: Option<f64>,
    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_json::Value>,
}

impl Telemetry {
    /// A sample qualifies for the risk model only with both a temperature
    /// and a humidity reading.
    pub fn has_climate_pair(&self) -> bool {
        self.temperature_c.is_some() && self.humidity_pct.is_some()
    }

    pub fn extra_json(&self) -> Option<serde_json::Value> {
        if self.extra.is_empty() {
            None
        } else {
            serde_json::to_value(&self.extra).ok()
        }
    }
}

/// Decode a raw gateway payload, reporting the JSON path of any mismatch.
pub fn decode(raw: &str) -> Result<Telemetry, String> {
    let mut de = serde_json::Deserializer::from_str(raw);
    serde_path_to_error::deserialize(&mut de)
        .map_err(|e| format!("telemetry decode failed at {}: {}", e.path(), e.inner()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_known_fields_and_keeps_extras() {
        let raw = r#"{
            "temperature_c": 21.4,
            "humidity_pct": 63.0,
            "pressure_hpa": 1013.2,
            "gas_resistance_kohm": 15.3,
            "battery_v": 3.91,
            "signal_dbm": -67.0,
            "lens_dirty": true
        }"#;
        let t = decode(raw).expect("decode");
        assert_eq!(t.temperature_c, Some(21.4));
        assert_eq!(t.humidity_pct, Some(63.0));
        assert_eq!(t.extra.get("lens_dirty"), Some(&serde_json::Value::Bool(true)));
        assert!(t.has_climate_pair());
    }

    #[test]
    fn missing_fields_stay_none() {
        let t = decode(r#"{"battery_v": 3.7}"#).expect("decode");
        assert_eq!(t.temperature_c, None);
        assert!(!t.has_climate_pair());
        assert!(t.extra_json().is_none());
    }

    #[test]
    fn decode_error_names_the_path() {
        let err = decode(r#"{"temperature_c": "warm"}"#).unwrap_err();
        assert!(err.contains("temperature_c"), "unexpected error: {err}");
    }
}
