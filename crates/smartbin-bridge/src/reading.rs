//! Telemetry readings decoded from bin status frames
//!
//! A frame payload is a compact JSON object. Only `materialDetected` and the
//! nested per-material `status` are interpreted; every other field is carried
//! through untouched so new firmware fields reach the database without a
//! bridge release.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;

use crate::error::ParseError;

/// Field naming the material seen by the detector
pub const MATERIAL_FIELD: &str = "materialDetected";

/// Log status used when the material has no nested status object
pub const UNKNOWN_STATUS: &str = "N/A";

/// Material reported in `materialDetected`
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Material {
    /// Nothing detected
    None,
    /// Plastic item, status under `plastic`
    Plastic,
    /// Metal item, status under `metal`
    Metal,
    /// Any other material name the firmware reports
    Other(String),
}

impl Material {
    /// Map a wire value to a material. Empty names are not materials.
    pub fn from_wire(value: &str) -> Option<Self> {
        match value {
            "" => None,
            "None" => Some(Material::None),
            "Plastic" => Some(Material::Plastic),
            "Metal" => Some(Material::Metal),
            other => Some(Material::Other(other.to_string())),
        }
    }

    /// Name as sent by the firmware
    pub fn as_str(&self) -> &str {
        match self {
            Material::None => "None",
            Material::Plastic => "Plastic",
            Material::Metal => "Metal",
            Material::Other(name) => name,
        }
    }

    /// Key of the nested object carrying this material's status
    pub fn status_key(&self) -> Option<&'static str> {
        match self {
            Material::Plastic => Some("plastic"),
            Material::Metal => Some("metal"),
            Material::None | Material::Other(_) => None,
        }
    }

    /// Whether this value represents a detection event
    pub fn is_detection(&self) -> bool {
        !matches!(self, Material::None)
    }
}

impl fmt::Display for Material {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A decoded and validated status report
#[derive(Debug, Clone, PartialEq)]
pub struct TelemetryReading {
    material: Option<Material>,
    /// Detection status resolved at parse time
    detection_status: Option<String>,
    /// All payload fields except `materialDetected`
    fields: Map<String, Value>,
    received_at: DateTime<Utc>,
}

impl TelemetryReading {
    /// Decode a frame payload received now
    pub fn parse(payload: &str) -> Result<Self, ParseError> {
        Self::parse_at(payload, Utc::now())
    }

    /// Decode a frame payload with an explicit receive time
    pub fn parse_at(payload: &str, received_at: DateTime<Utc>) -> Result<Self, ParseError> {
        let value: Value = serde_json::from_str(payload)?;
        let Value::Object(mut fields) = value else {
            return Err(ParseError::MalformedSyntax(format!(
                "expected a JSON object, got {}",
                json_kind(&value)
            )));
        };

        let material = match fields.remove(MATERIAL_FIELD) {
            None => None,
            Some(Value::String(name)) => Some(Material::from_wire(&name).ok_or_else(|| {
                ParseError::InvalidEnumValue {
                    field: MATERIAL_FIELD.to_string(),
                    value: "\"\"".to_string(),
                }
            })?),
            Some(other) => {
                return Err(ParseError::InvalidEnumValue {
                    field: MATERIAL_FIELD.to_string(),
                    value: other.to_string(),
                })
            }
        };

        let detection_status = match &material {
            Some(m) if m.is_detection() => Some(resolve_status(m, &fields)?),
            _ => None,
        };

        Ok(Self {
            material,
            detection_status,
            fields,
            received_at,
        })
    }

    /// Material reported, if the payload carried the field
    pub fn material(&self) -> Option<&Material> {
        self.material.as_ref()
    }

    /// Payload fields other than `materialDetected`
    pub fn fields(&self) -> &Map<String, Value> {
        &self.fields
    }

    /// When the frame was read from the serial link
    pub fn received_at(&self) -> DateTime<Utc> {
        self.received_at
    }

    /// Log entry for this reading, if it reports a detection
    pub fn log_entry(&self) -> Option<LogEntry> {
        let material = self.material.as_ref().filter(|m| m.is_detection())?;
        Some(LogEntry {
            material: material.as_str().to_string(),
            status: self
                .detection_status
                .clone()
                .unwrap_or_else(|| UNKNOWN_STATUS.to_string()),
            time: self.received_at,
        })
    }

    /// Bin state merge derived from this reading
    pub fn state_update(&self) -> StateUpdate {
        StateUpdate {
            fields: self.fields.clone(),
        }
    }

    /// Wire JSON object, `materialDetected` included
    pub fn to_wire(&self) -> Value {
        let mut object = Map::with_capacity(self.fields.len() + 1);
        if let Some(material) = &self.material {
            object.insert(
                MATERIAL_FIELD.to_string(),
                Value::String(material.as_str().to_string()),
            );
        }
        for (key, value) in &self.fields {
            object.insert(key.clone(), value.clone());
        }
        Value::Object(object)
    }

    /// Full serial line for this reading, terminator included
    pub fn encode_frame(&self, prefix: &str) -> String {
        format!("{}{}\n", prefix, self.to_wire())
    }
}

fn resolve_status(material: &Material, fields: &Map<String, Value>) -> Result<String, ParseError> {
    let Some(key) = material.status_key() else {
        return Ok(UNKNOWN_STATUS.to_string());
    };

    let nested = fields
        .get(key)
        .and_then(Value::as_object)
        .ok_or_else(|| ParseError::MissingField {
            field: key.to_string(),
        })?;

    match nested.get("status") {
        Some(Value::String(status)) => Ok(status.clone()),
        Some(Value::Null) | None => Err(ParseError::MissingField {
            field: format!("{}.status", key),
        }),
        Some(_) => Err(ParseError::InvalidFieldType {
            field: format!("{}.status", key),
            expected: "string",
        }),
    }
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

/// Append-only record of one detection event
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry {
    /// Material name as reported
    pub material: String,
    /// Status of the material's bin, or `N/A`
    pub status: String,
    /// When the detection was received
    pub time: DateTime<Utc>,
}

/// Partial bin state written on every reading
///
/// Built from a validated reading; `materialDetected` is never part of it.
#[derive(Debug, Clone, PartialEq)]
pub struct StateUpdate {
    fields: Map<String, Value>,
}

impl StateUpdate {
    /// Top-level keys and values to merge
    pub fn fields(&self) -> &Map<String, Value> {
        &self.fields
    }

    /// Whether there is anything to write
    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_plastic_detection() {
        let reading = TelemetryReading::parse(
            r#"{"materialDetected":"Plastic","plastic":{"status":"clean","level":40}}"#,
        )
        .unwrap();

        assert_eq!(reading.material(), Some(&Material::Plastic));
        let entry = reading.log_entry().unwrap();
        assert_eq!(entry.material, "Plastic");
        assert_eq!(entry.status, "clean");
        assert_eq!(entry.time, reading.received_at());

        let update = reading.state_update();
        assert!(!update.fields().contains_key(MATERIAL_FIELD));
        assert_eq!(update.fields()["plastic"]["level"], json!(40));
    }

    #[test]
    fn test_parse_metal_detection() {
        let reading = TelemetryReading::parse(
            r#"{"materialDetected":"Metal","metal":{"status":"Full"},"plastic":{"status":"ok"}}"#,
        )
        .unwrap();
        assert_eq!(reading.log_entry().unwrap().status, "Full");
    }

    #[test]
    fn test_none_material_has_no_log_entry() {
        let reading = TelemetryReading::parse(r#"{"materialDetected":"None"}"#).unwrap();
        assert_eq!(reading.material(), Some(&Material::None));
        assert!(reading.log_entry().is_none());
        assert!(reading.state_update().is_empty());
    }

    #[test]
    fn test_absent_material_has_no_log_entry() {
        let reading = TelemetryReading::parse(r#"{"metal":{"level":3}}"#).unwrap();
        assert!(reading.material().is_none());
        assert!(reading.log_entry().is_none());
        assert_eq!(reading.state_update().fields().len(), 1);
    }

    #[test]
    fn test_other_material_logs_unknown_status() {
        let reading = TelemetryReading::parse(r#"{"materialDetected":"Glass"}"#).unwrap();
        assert_eq!(
            reading.material(),
            Some(&Material::Other("Glass".to_string()))
        );
        let entry = reading.log_entry().unwrap();
        assert_eq!(entry.material, "Glass");
        assert_eq!(entry.status, UNKNOWN_STATUS);
    }

    #[test]
    fn test_missing_nested_status() {
        let err = TelemetryReading::parse(r#"{"materialDetected":"Plastic"}"#).unwrap_err();
        assert_eq!(
            err,
            ParseError::MissingField {
                field: "plastic".to_string()
            }
        );

        let err = TelemetryReading::parse(r#"{"materialDetected":"Metal","metal":{"level":9}}"#)
            .unwrap_err();
        assert_eq!(
            err,
            ParseError::MissingField {
                field: "metal.status".to_string()
            }
        );
    }

    #[test]
    fn test_non_string_status() {
        let err =
            TelemetryReading::parse(r#"{"materialDetected":"Metal","metal":{"status":3}}"#)
                .unwrap_err();
        assert!(matches!(err, ParseError::InvalidFieldType { .. }));
    }

    #[test]
    fn test_invalid_material_values() {
        for payload in [
            r#"{"materialDetected":7}"#,
            r#"{"materialDetected":null}"#,
            r#"{"materialDetected":""}"#,
        ] {
            let err = TelemetryReading::parse(payload).unwrap_err();
            assert_eq!(err.error_code(), "INVALID_ENUM_VALUE", "{}", payload);
        }
    }

    #[test]
    fn test_malformed_payloads() {
        for payload in ["{\"materialDetected\":", "[1,2]", "\"text\"", ""] {
            let err = TelemetryReading::parse(payload).unwrap_err();
            assert!(!err.is_validation(), "{}", payload);
        }
    }

    #[test]
    fn test_unknown_fields_are_kept() {
        let reading = TelemetryReading::parse(
            r#"{"materialDetected":"None","firmware":"2.1","paper":{"status":"ok"}}"#,
        )
        .unwrap();
        assert_eq!(reading.fields()["firmware"], json!("2.1"));
        assert_eq!(reading.fields()["paper"]["status"], json!("ok"));
    }

    #[test]
    fn test_fields_equal_payload_fields() {
        let payload = json!({
            "materialDetected": "Plastic",
            "plastic": {"status": "clean", "level": 12},
            "metal": {"status": "ok", "level": 80},
            "uptime": 1234
        });
        let reading = TelemetryReading::parse(&payload.to_string()).unwrap();

        let mut expected = payload.as_object().unwrap().clone();
        expected.remove(MATERIAL_FIELD);
        assert_eq!(reading.fields(), &expected);
    }

    #[test]
    fn test_wire_round_trip() {
        let original = TelemetryReading::parse(
            r#"{"materialDetected":"Metal","metal":{"status":"Full","level":95},"temp":21.5}"#,
        )
        .unwrap();

        let frame = original.encode_frame("ARDUINO_DATA:");
        let payload = frame
            .strip_prefix("ARDUINO_DATA:")
            .unwrap()
            .trim_end_matches('\n');
        let decoded = TelemetryReading::parse_at(payload, original.received_at()).unwrap();

        assert_eq!(decoded, original);
    }

    #[test]
    fn test_log_entry_serializes_time_field() {
        let reading = TelemetryReading::parse(r#"{"materialDetected":"Glass"}"#).unwrap();
        let value = serde_json::to_value(reading.log_entry().unwrap()).unwrap();
        assert!(value.get("time").is_some());
        assert_eq!(value["status"], json!("N/A"));
    }
}
