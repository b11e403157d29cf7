use crate::prelude::*;

use serde::Deserialize;
use serde_json::{Map, Value};
use serde_with::{serde_as, DisplayFromStr};
use std::collections::{HashMap, HashSet};

/// One scalar field of the 93-byte telemetry frame: where it lives, how wide
/// it is, how to interpret it. Pure data - the decoder below is the only
/// logic that touches it.
#[serde_as]
#[derive(Debug, Clone, Deserialize)]
pub struct FieldSpec {
    pub key: String,
    pub offset: usize,
    pub length: usize,
    #[serde(default)]
    pub signed: bool,
    #[serde(default = "default_scale")]
    pub scale: f64,
    /// Optional raw-value -> label table (battery chemistry names etc.)
    #[serde_as(as = "Option<HashMap<DisplayFromStr, _>>")]
    #[serde(default)]
    pub labels: Option<HashMap<u32, String>>,
}

fn default_scale() -> f64 {
    1.0
}

/// One status flag: a single bit of a single byte.
#[derive(Debug, Clone, Deserialize)]
pub struct BitSpec {
    pub key: String,
    pub byte: usize,
    pub bit: u8,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RegisterMap {
    pub fields: Vec<FieldSpec>,
    pub status_bits: Vec<BitSpec>,
}

impl FieldSpec {
    fn raw_value(&self, frame: &[u8]) -> Option<i64> {
        let end = self.offset.checked_add(self.length)?;
        if end > frame.len() {
            return None;
        }
        let chunk = &frame[self.offset..end];

        let value = match (self.length, self.signed) {
            (1, false) => chunk[0] as i64,
            (1, true) => chunk[0] as i8 as i64,
            (2, false) => u16::from_be_bytes([chunk[0], chunk[1]]) as i64,
            (2, true) => i16::from_be_bytes([chunk[0], chunk[1]]) as i64,
            (4, false) => u32::from_be_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]) as i64,
            (4, true) => i32::from_be_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]) as i64,
            _ => return None,
        };

        Some(value)
    }
}

impl RegisterMap {
    pub fn from_file(file: &str) -> Result<Self> {
        let content = std::fs::read_to_string(file)
            .map_err(|err| anyhow!("error reading register map {}: {}", file, err))?;

        let map: Self = serde_json::from_str(&content)
            .map_err(|err| anyhow!("error parsing register map {}: {}", file, err))?;

        map.validate()?;
        info!(
            "loaded register map from {}: {} fields, {} status bits",
            file,
            map.fields.len(),
            map.status_bits.len()
        );
        Ok(map)
    }

    pub fn validate(&self) -> Result<()> {
        let mut seen = HashSet::new();

        for field in &self.fields {
            if field.key.is_empty() {
                bail!("register map field with empty key");
            }
            if !seen.insert(&field.key) {
                bail!("duplicate register map key: {}", field.key);
            }
            if !matches!(field.length, 1 | 2 | 4) {
                bail!("field {}: length must be 1, 2 or 4", field.key);
            }
            if field.scale <= 0.0 {
                bail!("field {}: scale must be positive", field.key);
            }
        }

        for bit in &self.status_bits {
            if bit.key.is_empty() {
                bail!("register map status bit with empty key");
            }
            if !seen.insert(&bit.key) {
                bail!("duplicate register map key: {}", bit.key);
            }
            if bit.bit > 7 {
                bail!("status bit {}: bit index must be 0-7", bit.key);
            }
        }

        Ok(())
    }

    /// Decodes the scalar fields of a validated telemetry frame. Fields whose
    /// byte range falls outside the frame are skipped, not errors - firmware
    /// revisions disagree about the tail of the block.
    pub fn decode(&self, frame: &[u8]) -> Map<String, Value> {
        let mut out = Map::new();

        for field in &self.fields {
            let raw = match field.raw_value(frame) {
                Some(raw) => raw,
                None => continue,
            };

            if let Some(labels) = &field.labels {
                if raw >= 0 {
                    if let Some(label) = labels.get(&(raw as u32)) {
                        out.insert(field.key.clone(), Value::String(label.clone()));
                        continue;
                    }
                }
            }

            let value = if (field.scale - 1.0).abs() > f64::EPSILON {
                match serde_json::Number::from_f64(round2(raw as f64 / field.scale)) {
                    Some(n) => Value::Number(n),
                    None => continue,
                }
            } else {
                Value::from(raw)
            };
            out.insert(field.key.clone(), value);
        }

        // instantaneous charge power, only when both inputs decoded
        if let (Some(v), Some(i)) = (number(&out, "battery_voltage"), number(&out, "charge_current"))
        {
            if let Some(n) = serde_json::Number::from_f64(round2(v * i)) {
                out.insert("charge_power".to_string(), Value::Number(n));
            }
        }

        out
    }

    /// Decodes the status-bit flags into booleans.
    pub fn decode_bits(&self, frame: &[u8]) -> Map<String, Value> {
        let mut out = Map::new();

        for spec in &self.status_bits {
            if spec.byte < frame.len() {
                let set = (frame[spec.byte] >> spec.bit) & 0x01 == 0x01;
                out.insert(spec.key.clone(), Value::Bool(set));
            }
        }

        out
    }

    /// The Ampinvt B1 status block layout, used unless the configuration
    /// points at a JSON override file.
    pub fn builtin() -> Self {
        let map = Self {
            fields: vec![
                labeled(
                    "battery_type",
                    8,
                    &[
                        (0, "Lead-Acid (Sealed)"),
                        (1, "Lead-Acid (Gel)"),
                        (2, "Lead-Acid (Flooded)"),
                        (3, "Lithium"),
                    ],
                ),
                labeled(
                    "recognition_mode",
                    9,
                    &[
                        (0, "Auto"),
                        (1, "Manual"),
                        (2, "Manual (24V)"),
                        (3, "Manual (36V)"),
                        (4, "Manual (48V)"),
                        (5, "Manual (60V)"),
                        (6, "Manual (72V)"),
                        (7, "Manual (84V)"),
                        (8, "Manual (96V)"),
                    ],
                ),
                field("battery_count", 10, 1, 1.0),
                labeled(
                    "load_control_mode",
                    11,
                    &[
                        (0, "Off"),
                        (1, "Auto (Light+Time)"),
                        (2, "Time Control"),
                        (3, "Light Control"),
                        (4, "Remote Control"),
                    ],
                ),
                field("device_address", 12, 1, 1.0),
                labeled(
                    "baud_rate",
                    13,
                    &[(1, "1200"), (2, "2400"), (3, "4800"), (4, "9600")],
                ),
                field("rated_voltage", 16, 2, 100.0),
                field("equalize_voltage", 18, 2, 100.0),
                field("float_voltage", 20, 2, 100.0),
                field("discharge_limit_voltage", 22, 2, 100.0),
                field("hw_max_charge_current", 24, 2, 100.0),
                field("max_charge_current", 26, 2, 100.0),
                field("run_charge_current_limit", 28, 2, 100.0),
                field("pv_voltage", 30, 2, 10.0),
                field("battery_voltage", 32, 2, 100.0),
                field("charge_current", 34, 2, 100.0),
                signed("internal_temp", 36, 2, 10.0),
                signed("external_temp", 40, 2, 100.0),
                field("today_yield_wh", 44, 4, 1.0),
                field("total_yield_wh", 48, 4, 1.0),
                field("model_code", 52, 1, 1.0),
                field("discharge_recovery_voltage", 54, 2, 100.0),
                field("over_voltage_protection", 56, 2, 100.0),
                field("over_voltage_recovery", 58, 2, 100.0),
                field("light_on_voltage", 60, 2, 1.0),
                field("light_off_voltage", 62, 2, 1.0),
                field("light_on_delay", 64, 2, 1.0),
                field("light_off_delay", 66, 2, 1.0),
            ],
            status_bits: vec![
                bit("run_status", 3, 0),
                bit("fan_status", 3, 2),
                bit("temp_protect", 3, 3),
                bit("internal_temp_fault", 3, 5),
                bit("charging", 4, 0),
                bit("equalizing", 4, 1),
                bit("tracking", 4, 2),
                bit("float_charging", 4, 3),
                bit("charge_limited", 4, 4),
                bit("pv_over_voltage", 4, 7),
                bit("load_output", 5, 1),
                bit("overcharge_protect", 5, 4),
                bit("overvoltage_protect", 5, 5),
            ],
        };

        map.validate().expect("builtin register map is well-formed");
        map
    }
}

fn number(map: &Map<String, Value>, key: &str) -> Option<f64> {
    map.get(key).and_then(Value::as_f64)
}

fn round2(x: f64) -> f64 {
    (x * 100.0).round() / 100.0
}

fn field(key: &str, offset: usize, length: usize, scale: f64) -> FieldSpec {
    FieldSpec {
        key: key.to_string(),
        offset,
        length,
        signed: false,
        scale,
        labels: None,
    }
}

fn signed(key: &str, offset: usize, length: usize, scale: f64) -> FieldSpec {
    FieldSpec {
        signed: true,
        ..field(key, offset, length, scale)
    }
}

fn labeled(key: &str, offset: usize, labels: &[(u32, &str)]) -> FieldSpec {
    FieldSpec {
        labels: Some(
            labels
                .iter()
                .map(|(raw, label)| (*raw, label.to_string()))
                .collect(),
        ),
        ..field(key, offset, 1, 1.0)
    }
}

fn bit(key: &str, byte: usize, bit: u8) -> BitSpec {
    BitSpec {
        key: key.to_string(),
        byte,
        bit,
    }
}
