//! Device-model decode/encode engine.
//!
//! A [`DeviceSchema`] is loaded once per device type from the vendor's
//! model document and never mutated. It describes how an opaque monitor
//! payload maps to named fields: binary offset/width for packed
//! payloads, enum tables (wire code ↔ human label, both directions),
//! numeric ranges, and per-field defaults.
//!
//! Decode and encode are inverses for every value inside a field's
//! declared domain. The one asymmetry is the packed control path: the
//! wire format has no addressable sub-fields, so encoding a single
//! field change re-derives the entire byte array from the schema's
//! control template with the full current field set substituted in.

use std::collections::HashMap;

use serde_json::Value;

use homesync_api::{ControlPayload, RawPayload};

use crate::error::CoreError;

/// Decoded monitor state: field name → value.
pub type FieldMap = serde_json::Map<String, Value>;

// ── Field specifications ─────────────────────────────────────────────

/// Declared numeric domain for a range field.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RangeSpec {
    pub min: f64,
    pub max: f64,
    pub step: f64,
}

#[derive(Debug, Clone)]
enum FieldKind {
    /// Wire code (as the vendor prints it) → human label.
    Enum { options: HashMap<String, String> },
    /// Bounded numeric value. The minimum is a hard floor: devices
    /// sometimes report below range, and the floor is authoritative.
    Range(RangeSpec),
    /// Declared but not enum/range typed; passed through untouched.
    Opaque,
}

#[derive(Debug, Clone)]
struct FieldSpec {
    kind: FieldKind,
    default: Option<Value>,
}

/// One field's position in a packed binary payload.
#[derive(Debug, Clone)]
struct BinarySlot {
    name: String,
    offset: usize,
    width: usize,
}

#[derive(Debug, Clone)]
enum MonitoringLayout {
    /// Packed byte array, decoded slot by slot.
    Binary(Vec<BinarySlot>),
    /// Payload arrives already keyed by field name.
    Structured,
}

// ── DeviceSchema ─────────────────────────────────────────────────────

/// Immutable per-device-type schema: field layout plus lookup tables.
#[derive(Debug, Clone)]
pub struct DeviceSchema {
    layout: MonitoringLayout,
    fields: HashMap<String, FieldSpec>,
    /// Packed control template, e.g. `"[{{Operation}},{{OpMode}},...]"`.
    /// Present only for devices whose control path is binary.
    control_template: Option<String>,
}

impl DeviceSchema {
    /// Parse a vendor model document.
    ///
    /// Field specs come from the `Value` section, overridden by
    /// `MonitoringValue` where both exist (newer documents carry the
    /// latter). Unknown field types parse as opaque rather than
    /// failing the whole schema.
    pub fn parse(doc: &Value) -> Result<Self, CoreError> {
        if !doc.is_object() {
            return Err(CoreError::SchemaInvalid {
                message: "model document is not an object".into(),
            });
        }

        let layout = parse_layout(doc.get("Monitoring"))?;

        let mut fields = HashMap::new();
        for section in ["Value", "MonitoringValue"] {
            if let Some(Value::Object(entries)) = doc.get(section) {
                for (name, entry) in entries {
                    fields.insert(name.clone(), parse_field(entry));
                }
            }
        }

        let control_template = doc
            .pointer("/ControlWifi/type")
            .and_then(Value::as_str)
            .filter(|t| t.starts_with("BINARY"))
            .and_then(|_| doc.pointer("/ControlWifi/action/SetControl/data"))
            .and_then(Value::as_str)
            .map(str::to_owned);

        Ok(Self {
            layout,
            fields,
            control_template,
        })
    }

    /// Whether the document declared any model sections at all.
    ///
    /// A device without them is not a "smart" device in the monitor
    /// sense; callers warn and skip it.
    pub fn has_model_sections(&self) -> bool {
        !self.fields.is_empty() || matches!(self.layout, MonitoringLayout::Binary(_))
    }

    // ── Decode ───────────────────────────────────────────────────────

    /// Decode one raw monitor payload into a named field map.
    ///
    /// Absent fields decode to their declared defaults rather than
    /// failing; range fields are floored to their declared minimum.
    pub fn decode_monitor(&self, payload: &RawPayload) -> FieldMap {
        let mut out = match (payload, &self.layout) {
            (RawPayload::Binary(bytes), MonitoringLayout::Binary(slots)) => {
                self.decode_binary(bytes, slots)
            }
            (RawPayload::Structured(value), _) => self.decode_structured(value),
            // Packed bytes without a layout: nothing to name them with.
            (RawPayload::Binary(_), MonitoringLayout::Structured) => FieldMap::new(),
        };

        self.substitute_defaults(&mut out);
        self.apply_range_floors(&mut out);
        out
    }

    fn decode_binary(&self, bytes: &[u8], slots: &[BinarySlot]) -> FieldMap {
        let mut out = FieldMap::new();
        for slot in slots {
            let end = slot.offset + slot.width;
            if end > bytes.len() {
                // Truncated payload: the default substitution below
                // fills the gap.
                continue;
            }
            let value = bytes[slot.offset..end]
                .iter()
                .fold(0u64, |acc, b| (acc << 8) | u64::from(*b));
            out.insert(slot.name.clone(), Value::from(value));
        }
        out
    }

    fn decode_structured(&self, value: &Value) -> FieldMap {
        match value {
            Value::Object(map) => map.clone(),
            _ => FieldMap::new(),
        }
    }

    fn substitute_defaults(&self, out: &mut FieldMap) {
        for (name, spec) in &self.fields {
            if !out.contains_key(name) {
                if let Some(default) = &spec.default {
                    out.insert(name.clone(), default.clone());
                }
            }
        }
    }

    fn apply_range_floors(&self, out: &mut FieldMap) {
        for (name, value) in out.iter_mut() {
            if let Some(FieldSpec {
                kind: FieldKind::Range(range),
                ..
            }) = self.fields.get(name)
            {
                if let Some(number) = value_as_f64(value) {
                    if number < range.min {
                        *value = Value::from(range.min);
                    }
                }
            }
        }
    }

    // ── Lookups ──────────────────────────────────────────────────────

    /// Wire code → human label for an enum field.
    pub fn enum_label(&self, field: &str, code: &Value) -> Option<&str> {
        let FieldSpec {
            kind: FieldKind::Enum { options },
            ..
        } = self.fields.get(field)?
        else {
            return None;
        };
        options.get(&wire_code_key(code)).map(String::as_str)
    }

    /// Human label → wire code for an enum field (reverse lookup).
    pub fn enum_code(&self, field: &str, label: &str) -> Option<Value> {
        let FieldSpec {
            kind: FieldKind::Enum { options },
            ..
        } = self.fields.get(field)?
        else {
            return None;
        };
        options
            .iter()
            .find(|(_, l)| l.as_str() == label)
            .map(|(code, _)| Value::String(code.clone()))
    }

    /// The field's declared default, if any.
    pub fn default_of(&self, field: &str) -> Option<&Value> {
        self.fields.get(field)?.default.as_ref()
    }

    /// The field's declared numeric range, if any.
    pub fn range_of(&self, field: &str) -> Option<RangeSpec> {
        match self.fields.get(field)? {
            FieldSpec {
                kind: FieldKind::Range(range),
                ..
            } => Some(*range),
            _ => None,
        }
    }

    // ── Encode ───────────────────────────────────────────────────────

    /// Encode a single-field change into a control payload.
    ///
    /// `current` must be the device's full current field set; for the
    /// packed path the whole byte array is re-derived from it (the wire
    /// format cannot address sub-fields, so a control command always
    /// resends the complete packed state).
    ///
    /// Enum values may be given as a wire code or a human label; an
    /// unknown label is a [`CoreError::SchemaMismatch`] and the field
    /// is skipped by callers, not fatal to anything else.
    pub fn encode_control(
        &self,
        device_id: &str,
        field: &str,
        value: &Value,
        current: &FieldMap,
    ) -> Result<ControlPayload, CoreError> {
        let wire_value = self.to_wire_value(device_id, field, value)?;

        match &self.control_template {
            Some(template) => {
                let mut full = current.clone();
                full.insert(field.to_owned(), wire_value);
                let bytes = render_packed_template(template, &full).map_err(|message| {
                    CoreError::SchemaInvalid {
                        message: format!("control template for {device_id}: {message}"),
                    }
                })?;
                Ok(ControlPayload::Packed(bytes))
            }
            None => {
                let mut fields = FieldMap::new();
                fields.insert(field.to_owned(), wire_value);
                Ok(ControlPayload::Fields(fields))
            }
        }
    }

    /// Normalize a caller-supplied value to its wire form.
    fn to_wire_value(
        &self,
        device_id: &str,
        field: &str,
        value: &Value,
    ) -> Result<Value, CoreError> {
        let Some(FieldSpec {
            kind: FieldKind::Enum { options },
            ..
        }) = self.fields.get(field)
        else {
            return Ok(value.clone());
        };

        // Already a known wire code?
        if options.contains_key(&wire_code_key(value)) {
            return Ok(value.clone());
        }

        // A label, then.
        if let Some(label) = value.as_str() {
            if let Some(code) = self.enum_code(field, label) {
                return Ok(code);
            }
        }

        Err(CoreError::SchemaMismatch {
            device_id: device_id.to_owned(),
            field: field.to_owned(),
        })
    }
}

// ── Parse helpers ────────────────────────────────────────────────────

fn parse_layout(monitoring: Option<&Value>) -> Result<MonitoringLayout, CoreError> {
    let Some(monitoring) = monitoring else {
        return Ok(MonitoringLayout::Structured);
    };

    let is_binary = monitoring
        .get("type")
        .and_then(Value::as_str)
        .is_some_and(|t| t.starts_with("BINARY"));
    if !is_binary {
        return Ok(MonitoringLayout::Structured);
    }

    let Some(Value::Array(protocol)) = monitoring.get("protocol") else {
        return Err(CoreError::SchemaInvalid {
            message: "binary monitoring without protocol table".into(),
        });
    };

    let mut slots = Vec::with_capacity(protocol.len());
    for entry in protocol {
        let (Some(offset), Some(width), Some(name)) = (
            entry.get("startByte").and_then(Value::as_u64),
            entry.get("length").and_then(Value::as_u64),
            entry.get("value").and_then(Value::as_str),
        ) else {
            return Err(CoreError::SchemaInvalid {
                message: format!("malformed binary protocol entry: {entry}"),
            });
        };
        #[allow(clippy::cast_possible_truncation)]
        slots.push(BinarySlot {
            name: name.to_owned(),
            offset: offset as usize,
            width: width as usize,
        });
    }

    Ok(MonitoringLayout::Binary(slots))
}

fn parse_field(entry: &Value) -> FieldSpec {
    let default = entry.get("default").cloned();
    let kind = match entry
        .get("type")
        .and_then(Value::as_str)
        .map(str::to_ascii_lowercase)
        .as_deref()
    {
        Some("enum") => {
            let options = entry
                .get("option")
                .or_else(|| entry.get("options"))
                .and_then(Value::as_object)
                .map(|map| {
                    map.iter()
                        .filter_map(|(code, label)| {
                            label.as_str().map(|l| (code.clone(), l.to_owned()))
                        })
                        .collect()
                })
                .unwrap_or_default();
            FieldKind::Enum { options }
        }
        Some("range") => {
            let option = entry.get("option").unwrap_or(&Value::Null);
            FieldKind::Range(RangeSpec {
                min: option.get("min").and_then(Value::as_f64).unwrap_or(0.0),
                max: option
                    .get("max")
                    .and_then(Value::as_f64)
                    .unwrap_or(f64::MAX),
                step: option.get("step").and_then(Value::as_f64).unwrap_or(1.0),
            })
        }
        _ => FieldKind::Opaque,
    };

    FieldSpec { kind, default }
}

// ── Value helpers ────────────────────────────────────────────────────

/// Canonical string key for an enum wire code ("4", not "4.0").
fn wire_code_key(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Number(n) => n.to_string(),
        Value::Bool(b) => u8::from(*b).to_string(),
        other => other.to_string(),
    }
}

fn value_as_f64(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.parse().ok(),
        _ => None,
    }
}

/// Integer wire form used in packed templates.
fn value_as_wire_int(value: &Value) -> i64 {
    match value {
        Value::Number(n) => n.as_i64().unwrap_or(0),
        Value::String(s) => s.parse().unwrap_or(0),
        Value::Bool(b) => i64::from(*b),
        _ => 0,
    }
}

/// Substitute the full field set into a packed control template and
/// parse the result as a byte array.
///
/// Placeholders with no matching field fall back to `0`, mirroring the
/// decoder's default substitution.
fn render_packed_template(template: &str, fields: &FieldMap) -> Result<Vec<u8>, String> {
    let mut rendered = template.to_owned();
    for (name, value) in fields {
        rendered = rendered.replace(
            &format!("{{{{{name}}}}}"),
            &value_as_wire_int(value).to_string(),
        );
    }

    // Unreferenced placeholders: zero-fill.
    while let Some(start) = rendered.find("{{") {
        let Some(end) = rendered[start..].find("}}") else {
            return Err("unterminated placeholder".into());
        };
        rendered.replace_range(start..start + end + 2, "0");
    }

    let numbers: Vec<i64> = serde_json::from_str(&rendered)
        .map_err(|e| format!("rendered template is not a byte array: {e}"))?;

    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    let bytes = numbers
        .into_iter()
        .map(|n| n.clamp(0, 255) as u8)
        .collect();
    Ok(bytes)
}

// ── Tests ────────────────────────────────────────────────────────────

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use serde_json::json;

    fn binary_schema() -> DeviceSchema {
        DeviceSchema::parse(&json!({
            "Monitoring": {
                "type": "BINARY(BYTE)",
                "protocol": [
                    { "startByte": 0, "length": 1, "value": "Operation" },
                    { "startByte": 1, "length": 1, "value": "OpMode" },
                    { "startByte": 2, "length": 2, "value": "TempCur" },
                ],
            },
            "Value": {
                "Operation": {
                    "type": "Enum",
                    "option": { "0": "@AC_OFF", "1": "@AC_ON" },
                    "default": "0",
                },
                "OpMode": { "type": "Enum", "option": { "4": "@COOL", "8": "@AUTO" } },
                "TempCur": {
                    "type": "Range",
                    "option": { "min": 16, "max": 30, "step": 1 },
                    "default": 22,
                },
            },
            "ControlWifi": {
                "type": "BINARY(BYTE)",
                "action": { "SetControl": { "data": "[{{Operation}},{{OpMode}},{{TempCur}}]" } },
            },
        }))
        .unwrap()
    }

    fn structured_schema() -> DeviceSchema {
        DeviceSchema::parse(&json!({
            "Monitoring": { "type": "JSON" },
            "MonitoringValue": {
                "IcePlus": {
                    "type": "Enum",
                    "option": { "1": "@CP_OFF_EN_W", "2": "@CP_ON_EN_W" },
                    "default": "1",
                },
                "TempRefrigerator": {
                    "type": "Range",
                    "option": { "min": 1, "max": 7, "step": 1 },
                    "default": 3,
                },
            },
        }))
        .unwrap()
    }

    // ── Decode ───────────────────────────────────────────────────────

    #[test]
    fn binary_decode_reads_slots() {
        let schema = binary_schema();
        let fields = schema.decode_monitor(&RawPayload::Binary(vec![1, 4, 0, 21]));

        assert_eq!(fields["Operation"], json!(1));
        assert_eq!(fields["OpMode"], json!(4));
        assert_eq!(fields["TempCur"], json!(21));
    }

    #[test]
    fn binary_decode_multibyte_slot_is_big_endian() {
        let schema = binary_schema();
        let fields = schema.decode_monitor(&RawPayload::Binary(vec![0, 0, 1, 2]));
        assert_eq!(fields["TempCur"], json!(258));
    }

    #[test]
    fn truncated_binary_payload_substitutes_defaults() {
        let schema = binary_schema();
        let fields = schema.decode_monitor(&RawPayload::Binary(vec![1]));

        assert_eq!(fields["Operation"], json!(1));
        // TempCur slot is out of bounds: declared default wins.
        assert_eq!(fields["TempCur"], json!(22));
        // OpMode has no default and stays absent.
        assert!(!fields.contains_key("OpMode"));
    }

    #[test]
    fn structured_decode_is_direct_lookup_with_defaults() {
        let schema = structured_schema();
        let fields =
            schema.decode_monitor(&RawPayload::Structured(json!({ "IcePlus": "2" })));

        assert_eq!(fields["IcePlus"], json!("2"));
        assert_eq!(fields["TempRefrigerator"], json!(3));
    }

    #[test]
    fn structured_decode_preserves_undeclared_keys() {
        let schema = structured_schema();
        let fields = schema.decode_monitor(&RawPayload::Structured(
            json!({ "IcePlus": "2", "Exotic": 9 }),
        ));
        assert_eq!(fields["Exotic"], json!(9));
    }

    #[test]
    fn range_fields_are_floored_after_decode() {
        let schema = binary_schema();
        // Device reports TempCur = 2, below the declared min of 16.
        let fields = schema.decode_monitor(&RawPayload::Binary(vec![1, 4, 0, 2]));
        assert_eq!(fields["TempCur"], json!(16.0));
    }

    // ── Lookups ──────────────────────────────────────────────────────

    #[test]
    fn enum_lookups_are_inverses() {
        let schema = binary_schema();

        assert_eq!(schema.enum_label("Operation", &json!(1)), Some("@AC_ON"));
        assert_eq!(schema.enum_label("Operation", &json!("1")), Some("@AC_ON"));
        assert_eq!(schema.enum_code("Operation", "@AC_ON"), Some(json!("1")));
        assert_eq!(schema.enum_code("Operation", "@NOT_A_LABEL"), None);
    }

    #[test]
    fn range_and_default_accessors() {
        let schema = binary_schema();
        assert_eq!(schema.range_of("TempCur").unwrap().min, 16.0);
        assert!(schema.range_of("Operation").is_none());
        assert_eq!(schema.default_of("Operation"), Some(&json!("0")));
    }

    // ── Encode ───────────────────────────────────────────────────────

    #[test]
    fn packed_encode_resends_full_state() {
        let schema = binary_schema();
        let current = schema.decode_monitor(&RawPayload::Binary(vec![1, 4, 0, 21]));

        let payload = schema
            .encode_control("D1", "OpMode", &json!(8), &current)
            .unwrap();

        // The whole state is re-encoded, not just the changed field.
        assert_eq!(payload, ControlPayload::Packed(vec![1, 8, 21]));
    }

    #[test]
    fn packed_encode_accepts_enum_labels() {
        let schema = binary_schema();
        let current = schema.decode_monitor(&RawPayload::Binary(vec![0, 4, 0, 21]));

        let payload = schema
            .encode_control("D1", "Operation", &json!("@AC_ON"), &current)
            .unwrap();

        assert_eq!(payload, ControlPayload::Packed(vec![1, 4, 21]));
    }

    #[test]
    fn unknown_enum_label_is_schema_mismatch() {
        let schema = binary_schema();
        let err = schema
            .encode_control("D1", "Operation", &json!("@BOGUS"), &FieldMap::new())
            .unwrap_err();
        assert!(matches!(err, CoreError::SchemaMismatch { field, .. } if field == "Operation"));
    }

    #[test]
    fn structured_encode_carries_single_field() {
        let schema = structured_schema();
        let payload = schema
            .encode_control("D1", "IcePlus", &json!("@CP_ON_EN_W"), &FieldMap::new())
            .unwrap();

        let ControlPayload::Fields(fields) = payload else {
            panic!("expected structured payload");
        };
        assert_eq!(fields["IcePlus"], json!("2"));
    }

    #[test]
    fn round_trip_over_declared_domain() {
        let schema = binary_schema();
        let current = schema.decode_monitor(&RawPayload::Binary(vec![0, 4, 0, 21]));

        for code in [0u8, 1] {
            let payload = schema
                .encode_control("D1", "Operation", &json!(code), &current)
                .unwrap();
            let ControlPayload::Packed(bytes) = payload else {
                panic!("expected packed payload");
            };
            let decoded = schema.decode_monitor(&RawPayload::Binary(bytes));
            assert_eq!(decoded["Operation"], json!(u64::from(code)));
        }
    }

    #[test]
    fn unreferenced_placeholders_zero_fill() {
        let schema = binary_schema();
        let payload = schema
            .encode_control("D1", "TempCur", &json!(25), &FieldMap::new())
            .unwrap();
        assert_eq!(payload, ControlPayload::Packed(vec![0, 0, 25]));
    }

    // ── Parse ────────────────────────────────────────────────────────

    #[test]
    fn schema_without_sections_is_not_smart() {
        let schema = DeviceSchema::parse(&json!({ "Info": {} })).unwrap();
        assert!(!schema.has_model_sections());
        assert!(binary_schema().has_model_sections());
    }

    #[test]
    fn binary_monitoring_without_protocol_is_invalid() {
        let err = DeviceSchema::parse(&json!({
            "Monitoring": { "type": "BINARY(BYTE)" }
        }))
        .unwrap_err();
        assert!(matches!(err, CoreError::SchemaInvalid { .. }));
    }

    #[test]
    fn non_object_document_is_invalid() {
        assert!(DeviceSchema::parse(&json!([1, 2, 3])).is_err());
    }
}
