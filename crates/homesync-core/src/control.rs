//! Appliance control capabilities.
//!
//! Control is a capability interface implemented independently per
//! protocol generation and selected by a factory keyed on
//! (device type, protocol generation) -- no inheritance chains, the
//! variant dispatch happens exactly once, at construction.
//!
//! Both implementations answer with a completion signal only; the
//! resulting state change arrives through the change-event stream like
//! any other update. A `DuplicateValue` answer from the cloud means the
//! device is already in the requested state and is treated as success.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{Value, json};
use tokio::sync::Mutex;
use tracing::{debug, warn};

use homesync_api::{CloudApi, ControlPayload};

use crate::error::CoreError;
use crate::model::{DeviceType, ProtocolGeneration};
use crate::schema::{DeviceSchema, FieldMap};
use crate::snapshot::SnapshotStore;

/// Store handle shared between the scheduler and control capabilities.
/// Mutated only by the scheduler; control reads the raw echo from it.
pub type SharedStore = Arc<Mutex<SnapshotStore>>;

// ── Capability interface ─────────────────────────────────────────────

/// What a controllable appliance can do, independent of protocol
/// generation.
#[async_trait]
pub trait ApplianceControl: Send + Sync {
    /// Turn the appliance's primary function on or off.
    async fn set_active(&self, on: bool) -> Result<(), CoreError>;

    /// Set the target temperature, validated against the schema range.
    async fn set_target_temperature(&self, value: f64) -> Result<(), CoreError>;

    /// Set the operating mode (wire code or human label).
    async fn set_mode(&self, mode: &Value) -> Result<(), CoreError>;

    /// Escape hatch: set any schema field directly.
    async fn set_field(&self, field: &str, value: Value) -> Result<(), CoreError>;
}

// ── Per-type vocabulary ──────────────────────────────────────────────

/// Which schema fields back the capability operations for a device
/// type. Capability calls without a mapping are rejected, not guessed.
#[derive(Debug, Clone, Copy)]
struct ControlVocabulary {
    /// (field, on-label, off-label)
    power: Option<(&'static str, &'static str, &'static str)>,
    target_temp: Option<&'static str>,
    mode: Option<&'static str>,
}

fn vocabulary(device_type: DeviceType) -> ControlVocabulary {
    match device_type {
        DeviceType::AirConditioner => ControlVocabulary {
            power: Some((
                "Operation",
                "@AC_MAIN_OPERATION_RIGHT_ON_W",
                "@AC_MAIN_OPERATION_OFF_W",
            )),
            target_temp: Some("TempCfg"),
            mode: Some("OpMode"),
        },
        // Refrigerators are always on; "active" drives express mode.
        DeviceType::Refrigerator => ControlVocabulary {
            power: Some(("IcePlus", "@CP_ON_EN_W", "@CP_OFF_EN_W")),
            target_temp: Some("TempRefrigerator"),
            mode: None,
        },
        DeviceType::AirPurifier | DeviceType::Dehumidifier => ControlVocabulary {
            power: Some(("Operation", "@operation_on", "@operation_off")),
            target_temp: None,
            mode: Some("OpMode"),
        },
        _ => ControlVocabulary {
            power: None,
            target_temp: None,
            mode: None,
        },
    }
}

// ── Factory ──────────────────────────────────────────────────────────

/// Device types each generation can control.
fn is_supported(device_type: DeviceType, generation: ProtocolGeneration) -> bool {
    match generation {
        ProtocolGeneration::Gen1 => matches!(
            device_type,
            DeviceType::Washer
                | DeviceType::Dryer
                | DeviceType::AirConditioner
                | DeviceType::Refrigerator
                | DeviceType::AirPurifier
        ),
        ProtocolGeneration::Gen2 => matches!(
            device_type,
            DeviceType::Washer
                | DeviceType::Dryer
                | DeviceType::Dishwasher
                | DeviceType::AirConditioner
                | DeviceType::Refrigerator
                | DeviceType::AirPurifier
                | DeviceType::Dehumidifier
        ),
    }
}

/// Build the control capability for one device, or `None` when the
/// (type, generation) pair is not supported.
pub fn control_for(
    device_id: &str,
    device_type: DeviceType,
    generation: ProtocolGeneration,
    schema: Arc<DeviceSchema>,
    api: Arc<dyn CloudApi>,
    store: SharedStore,
) -> Option<Box<dyn ApplianceControl>> {
    if !is_supported(device_type, generation) {
        return None;
    }

    let common = ControlCommon {
        device_id: device_id.to_owned(),
        vocabulary: vocabulary(device_type),
        schema,
        api,
    };

    Some(match generation {
        ProtocolGeneration::Gen1 => Box::new(Gen1Control { common, store }),
        ProtocolGeneration::Gen2 => Box::new(Gen2Control { common }),
    })
}

// ── Shared plumbing ──────────────────────────────────────────────────

struct ControlCommon {
    device_id: String,
    vocabulary: ControlVocabulary,
    schema: Arc<DeviceSchema>,
    api: Arc<dyn CloudApi>,
}

impl ControlCommon {
    /// Resolve the power label for the requested state to its wire
    /// code. An unknown label is a schema mismatch -- reported, and the
    /// operation is skipped.
    fn power_code(&self, on: bool) -> Result<(&'static str, Value), CoreError> {
        let Some((field, on_label, off_label)) = self.vocabulary.power else {
            return Err(CoreError::ControlRejected {
                message: format!("{} has no power capability", self.device_id),
            });
        };
        let label = if on { on_label } else { off_label };
        match self.schema.enum_code(field, label) {
            Some(code) => Ok((field, code)),
            None => {
                warn!(device = %self.device_id, field, label, "label not in schema, skipping");
                Err(CoreError::SchemaMismatch {
                    device_id: self.device_id.clone(),
                    field: field.to_owned(),
                })
            }
        }
    }

    fn temp_field(&self) -> Result<&'static str, CoreError> {
        self.vocabulary
            .target_temp
            .ok_or_else(|| CoreError::ControlRejected {
                message: format!("{} has no temperature capability", self.device_id),
            })
    }

    /// Reject temperature targets outside the declared range. The floor
    /// rule is decode-side; on the control side an out-of-range request
    /// is a caller mistake, not device noise.
    fn check_range(&self, field: &str, value: f64) -> Result<(), CoreError> {
        if let Some(range) = self.schema.range_of(field) {
            if value < range.min || value > range.max {
                return Err(CoreError::ControlRejected {
                    message: format!(
                        "{field}={value} outside range {}..{}",
                        range.min, range.max
                    ),
                });
            }
        }
        Ok(())
    }

    fn mode_field(&self) -> Result<&'static str, CoreError> {
        self.vocabulary
            .mode
            .ok_or_else(|| CoreError::ControlRejected {
                message: format!("{} has no mode capability", self.device_id),
            })
    }

    /// Send a payload, treating the duplicate-value answer as success.
    async fn send(&self, payload: ControlPayload) -> Result<(), CoreError> {
        match self.api.send_control_command(&self.device_id, payload).await {
            Ok(()) => Ok(()),
            Err(err) if err.is_duplicate_value() => {
                debug!(device = %self.device_id, "value already set, no-op");
                Ok(())
            }
            Err(err) => Err(err.into()),
        }
    }
}

// ── Gen1: encode through the schema, full-state context ──────────────

/// Legacy-protocol control: every change is encoded through the device
/// schema, with the snapshot's raw echo as the full-state context the
/// packed wire format demands.
struct Gen1Control {
    common: ControlCommon,
    store: SharedStore,
}

impl Gen1Control {
    async fn encode_and_send(&self, field: &str, value: &Value) -> Result<(), CoreError> {
        let current: FieldMap = self
            .store
            .lock()
            .await
            .raw_fields(&self.common.device_id);
        let payload =
            self.common
                .schema
                .encode_control(&self.common.device_id, field, value, &current)?;
        self.common.send(payload).await
    }
}

#[async_trait]
impl ApplianceControl for Gen1Control {
    async fn set_active(&self, on: bool) -> Result<(), CoreError> {
        let (field, code) = self.common.power_code(on)?;
        self.encode_and_send(field, &code).await
    }

    async fn set_target_temperature(&self, value: f64) -> Result<(), CoreError> {
        let field = self.common.temp_field()?;
        self.common.check_range(field, value)?;
        self.encode_and_send(field, &json!(value)).await
    }

    async fn set_mode(&self, mode: &Value) -> Result<(), CoreError> {
        let field = self.common.mode_field()?;
        self.encode_and_send(field, mode).await
    }

    async fn set_field(&self, field: &str, value: Value) -> Result<(), CoreError> {
        self.encode_and_send(field, &value).await
    }
}

// ── Gen2: structured field assignments ───────────────────────────────

/// Push-protocol control: named field assignments, no packed context.
/// Enum labels still normalize to wire codes through the schema.
struct Gen2Control {
    common: ControlCommon,
}

impl Gen2Control {
    async fn send_field(&self, field: &str, value: &Value) -> Result<(), CoreError> {
        // Normalize labels to codes; non-enum fields pass through.
        let wire = match value.as_str().and_then(|label| {
            self.common.schema.enum_code(field, label)
        }) {
            Some(code) => code,
            None => value.clone(),
        };

        let mut fields = FieldMap::new();
        fields.insert(field.to_owned(), wire);
        self.common.send(ControlPayload::Fields(fields)).await
    }
}

#[async_trait]
impl ApplianceControl for Gen2Control {
    async fn set_active(&self, on: bool) -> Result<(), CoreError> {
        let (field, code) = self.common.power_code(on)?;
        self.send_field(field, &code).await
    }

    async fn set_target_temperature(&self, value: f64) -> Result<(), CoreError> {
        let field = self.common.temp_field()?;
        self.common.check_range(field, value)?;
        self.send_field(field, &json!(value)).await
    }

    async fn set_mode(&self, mode: &Value) -> Result<(), CoreError> {
        let field = self.common.mode_field()?;
        self.send_field(field, mode).await
    }

    async fn set_field(&self, field: &str, value: Value) -> Result<(), CoreError> {
        self.send_field(field, &value).await
    }
}

// ── Tests ────────────────────────────────────────────────────────────

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    use std::sync::Mutex as StdMutex;

    use async_trait::async_trait;
    use serde_json::json;
    use url::Url;

    use homesync_api::Error as ApiError;
    use homesync_api::cloud::{BrokerRoute, CertificateGrant, RawPayload, SessionAck, SessionOp};

    /// Captures control payloads; optionally answers DuplicateValue.
    #[derive(Default)]
    struct CaptureCloud {
        sent: StdMutex<Vec<ControlPayload>>,
        duplicate: bool,
    }

    #[async_trait]
    impl CloudApi for CaptureCloud {
        async fn list_devices(&self) -> Result<Vec<Value>, ApiError> {
            unimplemented!("not exercised")
        }

        async fn send_session_command(
            &self,
            _d: &str,
            _op: SessionOp,
            _t: &str,
        ) -> Result<SessionAck, ApiError> {
            unimplemented!("not exercised")
        }

        async fn fetch_session_result(
            &self,
            _d: &str,
            _w: &str,
        ) -> Result<RawPayload, ApiError> {
            unimplemented!("not exercised")
        }

        async fn fetch_device_schema(&self, _uri: &Url) -> Result<Value, ApiError> {
            unimplemented!("not exercised")
        }

        async fn send_control_command(
            &self,
            _device_id: &str,
            payload: ControlPayload,
        ) -> Result<(), ApiError> {
            self.sent.lock().unwrap().push(payload);
            if self.duplicate {
                return Err(ApiError::DuplicateValue);
            }
            Ok(())
        }

        async fn resolve_broker_route(&self) -> Result<BrokerRoute, ApiError> {
            unimplemented!("not exercised")
        }

        async fn register_client_identity(&self) -> Result<(), ApiError> {
            unimplemented!("not exercised")
        }

        async fn exchange_certificate(&self, _c: &str) -> Result<CertificateGrant, ApiError> {
            unimplemented!("not exercised")
        }

        fn client_id(&self) -> &str {
            "test-client"
        }
    }

    fn ac_schema() -> Arc<DeviceSchema> {
        Arc::new(
            DeviceSchema::parse(&json!({
                "Monitoring": {
                    "type": "BINARY(BYTE)",
                    "protocol": [
                        { "startByte": 0, "length": 1, "value": "Operation" },
                        { "startByte": 1, "length": 1, "value": "OpMode" },
                        { "startByte": 2, "length": 1, "value": "TempCfg" },
                    ],
                },
                "Value": {
                    "Operation": {
                        "type": "Enum",
                        "option": {
                            "0": "@AC_MAIN_OPERATION_OFF_W",
                            "1": "@AC_MAIN_OPERATION_RIGHT_ON_W",
                        },
                    },
                    "TempCfg": { "type": "Range", "option": { "min": 16, "max": 30, "step": 1 } },
                },
                "ControlWifi": {
                    "type": "BINARY(BYTE)",
                    "action": {
                        "SetControl": { "data": "[{{Operation}},{{OpMode}},{{TempCfg}}]" }
                    },
                },
            }))
            .unwrap(),
        )
    }

    fn seeded_store(device_id: &str, schema: &DeviceSchema) -> SharedStore {
        let mut store = SnapshotStore::new();
        let raw = schema.decode_monitor(&RawPayload::Binary(vec![0, 4, 22]));
        store.merge_update(device_id, &json!({}), Some(raw), Some(true));
        Arc::new(Mutex::new(store))
    }

    #[tokio::test]
    async fn gen1_set_active_resends_full_packed_state() {
        let schema = ac_schema();
        let cloud = Arc::new(CaptureCloud::default());
        let store = seeded_store("D1", &schema);

        let control = control_for(
            "D1",
            DeviceType::AirConditioner,
            ProtocolGeneration::Gen1,
            schema,
            Arc::clone(&cloud) as Arc<dyn CloudApi>,
            store,
        )
        .unwrap();

        control.set_active(true).await.unwrap();

        let sent = cloud.sent.lock().unwrap();
        // Power flips to 1; OpMode and TempCfg ride along unchanged.
        assert_eq!(sent[0], ControlPayload::Packed(vec![1, 4, 22]));
    }

    #[tokio::test]
    async fn gen2_set_field_sends_structured_assignment() {
        let schema = ac_schema();
        let cloud = Arc::new(CaptureCloud::default());
        let store = Arc::new(Mutex::new(SnapshotStore::new()));

        let control = control_for(
            "D2",
            DeviceType::AirConditioner,
            ProtocolGeneration::Gen2,
            schema,
            Arc::clone(&cloud) as Arc<dyn CloudApi>,
            store,
        )
        .unwrap();

        control.set_field("airState.opMode", json!(4)).await.unwrap();

        let sent = cloud.sent.lock().unwrap();
        let ControlPayload::Fields(fields) = &sent[0] else {
            panic!("expected structured payload");
        };
        assert_eq!(fields["airState.opMode"], json!(4));
    }

    #[tokio::test]
    async fn duplicate_value_is_success() {
        let schema = ac_schema();
        let cloud = Arc::new(CaptureCloud {
            duplicate: true,
            ..CaptureCloud::default()
        });
        let store = seeded_store("D1", &schema);

        let control = control_for(
            "D1",
            DeviceType::AirConditioner,
            ProtocolGeneration::Gen1,
            schema,
            Arc::clone(&cloud) as Arc<dyn CloudApi>,
            store,
        )
        .unwrap();

        control.set_active(false).await.unwrap();
    }

    #[tokio::test]
    async fn out_of_range_temperature_is_rejected_locally() {
        let schema = ac_schema();
        let cloud = Arc::new(CaptureCloud::default());
        let store = seeded_store("D1", &schema);

        let control = control_for(
            "D1",
            DeviceType::AirConditioner,
            ProtocolGeneration::Gen1,
            schema,
            Arc::clone(&cloud) as Arc<dyn CloudApi>,
            store,
        )
        .unwrap();

        let err = control.set_target_temperature(99.0).await.unwrap_err();
        assert!(matches!(err, CoreError::ControlRejected { .. }));
        assert!(cloud.sent.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn missing_power_label_is_schema_mismatch() {
        // Schema without the expected power labels.
        let schema = Arc::new(
            DeviceSchema::parse(&json!({
                "Value": { "Operation": { "type": "Enum", "option": { "0": "@SOMETHING_ELSE" } } }
            }))
            .unwrap(),
        );
        let cloud = Arc::new(CaptureCloud::default());
        let store = Arc::new(Mutex::new(SnapshotStore::new()));

        let control = control_for(
            "D1",
            DeviceType::AirConditioner,
            ProtocolGeneration::Gen1,
            schema,
            Arc::clone(&cloud) as Arc<dyn CloudApi>,
            store,
        )
        .unwrap();

        let err = control.set_active(true).await.unwrap_err();
        assert!(matches!(err, CoreError::SchemaMismatch { .. }));
        assert!(cloud.sent.lock().unwrap().is_empty());
    }

    #[test]
    fn factory_rejects_unsupported_pairs() {
        let schema = ac_schema();
        let cloud = Arc::new(CaptureCloud::default());
        let store = Arc::new(Mutex::new(SnapshotStore::new()));

        assert!(control_for(
            "D1",
            DeviceType::Dishwasher,
            ProtocolGeneration::Gen1,
            schema,
            cloud as Arc<dyn CloudApi>,
            store,
        )
        .is_none());
    }
}
