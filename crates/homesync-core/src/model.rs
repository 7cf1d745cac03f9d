// ── Device domain types ──

use serde::{Deserialize, Serialize};
use url::Url;

use crate::error::CoreError;

/// Vendor protocol generation a device speaks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ProtocolGeneration {
    /// Legacy polling-based monitor protocol.
    #[serde(rename = "thinq1")]
    Gen1,
    /// Push-based (certificate-provisioned MQTT) protocol.
    #[serde(rename = "thinq2")]
    Gen2,
}

impl std::fmt::Display for ProtocolGeneration {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Gen1 => f.write_str("gen1"),
            Self::Gen2 => f.write_str("gen2"),
        }
    }
}

/// Appliance category, by vendor numeric code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[non_exhaustive]
pub enum DeviceType {
    Refrigerator,
    Washer,
    Dryer,
    Dishwasher,
    AirConditioner,
    AirPurifier,
    Dehumidifier,
    /// Known to the cloud but not handled by this engine.
    Other(u32),
}

impl DeviceType {
    /// Map the vendor's numeric device-type code.
    pub fn from_code(code: u32) -> Self {
        match code {
            101 => Self::Refrigerator,
            201 | 221 | 222 => Self::Washer,
            202 => Self::Dryer,
            204 => Self::Dishwasher,
            401 => Self::AirConditioner,
            402 => Self::AirPurifier,
            403 => Self::Dehumidifier,
            other => Self::Other(other),
        }
    }
}

impl std::fmt::Display for DeviceType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Refrigerator => f.write_str("refrigerator"),
            Self::Washer => f.write_str("washer"),
            Self::Dryer => f.write_str("dryer"),
            Self::Dishwasher => f.write_str("dishwasher"),
            Self::AirConditioner => f.write_str("air-conditioner"),
            Self::AirPurifier => f.write_str("air-purifier"),
            Self::Dehumidifier => f.write_str("dehumidifier"),
            Self::Other(code) => write!(f, "other({code})"),
        }
    }
}

/// One appliance as known to the scheduler.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceInfo {
    pub id: String,
    pub alias: String,
    pub device_type: DeviceType,
    pub generation: ProtocolGeneration,
    /// Where the device-model schema document lives.
    pub schema_uri: Url,
    /// Last cloud-reported reachability.
    pub online: bool,
}

impl DeviceInfo {
    /// Build a `DeviceInfo` from one entry of the cloud device listing.
    ///
    /// The listing is loosely typed; anything without the fields we
    /// need is rejected here rather than half-registered.
    pub fn from_listing(entry: &serde_json::Value) -> Result<Self, CoreError> {
        let id = entry
            .get("deviceId")
            .and_then(serde_json::Value::as_str)
            .ok_or_else(|| CoreError::SchemaInvalid {
                message: "device listing entry without deviceId".into(),
            })?;
        let alias = entry
            .get("alias")
            .and_then(serde_json::Value::as_str)
            .unwrap_or(id);
        let type_code = entry
            .get("deviceType")
            .and_then(serde_json::Value::as_u64)
            .ok_or_else(|| CoreError::SchemaInvalid {
                message: format!("device {id} listed without deviceType"),
            })?;
        let generation = match entry.get("platformType").and_then(serde_json::Value::as_str) {
            Some("thinq1") => ProtocolGeneration::Gen1,
            Some("thinq2") => ProtocolGeneration::Gen2,
            other => {
                return Err(CoreError::SchemaInvalid {
                    message: format!("device {id} has unknown platformType {other:?}"),
                });
            }
        };
        let schema_uri = entry
            .get("modelJsonUri")
            .and_then(serde_json::Value::as_str)
            .ok_or_else(|| CoreError::SchemaInvalid {
                message: format!("device {id} listed without modelJsonUri"),
            })?
            .parse()
            .map_err(|e| CoreError::SchemaInvalid {
                message: format!("device {id} has invalid modelJsonUri: {e}"),
            })?;
        let online = entry
            .get("online")
            .and_then(serde_json::Value::as_bool)
            .unwrap_or(false);

        #[allow(clippy::cast_possible_truncation)]
        let device_type = DeviceType::from_code(type_code as u32);

        Ok(Self {
            id: id.to_owned(),
            alias: alias.to_owned(),
            device_type,
            generation,
            schema_uri,
            online,
        })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn from_listing_maps_fields() {
        let entry = json!({
            "deviceId": "D1",
            "alias": "Kitchen Fridge",
            "deviceType": 101,
            "platformType": "thinq1",
            "modelJsonUri": "https://cloud.example/models/fridge.json",
            "online": true,
        });

        let info = DeviceInfo::from_listing(&entry).unwrap();
        assert_eq!(info.id, "D1");
        assert_eq!(info.alias, "Kitchen Fridge");
        assert_eq!(info.device_type, DeviceType::Refrigerator);
        assert_eq!(info.generation, ProtocolGeneration::Gen1);
        assert!(info.online);
    }

    #[test]
    fn from_listing_rejects_missing_device_id() {
        let entry = json!({ "deviceType": 101, "platformType": "thinq1" });
        assert!(DeviceInfo::from_listing(&entry).is_err());
    }

    #[test]
    fn from_listing_defaults_alias_to_id() {
        let entry = json!({
            "deviceId": "D2",
            "deviceType": 401,
            "platformType": "thinq2",
            "modelJsonUri": "https://cloud.example/models/ac.json",
        });

        let info = DeviceInfo::from_listing(&entry).unwrap();
        assert_eq!(info.alias, "D2");
        assert_eq!(info.device_type, DeviceType::AirConditioner);
        assert!(!info.online);
    }

    #[test]
    fn device_type_codes() {
        assert_eq!(DeviceType::from_code(221), DeviceType::Washer);
        assert_eq!(DeviceType::from_code(9000), DeviceType::Other(9000));
    }
}
