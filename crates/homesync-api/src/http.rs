// HTTP implementation of the CloudApi collaborator.
//
// Wraps `reqwest::Client` with vendor-specific URL construction and
// envelope unwrapping. The two protocol generations answer in different
// envelopes: Gen1 endpoints wrap everything in `lgedmRoot` with a
// `returnCd` result code, Gen2 endpoints answer `{resultCode, result}`.
// Both are stripped here -- callers only ever see typed payloads or
// typed errors.
//
// OAuth and session bootstrapping are NOT handled here: the client is
// built from transport settings plus pre-authenticated default headers
// supplied by the embedding process.

use async_trait::async_trait;
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use serde::de::DeserializeOwned;
use serde_json::{Value, json};
use tracing::debug;
use url::Url;
use uuid::Uuid;

use crate::cloud::{
    BrokerRoute, CertificateGrant, CloudApi, ControlPayload, RawPayload, SessionAck, SessionOp,
};
use crate::error::Error;
use crate::transport::TransportConfig;

// Vendor result codes shared by both envelope shapes.
const CODE_OK: &str = "0000";
const CODE_DEVICE_OFFLINE: &str = "0106";
const CODE_SESSION_INVALID: &str = "0010";
const CODE_STOP_REQUESTED: &str = "0110";
const CODE_DUPLICATE_VALUE: &str = "0103";

/// Map a vendor result code to a typed error, or `None` for success.
///
/// Table-driven so the wire-code policy lives in exactly one place.
fn classify_result_code(code: &str, device_id: &str, message: &str) -> Option<Error> {
    match code {
        CODE_OK => None,
        CODE_DEVICE_OFFLINE => Some(Error::DeviceOffline {
            device_id: device_id.to_owned(),
        }),
        CODE_SESSION_INVALID => Some(Error::SessionInvalid {
            device_id: device_id.to_owned(),
        }),
        CODE_STOP_REQUESTED => Some(Error::ProtocolStopRequested {
            message: message.to_owned(),
        }),
        CODE_DUPLICATE_VALUE => Some(Error::DuplicateValue),
        other => Some(Error::CloudApi {
            code: other.to_owned(),
            message: message.to_owned(),
        }),
    }
}

/// Production [`CloudApi`] implementation over HTTPS.
pub struct HttpCloudClient {
    http: reqwest::Client,
    /// Base for Gen1 `rti/*` endpoints.
    gen1_base: Url,
    /// Base for Gen2 `service/*` endpoints.
    gen2_base: Url,
    /// Broker route discovery endpoint (not under either base).
    route_url: Url,
    client_id: String,
}

impl HttpCloudClient {
    /// Create a client from transport settings.
    ///
    /// `headers` must carry the authenticated vendor headers (API key,
    /// access token) -- this crate never mints them.
    pub fn new(
        gen1_base: Url,
        gen2_base: Url,
        route_url: Url,
        client_id: String,
        transport: &TransportConfig,
        headers: reqwest::header::HeaderMap,
    ) -> Result<Self, Error> {
        let http = transport.build_client_with_headers(headers)?;
        Ok(Self {
            http,
            gen1_base,
            gen2_base,
            route_url,
            client_id,
        })
    }

    /// Create a client with a pre-built `reqwest::Client`.
    ///
    /// Use this when the embedding process already owns an authenticated
    /// client (and in tests, against a mock server).
    pub fn with_client(
        http: reqwest::Client,
        gen1_base: Url,
        gen2_base: Url,
        route_url: Url,
        client_id: String,
    ) -> Self {
        Self {
            http,
            gen1_base,
            gen2_base,
            route_url,
            client_id,
        }
    }

    // ── URL builders ─────────────────────────────────────────────────

    fn gen1_url(&self, path: &str) -> Result<Url, Error> {
        Ok(self.gen1_base.join(path)?)
    }

    fn gen2_url(&self, path: &str) -> Result<Url, Error> {
        Ok(self.gen2_base.join(path)?)
    }

    // ── Envelope helpers ─────────────────────────────────────────────

    /// POST a Gen1 request and unwrap the `lgedmRoot` envelope.
    async fn post_gen1(&self, url: Url, body: Value, device_id: &str) -> Result<Value, Error> {
        debug!("POST {url}");

        let resp = self
            .http
            .post(url)
            .json(&json!({ "lgedmRoot": body }))
            .send()
            .await
            .map_err(Error::Transport)?;

        let text = resp.text().await.map_err(Error::Transport)?;
        let root: Value = serde_json::from_str(&text).map_err(|e| Error::Deserialization {
            message: e.to_string(),
            body: text.clone(),
        })?;

        let inner = root
            .get("lgedmRoot")
            .cloned()
            .ok_or_else(|| Error::Deserialization {
                message: "missing lgedmRoot envelope".into(),
                body: text,
            })?;

        let code = inner
            .get("returnCd")
            .and_then(Value::as_str)
            .unwrap_or(CODE_OK);
        let message = inner
            .get("returnMsg")
            .and_then(Value::as_str)
            .unwrap_or_default();

        match classify_result_code(code, device_id, message) {
            Some(err) => Err(err),
            None => Ok(inner),
        }
    }

    /// GET or POST a Gen2 request and unwrap the `{resultCode, result}`
    /// envelope.
    async fn post_gen2<T: DeserializeOwned>(
        &self,
        url: Url,
        body: Value,
        device_id: &str,
    ) -> Result<T, Error> {
        debug!("POST {url}");

        let resp = self
            .http
            .post(url)
            .json(&body)
            .send()
            .await
            .map_err(Error::Transport)?;

        Self::parse_gen2_envelope(resp, device_id).await
    }

    async fn get_gen2<T: DeserializeOwned>(&self, url: Url, device_id: &str) -> Result<T, Error> {
        debug!("GET {url}");

        let resp = self.http.get(url).send().await.map_err(Error::Transport)?;
        Self::parse_gen2_envelope(resp, device_id).await
    }

    async fn parse_gen2_envelope<T: DeserializeOwned>(
        resp: reqwest::Response,
        device_id: &str,
    ) -> Result<T, Error> {
        let text = resp.text().await.map_err(Error::Transport)?;
        let root: Value = serde_json::from_str(&text).map_err(|e| Error::Deserialization {
            message: e.to_string(),
            body: text.clone(),
        })?;

        let code = root
            .get("resultCode")
            .and_then(Value::as_str)
            .unwrap_or(CODE_OK);
        if let Some(err) = classify_result_code(code, device_id, "") {
            return Err(err);
        }

        let result = root.get("result").cloned().unwrap_or(Value::Null);
        serde_json::from_value(result).map_err(|e| Error::Deserialization {
            message: e.to_string(),
            body: text,
        })
    }

    /// Decode one monitor work result into a raw payload.
    ///
    /// `format` selects the transport encoding: `"B64"` wraps the packed
    /// byte array, `"JSON"` carries an already-keyed object.
    fn decode_work_result(work: &Value, device_id: &str) -> Result<RawPayload, Error> {
        let code = work
            .get("returnCode")
            .and_then(Value::as_str)
            .ok_or_else(|| Error::SessionInvalid {
                device_id: device_id.to_owned(),
            })?;
        if let Some(err) = classify_result_code(code, device_id, "") {
            return Err(err);
        }

        // A successful cycle with no data means the device went quiet.
        let Some(data) = work.get("returnData").and_then(Value::as_str) else {
            return Err(Error::DeviceOffline {
                device_id: device_id.to_owned(),
            });
        };

        match work.get("format").and_then(Value::as_str) {
            Some("JSON") => {
                let decoded = BASE64.decode(data).map_err(|e| Error::Deserialization {
                    message: format!("invalid base64 monitor data: {e}"),
                    body: data.to_owned(),
                })?;
                let value = serde_json::from_slice(&decoded).map_err(|e| Error::Deserialization {
                    message: e.to_string(),
                    body: String::from_utf8_lossy(&decoded).into_owned(),
                })?;
                Ok(RawPayload::Structured(value))
            }
            // "B64" and anything unstated: packed bytes.
            _ => {
                let decoded = BASE64.decode(data).map_err(|e| Error::Deserialization {
                    message: format!("invalid base64 monitor data: {e}"),
                    body: data.to_owned(),
                })?;
                Ok(RawPayload::Binary(decoded))
            }
        }
    }
}

#[async_trait]
impl CloudApi for HttpCloudClient {
    async fn list_devices(&self) -> Result<Vec<Value>, Error> {
        let url = self.gen2_url("service/application/dashboard")?;
        let result: Value = self.get_gen2(url, "").await?;

        // The dashboard nests devices under `item`; older deployments
        // answer a bare array.
        let items = result
            .get("item")
            .cloned()
            .unwrap_or(result);
        match items {
            Value::Array(entries) => Ok(entries),
            Value::Null => Ok(Vec::new()),
            other => Err(Error::Deserialization {
                message: "device listing is not an array".into(),
                body: other.to_string(),
            }),
        }
    }

    async fn send_session_command(
        &self,
        device_id: &str,
        op: SessionOp,
        request_token: &str,
    ) -> Result<SessionAck, Error> {
        let url = self.gen1_url("rti/rtiMon")?;
        let body = json!({
            "cmd": "Mon",
            "cmdOpt": op.as_str(),
            "deviceId": device_id,
            "workId": request_token,
        });

        let inner = self.post_gen1(url, body, device_id).await?;
        let work_id = inner
            .get("workId")
            .and_then(Value::as_str)
            .map(str::to_owned);
        Ok(SessionAck { work_id })
    }

    async fn fetch_session_result(
        &self,
        device_id: &str,
        work_id: &str,
    ) -> Result<RawPayload, Error> {
        let url = self.gen1_url("rti/rtiResult")?;
        let body = json!({
            "workList": [{ "deviceId": device_id, "workId": work_id }],
        });

        let inner = self.post_gen1(url, body, device_id).await?;

        // The cloud answers one work entry per requested session; a
        // missing entry means the work id is no longer known.
        let work = match inner.get("workList") {
            Some(Value::Array(list)) => list.first().cloned(),
            Some(single @ Value::Object(_)) => Some(single.clone()),
            _ => None,
        }
        .ok_or_else(|| Error::SessionInvalid {
            device_id: device_id.to_owned(),
        })?;

        Self::decode_work_result(&work, device_id)
    }

    async fn fetch_device_schema(&self, uri: &Url) -> Result<Value, Error> {
        debug!("GET {uri}");

        let resp = self
            .http
            .get(uri.clone())
            .send()
            .await
            .map_err(Error::Transport)?;
        let text = resp.text().await.map_err(Error::Transport)?;
        serde_json::from_str(&text).map_err(|e| Error::Deserialization {
            message: e.to_string(),
            body: text,
        })
    }

    async fn send_control_command(
        &self,
        device_id: &str,
        payload: ControlPayload,
    ) -> Result<(), Error> {
        match payload {
            ControlPayload::Packed(bytes) => {
                // Binary control rides the Gen1 endpoint with the full
                // packed state, base64-wrapped for transport.
                let url = self.gen1_url("rti/rtiControl")?;
                let body = json!({
                    "cmd": "Control",
                    "cmdOpt": "Set",
                    "deviceId": device_id,
                    "workId": Uuid::new_v4().to_string(),
                    "value": "ControlData",
                    "data": BASE64.encode(bytes),
                    "format": "B64",
                });
                self.post_gen1(url, body, device_id).await.map(|_| ())
            }
            ControlPayload::Fields(fields) => {
                let url = self.gen2_url(&format!("service/devices/{device_id}/control-sync"))?;
                let body = json!({
                    "ctrlKey": "basicCtrl",
                    "command": "Set",
                    "dataValue": fields,
                });
                self.post_gen2::<Value>(url, body, device_id)
                    .await
                    .map(|_| ())
            }
        }
    }

    async fn resolve_broker_route(&self) -> Result<BrokerRoute, Error> {
        self.get_gen2(self.route_url.clone(), "")
            .await
            .map_err(|e| match e {
                err @ (Error::Transport(_) | Error::Deserialization { .. }) => {
                    Error::RouteDiscovery(err.to_string())
                }
                other => other,
            })
    }

    async fn register_client_identity(&self) -> Result<(), Error> {
        let url = self.gen2_url("service/users/client")?;
        self.post_gen2::<Value>(url, json!({}), "")
            .await
            .map(|_| ())
            .map_err(|e| Error::CredentialProvisioning(e.to_string()))
    }

    async fn exchange_certificate(&self, csr_pem: &str) -> Result<CertificateGrant, Error> {
        let url = self.gen2_url("service/users/client/certificate")?;
        let body = json!({ "csr": crate::credential::csr_body(csr_pem) });
        self.post_gen2(url, body, "")
            .await
            .map_err(|e| Error::CredentialProvisioning(e.to_string()))
    }

    fn client_id(&self) -> &str {
        &self.client_id
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn classify_ok_is_none() {
        assert!(classify_result_code("0000", "d1", "").is_none());
    }

    #[test]
    fn classify_offline() {
        let err = classify_result_code("0106", "d1", "").unwrap();
        assert!(err.is_device_offline());
    }

    #[test]
    fn classify_session_invalid() {
        let err = classify_result_code("0010", "d1", "").unwrap();
        assert!(err.is_session_invalid());
    }

    #[test]
    fn classify_stop_requested() {
        let err = classify_result_code("0110", "d1", "manual process needed").unwrap();
        assert!(err.is_stop_requested());
    }

    #[test]
    fn classify_duplicate_value() {
        let err = classify_result_code("0103", "d1", "").unwrap();
        assert!(err.is_duplicate_value());
    }

    #[test]
    fn classify_unknown_is_cloud_api() {
        let err = classify_result_code("9999", "d1", "boom").unwrap();
        assert!(matches!(err, Error::CloudApi { code, .. } if code == "9999"));
    }

    #[test]
    fn decode_work_result_binary() {
        let work = json!({
            "returnCode": "0000",
            "format": "B64",
            "returnData": BASE64.encode([1u8, 2, 3]),
        });
        let payload = HttpCloudClient::decode_work_result(&work, "d1").unwrap();
        assert_eq!(payload, RawPayload::Binary(vec![1, 2, 3]));
    }

    #[test]
    fn decode_work_result_structured() {
        let work = json!({
            "returnCode": "0000",
            "format": "JSON",
            "returnData": BASE64.encode(br#"{"OpMode":"4"}"#),
        });
        let payload = HttpCloudClient::decode_work_result(&work, "d1").unwrap();
        assert_eq!(
            payload,
            RawPayload::Structured(json!({ "OpMode": "4" }))
        );
    }

    #[test]
    fn decode_work_result_without_data_is_offline() {
        let work = json!({ "returnCode": "0000" });
        let err = HttpCloudClient::decode_work_result(&work, "d1").unwrap_err();
        assert!(err.is_device_offline());
    }

    #[test]
    fn decode_work_result_without_code_is_session_invalid() {
        let work = json!({ "returnData": "xx" });
        let err = HttpCloudClient::decode_work_result(&work, "d1").unwrap_err();
        assert!(err.is_session_invalid());
    }
}
