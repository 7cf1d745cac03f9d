//! The narrow interface to the vendor cloud.
//!
//! Everything the sync engine needs from the cloud goes through
//! [`CloudApi`]. Transport, OAuth, and session bootstrapping live behind
//! the implementation ([`HttpCloudClient`](crate::http::HttpCloudClient)
//! in production, hand-rolled mocks in tests).

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use url::Url;

use crate::error::Error;

// ── Session commands ─────────────────────────────────────────────────

/// Monitor session lifecycle operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SessionOp {
    Start,
    Stop,
}

impl SessionOp {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Start => "Start",
            Self::Stop => "Stop",
        }
    }
}

/// Acknowledgement for a session-start command.
///
/// `work_id` is absent when the device did not answer the registration
/// (presumed offline) -- that is not an error.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct SessionAck {
    #[serde(rename = "workId")]
    pub work_id: Option<String>,
}

// ── Payloads ─────────────────────────────────────────────────────────

/// One encoded device snapshot as fetched from a monitor session or
/// received over the push channel.
#[derive(Debug, Clone, PartialEq)]
pub enum RawPayload {
    /// Packed byte array (Gen1 binary monitor format).
    Binary(Vec<u8>),
    /// Already-keyed JSON object.
    Structured(serde_json::Value),
}

/// Control command body, shaped by the device's wire format.
#[derive(Debug, Clone, PartialEq)]
pub enum ControlPayload {
    /// Named field assignments (structured control path).
    Fields(serde_json::Map<String, serde_json::Value>),
    /// Complete packed state re-encode (binary control path). The wire
    /// format has no addressable sub-fields, so this always carries the
    /// full byte array.
    Packed(Vec<u8>),
}

// ── Push provisioning ────────────────────────────────────────────────

/// Resolved broker endpoint for the push channel.
#[derive(Debug, Clone, Deserialize)]
pub struct BrokerRoute {
    #[serde(rename = "mqttServer")]
    pub mqtt_server: Url,
}

/// Result of exchanging a certificate request with the cloud.
#[derive(Debug, Clone, Deserialize)]
pub struct CertificateGrant {
    #[serde(rename = "certificatePem")]
    pub certificate_pem: String,
    #[serde(rename = "subscriptions", default)]
    pub subscription_topics: Vec<String>,
}

// ── The collaborator interface ───────────────────────────────────────

/// Commands the sync engine issues against the vendor cloud.
///
/// One implementation per transport; the engine holds it as
/// `Arc<dyn CloudApi>` and never sees HTTP below this line.
#[async_trait]
pub trait CloudApi: Send + Sync {
    /// List every device the account knows, as loosely-typed entries.
    ///
    /// Entries carry identity, protocol generation, the schema URI, and
    /// (for push-generation devices) a cloud-side snapshot used by the
    /// coarse refresh sweep.
    async fn list_devices(&self) -> Result<Vec<serde_json::Value>, Error>;

    /// Start or stop a monitor session for one device.
    ///
    /// `request_token` is a fresh idempotent token minted by the caller
    /// for each attempt.
    async fn send_session_command(
        &self,
        device_id: &str,
        op: SessionOp,
        request_token: &str,
    ) -> Result<SessionAck, Error>;

    /// Fetch one encoded snapshot from an active monitor session.
    ///
    /// Fails with [`Error::SessionInvalid`] when the work id has
    /// expired and [`Error::DeviceOffline`] when the device is not
    /// reachable.
    async fn fetch_session_result(
        &self,
        device_id: &str,
        work_id: &str,
    ) -> Result<RawPayload, Error>;

    /// Fetch the device-model schema document at `uri`.
    ///
    /// Returned as raw JSON; `homesync-core` owns the typed parse.
    async fn fetch_device_schema(&self, uri: &Url) -> Result<serde_json::Value, Error>;

    /// Send a control command to one device.
    ///
    /// Fails with [`Error::DuplicateValue`] when the submitted value
    /// equals the current one; callers treat that as success.
    async fn send_control_command(
        &self,
        device_id: &str,
        payload: ControlPayload,
    ) -> Result<(), Error>;

    /// Resolve the push broker endpoint. Called once per connection
    /// attempt.
    async fn resolve_broker_route(&self) -> Result<BrokerRoute, Error>;

    /// Register this client identity with the cloud. Idempotent;
    /// required before a certificate exchange.
    async fn register_client_identity(&self) -> Result<(), Error>;

    /// Exchange a PKCS#10 certificate request for a signed client
    /// certificate and the topics it grants.
    async fn exchange_certificate(&self, csr_pem: &str) -> Result<CertificateGrant, Error>;

    /// Stable client identifier used for MQTT connections.
    fn client_id(&self) -> &str;
}
