use thiserror::Error;

/// Top-level error type for the `homesync-api` crate.
///
/// Covers every failure mode across both protocol generations:
/// monitor sessions, control commands, schema fetches, and the push
/// channel. `homesync-core` maps these into scheduling decisions --
/// which conditions retry, which suppress, which stop the loop.
#[derive(Debug, Error)]
pub enum Error {
    // ── Monitor sessions (Gen1) ─────────────────────────────────────
    /// The session token is no longer valid on the cloud side.
    /// Recoverable: tear the session down, re-register, retry once.
    #[error("Monitor session invalid for device {device_id}")]
    SessionInvalid { device_id: String },

    /// The device is not reachable from the cloud. Expected during
    /// normal operation -- callers must not treat this as an error.
    #[error("Device {device_id} is offline")]
    DeviceOffline { device_id: String },

    /// The cloud revoked programmatic polling account-wide ("manual
    /// process needed"). Fatal for the entire legacy polling loop.
    #[error("Cloud requested polling stop: {message}")]
    ProtocolStopRequested { message: String },

    // ── Control commands ────────────────────────────────────────────
    /// The submitted value equals the device's current value.
    /// Treated as a successful no-op by callers.
    #[error("Control value already set")]
    DuplicateValue,

    // ── Push channel (Gen2) ─────────────────────────────────────────
    /// Broker route discovery failed.
    #[error("Broker route discovery failed: {0}")]
    RouteDiscovery(String),

    /// Client identity registration or certificate exchange failed.
    #[error("Credential provisioning failed: {0}")]
    CredentialProvisioning(String),

    /// MQTT connect or subscribe failed.
    #[error("Push channel connect failed: {0}")]
    PushConnect(String),

    /// All bounded startup attempts for the push channel failed.
    /// Terminal for this startup -- the caller must restart the channel.
    #[error("Push channel startup failed after {attempts} attempts")]
    PushStartupExhausted { attempts: u32 },

    // ── Transport ───────────────────────────────────────────────────
    /// HTTP transport error (connection refused, DNS failure, etc.)
    #[error("HTTP transport error: {0}")]
    Transport(#[from] reqwest::Error),

    /// URL parsing error.
    #[error("Invalid URL: {0}")]
    InvalidUrl(#[from] url::ParseError),

    /// TLS material or handshake error.
    #[error("TLS error: {0}")]
    Tls(String),

    // ── Data ────────────────────────────────────────────────────────
    /// JSON deserialization failed, with the raw body for debugging.
    #[error("Deserialization error: {message}")]
    Deserialization { message: String, body: String },

    /// Structured error from the cloud API envelope.
    #[error("Cloud API error (code {code}): {message}")]
    CloudApi { code: String, message: String },
}

impl Error {
    /// Returns `true` if this is the recoverable session-expiry
    /// condition (re-register + retry-once applies).
    pub fn is_session_invalid(&self) -> bool {
        matches!(self, Self::SessionInvalid { .. })
    }

    /// Returns `true` if the device is merely offline -- expected,
    /// never logged at error level, never changes session state.
    pub fn is_device_offline(&self) -> bool {
        matches!(self, Self::DeviceOffline { .. })
    }

    /// Returns `true` if the cloud revoked programmatic polling.
    pub fn is_stop_requested(&self) -> bool {
        matches!(self, Self::ProtocolStopRequested { .. })
    }

    /// Returns `true` if the command was a same-value no-op.
    pub fn is_duplicate_value(&self) -> bool {
        matches!(self, Self::DuplicateValue)
    }

    /// Returns `true` if this is a transient push-channel fault worth
    /// retrying on the bounded startup path.
    pub fn is_push_transient(&self) -> bool {
        match self {
            Self::RouteDiscovery(_) | Self::CredentialProvisioning(_) | Self::PushConnect(_) => {
                true
            }
            Self::Transport(e) => e.is_timeout() || e.is_connect(),
            _ => false,
        }
    }
}
