// ── Core error types ──
//
// User-facing errors from homesync-core. These are NOT API-specific --
// consumers never see HTTP detail or envelope codes directly. The
// `From<homesync_api::Error>` impl translates transport-layer errors
// into domain-appropriate variants.

use thiserror::Error;

/// Unified error type for the core crate.
#[derive(Debug, Error)]
pub enum CoreError {
    // ── Schema / codec errors ────────────────────────────────────────
    /// A field's value does not fit its declared schema domain
    /// (unknown enum label, out-of-table code). Recoverable: the
    /// offending field is skipped, the rest of the payload stands.
    #[error("Schema mismatch for field {field} on device {device_id}")]
    SchemaMismatch { device_id: String, field: String },

    /// The schema document itself could not be interpreted.
    #[error("Invalid device schema: {message}")]
    SchemaInvalid { message: String },

    // ── Device lifecycle ─────────────────────────────────────────────
    #[error("Device not registered: {device_id}")]
    DeviceNotFound { device_id: String },

    #[error("Unsupported device type: {device_type} ({generation})")]
    UnsupportedDevice {
        device_type: String,
        generation: String,
    },

    // ── Scheduling ───────────────────────────────────────────────────
    /// The cloud revoked programmatic polling; the shared legacy
    /// polling loop is permanently stopped.
    #[error("Legacy polling stopped by cloud request: {message}")]
    PollingStopped { message: String },

    /// The scheduler has been shut down.
    #[error("Scheduler stopped")]
    SchedulerStopped,

    /// The push channel could not be started within its bounded
    /// retry budget. Terminal for this startup attempt.
    #[error("Push channel startup failed after {attempts} attempts")]
    PushStartupFailed { attempts: u32 },

    // ── Control ──────────────────────────────────────────────────────
    #[error("Control command rejected: {message}")]
    ControlRejected { message: String },

    // ── API errors (wrapped, not exposed raw) ────────────────────────
    #[error("Cloud API error: {message}")]
    Cloud { message: String },
}

// ── Conversion from transport-layer errors ───────────────────────────

impl From<homesync_api::Error> for CoreError {
    fn from(err: homesync_api::Error) -> Self {
        match err {
            homesync_api::Error::ProtocolStopRequested { message } => {
                CoreError::PollingStopped { message }
            }
            homesync_api::Error::PushStartupExhausted { attempts } => {
                CoreError::PushStartupFailed { attempts }
            }
            other => CoreError::Cloud {
                message: other.to_string(),
            },
        }
    }
}
