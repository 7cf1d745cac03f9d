//! Legacy (Gen1) monitor session state machine.
//!
//! One `WorkSession` per legacy device, owned by the scheduler and only
//! ever touched from its sequential callbacks -- that discipline, not a
//! lock, is what guarantees at most one live work id per device.
//!
//! The poll path embeds the protocol's recovery policy:
//! - session invalid → tear down, re-register, retry the fetch exactly
//!   once; a second failure yields "no data" for this cycle.
//! - device offline → "no data", silently; this is routine and is
//!   never logged at error level and never changes session state.
//! - anything else propagates to the caller unchanged.

use tracing::{debug, trace};
use uuid::Uuid;

use homesync_api::{CloudApi, Error as ApiError, RawPayload, SessionOp};

/// Monitor session for one legacy-protocol device.
#[derive(Debug)]
pub struct WorkSession {
    device_id: String,
    work_id: Option<String>,
    last_error: Option<String>,
}

impl WorkSession {
    pub fn new(device_id: impl Into<String>) -> Self {
        Self {
            device_id: device_id.into(),
            work_id: None,
            last_error: None,
        }
    }

    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    /// The live session token, if registered.
    pub fn work_id(&self) -> Option<&str> {
        self.work_id.as_deref()
    }

    pub fn is_active(&self) -> bool {
        self.work_id.is_some()
    }

    /// The last recoverable fault swallowed by a poll cycle, for
    /// observability.
    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    /// Register a session with a fresh idempotent request token.
    ///
    /// An ack without a work id means the device did not answer the
    /// registration -- presumed offline, session left unregistered,
    /// no error. Returns whether the session is now active.
    pub async fn register(&mut self, api: &dyn CloudApi) -> Result<bool, ApiError> {
        let token = Uuid::new_v4().to_string();
        let ack = api
            .send_session_command(&self.device_id, SessionOp::Start, &token)
            .await?;

        match ack.work_id {
            Some(work_id) => {
                trace!(device = %self.device_id, %work_id, "monitor session registered");
                self.work_id = Some(work_id);
                Ok(true)
            }
            None => {
                trace!(device = %self.device_id, "registration unanswered, device presumed offline");
                self.work_id = None;
                Ok(false)
            }
        }
    }

    /// Fetch one encoded snapshot, registering first if needed.
    ///
    /// `Ok(None)` means "no data this cycle" -- not an error.
    pub async fn poll(&mut self, api: &dyn CloudApi) -> Result<Option<RawPayload>, ApiError> {
        if self.work_id.is_none() && !self.register(api).await? {
            return Ok(None);
        }
        let Some(work_id) = self.work_id.clone() else {
            return Ok(None);
        };

        match api.fetch_session_result(&self.device_id, &work_id).await {
            Ok(payload) => {
                self.last_error = None;
                Ok(Some(payload))
            }
            Err(err) if err.is_device_offline() => {
                trace!(device = %self.device_id, "device offline, no data this cycle");
                Ok(None)
            }
            Err(err) if err.is_session_invalid() => self.reregister_and_retry(api).await,
            Err(err) => Err(err),
        }
    }

    /// The session-invalid recovery path: tear down, re-register, retry
    /// the fetch exactly once. A second failure of any recoverable kind
    /// yields no data rather than a third attempt.
    async fn reregister_and_retry(
        &mut self,
        api: &dyn CloudApi,
    ) -> Result<Option<RawPayload>, ApiError> {
        debug!(device = %self.device_id, "session invalid, re-registering");

        self.unregister(api).await;
        if !self.register(api).await? {
            return Ok(None);
        }
        let Some(work_id) = self.work_id.clone() else {
            return Ok(None);
        };

        match api.fetch_session_result(&self.device_id, &work_id).await {
            Ok(payload) => {
                self.last_error = None;
                Ok(Some(payload))
            }
            // Account-wide stop requests always surface, even mid-retry.
            Err(err) if err.is_stop_requested() => Err(err),
            Err(err) => {
                debug!(device = %self.device_id, error = %err, "retry failed, no data this cycle");
                self.last_error = Some(err.to_string());
                Ok(None)
            }
        }
    }

    /// Send a best-effort Stop and clear the token unconditionally.
    ///
    /// Failures are swallowed -- the session is being discarded
    /// regardless.
    pub async fn unregister(&mut self, api: &dyn CloudApi) {
        if let Some(work_id) = self.work_id.take() {
            if let Err(err) = api
                .send_session_command(&self.device_id, SessionOp::Stop, &work_id)
                .await
            {
                debug!(device = %self.device_id, error = %err, "session stop failed (discarding anyway)");
            }
        }
    }
}

// ── Tests ────────────────────────────────────────────────────────────
