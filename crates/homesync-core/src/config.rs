// ── Runtime scheduling configuration ──
//
// Tuning knobs for the sync engine. Plain data, built by the embedding
// process and handed in -- core never reads config files.

use std::time::Duration;

use homesync_api::PushConfig;

/// Configuration for one scheduler instance.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Shared poll period for all legacy-protocol devices.
    pub poll_interval: Duration,

    /// Coarse full-refresh sweep period for push-protocol devices.
    pub sweep_interval: Duration,

    /// Per-device staleness window for push-protocol devices. A device
    /// that stays silent this long gets a one-shot re-emission of its
    /// last sweep-derived snapshot.
    pub stale_window: Duration,

    /// Push channel retry/connection tuning.
    pub push: PushConfig,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(60),
            sweep_interval: Duration::from_secs(600),
            stale_window: Duration::from_secs(300),
            push: PushConfig::default(),
        }
    }
}
