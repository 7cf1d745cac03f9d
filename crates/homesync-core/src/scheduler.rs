// ── Scheduler ──
//
// The orchestrator: multiplexes many legacy-protocol monitor sessions
// (one shared poll timer) and one push channel (frames + per-device
// staleness timers + coarse refresh sweep) into a single change-event
// stream keyed by device identity.
//
// Concurrency model: every mutation of a device's session or snapshot
// happens inside one of the scheduler's own callbacks. Sessions are
// checked out of the map for the duration of an in-flight poll, so at
// most one operation per device runs at a time, while distinct devices
// overlap freely. The "at most one live work id per device" invariant
// falls out of that discipline -- no lock guards it.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use serde_json::Value;
use tokio::sync::{Mutex, broadcast, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use homesync_api::{CloudApi, PushChannel, PushFrame};

use crate::config::SyncConfig;
use crate::control::{ApplianceControl, SharedStore, control_for};
use crate::error::CoreError;
use crate::event::{ChangeEvent, UpdateSource};
use crate::model::{DeviceInfo, ProtocolGeneration};
use crate::schema::DeviceSchema;
use crate::session::WorkSession;
use crate::snapshot::{Snapshot, SnapshotStore};

const EVENT_CHANNEL_SIZE: usize = 256;

// ── Scheduler ────────────────────────────────────────────────────────

/// The main entry point for consumers.
///
/// Cheaply cloneable via `Arc<SchedulerInner>`. Owns every per-device
/// resource with explicit lifecycle: created on device registration,
/// destroyed on device removal.
#[derive(Clone)]
pub struct Scheduler {
    inner: Arc<SchedulerInner>,
}

struct RegisteredDevice {
    info: DeviceInfo,
    schema: Arc<DeviceSchema>,
    control: Option<Arc<dyn ApplianceControl>>,
}

struct SchedulerInner {
    api: Arc<dyn CloudApi>,
    config: SyncConfig,
    store: SharedStore,
    devices: Mutex<HashMap<String, RegisteredDevice>>,
    /// Checked out during an in-flight poll; absence means busy.
    sessions: Mutex<HashMap<String, WorkSession>>,
    /// Staleness-timer re-arm signals, push-generation devices only.
    rearm_txs: Mutex<HashMap<String, watch::Sender<()>>>,
    event_tx: broadcast::Sender<Arc<ChangeEvent>>,
    /// Set once the cloud revokes polling; never cleared.
    polling_stopped: AtomicBool,
    cancel: CancellationToken,
    task_handles: Mutex<Vec<JoinHandle<()>>>,
}

impl Scheduler {
    /// Create a scheduler. Does not contact the cloud -- register
    /// devices, then call [`start`](Self::start).
    pub fn new(api: Arc<dyn CloudApi>, config: SyncConfig) -> Self {
        let (event_tx, _) = broadcast::channel(EVENT_CHANNEL_SIZE);

        Self {
            inner: Arc::new(SchedulerInner {
                api,
                config,
                store: Arc::new(Mutex::new(SnapshotStore::new())),
                devices: Mutex::new(HashMap::new()),
                sessions: Mutex::new(HashMap::new()),
                rearm_txs: Mutex::new(HashMap::new()),
                event_tx,
                polling_stopped: AtomicBool::new(false),
                cancel: CancellationToken::new(),
                task_handles: Mutex::new(Vec::new()),
            }),
        }
    }

    // ── Device lifecycle ─────────────────────────────────────────

    /// Fetch and parse the cloud device listing.
    ///
    /// Entries that do not parse are skipped with a debug line; the
    /// listing is best-effort by nature.
    pub async fn discover_devices(&self) -> Result<Vec<DeviceInfo>, CoreError> {
        let entries = self.inner.api.list_devices().await?;
        let mut out = Vec::with_capacity(entries.len());
        for entry in &entries {
            match DeviceInfo::from_listing(entry) {
                Ok(info) => out.push(info),
                Err(e) => debug!(error = %e, "skipping unparseable device listing entry"),
            }
        }
        Ok(out)
    }

    /// Register one device: load its schema, build its control
    /// capability, and create its protocol resources.
    pub async fn register_device(&self, info: DeviceInfo) -> Result<(), CoreError> {
        let doc = self.inner.api.fetch_device_schema(&info.schema_uri).await?;
        let schema = Arc::new(DeviceSchema::parse(&doc)?);

        if !schema.has_model_sections() {
            warn!(device = %info.alias, "schema has no model sections, device may not be smart");
        }

        let control = control_for(
            &info.id,
            info.device_type,
            info.generation,
            Arc::clone(&schema),
            Arc::clone(&self.inner.api),
            Arc::clone(&self.inner.store),
        )
        .map(Arc::from);
        if control.is_none() {
            debug!(device = %info.alias, "no control capability for this device type");
        }

        match info.generation {
            ProtocolGeneration::Gen1 => {
                let mut session = WorkSession::new(info.id.clone());
                // Best-effort early registration; an unanswered ack
                // just means the first poll registers again.
                if let Err(e) = session.register(self.inner.api.as_ref()).await {
                    debug!(device = %info.alias, error = %e, "initial session registration failed");
                }
                self.inner
                    .sessions
                    .lock()
                    .await
                    .insert(info.id.clone(), session);

                // Seed the snapshot from schema defaults so consumers
                // see a complete shape before the first real payload.
                // No event: nothing has actually been observed yet.
                let defaults = schema
                    .decode_monitor(&homesync_api::RawPayload::Structured(Value::Object(
                        serde_json::Map::new(),
                    )));
                self.inner.store.lock().await.merge_update(
                    &info.id,
                    &Value::Object(defaults),
                    None,
                    Some(false),
                );
            }
            ProtocolGeneration::Gen2 => {
                let (rearm_tx, rearm_rx) = watch::channel(());
                self.inner
                    .rearm_txs
                    .lock()
                    .await
                    .insert(info.id.clone(), rearm_tx);

                let inner = Arc::clone(&self.inner);
                let device_id = info.id.clone();
                self.inner
                    .task_handles
                    .lock()
                    .await
                    .push(tokio::spawn(async move {
                        staleness_task(inner, device_id, rearm_rx).await;
                    }));
            }
        }

        info!(device = %info.alias, generation = %info.generation, "device registered");
        self.inner.devices.lock().await.insert(
            info.id.clone(),
            RegisteredDevice {
                info,
                schema,
                control,
            },
        );
        Ok(())
    }

    /// Remove a device and every resource the scheduler holds for it.
    pub async fn remove_device(&self, device_id: &str) {
        let removed = self.inner.devices.lock().await.remove(device_id);
        if removed.is_none() {
            return;
        }

        let session = self.inner.sessions.lock().await.remove(device_id);
        if let Some(mut session) = session {
            session.unregister(self.inner.api.as_ref()).await;
        }
        // Dropping the sender ends the staleness task.
        self.inner.rearm_txs.lock().await.remove(device_id);
        self.inner.store.lock().await.remove(device_id);
        debug!(device = %device_id, "device removed");
    }

    // ── Startup / shutdown ───────────────────────────────────────

    /// Start every background task this device set needs: the shared
    /// legacy poll timer, the coarse refresh sweep, and (when any
    /// push-generation device is registered) the push channel.
    ///
    /// A push-channel startup failure is terminal for this call and
    /// reported exactly once -- the caller decides whether to retry.
    pub async fn start(&self) -> Result<(), CoreError> {
        self.start_polling().await;
        self.start_sweep().await;

        let has_push = {
            let devices = self.inner.devices.lock().await;
            devices
                .values()
                .any(|d| d.info.generation == ProtocolGeneration::Gen2)
        };
        if has_push {
            let channel = PushChannel::start(
                Arc::clone(&self.inner.api),
                self.inner.config.push.clone(),
                self.inner.cancel.child_token(),
            )
            .await?;
            self.attach_frame_stream(channel.subscribe()).await;
        }

        info!("scheduler started");
        Ok(())
    }

    /// Spawn the shared poll timer for legacy-protocol devices.
    pub async fn start_polling(&self) {
        let inner = Arc::clone(&self.inner);
        self.inner
            .task_handles
            .lock()
            .await
            .push(tokio::spawn(async move {
                poll_task(inner).await;
            }));
    }

    /// Spawn the coarse full-refresh sweep for push-protocol devices.
    pub async fn start_sweep(&self) {
        let inner = Arc::clone(&self.inner);
        self.inner
            .task_handles
            .lock()
            .await
            .push(tokio::spawn(async move {
                sweep_task(inner).await;
            }));
    }

    /// Consume push frames from an externally managed stream.
    ///
    /// Production wiring passes `PushChannel::subscribe()`; tests feed
    /// their own channel.
    pub async fn attach_frame_stream(&self, mut frames: broadcast::Receiver<Arc<PushFrame>>) {
        let inner = Arc::clone(&self.inner);
        self.inner
            .task_handles
            .lock()
            .await
            .push(tokio::spawn(async move {
                loop {
                    tokio::select! {
                        biased;
                        _ = inner.cancel.cancelled() => break,
                        frame = frames.recv() => match frame {
                            Ok(frame) => apply_push_frame(&inner, &frame).await,
                            Err(broadcast::error::RecvError::Lagged(missed)) => {
                                warn!(missed, "push frame consumer lagged");
                            }
                            Err(broadcast::error::RecvError::Closed) => break,
                        },
                    }
                }
            }));
    }

    /// Stop all background tasks, unregister sessions best-effort.
    pub async fn shutdown(&self) {
        self.inner.cancel.cancel();

        let mut handles = self.inner.task_handles.lock().await;
        for handle in handles.drain(..) {
            let _ = handle.await;
        }
        drop(handles);

        let mut sessions = self.inner.sessions.lock().await;
        for (_, session) in sessions.iter_mut() {
            session.unregister(self.inner.api.as_ref()).await;
        }
        debug!("scheduler stopped");
    }

    // ── Consumer surface ─────────────────────────────────────────

    /// Subscribe to the change-event stream.
    pub fn events(&self) -> broadcast::Receiver<Arc<ChangeEvent>> {
        self.inner.event_tx.subscribe()
    }

    /// Subscribe with a filterable stream wrapper.
    pub fn event_stream(&self) -> crate::stream::EventStream {
        crate::stream::EventStream::new(self.inner.event_tx.subscribe())
    }

    /// Current snapshot for a device.
    pub async fn snapshot(&self, device_id: &str) -> Option<Arc<Snapshot>> {
        self.inner.store.lock().await.get(device_id)
    }

    /// Whether the cloud has permanently revoked legacy polling.
    pub fn is_polling_stopped(&self) -> bool {
        self.inner.polling_stopped.load(Ordering::SeqCst)
    }

    /// Poll one legacy device on demand. Completion signal only: the
    /// decoded result arrives through the event stream.
    pub async fn poll_now(&self, device_id: &str) -> Result<(), CoreError> {
        if self.is_polling_stopped() {
            return Err(CoreError::PollingStopped {
                message: "legacy polling permanently stopped".into(),
            });
        }
        if !self.inner.devices.lock().await.contains_key(device_id) {
            return Err(CoreError::DeviceNotFound {
                device_id: device_id.to_owned(),
            });
        }
        poll_device(&self.inner, device_id).await
    }

    /// Send a single-field control command. Completion signal only:
    /// the resulting state change arrives through the event stream.
    pub async fn send_control(
        &self,
        device_id: &str,
        field: &str,
        value: Value,
    ) -> Result<(), CoreError> {
        let control = {
            let devices = self.inner.devices.lock().await;
            let device = devices
                .get(device_id)
                .ok_or_else(|| CoreError::DeviceNotFound {
                    device_id: device_id.to_owned(),
                })?;
            device
                .control
                .as_ref()
                .map(Arc::clone)
                .ok_or_else(|| CoreError::ControlRejected {
                    message: format!("{device_id} is not controllable"),
                })?
        };

        control.set_field(field, value).await
    }
}

// ── Update application ───────────────────────────────────────────────

/// Merge one decoded update and notify consumers exactly once.
async fn apply_update(
    inner: &SchedulerInner,
    device_id: &str,
    source: UpdateSource,
    update: Value,
    raw: Option<crate::schema::FieldMap>,
    online: Option<bool>,
) {
    inner
        .store
        .lock()
        .await
        .merge_update(device_id, &update, raw, online);
    let _ = inner
        .event_tx
        .send(Arc::new(ChangeEvent::new(device_id, source, update)));
}

async fn apply_push_frame(inner: &Arc<SchedulerInner>, frame: &PushFrame) {
    let registered = inner.devices.lock().await.contains_key(&frame.device_id);
    if !registered {
        trace!(device = %frame.device_id, "frame for unregistered device, skipping");
        return;
    }

    apply_update(
        inner,
        &frame.device_id,
        UpdateSource::Push,
        frame.reported.clone(),
        None,
        Some(true),
    )
    .await;

    // Any inbound frame re-arms the device's staleness window.
    if let Some(rearm) = inner.rearm_txs.lock().await.get(&frame.device_id) {
        let _ = rearm.send(());
    }
}

// ── Legacy polling ───────────────────────────────────────────────────

/// Poll one legacy device and apply the result.
///
/// The session is checked out of the map while the network call is in
/// flight; a missing session means another callback already owns it,
/// and this cycle skips the device rather than double-registering.
async fn poll_device(inner: &SchedulerInner, device_id: &str) -> Result<(), CoreError> {
    let Some(mut session) = inner.sessions.lock().await.remove(device_id) else {
        trace!(device = %device_id, "poll already in flight, skipping");
        return Ok(());
    };

    let schema = {
        let devices = inner.devices.lock().await;
        devices.get(device_id).map(|d| Arc::clone(&d.schema))
    };

    let result = session.poll(inner.api.as_ref()).await;
    inner
        .sessions
        .lock()
        .await
        .insert(device_id.to_owned(), session);

    match result {
        Ok(Some(payload)) => {
            let Some(schema) = schema else {
                return Ok(());
            };
            let decoded = schema.decode_monitor(&payload);
            apply_update(
                inner,
                device_id,
                UpdateSource::Poll,
                Value::Object(decoded.clone()),
                Some(decoded),
                Some(true),
            )
            .await;
            Ok(())
        }
        // No data this cycle. Expected; nothing merged, nothing emitted.
        Ok(None) => Ok(()),
        Err(err) => Err(err.into()),
    }
}

/// The shared poll timer. One tick polls every legacy device with
/// overlapping in-flight requests; a stop request observed for any of
/// them halts the loop for all devices, permanently.
async fn poll_task(inner: Arc<SchedulerInner>) {
    let mut interval = tokio::time::interval(inner.config.poll_interval);
    interval.tick().await; // consume the immediate first tick

    loop {
        tokio::select! {
            biased;
            _ = inner.cancel.cancelled() => break,
            _ = interval.tick() => {
                let gen1_ids: Vec<String> = {
                    let devices = inner.devices.lock().await;
                    devices
                        .values()
                        .filter(|d| d.info.generation == ProtocolGeneration::Gen1)
                        .map(|d| d.info.id.clone())
                        .collect()
                };

                let results = futures_util::future::join_all(
                    gen1_ids.iter().map(|id| poll_device(&inner, id)),
                )
                .await;

                for (id, result) in gen1_ids.iter().zip(results) {
                    match result {
                        Ok(()) => {}
                        Err(CoreError::PollingStopped { message }) => {
                            warn!(%message, "cloud revoked polling, stopping the legacy loop");
                            inner.polling_stopped.store(true, Ordering::SeqCst);
                            return;
                        }
                        Err(e) => {
                            // One device's trouble never affects the others.
                            warn!(device = %id, error = %e, "poll cycle failed");
                        }
                    }
                }
            }
        }
    }
}

// ── Push-side timers ─────────────────────────────────────────────────

/// Coarse full-refresh sweep: re-list the fleet and fold cloud-side
/// snapshots of online push devices into the store. These updates feed
/// the staleness timers; frames remain the notification path.
async fn sweep_task(inner: Arc<SchedulerInner>) {
    let mut interval = tokio::time::interval(inner.config.sweep_interval);
    interval.tick().await;

    loop {
        tokio::select! {
            biased;
            _ = inner.cancel.cancelled() => break,
            _ = interval.tick() => {
                let entries = match inner.api.list_devices().await {
                    Ok(entries) => entries,
                    Err(e) => {
                        warn!(error = %e, "refresh sweep failed");
                        continue;
                    }
                };

                for entry in &entries {
                    sweep_entry(&inner, entry).await;
                }
            }
        }
    }
}

async fn sweep_entry(inner: &Arc<SchedulerInner>, entry: &Value) {
    let Some(device_id) = entry.get("deviceId").and_then(Value::as_str) else {
        return;
    };

    let registered_gen2 = {
        let devices = inner.devices.lock().await;
        devices
            .get(device_id)
            .is_some_and(|d| d.info.generation == ProtocolGeneration::Gen2)
    };
    if !registered_gen2 {
        return;
    }

    let snapshot = entry.get("snapshot");
    let online = entry
        .get("online")
        .and_then(Value::as_bool)
        .or_else(|| {
            snapshot
                .and_then(|s| s.get("online"))
                .and_then(Value::as_bool)
        })
        .unwrap_or(false);
    if !online {
        trace!(device = %device_id, "sweep skipping offline device");
        return;
    }

    if let Some(snapshot) = snapshot {
        inner
            .store
            .lock()
            .await
            .merge_update(device_id, snapshot, None, Some(true));
    }
}

/// Per-device staleness timer: if no frame arrives within the window,
/// re-emit the device's most recent sweep-derived snapshot once, then
/// re-arm. Ends when the device is removed (sender dropped) or the
/// scheduler shuts down.
async fn staleness_task(
    inner: Arc<SchedulerInner>,
    device_id: String,
    mut rearm_rx: watch::Receiver<()>,
) {
    loop {
        tokio::select! {
            biased;
            _ = inner.cancel.cancelled() => break,
            changed = rearm_rx.changed() => {
                if changed.is_err() {
                    break; // device removed
                }
                // Frame arrived elsewhere: window restarts.
            }
            _ = tokio::time::sleep(inner.config.stale_window) => {
                let snapshot = inner.store.lock().await.get(&device_id);
                if let Some(snapshot) = snapshot {
                    debug!(device = %device_id, "stale, re-emitting last known state");
                    let _ = inner.event_tx.send(Arc::new(ChangeEvent::new(
                        &device_id,
                        UpdateSource::StalenessReplay,
                        snapshot.fields.clone(),
                    )));
                }
            }
        }
    }
}
