//! Certificate-provisioned push channel.
//!
//! Opens one persistent MQTT connection per account, provisions a fresh
//! client certificate for every connect, subscribes to the topics the
//! certificate exchange granted, and streams decoded state frames
//! through a [`tokio::sync::broadcast`] channel.
//!
//! Disconnects are routine network churn: the channel tears itself down
//! and reconnects (with fresh credentials) after a fixed 60-second
//! delay, forever. Only *startup* failures are bounded -- 5 attempts,
//! 5 seconds apart, then terminal for that startup.
//!
//! # Example
//!
//! ```rust,ignore
//! use homesync_api::push::{PushChannel, PushConfig};
//! use tokio_util::sync::CancellationToken;
//!
//! let cancel = CancellationToken::new();
//! let channel = PushChannel::start(api, PushConfig::default(), cancel.clone()).await?;
//! let mut rx = channel.subscribe();
//!
//! while let Ok(frame) = rx.recv().await {
//!     println!("{}: {}", frame.device_id, frame.reported);
//! }
//!
//! channel.shutdown();
//! ```

use std::sync::Arc;
use std::time::Duration;

use rumqttc::{
    AsyncClient, ConnectReturnCode, Event, EventLoop, MqttOptions, Packet, QoS,
    TlsConfiguration, Transport,
};
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

use crate::cloud::CloudApi;
use crate::credential::generate_credential;
use crate::error::Error;
use crate::transport::TransportConfig;

// ── Broadcast channel capacity ───────────────────────────────────────

const FRAME_CHANNEL_CAPACITY: usize = 1024;

const DEFAULT_BROKER_PORT: u16 = 8883;

// ── PushFrame ────────────────────────────────────────────────────────

/// One decoded state frame from the push broker.
#[derive(Debug, Clone)]
pub struct PushFrame {
    /// Device identifier embedded in the frame.
    pub device_id: String,
    /// The reported-state section -- what merges into the snapshot.
    pub reported: serde_json::Value,
}

// ── PushConfig ───────────────────────────────────────────────────────

/// Retry and connection tuning for the push channel.
#[derive(Debug, Clone)]
pub struct PushConfig {
    /// Bounded attempts before startup is declared failed. Default: 5.
    pub startup_attempts: u32,

    /// Delay between startup attempts. Default: 5s.
    pub startup_retry_delay: Duration,

    /// Delay before reconnecting after an established connection drops.
    /// Fixed, no backoff growth. Default: 60s.
    pub reconnect_delay: Duration,

    /// MQTT keep-alive interval. Default: 30s.
    pub keep_alive: Duration,
}

impl Default for PushConfig {
    fn default() -> Self {
        Self {
            startup_attempts: 5,
            startup_retry_delay: Duration::from_secs(5),
            reconnect_delay: Duration::from_secs(60),
            keep_alive: Duration::from_secs(30),
        }
    }
}

// ── Trust-root selection ─────────────────────────────────────────────

/// Recognized certificate authority classes for the broker endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrustAuthority {
    /// Modern ATS endpoints (`*-ats.iot.<region>.amazonaws.com`).
    AmazonAts,
    /// Vendor-operated brokers (`*.iot.ruic.lgthinq.com`).
    VendorOwned,
    /// Everything else: the conservative legacy root.
    LegacyConservative,
}

/// Hostname-pattern table. First match wins; the table order is fixed,
/// so selection never depends on registration order.
const TRUST_TABLE: &[(fn(&str) -> bool, TrustAuthority)] = &[
    (
        |host| host.ends_with(".amazonaws.com") && host.contains("-ats.iot."),
        TrustAuthority::AmazonAts,
    ),
    (
        |host| host.ends_with(".iot.ruic.lgthinq.com"),
        TrustAuthority::VendorOwned,
    ),
];

impl TrustAuthority {
    /// Select the authority class for a broker hostname.
    pub fn for_host(host: &str) -> Self {
        TRUST_TABLE
            .iter()
            .find_map(|(matches, authority)| matches(host).then_some(*authority))
            .unwrap_or(Self::LegacyConservative)
    }

    /// Where the root certificate for this authority is published.
    pub fn root_ca_url(self) -> &'static str {
        match self {
            Self::AmazonAts => "https://www.amazontrust.com/repository/AmazonRootCA1.pem",
            Self::VendorOwned => "http://www.tbs-x509.com/Comodo_AAA_Certificate_Services.crt",
            Self::LegacyConservative => {
                "https://www.websecurity.digicert.com/content/dam/websitesecurity/digitalassets/desktop/pdfs/roots/VeriSign-Class%203-Public-Primary-Certification-Authority-G5.pem"
            }
        }
    }
}

/// Fetch the root CA for `host` over plain HTTPS.
async fn fetch_trust_root(http: &reqwest::Client, host: &str) -> Result<Vec<u8>, Error> {
    let authority = TrustAuthority::for_host(host);
    tracing::debug!(?authority, host, "selecting trust root");

    let body = http
        .get(authority.root_ca_url())
        .send()
        .await
        .map_err(|e| Error::PushConnect(format!("trust root fetch failed: {e}")))?
        .bytes()
        .await
        .map_err(|e| Error::PushConnect(format!("trust root fetch failed: {e}")))?;

    Ok(body.to_vec())
}

// ── PushChannel ──────────────────────────────────────────────────────

/// Handle to a running push channel.
///
/// Dropping the handle does not stop the background task -- call
/// [`shutdown`](Self::shutdown).
#[derive(Debug)]
pub struct PushChannel {
    frame_rx: broadcast::Receiver<Arc<PushFrame>>,
    cancel: CancellationToken,
}

impl PushChannel {
    /// Provision, connect, subscribe, and spawn the frame loop.
    ///
    /// Retries the full acquire-route → provision → connect sequence up
    /// to `config.startup_attempts` times. Exhausting them returns
    /// [`Error::PushStartupExhausted`] -- terminal for this startup, no
    /// silent background retry.
    pub async fn start(
        api: Arc<dyn CloudApi>,
        config: PushConfig,
        cancel: CancellationToken,
    ) -> Result<Self, Error> {
        let http = TransportConfig::default().build_client()?;
        let (frame_tx, frame_rx) = broadcast::channel(FRAME_CHANNEL_CAPACITY);

        let mut last_err = None;
        for attempt in 1..=config.startup_attempts {
            match connect_once(api.as_ref(), &http, &config).await {
                Ok(conn) => {
                    let task_cancel = cancel.clone();
                    let task_api = Arc::clone(&api);
                    let task_config = config.clone();
                    let task_http = http.clone();
                    tokio::spawn(async move {
                        push_loop(task_api, task_http, task_config, conn, frame_tx, task_cancel)
                            .await;
                    });
                    return Ok(Self { frame_rx, cancel });
                }
                Err(e) => {
                    tracing::debug!(error = %e, attempt, "push channel startup attempt failed");
                    last_err = Some(e);
                    if attempt < config.startup_attempts {
                        tokio::time::sleep(config.startup_retry_delay).await;
                    }
                }
            }
        }

        tracing::error!(
            attempts = config.startup_attempts,
            error = %last_err.map(|e| e.to_string()).unwrap_or_default(),
            "push channel startup failed"
        );
        Err(Error::PushStartupExhausted {
            attempts: config.startup_attempts,
        })
    }

    /// Get a new broadcast receiver for the frame stream.
    pub fn subscribe(&self) -> broadcast::Receiver<Arc<PushFrame>> {
        self.frame_rx.resubscribe()
    }

    /// Signal the background task to shut down gracefully.
    pub fn shutdown(&self) {
        self.cancel.cancel();
    }
}

// ── Single connection lifecycle ──────────────────────────────────────

struct Connection {
    client: AsyncClient,
    event_loop: EventLoop,
}

/// One full acquire-route → provision-credential → connect → subscribe
/// sequence. Success means the broker acknowledged the connection and
/// every granted topic is subscribed.
async fn connect_once(
    api: &dyn CloudApi,
    http: &reqwest::Client,
    config: &PushConfig,
) -> Result<Connection, Error> {
    let route = api.resolve_broker_route().await?;

    // Fresh credentials on every connect; never reused across drops.
    let credential = generate_credential()?;
    api.register_client_identity().await?;
    let grant = api.exchange_certificate(&credential.csr_pem).await?;

    let host = route
        .mqtt_server
        .host_str()
        .ok_or_else(|| Error::PushConnect(format!("broker route has no host: {}", route.mqtt_server)))?
        .to_owned();
    let port = route.mqtt_server.port().unwrap_or(DEFAULT_BROKER_PORT);

    let ca = fetch_trust_root(http, &host).await?;

    tracing::debug!(%host, port, "opening push connection");

    let mut options = MqttOptions::new(api.client_id(), host, port);
    options.set_keep_alive(config.keep_alive);
    options.set_transport(Transport::Tls(TlsConfiguration::Simple {
        ca,
        alpn: None,
        client_auth: Some((
            grant.certificate_pem.clone().into_bytes(),
            credential.private_key_pem.clone().into_bytes(),
        )),
    }));

    let (client, mut event_loop) = AsyncClient::new(options, 100);

    // Drive the event loop until the broker acknowledges the connect.
    loop {
        match event_loop.poll().await {
            Ok(Event::Incoming(Packet::ConnAck(ack))) => {
                if ack.code == ConnectReturnCode::Success {
                    break;
                }
                return Err(Error::PushConnect(format!(
                    "broker refused connection: {:?}",
                    ack.code
                )));
            }
            Ok(_) => {}
            Err(e) => return Err(Error::PushConnect(e.to_string())),
        }
    }

    for topic in &grant.subscription_topics {
        client
            .subscribe(topic.as_str(), QoS::AtLeastOnce)
            .await
            .map_err(|e| Error::PushConnect(format!("subscribe {topic} failed: {e}")))?;
    }
    tracing::info!(
        topics = grant.subscription_topics.len(),
        "push channel connected"
    );

    Ok(Connection { client, event_loop })
}

// ── Background frame loop ────────────────────────────────────────────

/// Main loop: read frames until the connection drops, wait the fixed
/// reconnect delay, then rebuild the whole connection (fresh
/// credentials included). Runs until cancelled.
async fn push_loop(
    api: Arc<dyn CloudApi>,
    http: reqwest::Client,
    config: PushConfig,
    mut conn: Connection,
    frame_tx: broadcast::Sender<Arc<PushFrame>>,
    cancel: CancellationToken,
) {
    loop {
        read_frames(&mut conn, &frame_tx, &cancel).await;
        let _ = conn.client.disconnect().await;

        if cancel.is_cancelled() {
            break;
        }

        tracing::info!(
            delay_secs = config.reconnect_delay.as_secs(),
            "push channel offline, scheduling reconnect"
        );

        // Unbounded reconnect with a fixed delay -- disconnects are
        // routine churn, not systemic failure.
        conn = loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return,
                _ = tokio::time::sleep(config.reconnect_delay) => {}
            }

            match connect_once(api.as_ref(), &http, &config).await {
                Ok(conn) => break conn,
                Err(e) => {
                    tracing::warn!(error = %e, "push channel reconnect failed");
                }
            }
        };
    }

    tracing::debug!("push loop exiting");
}

/// Pump one established connection until it drops or we are cancelled.
async fn read_frames(
    conn: &mut Connection,
    frame_tx: &broadcast::Sender<Arc<PushFrame>>,
    cancel: &CancellationToken,
) {
    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => return,
            event = conn.event_loop.poll() => {
                match event {
                    Ok(Event::Incoming(Packet::Publish(publish))) => {
                        parse_and_broadcast(&publish.payload, frame_tx);
                    }
                    Ok(_) => {}
                    Err(e) => {
                        tracing::info!(error = %e, "push connection dropped");
                        return;
                    }
                }
            }
        }
    }
}

// ── Frame parsing ────────────────────────────────────────────────────

/// Parse an inbound publish payload and broadcast the frame.
///
/// Frames without both a data section and a device identifier are
/// protocol noise, dropped without logging an error.
fn parse_and_broadcast(payload: &[u8], frame_tx: &broadcast::Sender<Arc<PushFrame>>) {
    let value: serde_json::Value = match serde_json::from_slice(payload) {
        Ok(v) => v,
        Err(e) => {
            tracing::debug!(error = %e, "unparseable push frame");
            return;
        }
    };

    let Some(device_id) = value.get("deviceId").and_then(serde_json::Value::as_str) else {
        tracing::trace!("push frame without deviceId, dropping");
        return;
    };
    let Some(data) = value.get("data") else {
        tracing::trace!("push frame without data section, dropping");
        return;
    };

    // The reported-state section is the mergeable payload; fall back to
    // the whole data object for brokers that skip the shadow nesting.
    let reported = data
        .pointer("/state/reported")
        .unwrap_or(data)
        .clone();

    // Send errors just mean no active subscribers right now.
    let _ = frame_tx.send(Arc::new(PushFrame {
        device_id: device_id.to_owned(),
        reported,
    }));
}

// ── Tests ────────────────────────────────────────────────────────────
