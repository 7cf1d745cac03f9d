// Startup retry policy for the push channel: bounded attempts with a
// fixed delay, then a terminal typed failure. Uses a CloudApi stub that
// fails at route discovery, so no broker is needed.

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use url::Url;

use homesync_api::cloud::{
    BrokerRoute, CertificateGrant, CloudApi, ControlPayload, RawPayload, SessionAck, SessionOp,
};
use homesync_api::push::{PushChannel, PushConfig};
use homesync_api::Error;

#[derive(Default)]
struct RoutelessCloud {
    route_calls: AtomicU32,
}

#[async_trait]
impl CloudApi for RoutelessCloud {
    async fn list_devices(&self) -> Result<Vec<serde_json::Value>, Error> {
        unimplemented!("not exercised")
    }

    async fn send_session_command(
        &self,
        _device_id: &str,
        _op: SessionOp,
        _request_token: &str,
    ) -> Result<SessionAck, Error> {
        unimplemented!("not exercised")
    }

    async fn fetch_session_result(
        &self,
        _device_id: &str,
        _work_id: &str,
    ) -> Result<RawPayload, Error> {
        unimplemented!("not exercised")
    }

    async fn fetch_device_schema(&self, _uri: &Url) -> Result<serde_json::Value, Error> {
        unimplemented!("not exercised")
    }

    async fn send_control_command(
        &self,
        _device_id: &str,
        _payload: ControlPayload,
    ) -> Result<(), Error> {
        unimplemented!("not exercised")
    }

    async fn resolve_broker_route(&self) -> Result<BrokerRoute, Error> {
        self.route_calls.fetch_add(1, Ordering::SeqCst);
        Err(Error::RouteDiscovery("route endpoint unreachable".into()))
    }

    async fn register_client_identity(&self) -> Result<(), Error> {
        unimplemented!("not exercised")
    }

    async fn exchange_certificate(&self, _csr_pem: &str) -> Result<CertificateGrant, Error> {
        unimplemented!("not exercised")
    }

    fn client_id(&self) -> &str {
        "test-client"
    }
}

#[tokio::test(start_paused = true)]
async fn startup_exhausts_after_bounded_attempts() {
    let cloud = Arc::new(RoutelessCloud::default());
    let config = PushConfig::default();

    let result = PushChannel::start(
        Arc::clone(&cloud) as Arc<dyn CloudApi>,
        config,
        CancellationToken::new(),
    )
    .await;

    match result {
        Err(Error::PushStartupExhausted { attempts }) => assert_eq!(attempts, 5),
        other => panic!("expected PushStartupExhausted, got {other:?}"),
    }

    // Exactly one route resolution per attempt, no extra retries.
    assert_eq!(cloud.route_calls.load(Ordering::SeqCst), 5);
}
