// homesync-api: Async protocol plumbing for the appliance cloud
// (legacy monitor sessions + certificate-provisioned push channel).

pub mod cloud;
pub mod credential;
pub mod error;
pub mod http;
pub mod push;
pub mod transport;

pub use cloud::{
    BrokerRoute, CertificateGrant, CloudApi, ControlPayload, RawPayload, SessionAck, SessionOp,
};
pub use error::Error;
pub use http::HttpCloudClient;
pub use push::{PushChannel, PushConfig, PushFrame};
