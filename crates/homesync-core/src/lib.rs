//! Device-model codec, snapshot store, and the scheduler that
//! multiplexes both appliance protocol generations into one coherent
//! change-event stream.
//!
//! This crate owns the domain logic of the sync engine:
//!
//! - [`schema`] -- the stateless decode/encode engine between raw
//!   monitor payloads and named, typed field maps.
//! - [`session`] -- the legacy (Gen1) monitor-session state machine,
//!   including its re-register + retry-once recovery policy.
//! - [`snapshot`] -- per-device last-known state with deep,
//!   non-destructive merge semantics.
//! - [`control`] -- the appliance capability interface, implemented
//!   per protocol generation and selected by a factory.
//! - [`scheduler`] -- timer orchestration for both generations,
//!   normalized into a broadcast stream of [`event::ChangeEvent`]s.
//!
//! Cloud transport lives in `homesync-api`; this crate only ever talks
//! to the [`homesync_api::CloudApi`] trait.

pub mod config;
pub mod control;
pub mod error;
pub mod event;
pub mod model;
pub mod scheduler;
pub mod schema;
pub mod session;
pub mod snapshot;
pub mod stream;

// ── Primary re-exports ──────────────────────────────────────────────
pub use config::SyncConfig;
pub use control::ApplianceControl;
pub use error::CoreError;
pub use event::{ChangeEvent, UpdateSource};
pub use model::{DeviceInfo, DeviceType, ProtocolGeneration};
pub use scheduler::Scheduler;
pub use schema::{DeviceSchema, FieldMap};
pub use session::WorkSession;
pub use snapshot::{Snapshot, SnapshotStore};
pub use stream::{EventFilter, EventStream};
