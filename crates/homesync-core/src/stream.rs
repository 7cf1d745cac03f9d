// ── Reactive change-event streams ──
//
// Subscription types for consuming change events from the scheduler,
// filtered by device identity and field path instead of ambient
// listener registration.

use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll, ready};

use futures_core::Stream;
use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;

use crate::event::ChangeEvent;

/// Filter predicate for change-event subscriptions.
pub enum EventFilter {
    All,
    /// Every update for one device.
    Device(String),
    /// Updates for one device that touch a dot-separated field path
    /// (the path itself or anything beneath it).
    FieldPath { device_id: String, path: String },
}

impl EventFilter {
    pub fn matches(&self, event: &ChangeEvent) -> bool {
        match self {
            Self::All => true,
            Self::Device(id) => event.device_id == *id,
            Self::FieldPath { device_id, path } => {
                event.device_id == *device_id
                    && event
                        .field_changes()
                        .iter()
                        .any(|(p, _)| p == path || p.starts_with(&format!("{path}.")))
            }
        }
    }
}

/// A filtered subscription to the scheduler's change-event stream.
pub struct EventStream {
    receiver: broadcast::Receiver<Arc<ChangeEvent>>,
    filter: EventFilter,
}

impl EventStream {
    pub(crate) fn new(receiver: broadcast::Receiver<Arc<ChangeEvent>>) -> Self {
        Self {
            receiver,
            filter: EventFilter::All,
        }
    }

    /// Restrict the stream to one device.
    pub fn for_device(mut self, device_id: impl Into<String>) -> Self {
        self.filter = EventFilter::Device(device_id.into());
        self
    }

    /// Restrict the stream to one (device, field path) pair.
    pub fn for_field(mut self, device_id: impl Into<String>, path: impl Into<String>) -> Self {
        self.filter = EventFilter::FieldPath {
            device_id: device_id.into(),
            path: path.into(),
        };
        self
    }

    /// Wait for the next matching event.
    ///
    /// Lagged gaps are skipped (the stream is state-bearing, not a
    /// ledger -- consumers re-read snapshots after a gap). Returns
    /// `None` once the scheduler is gone.
    pub async fn recv(&mut self) -> Option<Arc<ChangeEvent>> {
        loop {
            match self.receiver.recv().await {
                Ok(event) if self.filter.matches(&event) => return Some(event),
                Ok(_) => {}
                Err(broadcast::error::RecvError::Lagged(_)) => {}
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    /// Convert into a `Stream` for use with `StreamExt` combinators.
    pub fn into_stream(self) -> ChangeEventStream {
        ChangeEventStream {
            inner: BroadcastStream::new(self.receiver),
            filter: self.filter,
        }
    }
}

/// `Stream` adapter backed by the broadcast receiver.
///
/// Yields matching events; lag gaps are skipped silently.
pub struct ChangeEventStream {
    inner: BroadcastStream<Arc<ChangeEvent>>,
    filter: EventFilter,
}

impl Stream for ChangeEventStream {
    type Item = Arc<ChangeEvent>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        loop {
            match ready!(Pin::new(&mut self.inner).poll_next(cx)) {
                Some(Ok(event)) if self.filter.matches(&event) => {
                    return Poll::Ready(Some(event));
                }
                Some(_) => {}
                None => return Poll::Ready(None),
            }
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::event::UpdateSource;
    use serde_json::json;

    fn event(device_id: &str, update: serde_json::Value) -> Arc<ChangeEvent> {
        Arc::new(ChangeEvent::new(device_id, UpdateSource::Push, update))
    }

    #[test]
    fn device_filter_matches_by_identity() {
        let filter = EventFilter::Device("D1".into());
        assert!(filter.matches(&event("D1", json!({ "a": 1 }))));
        assert!(!filter.matches(&event("D2", json!({ "a": 1 }))));
    }

    #[test]
    fn field_filter_matches_path_and_children() {
        let filter = EventFilter::FieldPath {
            device_id: "D1".into(),
            path: "airState.tempState".into(),
        };

        assert!(filter.matches(&event(
            "D1",
            json!({ "airState": { "tempState": { "target": 21 } } })
        )));
        assert!(!filter.matches(&event("D1", json!({ "airState": { "opMode": 4 } }))));
        assert!(!filter.matches(&event(
            "D2",
            json!({ "airState": { "tempState": { "target": 21 } } })
        )));
    }

    #[tokio::test]
    async fn recv_skips_non_matching_events() {
        let (tx, rx) = broadcast::channel(16);
        let mut stream = EventStream::new(rx).for_device("D2");

        tx.send(event("D1", json!({ "a": 1 }))).unwrap();
        tx.send(event("D2", json!({ "b": 2 }))).unwrap();

        let received = stream.recv().await.unwrap();
        assert_eq!(received.device_id, "D2");
    }

    #[tokio::test]
    async fn recv_returns_none_when_sender_drops() {
        let (tx, rx) = broadcast::channel::<Arc<ChangeEvent>>(16);
        let mut stream = EventStream::new(rx);
        drop(tx);
        assert!(stream.recv().await.is_none());
    }
}
