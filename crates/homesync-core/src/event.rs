//! Typed change events.
//!
//! Every decoded update -- poll or push -- becomes exactly one
//! [`ChangeEvent`] on the scheduler's broadcast channel. Consumers
//! subscribe and filter by device id and dot-separated field path,
//! instead of the ambient per-field listener registration the vendor
//! apps use.

use chrono::{DateTime, Utc};
use serde_json::Value;

/// Where an update came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateSource {
    /// Legacy monitor poll cycle.
    Poll,
    /// Inbound push frame.
    Push,
    /// Coarse full-refresh sweep.
    Sweep,
    /// Staleness timer re-emission of the last known state.
    StalenessReplay,
}

/// One logical state update for one device.
#[derive(Debug, Clone)]
pub struct ChangeEvent {
    pub device_id: String,
    pub source: UpdateSource,
    pub at: DateTime<Utc>,
    /// The decoded update that was merged (not the whole snapshot).
    pub update: Value,
}

impl ChangeEvent {
    pub fn new(device_id: impl Into<String>, source: UpdateSource, update: Value) -> Self {
        Self {
            device_id: device_id.into(),
            source,
            at: Utc::now(),
            update,
        }
    }

    /// Leaf-level view of the update: (dot-separated path, value).
    pub fn field_changes(&self) -> Vec<(String, &Value)> {
        let mut out = Vec::new();
        flatten_into("", &self.update, &mut out);
        out
    }
}

/// Flatten a JSON tree into dot-separated leaf paths.
fn flatten_into<'a>(prefix: &str, value: &'a Value, out: &mut Vec<(String, &'a Value)>) {
    match value {
        Value::Object(map) if !map.is_empty() => {
            for (key, child) in map {
                let path = if prefix.is_empty() {
                    key.clone()
                } else {
                    format!("{prefix}.{key}")
                };
                flatten_into(&path, child, out);
            }
        }
        leaf => {
            if !prefix.is_empty() {
                out.push((prefix.to_owned(), leaf));
            }
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn field_changes_flatten_to_dot_paths() {
        let event = ChangeEvent::new(
            "D1",
            UpdateSource::Push,
            json!({ "airState": { "opMode": 4, "tempState": { "target": 21 } } }),
        );

        let mut changes = event.field_changes();
        changes.sort_by(|a, b| a.0.cmp(&b.0));

        assert_eq!(
            changes,
            vec![
                ("airState.opMode".to_owned(), &json!(4)),
                ("airState.tempState.target".to_owned(), &json!(21)),
            ]
        );
    }

    #[test]
    fn scalar_leaves_keep_arrays_whole() {
        let event = ChangeEvent::new("D1", UpdateSource::Poll, json!({ "course": [1, 2, 3] }));
        let changes = event.field_changes();
        assert_eq!(changes, vec![("course".to_owned(), &json!([1, 2, 3]))]);
    }

    #[test]
    fn top_level_scalar_update_has_no_paths() {
        let event = ChangeEvent::new("D1", UpdateSource::Poll, json!(42));
        assert!(event.field_changes().is_empty());
    }
}
