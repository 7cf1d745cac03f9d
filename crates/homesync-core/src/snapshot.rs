//! Per-device last-known decoded state.
//!
//! Snapshots are mutated only by the scheduler, always through
//! [`SnapshotStore::merge_update`] -- a deep, non-destructive merge.
//! Keys an update does not mention are preserved; keys it does mention
//! are overwritten (last writer wins per leaf). Downstream consumers
//! read snapshots as cheap `Arc` clones.

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::Value;

use crate::schema::FieldMap;

// ── Snapshot ─────────────────────────────────────────────────────────

/// Last-known decoded state of one device.
#[derive(Debug, Clone, Default)]
pub struct Snapshot {
    /// Decoded field tree (dot-separated paths address leaves).
    pub fields: Value,
    /// Echo of the most recent decoded monitor payload. `None` until
    /// the device has answered at least once.
    pub raw: Option<FieldMap>,
    /// Whether the device was reachable at last contact.
    pub online: bool,
}

impl Snapshot {
    /// Read a leaf by dot-separated path, e.g. `"refState.fridgeTemp"`.
    pub fn get(&self, path: &str) -> Option<&Value> {
        path.split('.')
            .try_fold(&self.fields, |node, key| node.get(key))
    }
}

/// Deep, non-destructive merge of `update` into `dst`.
///
/// Objects merge recursively; everything else overwrites. Existing
/// keys not present in the update are preserved.
pub(crate) fn merge_value(dst: &mut Value, update: &Value) {
    match (dst, update) {
        (Value::Object(dst_map), Value::Object(update_map)) => {
            for (key, value) in update_map {
                merge_value(dst_map.entry(key.clone()).or_insert(Value::Null), value);
            }
        }
        (dst_slot, value) => *dst_slot = value.clone(),
    }
}

// ── SnapshotStore ────────────────────────────────────────────────────

/// All per-device snapshots, keyed by device id.
///
/// Single-writer by design: every mutation happens on the scheduler's
/// own callbacks, so the store needs no internal synchronization.
#[derive(Debug, Default)]
pub struct SnapshotStore {
    snapshots: HashMap<String, Arc<Snapshot>>,
}

impl SnapshotStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current snapshot for a device, if any.
    pub fn get(&self, device_id: &str) -> Option<Arc<Snapshot>> {
        self.snapshots.get(device_id).map(Arc::clone)
    }

    /// Merge one decoded update into a device's snapshot.
    ///
    /// `raw` replaces the raw echo when given; `online` updates the
    /// reachability flag when given. Returns the post-merge snapshot.
    pub fn merge_update(
        &mut self,
        device_id: &str,
        update: &Value,
        raw: Option<FieldMap>,
        online: Option<bool>,
    ) -> Arc<Snapshot> {
        let entry = self
            .snapshots
            .entry(device_id.to_owned())
            .or_insert_with(|| Arc::new(Snapshot::default()));

        let mut next = Snapshot::clone(entry);
        merge_value(&mut next.fields, update);
        if let Some(raw) = raw {
            next.raw = Some(raw);
        }
        if let Some(online) = online {
            next.online = online;
        }

        let next = Arc::new(next);
        *entry = Arc::clone(&next);
        next
    }

    /// The most recent raw decoded field set for a device.
    ///
    /// This is the context the packed control encoder needs -- the wire
    /// format resends the complete state on every change.
    pub fn raw_fields(&self, device_id: &str) -> FieldMap {
        self.snapshots
            .get(device_id)
            .and_then(|snap| snap.raw.clone())
            .unwrap_or_default()
    }

    /// Drop a device's snapshot (device removed).
    pub fn remove(&mut self, device_id: &str) -> Option<Arc<Snapshot>> {
        self.snapshots.remove(device_id)
    }

    pub fn len(&self) -> usize {
        self.snapshots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.snapshots.is_empty()
    }
}

// ── Tests ────────────────────────────────────────────────────────────

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn merge_preserves_absent_keys() {
        let mut store = SnapshotStore::new();
        store.merge_update("D1", &json!({ "a": 1, "nested": { "x": 1 } }), None, None);
        let snap = store.merge_update("D1", &json!({ "nested": { "y": 2 } }), None, None);

        assert_eq!(snap.get("a"), Some(&json!(1)));
        assert_eq!(snap.get("nested.x"), Some(&json!(1)));
        assert_eq!(snap.get("nested.y"), Some(&json!(2)));
    }

    #[test]
    fn merge_last_writer_wins_per_leaf() {
        let mut store = SnapshotStore::new();
        store.merge_update("D1", &json!({ "mode": 1 }), None, None);
        let snap = store.merge_update("D1", &json!({ "mode": 4 }), None, None);
        assert_eq!(snap.get("mode"), Some(&json!(4)));
    }

    #[test]
    fn merge_is_idempotent() {
        let mut store = SnapshotStore::new();
        let update = json!({ "a": 1, "nested": { "x": [1, 2] } });

        let once = store.merge_update("D1", &update, None, None);
        let twice = store.merge_update("D1", &update, None, None);

        assert_eq!(once.fields, twice.fields);
    }

    #[test]
    fn stale_replay_does_not_clobber_disjoint_keys() {
        let mut store = SnapshotStore::new();
        let a = json!({ "a": 1 });
        let b = json!({ "b": 2 });

        store.merge_update("D1", &a, None, None);
        store.merge_update("D1", &b, None, None);
        let snap = store.merge_update("D1", &a, None, None);

        // Replaying stale A leaves B's keys intact.
        assert_eq!(snap.get("b"), Some(&json!(2)));
        assert_eq!(snap.get("a"), Some(&json!(1)));
    }

    #[test]
    fn raw_echo_and_online_flag() {
        let mut store = SnapshotStore::new();
        let mut raw = FieldMap::new();
        raw.insert("OpMode".into(), json!(4));

        let snap = store.merge_update("D1", &json!({}), Some(raw), Some(true));
        assert!(snap.online);
        assert_eq!(store.raw_fields("D1")["OpMode"], json!(4));

        // Updates without raw/online leave both untouched.
        let snap = store.merge_update("D1", &json!({ "a": 1 }), None, None);
        assert!(snap.online);
        assert_eq!(snap.raw.as_ref().unwrap()["OpMode"], json!(4));
    }

    #[test]
    fn raw_fields_empty_for_unknown_device() {
        let store = SnapshotStore::new();
        assert!(store.raw_fields("nope").is_empty());
    }

    #[test]
    fn remove_drops_snapshot() {
        let mut store = SnapshotStore::new();
        store.merge_update("D1", &json!({ "a": 1 }), None, None);
        assert!(store.remove("D1").is_some());
        assert!(store.get("D1").is_none());
        assert!(store.is_empty());
    }

    #[test]
    fn get_by_dot_path() {
        let mut store = SnapshotStore::new();
        let snap = store.merge_update(
            "D1",
            &json!({ "refState": { "fridgeTemp": 3, "door": { "open": false } } }),
            None,
            None,
        );

        assert_eq!(snap.get("refState.fridgeTemp"), Some(&json!(3)));
        assert_eq!(snap.get("refState.door.open"), Some(&json!(false)));
        assert!(snap.get("refState.missing").is_none());
    }
}
