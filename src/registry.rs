//! Memoization of repeated identical requests.
//!
//! When the same feature is requested again with the same arguments, the recorded payload from
//! the earlier impression is replayed into the new request instead of asking the server again.
//! The registry keeps the impression IDs it stood in for so events can still be attributed.
use std::collections::HashMap;

use serde_json::value::RawValue;

use crate::request::{JsonObject, Requestable};

#[derive(Debug)]
struct MemoEntry {
    args: serde_json::Value,
    /// Raw active payload as it came off the wire.
    payload: String,
    /// Requests satisfied by this entry, the recorded one included.
    count: u64,
    impression_ids: Vec<String>,
}

/// A cache of resolved requests, keyed by feature name.
///
/// One registry serves one session; requests under different sessions must not share payloads.
#[derive(Debug, Default)]
pub struct RequestRegistry {
    entries: HashMap<String, MemoEntry>,
}

impl RequestRegistry {
    /// Create an empty registry.
    pub fn new() -> RequestRegistry {
        RequestRegistry::default()
    }

    /// Try to satisfy `request` from a recorded result.
    ///
    /// Returns `true` when a prior request for the same feature with equal arguments was found
    /// and its payload re-applied; the request comes out active and error-free, no wire call
    /// needed. Returns `false` on any mismatch, leaving the request untouched.
    pub fn replay(&mut self, request: &mut dyn Requestable, impression_id: &str) -> bool {
        let Some(entry) = self.entries.get_mut(request.feature_name()) else {
            return false;
        };

        let mut args = JsonObject::new();
        request.serialize_args(&mut args);
        if entry.args != serde_json::Value::Object(args) {
            return false;
        }

        let raw: &RawValue = match serde_json::from_str(&entry.payload) {
            Ok(raw) => raw,
            Err(_) => return false,
        };
        if request.deserialize_response(raw).is_err() {
            return false;
        }
        request.set_active(true);
        request.set_error(None);

        entry.count += 1;
        entry.impression_ids.push(impression_id.to_owned());
        true
    }

    /// Record a freshly decoded active result for later replay.
    pub fn record(&mut self, request: &dyn Requestable, payload: &RawValue, impression_id: &str) {
        let mut args = JsonObject::new();
        request.serialize_args(&mut args);
        self.entries.insert(
            request.feature_name().to_owned(),
            MemoEntry {
                args: args.into(),
                payload: payload.get().to_owned(),
                count: 1,
                impression_ids: vec![impression_id.to_owned()],
            },
        );
    }

    /// How many requests this feature's entry has satisfied. Zero if never recorded.
    pub fn count(&self, feature_name: &str) -> u64 {
        self.entries.get(feature_name).map_or(0, |entry| entry.count)
    }

    /// The impression IDs the feature's entry has stood in for, oldest first.
    pub fn impression_ids(&self, feature_name: &str) -> &[String] {
        self.entries
            .get(feature_name)
            .map_or(&[], |entry| entry.impression_ids.as_slice())
    }

    /// Forget all recorded results.
    pub fn clear(&mut self) {
        self.entries.clear();
    }
}
