//! Traits that feature and session request objects implement to take part in a batch call.
//!
//! The engine never inspects argument or payload fields itself — request objects carry their own
//! (de)serialization, so any entity implementing [`Requestable`] can be slotted into a batch.
use serde_json::value::RawValue;

use crate::{Error, Result};

/// A JSON object under construction. Request objects write their argument fields into one of
/// these during encode.
pub type JsonObject = serde_json::Map<String, serde_json::Value>;

/// One per-feature request in a batch.
///
/// A request starts out inactive with no error. After the batch call resolves, exactly one of the
/// following holds:
///
/// - active, no error: the server returned a payload and it deserialized cleanly;
/// - inactive, no error: the feature is gated "OFF" or unknown to the server — callers fall back
///   to control values, this is not an error;
/// - inactive, with error: the payload was malformed, the server reported an error for this
///   request, or the whole batch failed.
pub trait Requestable: Send {
    /// Name of the requested feature.
    fn feature_name(&self) -> &str;

    /// Write the request's argument fields into `args`. Argument values are opaque to the engine.
    fn serialize_args(&self, args: &mut JsonObject);

    /// Populate the request's fields from the server's payload for this slot.
    fn deserialize_response(&mut self, payload: &RawValue) -> Result<()>;

    /// Set whether the feature is active. False when gated off.
    fn set_active(&mut self, active: bool);

    /// Is this feature active? False if gated off.
    fn is_active(&self) -> bool;

    /// Attach or clear a recoverable error.
    fn set_error(&mut self, error: Option<Error>);

    /// The recoverable error from the last request cycle, if any.
    fn error(&self) -> Option<&Error>;
}

/// The session a batch of requests is made under.
///
/// Outlives any single batch. Session arguments and session identifiers are serialized
/// separately: arguments go into the batch envelope, identifiers into fire-and-forget envelopes.
pub trait SessionRequestable: Send {
    /// Write the session argument fields into `args`.
    fn serialize_args(&self, args: &mut JsonObject);

    /// Write the session-identifying fields into `ids`.
    fn serialize_ids(&self, ids: &mut JsonObject);

    /// Apply session mutations from the reply's `session` field.
    fn deserialize_response(&mut self, payload: &RawValue) -> Result<()>;

    /// Extra headers to send with every call made under this session.
    fn headers(&self) -> Vec<(String, String)> {
        Vec::new()
    }
}

/// Active/error state that [`Requestable`] implementations embed and delegate to.
#[derive(Debug, Default)]
pub struct FeatureState {
    active: bool,
    error: Option<Error>,
}

impl FeatureState {
    /// Create state for a request that hasn't been resolved yet: inactive, no error.
    pub fn new() -> FeatureState {
        FeatureState::default()
    }

    /// Is this feature active?
    pub fn is_active(&self) -> bool {
        self.active
    }

    /// Set whether the feature is active.
    pub fn set_active(&mut self, active: bool) {
        self.active = active;
    }

    /// The recoverable error from the last request cycle, if any.
    pub fn error(&self) -> Option<&Error> {
        self.error.as_ref()
    }

    /// Attach or clear a recoverable error.
    pub fn set_error(&mut self, error: Option<Error>) {
        self.error = error;
    }
}

/// Options that change the behavior of a single call to the impression server.
///
/// Immutable once built; attach one to a call with the methods that accept it.
///
/// # Examples
/// ```
/// # use impression_client::RequestOptions;
/// let options = RequestOptions::builder().ignore_missing_impression(true).build();
/// ```
#[derive(Debug, Clone, Default)]
pub struct RequestOptions {
    ignore_missing_impression: bool,
}

impl RequestOptions {
    /// Create a builder with default options.
    pub fn builder() -> RequestOptionsBuilder {
        RequestOptionsBuilder {
            options: RequestOptions::default(),
        }
    }

    /// Whether a 404/410 on a fire-and-forget call should be stifled.
    ///
    /// The impression an event refers to may no longer exist after a schema migration; setting
    /// this avoids log noise for those calls. Has no effect on the batch call, where a non-200 is
    /// always an error.
    pub fn ignore_missing_impression(&self) -> bool {
        self.ignore_missing_impression
    }

    pub(crate) fn to_json(&self) -> serde_json::Value {
        serde_json::json!({"ignore_missing_imp": self.ignore_missing_impression})
    }
}

/// Builder for [`RequestOptions`].
#[derive(Debug)]
pub struct RequestOptionsBuilder {
    options: RequestOptions,
}

impl RequestOptionsBuilder {
    /// Stifle 404/410 errors on fire-and-forget calls referring to impressions the server no
    /// longer knows about.
    pub fn ignore_missing_impression(mut self, ignore: bool) -> RequestOptionsBuilder {
        self.options.ignore_missing_impression = ignore;
        self
    }

    /// Build the options value.
    pub fn build(self) -> RequestOptions {
        self.options
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn feature_state_starts_inactive_without_error() {
        let state = FeatureState::new();
        assert!(!state.is_active());
        assert!(state.error().is_none());
    }

    #[test]
    fn options_serialize_with_wire_field_name() {
        let options = RequestOptions::builder().ignore_missing_impression(true).build();
        assert_eq!(
            options.to_json(),
            serde_json::json!({"ignore_missing_imp": true})
        );
    }
}
