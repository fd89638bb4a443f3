//! Encoding of batch/signal/external envelopes and decoding of the streamed reply.
//!
//! The reply is read in a single forward pass: the `impressions` array is borrowed slot-by-slot
//! as raw JSON, so a malformed slot is skipped wholesale and the remaining slots stay
//! position-aligned. Correlation between requests and reply slots is purely positional — slot N
//! belongs to request N.
use serde::Deserialize;
use serde_json::value::RawValue;

use crate::request::{JsonObject, Requestable, SessionRequestable};
use crate::{Error, RequestOptions, Result};

/// The decoded state of one reply slot.
#[derive(Debug)]
pub enum Outcome<'a> {
    /// The feature is on; the payload should be deserialized into the request.
    Active(&'a RawValue),
    /// The feature is gated "OFF". Not an error.
    Inactive,
    /// The server does not recognize the feature yet. Expected during schema migration, not an
    /// error.
    Unknown,
    /// The slot was neither a gate string nor an object. The value has been skipped; subsequent
    /// slots are unaffected.
    Malformed,
}

/// A decoded reply: one outcome per request, in request order, plus the optional session
/// mutations and the parallel server-reported error list.
#[derive(Debug)]
pub struct Reply<'a> {
    /// Session mutations, when the server sent any.
    pub session: Option<&'a RawValue>,
    /// Exactly one outcome per request in the batch.
    pub outcomes: Vec<Outcome<'a>>,
    /// Server-reported errors, index-aligned with `outcomes`. `None` means no additional error
    /// for that slot.
    pub errors: Vec<Option<String>>,
}

/// Encode a batch of feature requests into the `/features` envelope.
///
/// Request order is preserved exactly as given; decode correlates by position.
pub fn encode_batch(
    session: &dyn SessionRequestable,
    requests: &[&mut (dyn Requestable + '_)],
    impression_id: &str,
    options: Option<&RequestOptions>,
) -> String {
    let mut doc = JsonObject::new();

    let mut args = JsonObject::new();
    session.serialize_args(&mut args);
    doc.insert("args".to_owned(), args.into());
    doc.insert("impressionId".to_owned(), impression_id.into());
    if let Some(options) = options {
        doc.insert("options".to_owned(), options.to_json());
    }

    let reqs: Vec<serde_json::Value> = requests
        .iter()
        .map(|request| {
            let mut req = JsonObject::new();
            req.insert("name".to_owned(), request.feature_name().into());
            let mut args = JsonObject::new();
            request.serialize_args(&mut args);
            req.insert("args".to_owned(), args.into());
            req.into()
        })
        .collect();
    doc.insert("reqs".to_owned(), reqs.into());

    to_string(&doc)
}

/// Encode a fire-and-forget event signal for the `/signal` endpoint.
///
/// The payload fields are spliced in after the session ids.
pub fn encode_signal(
    session: &dyn SessionRequestable,
    payload: JsonObject,
    options: Option<&RequestOptions>,
) -> String {
    let mut doc = JsonObject::new();
    doc.insert("id".to_owned(), session_ids(session).into());
    for (key, value) in payload {
        doc.insert(key, value);
    }
    if let Some(options) = options {
        doc.insert("options".to_owned(), options.to_json());
    }
    to_string(&doc)
}

/// Encode an out-of-band value write for the `/external` endpoint.
pub fn encode_external(
    session: &dyn SessionRequestable,
    impression_ids: &[String],
    feature_name: &str,
    field_name: &str,
    value: serde_json::Value,
) -> String {
    let mut doc = JsonObject::new();
    doc.insert("id".to_owned(), session_ids(session).into());
    doc.insert("feature".to_owned(), feature_name.into());
    if let Some(first) = impression_ids.first() {
        doc.insert("impressionId".to_owned(), first.as_str().into());
    }
    doc.insert(field_name.to_owned(), value);
    to_string(&doc)
}

/// Serialize the session-identifying fields as a standalone object. Used for envelopes and for
/// attributing fire-and-forget log lines.
pub fn session_ids(session: &dyn SessionRequestable) -> JsonObject {
    let mut ids = JsonObject::new();
    session.serialize_ids(&mut ids);
    ids
}

fn to_string(doc: &JsonObject) -> String {
    // Serializing a JSON object to a string cannot fail.
    serde_json::to_string(doc).expect("serializing an in-memory document should not fail")
}

#[derive(Deserialize)]
struct WireReply<'a> {
    #[serde(borrow, default)]
    session: Option<&'a RawValue>,
    #[serde(borrow)]
    impressions: Vec<&'a RawValue>,
    #[serde(default)]
    errors: Vec<Option<String>>,
}

/// Decode a `/features` reply body against a batch of `expected` requests.
///
/// # Errors
///
/// - [`Error::Malformed`] if the body is not valid JSON of the expected top-level shape. The
///   stream position is unrecoverable, so the caller must fail the whole batch.
/// - [`Error::ResponseTooShort`] if `impressions` holds fewer slots than `expected`.
///
/// Per-slot problems do not fail decode; they surface as [`Outcome::Malformed`].
pub fn decode_reply(body: &str, expected: usize) -> Result<Reply<'_>> {
    let wire: WireReply = serde_json::from_str(body)
        .map_err(|err| Error::Malformed(err.to_string()))?;

    if wire.impressions.len() < expected {
        return Err(Error::ResponseTooShort);
    }

    let outcomes = wire
        .impressions
        .into_iter()
        .take(expected)
        .map(classify_slot)
        .collect();

    Ok(Reply {
        session: wire.session,
        outcomes,
        errors: wire.errors,
    })
}

fn classify_slot(raw: &RawValue) -> Outcome<'_> {
    let text = raw.get().trim();
    if text.starts_with('{') {
        Outcome::Active(raw)
    } else if text == "\"OFF\"" {
        Outcome::Inactive
    } else if text == "\"UNKNOWN\"" {
        Outcome::Unknown
    } else {
        Outcome::Malformed
    }
}
