//! Client SDK for an impression server — a remote service that decides feature state per
//! session and logs the events applications report back.
//!
//! # Overview
//!
//! [`ImpressionClient`] is the protocol engine. One batch call bundles a session plus N feature
//! requests into a single `POST /features`; the streamed JSON reply is decoded back into one
//! outcome per request, in request order. An outcome is one of: active (the request object is
//! populated with the server's payload), gated "OFF" or "UNKNOWN" (the request stays inactive —
//! not an error, callers fall back to control values), or a per-feature error attached to that
//! request alone. Batch-wide failures (transport, non-200 status, undecodable reply) are both
//! returned from the call and attached to every request, so no request is ever left ambiguous.
//!
//! Feature and session objects take part through the [`Requestable`] and [`SessionRequestable`]
//! traits: they carry their own argument serialization and payload deserialization, so the
//! engine never needs to know their fields. Generated code typically embeds [`FeatureState`]
//! for the active/error bookkeeping.
//!
//! Fire-and-forget calls — [`ImpressionClient::signal`], [`ImpressionClient::keep_alive`],
//! [`ImpressionClient::write_external`] — are queued to a small pool of background workers
//! ([`delivery::DeliveryPool`]) owned by the client. [`ImpressionClient::shutdown`] drains that
//! pool with a bounded grace period so in-flight events land before the process exits; delivery
//! failures are logged, never raised.
//!
//! [`registry::RequestRegistry`] memoizes resolved requests: asking for the same feature with
//! the same arguments again replays the recorded payload instead of another wire call.
//! [`history::MutableHistory`] is the append-only, time-stamped log behind mutable session
//! fields.
//!
//! # Blocking and detached calls
//!
//! [`ImpressionClient::request`] blocks the caller and surfaces the first batch-wide error.
//! [`ImpressionClient::request_detached`] runs the same cycle on a dedicated thread against
//! `Arc<Mutex<_>>`-shared objects and returns a [`BatchHandle`]; outcome side effects are
//! applied even if the handle is dropped without waiting.
//!
//! # Error handling
//!
//! Errors are represented by the [`Error`] enum. Gating is not an error: a request that comes
//! back "OFF" or "UNKNOWN" is simply inactive, and callers should use their control values.
//!
//! # Logging
//!
//! The crate uses the [`log`](https://docs.rs/log/latest/log/) crate (target `impressions`).
//! Fire-and-forget outcomes are only observable there, so consider installing a logger.

#![warn(rustdoc::missing_crate_level_docs)]
#![warn(missing_docs)]

pub mod delivery;
pub mod history;
pub mod registry;
pub mod transport;
pub mod wire;

mod client;
mod config;
mod error;
mod request;

pub use client::{BatchHandle, ImpressionClient, SharedRequest, SharedSession};
pub use config::ClientConfig;
pub use error::{Error, Result};
pub use request::{
    FeatureState, JsonObject, RequestOptions, RequestOptionsBuilder, Requestable,
    SessionRequestable,
};
