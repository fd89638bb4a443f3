use std::sync::Arc;

/// Result type used throughout the impression client.
///
/// This `Result` type is a standard Rust `Result` type where the error variant is defined by the
/// crate-specific [`Error`] enum.
pub type Result<T> = std::result::Result<T, Error>;

/// Enum representing possible errors that can occur when talking to the impression server.
///
/// Batch-wide errors (transport, status, protocol) are both returned from the call and attached to
/// every request in the batch. Per-feature errors are only attached to the affected request and
/// surfaced through [`Requestable::error`](crate::Requestable::error).
#[derive(thiserror::Error, Debug, Clone)]
#[non_exhaustive]
pub enum Error {
    /// Invalid base_url configuration.
    #[error("invalid base_url configuration")]
    InvalidBaseUrl(#[source] url::ParseError),

    /// Transport-level failure: connection refused, timeout, broken stream.
    #[error(transparent)]
    // reqwest::Error is not clonable, so we're wrapping it in an Arc.
    Network(Arc<reqwest::Error>),

    /// The server replied with a non-200 status code.
    #[error("error code {code} from server: {body}")]
    Status {
        /// HTTP status code.
        code: u16,
        /// Response body, verbatim.
        body: String,
    },

    /// The reply could not be decoded. Stream position is unrecoverable, so this error is applied
    /// to every request in the batch.
    #[error("malformed response, using control: {0}")]
    Malformed(String),

    /// The impressions array held fewer entries than the batch had requests.
    #[error("response too short, using control values")]
    ResponseTooShort,

    /// A single request's payload could not be decoded. Scoped to one request; the rest of the
    /// batch is unaffected.
    #[error("error parsing response for {feature}, reverting to control")]
    FeatureDecode {
        /// Name of the affected feature.
        feature: String,
        /// Underlying decode failure.
        #[source]
        source: Box<Error>,
    },

    /// An error string reported by the server for a single request.
    #[error("{0}")]
    ServerReported(String),

    /// The transport call was cancelled before completing.
    #[error("request cancelled")]
    Cancelled,

    /// The detached batch thread panicked. This should normally never happen.
    #[error("batch thread panicked")]
    BatchPanicked,

    /// Attempt to read a mutable value whose history is empty.
    #[error("attempt to retrieve a value that was not set")]
    ValueUnset,

    /// A JSON (de)serialization error.
    #[error(transparent)]
    // serde_json::Error is not clonable, so we're wrapping it in an Arc.
    Json(Arc<serde_json::Error>),

    /// An I/O error.
    #[error(transparent)]
    // std::io::Error is not clonable, so we're wrapping it in an Arc.
    Io(Arc<std::io::Error>),
}

impl From<std::io::Error> for Error {
    fn from(value: std::io::Error) -> Self {
        Self::Io(Arc::new(value))
    }
}

impl From<reqwest::Error> for Error {
    fn from(value: reqwest::Error) -> Self {
        Error::Network(Arc::new(value.without_url()))
    }
}

impl From<serde_json::Error> for Error {
    fn from(value: serde_json::Error) -> Self {
        Error::Json(Arc::new(value))
    }
}
