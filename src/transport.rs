//! The HTTP transport seam.
//!
//! The protocol engine only needs "POST a JSON body, get a status and a body back"; everything
//! else (TLS, pooling, proxies) belongs to the transport. The default implementation wraps
//! `reqwest::blocking`; tests substitute their own.
use url::Url;

use crate::Result;

/// User agent sent on every call to the impression server.
pub const USER_AGENT: &str = concat!("impression-client/", env!("CARGO_PKG_VERSION"));

/// A raw HTTP reply: status code plus body text.
#[derive(Debug, Clone)]
pub struct HttpResponse {
    /// HTTP status code.
    pub status: u16,
    /// Response body, read to completion.
    pub body: String,
}

impl HttpResponse {
    /// Did the call succeed at the HTTP level?
    pub fn is_ok(&self) -> bool {
        self.status == 200
    }
}

/// Pluggable wire transport for calls to the impression server.
///
/// Implementations report connection-level failures through the error channel
/// ([`Error::Network`](crate::Error::Network) or [`Error::Cancelled`](crate::Error::Cancelled));
/// a reply with a non-200 status is returned as a normal [`HttpResponse`] — status
/// classification is the engine's job, not the transport's.
pub trait Transport: Send + Sync {
    /// POST `body` as JSON to `url`, returning the status and body text.
    fn post(&self, url: &Url, body: String, headers: &[(String, String)]) -> Result<HttpResponse>;
}

/// The default [`Transport`] over a blocking `reqwest` client.
pub struct HttpTransport {
    // Client holds a connection pool internally, so we're reusing the client between requests.
    client: reqwest::blocking::Client,
}

impl HttpTransport {
    /// Create a transport with a fresh connection pool.
    pub fn new() -> HttpTransport {
        HttpTransport {
            client: reqwest::blocking::Client::new(),
        }
    }
}

impl Default for HttpTransport {
    fn default() -> HttpTransport {
        HttpTransport::new()
    }
}

impl Transport for HttpTransport {
    fn post(&self, url: &Url, body: String, headers: &[(String, String)]) -> Result<HttpResponse> {
        let mut request = self
            .client
            .post(url.clone())
            .header("user-agent", USER_AGENT)
            .header("Content-Type", "application/json")
            .header("Accept", "text/plain")
            .body(body);
        for (name, value) in headers {
            request = request.header(name, value);
        }

        let response = request.send()?;
        let status = response.status().as_u16();
        let body = response.text()?;

        Ok(HttpResponse { status, body })
    }
}
