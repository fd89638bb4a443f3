use std::time::Duration;

use crate::{ImpressionClient, Result};

/// Configuration for [`ImpressionClient`].
///
/// # Examples
/// ```no_run
/// # use impression_client::ClientConfig;
/// let client = ClientConfig::from_base_url("http://localhost:3004/iserver")
///     .delivery_workers(2)
///     .to_client()
///     .expect("failed to start delivery workers");
/// ```
#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub(crate) base_url: String,
    pub(crate) delivery_workers: usize,
    pub(crate) drain_grace: Duration,
}

impl ClientConfig {
    /// Environment variable consulted for the impression server base URL.
    pub const BASE_URL_ENV: &'static str = "IMPRESSION_SERVER_URL";

    /// Base URL used when none is configured and the environment doesn't provide one.
    pub const DEFAULT_BASE_URL: &'static str = "http://localhost:3004/iserver";

    /// Default number of background delivery workers.
    pub const DEFAULT_DELIVERY_WORKERS: usize = 4;

    /// Default grace period for draining fire-and-forget calls on shutdown.
    pub const DEFAULT_DRAIN_GRACE: Duration = Duration::from_secs(30);

    /// Create a configuration with the base URL taken from the environment.
    ///
    /// Reads [`ClientConfig::BASE_URL_ENV`]; falls back to the local default with a logged
    /// warning when unset.
    pub fn new() -> ClientConfig {
        let base_url = match std::env::var(ClientConfig::BASE_URL_ENV) {
            Ok(url) if !url.is_empty() => url,
            _ => {
                log::warn!(
                    target: "impressions",
                    "{} not set, using {}",
                    ClientConfig::BASE_URL_ENV,
                    ClientConfig::DEFAULT_BASE_URL,
                );
                ClientConfig::DEFAULT_BASE_URL.to_owned()
            }
        };
        ClientConfig::from_base_url(base_url)
    }

    /// Create a configuration with an explicit impression server base URL.
    pub fn from_base_url(base_url: impl Into<String>) -> ClientConfig {
        ClientConfig {
            base_url: base_url.into(),
            delivery_workers: ClientConfig::DEFAULT_DELIVERY_WORKERS,
            drain_grace: ClientConfig::DEFAULT_DRAIN_GRACE,
        }
    }

    /// Override the impression server base URL.
    pub fn base_url(mut self, base_url: impl Into<String>) -> ClientConfig {
        self.base_url = base_url.into();
        self
    }

    /// Set how many background workers drain fire-and-forget calls.
    pub fn delivery_workers(mut self, workers: usize) -> ClientConfig {
        self.delivery_workers = workers.max(1);
        self
    }

    /// Set how long shutdown waits for in-flight fire-and-forget calls.
    pub fn drain_grace(mut self, grace: Duration) -> ClientConfig {
        self.drain_grace = grace;
        self
    }

    /// Create a new [`ImpressionClient`] using this configuration.
    pub fn to_client(self) -> Result<ImpressionClient> {
        ImpressionClient::new(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_overrides_defaults() {
        let config = ClientConfig::from_base_url("http://example.test")
            .delivery_workers(2)
            .drain_grace(Duration::from_secs(1));

        assert_eq!(config.base_url, "http://example.test");
        assert_eq!(config.delivery_workers, 2);
        assert_eq!(config.drain_grace, Duration::from_secs(1));
    }

    #[test]
    fn delivery_workers_cannot_be_zero() {
        let config = ClientConfig::from_base_url("http://example.test").delivery_workers(0);
        assert_eq!(config.delivery_workers, 1);
    }
}
