//! Fetching raw metrics documents from scrape targets.
//!
//! A fetch is a single, timeout-bounded attempt. Retrying, proxies and TLS
//! settings beyond the defaults are left to the deployment.

use reqwest::header::{ACCEPT, CONTENT_TYPE};
use reqwest::RequestBuilder;
use std::fmt;
use std::future::Future;
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

use crate::discovery::Instance;
use crate::model::{ContentType, FetchResult};

/// Routes a request to one specific app instance behind a shared route.
pub const INSTANCE_HEADER: &str = "X-CF-APP-INSTANCE";

/// Identifies the gateway that sent a scrape request.
pub const GATEWAY_INSTANCE_HEADER: &str = "X-Herakles-Gateway-Instance";

const ACCEPT_VALUE: &str = "application/openmetrics-text; version=1.0.0; q=0.9, \
                            text/plain; version=0.0.4; q=0.5, */*; q=0.1";

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("building HTTP client failed: {0}")]
    Client(#[source] reqwest::Error),

    #[error("connecting to {url} failed: {source}")]
    Connect {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("fetching {url} timed out after {timeout:?}")]
    Timeout { url: String, timeout: Duration },

    #[error("{url} responded with status {status}")]
    Status { url: String, status: u16 },

    #[error("reading response body from {url} failed: {source}")]
    Body {
        url: String,
        #[source]
        source: reqwest::Error,
    },
}

/// Transport used to fetch one instance's metrics.
pub trait Fetcher: Send + Sync + 'static {
    fn fetch(
        &self,
        instance: &Instance,
        timeout: Duration,
    ) -> impl Future<Output = Result<FetchResult, FetchError>> + Send;
}

/// Authentication applied to outbound scrape requests.
#[derive(Clone, PartialEq, Eq, Default)]
pub enum AuthEnricher {
    #[default]
    None,
    Basic {
        username: String,
        password: String,
    },
}

impl AuthEnricher {
    pub fn apply(&self, request: RequestBuilder) -> RequestBuilder {
        match self {
            Self::None => request,
            Self::Basic { username, password } => request.basic_auth(username, Some(password)),
        }
    }
}

impl fmt::Debug for AuthEnricher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::None => f.write_str("None"),
            Self::Basic { username, .. } => f
                .debug_struct("Basic")
                .field("username", username)
                .field("password", &"***")
                .finish(),
        }
    }
}

/// reqwest-backed fetcher.
pub struct HttpFetcher {
    client: reqwest::Client,
    gateway_instance: String,
}

impl HttpFetcher {
    /// `gateway_instance` is sent along with every request so the gateway can
    /// recognise requests it sent to itself.
    pub fn new(gateway_instance: impl Into<String>) -> Result<Self, FetchError> {
        let client = reqwest::Client::builder()
            .user_agent(concat!("herakles-scrape-gateway/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(FetchError::Client)?;
        Ok(Self {
            client,
            gateway_instance: gateway_instance.into(),
        })
    }
}

impl Fetcher for HttpFetcher {
    async fn fetch(
        &self,
        instance: &Instance,
        timeout: Duration,
    ) -> Result<FetchResult, FetchError> {
        let url = instance.access_url.as_str();
        debug!("Fetching {} (instance {})", url, instance.instance_id);

        let request = self
            .client
            .get(url)
            .header(INSTANCE_HEADER, &instance.instance_id)
            .header(GATEWAY_INSTANCE_HEADER, &self.gateway_instance)
            .header(ACCEPT, ACCEPT_VALUE)
            .timeout(timeout);
        let request = instance.auth.apply(request);

        let response = request.send().await.map_err(|e| {
            if e.is_timeout() {
                FetchError::Timeout {
                    url: url.to_string(),
                    timeout,
                }
            } else {
                FetchError::Connect {
                    url: url.to_string(),
                    source: e,
                }
            }
        })?;

        let status = response.status();
        if !status.is_success() {
            return Err(FetchError::Status {
                url: url.to_string(),
                status: status.as_u16(),
            });
        }

        let content_type = ContentType::from_header(
            response
                .headers()
                .get(CONTENT_TYPE)
                .and_then(|v| v.to_str().ok()),
        );

        let data = response.text().await.map_err(|e| {
            if e.is_timeout() {
                FetchError::Timeout {
                    url: url.to_string(),
                    timeout,
                }
            } else {
                FetchError::Body {
                    url: url.to_string(),
                    source: e,
                }
            }
        })?;

        Ok(FetchResult::new(data, content_type))
    }
}
