use async_trait::async_trait;
use std::time::Duration;
use tracing::{debug, warn};

/// Default URL polled to decide whether the internet is reachable
pub const DEFAULT_CONNECTIVITY_CHECK_URL: &str =
    "https://internet-up.ably-realtime.com/is-the-internet-up.txt";

/// Independent reachability check consulted before using a fallback host
#[async_trait]
pub trait ConnectivityProbe: Send + Sync {
    async fn is_reachable(&self) -> bool;
}

/// Probe that fetches a well-known URL and expects a body containing "yes"
pub struct HttpConnectivityProbe {
    client: reqwest::Client,
    url: String,
}

impl HttpConnectivityProbe {
    pub fn new(url: impl Into<String>, timeout: Duration) -> Self {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        Self {
            client,
            url: url.into(),
        }
    }
}

impl Default for HttpConnectivityProbe {
    fn default() -> Self {
        Self::new(DEFAULT_CONNECTIVITY_CHECK_URL, Duration::from_secs(10))
    }
}

#[async_trait]
impl ConnectivityProbe for HttpConnectivityProbe {
    async fn is_reachable(&self) -> bool {
        let response = match self.client.get(&self.url).send().await {
            Ok(response) => response,
            Err(e) => {
                warn!("Connectivity check to {} failed: {}", self.url, e);
                return false;
            }
        };

        if !response.status().is_success() {
            debug!("Connectivity check returned {}", response.status());
            return false;
        }

        match response.text().await {
            Ok(body) => body.contains("yes"),
            Err(e) => {
                warn!("Connectivity check body unreadable: {}", e);
                false
            }
        }
    }
}

/// Probe with a fixed answer
pub struct StaticConnectivity(pub bool);

#[async_trait]
impl ConnectivityProbe for StaticConnectivity {
    async fn is_reachable(&self) -> bool {
        self.0
    }
}
