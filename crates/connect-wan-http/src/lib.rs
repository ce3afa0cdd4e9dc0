// # HTTP WAN Resolver
//
// This crate resolves the appliance's public address by asking an HTTP
// echo service (e.g. api.ipify.org) which address the request came from.
//
// ## Behavior
//
// - Services are tried in order; the first valid answer wins
// - An answer is cached for a short time, since every access URL lookup
//   would otherwise cost a round trip
// - Bodies must be a bare IP address (surrounding whitespace is ignored)

use async_trait::async_trait;
use connect_core::traits::WanResolver;
use connect_core::{Error, Result};

use std::net::IpAddr;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::time::Instant;

/// Services queried when none are configured
pub const DEFAULT_SERVICES: &[&str] = &[
    "https://api.ipify.org",  // returns plain text IP
    "https://ifconfig.me/ip", // No rate limit documented
    "https://icanhazip.com",  // No rate limit documented
];

/// How long a resolved address is reused
const DEFAULT_CACHE_TTL_SECS: u64 = 300;

/// Per-request timeout
const REQUEST_TIMEOUT_SECS: u64 = 10;

/// WAN resolver backed by HTTP echo services
pub struct HttpWanResolver {
    /// Services to query, in order
    services: Vec<String>,

    /// How long a resolved address stays fresh
    cache_ttl: Duration,

    /// Last resolved address and when it was fetched
    cached: Mutex<Option<(IpAddr, Instant)>>,

    /// HTTP client
    client: reqwest::Client,
}

impl HttpWanResolver {
    /// Create a resolver querying `services` in order
    ///
    /// An empty list falls back to [`DEFAULT_SERVICES`].
    pub fn new(services: Vec<String>) -> Self {
        let services = if services.is_empty() {
            DEFAULT_SERVICES.iter().map(|s| s.to_string()).collect()
        } else {
            services
        };

        Self {
            services,
            cache_ttl: Duration::from_secs(DEFAULT_CACHE_TTL_SECS),
            cached: Mutex::new(None),
            client: reqwest::Client::builder()
                .timeout(Duration::from_secs(REQUEST_TIMEOUT_SECS))
                .build()
                .unwrap_or_default(),
        }
    }

    /// Override the cache lifetime
    pub fn with_cache_ttl(mut self, cache_ttl: Duration) -> Self {
        self.cache_ttl = cache_ttl;
        self
    }

    /// Services queried by this resolver
    pub fn services(&self) -> &[String] {
        &self.services
    }

    /// Fetch the address from one service
    async fn fetch(&self, url: &str) -> Result<IpAddr> {
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| Error::network(format!("Request to {} failed: {}", url, e)))?;

        if !response.status().is_success() {
            return Err(Error::network(format!(
                "{} answered HTTP {}",
                url,
                response.status()
            )));
        }

        let body = response
            .text()
            .await
            .map_err(|e| Error::network(format!("Failed to read response from {}: {}", url, e)))?;

        parse_ip_body(&body)
    }
}

/// Parse an echo-service response body
pub fn parse_ip_body(body: &str) -> Result<IpAddr> {
    let text = body.trim();
    text.parse()
        .map_err(|_| Error::protocol(format!("Invalid IP address: {:?}", text)))
}

#[async_trait]
impl WanResolver for HttpWanResolver {
    async fn public_ip(&self) -> Result<IpAddr> {
        let mut cached = self.cached.lock().await;
        if let Some((ip, fetched_at)) = *cached {
            if fetched_at.elapsed() < self.cache_ttl {
                return Ok(ip);
            }
        }

        let mut last_error = None;
        for url in &self.services {
            match self.fetch(url).await {
                Ok(ip) => {
                    tracing::debug!(%ip, service = %url, "Resolved WAN address");
                    *cached = Some((ip, Instant::now()));
                    return Ok(ip);
                }
                Err(e) => {
                    tracing::warn!("WAN address lookup failed: {}", e);
                    last_error = Some(e);
                }
            }
        }

        Err(last_error.unwrap_or_else(|| Error::config("No WAN address services configured")))
    }
}
