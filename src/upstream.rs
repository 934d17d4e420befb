//! HTTP client for the upstream market-data provider.
//!
//! Talks to a CoinGecko-compatible REST API. The client only transports: it
//! returns the raw JSON payload and leaves reshaping to [`crate::normalize`]
//! and retries to the dispatcher.

use std::time::Duration;

use async_trait::async_trait;
use eyre::{Result, WrapErr};
use serde_json::Value;

use crate::error::ProxyError;
use crate::normalize::VS_CURRENCY;

/// Public CoinGecko API root.
pub const DEFAULT_BASE_URL: &str = "https://api.coingecko.com/api/v3";

/// Header used to pass a demo-tier API key.
pub const DEFAULT_API_KEY_HEADER: &str = "x-cg-demo-api-key";

/// Default per-request timeout applied by the HTTP client.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

/// Source of raw market data.
///
/// Implemented by [`CoinGeckoClient`] in production and by stubs in tests.
#[async_trait]
pub trait MarketDataSource: Send + Sync {
    /// Fetch current USD quotes for the given provider ids.
    async fn fetch_snapshot(&self, asset_ids: &[String]) -> Result<Value, ProxyError>;

    /// Fetch a `[timestamp, price]` series covering the last `range_days` days.
    async fn fetch_chart(&self, asset_id: &str, range_days: u32) -> Result<Value, ProxyError>;

    /// Cheap reachability check.
    async fn ping(&self) -> Result<(), ProxyError>;
}

/// Connection settings for [`CoinGeckoClient`].
#[derive(Debug, Clone)]
pub struct UpstreamSettings {
    pub base_url: String,
    pub api_key: Option<String>,
    pub api_key_header: String,
    pub timeout: Duration,
}

impl Default for UpstreamSettings {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.to_string(),
            api_key: None,
            api_key_header: DEFAULT_API_KEY_HEADER.to_string(),
            timeout: DEFAULT_TIMEOUT,
        }
    }
}

/// CoinGecko REST client.
pub struct CoinGeckoClient {
    settings: UpstreamSettings,
    client: reqwest::Client,
}

impl CoinGeckoClient {
    pub fn new(settings: UpstreamSettings) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(settings.timeout)
            .user_agent(concat!("coinproxy/", env!("CARGO_PKG_VERSION")))
            .build()
            .wrap_err("failed to build upstream HTTP client")?;
        Ok(Self { settings, client })
    }

    fn snapshot_url(&self, asset_ids: &[String]) -> String {
        format!(
            "{}/simple/price?ids={}&vs_currencies={}&include_market_cap=true&include_24hr_vol=true&include_24hr_change=true",
            self.base(),
            asset_ids.join(","),
            VS_CURRENCY
        )
    }

    fn chart_url(&self, asset_id: &str, range_days: u32) -> String {
        format!(
            "{}/coins/{}/market_chart?vs_currency={}&days={}",
            self.base(),
            asset_id,
            VS_CURRENCY,
            range_days
        )
    }

    fn base(&self) -> &str {
        self.settings.base_url.trim_end_matches('/')
    }

    /// Issue one GET and decode the body as JSON.
    async fn get_json(&self, url: &str) -> Result<Value, ProxyError> {
        let mut request = self.client.get(url);
        if let Some(ref key) = self.settings.api_key {
            request = request.header(self.settings.api_key_header.as_str(), key);
        }

        let resp = request.send().await.map_err(|e| {
            let reason = if e.is_timeout() {
                "request timed out".to_string()
            } else {
                format!("request failed: {e}")
            };
            ProxyError::unavailable(e.status().map(|s| s.as_u16()), reason)
        })?;

        let status = resp.status();
        if !status.is_success() {
            return Err(ProxyError::unavailable(
                Some(status.as_u16()),
                format!("provider answered {status}"),
            ));
        }

        resp.json::<Value>()
            .await
            .map_err(|e| ProxyError::malformed(format!("body is not valid JSON: {e}")))
    }
}

#[async_trait]
impl MarketDataSource for CoinGeckoClient {
    async fn fetch_snapshot(&self, asset_ids: &[String]) -> Result<Value, ProxyError> {
        let url = self.snapshot_url(asset_ids);
        tracing::debug!(%url, "fetching snapshot");
        self.get_json(&url).await
    }

    async fn fetch_chart(&self, asset_id: &str, range_days: u32) -> Result<Value, ProxyError> {
        let url = self.chart_url(asset_id, range_days);
        tracing::debug!(%url, "fetching chart");
        self.get_json(&url).await
    }

    async fn ping(&self) -> Result<(), ProxyError> {
        let url = format!("{}/ping", self.base());
        self.get_json(&url).await.map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;
    use tokio::task::JoinHandle;

    fn client(base_url: &str) -> CoinGeckoClient {
        CoinGeckoClient::new(UpstreamSettings {
            base_url: base_url.to_string(),
            ..UpstreamSettings::default()
        })
        .unwrap()
    }

    /// Local server that answers one request with `response` and hands back
    /// the raw request head it received.
    async fn answer_once(response: &'static str) -> (String, JoinHandle<String>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let handle = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut head = Vec::new();
            let mut buf = [0u8; 1024];
            while !head.windows(4).any(|w| w == b"\r\n\r\n") {
                let n = socket.read(&mut buf).await.unwrap();
                if n == 0 {
                    break;
                }
                head.extend_from_slice(&buf[..n]);
            }
            socket.write_all(response.as_bytes()).await.unwrap();
            socket.shutdown().await.unwrap();
            String::from_utf8_lossy(&head).to_lowercase()
        });
        (format!("http://{addr}/api/v3"), handle)
    }

    #[test]
    fn test_snapshot_url() {
        let c = client("https://example.test/api/v3/");
        let url = c.snapshot_url(&["bitcoin".to_string(), "ethereum".to_string()]);
        assert_eq!(
            url,
            "https://example.test/api/v3/simple/price?ids=bitcoin,ethereum&vs_currencies=usd\
             &include_market_cap=true&include_24hr_vol=true&include_24hr_change=true"
        );
    }

    #[test]
    fn test_chart_url() {
        let c = client(DEFAULT_BASE_URL);
        assert_eq!(
            c.chart_url("solana", 30),
            "https://api.coingecko.com/api/v3/coins/solana/market_chart?vs_currency=usd&days=30"
        );
    }

    #[tokio::test]
    async fn test_chart_request_carries_api_key() {
        let body = r#"{"prices":[[1000,50000]]}"#;
        let response: &'static str = Box::leak(
            format!(
                "HTTP/1.1 200 OK\r\ncontent-type: application/json\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{}",
                body.len(),
                body
            )
            .into_boxed_str(),
        );
        let (base_url, server) = answer_once(response).await;
        let c = CoinGeckoClient::new(UpstreamSettings {
            base_url,
            api_key: Some("demo-key".to_string()),
            ..UpstreamSettings::default()
        })
        .unwrap();

        let raw = c.fetch_chart("bitcoin", 7).await.unwrap();
        assert_eq!(raw["prices"][0][1], 50000);

        let head = server.await.unwrap();
        assert!(head.starts_with("get /api/v3/coins/bitcoin/market_chart?vs_currency=usd&days=7 "));
        assert!(head.contains("x-cg-demo-api-key: demo-key"));
    }

    #[tokio::test]
    async fn test_non_success_status_is_unavailable() {
        let (base_url, server) = answer_once(
            "HTTP/1.1 503 Service Unavailable\r\ncontent-length: 0\r\nconnection: close\r\n\r\n",
        )
        .await;
        let err = client(&base_url).fetch_chart("bitcoin", 7).await.unwrap_err();
        assert_eq!(err, ProxyError::unavailable(Some(503), "provider answered 503 Service Unavailable"));
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_non_json_body_is_malformed() {
        let (base_url, server) = answer_once(
            "HTTP/1.1 200 OK\r\ncontent-type: text/html\r\ncontent-length: 9\r\nconnection: close\r\n\r\n<html/>\r\n",
        )
        .await;
        let err = client(&base_url).fetch_chart("bitcoin", 7).await.unwrap_err();
        assert!(matches!(err, ProxyError::MalformedUpstreamResponse(_)));
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_closed_port_is_unavailable_without_status() {
        // Bind then drop to get a local port nothing listens on.
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let err = client(&format!("http://{addr}"))
            .fetch_chart("bitcoin", 7)
            .await
            .unwrap_err();
        assert!(matches!(err, ProxyError::UpstreamUnavailable { status: None, .. }));
    }
}
