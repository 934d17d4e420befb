//! HTTP server for the coinproxy market-data proxy.
//!
//! Exposes one GET endpoint per query shape plus health and metrics. This is
//! the only layer that turns [`ProxyError`]s into status codes.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::net::{IpAddr, SocketAddr};
use std::num::NonZeroU32;
use std::sync::Arc;
use std::time::Instant;

use axum::extract::{ConnectInfo, Query, Request, State};
use axum::http::{header, HeaderMap, HeaderName, HeaderValue, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Extension, Json, Router};
use eyre::Result;
use governor::{Quota, RateLimiter};
use metrics_exporter_prometheus::PrometheusHandle;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::auth::CallerId;
use crate::cache::ProxyCache;
use crate::dispatcher::{CachePolicy, CacheStatus, ProxyDispatcher, Served};
use crate::error::ProxyError;
use crate::types::{AssetCatalog, PricePoint, SnapshotPrice};
use crate::upstream::{CoinGeckoClient, MarketDataSource, UpstreamSettings};

/// Response header reporting HIT / MISS / STALE.
pub const X_CACHE: &str = "x-cache";

/// Server configuration
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind to
    pub bind_addr: SocketAddr,
    /// Rate limit in requests per minute per IP (0 = no limit)
    pub rate_limit_rpm: u32,
    /// Allowed CORS origins (None/empty = allow any)
    pub allowed_origins: Option<Vec<String>>,
    /// API keys for authentication (None/empty = no auth)
    pub api_keys: Option<Vec<String>>,
    /// Upstream provider connection
    pub upstream: UpstreamSettings,
    /// TTLs, coalescing, retries and stale fallback
    pub policy: CachePolicy,
    /// Tracked assets
    pub catalog: AssetCatalog,
    /// Asset served by the fixed chart endpoint
    pub chart_asset: String,
    /// Maximum cache keys
    pub cache_max_entries: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([127, 0, 0, 1], 8080)),
            rate_limit_rpm: 120,
            allowed_origins: None,
            api_keys: None,
            upstream: UpstreamSettings::default(),
            policy: CachePolicy::default(),
            catalog: AssetCatalog::default(),
            chart_asset: "bitcoin".to_string(),
            cache_max_entries: 1000,
        }
    }
}

impl ServerConfig {
    /// Reject configurations the dispatcher cannot serve.
    pub fn validate(&self) -> Result<()> {
        if self.catalog.is_empty() {
            eyre::bail!("tracked asset list is empty");
        }
        if self.catalog.find(&self.chart_asset).is_none() {
            eyre::bail!(
                "chart asset '{}' is not a tracked asset",
                self.chart_asset
            );
        }
        if self.policy.upstream_timeout.is_zero() {
            eyre::bail!("upstream timeout must be positive");
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Response bodies
// ---------------------------------------------------------------------------

/// Body of every failed request.
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorBody {
    pub error: String,
}

impl ErrorBody {
    pub fn new(error: impl Into<String>) -> Self {
        Self {
            error: error.into(),
        }
    }
}

/// A USD price serialized as a JSON number with its exact decimal text.
#[derive(Debug, Serialize)]
#[serde(transparent)]
struct UsdPrice(#[serde(with = "rust_decimal::serde::arbitrary_precision")] Decimal);

/// `[timestamp, price]` pair of the price-history body.
#[derive(Debug, Serialize)]
struct PricePair(
    i64,
    #[serde(with = "rust_decimal::serde::arbitrary_precision")] Decimal,
);

#[derive(Debug, Serialize)]
struct PriceHistoryBody {
    prices: Vec<PricePair>,
}

fn prices_body(snapshot: &[SnapshotPrice]) -> BTreeMap<String, UsdPrice> {
    snapshot
        .iter()
        .map(|p| (p.asset_symbol.clone(), UsdPrice(p.usd_price)))
        .collect()
}

fn history_body(points: &[PricePoint]) -> PriceHistoryBody {
    PriceHistoryBody {
        prices: points.iter().map(|p| PricePair(p.timestamp, p.price)).collect(),
    }
}

/// Health check response
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub uptime_seconds: u64,
    pub upstream_reachable: bool,
    pub tracked_assets: Vec<String>,
    pub cached_keys: u64,
}

// ---------------------------------------------------------------------------
// State
// ---------------------------------------------------------------------------

/// Type alias for per-IP rate limiters
type IpRateLimiter = RateLimiter<
    governor::state::NotKeyed,
    governor::state::InMemoryState,
    governor::clock::DefaultClock,
>;

/// Server state
pub struct ServerState {
    pub config: ServerConfig,
    pub start_time: Instant,
    pub rate_limiters: Mutex<HashMap<IpAddr, Arc<IpRateLimiter>>>,
    pub dispatcher: ProxyDispatcher,
}

impl ServerState {
    /// State backed by the live CoinGecko client.
    pub fn new(config: ServerConfig) -> Result<Self> {
        let source = Arc::new(CoinGeckoClient::new(config.upstream.clone())?);
        Ok(Self::with_source(config, source))
    }

    /// State backed by any market-data source, with a fresh cache.
    pub fn with_source(config: ServerConfig, source: Arc<dyn MarketDataSource>) -> Self {
        let cache = Arc::new(ProxyCache::new(config.cache_max_entries));
        let dispatcher = ProxyDispatcher::new(
            source,
            cache,
            config.catalog.clone(),
            config.chart_asset.clone(),
            config.policy.clone(),
        );

        Self {
            config,
            start_time: Instant::now(),
            rate_limiters: Mutex::new(HashMap::new()),
            dispatcher,
        }
    }

    pub async fn get_rate_limiter(&self, ip: IpAddr) -> Option<Arc<IpRateLimiter>> {
        let rpm = NonZeroU32::new(self.config.rate_limit_rpm)?;

        let mut limiters = self.rate_limiters.lock().await;

        if let Some(limiter) = limiters.get(&ip) {
            return Some(Arc::clone(limiter));
        }

        let limiter = Arc::new(RateLimiter::direct(Quota::per_minute(rpm)));
        limiters.insert(ip, Arc::clone(&limiter));

        if limiters.len() > 10000 {
            tracing::warn!("rate limiter map exceeded 10000 entries, clearing");
            limiters.clear();
            limiters.insert(ip, Arc::clone(&limiter));
        }

        Some(limiter)
    }
}

// ---------------------------------------------------------------------------
// Router
// ---------------------------------------------------------------------------

/// Build the application router.
///
/// `metrics` mounts `GET /metrics` when a Prometheus recorder is installed.
pub fn build_router(state: Arc<ServerState>, metrics: Option<PrometheusHandle>) -> Router {
    let api_keys: crate::auth::ApiKeySet = Arc::new(
        state
            .config
            .api_keys
            .clone()
            .unwrap_or_default()
            .into_iter()
            .collect::<HashSet<_>>(),
    );

    let cors = match &state.config.allowed_origins {
        Some(origins) if !origins.is_empty() => {
            let allowed: Vec<HeaderValue> =
                origins.iter().filter_map(|o| o.parse().ok()).collect();
            CorsLayer::new()
                .allow_origin(allowed)
                .allow_methods([axum::http::Method::GET])
                .allow_headers([
                    header::CONTENT_TYPE,
                    HeaderName::from_static("x-api-key"),
                ])
        }
        _ => CorsLayer::new()
            .allow_origin(Any)
            .allow_methods([axum::http::Method::GET])
            .allow_headers(Any),
    };

    // Proxy routes (API key when configured, per-IP rate limit)
    let proxy = Router::new()
        .route("/api/prices", get(current_prices_handler))
        .route("/api/chart", get(chart_handler))
        .route("/api/price-history", get(price_history_handler))
        .route_layer(middleware::from_fn_with_state(
            state.clone(),
            rate_limit,
        ))
        .route_layer(middleware::from_fn_with_state(
            api_keys,
            crate::auth::require_api_key,
        ))
        .with_state(state.clone());

    // Open routes (health, metrics)
    let mut open = Router::new().route("/health", get(health_handler));
    if let Some(handle) = metrics {
        open = open.route(
            "/metrics",
            get(move || {
                let handle = handle.clone();
                async move { handle.render() }
            }),
        );
    }
    let open = open.with_state(state);

    Router::new()
        .merge(open)
        .merge(proxy)
        .layer(cors)
        .layer(TraceLayer::new_for_http())
}

/// Run the HTTP server
pub async fn run_server(config: ServerConfig) -> Result<()> {
    config.validate()?;
    let prometheus_handle = crate::metrics::install_prometheus_recorder()?;

    let bind_addr = config.bind_addr;
    let rate_limit_rpm = config.rate_limit_rpm;
    let has_api_keys = config.api_keys.as_ref().is_some_and(|k| !k.is_empty());
    let policy = config.policy.clone();

    let state = Arc::new(ServerState::new(config)?);
    let app = build_router(state, Some(prometheus_handle));

    let listener = tokio::net::TcpListener::bind(bind_addr).await?;
    tracing::info!("coinproxy server listening on {}", bind_addr);
    tracing::info!("Endpoints: GET /health, GET /metrics, GET /api/prices, GET /api/chart, GET /api/price-history");
    tracing::info!(
        snapshot_ttl_secs = policy.snapshot_ttl.as_secs(),
        series_ttl_secs = policy.series_ttl.as_secs(),
        serve_stale_on_error = policy.serve_stale_on_error,
        coalesce = policy.coalesce,
        "cache policy configured"
    );
    if rate_limit_rpm > 0 {
        tracing::info!(rate_limit_rpm, "rate limiting enabled");
    }
    if has_api_keys {
        tracing::info!("API key authentication enabled");
    }

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Middleware
// ---------------------------------------------------------------------------

/// Per-IP rate limiting. Requests without connection info are not limited.
async fn rate_limit(State(state): State<Arc<ServerState>>, request: Request, next: Next) -> Response {
    let client_ip = request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| addr.ip());

    if let Some(client_ip) = client_ip {
        if let Some(limiter) = state.get_rate_limiter(client_ip).await {
            if limiter.check().is_err() {
                tracing::warn!(%client_ip, "rate limit exceeded");
                crate::metrics::record_rate_limit_hit();
                return (
                    StatusCode::TOO_MANY_REQUESTS,
                    Json(ErrorBody::new(format!(
                        "Rate limit exceeded. Maximum {} requests per minute.",
                        state.config.rate_limit_rpm
                    ))),
                )
                    .into_response();
            }
        }
    }

    next.run(request).await
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

/// Query parameters of the price-history endpoint. Kept as raw strings so
/// validation errors produce the JSON error body.
#[derive(Debug, Deserialize)]
pub struct HistoryParams {
    pub id: Option<String>,
    pub days: Option<String>,
}

fn caller_of(caller: &Option<Extension<CallerId>>) -> String {
    caller
        .as_ref()
        .map(|Extension(id)| id.0.clone())
        .unwrap_or_else(|| CallerId::anonymous().0)
}

/// Current prices handler: `{ "<SYMBOL>": usdPrice, ... }`
async fn current_prices_handler(
    State(state): State<Arc<ServerState>>,
    caller: Option<Extension<CallerId>>,
) -> Response {
    let caller = caller_of(&caller);
    match state.dispatcher.current_prices().await {
        Ok(served) => {
            tracing::debug!(%caller, cache = served.status.as_str(), "current prices served");
            cached_json(&served, prices_body(&served.payload))
        }
        Err(err) => error_response(&err, false),
    }
}

/// Fixed 7-day chart handler: `[ { "timestamp", "price" }, ... ]`
async fn chart_handler(
    State(state): State<Arc<ServerState>>,
    caller: Option<Extension<CallerId>>,
) -> Response {
    let caller = caller_of(&caller);
    match state.dispatcher.chart().await {
        Ok(served) => {
            tracing::debug!(%caller, cache = served.status.as_str(), "chart served");
            cached_json(&served, served.payload.as_slice())
        }
        Err(err) => error_response(&err, false),
    }
}

/// Price history handler: `{ "prices": [[timestamp, price], ...] }`
async fn price_history_handler(
    State(state): State<Arc<ServerState>>,
    caller: Option<Extension<CallerId>>,
    Query(params): Query<HistoryParams>,
) -> Response {
    let caller = caller_of(&caller);
    match state
        .dispatcher
        .price_history(params.id.as_deref(), params.days.as_deref())
        .await
    {
        Ok(served) => {
            tracing::debug!(%caller, cache = served.status.as_str(), "price history served");
            cached_json(&served, history_body(&served.payload))
        }
        Err(err) => error_response(&err, true),
    }
}

/// Health check handler
async fn health_handler(State(state): State<Arc<ServerState>>) -> Json<HealthResponse> {
    let upstream_reachable = state.dispatcher.upstream_reachable().await;

    let status = if upstream_reachable { "ok" } else { "degraded" };

    Json(HealthResponse {
        status: status.to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        uptime_seconds: state.start_time.elapsed().as_secs(),
        upstream_reachable,
        tracked_assets: state
            .dispatcher
            .catalog()
            .assets()
            .iter()
            .map(|a| a.symbol.clone())
            .collect(),
        cached_keys: state.dispatcher.cache().key_count(),
    })
}

// ---------------------------------------------------------------------------
// Response mapping
// ---------------------------------------------------------------------------

/// 200 response with cache status headers.
fn cached_json<V, B: Serialize>(served: &Served<V>, body: B) -> Response {
    let mut headers = HeaderMap::new();
    headers.insert(HeaderName::from_static(X_CACHE), HeaderValue::from_static(served.status.header_value()));
    headers.insert(header::AGE, HeaderValue::from(served.age().as_secs()));

    let cache_control = match served.status {
        CacheStatus::Stale => "no-cache".to_string(),
        _ => format!("public, max-age={}", served.remaining_ttl().as_secs()),
    };
    if let Ok(value) = HeaderValue::from_str(&cache_control) {
        headers.insert(header::CACHE_CONTROL, value);
    }
    if served.status == CacheStatus::Stale {
        headers.insert(
            header::WARNING,
            HeaderValue::from_static("110 - \"Response is Stale\""),
        );
    }

    (StatusCode::OK, headers, Json(body)).into_response()
}

/// Status code for a failed request.
///
/// With `pass_upstream_status`, an upstream 4xx/5xx status is forwarded;
/// otherwise every upstream-side failure is a 500.
pub fn error_status(err: &ProxyError, pass_upstream_status: bool) -> StatusCode {
    match err {
        ProxyError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
        ProxyError::UpstreamUnavailable {
            status: Some(code), ..
        } if pass_upstream_status => StatusCode::from_u16(*code)
            .ok()
            .filter(|s| s.is_client_error() || s.is_server_error())
            .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR),
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn error_response(err: &ProxyError, pass_upstream_status: bool) -> Response {
    let status = error_status(err, pass_upstream_status);
    match err {
        ProxyError::InvalidRequest(_) => tracing::debug!(error = %err, "rejected request"),
        _ => tracing::warn!(error = %err, status = status.as_u16(), "proxy request failed"),
    }
    (status, Json(ErrorBody::new(err.to_string()))).into_response()
}
