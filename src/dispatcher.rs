//! Read-through pipelines: cache lookup, upstream fetch, normalize, store.
//!
//! [`ProxyDispatcher`] owns the per-query pipelines and the policy around
//! them (TTLs, coalescing, timeouts, retries, stale fallback). It never builds
//! HTTP responses; the server module maps its results onto status codes.

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, OnceCell};
use tokio::time::Instant;

use crate::cache::{CacheEntry, FreshnessCache, ProxyCache};
use crate::error::ProxyError;
use crate::normalize::{normalize_price_series, normalize_snapshot};
use crate::types::{AssetCatalog, CacheKey, PricePoint, QueryKind, SnapshotPrice, DEFAULT_RANGE_DAYS};
use crate::upstream::MarketDataSource;

// ---------------------------------------------------------------------------
// Policy
// ---------------------------------------------------------------------------

/// Freshness and failure-handling policy applied to every pipeline.
#[derive(Debug, Clone)]
pub struct CachePolicy {
    /// TTL for current-price snapshots
    pub snapshot_ttl: Duration,
    /// TTL for chart and price-history series
    pub series_ttl: Duration,
    /// Serve an expired entry when the refetch fails
    pub serve_stale_on_error: bool,
    /// Allow at most one in-flight upstream fetch per key
    pub coalesce: bool,
    /// Bound on each upstream call (including normalization)
    pub upstream_timeout: Duration,
    /// Extra attempts for transient upstream failures
    pub upstream_retries: u32,
    /// Delay between attempts
    pub retry_backoff: Duration,
    /// How long a health-check ping result is reused
    pub reachability_ttl: Duration,
}

impl Default for CachePolicy {
    fn default() -> Self {
        Self {
            snapshot_ttl: Duration::from_secs(60),
            series_ttl: Duration::from_secs(300),
            serve_stale_on_error: true,
            coalesce: true,
            upstream_timeout: Duration::from_secs(10),
            upstream_retries: 0,
            retry_backoff: Duration::from_millis(250),
            reachability_ttl: Duration::from_secs(30),
        }
    }
}

// ---------------------------------------------------------------------------
// Results
// ---------------------------------------------------------------------------

/// How a payload was obtained.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheStatus {
    /// Fresh entry found on first lookup
    Hit,
    /// Fresh entry produced by a concurrent caller's fetch
    Coalesced,
    /// Fetched from upstream for this request
    Miss,
    /// Expired entry served because the refetch failed
    Stale,
}

impl CacheStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Hit => "hit",
            Self::Coalesced => "coalesced",
            Self::Miss => "miss",
            Self::Stale => "stale",
        }
    }

    /// Value for the `X-Cache` response header.
    pub fn header_value(&self) -> &'static str {
        match self {
            Self::Hit | Self::Coalesced => "HIT",
            Self::Miss => "MISS",
            Self::Stale => "STALE",
        }
    }
}

/// A payload handed back to the HTTP layer with its cache metadata.
#[derive(Debug, Clone)]
pub struct Served<V> {
    pub payload: V,
    pub fetched_at: Instant,
    pub ttl: Duration,
    pub status: CacheStatus,
}

impl<V> Served<V> {
    fn from_entry(entry: CacheEntry<V>, status: CacheStatus) -> Self {
        Self {
            payload: entry.payload,
            fetched_at: entry.fetched_at,
            ttl: entry.ttl,
            status,
        }
    }

    pub fn age(&self) -> Duration {
        Instant::now().saturating_duration_since(self.fetched_at)
    }

    pub fn remaining_ttl(&self) -> Duration {
        self.ttl.saturating_sub(self.age())
    }
}

// ---------------------------------------------------------------------------
// Request validation
// ---------------------------------------------------------------------------

/// A validated price-history request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HistoryRequest {
    pub asset_id: String,
    pub range_days: u32,
}

impl HistoryRequest {
    /// Validate raw query parameters without touching the network.
    pub fn parse(
        id: Option<&str>,
        days: Option<&str>,
        catalog: &AssetCatalog,
    ) -> Result<Self, ProxyError> {
        let asset_id = match id.map(str::trim) {
            Some(id) if !id.is_empty() => id,
            _ => return Err(ProxyError::invalid("missing required parameter: id")),
        };
        if catalog.find(asset_id).is_none() {
            return Err(ProxyError::invalid(format!("unknown asset id: {asset_id}")));
        }

        let range_days = match days {
            None => DEFAULT_RANGE_DAYS,
            Some(raw) => parse_range_days(raw)?,
        };

        Ok(Self {
            asset_id: asset_id.to_string(),
            range_days,
        })
    }

    pub fn cache_key(&self) -> CacheKey {
        CacheKey::price_history(&self.asset_id, self.range_days)
    }
}

fn parse_range_days(raw: &str) -> Result<u32, ProxyError> {
    match raw.trim().parse::<u32>() {
        Ok(days) if days > 0 => Ok(days),
        _ => Err(ProxyError::invalid(format!(
            "days must be a positive integer, got '{raw}'"
        ))),
    }
}

// ---------------------------------------------------------------------------
// Dispatcher
// ---------------------------------------------------------------------------

/// Upper bound on a health-check ping.
const PING_TIMEOUT: Duration = Duration::from_secs(3);

type Flight<V> = Arc<OnceCell<Result<CacheEntry<V>, ProxyError>>>;

/// Upstream fetches currently in progress, one per key.
///
/// Every caller that joins a flight before it lands receives the same
/// outcome, failures included.
struct InFlight<V> {
    flights: Mutex<HashMap<CacheKey, Flight<V>>>,
}

impl<V> InFlight<V> {
    fn new() -> Self {
        Self {
            flights: Mutex::new(HashMap::new()),
        }
    }

    async fn join(&self, key: &CacheKey) -> Flight<V> {
        let mut flights = self.flights.lock().await;
        Arc::clone(
            flights
                .entry(key.clone())
                .or_insert_with(|| Arc::new(OnceCell::new())),
        )
    }

    /// Forget a finished flight so the next miss starts a new one.
    async fn land(&self, key: &CacheKey, flight: &Flight<V>) {
        let mut flights = self.flights.lock().await;
        if flights.get(key).is_some_and(|f| Arc::ptr_eq(f, flight)) {
            flights.remove(key);
        }
    }

    #[cfg(test)]
    async fn len(&self) -> usize {
        self.flights.lock().await.len()
    }
}

/// Runs the cache → upstream → normalize → cache pipelines.
pub struct ProxyDispatcher {
    source: Arc<dyn MarketDataSource>,
    cache: Arc<ProxyCache>,
    catalog: AssetCatalog,
    chart_asset: String,
    policy: CachePolicy,
    snapshot_flights: InFlight<Arc<Vec<SnapshotPrice>>>,
    series_flights: InFlight<Arc<Vec<PricePoint>>>,
    reachability: Mutex<Option<CacheEntry<bool>>>,
}

impl ProxyDispatcher {
    pub fn new(
        source: Arc<dyn MarketDataSource>,
        cache: Arc<ProxyCache>,
        catalog: AssetCatalog,
        chart_asset: impl Into<String>,
        policy: CachePolicy,
    ) -> Self {
        Self {
            source,
            cache,
            catalog,
            chart_asset: chart_asset.into(),
            policy,
            snapshot_flights: InFlight::new(),
            series_flights: InFlight::new(),
            reachability: Mutex::new(None),
        }
    }

    pub fn catalog(&self) -> &AssetCatalog {
        &self.catalog
    }

    pub fn policy(&self) -> &CachePolicy {
        &self.policy
    }

    pub fn cache(&self) -> &Arc<ProxyCache> {
        &self.cache
    }

    pub fn source(&self) -> &Arc<dyn MarketDataSource> {
        &self.source
    }

    /// Current USD quotes for every tracked asset.
    pub async fn current_prices(&self) -> Result<Served<Arc<Vec<SnapshotPrice>>>, ProxyError> {
        let ids = self.catalog.ids();
        let key = CacheKey::current_prices(ids.iter().cloned());
        let ids = &ids;
        self.resolve(
            &self.cache.snapshots,
            &self.snapshot_flights,
            key,
            self.policy.snapshot_ttl,
            move || async move {
                let raw = self.source.fetch_snapshot(ids).await?;
                normalize_snapshot(&raw, self.catalog.assets()).map(Arc::new)
            },
        )
        .await
    }

    /// Fixed 7-day series for the configured chart asset.
    pub async fn chart(&self) -> Result<Served<Arc<Vec<PricePoint>>>, ProxyError> {
        let key = CacheKey::chart(&self.chart_asset, DEFAULT_RANGE_DAYS);
        self.resolve(
            &self.cache.series,
            &self.series_flights,
            key,
            self.policy.series_ttl,
            move || async move {
                let raw = self
                    .source
                    .fetch_chart(&self.chart_asset, DEFAULT_RANGE_DAYS)
                    .await?;
                normalize_price_series(&raw).map(Arc::new)
            },
        )
        .await
    }

    /// Price history from raw query parameters. Validation happens before
    /// any cache or network access.
    pub async fn price_history(
        &self,
        id: Option<&str>,
        days: Option<&str>,
    ) -> Result<Served<Arc<Vec<PricePoint>>>, ProxyError> {
        let request = HistoryRequest::parse(id, days, &self.catalog)?;
        self.price_history_for(&request).await
    }

    pub async fn price_history_for(
        &self,
        request: &HistoryRequest,
    ) -> Result<Served<Arc<Vec<PricePoint>>>, ProxyError> {
        let key = request.cache_key();
        self.resolve(
            &self.cache.series,
            &self.series_flights,
            key,
            self.policy.series_ttl,
            move || async move {
                let raw = self
                    .source
                    .fetch_chart(&request.asset_id, request.range_days)
                    .await?;
                normalize_price_series(&raw).map(Arc::new)
            },
        )
        .await
    }

    /// Whether the provider answered a ping recently. The answer is cached
    /// for `reachability_ttl` and concurrent callers share one ping.
    pub async fn upstream_reachable(&self) -> bool {
        let mut last_ping = self.reachability.lock().await;
        if let Some(entry) = last_ping.as_ref().filter(|e| e.is_fresh()) {
            return entry.payload;
        }

        let reachable = matches!(
            tokio::time::timeout(PING_TIMEOUT, self.source.ping()).await,
            Ok(Ok(()))
        );
        if !reachable {
            tracing::warn!("upstream ping failed");
        }
        *last_ping = Some(CacheEntry {
            payload: reachable,
            fetched_at: Instant::now(),
            ttl: self.policy.reachability_ttl,
        });
        reachable
    }

    /// Shared read-through logic for every query shape.
    async fn resolve<V, F, Fut>(
        &self,
        cache: &FreshnessCache<V>,
        flights: &InFlight<V>,
        key: CacheKey,
        ttl: Duration,
        fetch: F,
    ) -> Result<Served<V>, ProxyError>
    where
        V: Clone + Send + Sync + 'static,
        F: Fn() -> Fut,
        Fut: Future<Output = Result<V, ProxyError>>,
    {
        let query = key.kind();

        if let Some(entry) = cache.get(&key).await {
            if entry.is_fresh() {
                crate::metrics::record_cache_lookup(query, CacheStatus::Hit);
                return Ok(Served::from_entry(entry, CacheStatus::Hit));
            }
        }

        let outcome = if self.policy.coalesce {
            let flight = flights.join(&key).await;
            let fetched = AtomicBool::new(false);
            let (fetched_ref, key_ref, fetch_ref) = (&fetched, &key, &fetch);
            let outcome = flight
                .get_or_init(move || async move {
                    // A flight that landed just before this one may have
                    // refreshed the entry already.
                    if let Some(entry) = cache.get(key_ref).await {
                        if entry.is_fresh() {
                            return Ok(entry);
                        }
                    }
                    fetched_ref.store(true, Ordering::Relaxed);
                    self.fetch_and_store(cache, key_ref, ttl, fetch_ref).await
                })
                .await
                .clone();
            flights.land(&key, &flight).await;

            let status = if fetched.load(Ordering::Relaxed) {
                CacheStatus::Miss
            } else {
                CacheStatus::Coalesced
            };
            outcome.map(|entry| (entry, status))
        } else {
            self.fetch_and_store(cache, &key, ttl, &fetch)
                .await
                .map(|entry| (entry, CacheStatus::Miss))
        };

        match outcome {
            Ok((entry, status)) => {
                crate::metrics::record_cache_lookup(query, status);
                Ok(Served::from_entry(entry, status))
            }
            Err(err) => self.fall_back(cache, &key, err).await,
        }
    }

    /// Answer a failed refetch from whatever the cache holds, if allowed.
    async fn fall_back<V>(
        &self,
        cache: &FreshnessCache<V>,
        key: &CacheKey,
        err: ProxyError,
    ) -> Result<Served<V>, ProxyError>
    where
        V: Clone + Send + Sync + 'static,
    {
        if !self.policy.serve_stale_on_error || !err.is_upstream_failure() {
            return Err(err);
        }
        let Some(entry) = cache.get(key).await else {
            return Err(err);
        };

        let query = key.kind();
        // Another caller may have refreshed the key while this fetch failed.
        if entry.is_fresh() {
            crate::metrics::record_cache_lookup(query, CacheStatus::Hit);
            return Ok(Served::from_entry(entry, CacheStatus::Hit));
        }

        tracing::warn!(
            key = %key,
            age_secs = entry.age().as_secs(),
            error = %err,
            "serving stale entry after upstream failure"
        );
        crate::metrics::record_cache_lookup(query, CacheStatus::Stale);
        Ok(Served::from_entry(entry, CacheStatus::Stale))
    }

    async fn fetch_and_store<V, F, Fut>(
        &self,
        cache: &FreshnessCache<V>,
        key: &CacheKey,
        ttl: Duration,
        fetch: &F,
    ) -> Result<CacheEntry<V>, ProxyError>
    where
        V: Clone + Send + Sync + 'static,
        F: Fn() -> Fut,
        Fut: Future<Output = Result<V, ProxyError>>,
    {
        let payload = self.fetch_with_retry(key, fetch).await?;
        Ok(cache.put(key, payload, ttl).await)
    }

    /// Run `fetch` under the upstream timeout, retrying transient failures.
    async fn fetch_with_retry<V, F, Fut>(&self, key: &CacheKey, fetch: &F) -> Result<V, ProxyError>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<V, ProxyError>>,
    {
        let query = key.kind();
        let mut attempt = 0u32;
        loop {
            let start = Instant::now();
            let result = match tokio::time::timeout(self.policy.upstream_timeout, fetch()).await {
                Ok(result) => result,
                Err(_) => Err(ProxyError::unavailable(
                    None,
                    format!(
                        "no response within {}ms",
                        self.policy.upstream_timeout.as_millis()
                    ),
                )),
            };
            let duration_ms = start.elapsed().as_millis() as u64;
            record_attempt(query, key, &result, duration_ms);

            match result {
                Err(err) if err.is_transient() && attempt < self.policy.upstream_retries => {
                    attempt += 1;
                    tracing::info!(key = %key, attempt, error = %err, "retrying upstream fetch");
                    tokio::time::sleep(self.policy.retry_backoff).await;
                }
                other => return other,
            }
        }
    }
}

fn record_attempt<V>(query: QueryKind, key: &CacheKey, result: &Result<V, ProxyError>, duration_ms: u64) {
    match result {
        Ok(_) => {
            tracing::debug!(key = %key, duration_ms, "upstream fetch ok");
            crate::metrics::record_upstream_call(query, "ok", duration_ms);
        }
        Err(err @ ProxyError::MalformedUpstreamResponse(_)) => {
            tracing::error!(key = %key, error = %err, "upstream schema drift: response rejected by normalizer");
            crate::metrics::record_upstream_call(query, err.kind(), duration_ms);
            crate::metrics::record_malformed_response(query);
        }
        Err(err) => {
            tracing::warn!(key = %key, status = ?err.upstream_status(), error = %err, "upstream fetch failed");
            crate::metrics::record_upstream_call(query, err.kind(), duration_ms);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    use async_trait::async_trait;
    use serde_json::{json, Value};

    /// Upstream stub that counts calls and can be told to fail or stall.
    struct CountingSource {
        calls: AtomicUsize,
        pings: AtomicUsize,
        delay: Duration,
        failures_before_success: usize,
        failing: AtomicBool,
        failure: ProxyError,
    }

    impl CountingSource {
        fn new() -> Self {
            Self {
                calls: AtomicUsize::new(0),
                pings: AtomicUsize::new(0),
                delay: Duration::from_millis(50),
                failures_before_success: 0,
                failing: AtomicBool::new(false),
                failure: ProxyError::unavailable(Some(503), "down"),
            }
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl MarketDataSource for CountingSource {
        async fn fetch_snapshot(&self, asset_ids: &[String]) -> Result<Value, ProxyError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(self.delay).await;
            let mut body = serde_json::Map::new();
            for id in asset_ids {
                body.insert(id.clone(), json!({ "usd": 100 }));
            }
            Ok(Value::Object(body))
        }

        async fn fetch_chart(&self, _asset_id: &str, _range_days: u32) -> Result<Value, ProxyError> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(self.delay).await;
            if n < self.failures_before_success || self.failing.load(Ordering::SeqCst) {
                return Err(self.failure.clone());
            }
            Ok(json!({ "prices": [[1000, 1], [2000, 2]] }))
        }

        async fn ping(&self) -> Result<(), ProxyError> {
            self.pings.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn dispatcher(source: Arc<CountingSource>, policy: CachePolicy) -> ProxyDispatcher {
        ProxyDispatcher::new(
            source,
            Arc::new(ProxyCache::new(100)),
            AssetCatalog::default(),
            "bitcoin",
            policy,
        )
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_misses_coalesce_to_one_fetch() {
        let source = Arc::new(CountingSource::new());
        let d = dispatcher(source.clone(), CachePolicy::default());

        let results = futures::future::join_all((0..50).map(|_| d.current_prices())).await;

        assert_eq!(source.calls(), 1);
        let statuses: Vec<CacheStatus> = results.into_iter().map(|r| r.unwrap().status).collect();
        assert_eq!(statuses.iter().filter(|s| **s == CacheStatus::Miss).count(), 1);
        assert_eq!(statuses.iter().filter(|s| **s == CacheStatus::Coalesced).count(), 49);
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_misses_without_coalescing_fetch_each() {
        let source = Arc::new(CountingSource::new());
        let policy = CachePolicy {
            coalesce: false,
            ..CachePolicy::default()
        };
        let d = dispatcher(source.clone(), policy);

        let results = futures::future::join_all((0..50).map(|_| d.current_prices())).await;

        assert_eq!(source.calls(), 50);
        assert!(results.iter().all(|r| r.as_ref().unwrap().status == CacheStatus::Miss));
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_failures_share_one_upstream_call() {
        let source = Arc::new(CountingSource {
            failures_before_success: usize::MAX,
            ..CountingSource::new()
        });
        let d = dispatcher(source.clone(), CachePolicy::default());

        let results = futures::future::join_all((0..50).map(|_| d.chart())).await;

        assert_eq!(source.calls(), 1);
        for result in &results {
            let err = result.as_ref().unwrap_err();
            assert_eq!(err.upstream_status(), Some(503));
        }
        assert_eq!(d.series_flights.len().await, 0);

        // The next miss starts a new flight.
        assert!(d.chart().await.is_err());
        assert_eq!(source.calls(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_hanging_upstream_releases_waiters_after_one_timeout() {
        let source = Arc::new(CountingSource {
            delay: Duration::from_secs(3600),
            ..CountingSource::new()
        });
        let policy = CachePolicy::default();
        let timeout = policy.upstream_timeout;
        let d = dispatcher(source.clone(), policy);

        let start = Instant::now();
        let results = futures::future::join_all((0..50).map(|_| d.chart())).await;

        assert_eq!(source.calls(), 1);
        assert!(results
            .iter()
            .all(|r| matches!(r, Err(ProxyError::UpstreamUnavailable { status: None, .. }))));
        assert!(start.elapsed() < timeout * 2, "took {:?}", start.elapsed());
    }

    #[tokio::test(start_paused = true)]
    async fn test_waiters_share_stale_entry_when_refetch_fails() {
        let source = Arc::new(CountingSource::new());
        let d = dispatcher(source.clone(), CachePolicy::default());

        let fresh = d.chart().await.unwrap();
        tokio::time::advance(Duration::from_secs(301)).await;
        source.failing.store(true, Ordering::SeqCst);

        let results = futures::future::join_all((0..50).map(|_| d.chart())).await;

        assert_eq!(source.calls(), 2);
        for result in results {
            let served = result.unwrap();
            assert_eq!(served.status, CacheStatus::Stale);
            assert_eq!(served.fetched_at, fresh.fetched_at);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_fallback_prefers_fresh_entry_over_stale_label() {
        let source = Arc::new(CountingSource::new());
        let d = dispatcher(source, CachePolicy::default());
        let key = CacheKey::chart("bitcoin", DEFAULT_RANGE_DAYS);
        let points = Arc::new(vec![PricePoint {
            timestamp: 1000,
            price: "1".parse().unwrap(),
        }]);
        d.cache.series.put(&key, points, Duration::from_secs(300)).await;

        let served = d
            .fall_back(&d.cache.series, &key, ProxyError::unavailable(Some(503), "down"))
            .await
            .unwrap();
        assert_eq!(served.status, CacheStatus::Hit);

        tokio::time::advance(Duration::from_secs(301)).await;
        let served = d
            .fall_back(&d.cache.series, &key, ProxyError::unavailable(Some(503), "down"))
            .await
            .unwrap();
        assert_eq!(served.status, CacheStatus::Stale);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reachability_is_cached() {
        let source = Arc::new(CountingSource::new());
        let d = dispatcher(source.clone(), CachePolicy::default());

        for _ in 0..5 {
            assert!(d.upstream_reachable().await);
        }
        assert_eq!(source.pings.load(Ordering::SeqCst), 1);

        tokio::time::advance(Duration::from_secs(31)).await;
        assert!(d.upstream_reachable().await);
        assert_eq!(source.pings.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_ttl_expiry_refetches_once() {
        let source = Arc::new(CountingSource::new());
        let d = dispatcher(source.clone(), CachePolicy::default());

        let first = d.current_prices().await.unwrap();
        let second = d.current_prices().await.unwrap();
        assert_eq!(source.calls(), 1);
        assert_eq!(second.status, CacheStatus::Hit);
        assert_eq!(second.fetched_at, first.fetched_at);

        tokio::time::advance(Duration::from_secs(61)).await;
        let third = d.current_prices().await.unwrap();
        assert_eq!(source.calls(), 2);
        assert_eq!(third.status, CacheStatus::Miss);
        assert!(third.fetched_at > first.fetched_at);
    }

    #[tokio::test(start_paused = true)]
    async fn test_upstream_timeout_is_unavailable() {
        let source = Arc::new(CountingSource {
            delay: Duration::from_secs(120),
            ..CountingSource::new()
        });
        let d = dispatcher(source, CachePolicy::default());

        let err = d.chart().await.unwrap_err();
        assert!(matches!(err, ProxyError::UpstreamUnavailable { status: None, .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_failure_is_retried() {
        let source = Arc::new(CountingSource {
            failures_before_success: 2,
            ..CountingSource::new()
        });
        let policy = CachePolicy {
            upstream_retries: 2,
            ..CachePolicy::default()
        };
        let d = dispatcher(source.clone(), policy);

        let served = d.chart().await.unwrap();
        assert_eq!(source.calls(), 3);
        assert_eq!(served.payload.len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_client_errors_are_not_retried() {
        let source = Arc::new(CountingSource {
            failures_before_success: 5,
            failure: ProxyError::unavailable(Some(404), "not found"),
            ..CountingSource::new()
        });
        let policy = CachePolicy {
            upstream_retries: 3,
            ..CachePolicy::default()
        };
        let d = dispatcher(source.clone(), policy);

        let err = d.chart().await.unwrap_err();
        assert_eq!(err.upstream_status(), Some(404));
        assert_eq!(source.calls(), 1);
    }

    #[tokio::test]
    async fn test_invalid_history_never_reaches_upstream() {
        let source = Arc::new(CountingSource::new());
        let d = dispatcher(source.clone(), CachePolicy::default());

        for (id, days) in [
            (None, None),
            (Some(""), Some("7")),
            (Some("bitcoin"), Some("abc")),
            (Some("bitcoin"), Some("0")),
            (Some("bitcoin"), Some("-3")),
            (Some("notacoin"), None),
        ] {
            let err = d.price_history(id, days).await.unwrap_err();
            assert!(matches!(err, ProxyError::InvalidRequest(_)), "{id:?} {days:?}");
        }
        assert_eq!(source.calls(), 0);
    }

    #[test]
    fn test_history_request_defaults_range() {
        let catalog = AssetCatalog::default();
        let req = HistoryRequest::parse(Some("bitcoin"), None, &catalog).unwrap();
        assert_eq!(req.range_days, DEFAULT_RANGE_DAYS);
        let explicit = HistoryRequest::parse(Some(" bitcoin "), Some("30"), &catalog).unwrap();
        assert_eq!(explicit.range_days, 30);
        assert_ne!(req.cache_key(), explicit.cache_key());
    }
}
