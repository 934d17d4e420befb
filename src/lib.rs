//! coinproxy — caching proxy for crypto market data.
//!
//! Shields clients from a third-party market-data provider: spot prices and
//! price series for a small catalog of assets are fetched upstream,
//! normalized into a stable schema, and cached for a bounded time window.
//!
//! # Pipeline
//!
//! - **upstream**: raw HTTP calls to the provider
//! - **normalize**: provider JSON → [`types::SnapshotPrice`] / [`types::PricePoint`]
//! - **cache**: per-key entries with fetch time and TTL
//! - **dispatcher**: cache lookup, coalesced refetch, stale fallback
//! - **server**: axum routes and HTTP status mapping

pub mod auth;
pub mod cache;
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod metrics;
pub mod normalize;
pub mod server;
pub mod types;
pub mod upstream;

pub use cache::{CacheEntry, FreshnessCache, ProxyCache};
pub use dispatcher::{CachePolicy, CacheStatus, HistoryRequest, ProxyDispatcher, Served};
pub use error::ProxyError;
pub use types::{Asset, AssetCatalog, CacheKey, PricePoint, QueryKind, SnapshotPrice};
pub use upstream::{CoinGeckoClient, MarketDataSource, UpstreamSettings};
