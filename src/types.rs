//! Core data types for the price proxy.
//!
//! Defines the tracked asset catalog, cache keys, and the normalized price
//! records handed back to clients.

use std::fmt;

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Default range for chart and history queries, in days.
pub const DEFAULT_RANGE_DAYS: u32 = 7;

// ---------------------------------------------------------------------------
// Asset catalog
// ---------------------------------------------------------------------------

/// A tracked asset: the provider's id and the display symbol.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Asset {
    /// Provider identifier (e.g. "bitcoin")
    pub id: String,
    /// Ticker symbol used in client-facing payloads (e.g. "BTC")
    pub symbol: String,
}

impl Asset {
    pub fn new(id: &str, symbol: &str) -> Self {
        Self {
            id: id.to_string(),
            symbol: symbol.to_string(),
        }
    }
}

/// The fixed set of assets the proxy serves.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AssetCatalog {
    assets: Vec<Asset>,
}

impl AssetCatalog {
    pub fn new(assets: Vec<Asset>) -> Self {
        Self { assets }
    }

    pub fn assets(&self) -> &[Asset] {
        &self.assets
    }

    pub fn ids(&self) -> Vec<String> {
        self.assets.iter().map(|a| a.id.clone()).collect()
    }

    pub fn find(&self, id: &str) -> Option<&Asset> {
        self.assets.iter().find(|a| a.id == id)
    }

    pub fn len(&self) -> usize {
        self.assets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.assets.is_empty()
    }
}

impl Default for AssetCatalog {
    fn default() -> Self {
        Self::new(vec![
            Asset::new("bitcoin", "BTC"),
            Asset::new("ethereum", "ETH"),
            Asset::new("solana", "SOL"),
            Asset::new("cardano", "ADA"),
            Asset::new("dogecoin", "DOGE"),
        ])
    }
}

// ---------------------------------------------------------------------------
// Cache keys
// ---------------------------------------------------------------------------

/// The query shapes served by the proxy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum QueryKind {
    CurrentPrices,
    Chart,
    PriceHistory,
}

impl QueryKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::CurrentPrices => "current_prices",
            Self::Chart => "chart",
            Self::PriceHistory => "price_history",
        }
    }
}

/// Deterministic cache key derived only from request parameters.
///
/// Asset ids are sorted and de-duplicated, so two requests for the same set
/// in a different order share a key.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    kind: QueryKind,
    assets: Vec<String>,
    range_days: Option<u32>,
}

impl CacheKey {
    pub fn current_prices<I, S>(asset_ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut assets: Vec<String> = asset_ids.into_iter().map(Into::into).collect();
        assets.sort();
        assets.dedup();
        Self {
            kind: QueryKind::CurrentPrices,
            assets,
            range_days: None,
        }
    }

    pub fn chart(asset_id: &str, range_days: u32) -> Self {
        Self {
            kind: QueryKind::Chart,
            assets: vec![asset_id.to_string()],
            range_days: Some(range_days),
        }
    }

    pub fn price_history(asset_id: &str, range_days: u32) -> Self {
        Self {
            kind: QueryKind::PriceHistory,
            assets: vec![asset_id.to_string()],
            range_days: Some(range_days),
        }
    }

    pub fn kind(&self) -> QueryKind {
        self.kind
    }

    pub fn assets(&self) -> &[String] {
        &self.assets
    }

    pub fn range_days(&self) -> Option<u32> {
        self.range_days
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.kind.as_str(), self.assets.join(","))?;
        if let Some(days) = self.range_days {
            write!(f, ":{days}d")?;
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Normalized records
// ---------------------------------------------------------------------------

/// One point of a price series.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PricePoint {
    /// Milliseconds since the Unix epoch
    pub timestamp: i64,
    #[serde(with = "rust_decimal::serde::arbitrary_precision")]
    pub price: Decimal,
}

/// Current USD quote for one tracked asset.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SnapshotPrice {
    pub asset_symbol: String,
    #[serde(with = "rust_decimal::serde::arbitrary_precision")]
    pub usd_price: Decimal,
    #[serde(
        default,
        with = "rust_decimal::serde::arbitrary_precision_option",
        skip_serializing_if = "Option::is_none"
    )]
    pub usd_market_cap: Option<Decimal>,
    #[serde(
        default,
        rename = "usd24hVolume",
        with = "rust_decimal::serde::arbitrary_precision_option",
        skip_serializing_if = "Option::is_none"
    )]
    pub usd_24h_volume: Option<Decimal>,
    #[serde(
        default,
        rename = "usd24hChangePercent",
        with = "rust_decimal::serde::arbitrary_precision_option",
        skip_serializing_if = "Option::is_none"
    )]
    pub usd_24h_change_percent: Option<Decimal>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_current_prices_key_ignores_order_and_duplicates() {
        let a = CacheKey::current_prices(["ethereum", "bitcoin", "bitcoin"]);
        let b = CacheKey::current_prices(["bitcoin", "ethereum"]);
        assert_eq!(a, b);
        assert_eq!(a.to_string(), "current_prices:bitcoin,ethereum");
    }

    #[test]
    fn test_keys_differ_by_kind_and_range() {
        assert_ne!(
            CacheKey::chart("bitcoin", 7),
            CacheKey::price_history("bitcoin", 7)
        );
        assert_ne!(
            CacheKey::price_history("bitcoin", 7),
            CacheKey::price_history("bitcoin", 30)
        );
        assert_eq!(
            CacheKey::price_history("bitcoin", 30).to_string(),
            "price_history:bitcoin:30d"
        );
    }

    #[test]
    fn test_default_catalog() {
        let catalog = AssetCatalog::default();
        assert_eq!(catalog.len(), 5);
        assert_eq!(catalog.find("bitcoin").map(|a| a.symbol.as_str()), Some("BTC"));
        assert!(catalog.find("notacoin").is_none());
    }

    #[test]
    fn test_price_point_serializes_exact_decimal() {
        let point = PricePoint {
            timestamp: 1000,
            price: "50100.25".parse().unwrap(),
        };
        let json = serde_json::to_string(&point).unwrap();
        assert_eq!(json, r#"{"timestamp":1000,"price":50100.25}"#);
    }

    #[test]
    fn test_snapshot_price_skips_missing_optionals() {
        let price = SnapshotPrice {
            asset_symbol: "BTC".into(),
            usd_price: "50000".parse().unwrap(),
            usd_market_cap: None,
            usd_24h_volume: None,
            usd_24h_change_percent: Some("-1.5".parse().unwrap()),
        };
        let json = serde_json::to_string(&price).unwrap();
        assert_eq!(
            json,
            r#"{"assetSymbol":"BTC","usdPrice":50000,"usd24hChangePercent":-1.5}"#
        );
    }
}
