//! Normalization of provider payloads into the proxy's stable schema.
//!
//! Every function here is pure. Payloads that lack an expected field are
//! rejected with [`ProxyError::MalformedUpstreamResponse`]; nothing is filled
//! in with zeros or placeholders.

use std::str::FromStr;

use rust_decimal::Decimal;
use serde_json::Value;

use crate::error::ProxyError;
use crate::types::{Asset, PricePoint, SnapshotPrice};

/// Quote currency requested from the provider.
pub const VS_CURRENCY: &str = "usd";

const MARKET_CAP_FIELD: &str = "usd_market_cap";
const VOLUME_FIELD: &str = "usd_24h_vol";
const CHANGE_FIELD: &str = "usd_24h_change";

/// Normalize a snapshot payload (`{ "<id>": { "usd": .., .. }, .. }`).
///
/// One record is produced per requested asset, in catalog order. An asset
/// missing from the payload, or missing its `usd` price, fails the whole
/// payload.
pub fn normalize_snapshot(raw: &Value, assets: &[Asset]) -> Result<Vec<SnapshotPrice>, ProxyError> {
    let by_id = raw
        .as_object()
        .ok_or_else(|| ProxyError::malformed("snapshot payload is not an object"))?;

    assets
        .iter()
        .map(|asset| {
            let quote = by_id
                .get(&asset.id)
                .and_then(Value::as_object)
                .ok_or_else(|| {
                    ProxyError::malformed(format!("snapshot missing asset '{}'", asset.id))
                })?;

            let usd_price = match quote.get(VS_CURRENCY) {
                Some(v) if !v.is_null() => to_decimal(v, &asset.id, VS_CURRENCY)?,
                _ => {
                    return Err(ProxyError::malformed(format!(
                        "snapshot missing '{}' price for '{}'",
                        VS_CURRENCY, asset.id
                    )))
                }
            };

            Ok(SnapshotPrice {
                asset_symbol: asset.symbol.clone(),
                usd_price,
                usd_market_cap: optional_decimal(quote.get(MARKET_CAP_FIELD), &asset.id, MARKET_CAP_FIELD)?,
                usd_24h_volume: optional_decimal(quote.get(VOLUME_FIELD), &asset.id, VOLUME_FIELD)?,
                usd_24h_change_percent: optional_decimal(quote.get(CHANGE_FIELD), &asset.id, CHANGE_FIELD)?,
            })
        })
        .collect()
}

/// Normalize a series payload (`{ "prices": [[ts, price], ..] }`).
///
/// Points keep the order they arrived in.
pub fn normalize_price_series(raw: &Value) -> Result<Vec<PricePoint>, ProxyError> {
    let prices = raw
        .get("prices")
        .ok_or_else(|| ProxyError::malformed("series payload missing 'prices'"))?
        .as_array()
        .ok_or_else(|| ProxyError::malformed("'prices' is not an array"))?;

    prices
        .iter()
        .enumerate()
        .map(|(i, pair)| {
            let pair = pair
                .as_array()
                .filter(|p| p.len() >= 2)
                .ok_or_else(|| ProxyError::malformed(format!("prices[{i}] is not a [timestamp, price] pair")))?;
            let timestamp = to_timestamp(&pair[0])
                .ok_or_else(|| ProxyError::malformed(format!("prices[{i}] has a non-integer timestamp")))?;
            let price = to_decimal(&pair[1], "prices", &i.to_string())?;
            Ok(PricePoint { timestamp, price })
        })
        .collect()
}

/// Parse a JSON number into a decimal using its exact text.
fn to_decimal(value: &Value, context: &str, field: &str) -> Result<Decimal, ProxyError> {
    let Value::Number(number) = value else {
        return Err(ProxyError::malformed(format!("{context}.{field} is not a number")));
    };
    let text = number.to_string();
    Decimal::from_str(&text)
        .or_else(|_| Decimal::from_scientific(&text))
        .map_err(|e| ProxyError::malformed(format!("{context}.{field} out of range ({text}): {e}")))
}

fn optional_decimal(value: Option<&Value>, context: &str, field: &str) -> Result<Option<Decimal>, ProxyError> {
    match value {
        None | Some(Value::Null) => Ok(None),
        Some(v) => to_decimal(v, context, field).map(Some),
    }
}

fn to_timestamp(value: &Value) -> Option<i64> {
    if let Some(ts) = value.as_i64() {
        return Some(ts);
    }
    // Some providers emit integral millis as floats (e.g. 1.7e12).
    let ts = value.as_f64()?;
    (ts.fract() == 0.0 && ts.abs() < i64::MAX as f64).then_some(ts as i64)
}
