//! rate_fetcher.rs - Fetch strategies producing the publish payload
//!
//! `CrossRateFetcher` chains a reference price lookup with a conversion list
//! and scales one by the other. `PassThroughFetcher` republishes a single
//! price response as is.

use async_trait::async_trait;
use log::debug;
use reqwest::Client;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use std::collections::HashMap;
use std::time::Duration;

use crate::config::{FetchStrategy, FetcherConfig};
use crate::error::FetchError;
use crate::models::{Payload, RateEntry, RateMap};

/// Interface shared by all fetch strategies
#[async_trait]
pub trait RateFetcher: Send + Sync {
    /// Produce one payload. Any failed step aborts the whole fetch.
    async fn fetch(&self) -> Result<Payload, FetchError>;

    /// Short name for logs
    fn name(&self) -> &'static str;
}

/// Build the fetcher selected by `config.strategy`
pub fn from_config(config: &FetcherConfig) -> Result<Box<dyn RateFetcher>, FetchError> {
    let timeout = Duration::from_secs(config.timeout_secs);
    let fetcher: Box<dyn RateFetcher> = match config.strategy {
        FetchStrategy::CrossRate => Box::new(CrossRateFetcher::new(config, timeout)?),
        FetchStrategy::PassThrough => Box::new(PassThroughFetcher::new(config, timeout)?),
    };
    Ok(fetcher)
}

fn http_client(timeout: Duration) -> Result<Client, FetchError> {
    Client::builder()
        .timeout(timeout)
        .build()
        .map_err(FetchError::Client)
}

/// GET `url` and return the body, failing on transport errors and non-2xx.
async fn get_body(client: &Client, url: &str, query: &[(&str, &str)]) -> Result<Vec<u8>, FetchError> {
    debug!("Fetching from: {} {:?}", url, query);

    let response = client
        .get(url)
        .query(query)
        .send()
        .await
        .map_err(|source| FetchError::Request {
            url: url.to_string(),
            source,
        })?;

    if !response.status().is_success() {
        return Err(FetchError::Status {
            url: url.to_string(),
            status: response.status().as_u16(),
        });
    }

    let body = response.bytes().await.map_err(|source| FetchError::Request {
        url: url.to_string(),
        source,
    })?;
    Ok(body.to_vec())
}

async fn get_json<T: DeserializeOwned>(
    client: &Client,
    url: &str,
    query: &[(&str, &str)],
) -> Result<T, FetchError> {
    let body = get_body(client, url, query).await?;
    serde_json::from_slice(&body).map_err(|source| FetchError::Decode {
        url: url.to_string(),
        source,
    })
}

// ============================================================================
// Upstream API Response Structures
// ============================================================================

/// Price endpoint body: `{"BTC": 0.00012, "ETH": 0.0021}`
type PriceQuote = HashMap<String, f64>;

/// One element of the conversion list endpoint
#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct Conversion {
    pub code: String,
    pub name: String,
    pub rate: f64,
}

/// Reference prices of the base asset needed to scale a conversion list
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ReferencePrices {
    /// Multiplier applied to every conversion rate
    pub scale: f64,
    /// Published directly as the synthesized entry
    pub synthesized: f64,
}

/// Scale every conversion by the reference price and add the synthesized
/// reference entry. The synthesized entry is inserted last and replaces an
/// upstream entry with the same code.
pub fn build_rate_map(
    prices: ReferencePrices,
    conversions: Vec<Conversion>,
    synthesized_code: &str,
    synthesized_name: &str,
) -> RateMap {
    let mut rates = RateMap::new();

    for conversion in conversions {
        let entry = RateEntry::new(&conversion.name, conversion.rate * prices.scale);
        if !rates.insert(&conversion.code, entry) {
            debug!("Skipped conversion with empty code: {}", conversion.name);
        }
    }

    rates.insert(
        synthesized_code,
        RateEntry::new(synthesized_name, prices.synthesized),
    );
    rates
}

// ============================================================================
// CrossRateFetcher - two step chain
// ============================================================================

#[derive(Debug, Clone)]
pub struct CrossRateFetcher {
    client: Client,
    price_url: String,
    conversions_url: String,
    base_asset: String,
    scale_symbol: String,
    synthesized_symbol: String,
    synthesized_name: String,
}

impl CrossRateFetcher {
    pub fn new(config: &FetcherConfig, timeout: Duration) -> Result<Self, FetchError> {
        let [scale_symbol, synthesized_symbol] = config.reference_symbols.clone();

        Ok(CrossRateFetcher {
            client: http_client(timeout)?,
            price_url: config.price_url.clone(),
            conversions_url: config.conversions_url.clone(),
            base_asset: config.base_asset.clone(),
            scale_symbol,
            synthesized_symbol,
            synthesized_name: config.synthesized_name.clone(),
        })
    }

    async fn fetch_reference_prices(&self) -> Result<ReferencePrices, FetchError> {
        let tsyms = format!("{},{}", self.scale_symbol, self.synthesized_symbol);
        let quote: PriceQuote = get_json(
            &self.client,
            &self.price_url,
            &[("fsym", self.base_asset.as_str()), ("tsyms", tsyms.as_str())],
        )
        .await?;

        let lookup = |symbol: &str| {
            quote
                .get(symbol)
                .copied()
                .ok_or_else(|| FetchError::MissingReference(symbol.to_string()))
        };

        Ok(ReferencePrices {
            scale: lookup(self.scale_symbol.as_str())?,
            synthesized: lookup(self.synthesized_symbol.as_str())?,
        })
    }

    async fn fetch_conversions(&self) -> Result<Vec<Conversion>, FetchError> {
        get_json(&self.client, &self.conversions_url, &[]).await
    }
}

#[async_trait]
impl RateFetcher for CrossRateFetcher {
    async fn fetch(&self) -> Result<Payload, FetchError> {
        let prices = self.fetch_reference_prices().await?;
        debug!(
            "{} price: {} {}, {} {}",
            self.base_asset, prices.scale, self.scale_symbol, prices.synthesized, self.synthesized_symbol
        );

        let conversions = self.fetch_conversions().await?;
        debug!("Fetched {} conversions", conversions.len());

        Ok(Payload::Rates(build_rate_map(
            prices,
            conversions,
            &self.synthesized_symbol,
            &self.synthesized_name,
        )))
    }

    fn name(&self) -> &'static str {
        "cross-rate"
    }
}

// ============================================================================
// PassThroughFetcher - single request, body untouched
// ============================================================================

#[derive(Debug, Clone)]
pub struct PassThroughFetcher {
    client: Client,
    url: String,
    base_asset: String,
    target_symbol: String,
}

impl PassThroughFetcher {
    pub fn new(config: &FetcherConfig, timeout: Duration) -> Result<Self, FetchError> {
        Ok(PassThroughFetcher {
            client: http_client(timeout)?,
            url: config.pass_through_url.clone(),
            base_asset: config.base_asset.clone(),
            target_symbol: config.target_symbol.clone(),
        })
    }
}

#[async_trait]
impl RateFetcher for PassThroughFetcher {
    async fn fetch(&self) -> Result<Payload, FetchError> {
        let body = get_body(
            &self.client,
            &self.url,
            &[("fsyms", self.base_asset.as_str()), ("tsyms", self.target_symbol.as_str())],
        )
        .await?;

        // Must be JSON even though it is not reshaped
        serde_json::from_slice::<serde_json::Value>(&body).map_err(|source| {
            FetchError::Decode {
                url: self.url.clone(),
                source,
            }
        })?;

        Ok(Payload::Raw(body))
    }

    fn name(&self) -> &'static str {
        "pass-through"
    }
}

// ============================================================================
// StaticRateFetcher - For testing purposes
// ============================================================================

/// Fetcher returning a fixed payload, or failing every time
#[derive(Debug, Clone)]
pub struct StaticRateFetcher {
    payload: Option<Payload>,
}

impl StaticRateFetcher {
    pub fn new(payload: Payload) -> Self {
        StaticRateFetcher {
            payload: Some(payload),
        }
    }

    pub fn failing() -> Self {
        StaticRateFetcher { payload: None }
    }
}

#[async_trait]
impl RateFetcher for StaticRateFetcher {
    async fn fetch(&self) -> Result<Payload, FetchError> {
        self.payload.clone().ok_or_else(|| FetchError::Status {
            url: "static".to_string(),
            status: 503,
        })
    }

    fn name(&self) -> &'static str {
        "static"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn conversion(code: &str, name: &str, rate: f64) -> Conversion {
        Conversion {
            code: code.to_string(),
            name: name.to_string(),
            rate,
        }
    }

    #[test]
    fn test_build_rate_map_scales_and_synthesizes() {
        let prices = ReferencePrices {
            scale: 20000.0,
            synthesized: 1500.0,
        };
        let rates = build_rate_map(
            prices,
            vec![conversion("EUR", "Euro", 0.85)],
            "ETH",
            "Ethereum",
        );

        assert_eq!(rates.len(), 2);
        assert_eq!(rates.get("EUR"), Some(&RateEntry::new("Euro", 0.85 * 20000.0)));
        assert_eq!(rates.get("ETH"), Some(&RateEntry::new("Ethereum", 1500.0)));
    }

    #[test]
    fn test_build_rate_map_synthesized_entry_wins() {
        let prices = ReferencePrices {
            scale: 2.0,
            synthesized: 7.0,
        };
        let rates = build_rate_map(
            prices,
            vec![conversion("ETH", "Ether", 3.0), conversion("USD", "US Dollar", 5.0)],
            "ETH",
            "Ethereum",
        );

        assert_eq!(rates.len(), 2);
        assert_eq!(rates.get("ETH"), Some(&RateEntry::new("Ethereum", 7.0)));
        assert_eq!(rates.get("USD"), Some(&RateEntry::new("US Dollar", 10.0)));
    }

    #[test]
    fn test_build_rate_map_drops_empty_codes() {
        let prices = ReferencePrices {
            scale: 1.0,
            synthesized: 1.0,
        };
        let rates = build_rate_map(
            prices,
            vec![conversion("", "Unknown", 1.0)],
            "ETH",
            "Ethereum",
        );

        assert_eq!(rates.codes().collect::<Vec<_>>(), vec!["ETH"]);
    }

    #[tokio::test]
    async fn test_static_fetcher() {
        let fetcher = StaticRateFetcher::new(Payload::Raw(b"{}".to_vec()));
        assert_eq!(fetcher.fetch().await.unwrap(), Payload::Raw(b"{}".to_vec()));
        assert!(StaticRateFetcher::failing().fetch().await.is_err());
    }
}
