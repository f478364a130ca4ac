use std::collections::HashMap;
use std::time::Duration;

use error_stack::{Report, ResultExt};
use governor::{DefaultDirectRateLimiter, Quota, RateLimiter};
use nonzero_ext::nonzero;
use parking_lot::RwLock;
use serde::Deserialize;
use tokio::time::Instant;
use tracing::warn;

use crate::error::ConvertError;

const STABLE_COINS: &[&str] = &["USDT", "BUSD", "USDC", "DAI", "TUSD", "USDP", "FDUSD"];
/// Binance's ticker-price endpoint is weight 2; stay well under the
/// account-wide 1200 weight/minute budget even with several symbols
/// missing the cache at once.
const RATE_FETCH_PER_SECOND: u32 = 10;

#[derive(Debug, Clone, Copy)]
struct CachedRate {
    rate: f64,
    fetched_at: Instant,
    ttl: Duration,
}

impl CachedRate {
    fn is_valid(&self, now: Instant) -> bool {
        now.duration_since(self.fetched_at) < self.ttl
    }
}

/// Converts a (symbol, price, quantity) trade into a USD value.
///
/// Stable-quote pairs convert with no network call. Everything else goes
/// through a TTL'd rate cache backed by the venue's REST price endpoint; a
/// fetch failure returns the `0.0` "unknown" sentinel rather than
/// propagating an error, so a single bad rate lookup never blocks the hot
/// path (§5: the only I/O on the receive loop is this in-memory cache
/// lookup -- a miss returns 0 rather than blocking on the network).
pub struct PriceConverter {
    client: reqwest::Client,
    base_url: String,
    ttl: Duration,
    cache: RwLock<HashMap<String, CachedRate>>,
    rate_limiter: DefaultDirectRateLimiter,
}

impl PriceConverter {
    pub fn new(base_url: impl Into<String>, ttl: Duration) -> Self {
        let quota = Quota::per_second(nonzero!(RATE_FETCH_PER_SECOND));
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.into(),
            ttl,
            cache: RwLock::new(HashMap::new()),
            rate_limiter: RateLimiter::direct(quota),
        }
    }

    /// Split a normalised (uppercase, hyphen-free) symbol into
    /// `(base, quote)`, matching the longest known stable-coin suffix
    /// first, then falling back to a 3/3 split for six-char symbols and a
    /// 4/3 split for seven-char symbols ending in a known quote.
    pub fn split_symbol(symbol: &str) -> Result<(&str, &str), Report<ConvertError>> {
        let mut candidates: Vec<&&str> = STABLE_COINS.iter().collect();
        candidates.sort_by_key(|c| std::cmp::Reverse(c.len()));

        for quote in candidates {
            if symbol.len() > quote.len() && symbol.ends_with(quote) {
                return Ok(symbol.split_at(symbol.len() - quote.len()));
            }
        }

        if symbol.len() == 6 {
            return Ok(symbol.split_at(3));
        }
        if symbol.len() == 7 {
            return Ok(symbol.split_at(4));
        }

        Err(Report::new(ConvertError::SymbolParse {
            symbol: symbol.to_string(),
        }))
    }

    fn is_stable(quote: &str) -> bool {
        STABLE_COINS.contains(&quote)
    }

    /// Convert one trade's value to USD. Never returns an `Err` -- a
    /// failure anywhere in the lookup chain degrades to the `0.0`
    /// sentinel and a logged `MEDIUM` error, per the data-path absorption
    /// rule (§7).
    pub async fn to_usd(&self, symbol: &str, price: f64, quantity: f64) -> f64 {
        let normalized = symbol.replace('-', "").to_uppercase();
        let Ok((_base, quote)) = Self::split_symbol(&normalized) else {
            warn!(symbol, "unable to parse trading pair for USD conversion");
            return 0.0;
        };

        if Self::is_stable(quote) {
            return price * quantity;
        }

        match self.rate_for(quote).await {
            Some(rate) => price * quantity * rate,
            None => {
                warn!(symbol, quote, "rate fetch failed, using 0.0 sentinel");
                0.0
            }
        }
    }

    /// Convert many trades; failures are isolated per-entry.
    pub async fn batch_to_usd(&self, trades: &[(String, f64, f64)]) -> Vec<f64> {
        let mut out = Vec::with_capacity(trades.len());
        for (symbol, price, quantity) in trades {
            out.push(self.to_usd(symbol, *price, *quantity).await);
        }
        out
    }

    async fn rate_for(&self, quote: &str) -> Option<f64> {
        let now = Instant::now();
        if let Some(cached) = self.cache.read().get(quote) {
            if cached.is_valid(now) {
                return Some(cached.rate);
            }
        }

        let rate = self.fetch_rate(quote).await.ok()?;
        self.cache.write().insert(
            quote.to_string(),
            CachedRate {
                rate,
                fetched_at: now,
                ttl: self.ttl,
            },
        );
        Some(rate)
    }

    async fn fetch_rate(&self, quote: &str) -> Result<f64, Report<ConvertError>> {
        self.rate_limiter.until_ready().await;

        let url = format!("{}/api/v3/ticker/price", self.base_url);
        let symbol = format!("{quote}USDT");

        let response = self
            .client
            .get(&url)
            .query(&[("symbol", symbol.as_str())])
            .timeout(Duration::from_secs(5))
            .send()
            .await
            .change_context(ConvertError::RateFetch {
                quote: quote.to_string(),
            })?;

        let parsed: TickerPrice = response
            .json()
            .await
            .change_context(ConvertError::RateFetch {
                quote: quote.to_string(),
            })?;

        parsed
            .price
            .parse::<f64>()
            .change_context(ConvertError::RateFetch {
                quote: quote.to_string(),
            })
    }

}

#[derive(Debug, Deserialize)]
struct TickerPrice {
    price: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn splits_seven_char_usdt_pair() {
        let (base, quote) = PriceConverter::split_symbol("BTCUSDT").unwrap();
        assert_eq!(base, "BTC");
        assert_eq!(quote, "USDT");
    }

    #[test]
    fn splits_longest_stable_suffix_first() {
        // FDUSD (5 chars) must win over a naive 3/3 or 4/3 split
        let (base, quote) = PriceConverter::split_symbol("BTCFDUSD").unwrap();
        assert_eq!(base, "BTC");
        assert_eq!(quote, "FDUSD");
    }

    #[test]
    fn falls_back_to_three_three_split_for_six_chars() {
        let (base, quote) = PriceConverter::split_symbol("ETHBTC").unwrap();
        assert_eq!(base, "ETH");
        assert_eq!(quote, "BTC");
    }

    #[tokio::test]
    async fn stable_quote_conversion_does_not_need_network() {
        // base_url deliberately invalid -- if the stable-coin fast path
        // made a network call, this would fail or hang.
        let converter = PriceConverter::new("http://127.0.0.1:0", Duration::from_secs(60));
        let usd = converter.to_usd("BTCUSDT", 50_000.0, 2.0).await;
        assert_eq!(usd, 100_000.0);
    }

    #[tokio::test]
    async fn unreachable_rate_endpoint_yields_zero_sentinel() {
        let converter = PriceConverter::new("http://127.0.0.1:0", Duration::from_secs(60));
        let usd = converter.to_usd("ETHBTC", 20.0, 5.0).await;
        assert_eq!(usd, 0.0);
    }

    #[test]
    fn unparseable_symbol_returns_err() {
        assert!(PriceConverter::split_symbol("AB").is_err());
    }
}
