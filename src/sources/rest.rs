//! Generic REST ticker adapter
//!
//! Polls a JSON ticker endpoint per pair. The endpoint template carries
//! `{base}` / `{target}` placeholders, e.g.
//! `https://api.example.com/v1/ticker/{base}-{target}`. Candles come from
//! the sibling `/candles` route. Vendor-specific response quirks are out of
//! scope; the payload shapes here are the normalized ones.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use rust_decimal::Decimal;
use serde::Deserialize;
use tracing::debug;

use crate::error::FeedError;
use crate::sources::QuoteFeed;
use crate::types::{Candle, Pair, Quote, Source};

#[derive(Debug, Deserialize)]
struct TickerPayload {
    bid: String,
    ask: String,
    #[serde(default)]
    last: Option<String>,
}

#[derive(Debug, Deserialize)]
struct CandlePayload {
    open: String,
    high: String,
    low: String,
    close: String,
    volume: String,
    /// Candle open timestamp (epoch ms)
    time: i64,
}

pub struct RestTickerFeed {
    source: Source,
    client: Client,
    endpoint: String,
    pairs: Vec<Pair>,
}

impl RestTickerFeed {
    pub fn new(source: Source, endpoint: impl Into<String>, pairs: Vec<Pair>) -> Self {
        let client = Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .expect("Failed to create HTTP client");
        Self {
            source,
            client,
            endpoint: endpoint.into(),
            pairs,
        }
    }

    fn ticker_url(&self, pair: &Pair) -> String {
        self.endpoint
            .replace("{base}", &pair.base)
            .replace("{target}", &pair.target)
    }

    async fn fetch_one(&self, pair: &Pair) -> Result<Quote, FeedError> {
        let url = self.ticker_url(pair);
        let response = self.client.get(&url).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(FeedError::Endpoint {
                status: status.as_u16(),
            });
        }

        let payload: TickerPayload = response
            .json()
            .await
            .map_err(|e| FeedError::Decode(e.to_string()))?;

        let bid = parse_decimal(&payload.bid)?;
        let ask = parse_decimal(&payload.ask)?;
        let last = match payload.last.as_deref() {
            Some(raw) => parse_decimal(raw)?,
            None => (bid + ask) / rust_decimal::Decimal::TWO,
        };
        Ok(Quote::new(self.source, pair.clone(), bid, ask, last))
    }
}

fn parse_decimal(raw: &str) -> Result<Decimal, FeedError> {
    raw.parse::<Decimal>()
        .map_err(|e| FeedError::Decode(format!("bad decimal '{raw}': {e}")))
}

#[async_trait]
impl QuoteFeed for RestTickerFeed {
    fn source(&self) -> Source {
        self.source
    }

    async fn fetch_quotes(&self) -> Result<Vec<Quote>, FeedError> {
        let mut quotes = Vec::with_capacity(self.pairs.len());
        let mut last_err = None;
        for pair in &self.pairs {
            match self.fetch_one(pair).await {
                Ok(quote) => quotes.push(quote),
                // One broken pair should not starve the others
                Err(e) => {
                    debug!(source = %self.source, pair = %pair, error = %e, "Ticker fetch failed");
                    last_err = Some(e);
                }
            }
        }
        match (quotes.is_empty(), last_err) {
            (true, Some(e)) => Err(e),
            _ => Ok(quotes),
        }
    }

    async fn fetch_candles(
        &self,
        pair: &Pair,
        timeframe: &str,
        limit: usize,
    ) -> Result<Vec<Candle>, FeedError> {
        let url = format!(
            "{}/candles?tf={}&limit={}",
            self.ticker_url(pair),
            timeframe,
            limit
        );
        let response = self.client.get(&url).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(FeedError::Endpoint {
                status: status.as_u16(),
            });
        }

        let payloads: Vec<CandlePayload> = response
            .json()
            .await
            .map_err(|e| FeedError::Decode(e.to_string()))?;

        payloads
            .into_iter()
            .map(|c| {
                Ok(Candle {
                    source: self.source,
                    pair: pair.clone(),
                    open: parse_decimal(&c.open)?,
                    high: parse_decimal(&c.high)?,
                    low: parse_decimal(&c.low)?,
                    close: parse_decimal(&c.close)?,
                    volume: parse_decimal(&c.volume)?,
                    open_time_ms: c.time,
                    timeframe: timeframe.to_string(),
                })
            })
            .collect()
    }
}
