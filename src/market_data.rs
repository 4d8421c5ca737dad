// =============================================================================
// Market Data — Historical Backfill Provider
// =============================================================================
//
// Concrete `CandleProvider` implementor backing `MultiTimeframeAggregator::backfill`.
// Grounded on the teacher's REST-client style (a blocking `reqwest::blocking::Client`
// built once and reused, `anyhow::Context` on every network hop) and on the other
// example repos' use of `reqwest::blocking` for synchronous startup fetches that run
// off the async runtime via `tokio::task::spawn_blocking`.
//
// The upstream bar schema and rate limits are out of scope; this adapter speaks only
// to Polygon.io's aggregates endpoint, which is what `POLYGON_API_KEY` is for.

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use tracing::warn;

use crate::aggregator::CandleProvider;
use crate::candle::{Candle, Timeframe};

const POLYGON_BASE_URL: &str = "https://api.polygon.io";

pub struct PolygonCandleProvider {
    client: reqwest::blocking::Client,
    api_key: String,
    symbol: String,
}

impl PolygonCandleProvider {
    pub fn new(api_key: impl Into<String>, symbol: impl Into<String>) -> Self {
        Self {
            client: reqwest::blocking::Client::new(),
            api_key: api_key.into(),
            symbol: symbol.into(),
        }
    }

    fn polygon_ticker(&self) -> String {
        format!("X:{}", self.symbol.replace('/', ""))
    }
}

#[derive(Debug, Deserialize)]
struct AggsResponse {
    #[serde(default)]
    results: Vec<AggBar>,
    status: String,
}

#[derive(Debug, Deserialize)]
struct AggBar {
    t: i64,
    o: f64,
    h: f64,
    l: f64,
    c: f64,
    v: f64,
    #[serde(default)]
    n: u32,
}

impl CandleProvider for PolygonCandleProvider {
    fn fetch(&self, timeframe: Timeframe, lookback_days: u32) -> Result<Vec<Candle>> {
        let (multiplier, span) = match timeframe {
            Timeframe::M1 => (1, "minute"),
            Timeframe::M5 => (5, "minute"),
            Timeframe::M15 => (15, "minute"),
            Timeframe::M30 => (30, "minute"),
            Timeframe::H1 => (1, "hour"),
            Timeframe::D1 => (1, "day"),
            other => bail!("polygon provider does not directly fetch derived timeframe {other}"),
        };

        let end = chrono::Utc::now();
        let start = end - chrono::Duration::days(lookback_days as i64);
        let url = format!(
            "{base}/v2/aggs/ticker/{ticker}/range/{multiplier}/{span}/{start}/{end}",
            base = POLYGON_BASE_URL,
            ticker = self.polygon_ticker(),
            start = start.format("%Y-%m-%d"),
            end = end.format("%Y-%m-%d"),
        );

        let response = self
            .client
            .get(&url)
            .query(&[("adjusted", "true"), ("sort", "asc"), ("limit", "50000"), ("apiKey", self.api_key.as_str())])
            .send()
            .with_context(|| format!("request to polygon for {timeframe} failed"))?;

        if !response.status().is_success() {
            bail!("polygon returned {} for {timeframe}", response.status());
        }

        let parsed: AggsResponse = response.json().context("failed to parse polygon aggregates response")?;
        if parsed.status != "OK" && parsed.status != "DELAYED" {
            warn!(status = %parsed.status, %timeframe, "polygon reported non-OK status");
        }

        Ok(parsed
            .results
            .into_iter()
            .map(|bar| Candle {
                timestamp_millis: bar.t,
                open: bar.o,
                high: bar.h,
                low: bar.l,
                close: bar.c,
                volume: bar.v,
                tick_count: bar.n,
            })
            .collect())
    }
}
