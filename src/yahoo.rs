use crate::data_structures::{IssuerInfo, Period, Quote};
use chrono::{DateTime, Utc};
use rand::seq::IndexedRandom;
use reqwest::Client;
use serde_json::Value;
use std::time::{Duration, SystemTime};
use thiserror::Error;
use tokio::time::sleep;
use tracing::{debug, instrument, warn};

#[derive(Debug, Error)]
pub enum YahooError {
    #[error("http request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("unexpected response shape: {0}")]
    InvalidResponse(String),
    #[error("the data source is rate limiting requests")]
    RateLimit,
    #[error("no data returned for this ticker")]
    NoData,
}

const DEFAULT_BASE_URL: &str = "https://query1.finance.yahoo.com";

/// HTTP client for the Yahoo Finance quote endpoints, with client-side
/// rate limiting and retry. Holds mutable rate-limit state, so callers
/// share it behind a mutex.
pub struct YahooClient {
    client: Client,
    chart_base_url: String,
    quote_base_url: String,
    rate_limit_per_minute: u32,
    request_timestamps: Vec<SystemTime>,
    user_agents: Vec<String>,
    random_agent: bool,
}

impl YahooClient {
    pub fn new(random_agent: bool, rate_limit_per_minute: u32) -> Result<Self, YahooError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(30))
            .build()?;

        let user_agents = vec![
            "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36".to_string(),
            "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36".to_string(),
            "Mozilla/5.0 (Windows NT 10.0; Win64; x64; rv:120.0) Gecko/20100101 Firefox/120.0".to_string(),
            "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/605.1.15 (KHTML, like Gecko) Version/16.3 Safari/605.1.15".to_string(),
        ];

        Ok(YahooClient {
            client,
            chart_base_url: DEFAULT_BASE_URL.to_string(),
            quote_base_url: DEFAULT_BASE_URL.to_string(),
            rate_limit_per_minute,
            request_timestamps: Vec::new(),
            user_agents,
            random_agent,
        })
    }

    /// Point the client at different hosts, for configuration overrides
    /// and tests.
    pub fn with_base_urls(mut self, chart_base_url: &str, quote_base_url: &str) -> Self {
        self.chart_base_url = chart_base_url.trim_end_matches('/').to_string();
        self.quote_base_url = quote_base_url.trim_end_matches('/').to_string();
        self
    }

    fn get_user_agent(&self) -> String {
        if self.random_agent {
            self.user_agents
                .choose(&mut rand::rng())
                .unwrap_or(&self.user_agents[0])
                .clone()
        } else {
            self.user_agents[0].clone()
        }
    }

    async fn enforce_rate_limit(&mut self) {
        let current_time = SystemTime::now();

        // Drop timestamps older than the one-minute window
        self.request_timestamps.retain(|&timestamp| {
            current_time
                .duration_since(timestamp)
                .unwrap_or(Duration::from_secs(0))
                < Duration::from_secs(60)
        });

        if self.request_timestamps.len() >= self.rate_limit_per_minute as usize {
            if let Some(&oldest_request) = self.request_timestamps.first() {
                let elapsed = current_time
                    .duration_since(oldest_request)
                    .unwrap_or(Duration::from_secs(0));
                let wait_time = Duration::from_secs(60).saturating_sub(elapsed);
                if !wait_time.is_zero() {
                    debug!(wait_ms = wait_time.as_millis() as u64, "Client-side rate limit reached, waiting");
                    sleep(wait_time + Duration::from_millis(100)).await;
                }
            }
        }

        self.request_timestamps.push(current_time);
    }

    async fn make_request(&mut self, url: &str) -> Result<Value, YahooError> {
        const MAX_RETRIES: u32 = 5;
        let mut rate_limited = false;

        for attempt in 0..MAX_RETRIES {
            self.enforce_rate_limit().await;

            if attempt > 0 {
                let delay =
                    Duration::from_secs_f64(2.0_f64.powi(attempt as i32 - 1) + rand::random::<f64>());
                let delay = delay.min(Duration::from_secs(60));
                debug!(attempt, delay_ms = delay.as_millis() as u64, "Retrying request after backoff");
                sleep(delay).await;
            }

            let response = self
                .client
                .get(url)
                .header("Accept", "application/json, text/plain, */*")
                .header("Accept-Language", "en-US,en;q=0.9")
                .header("User-Agent", self.get_user_agent())
                .send()
                .await;

            match response {
                Ok(resp) => {
                    let status = resp.status();

                    if status.is_success() {
                        match resp.json::<Value>().await {
                            Ok(data) => return Ok(data),
                            Err(_) => continue,
                        }
                    } else if status == 429 {
                        rate_limited = true;
                        warn!(%status, "Data source rate limited the request");
                        continue;
                    } else if status == 403 || status.is_server_error() {
                        warn!(%status, "Retryable upstream error");
                        continue;
                    } else if status.is_client_error() {
                        // 404 and friends: the ticker does not exist upstream
                        return Err(YahooError::NoData);
                    } else {
                        continue;
                    }
                }
                Err(_) => continue,
            }
        }

        if rate_limited {
            Err(YahooError::RateLimit)
        } else {
            Err(YahooError::InvalidResponse("max retries exceeded".to_string()))
        }
    }

    /// Daily close history for one ticker over the given lookback period.
    #[instrument(skip(self))]
    pub async fn history(&mut self, symbol: &str, period: Period) -> Result<Vec<Quote>, YahooError> {
        let url = format!(
            "{}/v8/finance/chart/{}?range={}&interval=1d",
            self.chart_base_url,
            symbol,
            period.range_code()
        );

        let response_data = self.make_request(&url).await?;
        let quotes = parse_chart_response(&response_data)?;
        debug!(symbol, rows = quotes.len(), "Fetched price history");
        Ok(quotes)
    }

    /// Issuer record for one ticker, including the trailing and forward
    /// EPS figures when the source reports them.
    #[instrument(skip(self))]
    pub async fn quote_summary(&mut self, symbol: &str) -> Result<IssuerInfo, YahooError> {
        let url = format!("{}/v7/finance/quote?symbols={}", self.quote_base_url, symbol);

        let response_data = self.make_request(&url).await?;
        let info = parse_quote_response(&response_data, symbol)?;
        debug!(
            symbol,
            trailing_eps = ?info.trailing_eps,
            forward_eps = ?info.forward_eps,
            "Fetched issuer info"
        );
        Ok(info)
    }
}

/// Extract daily quotes from a v8 chart response. Rows with a null close
/// are skipped; duplicate dates keep the last row (the live candle is
/// sometimes repeated). The result is sorted ascending by date.
pub fn parse_chart_response(body: &Value) -> Result<Vec<Quote>, YahooError> {
    let result = body["chart"]["result"]
        .as_array()
        .filter(|r| !r.is_empty())
        .ok_or(YahooError::NoData)?;
    let data_item = &result[0];

    let timestamps = match data_item.get("timestamp").and_then(|t| t.as_array()) {
        Some(timestamps) => timestamps,
        // A valid ticker with no trading rows in the window omits the array
        None => return Err(YahooError::NoData),
    };
    let closes = data_item["indicators"]["quote"][0]["close"]
        .as_array()
        .ok_or_else(|| YahooError::InvalidResponse("missing close series".to_string()))?;

    if timestamps.len() != closes.len() {
        return Err(YahooError::InvalidResponse(format!(
            "timestamp/close length mismatch: {} vs {}",
            timestamps.len(),
            closes.len()
        )));
    }

    let mut rows: Vec<Quote> = Vec::with_capacity(timestamps.len());
    for (ts, close) in timestamps.iter().zip(closes) {
        let Some(close) = close.as_f64() else {
            continue; // halted or partial day
        };
        let timestamp = ts.as_i64().ok_or_else(|| {
            YahooError::InvalidResponse(format!("invalid timestamp: {ts:?}"))
        })?;
        let time = DateTime::<Utc>::from_timestamp(timestamp, 0).ok_or_else(|| {
            YahooError::InvalidResponse(format!("timestamp out of range: {timestamp}"))
        })?;

        rows.push(Quote {
            date: time.date_naive(),
            close,
        });
    }

    if rows.is_empty() {
        return Err(YahooError::NoData);
    }

    // Stable sort keeps arrival order within a date, so the last row of
    // each equal run is the latest candle for that day.
    rows.sort_by_key(|q| q.date);
    let mut quotes: Vec<Quote> = Vec::with_capacity(rows.len());
    for row in rows {
        match quotes.last_mut() {
            Some(last) if last.date == row.date => *last = row,
            _ => quotes.push(row),
        }
    }

    Ok(quotes)
}

/// Extract the issuer record from a v7 quote response. An empty result
/// list means the ticker is unknown to the source.
pub fn parse_quote_response(body: &Value, symbol: &str) -> Result<IssuerInfo, YahooError> {
    let result = body["quoteResponse"]["result"]
        .as_array()
        .ok_or_else(|| YahooError::InvalidResponse("missing quoteResponse.result".to_string()))?;
    let item = result.first().ok_or(YahooError::NoData)?;

    let name = item
        .get("longName")
        .and_then(|v| v.as_str())
        .or_else(|| item.get("shortName").and_then(|v| v.as_str()))
        .map(str::to_string);

    Ok(IssuerInfo {
        symbol: symbol.to_uppercase(),
        name,
        currency: item.get("currency").and_then(|v| v.as_str()).map(str::to_string),
        trailing_eps: item.get("epsTrailingTwelveMonths").and_then(|v| v.as_f64()),
        forward_eps: item.get("epsForward").and_then(|v| v.as_f64()),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;
    use serde_json::json;

    #[test]
    fn test_client_creation() {
        let client = YahooClient::new(true, 30);
        assert!(client.is_ok());
    }

    #[test]
    fn test_base_url_override_strips_trailing_slash() {
        let client = YahooClient::new(false, 30)
            .unwrap()
            .with_base_urls("http://localhost:9999/", "http://localhost:9999");
        assert_eq!(client.chart_base_url, "http://localhost:9999");
        assert_eq!(client.quote_base_url, "http://localhost:9999");
    }

    fn chart_body(timestamps: Vec<i64>, closes: Vec<Value>) -> Value {
        json!({
            "chart": {
                "result": [{
                    "timestamp": timestamps,
                    "indicators": { "quote": [{ "close": closes }] }
                }],
                "error": null
            }
        })
    }

    #[test]
    fn test_parse_chart_response() {
        // 2024-01-02 and 2024-01-03, UTC midnight
        let body = chart_body(vec![1704153600, 1704240000], vec![json!(185.5), json!(184.25)]);
        let quotes = parse_chart_response(&body).unwrap();

        assert_eq!(quotes.len(), 2);
        assert_eq!(quotes[0].date, NaiveDate::from_ymd_opt(2024, 1, 2).unwrap());
        assert_eq!(quotes[0].close, 185.5);
        assert_eq!(quotes[1].date, NaiveDate::from_ymd_opt(2024, 1, 3).unwrap());
    }

    #[test]
    fn test_parse_chart_skips_null_closes() {
        let body = chart_body(
            vec![1704153600, 1704240000, 1704326400],
            vec![json!(185.5), json!(null), json!(186.0)],
        );
        let quotes = parse_chart_response(&body).unwrap();
        assert_eq!(quotes.len(), 2);
    }

    #[test]
    fn test_parse_chart_keeps_last_row_for_duplicate_dates() {
        // Same day twice: the later candle wins
        let body = chart_body(vec![1704153600, 1704160800], vec![json!(185.5), json!(187.0)]);
        let quotes = parse_chart_response(&body).unwrap();
        assert_eq!(quotes.len(), 1);
        assert_eq!(quotes[0].close, 187.0);
    }

    #[test]
    fn test_parse_chart_dedupes_out_of_order_duplicate_dates() {
        // A Jan 2 candle arrives after the Jan 3 row; dates must come out
        // strictly increasing with the later Jan 2 candle winning.
        let body = chart_body(
            vec![1704189600, 1704240000, 1704196800],
            vec![json!(185.5), json!(184.0), json!(187.0)],
        );
        let quotes = parse_chart_response(&body).unwrap();

        assert_eq!(quotes.len(), 2);
        assert_eq!(quotes[0].date, NaiveDate::from_ymd_opt(2024, 1, 2).unwrap());
        assert_eq!(quotes[0].close, 187.0);
        assert_eq!(quotes[1].date, NaiveDate::from_ymd_opt(2024, 1, 3).unwrap());
        assert!(quotes.windows(2).all(|w| w[0].date < w[1].date));
    }

    #[test]
    fn test_parse_chart_empty_result_is_no_data() {
        let body = json!({ "chart": { "result": [], "error": null } });
        assert!(matches!(parse_chart_response(&body), Err(YahooError::NoData)));

        let body = json!({ "chart": { "result": null, "error": { "code": "Not Found" } } });
        assert!(matches!(parse_chart_response(&body), Err(YahooError::NoData)));
    }

    #[test]
    fn test_parse_chart_missing_timestamps_is_no_data() {
        let body = json!({
            "chart": { "result": [{ "meta": { "symbol": "AAPL" } }], "error": null }
        });
        assert!(matches!(parse_chart_response(&body), Err(YahooError::NoData)));
    }

    #[test]
    fn test_parse_chart_length_mismatch_is_invalid() {
        let body = chart_body(vec![1704153600, 1704240000], vec![json!(185.5)]);
        assert!(matches!(
            parse_chart_response(&body),
            Err(YahooError::InvalidResponse(_))
        ));
    }

    #[test]
    fn test_parse_quote_response() {
        let body = json!({
            "quoteResponse": {
                "result": [{
                    "longName": "Apple Inc.",
                    "currency": "USD",
                    "epsTrailingTwelveMonths": 6.42,
                    "epsForward": 7.1
                }],
                "error": null
            }
        });
        let info = parse_quote_response(&body, "aapl").unwrap();

        assert_eq!(info.symbol, "AAPL");
        assert_eq!(info.name.as_deref(), Some("Apple Inc."));
        assert_eq!(info.trailing_eps, Some(6.42));
        assert_eq!(info.forward_eps, Some(7.1));
    }

    #[test]
    fn test_parse_quote_absent_eps_stays_none() {
        // Absent must be distinguishable from a reported zero
        let body = json!({
            "quoteResponse": {
                "result": [{ "shortName": "Somecorp", "epsForward": 0.0 }],
                "error": null
            }
        });
        let info = parse_quote_response(&body, "SOME").unwrap();
        assert_eq!(info.trailing_eps, None);
        assert_eq!(info.forward_eps, Some(0.0));
        assert_eq!(info.name.as_deref(), Some("Somecorp"));
    }

    #[test]
    fn test_parse_quote_unknown_ticker_is_no_data() {
        let body = json!({ "quoteResponse": { "result": [], "error": null } });
        assert!(matches!(
            parse_quote_response(&body, "NOPE"),
            Err(YahooError::NoData)
        ));
    }
}
