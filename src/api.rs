use crate::cache::{CacheKey, CachedPer, InFlightGuard, Lookup};
use crate::chart::{self, ChartSpec, TableRow};
use crate::config::AppConfig;
use crate::data_structures::{IssuerInfo, Period, PerSummary, Quote, SharedCache, SharedClient};
use crate::series::{self, SeriesError};
use crate::yahoo::{YahooClient, YahooError};
use axum::{
    Json,
    extract::State,
    http::StatusCode,
    response::{Html, IntoResponse, Response},
};
use axum_extra::extract::Query;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, info, instrument, warn};

// How long a request waits between cache polls while another request is
// fetching the same key.
const PENDING_POLL_INTERVAL: Duration = Duration::from_millis(100);

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: String,
}

fn error_response(status: StatusCode, message: String) -> Response {
    (status, Json(ErrorBody { error: message })).into_response()
}

/// The single page. Everything else it needs comes from /api.
pub async fn index_handler() -> Html<&'static str> {
    Html(include_str!("../assets/index.html"))
}

#[derive(Debug, Serialize)]
pub struct PeriodOption {
    pub label: &'static str,
    pub code: &'static str,
}

pub async fn periods_handler() -> impl IntoResponse {
    let options: Vec<PeriodOption> = Period::ALL
        .iter()
        .map(|p| PeriodOption {
            label: p.label(),
            code: p.range_code(),
        })
        .collect();
    Json(options)
}

#[derive(Debug, Deserialize)]
pub struct PerQuery {
    pub ticker: String,
    pub period: Option<String>,
    #[serde(default)]
    pub include_table: bool,
}

#[derive(Debug, Serialize)]
pub struct PerResponse {
    pub ticker: String,
    pub period: &'static str,
    pub period_code: &'static str,
    pub issuer: Option<String>,
    pub summary: PerSummary,
    pub chart: ChartSpec,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub table: Option<Vec<TableRow>>,
}

#[instrument(skip(cache, client, config), fields(ticker = %query.ticker))]
pub async fn per_handler(
    State(cache): State<SharedCache>,
    State(client): State<SharedClient>,
    State(config): State<AppConfig>,
    Query(query): Query<PerQuery>,
) -> Response {
    let ticker = query.ticker.trim().to_uppercase();
    if ticker.is_empty() {
        return error_response(StatusCode::BAD_REQUEST, "ticker must not be empty".to_string());
    }

    let period_input = query.period.as_deref().unwrap_or("1 year");
    let Some(period) = Period::parse(period_input) else {
        return error_response(
            StatusCode::BAD_REQUEST,
            format!("unknown period '{period_input}'"),
        );
    };

    let key: CacheKey = (ticker.clone(), period.range_code().to_string());

    // Consult the cache; wait when another request already owns the fetch
    // for this key.
    let ticket = loop {
        let mut cache_guard = cache.lock().await;
        match cache_guard.lookup(&key) {
            Lookup::Hit(value) => {
                info!(%ticker, period = period.label(), "Serving PER series from cache");
                return per_response(&ticker, period, &value, query.include_table, &config);
            }
            Lookup::Miss(ticket) => break ticket,
            Lookup::Pending => {}
        }
        drop(cache_guard);
        tokio::time::sleep(PENDING_POLL_INTERVAL).await;
    };

    debug!(%ticker, period = period.label(), "Cache miss, fetching from data source");

    // Releases the in-flight marker on every exit, including cancellation
    // of this task mid-fetch.
    let guard = InFlightGuard::new(cache.clone(), key.clone(), ticket);

    // Fetch and build without holding the cache lock.
    let fetched = {
        let mut client_guard = client.lock().await;
        fetch_per_inputs(&mut client_guard, &ticker, period).await
    };

    let (quotes, issuer) = match fetched {
        Ok(inputs) => inputs,
        Err(e) => {
            guard.fail().await;
            return fetch_error_response(&ticker, e);
        }
    };

    let series = match series::build(&quotes, &issuer, config.moving_average_window) {
        Ok(series) => series,
        Err(e) => {
            guard.fail().await;
            return build_error_response(&ticker, e);
        }
    };

    info!(
        %ticker,
        period = period.label(),
        points = series.points.len(),
        latest_per = series.summary.latest_per,
        "Built PER series"
    );

    let value = CachedPer { issuer, series };
    let value = if guard.complete(value.clone()).await {
        value
    } else {
        // Superseded: a newer request finished first. Serve its result
        // instead of the stale one when it is available.
        match cache.lock().await.get(&key) {
            Some(newer) => {
                debug!(%ticker, "Request superseded, serving newer cached series");
                newer
            }
            None => value,
        }
    };

    per_response(&ticker, period, &value, query.include_table, &config)
}

async fn fetch_per_inputs(
    client: &mut YahooClient,
    ticker: &str,
    period: Period,
) -> Result<(Vec<Quote>, IssuerInfo), YahooError> {
    let quotes = client.history(ticker, period).await?;

    // A missing issuer record is not fatal while price history exists; it
    // surfaces downstream as a missing-EPS condition.
    let issuer = match client.quote_summary(ticker).await {
        Ok(issuer) => issuer,
        Err(YahooError::NoData) => {
            warn!(ticker, "No issuer record, continuing without EPS");
            IssuerInfo {
                symbol: ticker.to_uppercase(),
                ..Default::default()
            }
        }
        Err(e) => return Err(e),
    };

    Ok((quotes, issuer))
}

fn per_response(
    ticker: &str,
    period: Period,
    value: &CachedPer,
    include_table: bool,
    config: &AppConfig,
) -> Response {
    let chart = chart::chart_spec(
        &value.series,
        ticker,
        value.issuer.name.as_deref(),
        config.moving_average_window,
    );
    let table = include_table.then(|| chart::table_tail(&value.series, config.table_tail_rows));

    let body = PerResponse {
        ticker: ticker.to_string(),
        period: period.label(),
        period_code: period.range_code(),
        issuer: value.issuer.name.clone(),
        summary: value.series.summary.clone(),
        chart,
        table,
    };
    (StatusCode::OK, Json(body)).into_response()
}

fn fetch_error_response(ticker: &str, err: YahooError) -> Response {
    warn!(ticker, error = %err, "Fetch failed");
    let (status, message) = match err {
        YahooError::NoData => (
            StatusCode::NOT_FOUND,
            format!("no price data found for '{ticker}'; check the ticker symbol"),
        ),
        YahooError::RateLimit => (
            StatusCode::BAD_GATEWAY,
            "the data source is rate limiting requests, try again shortly".to_string(),
        ),
        other => (
            StatusCode::BAD_GATEWAY,
            format!("failed to fetch market data: {other}"),
        ),
    };
    error_response(status, message)
}

fn build_error_response(ticker: &str, err: SeriesError) -> Response {
    warn!(ticker, error = %err, "Series build failed");
    let status = match err {
        SeriesError::NoData => StatusCode::NOT_FOUND,
        SeriesError::MissingEps | SeriesError::NoValidPer => StatusCode::UNPROCESSABLE_ENTITY,
    };
    error_response(status, format!("{ticker}: {err}"))
}
