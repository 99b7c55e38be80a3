use crate::data_structures::{IssuerInfo, PerPoint, PerSeries, PerSummary, Quote};
use thiserror::Error;
use tracing::debug;

/// Default rolling mean window, in trading days.
pub const DEFAULT_WINDOW: usize = 20;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SeriesError {
    #[error("no price history available for this ticker and period")]
    NoData,
    #[error("no EPS (trailing or forward) available to compute a PER")]
    MissingEps,
    #[error("EPS is zero or negative, so the PER is undefined for every trading day")]
    NoValidPer,
}

/// Resolve the single EPS snapshot applied to the whole series: trailing
/// EPS when reported and non-zero, otherwise forward EPS. A negative
/// trailing EPS is deliberately NOT skipped; it resolves and later yields
/// an all-undefined series.
pub fn resolve_eps(info: &IssuerInfo) -> Result<f64, SeriesError> {
    if let Some(eps) = info.trailing_eps {
        if eps != 0.0 {
            return Ok(eps);
        }
    }
    match info.forward_eps {
        Some(eps) if eps != 0.0 => Ok(eps),
        _ => Err(SeriesError::MissingEps),
    }
}

/// Build the derived PER series from daily quotes and one issuer record.
///
/// Quotes must be in ascending date order. Each point's `per` is
/// `close / eps` only when `eps > 0`; a zero or negative EPS never reaches
/// the division. The rolling mean and the least-squares trendline are
/// computed over the defined subsequence only and mapped back onto the
/// original indices.
pub fn build(
    quotes: &[Quote],
    info: &IssuerInfo,
    window: usize,
) -> Result<PerSeries, SeriesError> {
    if quotes.is_empty() {
        return Err(SeriesError::NoData);
    }

    let eps = resolve_eps(info)?;

    let points: Vec<PerPoint> = quotes
        .iter()
        .map(|q| PerPoint {
            date: q.date,
            price: q.close,
            eps,
            per: (eps > 0.0).then(|| q.close / eps),
        })
        .collect();

    let defined: Vec<(usize, f64)> = points
        .iter()
        .enumerate()
        .filter_map(|(i, p)| p.per.map(|per| (i, per)))
        .collect();

    if defined.is_empty() {
        return Err(SeriesError::NoValidPer);
    }

    let values: Vec<f64> = defined.iter().map(|&(_, per)| per).collect();
    let means = rolling_mean(&values, window);
    let (slope, intercept) = linear_fit(&values);

    let mut moving_average = vec![None; points.len()];
    let mut trendline = vec![None; points.len()];
    for (j, &(i, _)) in defined.iter().enumerate() {
        moving_average[i] = means[j];
        trendline[i] = Some(intercept + slope * j as f64);
    }

    let &(last_index, latest_per) = defined.last().ok_or(SeriesError::NoValidPer)?;
    let summary = PerSummary {
        latest_date: points[last_index].date,
        latest_per,
        eps,
        latest_moving_average: moving_average[last_index],
    };

    debug!(
        points = points.len(),
        defined = defined.len(),
        slope,
        intercept,
        "Built PER series"
    );

    Ok(PerSeries {
        points,
        moving_average,
        trendline,
        slope,
        intercept,
        summary,
    })
}

/// Trailing mean over a fixed window. The first `window - 1` positions are
/// `None`; there is no backfill and no wraparound.
pub fn rolling_mean(values: &[f64], window: usize) -> Vec<Option<f64>> {
    if window == 0 {
        return vec![None; values.len()];
    }

    let mut out = Vec::with_capacity(values.len());
    let mut sum = 0.0;
    for (i, &value) in values.iter().enumerate() {
        sum += value;
        if i >= window {
            sum -= values[i - window];
        }
        out.push((i + 1 >= window).then(|| sum / window as f64));
    }
    out
}

/// Ordinary least-squares fit of `values` against the zero-based index.
/// Returns (slope, intercept); degenerate inputs fall back to a horizontal
/// line through the mean.
pub fn linear_fit(values: &[f64]) -> (f64, f64) {
    let n = values.len() as f64;
    match values.len() {
        0 => return (0.0, 0.0),
        1 => return (0.0, values[0]),
        _ => {}
    }

    let x_mean = (n - 1.0) / 2.0;
    let y_mean = values.iter().sum::<f64>() / n;

    let mut numerator = 0.0;
    let mut denominator = 0.0;
    for (i, &y) in values.iter().enumerate() {
        let dx = i as f64 - x_mean;
        numerator += dx * (y - y_mean);
        denominator += dx * dx;
    }

    if denominator.abs() < 1e-12 {
        return (0.0, y_mean);
    }

    let slope = numerator / denominator;
    (slope, y_mean - slope * x_mean)
}
