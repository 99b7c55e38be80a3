use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::Mutex;

// --- Core Data Structures ---

/// One trading day of price history, as returned by the market data source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Quote {
    pub date: NaiveDate,
    pub close: f64,
}

/// Company-level record from the quote endpoint. The EPS fields stay `None`
/// when the source does not report them, which is distinct from a reported
/// value of exactly zero.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct IssuerInfo {
    pub symbol: String,
    pub name: Option<String>,
    pub currency: Option<String>,
    pub trailing_eps: Option<f64>,
    pub forward_eps: Option<f64>,
}

/// One derived row: close price over the series-wide EPS snapshot.
/// `per` is `None` whenever the EPS is not strictly positive.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PerPoint {
    pub date: NaiveDate,
    pub price: f64,
    pub eps: f64,
    pub per: Option<f64>,
}

/// The full derived series for one (ticker, period) request.
///
/// `moving_average` and `trendline` are aligned index-for-index with
/// `points`; both are `None` at any index whose `per` is undefined, and the
/// moving average is additionally `None` for the first `window - 1` defined
/// positions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PerSeries {
    pub points: Vec<PerPoint>,
    pub moving_average: Vec<Option<f64>>,
    pub trendline: Vec<Option<f64>>,
    pub slope: f64,
    pub intercept: f64,
    pub summary: PerSummary,
}

/// Last-by-date defined values, for the one-line textual summary.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PerSummary {
    pub latest_date: NaiveDate,
    pub latest_per: f64,
    pub eps: f64,
    pub latest_moving_average: Option<f64>,
}

// --- Lookback Periods ---

/// The fixed set of lookback periods offered by the selector, each mapping
/// to the range code the quote source expects.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Period {
    OneYear,
    ThreeMonths,
    SixMonths,
    YearToDate,
    TwoYears,
    FiveYears,
    Max,
}

impl Period {
    pub const ALL: [Period; 7] = [
        Period::OneYear,
        Period::ThreeMonths,
        Period::SixMonths,
        Period::YearToDate,
        Period::TwoYears,
        Period::FiveYears,
        Period::Max,
    ];

    pub fn label(&self) -> &'static str {
        match self {
            Period::OneYear => "1 year",
            Period::ThreeMonths => "3 months",
            Period::SixMonths => "6 months",
            Period::YearToDate => "year-to-date",
            Period::TwoYears => "2 years",
            Period::FiveYears => "5 years",
            Period::Max => "max",
        }
    }

    pub fn range_code(&self) -> &'static str {
        match self {
            Period::OneYear => "1y",
            Period::ThreeMonths => "3mo",
            Period::SixMonths => "6mo",
            Period::YearToDate => "ytd",
            Period::TwoYears => "2y",
            Period::FiveYears => "5y",
            Period::Max => "max",
        }
    }

    /// Accepts either the human-readable label or the range code,
    /// case-insensitively.
    pub fn parse(input: &str) -> Option<Period> {
        let normalized = input.trim().to_lowercase();
        Period::ALL
            .into_iter()
            .find(|p| p.label() == normalized || p.range_code() == normalized)
    }
}

// --- Type Aliases for Shared State ---

// Memoized series keyed by (ticker, range code)
pub type SharedCache = Arc<Mutex<crate::cache::SeriesCache>>;

// The market data client holds rate-limit state, so it lives behind a mutex
pub type SharedClient = Arc<Mutex<crate::yahoo::YahooClient>>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_period_label_round_trip() {
        for period in Period::ALL {
            assert_eq!(Period::parse(period.label()), Some(period));
            assert_eq!(Period::parse(period.range_code()), Some(period));
        }
    }

    #[test]
    fn test_period_parse_is_case_insensitive() {
        assert_eq!(Period::parse("1 YEAR"), Some(Period::OneYear));
        assert_eq!(Period::parse(" YTD "), Some(Period::YearToDate));
        assert_eq!(Period::parse("3MO"), Some(Period::ThreeMonths));
    }

    #[test]
    fn test_period_parse_rejects_unknown() {
        assert_eq!(Period::parse("fortnight"), None);
        assert_eq!(Period::parse(""), None);
    }

    #[test]
    fn test_period_codes_match_source_contract() {
        assert_eq!(Period::OneYear.range_code(), "1y");
        assert_eq!(Period::SixMonths.range_code(), "6mo");
        assert_eq!(Period::Max.range_code(), "max");
    }
}
