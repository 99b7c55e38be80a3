use crate::data_structures::PerSeries;
use serde::Serialize;
use serde_json::{Value, json};

/// Plotly-shaped chart payload: the browser hands `data` and `layout`
/// straight to the renderer.
#[derive(Debug, Clone, Serialize)]
pub struct ChartSpec {
    pub data: Vec<Trace>,
    pub layout: Value,
}

#[derive(Debug, Clone, Serialize)]
pub struct Trace {
    pub x: Vec<String>,
    pub y: Vec<f64>,
    #[serde(rename = "type")]
    pub trace_type: &'static str,
    pub mode: &'static str,
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub line: Option<Value>,
}

/// One display row of the raw-data tail. Values are rounded to two
/// decimals here; the series itself is never rounded.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TableRow {
    pub date: String,
    pub price: f64,
    pub eps: f64,
    pub per: f64,
    pub moving_average: Option<f64>,
    pub trendline: Option<f64>,
}

fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

/// Render a PER series as one primary trace plus the moving-average and
/// trendline overlays. Undefined points are excluded from every trace,
/// never interpolated.
pub fn chart_spec(
    series: &PerSeries,
    ticker: &str,
    issuer_name: Option<&str>,
    window: usize,
) -> ChartSpec {
    let mut per_x = Vec::new();
    let mut per_y = Vec::new();
    let mut ma_x = Vec::new();
    let mut ma_y = Vec::new();
    let mut trend_x = Vec::new();
    let mut trend_y = Vec::new();

    for (i, point) in series.points.iter().enumerate() {
        let Some(per) = point.per else { continue };
        let date = point.date.format("%Y-%m-%d").to_string();
        per_x.push(date.clone());
        per_y.push(per);
        if let Some(ma) = series.moving_average[i] {
            ma_x.push(date.clone());
            ma_y.push(ma);
        }
        if let Some(trend) = series.trendline[i] {
            trend_x.push(date);
            trend_y.push(trend);
        }
    }

    let label = match issuer_name {
        Some(name) => format!("{ticker} ({name})"),
        None => ticker.to_string(),
    };

    let data = vec![
        Trace {
            x: per_x,
            y: per_y,
            trace_type: "scatter",
            mode: "lines",
            name: "PER".to_string(),
            line: None,
        },
        Trace {
            x: ma_x,
            y: ma_y,
            trace_type: "scatter",
            mode: "lines",
            name: format!("{window}-day PER moving average"),
            line: Some(json!({ "color": "red", "dash": "dot" })),
        },
        Trace {
            x: trend_x,
            y: trend_y,
            trace_type: "scatter",
            mode: "lines",
            name: "Linear trendline".to_string(),
            line: Some(json!({ "color": "gray", "dash": "longdash" })),
        },
    ];

    let layout = json!({
        "title": format!("{} daily PER (EPS: {:.2})", label, series.summary.eps),
        "xaxis": { "title": "date" },
        "yaxis": { "title": "PER" },
        "hovermode": "x unified",
        "legend": { "yanchor": "top", "y": 0.99, "xanchor": "left", "x": 0.01 }
    });

    ChartSpec { data, layout }
}

/// Last `n` defined rows of the derived table, for the raw-data preview.
pub fn table_tail(series: &PerSeries, n: usize) -> Vec<TableRow> {
    let defined: Vec<usize> = series
        .points
        .iter()
        .enumerate()
        .filter_map(|(i, p)| p.per.map(|_| i))
        .collect();

    defined
        .iter()
        .skip(defined.len().saturating_sub(n))
        .map(|&i| {
            let point = &series.points[i];
            TableRow {
                date: point.date.format("%Y-%m-%d").to_string(),
                price: round2(point.price),
                eps: round2(point.eps),
                per: point.per.map(round2).unwrap_or_default(),
                moving_average: series.moving_average[i].map(round2),
                trendline: series.trendline[i].map(round2),
            }
        })
        .collect()
}
