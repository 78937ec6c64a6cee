use chrono::{Days, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::registry::PriceRecord;

pub const DEFAULT_HORIZON_DAYS: usize = 14;

/// Projections shorter than this fall back to carrying the last observed
/// price forward.
const MIN_MODEL_OBSERVATIONS: usize = 8;

const PARAM_GRID_STEPS: i32 = 19;
const PARAM_GRID_LIMIT: f64 = 0.95;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ForecastPoint {
    pub date: NaiveDate,
    pub predicted_modal_price: f64,
}

/// Projects modal prices `horizon` days past the observed series using an
/// ARIMA(1,1,1) fit on first differences. Sparse, degenerate, or unstable
/// series degrade to a flat carry-forward of the last observation. An empty
/// series yields an empty forecast.
pub fn forecast_prices(series: &[PriceRecord], horizon: usize) -> Vec<ForecastPoint> {
    let mut ordered: Vec<&PriceRecord> = series.iter().collect();
    ordered.sort_by_key(|record| record.trade_date);
    let values: Vec<f64> = ordered.iter().map(|record| record.modal_price).collect();
    let Some(&last_value) = values.last() else {
        return Vec::new();
    };

    let start = ordered
        .last()
        .and_then(|record| record.trade_date)
        .unwrap_or_else(|| Utc::now().date_naive());

    let predicted = if values.len() >= MIN_MODEL_OBSERVATIONS {
        match arima_projection(&values, horizon) {
            Some(levels) => levels,
            None => {
                debug!("model fit unstable, carrying last price forward");
                vec![last_value; horizon]
            }
        }
    } else {
        vec![last_value; horizon]
    };

    predicted
        .into_iter()
        .enumerate()
        .filter_map(|(offset, value)| {
            let date = start.checked_add_days(Days::new(offset as u64 + 1))?;
            Some(ForecastPoint {
                date,
                predicted_modal_price: (value.max(0.0) * 100.0).round() / 100.0,
            })
        })
        .collect()
}

/// Grid-searched conditional sum of squares over (phi, theta), then a
/// recursive projection of the differenced series cumulated back to levels.
/// Returns `None` when every fit candidate is degenerate or the projection
/// leaves the finite range.
fn arima_projection(values: &[f64], horizon: usize) -> Option<Vec<f64>> {
    let diffs: Vec<f64> = values.windows(2).map(|pair| pair[1] - pair[0]).collect();
    if diffs.iter().all(|d| d.abs() < f64::EPSILON) {
        return None;
    }
    let mean = diffs.iter().sum::<f64>() / diffs.len() as f64;

    let mut best: Option<(f64, f64, f64)> = None;
    for i in 0..PARAM_GRID_STEPS {
        for j in 0..PARAM_GRID_STEPS {
            let phi = grid_value(i);
            let theta = grid_value(j);
            let sse = css(&diffs, mean, phi, theta);
            if !sse.is_finite() {
                continue;
            }
            if best.is_none_or(|(best_sse, _, _)| sse < best_sse) {
                best = Some((sse, phi, theta));
            }
        }
    }
    let (_, phi, theta) = best?;

    // Project the differenced series forward; the moving-average term only
    // carries one step past the data.
    let mut last_diff = *diffs.last()?;
    let mut last_err = residual(&diffs, mean, phi, theta);
    let mut level = *values.last()?;
    let mut levels = Vec::with_capacity(horizon);
    for _ in 0..horizon {
        let next_diff = mean + phi * (last_diff - mean) + theta * last_err;
        level += next_diff;
        if !level.is_finite() {
            return None;
        }
        levels.push(level);
        last_diff = next_diff;
        last_err = 0.0;
    }
    Some(levels)
}

fn grid_value(step: i32) -> f64 {
    let span = 2.0 * PARAM_GRID_LIMIT / (PARAM_GRID_STEPS - 1) as f64;
    -PARAM_GRID_LIMIT + step as f64 * span
}

/// Conditional sum of squared one-step residuals for the candidate pair.
fn css(diffs: &[f64], mean: f64, phi: f64, theta: f64) -> f64 {
    let mut err = 0.0;
    let mut sse = 0.0;
    for window in diffs.windows(2) {
        let predicted = mean + phi * (window[0] - mean) + theta * err;
        err = window[1] - predicted;
        sse += err * err;
    }
    sse
}

/// Final one-step residual under the fitted pair, feeding the first
/// projected step's moving-average term.
fn residual(diffs: &[f64], mean: f64, phi: f64, theta: f64) -> f64 {
    let mut err = 0.0;
    for window in diffs.windows(2) {
        let predicted = mean + phi * (window[0] - mean) + theta * err;
        err = window[1] - predicted;
    }
    err
}
