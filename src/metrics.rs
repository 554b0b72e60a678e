use serde::{Deserialize, Serialize};

use crate::error::{EngineError, EngineResult};
use crate::model::{PairMetricRow, PairSeries, Signal};

pub const DEFAULT_HEDGE_WINDOW: usize = 60;
pub const DEFAULT_CORR_WINDOW: usize = 180;
pub const DEFAULT_ZSCORE_FAST_WINDOW: usize = 1;
pub const DEFAULT_ZSCORE_SLOW_WINDOW: usize = 50;
const SIGNAL_Z_THRESHOLD: f64 = 1.0;
const EPS: f64 = 1e-12;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetricParams {
    pub hedge_window: usize,
    pub corr_window: usize,
    pub zscore_fast: usize,
    pub zscore_slow: usize,
}

impl Default for MetricParams {
    fn default() -> Self {
        Self {
            hedge_window: DEFAULT_HEDGE_WINDOW,
            corr_window: DEFAULT_CORR_WINDOW,
            zscore_fast: DEFAULT_ZSCORE_FAST_WINDOW,
            zscore_slow: DEFAULT_ZSCORE_SLOW_WINDOW,
        }
    }
}

impl MetricParams {
    pub fn validate(&self) -> EngineResult<()> {
        if self.hedge_window < 2 {
            return Err(EngineError::config(format!(
                "hedge_window must be >= 2 (got {})",
                self.hedge_window
            )));
        }
        if self.zscore_fast == 0 {
            return Err(EngineError::config("zscore_fast_window must be >= 1"));
        }
        if self.zscore_slow < 2 {
            return Err(EngineError::config(format!(
                "zscore_slow_window must be >= 2 (got {})",
                self.zscore_slow
            )));
        }
        if self.zscore_fast > self.zscore_slow {
            return Err(EngineError::config(format!(
                "zscore_fast_window ({}) must not exceed zscore_slow_window ({})",
                self.zscore_fast, self.zscore_slow
            )));
        }
        // correlation reacts slower than the signal
        if self.corr_window <= self.zscore_slow {
            return Err(EngineError::config(format!(
                "corr_window ({}) must be greater than zscore_slow_window ({})",
                self.corr_window, self.zscore_slow
            )));
        }
        Ok(())
    }

    pub fn min_valid_rows(&self) -> usize {
        self.hedge_window.max(self.corr_window).max(self.zscore_slow)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct PairMetrics {
    pub symbol_a: String,
    pub symbol_b: String,
    pub rows: Vec<PairMetricRow>,
}

impl PairMetrics {
    pub fn valid_rows(&self) -> impl Iterator<Item = &PairMetricRow> {
        self.rows.iter().filter(|row| row.is_complete())
    }

    pub fn valid_len(&self) -> usize {
        self.valid_rows().count()
    }

    /// Spread values of the complete rows, the input to the stationarity screen.
    pub fn spread(&self) -> Vec<f64> {
        self.valid_rows().filter_map(|row| row.spread).collect()
    }

    pub fn latest_correlation(&self) -> Option<f64> {
        self.rows.last().and_then(|row| row.rolling_correlation)
    }

    pub fn latest_hedge_ratio(&self) -> Option<f64> {
        self.rows.iter().rev().find_map(|row| row.hedge_ratio)
    }

    pub fn latest_signal(&self) -> Signal {
        self.rows.last().map(|row| row.signal).unwrap_or(Signal::Flat)
    }

    pub fn pair_label(&self) -> String {
        format!("{}/{}", self.symbol_a, self.symbol_b)
    }
}

/// Maps a smoothed z-score to a trading signal. Exact ties at +-1 stay flat.
pub fn classify(z: f64) -> Signal {
    if z < -SIGNAL_Z_THRESHOLD {
        Signal::Long
    } else if z > SIGNAL_Z_THRESHOLD {
        Signal::Short
    } else {
        Signal::Flat
    }
}

/// Builds the metric frame for `series`.
///
/// Rolling columns are `None` until their window is filled; hedge ratios are
/// walk-forward, so row `t` only sees observations up to and including `t`.
pub fn compute(series: &PairSeries, params: &MetricParams) -> EngineResult<PairMetrics> {
    params.validate()?;
    let points = series.points();
    if points.is_empty() {
        return Err(EngineError::data_unavailable(
            format!("{}/{}", series.symbol_a(), series.symbol_b()),
            "empty series",
        ));
    }
    for p in points {
        if !(p.price_a > 0.0 && p.open_a > 0.0 && p.price_a.is_finite()) {
            return Err(EngineError::data_unavailable(
                series.symbol_a(),
                format!("non-positive price on {}", p.timestamp),
            ));
        }
        if !(p.price_b > 0.0 && p.open_b > 0.0 && p.price_b.is_finite()) {
            return Err(EngineError::data_unavailable(
                series.symbol_b(),
                format!("non-positive price on {}", p.timestamp),
            ));
        }
    }

    let prices_a: Vec<f64> = points.iter().map(|p| p.price_a).collect();
    let prices_b: Vec<f64> = points.iter().map(|p| p.price_b).collect();
    let returns_a: Vec<f64> = points.iter().map(|p| (p.price_a - p.open_a) / p.open_a).collect();
    let returns_b: Vec<f64> = points.iter().map(|p| (p.price_b - p.open_b) / p.open_b).collect();
    let log_a = log_returns(&prices_a);
    let log_b = log_returns(&prices_b);

    let hedge = rolling_hedge_ratio(&log_a, &log_b, params.hedge_window);
    let spread: Vec<Option<f64>> = hedge
        .iter()
        .enumerate()
        .map(|(i, hr)| hr.map(|hr| prices_a[i] - prices_b[i] * hr))
        .collect();
    let corr = rolling_correlation(&prices_a, &prices_b, params.corr_window);
    let z = smoothed_zscore(&spread, params.zscore_fast, params.zscore_slow);

    let rows: Vec<PairMetricRow> = points
        .iter()
        .enumerate()
        .map(|(i, p)| PairMetricRow {
            timestamp: p.timestamp,
            price_a: p.price_a,
            price_b: p.price_b,
            return_a: returns_a[i],
            return_b: returns_b[i],
            forward_return_a: returns_a.get(i + 1).copied(),
            forward_return_b: returns_b.get(i + 1).copied(),
            log_return_a: log_a[i],
            log_return_b: log_b[i],
            hedge_ratio: hedge[i],
            spread: spread[i],
            rolling_correlation: corr[i],
            z_score: z[i],
            signal: z[i].map(classify).unwrap_or(Signal::Flat),
        })
        .collect();

    let metrics = PairMetrics {
        symbol_a: series.symbol_a().to_string(),
        symbol_b: series.symbol_b().to_string(),
        rows,
    };
    let available = metrics.valid_len();
    let required = params.min_valid_rows();
    if available < required {
        return Err(EngineError::InsufficientHistory {
            required,
            available,
        });
    }
    Ok(metrics)
}

pub fn log_returns(prices: &[f64]) -> Vec<Option<f64>> {
    let mut out = Vec::with_capacity(prices.len());
    out.push(None);
    for w in prices.windows(2) {
        out.push(Some(w[1].ln() - w[0].ln()));
    }
    out.truncate(prices.len());
    out
}

/// Rolling slope of `y` on `x` through the origin: sum(xy) / sum(xx).
pub fn rolling_hedge_ratio(x: &[Option<f64>], y: &[Option<f64>], window: usize) -> Vec<Option<f64>> {
    let n = x.len().min(y.len());
    (0..n)
        .map(|end| {
            if window == 0 || end + 1 < window {
                return None;
            }
            let start = end + 1 - window;
            let mut sxy = 0.0;
            let mut sxx = 0.0;
            for i in start..=end {
                let (xi, yi) = (x[i]?, y[i]?);
                sxy += xi * yi;
                sxx += xi * xi;
            }
            if sxx.abs() < EPS {
                None
            } else {
                Some(sxy / sxx)
            }
        })
        .collect()
}

pub fn rolling_correlation(a: &[f64], b: &[f64], window: usize) -> Vec<Option<f64>> {
    let n = a.len().min(b.len());
    (0..n)
        .map(|end| {
            if window < 2 || end + 1 < window {
                return None;
            }
            let start = end + 1 - window;
            pearson(&a[start..=end], &b[start..=end])
        })
        .collect()
}

fn pearson(a: &[f64], b: &[f64]) -> Option<f64> {
    let n = a.len() as f64;
    let mean_a = a.iter().sum::<f64>() / n;
    let mean_b = b.iter().sum::<f64>() / n;
    let mut cov = 0.0;
    let mut var_a = 0.0;
    let mut var_b = 0.0;
    for (x, y) in a.iter().zip(b) {
        let dx = x - mean_a;
        let dy = y - mean_b;
        cov += dx * dy;
        var_a += dx * dx;
        var_b += dy * dy;
    }
    let denom = (var_a * var_b).sqrt();
    if denom < EPS {
        None
    } else {
        Some((cov / denom).clamp(-1.0, 1.0))
    }
}

/// `(mean_fast - mean_slow) / std_slow` over the spread; a zero baseline
/// std leaves the row undefined.
pub fn smoothed_zscore(spread: &[Option<f64>], fast: usize, slow: usize) -> Vec<Option<f64>> {
    (0..spread.len())
        .map(|end| {
            let fast_win = window_values(spread, end, fast)?;
            let slow_win = window_values(spread, end, slow)?;
            let (slow_mean, slow_std) = mean_sample_std(&slow_win)?;
            if slow_std < EPS {
                return None;
            }
            let fast_mean = fast_win.iter().sum::<f64>() / fast_win.len() as f64;
            Some((fast_mean - slow_mean) / slow_std)
        })
        .collect()
}

fn window_values(values: &[Option<f64>], end: usize, window: usize) -> Option<Vec<f64>> {
    if window == 0 || end + 1 < window {
        return None;
    }
    values[end + 1 - window..=end].iter().copied().collect()
}

pub fn mean_sample_std(window: &[f64]) -> Option<(f64, f64)> {
    if window.len() < 2 {
        return None;
    }
    let n = window.len() as f64;
    let mean = window.iter().sum::<f64>() / n;
    let var = window
        .iter()
        .map(|v| {
            let d = v - mean;
            d * d
        })
        .sum::<f64>()
        / (n - 1.0);
    Some((mean, var.sqrt()))
}
