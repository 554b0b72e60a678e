use chrono::NaiveDate;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use crate::error::{EngineError, EngineResult};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PriceObservation {
    pub symbol: String,
    pub timestamp: NaiveDate,
    pub open: f64,
    pub adjusted_close: f64,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PairPoint {
    pub timestamp: NaiveDate,
    pub open_a: f64,
    pub price_a: f64,
    pub open_b: f64,
    pub price_b: f64,
}

#[derive(Debug, Clone)]
pub struct PairSeries {
    symbol_a: String,
    symbol_b: String,
    points: Vec<PairPoint>,
}

impl PairSeries {
    /// Inner-joins the observations of `symbol_a` and `symbol_b` by date.
    ///
    /// Dates present for only one symbol are dropped; when a symbol reports the
    /// same date twice the later observation wins.
    pub fn align(
        symbol_a: &str,
        symbol_b: &str,
        observations: &[PriceObservation],
    ) -> EngineResult<Self> {
        let by_date = |symbol: &str| -> BTreeMap<NaiveDate, (f64, f64)> {
            observations
                .iter()
                .filter(|obs| obs.symbol == symbol)
                .map(|obs| (obs.timestamp, (obs.open, obs.adjusted_close)))
                .collect()
        };
        let side_a = by_date(symbol_a);
        if side_a.is_empty() {
            return Err(EngineError::data_unavailable(symbol_a, "no observations"));
        }
        let side_b = by_date(symbol_b);
        if side_b.is_empty() {
            return Err(EngineError::data_unavailable(symbol_b, "no observations"));
        }

        let points: Vec<PairPoint> = side_a
            .iter()
            .filter_map(|(date, &(open_a, price_a))| {
                side_b.get(date).map(|&(open_b, price_b)| PairPoint {
                    timestamp: *date,
                    open_a,
                    price_a,
                    open_b,
                    price_b,
                })
            })
            .collect();
        if points.is_empty() {
            return Err(EngineError::data_unavailable(
                format!("{}/{}", symbol_a, symbol_b),
                "no overlapping dates",
            ));
        }
        Ok(Self {
            symbol_a: symbol_a.to_string(),
            symbol_b: symbol_b.to_string(),
            points,
        })
    }

    pub fn symbol_a(&self) -> &str {
        &self.symbol_a
    }

    pub fn symbol_b(&self) -> &str {
        &self.symbol_b
    }

    pub fn points(&self) -> &[PairPoint] {
        &self.points
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Signal {
    Long,
    Short,
    Flat,
}

impl Signal {
    pub fn as_i8(self) -> i8 {
        match self {
            Signal::Long => 1,
            Signal::Short => -1,
            Signal::Flat => 0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PairMetricRow {
    pub timestamp: NaiveDate,
    pub price_a: f64,
    pub price_b: f64,
    pub return_a: f64,
    pub return_b: f64,
    pub forward_return_a: Option<f64>,
    pub forward_return_b: Option<f64>,
    pub log_return_a: Option<f64>,
    pub log_return_b: Option<f64>,
    pub hedge_ratio: Option<f64>,
    pub spread: Option<f64>,
    pub rolling_correlation: Option<f64>,
    pub z_score: Option<f64>,
    pub signal: Signal,
}

impl PairMetricRow {
    pub fn is_complete(&self) -> bool {
        self.hedge_ratio.is_some()
            && self.spread.is_some()
            && self.rolling_correlation.is_some()
            && self.z_score.is_some()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Stationarity {
    Stationary,
    NonStationary,
    Unknown,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CandidatePairResult {
    pub symbol_a: String,
    pub symbol_b: String,
    pub rolling_correlation_latest: f64,
    pub stationarity: Stationarity,
    pub p_value: Option<f64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderSide {
    Buy,
    Sell,
}

impl OrderSide {
    pub fn opposite(self) -> Self {
        match self {
            OrderSide::Buy => OrderSide::Sell,
            OrderSide::Sell => OrderSide::Buy,
        }
    }
}

impl FromStr for OrderSide {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "buy" => Ok(OrderSide::Buy),
            "sell" => Ok(OrderSide::Sell),
            other => Err(EngineError::config(format!(
                "order side must be buy or sell, got '{}'",
                other
            ))),
        }
    }
}

impl fmt::Display for OrderSide {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OrderSide::Buy => write!(f, "buy"),
            OrderSide::Sell => write!(f, "sell"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PositionSide {
    Long,
    Short,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub symbol: String,
    pub quantity: Decimal,
    pub side: PositionSide,
    pub cost_basis: Decimal,
    pub unrealized_pl: Decimal,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderResult {
    pub symbol: String,
    pub side: OrderSide,
    pub requested_qty: Decimal,
    pub filled_qty: Decimal,
    pub filled_avg_price: Option<Decimal>,
}

impl OrderResult {
    pub fn is_filled(&self) -> bool {
        self.filled_qty == self.requested_qty
    }
}
