use async_trait::async_trait;
use chrono::NaiveDate;
use csv::ReaderBuilder;
use serde::Deserialize;
use std::path::Path;

use crate::error::{EngineError, EngineResult};
use crate::model::PriceObservation;
use crate::prices::PriceSeriesAdapter;

#[derive(Debug, Deserialize)]
struct CsvRow {
    date: String,
    symbol: String,
    open: f64,
    adj_close: f64,
}

/// Daily bars loaded from a `date,symbol,open,adj_close` CSV file.
#[derive(Debug, Clone)]
pub struct CsvPriceAdapter {
    rows: Vec<PriceObservation>,
}

impl CsvPriceAdapter {
    pub fn open(path: impl AsRef<Path>) -> EngineResult<Self> {
        let path = path.as_ref();
        let source = path.display().to_string();
        let mut reader = ReaderBuilder::new()
            .trim(csv::Trim::All)
            .from_path(path)
            .map_err(|e| EngineError::data_unavailable(&source, format!("failed to open: {}", e)))?;

        let mut rows = Vec::new();
        for (idx, record) in reader.deserialize::<CsvRow>().enumerate() {
            let row = record.map_err(|e| {
                EngineError::data_unavailable(&source, format!("invalid row {}: {}", idx + 1, e))
            })?;
            let timestamp = parse_date(&row.date).ok_or_else(|| {
                EngineError::data_unavailable(
                    &row.symbol,
                    format!("unparseable date '{}' in {}", row.date, source),
                )
            })?;
            rows.push(PriceObservation {
                symbol: row.symbol.to_ascii_uppercase(),
                timestamp,
                open: row.open,
                adjusted_close: row.adj_close,
            });
        }
        rows.sort_by(|a, b| a.timestamp.cmp(&b.timestamp));
        log::info!("[PRICES] loaded {} rows from {}", rows.len(), source);
        Ok(Self { rows })
    }

    pub fn from_observations(rows: Vec<PriceObservation>) -> Self {
        Self { rows }
    }
}

fn parse_date(value: &str) -> Option<NaiveDate> {
    NaiveDate::parse_from_str(value, "%Y-%m-%d")
        .or_else(|_| NaiveDate::parse_from_str(value, "%Y/%m/%d"))
        .ok()
        .or_else(|| {
            // tolerate full timestamps such as 2024-01-02T00:00:00
            value
                .get(..10)
                .and_then(|head| NaiveDate::parse_from_str(head, "%Y-%m-%d").ok())
        })
}

#[async_trait]
impl PriceSeriesAdapter for CsvPriceAdapter {
    async fn fetch(
        &self,
        symbols: &[String],
        start: NaiveDate,
        end: NaiveDate,
    ) -> EngineResult<Vec<PriceObservation>> {
        if start > end {
            return Err(EngineError::config(format!(
                "start date {} is after end date {}",
                start, end
            )));
        }
        Ok(self
            .rows
            .iter()
            .filter(|row| row.timestamp >= start && row.timestamp <= end)
            .filter(|row| symbols.iter().any(|s| s.eq_ignore_ascii_case(&row.symbol)))
            .cloned()
            .collect())
    }
}
