use async_trait::async_trait;
use chrono::NaiveDate;
use tokio::time::{sleep, timeout, Duration};

use crate::error::{EngineError, EngineResult};
use crate::model::PriceObservation;

const RETRY_BACKOFF_MS: u64 = 500;

/// Supplies daily price history for a set of symbols.
#[async_trait]
pub trait PriceSeriesAdapter: Send + Sync {
    async fn fetch(
        &self,
        symbols: &[String],
        start: NaiveDate,
        end: NaiveDate,
    ) -> EngineResult<Vec<PriceObservation>>;
}

#[derive(Debug, Clone, Copy)]
pub struct FetchPolicy {
    pub timeout: Duration,
    pub retries: u32,
}

impl Default for FetchPolicy {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            retries: 2,
        }
    }
}

/// Calls `adapter.fetch` with a per-attempt timeout and a bounded number of retries.
pub async fn fetch_with_retry(
    adapter: &dyn PriceSeriesAdapter,
    symbols: &[String],
    start: NaiveDate,
    end: NaiveDate,
    policy: FetchPolicy,
) -> EngineResult<Vec<PriceObservation>> {
    let attempts = policy.retries + 1;
    let mut last_err = None;
    for attempt in 1..=attempts {
        match timeout(policy.timeout, adapter.fetch(symbols, start, end)).await {
            Ok(Ok(observations)) => return Ok(observations),
            Ok(Err(err)) => {
                log::warn!(
                    "[PRICES] fetch attempt {}/{} failed: {}",
                    attempt,
                    attempts,
                    err
                );
                last_err = Some(err);
            }
            Err(_) => {
                log::warn!(
                    "[PRICES] fetch attempt {}/{} timed out after {:?}",
                    attempt,
                    attempts,
                    policy.timeout
                );
                last_err = Some(EngineError::data_unavailable(
                    symbols.join(","),
                    format!("fetch timed out after {:?}", policy.timeout),
                ));
            }
        }
        if attempt < attempts {
            sleep(Duration::from_millis(RETRY_BACKOFF_MS * attempt as u64)).await;
        }
    }
    Err(last_err.unwrap_or_else(|| EngineError::data_unavailable(symbols.join(","), "no attempts")))
}
