use chrono::NaiveDate;
use std::cmp::Ordering;
use std::sync::Arc;

use crate::error::{EngineError, EngineResult};
use crate::metrics::{self, MetricParams, PairMetrics};
use crate::model::{CandidatePairResult, PairSeries, PriceObservation, Stationarity};
use crate::prices::{fetch_with_retry, FetchPolicy, PriceSeriesAdapter};
use crate::report::{EngineEvent, Reporter};
use crate::stationarity::StationarityScreen;

#[derive(Debug, Clone)]
pub struct SelectedPair {
    pub symbol_a: String,
    pub symbol_b: String,
    pub metrics: PairMetrics,
    /// Candidates in the order they were considered, the selected pair last.
    pub candidates: Vec<CandidatePairResult>,
}

pub struct PairSelector {
    adapter: Arc<dyn PriceSeriesAdapter>,
    screen: Arc<dyn StationarityScreen>,
    reporter: Arc<dyn Reporter>,
    params: MetricParams,
    start: NaiveDate,
    end: NaiveDate,
    fetch_policy: FetchPolicy,
}

impl PairSelector {
    pub fn new(
        adapter: Arc<dyn PriceSeriesAdapter>,
        screen: Arc<dyn StationarityScreen>,
        reporter: Arc<dyn Reporter>,
        params: MetricParams,
        start: NaiveDate,
        end: NaiveDate,
    ) -> Self {
        Self {
            adapter,
            screen,
            reporter,
            params,
            start,
            end,
            fetch_policy: FetchPolicy::default(),
        }
    }

    pub fn with_fetch_policy(mut self, policy: FetchPolicy) -> Self {
        self.fetch_policy = policy;
        self
    }

    /// Fetches prices once and returns every evaluable pair, highest latest correlation first.
    pub async fn rank_candidates(&self, symbols: &[String]) -> EngineResult<Vec<PairMetrics>> {
        let unique = unique_symbols(symbols)?;
        self.params.validate()?;
        let observations = fetch_with_retry(
            self.adapter.as_ref(),
            &unique,
            self.start,
            self.end,
            self.fetch_policy,
        )
        .await?;
        rank_pairs(&unique, &observations, &self.params, self.reporter.as_ref())
    }

    /// Picks the most correlated pair whose spread passes the stationarity screen.
    ///
    /// With `bypass_stationarity` the top-ranked pair is returned unscreened.
    pub async fn select_best_pair(
        &self,
        symbols: &[String],
        bypass_stationarity: bool,
    ) -> EngineResult<SelectedPair> {
        let ranked = self.rank_candidates(symbols).await?;
        if ranked.is_empty() {
            return Err(EngineError::NoSuitablePairs { evaluated: 0 });
        }

        if bypass_stationarity {
            let candidates = ranked
                .iter()
                .map(|m| candidate(m, Stationarity::Unknown, None))
                .collect();
            let top = ranked
                .into_iter()
                .next()
                .ok_or(EngineError::NoSuitablePairs { evaluated: 0 })?;
            return Ok(self.selected(top, candidates, true));
        }

        let mut candidates = Vec::with_capacity(ranked.len());
        for metrics in ranked {
            let (stationarity, p_value) = match self.screen.screen(&metrics) {
                Ok(report) if report.is_stationary => (Stationarity::Stationary, Some(report.p_value)),
                Ok(report) => (Stationarity::NonStationary, Some(report.p_value)),
                Err(err) => {
                    log::warn!("[SELECT] {} screen failed: {}", metrics.pair_label(), err);
                    (Stationarity::Unknown, None)
                }
            };
            self.reporter.report(&EngineEvent::PairScreened {
                pair: metrics.pair_label(),
                stationarity,
                p_value,
            });
            candidates.push(candidate(&metrics, stationarity, p_value));
            if stationarity == Stationarity::Stationary {
                return Ok(self.selected(metrics, candidates, false));
            }
        }

        Err(EngineError::NoSuitablePairs {
            evaluated: candidates.len(),
        })
    }

    fn selected(
        &self,
        metrics: PairMetrics,
        candidates: Vec<CandidatePairResult>,
        bypassed: bool,
    ) -> SelectedPair {
        self.reporter.report(&EngineEvent::PairSelected {
            pair: metrics.pair_label(),
            correlation: metrics.latest_correlation().unwrap_or(f64::NAN),
            bypassed,
        });
        SelectedPair {
            symbol_a: metrics.symbol_a.clone(),
            symbol_b: metrics.symbol_b.clone(),
            metrics,
            candidates,
        }
    }
}

/// Builds metrics for every C(n,2) pair in input order and sorts them by latest
/// correlation, descending. The sort is stable so equal correlations keep input order.
pub fn rank_pairs(
    symbols: &[String],
    observations: &[PriceObservation],
    params: &MetricParams,
    reporter: &dyn Reporter,
) -> EngineResult<Vec<PairMetrics>> {
    let mut ranked = Vec::new();
    for (i, symbol_a) in symbols.iter().enumerate() {
        for symbol_b in &symbols[i + 1..] {
            let pair = format!("{}/{}", symbol_a, symbol_b);
            let evaluated = PairSeries::align(symbol_a, symbol_b, observations)
                .and_then(|series| metrics::compute(&series, params));
            match evaluated {
                Ok(m) if m.latest_correlation().is_some() => ranked.push(m),
                Ok(_) => reporter.report(&EngineEvent::PairSkipped {
                    pair,
                    reason: "latest rolling correlation undefined".to_string(),
                }),
                Err(err) if err.is_pair_local() => reporter.report(&EngineEvent::PairSkipped {
                    pair,
                    reason: err.to_string(),
                }),
                Err(err) => return Err(err),
            }
        }
    }

    ranked.sort_by(|a, b| {
        let ca = a.latest_correlation().unwrap_or(f64::NEG_INFINITY);
        let cb = b.latest_correlation().unwrap_or(f64::NEG_INFINITY);
        cb.partial_cmp(&ca).unwrap_or(Ordering::Equal)
    });
    for (idx, m) in ranked.iter().enumerate() {
        reporter.report(&EngineEvent::PairRanked {
            pair: m.pair_label(),
            rank: idx + 1,
            correlation: m.latest_correlation().unwrap_or(f64::NAN),
        });
    }
    Ok(ranked)
}

fn unique_symbols(symbols: &[String]) -> EngineResult<Vec<String>> {
    let mut unique: Vec<String> = Vec::with_capacity(symbols.len());
    for symbol in symbols {
        let symbol = symbol.trim().to_ascii_uppercase();
        if !symbol.is_empty() && !unique.contains(&symbol) {
            unique.push(symbol);
        }
    }
    if unique.len() < 2 {
        return Err(EngineError::config(format!(
            "at least two distinct symbols are required, got {:?}",
            unique
        )));
    }
    Ok(unique)
}

fn candidate(
    metrics: &PairMetrics,
    stationarity: Stationarity,
    p_value: Option<f64>,
) -> CandidatePairResult {
    CandidatePairResult {
        symbol_a: metrics.symbol_a.clone(),
        symbol_b: metrics.symbol_b.clone(),
        rolling_correlation_latest: metrics.latest_correlation().unwrap_or(f64::NAN),
        stationarity,
        p_value,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::report::RecordingReporter;
    use crate::stationarity::{CriticalValues, StationarityReport};
    use async_trait::async_trait;
    use chrono::Days;
    use rand::rngs::StdRng;
    use rand::SeedableRng;
    use rand_distr::{Distribution, Normal};

    struct FixedPrices(Vec<PriceObservation>);

    #[async_trait]
    impl PriceSeriesAdapter for FixedPrices {
        async fn fetch(
            &self,
            symbols: &[String],
            _start: NaiveDate,
            _end: NaiveDate,
        ) -> EngineResult<Vec<PriceObservation>> {
            Ok(self
                .0
                .iter()
                .filter(|o| symbols.contains(&o.symbol))
                .cloned()
                .collect())
        }
    }

    /// Passes only the `stationary` pairs; pairs listed in `broken` fail to screen.
    struct PairScreen {
        stationary: Vec<&'static str>,
        broken: Vec<&'static str>,
    }

    impl StationarityScreen for PairScreen {
        fn screen(&self, metrics: &PairMetrics) -> EngineResult<StationarityReport> {
            let label = metrics.pair_label();
            if self.broken.contains(&label.as_str()) {
                return Err(EngineError::data_unavailable("spread", "degenerate"));
            }
            let pass = self.stationary.contains(&label.as_str());
            Ok(StationarityReport {
                adf_statistic: if pass { -4.0 } else { -1.0 },
                p_value: if pass { 0.01 } else { 0.6 },
                used_lag: 0,
                n_obs: metrics.valid_len(),
                critical_values: CriticalValues {
                    one_pct: -3.46,
                    five_pct: -2.87,
                    ten_pct: -2.57,
                },
                half_life: 5.0,
                is_stationary: pass,
            })
        }
    }

    fn test_params() -> MetricParams {
        MetricParams {
            hedge_window: 20,
            corr_window: 60,
            zscore_fast: 1,
            zscore_slow: 30,
        }
    }

    /// AAPL and GOOG track a shared trend almost exactly; MSFT carries heavy noise.
    fn synthetic_prices(days: u64) -> Vec<PriceObservation> {
        let mut rng = StdRng::seed_from_u64(7);
        let step = Normal::new(0.0, 1.0).unwrap();
        let start = NaiveDate::from_ymd_opt(2023, 1, 2).unwrap();
        let mut walk = 0.0;
        let mut out = Vec::new();
        for t in 0..days {
            walk += step.sample(&mut rng);
            let base = 0.5 * t as f64 + walk;
            let date = start.checked_add_days(Days::new(t)).unwrap();
            let quotes = [
                ("AAPL", 100.0 + base + 0.1 * step.sample(&mut rng)),
                ("MSFT", 200.0 + base + 3.0 * step.sample(&mut rng)),
                ("GOOG", 50.0 + 0.5 * base + 0.01 * step.sample(&mut rng)),
            ];
            for (symbol, price) in quotes {
                out.push(PriceObservation {
                    symbol: symbol.to_string(),
                    timestamp: date,
                    open: price,
                    adjusted_close: price,
                });
            }
        }
        out
    }

    fn selector(
        screen: PairScreen,
        reporter: Arc<RecordingReporter>,
    ) -> PairSelector {
        PairSelector::new(
            Arc::new(FixedPrices(synthetic_prices(200))),
            Arc::new(screen),
            reporter,
            test_params(),
            NaiveDate::from_ymd_opt(2023, 1, 1).unwrap(),
            NaiveDate::from_ymd_opt(2024, 1, 1).unwrap(),
        )
    }

    fn symbols(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[tokio::test]
    async fn ranking_covers_every_pair_in_descending_correlation() {
        let reporter = Arc::new(RecordingReporter::default());
        let selector = selector(
            PairScreen {
                stationary: vec![],
                broken: vec![],
            },
            reporter,
        );
        let ranked = selector
            .rank_candidates(&symbols(&["AAPL", "MSFT", "GOOG"]))
            .await
            .unwrap();
        assert_eq!(ranked.len(), 3);
        assert_eq!(ranked[0].pair_label(), "AAPL/GOOG");
        let corrs: Vec<f64> = ranked
            .iter()
            .map(|m| m.latest_correlation().unwrap())
            .collect();
        assert!(corrs.windows(2).all(|w| w[0] >= w[1]));
    }

    #[tokio::test]
    async fn returns_the_only_stationary_pair_regardless_of_rank() {
        let reporter = Arc::new(RecordingReporter::default());
        let selector = selector(
            PairScreen {
                stationary: vec!["AAPL/MSFT"],
                broken: vec![],
            },
            reporter.clone(),
        );
        let selected = selector
            .select_best_pair(&symbols(&["AAPL", "MSFT", "GOOG"]), false)
            .await
            .unwrap();
        assert_eq!((selected.symbol_a.as_str(), selected.symbol_b.as_str()), ("AAPL", "MSFT"));
        assert_eq!(selected.candidates[0].symbol_b, "GOOG");
        assert_eq!(selected.candidates[0].stationarity, Stationarity::NonStationary);
        let last = selected.candidates.last().unwrap();
        assert_eq!(last.stationarity, Stationarity::Stationary);
        assert_eq!(last.p_value, Some(0.01));
        assert!(reporter.events().iter().any(|e| matches!(
            e,
            EngineEvent::PairSelected { bypassed: false, .. }
        )));
    }

    #[tokio::test]
    async fn no_stationary_pair_is_an_error_unless_bypassed() {
        let reporter = Arc::new(RecordingReporter::default());
        let selector = selector(
            PairScreen {
                stationary: vec![],
                broken: vec![],
            },
            reporter,
        );
        let list = symbols(&["AAPL", "MSFT", "GOOG"]);
        let err = selector.select_best_pair(&list, false).await.unwrap_err();
        assert_eq!(err, EngineError::NoSuitablePairs { evaluated: 3 });

        let ranked = selector.rank_candidates(&list).await.unwrap();
        let bypassed = selector.select_best_pair(&list, true).await.unwrap();
        assert_eq!(bypassed.metrics.pair_label(), ranked[0].pair_label());
        assert!(bypassed
            .candidates
            .iter()
            .all(|c| c.stationarity == Stationarity::Unknown));
    }

    #[tokio::test]
    async fn screen_errors_mark_pair_unknown_and_continue() {
        let reporter = Arc::new(RecordingReporter::default());
        let selector = selector(
            PairScreen {
                stationary: vec!["AAPL/MSFT", "MSFT/GOOG"],
                broken: vec!["AAPL/GOOG"],
            },
            reporter,
        );
        let selected = selector
            .select_best_pair(&symbols(&["AAPL", "MSFT", "GOOG"]), false)
            .await
            .unwrap();
        assert_eq!(selected.candidates[0].stationarity, Stationarity::Unknown);
        assert_eq!(selected.candidates[0].p_value, None);
        assert_ne!(selected.metrics.pair_label(), "AAPL/GOOG");
    }

    #[tokio::test]
    async fn pairs_without_data_are_skipped() {
        let reporter = Arc::new(RecordingReporter::default());
        let selector = selector(
            PairScreen {
                stationary: vec!["AAPL/MSFT"],
                broken: vec![],
            },
            reporter.clone(),
        );
        let ranked = selector
            .rank_candidates(&symbols(&["AAPL", "TSLA", "MSFT"]))
            .await
            .unwrap();
        assert_eq!(ranked.len(), 1);
        let skipped = reporter
            .events()
            .iter()
            .filter(|e| matches!(e, EngineEvent::PairSkipped { .. }))
            .count();
        assert_eq!(skipped, 2);
    }

    #[tokio::test]
    async fn needs_two_distinct_symbols() {
        let reporter = Arc::new(RecordingReporter::default());
        let selector = selector(
            PairScreen {
                stationary: vec![],
                broken: vec![],
            },
            reporter,
        );
        let err = selector
            .select_best_pair(&symbols(&["AAPL", "aapl", " "]), false)
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Configuration(_)));
    }

    #[tokio::test]
    async fn short_history_leaves_nothing_to_select() {
        let reporter = Arc::new(RecordingReporter::default());
        let selector = PairSelector::new(
            Arc::new(FixedPrices(synthetic_prices(40))),
            Arc::new(PairScreen {
                stationary: vec!["AAPL/MSFT"],
                broken: vec![],
            }),
            reporter,
            test_params(),
            NaiveDate::from_ymd_opt(2023, 1, 1).unwrap(),
            NaiveDate::from_ymd_opt(2024, 1, 1).unwrap(),
        );
        let err = selector
            .select_best_pair(&symbols(&["AAPL", "MSFT"]), true)
            .await
            .unwrap_err();
        assert_eq!(err, EngineError::NoSuitablePairs { evaluated: 0 });
    }
}
