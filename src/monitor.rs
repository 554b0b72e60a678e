use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::time::{self, Duration, MissedTickBehavior};

use crate::error::{EngineError, EngineResult};
use crate::gateway::BrokerageGateway;
use crate::model::{Position, PositionSide};
use crate::report::{EngineEvent, Reporter};

pub const DEFAULT_POLL_INTERVAL_SECS: u64 = 5;

/// Shared stop flag. Any holder may trip it; the monitor checks it at the top of each tick.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Phase {
    Idle,
    Polling,
    Liquidating,
    Stopped,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ExitReason {
    TakeProfit,
    StopLoss,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum StopReason {
    Exit(ExitReason),
    Cancelled,
    TickLimit,
}

/// Result of the single close-all attempt made after an exit trigger.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum Liquidation {
    Filled { orders: usize },
    /// Some close orders were only partly filled; positions may remain open.
    Unfilled { symbols: Vec<String> },
    /// close_all_positions itself failed; the monitor stopped with positions unresolved.
    Failed { error: String },
}

#[derive(Debug, Clone, PartialEq)]
pub struct MonitorState {
    pub threshold_take_profit: f64,
    /// Stored negated, e.g. 1.5 becomes -1.5.
    pub threshold_stop_loss: f64,
    pub cumulative_poll_count: u64,
    pub running: bool,
    pub phase: Phase,
}

impl Default for MonitorState {
    fn default() -> Self {
        Self {
            threshold_take_profit: 0.0,
            threshold_stop_loss: 0.0,
            cumulative_poll_count: 0,
            running: false,
            phase: Phase::Idle,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct MonitorOutcome {
    pub ticks: u64,
    pub reason: StopReason,
    pub last_profit_pct: Option<f64>,
    pub liquidation: Option<Liquidation>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum TickOutcome {
    Continue { profit_pct: f64 },
    Stopped(MonitorOutcome),
}

/// Take profit must be positive, stop loss non-negative; both finite.
pub fn validate_thresholds(take_profit_pct: f64, stop_loss_pct: f64) -> EngineResult<()> {
    if !take_profit_pct.is_finite() || take_profit_pct <= 0.0 {
        return Err(EngineError::config(format!(
            "take profit must be a positive percentage, got {}",
            take_profit_pct
        )));
    }
    if !stop_loss_pct.is_finite() || stop_loss_pct < 0.0 {
        return Err(EngineError::config(format!(
            "stop loss must be a non-negative percentage, got {}",
            stop_loss_pct
        )));
    }
    Ok(())
}

fn checked_total(mut values: impl Iterator<Item = Decimal>) -> Option<Decimal> {
    values.try_fold(Decimal::ZERO, |acc, v| acc.checked_add(v))
}

/// Aggregate unrealised profit as a percentage of total cost basis, rounded to 3 places.
///
/// Returns 0 when the cost basis sums to zero (including no positions at all)
/// or when the sums or quotient overflow `Decimal`.
pub fn unrealised_profit_pct(positions: &[Position]) -> f64 {
    let Some(total_cost) = checked_total(positions.iter().map(|p| p.cost_basis)) else {
        return 0.0;
    };
    if total_cost.is_zero() {
        return 0.0;
    }
    checked_total(positions.iter().map(|p| p.unrealized_pl))
        .and_then(|pl| pl.checked_mul(Decimal::ONE_HUNDRED))
        .and_then(|scaled| scaled.checked_div(total_cost))
        .and_then(|pct| pct.round_dp(3).to_f64())
        .unwrap_or(0.0)
}

pub fn format_positions_summary(positions: &[Position]) -> String {
    if positions.is_empty() {
        return "none".to_string();
    }
    positions
        .iter()
        .map(|position| {
            let side = match position.side {
                PositionSide::Long => "LONG",
                PositionSide::Short => "SHORT",
            };
            format!(
                "{} {} qty={} cost={} pl={}",
                position.symbol, side, position.quantity, position.cost_basis, position.unrealized_pl
            )
        })
        .collect::<Vec<_>>()
        .join(", ")
}

/// Polls open positions and liquidates once take-profit or stop-loss is crossed.
pub struct RiskMonitor {
    gateway: Arc<dyn BrokerageGateway>,
    reporter: Arc<dyn Reporter>,
    cancel: CancelToken,
    poll_interval: Duration,
    max_ticks: Option<u64>,
    last_profit_pct: Option<f64>,
    state: MonitorState,
}

impl RiskMonitor {
    pub fn new(gateway: Arc<dyn BrokerageGateway>, reporter: Arc<dyn Reporter>) -> Self {
        Self {
            gateway,
            reporter,
            cancel: CancelToken::new(),
            poll_interval: Duration::from_secs(DEFAULT_POLL_INTERVAL_SECS),
            max_ticks: None,
            last_profit_pct: None,
            state: MonitorState::default(),
        }
    }

    pub fn with_cancel_token(mut self, cancel: CancelToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_max_ticks(mut self, max_ticks: Option<u64>) -> Self {
        self.max_ticks = max_ticks;
        self
    }

    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    pub fn state(&self) -> &MonitorState {
        &self.state
    }

    /// Validates thresholds and moves Idle -> Polling.
    pub fn start(&mut self, take_profit_pct: f64, stop_loss_pct: f64) -> EngineResult<()> {
        if self.state.phase != Phase::Idle {
            return Err(EngineError::config(format!(
                "monitor already started (phase {:?})",
                self.state.phase
            )));
        }
        validate_thresholds(take_profit_pct, stop_loss_pct)?;
        if self.poll_interval.is_zero() {
            return Err(EngineError::config("poll interval must be positive"));
        }

        self.state.threshold_take_profit = take_profit_pct;
        self.state.threshold_stop_loss = -stop_loss_pct;
        self.state.running = true;
        self.state.phase = Phase::Polling;
        self.reporter.report(&EngineEvent::MonitorStarted {
            take_profit_pct,
            stop_loss_pct,
        });
        Ok(())
    }

    /// Runs one poll. Ticks are sequential; the caller owns the cadence.
    pub async fn tick(&mut self) -> EngineResult<TickOutcome> {
        if self.state.phase != Phase::Polling {
            return Err(EngineError::config(format!(
                "monitor is not polling (phase {:?})",
                self.state.phase
            )));
        }
        if self.cancel.is_cancelled() {
            return Ok(TickOutcome::Stopped(self.stop(StopReason::Cancelled, None)));
        }

        let positions = match self.gateway.get_open_positions().await {
            Ok(positions) => positions,
            Err(err) => {
                log::error!("[MONITOR] failed to read positions: {}", err);
                self.state.running = false;
                self.state.phase = Phase::Stopped;
                return Err(err);
            }
        };

        self.state.cumulative_poll_count += 1;
        let profit_pct = unrealised_profit_pct(&positions);
        self.last_profit_pct = Some(profit_pct);
        self.reporter.report(&EngineEvent::MonitorTick {
            tick: self.state.cumulative_poll_count,
            profit_pct,
            positions: format_positions_summary(&positions),
        });

        let exit = if profit_pct > self.state.threshold_take_profit {
            Some(ExitReason::TakeProfit)
        } else if profit_pct < self.state.threshold_stop_loss {
            Some(ExitReason::StopLoss)
        } else {
            None
        };

        match exit {
            Some(reason) => {
                self.reporter.report(&EngineEvent::ExitTriggered {
                    tick: self.state.cumulative_poll_count,
                    reason,
                    profit_pct,
                });
                self.state.phase = Phase::Liquidating;
                let liquidation = self.liquidate().await;
                Ok(TickOutcome::Stopped(
                    self.stop(StopReason::Exit(reason), Some(liquidation)),
                ))
            }
            None => Ok(TickOutcome::Continue { profit_pct }),
        }
    }

    /// Polls on the configured interval until an exit, cancellation or the tick limit.
    pub async fn run(&mut self) -> EngineResult<MonitorOutcome> {
        let mut interval = time::interval(self.poll_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            interval.tick().await;
            if let TickOutcome::Stopped(outcome) = self.tick().await? {
                return Ok(outcome);
            }
            if let Some(max) = self.max_ticks {
                if self.state.cumulative_poll_count >= max {
                    return Ok(self.stop(StopReason::TickLimit, None));
                }
            }
        }
    }

    async fn liquidate(&self) -> Liquidation {
        let liquidation = match self.gateway.close_all_positions().await {
            Ok(results) => {
                let unfilled: Vec<String> = results
                    .iter()
                    .filter(|order| !order.is_filled())
                    .map(|order| order.symbol.clone())
                    .collect();
                if unfilled.is_empty() {
                    Liquidation::Filled {
                        orders: results.len(),
                    }
                } else {
                    Liquidation::Unfilled { symbols: unfilled }
                }
            }
            Err(err) => Liquidation::Failed {
                error: err.to_string(),
            },
        };
        self.reporter.report(&EngineEvent::LiquidationFinished {
            outcome: liquidation.clone(),
        });
        liquidation
    }

    fn stop(&mut self, reason: StopReason, liquidation: Option<Liquidation>) -> MonitorOutcome {
        self.state.running = false;
        self.state.phase = Phase::Stopped;
        self.reporter.report(&EngineEvent::MonitorStopped {
            ticks: self.state.cumulative_poll_count,
            reason,
        });
        MonitorOutcome {
            ticks: self.state.cumulative_poll_count,
            reason,
            last_profit_pct: self.last_profit_pct,
            liquidation,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{OrderResult, OrderSide};
    use crate::report::RecordingReporter;
    use async_trait::async_trait;
    use rust_decimal_macros::dec;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    struct ScriptedGateway {
        polls: Mutex<VecDeque<EngineResult<Vec<Position>>>>,
        close: EngineResult<Vec<OrderResult>>,
        close_calls: Mutex<usize>,
    }

    impl ScriptedGateway {
        fn with_pl(pl_values: &[Decimal]) -> Self {
            let polls = pl_values
                .iter()
                .map(|pl| Ok(vec![position("AAPL", dec!(100), *pl)]))
                .collect();
            Self {
                polls: Mutex::new(polls),
                close: Ok(vec![order("AAPL", dec!(1), dec!(1))]),
                close_calls: Mutex::new(0),
            }
        }

        fn close_calls(&self) -> usize {
            *self.close_calls.lock().unwrap()
        }
    }

    #[async_trait]
    impl BrokerageGateway for ScriptedGateway {
        async fn get_open_positions(&self) -> EngineResult<Vec<Position>> {
            self.polls
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Ok(vec![position("AAPL", dec!(100), dec!(0))]))
        }

        async fn close_all_positions(&self) -> EngineResult<Vec<OrderResult>> {
            *self.close_calls.lock().unwrap() += 1;
            self.close.clone()
        }

        async fn submit_market_order(
            &self,
            symbol: &str,
            quantity: Decimal,
            side: OrderSide,
        ) -> EngineResult<OrderResult> {
            Ok(OrderResult {
                symbol: symbol.to_string(),
                side,
                requested_qty: quantity,
                filled_qty: quantity,
                filled_avg_price: None,
            })
        }

        async fn buying_power(&self) -> EngineResult<Decimal> {
            Ok(dec!(0))
        }
    }

    fn position(symbol: &str, cost: Decimal, pl: Decimal) -> Position {
        Position {
            symbol: symbol.to_string(),
            quantity: dec!(1),
            side: PositionSide::Long,
            cost_basis: cost,
            unrealized_pl: pl,
        }
    }

    fn order(symbol: &str, requested: Decimal, filled: Decimal) -> OrderResult {
        OrderResult {
            symbol: symbol.to_string(),
            side: OrderSide::Sell,
            requested_qty: requested,
            filled_qty: filled,
            filled_avg_price: None,
        }
    }

    fn monitor(gateway: Arc<ScriptedGateway>) -> (RiskMonitor, Arc<RecordingReporter>) {
        let reporter = Arc::new(RecordingReporter::default());
        let monitor = RiskMonitor::new(gateway, reporter.clone())
            .with_poll_interval(Duration::from_millis(1));
        (monitor, reporter)
    }

    #[test]
    fn profit_pct_is_zero_without_cost_basis() {
        assert_eq!(unrealised_profit_pct(&[]), 0.0);
        let positions = vec![position("AAPL", dec!(0), dec!(12.5))];
        assert_eq!(unrealised_profit_pct(&positions), 0.0);
    }

    #[test]
    fn profit_pct_aggregates_and_rounds() {
        let positions = vec![
            position("AAPL", dec!(200), dec!(3)),
            position("MSFT", dec!(100), dec!(-1)),
        ];
        // 2 * 100 / 300 = 0.6666...
        assert_eq!(unrealised_profit_pct(&positions), 0.667);
    }

    #[test]
    fn profit_pct_falls_back_to_zero_on_overflow() {
        // long and short cost bases nearly cancel
        let positions = vec![
            position("AAPL", dec!(1000.000001), Decimal::MAX / dec!(1000)),
            position("MSFT", dec!(-1000), dec!(0)),
        ];
        assert_eq!(unrealised_profit_pct(&positions), 0.0);

        let positions = vec![
            position("AAPL", Decimal::MAX, dec!(1)),
            position("MSFT", Decimal::MAX, dec!(1)),
        ];
        assert_eq!(unrealised_profit_pct(&positions), 0.0);

        let positions = vec![position("AAPL", dec!(10), Decimal::MAX)];
        assert_eq!(unrealised_profit_pct(&positions), 0.0);
    }

    #[test]
    fn thresholds_check_sign_and_finiteness() {
        assert!(validate_thresholds(5.0, 0.0).is_ok());
        assert!(validate_thresholds(0.0, 3.0).is_err());
        assert!(validate_thresholds(f64::NAN, 3.0).is_err());
        assert!(validate_thresholds(5.0, -3.0).is_err());
        assert!(validate_thresholds(5.0, f64::INFINITY).is_err());
    }

    #[tokio::test]
    async fn take_profit_triggers_on_first_tick_above_threshold() {
        let gateway = Arc::new(ScriptedGateway::with_pl(&[
            dec!(1),
            dec!(2),
            dec!(4),
            dec!(6),
        ]));
        let (mut monitor, reporter) = monitor(gateway.clone());
        monitor.start(5.0, 3.0).unwrap();

        let outcome = monitor.run().await.unwrap();
        assert_eq!(outcome.ticks, 4);
        assert_eq!(outcome.reason, StopReason::Exit(ExitReason::TakeProfit));
        assert_eq!(outcome.last_profit_pct, Some(6.0));
        assert_eq!(outcome.liquidation, Some(Liquidation::Filled { orders: 1 }));
        assert_eq!(gateway.close_calls(), 1);
        assert_eq!(monitor.state().phase, Phase::Stopped);
        assert!(!monitor.state().running);

        let ticks = reporter
            .events()
            .iter()
            .filter(|e| matches!(e, EngineEvent::MonitorTick { .. }))
            .count();
        assert_eq!(ticks, 4);
    }

    #[tokio::test]
    async fn stop_loss_uses_negated_threshold() {
        let gateway = Arc::new(ScriptedGateway::with_pl(&[dec!(-1), dec!(-2), dec!(-2.5)]));
        let (mut monitor, _) = monitor(gateway);
        monitor.start(5.0, 2.0).unwrap();
        assert_eq!(monitor.state().threshold_stop_loss, -2.0);

        // exactly at the threshold does not trigger
        assert_eq!(
            monitor.tick().await.unwrap(),
            TickOutcome::Continue { profit_pct: -1.0 }
        );
        assert_eq!(
            monitor.tick().await.unwrap(),
            TickOutcome::Continue { profit_pct: -2.0 }
        );
        match monitor.tick().await.unwrap() {
            TickOutcome::Stopped(outcome) => {
                assert_eq!(outcome.reason, StopReason::Exit(ExitReason::StopLoss));
                assert_eq!(outcome.ticks, 3);
            }
            other => panic!("expected stop, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn zero_cost_basis_never_triggers() {
        let gateway = Arc::new(ScriptedGateway {
            polls: Mutex::new(VecDeque::from(vec![Ok(vec![position(
                "AAPL",
                dec!(0),
                dec!(50),
            )])])),
            close: Ok(Vec::new()),
            close_calls: Mutex::new(0),
        });
        let (mut monitor, _) = monitor(gateway.clone());
        monitor.start(1.0, 1.0).unwrap();
        assert_eq!(
            monitor.tick().await.unwrap(),
            TickOutcome::Continue { profit_pct: 0.0 }
        );
        assert_eq!(gateway.close_calls(), 0);
    }

    #[tokio::test]
    async fn cancellation_stops_before_polling() {
        let gateway = Arc::new(ScriptedGateway::with_pl(&[dec!(1)]));
        let (monitor, reporter) = monitor(gateway.clone());
        let token = CancelToken::new();
        let mut monitor = monitor.with_cancel_token(token.clone());
        monitor.start(5.0, 5.0).unwrap();
        token.cancel();

        let outcome = monitor.run().await.unwrap();
        assert_eq!(outcome.reason, StopReason::Cancelled);
        assert_eq!(outcome.ticks, 0);
        assert_eq!(gateway.close_calls(), 0);
        assert!(reporter.events().contains(&EngineEvent::MonitorStopped {
            ticks: 0,
            reason: StopReason::Cancelled,
        }));
    }

    #[tokio::test]
    async fn tick_limit_bounds_the_run() {
        let gateway = Arc::new(ScriptedGateway::with_pl(&[dec!(1), dec!(1), dec!(1)]));
        let (monitor, _) = monitor(gateway);
        let mut monitor = monitor.with_max_ticks(Some(2));
        monitor.start(5.0, 5.0).unwrap();
        let outcome = monitor.run().await.unwrap();
        assert_eq!(outcome.reason, StopReason::TickLimit);
        assert_eq!(outcome.ticks, 2);
        assert_eq!(outcome.liquidation, None);
    }

    #[test]
    fn invalid_thresholds_are_rejected_before_polling() {
        let gateway = Arc::new(ScriptedGateway::with_pl(&[]));
        let (mut monitor, _) = monitor(gateway);
        assert!(matches!(
            monitor.start(0.0, 1.0),
            Err(EngineError::Configuration(_))
        ));
        assert!(matches!(
            monitor.start(f64::NAN, 1.0),
            Err(EngineError::Configuration(_))
        ));
        assert!(matches!(
            monitor.start(1.0, -0.5),
            Err(EngineError::Configuration(_))
        ));
        assert_eq!(monitor.state().phase, Phase::Idle);
        assert!(monitor.start(1.0, 0.0).is_ok());
    }

    #[tokio::test]
    async fn partial_close_is_reported_as_unfilled() {
        let gateway = Arc::new(ScriptedGateway {
            polls: Mutex::new(VecDeque::from(vec![Ok(vec![position(
                "AAPL",
                dec!(100),
                dec!(10),
            )])])),
            close: Ok(vec![
                order("AAPL", dec!(2), dec!(1)),
                order("MSFT", dec!(3), dec!(3)),
            ]),
            close_calls: Mutex::new(0),
        });
        let (mut monitor, _) = monitor(gateway.clone());
        monitor.start(5.0, 5.0).unwrap();
        let outcome = monitor.run().await.unwrap();
        assert_eq!(
            outcome.liquidation,
            Some(Liquidation::Unfilled {
                symbols: vec!["AAPL".to_string()]
            })
        );
        assert_eq!(gateway.close_calls(), 1);
    }

    #[tokio::test]
    async fn failed_close_stops_unresolved() {
        let gateway = Arc::new(ScriptedGateway {
            polls: Mutex::new(VecDeque::from(vec![Ok(vec![position(
                "AAPL",
                dec!(100),
                dec!(-10),
            )])])),
            close: Err(EngineError::Gateway("rejected".to_string())),
            close_calls: Mutex::new(0),
        });
        let (mut monitor, _) = monitor(gateway);
        monitor.start(5.0, 5.0).unwrap();
        let outcome = monitor.run().await.unwrap();
        assert_eq!(outcome.reason, StopReason::Exit(ExitReason::StopLoss));
        assert!(matches!(
            outcome.liquidation,
            Some(Liquidation::Failed { ref error }) if error.contains("rejected")
        ));
    }

    #[tokio::test]
    async fn position_read_error_ends_the_loop() {
        let gateway = Arc::new(ScriptedGateway {
            polls: Mutex::new(VecDeque::from(vec![
                Ok(vec![position("AAPL", dec!(100), dec!(1))]),
                Err(EngineError::Gateway("timeout".to_string())),
            ])),
            close: Ok(Vec::new()),
            close_calls: Mutex::new(0),
        });
        let (mut monitor, _) = monitor(gateway);
        monitor.start(5.0, 5.0).unwrap();
        let err = monitor.run().await.unwrap_err();
        assert_eq!(err, EngineError::Gateway("timeout".to_string()));
        assert_eq!(monitor.state().phase, Phase::Stopped);
        assert_eq!(monitor.state().cumulative_poll_count, 1);
        assert!(monitor.tick().await.is_err());
    }
}
