use serde::Serialize;
use std::sync::Mutex;

use crate::model::{OrderSide, Stationarity};
use crate::monitor::{ExitReason, Liquidation, StopReason};

/// Structured events emitted by the selector, the hedge entry and the monitor.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum EngineEvent {
    PairSkipped {
        pair: String,
        reason: String,
    },
    PairRanked {
        pair: String,
        rank: usize,
        correlation: f64,
    },
    PairScreened {
        pair: String,
        stationarity: Stationarity,
        p_value: Option<f64>,
    },
    PairSelected {
        pair: String,
        correlation: f64,
        bypassed: bool,
    },
    HedgeOrder {
        symbol: String,
        side: OrderSide,
        quantity: String,
    },
    HedgeLegFailed {
        symbol: String,
        open_leg: String,
        error: String,
    },
    MonitorStarted {
        take_profit_pct: f64,
        stop_loss_pct: f64,
    },
    MonitorTick {
        tick: u64,
        profit_pct: f64,
        positions: String,
    },
    ExitTriggered {
        tick: u64,
        reason: ExitReason,
        profit_pct: f64,
    },
    LiquidationFinished {
        outcome: Liquidation,
    },
    MonitorStopped {
        ticks: u64,
        reason: StopReason,
    },
}

/// Sink for engine events. Implementations must not block.
pub trait Reporter: Send + Sync {
    fn report(&self, event: &EngineEvent);
}

/// Forwards events to the `log` facade.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogReporter;

impl Reporter for LogReporter {
    fn report(&self, event: &EngineEvent) {
        match event {
            EngineEvent::PairSkipped { pair, reason } => {
                log::warn!("[SELECT] {} skipped: {}", pair, reason)
            }
            EngineEvent::PairRanked {
                pair,
                rank,
                correlation,
            } => log::info!("[SELECT] #{} {} corr={:.4}", rank, pair, correlation),
            EngineEvent::PairScreened {
                pair,
                stationarity,
                p_value,
            } => match p_value {
                Some(p) => log::info!("[SELECT] {} {:?} (p={:.4})", pair, stationarity, p),
                None => log::info!("[SELECT] {} {:?}", pair, stationarity),
            },
            EngineEvent::PairSelected {
                pair,
                correlation,
                bypassed,
            } => {
                if *bypassed {
                    log::warn!(
                        "[SELECT] {} selected without stationarity check (corr={:.4})",
                        pair,
                        correlation
                    );
                } else {
                    log::info!("[SELECT] most suitable pair {} (corr={:.4})", pair, correlation);
                }
            }
            EngineEvent::HedgeOrder {
                symbol,
                side,
                quantity,
            } => log::info!("[HEDGE] {} market order for {} {}", side, quantity, symbol),
            EngineEvent::HedgeLegFailed {
                symbol,
                open_leg,
                error,
            } => log::error!(
                "[HEDGE] {} leg failed ({}); {} leg is open unhedged",
                symbol,
                error,
                open_leg
            ),
            EngineEvent::MonitorStarted {
                take_profit_pct,
                stop_loss_pct,
            } => log::info!(
                "[MONITOR] started tp={}% sl=-{}%",
                take_profit_pct,
                stop_loss_pct
            ),
            EngineEvent::MonitorTick {
                tick,
                profit_pct,
                positions,
            } => log::info!(
                "[MONITOR] {} current profit: {}% positions: {}",
                tick,
                profit_pct,
                positions
            ),
            EngineEvent::ExitTriggered {
                tick,
                reason,
                profit_pct,
            } => log::warn!(
                "[MONITOR] {:?} triggered at tick {} (profit {}%)",
                reason,
                tick,
                profit_pct
            ),
            EngineEvent::LiquidationFinished { outcome } => match outcome {
                Liquidation::Filled { .. } => log::info!("[MONITOR] all positions closed"),
                Liquidation::Unfilled { .. } => {
                    log::error!("[MONITOR] liquidation not fully filled: {:?}", outcome)
                }
                Liquidation::Failed { error } => {
                    log::error!("[MONITOR] close_all_positions failed: {}", error)
                }
            },
            EngineEvent::MonitorStopped { ticks, reason } => {
                log::info!("[MONITOR] stopped after {} ticks: {:?}", ticks, reason)
            }
        }
    }
}

/// Keeps every event in memory; handy for tests and dry runs.
#[derive(Debug, Default)]
pub struct RecordingReporter {
    events: Mutex<Vec<EngineEvent>>,
}

impl RecordingReporter {
    pub fn events(&self) -> Vec<EngineEvent> {
        self.events
            .lock()
            .map(|events| events.clone())
            .unwrap_or_default()
    }
}

impl Reporter for RecordingReporter {
    fn report(&self, event: &EngineEvent) {
        if let Ok(mut events) = self.events.lock() {
            events.push(event.clone());
        }
    }
}
