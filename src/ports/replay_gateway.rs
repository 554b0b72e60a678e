use async_trait::async_trait;
use rust_decimal::Decimal;
use serde::Deserialize;
use std::collections::HashMap;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering as AtomicOrdering};
use std::sync::Mutex;

use crate::error::{EngineError, EngineResult};
use crate::gateway::BrokerageGateway;
use crate::model::{OrderResult, OrderSide, Position, PositionSide};

// One line of the positions dump file
#[derive(Debug, Clone, Deserialize)]
pub struct PositionSnapshot {
    #[serde(default)]
    pub timestamp: i64,
    #[serde(default)]
    pub positions: Vec<Position>,
    #[serde(default)]
    pub prices: HashMap<String, Decimal>,
}

/// Paper brokerage replaying recorded position snapshots.
///
/// Every `get_open_positions` call returns the snapshot under the cursor and
/// then advances it; the last snapshot repeats once the dump is exhausted.
#[derive(Debug)]
pub struct ReplayGateway {
    data: Vec<PositionSnapshot>,
    cursor: AtomicUsize,
    closed: AtomicBool,
    fill_ratio: Decimal,
    buying_power: Decimal,
    orders: Mutex<Vec<OrderResult>>,
}

impl ReplayGateway {
    pub fn new(path: impl AsRef<Path>) -> EngineResult<Self> {
        let path = path.as_ref();
        let file = File::open(path).map_err(|e| {
            EngineError::Gateway(format!("failed to open replay file {}: {}", path.display(), e))
        })?;
        let reader = BufReader::new(file);
        let mut data = Vec::new();

        for line in reader.lines() {
            let line = line
                .map_err(|e| EngineError::Gateway(format!("failed to read replay line: {}", e)))?;
            if line.trim().is_empty() {
                continue;
            }
            let entry: PositionSnapshot = serde_json::from_str(&line).map_err(|e| {
                EngineError::Gateway(format!("failed to parse replay entry '{}': {}", line, e))
            })?;
            data.push(entry);
        }

        Self::from_snapshots(data)
    }

    pub fn from_snapshots(data: Vec<PositionSnapshot>) -> EngineResult<Self> {
        if data.is_empty() {
            return Err(EngineError::Gateway(
                "position dump is empty or invalid".to_string(),
            ));
        }
        Ok(Self {
            data,
            cursor: AtomicUsize::new(0),
            closed: AtomicBool::new(false),
            fill_ratio: Decimal::ONE,
            buying_power: Decimal::ZERO,
            orders: Mutex::new(Vec::new()),
        })
    }

    /// Fraction of every order that gets filled, clamped to [0, 1].
    pub fn with_fill_ratio(mut self, ratio: Decimal) -> Self {
        self.fill_ratio = ratio.max(Decimal::ZERO).min(Decimal::ONE);
        self
    }

    pub fn with_buying_power(mut self, amount: Decimal) -> Self {
        self.buying_power = amount;
        self
    }

    /// Orders accepted so far, oldest first.
    pub fn orders(&self) -> Vec<OrderResult> {
        self.orders
            .lock()
            .map(|orders| orders.clone())
            .unwrap_or_default()
    }

    pub fn cursor(&self) -> usize {
        self.cursor.load(AtomicOrdering::SeqCst)
    }

    fn current(&self) -> &PositionSnapshot {
        let idx = self.cursor().min(self.data.len() - 1);
        &self.data[idx]
    }

    fn fill(&self, symbol: &str, quantity: Decimal, side: OrderSide) -> EngineResult<OrderResult> {
        let filled_qty = (quantity * self.fill_ratio).round_dp(quantity.scale());
        let filled_avg_price = self.current().prices.get(symbol).copied();

        log::info!(
            "[REPLAY_FILL] id={} symbol={}, side={}, requested={}, filled={}, price={:?}",
            rand::random::<u64>(),
            symbol,
            side,
            quantity,
            filled_qty,
            filled_avg_price
        );

        let result = OrderResult {
            symbol: symbol.to_string(),
            side,
            requested_qty: quantity,
            filled_qty,
            filled_avg_price,
        };
        self.orders
            .lock()
            .map_err(|_| EngineError::Gateway("order book lock poisoned".to_string()))?
            .push(result.clone());
        Ok(result)
    }
}

#[async_trait]
impl BrokerageGateway for ReplayGateway {
    async fn get_open_positions(&self) -> EngineResult<Vec<Position>> {
        if self.closed.load(AtomicOrdering::SeqCst) {
            return Ok(Vec::new());
        }
        let snapshot = self.current().positions.clone();
        let current_cursor = self.cursor();
        if current_cursor < self.data.len() - 1 {
            self.cursor.fetch_add(1, AtomicOrdering::SeqCst);
        }
        Ok(snapshot)
    }

    async fn close_all_positions(&self) -> EngineResult<Vec<OrderResult>> {
        if self.closed.load(AtomicOrdering::SeqCst) {
            return Ok(Vec::new());
        }
        let positions = self.current().positions.clone();
        let mut results = Vec::with_capacity(positions.len());
        for position in positions {
            let side = match position.side {
                PositionSide::Long => OrderSide::Sell,
                PositionSide::Short => OrderSide::Buy,
            };
            results.push(self.fill(&position.symbol, position.quantity.abs(), side)?);
        }
        if results.iter().all(OrderResult::is_filled) {
            self.closed.store(true, AtomicOrdering::SeqCst);
        }
        Ok(results)
    }

    async fn submit_market_order(
        &self,
        symbol: &str,
        quantity: Decimal,
        side: OrderSide,
    ) -> EngineResult<OrderResult> {
        if quantity <= Decimal::ZERO {
            return Err(EngineError::Gateway(format!(
                "order quantity for {} must be positive, got {}",
                symbol, quantity
            )));
        }
        self.fill(symbol, quantity, side)
    }

    async fn buying_power(&self) -> EngineResult<Decimal> {
        Ok(self.buying_power)
    }
}
