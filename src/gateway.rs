use async_trait::async_trait;
use rust_decimal::Decimal;

use crate::error::EngineResult;
use crate::model::{OrderResult, OrderSide, Position};

/// Brokerage operations used by hedge entry and the risk monitor.
///
/// The brokerage owns position state; callers only read snapshots and
/// request changes.
#[async_trait]
pub trait BrokerageGateway: Send + Sync {
    async fn get_open_positions(&self) -> EngineResult<Vec<Position>>;

    /// Submits a market order closing every open position.
    async fn close_all_positions(&self) -> EngineResult<Vec<OrderResult>>;

    async fn submit_market_order(
        &self,
        symbol: &str,
        quantity: Decimal,
        side: OrderSide,
    ) -> EngineResult<OrderResult>;

    async fn buying_power(&self) -> EngineResult<Decimal>;
}
