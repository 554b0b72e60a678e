use rust_decimal::prelude::FromPrimitive;
use rust_decimal::Decimal;

use crate::error::{EngineError, EngineResult};
use crate::gateway::BrokerageGateway;
use crate::model::{OrderResult, OrderSide};
use crate::report::{EngineEvent, Reporter};

/// `leg_b` is `None` when the B order failed after A was placed.
#[derive(Debug, Clone, PartialEq)]
pub struct HedgeFills {
    pub leg_a: OrderResult,
    pub leg_b: Option<OrderResult>,
}

impl HedgeFills {
    pub fn is_complete(&self) -> bool {
        self.leg_b.is_some()
    }
}

/// Quantity of the B leg: `hedge_ratio * leverage`, rounded to 2 decimals.
pub fn hedge_quantity(hedge_ratio: f64, leverage: Decimal) -> EngineResult<Decimal> {
    if !hedge_ratio.is_finite() {
        return Err(EngineError::config(format!(
            "hedge ratio must be finite, got {}",
            hedge_ratio
        )));
    }
    let ratio = Decimal::from_f64(hedge_ratio)
        .ok_or_else(|| EngineError::config(format!("hedge ratio {} out of range", hedge_ratio)))?;
    Ok((ratio * leverage).round_dp(2).abs())
}

/// Enters a two-leg spread position.
///
/// Buying the spread buys `leverage` units of A and sells the hedge quantity of
/// B; selling the spread does the reverse. A negative hedge ratio flips the B leg.
/// A failed A order is returned as an error. A failed B order is reported and
/// the A fill is still returned, since that leg is already open.
pub async fn enter_hedge_position(
    gateway: &dyn BrokerageGateway,
    reporter: &dyn Reporter,
    symbol_a: &str,
    symbol_b: &str,
    side: OrderSide,
    hedge_ratio: f64,
    leverage: Decimal,
) -> EngineResult<HedgeFills> {
    if leverage <= Decimal::ZERO {
        return Err(EngineError::config(format!(
            "leverage must be positive, got {}",
            leverage
        )));
    }
    let qty_b = hedge_quantity(hedge_ratio, leverage)?;
    if qty_b.is_zero() {
        return Err(EngineError::config(format!(
            "hedge ratio {} rounds to a zero {} quantity",
            hedge_ratio, symbol_b
        )));
    }
    let side_b = if hedge_ratio < 0.0 { side } else { side.opposite() };

    reporter.report(&EngineEvent::HedgeOrder {
        symbol: symbol_a.to_string(),
        side,
        quantity: leverage.to_string(),
    });
    let leg_a = gateway.submit_market_order(symbol_a, leverage, side).await?;

    reporter.report(&EngineEvent::HedgeOrder {
        symbol: symbol_b.to_string(),
        side: side_b,
        quantity: qty_b.to_string(),
    });
    let leg_b = match gateway.submit_market_order(symbol_b, qty_b, side_b).await {
        Ok(leg_b) => leg_b,
        Err(e) => {
            reporter.report(&EngineEvent::HedgeLegFailed {
                symbol: symbol_b.to_string(),
                open_leg: format!("{} {}/{}", leg_a.symbol, leg_a.filled_qty, leg_a.requested_qty),
                error: e.to_string(),
            });
            return Ok(HedgeFills { leg_a, leg_b: None });
        }
    };

    if !leg_a.is_filled() || !leg_b.is_filled() {
        log::warn!(
            "[HEDGE] partial entry: {} {}/{} {} {}/{}",
            leg_a.symbol,
            leg_a.filled_qty,
            leg_a.requested_qty,
            leg_b.symbol,
            leg_b.filled_qty,
            leg_b.requested_qty
        );
    }
    Ok(HedgeFills {
        leg_a,
        leg_b: Some(leg_b),
    })
}
