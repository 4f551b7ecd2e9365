//! Wire types shared between the exchange SDK and the engine.

use polo_common::{BareTrade, Currency, Market, OrderType};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Exchange-assigned order number.
pub type OrderId = u64;

/// Exchange-assigned trade number, monotonically increasing per market.
pub type TradeId = u64;

/// Order execution modifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderKind {
    /// Never executes as taker; rejected if it would cross the spread.
    PostOnly,
    /// Executes entirely immediately or is cancelled.
    FillOrKill,
    /// Executes what it can immediately, cancels the rest.
    ImmediateOrCancel,
}

/// One executed trade as reported by the exchange.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Trade {
    pub trade_id: TradeId,
    /// Executed quantity in quote units.
    pub quote_amount: Decimal,
    pub price: Decimal,
    /// `1 - fee_rate` actually applied by the exchange.
    pub fee_multiplier: Decimal,
    /// Exchange-reported net received amount for taker fills. The engine
    /// recomputes the target from the bare fields and only logs divergence.
    pub taker_adjustment: Decimal,
}

impl Trade {
    /// The persisted artifact: all derived amounts recompute from this.
    pub fn bare(&self) -> BareTrade {
        BareTrade::new(self.quote_amount, self.price, self.fee_multiplier)
    }
}

/// Result of placing an order. Taker kinds may carry immediate trades.
#[derive(Debug, Clone, PartialEq)]
pub struct PlaceResult {
    pub order_id: OrderId,
    pub trades: Vec<Trade>,
}

/// Result of an atomic cancel-and-reissue. The exchange assigns a new id.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MoveResult {
    pub order_id: OrderId,
}

/// Outcome of a cancel request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelOutcome {
    Cancelled,
    /// The order had already filled or never existed.
    CompletedOrNotExist,
}

/// Snapshot of a resting order.
#[derive(Debug, Clone, PartialEq)]
pub struct OrderStatusInfo {
    pub market: Market,
    pub order_type: OrderType,
    pub price: Decimal,
    /// Remaining unfilled quantity in quote units.
    pub quote_amount: Decimal,
}

/// Terminal order transitions pushed on the account stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrderUpdateType {
    Filled,
    Cancelled,
}

/// Push notification from the account WebSocket channel.
#[derive(Debug, Clone, PartialEq)]
pub enum AccountNotification {
    /// One of our orders traded.
    Trade {
        order_id: OrderId,
        market: Market,
        order_type: OrderType,
        trade: Trade,
    },
    /// A resting limit order was accepted onto the book.
    LimitOrderCreated {
        order_id: OrderId,
        market: Market,
        order_type: OrderType,
        price: Decimal,
        quote_amount: Decimal,
    },
    /// An order left the book.
    OrderUpdate {
        order_id: OrderId,
        new_amount: Decimal,
        update_type: OrderUpdateType,
    },
    /// A wallet balance changed by `delta`.
    BalanceUpdate { currency: Currency, delta: Decimal },
}

/// One message on a per-market order book stream.
#[derive(Debug, Clone, PartialEq)]
pub enum BookUpdate {
    /// Full book replacement, sent first and after reconnects.
    Snapshot(crate::book::OrderBook),
    /// Single level change; zero size removes the level.
    Delta {
        side: crate::book::BookSide,
        price: Decimal,
        size: Decimal,
    },
}
