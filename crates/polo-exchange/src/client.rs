//! The exchange client seam consumed by the engine.

use std::collections::HashMap;

use async_trait::async_trait;
use polo_common::{Currency, FeeMultiplier, Market, OrderType};
use rust_decimal::Decimal;
use tokio::sync::{broadcast, mpsc, watch};

use crate::error::ExchangeError;
use crate::types::{
    AccountNotification, BookUpdate, CancelOutcome, MoveResult, OrderId, OrderKind,
    OrderStatusInfo, PlaceResult, Trade,
};

/// Exchange SDK contract.
///
/// Implementations own the transport: REST signing, WebSocket lifecycle,
/// listen-key refresh (45 min), unsubscribe confirmation (90 s, retried)
/// and the 5 msg/s outbound rate limit. Network failures surface as
/// [`ExchangeError::Disconnected`]; the engine recovers through
/// [`ExchangeClient::connection_stream`].
#[async_trait]
pub trait ExchangeClient: Send + Sync + 'static {
    /// All tradable markets.
    async fn markets(&self) -> Result<Vec<Market>, ExchangeError>;

    /// Current wallet balances from REST; deltas arrive as
    /// [`AccountNotification::BalanceUpdate`].
    async fn balances(&self) -> Result<HashMap<Currency, Decimal>, ExchangeError>;

    /// Place an order. Taker kinds return their immediate trades.
    async fn place(
        &self,
        market: &Market,
        order_type: OrderType,
        price: Decimal,
        quote_amount: Decimal,
        kind: OrderKind,
        client_order_id: Option<u64>,
    ) -> Result<PlaceResult, ExchangeError>;

    /// Atomic cancel-and-reissue. The exchange assigns a new order id; the
    /// old id stays valid for trade lookups.
    async fn move_order(
        &self,
        order_id: OrderId,
        new_price: Decimal,
        new_quote_amount: Option<Decimal>,
        kind: OrderKind,
        client_order_id: Option<u64>,
    ) -> Result<MoveResult, ExchangeError>;

    async fn cancel(&self, order_id: OrderId) -> Result<CancelOutcome, ExchangeError>;

    /// `None` when the order is not resting (filled, cancelled or unknown).
    async fn order_status(&self, order_id: OrderId)
        -> Result<Option<OrderStatusInfo>, ExchangeError>;

    /// All trades ever executed against an order, for post-hoc
    /// reconciliation after a disconnect.
    async fn order_trades(&self, order_id: OrderId) -> Result<Vec<Trade>, ExchangeError>;

    /// Subscribe to one market's book stream. The first message is a
    /// snapshot; the channel closes on disconnect and must be re-requested
    /// after the connection recovers.
    async fn order_book_stream(
        &self,
        market: &Market,
    ) -> Result<mpsc::Receiver<BookUpdate>, ExchangeError>;

    /// Account event fan-out: trades, order updates, balance deltas.
    fn account_stream(&self) -> broadcast::Receiver<AccountNotification>;

    /// `true` while the WebSocket session is healthy.
    fn connection_stream(&self) -> watch::Receiver<bool>;

    /// Latest maker/taker fee multipliers.
    fn fee_stream(&self) -> watch::Receiver<FeeMultiplier>;
}
