//! Deterministic in-process exchange.
//!
//! Implements [`ExchangeClient`] over seeded order books: fill-or-kill
//! orders fill by walking the book, post-only orders rest on it, and test
//! code drives counterparty fills, disconnects and error injection. Used by
//! the engine's integration tests and by `--dry-run` mode.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use polo_common::{
    from_amount, target_amount, Currency, FeeMultiplier, Market, OrderType,
};
use rust_decimal::Decimal;
use tokio::sync::{broadcast, mpsc, watch};
use tracing::debug;

use crate::book::{BookSide, OrderBook};
use crate::client::ExchangeClient;
use crate::error::ExchangeError;
use crate::types::{
    AccountNotification, BookUpdate, CancelOutcome, MoveResult, OrderId, OrderKind,
    OrderStatusInfo, OrderUpdateType, PlaceResult, Trade,
};

const DEFAULT_FEE: &str = "0.999";

/// A resting post-only order.
#[derive(Debug, Clone)]
struct SimOrder {
    market: Market,
    order_type: OrderType,
    price: Decimal,
    remaining: Decimal,
}

#[derive(Default)]
struct SimInner {
    markets: Vec<Market>,
    books: HashMap<Market, OrderBook>,
    book_feeds: HashMap<Market, Vec<mpsc::Sender<BookUpdate>>>,
    balances: HashMap<Currency, Decimal>,
    open_orders: HashMap<OrderId, SimOrder>,
    order_trades: HashMap<OrderId, Vec<Trade>>,
    place_errors: VecDeque<ExchangeError>,
    move_errors: VecDeque<ExchangeError>,
    connected: bool,
}

/// In-process exchange over seeded books.
pub struct SimExchange {
    inner: Mutex<SimInner>,
    next_order_id: AtomicU64,
    next_trade_id: AtomicU64,
    account_tx: broadcast::Sender<AccountNotification>,
    connection_tx: watch::Sender<bool>,
    fee_tx: watch::Sender<FeeMultiplier>,
}

impl Default for SimExchange {
    fn default() -> Self {
        Self::new()
    }
}

impl SimExchange {
    pub fn new() -> Self {
        let fee: Decimal = DEFAULT_FEE.parse().expect("default fee literal");
        let (account_tx, _) = broadcast::channel(1024);
        let (connection_tx, _) = watch::channel(true);
        let (fee_tx, _) = watch::channel(FeeMultiplier::new(fee, fee));
        Self {
            inner: Mutex::new(SimInner {
                connected: true,
                ..SimInner::default()
            }),
            next_order_id: AtomicU64::new(1000),
            next_trade_id: AtomicU64::new(1),
            account_tx,
            connection_tx,
            fee_tx,
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, SimInner> {
        self.inner.lock().expect("sim exchange lock poisoned")
    }

    // --- test-side controls -------------------------------------------------

    /// Seed or replace one market's book and notify feed subscribers.
    pub fn set_book(&self, market: &Market, book: OrderBook) {
        let mut inner = self.lock();
        if !inner.markets.contains(market) {
            inner.markets.push(market.clone());
        }
        inner.books.insert(market.clone(), book);
        publish_book(&mut inner, market);
    }

    /// Mutate one book level and notify feed subscribers.
    pub fn update_level(&self, market: &Market, side: BookSide, price: Decimal, size: Decimal) {
        let mut inner = self.lock();
        inner
            .books
            .entry(market.clone())
            .or_default()
            .set_level(side, price, size);
        publish_book(&mut inner, market);
    }

    pub fn set_balance(&self, currency: &Currency, amount: Decimal) {
        self.lock().balances.insert(currency.clone(), amount);
    }

    pub fn set_fee(&self, fee: FeeMultiplier) {
        let _ = self.fee_tx.send(fee);
    }

    /// Flip the simulated WebSocket session. Going down closes all book
    /// feeds; notifications raised while down are dropped, as on the wire.
    pub fn set_connected(&self, connected: bool) {
        let mut inner = self.lock();
        inner.connected = connected;
        if !connected {
            inner.book_feeds.clear();
        }
        drop(inner);
        let _ = self.connection_tx.send(connected);
    }

    /// Queue an error for the next `place` call.
    pub fn inject_place_error(&self, err: ExchangeError) {
        self.lock().place_errors.push_back(err);
    }

    /// Queue an error for the next `move_order` call.
    pub fn inject_move_error(&self, err: ExchangeError) {
        self.lock().move_errors.push_back(err);
    }

    /// Remaining quantity of a resting order, if it is still open.
    pub fn open_order_remaining(&self, order_id: OrderId) -> Option<Decimal> {
        self.lock().open_orders.get(&order_id).map(|o| o.remaining)
    }

    pub fn open_order_count(&self) -> usize {
        self.lock().open_orders.len()
    }

    /// Snapshot of resting orders as `(order_id, order_type, price,
    /// remaining)`.
    pub fn open_orders(&self) -> Vec<(OrderId, OrderType, Decimal, Decimal)> {
        self.lock()
            .open_orders
            .iter()
            .map(|(id, o)| (*id, o.order_type, o.price, o.remaining))
            .collect()
    }

    /// Drive a counterparty fill against a resting order. The trade always
    /// executes exchange-side; the notification is only delivered while the
    /// session is up (recovery paths find it via `order_trades`).
    pub fn fill_order(&self, order_id: OrderId, quote_amount: Decimal) -> Option<Trade> {
        let mut inner = self.lock();
        let order = inner.open_orders.get_mut(&order_id)?;
        let amount = quote_amount.min(order.remaining);
        if amount.is_zero() {
            return None;
        }
        order.remaining -= amount;
        let market = order.market.clone();
        let order_type = order.order_type;
        let price = order.price;
        let done = order.remaining.is_zero();
        if done {
            inner.open_orders.remove(&order_id);
        }

        let fee = self.fee_tx.borrow().maker;
        let bare = polo_common::BareTrade::new(amount, price, fee);
        let trade = Trade {
            trade_id: self.next_trade_id.fetch_add(1, Ordering::SeqCst),
            quote_amount: amount,
            price,
            fee_multiplier: fee,
            taker_adjustment: target_amount(order_type, &bare),
        };

        // Shrink the resting level.
        if let Some(book) = inner.books.get_mut(&market) {
            let side = BookSide::maker(order_type);
            let level = book
                .levels(side)
                .into_iter()
                .find(|(p, _)| *p == price)
                .map(|(_, s)| s)
                .unwrap_or(Decimal::ZERO);
            book.set_level(side, price, (level - amount).max(Decimal::ZERO));
        }
        settle_balances(&mut inner, &market, order_type, &[trade.clone()]);
        inner
            .order_trades
            .entry(order_id)
            .or_default()
            .push(trade.clone());
        publish_book(&mut inner, &market);

        let connected = inner.connected;
        drop(inner);
        if connected {
            let _ = self.account_tx.send(AccountNotification::Trade {
                order_id,
                market,
                order_type,
                trade: trade.clone(),
            });
            if done {
                let _ = self.account_tx.send(AccountNotification::OrderUpdate {
                    order_id,
                    new_amount: Decimal::ZERO,
                    update_type: OrderUpdateType::Filled,
                });
            }
        }
        Some(trade)
    }

    // --- internals ----------------------------------------------------------

    fn next_order_id(&self) -> OrderId {
        self.next_order_id.fetch_add(1, Ordering::SeqCst)
    }

    /// Fill a taker order by walking the book. Returns the trades or
    /// `UnableToFillOrder` without mutating anything.
    fn execute_taker(
        &self,
        inner: &mut SimInner,
        market: &Market,
        order_type: OrderType,
        limit: Decimal,
        quote_amount: Decimal,
    ) -> Result<Vec<Trade>, ExchangeError> {
        let taker_fee = self.fee_tx.borrow().taker;
        let side = BookSide::taker(order_type);
        let book = inner.books.entry(market.clone()).or_default();

        let acceptable = |level: Decimal| match order_type {
            OrderType::Buy => level <= limit,
            OrderType::Sell => level >= limit,
        };

        let mut remaining = quote_amount;
        let mut fills: Vec<(Decimal, Decimal)> = Vec::new();
        for (price, size) in book.levels(side) {
            if remaining.is_zero() {
                break;
            }
            if !acceptable(price) {
                break;
            }
            let taken = remaining.min(size);
            fills.push((price, taken));
            remaining -= taken;
        }
        if !remaining.is_zero() {
            return Err(ExchangeError::UnableToFillOrder);
        }

        let mut trades = Vec::with_capacity(fills.len());
        for (price, taken) in fills {
            let level = book
                .levels(side)
                .into_iter()
                .find(|(p, _)| *p == price)
                .map(|(_, s)| s)
                .unwrap_or(Decimal::ZERO);
            book.set_level(side, price, level - taken);
            let trade = Trade {
                trade_id: self.next_trade_id.fetch_add(1, Ordering::SeqCst),
                quote_amount: taken,
                price,
                fee_multiplier: taker_fee,
                taker_adjustment: Decimal::ZERO,
            };
            let adjusted = target_amount(order_type, &trade.bare());
            trades.push(Trade {
                taker_adjustment: adjusted,
                ..trade
            });
        }
        settle_balances(inner, market, order_type, &trades);
        Ok(trades)
    }
}

/// Apply the balance effect of executed trades.
fn settle_balances(inner: &mut SimInner, market: &Market, order_type: OrderType, trades: &[Trade]) {
    let (spent_currency, received_currency) = match order_type {
        OrderType::Buy => (market.base.clone(), market.quote.clone()),
        OrderType::Sell => (market.quote.clone(), market.base.clone()),
    };
    let spent: Decimal = trades.iter().map(|t| from_amount(order_type, &t.bare())).sum();
    let received: Decimal = trades
        .iter()
        .map(|t| target_amount(order_type, &t.bare()))
        .sum();
    *inner.balances.entry(spent_currency).or_default() -= spent;
    *inner.balances.entry(received_currency).or_default() += received;
}

/// Broadcast the current book snapshot to all live feed subscribers.
fn publish_book(inner: &mut SimInner, market: &Market) {
    let snapshot = inner.books.get(market).cloned().unwrap_or_default();
    if let Some(feeds) = inner.book_feeds.get_mut(market) {
        feeds.retain(|tx| {
            tx.try_send(BookUpdate::Snapshot(snapshot.clone())).is_ok() || !tx.is_closed()
        });
    }
}

#[async_trait]
impl ExchangeClient for SimExchange {
    async fn markets(&self) -> Result<Vec<Market>, ExchangeError> {
        Ok(self.lock().markets.clone())
    }

    async fn balances(&self) -> Result<HashMap<Currency, Decimal>, ExchangeError> {
        Ok(self.lock().balances.clone())
    }

    async fn place(
        &self,
        market: &Market,
        order_type: OrderType,
        price: Decimal,
        quote_amount: Decimal,
        kind: OrderKind,
        _client_order_id: Option<u64>,
    ) -> Result<PlaceResult, ExchangeError> {
        let mut inner = self.lock();
        if let Some(err) = inner.place_errors.pop_front() {
            return Err(err);
        }
        if !inner.connected {
            return Err(ExchangeError::Disconnected);
        }

        match kind {
            OrderKind::FillOrKill | OrderKind::ImmediateOrCancel => {
                let trades =
                    self.execute_taker(&mut inner, market, order_type, price, quote_amount)?;
                let order_id = self.next_order_id();
                inner.order_trades.insert(order_id, trades.clone());
                publish_book(&mut inner, market);
                debug!(market = %market, %order_type, order_id, fills = trades.len(), "sim taker fill");
                Ok(PlaceResult { order_id, trades })
            }
            OrderKind::PostOnly => {
                let crosses = match inner
                    .books
                    .get(market)
                    .and_then(|b| b.best(BookSide::taker(order_type)))
                {
                    Some((best, _)) => match order_type {
                        OrderType::Buy => price >= best,
                        OrderType::Sell => price <= best,
                    },
                    None => false,
                };
                if crosses {
                    return Err(ExchangeError::UnableToPlacePostOnlyOrder);
                }

                let order_id = self.next_order_id();
                inner.open_orders.insert(
                    order_id,
                    SimOrder {
                        market: market.clone(),
                        order_type,
                        price,
                        remaining: quote_amount,
                    },
                );
                inner.order_trades.entry(order_id).or_default();

                let book = inner.books.entry(market.clone()).or_default();
                let side = BookSide::maker(order_type);
                let level = book
                    .levels(side)
                    .into_iter()
                    .find(|(p, _)| *p == price)
                    .map(|(_, s)| s)
                    .unwrap_or(Decimal::ZERO);
                book.set_level(side, price, level + quote_amount);
                publish_book(&mut inner, market);

                let connected = inner.connected;
                drop(inner);
                if connected {
                    let _ = self.account_tx.send(AccountNotification::LimitOrderCreated {
                        order_id,
                        market: market.clone(),
                        order_type,
                        price,
                        quote_amount,
                    });
                }
                Ok(PlaceResult {
                    order_id,
                    trades: Vec::new(),
                })
            }
        }
    }

    async fn move_order(
        &self,
        order_id: OrderId,
        new_price: Decimal,
        new_quote_amount: Option<Decimal>,
        _kind: OrderKind,
        _client_order_id: Option<u64>,
    ) -> Result<MoveResult, ExchangeError> {
        let mut inner = self.lock();
        if let Some(err) = inner.move_errors.pop_front() {
            return Err(err);
        }
        if !inner.connected {
            return Err(ExchangeError::Disconnected);
        }
        let order = inner
            .open_orders
            .get(&order_id)
            .cloned()
            .ok_or(ExchangeError::OrderCompletedOrNotExist)?;

        let crosses = match inner
            .books
            .get(&order.market)
            .and_then(|b| b.best(BookSide::taker(order.order_type)))
        {
            Some((best, _)) => match order.order_type {
                OrderType::Buy => new_price >= best,
                OrderType::Sell => new_price <= best,
            },
            None => false,
        };
        if crosses {
            return Err(ExchangeError::UnableToPlacePostOnlyOrder);
        }

        // Atomic cancel + reissue under a fresh id.
        inner.open_orders.remove(&order_id);
        let remaining = new_quote_amount.unwrap_or(order.remaining);
        let new_id = self.next_order_id();
        inner.open_orders.insert(
            new_id,
            SimOrder {
                market: order.market.clone(),
                order_type: order.order_type,
                price: new_price,
                remaining,
            },
        );
        inner.order_trades.entry(new_id).or_default();

        let side = BookSide::maker(order.order_type);
        let book = inner.books.entry(order.market.clone()).or_default();
        let old_level = book
            .levels(side)
            .into_iter()
            .find(|(p, _)| *p == order.price)
            .map(|(_, s)| s)
            .unwrap_or(Decimal::ZERO);
        book.set_level(side, order.price, (old_level - order.remaining).max(Decimal::ZERO));
        let new_level = book
            .levels(side)
            .into_iter()
            .find(|(p, _)| *p == new_price)
            .map(|(_, s)| s)
            .unwrap_or(Decimal::ZERO);
        book.set_level(side, new_price, new_level + remaining);
        publish_book(&mut inner, &order.market);

        Ok(MoveResult { order_id: new_id })
    }

    async fn cancel(&self, order_id: OrderId) -> Result<CancelOutcome, ExchangeError> {
        let mut inner = self.lock();
        if !inner.connected {
            return Err(ExchangeError::Disconnected);
        }
        let Some(order) = inner.open_orders.remove(&order_id) else {
            return Ok(CancelOutcome::CompletedOrNotExist);
        };

        let side = BookSide::maker(order.order_type);
        let book = inner.books.entry(order.market.clone()).or_default();
        let level = book
            .levels(side)
            .into_iter()
            .find(|(p, _)| *p == order.price)
            .map(|(_, s)| s)
            .unwrap_or(Decimal::ZERO);
        book.set_level(side, order.price, (level - order.remaining).max(Decimal::ZERO));
        publish_book(&mut inner, &order.market);

        let connected = inner.connected;
        drop(inner);
        if connected {
            let _ = self.account_tx.send(AccountNotification::OrderUpdate {
                order_id,
                new_amount: order.remaining,
                update_type: OrderUpdateType::Cancelled,
            });
        }
        Ok(CancelOutcome::Cancelled)
    }

    async fn order_status(
        &self,
        order_id: OrderId,
    ) -> Result<Option<OrderStatusInfo>, ExchangeError> {
        Ok(self.lock().open_orders.get(&order_id).map(|o| OrderStatusInfo {
            market: o.market.clone(),
            order_type: o.order_type,
            price: o.price,
            quote_amount: o.remaining,
        }))
    }

    async fn order_trades(&self, order_id: OrderId) -> Result<Vec<Trade>, ExchangeError> {
        Ok(self
            .lock()
            .order_trades
            .get(&order_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn order_book_stream(
        &self,
        market: &Market,
    ) -> Result<mpsc::Receiver<BookUpdate>, ExchangeError> {
        let mut inner = self.lock();
        if !inner.connected {
            return Err(ExchangeError::Disconnected);
        }
        let (tx, rx) = mpsc::channel(64);
        let snapshot = inner.books.get(market).cloned().unwrap_or_default();
        let _ = tx.try_send(BookUpdate::Snapshot(snapshot));
        inner
            .book_feeds
            .entry(market.clone())
            .or_default()
            .push(tx);
        Ok(rx)
    }

    fn account_stream(&self) -> broadcast::Receiver<AccountNotification> {
        self.account_tx.subscribe()
    }

    fn connection_stream(&self) -> watch::Receiver<bool> {
        self.connection_tx.subscribe()
    }

    fn fee_stream(&self) -> watch::Receiver<FeeMultiplier> {
        self.fee_tx.subscribe()
    }
}
