//! Delayed-trade processor: one post-only market maker per (market, side).
//!
//! The processor owns at most one live exchange order representing the
//! pooled reservations of every path registered with its scheduler. A
//! single worker task drives the place / move / cancel loop off the latest
//! book, resizes on every pooled-amount change so the scheduler can approve
//! departures, routes trade notifications back to the scheduler, and
//! recovers missed fills after disconnects and restarts.

pub mod manager;
pub mod pricing;

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use polo_common::{quote_amount, round_up, Market, OrderType};
use polo_exchange::{
    AccountNotification, BookCache, CancelOutcome, ExchangeClient, ExchangeError, OrderId,
    OrderKind, OrderUpdateType, TradeId,
};
use rust_decimal::Decimal;
use tokio::sync::{broadcast, watch};
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crate::journal::Journal;
use crate::scheduler::TradeScheduler;
use self::pricing::{optimal_price, GapTracker};

/// Confirmation wait for place / cancel before assuming a dead session.
const CONFIRMATION_TIMEOUT: Duration = Duration::from_secs(10);

/// Forced repricing tick while live.
const LIVE_TICK: Duration = Duration::from_secs(4);

/// Post-only collision retry delay.
const POST_ONLY_RETRY: Duration = Duration::from_millis(100);

/// Generic transient retry delay.
const TRANSIENT_RETRY: Duration = Duration::from_millis(500);

/// Previous order ids kept for late trade attribution.
const RECENT_ORDER_IDS: usize = 8;

/// The single live exchange order.
#[derive(Debug, Clone)]
struct LiveOrder {
    id: OrderId,
    price: Decimal,
    quote_remaining: Decimal,
}

/// Handle to one (market, side) processor.
pub struct DelayedTradeProcessor {
    market: Market,
    order_type: OrderType,
    scheduler: Arc<TradeScheduler>,
    paused_tx: watch::Sender<bool>,
    has_order_rx: watch::Receiver<bool>,
}

impl DelayedTradeProcessor {
    /// Create the processor and start its worker task.
    pub fn spawn(
        exchange: Arc<dyn ExchangeClient>,
        books: BookCache,
        journal: Arc<dyn Journal>,
        market: Market,
        order_type: OrderType,
    ) -> Arc<Self> {
        let scheduler = Arc::new(TradeScheduler::new(market.clone(), order_type));
        let (paused_tx, paused_rx) = watch::channel(false);
        let (has_order_tx, has_order_rx) = watch::channel(false);

        let worker = Worker {
            exchange,
            books,
            journal,
            scheduler: Arc::clone(&scheduler),
            market: market.clone(),
            order_type,
            paused_rx,
            has_order_tx,
            current: None,
            recent_ids: VecDeque::new(),
            latest_trade_id: 0,
            recovered: false,
        };
        tokio::spawn(worker.run());

        Arc::new(Self {
            market,
            order_type,
            scheduler,
            paused_tx,
            has_order_rx,
        })
    }

    pub fn market(&self) -> &Market {
        &self.market
    }

    pub fn order_type(&self) -> OrderType {
        self.order_type
    }

    pub fn scheduler(&self) -> Arc<TradeScheduler> {
        Arc::clone(&self.scheduler)
    }

    /// True while the worker holds a live exchange order.
    pub fn has_live_order(&self) -> bool {
        *self.has_order_rx.borrow()
    }

    /// Park the worker: the live order is cancelled and no new order is
    /// placed until [`resume`]. Returns once the order is confirmed gone,
    /// so an instant taker on the opposite side cannot self-trade.
    ///
    /// [`resume`]: DelayedTradeProcessor::resume
    pub async fn pause(&self) {
        let _ = self.paused_tx.send(true);
        let mut rx = self.has_order_rx.clone();
        loop {
            if !*rx.borrow_and_update() {
                return;
            }
            if rx.changed().await.is_err() {
                return;
            }
        }
    }

    pub fn resume(&self) {
        let _ = self.paused_tx.send(false);
    }
}

/// What ended a live session.
enum SessionEnd {
    /// Pooled amount hit zero or the processor was paused.
    Idle,
}

struct Worker {
    exchange: Arc<dyn ExchangeClient>,
    books: BookCache,
    journal: Arc<dyn Journal>,
    scheduler: Arc<TradeScheduler>,
    market: Market,
    order_type: OrderType,
    paused_rx: watch::Receiver<bool>,
    has_order_tx: watch::Sender<bool>,
    current: Option<LiveOrder>,
    recent_ids: VecDeque<OrderId>,
    latest_trade_id: TradeId,
    recovered: bool,
}

impl Worker {
    async fn run(mut self) {
        let mut common_rx = self.scheduler.common_stream();
        loop {
            // Idle until there is pooled amount to represent.
            loop {
                let common = *common_rx.borrow_and_update();
                let paused = *self.paused_rx.borrow_and_update();
                if common > Decimal::ZERO && !paused {
                    break;
                }
                self.scheduler.approve_exits().await;
                let mut paused_rx = self.paused_rx.clone();
                tokio::select! {
                    res = common_rx.changed() => {
                        if res.is_err() {
                            return;
                        }
                    }
                    res = paused_rx.changed() => {
                        if res.is_err() {
                            return;
                        }
                    }
                }
            }

            if !self.recovered {
                self.recovered = true;
                if let Err(err) = self.power_on_recovery().await {
                    warn!(
                        market = %self.market,
                        order_type = %self.order_type,
                        error = %err,
                        "power-on recovery incomplete"
                    );
                }
            }

            match self.run_session(&mut common_rx).await {
                Ok(SessionEnd::Idle) => {}
                Err(err) if err.is_disconnect() => {
                    info!(
                        market = %self.market,
                        order_type = %self.order_type,
                        "disconnected, awaiting exchange session"
                    );
                    if !self.wait_connected().await {
                        return;
                    }
                    if let Err(err) = self.reconcile_missed_trades().await {
                        warn!(
                            market = %self.market,
                            order_type = %self.order_type,
                            error = %err,
                            "missed-trade reconciliation failed"
                        );
                    }
                }
                Err(err) => {
                    error!(
                        market = %self.market,
                        order_type = %self.order_type,
                        error = %err,
                        "fatal processor error, detaching all paths"
                    );
                    self.abandon_order().await;
                    self.scheduler.unregister_all().await;
                }
            }
        }
    }

    /// The PLACE / LIVE loop. Returns `Ok(Idle)` when the pooled amount is
    /// zero or the processor is paused (order already cancelled), `Err` on
    /// disconnects and fatal errors.
    async fn run_session(
        &mut self,
        common_rx: &mut watch::Receiver<Decimal>,
    ) -> Result<SessionEnd, ExchangeError> {
        let mut notifications = self.exchange.account_stream();
        let mut book_rx = self.books.subscribe(&self.market);
        let mut conn_rx = self.exchange.connection_stream();
        let mut paused_rx = self.paused_rx.clone();
        let mut gap = GapTracker::new();
        let mut tick = tokio::time::interval(LIVE_TICK);
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            let common = *common_rx.borrow_and_update();
            let paused = *paused_rx.borrow_and_update();

            if paused || common.is_zero() {
                self.cancel_current(&mut notifications).await?;
                self.scheduler.approve_exits().await;
                return Ok(SessionEnd::Idle);
            }

            if self.current.is_none() {
                let book = book_rx.borrow_and_update().clone();
                match optimal_price(self.order_type, &book, None, false) {
                    Some(price) => {
                        self.place(price, common, &mut notifications).await?;
                        gap.reset();
                    }
                    None => {
                        // Both book sides empty: wait for liquidity, but
                        // keep reacting to departures and pauses.
                        tokio::select! {
                            res = book_rx.changed() => {
                                if res.is_err() {
                                    return Err(ExchangeError::Disconnected);
                                }
                            }
                            _ = common_rx.changed() => {}
                            _ = paused_rx.changed() => {}
                        }
                        self.scheduler.approve_exits().await;
                    }
                }
                continue;
            }

            tokio::select! {
                notif = notifications.recv() => {
                    self.handle_notification(notif).await?;
                }
                res = book_rx.changed() => {
                    if res.is_err() {
                        return Err(ExchangeError::Disconnected);
                    }
                    gap.note_book_change();
                    self.reposition(&book_rx, common, false, &mut gap).await?;
                }
                _ = tick.tick() => {
                    self.reposition(&book_rx, common, gap.should_fix(), &mut gap).await?;
                }
                res = common_rx.changed() => {
                    if res.is_err() {
                        return Ok(SessionEnd::Idle);
                    }
                    let new_common = *common_rx.borrow_and_update();
                    if new_common > Decimal::ZERO && !*paused_rx.borrow() {
                        // Force a resize even at an unchanged price so the
                        // scheduler can approve departures.
                        self.resize(&book_rx, new_common, &mut gap).await?;
                        self.scheduler.approve_exits().await;
                    }
                    // Zero or paused is handled at the loop head.
                }
                res = paused_rx.changed() => {
                    if res.is_err() {
                        return Ok(SessionEnd::Idle);
                    }
                }
                res = conn_rx.changed() => {
                    if res.is_err() || !*conn_rx.borrow() {
                        return Err(ExchangeError::Disconnected);
                    }
                }
            }
        }
    }

    fn set_current(&mut self, order: Option<LiveOrder>) {
        if let Some(previous) = &self.current {
            if order.as_ref().map(|o| o.id) != Some(previous.id) {
                self.recent_ids.push_front(previous.id);
                self.recent_ids.truncate(RECENT_ORDER_IDS);
            }
        }
        let has_order = order.is_some();
        self.current = order;
        let _ = self.has_order_tx.send(has_order);
    }

    fn owns_order(&self, order_id: OrderId) -> bool {
        self.current.as_ref().map(|o| o.id) == Some(order_id)
            || self.recent_ids.contains(&order_id)
    }

    /// Quote quantity representing `common` at `price`.
    fn order_quote(&self, common: Decimal, price: Decimal) -> Decimal {
        match self.order_type {
            OrderType::Buy => quote_amount(common, price),
            OrderType::Sell => common,
        }
    }

    async fn place(
        &mut self,
        price: Decimal,
        common: Decimal,
        notifications: &mut broadcast::Receiver<AccountNotification>,
    ) -> Result<(), ExchangeError> {
        let quote = self.order_quote(common, price);
        if quote.is_zero() {
            tokio::time::sleep(POST_ONLY_RETRY).await;
            return Ok(());
        }

        match self
            .exchange
            .place(
                &self.market,
                self.order_type,
                price,
                quote,
                OrderKind::PostOnly,
                None,
            )
            .await
        {
            Ok(result) => {
                debug!(
                    market = %self.market,
                    order_type = %self.order_type,
                    order_id = result.order_id,
                    %price,
                    %quote,
                    "post-only order placed"
                );
                self.set_current(Some(LiveOrder {
                    id: result.order_id,
                    price,
                    quote_remaining: quote,
                }));
                self.await_order_created(result.order_id, notifications)
                    .await?;
                self.record_order_id(result.order_id).await;
                Ok(())
            }
            Err(ExchangeError::UnableToPlacePostOnlyOrder) => {
                // The book crossed our price between pricing and placing.
                tokio::time::sleep(POST_ONLY_RETRY).await;
                Ok(())
            }
            Err(ExchangeError::MaxOrdersExceeded(_)) => {
                tokio::time::sleep(Duration::from_millis(1500)).await;
                Ok(())
            }
            Err(err) if err.is_disconnect() => Err(err),
            Err(err) if err.is_fatal_for_step() => Err(err),
            Err(err) => {
                warn!(
                    market = %self.market,
                    order_type = %self.order_type,
                    error = %err,
                    "transient place failure"
                );
                tokio::time::sleep(TRANSIENT_RETRY).await;
                Ok(())
            }
        }
    }

    /// Wait for the resting-order confirmation on the account stream,
    /// routing any interleaved trades. Timeout means the notification
    /// session is dead.
    async fn await_order_created(
        &mut self,
        order_id: OrderId,
        notifications: &mut broadcast::Receiver<AccountNotification>,
    ) -> Result<(), ExchangeError> {
        let deadline = tokio::time::Instant::now() + CONFIRMATION_TIMEOUT;
        loop {
            let notif = tokio::time::timeout_at(deadline, notifications.recv()).await;
            match notif {
                Ok(result) => {
                    if let Ok(AccountNotification::LimitOrderCreated {
                        order_id: created, ..
                    }) = &result
                    {
                        if *created == order_id {
                            return Ok(());
                        }
                    }
                    self.handle_notification(result).await?;
                }
                Err(_) => return Err(ExchangeError::Disconnected),
            }
        }
    }

    /// Reprice against the latest book if the policy says so.
    async fn reposition(
        &mut self,
        book_rx: &watch::Receiver<polo_exchange::OrderBook>,
        common: Decimal,
        gap_fix: bool,
        gap: &mut GapTracker,
    ) -> Result<(), ExchangeError> {
        let Some(current) = self.current.clone() else {
            return Ok(());
        };
        let book = book_rx.borrow().clone();
        let own = Some((current.price, current.quote_remaining));
        let Some(new_price) = optimal_price(self.order_type, &book, own, gap_fix) else {
            return Ok(());
        };
        self.move_to(new_price, common, gap).await
    }

    /// Resize the order to a changed pooled amount, keeping the best
    /// price the policy allows.
    async fn resize(
        &mut self,
        book_rx: &watch::Receiver<polo_exchange::OrderBook>,
        common: Decimal,
        gap: &mut GapTracker,
    ) -> Result<(), ExchangeError> {
        let Some(current) = self.current.clone() else {
            return Ok(());
        };
        let book = book_rx.borrow().clone();
        let own = Some((current.price, current.quote_remaining));
        let price = optimal_price(self.order_type, &book, own, false).unwrap_or(current.price);
        self.move_to(price, common, gap).await
    }

    async fn move_to(
        &mut self,
        new_price: Decimal,
        common: Decimal,
        gap: &mut GapTracker,
    ) -> Result<(), ExchangeError> {
        let Some(current) = self.current.clone() else {
            return Ok(());
        };

        // Buy side only: the exchange reserves new_price * previous
        // quantity during a move. If that exceeds the pooled amount the
        // move would overdraw the reservation; cancel and re-place at a
        // compatible quantity instead.
        // TODO: add the symmetric Sell guard if the exchange starts
        // reserving quote quantity during moves.
        if self.order_type == OrderType::Buy
            && round_up(new_price * current.quote_remaining) > common
        {
            debug!(
                market = %self.market,
                order_id = current.id,
                %new_price,
                "cannot move safely, cancelling for re-place"
            );
            let mut notifications = self.exchange.account_stream();
            self.cancel_current(&mut notifications).await?;
            return Ok(());
        }

        let new_quote = self.order_quote(common, new_price);
        if new_quote.is_zero() {
            let mut notifications = self.exchange.account_stream();
            self.cancel_current(&mut notifications).await?;
            return Ok(());
        }

        match self
            .exchange
            .move_order(current.id, new_price, Some(new_quote), OrderKind::PostOnly, None)
            .await
        {
            Ok(moved) => {
                debug!(
                    market = %self.market,
                    order_type = %self.order_type,
                    old_order_id = current.id,
                    order_id = moved.order_id,
                    %new_price,
                    %new_quote,
                    "order moved"
                );
                self.set_current(Some(LiveOrder {
                    id: moved.order_id,
                    price: new_price,
                    quote_remaining: new_quote,
                }));
                self.record_order_id(moved.order_id).await;
                gap.reset();
                Ok(())
            }
            Err(ExchangeError::UnableToPlacePostOnlyOrder) => {
                tokio::time::sleep(POST_ONLY_RETRY).await;
                Ok(())
            }
            Err(ExchangeError::OrderCompletedOrNotExist | ExchangeError::InvalidOrderNumber) => {
                // Filled or gone mid-move: the cancel half is a no-op and
                // the place loop takes over.
                let _ = self.exchange.cancel(current.id).await;
                self.set_current(None);
                Ok(())
            }
            Err(err) if err.is_disconnect() => Err(err),
            Err(err) if err.is_fatal_for_step() => Err(err),
            Err(err) => {
                warn!(
                    market = %self.market,
                    order_type = %self.order_type,
                    error = %err,
                    "transient move failure"
                );
                tokio::time::sleep(TRANSIENT_RETRY).await;
                Ok(())
            }
        }
    }

    /// Cancel the live order and wait for the Cancelled confirmation,
    /// routing any trades that land first.
    async fn cancel_current(
        &mut self,
        notifications: &mut broadcast::Receiver<AccountNotification>,
    ) -> Result<(), ExchangeError> {
        let Some(current) = self.current.clone() else {
            return Ok(());
        };

        match self.exchange.cancel(current.id).await {
            Ok(CancelOutcome::Cancelled) => {
                let deadline = tokio::time::Instant::now() + CONFIRMATION_TIMEOUT;
                loop {
                    match tokio::time::timeout_at(deadline, notifications.recv()).await {
                        Ok(result) => {
                            if let Ok(AccountNotification::OrderUpdate {
                                order_id,
                                update_type: OrderUpdateType::Cancelled,
                                ..
                            }) = &result
                            {
                                if *order_id == current.id {
                                    break;
                                }
                            }
                            self.handle_notification(result).await?;
                            if self.current.is_none() {
                                // Filled while the cancel was in flight.
                                break;
                            }
                        }
                        Err(_) => return Err(ExchangeError::Disconnected),
                    }
                }
                self.set_current(None);
                debug!(
                    market = %self.market,
                    order_type = %self.order_type,
                    order_id = current.id,
                    "order cancelled"
                );
                Ok(())
            }
            Ok(CancelOutcome::CompletedOrNotExist) => {
                self.set_current(None);
                Ok(())
            }
            Err(err) if err.is_disconnect() => Err(err),
            Err(err) => {
                warn!(
                    market = %self.market,
                    order_type = %self.order_type,
                    error = %err,
                    "cancel failed"
                );
                self.set_current(None);
                Ok(())
            }
        }
    }

    /// Route one account notification.
    async fn handle_notification(
        &mut self,
        notif: Result<AccountNotification, broadcast::error::RecvError>,
    ) -> Result<(), ExchangeError> {
        match notif {
            Ok(AccountNotification::Trade {
                order_id,
                market,
                order_type,
                trade,
            }) => {
                if market != self.market
                    || order_type != self.order_type
                    || !self.owns_order(order_id)
                {
                    return Ok(());
                }
                if trade.trade_id <= self.latest_trade_id {
                    return Ok(());
                }
                self.latest_trade_id = trade.trade_id;
                self.note_trade_seen(order_id, trade.trade_id).await;
                self.scheduler.add_trades(vec![trade.bare()]).await;

                let zeroed = match &mut self.current {
                    Some(current) if current.id == order_id => {
                        current.quote_remaining -= trade.quote_amount;
                        current.quote_remaining <= Decimal::ZERO
                    }
                    _ => false,
                };
                if zeroed {
                    self.set_current(None);
                }
                Ok(())
            }
            Ok(AccountNotification::OrderUpdate {
                order_id,
                update_type,
                ..
            }) => {
                if self.current.as_ref().map(|o| o.id) == Some(order_id) {
                    match update_type {
                        OrderUpdateType::Filled | OrderUpdateType::Cancelled => {
                            self.set_current(None);
                        }
                    }
                }
                Ok(())
            }
            Ok(_) => Ok(()),
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                // Missed notifications are recovered the same way as a
                // disconnect: by re-reading order trades.
                warn!(
                    market = %self.market,
                    order_type = %self.order_type,
                    skipped,
                    "account stream lagged"
                );
                Err(ExchangeError::Disconnected)
            }
            Err(broadcast::error::RecvError::Closed) => Err(ExchangeError::Disconnected),
        }
    }

    /// Cancel the journalled orphan order from a previous process run and
    /// replay its unseen trades into the scheduler.
    async fn power_on_recovery(&mut self) -> Result<(), ExchangeError> {
        let rows = match self
            .journal
            .open_orders(&self.market, self.order_type)
            .await
        {
            Ok(rows) => rows,
            Err(err) => {
                warn!(
                    market = %self.market,
                    order_type = %self.order_type,
                    error = %err,
                    "journal unavailable during power-on recovery"
                );
                return Ok(());
            }
        };
        if rows.is_empty() {
            return Ok(());
        }
        info!(
            market = %self.market,
            order_type = %self.order_type,
            orders = rows.len(),
            "recovering journalled orders"
        );

        for (order_id, watermark) in rows {
            let _ = self.exchange.cancel(order_id).await;
            let trades = self.exchange.order_trades(order_id).await?;
            let floor = watermark.unwrap_or(0);
            let missed: Vec<_> = trades
                .into_iter()
                .filter(|t| t.trade_id > floor)
                .collect();
            if !missed.is_empty() {
                info!(
                    market = %self.market,
                    order_type = %self.order_type,
                    order_id,
                    trades = missed.len(),
                    "replaying recovered trades"
                );
                for trade in &missed {
                    self.latest_trade_id = self.latest_trade_id.max(trade.trade_id);
                }
                self.scheduler
                    .add_trades(missed.iter().map(|t| t.bare()).collect())
                    .await;
            }
        }

        if let Err(err) = self
            .journal
            .clear_market_orders(&self.market, self.order_type)
            .await
        {
            warn!(
                market = %self.market,
                order_type = %self.order_type,
                error = %err,
                "failed to clear recovered order ids"
            );
        }
        Ok(())
    }

    /// Post-reconnect: re-read trades of the current and recent orders and
    /// forward everything past the watermark, then refresh the live order.
    async fn reconcile_missed_trades(&mut self) -> Result<(), ExchangeError> {
        let mut ids: Vec<OrderId> = self.current.iter().map(|o| o.id).collect();
        ids.extend(self.recent_ids.iter().copied());

        for order_id in ids {
            let trades = self.exchange.order_trades(order_id).await?;
            let missed: Vec<_> = trades
                .into_iter()
                .filter(|t| t.trade_id > self.latest_trade_id)
                .collect();
            if missed.is_empty() {
                continue;
            }
            info!(
                market = %self.market,
                order_type = %self.order_type,
                order_id,
                trades = missed.len(),
                "forwarding trades missed during disconnect"
            );
            for trade in &missed {
                self.latest_trade_id = self.latest_trade_id.max(trade.trade_id);
                self.note_trade_seen(order_id, trade.trade_id).await;
            }
            self.scheduler
                .add_trades(missed.iter().map(|t| t.bare()).collect())
                .await;
        }

        if let Some(current) = self.current.clone() {
            match self.exchange.order_status(current.id).await? {
                Some(status) => {
                    if let Some(order) = &mut self.current {
                        order.price = status.price;
                        order.quote_remaining = status.quote_amount;
                    }
                }
                None => self.set_current(None),
            }
        }
        Ok(())
    }

    /// Best-effort cancel used on fatal errors.
    async fn abandon_order(&mut self) {
        if let Some(current) = self.current.clone() {
            let _ = self.exchange.cancel(current.id).await;
            self.set_current(None);
        }
    }

    async fn wait_connected(&self) -> bool {
        let mut conn = self.exchange.connection_stream();
        loop {
            if *conn.borrow_and_update() {
                return true;
            }
            if conn.changed().await.is_err() {
                return false;
            }
        }
    }

    /// Record the order id against every registered path; retried in the
    /// background so a journal hiccup does not stall the market maker.
    async fn record_order_id(&self, order_id: OrderId) {
        let paths = self.scheduler.registered_ids().await;
        let journal = Arc::clone(&self.journal);
        let market = self.market.clone();
        let order_type = self.order_type;
        tokio::spawn(async move {
            for tran_id in paths {
                for attempt in 0u32.. {
                    match journal
                        .record_order_id(tran_id, &market, order_type, order_id)
                        .await
                    {
                        Ok(()) => break,
                        Err(err) if attempt < 5 => {
                            warn!(error = %err, "order id journal write failed, retrying");
                            tokio::time::sleep(Duration::from_secs(1)).await;
                        }
                        Err(err) => {
                            error!(error = %err, "order id journal write abandoned");
                            break;
                        }
                    }
                }
            }
        });
    }

    async fn note_trade_seen(&self, order_id: OrderId, trade_id: TradeId) {
        if let Err(err) = self
            .journal
            .note_trade_seen(&self.market, self.order_type, order_id, trade_id)
            .await
        {
            warn!(error = %err, "trade watermark write failed");
        }
    }
}
