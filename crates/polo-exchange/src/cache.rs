//! Latest-value order book cache.
//!
//! Multiplexes one upstream SDK subscription per market into any number of
//! `watch` receivers. Late subscribers immediately observe the latest
//! snapshot. The upstream subscription is reference counted: when the last
//! engine-side receiver is dropped, the feed waits out a short grace period
//! before tearing down, so a path that re-enters the market seconds later
//! does not pay the resubscription cost. Feeds re-establish themselves
//! after a disconnect by waiting on the connection-state stream.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use polo_common::{FeeMultiplier, Market};
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::book::OrderBook;
use crate::client::ExchangeClient;

/// How long an unobserved feed keeps its upstream subscription alive.
const TEARDOWN_GRACE: Duration = Duration::from_secs(5);

/// How often an idle feed re-checks its subscriber count.
const IDLE_CHECK_INTERVAL: Duration = Duration::from_secs(1);

/// Shared order book cache over one exchange client.
#[derive(Clone)]
pub struct BookCache {
    exchange: Arc<dyn ExchangeClient>,
    books: Arc<DashMap<Market, watch::Receiver<OrderBook>>>,
}

impl BookCache {
    pub fn new(exchange: Arc<dyn ExchangeClient>) -> Self {
        Self {
            exchange,
            books: Arc::new(DashMap::new()),
        }
    }

    /// Latest-value stream of one market's book. Creates the upstream feed
    /// on first use; replays the current snapshot to late subscribers.
    pub fn subscribe(&self, market: &Market) -> watch::Receiver<OrderBook> {
        self.books
            .entry(market.clone())
            .or_insert_with(|| {
                let (tx, rx) = watch::channel(OrderBook::new());
                tokio::spawn(run_book_feed(
                    Arc::clone(&self.exchange),
                    market.clone(),
                    tx,
                    Arc::clone(&self.books),
                ));
                rx
            })
            .clone()
    }

    /// Latest maker/taker fee multipliers, shared across all markets.
    pub fn fee_stream(&self) -> watch::Receiver<FeeMultiplier> {
        self.exchange.fee_stream()
    }

    /// Number of live upstream feeds; used by tests and the admin log line.
    pub fn active_feeds(&self) -> usize {
        self.books.len()
    }
}

/// One upstream feed: folds SDK updates into a book and publishes snapshots.
async fn run_book_feed(
    exchange: Arc<dyn ExchangeClient>,
    market: Market,
    tx: watch::Sender<OrderBook>,
    books: Arc<DashMap<Market, watch::Receiver<OrderBook>>>,
) {
    let mut idle_since: Option<Instant> = None;

    'session: loop {
        let mut stream = match exchange.order_book_stream(&market).await {
            Ok(stream) => stream,
            Err(err) => {
                warn!(market = %market, error = %err, "book subscription failed, awaiting reconnect");
                if !wait_connected(exchange.as_ref()).await {
                    break 'session;
                }
                continue 'session;
            }
        };

        let mut book = OrderBook::new();
        let mut idle_check = tokio::time::interval(IDLE_CHECK_INTERVAL);

        loop {
            tokio::select! {
                update = stream.recv() => match update {
                    Some(update) => {
                        book.apply(&update);
                        let _ = tx.send(book.clone());
                    }
                    None => {
                        debug!(market = %market, "book stream closed, awaiting reconnect");
                        if !wait_connected(exchange.as_ref()).await {
                            break 'session;
                        }
                        continue 'session;
                    }
                },
                _ = idle_check.tick() => {
                    // The cache's own map entry holds one receiver.
                    if tx.receiver_count() <= 1 {
                        let since = *idle_since.get_or_insert_with(Instant::now);
                        if since.elapsed() >= TEARDOWN_GRACE {
                            let removed = books
                                .remove_if(&market, |_, _| tx.receiver_count() <= 1);
                            if removed.is_some() {
                                debug!(market = %market, "tearing down idle book feed");
                                break 'session;
                            }
                            idle_since = None;
                        }
                    } else {
                        idle_since = None;
                    }
                }
            }
        }
    }
}

/// Wait until the connection-state stream reports healthy. Returns false if
/// the exchange client was dropped.
async fn wait_connected(exchange: &dyn ExchangeClient) -> bool {
    let mut conn = exchange.connection_stream();
    loop {
        if *conn.borrow_and_update() {
            return true;
        }
        if conn.changed().await.is_err() {
            return false;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::book::BookSide;
    use crate::sim::SimExchange;
    use rust_decimal_macros::dec;

    #[tokio::test]
    async fn test_subscribe_replays_latest_snapshot() {
        let exchange = Arc::new(SimExchange::new());
        let market = Market::of("USDT", "BTC");
        let mut seeded = OrderBook::new();
        seeded.set_level(BookSide::Ask, dec!(9005), dec!(1));
        seeded.set_level(BookSide::Bid, dec!(9000), dec!(2));
        exchange.set_book(&market, seeded.clone());

        let cache = BookCache::new(exchange);
        let mut rx = cache.subscribe(&market);

        // First publish is the upstream snapshot.
        rx.changed().await.unwrap();
        assert_eq!(*rx.borrow(), seeded);

        // A late subscriber observes the same value without waiting.
        let late = cache.subscribe(&market);
        assert_eq!(*late.borrow(), seeded);
        assert_eq!(cache.active_feeds(), 1);
    }

    #[tokio::test]
    async fn test_deltas_fold_into_snapshot() {
        let exchange = Arc::new(SimExchange::new());
        let market = Market::of("USDT", "BTC");
        let mut seeded = OrderBook::new();
        seeded.set_level(BookSide::Bid, dec!(9000), dec!(2));
        exchange.set_book(&market, seeded);

        let cache = BookCache::new(Arc::clone(&exchange) as Arc<dyn ExchangeClient>);
        let mut rx = cache.subscribe(&market);
        rx.changed().await.unwrap();

        exchange.update_level(&market, BookSide::Bid, dec!(9001), dec!(1));
        rx.changed().await.unwrap();
        assert_eq!(rx.borrow().best(BookSide::Bid), Some((dec!(9001), dec!(1))));
    }
}
