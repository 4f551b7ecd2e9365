//! Startup recovery, cancellation, and mid-path re-planning scenarios.

use std::sync::Arc;
use std::time::Duration;

use polo_bot::config::{BotConfig, InstantRetryConfig};
use polo_bot::instant::InstantExecutor;
use polo_bot::intent::manager::IntentManager;
use polo_bot::intent::markets::TranIntentMarket;
use polo_bot::intent::IntentContext;
use polo_bot::journal::{ActiveTransaction, Journal, MemJournal};
use polo_bot::pathfinder::PathFinder;
use polo_bot::processor::manager::DelayedTradeManager;
use polo_bot::trader::Trader;
use polo_common::{BareTrade, Currency, CurrencyType, Market, OrderSpeed, OrderType};
use polo_exchange::sim::SimExchange;
use polo_exchange::{BookCache, BookSide, ExchangeClient, OrderBook};
use rust_decimal_macros::dec;
use uuid::Uuid;

async fn build_ctx(exchange: Arc<SimExchange>) -> Arc<IntentContext> {
    let client: Arc<dyn ExchangeClient> = exchange;
    let books = BookCache::new(Arc::clone(&client));
    let markets = client.markets().await.unwrap();

    let mut config = BotConfig::default();
    config.profit_check_interval_secs = 1;
    config.instant = InstantRetryConfig {
        unable_to_fill_delay_ms: 5,
        transaction_failed_delay_ms: 5,
        max_orders_delay_ms: 5,
        network_delay_ms: 5,
        not_enough_crypto_retries: 3,
        order_book_empty_retries: 20,
    };
    let config = Arc::new(config);

    let journal: Arc<dyn Journal> = Arc::new(MemJournal::new());
    let pathfinder = Arc::new(PathFinder::new(books.clone(), markets, 4));
    let instant = Arc::new(InstantExecutor::new(
        Arc::clone(&client),
        books.clone(),
        config.instant.clone(),
    ));
    let processors = Arc::new(DelayedTradeManager::new(
        Arc::clone(&client),
        books.clone(),
        Arc::clone(&journal),
    ));

    Arc::new(IntentContext {
        exchange: client,
        books,
        journal,
        intents: Arc::new(IntentManager::new()),
        processors,
        pathfinder,
        instant,
        config,
    })
}

fn seed_book(exchange: &SimExchange, market: &Market, asks: &[(&str, &str)], bids: &[(&str, &str)]) {
    let mut book = OrderBook::new();
    for (p, s) in asks {
        book.set_level(BookSide::Ask, p.parse().unwrap(), s.parse().unwrap());
    }
    for (p, s) in bids {
        book.set_level(BookSide::Bid, p.parse().unwrap(), s.parse().unwrap());
    }
    exchange.set_book(market, book);
}

async fn wait_until<F: Fn() -> bool>(what: &str, check: F) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    while tokio::time::Instant::now() < deadline {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("timed out waiting for {what}");
}

/// Re-running recovery on the same journal resumes each intent exactly
/// once, and cancellation returns a primary-currency reservation to the
/// balance without leaving rows behind.
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_recovery_is_idempotent_and_cancel_releases_funds() {
    let exchange = Arc::new(SimExchange::new());
    let usdt_btc = Market::of("USDT", "BTC");
    let usdc_btc = Market::of("USDC", "BTC");
    seed_book(&exchange, &usdt_btc, &[("9010", "1")], &[("9000", "1")]);
    seed_book(&exchange, &usdc_btc, &[], &[("9100", "10")]);
    exchange.set_balance(&Currency::from("USDT"), dec!(100));

    let ctx = build_ctx(Arc::clone(&exchange)).await;

    // A journaled intent mid-delayed-step at index 0.
    let tran = ActiveTransaction::new(
        Uuid::new_v4(),
        vec![
            TranIntentMarket::PartiallyCompleted {
                market: usdt_btc.clone(),
                speed: OrderSpeed::Delayed,
                from_currency_type: CurrencyType::Base,
                from_amount: dec!(30),
            },
            TranIntentMarket::Predicted {
                market: usdc_btc.clone(),
                speed: OrderSpeed::Instant,
                from_currency_type: CurrencyType::Quote,
            },
        ],
        0,
    );
    ctx.journal.upsert_active(&tran).await.unwrap();

    let trader = Trader::new(Arc::clone(&ctx));
    trader.recover().await.unwrap();
    trader.recover().await.unwrap();
    assert_eq!(ctx.intents.len(), 1, "same journal resumes the same set");

    // The resumed delayed step posts its maker order.
    let exchange_poll = Arc::clone(&exchange);
    wait_until("resumed maker order", move || {
        exchange_poll
            .open_orders()
            .iter()
            .any(|(_, ot, _, _)| *ot == OrderType::Buy)
    })
    .await;

    // Cancel: the order comes off and the reservation, still entirely in
    // USDT, is simply released.
    ctx.intents.cancel_all();
    let ctx_poll = Arc::clone(&ctx);
    wait_until("intent shutdown", move || ctx_poll.intents.is_empty()).await;

    let exchange_poll = Arc::clone(&exchange);
    wait_until("order cancellation", move || {
        exchange_poll.open_order_count() == 0
    })
    .await;
    assert!(ctx.journal.list_active().await.unwrap().is_empty());
    assert!(ctx.journal.list_unfilled().await.unwrap().is_empty());
}

/// A delayed step whose tail stops being profitable is re-planned onto a
/// better exit and the intent finishes under the same id.
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_profit_monitor_replans_tail() {
    let exchange = Arc::new(SimExchange::new());
    let usdt_btc = Market::of("USDT", "BTC");
    let usdc_btc = Market::of("USDC", "BTC");
    // The planned exit via USDC pays far too little...
    seed_book(&exchange, &usdc_btc, &[("8000", "1")], &[("7900", "1")]);
    // ...while the USDT book pays a profit over the 49.99995 already spent.
    seed_book(&exchange, &usdt_btc, &[], &[("9100", "1")]);

    let ctx = build_ctx(Arc::clone(&exchange)).await;

    let step0_trades = vec![BareTrade::new(dec!(0.00555555), dec!(9000), dec!(0.999))];
    let intent_id = Uuid::new_v4();
    let tran = ActiveTransaction::new(
        intent_id,
        vec![
            TranIntentMarket::Completed {
                market: usdt_btc.clone(),
                speed: OrderSpeed::Instant,
                from_currency_type: CurrencyType::Base,
                trades: step0_trades,
            },
            TranIntentMarket::PartiallyCompleted {
                market: usdc_btc.clone(),
                speed: OrderSpeed::Delayed,
                from_currency_type: CurrencyType::Quote,
                from_amount: dec!(0.00555000),
            },
        ],
        1,
    );
    ctx.journal.upsert_active(&tran).await.unwrap();
    Trader::new(Arc::clone(&ctx)).recover().await.unwrap();

    // The monitor fires, the tail is re-planned onto USDT_BTC, and the
    // intent runs to completion. A re-planned delayed tail rests an ask
    // that we fill as the counterparty.
    let deadline = tokio::time::Instant::now() + Duration::from_secs(15);
    loop {
        let completed = ctx.journal.list_completed().await.unwrap();
        if !completed.is_empty() {
            let row = &completed[0];
            assert_eq!(row.id, intent_id, "replan keeps the intent id");
            assert_eq!(row.markets[1].market(), &usdt_btc);
            assert!(matches!(
                row.markets[1],
                TranIntentMarket::Completed { .. }
            ));
            break;
        }
        for (order_id, order_type, _, remaining) in exchange.open_orders() {
            if order_type == OrderType::Sell {
                exchange.fill_order(order_id, remaining);
            }
        }
        if tokio::time::Instant::now() > deadline {
            panic!("intent did not complete after re-plan");
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    assert!(ctx.journal.list_active().await.unwrap().is_empty());
}
