//! End-to-end instant-path scenarios against the sim exchange and the
//! in-memory journal.

use std::sync::Arc;
use std::time::Duration;

use polo_bot::config::{BotConfig, InstantRetryConfig};
use polo_bot::instant::InstantExecutor;
use polo_bot::intent::manager::IntentManager;
use polo_bot::intent::markets::{step_from_amount, step_target_amount, TranIntentMarket};
use polo_bot::intent::{spawn_intent, IntentContext};
use polo_bot::journal::{ActiveTransaction, Journal, MemJournal, UnfilledRemainder};
use polo_bot::pathfinder::PathFinder;
use polo_bot::processor::manager::DelayedTradeManager;
use polo_common::{BareTrade, Currency, CurrencyType, Market, OrderSpeed};
use polo_exchange::sim::SimExchange;
use polo_exchange::{BookCache, BookSide, ExchangeClient, OrderBook};
use rust_decimal_macros::dec;
use uuid::Uuid;

async fn build_ctx(exchange: Arc<SimExchange>) -> Arc<IntentContext> {
    let client: Arc<dyn ExchangeClient> = exchange;
    let books = BookCache::new(Arc::clone(&client));
    let markets = client.markets().await.unwrap();

    let mut config = BotConfig::default();
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

async fn wait_for_completed(journal: &Arc<dyn Journal>) -> Vec<polo_bot::CompletedTransaction> {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    loop {
        let completed = journal.list_completed().await.unwrap();
        if !completed.is_empty() {
            return completed;
        }
        if tokio::time::Instant::now() > deadline {
            panic!("timed out waiting for a completed transaction");
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

/// Three instant hops, each fully filled, conserve amounts exactly and end
/// in the completed table.
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_straight_through_instant_path() {
    let exchange = Arc::new(SimExchange::new());
    let usdt_btc = Market::of("USDT", "BTC");
    let btc_eth = Market::of("BTC", "ETH");
    let usdc_eth = Market::of("USDC", "ETH");
    seed_book(&exchange, &usdt_btc, &[("9000", "1")], &[]);
    seed_book(&exchange, &btc_eth, &[("0.05", "10")], &[]);
    seed_book(&exchange, &usdc_eth, &[], &[("180", "10")]);
    exchange.set_balance(&Currency::from("USDT"), dec!(100));

    let ctx = build_ctx(Arc::clone(&exchange)).await;

    let markets = vec![
        TranIntentMarket::PartiallyCompleted {
            market: usdt_btc.clone(),
            speed: OrderSpeed::Instant,
            from_currency_type: CurrencyType::Base,
            from_amount: dec!(50),
        },
        TranIntentMarket::Predicted {
            market: btc_eth.clone(),
            speed: OrderSpeed::Instant,
            from_currency_type: CurrencyType::Base,
        },
        TranIntentMarket::Predicted {
            market: usdc_eth.clone(),
            speed: OrderSpeed::Instant,
            from_currency_type: CurrencyType::Quote,
        },
    ];
    let tran = ActiveTransaction::new(Uuid::new_v4(), markets, 0);
    ctx.journal.upsert_active(&tran).await.unwrap();
    spawn_intent(Arc::clone(&ctx), tran).unwrap();

    let completed = wait_for_completed(&ctx.journal).await;
    assert_eq!(completed.len(), 1);
    let chain = &completed[0].markets;
    assert_eq!(chain.len(), 3);
    assert!(chain
        .iter()
        .all(|m| matches!(m, TranIntentMarket::Completed { .. })));

    // Step 1: 50 USDT buys 0.00555555 BTC at 9000.
    assert_eq!(
        chain[0].trades(),
        &[BareTrade::new(dec!(0.00555555), dec!(9000), dec!(0.999))]
    );
    assert_eq!(step_from_amount(chain, 0), dec!(49.99995));
    assert_eq!(step_target_amount(chain, 0), dec!(0.00555000));

    // Step 2 feeds on step 1's output exactly.
    assert_eq!(step_from_amount(chain, 1), dec!(0.00555));
    assert_eq!(step_target_amount(chain, 1), dec!(0.110889));

    // Step 3 lands in USDC.
    assert_eq!(step_from_amount(chain, 2), dec!(0.110889));
    assert_eq!(step_target_amount(chain, 2), dec!(19.94005998));

    // Nothing left behind.
    assert!(ctx.journal.list_active().await.unwrap().is_empty());
    assert!(ctx.journal.list_unfilled().await.unwrap().is_empty());
}

/// An unfilled remainder from an earlier intent is absorbed by the next
/// intent reaching the same currency pair, with adjustment trades keeping
/// the books balanced.
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_unfilled_residue_merges_into_next_intent() {
    let exchange = Arc::new(SimExchange::new());
    let usdt_btc = Market::of("USDT", "BTC");
    let usdc_btc = Market::of("USDC", "BTC");
    seed_book(&exchange, &usdt_btc, &[("9000", "1")], &[]);
    seed_book(&exchange, &usdc_btc, &[], &[("9000", "1")]);
    exchange.set_balance(&Currency::from("USDT"), dec!(100));

    let ctx = build_ctx(Arc::clone(&exchange)).await;

    // Residue of a dead intent: 5 USDT that became 0.0005 BTC and stalled.
    let residue = UnfilledRemainder {
        id: Uuid::new_v4(),
        init_currency: Currency::from("USDT"),
        init_amount: dec!(5),
        current_currency: Currency::from("BTC"),
        current_amount: dec!(0.0005),
    };
    ctx.journal
        .move_active_to_unfilled(Uuid::new_v4(), &residue)
        .await
        .unwrap();

    let markets = vec![
        TranIntentMarket::PartiallyCompleted {
            market: usdt_btc.clone(),
            speed: OrderSpeed::Instant,
            from_currency_type: CurrencyType::Base,
            from_amount: dec!(50),
        },
        TranIntentMarket::Predicted {
            market: usdc_btc.clone(),
            speed: OrderSpeed::Instant,
            from_currency_type: CurrencyType::Quote,
        },
    ];
    let tran = ActiveTransaction::new(Uuid::new_v4(), markets, 0);
    ctx.journal.upsert_active(&tran).await.unwrap();
    spawn_intent(Arc::clone(&ctx), tran).unwrap();

    let completed = wait_for_completed(&ctx.journal).await;
    assert_eq!(completed.len(), 1);
    let chain = &completed[0].markets;

    // Step 0 carries the residue's init as an adjustment trade.
    assert_eq!(step_from_amount(chain, 0), dec!(49.99995) + dec!(5));
    // Step 1 executed the original output plus the residue.
    assert_eq!(step_from_amount(chain, 1), dec!(0.00555) + dec!(0.0005));
    assert_eq!(step_target_amount(chain, 1), dec!(54.39555));

    // The residue row was claimed exactly once.
    assert!(ctx.journal.list_unfilled().await.unwrap().is_empty());
    assert!(ctx.journal.list_active().await.unwrap().is_empty());

    // A later intent finds no residue left to absorb.
    assert!(ctx
        .journal
        .take_unfilled(&Currency::from("USDT"), &Currency::from("BTC"))
        .await
        .unwrap()
        .is_empty());
}
