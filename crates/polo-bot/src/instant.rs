//! Fill-or-kill taker executor for instant path steps.
//!
//! Each attempt simulates the fill against the latest book, places a
//! fill-or-kill limit at the last-filling price, and classifies failures
//! into timed retries or step aborts. Returned trades always carry the
//! canonical taker fee; a divergent exchange-reported fee is logged and
//! overridden (the exchange is known to round it inconsistently).

use std::sync::Arc;
use std::time::Duration;

use polo_common::{
    from_amount, quote_amount, target_amount, BareTrade, Market, OrderType, PRICE_TICK,
};
use polo_exchange::{BookCache, BookSide, ExchangeClient, ExchangeError, OrderBook, OrderKind};
use rust_decimal::Decimal;
use tracing::{debug, warn};

use crate::config::InstantRetryConfig;

/// Why an instant step stopped before consuming its whole input.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum InstantAbort {
    #[error("order book is empty on the taker side")]
    OrderBookEmpty,

    #[error("not enough funds after retries")]
    NotEnoughCrypto,

    #[error("order amount below the exchange minimum")]
    AmountTooSmall,

    #[error("order total below the exchange minimum")]
    TotalTooSmall,

    #[error("order rate above the exchange maximum")]
    RateTooHigh,

    #[error("market is disabled")]
    MarketDisabled,

    #[error("order matching is disabled")]
    OrderMatchingDisabled,
}

/// Result of one instant step: the trades that executed and, when the step
/// did not finish, the reason it stopped.
#[derive(Debug, Clone, PartialEq)]
pub struct InstantOutcome {
    pub trades: Vec<BareTrade>,
    pub abort: Option<InstantAbort>,
}

impl InstantOutcome {
    pub fn is_complete(&self) -> bool {
        self.abort.is_none()
    }
}

/// Fill-or-kill executor over the book cache.
pub struct InstantExecutor {
    exchange: Arc<dyn ExchangeClient>,
    books: BookCache,
    config: InstantRetryConfig,
}

/// Quantity and limit price for one fill-or-kill attempt.
#[derive(Debug, Clone, Copy, PartialEq)]
struct Attempt {
    price: Decimal,
    quote_amount: Decimal,
}

impl InstantExecutor {
    pub fn new(
        exchange: Arc<dyn ExchangeClient>,
        books: BookCache,
        config: InstantRetryConfig,
    ) -> Self {
        Self {
            exchange,
            books,
            config,
        }
    }

    /// Execute `from_amount` against the market, retrying transient
    /// failures, until the amount is consumed or a fatal error aborts the
    /// step.
    pub async fn execute(
        &self,
        market: &Market,
        order_type: OrderType,
        from_amount_total: Decimal,
    ) -> InstantOutcome {
        let book_rx = self.books.subscribe(market);
        let canonical_fee = self.books.fee_stream().borrow().taker;

        let mut remaining = from_amount_total;
        let mut trades: Vec<BareTrade> = Vec::new();
        let mut crypto_failures = 0u32;
        let mut empty_book_failures = 0u32;

        while remaining > Decimal::ZERO {
            let book = book_rx.borrow().clone();

            // Residue too small to trade at the current best price is
            // treated as consumed.
            if let Some((best_price, _)) = book.best(BookSide::taker(order_type)) {
                let tradable = match order_type {
                    OrderType::Buy => !quote_amount(remaining, best_price).is_zero(),
                    OrderType::Sell => remaining >= PRICE_TICK,
                };
                if !tradable {
                    break;
                }
            }

            let Some(attempt) = plan_attempt(&book, order_type, remaining) else {
                empty_book_failures += 1;
                if empty_book_failures > self.config.order_book_empty_retries {
                    return InstantOutcome {
                        trades,
                        abort: Some(InstantAbort::OrderBookEmpty),
                    };
                }
                tokio::time::sleep(Duration::from_millis(self.config.unable_to_fill_delay_ms))
                    .await;
                continue;
            };

            match self
                .exchange
                .place(
                    market,
                    order_type,
                    attempt.price,
                    attempt.quote_amount,
                    OrderKind::FillOrKill,
                    None,
                )
                .await
            {
                Ok(result) => {
                    crypto_failures = 0;
                    empty_book_failures = 0;
                    for trade in result.trades {
                        let fee = if trade.fee_multiplier == canonical_fee {
                            trade.fee_multiplier
                        } else {
                            // Known exchange rounding bug: trust the
                            // canonical taker fee over the reported one.
                            warn!(
                                market = %market,
                                reported = %trade.fee_multiplier,
                                canonical = %canonical_fee,
                                "exchange-reported fee diverges from canonical taker fee"
                            );
                            canonical_fee
                        };
                        let bare = BareTrade::new(trade.quote_amount, trade.price, fee);
                        let computed_target = target_amount(order_type, &bare);
                        if trade.taker_adjustment != computed_target
                            && !trade.taker_adjustment.is_zero()
                        {
                            warn!(
                                market = %market,
                                reported = %trade.taker_adjustment,
                                computed = %computed_target,
                                "taker adjustment diverges from computed target amount"
                            );
                        }
                        remaining -= from_amount(order_type, &bare);
                        trades.push(bare);
                    }
                    debug!(
                        market = %market,
                        %order_type,
                        %remaining,
                        "fill-or-kill executed"
                    );
                }
                Err(err) => match err {
                    ExchangeError::UnableToFillOrder => {
                        // The book moved out from under the simulation.
                        tokio::time::sleep(Duration::from_millis(
                            self.config.unable_to_fill_delay_ms,
                        ))
                        .await;
                    }
                    ExchangeError::TransactionFailed => {
                        tokio::time::sleep(Duration::from_millis(
                            self.config.transaction_failed_delay_ms,
                        ))
                        .await;
                    }
                    ExchangeError::MaxOrdersExceeded(_) => {
                        tokio::time::sleep(Duration::from_millis(self.config.max_orders_delay_ms))
                            .await;
                    }
                    ExchangeError::Disconnected
                    | ExchangeError::MaintenanceMode
                    | ExchangeError::PoloniexInternalError(_) => {
                        tokio::time::sleep(Duration::from_millis(self.config.network_delay_ms))
                            .await;
                    }
                    ExchangeError::NotEnoughCrypto(currency) => {
                        crypto_failures += 1;
                        if crypto_failures >= self.config.not_enough_crypto_retries {
                            warn!(market = %market, %currency, "aborting step: not enough funds");
                            return InstantOutcome {
                                trades,
                                abort: Some(InstantAbort::NotEnoughCrypto),
                            };
                        }
                        tokio::time::sleep(Duration::from_millis(
                            self.config.transaction_failed_delay_ms,
                        ))
                        .await;
                    }
                    ExchangeError::AmountMustBeAtLeast(_) => {
                        return InstantOutcome {
                            trades,
                            abort: Some(InstantAbort::AmountTooSmall),
                        };
                    }
                    ExchangeError::TotalMustBeAtLeast(_) => {
                        return InstantOutcome {
                            trades,
                            abort: Some(InstantAbort::TotalTooSmall),
                        };
                    }
                    ExchangeError::RateMustBeLessThan(_) => {
                        return InstantOutcome {
                            trades,
                            abort: Some(InstantAbort::RateTooHigh),
                        };
                    }
                    ExchangeError::MarketDisabled => {
                        return InstantOutcome {
                            trades,
                            abort: Some(InstantAbort::MarketDisabled),
                        };
                    }
                    ExchangeError::OrderMatchingDisabled => {
                        return InstantOutcome {
                            trades,
                            abort: Some(InstantAbort::OrderMatchingDisabled),
                        };
                    }
                    other => {
                        warn!(market = %market, error = %other, "unexpected place error, retrying");
                        tokio::time::sleep(Duration::from_millis(
                            self.config.transaction_failed_delay_ms,
                        ))
                        .await;
                    }
                },
            }
        }

        InstantOutcome {
            trades,
            abort: None,
        }
    }
}

/// Simulate the fill against the book: the order's limit is the price of
/// the last level that fills, its quantity the total quote required to
/// exhaust `from_amount`.
fn plan_attempt(book: &OrderBook, order_type: OrderType, from_amount: Decimal) -> Option<Attempt> {
    let side = BookSide::taker(order_type);
    let levels = book.levels(side);
    if levels.is_empty() {
        return None;
    }

    let mut remaining = from_amount;
    let mut total_quote = Decimal::ZERO;
    let mut last_price = Decimal::ZERO;

    for (price, size) in levels {
        if remaining <= Decimal::ZERO {
            break;
        }
        last_price = price;
        match order_type {
            OrderType::Buy => {
                let affordable = quote_amount(remaining, price);
                if affordable.is_zero() {
                    break;
                }
                let quote = affordable.min(size);
                total_quote += quote;
                remaining -= polo_common::round_down(quote * price);
            }
            OrderType::Sell => {
                let quote = remaining.min(size);
                total_quote += quote;
                remaining -= quote;
            }
        }
    }

    let dust_limit = match order_type {
        OrderType::Buy => PRICE_TICK * last_price.max(Decimal::ONE),
        OrderType::Sell => PRICE_TICK,
    };
    if remaining > dust_limit || total_quote.is_zero() {
        // The whole book is thinner than the step's input.
        return None;
    }

    Some(Attempt {
        price: last_price,
        quote_amount: total_quote,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use polo_exchange::sim::SimExchange;
    use rust_decimal_macros::dec;

    fn setup(asks: &[(Decimal, Decimal)]) -> (Arc<SimExchange>, InstantExecutor, Market) {
        let market = Market::of("USDT", "BTC");
        let exchange = Arc::new(SimExchange::new());
        let mut book = OrderBook::new();
        for (p, s) in asks {
            book.set_level(BookSide::Ask, *p, *s);
        }
        exchange.set_book(&market, book);
        let books = BookCache::new(Arc::clone(&exchange) as Arc<dyn ExchangeClient>);
        let executor = InstantExecutor::new(
            Arc::clone(&exchange) as Arc<dyn ExchangeClient>,
            books,
            InstantRetryConfig {
                unable_to_fill_delay_ms: 1,
                transaction_failed_delay_ms: 1,
                max_orders_delay_ms: 1,
                network_delay_ms: 1,
                not_enough_crypto_retries: 3,
                order_book_empty_retries: 2,
            },
        );
        (exchange, executor, market)
    }

    async fn settle(books: &BookCache, market: &Market) {
        // Let the cache fold the seeded snapshot in.
        let mut rx = books.subscribe(market);
        let _ = tokio::time::timeout(Duration::from_millis(200), rx.changed()).await;
    }

    #[test]
    fn test_plan_attempt_single_level() {
        let mut book = OrderBook::new();
        book.set_level(BookSide::Ask, dec!(9000), dec!(1));
        let attempt = plan_attempt(&book, OrderType::Buy, dec!(50)).unwrap();
        assert_eq!(attempt.price, dec!(9000));
        assert_eq!(attempt.quote_amount, dec!(0.00555555));
    }

    #[test]
    fn test_plan_attempt_multi_level_limit_is_last_price() {
        let mut book = OrderBook::new();
        book.set_level(BookSide::Ask, dec!(9000), dec!(0.001));
        book.set_level(BookSide::Ask, dec!(9100), dec!(1));
        let attempt = plan_attempt(&book, OrderType::Buy, dec!(18)).unwrap();
        assert_eq!(attempt.price, dec!(9100));
        assert_eq!(attempt.quote_amount, dec!(0.001) + dec!(0.00098901));
    }

    #[test]
    fn test_plan_attempt_empty_or_thin_book() {
        assert_eq!(plan_attempt(&OrderBook::new(), OrderType::Buy, dec!(50)), None);

        let mut book = OrderBook::new();
        book.set_level(BookSide::Ask, dec!(9000), dec!(0.0001));
        assert_eq!(plan_attempt(&book, OrderType::Buy, dec!(50)), None);
    }

    #[tokio::test]
    async fn test_execute_consumes_from_amount() {
        let (_exchange, executor, market) = setup(&[(dec!(9000), dec!(1))]);
        settle(&executor.books, &market).await;

        let outcome = executor.execute(&market, OrderType::Buy, dec!(50)).await;
        assert!(outcome.is_complete());
        assert_eq!(outcome.trades.len(), 1);
        assert_eq!(outcome.trades[0].quote_amount, dec!(0.00555555));
        assert_eq!(outcome.trades[0].price, dec!(9000));
        assert_eq!(outcome.trades[0].fee_multiplier, dec!(0.999));
    }

    #[tokio::test]
    async fn test_execute_aborts_on_market_disabled() {
        let (exchange, executor, market) = setup(&[(dec!(9000), dec!(1))]);
        settle(&executor.books, &market).await;
        exchange.inject_place_error(ExchangeError::MarketDisabled);

        let outcome = executor.execute(&market, OrderType::Buy, dec!(50)).await;
        assert_eq!(outcome.abort, Some(InstantAbort::MarketDisabled));
        assert!(outcome.trades.is_empty());
    }

    #[tokio::test]
    async fn test_execute_retries_transient_then_fills() {
        let (exchange, executor, market) = setup(&[(dec!(9000), dec!(1))]);
        settle(&executor.books, &market).await;
        exchange.inject_place_error(ExchangeError::TransactionFailed);
        exchange.inject_place_error(ExchangeError::UnableToFillOrder);

        let outcome = executor.execute(&market, OrderType::Buy, dec!(50)).await;
        assert!(outcome.is_complete());
        assert_eq!(outcome.trades.len(), 1);
    }

    #[tokio::test]
    async fn test_execute_aborts_after_crypto_retries() {
        let (exchange, executor, market) = setup(&[(dec!(9000), dec!(1))]);
        settle(&executor.books, &market).await;
        for _ in 0..3 {
            exchange.inject_place_error(ExchangeError::NotEnoughCrypto("USDT".into()));
        }

        let outcome = executor.execute(&market, OrderType::Buy, dec!(50)).await;
        assert_eq!(outcome.abort, Some(InstantAbort::NotEnoughCrypto));
    }

    #[tokio::test]
    async fn test_execute_empty_book_aborts_after_retries() {
        let (_exchange, executor, market) = setup(&[]);
        settle(&executor.books, &market).await;

        let outcome = executor.execute(&market, OrderType::Buy, dec!(50)).await;
        assert_eq!(outcome.abort, Some(InstantAbort::OrderBookEmpty));
        assert!(outcome.trades.is_empty());
    }
}
