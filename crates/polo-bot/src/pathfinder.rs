//! Candidate path enumeration.
//!
//! Walks the market graph from a funding currency back to the primary
//! currencies, estimating every step against the latest order books, and
//! emits chains ranked by expected profit. Also prices the tail of a
//! running intent for the profit monitor.

use std::collections::{HashMap, HashSet};

use polo_common::{
    quote_amount, round_down, round_up, Currency, FeeMultiplier, Market, OrderSpeed, OrderType,
    PRICE_TICK,
};
use polo_exchange::{BookCache, BookSide, OrderBook};
use rust_decimal::Decimal;

use crate::intent::markets::{shape_hash, step_from_amount, TranIntentMarket};
use crate::processor::pricing::optimal_price;

/// One estimated step of a candidate chain.
#[derive(Debug, Clone, PartialEq)]
pub struct PathOrder {
    pub market: Market,
    pub speed: OrderSpeed,
    pub from_currency: Currency,
    pub from_amount: Decimal,
    pub to_amount: Decimal,
}

impl PathOrder {
    pub fn order_type(&self) -> OrderType {
        self.market
            .order_type(&self.from_currency)
            .expect("path order spends a market currency")
    }
}

/// A fully estimated candidate chain.
#[derive(Debug, Clone, PartialEq)]
pub struct ExhaustivePath {
    pub chain: Vec<PathOrder>,
}

impl ExhaustivePath {
    pub fn from_amount(&self) -> Decimal {
        self.chain.first().map(|o| o.from_amount).unwrap_or_default()
    }

    pub fn to_amount(&self) -> Decimal {
        self.chain.last().map(|o| o.to_amount).unwrap_or_default()
    }

    /// Expected profit over the whole chain.
    pub fn profit(&self) -> Decimal {
        self.to_amount() - self.from_amount()
    }

    /// Shape identity shared with live intents: market and speed per step.
    pub fn shape_hash(&self) -> u64 {
        shape_hash(self.chain.iter().map(|o| (&o.market, o.speed)))
    }

    /// Materialize the chain as an intent's step list: the first step is
    /// partially completed with the concrete input, the rest predicted.
    pub fn to_markets(&self) -> Vec<TranIntentMarket> {
        self.chain
            .iter()
            .enumerate()
            .map(|(i, order)| {
                let from_currency_type = order
                    .market
                    .currency_type(&order.from_currency)
                    .expect("path order spends a market currency");
                if i == 0 {
                    TranIntentMarket::PartiallyCompleted {
                        market: order.market.clone(),
                        speed: order.speed,
                        from_currency_type,
                        from_amount: order.from_amount,
                    }
                } else {
                    TranIntentMarket::Predicted {
                        market: order.market.clone(),
                        speed: order.speed,
                        from_currency_type,
                    }
                }
            })
            .collect()
    }
}

/// Path enumeration over the latest book snapshots.
pub struct PathFinder {
    books: BookCache,
    markets: Vec<Market>,
    max_hops: usize,
}

impl PathFinder {
    pub fn new(books: BookCache, markets: Vec<Market>, max_hops: usize) -> Self {
        Self {
            books,
            markets,
            max_hops,
        }
    }

    /// Enumerate candidate chains from `(from, amount)` ending in any of
    /// `ends`, ordered by expected profit descending with a shorter-chain
    /// tie-break. Chains whose shape is already in flight and markets on
    /// the blacklist are excluded.
    pub fn find_paths(
        &self,
        from: &Currency,
        amount: Decimal,
        ends: &HashSet<Currency>,
        blacklist: &HashSet<Market>,
        in_flight: &HashSet<u64>,
    ) -> Vec<ExhaustivePath> {
        let fee = *self.books.fee_stream().borrow();
        let books: HashMap<Market, OrderBook> = self
            .markets
            .iter()
            .filter(|m| !blacklist.contains(m))
            .map(|m| (m.clone(), self.books.subscribe(m).borrow().clone()))
            .collect();

        let mut found = Vec::new();
        let mut visited = HashSet::new();
        visited.insert(from.clone());
        let mut chain = Vec::new();
        self.walk(
            from, amount, ends, &books, fee, &mut visited, &mut chain, &mut found,
        );

        found.retain(|path: &ExhaustivePath| !in_flight.contains(&path.shape_hash()));
        found.sort_by(|a, b| {
            b.profit()
                .cmp(&a.profit())
                .then(a.chain.len().cmp(&b.chain.len()))
        });
        found
    }

    #[allow(clippy::too_many_arguments)]
    fn walk(
        &self,
        current: &Currency,
        amount: Decimal,
        ends: &HashSet<Currency>,
        books: &HashMap<Market, OrderBook>,
        fee: FeeMultiplier,
        visited: &mut HashSet<Currency>,
        chain: &mut Vec<PathOrder>,
        found: &mut Vec<ExhaustivePath>,
    ) {
        if !chain.is_empty() && ends.contains(current) {
            found.push(ExhaustivePath { chain: chain.clone() });
            return;
        }
        if chain.len() >= self.max_hops {
            return;
        }

        for (market, book) in books {
            if !market.contains(current) {
                continue;
            }
            let target = market
                .target_currency(current)
                .expect("market contains current")
                .clone();
            // End currencies are terminal, so stepping back into one is
            // how a cycle closes; any other revisit is pruned.
            if visited.contains(&target) && !ends.contains(&target) {
                continue;
            }
            let order_type = market.order_type(current).expect("market contains current");

            for speed in [OrderSpeed::Instant, OrderSpeed::Delayed] {
                let Some(to_amount) = estimate_step(book, fee, order_type, speed, amount) else {
                    continue;
                };
                if to_amount <= Decimal::ZERO {
                    continue;
                }
                chain.push(PathOrder {
                    market: market.clone(),
                    speed,
                    from_currency: current.clone(),
                    from_amount: amount,
                    to_amount,
                });
                let target_was_new = visited.insert(target.clone());
                self.walk(&target, to_amount, ends, books, fee, visited, chain, found);
                if target_was_new {
                    visited.remove(&target);
                }
                chain.pop();
            }
        }
    }

    /// Expected output of a running intent's tail, starting at the current
    /// step's concrete input, priced against the latest books. `None` when
    /// any step's book cannot absorb the amount.
    pub fn estimate_chain_target(
        &self,
        markets: &[TranIntentMarket],
        idx: usize,
    ) -> Option<Decimal> {
        let fee = *self.books.fee_stream().borrow();
        let mut amount = step_from_amount(markets, idx);
        for step in &markets[idx..] {
            let book = self.books.subscribe(step.market()).borrow().clone();
            amount = estimate_step(&book, fee, step.order_type(), step.speed(), amount)?;
        }
        Some(amount)
    }
}

/// Estimate one step's output against a book snapshot.
///
/// Instant steps walk the taker side level by level at the taker fee.
/// Delayed steps assume a full maker fill at the one-point-better price.
/// Returns `None` when the book cannot absorb the amount.
pub fn estimate_step(
    book: &OrderBook,
    fee: FeeMultiplier,
    order_type: OrderType,
    speed: OrderSpeed,
    from_amount: Decimal,
) -> Option<Decimal> {
    if from_amount <= Decimal::ZERO {
        return None;
    }
    match speed {
        OrderSpeed::Instant => estimate_taker(book, fee.taker, order_type, from_amount),
        OrderSpeed::Delayed => {
            let price = optimal_price(order_type, book, None, false)?;
            match order_type {
                OrderType::Buy => {
                    let quote = quote_amount(from_amount, price);
                    if quote.is_zero() {
                        return None;
                    }
                    Some(round_up(quote * fee.maker))
                }
                OrderType::Sell => Some(round_up(round_down(from_amount * price) * fee.maker)),
            }
        }
    }
}

fn estimate_taker(
    book: &OrderBook,
    taker_fee: Decimal,
    order_type: OrderType,
    from_amount: Decimal,
) -> Option<Decimal> {
    let side = BookSide::taker(order_type);
    let mut remaining = from_amount;
    let mut target = Decimal::ZERO;
    let mut last_price = Decimal::ZERO;

    for (price, size) in book.levels(side) {
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
                target += round_up(quote * taker_fee);
                remaining -= round_down(quote * price);
            }
            OrderType::Sell => {
                let quote = remaining.min(size);
                target += round_up(round_down(quote * price) * taker_fee);
                remaining -= quote;
            }
        }
    }

    // Residue below one tick's worth cannot be traded and is treated as
    // consumed; anything larger means the book was too thin.
    let dust_limit = match order_type {
        OrderType::Buy => PRICE_TICK * last_price.max(Decimal::ONE),
        OrderType::Sell => PRICE_TICK,
    };
    if remaining > dust_limit {
        return None;
    }
    Some(target)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn fee() -> FeeMultiplier {
        FeeMultiplier::new(dec!(0.999), dec!(0.999))
    }

    fn book_with(asks: &[(Decimal, Decimal)], bids: &[(Decimal, Decimal)]) -> OrderBook {
        let mut book = OrderBook::new();
        for (p, s) in asks {
            book.set_level(BookSide::Ask, *p, *s);
        }
        for (p, s) in bids {
            book.set_level(BookSide::Bid, *p, *s);
        }
        book
    }

    #[test]
    fn test_estimate_instant_buy_single_level() {
        let book = book_with(&[(dec!(9000), dec!(1))], &[]);
        let out = estimate_step(&book, fee(), OrderType::Buy, OrderSpeed::Instant, dec!(50));
        // 50 / 9000 = 0.00555555 quote, net of taker fee.
        assert_eq!(out, Some(dec!(0.00555000)));
    }

    #[test]
    fn test_estimate_instant_walks_levels() {
        let book = book_with(&[(dec!(9000), dec!(0.001)), (dec!(9100), dec!(1))], &[]);
        let out = estimate_step(&book, fee(), OrderType::Buy, OrderSpeed::Instant, dec!(18));
        // 0.001 at 9000 costs 9, remaining 9 buys 0.00098901 at 9100.
        let expected = round_up(dec!(0.001) * dec!(0.999)) + round_up(dec!(0.00098901) * dec!(0.999));
        assert_eq!(out, Some(expected));
    }

    #[test]
    fn test_estimate_instant_thin_book_rejected() {
        let book = book_with(&[(dec!(9000), dec!(0.0001))], &[]);
        let out = estimate_step(&book, fee(), OrderType::Buy, OrderSpeed::Instant, dec!(50));
        assert_eq!(out, None);
    }

    #[test]
    fn test_estimate_instant_empty_book_rejected() {
        let book = OrderBook::new();
        assert_eq!(
            estimate_step(&book, fee(), OrderType::Buy, OrderSpeed::Instant, dec!(50)),
            None
        );
    }

    #[test]
    fn test_estimate_delayed_buy_one_point_better() {
        let book = book_with(&[(dec!(9010), dec!(1))], &[(dec!(9000), dec!(1))]);
        let out = estimate_step(&book, fee(), OrderType::Buy, OrderSpeed::Delayed, dec!(50));
        // Maker price 9000.00000001, full fill assumed at maker fee.
        let quote = quote_amount(dec!(50), dec!(9000.00000001));
        assert_eq!(out, Some(round_up(quote * dec!(0.999))));
    }

    #[test]
    fn test_estimate_delayed_sell() {
        let book = book_with(&[(dec!(9010), dec!(1))], &[(dec!(9000), dec!(1))]);
        let out = estimate_step(&book, fee(), OrderType::Sell, OrderSpeed::Delayed, dec!(0.01));
        let expected = round_up(round_down(dec!(0.01) * dec!(9009.99999999)) * dec!(0.999));
        assert_eq!(out, Some(expected));
    }
}
