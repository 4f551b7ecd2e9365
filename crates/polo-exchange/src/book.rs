//! In-memory order book state.
//!
//! Two sorted price -> size maps. Asks iterate best-first in ascending key
//! order; bids are stored ascending and iterated in reverse. Consumers only
//! ever see snapshots cloned out of the cache's latest-value channel.

use std::collections::BTreeMap;

use polo_common::OrderType;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::types::BookUpdate;

/// Which side of the book a level belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BookSide {
    Ask,
    Bid,
}

impl BookSide {
    /// The side a maker order of the given type rests on.
    pub fn maker(order_type: OrderType) -> Self {
        match order_type {
            OrderType::Buy => BookSide::Bid,
            OrderType::Sell => BookSide::Ask,
        }
    }

    /// The side a taker order of the given type consumes.
    pub fn taker(order_type: OrderType) -> Self {
        match order_type {
            OrderType::Buy => BookSide::Ask,
            OrderType::Sell => BookSide::Bid,
        }
    }

    pub fn opposite(self) -> Self {
        match self {
            BookSide::Ask => BookSide::Bid,
            BookSide::Bid => BookSide::Ask,
        }
    }
}

/// Aggregated order book for one market.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OrderBook {
    /// Offers to sell quote; best is the lowest price.
    pub asks: BTreeMap<Decimal, Decimal>,
    /// Offers to buy quote; best is the highest price.
    pub bids: BTreeMap<Decimal, Decimal>,
}

impl OrderBook {
    pub fn new() -> Self {
        Self::default()
    }

    fn side(&self, side: BookSide) -> &BTreeMap<Decimal, Decimal> {
        match side {
            BookSide::Ask => &self.asks,
            BookSide::Bid => &self.bids,
        }
    }

    fn side_mut(&mut self, side: BookSide) -> &mut BTreeMap<Decimal, Decimal> {
        match side {
            BookSide::Ask => &mut self.asks,
            BookSide::Bid => &mut self.bids,
        }
    }

    /// Apply one stream message.
    pub fn apply(&mut self, update: &BookUpdate) {
        match update {
            BookUpdate::Snapshot(book) => *self = book.clone(),
            BookUpdate::Delta { side, price, size } => {
                let levels = self.side_mut(*side);
                if size.is_zero() {
                    levels.remove(price);
                } else {
                    levels.insert(*price, *size);
                }
            }
        }
    }

    /// Set one level directly; zero size removes it.
    pub fn set_level(&mut self, side: BookSide, price: Decimal, size: Decimal) {
        let levels = self.side_mut(side);
        if size.is_zero() {
            levels.remove(&price);
        } else {
            levels.insert(price, size);
        }
    }

    /// Best (price, size) on a side, if any.
    pub fn best(&self, side: BookSide) -> Option<(Decimal, Decimal)> {
        match side {
            BookSide::Ask => self.asks.iter().next().map(|(p, s)| (*p, *s)),
            BookSide::Bid => self.bids.iter().next_back().map(|(p, s)| (*p, *s)),
        }
    }

    /// Second-best (price, size) on a side, if any.
    pub fn second_best(&self, side: BookSide) -> Option<(Decimal, Decimal)> {
        match side {
            BookSide::Ask => self.asks.iter().nth(1).map(|(p, s)| (*p, *s)),
            BookSide::Bid => self.bids.iter().rev().nth(1).map(|(p, s)| (*p, *s)),
        }
    }

    /// Levels of a side, best first.
    pub fn levels(&self, side: BookSide) -> Vec<(Decimal, Decimal)> {
        match side {
            BookSide::Ask => self.asks.iter().map(|(p, s)| (*p, *s)).collect(),
            BookSide::Bid => self.bids.iter().rev().map(|(p, s)| (*p, *s)).collect(),
        }
    }

    pub fn side_is_empty(&self, side: BookSide) -> bool {
        self.side(side).is_empty()
    }

    pub fn is_empty(&self) -> bool {
        self.asks.is_empty() && self.bids.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn seeded() -> OrderBook {
        let mut book = OrderBook::new();
        book.set_level(BookSide::Ask, dec!(9010), dec!(1.5));
        book.set_level(BookSide::Ask, dec!(9005), dec!(0.5));
        book.set_level(BookSide::Bid, dec!(9000), dec!(2));
        book.set_level(BookSide::Bid, dec!(8990), dec!(4));
        book
    }

    #[test]
    fn test_best_is_lowest_ask_highest_bid() {
        let book = seeded();
        assert_eq!(book.best(BookSide::Ask), Some((dec!(9005), dec!(0.5))));
        assert_eq!(book.best(BookSide::Bid), Some((dec!(9000), dec!(2))));
    }

    #[test]
    fn test_second_best() {
        let book = seeded();
        assert_eq!(book.second_best(BookSide::Ask), Some((dec!(9010), dec!(1.5))));
        assert_eq!(book.second_best(BookSide::Bid), Some((dec!(8990), dec!(4))));
        assert_eq!(OrderBook::new().second_best(BookSide::Ask), None);
    }

    #[test]
    fn test_levels_best_first() {
        let book = seeded();
        let bids = book.levels(BookSide::Bid);
        assert_eq!(bids[0].0, dec!(9000));
        assert_eq!(bids[1].0, dec!(8990));
        let asks = book.levels(BookSide::Ask);
        assert_eq!(asks[0].0, dec!(9005));
    }

    #[test]
    fn test_apply_delta_insert_and_remove() {
        let mut book = seeded();
        book.apply(&BookUpdate::Delta {
            side: BookSide::Bid,
            price: dec!(9001),
            size: dec!(1),
        });
        assert_eq!(book.best(BookSide::Bid), Some((dec!(9001), dec!(1))));

        book.apply(&BookUpdate::Delta {
            side: BookSide::Bid,
            price: dec!(9001),
            size: dec!(0),
        });
        assert_eq!(book.best(BookSide::Bid), Some((dec!(9000), dec!(2))));
    }

    #[test]
    fn test_apply_snapshot_replaces() {
        let mut book = seeded();
        let mut replacement = OrderBook::new();
        replacement.set_level(BookSide::Ask, dec!(100), dec!(1));
        book.apply(&BookUpdate::Snapshot(replacement.clone()));
        assert_eq!(book, replacement);
    }

    #[test]
    fn test_maker_taker_sides() {
        use polo_common::OrderType;
        assert_eq!(BookSide::maker(OrderType::Buy), BookSide::Bid);
        assert_eq!(BookSide::taker(OrderType::Buy), BookSide::Ask);
        assert_eq!(BookSide::maker(OrderType::Sell), BookSide::Ask);
        assert_eq!(BookSide::taker(OrderType::Sell), BookSide::Bid);
    }
}
