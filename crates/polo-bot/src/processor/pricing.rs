//! Maker pricing policy: one point better unless alone.
//!
//! The processor quotes one tick inside the best level of its own side,
//! falling back to a tie with the front when a tick inside would cross the
//! spread. When the order already owns the front of the book it stays put,
//! except that a gap-fix heuristic periodically relaxes the price back to
//! one tick inside the second-best level so the order does not sit across
//! a pointless gap.

use polo_common::{OrderType, PRICE_TICK};
use polo_exchange::{BookSide, OrderBook};
use rust_decimal::Decimal;
use tokio::time::Instant;

/// Book changes the gap-fix heuristic waits for before firing.
const GAP_FIX_CHANGES: u32 = 10;

/// Time the gap-fix heuristic waits for before firing.
const GAP_FIX_AFTER: std::time::Duration = std::time::Duration::from_secs(4);

/// Compute where the order should sit, given the current book and our own
/// resting order as `(price, quote_amount)`. Returns `None` when the order
/// is already positioned correctly. With no own order, returns the entry
/// price, or `None` when both sides of the book are empty.
pub fn optimal_price(
    order_type: OrderType,
    book: &OrderBook,
    own: Option<(Decimal, Decimal)>,
    gap_fix: bool,
) -> Option<Decimal> {
    let primary = BookSide::maker(order_type);
    let secondary = primary.opposite();

    let step = |price: Decimal| match order_type {
        OrderType::Buy => price + PRICE_TICK,
        OrderType::Sell => price - PRICE_TICK,
    };

    let Some((best_price, best_qty)) = book.best(primary) else {
        // Own side empty: enter one tick inside the opposite side, or
        // nowhere when the whole book is empty.
        let (secondary_best, _) = book.best(secondary)?;
        let entry = match order_type {
            OrderType::Buy => secondary_best - PRICE_TICK,
            OrderType::Sell => secondary_best + PRICE_TICK,
        };
        return match own {
            Some((own_price, _)) if own_price == entry => None,
            _ => Some(entry),
        };
    };

    let mut one_better = step(best_price);
    if let Some((secondary_best, _)) = book.best(secondary) {
        if secondary_best == one_better {
            // A tick inside would cross: tie with the front instead.
            one_better = best_price;
        }
    }

    let Some((own_price, own_qty)) = own else {
        return Some(one_better);
    };

    let behind_best = match order_type {
        OrderType::Buy => own_price < best_price,
        OrderType::Sell => own_price > best_price,
    };
    if behind_best {
        return Some(one_better);
    }

    if own_price == best_price && own_qty < best_qty {
        // Sharing the front level behind earlier orders: second position.
        return Some(one_better);
    }

    // We are the front of the book.
    if gap_fix {
        if let Some((second_price, _)) = book.second_best(primary) {
            let relaxed = step(second_price);
            if relaxed != own_price {
                return Some(relaxed);
            }
        }
    }
    None
}

/// Tracks when the gap-fix heuristic should fire: after a burst of book
/// changes or a quiet interval since the last reposition.
#[derive(Debug)]
pub struct GapTracker {
    changes: u32,
    last_reposition: Instant,
}

impl Default for GapTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl GapTracker {
    pub fn new() -> Self {
        Self {
            changes: 0,
            last_reposition: Instant::now(),
        }
    }

    pub fn note_book_change(&mut self) {
        self.changes = self.changes.saturating_add(1);
    }

    pub fn should_fix(&self) -> bool {
        self.changes >= GAP_FIX_CHANGES || self.last_reposition.elapsed() >= GAP_FIX_AFTER
    }

    pub fn reset(&mut self) {
        self.changes = 0;
        self.last_reposition = Instant::now();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn book(asks: &[(Decimal, Decimal)], bids: &[(Decimal, Decimal)]) -> OrderBook {
        let mut b = OrderBook::new();
        for (p, s) in asks {
            b.set_level(BookSide::Ask, *p, *s);
        }
        for (p, s) in bids {
            b.set_level(BookSide::Bid, *p, *s);
        }
        b
    }

    #[test]
    fn test_entry_price_is_one_tick_better() {
        let b = book(&[(dec!(9010), dec!(1))], &[(dec!(9000), dec!(1))]);
        assert_eq!(
            optimal_price(OrderType::Buy, &b, None, false),
            Some(dec!(9000.00000001))
        );
        assert_eq!(
            optimal_price(OrderType::Sell, &b, None, false),
            Some(dec!(9009.99999999))
        );
    }

    #[test]
    fn test_tick_that_would_cross_ties_with_front() {
        // Spread of exactly one tick: bid 9000, ask 9000.00000001.
        let b = book(
            &[(dec!(9000.00000001), dec!(1))],
            &[(dec!(9000), dec!(1))],
        );
        assert_eq!(
            optimal_price(OrderType::Buy, &b, None, false),
            Some(dec!(9000))
        );
    }

    #[test]
    fn test_front_position_does_not_move() {
        let b = book(
            &[(dec!(9010), dec!(1))],
            &[(dec!(9000.00000001), dec!(0.5)), (dec!(9000), dec!(1))],
        );
        // Our order IS the 9000.00000001 level.
        let own = Some((dec!(9000.00000001), dec!(0.5)));
        assert_eq!(optimal_price(OrderType::Buy, &b, own, false), None);
    }

    #[test]
    fn test_second_position_on_shared_level_repositions() {
        let b = book(&[(dec!(9010), dec!(1))], &[(dec!(9000), dec!(1.5))]);
        // Our 0.5 shares the 9000 level with someone else's 1.0.
        let own = Some((dec!(9000), dec!(0.5)));
        assert_eq!(
            optimal_price(OrderType::Buy, &b, own, false),
            Some(dec!(9000.00000001))
        );
    }

    #[test]
    fn test_behind_best_repositions() {
        let b = book(&[(dec!(9010), dec!(1))], &[(dec!(9000), dec!(1))]);
        let own = Some((dec!(8990), dec!(0.5)));
        assert_eq!(
            optimal_price(OrderType::Buy, &b, own, false),
            Some(dec!(9000.00000001))
        );
    }

    #[test]
    fn test_gap_fix_relaxes_to_one_tick_inside_second() {
        // We sit alone at 9005 while the next bid is far below at 9000.
        let b = book(&[(dec!(9010), dec!(1))], &[(dec!(9005), dec!(0.5)), (dec!(9000), dec!(1))]);
        let own = Some((dec!(9005), dec!(0.5)));
        assert_eq!(optimal_price(OrderType::Buy, &b, own, false), None);
        assert_eq!(
            optimal_price(OrderType::Buy, &b, own, true),
            Some(dec!(9000.00000001))
        );
    }

    #[test]
    fn test_gap_fix_idle_when_tight() {
        // Already one tick inside the second-best: nothing to fix.
        let b = book(
            &[(dec!(9010), dec!(1))],
            &[(dec!(9000.00000001), dec!(0.5)), (dec!(9000), dec!(1))],
        );
        let own = Some((dec!(9000.00000001), dec!(0.5)));
        assert_eq!(optimal_price(OrderType::Buy, &b, own, true), None);
    }

    #[test]
    fn test_empty_primary_side_enters_inside_secondary() {
        let b = book(&[(dec!(9010), dec!(1))], &[]);
        assert_eq!(
            optimal_price(OrderType::Buy, &b, None, false),
            Some(dec!(9009.99999999))
        );
        assert_eq!(optimal_price(OrderType::Buy, &OrderBook::new(), None, false), None);
    }

    #[test]
    fn test_gap_tracker_fires_on_change_burst() {
        let mut tracker = GapTracker::new();
        assert!(!tracker.should_fix());
        for _ in 0..GAP_FIX_CHANGES {
            tracker.note_book_change();
        }
        assert!(tracker.should_fix());
        tracker.reset();
        assert!(!tracker.should_fix());
    }
}
