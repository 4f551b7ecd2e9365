//! Path step model: the tagged `TranIntentMarket` variants and the split
//! and merge operations over whole chains.
//!
//! A chain holds exactly one `PartiallyCompleted` step at the intent's
//! current index; everything before it is `Completed`, everything after it
//! `Predicted`. All amounts derive from the completed steps' trades.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};

use polo_common::{
    from_amount_sum, split_trade, target_amount_sum, AmountType, BareTrade, Currency,
    CurrencyType, Market, OrderSpeed, OrderType,
};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Current serialization version of [`MarketsDoc`].
pub const MARKETS_DOC_VERSION: u32 = 1;

/// One step of a path.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TranIntentMarket {
    /// Not yet reached; its input is the previous step's output.
    Predicted {
        market: Market,
        speed: OrderSpeed,
        from_currency_type: CurrencyType,
    },
    /// Currently executing; owns a concrete input amount.
    PartiallyCompleted {
        market: Market,
        speed: OrderSpeed,
        from_currency_type: CurrencyType,
        from_amount: Decimal,
    },
    /// Finished; amounts derive from its trades.
    Completed {
        market: Market,
        speed: OrderSpeed,
        from_currency_type: CurrencyType,
        trades: Vec<BareTrade>,
    },
}

impl TranIntentMarket {
    pub fn market(&self) -> &Market {
        match self {
            TranIntentMarket::Predicted { market, .. }
            | TranIntentMarket::PartiallyCompleted { market, .. }
            | TranIntentMarket::Completed { market, .. } => market,
        }
    }

    pub fn speed(&self) -> OrderSpeed {
        match self {
            TranIntentMarket::Predicted { speed, .. }
            | TranIntentMarket::PartiallyCompleted { speed, .. }
            | TranIntentMarket::Completed { speed, .. } => *speed,
        }
    }

    pub fn from_currency_type(&self) -> CurrencyType {
        match self {
            TranIntentMarket::Predicted {
                from_currency_type, ..
            }
            | TranIntentMarket::PartiallyCompleted {
                from_currency_type, ..
            }
            | TranIntentMarket::Completed {
                from_currency_type, ..
            } => *from_currency_type,
        }
    }

    /// Spending base buys quote; spending quote sells it.
    pub fn order_type(&self) -> OrderType {
        self.from_currency_type().order_type()
    }

    pub fn from_currency(&self) -> &Currency {
        self.market().currency(self.from_currency_type())
    }

    pub fn target_currency(&self) -> &Currency {
        self.market().currency(self.from_currency_type().opposite())
    }

    pub fn trades(&self) -> &[BareTrade] {
        match self {
            TranIntentMarket::Completed { trades, .. } => trades,
            _ => &[],
        }
    }
}

/// Versioned journal representation of a chain.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MarketsDoc {
    pub version: u32,
    pub market_idx: usize,
    pub steps: Vec<TranIntentMarket>,
}

impl MarketsDoc {
    pub fn new(market_idx: usize, steps: Vec<TranIntentMarket>) -> Self {
        Self {
            version: MARKETS_DOC_VERSION,
            market_idx,
            steps,
        }
    }
}

/// Input amount of a step. Completed steps derive it from their trades;
/// predicted steps inherit the previous step's output.
pub fn step_from_amount(markets: &[TranIntentMarket], idx: usize) -> Decimal {
    match &markets[idx] {
        TranIntentMarket::Completed { trades, .. } => {
            from_amount_sum(markets[idx].order_type(), trades)
        }
        TranIntentMarket::PartiallyCompleted { from_amount, .. } => *from_amount,
        TranIntentMarket::Predicted { .. } => {
            if idx == 0 {
                Decimal::ZERO
            } else {
                step_target_amount(markets, idx - 1)
            }
        }
    }
}

/// Output amount of a completed step; zero for steps still in flight.
pub fn step_target_amount(markets: &[TranIntentMarket], idx: usize) -> Decimal {
    match &markets[idx] {
        TranIntentMarket::Completed { trades, .. } => {
            target_amount_sum(markets[idx].order_type(), trades)
        }
        _ => Decimal::ZERO,
    }
}

/// The intent's initial input: step 0's from amount.
pub fn init_from_amount(markets: &[TranIntentMarket]) -> Decimal {
    step_from_amount(markets, 0)
}

/// Hash of the chain's shape: market and speed of every step. Intents with
/// equal shapes and the same current index are merge candidates.
pub fn markets_shape_hash(markets: &[TranIntentMarket]) -> u64 {
    shape_hash(markets.iter().map(|m| (m.market(), m.speed())))
}

/// Shape hash over any `(market, speed)` sequence; shared with the path
/// finder's in-flight filter.
pub fn shape_hash<'a>(parts: impl Iterator<Item = (&'a Market, OrderSpeed)>) -> u64 {
    let mut hasher = DefaultHasher::new();
    for (market, speed) in parts {
        market.hash(&mut hasher);
        speed.hash(&mut hasher);
    }
    hasher.finish()
}

/// Split a chain at step `idx` around `trades` executed there.
///
/// Returns `(remaining, committed)`:
/// - `committed` owns `trades` as a new `Completed` step at `idx` and, when
///   a next step exists, a fresh `PartiallyCompleted` there fed by the
///   trades' target amount. Each preceding completed step is re-packed so
///   its output equals the next committed step's input, splitting a
///   straddling trade via the amount calculator.
/// - `remaining` keeps the leftover: the step at `idx` stays
///   `PartiallyCompleted` with its input reduced by the trades' from
///   amount, and preceding steps keep the unpacked trades.
///
/// Rounding residue from re-packing is reconciled with at most one
/// adjustment trade per residue, so both lists independently conserve
/// amounts and together equal the original.
pub fn split_markets(
    markets: &[TranIntentMarket],
    idx: usize,
    trades: &[BareTrade],
) -> (Vec<TranIntentMarket>, Vec<TranIntentMarket>) {
    let step = &markets[idx];
    let order_type = step.order_type();
    let trades_from = from_amount_sum(order_type, trades);
    let trades_target = target_amount_sum(order_type, trades);

    let mut committed = markets.to_vec();
    let mut remaining = markets.to_vec();

    committed[idx] = TranIntentMarket::Completed {
        market: step.market().clone(),
        speed: step.speed(),
        from_currency_type: step.from_currency_type(),
        trades: trades.to_vec(),
    };
    if idx + 1 < markets.len() {
        let next = &markets[idx + 1];
        committed[idx + 1] = TranIntentMarket::PartiallyCompleted {
            market: next.market().clone(),
            speed: next.speed(),
            from_currency_type: next.from_currency_type(),
            from_amount: trades_target,
        };
    }

    let prev_from = step_from_amount(markets, idx);
    remaining[idx] = TranIntentMarket::PartiallyCompleted {
        market: step.market().clone(),
        speed: step.speed(),
        from_currency_type: step.from_currency_type(),
        from_amount: prev_from - trades_from,
    };

    // Re-pack each preceding completed step so that committed[i].target
    // equals committed[i + 1].from, walking backwards from the cut.
    let mut needed = trades_from;
    for i in (0..idx).rev() {
        let step_i = &markets[i];
        let ot = step_i.order_type();
        let mut committed_trades: Vec<BareTrade> = Vec::new();
        let mut remaining_trades: Vec<BareTrade> = Vec::new();
        let mut still_needed = needed;

        for trade in step_i.trades() {
            let contributes = polo_common::target_amount(ot, trade);
            if still_needed.is_zero() {
                remaining_trades.push(*trade);
            } else if contributes <= still_needed {
                committed_trades.push(*trade);
                still_needed -= contributes;
            } else {
                let split = split_trade(trade, AmountType::Target, ot, still_needed);
                committed_trades.extend(split.target);
                remaining_trades.extend(split.remainder);
                still_needed = Decimal::ZERO;
            }
        }

        // Rounding residue: keep both halves' targets summing to the
        // original by compensating symmetrically.
        if !still_needed.is_zero() {
            committed_trades.push(BareTrade::adjust_target(still_needed, ot));
            remaining_trades.push(BareTrade::adjust_target(-still_needed, ot));
        }

        needed = from_amount_sum(ot, &committed_trades);

        committed[i] = TranIntentMarket::Completed {
            market: step_i.market().clone(),
            speed: step_i.speed(),
            from_currency_type: step_i.from_currency_type(),
            trades: committed_trades,
        };
        remaining[i] = TranIntentMarket::Completed {
            market: step_i.market().clone(),
            speed: step_i.speed(),
            from_currency_type: step_i.from_currency_type(),
            trades: remaining_trades,
        };
    }

    (remaining, committed)
}

/// Merge `(init_delta, current_delta)` into a chain at step `idx`.
///
/// Appends a synthetic `adjust_from(init_delta)` trade to step 0 and an
/// `adjust_target(current_delta)` trade to step `idx - 1`, then raises step
/// `idx`'s input to the recomputed previous-step output. At step 0 the two
/// deltas coincide and the partially-completed input simply grows.
pub fn merge_markets(
    markets: &[TranIntentMarket],
    idx: usize,
    init_delta: Decimal,
    current_delta: Decimal,
) -> Vec<TranIntentMarket> {
    let mut merged = markets.to_vec();

    if idx == 0 {
        if let TranIntentMarket::PartiallyCompleted { from_amount, .. } = &mut merged[0] {
            *from_amount += current_delta;
        }
        return merged;
    }

    if let TranIntentMarket::Completed { trades, .. } = &mut merged[0] {
        trades.push(BareTrade::adjust_from(init_delta));
    }
    let prev_order_type = merged[idx - 1].order_type();
    if let TranIntentMarket::Completed { trades, .. } = &mut merged[idx - 1] {
        trades.push(BareTrade::adjust_target(current_delta, prev_order_type));
    }
    let new_from = step_target_amount(&merged, idx - 1);
    if let TranIntentMarket::PartiallyCompleted { from_amount, .. } = &mut merged[idx] {
        *from_amount = new_from;
    }

    merged
}

#[cfg(test)]
mod tests {
    use super::*;
    use polo_common::target_amount;
    use rust_decimal_macros::dec;

    fn predicted(base: &str, quote: &str, speed: OrderSpeed, from: CurrencyType) -> TranIntentMarket {
        TranIntentMarket::Predicted {
            market: Market::of(base, quote),
            speed,
            from_currency_type: from,
        }
    }

    /// USDT -> BTC -> ETH chain: step 0 completed, step 1 executing.
    fn two_step_chain() -> Vec<TranIntentMarket> {
        let step0_trades = vec![BareTrade::new(dec!(0.00555555), dec!(9000), dec!(0.999))];
        let step0_target = target_amount_sum(OrderType::Buy, &step0_trades);
        vec![
            TranIntentMarket::Completed {
                market: Market::of("USDT", "BTC"),
                speed: OrderSpeed::Instant,
                from_currency_type: CurrencyType::Base,
                trades: step0_trades,
            },
            TranIntentMarket::PartiallyCompleted {
                market: Market::of("BTC", "ETH"),
                speed: OrderSpeed::Delayed,
                from_currency_type: CurrencyType::Base,
                from_amount: step0_target,
            },
        ]
    }

    #[test]
    fn test_step_accessors() {
        let chain = two_step_chain();
        assert_eq!(chain[0].order_type(), OrderType::Buy);
        assert_eq!(chain[0].from_currency(), &Currency::from("USDT"));
        assert_eq!(chain[0].target_currency(), &Currency::from("BTC"));
        assert_eq!(step_from_amount(&chain, 0), dec!(49.99995));
        assert_eq!(step_target_amount(&chain, 0), dec!(0.00555000));
        assert_eq!(step_from_amount(&chain, 1), dec!(0.00555000));
    }

    #[test]
    fn test_shape_hash_ignores_amounts() {
        let chain = two_step_chain();
        let (remaining, committed) = split_markets(
            &chain,
            1,
            &[BareTrade::new(dec!(0.01), dec!(0.05), dec!(0.999))],
        );
        assert_eq!(markets_shape_hash(&chain), markets_shape_hash(&remaining));
        assert_eq!(markets_shape_hash(&chain), markets_shape_hash(&committed));

        let other = vec![
            predicted("USDT", "BTC", OrderSpeed::Instant, CurrencyType::Base),
            predicted("BTC", "ETH", OrderSpeed::Instant, CurrencyType::Base),
        ];
        assert_ne!(markets_shape_hash(&chain), markets_shape_hash(&other));
    }

    #[test]
    fn test_markets_doc_round_trip() {
        let doc = MarketsDoc::new(1, two_step_chain());
        let json = serde_json::to_string(&doc).unwrap();
        let back: MarketsDoc = serde_json::from_str(&json).unwrap();
        assert_eq!(doc, back);
        assert!(json.contains("\"kind\":\"completed\""));
        assert!(json.contains("\"version\":1"));
    }

    #[test]
    fn test_split_markets_conserves_amounts() {
        let chain = two_step_chain();
        // Partially fill step 1: 0.002 of the 0.00555 BTC traded for ETH.
        let fill = BareTrade::new(dec!(0.04), dec!(0.05), dec!(0.999));
        assert_eq!(from_amount_sum(OrderType::Buy, &[fill]), dec!(0.002));

        let (remaining, committed) = split_markets(&chain, 1, &[fill]);

        // Step-1 inputs add back up.
        assert_eq!(
            step_from_amount(&remaining, 1) + step_from_amount(&committed, 1),
            step_from_amount(&chain, 1)
        );
        // Step-0 totals split exactly.
        assert_eq!(
            step_from_amount(&remaining, 0) + step_from_amount(&committed, 0),
            step_from_amount(&chain, 0)
        );
        assert_eq!(
            step_target_amount(&remaining, 0) + step_target_amount(&committed, 0),
            step_target_amount(&chain, 0)
        );
        // Committed is internally consistent: step 0 output feeds step 1.
        assert_eq!(
            step_target_amount(&committed, 0),
            step_from_amount(&committed, 1)
        );
        // Remaining still executes step 1 with the leftover input.
        assert_eq!(step_from_amount(&remaining, 1), dec!(0.00355000));
    }

    #[test]
    fn test_split_markets_full_fill_leaves_zero_remaining() {
        let chain = two_step_chain();
        let from = step_from_amount(&chain, 1);
        // One trade consuming the entire step input.
        let quote = polo_common::quote_amount(from, dec!(0.05));
        let fill = BareTrade::new(quote, dec!(0.05), dec!(0.999));

        let (remaining, committed) = split_markets(&chain, 1, &[fill]);
        let leftover = step_from_amount(&remaining, 1);
        assert!(leftover >= Decimal::ZERO);
        assert!(leftover < dec!(0.0000001));
        assert!(matches!(
            committed[1],
            TranIntentMarket::Completed { .. }
        ));
    }

    #[test]
    fn test_split_markets_straddling_trade_is_cut() {
        // Step 0 completed with two trades; commit an amount that lands
        // inside the second trade.
        let trades = vec![
            BareTrade::new(dec!(0.003), dec!(9000), dec!(0.999)),
            BareTrade::new(dec!(0.004), dec!(9000), dec!(0.999)),
        ];
        let target0 = target_amount_sum(OrderType::Buy, &trades);
        let chain = vec![
            TranIntentMarket::Completed {
                market: Market::of("USDT", "BTC"),
                speed: OrderSpeed::Instant,
                from_currency_type: CurrencyType::Base,
                trades,
            },
            TranIntentMarket::PartiallyCompleted {
                market: Market::of("BTC", "ETH"),
                speed: OrderSpeed::Delayed,
                from_currency_type: CurrencyType::Base,
                from_amount: target0,
            },
        ];

        // Consume ~0.004 BTC on step 1, more than trade 0's target alone.
        let fill = BareTrade::new(dec!(0.08), dec!(0.05), dec!(0.999));
        let (remaining, committed) = split_markets(&chain, 1, &[fill]);

        assert!(committed[0].trades().len() >= 2, "straddle splits trade 1");
        assert_eq!(
            step_target_amount(&remaining, 0) + step_target_amount(&committed, 0),
            target0
        );
        let diff = step_target_amount(&committed, 0) - step_from_amount(&committed, 1);
        assert_eq!(diff, Decimal::ZERO);
    }

    #[test]
    fn test_merge_markets_at_current_step_zero() {
        let chain = vec![
            TranIntentMarket::PartiallyCompleted {
                market: Market::of("USDT", "BTC"),
                speed: OrderSpeed::Delayed,
                from_currency_type: CurrencyType::Base,
                from_amount: dec!(10),
            },
            predicted("BTC", "ETH", OrderSpeed::Delayed, CurrencyType::Base),
        ];
        let merged = merge_markets(&chain, 0, dec!(3.7), dec!(3.7));
        assert_eq!(step_from_amount(&merged, 0), dec!(13.7));
    }

    #[test]
    fn test_merge_markets_mid_chain_appends_adjustments() {
        let chain = two_step_chain();
        let before_init = init_from_amount(&chain);
        let before_target0 = step_target_amount(&chain, 0);

        let merged = merge_markets(&chain, 1, dec!(5), dec!(0.0007));

        assert_eq!(init_from_amount(&merged), before_init + dec!(5));
        assert_eq!(step_target_amount(&merged, 0), before_target0 + dec!(0.0007));
        // Step 1's input follows step 0's new output.
        assert_eq!(step_from_amount(&merged, 1), step_target_amount(&merged, 0));
        assert_eq!(merged[0].trades().len(), 3);
    }

    #[test]
    fn test_merge_commutativity_bounded() {
        let chain = two_step_chain();
        let sequential = merge_markets(
            &merge_markets(&chain, 1, dec!(2), dec!(0.0002)),
            1,
            dec!(3),
            dec!(0.0003),
        );
        let combined = merge_markets(&chain, 1, dec!(5), dec!(0.0005));

        assert_eq!(init_from_amount(&sequential), init_from_amount(&combined));
        assert_eq!(
            step_from_amount(&sequential, 1),
            step_from_amount(&combined, 1)
        );
        assert_eq!(
            step_target_amount(&sequential, 0),
            step_target_amount(&combined, 0)
        );
    }

    #[test]
    fn test_adjustment_trade_amounts() {
        // A price-zero trade is a legal adjustment contributing only to the
        // target side.
        let adj = BareTrade::adjust_target(dec!(0.5), OrderType::Sell);
        assert_eq!(polo_common::from_amount(OrderType::Sell, &adj), Decimal::ZERO);
        assert_eq!(target_amount(OrderType::Sell, &adj), dec!(0.5));
    }
}
