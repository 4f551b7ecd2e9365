//! Exact base/quote/fee arithmetic at fixed 8-decimal scale.
//!
//! Every amount in the engine derives deterministically from `BareTrade`
//! records through the functions in this module. Rounding is explicit:
//! `round_down` truncates toward zero, `round_up` rounds away from zero,
//! both to 8 decimals. The rounding direction per formula is part of the
//! accounting contract and must not change.

use rust_decimal::{Decimal, RoundingStrategy};
use serde::{Deserialize, Serialize};

use crate::types::OrderType;

/// Fixed decimal scale of all persisted amounts.
pub const AMOUNT_SCALE: u32 = 8;

/// One price tick: 1e-8.
pub const PRICE_TICK: Decimal = Decimal::from_parts(1, 0, 0, false, 8);

/// Round to 8 decimals toward zero.
pub fn round_down(value: Decimal) -> Decimal {
    value.round_dp_with_strategy(AMOUNT_SCALE, RoundingStrategy::ToZero)
}

/// Round to 8 decimals away from zero.
pub fn round_up(value: Decimal) -> Decimal {
    value.round_dp_with_strategy(AMOUNT_SCALE, RoundingStrategy::AwayFromZero)
}

/// Maker/taker fee multipliers, each `1 - fee_rate` at 8-decimal scale.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeeMultiplier {
    pub maker: Decimal,
    pub taker: Decimal,
}

impl FeeMultiplier {
    pub fn new(maker: Decimal, taker: Decimal) -> Self {
        Self { maker, taker }
    }
}

/// The only persisted trade artifact: `(quote_amount, price, fee_multiplier)`.
///
/// All derived amounts recompute from these three fields. Trades with
/// `price == 0` are synthetic adjustment records that carry only a target
/// amount; trades with `fee_multiplier == 0` and `price == 1` carry only a
/// from amount (see [`BareTrade::adjust_from`] and
/// [`BareTrade::adjust_target`]).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BareTrade {
    pub quote_amount: Decimal,
    pub price: Decimal,
    pub fee_multiplier: Decimal,
}

impl BareTrade {
    pub fn new(quote_amount: Decimal, price: Decimal, fee_multiplier: Decimal) -> Self {
        Self {
            quote_amount,
            price,
            fee_multiplier,
        }
    }

    /// Synthetic trade contributing `amount` to the from side and nothing
    /// to the target side, for either order type.
    pub fn adjust_from(amount: Decimal) -> Self {
        Self::new(amount, Decimal::ONE, Decimal::ZERO)
    }

    /// Synthetic trade contributing `amount` to the target side and nothing
    /// to the from side.
    ///
    /// The body differs per order type so that the generic amount formulas
    /// stay consistent where they apply: Buy targets scale by the fee
    /// multiplier, so it must be 1; Sell targets scale by the price, which
    /// is already 0.
    pub fn adjust_target(amount: Decimal, order_type: OrderType) -> Self {
        match order_type {
            OrderType::Buy => Self::new(amount, Decimal::ZERO, Decimal::ONE),
            OrderType::Sell => Self::new(amount, Decimal::ZERO, Decimal::ZERO),
        }
    }

    /// True for synthetic adjustment trades that carry only a target amount.
    pub fn is_target_adjustment(&self) -> bool {
        self.price.is_zero()
    }
}

/// Which of a trade's two derived amounts an operation refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AmountType {
    From,
    Target,
}

/// Amount of the spent currency represented by a trade.
///
/// Buy spends base: `round_down(quote * price)`. Sell spends quote: the
/// quote amount itself. Price-zero adjustment trades spend nothing.
pub fn from_amount(order_type: OrderType, trade: &BareTrade) -> Decimal {
    if trade.is_target_adjustment() {
        return Decimal::ZERO;
    }
    match order_type {
        OrderType::Buy => round_down(trade.quote_amount * trade.price),
        OrderType::Sell => trade.quote_amount,
    }
}

/// Amount of the received currency represented by a trade.
///
/// Buy receives quote net of fee: `round_up(quote * fee)`. Sell receives
/// base: `round_up(round_down(quote * price) * fee)`. Price-zero adjustment
/// trades contribute their full quote amount.
pub fn target_amount(order_type: OrderType, trade: &BareTrade) -> Decimal {
    if trade.is_target_adjustment() {
        return trade.quote_amount;
    }
    match order_type {
        OrderType::Buy => round_up(trade.quote_amount * trade.fee_multiplier),
        OrderType::Sell => {
            round_up(round_down(trade.quote_amount * trade.price) * trade.fee_multiplier)
        }
    }
}

/// Order quantity in quote units purchasable with `base_amount` at `price`.
pub fn quote_amount(base_amount: Decimal, price: Decimal) -> Decimal {
    round_down(base_amount / price)
}

/// Result of splitting one trade at a cut amount.
///
/// `target` is the portion matching the requested cut; `remainder` is the
/// rest. Either side may carry trailing adjustment trades reconciling the
/// sub-1e-8 rounding residue so that the from and target sums of both sides
/// together equal the original trade's exactly.
#[derive(Debug, Clone, PartialEq)]
pub struct SplitTradeResult {
    pub target: Vec<BareTrade>,
    pub remainder: Vec<BareTrade>,
}

/// Split `trade` into a portion whose `amount_type` amount is as close as
/// possible to `cut` and a remainder.
///
/// Both halves keep the original price and fee. Rounding residue between
/// the halves and the original is reconciled by appending at most one
/// `adjust_from` and one `adjust_target` trade to the remainder.
pub fn split_trade(
    trade: &BareTrade,
    amount_type: AmountType,
    order_type: OrderType,
    cut: Decimal,
) -> SplitTradeResult {
    let cut_quote = if trade.is_target_adjustment() {
        // Target-only adjustment: quote IS the target amount, from is zero.
        match amount_type {
            AmountType::From => Decimal::ZERO,
            AmountType::Target => cut,
        }
    } else if trade.fee_multiplier.is_zero() && amount_type == AmountType::Target {
        // From-only adjustment contributes no target amount.
        Decimal::ZERO
    } else {
        match (amount_type, order_type) {
            // from_buy = round_down(q * p)  =>  q ~ cut / p
            (AmountType::From, OrderType::Buy) => round_down(cut / trade.price),
            // from_sell = q
            (AmountType::From, OrderType::Sell) => cut,
            // target_buy = round_up(q * fee)  =>  q ~ cut / fee
            (AmountType::Target, OrderType::Buy) => round_down(cut / trade.fee_multiplier),
            // target_sell = round_up(round_down(q * p) * fee)  =>  q ~ cut / fee / p
            (AmountType::Target, OrderType::Sell) => {
                round_down(cut / trade.fee_multiplier / trade.price)
            }
        }
    };
    let cut_quote = cut_quote.min(trade.quote_amount).max(Decimal::ZERO);

    let target = BareTrade::new(cut_quote, trade.price, trade.fee_multiplier);
    let remainder = BareTrade::new(
        trade.quote_amount - cut_quote,
        trade.price,
        trade.fee_multiplier,
    );

    let from_residue = from_amount(order_type, trade)
        - from_amount(order_type, &target)
        - from_amount(order_type, &remainder);
    let target_residue = target_amount(order_type, trade)
        - target_amount(order_type, &target)
        - target_amount(order_type, &remainder);

    let mut remainder_trades = vec![remainder];
    if !from_residue.is_zero() {
        remainder_trades.push(BareTrade::adjust_from(from_residue));
    }
    if !target_residue.is_zero() {
        remainder_trades.push(BareTrade::adjust_target(target_residue, order_type));
    }

    SplitTradeResult {
        target: vec![target],
        remainder: remainder_trades,
    }
}

/// Sum of from amounts over a trade list.
pub fn from_amount_sum(order_type: OrderType, trades: &[BareTrade]) -> Decimal {
    trades.iter().map(|t| from_amount(order_type, t)).sum()
}

/// Sum of target amounts over a trade list.
pub fn target_amount_sum(order_type: OrderType, trades: &[BareTrade]) -> Decimal {
    trades.iter().map(|t| target_amount(order_type, t)).sum()
}
