//! Shared domain types for the Poloniex arbitrage bot.
//!
//! CRITICAL: All prices and amounts use `rust_decimal::Decimal` at a fixed
//! 8-decimal scale. NEVER use f64 for financial math.

pub mod amount;
pub mod types;

pub use amount::{
    from_amount, from_amount_sum, quote_amount, round_down, round_up, split_trade, target_amount,
    target_amount_sum, AmountType, BareTrade, FeeMultiplier, SplitTradeResult, AMOUNT_SCALE,
    PRICE_TICK,
};
pub use types::{Currency, CurrencyType, Market, MarketParseError, OrderSpeed, OrderType};
