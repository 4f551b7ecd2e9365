//! Exchange error taxonomy.
//!
//! The processor and instant-executor state machines match these variants
//! by name; the SDK maps raw API error strings and network failures onto
//! them before they reach the engine.

use rust_decimal::Decimal;
use thiserror::Error;

/// Errors surfaced by the exchange SDK.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ExchangeError {
    #[error("unable to fill order completely")]
    UnableToFillOrder,

    #[error("transaction failed, try again")]
    TransactionFailed,

    #[error("order is either completed or does not exist")]
    OrderCompletedOrNotExist,

    #[error("invalid order number")]
    InvalidOrderNumber,

    #[error("not enough {0}")]
    NotEnoughCrypto(String),

    #[error("amount must be at least {0}")]
    AmountMustBeAtLeast(Decimal),

    #[error("total must be at least {0}")]
    TotalMustBeAtLeast(Decimal),

    #[error("rate must be less than {0}")]
    RateMustBeLessThan(Decimal),

    #[error("unable to place post-only order at this price")]
    UnableToPlacePostOnlyOrder,

    #[error("you may not have more than {0} open orders in a single market")]
    MaxOrdersExceeded(u32),

    #[error("poloniex internal error: {0}")]
    PoloniexInternalError(String),

    #[error("exchange is in maintenance mode")]
    MaintenanceMode,

    #[error("market is disabled")]
    MarketDisabled,

    #[error("order matching is currently disabled")]
    OrderMatchingDisabled,

    /// Any network I/O failure, stream teardown, or confirmation timeout.
    #[error("disconnected from exchange")]
    Disconnected,

    #[error("exchange error: {0}")]
    Other(String),
}

impl ExchangeError {
    /// True for failures the caller should treat as a connection loss and
    /// recover from via the connection-state stream.
    pub fn is_disconnect(&self) -> bool {
        matches!(self, ExchangeError::Disconnected)
    }

    /// True for errors that permanently invalidate the step that raised
    /// them: retrying the same order can never succeed.
    pub fn is_fatal_for_step(&self) -> bool {
        matches!(
            self,
            ExchangeError::AmountMustBeAtLeast(_)
                | ExchangeError::TotalMustBeAtLeast(_)
                | ExchangeError::RateMustBeLessThan(_)
                | ExchangeError::MarketDisabled
                | ExchangeError::OrderMatchingDisabled
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_fatal_classification() {
        assert!(ExchangeError::AmountMustBeAtLeast(dec!(0.0001)).is_fatal_for_step());
        assert!(ExchangeError::MarketDisabled.is_fatal_for_step());
        assert!(!ExchangeError::TransactionFailed.is_fatal_for_step());
        assert!(!ExchangeError::Disconnected.is_fatal_for_step());
    }

    #[test]
    fn test_disconnect_classification() {
        assert!(ExchangeError::Disconnected.is_disconnect());
        assert!(!ExchangeError::MaintenanceMode.is_disconnect());
    }
}
