//! Core market vocabulary: currencies, markets, order sides and speeds.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// A currency ticker, e.g. `USDT` or `BTC`.
///
/// Cheap to clone and hashable; used as a map key throughout the engine.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Currency(String);

impl Currency {
    pub fn new(ticker: impl Into<String>) -> Self {
        Self(ticker.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Currency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Currency {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl FromStr for Currency {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self(s.to_string()))
    }
}

/// Order side from the point of view of the market's quote currency.
///
/// Buying the quote currency (spending base) is `Buy`; selling it is `Sell`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderType {
    Buy,
    Sell,
}

impl OrderType {
    pub fn opposite(self) -> Self {
        match self {
            OrderType::Buy => OrderType::Sell,
            OrderType::Sell => OrderType::Buy,
        }
    }
}

impl fmt::Display for OrderType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OrderType::Buy => write!(f, "buy"),
            OrderType::Sell => write!(f, "sell"),
        }
    }
}

/// Which of a market's two currencies a given currency is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CurrencyType {
    Base,
    Quote,
}

impl CurrencyType {
    /// The order type implied by spending a currency of this type.
    ///
    /// Spending base buys quote; spending quote sells it.
    pub fn order_type(self) -> OrderType {
        match self {
            CurrencyType::Base => OrderType::Buy,
            CurrencyType::Quote => OrderType::Sell,
        }
    }

    pub fn opposite(self) -> Self {
        match self {
            CurrencyType::Base => CurrencyType::Quote,
            CurrencyType::Quote => CurrencyType::Base,
        }
    }
}

/// Execution speed of one path step.
///
/// `Instant` steps take liquidity with fill-or-kill orders; `Delayed` steps
/// make liquidity through the post-only processor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderSpeed {
    Instant,
    Delayed,
}

impl fmt::Display for OrderSpeed {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OrderSpeed::Instant => write!(f, "instant"),
            OrderSpeed::Delayed => write!(f, "delayed"),
        }
    }
}

/// A trading pair `(base, quote)`.
///
/// Price is expressed in base units per one quote unit; order quantities are
/// expressed in quote units. The display form is `BASE_QUOTE`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Market {
    pub base: Currency,
    pub quote: Currency,
}

impl Market {
    pub fn new(base: Currency, quote: Currency) -> Self {
        Self { base, quote }
    }

    pub fn of(base: &str, quote: &str) -> Self {
        Self {
            base: Currency::from(base),
            quote: Currency::from(quote),
        }
    }

    /// The order type implied by spending `from` on this market, or `None`
    /// if `from` is not one of the market's currencies.
    pub fn order_type(&self, from: &Currency) -> Option<OrderType> {
        self.currency_type(from).map(CurrencyType::order_type)
    }

    pub fn currency_type(&self, currency: &Currency) -> Option<CurrencyType> {
        if *currency == self.base {
            Some(CurrencyType::Base)
        } else if *currency == self.quote {
            Some(CurrencyType::Quote)
        } else {
            None
        }
    }

    pub fn currency(&self, kind: CurrencyType) -> &Currency {
        match kind {
            CurrencyType::Base => &self.base,
            CurrencyType::Quote => &self.quote,
        }
    }

    /// The currency received when spending `from` on this market.
    pub fn target_currency(&self, from: &Currency) -> Option<&Currency> {
        match self.currency_type(from)? {
            CurrencyType::Base => Some(&self.quote),
            CurrencyType::Quote => Some(&self.base),
        }
    }

    pub fn contains(&self, currency: &Currency) -> bool {
        self.currency_type(currency).is_some()
    }
}

impl fmt::Display for Market {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}_{}", self.base, self.quote)
    }
}

/// Error parsing the `BASE_QUOTE` market form.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid market symbol: {0}")]
pub struct MarketParseError(pub String);

impl FromStr for Market {
    type Err = MarketParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (base, quote) = s
            .split_once('_')
            .ok_or_else(|| MarketParseError(s.to_string()))?;
        if base.is_empty() || quote.is_empty() {
            return Err(MarketParseError(s.to_string()));
        }
        Ok(Market::of(base, quote))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_order_type_from_spent_currency() {
        let market = Market::of("USDT", "BTC");

        // Spending base buys the quote currency.
        assert_eq!(
            market.order_type(&Currency::from("USDT")),
            Some(OrderType::Buy)
        );
        assert_eq!(
            market.order_type(&Currency::from("BTC")),
            Some(OrderType::Sell)
        );
        assert_eq!(market.order_type(&Currency::from("ETH")), None);
    }

    #[test]
    fn test_target_currency() {
        let market = Market::of("USDT", "BTC");

        assert_eq!(
            market.target_currency(&Currency::from("USDT")),
            Some(&Currency::from("BTC"))
        );
        assert_eq!(
            market.target_currency(&Currency::from("BTC")),
            Some(&Currency::from("USDT"))
        );
        assert_eq!(market.target_currency(&Currency::from("XMR")), None);
    }

    #[test]
    fn test_market_display_round_trip() {
        let market = Market::of("USDT", "BTC");
        assert_eq!(market.to_string(), "USDT_BTC");
        assert_eq!("USDT_BTC".parse::<Market>().unwrap(), market);

        assert!("BTCUSDT".parse::<Market>().is_err());
        assert!("_BTC".parse::<Market>().is_err());
    }

    #[test]
    fn test_opposites() {
        assert_eq!(OrderType::Buy.opposite(), OrderType::Sell);
        assert_eq!(CurrencyType::Base.opposite(), CurrencyType::Quote);
        assert_eq!(CurrencyType::Base.order_type(), OrderType::Buy);
        assert_eq!(CurrencyType::Quote.order_type(), OrderType::Sell);
    }
}
