//! Lifecycle registry of delayed-trade processors.

use std::sync::Arc;

use dashmap::DashMap;
use polo_common::{Market, OrderType};
use polo_exchange::{BookCache, ExchangeClient};
use tracing::info;

use crate::journal::Journal;

use super::DelayedTradeProcessor;

/// One processor per (market, side), created on first use and kept for the
/// lifetime of the trader.
pub struct DelayedTradeManager {
    exchange: Arc<dyn ExchangeClient>,
    books: BookCache,
    journal: Arc<dyn Journal>,
    processors: DashMap<(Market, OrderType), Arc<DelayedTradeProcessor>>,
}

impl DelayedTradeManager {
    pub fn new(
        exchange: Arc<dyn ExchangeClient>,
        books: BookCache,
        journal: Arc<dyn Journal>,
    ) -> Self {
        Self {
            exchange,
            books,
            journal,
            processors: DashMap::new(),
        }
    }

    pub fn get(&self, market: &Market, order_type: OrderType) -> Option<Arc<DelayedTradeProcessor>> {
        self.processors
            .get(&(market.clone(), order_type))
            .map(|p| Arc::clone(&p))
    }

    pub fn get_or_create(
        &self,
        market: &Market,
        order_type: OrderType,
    ) -> Arc<DelayedTradeProcessor> {
        self.processors
            .entry((market.clone(), order_type))
            .or_insert_with(|| {
                info!(market = %market, %order_type, "starting delayed-trade processor");
                DelayedTradeProcessor::spawn(
                    Arc::clone(&self.exchange),
                    self.books.clone(),
                    Arc::clone(&self.journal),
                    market.clone(),
                    order_type,
                )
            })
            .clone()
    }

    /// Pull every live order off the exchange; used at shutdown. The
    /// processors stay registered and resume if new amounts arrive.
    pub async fn pause_all(&self) {
        let processors: Vec<_> = self.processors.iter().map(|p| Arc::clone(&p)).collect();
        for processor in processors {
            processor.pause().await;
        }
    }

    pub fn len(&self) -> usize {
        self.processors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.processors.is_empty()
    }
}
