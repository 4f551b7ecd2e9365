//! Durability journal.
//!
//! Persists active and completed transactions, unfilled remainders, the
//! order ids serving delayed steps, and the market blacklist. Operations
//! are idempotent upserts and deletes; the multi-statement transitions of
//! the intent machine run inside database transactions.

pub mod memory;
pub mod postgres;

use std::collections::HashSet;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use polo_common::{Currency, Market, OrderType};
use polo_exchange::{OrderId, TradeId};
use rust_decimal::Decimal;
use thiserror::Error;
use uuid::Uuid;

use crate::intent::markets::{init_from_amount, step_from_amount, TranIntentMarket};

pub use memory::MemJournal;
pub use postgres::PgJournal;

/// Journal failures. Callers either bubble these up or retry inside
/// shielded persistence blocks.
#[derive(Debug, Error)]
pub enum JournalError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// One live intent as persisted.
#[derive(Debug, Clone, PartialEq)]
pub struct ActiveTransaction {
    pub id: Uuid,
    pub markets: Vec<TranIntentMarket>,
    pub market_idx: usize,
    pub created_ts: DateTime<Utc>,
}

impl ActiveTransaction {
    pub fn new(id: Uuid, markets: Vec<TranIntentMarket>, market_idx: usize) -> Self {
        Self {
            id,
            markets,
            market_idx,
            created_ts: Utc::now(),
        }
    }

    /// Currency the current step spends; indexed for balance-in-use sums.
    pub fn from_currency(&self) -> Currency {
        self.markets[self.market_idx].from_currency().clone()
    }

    /// Amount the current step spends.
    pub fn from_amount(&self) -> Decimal {
        step_from_amount(&self.markets, self.market_idx)
    }

    /// The intent's initial input at step 0.
    pub fn init_amount(&self) -> Decimal {
        init_from_amount(&self.markets)
    }
}

/// A finished intent.
#[derive(Debug, Clone, PartialEq)]
pub struct CompletedTransaction {
    pub id: Uuid,
    pub markets: Vec<TranIntentMarket>,
    pub created_ts: DateTime<Utc>,
    pub completed_ts: DateTime<Utc>,
}

/// Residue of an intent that ended a non-first step with leftover input.
#[derive(Debug, Clone, PartialEq)]
pub struct UnfilledRemainder {
    pub id: Uuid,
    pub init_currency: Currency,
    pub init_amount: Decimal,
    pub current_currency: Currency,
    pub current_amount: Decimal,
}

/// What a finished step hands to the journal for its child.
#[derive(Debug, Clone)]
pub enum StepChild {
    /// The committed portion continues at the next step.
    Active(ActiveTransaction),
    /// The committed portion finished the whole chain.
    Completed(ActiveTransaction),
}

#[async_trait]
pub trait Journal: Send + Sync + 'static {
    async fn upsert_active(&self, tran: &ActiveTransaction) -> Result<(), JournalError>;

    async fn delete_active(&self, id: Uuid) -> Result<(), JournalError>;

    async fn list_active(&self) -> Result<Vec<ActiveTransaction>, JournalError>;

    /// Sum of current-step from-amounts over active rows spending
    /// `currency`; subtracted from the balance before new paths start.
    async fn amount_in_use(&self, currency: &Currency) -> Result<Decimal, JournalError>;

    /// Persist a step split in one transaction: the parent row is updated
    /// (or deleted when it has nothing left), the child inserted as a new
    /// active row or promoted straight to completed.
    async fn commit_step(
        &self,
        parent_id: Uuid,
        parent: Option<&ActiveTransaction>,
        child: &StepChild,
    ) -> Result<(), JournalError>;

    /// Promote a whole intent to completed in one transaction.
    async fn complete(&self, tran: &ActiveTransaction) -> Result<(), JournalError>;

    async fn list_completed(&self) -> Result<Vec<CompletedTransaction>, JournalError>;

    /// Replace an active row with its unfilled residue in one transaction.
    async fn move_active_to_unfilled(
        &self,
        id: Uuid,
        row: &UnfilledRemainder,
    ) -> Result<(), JournalError>;

    /// Claim (select and delete) every remainder matching the currency
    /// pair, under repeatable-read so two intents cannot claim the same
    /// row.
    async fn take_unfilled(
        &self,
        init_currency: &Currency,
        current_currency: &Currency,
    ) -> Result<Vec<UnfilledRemainder>, JournalError>;

    async fn list_unfilled(&self) -> Result<Vec<UnfilledRemainder>, JournalError>;

    /// Record that `order_id` currently serves `tran_id` on this market.
    async fn record_order_id(
        &self,
        tran_id: Uuid,
        market: &Market,
        order_type: OrderType,
        order_id: OrderId,
    ) -> Result<(), JournalError>;

    /// Raise the per-order trade watermark used by crash recovery.
    async fn note_trade_seen(
        &self,
        market: &Market,
        order_type: OrderType,
        order_id: OrderId,
        trade_id: TradeId,
    ) -> Result<(), JournalError>;

    /// Order ids recorded for a market side with their trade watermarks,
    /// oldest first.
    async fn open_orders(
        &self,
        market: &Market,
        order_type: OrderType,
    ) -> Result<Vec<(OrderId, Option<TradeId>)>, JournalError>;

    async fn clear_market_orders(
        &self,
        market: &Market,
        order_type: OrderType,
    ) -> Result<(), JournalError>;

    async fn clear_transaction_orders(&self, tran_id: Uuid) -> Result<(), JournalError>;

    async fn add_blacklisted(&self, market: &Market, ttl: Duration) -> Result<(), JournalError>;

    /// Markets still inside their blacklist TTL; expired rows are pruned.
    async fn blacklisted_markets(&self) -> Result<HashSet<Market>, JournalError>;
}
