//! Poloniex spot triangular-arbitrage engine.
//!
//! Finds profitable circular paths across spot markets, executes them as
//! multi-hop transaction intents, and keeps every partial fill accounted
//! for through crashes and disconnects.
//!
//! ## Modules
//!
//! - `config`: configuration loading and validation
//! - `pathfinder`: candidate chain enumeration over the latest books
//! - `scheduler`: per-(market, side) pooled reservations and attribution
//! - `processor`: the post-only delayed-trade market maker
//! - `instant`: the fill-or-kill taker executor
//! - `intent`: the per-path transaction state machine
//! - `journal`: durable state (Postgres or in-memory)
//! - `trader`: recovery, balance ticks, shutdown

pub mod config;
pub mod instant;
pub mod intent;
pub mod journal;
pub mod pathfinder;
pub mod processor;
pub mod scheduler;
pub mod trader;

pub use config::{BotConfig, InstantRetryConfig};
pub use instant::{InstantAbort, InstantExecutor, InstantOutcome};
pub use intent::manager::{IntentHandle, IntentManager, MergeRequest};
pub use intent::markets::{
    init_from_amount, markets_shape_hash, merge_markets, split_markets, step_from_amount,
    step_target_amount, MarketsDoc, TranIntentMarket,
};
pub use intent::{spawn_intent, IntentContext};
pub use journal::{
    ActiveTransaction, CompletedTransaction, Journal, JournalError, MemJournal, PgJournal,
    StepChild, UnfilledRemainder,
};
pub use pathfinder::{ExhaustivePath, PathFinder, PathOrder};
pub use processor::manager::DelayedTradeManager;
pub use processor::DelayedTradeProcessor;
pub use scheduler::TradeScheduler;
pub use trader::{BalanceView, Trader};
