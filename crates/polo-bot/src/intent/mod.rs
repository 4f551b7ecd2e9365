//! Transaction intent: the per-path state machine.
//!
//! Each intent drives one path through its steps: merging with equivalent
//! intents and unfilled residue on entry, executing the current step
//! through the instant executor or a delayed-trade processor, splitting
//! every fill into a committed child intent plus the remaining parent,
//! re-planning the tail when profitability evaporates, and finalizing into
//! the completed table or an unfilled remainder.
//!
//! All final journal writes run in spawned tasks with indefinite retry so
//! caller cancellation or a crash mid-write never leaves an intent
//! half-persisted.

pub mod manager;
pub mod markets;

use std::sync::Arc;
use std::time::Duration;

use polo_common::{Market, OrderSpeed};
use polo_exchange::{BookCache, ExchangeClient};
use rust_decimal::Decimal;
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::BotConfig;
use crate::instant::{InstantAbort, InstantExecutor};
use crate::intent::manager::{IntentHandle, IntentManager, MergeRequest};
use crate::intent::markets::{
    init_from_amount, markets_shape_hash, merge_markets, split_markets, step_from_amount,
    TranIntentMarket,
};
use crate::journal::{ActiveTransaction, Journal, JournalError, StepChild, UnfilledRemainder};
use crate::pathfinder::PathFinder;
use crate::processor::manager::DelayedTradeManager;
use crate::scheduler::TradeScheduler;

/// Shared services every intent runs against.
pub struct IntentContext {
    pub exchange: Arc<dyn ExchangeClient>,
    pub books: BookCache,
    pub journal: Arc<dyn Journal>,
    pub intents: Arc<IntentManager>,
    pub processors: Arc<DelayedTradeManager>,
    pub pathfinder: Arc<PathFinder>,
    pub instant: Arc<InstantExecutor>,
    pub config: Arc<BotConfig>,
}

/// How the current step ended.
enum StepOutcome {
    /// Fully filled with more steps ahead: the same intent continues at
    /// the next index.
    Advanced,
    /// The intent is fully settled: completed, merged away, or split into
    /// children; nothing left to run here.
    Finished,
    /// The step is no longer worth executing; re-plan the tail.
    Replan,
    /// The step ended with leftover input past step 0.
    Unfilled,
}

/// What committing a batch of trades did to the intent.
enum CommitResult {
    /// Full fill, next step exists: the intent itself moved forward.
    Advanced,
    /// Full fill of the last step: the intent is in the completed table.
    Completed,
    /// Partial fill: a child carries the committed portion, this intent
    /// keeps the remainder at the current step.
    Spawned { remaining_from: Decimal },
}

/// A journal write that must not be lost. Runs on its own task with
/// indefinite retry, shielded from the caller's cancellation.
enum PersistOp {
    Upsert(ActiveTransaction),
    Delete(Uuid),
    CommitStep {
        parent_id: Uuid,
        parent: Option<ActiveTransaction>,
        child: StepChild,
    },
    MoveToUnfilled {
        id: Uuid,
        row: UnfilledRemainder,
    },
}

async fn persist(journal: Arc<dyn Journal>, op: PersistOp) {
    let task = tokio::spawn(async move {
        loop {
            let result: Result<(), JournalError> = match &op {
                PersistOp::Upsert(tran) => journal.upsert_active(tran).await,
                PersistOp::Delete(id) => journal.delete_active(*id).await,
                PersistOp::CommitStep {
                    parent_id,
                    parent,
                    child,
                } => journal.commit_step(*parent_id, parent.as_ref(), child).await,
                PersistOp::MoveToUnfilled { id, row } => {
                    journal.move_active_to_unfilled(*id, row).await
                }
            };
            match result {
                Ok(()) => return,
                Err(err) => {
                    warn!(error = %err, "journal write failed, retrying");
                    tokio::time::sleep(Duration::from_secs(1)).await;
                }
            }
        }
    });
    let _ = task.await;
}

/// Register and start one intent. Returns `None` when an intent with this
/// id is already live, which makes startup recovery idempotent.
pub fn spawn_intent(
    ctx: Arc<IntentContext>,
    tran: ActiveTransaction,
) -> Option<tokio::task::JoinHandle<()>> {
    let shape = markets_shape_hash(&tran.markets);
    let init_currency = tran.markets[0].from_currency().clone();
    let current_currency = tran.markets[tran.market_idx].from_currency().clone();
    let (handle, merge_rx) = ctx.intents.add(
        tran.id,
        shape,
        tran.market_idx,
        init_currency,
        current_currency,
    )?;
    let intent = TransactionIntent { ctx, tran, handle };
    Some(tokio::spawn(intent.run(merge_rx)))
}

struct TransactionIntent {
    ctx: Arc<IntentContext>,
    tran: ActiveTransaction,
    handle: Arc<IntentHandle>,
}

impl TransactionIntent {
    async fn run(mut self, mut merge_rx: mpsc::Receiver<MergeRequest>) {
        debug!(
            id = %self.tran.id,
            market_idx = self.tran.market_idx,
            "intent started"
        );
        self.lifecycle(&mut merge_rx).await;
        self.ctx.intents.remove(self.tran.id);
        debug!(id = %self.tran.id, "intent finished");
    }

    async fn lifecycle(&mut self, merge_rx: &mut mpsc::Receiver<MergeRequest>) {
        loop {
            // A cancellation that landed between steps still finalizes
            // cleanly instead of starting the next step.
            if *self.handle.cancel_stream().borrow() {
                info!(id = %self.tran.id, "intent cancelled between steps");
                self.finalize_unfilled().await;
                return;
            }

            // Fold ourselves into an equivalent running intent rather than
            // competing with it on the same books.
            if self.merge_into_existing().await {
                persist(
                    Arc::clone(&self.ctx.journal),
                    PersistOp::Delete(self.tran.id),
                )
                .await;
                return;
            }

            // Absorb any persisted residue matching our currency pair.
            self.absorb_unfilled().await;

            let outcome = match self.tran.markets[self.tran.market_idx].speed() {
                OrderSpeed::Instant => self.instant_step(merge_rx).await,
                OrderSpeed::Delayed => self.delayed_step(merge_rx).await,
            };

            match outcome {
                StepOutcome::Advanced => {
                    // Same intent, next step; loop back through START so
                    // merge and residue lookups run for the new position.
                }
                StepOutcome::Finished => return,
                StepOutcome::Unfilled => {
                    self.finalize_unfilled().await;
                    return;
                }
                StepOutcome::Replan => {
                    if !self.replan().await {
                        return;
                    }
                    // Loop back with the new tail.
                }
            }
        }
    }

    async fn merge_into_existing(&self) -> bool {
        let shape = markets_shape_hash(&self.tran.markets);
        let Some(candidate) =
            self.ctx
                .intents
                .merge_candidate(shape, self.tran.market_idx, self.tran.id)
        else {
            return false;
        };
        // Merges only flow toward the smaller id. Two intents merging
        // toward each other would otherwise both block on the other's ack.
        if candidate.id >= self.tran.id {
            return false;
        }
        let init = init_from_amount(&self.tran.markets);
        let current = step_from_amount(&self.tran.markets, self.tran.market_idx);
        if candidate.try_merge(init, current).await {
            info!(
                id = %self.tran.id,
                into = %candidate.id,
                %init,
                %current,
                "merged into an equivalent intent"
            );
            true
        } else {
            false
        }
    }

    async fn absorb_unfilled(&mut self) {
        let init_currency = self.tran.markets[0].from_currency().clone();
        let current_currency = self.tran.markets[self.tran.market_idx]
            .from_currency()
            .clone();
        let rows = match self
            .ctx
            .journal
            .take_unfilled(&init_currency, &current_currency)
            .await
        {
            Ok(rows) => rows,
            Err(err) => {
                warn!(id = %self.tran.id, error = %err, "unfilled lookup failed");
                return;
            }
        };
        if rows.is_empty() {
            return;
        }
        for row in &rows {
            info!(
                id = %self.tran.id,
                residue = %row.id,
                init = %row.init_amount,
                current = %row.current_amount,
                "absorbing unfilled remainder"
            );
            self.tran.markets = merge_markets(
                &self.tran.markets,
                self.tran.market_idx,
                row.init_amount,
                row.current_amount,
            );
        }
        persist(
            Arc::clone(&self.ctx.journal),
            PersistOp::Upsert(self.tran.clone()),
        )
        .await;
    }

    // --- instant step -------------------------------------------------------

    async fn instant_step(&mut self, merge_rx: &mut mpsc::Receiver<MergeRequest>) -> StepOutcome {
        let idx = self.tran.market_idx;
        let market = self.tran.markets[idx].market().clone();
        let order_type = self.tran.markets[idx].order_type();

        // The opposite-side processor would be our counterparty; pull its
        // order first and put it back afterwards.
        let opposite = self.ctx.processors.get(&market, order_type.opposite());
        if let Some(processor) = &opposite {
            processor.pause().await;
        }

        // Late merges are folded in now; afterwards the channel is closed
        // because this intent never returns to a mergeable state.
        merge_rx.close();
        while let Ok(req) = merge_rx.try_recv() {
            self.tran.markets =
                merge_markets(&self.tran.markets, idx, req.init_delta, req.current_delta);
            persist(
                Arc::clone(&self.ctx.journal),
                PersistOp::Upsert(self.tran.clone()),
            )
            .await;
            let _ = req.ack.send(true);
        }

        let from_amount = step_from_amount(&self.tran.markets, idx);
        let outcome = self
            .ctx
            .instant
            .execute(&market, order_type, from_amount)
            .await;

        if let Some(processor) = &opposite {
            processor.resume();
        }

        if outcome.trades.is_empty() {
            return match outcome.abort {
                None => {
                    // Nothing tradable but nothing lost; the input never
                    // left the balance.
                    persist(
                        Arc::clone(&self.ctx.journal),
                        PersistOp::Delete(self.tran.id),
                    )
                    .await;
                    StepOutcome::Finished
                }
                Some(abort) => self.instant_abort(&market, abort).await,
            };
        }

        let commit = self.commit_trades(&outcome.trades).await;

        match commit {
            CommitResult::Advanced => StepOutcome::Advanced,
            CommitResult::Completed => StepOutcome::Finished,
            CommitResult::Spawned { remaining_from } => match outcome.abort {
                None => {
                    // Sub-tick dust: it never left the balance.
                    persist(
                        Arc::clone(&self.ctx.journal),
                        PersistOp::Delete(self.tran.id),
                    )
                    .await;
                    StepOutcome::Finished
                }
                Some(abort) => {
                    warn!(
                        id = %self.tran.id,
                        market = %market,
                        %remaining_from,
                        reason = %abort,
                        "instant step stopped with leftover input"
                    );
                    self.instant_abort(&market, abort).await
                }
            },
        }
    }

    /// Classify an instant abort: disabled markets are blacklisted and the
    /// tail re-planned, everything else gives the step up.
    async fn instant_abort(&self, market: &Market, abort: InstantAbort) -> StepOutcome {
        match abort {
            InstantAbort::MarketDisabled | InstantAbort::OrderMatchingDisabled => {
                warn!(market = %market, reason = %abort, "blacklisting disabled market");
                if let Err(err) = self
                    .ctx
                    .journal
                    .add_blacklisted(market, self.ctx.config.blacklist_ttl())
                    .await
                {
                    warn!(error = %err, "blacklist write failed");
                }
                StepOutcome::Replan
            }
            InstantAbort::NotEnoughCrypto
            | InstantAbort::OrderBookEmpty
            | InstantAbort::AmountTooSmall
            | InstantAbort::TotalTooSmall
            | InstantAbort::RateTooHigh => {
                if self.tran.market_idx > 0 {
                    StepOutcome::Unfilled
                } else {
                    persist(
                        Arc::clone(&self.ctx.journal),
                        PersistOp::Delete(self.tran.id),
                    )
                    .await;
                    StepOutcome::Finished
                }
            }
        }
    }

    // --- delayed step -------------------------------------------------------

    async fn delayed_step(&mut self, merge_rx: &mut mpsc::Receiver<MergeRequest>) -> StepOutcome {
        let idx = self.tran.market_idx;
        let market = self.tran.markets[idx].market().clone();
        let order_type = self.tran.markets[idx].order_type();
        let from_amount = step_from_amount(&self.tran.markets, idx);

        let processor = self.ctx.processors.get_or_create(&market, order_type);
        let scheduler = processor.scheduler();
        let (out_tx, mut out_rx) = mpsc::unbounded_channel();
        scheduler.register(self.tran.id, out_tx).await;
        if !scheduler.add_amount(self.tran.id, from_amount).await {
            warn!(
                id = %self.tran.id,
                market = %market,
                "processor rejected the reservation"
            );
            scheduler.unregister(self.tran.id).await;
            return StepOutcome::Replan;
        }

        let mut cancel_rx = self.handle.cancel_stream();
        let mut profit_tick = tokio::time::interval(self.ctx.config.profit_check_interval());
        profit_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let started = tokio::time::Instant::now();
        // The merge channel may already be closed by an earlier instant
        // step of this intent; its branch is disabled on the first None.
        let mut merge_open = true;

        loop {
            tokio::select! {
                maybe_trade = out_rx.recv() => match maybe_trade {
                    Some(trade) => {
                        match self.commit_trades(&[trade]).await {
                            CommitResult::Advanced => {
                                // Our entry zeroed out and was removed;
                                // unregister is a fast no-op.
                                scheduler.unregister(self.tran.id).await;
                                return StepOutcome::Advanced;
                            }
                            CommitResult::Completed => {
                                scheduler.unregister(self.tran.id).await;
                                return StepOutcome::Finished;
                            }
                            CommitResult::Spawned { .. } => {}
                        }
                    }
                    None => {
                        // Channel closed: fully consumed, unregistered, or
                        // the processor died.
                        let remaining = step_from_amount(&self.tran.markets, idx);
                        if remaining.is_zero() {
                            persist(
                                Arc::clone(&self.ctx.journal),
                                PersistOp::Delete(self.tran.id),
                            )
                            .await;
                            return StepOutcome::Finished;
                        }
                        return StepOutcome::Unfilled;
                    }
                },
                maybe_req = merge_rx.recv(), if merge_open => {
                    match maybe_req {
                        Some(req) => {
                            let approved = scheduler
                                .add_amount(self.tran.id, req.current_delta)
                                .await;
                            if approved {
                                self.tran.markets = merge_markets(
                                    &self.tran.markets,
                                    idx,
                                    req.init_delta,
                                    req.current_delta,
                                );
                                persist(
                                    Arc::clone(&self.ctx.journal),
                                    PersistOp::Upsert(self.tran.clone()),
                                )
                                .await;
                            }
                            let _ = req.ack.send(approved);
                        }
                        None => merge_open = false,
                    }
                },
                _ = profit_tick.tick() => {
                    if started.elapsed() >= self.ctx.config.profit_timeout() {
                        info!(id = %self.tran.id, market = %market, "delayed step timed out");
                        if let Some(outcome) = self.leave_delayed(&scheduler, &mut out_rx).await {
                            return outcome;
                        }
                        return StepOutcome::Replan;
                    }
                    let init = init_from_amount(&self.tran.markets);
                    if let Some(expected) = self
                        .ctx
                        .pathfinder
                        .estimate_chain_target(&self.tran.markets, idx)
                    {
                        if expected < init {
                            info!(
                                id = %self.tran.id,
                                market = %market,
                                %expected,
                                %init,
                                "path no longer profitable"
                            );
                            if let Some(outcome) =
                                self.leave_delayed(&scheduler, &mut out_rx).await
                            {
                                return outcome;
                            }
                            return StepOutcome::Replan;
                        }
                    }
                },
                res = cancel_rx.changed() => {
                    if res.is_err() || *cancel_rx.borrow() {
                        info!(id = %self.tran.id, "intent cancelled");
                        if let Some(outcome) = self.leave_delayed(&scheduler, &mut out_rx).await {
                            return outcome;
                        }
                        let remaining = step_from_amount(&self.tran.markets, idx);
                        if remaining.is_zero() {
                            persist(
                                Arc::clone(&self.ctx.journal),
                                PersistOp::Delete(self.tran.id),
                            )
                            .await;
                            return StepOutcome::Finished;
                        }
                        return StepOutcome::Unfilled;
                    }
                },
            }
        }
    }

    /// Two-phase departure from the processor, then drain fills that were
    /// attributed before the exit was approved. A drained fill that turns
    /// out to have finished the step overrides the caller's outcome.
    async fn leave_delayed(
        &mut self,
        scheduler: &Arc<TradeScheduler>,
        out_rx: &mut mpsc::UnboundedReceiver<polo_common::BareTrade>,
    ) -> Option<StepOutcome> {
        scheduler.unregister(self.tran.id).await;
        while let Ok(trade) = out_rx.try_recv() {
            match self.commit_trades(&[trade]).await {
                CommitResult::Advanced => return Some(StepOutcome::Advanced),
                CommitResult::Completed => return Some(StepOutcome::Finished),
                CommitResult::Spawned { .. } => {}
            }
        }
        None
    }

    /// Split the chain around executed trades and persist the transition
    /// in one journal transaction. A full fill advances this intent to
    /// the next step (or completes it); a partial fill spawns a child
    /// carrying the committed portion while this intent keeps the rest.
    async fn commit_trades(&mut self, trades: &[polo_common::BareTrade]) -> CommitResult {
        let idx = self.tran.market_idx;
        let (remaining, committed) = split_markets(&self.tran.markets, idx, trades);
        let remaining_from = step_from_amount(&remaining, idx);
        let full = remaining_from.is_zero();
        let last = idx + 1 >= self.tran.markets.len();
        let child_id = if full { self.tran.id } else { Uuid::new_v4() };

        let parent = (!full).then(|| ActiveTransaction {
            id: self.tran.id,
            markets: remaining.clone(),
            market_idx: idx,
            created_ts: self.tran.created_ts,
        });

        let child = if last {
            StepChild::Completed(ActiveTransaction {
                id: child_id,
                markets: committed.clone(),
                market_idx: idx,
                created_ts: self.tran.created_ts,
            })
        } else {
            StepChild::Active(ActiveTransaction {
                id: child_id,
                markets: committed.clone(),
                market_idx: idx + 1,
                created_ts: self.tran.created_ts,
            })
        };

        persist(
            Arc::clone(&self.ctx.journal),
            PersistOp::CommitStep {
                parent_id: self.tran.id,
                parent: parent.clone(),
                child: child.clone(),
            },
        )
        .await;

        if last {
            if full {
                info!(
                    id = %self.tran.id,
                    target = %crate::intent::markets::step_target_amount(&committed, idx),
                    "path fully executed"
                );
                self.tran.markets = committed;
                return CommitResult::Completed;
            }
            info!(
                id = %self.tran.id,
                child = %child_id,
                "last-step fill committed as a completed child"
            );
            self.tran.markets = remaining;
            return CommitResult::Spawned { remaining_from };
        }

        if full {
            debug!(
                id = %self.tran.id,
                next_idx = idx + 1,
                "step fully filled, advancing"
            );
            self.tran.markets = committed;
            self.tran.market_idx = idx + 1;
            self.handle.advance(
                idx + 1,
                self.tran.markets[idx + 1].from_currency().clone(),
            );
            return CommitResult::Advanced;
        }

        if let StepChild::Active(child_tran) = child {
            info!(
                id = %self.tran.id,
                child = %child_id,
                next_idx = idx + 1,
                "partial fill committed, child intent started"
            );
            spawn_intent(Arc::clone(&self.ctx), child_tran);
        }
        self.tran.markets = remaining;
        CommitResult::Spawned { remaining_from }
    }

    // --- re-planning and finalization --------------------------------------

    /// Replace the unexecuted tail with the best currently profitable
    /// path starting at the current step's input. False means the intent
    /// gave up (too small or no path) and is already finalized.
    async fn replan(&mut self) -> bool {
        let idx = self.tran.market_idx;
        let init_amount = init_from_amount(&self.tran.markets);
        if init_amount < self.ctx.config.min_trade_amount {
            info!(
                id = %self.tran.id,
                %init_amount,
                "too small to re-plan, giving up"
            );
            self.finalize_unfilled().await;
            return false;
        }

        let from_currency = self.tran.markets[idx].from_currency().clone();
        let from_amount = step_from_amount(&self.tran.markets, idx);
        let ends: std::collections::HashSet<_> = self
            .ctx
            .config
            .primary_currencies
            .iter()
            .cloned()
            .collect();
        let blacklist = self
            .ctx
            .journal
            .blacklisted_markets()
            .await
            .unwrap_or_default();
        let mut in_flight = self.ctx.intents.shapes_in_flight();
        in_flight.remove(&self.handle.shape());

        let paths = self.ctx.pathfinder.find_paths(
            &from_currency,
            from_amount,
            &ends,
            &blacklist,
            &in_flight,
        );
        // The new tail must claw back at least the initial input, or the
        // re-plan would churn forever on a losing position.
        let Some(best) = paths.into_iter().find(|p| p.to_amount() > init_amount) else {
            info!(id = %self.tran.id, %from_currency, "no replacement path found");
            self.finalize_unfilled().await;
            return false;
        };

        let mut new_markets: Vec<TranIntentMarket> = self.tran.markets[..idx].to_vec();
        for (i, order) in best.chain.iter().enumerate() {
            let from_currency_type = order
                .market
                .currency_type(&order.from_currency)
                .expect("path order spends a market currency");
            if i == 0 {
                new_markets.push(TranIntentMarket::PartiallyCompleted {
                    market: order.market.clone(),
                    speed: order.speed,
                    from_currency_type,
                    from_amount,
                });
            } else {
                new_markets.push(TranIntentMarket::Predicted {
                    market: order.market.clone(),
                    speed: order.speed,
                    from_currency_type,
                });
            }
        }

        info!(
            id = %self.tran.id,
            tail_len = best.chain.len(),
            expected = %best.to_amount(),
            "tail re-planned"
        );
        self.tran.markets = new_markets;
        self.handle
            .set_shape(markets_shape_hash(&self.tran.markets));
        persist(
            Arc::clone(&self.ctx.journal),
            PersistOp::Upsert(self.tran.clone()),
        )
        .await;
        true
    }

    /// Dispose of leftover input at the current step.
    async fn finalize_unfilled(&mut self) {
        let idx = self.tran.market_idx;
        let current_currency = self.tran.markets[idx].from_currency().clone();
        let init_currency = self.tran.markets[0].from_currency().clone();
        let current_amount = step_from_amount(&self.tran.markets, idx);
        let init_amount = init_from_amount(&self.tran.markets);

        if current_amount.is_zero() {
            persist(
                Arc::clone(&self.ctx.journal),
                PersistOp::Delete(self.tran.id),
            )
            .await;
            return;
        }

        // Holding at least the initial value in the same primary currency
        // means nothing was lost; the balance tick will reuse it.
        if current_currency == init_currency
            && self.ctx.config.is_primary(&current_currency)
            && init_amount <= current_amount
        {
            info!(
                id = %self.tran.id,
                %current_amount,
                currency = %current_currency,
                "residue is safely back in a primary currency"
            );
            persist(
                Arc::clone(&self.ctx.journal),
                PersistOp::Delete(self.tran.id),
            )
            .await;
            return;
        }

        // Prefer re-homing the residue into a live intent over a table
        // row. Same id ordering as the entry merge, for the same reason.
        if let Some(candidate) = self
            .ctx
            .intents
            .residue_candidate(&init_currency, &current_currency, self.tran.id)
            .filter(|c| c.id < self.tran.id)
        {
            if candidate.try_merge(init_amount, current_amount).await {
                info!(
                    id = %self.tran.id,
                    into = %candidate.id,
                    "residue merged into a live intent"
                );
                persist(
                    Arc::clone(&self.ctx.journal),
                    PersistOp::Delete(self.tran.id),
                )
                .await;
                return;
            }
        }

        info!(
            id = %self.tran.id,
            init = %init_amount,
            current = %current_amount,
            currency = %current_currency,
            "persisting unfilled remainder"
        );
        persist(
            Arc::clone(&self.ctx.journal),
            PersistOp::MoveToUnfilled {
                id: self.tran.id,
                row: UnfilledRemainder {
                    id: self.tran.id,
                    init_currency,
                    init_amount,
                    current_currency,
                    current_amount,
                },
            },
        )
        .await;
    }
}
