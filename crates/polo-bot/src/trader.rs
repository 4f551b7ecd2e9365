//! Top-level trader loop.
//!
//! On startup, resumes every journaled intent (idempotently), then ticks:
//! each tick derives the tradable balance per primary currency (snapshot
//! plus notification deltas, minus fixed reserves and amounts already
//! committed to active intents), asks the path finder for candidates, and
//! starts an intent on the best profitable one.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use anyhow::{Context, Result};
use polo_common::Currency;
use polo_exchange::{AccountNotification, ExchangeClient};
use rust_decimal::Decimal;
use tokio::sync::{watch, RwLock};
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::intent::{spawn_intent, IntentContext};
use crate::journal::ActiveTransaction;

/// Live balance view: REST snapshot plus applied notification deltas,
/// refreshed from REST after reconnects.
pub struct BalanceView {
    balances: Arc<RwLock<HashMap<Currency, Decimal>>>,
}

impl BalanceView {
    pub async fn start(exchange: Arc<dyn ExchangeClient>) -> Result<Self> {
        let snapshot = exchange
            .balances()
            .await
            .context("initial balance snapshot failed")?;
        let balances = Arc::new(RwLock::new(snapshot));

        let task_balances = Arc::clone(&balances);
        tokio::spawn(async move {
            let mut notifications = exchange.account_stream();
            let mut conn_rx = exchange.connection_stream();
            loop {
                tokio::select! {
                    notif = notifications.recv() => match notif {
                        Ok(AccountNotification::BalanceUpdate { currency, delta }) => {
                            let mut view = task_balances.write().await;
                            *view.entry(currency).or_default() += delta;
                        }
                        Ok(_) => {}
                        Err(_) => {
                            // Lagged or closed: fall back to a fresh snapshot.
                            if let Ok(snapshot) = exchange.balances().await {
                                *task_balances.write().await = snapshot;
                            }
                            notifications = exchange.account_stream();
                        }
                    },
                    res = conn_rx.changed() => {
                        if res.is_err() {
                            return;
                        }
                        if *conn_rx.borrow() {
                            if let Ok(snapshot) = exchange.balances().await {
                                *task_balances.write().await = snapshot;
                            }
                        }
                    }
                }
            }
        });

        Ok(Self { balances })
    }

    pub async fn get(&self, currency: &Currency) -> Decimal {
        self.balances
            .read()
            .await
            .get(currency)
            .copied()
            .unwrap_or(Decimal::ZERO)
    }
}

/// The periodic tick / recovery / shutdown orchestrator.
pub struct Trader {
    ctx: Arc<IntentContext>,
}

impl Trader {
    pub fn new(ctx: Arc<IntentContext>) -> Self {
        Self { ctx }
    }

    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        self.recover().await?;

        let balances = BalanceView::start(Arc::clone(&self.ctx.exchange)).await?;
        let mut tick = tokio::time::interval(self.ctx.config.path_find_interval());
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = tick.tick() => self.balance_tick(&balances).await,
                res = shutdown.changed() => {
                    if res.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        info!("shutting down trader");
        self.ctx.intents.cancel_all();
        let drain_deadline = tokio::time::Instant::now() + std::time::Duration::from_secs(15);
        while !self.ctx.intents.is_empty() && tokio::time::Instant::now() < drain_deadline {
            tokio::time::sleep(std::time::Duration::from_millis(100)).await;
        }
        self.ctx.processors.pause_all().await;
        info!("trader stopped");
        Ok(())
    }

    /// Resume every journaled intent. Safe to re-run: live ids are
    /// skipped, so recovering the same journal twice yields the same set.
    pub async fn recover(&self) -> Result<()> {
        let rows = self
            .ctx
            .journal
            .list_active()
            .await
            .context("loading active transactions")?;
        if rows.is_empty() {
            return Ok(());
        }
        info!(count = rows.len(), "resuming journaled intents");
        for tran in rows {
            let id = tran.id;
            if spawn_intent(Arc::clone(&self.ctx), tran).is_none() {
                debug!(%id, "intent already live, skipping");
            }
        }
        Ok(())
    }

    /// One balance tick: start the best profitable path per primary
    /// currency with the funds not already reserved or committed, then
    /// give stranded unfilled residue a chance to trade its way home.
    pub async fn balance_tick(&self, balances: &BalanceView) {
        let ends: HashSet<Currency> = self
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
        let in_flight = self.ctx.intents.shapes_in_flight();

        for currency in &self.ctx.config.primary_currencies {
            let total = balances.get(currency).await;
            let in_use = match self.ctx.journal.amount_in_use(currency).await {
                Ok(amount) => amount,
                Err(err) => {
                    warn!(%currency, error = %err, "balance-in-use query failed");
                    continue;
                }
            };
            let available = total - self.ctx.config.reserve_for(currency) - in_use;
            if available < self.ctx.config.min_trade_amount {
                continue;
            }

            let paths = self.ctx.pathfinder.find_paths(
                currency,
                available,
                &ends,
                &blacklist,
                &in_flight,
            );
            let Some(best) = paths.into_iter().find(|p| p.profit() > Decimal::ZERO) else {
                debug!(%currency, %available, "no profitable path");
                continue;
            };

            let tran = ActiveTransaction::new(Uuid::new_v4(), best.to_markets(), 0);
            info!(
                id = %tran.id,
                %currency,
                amount = %available,
                hops = best.chain.len(),
                expected_profit = %best.profit(),
                "starting intent"
            );
            // Persist first so a crash between here and the spawn resumes
            // the intent instead of losing it.
            if let Err(err) = self.ctx.journal.upsert_active(&tran).await {
                warn!(id = %tran.id, error = %err, "intent journal write failed");
                continue;
            }
            spawn_intent(Arc::clone(&self.ctx), tran);
        }

        self.kick_unfilled(&ends, &blacklist).await;
    }

    /// Residue stuck in a non-primary currency is not reachable by the
    /// pair-merge path until some intent passes through it. When a path
    /// from the residue's currency can claw back its initial value, claim
    /// the rows and start a dedicated intent, with the planner choosing
    /// each step's speed.
    async fn kick_unfilled(
        &self,
        ends: &HashSet<Currency>,
        blacklist: &std::collections::HashSet<polo_common::Market>,
    ) {
        let rows = match self.ctx.journal.list_unfilled().await {
            Ok(rows) => rows,
            Err(err) => {
                warn!(error = %err, "unfilled listing failed");
                return;
            }
        };
        let in_flight = self.ctx.intents.shapes_in_flight();

        for row in rows {
            let paths = self.ctx.pathfinder.find_paths(
                &row.current_currency,
                row.current_amount,
                ends,
                blacklist,
                &in_flight,
            );
            let Some(best) = paths.into_iter().find(|p| p.to_amount() > row.init_amount) else {
                continue;
            };

            // Claim every residue on the same pair in one transactional
            // sweep; the intent starts with the combined amount.
            let claimed = match self
                .ctx
                .journal
                .take_unfilled(&row.init_currency, &row.current_currency)
                .await
            {
                Ok(claimed) if !claimed.is_empty() => claimed,
                Ok(_) => continue,
                Err(err) => {
                    warn!(error = %err, "unfilled claim failed");
                    continue;
                }
            };
            let total: Decimal = claimed.iter().map(|r| r.current_amount).sum();

            let mut markets = best.to_markets();
            if let crate::intent::markets::TranIntentMarket::PartiallyCompleted {
                from_amount,
                ..
            } = &mut markets[0]
            {
                *from_amount = total;
            }
            let tran = ActiveTransaction::new(Uuid::new_v4(), markets, 0);
            info!(
                id = %tran.id,
                currency = %row.current_currency,
                amount = %total,
                rows = claimed.len(),
                "starting recovery intent from unfilled residue"
            );
            if let Err(err) = self.ctx.journal.upsert_active(&tran).await {
                warn!(id = %tran.id, error = %err, "recovery intent journal write failed");
                continue;
            }
            spawn_intent(Arc::clone(&self.ctx), tran);
        }
    }
}
