//! Postgres journal over `sqlx`.
//!
//! Schema mirrors the row types in the parent module. The `markets` column
//! carries the versioned tagged JSON document; `from_currency` and
//! `from_amount` duplicate the current step for the indexed balance-in-use
//! query.

use std::collections::HashSet;
use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use polo_common::{Currency, Market, OrderType};
use polo_exchange::{OrderId, TradeId};
use rust_decimal::Decimal;
use sqlx::{PgPool, Postgres, Row, Transaction};
use tracing::debug;
use uuid::Uuid;

use crate::intent::markets::{MarketsDoc, TranIntentMarket};

use super::{
    ActiveTransaction, CompletedTransaction, Journal, JournalError, StepChild, UnfilledRemainder,
};

/// Journal backed by Postgres.
pub struct PgJournal {
    pool: PgPool,
}

impl PgJournal {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Create tables and indexes if missing.
    pub async fn ensure_schema(&self) -> Result<(), JournalError> {
        let statements = [
            r"CREATE TABLE IF NOT EXISTS active_transactions (
                id UUID PRIMARY KEY,
                markets TEXT NOT NULL,
                from_currency TEXT NOT NULL,
                from_amount NUMERIC(30, 8) NOT NULL,
                created_ts TIMESTAMPTZ NOT NULL
            )",
            r"CREATE INDEX IF NOT EXISTS idx_active_from_currency
                ON active_transactions (from_currency)",
            r"CREATE TABLE IF NOT EXISTS completed_transactions (
                id UUID PRIMARY KEY,
                markets TEXT NOT NULL,
                created_ts TIMESTAMPTZ NOT NULL,
                completed_ts TIMESTAMPTZ NOT NULL
            )",
            r"CREATE TABLE IF NOT EXISTS unfilled_markets (
                id UUID PRIMARY KEY,
                init_currency TEXT NOT NULL,
                init_amount NUMERIC(30, 8) NOT NULL,
                current_currency TEXT NOT NULL,
                current_amount NUMERIC(30, 8) NOT NULL
            )",
            r"CREATE INDEX IF NOT EXISTS idx_unfilled_pair
                ON unfilled_markets (init_currency, current_currency)",
            r"CREATE TABLE IF NOT EXISTS order_ids (
                transaction_id UUID NOT NULL,
                order_id BIGINT NOT NULL,
                market TEXT NOT NULL,
                order_type TEXT NOT NULL,
                last_trade_id BIGINT,
                ts TIMESTAMPTZ NOT NULL,
                PRIMARY KEY (transaction_id, order_id)
            )",
            r"CREATE INDEX IF NOT EXISTS idx_order_ids_market
                ON order_ids (market, order_type)",
            r"CREATE TABLE IF NOT EXISTS blacklisted_markets (
                market TEXT PRIMARY KEY,
                added_ts TIMESTAMPTZ NOT NULL,
                ttl_sec BIGINT NOT NULL
            )",
        ];
        for statement in statements {
            sqlx::query(statement).execute(&self.pool).await?;
        }
        debug!("journal schema ensured");
        Ok(())
    }
}

fn encode_markets(markets: &[TranIntentMarket], market_idx: usize) -> Result<String, JournalError> {
    Ok(serde_json::to_string(&MarketsDoc::new(
        market_idx,
        markets.to_vec(),
    ))?)
}

fn decode_markets(raw: &str) -> Result<(Vec<TranIntentMarket>, usize), JournalError> {
    let doc: MarketsDoc = serde_json::from_str(raw)?;
    Ok((doc.steps, doc.market_idx))
}

fn order_type_str(order_type: OrderType) -> &'static str {
    match order_type {
        OrderType::Buy => "buy",
        OrderType::Sell => "sell",
    }
}

async fn upsert_active_in(
    tx: &mut Transaction<'_, Postgres>,
    tran: &ActiveTransaction,
) -> Result<(), JournalError> {
    sqlx::query(
        r"INSERT INTO active_transactions (id, markets, from_currency, from_amount, created_ts)
          VALUES ($1, $2, $3, $4, $5)
          ON CONFLICT (id) DO UPDATE SET
              markets = EXCLUDED.markets,
              from_currency = EXCLUDED.from_currency,
              from_amount = EXCLUDED.from_amount",
    )
    .bind(tran.id)
    .bind(encode_markets(&tran.markets, tran.market_idx)?)
    .bind(tran.from_currency().to_string())
    .bind(tran.from_amount())
    .bind(tran.created_ts)
    .execute(&mut **tx)
    .await?;
    Ok(())
}

async fn insert_completed_in(
    tx: &mut Transaction<'_, Postgres>,
    tran: &ActiveTransaction,
    completed_ts: DateTime<Utc>,
) -> Result<(), JournalError> {
    sqlx::query(
        r"INSERT INTO completed_transactions (id, markets, created_ts, completed_ts)
          VALUES ($1, $2, $3, $4)
          ON CONFLICT (id) DO NOTHING",
    )
    .bind(tran.id)
    .bind(encode_markets(&tran.markets, tran.market_idx)?)
    .bind(tran.created_ts)
    .bind(completed_ts)
    .execute(&mut **tx)
    .await?;
    Ok(())
}

async fn delete_active_in(
    tx: &mut Transaction<'_, Postgres>,
    id: Uuid,
) -> Result<(), JournalError> {
    sqlx::query("DELETE FROM active_transactions WHERE id = $1")
        .bind(id)
        .execute(&mut **tx)
        .await?;
    Ok(())
}

#[async_trait]
impl Journal for PgJournal {
    async fn upsert_active(&self, tran: &ActiveTransaction) -> Result<(), JournalError> {
        let mut tx = self.pool.begin().await?;
        upsert_active_in(&mut tx, tran).await?;
        tx.commit().await?;
        Ok(())
    }

    async fn delete_active(&self, id: Uuid) -> Result<(), JournalError> {
        sqlx::query("DELETE FROM active_transactions WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn list_active(&self) -> Result<Vec<ActiveTransaction>, JournalError> {
        let rows = sqlx::query(
            "SELECT id, markets, created_ts FROM active_transactions ORDER BY created_ts",
        )
        .fetch_all(&self.pool)
        .await?;

        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            let raw: String = row.try_get("markets")?;
            let (markets, market_idx) = decode_markets(&raw)?;
            out.push(ActiveTransaction {
                id: row.try_get("id")?,
                markets,
                market_idx,
                created_ts: row.try_get("created_ts")?,
            });
        }
        Ok(out)
    }

    async fn amount_in_use(&self, currency: &Currency) -> Result<Decimal, JournalError> {
        let row = sqlx::query(
            "SELECT COALESCE(SUM(from_amount), 0) AS total
             FROM active_transactions WHERE from_currency = $1",
        )
        .bind(currency.to_string())
        .fetch_one(&self.pool)
        .await?;
        Ok(row.try_get("total")?)
    }

    async fn commit_step(
        &self,
        parent_id: Uuid,
        parent: Option<&ActiveTransaction>,
        child: &StepChild,
    ) -> Result<(), JournalError> {
        let mut tx = self.pool.begin().await?;
        match parent {
            Some(parent) => upsert_active_in(&mut tx, parent).await?,
            None => delete_active_in(&mut tx, parent_id).await?,
        }
        match child {
            StepChild::Active(child) => upsert_active_in(&mut tx, child).await?,
            StepChild::Completed(child) => {
                delete_active_in(&mut tx, child.id).await?;
                insert_completed_in(&mut tx, child, Utc::now()).await?;
            }
        }
        tx.commit().await?;
        Ok(())
    }

    async fn complete(&self, tran: &ActiveTransaction) -> Result<(), JournalError> {
        let mut tx = self.pool.begin().await?;
        delete_active_in(&mut tx, tran.id).await?;
        insert_completed_in(&mut tx, tran, Utc::now()).await?;
        tx.commit().await?;
        Ok(())
    }

    async fn list_completed(&self) -> Result<Vec<CompletedTransaction>, JournalError> {
        let rows = sqlx::query(
            "SELECT id, markets, created_ts, completed_ts
             FROM completed_transactions ORDER BY completed_ts",
        )
        .fetch_all(&self.pool)
        .await?;

        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            let raw: String = row.try_get("markets")?;
            let (markets, _) = decode_markets(&raw)?;
            out.push(CompletedTransaction {
                id: row.try_get("id")?,
                markets,
                created_ts: row.try_get("created_ts")?,
                completed_ts: row.try_get("completed_ts")?,
            });
        }
        Ok(out)
    }

    async fn move_active_to_unfilled(
        &self,
        id: Uuid,
        row: &UnfilledRemainder,
    ) -> Result<(), JournalError> {
        let mut tx = self.pool.begin().await?;
        delete_active_in(&mut tx, id).await?;
        sqlx::query(
            r"INSERT INTO unfilled_markets
                  (id, init_currency, init_amount, current_currency, current_amount)
              VALUES ($1, $2, $3, $4, $5)
              ON CONFLICT (id) DO UPDATE SET
                  init_amount = EXCLUDED.init_amount,
                  current_amount = EXCLUDED.current_amount",
        )
        .bind(row.id)
        .bind(row.init_currency.to_string())
        .bind(row.init_amount)
        .bind(row.current_currency.to_string())
        .bind(row.current_amount)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(())
    }

    async fn take_unfilled(
        &self,
        init_currency: &Currency,
        current_currency: &Currency,
    ) -> Result<Vec<UnfilledRemainder>, JournalError> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("SET TRANSACTION ISOLATION LEVEL REPEATABLE READ")
            .execute(&mut *tx)
            .await?;

        let rows = sqlx::query(
            r"SELECT id, init_currency, init_amount, current_currency, current_amount
              FROM unfilled_markets
              WHERE init_currency = $1 AND current_currency = $2
              FOR UPDATE",
        )
        .bind(init_currency.to_string())
        .bind(current_currency.to_string())
        .fetch_all(&mut *tx)
        .await?;

        let mut out = Vec::with_capacity(rows.len());
        let mut ids = Vec::with_capacity(rows.len());
        for row in rows {
            let id: Uuid = row.try_get("id")?;
            ids.push(id);
            let init: String = row.try_get("init_currency")?;
            let current: String = row.try_get("current_currency")?;
            out.push(UnfilledRemainder {
                id,
                init_currency: Currency::from(init.as_str()),
                init_amount: row.try_get("init_amount")?,
                current_currency: Currency::from(current.as_str()),
                current_amount: row.try_get("current_amount")?,
            });
        }
        if !ids.is_empty() {
            sqlx::query("DELETE FROM unfilled_markets WHERE id = ANY($1)")
                .bind(&ids)
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;
        Ok(out)
    }

    async fn list_unfilled(&self) -> Result<Vec<UnfilledRemainder>, JournalError> {
        let rows = sqlx::query(
            r"SELECT id, init_currency, init_amount, current_currency, current_amount
              FROM unfilled_markets",
        )
        .fetch_all(&self.pool)
        .await?;

        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            let init: String = row.try_get("init_currency")?;
            let current: String = row.try_get("current_currency")?;
            out.push(UnfilledRemainder {
                id: row.try_get("id")?,
                init_currency: Currency::from(init.as_str()),
                init_amount: row.try_get("init_amount")?,
                current_currency: Currency::from(current.as_str()),
                current_amount: row.try_get("current_amount")?,
            });
        }
        Ok(out)
    }

    async fn record_order_id(
        &self,
        tran_id: Uuid,
        market: &Market,
        order_type: OrderType,
        order_id: OrderId,
    ) -> Result<(), JournalError> {
        sqlx::query(
            r"INSERT INTO order_ids (transaction_id, order_id, market, order_type, ts)
              VALUES ($1, $2, $3, $4, $5)
              ON CONFLICT (transaction_id, order_id) DO NOTHING",
        )
        .bind(tran_id)
        .bind(order_id as i64)
        .bind(market.to_string())
        .bind(order_type_str(order_type))
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn note_trade_seen(
        &self,
        market: &Market,
        order_type: OrderType,
        order_id: OrderId,
        trade_id: TradeId,
    ) -> Result<(), JournalError> {
        sqlx::query(
            r"UPDATE order_ids
              SET last_trade_id = GREATEST(COALESCE(last_trade_id, 0), $1)
              WHERE order_id = $2 AND market = $3 AND order_type = $4",
        )
        .bind(trade_id as i64)
        .bind(order_id as i64)
        .bind(market.to_string())
        .bind(order_type_str(order_type))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn open_orders(
        &self,
        market: &Market,
        order_type: OrderType,
    ) -> Result<Vec<(OrderId, Option<TradeId>)>, JournalError> {
        let rows = sqlx::query(
            r"SELECT order_id, MAX(last_trade_id) AS last_trade_id, MIN(ts) AS first_ts
              FROM order_ids
              WHERE market = $1 AND order_type = $2
              GROUP BY order_id
              ORDER BY first_ts",
        )
        .bind(market.to_string())
        .bind(order_type_str(order_type))
        .fetch_all(&self.pool)
        .await?;

        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            let order_id: i64 = row.try_get("order_id")?;
            let watermark: Option<i64> = row.try_get("last_trade_id")?;
            out.push((order_id as OrderId, watermark.map(|w| w as TradeId)));
        }
        Ok(out)
    }

    async fn clear_market_orders(
        &self,
        market: &Market,
        order_type: OrderType,
    ) -> Result<(), JournalError> {
        sqlx::query("DELETE FROM order_ids WHERE market = $1 AND order_type = $2")
            .bind(market.to_string())
            .bind(order_type_str(order_type))
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn clear_transaction_orders(&self, tran_id: Uuid) -> Result<(), JournalError> {
        sqlx::query("DELETE FROM order_ids WHERE transaction_id = $1")
            .bind(tran_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn add_blacklisted(&self, market: &Market, ttl: Duration) -> Result<(), JournalError> {
        sqlx::query(
            r"INSERT INTO blacklisted_markets (market, added_ts, ttl_sec)
              VALUES ($1, $2, $3)
              ON CONFLICT (market) DO UPDATE SET
                  added_ts = EXCLUDED.added_ts,
                  ttl_sec = EXCLUDED.ttl_sec",
        )
        .bind(market.to_string())
        .bind(Utc::now())
        .bind(ttl.as_secs() as i64)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn blacklisted_markets(&self) -> Result<HashSet<Market>, JournalError> {
        sqlx::query("DELETE FROM blacklisted_markets WHERE added_ts + ttl_sec * INTERVAL '1 second' < NOW()")
            .execute(&self.pool)
            .await?;

        let rows = sqlx::query("SELECT market FROM blacklisted_markets")
            .fetch_all(&self.pool)
            .await?;

        let mut out = HashSet::with_capacity(rows.len());
        for row in rows {
            let raw: String = row.try_get("market")?;
            if let Ok(market) = Market::from_str(&raw) {
                out.insert(market);
            }
        }
        Ok(out)
    }
}
