//! In-memory journal for integration tests and dry runs.
//!
//! Same contract as the Postgres journal with a single mutex standing in
//! for database transactions.

use std::collections::{HashMap, HashSet};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use polo_common::{Currency, Market, OrderType};
use polo_exchange::{OrderId, TradeId};
use rust_decimal::Decimal;
use uuid::Uuid;

use super::{
    ActiveTransaction, CompletedTransaction, Journal, JournalError, StepChild, UnfilledRemainder,
};

#[derive(Default)]
struct MemState {
    active: HashMap<Uuid, ActiveTransaction>,
    completed: HashMap<Uuid, CompletedTransaction>,
    unfilled: HashMap<Uuid, UnfilledRemainder>,
    // (tran_id, order_id) -> (market, order_type, watermark, recorded_at)
    order_ids: HashMap<(Uuid, OrderId), (Market, OrderType, Option<TradeId>, DateTime<Utc>)>,
    blacklist: HashMap<Market, (DateTime<Utc>, Duration)>,
}

/// Journal kept entirely in process memory.
#[derive(Default)]
pub struct MemJournal {
    state: Mutex<MemState>,
}

impl MemJournal {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MemState> {
        self.state.lock().expect("memory journal lock poisoned")
    }
}

#[async_trait]
impl Journal for MemJournal {
    async fn upsert_active(&self, tran: &ActiveTransaction) -> Result<(), JournalError> {
        self.lock().active.insert(tran.id, tran.clone());
        Ok(())
    }

    async fn delete_active(&self, id: Uuid) -> Result<(), JournalError> {
        self.lock().active.remove(&id);
        Ok(())
    }

    async fn list_active(&self) -> Result<Vec<ActiveTransaction>, JournalError> {
        let mut rows: Vec<_> = self.lock().active.values().cloned().collect();
        rows.sort_by_key(|t| t.created_ts);
        Ok(rows)
    }

    async fn amount_in_use(&self, currency: &Currency) -> Result<Decimal, JournalError> {
        Ok(self
            .lock()
            .active
            .values()
            .filter(|t| t.from_currency() == *currency)
            .map(|t| t.from_amount())
            .sum())
    }

    async fn commit_step(
        &self,
        parent_id: Uuid,
        parent: Option<&ActiveTransaction>,
        child: &StepChild,
    ) -> Result<(), JournalError> {
        let mut state = self.lock();
        match parent {
            Some(parent) => {
                state.active.insert(parent.id, parent.clone());
            }
            None => {
                state.active.remove(&parent_id);
            }
        }
        match child {
            StepChild::Active(child) => {
                state.active.insert(child.id, child.clone());
            }
            StepChild::Completed(child) => {
                state.active.remove(&child.id);
                state.completed.insert(
                    child.id,
                    CompletedTransaction {
                        id: child.id,
                        markets: child.markets.clone(),
                        created_ts: child.created_ts,
                        completed_ts: Utc::now(),
                    },
                );
            }
        }
        Ok(())
    }

    async fn complete(&self, tran: &ActiveTransaction) -> Result<(), JournalError> {
        let mut state = self.lock();
        state.active.remove(&tran.id);
        state.completed.insert(
            tran.id,
            CompletedTransaction {
                id: tran.id,
                markets: tran.markets.clone(),
                created_ts: tran.created_ts,
                completed_ts: Utc::now(),
            },
        );
        Ok(())
    }

    async fn list_completed(&self) -> Result<Vec<CompletedTransaction>, JournalError> {
        let mut rows: Vec<_> = self.lock().completed.values().cloned().collect();
        rows.sort_by_key(|t| t.completed_ts);
        Ok(rows)
    }

    async fn move_active_to_unfilled(
        &self,
        id: Uuid,
        row: &UnfilledRemainder,
    ) -> Result<(), JournalError> {
        let mut state = self.lock();
        state.active.remove(&id);
        state.unfilled.insert(row.id, row.clone());
        Ok(())
    }

    async fn take_unfilled(
        &self,
        init_currency: &Currency,
        current_currency: &Currency,
    ) -> Result<Vec<UnfilledRemainder>, JournalError> {
        let mut state = self.lock();
        let ids: Vec<Uuid> = state
            .unfilled
            .values()
            .filter(|r| {
                r.init_currency == *init_currency && r.current_currency == *current_currency
            })
            .map(|r| r.id)
            .collect();
        Ok(ids
            .into_iter()
            .filter_map(|id| state.unfilled.remove(&id))
            .collect())
    }

    async fn list_unfilled(&self) -> Result<Vec<UnfilledRemainder>, JournalError> {
        Ok(self.lock().unfilled.values().cloned().collect())
    }

    async fn record_order_id(
        &self,
        tran_id: Uuid,
        market: &Market,
        order_type: OrderType,
        order_id: OrderId,
    ) -> Result<(), JournalError> {
        self.lock().order_ids.insert(
            (tran_id, order_id),
            (market.clone(), order_type, None, Utc::now()),
        );
        Ok(())
    }

    async fn note_trade_seen(
        &self,
        market: &Market,
        order_type: OrderType,
        order_id: OrderId,
        trade_id: TradeId,
    ) -> Result<(), JournalError> {
        let mut state = self.lock();
        for ((_, oid), (m, ot, watermark, _)) in state.order_ids.iter_mut() {
            if *oid == order_id && m == market && *ot == order_type {
                *watermark = Some(watermark.map_or(trade_id, |w: TradeId| w.max(trade_id)));
            }
        }
        Ok(())
    }

    async fn open_orders(
        &self,
        market: &Market,
        order_type: OrderType,
    ) -> Result<Vec<(OrderId, Option<TradeId>)>, JournalError> {
        let state = self.lock();
        let mut rows: Vec<(OrderId, Option<TradeId>, DateTime<Utc>)> = Vec::new();
        for ((_, order_id), (m, ot, watermark, ts)) in state.order_ids.iter() {
            if m == market && *ot == order_type {
                match rows.iter_mut().find(|(oid, _, _)| oid == order_id) {
                    Some((_, existing, _)) => {
                        *existing = match (*existing, *watermark) {
                            (Some(a), Some(b)) => Some(a.max(b)),
                            (a, b) => a.or(b),
                        };
                    }
                    None => rows.push((*order_id, *watermark, *ts)),
                }
            }
        }
        rows.sort_by_key(|(_, _, ts)| *ts);
        Ok(rows.into_iter().map(|(id, w, _)| (id, w)).collect())
    }

    async fn clear_market_orders(
        &self,
        market: &Market,
        order_type: OrderType,
    ) -> Result<(), JournalError> {
        self.lock()
            .order_ids
            .retain(|_, (m, ot, _, _)| !(m == market && *ot == order_type));
        Ok(())
    }

    async fn clear_transaction_orders(&self, tran_id: Uuid) -> Result<(), JournalError> {
        self.lock().order_ids.retain(|(tid, _), _| *tid != tran_id);
        Ok(())
    }

    async fn add_blacklisted(&self, market: &Market, ttl: Duration) -> Result<(), JournalError> {
        self.lock()
            .blacklist
            .insert(market.clone(), (Utc::now(), ttl));
        Ok(())
    }

    async fn blacklisted_markets(&self) -> Result<HashSet<Market>, JournalError> {
        let mut state = self.lock();
        let now = Utc::now();
        state.blacklist.retain(|_, (added, ttl)| {
            now.signed_duration_since(*added).num_seconds() < ttl.as_secs() as i64
        });
        Ok(state.blacklist.keys().cloned().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::intent::markets::TranIntentMarket;
    use polo_common::{CurrencyType, OrderSpeed};
    use rust_decimal_macros::dec;

    fn tran(from_amount: Decimal) -> ActiveTransaction {
        ActiveTransaction::new(
            Uuid::new_v4(),
            vec![TranIntentMarket::PartiallyCompleted {
                market: Market::of("USDT", "BTC"),
                speed: OrderSpeed::Delayed,
                from_currency_type: CurrencyType::Base,
                from_amount,
            }],
            0,
        )
    }

    #[tokio::test]
    async fn test_active_round_trip_and_in_use() {
        let journal = MemJournal::new();
        let a = tran(dec!(30));
        let b = tran(dec!(20));
        journal.upsert_active(&a).await.unwrap();
        journal.upsert_active(&b).await.unwrap();

        assert_eq!(journal.list_active().await.unwrap().len(), 2);
        assert_eq!(
            journal.amount_in_use(&Currency::from("USDT")).await.unwrap(),
            dec!(50)
        );
        assert_eq!(
            journal.amount_in_use(&Currency::from("BTC")).await.unwrap(),
            Decimal::ZERO
        );

        journal.delete_active(a.id).await.unwrap();
        assert_eq!(journal.list_active().await.unwrap(), vec![b]);
    }

    #[tokio::test]
    async fn test_take_unfilled_claims_once() {
        let journal = MemJournal::new();
        let row = UnfilledRemainder {
            id: Uuid::new_v4(),
            init_currency: Currency::from("USDT"),
            init_amount: dec!(5),
            current_currency: Currency::from("BTC"),
            current_amount: dec!(0.0005),
        };
        journal
            .move_active_to_unfilled(Uuid::new_v4(), &row)
            .await
            .unwrap();

        let claimed = journal
            .take_unfilled(&Currency::from("USDT"), &Currency::from("BTC"))
            .await
            .unwrap();
        assert_eq!(claimed, vec![row]);
        assert!(journal
            .take_unfilled(&Currency::from("USDT"), &Currency::from("BTC"))
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn test_order_id_watermarks() {
        let journal = MemJournal::new();
        let market = Market::of("USDT", "BTC");
        let tran_id = Uuid::new_v4();
        journal
            .record_order_id(tran_id, &market, OrderType::Buy, 42)
            .await
            .unwrap();
        journal
            .note_trade_seen(&market, OrderType::Buy, 42, 7)
            .await
            .unwrap();
        journal
            .note_trade_seen(&market, OrderType::Buy, 42, 5)
            .await
            .unwrap();

        let open = journal.open_orders(&market, OrderType::Buy).await.unwrap();
        assert_eq!(open, vec![(42, Some(7))]);

        journal
            .clear_market_orders(&market, OrderType::Buy)
            .await
            .unwrap();
        assert!(journal
            .open_orders(&market, OrderType::Buy)
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn test_blacklist_expires() {
        let journal = MemJournal::new();
        let market = Market::of("USDT", "XMR");
        journal
            .add_blacklisted(&market, Duration::from_secs(3600))
            .await
            .unwrap();
        assert!(journal
            .blacklisted_markets()
            .await
            .unwrap()
            .contains(&market));

        journal
            .add_blacklisted(&market, Duration::from_secs(0))
            .await
            .unwrap();
        assert!(!journal
            .blacklisted_markets()
            .await
            .unwrap()
            .contains(&market));
    }
}
