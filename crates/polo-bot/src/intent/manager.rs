//! Index of live intents.
//!
//! Supports the two lookups the engine needs: by id for removal, and by
//! (chain shape, current index) for merging a new intent into an existing
//! one instead of competing with it.

use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use dashmap::DashMap;
use polo_common::Currency;
use rust_decimal::Decimal;
use tokio::sync::{mpsc, oneshot, watch};
use uuid::Uuid;

/// Request to fold more amount into a running intent. `ack` reports
/// whether the intent's processor accepted the raise.
#[derive(Debug)]
pub struct MergeRequest {
    pub init_delta: Decimal,
    pub current_delta: Decimal,
    pub ack: oneshot::Sender<bool>,
}

/// Handle to one live intent.
///
/// Shape, index and current currency track the running intent: a full
/// fill advances the index, a re-plan rewrites the shape.
pub struct IntentHandle {
    pub id: Uuid,
    shape: AtomicU64,
    market_idx: AtomicUsize,
    pub init_currency: Currency,
    current_currency: Mutex<Currency>,
    merge_tx: mpsc::Sender<MergeRequest>,
    cancel_tx: watch::Sender<bool>,
}

impl IntentHandle {
    pub fn shape(&self) -> u64 {
        self.shape.load(Ordering::Relaxed)
    }

    pub fn set_shape(&self, shape: u64) {
        self.shape.store(shape, Ordering::Relaxed);
    }

    pub fn market_idx(&self) -> usize {
        self.market_idx.load(Ordering::Relaxed)
    }

    pub fn current_currency(&self) -> Currency {
        self.current_currency
            .lock()
            .expect("intent handle lock poisoned")
            .clone()
    }

    /// Called when a full fill advances the intent to its next step.
    pub fn advance(&self, market_idx: usize, current_currency: Currency) {
        self.market_idx.store(market_idx, Ordering::Relaxed);
        *self
            .current_currency
            .lock()
            .expect("intent handle lock poisoned") = current_currency;
    }

    /// Ask the running intent to absorb `(init_delta, current_delta)`.
    /// False when the intent refused or is already gone.
    pub async fn try_merge(&self, init_delta: Decimal, current_delta: Decimal) -> bool {
        let (ack_tx, ack_rx) = oneshot::channel();
        if self
            .merge_tx
            .send(MergeRequest {
                init_delta,
                current_delta,
                ack: ack_tx,
            })
            .await
            .is_err()
        {
            return false;
        }
        ack_rx.await.unwrap_or(false)
    }

    /// Cooperative cancellation; the intent finishes its cleanup and
    /// persists its final state before exiting.
    pub fn cancel(&self) {
        let _ = self.cancel_tx.send(true);
    }

    pub fn cancel_stream(&self) -> watch::Receiver<bool> {
        self.cancel_tx.subscribe()
    }
}

/// Thread-safe set of live intents.
#[derive(Default)]
pub struct IntentManager {
    intents: DashMap<Uuid, Arc<IntentHandle>>,
}

impl IntentManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new live intent. Returns `None` when the id is already
    /// live (recovery resuming the same journal twice is a no-op), else
    /// the merge channel receiver for the intent task.
    #[allow(clippy::type_complexity)]
    pub fn add(
        &self,
        id: Uuid,
        shape: u64,
        market_idx: usize,
        init_currency: Currency,
        current_currency: Currency,
    ) -> Option<(Arc<IntentHandle>, mpsc::Receiver<MergeRequest>)> {
        if self.intents.contains_key(&id) {
            return None;
        }
        let (merge_tx, merge_rx) = mpsc::channel(16);
        let (cancel_tx, _) = watch::channel(false);
        let handle = Arc::new(IntentHandle {
            id,
            shape: AtomicU64::new(shape),
            market_idx: AtomicUsize::new(market_idx),
            init_currency,
            current_currency: Mutex::new(current_currency),
            merge_tx,
            cancel_tx,
        });
        self.intents.insert(id, Arc::clone(&handle));
        Some((handle, merge_rx))
    }

    pub fn remove(&self, id: Uuid) {
        self.intents.remove(&id);
    }

    pub fn get(&self, id: Uuid) -> Option<Arc<IntentHandle>> {
        self.intents.get(&id).map(|h| Arc::clone(&h))
    }

    /// An intent with the same chain shape at the same step, other than
    /// the asker itself.
    pub fn merge_candidate(
        &self,
        shape: u64,
        market_idx: usize,
        exclude: Uuid,
    ) -> Option<Arc<IntentHandle>> {
        self.intents
            .iter()
            .find(|h| h.shape() == shape && h.market_idx() == market_idx && h.id != exclude)
            .map(|h| Arc::clone(&h))
    }

    /// An intent that started from `init_currency` and currently holds
    /// `current_currency`; used to re-home unfilled residue.
    pub fn residue_candidate(
        &self,
        init_currency: &Currency,
        current_currency: &Currency,
        exclude: Uuid,
    ) -> Option<Arc<IntentHandle>> {
        self.intents
            .iter()
            .find(|h| {
                h.id != exclude
                    && h.init_currency == *init_currency
                    && h.current_currency() == *current_currency
            })
            .map(|h| Arc::clone(&h))
    }

    /// Shapes of every live intent; the path finder filters these out.
    pub fn shapes_in_flight(&self) -> HashSet<u64> {
        self.intents.iter().map(|h| h.shape()).collect()
    }

    pub fn ids(&self) -> Vec<Uuid> {
        self.intents.iter().map(|h| h.id).collect()
    }

    pub fn cancel_all(&self) {
        for handle in self.intents.iter() {
            handle.cancel();
        }
    }

    pub fn len(&self) -> usize {
        self.intents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.intents.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_add_is_idempotent_per_id() {
        let manager = IntentManager::new();
        let id = Uuid::new_v4();
        let usdt = Currency::from("USDT");
        let btc = Currency::from("BTC");

        assert!(manager
            .add(id, 7, 0, usdt.clone(), usdt.clone())
            .is_some());
        assert!(manager.add(id, 7, 0, usdt.clone(), btc).is_none());
        assert_eq!(manager.len(), 1);
    }

    #[tokio::test]
    async fn test_merge_candidate_excludes_self() {
        let manager = IntentManager::new();
        let usdt = Currency::from("USDT");
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        manager.add(a, 7, 1, usdt.clone(), usdt.clone()).unwrap();
        manager.add(b, 7, 1, usdt.clone(), usdt.clone()).unwrap();

        let found = manager.merge_candidate(7, 1, a).unwrap();
        assert_eq!(found.id, b);
        assert!(manager.merge_candidate(7, 0, a).is_none());
        assert!(manager.merge_candidate(9, 1, a).is_none());
    }

    #[tokio::test]
    async fn test_try_merge_reaches_task_and_acks() {
        let manager = IntentManager::new();
        let usdt = Currency::from("USDT");
        let id = Uuid::new_v4();
        let (handle, mut merge_rx) = manager.add(id, 7, 0, usdt.clone(), usdt).unwrap();

        let responder = tokio::spawn(async move {
            let req = merge_rx.recv().await.unwrap();
            assert_eq!(req.init_delta, Decimal::from(5));
            let _ = req.ack.send(true);
        });

        assert!(handle.try_merge(Decimal::from(5), Decimal::from(5)).await);
        responder.await.unwrap();
    }

    #[tokio::test]
    async fn test_try_merge_fails_when_task_gone() {
        let manager = IntentManager::new();
        let usdt = Currency::from("USDT");
        let id = Uuid::new_v4();
        let (handle, merge_rx) = manager.add(id, 7, 0, usdt.clone(), usdt).unwrap();
        drop(merge_rx);

        assert!(!handle.try_merge(Decimal::ONE, Decimal::ONE).await);
    }

    #[tokio::test]
    async fn test_shapes_in_flight() {
        let manager = IntentManager::new();
        let usdt = Currency::from("USDT");
        manager
            .add(Uuid::new_v4(), 7, 0, usdt.clone(), usdt.clone())
            .unwrap();
        manager
            .add(Uuid::new_v4(), 9, 0, usdt.clone(), usdt)
            .unwrap();

        let shapes = manager.shapes_in_flight();
        assert!(shapes.contains(&7) && shapes.contains(&9));
    }
}
