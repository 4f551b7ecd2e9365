//! Per-(market, side) trade scheduler.
//!
//! Maps each registered path to its share of the pooled post-only order and
//! attributes incoming trades back to paths in registration order. The
//! pooled `common` from-amount is published on a watch channel that drives
//! the delayed-trade processor; all mutations share one mutex so the
//! attribution walk observes a stable entry order.

use polo_common::{from_amount, split_trade, AmountType, BareTrade, Market, OrderType};
use rust_decimal::Decimal;
use tokio::sync::{mpsc, oneshot, watch, Mutex};
use tracing::{debug, error, warn};
use uuid::Uuid;

struct Entry {
    id: Uuid,
    remaining: Decimal,
    out: mpsc::UnboundedSender<BareTrade>,
    /// Set when the path asked to leave; cleared by removal. Exiting
    /// entries still receive fills already in flight but no longer count
    /// toward the pooled amount.
    exit_ack: Option<oneshot::Sender<()>>,
}

impl Entry {
    fn exiting(&self) -> bool {
        self.exit_ack.is_some()
    }
}

#[derive(Default)]
struct Inner {
    entries: Vec<Entry>,
}

impl Inner {
    /// Pooled amount: the sum over non-exiting entries.
    fn common(&self) -> Decimal {
        self.entries
            .iter()
            .filter(|e| !e.exiting())
            .map(|e| e.remaining)
            .sum()
    }
}

/// Registry of paths pooling one exchange order.
pub struct TradeScheduler {
    market: Market,
    order_type: OrderType,
    inner: Mutex<Inner>,
    common_tx: watch::Sender<Decimal>,
}

impl TradeScheduler {
    pub fn new(market: Market, order_type: OrderType) -> Self {
        let (common_tx, _) = watch::channel(Decimal::ZERO);
        Self {
            market,
            order_type,
            inner: Mutex::new(Inner::default()),
            common_tx,
        }
    }

    pub fn market(&self) -> &Market {
        &self.market
    }

    pub fn order_type(&self) -> OrderType {
        self.order_type
    }

    /// Watch channel carrying the pooled from-amount.
    pub fn common_stream(&self) -> watch::Receiver<Decimal> {
        self.common_tx.subscribe()
    }

    pub fn common_amount(&self) -> Decimal {
        *self.common_tx.borrow()
    }

    /// Add a path with zero reservation.
    pub async fn register(&self, id: Uuid, out: mpsc::UnboundedSender<BareTrade>) {
        let mut inner = self.inner.lock().await;
        debug_assert!(inner.entries.iter().all(|e| e.id != id));
        inner.entries.push(Entry {
            id,
            remaining: Decimal::ZERO,
            out,
            exit_ack: None,
        });
    }

    /// Raise a path's reservation. Rejected when the path is not
    /// registered, is leaving, or its output channel is gone.
    pub async fn add_amount(&self, id: Uuid, delta: Decimal) -> bool {
        let mut inner = self.inner.lock().await;
        let Some(entry) = inner.entries.iter_mut().find(|e| e.id == id) else {
            return false;
        };
        if entry.exiting() || entry.out.is_closed() {
            return false;
        }
        entry.remaining += delta;
        let common = inner.common();
        drop(inner);
        let _ = self.common_tx.send(common);
        true
    }

    /// Two-phase removal: the path's share leaves the pooled amount
    /// immediately, but the entry is only removed once the processor has
    /// resized the live order and approved the exit. Fills that were
    /// already in flight still reach the path until then.
    pub async fn unregister(&self, id: Uuid) {
        let ack_rx = {
            let mut inner = self.inner.lock().await;
            let Some(pos) = inner.entries.iter().position(|e| e.id == id) else {
                return;
            };
            if inner.entries[pos].remaining.is_zero() {
                // Nothing reserved: no order capacity to shrink.
                inner.entries.remove(pos);
                let common = inner.common();
                drop(inner);
                let _ = self.common_tx.send(common);
                return;
            }
            let (ack_tx, ack_rx) = oneshot::channel();
            inner.entries[pos].exit_ack = Some(ack_tx);
            let common = inner.common();
            drop(inner);
            let _ = self.common_tx.send(common);
            ack_rx
        };
        let _ = ack_rx.await;
    }

    /// Processor-side safe point: the live order now matches the pooled
    /// amount, so pending exits can be completed and their channels closed.
    pub async fn approve_exits(&self) {
        let mut inner = self.inner.lock().await;
        let mut i = 0;
        while i < inner.entries.len() {
            if inner.entries[i].exiting() {
                let entry = inner.entries.remove(i);
                if let Some(ack) = entry.exit_ack {
                    let _ = ack.send(());
                }
            } else {
                i += 1;
            }
        }
    }

    /// Force-close every path; used on a fatal processor error.
    pub async fn unregister_all(&self) {
        let mut inner = self.inner.lock().await;
        for entry in inner.entries.drain(..) {
            if let Some(ack) = entry.exit_ack {
                let _ = ack.send(());
            }
            // Dropping the sender closes the path's trade channel.
        }
        drop(inner);
        let _ = self.common_tx.send(Decimal::ZERO);
    }

    /// Paths currently registered, in insertion order.
    pub async fn registered_ids(&self) -> Vec<Uuid> {
        self.inner.lock().await.entries.iter().map(|e| e.id).collect()
    }

    /// Attribute executed trades to paths.
    ///
    /// A trade that fits a single path's remaining share goes to the first
    /// such path whole. A larger trade is split across paths in
    /// registration order via the amount calculator. Leftover that no path
    /// reserved is an invariant violation and is logged.
    pub async fn add_trades(&self, trades: Vec<BareTrade>) {
        let mut inner = self.inner.lock().await;
        for trade in trades {
            self.attribute(&mut inner, trade);
        }
        let common = inner.common();
        drop(inner);
        let _ = self.common_tx.send(common);
    }

    fn attribute(&self, inner: &mut Inner, trade: BareTrade) {
        let trade_from = from_amount(self.order_type, &trade);

        // Full fit: first entry in insertion order that can absorb it.
        if let Some(pos) = inner
            .entries
            .iter()
            .position(|e| trade_from <= e.remaining)
        {
            let entry = &mut inner.entries[pos];
            entry.remaining -= trade_from;
            let _ = entry.out.send(trade);
            if entry.remaining.is_zero() {
                let entry = inner.entries.remove(pos);
                if let Some(ack) = entry.exit_ack {
                    let _ = ack.send(());
                }
            }
            return;
        }

        // Larger than any single share: split across non-exiting entries.
        let mut rest = vec![trade];
        let mut pos = 0;
        while pos < inner.entries.len() {
            if inner.entries[pos].exiting() || inner.entries[pos].remaining.is_zero() {
                pos += 1;
                continue;
            }
            let share = inner.entries[pos].remaining;
            let rest_from: Decimal = rest
                .iter()
                .map(|t| from_amount(self.order_type, t))
                .sum();
            if rest_from <= share {
                // The tail fits entirely in this entry.
                let entry = &mut inner.entries[pos];
                entry.remaining -= rest_from;
                for t in rest.drain(..) {
                    let _ = entry.out.send(t);
                }
                if entry.remaining.is_zero() {
                    let entry = inner.entries.remove(pos);
                    if let Some(ack) = entry.exit_ack {
                        let _ = ack.send(());
                    }
                }
                return;
            }

            // Cut the first real trade of the tail at this entry's share.
            let mut carried = Vec::new();
            let mut to_dispatch = Vec::new();
            let mut still = share;
            for t in rest.drain(..) {
                let t_from = from_amount(self.order_type, &t);
                if still.is_zero() {
                    carried.push(t);
                } else if t_from <= still {
                    still -= t_from;
                    to_dispatch.push(t);
                } else {
                    let split = split_trade(&t, AmountType::From, self.order_type, still);
                    to_dispatch.extend(split.target);
                    carried.extend(split.remainder);
                    still = Decimal::ZERO;
                }
            }
            rest = carried;

            let entry = inner.entries.remove(pos);
            for t in &to_dispatch {
                let _ = entry.out.send(*t);
            }
            if let Some(ack) = entry.exit_ack {
                let _ = ack.send(());
            }
            // Entry fully consumed and removed; `pos` now points at the
            // next entry.
        }

        let leftover: Decimal = rest
            .iter()
            .map(|t| from_amount(self.order_type, t))
            .sum();
        if leftover.abs() > Decimal::ZERO {
            error!(
                market = %self.market,
                order_type = %self.order_type,
                %leftover,
                "unattributable trade amount: order size exceeded pooled reservations"
            );
        } else if !rest.is_empty() {
            warn!(
                market = %self.market,
                order_type = %self.order_type,
                "dropping residual zero-amount adjustment trades"
            );
        }
        debug!(market = %self.market, order_type = %self.order_type, "trade attribution complete");
    }
}
