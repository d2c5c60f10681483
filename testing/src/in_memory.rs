//! In-memory lot store.
//!
//! Every transaction holds one mutex over all tables for its whole lifetime,
//! so transactions are serialized by construction. Writes go to a working
//! copy that replaces the tables on commit; dropping the transaction
//! discards it.

use lotes_core::coordinator::LotControllers;
use lotes_core::error::{DomainError, Result};
use lotes_core::priority::PriorityLifecycle;
use lotes_core::promotion::PromotionLifecycle;
use lotes_core::reservation::ReservationLifecycle;
use lotes_core::store::{ChildRef, LotStore, LotTransaction};
use lotes_core::types::{
    HoldId, Lot, LotId, Offer, PriorityHold, Promotion, PromotionId, Reservation, ReservationId,
    Sale, SaleId,
};
use chrono::{DateTime, Utc};
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::sync::{Mutex, OwnedMutexGuard};

#[derive(Clone, Debug, Default)]
struct Tables {
    lots: HashMap<LotId, Lot>,
    holds: HashMap<HoldId, PriorityHold>,
    reservations: HashMap<ReservationId, Reservation>,
    sales: HashMap<SaleId, Sale>,
    promotions: HashMap<PromotionId, Promotion>,
    offers: Vec<Offer>,
}

impl Tables {
    fn offers_for(&self, reservation: ReservationId) -> Vec<Offer> {
        let mut offers: Vec<Offer> = self
            .offers
            .iter()
            .filter(|offer| offer.reservation_id == reservation)
            .cloned()
            .collect();
        offers.sort_by_key(|offer| (offer.created_at, offer.sequence));
        offers
    }
}

/// In-memory [`LotStore`] for fast, deterministic tests.
///
/// Clones share the same tables.
///
/// # Example
///
/// ```
/// use lotes_testing::InMemoryLotStore;
/// use lotes_core::store::{LotStore, LotTransaction};
/// use lotes_core::types::{Lot, LotId, Money};
///
/// # async fn example() -> lotes_core::error::Result<()> {
/// let store = InMemoryLotStore::new();
/// let lot = Lot::new(LotId::new(), Money::from_units(18_000), 300.0);
/// store.insert_lot(&lot).await?;
///
/// let mut tx = store.begin().await?;
/// assert_eq!(tx.lock_lot(lot.id).await?.id, lot.id);
/// # Ok(())
/// # }
/// ```
#[derive(Clone, Debug, Default)]
pub struct InMemoryLotStore {
    tables: Arc<Mutex<Tables>>,
    failing_commits: Arc<AtomicUsize>,
}

impl InMemoryLotStore {
    /// Create an empty store
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `count` commits fail with
    /// [`DomainError::Contention`], as if a concurrent writer won the race.
    pub fn fail_next_commits(&self, count: usize) {
        self.failing_commits.store(count, Ordering::SeqCst);
    }

    /// Committed state of a lot
    pub async fn lot(&self, id: LotId) -> Option<Lot> {
        self.tables.lock().await.lots.get(&id).cloned()
    }

    /// Committed state of a reservation
    pub async fn reservation(&self, id: ReservationId) -> Option<Reservation> {
        self.tables.lock().await.reservations.get(&id).cloned()
    }

    /// Committed children of a lot
    pub async fn controllers(&self, lot_id: LotId) -> LotControllers {
        let tables = self.tables.lock().await;
        LotControllers {
            holds: tables
                .holds
                .values()
                .filter(|hold| hold.lot_id == lot_id)
                .cloned()
                .collect(),
            reservations: tables
                .reservations
                .values()
                .filter(|reservation| reservation.lot_id == lot_id)
                .cloned()
                .collect(),
            sales: tables
                .sales
                .values()
                .filter(|sale| sale.lot_id == lot_id)
                .cloned()
                .collect(),
            promotions: tables
                .promotions
                .values()
                .filter(|promotion| promotion.lot_id == lot_id)
                .cloned()
                .collect(),
        }
    }

    /// Committed offer history of a reservation
    pub async fn offers(&self, reservation: ReservationId) -> Vec<Offer> {
        self.tables.lock().await.offers_for(reservation)
    }

    /// Number of committed sales across all lots
    pub async fn sale_count(&self) -> usize {
        self.tables.lock().await.sales.len()
    }
}

impl LotStore for InMemoryLotStore {
    type Transaction = InMemoryTransaction;

    async fn begin(&self) -> Result<InMemoryTransaction> {
        let guard = Arc::clone(&self.tables).lock_owned().await;
        let working = guard.clone();
        Ok(InMemoryTransaction {
            guard,
            working,
            failing_commits: Arc::clone(&self.failing_commits),
        })
    }

    async fn insert_lot(&self, lot: &Lot) -> Result<()> {
        let mut tables = self.tables.lock().await;
        if tables.lots.contains_key(&lot.id) {
            return Err(DomainError::Conflict(format!("lot {} already exists", lot.id)));
        }
        tables.lots.insert(lot.id, lot.clone());
        Ok(())
    }

    async fn lots_with_elapsed_deadlines(&self, now: DateTime<Utc>) -> Result<Vec<LotId>> {
        let tables = self.tables.lock().await;
        let mut due = BTreeSet::new();

        due.extend(
            tables
                .holds
                .values()
                .filter(|hold| PriorityLifecycle::is_due(hold, now))
                .map(|hold| hold.lot_id),
        );
        due.extend(
            tables
                .reservations
                .values()
                .filter(|reservation| {
                    ReservationLifecycle::is_due(
                        reservation,
                        &tables.offers_for(reservation.id),
                        now,
                    )
                })
                .map(|reservation| reservation.lot_id),
        );
        due.extend(
            tables
                .promotions
                .values()
                .filter(|promotion| PromotionLifecycle::is_due(promotion, now))
                .map(|promotion| promotion.lot_id),
        );

        Ok(due.into_iter().collect())
    }
}

/// Transaction over an [`InMemoryLotStore`].
#[derive(Debug)]
pub struct InMemoryTransaction {
    guard: OwnedMutexGuard<Tables>,
    working: Tables,
    failing_commits: Arc<AtomicUsize>,
}

fn sorted<T>(mut items: Vec<T>, key: impl Fn(&T) -> DateTime<Utc>) -> Vec<T> {
    items.sort_by_key(key);
    items
}

impl LotTransaction for InMemoryTransaction {
    async fn lock_lot(&mut self, id: LotId) -> Result<Lot> {
        // The whole store is already locked by this transaction.
        self.working
            .lots
            .get(&id)
            .cloned()
            .ok_or_else(|| DomainError::not_found("lot", id))
    }

    async fn lot_of(&mut self, child: ChildRef) -> Result<LotId> {
        let lot_id = match child {
            ChildRef::Hold(id) => self.working.holds.get(&id).map(|h| h.lot_id),
            ChildRef::Reservation(id) => self.working.reservations.get(&id).map(|r| r.lot_id),
            ChildRef::Sale(id) => self.working.sales.get(&id).map(|s| s.lot_id),
            ChildRef::Promotion(id) => self.working.promotions.get(&id).map(|p| p.lot_id),
        };
        lot_id.ok_or_else(|| DomainError::not_found(child.entity(), child))
    }

    async fn holds_for_lot(&mut self, lot: LotId) -> Result<Vec<PriorityHold>> {
        let holds: Vec<PriorityHold> = self
            .working
            .holds
            .values()
            .filter(|hold| hold.lot_id == lot)
            .cloned()
            .collect();
        Ok(sorted(holds, |hold| hold.starts_at))
    }

    async fn reservations_for_lot(&mut self, lot: LotId) -> Result<Vec<Reservation>> {
        let reservations: Vec<Reservation> = self
            .working
            .reservations
            .values()
            .filter(|reservation| reservation.lot_id == lot)
            .cloned()
            .collect();
        Ok(sorted(reservations, |reservation| reservation.reserved_at))
    }

    async fn sales_for_lot(&mut self, lot: LotId) -> Result<Vec<Sale>> {
        let sales: Vec<Sale> = self
            .working
            .sales
            .values()
            .filter(|sale| sale.lot_id == lot)
            .cloned()
            .collect();
        Ok(sorted(sales, |sale| sale.sold_at))
    }

    async fn promotions_for_lot(&mut self, lot: LotId) -> Result<Vec<Promotion>> {
        let promotions: Vec<Promotion> = self
            .working
            .promotions
            .values()
            .filter(|promotion| promotion.lot_id == lot)
            .cloned()
            .collect();
        Ok(sorted(promotions, |promotion| promotion.starts_at))
    }

    async fn offers_for_reservation(&mut self, reservation: ReservationId) -> Result<Vec<Offer>> {
        Ok(self.working.offers_for(reservation))
    }

    async fn save_lot(&mut self, lot: &Lot) -> Result<()> {
        if !self.working.lots.contains_key(&lot.id) {
            return Err(DomainError::not_found("lot", lot.id));
        }
        self.working.lots.insert(lot.id, lot.clone());
        Ok(())
    }

    async fn save_hold(&mut self, hold: &PriorityHold) -> Result<()> {
        self.working.holds.insert(hold.id, hold.clone());
        Ok(())
    }

    async fn save_reservation(&mut self, reservation: &Reservation) -> Result<()> {
        self.working
            .reservations
            .insert(reservation.id, reservation.clone());
        Ok(())
    }

    async fn save_sale(&mut self, sale: &Sale) -> Result<()> {
        self.working.sales.insert(sale.id, sale.clone());
        Ok(())
    }

    async fn save_promotion(&mut self, promotion: &Promotion) -> Result<()> {
        self.working.promotions.insert(promotion.id, promotion.clone());
        Ok(())
    }

    async fn append_offer(&mut self, offer: &Offer) -> Result<()> {
        if !self.working.reservations.contains_key(&offer.reservation_id) {
            return Err(DomainError::not_found("reservation", offer.reservation_id));
        }
        self.working.offers.push(offer.clone());
        Ok(())
    }

    async fn commit(mut self) -> Result<()> {
        let pending = self.failing_commits.load(Ordering::SeqCst);
        if pending > 0 {
            self.failing_commits.store(pending - 1, Ordering::SeqCst);
            return Err(DomainError::Contention(
                "injected serialization failure".to_string(),
            ));
        }
        *self.guard = std::mem::take(&mut self.working);
        Ok(())
    }
}
