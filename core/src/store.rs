//! Transactional persistence contract.
//!
//! The engine needs two things from a store: an exclusive row lock on the lot
//! being changed, and an atomic commit of the lot plus every child written
//! in the same operation. Everything else is plain loads and upserts.
//!
//! # Implementations
//!
//! - `PostgresLotStore` (in `lotes-postgres`): `SELECT … FOR UPDATE` on the
//!   lot row inside a sqlx transaction
//! - `InMemoryLotStore` (in `lotes-testing`): one mutex over all tables,
//!   with a working copy that is swapped in on commit
//!
//! # Example
//!
//! ```no_run
//! use lotes_core::error::Result;
//! use lotes_core::store::{LotStore, LotTransaction};
//! use lotes_core::types::LotId;
//!
//! async fn peek<S: LotStore>(store: &S, id: LotId) -> Result<()> {
//!     let mut tx = store.begin().await?;
//!     let lot = tx.lock_lot(id).await?;
//!     let holds = tx.holds_for_lot(lot.id).await?;
//!     println!("{} has {} holds", lot.id, holds.len());
//!     // Dropping `tx` without commit rolls back
//!     Ok(())
//! }
//! ```

use crate::error::Result;
use crate::soft_delete::EntityRef;
use crate::types::{
    HoldId, Lot, LotId, Offer, PriorityHold, Promotion, PromotionId, Reservation, ReservationId,
    Sale, SaleId,
};
use chrono::{DateTime, Utc};
use std::fmt;
use std::future::Future;

/// Reference to any child record of a lot.
///
/// Ordered so that holds and reservations sort before the sales and offers
/// that may reference them.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ChildRef {
    /// A priority hold
    Hold(HoldId),
    /// A reservation
    Reservation(ReservationId),
    /// A sale
    Sale(SaleId),
    /// A promotion
    Promotion(PromotionId),
}

impl ChildRef {
    /// Entity name for `NotFound` errors
    #[must_use]
    pub const fn entity(&self) -> &'static str {
        match self {
            Self::Hold(_) => "priority hold",
            Self::Reservation(_) => "reservation",
            Self::Sale(_) => "sale",
            Self::Promotion(_) => "promotion",
        }
    }
}

impl fmt::Display for ChildRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Hold(id) => write!(f, "{id}"),
            Self::Reservation(id) => write!(f, "{id}"),
            Self::Sale(id) => write!(f, "{id}"),
            Self::Promotion(id) => write!(f, "{id}"),
        }
    }
}

impl From<EntityRef> for ChildRef {
    fn from(entity: EntityRef) -> Self {
        match entity {
            EntityRef::Sale(id) => Self::Sale(id),
            EntityRef::Reservation(id) => Self::Reservation(id),
            EntityRef::Hold(id) => Self::Hold(id),
        }
    }
}

/// Store of lots and their child records.
///
/// # Thread Safety
///
/// Implementations are shared across request handlers and must be
/// `Send + Sync`.
pub trait LotStore: Send + Sync {
    /// Transaction handle returned by [`LotStore::begin`]
    type Transaction: LotTransaction;

    /// Open a transaction.
    ///
    /// # Errors
    ///
    /// Returns [`crate::error::DomainError::Storage`] if the store is unreachable.
    fn begin(&self) -> impl Future<Output = Result<Self::Transaction>> + Send;

    /// Register a lot. Lot CRUD lives outside the engine; this is its seam.
    ///
    /// # Errors
    ///
    /// Returns [`crate::error::DomainError::Conflict`] if the id is taken.
    fn insert_lot(&self, lot: &Lot) -> impl Future<Output = Result<()>> + Send;

    /// Lots with at least one child whose deadline elapsed at `now`.
    ///
    /// Covers ACTIVA/CONTRAOFERTA reservations past their term, CONTRAOFERTA
    /// reservations whose latest offer lapsed, ACTIVA holds past their end and
    /// active promotions past their end.
    ///
    /// # Errors
    ///
    /// Returns [`crate::error::DomainError::Storage`] on query failure.
    fn lots_with_elapsed_deadlines(
        &self,
        now: DateTime<Utc>,
    ) -> impl Future<Output = Result<Vec<LotId>>> + Send;
}

/// One atomic unit of work. Dropping it without [`LotTransaction::commit`]
/// discards every write.
pub trait LotTransaction: Send {
    /// Read the lot and take an exclusive lock on its row until the
    /// transaction ends.
    ///
    /// # Errors
    ///
    /// - `NotFound` if the lot does not exist
    /// - `Contention` if the lock could not be acquired
    fn lock_lot(&mut self, id: LotId) -> impl Future<Output = Result<Lot>> + Send;

    /// Lot that owns a child record, without locking anything.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` if the child does not exist.
    fn lot_of(&mut self, child: ChildRef) -> impl Future<Output = Result<LotId>> + Send;

    /// All priority holds of a lot
    ///
    /// # Errors
    ///
    /// Returns `Storage` on query failure.
    fn holds_for_lot(&mut self, lot: LotId)
        -> impl Future<Output = Result<Vec<PriorityHold>>> + Send;

    /// All reservations of a lot
    ///
    /// # Errors
    ///
    /// Returns `Storage` on query failure.
    fn reservations_for_lot(
        &mut self,
        lot: LotId,
    ) -> impl Future<Output = Result<Vec<Reservation>>> + Send;

    /// All sales of a lot
    ///
    /// # Errors
    ///
    /// Returns `Storage` on query failure.
    fn sales_for_lot(&mut self, lot: LotId) -> impl Future<Output = Result<Vec<Sale>>> + Send;

    /// All promotions of a lot
    ///
    /// # Errors
    ///
    /// Returns `Storage` on query failure.
    fn promotions_for_lot(
        &mut self,
        lot: LotId,
    ) -> impl Future<Output = Result<Vec<Promotion>>> + Send;

    /// Offer history of a reservation, oldest first by server timestamp then
    /// sequence.
    ///
    /// # Errors
    ///
    /// Returns `Storage` on query failure.
    fn offers_for_reservation(
        &mut self,
        reservation: ReservationId,
    ) -> impl Future<Output = Result<Vec<Offer>>> + Send;

    /// Persist the lot's status and price.
    ///
    /// # Errors
    ///
    /// Returns `Storage` on write failure.
    fn save_lot(&mut self, lot: &Lot) -> impl Future<Output = Result<()>> + Send;

    /// Insert or update a hold.
    ///
    /// # Errors
    ///
    /// Returns `Storage` on write failure.
    fn save_hold(&mut self, hold: &PriorityHold) -> impl Future<Output = Result<()>> + Send;

    /// Insert or update a reservation.
    ///
    /// # Errors
    ///
    /// Returns `Storage` on write failure.
    fn save_reservation(
        &mut self,
        reservation: &Reservation,
    ) -> impl Future<Output = Result<()>> + Send;

    /// Insert or update a sale.
    ///
    /// # Errors
    ///
    /// Returns `Storage` on write failure.
    fn save_sale(&mut self, sale: &Sale) -> impl Future<Output = Result<()>> + Send;

    /// Insert or update a promotion.
    ///
    /// # Errors
    ///
    /// Returns `Storage` on write failure.
    fn save_promotion(&mut self, promotion: &Promotion) -> impl Future<Output = Result<()>> + Send;

    /// Append an offer. Offers are never updated.
    ///
    /// # Errors
    ///
    /// Returns `Storage` on write failure.
    fn append_offer(&mut self, offer: &Offer) -> impl Future<Output = Result<()>> + Send;

    /// Make every write of this transaction visible atomically.
    ///
    /// # Errors
    ///
    /// - `Contention` if the store aborted the transaction (serialization
    ///   failure, deadlock)
    /// - `Storage` otherwise
    fn commit(self) -> impl Future<Output = Result<()>> + Send;
}
