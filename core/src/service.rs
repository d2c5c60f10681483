//! Caller surface: one method per business action.
//!
//! Every method runs in exactly one store transaction:
//!
//! 1. lock the lot row (directly, or after resolving a child's lot)
//! 2. load every child and apply lazy expiry
//! 3. run the lifecycle rule for the action
//! 4. let [`LotStateCoordinator`] recompute the lot status
//! 5. persist the touched children and the lot, then commit
//!
//! Any error drops the transaction, so nothing is half-applied. Reads follow
//! the same path because lazy expiry may have to write.

use crate::coordinator::{ChildChange, ControllerKind, LotControllers, LotStateCoordinator};
use crate::environment::Clock;
use crate::error::{DomainError, Result};
use crate::negotiation::{CounterOffer, NegotiationEngine};
use crate::priority::{NewHold, PriorityLifecycle};
use crate::promotion::{NewPromotion, PromotionLifecycle};
use crate::reservation::{NewReservation, ReservationLifecycle};
use crate::sale::{NewSale, SaleStateFields, SaleStateMachine};
use crate::soft_delete::{EntityRef, SoftDeleteGuard};
use crate::store::{ChildRef, LotStore, LotTransaction};
use crate::types::{
    HoldId, HoldStatus, Lot, LotId, Offer, OperationalFlag, OwnerType, Party, PaymentStatus,
    PriorityHold, Promotion, PromotionId, Reservation, ReservationId, ReservationStatus, Sale,
    SaleId, SaleStatus, Transition,
};
use chrono::{DateTime, Utc};
use std::collections::BTreeSet;
use std::sync::Arc;

/// Terms supplied by the caller when accepting an offer.
///
/// The amount always comes from the accepted offer and the buyer is the
/// reservation's client.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SaleTerms {
    /// Free-form payment type tag
    pub payment_type: String,
}

/// A lot with whatever currently controls it.
#[derive(Clone, Debug, PartialEq)]
pub struct LotView {
    /// The lot, price already reflecting any active promotion
    pub lot: Lot,
    /// Highest-ranked active controller
    pub controller: Option<ControllerKind>,
    /// Active hold
    pub hold: Option<PriorityHold>,
    /// Live reservation
    pub reservation: Option<Reservation>,
    /// Non-cancelled sale
    pub sale: Option<Sale>,
    /// Active promotion
    pub promotion: Option<Promotion>,
}

impl LotView {
    fn new(lot: &Lot, controllers: &LotControllers) -> Self {
        Self {
            lot: lot.clone(),
            controller: controllers.active_controller(),
            hold: controllers.active_hold().cloned(),
            reservation: controllers.active_reservation().cloned(),
            sale: controllers.active_sale().cloned(),
            promotion: controllers.active_promotion().cloned(),
        }
    }
}

/// A reservation with its negotiation history.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ReservationView {
    /// The reservation
    pub reservation: Reservation,
    /// Offers, oldest first
    pub offers: Vec<Offer>,
    /// Side expected to answer next; `None` when either may open
    pub current_turn: Option<OwnerType>,
}

/// Children moved by lazy expiry.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ExpiryCounts {
    /// Holds moved to EXPIRADA
    pub holds: usize,
    /// Reservations moved to EXPIRADA
    pub reservations: usize,
    /// CONTRAOFERTA reservations returned to ACTIVA
    pub offers: usize,
    /// Promotions past their end
    pub promotions: usize,
}

impl ExpiryCounts {
    /// Total number of children changed
    #[must_use]
    pub const fn total(&self) -> usize {
        self.holds + self.reservations + self.offers + self.promotions
    }

    const fn absorb(&mut self, other: Self) {
        self.holds += other.holds;
        self.reservations += other.reservations;
        self.offers += other.offers;
        self.promotions += other.promotions;
    }
}

/// Outcome of [`LotService::sweep_expired`].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SweepReport {
    /// Lots visited
    pub lots: usize,
    /// Lots whose transaction failed
    pub failed: usize,
    /// What expired
    pub expired: ExpiryCounts,
}

/// The lot lifecycle engine, bound to a store and a clock.
#[derive(Clone)]
pub struct LotService<S> {
    store: S,
    clock: Arc<dyn Clock>,
}

impl<S: LotStore> LotService<S> {
    /// Creates a service over `store`, reading time from `clock`.
    pub fn new(store: S, clock: Arc<dyn Clock>) -> Self {
        Self { store, clock }
    }

    /// The underlying store
    #[must_use]
    pub const fn store(&self) -> &S {
        &self.store
    }

    /// Register a lot with the engine.
    ///
    /// # Errors
    ///
    /// Propagates store errors (`Conflict` for a duplicate id).
    #[tracing::instrument(skip(self, lot), fields(lot_id = %lot.id))]
    pub async fn register_lot(&self, lot: &Lot) -> Result<()> {
        self.store.insert_lot(lot).await
    }

    // ------------------------------------------------------------------
    // Priority holds
    // ------------------------------------------------------------------

    /// Place a priority hold on a DISPONIBLE or EN_PROMOCION lot.
    ///
    /// # Errors
    ///
    /// - `Conflict` if the lot is controlled or already held
    /// - `Validation` if `ends_at` is not in the future
    /// - `NotFound` if the lot does not exist
    #[tracing::instrument(skip(self))]
    pub async fn create_hold(
        &self,
        lot_id: LotId,
        owner: Party,
        ends_at: DateTime<Utc>,
    ) -> Result<PriorityHold> {
        let mut scope = self.open_lot(lot_id).await?;
        checked(
            "create_hold",
            LotStateCoordinator::ensure_can_create(
                &scope.lot,
                ControllerKind::Hold,
                Some(&owner),
                &scope.controllers,
            ),
        )?;
        let hold = checked(
            "create_hold",
            PriorityLifecycle::open(
                NewHold {
                    lot_id,
                    owner,
                    ends_at,
                },
                scope.lot.status(),
                scope.now,
            ),
        )?;
        scope.put_hold(None, hold.clone());
        scope.finish().await?;
        Ok(hold)
    }

    /// Release a hold without exercising it.
    ///
    /// # Errors
    ///
    /// `Conflict` unless the hold is ACTIVA; `NotFound` for an unknown id.
    #[tracing::instrument(skip(self))]
    pub async fn cancel_hold(&self, hold_id: HoldId) -> Result<PriorityHold> {
        self.close_hold(hold_id, "cancel_hold", PriorityLifecycle::cancel)
            .await
    }

    /// Mark a hold as exercised.
    ///
    /// # Errors
    ///
    /// `Conflict` unless the hold is ACTIVA; `NotFound` for an unknown id.
    #[tracing::instrument(skip(self))]
    pub async fn finalize_hold(&self, hold_id: HoldId) -> Result<PriorityHold> {
        self.close_hold(hold_id, "finalize_hold", PriorityLifecycle::finalize)
            .await
    }

    async fn close_hold(
        &self,
        hold_id: HoldId,
        operation: &'static str,
        close: fn(&mut PriorityHold) -> Result<Transition<HoldStatus>>,
    ) -> Result<PriorityHold> {
        let mut scope = self.open_child(ChildRef::Hold(hold_id)).await?;
        let before = scope.hold(hold_id)?;
        let mut after = before.clone();
        checked(operation, close(&mut after))?;
        scope.put_hold(Some(before), after.clone());
        scope.finish().await?;
        Ok(after)
    }

    // ------------------------------------------------------------------
    // Reservations and negotiation
    // ------------------------------------------------------------------

    /// Place a reservation.
    ///
    /// On a CON_PRIORIDAD lot the requester must own the active hold, which
    /// is FINALIZADA in the same transaction.
    ///
    /// # Errors
    ///
    /// - `Conflict` if the lot is not open to the requester
    /// - `Validation` for a zero deposit or a past end of term
    /// - `NotFound` if the lot does not exist
    #[tracing::instrument(skip(self), fields(lot_id = %new.lot_id))]
    pub async fn create_reservation(&self, new: NewReservation) -> Result<Reservation> {
        let mut scope = self.open_lot(new.lot_id).await?;
        checked(
            "create_reservation",
            LotStateCoordinator::ensure_can_create(
                &scope.lot,
                ControllerKind::Reservation,
                Some(&new.requested_by),
                &scope.controllers,
            ),
        )?;
        let snapshot = scope.lot.status();
        let reservation = checked(
            "create_reservation",
            ReservationLifecycle::open(new, snapshot, scope.now),
        )?;

        if let Some(hold) = scope.controllers.active_hold().cloned() {
            let mut exercised = hold.clone();
            PriorityLifecycle::finalize(&mut exercised)?;
            scope.put_hold(Some(hold), exercised);
        }
        scope.put_reservation(None, reservation.clone());
        scope.finish().await?;
        Ok(reservation)
    }

    /// Submit a counter-offer on behalf of `party`.
    ///
    /// # Errors
    ///
    /// - `Conflict` if the reservation is closed or `party` is a foreign realtor
    /// - `Validation` for a zero amount or a deadline before the reservation date
    #[tracing::instrument(skip(self))]
    pub async fn counter_offer(
        &self,
        reservation_id: ReservationId,
        party: Party,
        proposal: CounterOffer,
    ) -> Result<(Reservation, Offer)> {
        let mut scope = self
            .open_child(ChildRef::Reservation(reservation_id))
            .await?;
        let before = scope.reservation(reservation_id)?;
        let offers = scope.tx.offers_for_reservation(reservation_id).await?;
        let mut after = before.clone();
        let (offer, _) = checked(
            "counter_offer",
            NegotiationEngine::new(&offers).counter(&mut after, &party, proposal, scope.now),
        )?;
        scope.put_reservation(Some(before), after.clone());
        scope.new_offers.push(offer.clone());
        scope.finish().await?;
        Ok((after, offer))
    }

    /// Accept the latest offer and produce the sale.
    ///
    /// The sale amount is the accepted offer's amount. Any active promotion
    /// on the lot is closed.
    ///
    /// # Errors
    ///
    /// `Conflict` when there is no offer, it is not `party`'s turn, the offer
    /// lapsed or the reservation is closed.
    #[tracing::instrument(skip(self))]
    pub async fn accept_offer(
        &self,
        reservation_id: ReservationId,
        party: Party,
        terms: SaleTerms,
    ) -> Result<(Reservation, Sale)> {
        let mut scope = self
            .open_child(ChildRef::Reservation(reservation_id))
            .await?;
        let before = scope.reservation(reservation_id)?;
        let offers = scope.tx.offers_for_reservation(reservation_id).await?;
        let mut after = before.clone();
        let (offer, _) = checked(
            "accept_offer",
            NegotiationEngine::new(&offers).accept(&mut after, &party, scope.now),
        )?;

        let sale = checked(
            "accept_offer",
            SaleStateMachine::open(
                NewSale {
                    lot_id: after.lot_id,
                    buyer_id: after.client_id,
                    amount: offer.amount,
                    payment_type: terms.payment_type,
                    reservation_id: Some(after.id),
                },
                after.lot_status_at_creation,
                scope.now,
            ),
        )?;
        ReservationLifecycle::link_sale(&mut after, sale.id)?;

        scope.put_sale(None, sale.clone());
        scope.put_reservation(Some(before), after.clone());
        scope.close_promotions();
        scope.finish().await?;
        Ok((after, sale))
    }

    /// Reject the latest offer, cancelling the reservation.
    ///
    /// # Errors
    ///
    /// `Conflict` when there is no offer, it is not `party`'s turn or the
    /// reservation is closed.
    #[tracing::instrument(skip(self))]
    pub async fn reject_offer(
        &self,
        reservation_id: ReservationId,
        party: Party,
    ) -> Result<Reservation> {
        let mut scope = self
            .open_child(ChildRef::Reservation(reservation_id))
            .await?;
        let before = scope.reservation(reservation_id)?;
        let offers = scope.tx.offers_for_reservation(reservation_id).await?;
        let mut after = before.clone();
        checked(
            "reject_offer",
            NegotiationEngine::new(&offers).reject(&mut after, &party),
        )?;
        scope.put_reservation(Some(before), after.clone());
        scope.finish().await?;
        Ok(after)
    }

    /// Withdraw a live reservation.
    ///
    /// # Errors
    ///
    /// `Conflict` if it is already terminal.
    #[tracing::instrument(skip(self))]
    pub async fn cancel_reservation(&self, reservation_id: ReservationId) -> Result<Reservation> {
        let mut scope = self
            .open_child(ChildRef::Reservation(reservation_id))
            .await?;
        let before = scope.reservation(reservation_id)?;
        let mut after = before.clone();
        checked(
            "cancel_reservation",
            ReservationLifecycle::cancel(&mut after),
        )?;
        scope.put_reservation(Some(before), after.clone());
        scope.finish().await?;
        Ok(after)
    }

    // ------------------------------------------------------------------
    // Sales
    // ------------------------------------------------------------------

    /// Register a direct sale on a DISPONIBLE or EN_PROMOCION lot.
    ///
    /// # Errors
    ///
    /// - `Validation` for a zero amount, a blank payment type, or a
    ///   reservation reference (those sales come from [`Self::accept_offer`])
    /// - `Conflict` if the lot is controlled
    #[tracing::instrument(skip(self), fields(lot_id = %new.lot_id))]
    pub async fn register_sale(&self, new: NewSale) -> Result<Sale> {
        if new.reservation_id.is_some() {
            return checked(
                "register_sale",
                Err(DomainError::Validation(
                    "sales from a reservation are produced by accepting its offer".to_string(),
                )),
            );
        }

        let mut scope = self.open_lot(new.lot_id).await?;
        checked(
            "register_sale",
            LotStateCoordinator::ensure_can_create(
                &scope.lot,
                ControllerKind::Sale,
                None,
                &scope.controllers,
            ),
        )?;
        let sale = checked(
            "register_sale",
            SaleStateMachine::open(new, scope.lot.status(), scope.now),
        )?;
        scope.put_sale(None, sale.clone());
        scope.close_promotions();
        scope.finish().await?;
        Ok(sale)
    }

    /// Move a sale through its state table.
    ///
    /// # Errors
    ///
    /// - `Conflict` with `invalid transition from X to Y`, or for field
    ///   changes on a terminal sale
    /// - `Validation` for missing deed or cancellation fields
    #[tracing::instrument(skip(self))]
    pub async fn advance_sale_state(
        &self,
        sale_id: SaleId,
        target: SaleStatus,
        fields: SaleStateFields,
    ) -> Result<Sale> {
        self.update_sale(sale_id, "advance_sale_state", |sale| {
            SaleStateMachine::advance(sale, target, fields).map(|_| ())
        })
        .await
    }

    /// Cancel a sale, rolling the lot back.
    ///
    /// # Errors
    ///
    /// Same as [`Self::advance_sale_state`] with target CANCELADA.
    #[tracing::instrument(skip(self))]
    pub async fn cancel_sale(
        &self,
        sale_id: SaleId,
        cancelled_at: DateTime<Utc>,
        reason: String,
    ) -> Result<Sale> {
        let fields = SaleStateFields::cancellation(cancelled_at, reason);
        self.update_sale(sale_id, "cancel_sale", |sale| {
            SaleStateMachine::advance(sale, SaleStatus::Cancelada, fields).map(|_| ())
        })
        .await
    }

    /// Record an external payment progress signal.
    ///
    /// # Errors
    ///
    /// `Conflict` on a cancelled sale or a backwards move.
    #[tracing::instrument(skip(self))]
    pub async fn record_payment_progress(
        &self,
        sale_id: SaleId,
        progress: PaymentStatus,
    ) -> Result<Sale> {
        self.update_sale(sale_id, "record_payment_progress", |sale| {
            SaleStateMachine::record_payment(sale, progress).map(|_| ())
        })
        .await
    }

    async fn update_sale(
        &self,
        sale_id: SaleId,
        operation: &'static str,
        change: impl FnOnce(&mut Sale) -> Result<()>,
    ) -> Result<Sale> {
        let mut scope = self.open_child(ChildRef::Sale(sale_id)).await?;
        let before = scope.sale(sale_id)?;
        let mut after = before.clone();
        checked(operation, change(&mut after))?;
        if after != before {
            scope.put_sale(Some(before), after.clone());
        }
        scope.finish().await?;
        Ok(after)
    }

    // ------------------------------------------------------------------
    // Promotions and availability
    // ------------------------------------------------------------------

    /// Apply a promotion to a DISPONIBLE lot.
    ///
    /// # Errors
    ///
    /// - `Conflict` unless the lot is DISPONIBLE without an active promotion
    /// - `Validation` for a price not below the current one or a past end
    #[tracing::instrument(skip(self))]
    pub async fn apply_promotion(&self, lot_id: LotId, new: NewPromotion) -> Result<Promotion> {
        let mut scope = self.open_lot(lot_id).await?;
        checked(
            "apply_promotion",
            LotStateCoordinator::ensure_can_create(
                &scope.lot,
                ControllerKind::Promotion,
                None,
                &scope.controllers,
            ),
        )?;
        let now = scope.now;
        let promotion = checked(
            "apply_promotion",
            PromotionLifecycle::apply(&mut scope.lot, new, now),
        )?;
        scope.put_promotion(None, promotion.clone());
        scope.finish().await?;
        Ok(promotion)
    }

    /// Remove a promotion, restoring the lot's previous price.
    ///
    /// # Errors
    ///
    /// `Conflict` if the promotion is no longer active.
    #[tracing::instrument(skip(self))]
    pub async fn remove_promotion(&self, promotion_id: PromotionId) -> Result<Promotion> {
        let mut scope = self
            .open_child(ChildRef::Promotion(promotion_id))
            .await?;
        let before = scope.promotion(promotion_id)?;
        let mut after = before.clone();
        checked(
            "remove_promotion",
            PromotionLifecycle::remove(&mut scope.lot, &mut after),
        )?;
        scope.put_promotion(Some(before), after.clone());
        scope.finish().await?;
        Ok(after)
    }

    /// Take an uncontrolled DISPONIBLE lot off the market.
    ///
    /// # Errors
    ///
    /// `Conflict` if the lot is controlled or not DISPONIBLE.
    #[tracing::instrument(skip(self))]
    pub async fn withdraw_lot(&self, lot_id: LotId) -> Result<Lot> {
        let mut scope = self.open_lot(lot_id).await?;
        checked(
            "withdraw_lot",
            LotStateCoordinator::withdraw(&mut scope.lot, &scope.controllers),
        )?;
        scope.finish().await
    }

    /// Put a NO_DISPONIBLE lot back on the market.
    ///
    /// # Errors
    ///
    /// `Conflict` if the lot is controlled or not NO_DISPONIBLE.
    #[tracing::instrument(skip(self))]
    pub async fn release_lot(&self, lot_id: LotId) -> Result<Lot> {
        let mut scope = self.open_lot(lot_id).await?;
        checked(
            "release_lot",
            LotStateCoordinator::release(&mut scope.lot, &scope.controllers),
        )?;
        scope.finish().await
    }

    // ------------------------------------------------------------------
    // Soft delete
    // ------------------------------------------------------------------

    /// Mark a record ELIMINADO. Idempotent.
    ///
    /// # Errors
    ///
    /// `Conflict` if the record's business state forbids deletion.
    #[tracing::instrument(skip(self))]
    pub async fn soft_delete(&self, entity: EntityRef) -> Result<Transition<OperationalFlag>> {
        self.set_flag(entity, "soft_delete", |flagged| match flagged {
            Flagged::Sale(sale) => SoftDeleteGuard::soft_delete(sale),
            Flagged::Reservation(reservation) => SoftDeleteGuard::soft_delete(reservation),
            Flagged::Hold(hold) => SoftDeleteGuard::soft_delete(hold),
        })
        .await
    }

    /// Mark a record OPERATIVO again. Idempotent; business state untouched.
    ///
    /// # Errors
    ///
    /// `NotFound` for an unknown record.
    #[tracing::instrument(skip(self))]
    pub async fn reactivate(&self, entity: EntityRef) -> Result<Transition<OperationalFlag>> {
        self.set_flag(entity, "reactivate", |flagged| {
            Ok(match flagged {
                Flagged::Sale(sale) => SoftDeleteGuard::reactivate(sale),
                Flagged::Reservation(reservation) => SoftDeleteGuard::reactivate(reservation),
                Flagged::Hold(hold) => SoftDeleteGuard::reactivate(hold),
            })
        })
        .await
    }

    async fn set_flag(
        &self,
        entity: EntityRef,
        operation: &'static str,
        flip: impl FnOnce(Flagged<'_>) -> Result<Transition<OperationalFlag>>,
    ) -> Result<Transition<OperationalFlag>> {
        let mut scope = self.open_child(entity.into()).await?;
        let transition = match entity {
            EntityRef::Sale(id) => {
                let before = scope.sale(id)?;
                let mut after = before.clone();
                let transition = checked(operation, flip(Flagged::Sale(&mut after)))?;
                scope.put_sale(Some(before), after);
                transition
            }
            EntityRef::Reservation(id) => {
                let before = scope.reservation(id)?;
                let mut after = before.clone();
                let transition = checked(operation, flip(Flagged::Reservation(&mut after)))?;
                scope.put_reservation(Some(before), after);
                transition
            }
            EntityRef::Hold(id) => {
                let before = scope.hold(id)?;
                let mut after = before.clone();
                let transition = checked(operation, flip(Flagged::Hold(&mut after)))?;
                scope.put_hold(Some(before), after);
                transition
            }
        };
        scope.finish().await?;
        Ok(transition)
    }

    // ------------------------------------------------------------------
    // Reads
    // ------------------------------------------------------------------

    /// A lot and its active controllers, after lazy expiry.
    ///
    /// # Errors
    ///
    /// `NotFound` for an unknown lot.
    #[tracing::instrument(skip(self))]
    pub async fn lot(&self, lot_id: LotId) -> Result<LotView> {
        let scope = self.open_lot(lot_id).await?;
        let view = LotView::new(&scope.lot, &scope.controllers);
        scope.finish().await?;
        Ok(view)
    }

    /// A reservation and its offers, after lazy expiry.
    ///
    /// # Errors
    ///
    /// `NotFound` for an unknown reservation.
    #[tracing::instrument(skip(self))]
    pub async fn reservation(&self, reservation_id: ReservationId) -> Result<ReservationView> {
        let mut scope = self
            .open_child(ChildRef::Reservation(reservation_id))
            .await?;
        let reservation = scope.reservation(reservation_id)?;
        let offers = scope.tx.offers_for_reservation(reservation_id).await?;
        let current_turn = NegotiationEngine::new(&offers).current_turn();
        scope.finish().await?;
        Ok(ReservationView {
            reservation,
            offers,
            current_turn,
        })
    }

    /// A sale.
    ///
    /// # Errors
    ///
    /// `NotFound` for an unknown sale.
    #[tracing::instrument(skip(self))]
    pub async fn sale(&self, sale_id: SaleId) -> Result<Sale> {
        let scope = self.open_child(ChildRef::Sale(sale_id)).await?;
        let sale = scope.sale(sale_id)?;
        scope.finish().await?;
        Ok(sale)
    }

    /// A priority hold, after lazy expiry.
    ///
    /// # Errors
    ///
    /// `NotFound` for an unknown hold.
    #[tracing::instrument(skip(self))]
    pub async fn hold(&self, hold_id: HoldId) -> Result<PriorityHold> {
        let scope = self.open_child(ChildRef::Hold(hold_id)).await?;
        let hold = scope.hold(hold_id)?;
        scope.finish().await?;
        Ok(hold)
    }

    /// A promotion, after lazy expiry.
    ///
    /// # Errors
    ///
    /// `NotFound` for an unknown promotion.
    #[tracing::instrument(skip(self))]
    pub async fn promotion(&self, promotion_id: PromotionId) -> Result<Promotion> {
        let scope = self
            .open_child(ChildRef::Promotion(promotion_id))
            .await?;
        let promotion = scope.promotion(promotion_id)?;
        scope.finish().await?;
        Ok(promotion)
    }

    // ------------------------------------------------------------------
    // Sweep
    // ------------------------------------------------------------------

    /// Run lazy expiry on every lot with an elapsed deadline.
    ///
    /// Each lot is its own transaction; a failing lot is logged and counted,
    /// and the sweep moves on.
    ///
    /// # Errors
    ///
    /// Returns an error only if the candidate query fails.
    #[tracing::instrument(skip(self))]
    pub async fn sweep_expired(&self) -> Result<SweepReport> {
        let candidates = self
            .store
            .lots_with_elapsed_deadlines(self.clock.now())
            .await?;
        let mut report = SweepReport::default();

        for lot_id in candidates {
            report.lots += 1;
            let outcome = async {
                let scope = self.open_lot(lot_id).await?;
                let expired = scope.expired;
                scope.finish().await?;
                Ok::<_, DomainError>(expired)
            }
            .await;

            match outcome {
                Ok(expired) => report.expired.absorb(expired),
                Err(error) => {
                    report.failed += 1;
                    tracing::error!(lot_id = %lot_id, error = %error, "Sweep failed for lot");
                }
            }
        }

        tracing::info!(
            lots = report.lots,
            failed = report.failed,
            expired = report.expired.total(),
            "Sweep finished"
        );
        Ok(report)
    }

    // ------------------------------------------------------------------
    // Transaction scopes
    // ------------------------------------------------------------------

    async fn open_lot(&self, lot_id: LotId) -> Result<Scope<S::Transaction>> {
        let now = self.clock.now();
        let mut tx = self.store.begin().await?;
        let lot = tx.lock_lot(lot_id).await?;
        tracing::debug!(lot_id = %lot_id, "Lot row locked");
        let scope = Scope::load(tx, lot, now).await?;
        self.settle_expiry(scope).await
    }

    async fn open_child(&self, child: ChildRef) -> Result<Scope<S::Transaction>> {
        let now = self.clock.now();
        let mut tx = self.store.begin().await?;
        let lot_id = tx.lot_of(child).await?;
        let lot = tx.lock_lot(lot_id).await?;
        tracing::debug!(lot_id = %lot_id, child = %child, "Lot row locked");
        let scope = Scope::load(tx, lot, now).await?;
        self.settle_expiry(scope).await
    }

    /// Lazy expiry commits on its own, so an action rejected afterwards
    /// cannot roll it back. The lot is then locked again for the action.
    async fn settle_expiry(&self, scope: Scope<S::Transaction>) -> Result<Scope<S::Transaction>> {
        if scope.expired.total() == 0 {
            return Ok(scope);
        }
        let (lot_id, now, expired) = (scope.lot.id, scope.now, scope.expired);
        scope.finish().await?;

        let mut tx = self.store.begin().await?;
        let lot = tx.lock_lot(lot_id).await?;
        let mut scope = Scope::load(tx, lot, now).await?;
        scope.expired.absorb(expired);
        Ok(scope)
    }
}

/// Mutable view handed to soft-delete closures.
enum Flagged<'a> {
    Sale(&'a mut Sale),
    Reservation(&'a mut Reservation),
    Hold(&'a mut PriorityHold),
}

/// Count business rejections and pass the result through.
fn checked<T>(operation: &'static str, result: Result<T>) -> Result<T> {
    if let Err(error) = &result {
        if matches!(error, DomainError::Conflict(_)) {
            metrics::counter!("lots.conflict", "operation" => operation).increment(1);
        }
        tracing::warn!(operation, error = %error, "Operation rejected");
    }
    result
}

/// One locked lot and everything hanging off it, inside one transaction.
struct Scope<T> {
    tx: T,
    now: DateTime<Utc>,
    lot: Lot,
    loaded: Lot,
    controllers: LotControllers,
    dirty: BTreeSet<ChildRef>,
    new_offers: Vec<Offer>,
    expired: ExpiryCounts,
}

impl<T: LotTransaction> Scope<T> {
    async fn load(mut tx: T, lot: Lot, now: DateTime<Utc>) -> Result<Self> {
        let controllers = LotControllers {
            holds: tx.holds_for_lot(lot.id).await?,
            reservations: tx.reservations_for_lot(lot.id).await?,
            sales: tx.sales_for_lot(lot.id).await?,
            promotions: tx.promotions_for_lot(lot.id).await?,
        };
        let mut scope = Self {
            tx,
            now,
            loaded: lot.clone(),
            lot,
            controllers,
            dirty: BTreeSet::new(),
            new_offers: Vec::new(),
            expired: ExpiryCounts::default(),
        };
        scope.expire_due().await?;
        Ok(scope)
    }

    async fn expire_due(&mut self) -> Result<()> {
        let now = self.now;

        for hold in self.controllers.holds.clone() {
            let mut after = hold.clone();
            if PriorityLifecycle::expire_if_due(&mut after, now).is_some() {
                metrics::counter!("lots.expired", "entity" => "hold").increment(1);
                self.expired.holds += 1;
                self.put_hold(Some(hold), after);
            }
        }

        for reservation in self.controllers.reservations.clone() {
            let offers = match reservation.status {
                ReservationStatus::Contraoferta => {
                    self.tx.offers_for_reservation(reservation.id).await?
                }
                ReservationStatus::Activa => Vec::new(),
                _ => continue,
            };
            let mut after = reservation.clone();
            if let Some(transition) = ReservationLifecycle::expire_if_due(&mut after, &offers, now)
            {
                if transition.to == ReservationStatus::Expirada {
                    metrics::counter!("lots.expired", "entity" => "reservation").increment(1);
                    self.expired.reservations += 1;
                } else {
                    metrics::counter!("lots.expired", "entity" => "offer").increment(1);
                    self.expired.offers += 1;
                }
                self.put_reservation(Some(reservation), after);
            }
        }

        for promotion in self.controllers.promotions.clone() {
            let mut after = promotion.clone();
            if PromotionLifecycle::expire_if_due(&mut self.lot, &mut after, now).is_some() {
                metrics::counter!("lots.expired", "entity" => "promotion").increment(1);
                self.expired.promotions += 1;
                self.put_promotion(Some(promotion), after);
            }
        }

        if self.expired.total() > 0 {
            tracing::info!(
                lot_id = %self.lot.id,
                holds = self.expired.holds,
                reservations = self.expired.reservations,
                offers = self.expired.offers,
                promotions = self.expired.promotions,
                "Lazy expiry applied"
            );
        }
        Ok(())
    }

    fn hold(&self, id: HoldId) -> Result<PriorityHold> {
        self.controllers
            .hold(id)
            .cloned()
            .ok_or_else(|| DomainError::not_found("priority hold", id))
    }

    fn reservation(&self, id: ReservationId) -> Result<Reservation> {
        self.controllers
            .reservation(id)
            .cloned()
            .ok_or_else(|| DomainError::not_found("reservation", id))
    }

    fn sale(&self, id: SaleId) -> Result<Sale> {
        self.controllers
            .sale(id)
            .cloned()
            .ok_or_else(|| DomainError::not_found("sale", id))
    }

    fn promotion(&self, id: PromotionId) -> Result<Promotion> {
        self.controllers
            .promotion(id)
            .cloned()
            .ok_or_else(|| DomainError::not_found("promotion", id))
    }

    fn put_hold(&mut self, before: Option<PriorityHold>, after: PriorityHold) {
        let change = ChildChange::hold(before.as_ref(), &after);
        if before.is_none_or(|b| b.status != after.status) {
            metrics::counter!("lots.transition", "entity" => "hold", "to" => after.status.as_str())
                .increment(1);
        }
        self.dirty.insert(ChildRef::Hold(after.id));
        self.controllers.upsert_hold(after);
        LotStateCoordinator::on_child_state_changed(&mut self.lot, change, &self.controllers);
    }

    fn put_reservation(&mut self, before: Option<Reservation>, after: Reservation) {
        let change = ChildChange::reservation(before.as_ref(), &after);
        if before.is_none_or(|b| b.status != after.status) {
            metrics::counter!(
                "lots.transition",
                "entity" => "reservation",
                "to" => after.status.as_str()
            )
            .increment(1);
        }
        self.dirty.insert(ChildRef::Reservation(after.id));
        self.controllers.upsert_reservation(after);
        LotStateCoordinator::on_child_state_changed(&mut self.lot, change, &self.controllers);
    }

    fn put_sale(&mut self, before: Option<Sale>, after: Sale) {
        let change = ChildChange::sale(before.as_ref(), &after);
        if before.is_none_or(|b| b.status != after.status) {
            metrics::counter!("lots.transition", "entity" => "sale", "to" => after.status.as_str())
                .increment(1);
        }
        self.dirty.insert(ChildRef::Sale(after.id));
        self.controllers.upsert_sale(after);
        LotStateCoordinator::on_child_state_changed(&mut self.lot, change, &self.controllers);
    }

    fn put_promotion(&mut self, before: Option<Promotion>, after: Promotion) {
        let change = ChildChange::promotion(before.as_ref(), &after);
        if before.is_none_or(|b| b.active != after.active) {
            let to = if after.active { "ACTIVE" } else { "INACTIVE" };
            metrics::counter!("lots.transition", "entity" => "promotion", "to" => to).increment(1);
        }
        self.dirty.insert(ChildRef::Promotion(after.id));
        self.controllers.upsert_promotion(after);
        LotStateCoordinator::on_child_state_changed(&mut self.lot, change, &self.controllers);
    }

    /// A sale ends every promotion on the lot.
    fn close_promotions(&mut self) {
        for promotion in self.controllers.promotions.clone() {
            let mut after = promotion.clone();
            if PromotionLifecycle::close_for_sale(&mut self.lot, &mut after).is_some() {
                self.put_promotion(Some(promotion), after);
            }
        }
    }

    /// Persist children in foreign-key order, then the lot, then commit.
    async fn finish(mut self) -> Result<Lot> {
        for child in std::mem::take(&mut self.dirty) {
            match child {
                ChildRef::Hold(id) => {
                    if let Some(hold) = self.controllers.hold(id) {
                        self.tx.save_hold(hold).await?;
                    }
                }
                ChildRef::Reservation(id) => {
                    if let Some(reservation) = self.controllers.reservation(id) {
                        self.tx.save_reservation(reservation).await?;
                    }
                }
                ChildRef::Sale(id) => {
                    if let Some(sale) = self.controllers.sale(id) {
                        self.tx.save_sale(sale).await?;
                    }
                }
                ChildRef::Promotion(id) => {
                    if let Some(promotion) = self.controllers.promotion(id) {
                        self.tx.save_promotion(promotion).await?;
                    }
                }
            }
        }
        for offer in &self.new_offers {
            self.tx.append_offer(offer).await?;
        }
        if self.lot != self.loaded {
            self.tx.save_lot(&self.lot).await?;
        }
        self.tx.commit().await?;
        Ok(self.lot)
    }
}
