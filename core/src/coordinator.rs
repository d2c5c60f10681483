//! The single writer of `Lot::status`.
//!
//! Four lifecycles compete for a lot: sales, reservations, priority holds and
//! promotions. None of them touches the lot's status. Each reports a
//! [`ChildChange`] (was the child controlling before, is it controlling
//! after, what did the lot look like when it was created) and the
//! [`LotStateCoordinator`] decides what the lot shows.
//!
//! # Controller order
//!
//! ```text
//! Sale (not CANCELADA)             -> VENDIDO
//! Reservation (ACTIVA/CONTRAOFERTA) -> RESERVADO
//! PriorityHold (ACTIVA)            -> CON_PRIORIDAD
//! Promotion (activa)               -> EN_PROMOCION
//! none                             -> DISPONIBLE / NO_DISPONIBLE
//! ```
//!
//! A promotion may stay active underneath a hold or reservation; it is simply
//! outranked. Holds, reservations and sales never coexist: creation is only
//! allowed from the lot states listed in [`LotStateCoordinator::ensure_can_create`],
//! and the caller holds the lot row lock while checking.

use crate::error::{DomainError, Result};
use crate::types::{
    HoldId, Lot, LotStatus, Party, PriorityHold, Promotion, PromotionId, Reservation,
    ReservationId, Sale, SaleId,
};
use std::fmt;

/// The kinds of child record that can control a lot, highest rank first.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ControllerKind {
    /// A non-cancelled sale
    Sale,
    /// A live reservation
    Reservation,
    /// An active priority hold
    Hold,
    /// An active promotion
    Promotion,
}

impl ControllerKind {
    /// Lot status shown while this kind controls the lot
    #[must_use]
    pub const fn lot_status(self) -> LotStatus {
        match self {
            Self::Sale => LotStatus::Vendido,
            Self::Reservation => LotStatus::Reservado,
            Self::Hold => LotStatus::ConPrioridad,
            Self::Promotion => LotStatus::EnPromocion,
        }
    }

    /// Lot states from which a new controller of this kind may be created
    #[must_use]
    pub const fn allowed_sources(self) -> &'static [LotStatus] {
        match self {
            Self::Sale | Self::Hold => &[LotStatus::Disponible, LotStatus::EnPromocion],
            // CON_PRIORIDAD additionally requires the requester to own the hold
            Self::Reservation => &[
                LotStatus::Disponible,
                LotStatus::EnPromocion,
                LotStatus::ConPrioridad,
            ],
            Self::Promotion => &[LotStatus::Disponible],
        }
    }

    const fn label(self) -> &'static str {
        match self {
            Self::Sale => "sale",
            Self::Reservation => "reservation",
            Self::Hold => "priority hold",
            Self::Promotion => "promotion",
        }
    }
}

impl fmt::Display for ControllerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// What a lifecycle transition did to one child, as seen by the coordinator.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ChildChange {
    /// Kind of child
    pub kind: ControllerKind,
    /// Controlling before the transition
    pub was_controlling: bool,
    /// Controlling after the transition
    pub is_controlling: bool,
    /// Lot state recorded when the child was created
    pub snapshot: LotStatus,
}

impl ChildChange {
    /// Change report for a sale
    #[must_use]
    pub const fn sale(before: Option<&Sale>, after: &Sale) -> Self {
        Self {
            kind: ControllerKind::Sale,
            was_controlling: match before {
                Some(sale) => sale.is_controlling(),
                None => false,
            },
            is_controlling: after.is_controlling(),
            snapshot: after.lot_status_at_creation,
        }
    }

    /// Change report for a reservation
    #[must_use]
    pub const fn reservation(before: Option<&Reservation>, after: &Reservation) -> Self {
        Self {
            kind: ControllerKind::Reservation,
            was_controlling: match before {
                Some(reservation) => reservation.is_controlling(),
                None => false,
            },
            is_controlling: after.is_controlling(),
            snapshot: after.lot_status_at_creation,
        }
    }

    /// Change report for a priority hold
    #[must_use]
    pub const fn hold(before: Option<&PriorityHold>, after: &PriorityHold) -> Self {
        Self {
            kind: ControllerKind::Hold,
            was_controlling: match before {
                Some(hold) => hold.is_controlling(),
                None => false,
            },
            is_controlling: after.is_controlling(),
            snapshot: after.lot_status_at_creation,
        }
    }

    /// Change report for a promotion
    #[must_use]
    pub const fn promotion(before: Option<&Promotion>, after: &Promotion) -> Self {
        Self {
            kind: ControllerKind::Promotion,
            was_controlling: match before {
                Some(promotion) => promotion.is_controlling(),
                None => false,
            },
            is_controlling: after.is_controlling(),
            snapshot: after.previous_lot_status,
        }
    }
}

/// Every child record of one lot, as read inside the locking transaction.
#[derive(Clone, Debug, Default)]
pub struct LotControllers {
    /// Priority holds
    pub holds: Vec<PriorityHold>,
    /// Reservations
    pub reservations: Vec<Reservation>,
    /// Sales
    pub sales: Vec<Sale>,
    /// Promotions
    pub promotions: Vec<Promotion>,
}

impl LotControllers {
    /// The non-cancelled sale, if any
    #[must_use]
    pub fn active_sale(&self) -> Option<&Sale> {
        self.sales.iter().find(|s| s.is_controlling())
    }

    /// The live reservation, if any
    #[must_use]
    pub fn active_reservation(&self) -> Option<&Reservation> {
        self.reservations.iter().find(|r| r.is_controlling())
    }

    /// The active hold, if any
    #[must_use]
    pub fn active_hold(&self) -> Option<&PriorityHold> {
        self.holds.iter().find(|h| h.is_controlling())
    }

    /// The active promotion, if any
    #[must_use]
    pub fn active_promotion(&self) -> Option<&Promotion> {
        self.promotions.iter().find(|p| p.is_controlling())
    }

    /// Highest-ranked active controller
    #[must_use]
    pub fn active_controller(&self) -> Option<ControllerKind> {
        if self.active_sale().is_some() {
            Some(ControllerKind::Sale)
        } else if self.active_reservation().is_some() {
            Some(ControllerKind::Reservation)
        } else if self.active_hold().is_some() {
            Some(ControllerKind::Hold)
        } else if self.active_promotion().is_some() {
            Some(ControllerKind::Promotion)
        } else {
            None
        }
    }

    /// Find a hold by id
    #[must_use]
    pub fn hold(&self, id: HoldId) -> Option<&PriorityHold> {
        self.holds.iter().find(|h| h.id == id)
    }

    /// Find a reservation by id
    #[must_use]
    pub fn reservation(&self, id: ReservationId) -> Option<&Reservation> {
        self.reservations.iter().find(|r| r.id == id)
    }

    /// Find a sale by id
    #[must_use]
    pub fn sale(&self, id: SaleId) -> Option<&Sale> {
        self.sales.iter().find(|s| s.id == id)
    }

    /// Find a promotion by id
    #[must_use]
    pub fn promotion(&self, id: PromotionId) -> Option<&Promotion> {
        self.promotions.iter().find(|p| p.id == id)
    }

    /// Insert or replace a hold
    pub fn upsert_hold(&mut self, hold: PriorityHold) {
        upsert(&mut self.holds, hold, |a, b| a.id == b.id);
    }

    /// Insert or replace a reservation
    pub fn upsert_reservation(&mut self, reservation: Reservation) {
        upsert(&mut self.reservations, reservation, |a, b| a.id == b.id);
    }

    /// Insert or replace a sale
    pub fn upsert_sale(&mut self, sale: Sale) {
        upsert(&mut self.sales, sale, |a, b| a.id == b.id);
    }

    /// Insert or replace a promotion
    pub fn upsert_promotion(&mut self, promotion: Promotion) {
        upsert(&mut self.promotions, promotion, |a, b| a.id == b.id);
    }
}

fn upsert<T>(items: &mut Vec<T>, item: T, same: impl Fn(&T, &T) -> bool) {
    if let Some(slot) = items.iter_mut().find(|existing| same(existing, &item)) {
        *slot = item;
    } else {
        items.push(item);
    }
}

/// Top-level orchestrator: validates controller creation and recomputes the
/// lot's status after every child transition.
#[derive(Clone, Copy, Debug, Default)]
pub struct LotStateCoordinator;

impl LotStateCoordinator {
    /// Check that a new controller of `kind` may be placed on `lot`.
    ///
    /// `requester` matters only for reservations on a `CON_PRIORIDAD` lot: the
    /// requester must own the active hold.
    ///
    /// # Errors
    ///
    /// Returns [`DomainError::Conflict`] if the lot is not in an allowed source
    /// state, or a competing controller is active.
    pub fn ensure_can_create(
        lot: &Lot,
        kind: ControllerKind,
        requester: Option<&Party>,
        controllers: &LotControllers,
    ) -> Result<()> {
        let status = lot.status();
        if !kind.allowed_sources().contains(&status) {
            return Err(DomainError::Conflict(format!(
                "lot {} is {status}; a {kind} cannot be placed on it",
                lot.id
            )));
        }

        if let Some(sale) = controllers.active_sale() {
            return Err(DomainError::Conflict(format!(
                "lot {} is already controlled by sale {}",
                lot.id, sale.id
            )));
        }
        if let Some(reservation) = controllers.active_reservation() {
            return Err(DomainError::Conflict(format!(
                "lot {} is already controlled by reservation {}",
                lot.id, reservation.id
            )));
        }

        match (kind, controllers.active_hold()) {
            (ControllerKind::Reservation, Some(hold)) => {
                if requester != Some(&hold.owner) {
                    return Err(DomainError::Conflict(format!(
                        "lot {} is held by {} under priority hold {}",
                        lot.id, hold.owner, hold.id
                    )));
                }
            }
            (ControllerKind::Reservation, None) if status == LotStatus::ConPrioridad => {
                return Err(DomainError::Conflict(format!(
                    "lot {} shows CON_PRIORIDAD without an active hold",
                    lot.id
                )));
            }
            (ControllerKind::Reservation | ControllerKind::Promotion, None) => {}
            (_, Some(hold)) => {
                return Err(DomainError::Conflict(format!(
                    "lot {} already has active priority hold {}",
                    lot.id, hold.id
                )));
            }
            (_, None) => {}
        }

        if kind == ControllerKind::Promotion {
            if let Some(promotion) = controllers.active_promotion() {
                return Err(DomainError::Conflict(format!(
                    "lot {} already has active promotion {}",
                    lot.id, promotion.id
                )));
            }
        }

        Ok(())
    }

    /// Recompute the lot's status after a child transition.
    ///
    /// `controllers` must already reflect the child's new state. Returns the
    /// previous lot status when it changed.
    ///
    /// - entering: the lot shows the highest-ranked active controller
    /// - leaving: if another controller is still active it keeps the lot;
    ///   otherwise the child's snapshot is restored
    pub fn on_child_state_changed(
        lot: &mut Lot,
        change: ChildChange,
        controllers: &LotControllers,
    ) -> Option<LotStatus> {
        let next = match (change.was_controlling, change.is_controlling) {
            (false, true) => controllers
                .active_controller()
                .map_or(change.kind.lot_status(), ControllerKind::lot_status),
            (true, false) => match controllers.active_controller() {
                Some(owner) => owner.lot_status(),
                None => Self::restorable(change.snapshot),
            },
            _ => return None,
        };

        let previous = lot.status();
        if previous == next {
            return None;
        }

        tracing::debug!(
            lot_id = %lot.id,
            child = %change.kind,
            from = %previous,
            to = %next,
            "Lot status recomputed"
        );
        lot.set_status(next);
        Some(previous)
    }

    /// Status the lot should show given its controllers, for consistency checks.
    ///
    /// `base` is what an uncontrolled lot shows (DISPONIBLE or NO_DISPONIBLE).
    #[must_use]
    pub fn derived_status(controllers: &LotControllers, base: LotStatus) -> LotStatus {
        controllers
            .active_controller()
            .map_or(Self::restorable(base), ControllerKind::lot_status)
    }

    /// Take the lot off the market.
    ///
    /// # Errors
    ///
    /// Returns [`DomainError::Conflict`] unless the lot is DISPONIBLE with no
    /// active controller.
    pub fn withdraw(lot: &mut Lot, controllers: &LotControllers) -> Result<LotStatus> {
        Self::ensure_uncontrolled(lot, controllers, LotStatus::Disponible)?;
        lot.set_status(LotStatus::NoDisponible);
        Ok(LotStatus::Disponible)
    }

    /// Put a withdrawn lot back on the market.
    ///
    /// # Errors
    ///
    /// Returns [`DomainError::Conflict`] unless the lot is NO_DISPONIBLE with
    /// no active controller.
    pub fn release(lot: &mut Lot, controllers: &LotControllers) -> Result<LotStatus> {
        Self::ensure_uncontrolled(lot, controllers, LotStatus::NoDisponible)?;
        lot.set_status(LotStatus::Disponible);
        Ok(LotStatus::NoDisponible)
    }

    fn ensure_uncontrolled(
        lot: &Lot,
        controllers: &LotControllers,
        expected: LotStatus,
    ) -> Result<()> {
        if let Some(kind) = controllers.active_controller() {
            return Err(DomainError::Conflict(format!(
                "lot {} is controlled by an active {kind}",
                lot.id
            )));
        }
        if lot.status() != expected {
            return Err(DomainError::Conflict(format!(
                "lot {} is {}, expected {expected}",
                lot.id,
                lot.status()
            )));
        }
        Ok(())
    }

    /// A snapshot naming a controller state cannot be shown without that
    /// controller; fall back to DISPONIBLE.
    const fn restorable(snapshot: LotStatus) -> LotStatus {
        match snapshot {
            LotStatus::Disponible | LotStatus::NoDisponible => snapshot,
            LotStatus::Reservado
            | LotStatus::Vendido
            | LotStatus::EnPromocion
            | LotStatus::ConPrioridad => LotStatus::Disponible,
        }
    }
}
