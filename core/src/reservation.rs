//! Reservation lifecycle.
//!
//! ```text
//! ACTIVA ──────► CONTRAOFERTA ──► ACEPTADA
//!   │  ◄──────────── │ (offer lapsed)
//!   ├─► ACEPTADA     ├─► CANCELADA
//!   ├─► CANCELADA    └─► EXPIRADA
//!   └─► EXPIRADA
//! ```
//!
//! Expiry is lazy: whoever touches a reservation calls
//! [`ReservationLifecycle::expire_if_due`] first.

use crate::error::{DomainError, Result};
use crate::negotiation::NegotiationEngine;
use crate::types::{
    LotId, LotStatus, Money, OperationalFlag, Offer, Party, PersonId, Reservation, ReservationId,
    ReservationStatus, SaleId, Transition,
};
use chrono::{DateTime, Utc};

/// Input for placing a reservation.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NewReservation {
    /// Lot to reserve
    pub lot_id: LotId,
    /// Client reference
    pub client_id: PersonId,
    /// Who is placing it
    pub requested_by: Party,
    /// Deposit paid
    pub deposit: Money,
    /// End of the reservation term
    pub ends_at: DateTime<Utc>,
}

/// Reservation status rules.
#[derive(Clone, Copy, Debug, Default)]
pub struct ReservationLifecycle;

impl ReservationLifecycle {
    /// States reachable from `from`.
    #[must_use]
    pub const fn allowed_successors(from: ReservationStatus) -> &'static [ReservationStatus] {
        use ReservationStatus::{Aceptada, Activa, Cancelada, Contraoferta, Expirada};
        match from {
            Activa => &[Aceptada, Contraoferta, Cancelada, Expirada],
            Contraoferta => &[Activa, Aceptada, Cancelada, Expirada],
            Aceptada | Cancelada | Expirada => &[],
        }
    }

    /// Whether no transition leaves `status`
    #[must_use]
    pub const fn is_terminal(status: ReservationStatus) -> bool {
        Self::allowed_successors(status).is_empty()
    }

    /// Build a new ACTIVA reservation.
    ///
    /// # Errors
    ///
    /// Returns [`DomainError::Validation`] for a zero deposit or an end of
    /// term not after `now`.
    pub fn open(
        new: NewReservation,
        lot_status_at_creation: LotStatus,
        now: DateTime<Utc>,
    ) -> Result<Reservation> {
        if new.deposit.is_zero() {
            return Err(DomainError::Validation(
                "deposit must be greater than zero".to_string(),
            ));
        }
        if new.ends_at <= now {
            return Err(DomainError::Validation(
                "reservation end date must be in the future".to_string(),
            ));
        }

        Ok(Reservation {
            id: ReservationId::new(),
            lot_id: new.lot_id,
            status: ReservationStatus::Activa,
            client_id: new.client_id,
            realtor_id: new.requested_by.realtor(),
            deposit: new.deposit,
            reserved_at: now,
            ends_at: new.ends_at,
            lot_status_at_creation,
            sale_id: None,
            flag: OperationalFlag::Operativo,
        })
    }

    /// Apply a status change. Same-state is a no-op.
    ///
    /// # Errors
    ///
    /// Returns [`DomainError::Conflict`] if the table forbids it.
    pub fn transition(
        reservation: &mut Reservation,
        to: ReservationStatus,
    ) -> Result<Transition<ReservationStatus>> {
        let from = reservation.status;
        if from != to && !Self::allowed_successors(from).contains(&to) {
            return Err(DomainError::Conflict(format!(
                "reservation {} cannot move from {from} to {to}",
                reservation.id
            )));
        }
        reservation.status = to;
        if from != to {
            tracing::info!(
                reservation_id = %reservation.id,
                lot_id = %reservation.lot_id,
                from = %from,
                to = %to,
                "Reservation state changed"
            );
        }
        Ok(Transition::new(from, to))
    }

    /// Withdraw a live reservation.
    ///
    /// # Errors
    ///
    /// Returns [`DomainError::Conflict`] if it is already terminal.
    pub fn cancel(reservation: &mut Reservation) -> Result<Transition<ReservationStatus>> {
        if Self::is_terminal(reservation.status) {
            return Err(DomainError::Conflict(format!(
                "reservation {} is already {}",
                reservation.id, reservation.status
            )));
        }
        Self::transition(reservation, ReservationStatus::Cancelada)
    }

    /// Record the sale an accepted reservation produced.
    ///
    /// # Errors
    ///
    /// Returns [`DomainError::Conflict`] unless the reservation is ACEPTADA
    /// and not yet linked.
    pub fn link_sale(reservation: &mut Reservation, sale_id: SaleId) -> Result<()> {
        if reservation.status != ReservationStatus::Aceptada {
            return Err(DomainError::Conflict(format!(
                "reservation {} is {}, only ACEPTADA reservations produce a sale",
                reservation.id, reservation.status
            )));
        }
        if let Some(existing) = reservation.sale_id {
            return Err(DomainError::Conflict(format!(
                "reservation {} already produced sale {existing}",
                reservation.id
            )));
        }
        reservation.sale_id = Some(sale_id);
        Ok(())
    }

    /// Whether the term elapsed on a live reservation
    #[must_use]
    pub fn is_expired(reservation: &Reservation, now: DateTime<Utc>) -> bool {
        matches!(
            reservation.status,
            ReservationStatus::Activa | ReservationStatus::Contraoferta
        ) && now > reservation.ends_at
    }

    /// Whether [`Self::expire_if_due`] would change anything
    #[must_use]
    pub fn is_due(reservation: &Reservation, offers: &[Offer], now: DateTime<Utc>) -> bool {
        Self::is_expired(reservation, now)
            || (reservation.status == ReservationStatus::Contraoferta
                && NegotiationEngine::new(offers).latest_lapsed(now))
    }

    /// Lazy time check run before any read or write.
    ///
    /// - term elapsed on ACTIVA/CONTRAOFERTA → EXPIRADA
    /// - CONTRAOFERTA whose latest offer lapsed → ACTIVA
    pub fn expire_if_due(
        reservation: &mut Reservation,
        offers: &[Offer],
        now: DateTime<Utc>,
    ) -> Option<Transition<ReservationStatus>> {
        let target = if Self::is_expired(reservation, now) {
            ReservationStatus::Expirada
        } else if reservation.status == ReservationStatus::Contraoferta
            && NegotiationEngine::new(offers).latest_lapsed(now)
        {
            ReservationStatus::Activa
        } else {
            return None;
        };

        let from = reservation.status;
        reservation.status = target;
        tracing::warn!(
            reservation_id = %reservation.id,
            lot_id = %reservation.lot_id,
            from = %from,
            to = %target,
            "Reservation lapsed"
        );
        Some(Transition::new(from, target))
    }
}
