//! Turn-based counter-offer protocol attached to a reservation.
//!
//! The engine holds no state of its own: it reads the reservation's offer
//! history, which the store returns ordered by server timestamp and then
//! sequence. "Latest" is always computed here, never taken from a client.

use crate::error::{DomainError, Result};
use crate::reservation::ReservationLifecycle;
use crate::types::{
    Money, Offer, OfferId, OwnerType, Party, Reservation, ReservationStatus, Transition,
};
use chrono::{DateTime, Utc};

/// A counter-offer as submitted by a caller.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CounterOffer {
    /// Proposed price
    pub amount: Money,
    /// Optional rationale
    pub rationale: Option<String>,
    /// Optional validity deadline
    pub valid_until: Option<DateTime<Utc>>,
}

impl CounterOffer {
    /// Offer with no rationale and no deadline
    #[must_use]
    pub const fn new(amount: Money) -> Self {
        Self {
            amount,
            rationale: None,
            valid_until: None,
        }
    }

    /// Attach a rationale
    #[must_use]
    pub fn with_rationale(mut self, rationale: impl Into<String>) -> Self {
        self.rationale = Some(rationale.into());
        self
    }

    /// Attach a validity deadline
    #[must_use]
    pub const fn valid_until(mut self, valid_until: DateTime<Utc>) -> Self {
        self.valid_until = Some(valid_until);
        self
    }
}

/// View over one reservation's offer history.
#[derive(Clone, Copy, Debug)]
pub struct NegotiationEngine<'a> {
    offers: &'a [Offer],
}

impl<'a> NegotiationEngine<'a> {
    /// Wrap an offer history
    #[must_use]
    pub const fn new(offers: &'a [Offer]) -> Self {
        Self { offers }
    }

    /// Most recent offer by server timestamp, sequence breaking ties.
    #[must_use]
    pub fn latest(&self) -> Option<&'a Offer> {
        self.offers
            .iter()
            .max_by_key(|offer| (offer.created_at, offer.sequence))
    }

    /// Side expected to answer next. `None` while the history is empty,
    /// meaning either side may open.
    #[must_use]
    pub fn current_turn(&self) -> Option<OwnerType> {
        self.latest().map(|offer| match offer.owner_type {
            OwnerType::Inmobiliaria => OwnerType::Cclf,
            OwnerType::Cclf => OwnerType::Inmobiliaria,
        })
    }

    /// Whether the latest offer carries a deadline that has passed
    #[must_use]
    pub fn latest_lapsed(&self, now: DateTime<Utc>) -> bool {
        self.latest()
            .and_then(|offer| offer.valid_until)
            .is_some_and(|valid_until| now > valid_until)
    }

    /// Append a counter-offer and move the reservation to CONTRAOFERTA.
    ///
    /// Returns the new offer; the caller persists it.
    ///
    /// # Errors
    ///
    /// - [`DomainError::Conflict`] if the reservation is terminal or the
    ///   caller is a realtor other than the one handling it
    /// - [`DomainError::Validation`] for a zero amount or a deadline not
    ///   strictly after the reservation date
    pub fn counter(
        &self,
        reservation: &mut Reservation,
        caller: &Party,
        proposal: CounterOffer,
        now: DateTime<Utc>,
    ) -> Result<(Offer, Transition<ReservationStatus>)> {
        Self::ensure_open(reservation)?;
        Self::ensure_participant(reservation, caller)?;

        if proposal.amount.is_zero() {
            return Err(DomainError::Validation(
                "offer amount must be greater than zero".to_string(),
            ));
        }
        if let Some(valid_until) = proposal.valid_until {
            if valid_until <= reservation.reserved_at {
                return Err(DomainError::Validation(format!(
                    "offer validity {valid_until} must be after the reservation date {}",
                    reservation.reserved_at
                )));
            }
        }

        // Keep server order monotonic even if the clock stepped back.
        let created_at = self
            .latest()
            .map_or(now, |latest| latest.created_at.max(now));
        let sequence = self
            .offers
            .iter()
            .map(|offer| offer.sequence)
            .max()
            .map_or(1, |max| max + 1);

        let offer = Offer {
            id: OfferId::new(),
            reservation_id: reservation.id,
            sequence,
            amount: proposal.amount,
            rationale: proposal.rationale,
            valid_until: proposal.valid_until,
            owner_type: caller.owner_type(),
            created_at,
        };

        let transition =
            ReservationLifecycle::transition(reservation, ReservationStatus::Contraoferta)?;
        tracing::info!(
            reservation_id = %reservation.id,
            sequence,
            owner_type = %offer.owner_type,
            amount = %offer.amount,
            "Counter-offer submitted"
        );
        Ok((offer, transition))
    }

    /// Accept the latest offer. Returns the accepted offer.
    ///
    /// # Errors
    ///
    /// [`DomainError::Conflict`] if the reservation is terminal, there is no
    /// offer, it is not the caller's turn, or the latest offer lapsed.
    pub fn accept(
        &self,
        reservation: &mut Reservation,
        caller: &Party,
        now: DateTime<Utc>,
    ) -> Result<(&'a Offer, Transition<ReservationStatus>)> {
        let offer = self.ensure_turn(reservation, caller)?;
        if self.latest_lapsed(now) {
            return Err(DomainError::Conflict(format!(
                "offer {} on reservation {} lapsed",
                offer.sequence, reservation.id
            )));
        }
        let transition = ReservationLifecycle::transition(reservation, ReservationStatus::Aceptada)?;
        Ok((offer, transition))
    }

    /// Reject the latest offer, cancelling the reservation.
    ///
    /// # Errors
    ///
    /// [`DomainError::Conflict`] if the reservation is terminal, there is no
    /// offer, or it is not the caller's turn.
    pub fn reject(
        &self,
        reservation: &mut Reservation,
        caller: &Party,
    ) -> Result<Transition<ReservationStatus>> {
        self.ensure_turn(reservation, caller)?;
        ReservationLifecycle::transition(reservation, ReservationStatus::Cancelada)
    }

    fn ensure_turn(&self, reservation: &Reservation, caller: &Party) -> Result<&'a Offer> {
        Self::ensure_open(reservation)?;
        Self::ensure_participant(reservation, caller)?;

        let Some(latest) = self.latest() else {
            return Err(DomainError::Conflict(format!(
                "reservation {} has no offer to respond to",
                reservation.id
            )));
        };
        if latest.owner_type == caller.owner_type() {
            return Err(DomainError::Conflict(format!(
                "not your turn: {} made the latest offer on reservation {}",
                latest.owner_type, reservation.id
            )));
        }
        Ok(latest)
    }

    fn ensure_open(reservation: &Reservation) -> Result<()> {
        if ReservationLifecycle::is_terminal(reservation.status) {
            return Err(DomainError::Conflict(format!(
                "reservation {} is {}; negotiation is closed",
                reservation.id, reservation.status
            )));
        }
        Ok(())
    }

    fn ensure_participant(reservation: &Reservation, caller: &Party) -> Result<()> {
        match (caller.realtor(), reservation.realtor_id) {
            (Some(caller), Some(handler)) if caller != handler => Err(DomainError::Conflict(
                format!(
                    "realtor {caller} does not handle reservation {}",
                    reservation.id
                ),
            )),
            _ => Ok(()),
        }
    }
}
