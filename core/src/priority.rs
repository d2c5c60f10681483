//! Priority hold lifecycle: a time-boxed exclusive option to reserve a lot.
//!
//! ACTIVA is the only live state. Everything else is terminal.

use crate::error::{DomainError, Result};
use crate::types::{
    HoldId, HoldStatus, LotId, LotStatus, OperationalFlag, Party, PriorityHold, Transition,
};
use chrono::{DateTime, Utc};

/// Input for placing a priority hold.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct NewHold {
    /// Lot to hold
    pub lot_id: LotId,
    /// Holder
    pub owner: Party,
    /// When the hold lapses
    pub ends_at: DateTime<Utc>,
}

/// Priority hold status rules.
#[derive(Clone, Copy, Debug, Default)]
pub struct PriorityLifecycle;

impl PriorityLifecycle {
    /// Build a new ACTIVA hold starting at `now`.
    ///
    /// # Errors
    ///
    /// Returns [`DomainError::Validation`] if `ends_at` is not after `now`.
    pub fn open(
        new: NewHold,
        lot_status_at_creation: LotStatus,
        now: DateTime<Utc>,
    ) -> Result<PriorityHold> {
        if new.ends_at <= now {
            return Err(DomainError::Validation(
                "priority hold end must be in the future".to_string(),
            ));
        }
        Ok(PriorityHold {
            id: HoldId::new(),
            lot_id: new.lot_id,
            status: HoldStatus::Activa,
            owner: new.owner,
            starts_at: now,
            ends_at: new.ends_at,
            lot_status_at_creation,
            flag: OperationalFlag::Operativo,
        })
    }

    /// Release the hold without exercising it.
    ///
    /// # Errors
    ///
    /// Returns [`DomainError::Conflict`] unless the hold is ACTIVA.
    pub fn cancel(hold: &mut PriorityHold) -> Result<Transition<HoldStatus>> {
        Self::close(hold, HoldStatus::Cancelada)
    }

    /// Mark the hold as exercised by its holder.
    ///
    /// # Errors
    ///
    /// Returns [`DomainError::Conflict`] unless the hold is ACTIVA.
    pub fn finalize(hold: &mut PriorityHold) -> Result<Transition<HoldStatus>> {
        Self::close(hold, HoldStatus::Finalizada)
    }

    /// Whether the hold is ACTIVA past its end
    #[must_use]
    pub fn is_due(hold: &PriorityHold, now: DateTime<Utc>) -> bool {
        hold.status == HoldStatus::Activa && now > hold.ends_at
    }

    /// Lazy expiry check.
    pub fn expire_if_due(
        hold: &mut PriorityHold,
        now: DateTime<Utc>,
    ) -> Option<Transition<HoldStatus>> {
        if !Self::is_due(hold, now) {
            return None;
        }
        hold.status = HoldStatus::Expirada;
        tracing::warn!(hold_id = %hold.id, lot_id = %hold.lot_id, "Priority hold expired");
        Some(Transition::new(HoldStatus::Activa, HoldStatus::Expirada))
    }

    fn close(hold: &mut PriorityHold, to: HoldStatus) -> Result<Transition<HoldStatus>> {
        if hold.status != HoldStatus::Activa {
            return Err(DomainError::Conflict(format!(
                "priority hold {} is {}, cannot move to {to}",
                hold.id, hold.status
            )));
        }
        hold.status = to;
        tracing::info!(hold_id = %hold.id, lot_id = %hold.lot_id, to = %to, "Priority hold closed");
        Ok(Transition::new(HoldStatus::Activa, to))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)] // Test code can use unwrap
mod tests {
    use super::*;
    use crate::types::RealtorId;
    use chrono::Duration;

    fn hold(now: DateTime<Utc>) -> PriorityHold {
        PriorityLifecycle::open(
            NewHold {
                lot_id: LotId::new(),
                owner: Party::Inmobiliaria(RealtorId::new()),
                ends_at: now + Duration::hours(48),
            },
            LotStatus::Disponible,
            now,
        )
        .unwrap()
    }

    #[test]
    fn end_must_be_in_the_future() {
        let now = Utc::now();
        let result = PriorityLifecycle::open(
            NewHold {
                lot_id: LotId::new(),
                owner: Party::Cclf,
                ends_at: now - Duration::minutes(1),
            },
            LotStatus::Disponible,
            now,
        );
        assert!(matches!(result, Err(DomainError::Validation(_))));
    }

    #[test]
    fn finalize_then_cancel_conflicts() {
        let mut hold = hold(Utc::now());
        let transition = PriorityLifecycle::finalize(&mut hold).unwrap();
        assert_eq!(transition.to, HoldStatus::Finalizada);
        assert!(!hold.is_controlling());
        assert!(matches!(
            PriorityLifecycle::cancel(&mut hold),
            Err(DomainError::Conflict(_))
        ));
    }

    #[test]
    fn expires_lazily() {
        let now = Utc::now();
        let mut hold = hold(now);
        assert!(PriorityLifecycle::expire_if_due(&mut hold, now + Duration::hours(47)).is_none());
        assert!(PriorityLifecycle::expire_if_due(&mut hold, now + Duration::hours(49)).is_some());
        assert_eq!(hold.status, HoldStatus::Expirada);
        assert!(PriorityLifecycle::cancel(&mut hold).is_err());
    }
}
