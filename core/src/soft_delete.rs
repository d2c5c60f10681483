//! Soft-delete gate shared by sales, reservations and priority holds.
//!
//! The operational flag is orthogonal to business state: flipping it never
//! touches `status`, and the lot's status is never recomputed because of it.

use crate::error::{DomainError, Result};
use crate::types::{
    HoldId, OperationalFlag, PriorityHold, Reservation, ReservationId, ReservationStatus, Sale,
    SaleId, SaleStatus, Transition,
};
use std::fmt;

/// A record carrying an operational flag.
pub trait SoftDeletable {
    /// Entity name used in errors and logs
    const ENTITY: &'static str;

    /// Identifier for errors and logs
    fn entity_id(&self) -> String;

    /// Current flag
    fn flag(&self) -> OperationalFlag;

    /// Overwrite the flag
    fn set_flag(&mut self, flag: OperationalFlag);

    /// Whether the business state allows hiding the record
    fn deletable(&self) -> bool;
}

impl SoftDeletable for Sale {
    const ENTITY: &'static str = "sale";

    fn entity_id(&self) -> String {
        self.id.to_string()
    }

    fn flag(&self) -> OperationalFlag {
        self.flag
    }

    fn set_flag(&mut self, flag: OperationalFlag) {
        self.flag = flag;
    }

    /// CANCELADA, or deeded and fully paid.
    fn deletable(&self) -> bool {
        self.status == SaleStatus::Cancelada || self.is_finalized()
    }
}

impl SoftDeletable for Reservation {
    const ENTITY: &'static str = "reservation";

    fn entity_id(&self) -> String {
        self.id.to_string()
    }

    fn flag(&self) -> OperationalFlag {
        self.flag
    }

    fn set_flag(&mut self, flag: OperationalFlag) {
        self.flag = flag;
    }

    fn deletable(&self) -> bool {
        self.status == ReservationStatus::Cancelada
    }
}

impl SoftDeletable for PriorityHold {
    const ENTITY: &'static str = "priority hold";

    fn entity_id(&self) -> String {
        self.id.to_string()
    }

    fn flag(&self) -> OperationalFlag {
        self.flag
    }

    fn set_flag(&mut self, flag: OperationalFlag) {
        self.flag = flag;
    }

    fn deletable(&self) -> bool {
        !self.is_controlling()
    }
}

/// Reference to a soft-deletable record.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum EntityRef {
    /// A sale
    Sale(SaleId),
    /// A reservation
    Reservation(ReservationId),
    /// A priority hold
    Hold(HoldId),
}

impl fmt::Display for EntityRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Sale(id) => write!(f, "sale {id}"),
            Self::Reservation(id) => write!(f, "reservation {id}"),
            Self::Hold(id) => write!(f, "priority hold {id}"),
        }
    }
}

/// Flips the operational flag after checking eligibility.
#[derive(Clone, Copy, Debug, Default)]
pub struct SoftDeleteGuard;

impl SoftDeleteGuard {
    /// Mark a record ELIMINADO. Already-deleted records are a no-op.
    ///
    /// # Errors
    ///
    /// Returns [`DomainError::Conflict`] if the business state forbids it.
    pub fn soft_delete<T: SoftDeletable>(entity: &mut T) -> Result<Transition<OperationalFlag>> {
        let from = entity.flag();
        if from == OperationalFlag::Eliminado {
            return Ok(Transition::new(from, from));
        }
        if !entity.deletable() {
            return Err(DomainError::Conflict(format!(
                "{} {} is not eligible for deletion in its current state",
                T::ENTITY,
                entity.entity_id()
            )));
        }
        entity.set_flag(OperationalFlag::Eliminado);
        tracing::info!(entity = T::ENTITY, id = %entity.entity_id(), "Soft-deleted");
        Ok(Transition::new(from, OperationalFlag::Eliminado))
    }

    /// Mark a record OPERATIVO again. Business state is untouched.
    pub fn reactivate<T: SoftDeletable>(entity: &mut T) -> Transition<OperationalFlag> {
        let from = entity.flag();
        if from != OperationalFlag::Operativo {
            entity.set_flag(OperationalFlag::Operativo);
            tracing::info!(entity = T::ENTITY, id = %entity.entity_id(), "Reactivated");
        }
        Transition::new(from, OperationalFlag::Operativo)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)] // Test code can use unwrap
mod tests {
    use super::*;
    use crate::types::{LotId, LotStatus, Money, PaymentStatus, PersonId};
    use chrono::Utc;
    use proptest::prelude::*;

    fn sale(status: SaleStatus, payment_status: PaymentStatus) -> Sale {
        Sale {
            id: SaleId::new(),
            lot_id: LotId::new(),
            status,
            payment_status,
            amount: Money::from_units(17_500),
            sold_at: Utc::now(),
            payment_type: "CONTADO".to_string(),
            buyer_id: PersonId::new(),
            boleto_date: None,
            deed_date: None,
            cancelled_at: None,
            cancellation_reason: None,
            reservation_id: None,
            lot_status_at_creation: LotStatus::Disponible,
            flag: OperationalFlag::Operativo,
        }
    }

    proptest! {
        #[test]
        fn sale_gate_matches_rule(
            status in prop::sample::select(SaleStatus::ALL.to_vec()),
            payment in prop::sample::select(PaymentStatus::ALL.to_vec()),
        ) {
            let mut sale = sale(status, payment);
            let expected = status == SaleStatus::Cancelada
                || (status == SaleStatus::Escriturado && payment == PaymentStatus::PagoCompleto);
            let result = SoftDeleteGuard::soft_delete(&mut sale);
            if expected {
                prop_assert!(result.is_ok());
                prop_assert_eq!(sale.flag, OperationalFlag::Eliminado);
            } else {
                prop_assert!(matches!(result, Err(DomainError::Conflict(_))));
                prop_assert_eq!(sale.flag, OperationalFlag::Operativo);
            }
            prop_assert_eq!(sale.status, status);
        }
    }

    #[test]
    fn delete_and_reactivate_are_idempotent() {
        let mut sale = sale(SaleStatus::Cancelada, PaymentStatus::Pendiente);
        assert!(!SoftDeleteGuard::soft_delete(&mut sale).unwrap().is_noop());
        assert!(SoftDeleteGuard::soft_delete(&mut sale).unwrap().is_noop());
        assert!(!SoftDeleteGuard::reactivate(&mut sale).is_noop());
        assert!(SoftDeleteGuard::reactivate(&mut sale).is_noop());
        assert_eq!(sale.status, SaleStatus::Cancelada);
    }

    #[test]
    fn entity_ref_display() {
        let id = SaleId::new();
        assert_eq!(EntityRef::Sale(id).to_string(), format!("sale {id}"));
    }
}
