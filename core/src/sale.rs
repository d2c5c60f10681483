//! Sale state machine.
//!
//! ```text
//! INICIADA ──► CON_BOLETO ──► ESCRITURADO
//!    │  │          │
//!    │  └──────────┼────────► ESCRITURADO
//!    └─────────────┴────────► CANCELADA
//! ```
//!
//! ESCRITURADO and CANCELADA are terminal. A request for the current state is
//! a no-op success. Required fields are checked when a state is entered,
//! independently of the transition table.

use crate::error::{DomainError, Result};
use crate::types::{
    LotId, LotStatus, Money, OperationalFlag, PaymentStatus, PersonId, ReservationId, Sale,
    SaleId, SaleStatus, Transition,
};
use chrono::{DateTime, Utc};

/// Input for registering a sale.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NewSale {
    /// Lot being sold
    pub lot_id: LotId,
    /// Buyer reference
    pub buyer_id: PersonId,
    /// Sale amount
    pub amount: Money,
    /// Free-form payment type tag
    pub payment_type: String,
    /// Originating reservation, when produced by an accepted offer
    pub reservation_id: Option<ReservationId>,
}

/// Optional fields supplied alongside a state change.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SaleStateFields {
    /// Purchase agreement date
    pub boleto_date: Option<DateTime<Utc>>,
    /// Deed execution date
    pub deed_date: Option<DateTime<Utc>>,
    /// Cancellation date
    pub cancelled_at: Option<DateTime<Utc>>,
    /// Cancellation reason
    pub cancellation_reason: Option<String>,
}

impl SaleStateFields {
    /// Fields for a cancellation
    #[must_use]
    pub fn cancellation(cancelled_at: DateTime<Utc>, reason: impl Into<String>) -> Self {
        Self {
            cancelled_at: Some(cancelled_at),
            cancellation_reason: Some(reason.into()),
            ..Self::default()
        }
    }

    /// Fields for a deed execution
    #[must_use]
    pub fn deed(deed_date: DateTime<Utc>) -> Self {
        Self {
            deed_date: Some(deed_date),
            ..Self::default()
        }
    }

    const fn is_empty(&self) -> bool {
        self.boleto_date.is_none()
            && self.deed_date.is_none()
            && self.cancelled_at.is_none()
            && self.cancellation_reason.is_none()
    }

    /// Whether applying these fields would change anything on `sale`
    fn changes(&self, sale: &Sale) -> bool {
        self.boleto_date.is_some_and(|d| sale.boleto_date != Some(d))
            || self.deed_date.is_some_and(|d| sale.deed_date != Some(d))
            || self.cancelled_at.is_some_and(|d| sale.cancelled_at != Some(d))
            || self
                .cancellation_reason
                .as_ref()
                .is_some_and(|r| sale.cancellation_reason.as_ref() != Some(r))
    }
}

/// Transition table and per-state rules for [`Sale`].
#[derive(Clone, Copy, Debug, Default)]
pub struct SaleStateMachine;

impl SaleStateMachine {
    /// States reachable from `from` by a real transition.
    #[must_use]
    pub const fn allowed_successors(from: SaleStatus) -> &'static [SaleStatus] {
        match from {
            SaleStatus::Iniciada => &[
                SaleStatus::ConBoleto,
                SaleStatus::Escriturado,
                SaleStatus::Cancelada,
            ],
            SaleStatus::ConBoleto => &[SaleStatus::Escriturado, SaleStatus::Cancelada],
            SaleStatus::Escriturado | SaleStatus::Cancelada => &[],
        }
    }

    /// Whether `from` admits no real transition
    #[must_use]
    pub const fn is_terminal(status: SaleStatus) -> bool {
        Self::allowed_successors(status).is_empty()
    }

    /// Check a transition against the table. Same-state is always allowed.
    ///
    /// # Errors
    ///
    /// Returns [`DomainError::Conflict`] with `invalid transition from X to Y`.
    pub fn check_transition(from: SaleStatus, to: SaleStatus) -> Result<()> {
        if from == to || Self::allowed_successors(from).contains(&to) {
            Ok(())
        } else {
            Err(DomainError::Conflict(format!(
                "invalid transition from {from} to {to}"
            )))
        }
    }

    /// Check the fields a state requires on entry, against the record as it
    /// would look after the change.
    ///
    /// # Errors
    ///
    /// Returns [`DomainError::Validation`] naming the missing field.
    pub fn validate_required_fields(target: SaleStatus, sale: &Sale) -> Result<()> {
        match target {
            SaleStatus::Escriturado if sale.deed_date.is_none() => Err(DomainError::Validation(
                "deed date is required to enter ESCRITURADO".to_string(),
            )),
            SaleStatus::Cancelada if sale.cancelled_at.is_none() => Err(DomainError::Validation(
                "cancellation date is required to enter CANCELADA".to_string(),
            )),
            SaleStatus::Cancelada
                if sale
                    .cancellation_reason
                    .as_deref()
                    .is_none_or(|r| r.trim().is_empty()) =>
            {
                Err(DomainError::Validation(
                    "cancellation reason is required to enter CANCELADA".to_string(),
                ))
            }
            _ => Ok(()),
        }
    }

    /// Cancellation fields belong to CANCELADA only, and a cancellation
    /// carries no deed.
    fn check_fields_fit(target: SaleStatus, fields: &SaleStateFields) -> Result<()> {
        let cancelling = target == SaleStatus::Cancelada;
        if !cancelling && (fields.cancelled_at.is_some() || fields.cancellation_reason.is_some()) {
            return Err(DomainError::Validation(format!(
                "cancellation fields are only accepted when entering CANCELADA, not {target}"
            )));
        }
        if cancelling && fields.deed_date.is_some() {
            return Err(DomainError::Validation(
                "a deed date cannot be recorded on a cancellation".to_string(),
            ));
        }
        Ok(())
    }

    /// Build a new INICIADA / PENDIENTE sale.
    ///
    /// # Errors
    ///
    /// Returns [`DomainError::Validation`] for a zero amount or blank payment type.
    pub fn open(new: NewSale, lot_status_at_creation: LotStatus, now: DateTime<Utc>) -> Result<Sale> {
        if new.amount.is_zero() {
            return Err(DomainError::Validation(
                "sale amount must be greater than zero".to_string(),
            ));
        }
        if new.payment_type.trim().is_empty() {
            return Err(DomainError::Validation(
                "payment type is required".to_string(),
            ));
        }

        Ok(Sale {
            id: SaleId::new(),
            lot_id: new.lot_id,
            status: SaleStatus::Iniciada,
            payment_status: PaymentStatus::Pendiente,
            amount: new.amount,
            sold_at: now,
            payment_type: new.payment_type,
            buyer_id: new.buyer_id,
            boleto_date: None,
            deed_date: None,
            cancelled_at: None,
            cancellation_reason: None,
            reservation_id: new.reservation_id,
            lot_status_at_creation,
            flag: OperationalFlag::Operativo,
        })
    }

    /// Move `sale` to `target`, merging `fields`.
    ///
    /// On error the sale is left untouched.
    ///
    /// # Errors
    ///
    /// - [`DomainError::Conflict`]: transition not in the table, or field
    ///   changes requested on a terminal sale
    /// - [`DomainError::Validation`]: required fields for `target` missing,
    ///   cancellation fields outside CANCELADA, or a deed on a cancellation
    pub fn advance(
        sale: &mut Sale,
        target: SaleStatus,
        fields: SaleStateFields,
    ) -> Result<Transition<SaleStatus>> {
        let from = sale.status;
        Self::check_transition(from, target)?;

        if from == target && Self::is_terminal(from) {
            if fields.changes(sale) {
                return Err(DomainError::Conflict(format!(
                    "sale {} is {from} and can no longer change",
                    sale.id
                )));
            }
            return Ok(Transition::new(from, target));
        }
        Self::check_fields_fit(target, &fields)?;
        if from == target && fields.is_empty() {
            return Ok(Transition::new(from, target));
        }

        let mut next = sale.clone();
        if let Some(date) = fields.boleto_date {
            next.boleto_date = Some(date);
        }
        if let Some(date) = fields.deed_date {
            next.deed_date = Some(date);
        }
        if let Some(date) = fields.cancelled_at {
            next.cancelled_at = Some(date);
        }
        if let Some(reason) = fields.cancellation_reason {
            next.cancellation_reason = Some(reason);
        }
        next.status = target;

        if from != target {
            Self::validate_required_fields(target, &next)?;
        }

        *sale = next;
        tracing::info!(sale_id = %sale.id, from = %from, to = %target, "Sale state changed");
        Ok(Transition::new(from, target))
    }

    /// Record an external payment progress signal.
    ///
    /// # Errors
    ///
    /// Returns [`DomainError::Conflict`] on a cancelled sale or when the
    /// signal would move progress backwards.
    pub fn record_payment(
        sale: &mut Sale,
        progress: PaymentStatus,
    ) -> Result<Transition<PaymentStatus>> {
        if sale.status == SaleStatus::Cancelada {
            return Err(DomainError::Conflict(format!(
                "sale {} is CANCELADA; payment progress is frozen",
                sale.id
            )));
        }
        let from = sale.payment_status;
        if !from.allows(progress) {
            return Err(DomainError::Conflict(format!(
                "payment progress cannot move from {from} to {progress}"
            )));
        }
        sale.payment_status = progress;
        Ok(Transition::new(from, progress))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)] // Test code can use unwrap
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn new_sale() -> Sale {
        SaleStateMachine::open(
            NewSale {
                lot_id: LotId::new(),
                buyer_id: PersonId::new(),
                amount: Money::from_units(17_500),
                payment_type: "CONTADO".to_string(),
                reservation_id: None,
            },
            LotStatus::Disponible,
            Utc::now(),
        )
        .unwrap()
    }

    fn sale_in(status: SaleStatus, payment: PaymentStatus) -> Sale {
        let mut sale = new_sale();
        sale.status = status;
        sale.payment_status = payment;
        sale
    }

    fn any_sale_status() -> impl Strategy<Value = SaleStatus> {
        prop::sample::select(SaleStatus::ALL.to_vec())
    }

    #[test]
    fn table_matches_contract() {
        use SaleStatus::{Cancelada, ConBoleto, Escriturado, Iniciada};
        assert_eq!(
            SaleStateMachine::allowed_successors(Iniciada),
            &[ConBoleto, Escriturado, Cancelada]
        );
        assert_eq!(
            SaleStateMachine::allowed_successors(ConBoleto),
            &[Escriturado, Cancelada]
        );
        assert!(SaleStateMachine::is_terminal(Escriturado));
        assert!(SaleStateMachine::is_terminal(Cancelada));
    }

    #[test]
    fn invalid_transition_message() {
        let err = SaleStateMachine::check_transition(SaleStatus::ConBoleto, SaleStatus::Iniciada)
            .unwrap_err();
        assert_eq!(
            err,
            DomainError::Conflict("invalid transition from CON_BOLETO to INICIADA".to_string())
        );
    }

    #[test]
    fn escriturado_requires_deed_date() {
        let mut sale = new_sale();
        let err = SaleStateMachine::advance(
            &mut sale,
            SaleStatus::Escriturado,
            SaleStateFields::default(),
        )
        .unwrap_err();
        assert!(matches!(err, DomainError::Validation(_)));
        assert_eq!(sale.status, SaleStatus::Iniciada);

        let transition = SaleStateMachine::advance(
            &mut sale,
            SaleStatus::Escriturado,
            SaleStateFields::deed(Utc::now()),
        )
        .unwrap();
        assert_eq!(transition.to, SaleStatus::Escriturado);
    }

    #[test]
    fn cancelada_requires_date_and_reason() {
        let mut sale = new_sale();
        let missing_reason = SaleStateFields {
            cancelled_at: Some(Utc::now()),
            ..SaleStateFields::default()
        };
        assert!(matches!(
            SaleStateMachine::advance(&mut sale, SaleStatus::Cancelada, missing_reason),
            Err(DomainError::Validation(_))
        ));
        assert!(matches!(
            SaleStateMachine::advance(
                &mut sale,
                SaleStatus::Cancelada,
                SaleStateFields::cancellation(Utc::now(), "   ")
            ),
            Err(DomainError::Validation(_))
        ));
        assert!(matches!(
            SaleStateMachine::advance(
                &mut sale,
                SaleStatus::Cancelada,
                SaleStateFields {
                    cancellation_reason: Some("buyer withdrew".into()),
                    ..SaleStateFields::default()
                }
            ),
            Err(DomainError::Validation(_))
        ));
        assert!(SaleStateMachine::advance(
            &mut sale,
            SaleStatus::Cancelada,
            SaleStateFields::cancellation(Utc::now(), "buyer withdrew")
        )
        .is_ok());
    }

    #[test]
    fn terminal_self_transition_is_noop_but_refuses_edits() {
        let mut sale = new_sale();
        let deed = Utc::now();
        SaleStateMachine::advance(&mut sale, SaleStatus::Escriturado, SaleStateFields::deed(deed))
            .unwrap();

        let noop = SaleStateMachine::advance(
            &mut sale,
            SaleStatus::Escriturado,
            SaleStateFields::default(),
        )
        .unwrap();
        assert!(noop.is_noop());

        let same_values = SaleStateMachine::advance(
            &mut sale,
            SaleStatus::Escriturado,
            SaleStateFields::deed(deed),
        );
        assert!(same_values.is_ok());

        let edit = SaleStateMachine::advance(
            &mut sale,
            SaleStatus::Escriturado,
            SaleStateFields::deed(deed + chrono::Duration::days(1)),
        );
        assert!(matches!(edit, Err(DomainError::Conflict(_))));
        assert_eq!(sale.deed_date, Some(deed));
    }

    #[test]
    fn cancellation_fields_only_enter_with_cancelada() {
        let mut sale = new_sale();
        let cancellation = SaleStateFields::cancellation(Utc::now(), "x");

        for target in [SaleStatus::Iniciada, SaleStatus::ConBoleto] {
            let err =
                SaleStateMachine::advance(&mut sale, target, cancellation.clone()).unwrap_err();
            assert!(matches!(err, DomainError::Validation(_)));
        }
        let with_deed = SaleStateFields {
            deed_date: Some(Utc::now()),
            ..cancellation.clone()
        };
        assert!(matches!(
            SaleStateMachine::advance(&mut sale, SaleStatus::Escriturado, with_deed.clone()),
            Err(DomainError::Validation(_))
        ));
        assert!(matches!(
            SaleStateMachine::advance(&mut sale, SaleStatus::Cancelada, with_deed),
            Err(DomainError::Validation(_))
        ));

        assert_eq!(sale.status, SaleStatus::Iniciada);
        assert_eq!(sale.cancelled_at, None);
        assert_eq!(sale.cancellation_reason, None);
        assert_eq!(sale.deed_date, None);
    }

    #[test]
    fn payment_progress_is_forward_only() {
        let mut sale = new_sale();
        SaleStateMachine::record_payment(&mut sale, PaymentStatus::EnCurso).unwrap();
        assert!(matches!(
            SaleStateMachine::record_payment(&mut sale, PaymentStatus::Pendiente),
            Err(DomainError::Conflict(_))
        ));

        let mut cancelled = sale_in(SaleStatus::Cancelada, PaymentStatus::EnCurso);
        assert!(SaleStateMachine::record_payment(&mut cancelled, PaymentStatus::PagoCompleto).is_err());
    }

    #[test]
    fn open_rejects_zero_amount() {
        let result = SaleStateMachine::open(
            NewSale {
                lot_id: LotId::new(),
                buyer_id: PersonId::new(),
                amount: Money::from_cents(0),
                payment_type: "CONTADO".into(),
                reservation_id: None,
            },
            LotStatus::Disponible,
            Utc::now(),
        );
        assert!(matches!(result, Err(DomainError::Validation(_))));
    }

    proptest! {
        #[test]
        fn transitions_outside_table_conflict(from in any_sale_status(), to in any_sale_status()) {
            let allowed = SaleStateMachine::allowed_successors(from).contains(&to);
            let result = SaleStateMachine::check_transition(from, to);
            if from == to || allowed {
                prop_assert!(result.is_ok());
            } else {
                prop_assert!(matches!(result, Err(DomainError::Conflict(_))));
            }
        }

        #[test]
        fn terminal_states_never_move(
            terminal in prop::sample::select(vec![SaleStatus::Escriturado, SaleStatus::Cancelada]),
            target in any_sale_status(),
        ) {
            let mut sale = sale_in(terminal, PaymentStatus::Pendiente);
            sale.deed_date = Some(Utc::now());
            sale.cancelled_at = Some(Utc::now());
            sale.cancellation_reason = Some("reason".into());
            let fields = SaleStateFields {
                deed_date: Some(Utc::now() + chrono::Duration::days(3)),
                ..SaleStateFields::default()
            };
            let result = SaleStateMachine::advance(&mut sale, target, fields);
            prop_assert!(matches!(result, Err(DomainError::Conflict(_))));
            prop_assert_eq!(sale.status, terminal);
        }
    }
}
