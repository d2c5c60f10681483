//! Offer exchange on a reservation, through to the sale it produces.

#![allow(clippy::unwrap_used)] // Tests can unwrap

use chrono::Duration;
use lotes_core::error::DomainError;
use lotes_core::sale::SaleStateFields;
use lotes_core::soft_delete::EntityRef;
use lotes_core::types::{
    LotStatus, Money, OperationalFlag, OwnerType, Party, PaymentStatus, ReservationId,
    ReservationStatus, SaleStatus,
};
use lotes_testing::{TestHarness, fixtures};

#[tokio::test]
async fn realtor_cannot_answer_own_offer() {
    let harness = TestHarness::new();
    let lot = harness.lot(18_000).await;
    let realtor = fixtures::realtor();
    let reservation = harness
        .service
        .create_reservation(fixtures::reservation(lot.id, realtor, harness.now()))
        .await
        .unwrap();

    let (_, offer) = harness
        .service
        .counter_offer(reservation.id, realtor, fixtures::offer(1_000))
        .await
        .unwrap();
    assert_eq!(offer.owner_type, OwnerType::Inmobiliaria);
    assert_eq!(offer.sequence, 1);

    let accept = harness
        .service
        .accept_offer(reservation.id, realtor, fixtures::cash_terms())
        .await;
    let reject = harness.service.reject_offer(reservation.id, realtor).await;

    for result in [accept.map(|_| ()), reject.map(|_| ())] {
        match result {
            Err(DomainError::Conflict(message)) => assert!(message.contains("not your turn")),
            other => unreachable!("expected turn conflict, got {other:?}"),
        }
    }

    let view = harness.service.reservation(reservation.id).await.unwrap();
    assert_eq!(view.reservation.status, ReservationStatus::Contraoferta);
    assert_eq!(view.current_turn, Some(OwnerType::Cclf));
}

#[tokio::test]
async fn office_may_counter_accept_or_reject() {
    let harness = TestHarness::new();

    for answer in 0..3 {
        let lot = harness.lot(18_000).await;
        let realtor = fixtures::realtor();
        let reservation = harness
            .service
            .create_reservation(fixtures::reservation(lot.id, realtor, harness.now()))
            .await
            .unwrap();
        harness
            .service
            .counter_offer(reservation.id, realtor, fixtures::offer(1_000))
            .await
            .unwrap();

        match answer {
            0 => {
                let (after, offer) = harness
                    .service
                    .counter_offer(
                        reservation.id,
                        Party::Cclf,
                        fixtures::offer(1_100).with_rationale("closer to list price"),
                    )
                    .await
                    .unwrap();
                assert_eq!(after.status, ReservationStatus::Contraoferta);
                let history = harness.store.offers(reservation.id).await;
                assert_eq!(history.last(), Some(&offer));
                assert_eq!(offer.rationale.as_deref(), Some("closer to list price"));
            }
            1 => {
                let (after, sale) = harness
                    .service
                    .accept_offer(reservation.id, Party::Cclf, fixtures::cash_terms())
                    .await
                    .unwrap();
                assert_eq!(after.status, ReservationStatus::Aceptada);
                assert_eq!(sale.amount, Money::from_units(1_000));
            }
            _ => {
                let after = harness
                    .service
                    .reject_offer(reservation.id, Party::Cclf)
                    .await
                    .unwrap();
                assert_eq!(after.status, ReservationStatus::Cancelada);
                assert_eq!(
                    harness.store.lot(lot.id).await.unwrap().status(),
                    LotStatus::Disponible
                );
            }
        }
        harness.assert_lot_consistent(lot.id).await;
    }
}

/// Drive a fresh reservation, opened with one realtor offer, into `closed`.
async fn closed_reservation(
    harness: &TestHarness,
    closed: ReservationStatus,
) -> (ReservationId, Party) {
    let lot = harness.lot(18_000).await;
    let realtor = fixtures::realtor();
    let reservation = harness
        .service
        .create_reservation(fixtures::reservation(lot.id, realtor, harness.now()))
        .await
        .unwrap();
    harness
        .service
        .counter_offer(reservation.id, realtor, fixtures::offer(17_000))
        .await
        .unwrap();

    match closed {
        ReservationStatus::Cancelada => {
            harness
                .service
                .cancel_reservation(reservation.id)
                .await
                .unwrap();
        }
        ReservationStatus::Aceptada => {
            harness
                .service
                .accept_offer(reservation.id, Party::Cclf, fixtures::cash_terms())
                .await
                .unwrap();
        }
        ReservationStatus::Expirada => {
            harness.clock.advance(Duration::days(31));
        }
        ReservationStatus::Activa | ReservationStatus::Contraoferta => {
            unreachable!("{closed} is not closed")
        }
    }

    let view = harness.service.reservation(reservation.id).await.unwrap();
    assert_eq!(view.reservation.status, closed);
    harness.assert_lot_consistent(lot.id).await;
    (reservation.id, realtor)
}

#[tokio::test]
async fn closed_reservation_refuses_every_negotiation_step() {
    for closed in [
        ReservationStatus::Cancelada,
        ReservationStatus::Expirada,
        ReservationStatus::Aceptada,
    ] {
        let harness = TestHarness::new();
        let (reservation_id, realtor) = closed_reservation(&harness, closed).await;
        let history = harness.store.offers(reservation_id).await;
        assert_eq!(history.len(), 1);

        for party in [realtor, Party::Cclf] {
            assert!(
                matches!(
                    harness
                        .service
                        .counter_offer(reservation_id, party, fixtures::offer(16_500))
                        .await,
                    Err(DomainError::Conflict(_))
                ),
                "counter on {closed}"
            );
            assert!(
                matches!(
                    harness
                        .service
                        .accept_offer(reservation_id, party, fixtures::cash_terms())
                        .await,
                    Err(DomainError::Conflict(_))
                ),
                "accept on {closed}"
            );
            assert!(
                matches!(
                    harness.service.reject_offer(reservation_id, party).await,
                    Err(DomainError::Conflict(_))
                ),
                "reject on {closed}"
            );
        }

        assert_eq!(harness.store.offers(reservation_id).await, history);
        assert_eq!(
            harness.store.reservation(reservation_id).await.unwrap().status,
            closed
        );
    }
}

#[tokio::test]
async fn accepting_without_offers_is_a_conflict() {
    let harness = TestHarness::new();
    let lot = harness.lot(18_000).await;
    let reservation = harness
        .service
        .create_reservation(fixtures::reservation(
            lot.id,
            fixtures::realtor(),
            harness.now(),
        ))
        .await
        .unwrap();

    let result = harness
        .service
        .accept_offer(reservation.id, Party::Cclf, fixtures::cash_terms())
        .await;

    assert!(matches!(result, Err(DomainError::Conflict(_))));
}

#[tokio::test]
async fn foreign_realtor_cannot_negotiate() {
    let harness = TestHarness::new();
    let lot = harness.lot(18_000).await;
    let reservation = harness
        .service
        .create_reservation(fixtures::reservation(
            lot.id,
            fixtures::realtor(),
            harness.now(),
        ))
        .await
        .unwrap();

    let result = harness
        .service
        .counter_offer(reservation.id, fixtures::realtor(), fixtures::offer(17_000))
        .await;

    assert!(matches!(result, Err(DomainError::Conflict(_))));
    assert!(harness.store.offers(reservation.id).await.is_empty());
}

#[tokio::test]
async fn latest_offer_follows_server_time() {
    let harness = TestHarness::new();
    let lot = harness.lot(18_000).await;
    let realtor = fixtures::realtor();
    let reservation = harness
        .service
        .create_reservation(fixtures::reservation(lot.id, realtor, harness.now()))
        .await
        .unwrap();

    harness
        .service
        .counter_offer(reservation.id, realtor, fixtures::offer(16_000))
        .await
        .unwrap();
    harness.clock.advance(Duration::hours(1));
    harness
        .service
        .counter_offer(reservation.id, Party::Cclf, fixtures::offer(17_800))
        .await
        .unwrap();
    // A skewed client cannot reorder history: offers carry server time only
    harness.clock.advance(Duration::hours(1));
    harness
        .service
        .counter_offer(reservation.id, realtor, fixtures::offer(17_200))
        .await
        .unwrap();

    let view = harness.service.reservation(reservation.id).await.unwrap();
    let sequences: Vec<u32> = view.offers.iter().map(|offer| offer.sequence).collect();
    assert_eq!(sequences, vec![1, 2, 3]);
    assert_eq!(view.current_turn, Some(OwnerType::Cclf));

    let (_, sale) = harness
        .service
        .accept_offer(reservation.id, Party::Cclf, fixtures::cash_terms())
        .await
        .unwrap();
    assert_eq!(sale.amount, Money::from_units(17_200));
}

#[tokio::test]
async fn offer_deadline_must_follow_reservation_date() {
    let harness = TestHarness::new();
    let lot = harness.lot(18_000).await;
    let realtor = fixtures::realtor();
    let reservation = harness
        .service
        .create_reservation(fixtures::reservation(lot.id, realtor, harness.now()))
        .await
        .unwrap();

    let result = harness
        .service
        .counter_offer(
            reservation.id,
            realtor,
            fixtures::offer(17_000).valid_until(reservation.reserved_at),
        )
        .await;

    assert!(matches!(result, Err(DomainError::Validation(_))));
}

#[tokio::test]
async fn lapsed_offer_returns_reservation_to_activa() {
    let harness = TestHarness::new();
    let lot = harness.lot(18_000).await;
    let realtor = fixtures::realtor();
    let reservation = harness
        .service
        .create_reservation(fixtures::reservation(lot.id, realtor, harness.now()))
        .await
        .unwrap();

    harness
        .service
        .counter_offer(
            reservation.id,
            realtor,
            fixtures::offer(17_000).valid_until(harness.now() + Duration::days(2)),
        )
        .await
        .unwrap();

    harness.clock.advance(Duration::days(3));
    let view = harness.service.reservation(reservation.id).await.unwrap();
    assert_eq!(view.reservation.status, ReservationStatus::Activa);
    assert_eq!(
        harness.store.lot(lot.id).await.unwrap().status(),
        LotStatus::Reservado
    );

    let result = harness
        .service
        .accept_offer(reservation.id, Party::Cclf, fixtures::cash_terms())
        .await;
    assert!(matches!(result, Err(DomainError::Conflict(_))));
}

#[tokio::test]
async fn negotiated_sale_runs_to_deed_and_soft_delete() {
    let harness = TestHarness::new();
    let lot = harness.lot(18_000).await;
    let realtor = fixtures::realtor();

    let reservation = harness
        .service
        .create_reservation(fixtures::reservation(lot.id, realtor, harness.now()))
        .await
        .unwrap();
    assert_eq!(reservation.deposit, Money::from_units(1_200));
    assert_eq!(reservation.lot_status_at_creation, LotStatus::Disponible);
    assert_eq!(
        harness.store.lot(lot.id).await.unwrap().status(),
        LotStatus::Reservado
    );

    let (countered, _) = harness
        .service
        .counter_offer(reservation.id, Party::Cclf, fixtures::offer(17_500))
        .await
        .unwrap();
    assert_eq!(countered.status, ReservationStatus::Contraoferta);

    let (accepted, sale) = harness
        .service
        .accept_offer(reservation.id, realtor, fixtures::cash_terms())
        .await
        .unwrap();
    assert_eq!(accepted.status, ReservationStatus::Aceptada);
    assert_eq!(accepted.sale_id, Some(sale.id));
    assert_eq!(sale.status, SaleStatus::Iniciada);
    assert_eq!(sale.amount, Money::from_units(17_500));
    assert_eq!(sale.buyer_id, reservation.client_id);
    assert_eq!(sale.reservation_id, Some(reservation.id));
    assert_eq!(
        harness.store.lot(lot.id).await.unwrap().status(),
        LotStatus::Vendido
    );

    // Not finalized yet
    assert!(matches!(
        harness.service.soft_delete(EntityRef::Sale(sale.id)).await,
        Err(DomainError::Conflict(_))
    ));

    harness.clock.advance(Duration::days(20));
    harness
        .service
        .advance_sale_state(
            sale.id,
            SaleStatus::ConBoleto,
            SaleStateFields {
                boleto_date: Some(harness.now()),
                ..SaleStateFields::default()
            },
        )
        .await
        .unwrap();

    let missing_deed = harness
        .service
        .advance_sale_state(sale.id, SaleStatus::Escriturado, SaleStateFields::default())
        .await;
    assert!(matches!(missing_deed, Err(DomainError::Validation(_))));

    harness.clock.advance(Duration::days(40));
    let deeded = harness
        .service
        .advance_sale_state(
            sale.id,
            SaleStatus::Escriturado,
            SaleStateFields::deed(harness.now()),
        )
        .await
        .unwrap();
    assert_eq!(deeded.status, SaleStatus::Escriturado);
    assert_eq!(
        harness.store.lot(lot.id).await.unwrap().status(),
        LotStatus::Vendido
    );
    assert!(matches!(
        harness.service.soft_delete(EntityRef::Sale(sale.id)).await,
        Err(DomainError::Conflict(_))
    ));

    harness
        .service
        .record_payment_progress(sale.id, PaymentStatus::EnCurso)
        .await
        .unwrap();
    harness
        .service
        .record_payment_progress(sale.id, PaymentStatus::PagoCompleto)
        .await
        .unwrap();
    assert!(matches!(
        harness
            .service
            .record_payment_progress(sale.id, PaymentStatus::Pendiente)
            .await,
        Err(DomainError::Conflict(_))
    ));

    let flag = harness
        .service
        .soft_delete(EntityRef::Sale(sale.id))
        .await
        .unwrap();
    assert_eq!(flag.to, OperationalFlag::Eliminado);
    let stored = harness.service.sale(sale.id).await.unwrap();
    assert_eq!(stored.flag, OperationalFlag::Eliminado);
    assert_eq!(stored.status, SaleStatus::Escriturado);
    assert_eq!(
        harness.store.lot(lot.id).await.unwrap().status(),
        LotStatus::Vendido
    );

    let cancel = harness
        .service
        .cancel_sale(sale.id, harness.now(), "late regret".to_string())
        .await;
    match cancel {
        Err(DomainError::Conflict(message)) => {
            assert_eq!(message, "invalid transition from ESCRITURADO to CANCELADA");
        }
        other => unreachable!("expected conflict, got {other:?}"),
    }
}

#[tokio::test]
async fn cancelling_accepted_sale_rolls_lot_back() {
    let harness = TestHarness::new();
    let lot = harness.lot(18_000).await;
    let realtor = fixtures::realtor();
    let reservation = harness
        .service
        .create_reservation(fixtures::reservation(lot.id, realtor, harness.now()))
        .await
        .unwrap();
    harness
        .service
        .counter_offer(reservation.id, realtor, fixtures::offer(17_000))
        .await
        .unwrap();
    let (_, sale) = harness
        .service
        .accept_offer(reservation.id, Party::Cclf, fixtures::cash_terms())
        .await
        .unwrap();

    let blank_reason = harness
        .service
        .cancel_sale(sale.id, harness.now(), "   ".to_string())
        .await;
    assert!(matches!(blank_reason, Err(DomainError::Validation(_))));

    let cancelled = harness
        .service
        .cancel_sale(sale.id, harness.now(), "financing fell through".to_string())
        .await
        .unwrap();
    assert_eq!(cancelled.status, SaleStatus::Cancelada);
    assert_eq!(
        harness.store.lot(lot.id).await.unwrap().status(),
        LotStatus::Disponible
    );

    // The reservation stays closed; its sale is history
    let view = harness.service.reservation(reservation.id).await.unwrap();
    assert_eq!(view.reservation.status, ReservationStatus::Aceptada);
}
