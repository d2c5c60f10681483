//! Random sale state sequences driven through the service.

#![allow(clippy::unwrap_used)] // Tests can unwrap

use lotes_core::sale::{SaleStateFields, SaleStateMachine};
use lotes_core::types::{LotStatus, SaleStatus};
use lotes_testing::{TestHarness, fixtures, properties};
use proptest::prelude::*;

fn fields_for(target: SaleStatus, harness: &TestHarness) -> SaleStateFields {
    match target {
        SaleStatus::Escriturado => SaleStateFields::deed(harness.now()),
        SaleStatus::Cancelada => SaleStateFields::cancellation(harness.now(), "buyer withdrew"),
        SaleStatus::Iniciada | SaleStatus::ConBoleto => SaleStateFields::default(),
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn lot_follows_the_sale(targets in prop::collection::vec(properties::sale_status(), 1..8)) {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();

        runtime.block_on(async {
            let harness = TestHarness::new();
            let lot = harness.lot(18_000).await;
            let sale = harness
                .service
                .register_sale(fixtures::direct_sale(lot.id, 18_000))
                .await
                .unwrap();
            let mut current = sale.status;

            for target in targets {
                let expected = SaleStateMachine::check_transition(current, target).is_ok();
                let result = harness
                    .service
                    .advance_sale_state(sale.id, target, fields_for(target, &harness))
                    .await;
                assert_eq!(result.is_ok(), expected, "{current} -> {target}");
                if expected {
                    current = target;
                }

                let stored = harness.service.sale(sale.id).await.unwrap();
                assert_eq!(stored.status, current);
                let lot_status = harness.store.lot(lot.id).await.unwrap().status();
                if current == SaleStatus::Cancelada {
                    assert_eq!(lot_status, LotStatus::Disponible);
                } else {
                    assert_eq!(lot_status, LotStatus::Vendido);
                }
            }
        });
    }

    #[test]
    fn terminal_sales_stay_put(target in properties::sale_status()) {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();

        runtime.block_on(async {
            let harness = TestHarness::new();
            let lot = harness.lot(18_000).await;
            let sale = harness
                .service
                .register_sale(fixtures::direct_sale(lot.id, 18_000))
                .await
                .unwrap();
            harness
                .service
                .cancel_sale(sale.id, harness.now(), "buyer withdrew".to_string())
                .await
                .unwrap();

            let result = harness
                .service
                .advance_sale_state(sale.id, target, fields_for(target, &harness))
                .await;
            assert_eq!(result.is_ok(), target == SaleStatus::Cancelada);
            assert_eq!(
                harness.service.sale(sale.id).await.unwrap().status,
                SaleStatus::Cancelada
            );
        });
    }
}
