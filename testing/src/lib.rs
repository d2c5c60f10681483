//! # Lotes Testing
//!
//! Testing utilities for the lot lifecycle engine.
//!
//! This crate provides:
//! - Deterministic clocks ([`FixedClock`], [`ManualClock`])
//! - [`InMemoryLotStore`], a transactional store that serializes every
//!   transaction behind one lock
//! - Fixture builders and a [`TestHarness`] wiring them to a `LotService`
//! - proptest strategies for the contract enums
//!
//! ## Example
//!
//! ```ignore
//! use lotes_testing::{TestHarness, fixtures};
//!
//! #[tokio::test]
//! async fn reservation_locks_the_lot() {
//!     let harness = TestHarness::new();
//!     let lot = harness.lot(18_000).await;
//!     let realtor = fixtures::realtor();
//!
//!     harness
//!         .service
//!         .create_reservation(fixtures::reservation(lot.id, realtor, harness.now()))
//!         .await
//!         .unwrap();
//! }
//! ```

use chrono::{DateTime, Duration, Utc};
use lotes_core::environment::Clock;
use lotes_core::coordinator::LotStateCoordinator;
use lotes_core::service::LotService;
use lotes_core::types::{Lot, LotId};
use std::sync::Arc;

mod in_memory;

pub use in_memory::{InMemoryLotStore, InMemoryTransaction};

/// Mock implementations of Environment traits
pub mod mocks {
    use super::{Clock, DateTime, Duration, Utc};
    use std::sync::{Mutex, PoisonError};

    /// Fixed clock for deterministic tests
    ///
    /// Always returns the same time, making tests reproducible.
    ///
    /// # Example
    ///
    /// ```
    /// use lotes_testing::mocks::FixedClock;
    /// use lotes_core::environment::Clock;
    /// use chrono::Utc;
    ///
    /// let clock = FixedClock::new(Utc::now());
    /// assert_eq!(clock.now(), clock.now());
    /// ```
    #[derive(Debug, Clone)]
    pub struct FixedClock {
        time: DateTime<Utc>,
    }

    impl FixedClock {
        /// Create a new fixed clock with the given time
        #[must_use]
        pub const fn new(time: DateTime<Utc>) -> Self {
            Self { time }
        }
    }

    impl Clock for FixedClock {
        fn now(&self) -> DateTime<Utc> {
            self.time
        }
    }

    /// Clock that only moves when told to.
    ///
    /// Used to walk a scenario past hold, reservation and offer deadlines.
    ///
    /// ```
    /// use lotes_testing::mocks::ManualClock;
    /// use lotes_core::environment::Clock;
    /// use chrono::Duration;
    ///
    /// let clock = ManualClock::default();
    /// let start = clock.now();
    /// clock.advance(Duration::days(2));
    /// assert_eq!(clock.now() - start, Duration::days(2));
    /// ```
    #[derive(Debug)]
    pub struct ManualClock {
        time: Mutex<DateTime<Utc>>,
    }

    impl ManualClock {
        /// Start at `time`
        #[must_use]
        pub const fn new(time: DateTime<Utc>) -> Self {
            Self {
                time: Mutex::new(time),
            }
        }

        /// Move forward by `by`
        pub fn advance(&self, by: Duration) {
            let mut time = self.time.lock().unwrap_or_else(PoisonError::into_inner);
            *time += by;
        }

        /// Jump to `time`
        pub fn set(&self, time: DateTime<Utc>) {
            *self.time.lock().unwrap_or_else(PoisonError::into_inner) = time;
        }
    }

    impl Default for ManualClock {
        fn default() -> Self {
            Self::new(super::epoch())
        }
    }

    impl Clock for ManualClock {
        fn now(&self) -> DateTime<Utc> {
            *self.time.lock().unwrap_or_else(PoisonError::into_inner)
        }
    }

    /// Create a default fixed clock for tests (2025-01-01 00:00:00 UTC)
    #[must_use]
    pub fn test_clock() -> FixedClock {
        FixedClock::new(super::epoch())
    }
}

/// Fixture builders for the engine's inputs.
pub mod fixtures {
    use chrono::{DateTime, Duration, Utc};
    use lotes_core::negotiation::CounterOffer;
    use lotes_core::promotion::NewPromotion;
    use lotes_core::reservation::NewReservation;
    use lotes_core::sale::NewSale;
    use lotes_core::service::SaleTerms;
    use lotes_core::types::{Lot, LotId, Money, Party, PersonId, RealtorId};

    /// A DISPONIBLE lot priced in whole units
    #[must_use]
    pub fn lot(price_units: u64) -> Lot {
        Lot::new(LotId::new(), Money::from_units(price_units), 300.0)
    }

    /// A fresh realtor agency
    #[must_use]
    pub fn realtor() -> Party {
        Party::Inmobiliaria(RealtorId::new())
    }

    /// A 30-day reservation with a 1200 deposit
    #[must_use]
    pub fn reservation(lot_id: LotId, requested_by: Party, now: DateTime<Utc>) -> NewReservation {
        NewReservation {
            lot_id,
            client_id: PersonId::new(),
            requested_by,
            deposit: Money::from_units(1_200),
            ends_at: now + Duration::days(30),
        }
    }

    /// A direct cash sale
    #[must_use]
    pub fn direct_sale(lot_id: LotId, amount_units: u64) -> NewSale {
        NewSale {
            lot_id,
            buyer_id: PersonId::new(),
            amount: Money::from_units(amount_units),
            payment_type: "CONTADO".to_string(),
            reservation_id: None,
        }
    }

    /// An open-ended promotion
    #[must_use]
    pub fn promotion(price_units: u64) -> NewPromotion {
        NewPromotion {
            promotional_price: Money::from_units(price_units),
            ends_at: None,
            explanation: None,
        }
    }

    /// A counter-offer without deadline
    #[must_use]
    pub const fn offer(amount_units: u64) -> CounterOffer {
        CounterOffer::new(Money::from_units(amount_units))
    }

    /// Cash terms for accepting an offer
    #[must_use]
    pub fn cash_terms() -> SaleTerms {
        SaleTerms {
            payment_type: "CONTADO".to_string(),
        }
    }
}

/// proptest strategies for the contract enums.
pub mod properties {
    use lotes_core::types::SaleStatus;
    use proptest::prelude::*;

    /// Any sale status
    pub fn sale_status() -> impl Strategy<Value = SaleStatus> {
        prop::sample::select(SaleStatus::ALL.to_vec())
    }
}

/// A `LotService` over an [`InMemoryLotStore`] and a [`ManualClock`].
pub struct TestHarness {
    /// Service under test
    pub service: LotService<InMemoryLotStore>,
    /// The store behind it, for fault injection and inspection
    pub store: InMemoryLotStore,
    /// The clock behind it
    pub clock: Arc<ManualClock>,
}

impl TestHarness {
    /// Fresh store, clock at 2025-01-01 00:00:00 UTC
    #[must_use]
    pub fn new() -> Self {
        let store = InMemoryLotStore::new();
        let clock = Arc::new(ManualClock::default());
        let service = LotService::new(store.clone(), clock.clone());
        Self {
            service,
            store,
            clock,
        }
    }

    /// Current harness time
    #[must_use]
    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    /// Register a DISPONIBLE lot priced in whole units.
    ///
    /// # Panics
    ///
    /// Panics if the store refuses the lot, which a fresh id never triggers.
    #[allow(clippy::expect_used)]
    pub async fn lot(&self, price_units: u64) -> Lot {
        let lot = fixtures::lot(price_units);
        self.service
            .register_lot(&lot)
            .await
            .expect("fresh lot id should register");
        lot
    }

    /// Assert that the committed lot shows what its committed controllers
    /// dictate: the highest-ranked active one, or DISPONIBLE/NO_DISPONIBLE
    /// when none is active.
    ///
    /// # Panics
    ///
    /// Panics if the lot is unknown or its status disagrees.
    #[allow(clippy::expect_used)]
    pub async fn assert_lot_consistent(&self, lot_id: LotId) {
        let lot = self.store.lot(lot_id).await.expect("lot should exist");
        let controllers = self.store.controllers(lot_id).await;
        let expected = LotStateCoordinator::derived_status(&controllers, lot.status());
        assert_eq!(
            lot.status(),
            expected,
            "lot {lot_id} shows {} but its controllers dictate {expected}",
            lot.status()
        );
    }
}

impl Default for TestHarness {
    fn default() -> Self {
        Self::new()
    }
}

fn epoch() -> DateTime<Utc> {
    DateTime::<Utc>::UNIX_EPOCH + Duration::days(20_089)
}

// Re-export commonly used items
pub use mocks::{FixedClock, ManualClock, test_clock};
