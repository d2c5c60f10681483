//! # Lotes Core
//!
//! Lot lifecycle and negotiation coordination engine.
//!
//! A lot moves through holds, reservations, negotiations and sales. This crate
//! decides which child record may act on a lot at any moment, runs each
//! child's own state machine, and rolls the lot back to a consistent prior
//! state when a child is cancelled or expires.
//!
//! ## Components, leaves first
//!
//! - [`sale::SaleStateMachine`]: sale transitions and per-state required fields
//! - [`negotiation::NegotiationEngine`]: turn-based counter-offers on a reservation
//! - [`reservation::ReservationLifecycle`]: reservation status, lazy expiry
//! - [`priority::PriorityLifecycle`]: time-boxed exclusive holds
//! - [`promotion::PromotionLifecycle`]: temporary price overrides
//! - [`coordinator::LotStateCoordinator`]: the only writer of a lot's status
//! - [`soft_delete::SoftDeleteGuard`]: operational flag gate
//! - [`service::LotService`]: one transactional method per business action,
//!   over any [`store::LotStore`]
//!
//! ## Architecture Principles
//!
//! - Lifecycles are pure functions over owned records; they never see the store
//! - Every "now" comes from an injected [`environment::Clock`]
//! - Every failure is a typed [`error::DomainError`]
//!
//! ## Example
//!
//! ```ignore
//! use lotes_core::prelude::*;
//!
//! let service = LotService::new(store, Arc::new(SystemClock));
//! let lot = Lot::new(LotId::new(), Money::from_units(18_000), 300.0);
//! service.register_lot(&lot).await?;
//!
//! let reservation = service
//!     .create_reservation(NewReservation {
//!         lot_id: lot.id,
//!         client_id,
//!         requested_by: Party::Inmobiliaria(realtor_id),
//!         deposit: Money::from_units(1_200),
//!         ends_at: now + Duration::days(30),
//!     })
//!     .await?;
//! ```

pub mod coordinator;
pub mod environment;
pub mod error;
pub mod negotiation;
pub mod priority;
pub mod promotion;
pub mod reservation;
pub mod retry;
pub mod sale;
pub mod service;
pub mod soft_delete;
pub mod store;
pub mod types;

// Re-export commonly used types
pub use chrono::{DateTime, Utc};

/// Everything a caller of [`service::LotService`] usually needs.
pub mod prelude {
    pub use crate::coordinator::{ControllerKind, LotStateCoordinator};
    pub use crate::environment::{Clock, SystemClock};
    pub use crate::error::{DomainError, Result};
    pub use crate::negotiation::CounterOffer;
    pub use crate::priority::NewHold;
    pub use crate::promotion::NewPromotion;
    pub use crate::reservation::NewReservation;
    pub use crate::retry::{RetryPolicy, retry_transient};
    pub use crate::sale::{NewSale, SaleStateFields};
    pub use crate::service::{LotService, LotView, ReservationView, SaleTerms, SweepReport};
    pub use crate::soft_delete::EntityRef;
    pub use crate::store::{ChildRef, LotStore, LotTransaction};
    pub use crate::types::*;
}
