//! Domain types for the lot lifecycle engine.
//!
//! Every status field is a closed enum whose serialized form is the exact
//! contract name (`DISPONIBLE`, `CON_BOLETO`, `CCLF`, ...). Store
//! implementations persist the same names through [`LotStatus::as_str`] and
//! friends, and read them back with the matching `parse`.

use crate::error::DomainError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

// ============================================================================
// Identifiers
// ============================================================================

macro_rules! entity_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        pub struct $name(Uuid);

        impl $name {
            #[doc = concat!("Creates a new random `", stringify!($name), "`")]
            #[must_use]
            pub fn new() -> Self {
                Self(Uuid::new_v4())
            }

            #[doc = concat!("Creates a `", stringify!($name), "` from a UUID")]
            #[must_use]
            pub const fn from_uuid(id: Uuid) -> Self {
                Self(id)
            }

            /// Returns the inner UUID
            #[must_use]
            pub const fn as_uuid(&self) -> &Uuid {
                &self.0
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

entity_id!(
    /// Unique identifier for a lot
    LotId
);
entity_id!(
    /// Unique identifier for a priority hold
    HoldId
);
entity_id!(
    /// Unique identifier for a reservation
    ReservationId
);
entity_id!(
    /// Unique identifier for an offer inside a reservation's negotiation
    OfferId
);
entity_id!(
    /// Unique identifier for a sale
    SaleId
);
entity_id!(
    /// Unique identifier for a promotion
    PromotionId
);
entity_id!(
    /// Reference to a realtor agency (managed outside this crate)
    RealtorId
);
entity_id!(
    /// Reference to a person: client, buyer or lot owner (managed outside this crate)
    PersonId
);
entity_id!(
    /// Reference to a location record (managed outside this crate)
    LocationId
);

// ============================================================================
// Money
// ============================================================================

/// Money amount in cents (avoids floating point issues)
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Money(u64);

impl Money {
    /// Creates a new `Money` amount from cents
    #[must_use]
    pub const fn from_cents(cents: u64) -> Self {
        Self(cents)
    }

    /// Creates a `Money` amount from whole currency units.
    ///
    /// Amounts beyond `u64::MAX` cents saturate at that ceiling.
    #[must_use]
    pub const fn from_units(units: u64) -> Self {
        Self(units.saturating_mul(100))
    }

    /// Returns the amount in cents
    #[must_use]
    pub const fn cents(&self) -> u64 {
        self.0
    }

    /// Checks if this amount is zero
    #[must_use]
    pub const fn is_zero(&self) -> bool {
        self.0 == 0
    }
}

impl fmt::Display for Money {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "${}.{:02}", self.0 / 100, self.0 % 100)
    }
}

// ============================================================================
// Contract enums
// ============================================================================

macro_rules! contract_enum {
    (
        $(#[$meta:meta])*
        $name:ident {
            $( $(#[$vmeta:meta])* $variant:ident => $text:literal ),+ $(,)?
        }
    ) => {
        $(#[$meta])*
        #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
        pub enum $name {
            $( $(#[$vmeta])* #[serde(rename = $text)] $variant ),+
        }

        impl $name {
            /// Every variant, in declaration order
            pub const ALL: &'static [Self] = &[$(Self::$variant),+];

            /// Contract name as persisted and exchanged with callers.
            #[must_use]
            pub const fn as_str(self) -> &'static str {
                match self {
                    $( Self::$variant => $text ),+
                }
            }

            /// Parse a contract name.
            ///
            /// # Errors
            ///
            /// Returns [`DomainError::Storage`] if the string is not a known name.
            pub fn parse(s: &str) -> Result<Self, DomainError> {
                match s {
                    $( $text => Ok(Self::$variant), )+
                    _ => Err(DomainError::Storage(format!(
                        "invalid {} value: {s}",
                        stringify!($name)
                    ))),
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }
    };
}

contract_enum!(
    /// Commercial state of a lot. Written only by the `LotStateCoordinator`.
    LotStatus {
        /// Free for any controller
        Disponible => "DISPONIBLE",
        /// Controlled by a live reservation
        Reservado => "RESERVADO",
        /// Controlled by a non-cancelled sale
        Vendido => "VENDIDO",
        /// Withdrawn from the market
        NoDisponible => "NO_DISPONIBLE",
        /// Price override active
        EnPromocion => "EN_PROMOCION",
        /// Exclusive hold active
        ConPrioridad => "CON_PRIORIDAD",
    }
);

contract_enum!(
    /// Construction sub-status, orthogonal to [`LotStatus`]
    LotSubstatus {
        /// Bare land
        NoConstruido => "NO_CONSTRUIDO",
        /// Works in progress
        EnConstruccion => "EN_CONSTRUCCION",
        /// Built
        Construido => "CONSTRUIDO",
    }
);

contract_enum!(
    /// Reservation state machine
    ReservationStatus {
        /// Placed, no negotiation in progress
        Activa => "ACTIVA",
        /// Accepted; a sale was produced (terminal)
        Aceptada => "ACEPTADA",
        /// Negotiation in progress
        Contraoferta => "CONTRAOFERTA",
        /// Cancelled or rejected (terminal)
        Cancelada => "CANCELADA",
        /// Term elapsed (terminal)
        Expirada => "EXPIRADA",
    }
);

contract_enum!(
    /// Sale state machine
    SaleStatus {
        /// Registered
        Iniciada => "INICIADA",
        /// Purchase agreement signed
        ConBoleto => "CON_BOLETO",
        /// Deed executed (terminal)
        Escriturado => "ESCRITURADO",
        /// Cancelled (terminal)
        Cancelada => "CANCELADA",
    }
);

contract_enum!(
    /// Payment progress of a sale (`estadoCobro`)
    PaymentStatus {
        /// Nothing collected
        Pendiente => "PENDIENTE",
        /// Partially collected
        EnCurso => "EN_CURSO",
        /// Fully collected
        PagoCompleto => "PAGO_COMPLETO",
    }
);

contract_enum!(
    /// Priority hold state machine
    HoldStatus {
        /// Hold in force
        Activa => "ACTIVA",
        /// End timestamp elapsed (terminal)
        Expirada => "EXPIRADA",
        /// Released by the holder (terminal)
        Cancelada => "CANCELADA",
        /// Exercised by the holder (terminal)
        Finalizada => "FINALIZADA",
    }
);

contract_enum!(
    /// Which side of the business acted
    OwnerType {
        /// External realtor agency
        Inmobiliaria => "INMOBILIARIA",
        /// Central managing office
        Cclf => "CCLF",
    }
);

contract_enum!(
    /// Soft-delete marker, orthogonal to business state
    OperationalFlag {
        /// Visible
        Operativo => "OPERATIVO",
        /// Soft-deleted
        Eliminado => "ELIMINADO",
    }
);

impl PaymentStatus {
    const fn rank(self) -> u8 {
        match self {
            Self::Pendiente => 0,
            Self::EnCurso => 1,
            Self::PagoCompleto => 2,
        }
    }

    /// Whether moving from `self` to `next` goes forward (or stays put).
    #[must_use]
    pub const fn allows(self, next: Self) -> bool {
        next.rank() >= self.rank()
    }
}

/// The actor on whose behalf an operation runs.
///
/// Carrying the realtor id inside the `Inmobiliaria` variant makes
/// "realtor hold without realtor" unrepresentable.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Party {
    /// A realtor agency
    Inmobiliaria(RealtorId),
    /// The central office
    Cclf,
}

impl Party {
    /// The owner type this party acts as
    #[must_use]
    pub const fn owner_type(&self) -> OwnerType {
        match self {
            Self::Inmobiliaria(_) => OwnerType::Inmobiliaria,
            Self::Cclf => OwnerType::Cclf,
        }
    }

    /// The realtor id, if any
    #[must_use]
    pub const fn realtor(&self) -> Option<RealtorId> {
        match self {
            Self::Inmobiliaria(id) => Some(*id),
            Self::Cclf => None,
        }
    }

    /// Rebuild a party from its persisted columns.
    ///
    /// # Errors
    ///
    /// Returns [`DomainError::Storage`] when the columns disagree
    /// (`INMOBILIARIA` without realtor or `CCLF` with one).
    pub fn from_parts(owner_type: OwnerType, realtor: Option<RealtorId>) -> Result<Self, DomainError> {
        match (owner_type, realtor) {
            (OwnerType::Inmobiliaria, Some(id)) => Ok(Self::Inmobiliaria(id)),
            (OwnerType::Cclf, None) => Ok(Self::Cclf),
            (OwnerType::Inmobiliaria, None) => Err(DomainError::Storage(
                "INMOBILIARIA owner without realtor reference".to_string(),
            )),
            (OwnerType::Cclf, Some(_)) => Err(DomainError::Storage(
                "CCLF owner with a realtor reference".to_string(),
            )),
        }
    }
}

impl fmt::Display for Party {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Inmobiliaria(id) => write!(f, "INMOBILIARIA({id})"),
            Self::Cclf => f.write_str("CCLF"),
        }
    }
}

// ============================================================================
// Entities
// ============================================================================

/// A sellable land parcel.
///
/// `status` and `price` are private: the status is written only by
/// [`crate::coordinator::LotStateCoordinator`], the price only by the
/// promotion lifecycle.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Lot {
    /// Lot identifier
    pub id: LotId,
    status: LotStatus,
    /// Construction sub-status
    pub substatus: LotSubstatus,
    price: Money,
    /// Surface in square meters
    pub surface_m2: f64,
    /// Owner reference
    pub owner_id: Option<PersonId>,
    /// Location reference
    pub location_id: Option<LocationId>,
}

impl Lot {
    /// Creates a new, available, unbuilt lot
    #[must_use]
    pub fn new(id: LotId, price: Money, surface_m2: f64) -> Self {
        Self {
            id,
            status: LotStatus::Disponible,
            substatus: LotSubstatus::NoConstruido,
            price,
            surface_m2,
            owner_id: None,
            location_id: None,
        }
    }

    /// Rebuild a lot from persisted state. Meant for store implementations.
    #[must_use]
    pub const fn rehydrate(
        id: LotId,
        status: LotStatus,
        substatus: LotSubstatus,
        price: Money,
        surface_m2: f64,
        owner_id: Option<PersonId>,
        location_id: Option<LocationId>,
    ) -> Self {
        Self {
            id,
            status,
            substatus,
            price,
            surface_m2,
            owner_id,
            location_id,
        }
    }

    /// Current commercial state
    #[must_use]
    pub const fn status(&self) -> LotStatus {
        self.status
    }

    /// Current list price (the promotional price while a promotion is active)
    #[must_use]
    pub const fn price(&self) -> Money {
        self.price
    }

    pub(crate) const fn set_status(&mut self, status: LotStatus) {
        self.status = status;
    }

    pub(crate) const fn set_price(&mut self, price: Money) {
        self.price = price;
    }
}

/// Time-boxed exclusive option to reserve a lot.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PriorityHold {
    /// Hold identifier
    pub id: HoldId,
    /// Lot under hold
    pub lot_id: LotId,
    /// Current state
    pub status: HoldStatus,
    /// Holder
    pub owner: Party,
    /// When the hold started
    pub starts_at: DateTime<Utc>,
    /// When the hold lapses
    pub ends_at: DateTime<Utc>,
    /// Lot state right before the hold was placed
    pub lot_status_at_creation: LotStatus,
    /// Soft-delete marker
    pub flag: OperationalFlag,
}

impl PriorityHold {
    /// Whether this hold currently controls its lot
    #[must_use]
    pub const fn is_controlling(&self) -> bool {
        matches!(self.status, HoldStatus::Activa)
    }
}

/// A client's in-progress claim on a lot.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reservation {
    /// Reservation identifier
    pub id: ReservationId,
    /// Reserved lot
    pub lot_id: LotId,
    /// Current state
    pub status: ReservationStatus,
    /// Client reference
    pub client_id: PersonId,
    /// Realtor handling the reservation; `None` when placed by the office
    pub realtor_id: Option<RealtorId>,
    /// Deposit paid
    pub deposit: Money,
    /// Server time at creation
    pub reserved_at: DateTime<Utc>,
    /// End of the reservation term
    pub ends_at: DateTime<Utc>,
    /// Lot state right before the reservation was placed
    pub lot_status_at_creation: LotStatus,
    /// Sale produced on acceptance
    pub sale_id: Option<SaleId>,
    /// Soft-delete marker
    pub flag: OperationalFlag,
}

impl Reservation {
    /// Whether this reservation currently controls its lot.
    ///
    /// An accepted reservation hands control to its sale in the same
    /// transaction, so once `sale_id` is set it no longer counts.
    #[must_use]
    pub const fn is_controlling(&self) -> bool {
        matches!(
            self.status,
            ReservationStatus::Activa | ReservationStatus::Aceptada | ReservationStatus::Contraoferta
        ) && self.sale_id.is_none()
    }
}

/// One proposal in a reservation's negotiation history. Append-only.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Offer {
    /// Offer identifier
    pub id: OfferId,
    /// Owning reservation
    pub reservation_id: ReservationId,
    /// Position in the history, starting at 1; breaks timestamp ties
    pub sequence: u32,
    /// Proposed price
    pub amount: Money,
    /// Optional rationale
    pub rationale: Option<String>,
    /// Optional validity deadline
    pub valid_until: Option<DateTime<Utc>>,
    /// Side that proposed it
    pub owner_type: OwnerType,
    /// Server timestamp
    pub created_at: DateTime<Utc>,
}

/// The final, forward-only transaction record for a lot.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Sale {
    /// Sale identifier
    pub id: SaleId,
    /// Sold lot
    pub lot_id: LotId,
    /// Current state
    pub status: SaleStatus,
    /// Payment progress
    pub payment_status: PaymentStatus,
    /// Sale amount
    pub amount: Money,
    /// Server time at registration
    pub sold_at: DateTime<Utc>,
    /// Free-form payment type tag
    pub payment_type: String,
    /// Buyer reference
    pub buyer_id: PersonId,
    /// Purchase agreement date
    pub boleto_date: Option<DateTime<Utc>>,
    /// Deed execution date
    pub deed_date: Option<DateTime<Utc>>,
    /// Cancellation date
    pub cancelled_at: Option<DateTime<Utc>>,
    /// Cancellation reason, mandatory once cancelled
    pub cancellation_reason: Option<String>,
    /// Originating reservation
    pub reservation_id: Option<ReservationId>,
    /// Lot state to roll back to if the sale is cancelled
    pub lot_status_at_creation: LotStatus,
    /// Soft-delete marker
    pub flag: OperationalFlag,
}

impl Sale {
    /// Whether this sale currently controls its lot
    #[must_use]
    pub const fn is_controlling(&self) -> bool {
        !matches!(self.status, SaleStatus::Cancelada)
    }

    /// Deed executed and fully paid. Derived, never stored.
    #[must_use]
    pub const fn is_finalized(&self) -> bool {
        matches!(self.status, SaleStatus::Escriturado)
            && matches!(self.payment_status, PaymentStatus::PagoCompleto)
    }
}

/// Temporary price override on an available lot.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Promotion {
    /// Promotion identifier
    pub id: PromotionId,
    /// Promoted lot
    pub lot_id: LotId,
    /// Lot price before the promotion
    pub previous_price: Money,
    /// Price while active
    pub promotional_price: Money,
    /// Lot state before the promotion
    pub previous_lot_status: LotStatus,
    /// Start
    pub starts_at: DateTime<Utc>,
    /// Optional end; `None` means open-ended
    pub ends_at: Option<DateTime<Utc>>,
    /// Whether the override is in force
    pub active: bool,
    /// Optional explanation
    pub explanation: Option<String>,
}

impl Promotion {
    /// Whether this promotion currently controls its lot
    #[must_use]
    pub const fn is_controlling(&self) -> bool {
        self.active
    }
}

/// A state change produced by a lifecycle transition function.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Transition<S> {
    /// State before
    pub from: S,
    /// State after
    pub to: S,
}

impl<S: PartialEq> Transition<S> {
    /// Creates a transition record
    #[must_use]
    pub const fn new(from: S, to: S) -> Self {
        Self { from, to }
    }

    /// Whether the state did not change
    #[must_use]
    pub fn is_noop(&self) -> bool {
        self.from == self.to
    }
}
