//! `PostgreSQL` lot store.
//!
//! Every mutating operation starts with `SELECT … FOR UPDATE` on the lot row,
//! so competing writers on the same lot queue behind each other until the
//! first one commits or rolls back. Child rows are upserted by id; offers are
//! append-only.

use chrono::{DateTime, Utc};
use lotes_core::error::{DomainError, Result};
use lotes_core::store::{ChildRef, LotStore, LotTransaction};
use lotes_core::types::{
    HoldId, HoldStatus, LocationId, Lot, LotId, LotStatus, LotSubstatus, Money, Offer, OfferId,
    OperationalFlag, OwnerType, Party, PaymentStatus, PersonId, PriorityHold, Promotion,
    PromotionId, RealtorId, Reservation, ReservationId, ReservationStatus, Sale, SaleId,
    SaleStatus,
};
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::{PgPool, Postgres, Row};
use std::time::Duration;
use uuid::Uuid;

/// Map a sqlx error onto the engine's taxonomy.
///
/// Serialization failures, deadlocks and lock timeouts are transient
/// ([`DomainError::Contention`]); everything else is [`DomainError::Storage`].
fn map_err(context: &str, error: sqlx::Error) -> DomainError {
    if let sqlx::Error::Database(db) = &error {
        if matches!(db.code().as_deref(), Some("40001" | "40P01" | "55P03")) {
            metrics::counter!("lots.store.contention").increment(1);
            tracing::warn!(context, code = ?db.code(), "Transient database failure");
            return DomainError::Contention(format!("{context}: {db}"));
        }
    }
    DomainError::Storage(format!("{context}: {error}"))
}

fn cents(money: Money) -> Result<i64> {
    i64::try_from(money.cents())
        .map_err(|_| DomainError::Storage(format!("amount {money} exceeds BIGINT")))
}

fn money(cents: i64) -> Result<Money> {
    u64::try_from(cents)
        .map(Money::from_cents)
        .map_err(|_| DomainError::Storage(format!("negative amount in storage: {cents}")))
}

fn realtor_column(party: &Party) -> Option<Uuid> {
    party.realtor().map(|id| *id.as_uuid())
}

fn party(row: &PgRow) -> Result<Party> {
    let owner_type = OwnerType::parse(row.get("owner_type"))?;
    let realtor: Option<Uuid> = row.get("realtor_id");
    Party::from_parts(owner_type, realtor.map(RealtorId::from_uuid))
}

fn row_to_lot(row: &PgRow) -> Result<Lot> {
    let owner_id: Option<Uuid> = row.get("owner_id");
    let location_id: Option<Uuid> = row.get("location_id");
    Ok(Lot::rehydrate(
        LotId::from_uuid(row.get("id")),
        LotStatus::parse(row.get("status"))?,
        LotSubstatus::parse(row.get("substatus"))?,
        money(row.get("price_cents"))?,
        row.get("surface_m2"),
        owner_id.map(PersonId::from_uuid),
        location_id.map(LocationId::from_uuid),
    ))
}

fn row_to_hold(row: &PgRow) -> Result<PriorityHold> {
    Ok(PriorityHold {
        id: HoldId::from_uuid(row.get("id")),
        lot_id: LotId::from_uuid(row.get("lot_id")),
        status: HoldStatus::parse(row.get("status"))?,
        owner: party(row)?,
        starts_at: row.get("starts_at"),
        ends_at: row.get("ends_at"),
        lot_status_at_creation: LotStatus::parse(row.get("lot_status_at_creation"))?,
        flag: OperationalFlag::parse(row.get("flag"))?,
    })
}

fn row_to_reservation(row: &PgRow) -> Result<Reservation> {
    let realtor_id: Option<Uuid> = row.get("realtor_id");
    let sale_id: Option<Uuid> = row.get("sale_id");
    Ok(Reservation {
        id: ReservationId::from_uuid(row.get("id")),
        lot_id: LotId::from_uuid(row.get("lot_id")),
        status: ReservationStatus::parse(row.get("status"))?,
        client_id: PersonId::from_uuid(row.get("client_id")),
        realtor_id: realtor_id.map(RealtorId::from_uuid),
        deposit: money(row.get("deposit_cents"))?,
        reserved_at: row.get("reserved_at"),
        ends_at: row.get("ends_at"),
        lot_status_at_creation: LotStatus::parse(row.get("lot_status_at_creation"))?,
        sale_id: sale_id.map(SaleId::from_uuid),
        flag: OperationalFlag::parse(row.get("flag"))?,
    })
}

fn row_to_sale(row: &PgRow) -> Result<Sale> {
    let reservation_id: Option<Uuid> = row.get("reservation_id");
    Ok(Sale {
        id: SaleId::from_uuid(row.get("id")),
        lot_id: LotId::from_uuid(row.get("lot_id")),
        status: SaleStatus::parse(row.get("status"))?,
        payment_status: PaymentStatus::parse(row.get("payment_status"))?,
        amount: money(row.get("amount_cents"))?,
        sold_at: row.get("sold_at"),
        payment_type: row.get("payment_type"),
        buyer_id: PersonId::from_uuid(row.get("buyer_id")),
        boleto_date: row.get("boleto_date"),
        deed_date: row.get("deed_date"),
        cancelled_at: row.get("cancelled_at"),
        cancellation_reason: row.get("cancellation_reason"),
        reservation_id: reservation_id.map(ReservationId::from_uuid),
        lot_status_at_creation: LotStatus::parse(row.get("lot_status_at_creation"))?,
        flag: OperationalFlag::parse(row.get("flag"))?,
    })
}

fn row_to_promotion(row: &PgRow) -> Result<Promotion> {
    Ok(Promotion {
        id: PromotionId::from_uuid(row.get("id")),
        lot_id: LotId::from_uuid(row.get("lot_id")),
        previous_price: money(row.get("previous_price_cents"))?,
        promotional_price: money(row.get("promotional_price_cents"))?,
        previous_lot_status: LotStatus::parse(row.get("previous_lot_status"))?,
        starts_at: row.get("starts_at"),
        ends_at: row.get("ends_at"),
        active: row.get("active"),
        explanation: row.get("explanation"),
    })
}

fn row_to_offer(row: &PgRow) -> Result<Offer> {
    let sequence: i32 = row.get("sequence");
    Ok(Offer {
        id: OfferId::from_uuid(row.get("id")),
        reservation_id: ReservationId::from_uuid(row.get("reservation_id")),
        sequence: u32::try_from(sequence)
            .map_err(|_| DomainError::Storage(format!("negative offer sequence: {sequence}")))?,
        amount: money(row.get("amount_cents"))?,
        rationale: row.get("rationale"),
        valid_until: row.get("valid_until"),
        owner_type: OwnerType::parse(row.get("owner_type"))?,
        created_at: row.get("created_at"),
    })
}

/// `PostgreSQL`-backed [`LotStore`].
///
/// # Example
///
/// ```no_run
/// use lotes_postgres::PostgresLotStore;
/// use std::time::Duration;
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let store = PostgresLotStore::connect("postgres://localhost/lotes", 5)
///     .await?
///     .with_lock_timeout(Duration::from_secs(5));
/// store.migrate().await?;
/// # Ok(())
/// # }
/// ```
#[derive(Clone, Debug)]
pub struct PostgresLotStore {
    pool: PgPool,
    lock_timeout: Option<Duration>,
}

impl PostgresLotStore {
    /// Wrap an existing pool. Lock waits are unbounded.
    #[must_use]
    pub const fn new(pool: PgPool) -> Self {
        Self {
            pool,
            lock_timeout: None,
        }
    }

    /// Connect to `database_url` with a pool of `max_connections`.
    ///
    /// # Errors
    ///
    /// Returns [`DomainError::Storage`] if the connection fails.
    pub async fn connect(database_url: &str, max_connections: u32) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(database_url)
            .await
            .map_err(|e| map_err("Failed to connect", e))?;
        Ok(Self::new(pool))
    }

    /// Abort a transaction with [`DomainError::Contention`] when the lot row
    /// lock is not granted within `timeout`.
    #[must_use]
    pub const fn with_lock_timeout(mut self, timeout: Duration) -> Self {
        self.lock_timeout = Some(timeout);
        self
    }

    /// Apply the bundled schema migrations.
    ///
    /// # Errors
    ///
    /// Returns [`DomainError::Storage`] if a migration fails.
    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("../migrations")
            .run(&self.pool)
            .await
            .map_err(|e| DomainError::Storage(format!("Migration failed: {e}")))?;
        Ok(())
    }

    /// Get the underlying connection pool.
    #[must_use]
    pub const fn pool(&self) -> &PgPool {
        &self.pool
    }
}

impl LotStore for PostgresLotStore {
    type Transaction = PostgresTransaction;

    async fn begin(&self) -> Result<PostgresTransaction> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_err("Failed to begin transaction", e))?;

        if let Some(timeout) = self.lock_timeout {
            // SET does not take bind parameters
            sqlx::query(&format!("SET LOCAL lock_timeout = '{}ms'", timeout.as_millis()))
                .execute(&mut *tx)
                .await
                .map_err(|e| map_err("Failed to set lock timeout", e))?;
        }

        Ok(PostgresTransaction { tx })
    }

    async fn insert_lot(&self, lot: &Lot) -> Result<()> {
        let result = sqlx::query(
            r"
            INSERT INTO lots (id, status, substatus, price_cents, surface_m2, owner_id, location_id)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            ",
        )
        .bind(*lot.id.as_uuid())
        .bind(lot.status().as_str())
        .bind(lot.substatus.as_str())
        .bind(cents(lot.price())?)
        .bind(lot.surface_m2)
        .bind(lot.owner_id.map(|id| *id.as_uuid()))
        .bind(lot.location_id.map(|id| *id.as_uuid()))
        .execute(&self.pool)
        .await;

        match result {
            Ok(_) => Ok(()),
            Err(sqlx::Error::Database(db)) if db.is_unique_violation() => {
                Err(DomainError::Conflict(format!("lot {} already exists", lot.id)))
            },
            Err(e) => Err(map_err("Failed to insert lot", e)),
        }
    }

    async fn lots_with_elapsed_deadlines(&self, now: DateTime<Utc>) -> Result<Vec<LotId>> {
        let ids: Vec<Uuid> = sqlx::query_scalar(
            r"
            SELECT lot_id FROM priority_holds
             WHERE status = 'ACTIVA' AND ends_at < $1
            UNION
            SELECT lot_id FROM reservations
             WHERE status IN ('ACTIVA', 'CONTRAOFERTA') AND ends_at < $1
            UNION
            SELECT r.lot_id FROM reservations r
              JOIN LATERAL (
                  SELECT valid_until FROM offers o
                   WHERE o.reservation_id = r.id
                   ORDER BY o.created_at DESC, o.sequence DESC
                   LIMIT 1
              ) latest ON true
             WHERE r.status = 'CONTRAOFERTA' AND latest.valid_until < $1
            UNION
            SELECT lot_id FROM promotions
             WHERE active AND ends_at < $1
            ORDER BY 1
            ",
        )
        .bind(now)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| map_err("Failed to find lots with elapsed deadlines", e))?;

        Ok(ids.into_iter().map(LotId::from_uuid).collect())
    }
}

/// An open `PostgreSQL` transaction. Dropping it rolls back.
pub struct PostgresTransaction {
    tx: sqlx::Transaction<'static, Postgres>,
}

impl LotTransaction for PostgresTransaction {
    async fn lock_lot(&mut self, id: LotId) -> Result<Lot> {
        let row = sqlx::query(
            r"
            SELECT id, status, substatus, price_cents, surface_m2, owner_id, location_id
            FROM lots
            WHERE id = $1
            FOR UPDATE
            ",
        )
        .bind(*id.as_uuid())
        .fetch_optional(&mut *self.tx)
        .await
        .map_err(|e| map_err("Failed to lock lot", e))?
        .ok_or_else(|| DomainError::not_found("lot", id))?;

        row_to_lot(&row)
    }

    async fn lot_of(&mut self, child: ChildRef) -> Result<LotId> {
        let (table, id) = match child {
            ChildRef::Hold(id) => ("priority_holds", *id.as_uuid()),
            ChildRef::Reservation(id) => ("reservations", *id.as_uuid()),
            ChildRef::Sale(id) => ("sales", *id.as_uuid()),
            ChildRef::Promotion(id) => ("promotions", *id.as_uuid()),
        };

        let lot_id: Option<Uuid> =
            sqlx::query_scalar(&format!("SELECT lot_id FROM {table} WHERE id = $1"))
                .bind(id)
                .fetch_optional(&mut *self.tx)
                .await
                .map_err(|e| map_err("Failed to resolve owning lot", e))?;

        lot_id
            .map(LotId::from_uuid)
            .ok_or_else(|| DomainError::not_found(child.entity(), child))
    }

    async fn holds_for_lot(&mut self, lot: LotId) -> Result<Vec<PriorityHold>> {
        let rows = sqlx::query(
            r"
            SELECT id, lot_id, status, owner_type, realtor_id, starts_at, ends_at,
                   lot_status_at_creation, flag
            FROM priority_holds
            WHERE lot_id = $1
            ORDER BY starts_at
            ",
        )
        .bind(*lot.as_uuid())
        .fetch_all(&mut *self.tx)
        .await
        .map_err(|e| map_err("Failed to load holds", e))?;

        rows.iter().map(row_to_hold).collect()
    }

    async fn reservations_for_lot(&mut self, lot: LotId) -> Result<Vec<Reservation>> {
        let rows = sqlx::query(
            r"
            SELECT id, lot_id, status, client_id, realtor_id, deposit_cents, reserved_at,
                   ends_at, lot_status_at_creation, sale_id, flag
            FROM reservations
            WHERE lot_id = $1
            ORDER BY reserved_at
            ",
        )
        .bind(*lot.as_uuid())
        .fetch_all(&mut *self.tx)
        .await
        .map_err(|e| map_err("Failed to load reservations", e))?;

        rows.iter().map(row_to_reservation).collect()
    }

    async fn sales_for_lot(&mut self, lot: LotId) -> Result<Vec<Sale>> {
        let rows = sqlx::query(
            r"
            SELECT id, lot_id, status, payment_status, amount_cents, sold_at, payment_type,
                   buyer_id, boleto_date, deed_date, cancelled_at, cancellation_reason,
                   reservation_id, lot_status_at_creation, flag
            FROM sales
            WHERE lot_id = $1
            ORDER BY sold_at
            ",
        )
        .bind(*lot.as_uuid())
        .fetch_all(&mut *self.tx)
        .await
        .map_err(|e| map_err("Failed to load sales", e))?;

        rows.iter().map(row_to_sale).collect()
    }

    async fn promotions_for_lot(&mut self, lot: LotId) -> Result<Vec<Promotion>> {
        let rows = sqlx::query(
            r"
            SELECT id, lot_id, previous_price_cents, promotional_price_cents,
                   previous_lot_status, starts_at, ends_at, active, explanation
            FROM promotions
            WHERE lot_id = $1
            ORDER BY starts_at
            ",
        )
        .bind(*lot.as_uuid())
        .fetch_all(&mut *self.tx)
        .await
        .map_err(|e| map_err("Failed to load promotions", e))?;

        rows.iter().map(row_to_promotion).collect()
    }

    async fn offers_for_reservation(&mut self, reservation: ReservationId) -> Result<Vec<Offer>> {
        let rows = sqlx::query(
            r"
            SELECT id, reservation_id, sequence, amount_cents, rationale, valid_until,
                   owner_type, created_at
            FROM offers
            WHERE reservation_id = $1
            ORDER BY created_at, sequence
            ",
        )
        .bind(*reservation.as_uuid())
        .fetch_all(&mut *self.tx)
        .await
        .map_err(|e| map_err("Failed to load offers", e))?;

        rows.iter().map(row_to_offer).collect()
    }

    async fn save_lot(&mut self, lot: &Lot) -> Result<()> {
        let result = sqlx::query(
            r"
            UPDATE lots
            SET status = $2, substatus = $3, price_cents = $4, updated_at = now()
            WHERE id = $1
            ",
        )
        .bind(*lot.id.as_uuid())
        .bind(lot.status().as_str())
        .bind(lot.substatus.as_str())
        .bind(cents(lot.price())?)
        .execute(&mut *self.tx)
        .await
        .map_err(|e| map_err("Failed to save lot", e))?;

        if result.rows_affected() == 0 {
            return Err(DomainError::not_found("lot", lot.id));
        }
        Ok(())
    }

    async fn save_hold(&mut self, hold: &PriorityHold) -> Result<()> {
        sqlx::query(
            r"
            INSERT INTO priority_holds
                (id, lot_id, status, owner_type, realtor_id, starts_at, ends_at,
                 lot_status_at_creation, flag)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            ON CONFLICT (id) DO UPDATE
            SET status = EXCLUDED.status, flag = EXCLUDED.flag
            ",
        )
        .bind(*hold.id.as_uuid())
        .bind(*hold.lot_id.as_uuid())
        .bind(hold.status.as_str())
        .bind(hold.owner.owner_type().as_str())
        .bind(realtor_column(&hold.owner))
        .bind(hold.starts_at)
        .bind(hold.ends_at)
        .bind(hold.lot_status_at_creation.as_str())
        .bind(hold.flag.as_str())
        .execute(&mut *self.tx)
        .await
        .map_err(|e| map_err("Failed to save hold", e))?;
        Ok(())
    }

    async fn save_reservation(&mut self, reservation: &Reservation) -> Result<()> {
        sqlx::query(
            r"
            INSERT INTO reservations
                (id, lot_id, status, client_id, realtor_id, deposit_cents, reserved_at,
                 ends_at, lot_status_at_creation, sale_id, flag)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            ON CONFLICT (id) DO UPDATE
            SET status = EXCLUDED.status, sale_id = EXCLUDED.sale_id, flag = EXCLUDED.flag
            ",
        )
        .bind(*reservation.id.as_uuid())
        .bind(*reservation.lot_id.as_uuid())
        .bind(reservation.status.as_str())
        .bind(*reservation.client_id.as_uuid())
        .bind(reservation.realtor_id.map(|id| *id.as_uuid()))
        .bind(cents(reservation.deposit)?)
        .bind(reservation.reserved_at)
        .bind(reservation.ends_at)
        .bind(reservation.lot_status_at_creation.as_str())
        .bind(reservation.sale_id.map(|id| *id.as_uuid()))
        .bind(reservation.flag.as_str())
        .execute(&mut *self.tx)
        .await
        .map_err(|e| map_err("Failed to save reservation", e))?;
        Ok(())
    }

    async fn save_sale(&mut self, sale: &Sale) -> Result<()> {
        sqlx::query(
            r"
            INSERT INTO sales
                (id, lot_id, status, payment_status, amount_cents, sold_at, payment_type,
                 buyer_id, boleto_date, deed_date, cancelled_at, cancellation_reason,
                 reservation_id, lot_status_at_creation, flag)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15)
            ON CONFLICT (id) DO UPDATE
            SET status = EXCLUDED.status,
                payment_status = EXCLUDED.payment_status,
                boleto_date = EXCLUDED.boleto_date,
                deed_date = EXCLUDED.deed_date,
                cancelled_at = EXCLUDED.cancelled_at,
                cancellation_reason = EXCLUDED.cancellation_reason,
                flag = EXCLUDED.flag
            ",
        )
        .bind(*sale.id.as_uuid())
        .bind(*sale.lot_id.as_uuid())
        .bind(sale.status.as_str())
        .bind(sale.payment_status.as_str())
        .bind(cents(sale.amount)?)
        .bind(sale.sold_at)
        .bind(&sale.payment_type)
        .bind(*sale.buyer_id.as_uuid())
        .bind(sale.boleto_date)
        .bind(sale.deed_date)
        .bind(sale.cancelled_at)
        .bind(&sale.cancellation_reason)
        .bind(sale.reservation_id.map(|id| *id.as_uuid()))
        .bind(sale.lot_status_at_creation.as_str())
        .bind(sale.flag.as_str())
        .execute(&mut *self.tx)
        .await
        .map_err(|e| map_err("Failed to save sale", e))?;
        Ok(())
    }

    async fn save_promotion(&mut self, promotion: &Promotion) -> Result<()> {
        sqlx::query(
            r"
            INSERT INTO promotions
                (id, lot_id, previous_price_cents, promotional_price_cents,
                 previous_lot_status, starts_at, ends_at, active, explanation)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            ON CONFLICT (id) DO UPDATE
            SET active = EXCLUDED.active
            ",
        )
        .bind(*promotion.id.as_uuid())
        .bind(*promotion.lot_id.as_uuid())
        .bind(cents(promotion.previous_price)?)
        .bind(cents(promotion.promotional_price)?)
        .bind(promotion.previous_lot_status.as_str())
        .bind(promotion.starts_at)
        .bind(promotion.ends_at)
        .bind(promotion.active)
        .bind(&promotion.explanation)
        .execute(&mut *self.tx)
        .await
        .map_err(|e| map_err("Failed to save promotion", e))?;
        Ok(())
    }

    async fn append_offer(&mut self, offer: &Offer) -> Result<()> {
        let sequence = i32::try_from(offer.sequence).map_err(|_| {
            DomainError::Storage(format!("offer sequence {} exceeds INTEGER", offer.sequence))
        })?;

        sqlx::query(
            r"
            INSERT INTO offers
                (id, reservation_id, sequence, amount_cents, rationale, valid_until,
                 owner_type, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            ",
        )
        .bind(*offer.id.as_uuid())
        .bind(*offer.reservation_id.as_uuid())
        .bind(sequence)
        .bind(cents(offer.amount)?)
        .bind(&offer.rationale)
        .bind(offer.valid_until)
        .bind(offer.owner_type.as_str())
        .bind(offer.created_at)
        .execute(&mut *self.tx)
        .await
        .map_err(|e| map_err("Failed to append offer", e))?;
        Ok(())
    }

    async fn commit(self) -> Result<()> {
        self.tx
            .commit()
            .await
            .map_err(|e| map_err("Failed to commit", e))
    }
}
