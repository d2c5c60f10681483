//! `PostgreSQL` lot store for the lot lifecycle engine.
//!
//! This crate implements the [`lotes_core::store::LotStore`] and
//! [`lotes_core::store::LotTransaction`] traits over sqlx:
//!
//! - One sqlx transaction per engine operation
//! - `SELECT … FOR UPDATE` on the lot row, optionally bounded by `lock_timeout`
//! - Serialization failures, deadlocks and lock timeouts surface as the
//!   transient `DomainError::Contention`
//! - Schema migrations bundled from the workspace `migrations/` directory
//!
//! # Example
//!
//! ```no_run
//! use lotes_core::environment::SystemClock;
//! use lotes_core::service::LotService;
//! use lotes_postgres::PostgresLotStore;
//! use std::sync::Arc;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let store = PostgresLotStore::connect("postgres://localhost/lotes", 5).await?;
//! store.migrate().await?;
//! let service = LotService::new(store, Arc::new(SystemClock));
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

mod store;

pub use store::{PostgresLotStore, PostgresTransaction};
