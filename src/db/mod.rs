//! Database module: row mappers and SQL repositories.
//!
//! - `model`: row mappers and insert payloads.
//! - `repo`: SQL-only functions over a `SqliteConnection`; callers pass a
//!   pooled connection or `&mut *tx` to group calls in one transaction.

pub mod model;
pub mod repo;

pub use model::{EarningsRecord, NewAuditEntry, NewBooking, NewDriver};
pub use repo::*;
