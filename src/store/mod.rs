//! Persistence layer: delivery log, suppressions, daily quota and provider events.

pub mod libsql_backend;
pub mod migrations;
pub mod traits;

pub use libsql_backend::LibSqlBackend;
pub use traits::{Database, DeliveryRecord, DeliveryTotals};
