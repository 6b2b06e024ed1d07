//! SQLite ledger store
//!
//! Durable storage for the supply-chain ledger. Every multi-record write
//! (settlement, batch creation, product assembly) runs inside one SQLite
//! transaction so a failure leaves no partial state behind.
//!
//! ## Tables
//!
//! - `farmers`, `suppliers`, `industries`, `consumers` - actor records
//! - `batches` - herb batches with their current owner and status
//! - `chain_events` - immutable custody/processing/verification facts
//! - `batch_chain` - append-only ordered event list per batch
//! - `payments` - settlement records, one live payment per (batch, payer)
//! - `final_products`, `product_sources`, `product_trace` - assembled products
//!   and their provenance snapshots

pub mod schema;
pub mod models;
pub mod actors;
pub mod batches;
pub mod chain_events;
pub mod payments;
pub mod products;

use std::path::Path;
use std::str::FromStr;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use rusqlite::{Connection, Row};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{debug, info};

use crate::error::LedgerError;

/// SQLite database holding the ledger
pub struct LedgerDb {
    conn: Mutex<Connection>,
}

impl LedgerDb {
    /// Open or create the ledger database in `storage_dir`
    pub fn open(storage_dir: &Path) -> Result<Self, LedgerError> {
        std::fs::create_dir_all(storage_dir)?;
        let db_path = storage_dir.join("ledger.db");
        Self::open_path(&db_path)
    }

    /// Open or create the ledger database at an explicit file path
    pub fn open_path(db_path: &Path) -> Result<Self, LedgerError> {
        info!("Opening ledger database at {:?}", db_path);

        let conn = Connection::open(db_path)
            .map_err(|e| LedgerError::Internal(format!("Failed to open SQLite: {}", e)))?;

        // WAL for concurrent readers; foreign keys are off by default in SQLite
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL; PRAGMA foreign_keys=ON;")
            .map_err(|e| LedgerError::Internal(format!("Failed to set PRAGMA: {}", e)))?;

        let db = Self {
            conn: Mutex::new(conn),
        };
        db.init_schema()?;

        Ok(db)
    }

    /// Open an in-memory database (for testing)
    pub fn open_in_memory() -> Result<Self, LedgerError> {
        debug!("Opening in-memory ledger database");

        let conn = Connection::open_in_memory()
            .map_err(|e| LedgerError::Internal(format!("Failed to open in-memory SQLite: {}", e)))?;

        conn.execute_batch("PRAGMA foreign_keys=ON;")
            .map_err(|e| LedgerError::Internal(format!("Failed to set PRAGMA: {}", e)))?;

        let db = Self {
            conn: Mutex::new(conn),
        };
        db.init_schema()?;

        Ok(db)
    }

    fn init_schema(&self) -> Result<(), LedgerError> {
        let conn = self.conn.lock()
            .map_err(|e| LedgerError::Internal(format!("Lock poisoned: {}", e)))?;

        schema::init_schema(&conn)
    }

    /// Run a read with shared access to the connection
    pub fn with_conn<F, T>(&self, f: F) -> Result<T, LedgerError>
    where
        F: FnOnce(&Connection) -> Result<T, LedgerError>,
    {
        let conn = self.conn.lock()
            .map_err(|e| LedgerError::Internal(format!("Lock poisoned: {}", e)))?;
        f(&conn)
    }

    /// Execute a write operation with exclusive access (for transactions)
    pub fn with_conn_mut<F, T>(&self, f: F) -> Result<T, LedgerError>
    where
        F: FnOnce(&mut Connection) -> Result<T, LedgerError>,
    {
        let mut conn = self.conn.lock()
            .map_err(|e| LedgerError::Internal(format!("Lock poisoned: {}", e)))?;
        f(&mut conn)
    }

    /// Get ledger statistics
    pub fn stats(&self) -> Result<LedgerStats, LedgerError> {
        self.with_conn(|conn| {
            let count = |sql: &str| -> Result<u64, LedgerError> {
                conn.query_row(sql, [], |row| row.get::<_, i64>(0))
                    .map(|n| n as u64)
                    .map_err(|e| LedgerError::Internal(format!("Query failed: {}", e)))
            };

            Ok(LedgerStats {
                batch_count: count("SELECT COUNT(*) FROM batches")?,
                event_count: count("SELECT COUNT(*) FROM chain_events")?,
                payment_count: count("SELECT COUNT(*) FROM payments")?,
                completed_payments: count("SELECT COUNT(*) FROM payments WHERE status = 'completed'")?,
                product_count: count("SELECT COUNT(*) FROM final_products")?,
            })
        })
    }
}

// ============================================================================
// Column Helpers
// ============================================================================

pub(crate) fn conversion_err<E>(e: E) -> rusqlite::Error
where
    E: std::error::Error + Send + Sync + 'static,
{
    rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, Box::new(e))
}

/// Read a TEXT column through `FromStr` (enums, dates)
pub(crate) fn text_col<T>(row: &Row, name: &str) -> Result<T, rusqlite::Error>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    let raw: String = row.get(name)?;
    raw.parse::<T>().map_err(conversion_err)
}

pub(crate) fn ts_col(row: &Row, name: &str) -> Result<DateTime<Utc>, rusqlite::Error> {
    let raw: String = row.get(name)?;
    models::parse_timestamp(&raw).map_err(conversion_err)
}

pub(crate) fn opt_ts_col(row: &Row, name: &str) -> Result<Option<DateTime<Utc>>, rusqlite::Error> {
    let raw: Option<String> = row.get(name)?;
    raw.map(|s| models::parse_timestamp(&s).map_err(conversion_err))
        .transpose()
}

pub(crate) fn json_col<T: DeserializeOwned>(row: &Row, name: &str) -> Result<T, rusqlite::Error> {
    let raw: String = row.get(name)?;
    serde_json::from_str(&raw).map_err(conversion_err)
}

pub(crate) fn opt_json_col<T: DeserializeOwned>(
    row: &Row,
    name: &str,
) -> Result<Option<T>, rusqlite::Error> {
    let raw: Option<String> = row.get(name)?;
    raw.map(|s| serde_json::from_str(&s).map_err(conversion_err))
        .transpose()
}

pub(crate) fn to_json<T: Serialize + ?Sized>(value: &T) -> Result<String, LedgerError> {
    Ok(serde_json::to_string(value)?)
}

pub(crate) fn opt_to_json<T: Serialize>(value: Option<&T>) -> Result<Option<String>, LedgerError> {
    value.map(to_json).transpose()
}

/// Ledger statistics
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LedgerStats {
    pub batch_count: u64,
    pub event_count: u64,
    pub payment_count: u64,
    pub completed_payments: u64,
    pub product_count: u64,
}

// Re-exports
pub use models::{
    ActorType, Batch, BatchStatus, ChainEvent, EventMetadata, EventStatus, EventType,
    FinalProduct, Payment, PaymentMode, PaymentStatus, ProductStatus,
};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_open_on_disk_and_reopen() {
        let dir = tempfile::TempDir::new().unwrap();
        {
            let db = LedgerDb::open(dir.path()).unwrap();
            assert_eq!(db.stats().unwrap().batch_count, 0);
        }
        let db = LedgerDb::open(dir.path()).unwrap();
        assert_eq!(db.stats().unwrap().product_count, 0);
    }

    #[test]
    fn test_foreign_keys_enforced() {
        let db = LedgerDb::open_in_memory().unwrap();
        let result = db.with_conn(|conn| {
            conn.execute(
                "INSERT INTO batch_chain (batch_id, position, event_id) VALUES ('missing', 1, 'missing')",
                [],
            )
            .map_err(|e| LedgerError::Internal(e.to_string()))
        });
        assert!(result.is_err());
    }
}
