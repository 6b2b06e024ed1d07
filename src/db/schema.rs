//! Database schema definitions

use rusqlite::Connection;
use tracing::info;

use crate::error::LedgerError;

/// Current schema version for migrations
pub const SCHEMA_VERSION: i32 = 1;

/// Initialize the database schema
pub fn init_schema(conn: &Connection) -> Result<(), LedgerError> {
    let current_version = get_schema_version(conn)?;

    if current_version == 0 {
        info!("Creating new ledger schema v{}", SCHEMA_VERSION);
        create_tables(conn)?;
        set_schema_version(conn, SCHEMA_VERSION)?;
    } else if current_version < SCHEMA_VERSION {
        info!("Migrating schema from v{} to v{}", current_version, SCHEMA_VERSION);
        migrate_schema(conn, current_version)?;
    } else {
        info!("Ledger schema is up to date (v{})", current_version);
    }

    Ok(())
}

/// Get current schema version (0 if not initialized)
fn get_schema_version(conn: &Connection) -> Result<i32, LedgerError> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS schema_version (version INTEGER NOT NULL)",
        [],
    )
    .map_err(|e| LedgerError::Internal(format!("Failed to create schema_version table: {}", e)))?;

    let version: i32 = conn
        .query_row("SELECT version FROM schema_version LIMIT 1", [], |row| row.get(0))
        .unwrap_or(0);

    Ok(version)
}

fn set_schema_version(conn: &Connection, version: i32) -> Result<(), LedgerError> {
    conn.execute("DELETE FROM schema_version", [])
        .map_err(|e| LedgerError::Internal(format!("Failed to clear schema_version: {}", e)))?;
    conn.execute("INSERT INTO schema_version (version) VALUES (?)", [version])
        .map_err(|e| LedgerError::Internal(format!("Failed to set schema_version: {}", e)))?;
    Ok(())
}

fn create_tables(conn: &Connection) -> Result<(), LedgerError> {
    conn.execute_batch(ACTORS_SCHEMA)
        .map_err(|e| LedgerError::Internal(format!("Failed to create actor tables: {}", e)))?;

    conn.execute_batch(BATCHES_SCHEMA)
        .map_err(|e| LedgerError::Internal(format!("Failed to create batch tables: {}", e)))?;

    conn.execute_batch(PAYMENTS_SCHEMA)
        .map_err(|e| LedgerError::Internal(format!("Failed to create payment tables: {}", e)))?;

    conn.execute_batch(PRODUCTS_SCHEMA)
        .map_err(|e| LedgerError::Internal(format!("Failed to create product tables: {}", e)))?;

    conn.execute_batch(IMMUTABILITY_TRIGGERS)
        .map_err(|e| LedgerError::Internal(format!("Failed to create triggers: {}", e)))?;

    Ok(())
}

fn migrate_schema(conn: &Connection, from_version: i32) -> Result<(), LedgerError> {
    info!(from_version, "No migration steps registered");
    set_schema_version(conn, SCHEMA_VERSION)
}

/// One table per actor kind; the identity registry picks the table by kind
const ACTORS_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS farmers (
    id TEXT PRIMARY KEY NOT NULL,
    name TEXT NOT NULL,
    phone TEXT NOT NULL,
    village TEXT,
    district TEXT,
    state TEXT,
    is_approved INTEGER NOT NULL DEFAULT 0,
    created_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS suppliers (
    id TEXT PRIMARY KEY NOT NULL,
    name TEXT NOT NULL,
    phone TEXT NOT NULL,
    business_name TEXT,
    district TEXT,
    state TEXT,
    is_approved INTEGER NOT NULL DEFAULT 0,
    created_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS industries (
    id TEXT PRIMARY KEY NOT NULL,
    industry_name TEXT NOT NULL,
    phone TEXT NOT NULL,
    email TEXT,
    address TEXT,
    license_number TEXT,
    is_approved INTEGER NOT NULL DEFAULT 0,
    created_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS consumers (
    id TEXT PRIMARY KEY NOT NULL,
    name TEXT,
    phone TEXT NOT NULL,
    created_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_farmers_phone ON farmers(phone);
CREATE INDEX IF NOT EXISTS idx_suppliers_phone ON suppliers(phone);
CREATE INDEX IF NOT EXISTS idx_industries_phone ON industries(phone);
CREATE INDEX IF NOT EXISTS idx_consumers_phone ON consumers(phone);
"#;

/// Batches, chain events and the per-batch ordered chain list
const BATCHES_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS batches (
    batch_id TEXT PRIMARY KEY NOT NULL,
    farmer_id TEXT NOT NULL,
    herb_name TEXT NOT NULL,
    scientific_name TEXT,
    category TEXT,
    harvest_date TEXT NOT NULL,
    quantity_value REAL NOT NULL,
    quantity_unit TEXT NOT NULL,
    gps_json TEXT NOT NULL,
    location_json TEXT,
    quality_json TEXT,
    images_json TEXT NOT NULL DEFAULT '[]',
    description TEXT,
    farmer_price_json TEXT,

    -- Current custodian, exactly one
    owner_id TEXT NOT NULL,
    owner_type TEXT NOT NULL,
    owner_acquired_at TEXT NOT NULL,

    status TEXT NOT NULL DEFAULT 'harvested',
    final_product_id TEXT,
    scan_url TEXT,
    scan_code TEXT,
    is_active INTEGER NOT NULL DEFAULT 1,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS chain_events (
    event_id TEXT PRIMARY KEY NOT NULL,
    batch_id TEXT NOT NULL REFERENCES batches(batch_id),
    event_type TEXT NOT NULL,

    -- Actor snapshot captured at event time
    performer_id TEXT NOT NULL,
    performer_type TEXT NOT NULL,
    performer_name TEXT,
    performer_phone TEXT,

    transaction_json TEXT,
    location_json TEXT,
    metadata_json TEXT NOT NULL,
    verification_json TEXT,
    notes TEXT,
    timestamp TEXT NOT NULL,
    status TEXT NOT NULL DEFAULT 'active'
);

-- Append-only ordered list of events per batch
CREATE TABLE IF NOT EXISTS batch_chain (
    batch_id TEXT NOT NULL REFERENCES batches(batch_id),
    position INTEGER NOT NULL,
    event_id TEXT NOT NULL UNIQUE REFERENCES chain_events(event_id),
    PRIMARY KEY (batch_id, position)
);

CREATE INDEX IF NOT EXISTS idx_batches_owner ON batches(owner_id);
CREATE INDEX IF NOT EXISTS idx_batches_farmer ON batches(farmer_id);
CREATE INDEX IF NOT EXISTS idx_batches_status ON batches(status);
CREATE INDEX IF NOT EXISTS idx_batches_herb ON batches(herb_name);
CREATE INDEX IF NOT EXISTS idx_events_batch ON chain_events(batch_id);
CREATE INDEX IF NOT EXISTS idx_events_type ON chain_events(event_type);
CREATE INDEX IF NOT EXISTS idx_events_performer ON chain_events(performer_id);
"#;

const PAYMENTS_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS payments (
    payment_id TEXT PRIMARY KEY NOT NULL,
    batch_id TEXT NOT NULL REFERENCES batches(batch_id),

    payer_id TEXT NOT NULL,
    payer_type TEXT NOT NULL,
    payer_name TEXT,
    payer_phone TEXT,
    payee_id TEXT NOT NULL,
    payee_type TEXT NOT NULL,
    payee_name TEXT,
    payee_phone TEXT,

    amount INTEGER NOT NULL CHECK (amount > 0),
    currency TEXT NOT NULL DEFAULT 'INR',
    payment_mode TEXT NOT NULL,
    status TEXT NOT NULL DEFAULT 'pending',

    gateway_order_id TEXT,
    gateway_payment_id TEXT,
    gateway_signature TEXT,
    cash_json TEXT,
    offline_reference TEXT,
    proof_urls_json TEXT NOT NULL DEFAULT '[]',

    failure_reason TEXT,
    refund_reason TEXT,
    created_at TEXT NOT NULL,
    completed_at TEXT,
    updated_at TEXT NOT NULL
);

-- At most one live (pending or completed) payment per batch and payer
CREATE UNIQUE INDEX IF NOT EXISTS idx_payments_live
    ON payments(batch_id, payer_id)
    WHERE status IN ('pending', 'completed');

CREATE INDEX IF NOT EXISTS idx_payments_payer ON payments(payer_id);
CREATE INDEX IF NOT EXISTS idx_payments_payee ON payments(payee_id);
CREATE INDEX IF NOT EXISTS idx_payments_status ON payments(status);
"#;

const PRODUCTS_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS final_products (
    product_id TEXT PRIMARY KEY NOT NULL,
    industry_id TEXT NOT NULL,
    product_name TEXT NOT NULL,
    brand_name TEXT,
    category TEXT,
    details_json TEXT NOT NULL,
    status TEXT NOT NULL DEFAULT 'in_production',
    scan_url TEXT NOT NULL,
    scan_code TEXT,
    total_scans INTEGER NOT NULL DEFAULT 0,
    last_scanned_at TEXT,
    is_active INTEGER NOT NULL DEFAULT 1,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

-- Source batches, fixed at creation
CREATE TABLE IF NOT EXISTS product_sources (
    product_id TEXT NOT NULL REFERENCES final_products(product_id),
    position INTEGER NOT NULL,
    batch_id TEXT NOT NULL REFERENCES batches(batch_id),
    PRIMARY KEY (product_id, position)
);

-- Snapshot of source batch chains taken at creation
CREATE TABLE IF NOT EXISTS product_trace (
    product_id TEXT NOT NULL REFERENCES final_products(product_id),
    position INTEGER NOT NULL,
    event_id TEXT NOT NULL REFERENCES chain_events(event_id),
    PRIMARY KEY (product_id, position)
);

CREATE INDEX IF NOT EXISTS idx_products_industry ON final_products(industry_id);
CREATE INDEX IF NOT EXISTS idx_products_name ON final_products(product_name);
CREATE INDEX IF NOT EXISTS idx_products_status ON final_products(status);
"#;

/// Chain events keep their core fields forever; chain lists only grow
const IMMUTABILITY_TRIGGERS: &str = r#"
CREATE TRIGGER IF NOT EXISTS chain_events_core_immutable
BEFORE UPDATE OF event_id, batch_id, event_type, performer_id, performer_type,
    performer_name, performer_phone, transaction_json, location_json,
    metadata_json, notes, timestamp
ON chain_events
BEGIN
    SELECT RAISE(ABORT, 'chain event core fields are immutable');
END;

CREATE TRIGGER IF NOT EXISTS chain_events_no_delete
BEFORE DELETE ON chain_events
BEGIN
    SELECT RAISE(ABORT, 'chain events cannot be deleted');
END;

CREATE TRIGGER IF NOT EXISTS batch_chain_no_update
BEFORE UPDATE ON batch_chain
BEGIN
    SELECT RAISE(ABORT, 'batch chain is append-only');
END;

CREATE TRIGGER IF NOT EXISTS batch_chain_no_delete
BEFORE DELETE ON batch_chain
BEGIN
    SELECT RAISE(ABORT, 'batch chain is append-only');
END;

CREATE TRIGGER IF NOT EXISTS product_sources_no_update
BEFORE UPDATE ON product_sources
BEGIN
    SELECT RAISE(ABORT, 'product source batches are fixed');
END;

CREATE TRIGGER IF NOT EXISTS product_trace_no_update
BEFORE UPDATE ON product_trace
BEGIN
    SELECT RAISE(ABORT, 'product traceability chain is a snapshot');
END;
"#;
