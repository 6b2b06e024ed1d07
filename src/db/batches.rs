//! Batch storage
//!
//! A batch row carries the current owner inline; ownership history lives in
//! the chain events. Batches are never deleted, only deactivated.

use chrono::NaiveDate;
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::Deserialize;

use super::chain_events::{chain_ids, record_event};
use super::models::{
    format_timestamp, now, ActorSnapshot, ActorType, Address, Batch, BatchStatus, ChainEvent, EventMetadata,
    GpsCoordinates, HerbCategory, Owner, Price, QualityMetrics, Quantity,
};
use super::{conversion_err, json_col, opt_json_col, opt_to_json, text_col, to_json, ts_col};
use crate::error::{db_err, LedgerError};

// =============================================================================
// Types
// =============================================================================

/// Input for registering a harvested batch
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewBatch {
    pub herb_name: String,
    #[serde(default)]
    pub scientific_name: Option<String>,
    #[serde(default)]
    pub category: Option<HerbCategory>,
    pub harvest_date: NaiveDate,
    pub quantity: Quantity,
    pub gps_coordinates: GpsCoordinates,
    #[serde(default)]
    pub location: Option<Address>,
    #[serde(default)]
    pub quality_metrics: Option<QualityMetrics>,
    #[serde(default)]
    pub images: Vec<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub farmer_price: Option<Price>,
}

impl NewBatch {
    pub fn validate(&self) -> Result<(), LedgerError> {
        if self.herb_name.trim().is_empty() {
            return Err(LedgerError::InvalidInput("herbName is required".into()));
        }
        if !(self.quantity.value > 0.0) {
            return Err(LedgerError::InvalidInput("quantity must be positive".into()));
        }
        if !self.gps_coordinates.is_valid() {
            return Err(LedgerError::InvalidInput("GPS coordinates out of range".into()));
        }
        if let Some(price) = &self.farmer_price {
            if price.amount < 0 {
                return Err(LedgerError::InvalidInput("farmerPrice must not be negative".into()));
            }
        }
        Ok(())
    }

    /// Build the batch record owned by the creating farmer
    pub fn into_batch(
        self,
        batch_id: String,
        farmer_id: &str,
        scan_url: Option<String>,
        scan_code: Option<String>,
    ) -> Batch {
        let created_at = now();
        Batch {
            batch_id,
            farmer_id: farmer_id.to_string(),
            herb_name: self.herb_name.trim().to_string(),
            scientific_name: self.scientific_name,
            category: self.category,
            harvest_date: self.harvest_date,
            quantity: self.quantity,
            gps_coordinates: self.gps_coordinates,
            location: self.location,
            quality_metrics: self.quality_metrics,
            images: self.images,
            description: self.description,
            farmer_price: self.farmer_price,
            current_owner: Owner {
                owner_id: farmer_id.to_string(),
                owner_type: ActorType::Farmer,
                acquired_at: created_at,
            },
            status: BatchStatus::Harvested,
            chain_events: Vec::new(),
            final_product: None,
            scan_url,
            scan_code,
            is_active: true,
            created_at,
            updated_at: created_at,
        }
    }
}

/// Filters for batch search
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct BatchQuery {
    pub herb_name: Option<String>,
    pub status: Option<BatchStatus>,
    pub farmer_id: Option<String>,
    #[serde(default)]
    pub include_inactive: bool,
    #[serde(default = "default_limit")]
    pub limit: i64,
    #[serde(default)]
    pub offset: i64,
}

fn default_limit() -> i64 {
    50
}

// =============================================================================
// Row Mapping
// =============================================================================

fn batch_from_row(row: &Row) -> Result<Batch, rusqlite::Error> {
    let category: Option<String> = row.get("category")?;
    let category = category
        .map(|c| c.parse::<HerbCategory>().map_err(conversion_err))
        .transpose()?;

    Ok(Batch {
        batch_id: row.get("batch_id")?,
        farmer_id: row.get("farmer_id")?,
        herb_name: row.get("herb_name")?,
        scientific_name: row.get("scientific_name")?,
        category,
        harvest_date: text_col(row, "harvest_date")?,
        quantity: Quantity {
            value: row.get("quantity_value")?,
            unit: text_col(row, "quantity_unit")?,
        },
        gps_coordinates: json_col(row, "gps_json")?,
        location: opt_json_col(row, "location_json")?,
        quality_metrics: opt_json_col(row, "quality_json")?,
        images: json_col(row, "images_json")?,
        description: row.get("description")?,
        farmer_price: opt_json_col(row, "farmer_price_json")?,
        current_owner: Owner {
            owner_id: row.get("owner_id")?,
            owner_type: text_col(row, "owner_type")?,
            acquired_at: ts_col(row, "owner_acquired_at")?,
        },
        status: text_col(row, "status")?,
        // Filled from batch_chain by the caller
        chain_events: Vec::new(),
        final_product: row.get("final_product_id")?,
        scan_url: row.get("scan_url")?,
        scan_code: row.get("scan_code")?,
        is_active: row.get::<_, i64>("is_active")? != 0,
        created_at: ts_col(row, "created_at")?,
        updated_at: ts_col(row, "updated_at")?,
    })
}

fn with_chain(conn: &Connection, mut batch: Batch) -> Result<Batch, LedgerError> {
    batch.chain_events = chain_ids(conn, &batch.batch_id)?;
    Ok(batch)
}

fn query_batches(
    conn: &Connection,
    sql: &str,
    params: &[&dyn rusqlite::ToSql],
) -> Result<Vec<Batch>, LedgerError> {
    let mut stmt = conn.prepare(sql).map_err(db_err("Failed to prepare batch query"))?;
    let rows = stmt
        .query_map(params, batch_from_row)
        .map_err(db_err("Failed to query batches"))?
        .collect::<Result<Vec<_>, _>>()
        .map_err(db_err("Failed to read batches"))?;

    rows.into_iter().map(|b| with_chain(conn, b)).collect()
}

// =============================================================================
// Writes
// =============================================================================

/// Insert the batch row only
pub fn insert_batch(conn: &Connection, batch: &Batch) -> Result<(), LedgerError> {
    conn.execute(
        "INSERT INTO batches (batch_id, farmer_id, herb_name, scientific_name, category,
            harvest_date, quantity_value, quantity_unit, gps_json, location_json, quality_json,
            images_json, description, farmer_price_json, owner_id, owner_type, owner_acquired_at,
            status, final_product_id, scan_url, scan_code, is_active, created_at, updated_at)
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        params![
            batch.batch_id,
            batch.farmer_id,
            batch.herb_name,
            batch.scientific_name,
            batch.category.map(|c| c.as_str()),
            batch.harvest_date.to_string(),
            batch.quantity.value,
            batch.quantity.unit.as_str(),
            to_json(&batch.gps_coordinates)?,
            opt_to_json(batch.location.as_ref())?,
            opt_to_json(batch.quality_metrics.as_ref())?,
            to_json(&batch.images)?,
            batch.description,
            opt_to_json(batch.farmer_price.as_ref())?,
            batch.current_owner.owner_id,
            batch.current_owner.owner_type.as_str(),
            format_timestamp(&batch.current_owner.acquired_at),
            batch.status.as_str(),
            batch.final_product,
            batch.scan_url,
            batch.scan_code,
            batch.is_active as i64,
            format_timestamp(&batch.created_at),
            format_timestamp(&batch.updated_at),
        ],
    )
    .map_err(db_err("Failed to insert batch"))?;
    Ok(())
}

/// Insert a batch together with its `BatchCreated` event in one transaction.
///
/// Returns the stored batch (with its one-entry chain) and the event.
pub fn create_batch(
    conn: &mut Connection,
    batch: &Batch,
    farmer: &ActorSnapshot,
) -> Result<(Batch, ChainEvent), LedgerError> {
    let tx = conn.transaction().map_err(db_err("Failed to begin transaction"))?;

    insert_batch(&tx, batch)?;

    let event = ChainEvent::new(
        &batch.batch_id,
        farmer.clone(),
        EventMetadata::BatchCreated {
            herb_name: batch.herb_name.clone(),
            quantity: batch.quantity.clone(),
        },
    );
    record_event(&tx, &event)?;

    tx.commit().map_err(db_err("Failed to commit batch"))?;

    let mut stored = batch.clone();
    stored.chain_events = vec![event.event_id.clone()];
    Ok((stored, event))
}

/// Move custody to `owner`. Fails with `Conflict` if the batch vanished.
pub fn transfer_owner(
    conn: &Connection,
    batch_id: &str,
    owner: &Owner,
    status: BatchStatus,
) -> Result<(), LedgerError> {
    let changed = conn
        .execute(
            "UPDATE batches SET owner_id = ?, owner_type = ?, owner_acquired_at = ?, status = ?,
                updated_at = ?
             WHERE batch_id = ?",
            params![
                owner.owner_id,
                owner.owner_type.as_str(),
                format_timestamp(&owner.acquired_at),
                status.as_str(),
                format_timestamp(&now()),
                batch_id,
            ],
        )
        .map_err(db_err("Failed to transfer batch owner"))?;

    if changed != 1 {
        return Err(LedgerError::Conflict(format!("Batch {} changed during transfer", batch_id)));
    }
    Ok(())
}

pub fn set_status(conn: &Connection, batch_id: &str, status: BatchStatus) -> Result<(), LedgerError> {
    conn.execute(
        "UPDATE batches SET status = ?, updated_at = ? WHERE batch_id = ?",
        params![status.as_str(), format_timestamp(&now()), batch_id],
    )
    .map_err(db_err("Failed to update batch status"))?;
    Ok(())
}

/// Link a batch to the product made from it and mark it processed
pub fn set_final_product(conn: &Connection, batch_id: &str, product_id: &str) -> Result<(), LedgerError> {
    conn.execute(
        "UPDATE batches SET final_product_id = ?, status = ?, updated_at = ? WHERE batch_id = ?",
        params![
            product_id,
            BatchStatus::Processed.as_str(),
            format_timestamp(&now()),
            batch_id
        ],
    )
    .map_err(db_err("Failed to link final product"))?;
    Ok(())
}

/// Soft-deactivate. Returns false if the batch does not exist.
pub fn deactivate(conn: &Connection, batch_id: &str) -> Result<bool, LedgerError> {
    let changed = conn
        .execute(
            "UPDATE batches SET is_active = 0, updated_at = ? WHERE batch_id = ?",
            params![format_timestamp(&now()), batch_id],
        )
        .map_err(db_err("Failed to deactivate batch"))?;
    Ok(changed == 1)
}

// =============================================================================
// Reads
// =============================================================================

pub fn get_batch(conn: &Connection, batch_id: &str) -> Result<Option<Batch>, LedgerError> {
    let batch = conn
        .query_row("SELECT * FROM batches WHERE batch_id = ?", params![batch_id], batch_from_row)
        .optional()
        .map_err(db_err("Failed to get batch"))?;

    batch.map(|b| with_chain(conn, b)).transpose()
}

/// Active batches currently held by `owner_id`, newest first
pub fn list_by_owner(conn: &Connection, owner_id: &str) -> Result<Vec<Batch>, LedgerError> {
    query_batches(
        conn,
        "SELECT * FROM batches WHERE owner_id = ? AND is_active = 1 ORDER BY created_at DESC",
        params![owner_id],
    )
}

/// Every batch a farmer harvested, regardless of current owner
pub fn list_by_farmer(conn: &Connection, farmer_id: &str) -> Result<Vec<Batch>, LedgerError> {
    query_batches(
        conn,
        "SELECT * FROM batches WHERE farmer_id = ? ORDER BY created_at DESC",
        params![farmer_id],
    )
}

pub fn search(conn: &Connection, query: &BatchQuery) -> Result<Vec<Batch>, LedgerError> {
    let mut sql = String::from("SELECT * FROM batches WHERE 1=1");
    let mut params_vec: Vec<Box<dyn rusqlite::ToSql>> = Vec::new();

    if let Some(herb) = &query.herb_name {
        sql.push_str(" AND herb_name LIKE ?");
        params_vec.push(Box::new(format!("%{}%", herb)));
    }
    if let Some(status) = &query.status {
        sql.push_str(" AND status = ?");
        params_vec.push(Box::new(status.as_str()));
    }
    if let Some(farmer_id) = &query.farmer_id {
        sql.push_str(" AND farmer_id = ?");
        params_vec.push(Box::new(farmer_id.clone()));
    }
    if !query.include_inactive {
        sql.push_str(" AND is_active = 1");
    }

    sql.push_str(" ORDER BY created_at DESC LIMIT ? OFFSET ?");
    params_vec.push(Box::new(query.limit));
    params_vec.push(Box::new(query.offset));

    let params_refs: Vec<&dyn rusqlite::ToSql> = params_vec.iter().map(|p| p.as_ref()).collect();
    query_batches(conn, &sql, &params_refs)
}
