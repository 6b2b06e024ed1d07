//! Final product storage
//!
//! Source batches and the traceability snapshot are written once, at
//! creation, into `product_sources` / `product_trace`.

use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::Deserialize;

use super::models::{format_timestamp, now, FinalProduct, ProductStatus};
use super::{json_col, opt_ts_col, text_col, to_json, ts_col};
use crate::error::{db_err, LedgerError};

/// Filters for product search
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProductQuery {
    pub name: Option<String>,
    pub brand: Option<String>,
    pub category: Option<String>,
    pub status: Option<ProductStatus>,
    #[serde(default = "default_limit")]
    pub limit: i64,
    #[serde(default)]
    pub offset: i64,
}

impl Default for ProductQuery {
    fn default() -> Self {
        Self {
            name: None,
            brand: None,
            category: None,
            status: None,
            limit: default_limit(),
            offset: 0,
        }
    }
}

fn default_limit() -> i64 {
    50
}

fn product_from_row(row: &Row) -> Result<FinalProduct, rusqlite::Error> {
    Ok(FinalProduct {
        product_id: row.get("product_id")?,
        industry_id: row.get("industry_id")?,
        source_batches: Vec::new(),
        traceability_chain: Vec::new(),
        details: json_col(row, "details_json")?,
        status: text_col(row, "status")?,
        scan_url: row.get("scan_url")?,
        scan_code: row.get("scan_code")?,
        total_scans: row.get::<_, i64>("total_scans")? as u64,
        last_scanned_at: opt_ts_col(row, "last_scanned_at")?,
        is_active: row.get::<_, i64>("is_active")? != 0,
        created_at: ts_col(row, "created_at")?,
        updated_at: ts_col(row, "updated_at")?,
    })
}

fn ordered_ids(conn: &Connection, sql: &str, product_id: &str) -> Result<Vec<String>, LedgerError> {
    let mut stmt = conn.prepare(sql).map_err(db_err("Failed to prepare product list query"))?;
    let ids = stmt
        .query_map(params![product_id], |row| row.get(0))
        .map_err(db_err("Failed to query product list"))?
        .collect::<Result<Vec<String>, _>>()
        .map_err(db_err("Failed to read product list"))?;
    Ok(ids)
}

fn with_lists(conn: &Connection, mut product: FinalProduct) -> Result<FinalProduct, LedgerError> {
    product.source_batches = ordered_ids(
        conn,
        "SELECT batch_id FROM product_sources WHERE product_id = ? ORDER BY position",
        &product.product_id,
    )?;
    product.traceability_chain = ordered_ids(
        conn,
        "SELECT event_id FROM product_trace WHERE product_id = ? ORDER BY position",
        &product.product_id,
    )?;
    Ok(product)
}

/// Insert the product row with its source batches and trace snapshot
pub fn insert_product(conn: &Connection, product: &FinalProduct) -> Result<(), LedgerError> {
    conn.execute(
        "INSERT INTO final_products (product_id, industry_id, product_name, brand_name, category,
            details_json, status, scan_url, scan_code, total_scans, last_scanned_at, is_active,
            created_at, updated_at)
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        params![
            product.product_id,
            product.industry_id,
            product.details.product_name,
            product.details.brand_name,
            product.details.category,
            to_json(&product.details)?,
            product.status.as_str(),
            product.scan_url,
            product.scan_code,
            product.total_scans as i64,
            product.last_scanned_at.as_ref().map(format_timestamp),
            product.is_active as i64,
            format_timestamp(&product.created_at),
            format_timestamp(&product.updated_at),
        ],
    )
    .map_err(db_err("Failed to insert product"))?;

    for (position, batch_id) in product.source_batches.iter().enumerate() {
        conn.execute(
            "INSERT INTO product_sources (product_id, position, batch_id) VALUES (?, ?, ?)",
            params![product.product_id, position as i64, batch_id],
        )
        .map_err(db_err("Failed to insert product source"))?;
    }

    for (position, event_id) in product.traceability_chain.iter().enumerate() {
        conn.execute(
            "INSERT INTO product_trace (product_id, position, event_id) VALUES (?, ?, ?)",
            params![product.product_id, position as i64, event_id],
        )
        .map_err(db_err("Failed to insert product trace"))?;
    }

    Ok(())
}

pub fn get_product(conn: &Connection, product_id: &str) -> Result<Option<FinalProduct>, LedgerError> {
    let product = conn
        .query_row(
            "SELECT * FROM final_products WHERE product_id = ?",
            params![product_id],
            product_from_row,
        )
        .optional()
        .map_err(db_err("Failed to get product"))?;

    product.map(|p| with_lists(conn, p)).transpose()
}

/// Count one scan. Returns the new total, or None if the product is unknown.
pub fn record_scan(conn: &Connection, product_id: &str) -> Result<Option<u64>, LedgerError> {
    let ts = format_timestamp(&now());
    let changed = conn
        .execute(
            "UPDATE final_products SET total_scans = total_scans + 1, last_scanned_at = ?
             WHERE product_id = ?",
            params![ts, product_id],
        )
        .map_err(db_err("Failed to record scan"))?;

    if changed == 0 {
        return Ok(None);
    }

    let total: i64 = conn
        .query_row(
            "SELECT total_scans FROM final_products WHERE product_id = ?",
            params![product_id],
            |row| row.get(0),
        )
        .map_err(db_err("Failed to read scan count"))?;
    Ok(Some(total as u64))
}

/// Conditional status change; false if the product was no longer in `from`
pub fn update_status(
    conn: &Connection,
    product_id: &str,
    from: ProductStatus,
    to: ProductStatus,
) -> Result<bool, LedgerError> {
    let changed = conn
        .execute(
            "UPDATE final_products SET status = ?, updated_at = ? WHERE product_id = ? AND status = ?",
            params![to.as_str(), format_timestamp(&now()), product_id, from.as_str()],
        )
        .map_err(db_err("Failed to update product status"))?;
    Ok(changed == 1)
}

fn query_products(
    conn: &Connection,
    sql: &str,
    params: &[&dyn rusqlite::ToSql],
) -> Result<Vec<FinalProduct>, LedgerError> {
    let mut stmt = conn.prepare(sql).map_err(db_err("Failed to prepare product query"))?;
    let rows = stmt
        .query_map(params, product_from_row)
        .map_err(db_err("Failed to query products"))?
        .collect::<Result<Vec<_>, _>>()
        .map_err(db_err("Failed to read products"))?;

    rows.into_iter().map(|p| with_lists(conn, p)).collect()
}

/// Products made by an industry, newest first
pub fn list_by_industry(
    conn: &Connection,
    industry_id: &str,
    status: Option<ProductStatus>,
) -> Result<Vec<FinalProduct>, LedgerError> {
    match status {
        Some(status) => query_products(
            conn,
            "SELECT * FROM final_products WHERE industry_id = ? AND status = ?
             ORDER BY created_at DESC",
            params![industry_id, status.as_str()],
        ),
        None => query_products(
            conn,
            "SELECT * FROM final_products WHERE industry_id = ? ORDER BY created_at DESC",
            params![industry_id],
        ),
    }
}

/// Active products matching name / brand substrings and exact category
pub fn search(conn: &Connection, query: &ProductQuery) -> Result<Vec<FinalProduct>, LedgerError> {
    let mut sql = String::from("SELECT * FROM final_products WHERE is_active = 1");
    let mut params_vec: Vec<Box<dyn rusqlite::ToSql>> = Vec::new();

    if let Some(name) = &query.name {
        sql.push_str(" AND product_name LIKE ?");
        params_vec.push(Box::new(format!("%{}%", name)));
    }
    if let Some(brand) = &query.brand {
        sql.push_str(" AND brand_name LIKE ?");
        params_vec.push(Box::new(format!("%{}%", brand)));
    }
    if let Some(category) = &query.category {
        sql.push_str(" AND category = ?");
        params_vec.push(Box::new(category.clone()));
    }
    if let Some(status) = &query.status {
        sql.push_str(" AND status = ?");
        params_vec.push(Box::new(status.as_str()));
    }

    sql.push_str(" ORDER BY created_at DESC LIMIT ? OFFSET ?");
    params_vec.push(Box::new(query.limit));
    params_vec.push(Box::new(query.offset));

    let params_refs: Vec<&dyn rusqlite::ToSql> = params_vec.iter().map(|p| p.as_ref()).collect();
    query_products(conn, &sql, &params_refs)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::batches::{create_batch, NewBatch};
    use crate::db::models::{
        new_batch_id, new_product_id, ActorSnapshot, ActorType, GpsCoordinates, ProductDetails,
        Quantity, QuantityUnit,
    };
    use crate::db::schema::init_schema;
    use chrono::NaiveDate;

    fn details(name: &str) -> ProductDetails {
        serde_json::from_value(serde_json::json!({
            "productName": name,
            "brandName": "Vedic Roots",
            "category": "churna",
            "manufacturingDate": "2024-04-01",
            "expiryDate": "2026-04-01",
        }))
        .unwrap()
    }

    fn setup() -> (Connection, FinalProduct) {
        let mut conn = Connection::open_in_memory().unwrap();
        conn.execute_batch("PRAGMA foreign_keys=ON;").unwrap();
        init_schema(&conn).unwrap();

        let batch = NewBatch {
            herb_name: "Neem".into(),
            scientific_name: None,
            category: None,
            harvest_date: NaiveDate::from_ymd_opt(2024, 1, 1).unwrap(),
            quantity: Quantity { value: 5.0, unit: QuantityUnit::Kg },
            gps_coordinates: GpsCoordinates { latitude: 20.0, longitude: 78.0, accuracy: None },
            location: None,
            quality_metrics: None,
            images: vec![],
            description: None,
            farmer_price: None,
        }
        .into_batch(new_batch_id(), "FRM-1", None, None);
        let farmer = ActorSnapshot {
            actor_id: "FRM-1".into(),
            actor_type: ActorType::Farmer,
            name: None,
            phone: None,
        };
        let (batch, event) = create_batch(&mut conn, &batch, &farmer).unwrap();

        let ts = now();
        let product = FinalProduct {
            product_id: new_product_id(),
            industry_id: "IND-1".into(),
            source_batches: vec![batch.batch_id.clone()],
            traceability_chain: vec![event.event_id],
            details: details("Neem Churna"),
            status: ProductStatus::InProduction,
            scan_url: "http://localhost/scan/product/x".into(),
            scan_code: None,
            total_scans: 0,
            last_scanned_at: None,
            is_active: true,
            created_at: ts,
            updated_at: ts,
        };
        insert_product(&conn, &product).unwrap();
        (conn, product)
    }

    #[test]
    fn test_product_round_trips_lists() {
        let (conn, product) = setup();
        let loaded = get_product(&conn, &product.product_id).unwrap().unwrap();
        assert_eq!(loaded.source_batches, product.source_batches);
        assert_eq!(loaded.traceability_chain, product.traceability_chain);
        assert_eq!(loaded.details.brand_name.as_deref(), Some("Vedic Roots"));
    }

    #[test]
    fn test_scan_counter_is_monotonic() {
        let (conn, product) = setup();
        assert_eq!(record_scan(&conn, &product.product_id).unwrap(), Some(1));
        assert_eq!(record_scan(&conn, &product.product_id).unwrap(), Some(2));
        assert_eq!(record_scan(&conn, "PROD-missing").unwrap(), None);

        let loaded = get_product(&conn, &product.product_id).unwrap().unwrap();
        assert_eq!(loaded.total_scans, 2);
        assert!(loaded.last_scanned_at.is_some());
    }

    #[test]
    fn test_snapshot_lists_are_fixed() {
        let (conn, product) = setup();
        let rewrite = conn.execute(
            "UPDATE product_trace SET event_id = event_id WHERE product_id = ?",
            params![product.product_id],
        );
        assert!(rewrite.is_err());
    }

    #[test]
    fn test_conditional_status_update() {
        let (conn, product) = setup();
        assert!(update_status(&conn, &product.product_id, ProductStatus::InProduction, ProductStatus::Approved).unwrap());
        assert!(!update_status(&conn, &product.product_id, ProductStatus::InProduction, ProductStatus::Recalled).unwrap());

        let approved = list_by_industry(&conn, "IND-1", Some(ProductStatus::Approved)).unwrap();
        assert_eq!(approved.len(), 1);
        assert!(list_by_industry(&conn, "IND-1", Some(ProductStatus::Recalled)).unwrap().is_empty());
    }

    #[test]
    fn test_search_by_name_and_category() {
        let (conn, _) = setup();
        let hit = ProductQuery {
            name: Some("churna".into()),
            category: Some("churna".into()),
            ..Default::default()
        };
        assert_eq!(search(&conn, &hit).unwrap().len(), 1);

        let miss = ProductQuery { brand: Some("Other".into()), ..Default::default() };
        assert!(search(&conn, &miss).unwrap().is_empty());
    }
}
