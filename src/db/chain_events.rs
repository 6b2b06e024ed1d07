//! Chain event storage
//!
//! Events are written once and never rewritten; only `status` and
//! `verification` may change afterwards (enforced by schema triggers).
//! The per-batch order lives in `batch_chain`, which is append-only, so a
//! batch history is always read back in the order it was written.

use rusqlite::{params, Connection, OptionalExtension, Row};

use super::models::{
    format_timestamp, new_event_id, now, ActorSnapshot, ChainEvent, EventLocation, EventMetadata,
    EventStatus, TransactionSummary, Verification,
};
use super::{json_col, opt_json_col, opt_to_json, text_col, to_json, ts_col};
use crate::error::{db_err, LedgerError};

impl ChainEvent {
    /// New active event stamped with the current time
    pub fn new(batch_id: &str, performed_by: ActorSnapshot, metadata: EventMetadata) -> Self {
        Self {
            event_id: new_event_id(),
            batch_id: batch_id.to_string(),
            event_type: metadata.event_type(),
            performed_by,
            transaction: None,
            location: None,
            metadata,
            verification: None,
            notes: None,
            timestamp: now(),
            status: EventStatus::Active,
        }
    }

    pub fn with_transaction(mut self, transaction: TransactionSummary) -> Self {
        self.transaction = Some(transaction);
        self
    }

    pub fn with_location(mut self, location: Option<EventLocation>) -> Self {
        self.location = location;
        self
    }

    pub fn with_notes(mut self, notes: Option<String>) -> Self {
        self.notes = notes;
        self
    }
}

const EVENT_COLUMNS: &str = "e.event_id, e.batch_id, e.event_type, e.performer_id, e.performer_type,
    e.performer_name, e.performer_phone, e.transaction_json, e.location_json, e.metadata_json,
    e.verification_json, e.notes, e.timestamp, e.status";

fn event_from_row(row: &Row) -> Result<ChainEvent, rusqlite::Error> {
    Ok(ChainEvent {
        event_id: row.get("event_id")?,
        batch_id: row.get("batch_id")?,
        event_type: text_col(row, "event_type")?,
        performed_by: ActorSnapshot {
            actor_id: row.get("performer_id")?,
            actor_type: text_col(row, "performer_type")?,
            name: row.get("performer_name")?,
            phone: row.get("performer_phone")?,
        },
        transaction: opt_json_col(row, "transaction_json")?,
        location: opt_json_col(row, "location_json")?,
        metadata: json_col(row, "metadata_json")?,
        verification: opt_json_col(row, "verification_json")?,
        notes: row.get("notes")?,
        timestamp: ts_col(row, "timestamp")?,
        status: text_col(row, "status")?,
    })
}

/// Insert the event row without touching any chain list
pub fn insert_event(conn: &Connection, event: &ChainEvent) -> Result<(), LedgerError> {
    conn.execute(
        "INSERT INTO chain_events (event_id, batch_id, event_type, performer_id, performer_type,
            performer_name, performer_phone, transaction_json, location_json, metadata_json,
            verification_json, notes, timestamp, status)
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        params![
            event.event_id,
            event.batch_id,
            event.event_type.as_str(),
            event.performed_by.actor_id,
            event.performed_by.actor_type.as_str(),
            event.performed_by.name,
            event.performed_by.phone,
            opt_to_json(event.transaction.as_ref())?,
            opt_to_json(event.location.as_ref())?,
            to_json(&event.metadata)?,
            opt_to_json(event.verification.as_ref())?,
            event.notes,
            format_timestamp(&event.timestamp),
            event.status.as_str(),
        ],
    )
    .map_err(db_err("Failed to insert chain event"))?;
    Ok(())
}

/// Append an existing event id to the end of a batch's chain.
///
/// Returns the 1-based position it was stored at.
pub fn append_to_chain(conn: &Connection, batch_id: &str, event_id: &str) -> Result<i64, LedgerError> {
    let position: i64 = conn
        .query_row(
            "SELECT COALESCE(MAX(position), 0) + 1 FROM batch_chain WHERE batch_id = ?",
            params![batch_id],
            |row| row.get(0),
        )
        .map_err(db_err("Failed to read chain position"))?;

    conn.execute(
        "INSERT INTO batch_chain (batch_id, position, event_id) VALUES (?, ?, ?)",
        params![batch_id, position, event_id],
    )
    .map_err(db_err("Failed to append to batch chain"))?;

    Ok(position)
}

/// Insert the event and append it to its own batch's chain
pub fn record_event(conn: &Connection, event: &ChainEvent) -> Result<i64, LedgerError> {
    insert_event(conn, event)?;
    append_to_chain(conn, &event.batch_id, &event.event_id)
}

pub fn get_event(conn: &Connection, event_id: &str) -> Result<Option<ChainEvent>, LedgerError> {
    let sql = format!("SELECT {} FROM chain_events e WHERE e.event_id = ?", EVENT_COLUMNS);
    conn.query_row(&sql, params![event_id], event_from_row)
        .optional()
        .map_err(db_err("Failed to get chain event"))
}

/// Event ids of a batch's chain in append order
pub fn chain_ids(conn: &Connection, batch_id: &str) -> Result<Vec<String>, LedgerError> {
    let mut stmt = conn
        .prepare("SELECT event_id FROM batch_chain WHERE batch_id = ? ORDER BY position")
        .map_err(db_err("Failed to prepare chain query"))?;

    let ids = stmt
        .query_map(params![batch_id], |row| row.get(0))
        .map_err(db_err("Failed to query chain"))?
        .collect::<Result<Vec<String>, _>>()
        .map_err(db_err("Failed to read chain"))?;

    Ok(ids)
}

/// Full events of a batch's chain in append order (never by timestamp)
pub fn events_for_batch(conn: &Connection, batch_id: &str) -> Result<Vec<ChainEvent>, LedgerError> {
    let sql = format!(
        "SELECT {} FROM batch_chain c
         JOIN chain_events e ON e.event_id = c.event_id
         WHERE c.batch_id = ? ORDER BY c.position",
        EVENT_COLUMNS
    );
    let mut stmt = conn.prepare(&sql).map_err(db_err("Failed to prepare events query"))?;

    let events = stmt
        .query_map(params![batch_id], event_from_row)
        .map_err(db_err("Failed to query events"))?
        .collect::<Result<Vec<_>, _>>()
        .map_err(db_err("Failed to read events"))?;

    Ok(events)
}

/// Load events by id, preserving the order of `ids`; unknown ids are skipped
pub fn events_by_ids(conn: &Connection, ids: &[String]) -> Result<Vec<ChainEvent>, LedgerError> {
    let mut events = Vec::with_capacity(ids.len());
    for id in ids {
        if let Some(event) = get_event(conn, id)? {
            events.push(event);
        }
    }
    Ok(events)
}

/// Amend the event status. Returns false when the event does not exist.
pub fn set_status(conn: &Connection, event_id: &str, status: EventStatus) -> Result<bool, LedgerError> {
    let changed = conn
        .execute(
            "UPDATE chain_events SET status = ? WHERE event_id = ?",
            params![status.as_str(), event_id],
        )
        .map_err(db_err("Failed to update event status"))?;
    Ok(changed == 1)
}

/// Attach verification data. Returns false when the event does not exist.
pub fn set_verification(
    conn: &Connection,
    event_id: &str,
    verification: &Verification,
) -> Result<bool, LedgerError> {
    let changed = conn
        .execute(
            "UPDATE chain_events SET verification_json = ? WHERE event_id = ?",
            params![to_json(verification)?, event_id],
        )
        .map_err(db_err("Failed to update event verification"))?;
    Ok(changed == 1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::batches::{self, NewBatch};
    use crate::db::models::{new_batch_id, ActorType, GpsCoordinates, ProductReference, Quantity, QuantityUnit};
    use crate::db::schema::init_schema;

    fn setup() -> (Connection, String) {
        let mut conn = Connection::open_in_memory().unwrap();
        conn.execute_batch("PRAGMA foreign_keys=ON;").unwrap();
        init_schema(&conn).unwrap();

        let farmer = ActorSnapshot {
            actor_id: "FRM-1".into(),
            actor_type: ActorType::Farmer,
            name: Some("Ramesh".into()),
            phone: None,
        };
        let input = NewBatch {
            herb_name: "Ashwagandha".into(),
            scientific_name: None,
            category: None,
            harvest_date: chrono::NaiveDate::from_ymd_opt(2024, 3, 1).unwrap(),
            quantity: Quantity { value: 50.0, unit: QuantityUnit::Kg },
            gps_coordinates: GpsCoordinates { latitude: 12.9, longitude: 77.6, accuracy: None },
            location: None,
            quality_metrics: None,
            images: vec![],
            description: None,
            farmer_price: None,
        };
        let batch = input.into_batch(new_batch_id(), "FRM-1", None, None);
        batches::create_batch(&mut conn, &batch, &farmer).unwrap();
        (conn, batch.batch_id)
    }

    fn scan_event(batch_id: &str, name: &str) -> ChainEvent {
        ChainEvent::new(
            batch_id,
            ActorSnapshot {
                actor_id: "CON-1".into(),
                actor_type: ActorType::Consumer,
                name: None,
                phone: None,
            },
            EventMetadata::ConsumerScan(ProductReference {
                product_id: "PROD-1".into(),
                product_name: name.into(),
            }),
        )
    }

    #[test]
    fn test_chain_preserves_append_order() {
        let (conn, batch_id) = setup();

        let first = scan_event(&batch_id, "first");
        let mut second = scan_event(&batch_id, "second");
        // Earlier timestamp must not reorder the chain
        second.timestamp = first.timestamp - chrono::Duration::hours(1);

        assert_eq!(record_event(&conn, &first).unwrap(), 2);
        assert_eq!(record_event(&conn, &second).unwrap(), 3);

        let events = events_for_batch(&conn, &batch_id).unwrap();
        assert_eq!(events.len(), 3);
        assert_eq!(events[1].event_id, first.event_id);
        assert_eq!(events[2].event_id, second.event_id);
        assert_eq!(chain_ids(&conn, &batch_id).unwrap()[2], second.event_id);
    }

    #[test]
    fn test_core_fields_are_immutable() {
        let (conn, batch_id) = setup();
        let event = scan_event(&batch_id, "x");
        record_event(&conn, &event).unwrap();

        let rewrite = conn.execute(
            "UPDATE chain_events SET metadata_json = '{}' WHERE event_id = ?",
            params![event.event_id],
        );
        assert!(rewrite.is_err());

        let delete = conn.execute("DELETE FROM chain_events WHERE event_id = ?", params![event.event_id]);
        assert!(delete.is_err());

        let truncate = conn.execute("DELETE FROM batch_chain WHERE batch_id = ?", params![batch_id]);
        assert!(truncate.is_err());
    }

    #[test]
    fn test_status_and_verification_can_be_amended() {
        let (conn, batch_id) = setup();
        let event = scan_event(&batch_id, "x");
        record_event(&conn, &event).unwrap();

        assert!(set_status(&conn, &event.event_id, EventStatus::Disputed).unwrap());
        assert!(set_verification(
            &conn,
            &event.event_id,
            &Verification {
                verified: true,
                verified_by: Some("IND-1".into()),
                verified_at: Some(now()),
                proof_url: None,
            },
        )
        .unwrap());

        let stored = get_event(&conn, &event.event_id).unwrap().unwrap();
        assert_eq!(stored.status, EventStatus::Disputed);
        assert!(stored.verification.unwrap().verified);
        assert_eq!(stored.metadata, event.metadata);

        assert!(!set_status(&conn, "EVENT-missing", EventStatus::Cancelled).unwrap());
    }
}
