//! Payment storage
//!
//! Status changes are conditional updates (`WHERE status = ...`), so a
//! transition that lost a race reports `false` instead of overwriting.

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, ErrorCode, OptionalExtension, Row};
use serde::Deserialize;

use super::models::{format_timestamp, now, CashReceipt, GatewayDetails, Party, Payment};
use super::{json_col, opt_json_col, opt_to_json, opt_ts_col, text_col, to_json, ts_col};
use crate::error::{db_err, LedgerError};

// =============================================================================
// Types
// =============================================================================

/// Settlement data stored when a payment completes
#[derive(Debug, Clone, Default)]
pub struct SettlementRecord {
    pub gateway_payment_id: Option<String>,
    pub gateway_signature: Option<String>,
    pub cash: Option<CashReceipt>,
    pub offline_reference: Option<String>,
    pub proof_urls: Vec<String>,
    pub completed_at: Option<DateTime<Utc>>,
}

/// Which side of a payment a user is on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PaymentDirection {
    Sent,
    Received,
    #[default]
    All,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PaymentQuery {
    #[serde(default, rename = "type")]
    pub direction: PaymentDirection,
    #[serde(default = "default_limit")]
    pub limit: i64,
    #[serde(default)]
    pub offset: i64,
}

impl Default for PaymentQuery {
    fn default() -> Self {
        Self {
            direction: PaymentDirection::All,
            limit: default_limit(),
            offset: 0,
        }
    }
}

fn default_limit() -> i64 {
    20
}

// =============================================================================
// Row Mapping
// =============================================================================

fn payment_from_row(row: &Row) -> Result<Payment, rusqlite::Error> {
    Ok(Payment {
        payment_id: row.get("payment_id")?,
        batch_id: row.get("batch_id")?,
        payer: Party {
            user_id: row.get("payer_id")?,
            user_type: text_col(row, "payer_type")?,
            name: row.get("payer_name")?,
            phone: row.get("payer_phone")?,
        },
        payee: Party {
            user_id: row.get("payee_id")?,
            user_type: text_col(row, "payee_type")?,
            name: row.get("payee_name")?,
            phone: row.get("payee_phone")?,
        },
        amount: row.get("amount")?,
        currency: row.get("currency")?,
        payment_mode: text_col(row, "payment_mode")?,
        status: text_col(row, "status")?,
        gateway: GatewayDetails {
            order_id: row.get("gateway_order_id")?,
            payment_id: row.get("gateway_payment_id")?,
            signature: row.get("gateway_signature")?,
        },
        cash: opt_json_col(row, "cash_json")?,
        offline_reference: row.get("offline_reference")?,
        proof_urls: json_col(row, "proof_urls_json")?,
        failure_reason: row.get("failure_reason")?,
        refund_reason: row.get("refund_reason")?,
        created_at: ts_col(row, "created_at")?,
        completed_at: opt_ts_col(row, "completed_at")?,
        updated_at: ts_col(row, "updated_at")?,
    })
}

fn is_unique_violation(e: &rusqlite::Error) -> bool {
    matches!(
        e,
        rusqlite::Error::SqliteFailure(err, _)
            if err.code == ErrorCode::ConstraintViolation
                && err.extended_code == rusqlite::ffi::SQLITE_CONSTRAINT_UNIQUE
    )
}

// =============================================================================
// Writes
// =============================================================================

/// Insert a new payment.
///
/// A second live payment for the same (batch, payer) hits the partial unique
/// index and comes back as `Conflict`.
pub fn insert_payment(conn: &Connection, payment: &Payment) -> Result<(), LedgerError> {
    conn.execute(
        "INSERT INTO payments (payment_id, batch_id, payer_id, payer_type, payer_name, payer_phone,
            payee_id, payee_type, payee_name, payee_phone, amount, currency, payment_mode, status,
            gateway_order_id, gateway_payment_id, gateway_signature, cash_json, offline_reference,
            proof_urls_json, failure_reason, refund_reason, created_at, completed_at, updated_at)
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        params![
            payment.payment_id,
            payment.batch_id,
            payment.payer.user_id,
            payment.payer.user_type.as_str(),
            payment.payer.name,
            payment.payer.phone,
            payment.payee.user_id,
            payment.payee.user_type.as_str(),
            payment.payee.name,
            payment.payee.phone,
            payment.amount,
            payment.currency,
            payment.payment_mode.as_str(),
            payment.status.as_str(),
            payment.gateway.order_id,
            payment.gateway.payment_id,
            payment.gateway.signature,
            opt_to_json(payment.cash.as_ref())?,
            payment.offline_reference,
            to_json(&payment.proof_urls)?,
            payment.failure_reason,
            payment.refund_reason,
            format_timestamp(&payment.created_at),
            payment.completed_at.as_ref().map(format_timestamp),
            format_timestamp(&payment.updated_at),
        ],
    )
    .map_err(|e| {
        if is_unique_violation(&e) {
            LedgerError::Conflict(format!(
                "Live payment already exists for batch {} and payer {}",
                payment.batch_id, payment.payer.user_id
            ))
        } else {
            LedgerError::Internal(format!("Failed to insert payment: {}", e))
        }
    })?;
    Ok(())
}

/// Store the gateway order handle on a pending payment
pub fn set_gateway_order(conn: &Connection, payment_id: &str, order_id: &str) -> Result<(), LedgerError> {
    conn.execute(
        "UPDATE payments SET gateway_order_id = ?, updated_at = ?
         WHERE payment_id = ? AND status = 'pending'",
        params![order_id, format_timestamp(&now()), payment_id],
    )
    .map_err(db_err("Failed to store gateway order"))?;
    Ok(())
}

/// `pending -> completed`. Returns false if the payment was not pending.
pub fn complete_payment(
    conn: &Connection,
    payment_id: &str,
    settlement: &SettlementRecord,
) -> Result<bool, LedgerError> {
    let completed_at = settlement.completed_at.unwrap_or_else(now);
    let changed = conn
        .execute(
            "UPDATE payments SET status = 'completed',
                gateway_payment_id = COALESCE(?, gateway_payment_id),
                gateway_signature = COALESCE(?, gateway_signature),
                cash_json = COALESCE(?, cash_json),
                offline_reference = COALESCE(?, offline_reference),
                proof_urls_json = ?,
                completed_at = ?, updated_at = ?
             WHERE payment_id = ? AND status = 'pending'",
            params![
                settlement.gateway_payment_id,
                settlement.gateway_signature,
                opt_to_json(settlement.cash.as_ref())?,
                settlement.offline_reference,
                to_json(&settlement.proof_urls)?,
                format_timestamp(&completed_at),
                format_timestamp(&completed_at),
                payment_id,
            ],
        )
        .map_err(db_err("Failed to complete payment"))?;
    Ok(changed == 1)
}

/// `pending -> failed`. Returns false if the payment was not pending.
pub fn mark_failed(conn: &Connection, payment_id: &str, reason: &str) -> Result<bool, LedgerError> {
    let changed = conn
        .execute(
            "UPDATE payments SET status = 'failed', failure_reason = ?, updated_at = ?
             WHERE payment_id = ? AND status = 'pending'",
            params![reason, format_timestamp(&now()), payment_id],
        )
        .map_err(db_err("Failed to mark payment failed"))?;
    Ok(changed == 1)
}

/// `completed -> refunded`. Returns false if the payment was not completed.
pub fn mark_refunded(conn: &Connection, payment_id: &str, reason: &str) -> Result<bool, LedgerError> {
    let changed = conn
        .execute(
            "UPDATE payments SET status = 'refunded', refund_reason = ?, updated_at = ?
             WHERE payment_id = ? AND status = 'completed'",
            params![reason, format_timestamp(&now()), payment_id],
        )
        .map_err(db_err("Failed to refund payment"))?;
    Ok(changed == 1)
}

// =============================================================================
// Reads
// =============================================================================

pub fn get_payment(conn: &Connection, payment_id: &str) -> Result<Option<Payment>, LedgerError> {
    conn.query_row(
        "SELECT * FROM payments WHERE payment_id = ?",
        params![payment_id],
        payment_from_row,
    )
    .optional()
    .map_err(db_err("Failed to get payment"))
}

/// The pending or completed payment for (batch, payer), if any
pub fn find_live(conn: &Connection, batch_id: &str, payer_id: &str) -> Result<Option<Payment>, LedgerError> {
    conn.query_row(
        "SELECT * FROM payments
         WHERE batch_id = ? AND payer_id = ? AND status IN ('pending', 'completed')
         LIMIT 1",
        params![batch_id, payer_id],
        payment_from_row,
    )
    .optional()
    .map_err(db_err("Failed to find live payment"))
}

/// Payments a user sent, received or both, newest first
pub fn list_for_user(
    conn: &Connection,
    user_id: &str,
    query: &PaymentQuery,
) -> Result<Vec<Payment>, LedgerError> {
    let filter = match query.direction {
        PaymentDirection::Sent => "payer_id = ?1",
        PaymentDirection::Received => "payee_id = ?1",
        PaymentDirection::All => "(payer_id = ?1 OR payee_id = ?1)",
    };
    let sql = format!(
        "SELECT * FROM payments WHERE {} ORDER BY created_at DESC, payment_id DESC LIMIT ?2 OFFSET ?3",
        filter
    );

    let mut stmt = conn.prepare(&sql).map_err(db_err("Failed to prepare payment query"))?;
    let payments = stmt
        .query_map(params![user_id, query.limit, query.offset], payment_from_row)
        .map_err(db_err("Failed to query payments"))?
        .collect::<Result<Vec<_>, _>>()
        .map_err(db_err("Failed to read payments"))?;

    Ok(payments)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::batches::{create_batch, NewBatch};
    use crate::db::models::{
        new_batch_id, new_payment_id, ActorSnapshot, ActorType, GpsCoordinates, PaymentMode,
        PaymentStatus, Quantity, QuantityUnit,
    };
    use crate::db::schema::init_schema;

    fn setup() -> (Connection, String) {
        let mut conn = Connection::open_in_memory().unwrap();
        conn.execute_batch("PRAGMA foreign_keys=ON;").unwrap();
        init_schema(&conn).unwrap();

        let batch = NewBatch {
            herb_name: "Brahmi".into(),
            scientific_name: None,
            category: None,
            harvest_date: chrono::NaiveDate::from_ymd_opt(2024, 1, 5).unwrap(),
            quantity: Quantity { value: 10.0, unit: QuantityUnit::Kg },
            gps_coordinates: GpsCoordinates { latitude: 10.0, longitude: 76.0, accuracy: None },
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
        create_batch(&mut conn, &batch, &farmer).unwrap();
        (conn, batch.batch_id)
    }

    fn pending(batch_id: &str, payer: &str) -> Payment {
        let ts = now();
        Payment {
            payment_id: new_payment_id(),
            batch_id: batch_id.into(),
            payer: Party {
                user_id: payer.into(),
                user_type: ActorType::Supplier,
                name: None,
                phone: None,
            },
            payee: Party {
                user_id: "FRM-1".into(),
                user_type: ActorType::Farmer,
                name: None,
                phone: None,
            },
            amount: 250_000,
            currency: "INR".into(),
            payment_mode: PaymentMode::Cash,
            status: PaymentStatus::Pending,
            gateway: GatewayDetails::default(),
            cash: None,
            offline_reference: None,
            proof_urls: vec![],
            failure_reason: None,
            refund_reason: None,
            created_at: ts,
            completed_at: None,
            updated_at: ts,
        }
    }

    #[test]
    fn test_second_live_payment_is_conflict() {
        let (conn, batch_id) = setup();
        insert_payment(&conn, &pending(&batch_id, "SUP-1")).unwrap();

        let err = insert_payment(&conn, &pending(&batch_id, "SUP-1")).unwrap_err();
        assert!(matches!(err, LedgerError::Conflict(_)));

        // A different payer may open its own order
        insert_payment(&conn, &pending(&batch_id, "SUP-2")).unwrap();
    }

    #[test]
    fn test_complete_happens_once() {
        let (conn, batch_id) = setup();
        let payment = pending(&batch_id, "SUP-1");
        insert_payment(&conn, &payment).unwrap();

        let settlement = SettlementRecord {
            cash: Some(CashReceipt {
                received_by: Some("Ramesh".into()),
                ..Default::default()
            }),
            ..Default::default()
        };
        assert!(complete_payment(&conn, &payment.payment_id, &settlement).unwrap());
        assert!(!complete_payment(&conn, &payment.payment_id, &settlement).unwrap());
        assert!(!mark_failed(&conn, &payment.payment_id, "late").unwrap());

        let stored = get_payment(&conn, &payment.payment_id).unwrap().unwrap();
        assert_eq!(stored.status, PaymentStatus::Completed);
        assert!(stored.completed_at.is_some());
        assert_eq!(stored.cash.unwrap().received_by.as_deref(), Some("Ramesh"));
    }

    #[test]
    fn test_failed_payment_frees_the_slot() {
        let (conn, batch_id) = setup();
        let payment = pending(&batch_id, "SUP-1");
        insert_payment(&conn, &payment).unwrap();
        assert!(mark_failed(&conn, &payment.payment_id, "Invalid signature").unwrap());

        assert!(find_live(&conn, &batch_id, "SUP-1").unwrap().is_none());
        insert_payment(&conn, &pending(&batch_id, "SUP-1")).unwrap();
        assert!(find_live(&conn, &batch_id, "SUP-1").unwrap().is_some());
    }

    #[test]
    fn test_refund_requires_completed() {
        let (conn, batch_id) = setup();
        let payment = pending(&batch_id, "SUP-1");
        insert_payment(&conn, &payment).unwrap();

        assert!(!mark_refunded(&conn, &payment.payment_id, "damaged").unwrap());
        complete_payment(&conn, &payment.payment_id, &SettlementRecord::default()).unwrap();
        assert!(mark_refunded(&conn, &payment.payment_id, "damaged").unwrap());

        let stored = get_payment(&conn, &payment.payment_id).unwrap().unwrap();
        assert_eq!(stored.status, PaymentStatus::Refunded);
        assert_eq!(stored.refund_reason.as_deref(), Some("damaged"));
    }

    #[test]
    fn test_list_for_user_by_direction() {
        let (conn, batch_id) = setup();
        insert_payment(&conn, &pending(&batch_id, "SUP-1")).unwrap();

        let sent = PaymentQuery { direction: PaymentDirection::Sent, ..Default::default() };
        let received = PaymentQuery { direction: PaymentDirection::Received, ..Default::default() };

        assert_eq!(list_for_user(&conn, "SUP-1", &sent).unwrap().len(), 1);
        assert!(list_for_user(&conn, "SUP-1", &received).unwrap().is_empty());
        assert_eq!(list_for_user(&conn, "FRM-1", &PaymentQuery::default()).unwrap().len(), 1);
    }
}
