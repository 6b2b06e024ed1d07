//! Settlement service - payment orders and ownership transfer
//!
//! A payment moves a batch from its current owner (the payee) to the payer.
//! Opening an order is idempotent per (batch, payer); settling a payment
//! commits the payment, the new owner and the purchase event in one SQLite
//! transaction, exactly once.
//!
//! The gateway is consulted before the ledger lock is taken. No lock is held
//! across an oracle call.

use std::sync::Arc;

use rusqlite::Connection;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::db::models::{
    new_payment_id, now, ActorType, Batch, BatchStatus, CashReceipt, ChainEvent, EventMetadata,
    GatewayDetails, Owner, Party, Payment, PaymentMode, PaymentStatus, PurchaseDetails,
    TransactionSummary,
};
use crate::db::payments::{PaymentQuery, SettlementRecord};
use crate::db::{batches, chain_events, payments, LedgerDb};
use crate::error::{db_err, LedgerError};
use crate::gateway::{GatewayOrder, PaymentGateway};
use crate::identity::ActorRegistry;

use super::events::{EventBus, LedgerEvent};

/// Failure reason stored when a gateway signature is rejected
pub const INVALID_SIGNATURE: &str = "Invalid signature";

/// Failure reason stored when the batch changed hands before settlement
pub const OWNERSHIP_CHANGED: &str = "Batch ownership changed";

// =============================================================================
// Types
// =============================================================================

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OpenOrderRequest {
    pub batch_id: String,
    pub payer_id: String,
    pub payer_type: ActorType,
    /// Minor units
    pub amount: i64,
    pub payment_mode: PaymentMode,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OpenOrderResult {
    pub payment: Payment,
    /// Present only for a newly opened Razorpay payment
    pub gateway_order: Option<GatewayOrder>,
    /// True when a live payment for (batch, payer) already existed
    pub existing: bool,
}

/// Evidence that a payment happened outside the ledger
#[derive(Debug, Clone)]
pub enum SettlementProof {
    /// Gateway checkout result, verified through the oracle
    Gateway {
        order_id: String,
        payment_id: String,
        signature: String,
    },
    /// Cash receipt, accepted as given
    Cash {
        receipt: CashReceipt,
        proof_urls: Vec<String>,
    },
    /// UPI / bank transfer / cheque reference
    Offline {
        reference: String,
        proof_urls: Vec<String>,
    },
}

impl SettlementProof {
    fn accepts(&self, mode: PaymentMode) -> bool {
        match self {
            SettlementProof::Gateway { .. } => mode == PaymentMode::Razorpay,
            SettlementProof::Cash { .. } => mode == PaymentMode::Cash,
            SettlementProof::Offline { .. } => matches!(
                mode,
                PaymentMode::Upi | PaymentMode::BankTransfer | PaymentMode::Cheque
            ),
        }
    }

    fn kind(&self) -> &'static str {
        match self {
            SettlementProof::Gateway { .. } => "gateway",
            SettlementProof::Cash { .. } => "cash",
            SettlementProof::Offline { .. } => "offline",
        }
    }

    fn into_record(self) -> SettlementRecord {
        match self {
            SettlementProof::Gateway { payment_id, signature, .. } => SettlementRecord {
                gateway_payment_id: Some(payment_id),
                gateway_signature: Some(signature),
                ..Default::default()
            },
            SettlementProof::Cash { receipt, proof_urls } => SettlementRecord {
                cash: Some(receipt),
                proof_urls,
                ..Default::default()
            },
            SettlementProof::Offline { reference, proof_urls } => SettlementRecord {
                offline_reference: Some(reference),
                proof_urls,
                ..Default::default()
            },
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SettlementOutcome {
    pub payment: Payment,
    pub batch: Batch,
    /// The purchase event; absent only if an old settlement left none
    pub chain_event: Option<ChainEvent>,
    /// True when the payment had already been settled by an earlier call
    pub already_settled: bool,
}

enum SettleStep {
    Settled(SettlementOutcome),
    AlreadySettled,
    StalePayee,
}

/// Point inside the settlement transaction where a test can force a failure
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FailPoint {
    AfterPaymentWrite,
    AfterOwnerWrite,
}

// =============================================================================
// Service
// =============================================================================

pub struct SettlementService {
    db: Arc<LedgerDb>,
    registry: Arc<ActorRegistry>,
    gateway: Arc<dyn PaymentGateway>,
    events: Arc<EventBus>,
    currency: String,
    #[cfg(test)]
    fail_point: std::sync::Mutex<Option<FailPoint>>,
}

impl SettlementService {
    pub fn new(
        db: Arc<LedgerDb>,
        registry: Arc<ActorRegistry>,
        gateway: Arc<dyn PaymentGateway>,
        events: Arc<EventBus>,
        currency: impl Into<String>,
    ) -> Self {
        Self {
            db,
            registry,
            gateway,
            events,
            currency: currency.into(),
            #[cfg(test)]
            fail_point: std::sync::Mutex::new(None),
        }
    }

    // =========================================================================
    // Read Operations
    // =========================================================================

    pub fn get_payment(&self, payment_id: &str) -> Result<Payment, LedgerError> {
        self.db
            .with_conn(|conn| payments::get_payment(conn, payment_id))?
            .ok_or_else(|| LedgerError::NotFound(format!("Payment {}", payment_id)))
    }

    /// Payments a user sent, received or both, newest first
    pub fn list_for_user(&self, user_id: &str, query: &PaymentQuery) -> Result<Vec<Payment>, LedgerError> {
        if query.limit <= 0 || query.offset < 0 {
            return Err(LedgerError::InvalidInput("limit must be positive and offset non-negative".into()));
        }
        self.db.with_conn(|conn| payments::list_for_user(conn, user_id, query))
    }

    // =========================================================================
    // Orders
    // =========================================================================

    /// Open a payment for a batch purchase, or return the live one.
    pub async fn open_order(&self, request: OpenOrderRequest) -> Result<OpenOrderResult, LedgerError> {
        if let Some(existing) = self
            .db
            .with_conn(|conn| payments::find_live(conn, &request.batch_id, &request.payer_id))?
        {
            debug!(payment_id = %existing.payment_id, "Returning existing live payment");
            return Ok(self.existing_order(existing));
        }

        if request.amount <= 0 {
            return Err(LedgerError::InvalidInput("amount must be positive".into()));
        }
        if !request.payer_type.can_buy_batch() {
            return Err(LedgerError::Unauthorized(format!(
                "{} cannot purchase batches",
                request.payer_type
            )));
        }

        let (payment, existing) = self.db.with_conn_mut(|conn| self.insert_pending(conn, &request))?;
        if existing {
            return Ok(self.existing_order(payment));
        }

        info!(
            payment_id = %payment.payment_id,
            batch_id = %payment.batch_id,
            mode = %payment.payment_mode,
            amount = payment.amount,
            "Opened payment"
        );

        let mut result = OpenOrderResult { payment, gateway_order: None, existing: false };

        if result.payment.payment_mode == PaymentMode::Razorpay {
            let order = match self
                .gateway
                .create_order(result.payment.amount, &result.payment.payment_id)
                .await
            {
                Ok(order) => order,
                Err(e) => {
                    warn!(payment_id = %result.payment.payment_id, error = %e, "Gateway order failed");
                    self.db.with_conn(|conn| {
                        payments::mark_failed(conn, &result.payment.payment_id, "Gateway order failed")
                    })?;
                    return Err(e);
                }
            };

            self.db.with_conn(|conn| {
                payments::set_gateway_order(conn, &result.payment.payment_id, &order.order_id)
            })?;
            result.payment.gateway.order_id = Some(order.order_id.clone());
            result.gateway_order = Some(order);
        }

        self.events.emit(LedgerEvent::PaymentOpened {
            payment_id: result.payment.payment_id.clone(),
            batch_id: result.payment.batch_id.clone(),
            payment_mode: result.payment.payment_mode,
        });

        Ok(result)
    }

    /// A live payment handed back to a repeated request. Razorpay payments
    /// carry their stored checkout handle; the gateway is not asked again.
    fn existing_order(&self, payment: Payment) -> OpenOrderResult {
        let gateway_order = match (&payment.payment_mode, &payment.gateway.order_id) {
            (PaymentMode::Razorpay, Some(order_id)) => Some(GatewayOrder {
                order_id: order_id.clone(),
                amount: payment.amount,
                currency: payment.currency.clone(),
                receipt: payment.payment_id.clone(),
                key_id: self.gateway.key_id().to_string(),
            }),
            _ => None,
        };
        OpenOrderResult { payment, gateway_order, existing: true }
    }

    /// Validate and insert the pending payment. Returns `(payment, existing)`.
    fn insert_pending(
        &self,
        conn: &mut Connection,
        request: &OpenOrderRequest,
    ) -> Result<(Payment, bool), LedgerError> {
        let tx = conn.transaction().map_err(db_err("Failed to begin transaction"))?;

        if let Some(existing) = payments::find_live(&tx, &request.batch_id, &request.payer_id)? {
            return Ok((existing, true));
        }

        let batch = batches::get_batch(&tx, &request.batch_id)?
            .ok_or_else(|| LedgerError::NotFound(format!("Batch {}", request.batch_id)))?;
        if !batch.is_active {
            return Err(LedgerError::Conflict(format!("Batch {} is inactive", batch.batch_id)));
        }

        let payer = self.registry.require(&tx, &request.payer_id, request.payer_type)?;
        if !payer.approved {
            return Err(LedgerError::Unauthorized(format!("{} {} is not approved", payer.actor_type, payer.id)));
        }
        if batch.is_owned_by(&payer.id, payer.actor_type) {
            return Err(LedgerError::Conflict(format!("{} already owns batch {}", payer.id, batch.batch_id)));
        }

        let owner = &batch.current_owner;
        let payee = match self.registry.lookup(&tx, &owner.owner_id, owner.owner_type)? {
            Some(actor) => actor.party(),
            None => Party {
                user_id: owner.owner_id.clone(),
                user_type: owner.owner_type,
                name: None,
                phone: None,
            },
        };

        let created_at = now();
        let payment = Payment {
            payment_id: new_payment_id(),
            batch_id: batch.batch_id.clone(),
            payer: payer.party(),
            payee,
            amount: request.amount,
            currency: self.currency.clone(),
            payment_mode: request.payment_mode,
            status: PaymentStatus::Pending,
            gateway: GatewayDetails::default(),
            cash: None,
            offline_reference: None,
            proof_urls: Vec::new(),
            failure_reason: None,
            refund_reason: None,
            created_at,
            completed_at: None,
            updated_at: created_at,
        };

        match payments::insert_payment(&tx, &payment) {
            Ok(()) => {}
            Err(LedgerError::Conflict(_)) => {
                if let Some(existing) = payments::find_live(&tx, &request.batch_id, &request.payer_id)? {
                    return Ok((existing, true));
                }
                return Err(LedgerError::Internal("Live payment vanished after conflict".into()));
            }
            Err(e) => return Err(e),
        }

        tx.commit().map_err(db_err("Failed to commit payment"))?;
        Ok((payment, false))
    }

    // =========================================================================
    // Settlement
    // =========================================================================

    /// Settle a pending payment and transfer the batch to the payer.
    ///
    /// Calling this again for a completed payment returns the committed state
    /// with `already_settled` set and changes nothing.
    pub async fn settle_payment(
        &self,
        payment_id: &str,
        proof: SettlementProof,
    ) -> Result<SettlementOutcome, LedgerError> {
        let payment = self.get_payment(payment_id)?;

        match payment.status {
            PaymentStatus::Completed => return self.settled_state(&payment),
            PaymentStatus::Pending => {}
            other => {
                return Err(LedgerError::Conflict(format!("Payment {} is {}", payment_id, other)));
            }
        }

        if !proof.accepts(payment.payment_mode) {
            return Err(LedgerError::InvalidInput(format!(
                "{} proof does not settle a {} payment",
                proof.kind(),
                payment.payment_mode
            )));
        }

        if let SettlementProof::Gateway { order_id, payment_id: gateway_payment_id, signature } = &proof {
            let order_matches = payment.gateway.order_id.as_deref() == Some(order_id.as_str());
            let valid = order_matches
                && self
                    .gateway
                    .verify_signature(order_id, gateway_payment_id, signature)
                    .await?;

            if !valid {
                warn!(payment_id, "Gateway signature rejected");
                let failed = self
                    .db
                    .with_conn(|conn| payments::mark_failed(conn, payment_id, INVALID_SIGNATURE))?;
                if failed {
                    self.events.emit(LedgerEvent::PaymentStatusChanged {
                        payment_id: payment_id.to_string(),
                        status: PaymentStatus::Failed,
                    });
                }
                return Err(LedgerError::InvalidProof(INVALID_SIGNATURE.into()));
            }
        }

        let record = proof.into_record();
        let step = self
            .db
            .with_conn_mut(|conn| self.apply_settlement(conn, &payment, &record))?;

        match step {
            SettleStep::Settled(outcome) => {
                self.emit_settled(&outcome);
                Ok(outcome)
            }
            SettleStep::AlreadySettled => {
                let payment = self.get_payment(payment_id)?;
                self.settled_state(&payment)
            }
            SettleStep::StalePayee => {
                warn!(payment_id, batch_id = %payment.batch_id, "Batch changed owner before settlement");
                self.db
                    .with_conn(|conn| payments::mark_failed(conn, payment_id, OWNERSHIP_CHANGED))?;
                self.events.emit(LedgerEvent::PaymentStatusChanged {
                    payment_id: payment_id.to_string(),
                    status: PaymentStatus::Failed,
                });
                Err(LedgerError::Conflict(format!(
                    "{}: batch {} is no longer held by {}",
                    OWNERSHIP_CHANGED, payment.batch_id, payment.payee.user_id
                )))
            }
        }
    }

    /// The settlement transaction. Dropping `tx` on any early return rolls
    /// everything back.
    fn apply_settlement(
        &self,
        conn: &mut Connection,
        payment: &Payment,
        record: &SettlementRecord,
    ) -> Result<SettleStep, LedgerError> {
        let tx = conn.transaction().map_err(db_err("Failed to begin transaction"))?;

        if !payments::complete_payment(&tx, &payment.payment_id, record)? {
            return match payments::get_payment(&tx, &payment.payment_id)? {
                Some(p) if p.status == PaymentStatus::Completed => Ok(SettleStep::AlreadySettled),
                Some(p) => Err(LedgerError::Conflict(format!(
                    "Payment {} is {}",
                    p.payment_id, p.status
                ))),
                None => Err(LedgerError::NotFound(format!("Payment {}", payment.payment_id))),
            };
        }
        self.check_fail(FailPoint::AfterPaymentWrite)?;

        let batch = batches::get_batch(&tx, &payment.batch_id)?
            .ok_or_else(|| LedgerError::Internal(format!("Batch {} missing for payment", payment.batch_id)))?;
        if !batch.is_owned_by(&payment.payee.user_id, payment.payee.user_type) {
            return Ok(SettleStep::StalePayee);
        }

        let buyer = payment.payer.user_type;
        let target = BatchStatus::for_new_owner(buyer)
            .ok_or_else(|| LedgerError::Internal(format!("{} cannot hold batches", buyer)))?;
        // Status never moves backwards
        let status = if target.rank() < batch.status.rank() { batch.status } else { target };

        let owner = Owner {
            owner_id: payment.payer.user_id.clone(),
            owner_type: buyer,
            acquired_at: now(),
        };
        batches::transfer_owner(&tx, &batch.batch_id, &owner, status)?;
        self.check_fail(FailPoint::AfterOwnerWrite)?;

        let details = PurchaseDetails {
            previous_owner: Some(
                payment
                    .payee
                    .name
                    .clone()
                    .unwrap_or_else(|| payment.payee.user_id.clone()),
            ),
            amount_paid: payment.amount,
            payment_mode: payment.payment_mode,
            received_by: record.cash.as_ref().and_then(|c| c.received_by.clone()),
            witness_name: record.cash.as_ref().and_then(|c| c.witness_name.clone()),
        };
        let metadata = EventMetadata::purchase(buyer, details)
            .ok_or_else(|| LedgerError::Internal(format!("No purchase event for {}", buyer)))?;

        let event = ChainEvent::new(&batch.batch_id, (&payment.payer).into(), metadata).with_transaction(
            TransactionSummary {
                payment_id: payment.payment_id.clone(),
                amount: payment.amount,
                payment_mode: payment.payment_mode,
                payment_status: PaymentStatus::Completed,
            },
        );
        chain_events::record_event(&tx, &event)?;

        let settled = payments::get_payment(&tx, &payment.payment_id)?
            .ok_or_else(|| LedgerError::Internal("Settled payment not readable".into()))?;
        let batch = batches::get_batch(&tx, &batch.batch_id)?
            .ok_or_else(|| LedgerError::Internal("Transferred batch not readable".into()))?;

        tx.commit().map_err(db_err("Failed to commit settlement"))?;

        Ok(SettleStep::Settled(SettlementOutcome {
            payment: settled,
            batch,
            chain_event: Some(event),
            already_settled: false,
        }))
    }

    /// Committed state of a completed payment
    fn settled_state(&self, payment: &Payment) -> Result<SettlementOutcome, LedgerError> {
        self.db.with_conn(|conn| {
            let batch = batches::get_batch(conn, &payment.batch_id)?
                .ok_or_else(|| LedgerError::NotFound(format!("Batch {}", payment.batch_id)))?;
            let chain_event = chain_events::events_for_batch(conn, &payment.batch_id)?
                .into_iter()
                .find(|e| {
                    e.transaction
                        .as_ref()
                        .is_some_and(|t| t.payment_id == payment.payment_id)
                });

            Ok(SettlementOutcome {
                payment: payment.clone(),
                batch,
                chain_event,
                already_settled: true,
            })
        })
    }

    fn emit_settled(&self, outcome: &SettlementOutcome) {
        info!(
            payment_id = %outcome.payment.payment_id,
            batch_id = %outcome.batch.batch_id,
            new_owner = %outcome.batch.current_owner.owner_id,
            "Payment settled, ownership transferred"
        );

        self.events.emit(LedgerEvent::PaymentSettled {
            payment_id: outcome.payment.payment_id.clone(),
            batch_id: outcome.batch.batch_id.clone(),
            amount: outcome.payment.amount,
        });
        self.events.emit(LedgerEvent::OwnershipTransferred {
            batch_id: outcome.batch.batch_id.clone(),
            new_owner_id: outcome.batch.current_owner.owner_id.clone(),
            new_owner_type: outcome.batch.current_owner.owner_type,
            status: outcome.batch.status,
        });
        if let Some(event) = &outcome.chain_event {
            self.events.emit(LedgerEvent::ChainEventAppended {
                batch_id: event.batch_id.clone(),
                event_id: event.event_id.clone(),
                event_type: event.event_type,
            });
        }
    }

    /// Settle a Cash-mode payment with its receipt
    pub async fn complete_cash_payment(
        &self,
        payment_id: &str,
        receipt: CashReceipt,
        proof_urls: Vec<String>,
    ) -> Result<SettlementOutcome, LedgerError> {
        self.settle_payment(payment_id, SettlementProof::Cash { receipt, proof_urls })
            .await
    }

    /// Settle a Razorpay-mode payment with the checkout result
    pub async fn verify_gateway_payment(
        &self,
        payment_id: &str,
        order_id: &str,
        gateway_payment_id: &str,
        signature: &str,
    ) -> Result<SettlementOutcome, LedgerError> {
        self.settle_payment(
            payment_id,
            SettlementProof::Gateway {
                order_id: order_id.to_string(),
                payment_id: gateway_payment_id.to_string(),
                signature: signature.to_string(),
            },
        )
        .await
    }

    /// `completed -> refunded`, requested by the payee. Custody stays with
    /// the payer.
    pub fn refund(&self, payment_id: &str, requested_by: &str, reason: &str) -> Result<Payment, LedgerError> {
        if reason.trim().is_empty() {
            return Err(LedgerError::InvalidInput("refund reason is required".into()));
        }

        let payment = self.db.with_conn(|conn| {
            let payment = payments::get_payment(conn, payment_id)?
                .ok_or_else(|| LedgerError::NotFound(format!("Payment {}", payment_id)))?;
            if payment.payee.user_id != requested_by {
                return Err(LedgerError::Unauthorized("only the payee can refund a payment".into()));
            }
            if !payments::mark_refunded(conn, payment_id, reason.trim())? {
                return Err(LedgerError::Conflict(format!(
                    "Payment {} is {}, only completed payments can be refunded",
                    payment_id, payment.status
                )));
            }
            payments::get_payment(conn, payment_id)?
                .ok_or_else(|| LedgerError::Internal("Refunded payment not readable".into()))
        })?;

        info!(payment_id, "Payment refunded");
        self.events.emit(LedgerEvent::PaymentStatusChanged {
            payment_id: payment_id.to_string(),
            status: PaymentStatus::Refunded,
        });
        Ok(payment)
    }

    // =========================================================================
    // Fault Injection
    // =========================================================================

    #[cfg(test)]
    fn fail_at(&self, point: Option<FailPoint>) {
        if let Ok(mut slot) = self.fail_point.lock() {
            *slot = point;
        }
    }

    #[cfg(test)]
    fn check_fail(&self, point: FailPoint) -> Result<(), LedgerError> {
        let armed = self.fail_point.lock().ok().and_then(|p| *p);
        if armed == Some(point) {
            return Err(LedgerError::Internal("injected failure".into()));
        }
        Ok(())
    }

    #[cfg(not(test))]
    #[inline]
    fn check_fail(&self, _point: FailPoint) -> Result<(), LedgerError> {
        Ok(())
    }
}
