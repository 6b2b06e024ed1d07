//! Batch service - harvest registration, custody queries and batch events
//!
//! Only the current owner may act on a batch (quality tests, deactivation).
//! Ownership itself changes only through settlement.

use std::sync::Arc;

use serde::Deserialize;
use tracing::info;

use crate::codes::{CodeEncoder, ScanKind};
use crate::db::batches::{BatchQuery, NewBatch};
use crate::db::models::{
    new_batch_id, now, ActorType, Batch, ChainEvent, EventLocation, EventMetadata, EventStatus, Grade,
    QualityTestDetails, Verification,
};
use crate::db::{batches, chain_events, LedgerDb};
use crate::error::{db_err, LedgerError};
use crate::identity::ActorRegistry;

use super::events::{EventBus, LedgerEvent};

/// Quality test recorded by the current owner
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QualityTestRequest {
    pub actor_id: String,
    pub actor_type: ActorType,
    pub lab_name: String,
    #[serde(default)]
    pub test_results: Option<String>,
    #[serde(default)]
    pub grade: Option<Grade>,
    #[serde(default)]
    pub certificate_url: Option<String>,
    #[serde(default)]
    pub location: Option<EventLocation>,
    #[serde(default)]
    pub notes: Option<String>,
}

pub struct BatchService {
    db: Arc<LedgerDb>,
    registry: Arc<ActorRegistry>,
    encoder: Arc<dyn CodeEncoder>,
    events: Arc<EventBus>,
}

impl BatchService {
    pub fn new(
        db: Arc<LedgerDb>,
        registry: Arc<ActorRegistry>,
        encoder: Arc<dyn CodeEncoder>,
        events: Arc<EventBus>,
    ) -> Self {
        Self { db, registry, encoder, events }
    }

    // =========================================================================
    // Read Operations
    // =========================================================================

    pub fn get(&self, batch_id: &str) -> Result<Batch, LedgerError> {
        self.db
            .with_conn(|conn| batches::get_batch(conn, batch_id))?
            .ok_or_else(|| LedgerError::NotFound(format!("Batch {}", batch_id)))
    }

    /// Active batches currently held by an actor
    pub fn list_by_owner(&self, owner_id: &str) -> Result<Vec<Batch>, LedgerError> {
        self.db.with_conn(|conn| batches::list_by_owner(conn, owner_id))
    }

    /// Every batch a farmer harvested
    pub fn list_by_farmer(&self, farmer_id: &str) -> Result<Vec<Batch>, LedgerError> {
        self.db.with_conn(|conn| batches::list_by_farmer(conn, farmer_id))
    }

    pub fn search(&self, query: &BatchQuery) -> Result<Vec<Batch>, LedgerError> {
        if query.limit <= 0 || query.offset < 0 {
            return Err(LedgerError::InvalidInput("limit must be positive and offset non-negative".into()));
        }
        self.db.with_conn(|conn| batches::search(conn, query))
    }

    // =========================================================================
    // Write Operations
    // =========================================================================

    /// Register a harvested batch. The `BatchCreated` event is the first
    /// chain entry and is written in the same transaction.
    pub fn create_batch(&self, farmer_id: &str, input: NewBatch) -> Result<Batch, LedgerError> {
        input.validate()?;

        let farmer = self.registry.resolve(farmer_id, ActorType::Farmer)?;
        if !farmer.approved {
            return Err(LedgerError::Unauthorized(format!("Farmer {} is not approved", farmer.id)));
        }

        let batch_id = new_batch_id();
        let code = self.encoder.encode(&batch_id, ScanKind::Batch)?;
        let batch = input.into_batch(batch_id, &farmer.id, Some(code.url), Some(code.rendered));

        let (batch, event) = self
            .db
            .with_conn_mut(|conn| batches::create_batch(conn, &batch, &farmer.snapshot()))?;

        info!(batch_id = %batch.batch_id, farmer_id = %farmer.id, herb = %batch.herb_name, "Batch created");

        self.events.emit(LedgerEvent::BatchCreated {
            batch_id: batch.batch_id.clone(),
            farmer_id: farmer.id.clone(),
            herb_name: batch.herb_name.clone(),
        });
        self.emit_appended(&event);

        Ok(batch)
    }

    /// Record a lab result on a batch. Status does not change.
    pub fn record_quality_test(
        &self,
        batch_id: &str,
        request: QualityTestRequest,
    ) -> Result<ChainEvent, LedgerError> {
        if request.lab_name.trim().is_empty() {
            return Err(LedgerError::InvalidInput("labName is required".into()));
        }

        let event = self.db.with_conn_mut(|conn| {
            // Owner check and append share one transaction
            let tx = conn.transaction().map_err(db_err("Failed to begin transaction"))?;
            let batch = batches::get_batch(&tx, batch_id)?
                .ok_or_else(|| LedgerError::NotFound(format!("Batch {}", batch_id)))?;
            if !batch.is_active {
                return Err(LedgerError::Conflict(format!("Batch {} is inactive", batch_id)));
            }
            if !batch.is_owned_by(&request.actor_id, request.actor_type) {
                return Err(LedgerError::Unauthorized(
                    "only the current owner can record a quality test".into(),
                ));
            }

            let actor = self.registry.require(&tx, &request.actor_id, request.actor_type)?;
            let event = ChainEvent::new(
                batch_id,
                actor.snapshot(),
                EventMetadata::QualityTest(QualityTestDetails {
                    lab_name: request.lab_name.trim().to_string(),
                    test_results: request.test_results.clone(),
                    grade: request.grade,
                    certificate_url: request.certificate_url.clone(),
                }),
            )
            .with_location(request.location.clone())
            .with_notes(request.notes.clone());

            chain_events::record_event(&tx, &event)?;
            tx.commit().map_err(db_err("Failed to commit quality test"))?;
            Ok(event)
        })?;

        self.emit_appended(&event);
        Ok(event)
    }

    /// Soft-deactivate a batch; current owner only
    pub fn deactivate(&self, batch_id: &str, actor_id: &str, actor_type: ActorType) -> Result<Batch, LedgerError> {
        let batch = self.db.with_conn(|conn| {
            let batch = batches::get_batch(conn, batch_id)?
                .ok_or_else(|| LedgerError::NotFound(format!("Batch {}", batch_id)))?;
            if !batch.is_owned_by(actor_id, actor_type) {
                return Err(LedgerError::Unauthorized("only the current owner can deactivate a batch".into()));
            }
            batches::deactivate(conn, batch_id)?;
            batches::get_batch(conn, batch_id)?
                .ok_or_else(|| LedgerError::Internal("Deactivated batch not readable".into()))
        })?;

        info!(batch_id, "Batch deactivated");
        self.events.emit(LedgerEvent::BatchDeactivated { batch_id: batch_id.to_string() });
        Ok(batch)
    }

    // =========================================================================
    // Event Amendments
    // =========================================================================

    /// Mark an event cancelled or disputed (or active again)
    pub fn set_event_status(&self, event_id: &str, status: EventStatus) -> Result<ChainEvent, LedgerError> {
        self.db.with_conn(|conn| {
            if !chain_events::set_status(conn, event_id, status)? {
                return Err(LedgerError::NotFound(format!("Event {}", event_id)));
            }
            chain_events::get_event(conn, event_id)?
                .ok_or_else(|| LedgerError::Internal("Amended event not readable".into()))
        })
    }

    /// Attach verification data to an event
    pub fn verify_event(
        &self,
        event_id: &str,
        verified_by: &str,
        proof_url: Option<String>,
    ) -> Result<ChainEvent, LedgerError> {
        let verification = Verification {
            verified: true,
            verified_by: Some(verified_by.to_string()),
            verified_at: Some(now()),
            proof_url,
        };
        self.db.with_conn(|conn| {
            if !chain_events::set_verification(conn, event_id, &verification)? {
                return Err(LedgerError::NotFound(format!("Event {}", event_id)));
            }
            chain_events::get_event(conn, event_id)?
                .ok_or_else(|| LedgerError::Internal("Amended event not readable".into()))
        })
    }

    fn emit_appended(&self, event: &ChainEvent) {
        self.events.emit(LedgerEvent::ChainEventAppended {
            batch_id: event.batch_id.clone(),
            event_id: event.event_id.clone(),
            event_type: event.event_type,
        });
    }
}
