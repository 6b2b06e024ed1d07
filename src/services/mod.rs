//! Service layer for herbtrack
//!
//! Services hold the business rules between HTTP handlers and the ledger
//! store: validation, ownership checks, transaction boundaries and event
//! emission.
//!
//! ## Architecture
//!
//! ```text
//! HTTP Handlers (thin)
//!     ↓
//! Service Layer (business logic, oracle calls)
//!     ↓
//! Repository Layer (db/*.rs)
//!     ↓
//! SQLite Ledger
//! ```

pub mod response;
pub mod events;
pub mod batch_service;
pub mod settlement;
pub mod provenance;
pub mod product_service;

// Re-exports
pub use response::*;
pub use events::{EventBus, EventListener, LedgerEvent};
pub use batch_service::{BatchService, QualityTestRequest};
pub use settlement::{
    OpenOrderRequest, OpenOrderResult, SettlementOutcome, SettlementProof, SettlementService,
};
pub use provenance::{BatchJourney, ProductJourney, ProvenanceService};
pub use product_service::{CreateProductRequest, PackagingOutcome, ProductService};

use std::sync::Arc;

use crate::codes::CodeEncoder;
use crate::db::actors::{Actor, RegisterActorInput};
use crate::db::LedgerDb;
use crate::error::LedgerError;
use crate::gateway::PaymentGateway;
use crate::identity::ActorRegistry;

/// Service container shared by the HTTP handlers
pub struct Services {
    pub db: Arc<LedgerDb>,
    pub registry: Arc<ActorRegistry>,
    pub batches: Arc<BatchService>,
    pub settlement: Arc<SettlementService>,
    pub provenance: Arc<ProvenanceService>,
    pub products: Arc<ProductService>,
    pub events: Arc<EventBus>,
}

impl Services {
    /// Wire every service over one ledger and one event bus
    pub fn new(
        db: Arc<LedgerDb>,
        gateway: Arc<dyn PaymentGateway>,
        encoder: Arc<dyn CodeEncoder>,
        currency: &str,
    ) -> Self {
        let events = Arc::new(EventBus::new());
        let registry = Arc::new(ActorRegistry::standard(db.clone()));

        Self {
            batches: Arc::new(BatchService::new(
                db.clone(),
                registry.clone(),
                encoder.clone(),
                events.clone(),
            )),
            settlement: Arc::new(SettlementService::new(
                db.clone(),
                registry.clone(),
                gateway,
                events.clone(),
                currency,
            )),
            provenance: Arc::new(ProvenanceService::new(db.clone(), registry.clone(), events.clone())),
            products: Arc::new(ProductService::new(db.clone(), registry.clone(), encoder, events.clone())),
            registry,
            events,
            db,
        }
    }

    /// Register an actor and announce it
    pub fn register_actor(&self, input: RegisterActorInput) -> Result<Actor, LedgerError> {
        let actor = self.registry.register(input)?;
        self.events.emit(LedgerEvent::ActorRegistered {
            actor_id: actor.id.clone(),
            actor_type: actor.actor_type,
        });
        Ok(actor)
    }
}
