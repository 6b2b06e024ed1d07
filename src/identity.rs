//! Actor identity registry
//!
//! Resolves `(actor id, actor kind)` to an [`Actor`] record. Each kind has
//! its own table and its own [`ActorKindStore`] implementation; the registry
//! picks the store by kind, so callers never branch on the table themselves.
//!
//! The registry does not authenticate anyone. Callers pass an actor id they
//! already trust; the registry only answers whether that actor exists, what
//! kind it is and whether it is approved.

use std::sync::Arc;

use rusqlite::Connection;
use tracing::{debug, info};

use crate::db::actors::{
    Actor, ActorKindStore, ConsumerStore, FarmerStore, IndustryStore, RegisterActorInput,
    SupplierStore,
};
use crate::db::models::{new_actor_id, now, ActorSnapshot, ActorType, Party};
use crate::db::LedgerDb;
use crate::error::LedgerError;

impl Actor {
    /// Identity captured on chain events
    pub fn snapshot(&self) -> ActorSnapshot {
        ActorSnapshot {
            actor_id: self.id.clone(),
            actor_type: self.actor_type,
            name: self.name.clone(),
            phone: Some(self.phone.clone()),
        }
    }

    /// Identity captured on payments
    pub fn party(&self) -> Party {
        Party {
            user_id: self.id.clone(),
            user_type: self.actor_type,
            name: self.name.clone(),
            phone: Some(self.phone.clone()),
        }
    }
}

/// Kind-indexed actor lookup
pub struct ActorRegistry {
    db: Arc<LedgerDb>,
    /// Ordered: phone lookups try stores in this order
    stores: Vec<Box<dyn ActorKindStore>>,
}

impl ActorRegistry {
    /// Registry over the four built-in actor tables
    pub fn standard(db: Arc<LedgerDb>) -> Self {
        Self::with_stores(
            db,
            vec![
                Box::new(FarmerStore),
                Box::new(SupplierStore),
                Box::new(IndustryStore),
                Box::new(ConsumerStore),
            ],
        )
    }

    pub fn with_stores(db: Arc<LedgerDb>, stores: Vec<Box<dyn ActorKindStore>>) -> Self {
        Self { db, stores }
    }

    fn store(&self, kind: ActorType) -> Result<&dyn ActorKindStore, LedgerError> {
        self.stores
            .iter()
            .find(|s| s.kind() == kind)
            .map(|s| s.as_ref())
            .ok_or_else(|| LedgerError::Internal(format!("No store registered for {}", kind)))
    }

    /// Look up an actor on an already-held connection (inside a transaction)
    pub fn lookup(
        &self,
        conn: &Connection,
        actor_id: &str,
        kind: ActorType,
    ) -> Result<Option<Actor>, LedgerError> {
        self.store(kind)?.get(conn, actor_id)
    }

    /// Like [`lookup`](Self::lookup) but a missing actor is `NotFound`
    pub fn require(
        &self,
        conn: &Connection,
        actor_id: &str,
        kind: ActorType,
    ) -> Result<Actor, LedgerError> {
        self.lookup(conn, actor_id, kind)?
            .ok_or_else(|| LedgerError::NotFound(format!("{} {}", kind, actor_id)))
    }

    /// Resolve an actor by id and kind
    pub fn resolve(&self, actor_id: &str, kind: ActorType) -> Result<Actor, LedgerError> {
        self.db.with_conn(|conn| self.require(conn, actor_id, kind))
    }

    /// First actor with this phone, trying kinds in registry order
    pub fn find_by_phone(&self, phone: &str) -> Result<Option<Actor>, LedgerError> {
        self.db.with_conn(|conn| {
            for store in &self.stores {
                if let Some(actor) = store.find_by_phone(conn, phone)? {
                    debug!(phone, kind = %actor.actor_type, "Actor matched by phone");
                    return Ok(Some(actor));
                }
            }
            Ok(None)
        })
    }

    /// Register a new actor. A phone already used within the same kind is a
    /// `Conflict`.
    pub fn register(&self, input: RegisterActorInput) -> Result<Actor, LedgerError> {
        let kind = input.actor_type();
        if input.phone().trim().is_empty() {
            return Err(LedgerError::InvalidInput("phone is required".into()));
        }

        let store = self.store(kind)?;
        let actor_id = new_actor_id(kind);

        let actor = self.db.with_conn_mut(|conn| {
            let tx = conn
                .transaction()
                .map_err(|e| LedgerError::Internal(format!("Failed to begin transaction: {}", e)))?;

            if store.find_by_phone(&tx, input.phone())?.is_some() {
                return Err(LedgerError::Conflict(format!(
                    "{} with phone {} already registered",
                    kind,
                    input.phone()
                )));
            }

            store.insert(&tx, &actor_id, &input, &now())?;
            let actor = store
                .get(&tx, &actor_id)?
                .ok_or_else(|| LedgerError::Internal("Registered actor not readable".into()))?;

            tx.commit()
                .map_err(|e| LedgerError::Internal(format!("Failed to commit actor: {}", e)))?;
            Ok(actor)
        })?;

        info!(actor_id = %actor.id, kind = %kind, "Registered actor");
        Ok(actor)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry() -> ActorRegistry {
        ActorRegistry::standard(Arc::new(LedgerDb::open_in_memory().unwrap()))
    }

    fn supplier(phone: &str) -> RegisterActorInput {
        RegisterActorInput::Supplier {
            name: "Kaveri Traders".into(),
            phone: phone.into(),
            business_name: None,
            district: None,
            state: None,
            approved: true,
        }
    }

    #[test]
    fn test_resolve_is_kind_scoped() {
        let registry = registry();
        let actor = registry.register(supplier("9100000000")).unwrap();

        assert_eq!(registry.resolve(&actor.id, ActorType::Supplier).unwrap(), actor);
        assert!(matches!(
            registry.resolve(&actor.id, ActorType::Industry),
            Err(LedgerError::NotFound(_))
        ));
    }

    #[test]
    fn test_duplicate_phone_within_kind() {
        let registry = registry();
        registry.register(supplier("9100000000")).unwrap();
        assert!(matches!(
            registry.register(supplier("9100000000")),
            Err(LedgerError::Conflict(_))
        ));
    }

    #[test]
    fn test_find_by_phone_prefers_registry_order() {
        let registry = registry();
        let consumer = registry
            .register(RegisterActorInput::Consumer { name: None, phone: "9200000000".into() })
            .unwrap();
        let farmer = registry
            .register(RegisterActorInput::Farmer {
                name: "Lakshmi".into(),
                phone: "9200000000".into(),
                village: None,
                district: None,
                state: None,
                approved: true,
            })
            .unwrap();

        let found = registry.find_by_phone("9200000000").unwrap().unwrap();
        assert_eq!(found.id, farmer.id);
        assert_ne!(found.id, consumer.id);
        assert!(registry.find_by_phone("0000").unwrap().is_none());
    }

    #[test]
    fn test_snapshot_captures_identity() {
        let registry = registry();
        let actor = registry.register(supplier("9300000000")).unwrap();
        let snapshot = actor.snapshot();
        assert_eq!(snapshot.actor_type, ActorType::Supplier);
        assert_eq!(snapshot.name.as_deref(), Some("Kaveri Traders"));
        assert_eq!(actor.party().user_id, actor.id);
    }
}
