//! Provenance journeys for batches and final products
//!
//! A batch journey is the batch's event list in append order. A product
//! journey walks the product's fixed source batches and its traceability
//! snapshot to name every farmer and supplier behind it. Building a product
//! journey counts as a scan.

use std::collections::HashSet;
use std::sync::Arc;

use chrono::{DateTime, NaiveDate, Utc};
use rusqlite::Connection;
use serde::Serialize;
use tracing::debug;

use crate::db::actors::Actor;
use crate::db::models::{
    ActorSnapshot, ActorType, Address, Batch, ChainEvent, EventMetadata, EventType, FinalProduct,
    GpsCoordinates, ProductReference, Quantity, TransactionSummary,
};
use crate::db::{batches, chain_events, products, LedgerDb};
use crate::error::{db_err, LedgerError};
use crate::identity::ActorRegistry;

use super::events::{EventBus, LedgerEvent};

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchJourney {
    pub batch: Batch,
    pub farmer: Option<Actor>,
    /// Append order, never re-sorted
    pub events: Vec<ChainEvent>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FarmerOrigin {
    pub farmer_id: String,
    pub name: Option<String>,
    pub phone: Option<String>,
    pub batch_id: String,
    pub herb_name: String,
    pub harvest_date: NaiveDate,
    pub quantity: Quantity,
    pub location: Option<Address>,
    pub gps_coordinates: GpsCoordinates,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SupplierHop {
    pub supplier_id: String,
    pub name: Option<String>,
    pub phone: Option<String>,
    pub batch_id: String,
    pub event_id: String,
    /// The settled payment behind the purchase
    pub transaction: Option<TransactionSummary>,
    pub purchased_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct IndustryInfo {
    pub industry_id: String,
    pub name: Option<String>,
    pub phone: Option<String>,
    pub email: Option<String>,
    pub address: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProductJourney {
    pub product: FinalProduct,
    /// One entry per distinct farmer, first source batch wins
    pub farmers: Vec<FarmerOrigin>,
    /// One entry per supplier purchase in the traceability snapshot
    pub suppliers: Vec<SupplierHop>,
    pub industry: IndustryInfo,
    /// The scan recorded by this call, if the scanner identified itself
    pub scan_event: Option<ChainEvent>,
}

pub struct ProvenanceService {
    db: Arc<LedgerDb>,
    registry: Arc<ActorRegistry>,
    events: Arc<EventBus>,
}

impl ProvenanceService {
    pub fn new(db: Arc<LedgerDb>, registry: Arc<ActorRegistry>, events: Arc<EventBus>) -> Self {
        Self { db, registry, events }
    }

    /// The batch and its events in stored append order
    pub fn build_batch_journey(&self, batch_id: &str) -> Result<BatchJourney, LedgerError> {
        self.db.with_conn(|conn| {
            let batch = batches::get_batch(conn, batch_id)?
                .ok_or_else(|| LedgerError::NotFound(format!("Batch {}", batch_id)))?;
            let farmer = self.registry.lookup(conn, &batch.farmer_id, ActorType::Farmer)?;
            let events = chain_events::events_for_batch(conn, batch_id)?;
            Ok(BatchJourney { batch, farmer, events })
        })
    }

    /// Full provenance of a product. Every call counts one scan; when
    /// `scanned_by` is a non-blank id a `ConsumerScan` event is appended to
    /// the first source batch.
    pub fn build_product_journey(
        &self,
        product_id: &str,
        scanned_by: Option<&str>,
    ) -> Result<ProductJourney, LedgerError> {
        // A blank scanner id records nothing on the chain
        let scanned_by = scanned_by.map(str::trim).filter(|s| !s.is_empty());

        let journey = self.db.with_conn_mut(|conn| {
            let tx = conn.transaction().map_err(db_err("Failed to begin transaction"))?;

            let total = products::record_scan(&tx, product_id)?
                .ok_or_else(|| LedgerError::NotFound(format!("Product {}", product_id)))?;
            let product = products::get_product(&tx, product_id)?
                .ok_or_else(|| LedgerError::Internal("Scanned product not readable".into()))?;
            debug!(product_id, total_scans = total, "Product scanned");

            let scan_event = match (scanned_by, product.source_batches.first()) {
                (Some(scanner), Some(anchor)) => {
                    let event = ChainEvent::new(
                        anchor,
                        self.scanner_snapshot(&tx, scanner)?,
                        EventMetadata::ConsumerScan(ProductReference {
                            product_id: product.product_id.clone(),
                            product_name: product.details.product_name.clone(),
                        }),
                    );
                    chain_events::record_event(&tx, &event)?;
                    Some(event)
                }
                _ => None,
            };

            let journey = self.assemble(&tx, product, scan_event)?;
            tx.commit().map_err(db_err("Failed to commit scan"))?;
            Ok(journey)
        })?;

        self.events.emit(LedgerEvent::ProductScanned {
            product_id: product_id.to_string(),
            total_scans: journey.product.total_scans,
        });
        if let Some(event) = &journey.scan_event {
            self.events.emit(LedgerEvent::ChainEventAppended {
                batch_id: event.batch_id.clone(),
                event_id: event.event_id.clone(),
                event_type: event.event_type,
            });
        }

        Ok(journey)
    }

    /// Consumers are looked up; an unknown scanner is recorded by id only
    fn scanner_snapshot(&self, conn: &Connection, scanner: &str) -> Result<ActorSnapshot, LedgerError> {
        Ok(match self.registry.lookup(conn, scanner, ActorType::Consumer)? {
            Some(consumer) => consumer.snapshot(),
            None => ActorSnapshot {
                actor_id: scanner.to_string(),
                actor_type: ActorType::Consumer,
                name: None,
                phone: None,
            },
        })
    }

    fn assemble(
        &self,
        conn: &Connection,
        product: FinalProduct,
        scan_event: Option<ChainEvent>,
    ) -> Result<ProductJourney, LedgerError> {
        let mut seen = HashSet::new();
        let mut farmers = Vec::new();
        for batch_id in &product.source_batches {
            let batch = batches::get_batch(conn, batch_id)?
                .ok_or_else(|| LedgerError::Internal(format!("Source batch {} missing", batch_id)))?;
            if !seen.insert(batch.farmer_id.clone()) {
                continue;
            }
            let (name, phone) = match self.registry.lookup(conn, &batch.farmer_id, ActorType::Farmer)? {
                Some(farmer) => (farmer.name, Some(farmer.phone)),
                None => (None, None),
            };
            farmers.push(FarmerOrigin {
                farmer_id: batch.farmer_id,
                name,
                phone,
                batch_id: batch.batch_id,
                herb_name: batch.herb_name,
                harvest_date: batch.harvest_date,
                quantity: batch.quantity,
                location: batch.location,
                gps_coordinates: batch.gps_coordinates,
            });
        }

        let suppliers = chain_events::events_by_ids(conn, &product.traceability_chain)?
            .into_iter()
            .filter(|e| {
                e.event_type == EventType::SupplierPurchase
                    && e.performed_by.actor_type == ActorType::Supplier
            })
            .map(|e| SupplierHop {
                supplier_id: e.performed_by.actor_id,
                name: e.performed_by.name,
                phone: e.performed_by.phone,
                batch_id: e.batch_id,
                event_id: e.event_id,
                transaction: e.transaction,
                purchased_at: e.timestamp,
            })
            .collect();

        let industry = match self.registry.lookup(conn, &product.industry_id, ActorType::Industry)? {
            Some(actor) => IndustryInfo {
                industry_id: actor.id,
                name: actor.name,
                phone: Some(actor.phone),
                email: actor.email,
                address: actor.address,
            },
            None => IndustryInfo {
                industry_id: product.industry_id.clone(),
                name: None,
                phone: None,
                email: None,
                address: None,
            },
        };

        Ok(ProductJourney { product, farmers, suppliers, industry, scan_event })
    }
}
