//! Product service - assembling final products from owned batches
//!
//! A final product is created by the industry that owns every one of its
//! source batches. Creation snapshots the batches' event lists as the
//! product's traceability chain, then stamps each batch with a `Processing`
//! event, all in one transaction.

use std::collections::HashSet;
use std::sync::Arc;

use rusqlite::Connection;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::codes::{CodeEncoder, ScanKind};
use crate::db::models::{
    new_product_id, now, ActorSnapshot, ActorType, BatchStatus, ChainEvent, EventMetadata, FinalProduct,
    ProcessingDetails, ProductDetails, ProductReference, ProductStatus,
};
use crate::db::products::ProductQuery;
use crate::db::{batches, chain_events, products, LedgerDb};
use crate::error::{db_err, LedgerError};
use crate::identity::ActorRegistry;

use super::events::{EventBus, LedgerEvent};

const DEFAULT_PROCESSING_TYPE: &str = "manufacturing";

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateProductRequest {
    pub industry_id: String,
    pub source_batches: Vec<String>,
    #[serde(flatten)]
    pub details: ProductDetails,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PackagingOutcome {
    pub product: FinalProduct,
    /// Batches moved to `packaged` by this call
    pub packaged_batches: Vec<String>,
    pub events: Vec<ChainEvent>,
}

pub struct ProductService {
    db: Arc<LedgerDb>,
    registry: Arc<ActorRegistry>,
    encoder: Arc<dyn CodeEncoder>,
    events: Arc<EventBus>,
}

impl ProductService {
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

    /// Product record without counting a scan
    pub fn get(&self, product_id: &str) -> Result<FinalProduct, LedgerError> {
        self.db
            .with_conn(|conn| products::get_product(conn, product_id))?
            .ok_or_else(|| LedgerError::NotFound(format!("Product {}", product_id)))
    }

    pub fn list_by_industry(
        &self,
        industry_id: &str,
        status: Option<ProductStatus>,
    ) -> Result<Vec<FinalProduct>, LedgerError> {
        self.db.with_conn(|conn| products::list_by_industry(conn, industry_id, status))
    }

    pub fn search(&self, query: &ProductQuery) -> Result<Vec<FinalProduct>, LedgerError> {
        if query.limit <= 0 || query.offset < 0 {
            return Err(LedgerError::InvalidInput("limit must be positive and offset non-negative".into()));
        }
        self.db.with_conn(|conn| products::search(conn, query))
    }

    // =========================================================================
    // Aggregation
    // =========================================================================

    /// Create a final product from batches the industry currently owns.
    ///
    /// Nothing is written unless every source batch passes the ownership
    /// check.
    pub fn create_final_product(&self, request: CreateProductRequest) -> Result<FinalProduct, LedgerError> {
        let CreateProductRequest { industry_id, source_batches, details } = request;

        if details.product_name.trim().is_empty() {
            return Err(LedgerError::InvalidInput("productName is required".into()));
        }
        if details.expiry_date < details.manufacturing_date {
            return Err(LedgerError::InvalidInput("expiryDate precedes manufacturingDate".into()));
        }
        if source_batches.is_empty() {
            return Err(LedgerError::InvalidInput("at least one source batch is required".into()));
        }
        let mut seen = HashSet::new();
        if let Some(dup) = source_batches.iter().find(|id| !seen.insert(id.as_str())) {
            return Err(LedgerError::InvalidInput(format!("batch {} listed twice", dup)));
        }

        let industry = self.registry.resolve(&industry_id, ActorType::Industry)?;
        if !industry.approved {
            return Err(LedgerError::Unauthorized(format!("Industry {} is not approved", industry.id)));
        }

        let product_id = new_product_id();
        let code = self.encoder.encode(&product_id, ScanKind::Product)?;

        let created_at = now();
        let product = FinalProduct {
            product_id,
            industry_id: industry.id.clone(),
            source_batches,
            traceability_chain: Vec::new(),
            details,
            status: ProductStatus::InProduction,
            scan_url: code.url,
            scan_code: Some(code.rendered),
            total_scans: 0,
            last_scanned_at: None,
            is_active: true,
            created_at,
            updated_at: created_at,
        };

        let (product, processing) = self.db.with_conn_mut(|conn| {
            let tx = conn.transaction().map_err(db_err("Failed to begin transaction"))?;
            let result = assemble_product(&tx, product, &industry.snapshot())?;
            tx.commit().map_err(db_err("Failed to commit product"))?;
            Ok(result)
        })?;

        info!(
            product_id = %product.product_id,
            industry_id = %product.industry_id,
            batches = product.source_batches.len(),
            trace_len = product.traceability_chain.len(),
            "Final product created"
        );

        self.events.emit(LedgerEvent::ProductCreated {
            product_id: product.product_id.clone(),
            industry_id: product.industry_id.clone(),
            source_batches: product.source_batches.len(),
        });
        for event in &processing {
            self.emit_appended(event);
        }

        Ok(product)
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    /// Forward-only status change by the owning industry
    pub fn update_status(
        &self,
        product_id: &str,
        industry_id: &str,
        next: ProductStatus,
    ) -> Result<FinalProduct, LedgerError> {
        let product = self.db.with_conn(|conn| {
            let product = owned_product(conn, product_id, industry_id)?;
            if !product.status.can_transition_to(next) {
                return Err(LedgerError::InvalidInput(format!(
                    "cannot move product from {} to {}",
                    product.status, next
                )));
            }
            if !products::update_status(conn, product_id, product.status, next)? {
                return Err(LedgerError::Conflict(format!("Product {} changed concurrently", product_id)));
            }
            products::get_product(conn, product_id)?
                .ok_or_else(|| LedgerError::Internal("Updated product not readable".into()))
        })?;

        info!(product_id, status = %next, "Product status updated");
        self.events.emit(LedgerEvent::ProductStatusChanged {
            product_id: product_id.to_string(),
            status: next,
        });
        Ok(product)
    }

    /// Move every `processed` source batch to `packaged` with a `Packaging`
    /// event. Batches already past `processed` are left alone.
    pub fn package(&self, product_id: &str, industry_id: &str) -> Result<PackagingOutcome, LedgerError> {
        let outcome = self.db.with_conn_mut(|conn| {
            let tx = conn.transaction().map_err(db_err("Failed to begin transaction"))?;

            let product = owned_product(&tx, product_id, industry_id)?;
            if product.status == ProductStatus::Recalled {
                return Err(LedgerError::Conflict(format!("Product {} was recalled", product_id)));
            }
            let industry = self.registry.require(&tx, industry_id, ActorType::Industry)?;

            let mut packaged_batches = Vec::new();
            let mut events = Vec::new();
            for batch_id in &product.source_batches {
                let batch = batches::get_batch(&tx, batch_id)?
                    .ok_or_else(|| LedgerError::Internal(format!("Source batch {} missing", batch_id)))?;
                if batch.status != BatchStatus::Processed {
                    continue;
                }

                batches::set_status(&tx, batch_id, BatchStatus::Packaged)?;
                let event = ChainEvent::new(
                    batch_id,
                    industry.snapshot(),
                    EventMetadata::Packaging(ProductReference {
                        product_id: product.product_id.clone(),
                        product_name: product.details.product_name.clone(),
                    }),
                );
                chain_events::record_event(&tx, &event)?;
                packaged_batches.push(batch_id.clone());
                events.push(event);
            }

            tx.commit().map_err(db_err("Failed to commit packaging"))?;
            Ok(PackagingOutcome { product, packaged_batches, events })
        })?;

        info!(product_id, batches = outcome.packaged_batches.len(), "Product packaged");
        self.events.emit(LedgerEvent::ProductPackaged {
            product_id: product_id.to_string(),
            batches: outcome.packaged_batches.len(),
        });
        for event in &outcome.events {
            self.emit_appended(event);
        }
        Ok(outcome)
    }

    fn emit_appended(&self, event: &ChainEvent) {
        self.events.emit(LedgerEvent::ChainEventAppended {
            batch_id: event.batch_id.clone(),
            event_id: event.event_id.clone(),
            event_type: event.event_type,
        });
    }
}

/// Ownership checks, trace snapshot, product insert and Processing events.
/// Runs inside the caller's transaction.
fn assemble_product(
    conn: &Connection,
    mut product: FinalProduct,
    industry: &ActorSnapshot,
) -> Result<(FinalProduct, Vec<ChainEvent>), LedgerError> {
    let mut sources = Vec::with_capacity(product.source_batches.len());
    for batch_id in &product.source_batches {
        let batch = batches::get_batch(conn, batch_id)?
            .ok_or_else(|| LedgerError::NotFound(format!("Batch {}", batch_id)))?;
        if !batch.is_owned_by(&product.industry_id, ActorType::Industry) {
            return Err(LedgerError::Conflict(format!(
                "Batch {} is not owned by industry {}",
                batch_id, product.industry_id
            )));
        }
        if !batch.is_active {
            return Err(LedgerError::Conflict(format!("Batch {} is inactive", batch_id)));
        }
        if let Some(existing) = &batch.final_product {
            return Err(LedgerError::Conflict(format!(
                "Batch {} already went into product {}",
                batch_id, existing
            )));
        }
        sources.push(batch);
    }

    // Snapshot before any Processing event is appended
    product.traceability_chain = sources
        .iter()
        .flat_map(|b| b.chain_events.iter().cloned())
        .collect();

    products::insert_product(conn, &product)?;

    let processing_type = product
        .details
        .product_type
        .clone()
        .unwrap_or_else(|| DEFAULT_PROCESSING_TYPE.to_string());

    let mut events = Vec::with_capacity(sources.len());
    for batch in &sources {
        batches::set_final_product(conn, &batch.batch_id, &product.product_id)?;
        let event = ChainEvent::new(
            &batch.batch_id,
            industry.clone(),
            EventMetadata::Processing(ProcessingDetails {
                final_product_id: product.product_id.clone(),
                product_name: product.details.product_name.clone(),
                processing_type: processing_type.clone(),
                manufacturing_date: product.details.manufacturing_date,
            }),
        );
        chain_events::record_event(conn, &event)?;
        events.push(event);
    }

    Ok((product, events))
}

fn owned_product(conn: &Connection, product_id: &str, industry_id: &str) -> Result<FinalProduct, LedgerError> {
    let product = products::get_product(conn, product_id)?
        .ok_or_else(|| LedgerError::NotFound(format!("Product {}", product_id)))?;
    if product.industry_id != industry_id {
        return Err(LedgerError::Unauthorized(format!(
            "Product {} belongs to another industry",
            product_id
        )));
    }
    Ok(product)
}
