//! Integration tests for final products and provenance journeys

mod common;

use common::{harness, product_details, Harness};
use herbtrack::db::actors::Actor;
use herbtrack::db::models::{ActorType, Batch, BatchStatus, EventType, PaymentMode, PaymentStatus, ProductStatus};
use herbtrack::services::CreateProductRequest;
use herbtrack::LedgerError;

/// Farmer -> supplier -> industry for one batch
async fn through_supply_chain(h: &Harness, farmer: &Actor, supplier: &Actor, industry: &Actor, herb: &str) -> Batch {
    let batch = h.harvest(farmer, herb);
    h.buy_with_cash(&batch.batch_id, supplier, 250_000).await;
    h.buy_with_cash(&batch.batch_id, industry, 400_000).await.batch
}

fn request(industry: &Actor, batches: &[&Batch]) -> CreateProductRequest {
    CreateProductRequest {
        industry_id: industry.id.clone(),
        source_batches: batches.iter().map(|b| b.batch_id.clone()).collect(),
        details: product_details("Ashwagandha Churna"),
    }
}

#[tokio::test]
async fn test_full_journey_with_consumer_scan() {
    let h = harness();
    let farmer = h.farmer("Ramesh");
    let supplier = h.supplier("Kaveri");
    let industry = h.industry("Vedic Roots");
    let consumer = h.consumer();

    let batch = through_supply_chain(&h, &farmer, &supplier, &industry, "Ashwagandha").await;
    assert_eq!(batch.status, BatchStatus::WithIndustry);
    assert_eq!(batch.chain_events.len(), 3);

    let product = h.services.products.create_final_product(request(&industry, &[&batch])).unwrap();
    assert_eq!(product.status, ProductStatus::InProduction);
    assert!(product.scan_url.starts_with(common::SCAN_BASE));
    // Snapshot excludes the Processing event appended afterwards
    assert_eq!(product.traceability_chain, batch.chain_events);

    let processed = h.services.batches.get(&batch.batch_id).unwrap();
    assert_eq!(processed.status, BatchStatus::Processed);
    assert_eq!(processed.final_product.as_deref(), Some(product.product_id.as_str()));
    assert_eq!(processed.chain_events.len(), 4);

    let journey = h
        .services
        .provenance
        .build_product_journey(&product.product_id, Some(&consumer.id))
        .unwrap();

    assert_eq!(journey.farmers.len(), 1);
    assert_eq!(journey.farmers[0].farmer_id, farmer.id);
    assert_eq!(journey.farmers[0].name.as_deref(), Some("Ramesh"));
    assert_eq!(journey.farmers[0].phone.as_deref(), Some(farmer.phone.as_str()));
    assert_eq!(journey.suppliers.len(), 1);
    assert_eq!(journey.suppliers[0].supplier_id, supplier.id);
    assert_eq!(journey.suppliers[0].phone.as_deref(), Some(supplier.phone.as_str()));
    let paid = journey.suppliers[0].transaction.as_ref().expect("supplier transaction");
    assert_eq!(paid.amount, 250_000);
    assert_eq!(paid.payment_mode, PaymentMode::Cash);
    assert_eq!(paid.payment_status, PaymentStatus::Completed);
    assert!(h.services.settlement.get_payment(&paid.payment_id).is_ok());
    assert_eq!(journey.industry.industry_id, industry.id);
    assert_eq!(journey.industry.name.as_deref(), Some("Vedic Roots"));
    assert_eq!(journey.industry.phone.as_deref(), Some(industry.phone.as_str()));
    assert_eq!(journey.product.total_scans, 1);

    let scan = journey.scan_event.expect("scan event");
    assert_eq!(scan.event_type, EventType::ConsumerScan);
    assert_eq!(scan.batch_id, batch.batch_id);
    assert_eq!(scan.performed_by.actor_id, consumer.id);

    let batch_journey = h.services.provenance.build_batch_journey(&batch.batch_id).unwrap();
    let types: Vec<_> = batch_journey.events.iter().map(|e| e.event_type).collect();
    assert_eq!(
        types,
        vec![
            EventType::BatchCreated,
            EventType::SupplierPurchase,
            EventType::IndustryPurchase,
            EventType::Processing,
            EventType::ConsumerScan,
        ]
    );
    assert_eq!(batch_journey.farmer.map(|f| f.id), Some(farmer.id));
}

#[tokio::test]
async fn test_farmers_are_deduplicated() {
    let h = harness();
    let first = h.farmer("Ramesh");
    let second = h.farmer("Savitha");
    let industry = h.industry("Vedic Roots");

    let mut batches = Vec::new();
    for (farmer, herb) in [(&first, "Brahmi"), (&first, "Tulsi"), (&second, "Neem")] {
        let batch = h.harvest(farmer, herb);
        batches.push(h.buy_with_cash(&batch.batch_id, &industry, 100_000).await.batch);
    }

    let product = h
        .services
        .products
        .create_final_product(request(&industry, &batches.iter().collect::<Vec<_>>()))
        .unwrap();
    assert_eq!(product.traceability_chain.len(), 6);

    let journey = h.services.provenance.build_product_journey(&product.product_id, None).unwrap();
    let farmer_ids: Vec<_> = journey.farmers.iter().map(|f| f.farmer_id.as_str()).collect();
    assert_eq!(farmer_ids, vec![first.id.as_str(), second.id.as_str()]);
    // First batch wins for a repeated farmer
    assert_eq!(journey.farmers[0].herb_name, "Brahmi");
    assert!(journey.suppliers.is_empty());
    assert!(journey.scan_event.is_none());
}

#[tokio::test]
async fn test_scans_are_counted() {
    let h = harness();
    let farmer = h.farmer("Ramesh");
    let industry = h.industry("Vedic Roots");
    let batch = h.harvest(&farmer, "Amla");
    let batch = h.buy_with_cash(&batch.batch_id, &industry, 90_000).await.batch;
    let product = h.services.products.create_final_product(request(&industry, &[&batch])).unwrap();

    let provenance = &h.services.provenance;
    provenance.build_product_journey(&product.product_id, None).unwrap();
    let second = provenance
        .build_product_journey(&product.product_id, Some("walk-in-visitor"))
        .unwrap();

    assert_eq!(second.product.total_scans, 2);
    assert!(second.product.last_scanned_at.is_some());
    // Unknown scanners are recorded by id
    let scan = second.scan_event.unwrap();
    assert_eq!(scan.performed_by.actor_id, "walk-in-visitor");
    assert!(scan.performed_by.name.is_none());

    let err = provenance.build_product_journey("PROD-missing", None).unwrap_err();
    assert!(matches!(err, LedgerError::NotFound(_)));
}

#[tokio::test]
async fn test_blank_scanner_counts_without_chain_event() {
    let h = harness();
    let farmer = h.farmer("Ramesh");
    let industry = h.industry("Vedic Roots");
    let batch = h.harvest(&farmer, "Amla");
    let batch = h.buy_with_cash(&batch.batch_id, &industry, 90_000).await.batch;
    let product = h.services.products.create_final_product(request(&industry, &[&batch])).unwrap();
    let chain_before = h.services.batches.get(&batch.batch_id).unwrap().chain_events.len();

    let provenance = &h.services.provenance;
    let empty = provenance.build_product_journey(&product.product_id, Some("")).unwrap();
    let spaces = provenance.build_product_journey(&product.product_id, Some("   ")).unwrap();

    assert!(empty.scan_event.is_none());
    assert!(spaces.scan_event.is_none());
    assert_eq!(spaces.product.total_scans, 2);
    assert_eq!(
        h.services.batches.get(&batch.batch_id).unwrap().chain_events.len(),
        chain_before
    );
}

#[tokio::test]
async fn test_partial_ownership_writes_nothing() {
    let h = harness();
    let farmer = h.farmer("Ramesh");
    let supplier = h.supplier("Kaveri");
    let industry = h.industry("Vedic Roots");

    let owned = h.harvest(&farmer, "Brahmi");
    let owned = h.buy_with_cash(&owned.batch_id, &industry, 100_000).await.batch;
    let elsewhere = h.harvest(&farmer, "Tulsi");
    let elsewhere = h.buy_with_cash(&elsewhere.batch_id, &supplier, 100_000).await.batch;

    let err = h
        .services
        .products
        .create_final_product(request(&industry, &[&owned, &elsewhere]))
        .unwrap_err();
    assert!(matches!(err, LedgerError::Conflict(_)));

    assert_eq!(h.services.db.stats().unwrap().product_count, 0);
    let owned_after = h.services.batches.get(&owned.batch_id).unwrap();
    assert_eq!(owned_after.status, BatchStatus::WithIndustry);
    assert!(owned_after.final_product.is_none());
    assert_eq!(owned_after.chain_events, owned.chain_events);

    let missing = CreateProductRequest {
        source_batches: vec![owned.batch_id.clone(), "BATCH-missing".into()],
        ..request(&industry, &[])
    };
    let err = h.services.products.create_final_product(missing).unwrap_err();
    assert!(matches!(err, LedgerError::NotFound(_)));

    let duplicated = CreateProductRequest {
        source_batches: vec![owned.batch_id.clone(), owned.batch_id.clone()],
        ..request(&industry, &[])
    };
    let err = h.services.products.create_final_product(duplicated).unwrap_err();
    assert!(matches!(err, LedgerError::InvalidInput(_)));

    let err = h.services.products.create_final_product(request(&industry, &[])).unwrap_err();
    assert!(matches!(err, LedgerError::InvalidInput(_)));
}

#[tokio::test]
async fn test_batch_feeds_only_one_product() {
    let h = harness();
    let farmer = h.farmer("Ramesh");
    let industry = h.industry("Vedic Roots");
    let batch = h.harvest(&farmer, "Shatavari");
    let batch = h.buy_with_cash(&batch.batch_id, &industry, 100_000).await.batch;

    h.services.products.create_final_product(request(&industry, &[&batch])).unwrap();
    let err = h
        .services
        .products
        .create_final_product(request(&industry, &[&batch]))
        .unwrap_err();
    assert!(matches!(err, LedgerError::Conflict(_)));
}

#[tokio::test]
async fn test_chain_is_append_only() {
    let h = harness();
    let farmer = h.farmer("Ramesh");
    let batch = h.harvest(&farmer, "Guduchi");

    let update = h.services.db.with_conn(|conn| {
        conn.execute("UPDATE batch_chain SET position = 7 WHERE batch_id = ?", [&batch.batch_id])
            .map_err(|e| LedgerError::Internal(e.to_string()))
    });
    assert!(update.is_err());

    let delete = h.services.db.with_conn(|conn| {
        conn.execute("DELETE FROM chain_events WHERE batch_id = ?", [&batch.batch_id])
            .map_err(|e| LedgerError::Internal(e.to_string()))
    });
    assert!(delete.is_err());

    let rewrite = h.services.db.with_conn(|conn| {
        conn.execute("UPDATE chain_events SET notes = 'edited' WHERE batch_id = ?", [&batch.batch_id])
            .map_err(|e| LedgerError::Internal(e.to_string()))
    });
    assert!(rewrite.is_err());

    let journey = h.services.provenance.build_batch_journey(&batch.batch_id).unwrap();
    assert_eq!(journey.events.len(), 1);
    assert!(journey.events[0].notes.is_none());
}

#[tokio::test]
async fn test_packaging_and_status_lifecycle() {
    let h = harness();
    let farmer = h.farmer("Ramesh");
    let industry = h.industry("Vedic Roots");
    let rival = h.industry("Himalaya Herbals");
    let batch = h.harvest(&farmer, "Ashwagandha");
    let batch = h.buy_with_cash(&batch.batch_id, &industry, 100_000).await.batch;
    let product = h.services.products.create_final_product(request(&industry, &[&batch])).unwrap();
    let products = &h.services.products;

    let err = products.package(&product.product_id, &rival.id).unwrap_err();
    assert!(matches!(err, LedgerError::Unauthorized(_)));

    let packaged = products.package(&product.product_id, &industry.id).unwrap();
    assert_eq!(packaged.packaged_batches, vec![batch.batch_id.clone()]);
    assert_eq!(packaged.events[0].event_type, EventType::Packaging);
    assert_eq!(h.services.batches.get(&batch.batch_id).unwrap().status, BatchStatus::Packaged);

    // Already packaged batches are skipped
    assert!(products.package(&product.product_id, &industry.id).unwrap().packaged_batches.is_empty());

    let approved = products
        .update_status(&product.product_id, &industry.id, ProductStatus::Approved)
        .unwrap();
    assert_eq!(approved.status, ProductStatus::Approved);

    let err = products
        .update_status(&product.product_id, &industry.id, ProductStatus::InProduction)
        .unwrap_err();
    assert!(matches!(err, LedgerError::InvalidInput(_)));

    products
        .update_status(&product.product_id, &industry.id, ProductStatus::Recalled)
        .unwrap();
    let err = products.package(&product.product_id, &industry.id).unwrap_err();
    assert!(matches!(err, LedgerError::Conflict(_)));

    let listed = products
        .list_by_industry(&industry.id, Some(ProductStatus::Recalled))
        .unwrap();
    assert_eq!(listed.len(), 1);
    assert!(products.list_by_industry(&rival.id, None).unwrap().is_empty());
}

#[tokio::test]
async fn test_refund_keeps_custody() {
    let h = harness();
    let farmer = h.farmer("Ramesh");
    let supplier = h.supplier("Kaveri");
    let batch = h.harvest(&farmer, "Tulsi");
    let outcome = h.buy_with_cash(&batch.batch_id, &supplier, 120_000).await;

    let settlement = &h.services.settlement;
    let err = settlement
        .refund(&outcome.payment.payment_id, &supplier.id, "changed my mind")
        .unwrap_err();
    assert!(matches!(err, LedgerError::Unauthorized(_)));

    let refunded = settlement
        .refund(&outcome.payment.payment_id, &farmer.id, "moisture too high")
        .unwrap();
    assert_eq!(refunded.refund_reason.as_deref(), Some("moisture too high"));

    let batch = h.services.batches.get(&batch.batch_id).unwrap();
    assert!(batch.is_owned_by(&supplier.id, ActorType::Supplier));
}
