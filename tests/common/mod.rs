//! Shared fixtures: an on-disk ledger in a temp dir, a mock payment gateway
//! and shortcuts for registering actors and moving batches.

#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::NaiveDate;
use herbtrack::codes::UrlCodeEncoder;
use herbtrack::db::actors::{Actor, RegisterActorInput};
use herbtrack::db::batches::NewBatch;
use herbtrack::db::models::{
    Batch, CashReceipt, GpsCoordinates, PaymentMode, ProductDetails, Quantity, QuantityUnit,
};
use herbtrack::gateway::{GatewayOrder, PaymentGateway};
use herbtrack::services::{OpenOrderRequest, SettlementOutcome};
use herbtrack::{LedgerDb, LedgerError, Services};
use tempfile::TempDir;

pub const SCAN_BASE: &str = "https://trace.example";

/// Gateway that signs as `sig:{order}:{payment}` and counts orders
pub struct MockGateway {
    orders: AtomicUsize,
    accept: AtomicBool,
}

impl MockGateway {
    pub fn new() -> Self {
        Self {
            orders: AtomicUsize::new(0),
            accept: AtomicBool::new(true),
        }
    }

    pub fn signature(order_id: &str, payment_id: &str) -> String {
        format!("sig:{}:{}", order_id, payment_id)
    }

    pub fn orders_created(&self) -> usize {
        self.orders.load(Ordering::SeqCst)
    }

    /// Make every signature check fail
    pub fn reject_all(&self) {
        self.accept.store(false, Ordering::SeqCst);
    }
}

#[async_trait]
impl PaymentGateway for MockGateway {
    fn key_id(&self) -> &str {
        "mock"
    }

    async fn create_order(&self, amount: i64, receipt: &str) -> Result<GatewayOrder, LedgerError> {
        tokio::task::yield_now().await;
        let n = self.orders.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(GatewayOrder {
            order_id: format!("order_mock_{}", n),
            amount,
            currency: "INR".into(),
            receipt: receipt.to_string(),
            key_id: self.key_id().to_string(),
        })
    }

    async fn verify_signature(
        &self,
        order_id: &str,
        payment_id: &str,
        signature: &str,
    ) -> Result<bool, LedgerError> {
        tokio::task::yield_now().await;
        Ok(self.accept.load(Ordering::SeqCst) && signature == Self::signature(order_id, payment_id))
    }
}

pub struct Harness {
    pub services: Arc<Services>,
    pub gateway: Arc<MockGateway>,
    phones: AtomicU32,
    _dir: TempDir,
}

pub fn harness() -> Harness {
    let dir = TempDir::new().unwrap();
    let db = Arc::new(LedgerDb::open(dir.path()).unwrap());
    let gateway = Arc::new(MockGateway::new());
    let encoder = Arc::new(UrlCodeEncoder::new(SCAN_BASE).unwrap());
    let services = Arc::new(Services::new(db, gateway.clone(), encoder, "INR"));

    Harness {
        services,
        gateway,
        phones: AtomicU32::new(0),
        _dir: dir,
    }
}

impl Harness {
    fn next_phone(&self) -> String {
        format!("98{:08}", self.phones.fetch_add(1, Ordering::SeqCst))
    }

    pub fn farmer(&self, name: &str) -> Actor {
        self.services
            .register_actor(RegisterActorInput::Farmer {
                name: name.into(),
                phone: self.next_phone(),
                village: Some("Nanjangud".into()),
                district: Some("Mysuru".into()),
                state: Some("Karnataka".into()),
                approved: true,
            })
            .unwrap()
    }

    pub fn supplier(&self, name: &str) -> Actor {
        self.services
            .register_actor(RegisterActorInput::Supplier {
                name: name.into(),
                phone: self.next_phone(),
                business_name: Some(format!("{} & Sons", name)),
                district: None,
                state: None,
                approved: true,
            })
            .unwrap()
    }

    pub fn industry(&self, name: &str) -> Actor {
        self.services
            .register_actor(RegisterActorInput::Industry {
                industry_name: name.into(),
                phone: self.next_phone(),
                email: Some("qa@vedicroots.example".into()),
                address: Some("Peenya, Bengaluru".into()),
                license_number: Some("AYUSH-42".into()),
                approved: true,
            })
            .unwrap()
    }

    pub fn consumer(&self) -> Actor {
        self.services
            .register_actor(RegisterActorInput::Consumer {
                name: Some("Anita".into()),
                phone: self.next_phone(),
            })
            .unwrap()
    }

    pub fn harvest(&self, farmer: &Actor, herb: &str) -> Batch {
        self.services.batches.create_batch(&farmer.id, new_batch(herb)).unwrap()
    }

    /// Open and settle a cash purchase of `batch_id` by `buyer`
    pub async fn buy_with_cash(&self, batch_id: &str, buyer: &Actor, amount: i64) -> SettlementOutcome {
        let opened = self
            .services
            .settlement
            .open_order(OpenOrderRequest {
                batch_id: batch_id.to_string(),
                payer_id: buyer.id.clone(),
                payer_type: buyer.actor_type,
                amount,
                payment_mode: PaymentMode::Cash,
            })
            .await
            .unwrap();

        self.services
            .settlement
            .complete_cash_payment(
                &opened.payment.payment_id,
                CashReceipt {
                    received_by: Some("Ramesh".into()),
                    receipt_number: Some("R-001".into()),
                    witness_name: None,
                    witness_phone: None,
                },
                vec![],
            )
            .await
            .unwrap()
    }
}

pub fn new_batch(herb: &str) -> NewBatch {
    NewBatch {
        herb_name: herb.into(),
        scientific_name: None,
        category: None,
        harvest_date: NaiveDate::from_ymd_opt(2024, 2, 14).unwrap(),
        quantity: Quantity { value: 40.0, unit: QuantityUnit::Kg },
        gps_coordinates: GpsCoordinates { latitude: 12.12, longitude: 76.68, accuracy: Some(4.0) },
        location: None,
        quality_metrics: None,
        images: vec![],
        description: None,
        farmer_price: None,
    }
}

pub fn product_details(name: &str) -> ProductDetails {
    serde_json::from_value(serde_json::json!({
        "productName": name,
        "brandName": "Vedic Roots",
        "productType": "churna",
        "category": "churna",
        "manufacturingDate": "2024-04-01",
        "expiryDate": "2026-03-31"
    }))
    .unwrap()
}
