//! Ledger model definitions
//!
//! Row types for batches, chain events, payments and final products, plus the
//! closed vocabularies (statuses, actor kinds, event types) they use. SQLite
//! stores enums as TEXT via `as_str`/`FromStr`, timestamps as RFC 3339 TEXT,
//! and nested structures as JSON TEXT columns.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, NaiveDate, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ============================================================================
// Timestamp & Identifier Helpers
// ============================================================================

/// Current UTC time truncated to microseconds (the stored precision)
pub fn now() -> DateTime<Utc> {
    let now = Utc::now();
    parse_timestamp(&format_timestamp(&now)).unwrap_or(now)
}

/// Format a timestamp for a TEXT column
pub fn format_timestamp(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Parse a timestamp from a TEXT column
pub fn parse_timestamp(s: &str) -> Result<DateTime<Utc>, chrono::ParseError> {
    DateTime::parse_from_rfc3339(s).map(|ts| ts.with_timezone(&Utc))
}

/// Time-sortable identifier with a readable prefix, e.g. `EVENT-0190F3...`
fn prefixed_id(prefix: &str) -> String {
    format!("{}-{}", prefix, Uuid::now_v7().simple().to_string().to_uppercase())
}

pub fn new_batch_id() -> String {
    prefixed_id("BATCH")
}

pub fn new_event_id() -> String {
    prefixed_id("EVENT")
}

pub fn new_payment_id() -> String {
    prefixed_id("PAY")
}

pub fn new_product_id() -> String {
    prefixed_id("PROD")
}

pub fn new_actor_id(kind: ActorType) -> String {
    let prefix = match kind {
        ActorType::Farmer => "FRM",
        ActorType::Supplier => "SUP",
        ActorType::Industry => "IND",
        ActorType::Consumer => "CON",
    };
    prefixed_id(prefix)
}

// ============================================================================
// Closed Vocabularies
// ============================================================================

/// Error for a TEXT value outside a closed vocabulary
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnknownVariant {
    pub kind: &'static str,
    pub value: String,
}

impl fmt::Display for UnknownVariant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unknown {}: {}", self.kind, self.value)
    }
}

impl std::error::Error for UnknownVariant {}

macro_rules! text_enum {
    (
        $(#[$meta:meta])*
        $name:ident ($label:literal) {
            $($variant:ident => $text:literal),+ $(,)?
        }
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
        pub enum $name {
            $(
                #[serde(rename = $text)]
                $variant,
            )+
        }

        impl $name {
            pub fn as_str(&self) -> &'static str {
                match self {
                    $($name::$variant => $text),+
                }
            }
        }

        impl FromStr for $name {
            type Err = UnknownVariant;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($text => Ok($name::$variant),)+
                    other => Err(UnknownVariant { kind: $label, value: other.to_string() }),
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }
    };
}

text_enum! {
    /// Kind of participant in the supply chain
    ActorType("actor type") {
        Farmer => "Farmer",
        Supplier => "Supplier",
        Industry => "Industry",
        Consumer => "Consumer",
    }
}

impl ActorType {
    /// Kinds that can pay for a batch transfer
    pub fn can_buy_batch(&self) -> bool {
        matches!(self, ActorType::Supplier | ActorType::Industry)
    }
}

text_enum! {
    /// Batch lifecycle, forward-only
    BatchStatus("batch status") {
        Harvested => "harvested",
        WithSupplier => "with_supplier",
        WithIndustry => "with_industry",
        Processed => "processed",
        Packaged => "packaged",
        Sold => "sold",
    }
}

impl BatchStatus {
    /// Position in the forward progression
    pub fn rank(&self) -> u8 {
        match self {
            BatchStatus::Harvested => 0,
            BatchStatus::WithSupplier => 1,
            BatchStatus::WithIndustry => 2,
            BatchStatus::Processed => 3,
            BatchStatus::Packaged => 4,
            BatchStatus::Sold => 5,
        }
    }

    /// Status a batch takes when custody passes to `owner`
    pub fn for_new_owner(owner: ActorType) -> Option<BatchStatus> {
        match owner {
            ActorType::Supplier => Some(BatchStatus::WithSupplier),
            ActorType::Industry => Some(BatchStatus::WithIndustry),
            ActorType::Farmer | ActorType::Consumer => None,
        }
    }
}

text_enum! {
    HerbCategory("herb category") {
        Root => "root",
        Leaf => "leaf",
        Flower => "flower",
        Seed => "seed",
        Bark => "bark",
        Fruit => "fruit",
        WholePlant => "whole_plant",
        Other => "other",
    }
}

text_enum! {
    QuantityUnit("quantity unit") {
        Kg => "kg",
        Quintal => "quintal",
        Ton => "ton",
        Gram => "gram",
    }
}

text_enum! {
    Grade("grade") {
        APlus => "A+",
        A => "A",
        B => "B",
        C => "C",
    }
}

text_enum! {
    /// Closed set of chain event kinds
    EventType("event type") {
        BatchCreated => "BatchCreated",
        SupplierPurchase => "SupplierPurchase",
        IndustryPurchase => "IndustryPurchase",
        QualityTest => "QualityTest",
        Processing => "Processing",
        Packaging => "Packaging",
        ConsumerScan => "ConsumerScan",
    }
}

impl EventType {
    /// Purchase event recorded when `buyer` takes custody
    pub fn purchase_by(buyer: ActorType) -> Option<EventType> {
        match buyer {
            ActorType::Supplier => Some(EventType::SupplierPurchase),
            ActorType::Industry => Some(EventType::IndustryPurchase),
            ActorType::Farmer | ActorType::Consumer => None,
        }
    }
}

text_enum! {
    EventStatus("event status") {
        Active => "active",
        Cancelled => "cancelled",
        Disputed => "disputed",
    }
}

text_enum! {
    /// Payment lifecycle: pending -> completed | failed, completed -> refunded
    PaymentStatus("payment status") {
        Pending => "pending",
        Completed => "completed",
        Failed => "failed",
        Refunded => "refunded",
    }
}

text_enum! {
    PaymentMode("payment mode") {
        Upi => "UPI",
        Cash => "Cash",
        BankTransfer => "Bank Transfer",
        Cheque => "Cheque",
        Razorpay => "Razorpay",
    }
}

text_enum! {
    /// Final product lifecycle, independent of batch status
    ProductStatus("product status") {
        InProduction => "in_production",
        QualityCheck => "quality_check",
        Approved => "approved",
        Distributed => "distributed",
        Recalled => "recalled",
    }
}

impl ProductStatus {
    /// Allowed forward transitions
    pub fn can_transition_to(&self, next: ProductStatus) -> bool {
        use ProductStatus::*;
        matches!(
            (*self, next),
            (InProduction, QualityCheck)
                | (InProduction, Approved)
                | (InProduction, Recalled)
                | (QualityCheck, Approved)
                | (QualityCheck, Recalled)
                | (Approved, Distributed)
                | (Approved, Recalled)
                | (Distributed, Recalled)
        )
    }
}

// ============================================================================
// Batch
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GpsCoordinates {
    pub latitude: f64,
    pub longitude: f64,
    /// Accuracy in meters
    #[serde(default)]
    pub accuracy: Option<f64>,
}

impl GpsCoordinates {
    pub fn is_valid(&self) -> bool {
        (-90.0..=90.0).contains(&self.latitude) && (-180.0..=180.0).contains(&self.longitude)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Address {
    #[serde(default)]
    pub village: Option<String>,
    #[serde(default)]
    pub taluk: Option<String>,
    #[serde(default)]
    pub district: Option<String>,
    #[serde(default)]
    pub state: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Quantity {
    pub value: f64,
    #[serde(default = "default_unit")]
    pub unit: QuantityUnit,
}

fn default_unit() -> QuantityUnit {
    QuantityUnit::Kg
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QualityMetrics {
    /// Percentage
    #[serde(default)]
    pub moisture: Option<f64>,
    /// Percentage
    #[serde(default)]
    pub purity: Option<f64>,
    #[serde(default)]
    pub color: Option<String>,
    #[serde(default)]
    pub aroma: Option<String>,
    #[serde(default)]
    pub grade: Option<Grade>,
    #[serde(default)]
    pub organic_certified: bool,
}

/// Amount in minor units (paise for INR)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Price {
    pub amount: i64,
    pub currency: String,
}

/// Current custodian of a batch
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Owner {
    pub owner_id: String,
    pub owner_type: ActorType,
    pub acquired_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Batch {
    pub batch_id: String,
    pub farmer_id: String,
    pub herb_name: String,
    pub scientific_name: Option<String>,
    pub category: Option<HerbCategory>,
    pub harvest_date: NaiveDate,
    pub quantity: Quantity,
    pub gps_coordinates: GpsCoordinates,
    pub location: Option<Address>,
    pub quality_metrics: Option<QualityMetrics>,
    pub images: Vec<String>,
    pub description: Option<String>,
    pub farmer_price: Option<Price>,
    pub current_owner: Owner,
    pub status: BatchStatus,
    /// Event ids in append order
    pub chain_events: Vec<String>,
    pub final_product: Option<String>,
    pub scan_url: Option<String>,
    pub scan_code: Option<String>,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Batch {
    /// True when `actor` is the current custodian (id and kind both match)
    pub fn is_owned_by(&self, actor_id: &str, actor_type: ActorType) -> bool {
        self.current_owner.owner_id == actor_id && self.current_owner.owner_type == actor_type
    }
}

// ============================================================================
// Chain Event
// ============================================================================

/// Actor identity captured at event time, never re-joined
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActorSnapshot {
    pub actor_id: String,
    pub actor_type: ActorType,
    pub name: Option<String>,
    pub phone: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransactionSummary {
    pub payment_id: String,
    pub amount: i64,
    pub payment_mode: PaymentMode,
    pub payment_status: PaymentStatus,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventLocation {
    #[serde(default)]
    pub gps_coordinates: Option<GpsCoordinates>,
    #[serde(default)]
    pub address: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PurchaseDetails {
    pub previous_owner: Option<String>,
    pub amount_paid: i64,
    pub payment_mode: PaymentMode,
    #[serde(default)]
    pub received_by: Option<String>,
    #[serde(default)]
    pub witness_name: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QualityTestDetails {
    pub lab_name: String,
    #[serde(default)]
    pub test_results: Option<String>,
    #[serde(default)]
    pub grade: Option<Grade>,
    #[serde(default)]
    pub certificate_url: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessingDetails {
    pub final_product_id: String,
    pub product_name: String,
    pub processing_type: String,
    pub manufacturing_date: NaiveDate,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProductReference {
    pub product_id: String,
    pub product_name: String,
}

/// Event payload, one variant per event type
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "eventType", content = "details")]
pub enum EventMetadata {
    BatchCreated {
        #[serde(rename = "herbName")]
        herb_name: String,
        quantity: Quantity,
    },
    SupplierPurchase(PurchaseDetails),
    IndustryPurchase(PurchaseDetails),
    QualityTest(QualityTestDetails),
    Processing(ProcessingDetails),
    Packaging(ProductReference),
    ConsumerScan(ProductReference),
}

impl EventMetadata {
    pub fn event_type(&self) -> EventType {
        match self {
            EventMetadata::BatchCreated { .. } => EventType::BatchCreated,
            EventMetadata::SupplierPurchase(_) => EventType::SupplierPurchase,
            EventMetadata::IndustryPurchase(_) => EventType::IndustryPurchase,
            EventMetadata::QualityTest(_) => EventType::QualityTest,
            EventMetadata::Processing(_) => EventType::Processing,
            EventMetadata::Packaging(_) => EventType::Packaging,
            EventMetadata::ConsumerScan(_) => EventType::ConsumerScan,
        }
    }

    /// Purchase payload for the event type matching `buyer`
    pub fn purchase(buyer: ActorType, details: PurchaseDetails) -> Option<EventMetadata> {
        match EventType::purchase_by(buyer)? {
            EventType::SupplierPurchase => Some(EventMetadata::SupplierPurchase(details)),
            EventType::IndustryPurchase => Some(EventMetadata::IndustryPurchase(details)),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Verification {
    pub verified: bool,
    pub verified_by: Option<String>,
    pub verified_at: Option<DateTime<Utc>>,
    pub proof_url: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChainEvent {
    pub event_id: String,
    pub batch_id: String,
    pub event_type: EventType,
    pub performed_by: ActorSnapshot,
    pub transaction: Option<TransactionSummary>,
    pub location: Option<EventLocation>,
    pub metadata: EventMetadata,
    pub verification: Option<Verification>,
    pub notes: Option<String>,
    pub timestamp: DateTime<Utc>,
    pub status: EventStatus,
}

// ============================================================================
// Payment
// ============================================================================

/// Payer or payee captured on the payment record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Party {
    pub user_id: String,
    pub user_type: ActorType,
    pub name: Option<String>,
    pub phone: Option<String>,
}

impl From<&Party> for ActorSnapshot {
    fn from(p: &Party) -> Self {
        Self {
            actor_id: p.user_id.clone(),
            actor_type: p.user_type,
            name: p.name.clone(),
            phone: p.phone.clone(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GatewayDetails {
    pub order_id: Option<String>,
    pub payment_id: Option<String>,
    pub signature: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CashReceipt {
    #[serde(default)]
    pub received_by: Option<String>,
    #[serde(default)]
    pub receipt_number: Option<String>,
    #[serde(default)]
    pub witness_name: Option<String>,
    #[serde(default)]
    pub witness_phone: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Payment {
    pub payment_id: String,
    pub batch_id: String,
    pub payer: Party,
    pub payee: Party,
    /// Minor units
    pub amount: i64,
    pub currency: String,
    pub payment_mode: PaymentMode,
    pub status: PaymentStatus,
    pub gateway: GatewayDetails,
    pub cash: Option<CashReceipt>,
    /// UPI / bank / cheque reference
    pub offline_reference: Option<String>,
    pub proof_urls: Vec<String>,
    pub failure_reason: Option<String>,
    pub refund_reason: Option<String>,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

// ============================================================================
// Final Product
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Ingredient {
    #[serde(default)]
    pub batch_id: Option<String>,
    pub herb_name: String,
    #[serde(default)]
    pub quantity: Option<Quantity>,
    /// Share of the final product
    #[serde(default)]
    pub percentage: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LabTest {
    pub test_name: String,
    #[serde(default)]
    pub lab_name: Option<String>,
    #[serde(default)]
    pub test_date: Option<NaiveDate>,
    #[serde(default)]
    pub result: Option<String>,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub certificate_url: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Certification {
    pub name: String,
    #[serde(default)]
    pub certificate_number: Option<String>,
    #[serde(default)]
    pub issued_by: Option<String>,
    #[serde(default)]
    pub issued_date: Option<NaiveDate>,
    #[serde(default)]
    pub certificate_url: Option<String>,
}

/// Catalog fields supplied by the manufacturing industry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProductDetails {
    pub product_name: String,
    #[serde(default)]
    pub brand_name: Option<String>,
    #[serde(default)]
    pub product_type: Option<String>,
    #[serde(default)]
    pub category: Option<String>,
    #[serde(default)]
    pub ingredients: Vec<Ingredient>,
    #[serde(default)]
    pub formulation_details: Option<String>,
    pub manufacturing_date: NaiveDate,
    pub expiry_date: NaiveDate,
    #[serde(default)]
    pub lab_tests: Vec<LabTest>,
    #[serde(default)]
    pub certifications: Vec<Certification>,
    #[serde(default)]
    pub fssai_license: Option<String>,
    #[serde(default)]
    pub drug_license: Option<String>,
    #[serde(default)]
    pub ayush_license: Option<String>,
    #[serde(default)]
    pub mrp: Option<Price>,
    #[serde(default)]
    pub product_images: Vec<String>,
    #[serde(default)]
    pub dosage: Option<String>,
    #[serde(default)]
    pub usage_instructions: Option<String>,
    #[serde(default)]
    pub warnings: Vec<String>,
    #[serde(default)]
    pub side_effects: Vec<String>,
    #[serde(default)]
    pub storage_instructions: Option<String>,
    #[serde(default)]
    pub benefits: Vec<String>,
    #[serde(default)]
    pub claims: Vec<String>,
    #[serde(default)]
    pub barcode: Option<String>,
    #[serde(default)]
    pub sku: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FinalProduct {
    pub product_id: String,
    pub industry_id: String,
    /// Fixed at creation
    pub source_batches: Vec<String>,
    /// Snapshot of source batch event ids taken at creation
    pub traceability_chain: Vec<String>,
    pub details: ProductDetails,
    pub status: ProductStatus,
    pub scan_url: String,
    pub scan_code: Option<String>,
    pub total_scans: u64,
    pub last_scanned_at: Option<DateTime<Utc>>,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}
