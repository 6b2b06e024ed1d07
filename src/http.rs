//! HTTP API for the ledger
//!
//! JSON in, [`ApiResponse`](crate::services::ApiResponse) envelopes out.
//!
//! ## Actors
//! - `POST /actors` - register a farmer, supplier, industry or consumer
//! - `GET /actors/phone/{phone}` - first actor with this phone
//!
//! ## Batches
//! - `POST /batches` - farmer registers a harvest
//! - `GET /batches/search?herbName=&status=&farmerId=&limit=&offset=`
//! - `GET /batches/owner/{owner_id}` / `GET /batches/farmer/{farmer_id}`
//! - `GET /batches/{id}` / `GET /batches/{id}/journey`
//! - `POST /batches/{id}/quality-tests` / `POST /batches/{id}/deactivate`
//! - `PATCH /events/{id}/status` / `POST /events/{id}/verification`
//!
//! ## Payments
//! - `POST /payments/orders` - open (or return the live) order
//! - `POST /payments/verify` / `POST /payments/cash` / `POST /payments/offline`
//! - `POST /payments/{id}/refund`
//! - `GET /payments/{id}` / `GET /payments/user/{user_id}?type=sent|received|all`
//!
//! ## Products
//! - `POST /products`
//! - `GET /products/scan/{id}?scannedBy=` - journey, counts a scan
//! - `PATCH /products/{id}/status` / `POST /products/{id}/package`
//! - `GET /products/industry/{industry_id}?status=`
//! - `GET /products/search?name=&brand=&category=`
//! - `GET /products/{id}`
//!
//! ```bash
//! curl -X POST http://localhost:8095/payments/orders \
//!      -H 'Content-Type: application/json' \
//!      -d '{"batchId":"BATCH-...","payerId":"SUP-...","payerType":"Supplier","amount":250000,"paymentMode":"Cash"}'
//! ```

use std::collections::HashMap;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::str::FromStr;
use std::sync::Arc;

use bytes::Bytes;
use http_body_util::{BodyExt, Full, Limited};
use hyper::body::Body;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response};
use hyper_util::rt::TokioIo;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use tokio::net::TcpListener;
use tracing::{debug, info, warn};

use crate::db::actors::RegisterActorInput;
use crate::db::batches::{BatchQuery, NewBatch};
use crate::db::models::{ActorType, CashReceipt, EventStatus, ProductStatus};
use crate::db::payments::{PaymentDirection, PaymentQuery};
use crate::db::products::ProductQuery;
use crate::error::LedgerError;
use crate::services::response::{
    error_response, from_create_result, from_result, method_not_allowed, not_found,
};
use crate::services::{
    CreateProductRequest, OpenOrderRequest, QualityTestRequest, Services, SettlementProof,
};

/// Largest accepted request body
const MAX_BODY_BYTES: usize = 1024 * 1024;

type HttpResponse = Response<Full<Bytes>>;

// =============================================================================
// Request Bodies
// =============================================================================

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CreateBatchBody {
    farmer_id: String,
    #[serde(flatten)]
    batch: NewBatch,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ActorRef {
    actor_id: String,
    actor_type: ActorType,
}

#[derive(Debug, Deserialize)]
struct EventStatusBody {
    status: EventStatus,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct VerifyEventBody {
    verified_by: String,
    #[serde(default)]
    proof_url: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct VerifyPaymentBody {
    payment_id: String,
    razorpay_order_id: String,
    razorpay_payment_id: String,
    razorpay_signature: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CashPaymentBody {
    payment_id: String,
    #[serde(flatten)]
    receipt: CashReceipt,
    #[serde(default)]
    proof_images: Vec<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct OfflinePaymentBody {
    payment_id: String,
    reference: String,
    #[serde(default)]
    proof_urls: Vec<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RefundBody {
    requested_by: String,
    reason: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ProductStatusBody {
    industry_id: String,
    status: ProductStatus,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct IndustryRef {
    industry_id: String,
}

// =============================================================================
// Server
// =============================================================================

/// HTTP server state
pub struct HttpServer {
    services: Arc<Services>,
    bind_addr: SocketAddr,
}

impl HttpServer {
    pub fn new(services: Arc<Services>, bind_addr: SocketAddr) -> Self {
        Self { services, bind_addr }
    }

    /// Run the HTTP server
    pub async fn run(self: Arc<Self>) -> Result<(), LedgerError> {
        let listener = TcpListener::bind(self.bind_addr).await?;
        info!(addr = %self.bind_addr, "HTTP server listening");

        loop {
            let (stream, remote_addr) = listener.accept().await?;
            let io = TokioIo::new(stream);
            let server = self.clone();

            tokio::spawn(async move {
                let service = service_fn(move |req| {
                    let server = server.clone();
                    async move { Ok::<_, Infallible>(server.handle(req).await) }
                });

                if let Err(err) = http1::Builder::new().serve_connection(io, service).await {
                    warn!(addr = %remote_addr, error = %err, "Connection error");
                }
            });
        }
    }

    /// Route one request
    pub async fn handle<B>(&self, req: Request<B>) -> HttpResponse
    where
        B: Body,
        B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        let method = req.method().clone();
        let path = req.uri().path().to_string();
        let query = parse_query(req.uri().query());

        debug!(method = %method, path = %path, "Incoming request");

        let segments: Vec<&str> = path.trim_matches('/').split('/').collect();
        let s = &self.services;

        match (&method, segments.as_slice()) {
            (&Method::GET, ["health"]) => from_result("Ledger is healthy", s.db.stats()),

            // Actors
            (&Method::POST, ["actors"]) => match read_json::<RegisterActorInput, _>(req).await {
                Ok(input) => from_create_result("Actor registered", s.register_actor(input)),
                Err(e) => error_response(e),
            },
            (&Method::GET, ["actors", "phone", phone]) => match s.registry.find_by_phone(phone) {
                Ok(Some(actor)) => from_result("Actor found", Ok(actor)),
                Ok(None) => not_found("No actor with this phone"),
                Err(e) => error_response(e),
            },

            // Batches
            (&Method::POST, ["batches"]) => match read_json::<CreateBatchBody, _>(req).await {
                Ok(body) => from_create_result(
                    "Batch created",
                    s.batches.create_batch(&body.farmer_id, body.batch),
                ),
                Err(e) => error_response(e),
            },
            (&Method::GET, ["batches", "search"]) => match batch_query(&query) {
                Ok(q) => from_result("Batches found", s.batches.search(&q)),
                Err(e) => error_response(e),
            },
            (&Method::GET, ["batches", "owner", owner_id]) => {
                from_result("Batches found", s.batches.list_by_owner(owner_id))
            }
            (&Method::GET, ["batches", "farmer", farmer_id]) => {
                from_result("Batches found", s.batches.list_by_farmer(farmer_id))
            }
            (&Method::GET, ["batches", id]) => from_result("Batch found", s.batches.get(id)),
            (&Method::GET, ["batches", id, "journey"]) => {
                from_result("Batch journey", s.provenance.build_batch_journey(id))
            }
            (&Method::POST, ["batches", id, "quality-tests"]) => {
                match read_json::<QualityTestRequest, _>(req).await {
                    Ok(body) => from_create_result(
                        "Quality test recorded",
                        s.batches.record_quality_test(id, body),
                    ),
                    Err(e) => error_response(e),
                }
            }
            (&Method::POST, ["batches", id, "deactivate"]) => match read_json::<ActorRef, _>(req).await {
                Ok(body) => from_result(
                    "Batch deactivated",
                    s.batches.deactivate(id, &body.actor_id, body.actor_type),
                ),
                Err(e) => error_response(e),
            },
            (&Method::PATCH, ["events", id, "status"]) => match read_json::<EventStatusBody, _>(req).await {
                Ok(body) => from_result("Event updated", s.batches.set_event_status(id, body.status)),
                Err(e) => error_response(e),
            },
            (&Method::POST, ["events", id, "verification"]) => {
                match read_json::<VerifyEventBody, _>(req).await {
                    Ok(body) => from_result(
                        "Event verified",
                        s.batches.verify_event(id, &body.verified_by, body.proof_url),
                    ),
                    Err(e) => error_response(e),
                }
            }

            // Payments
            (&Method::POST, ["payments", "orders"]) => match read_json::<OpenOrderRequest, _>(req).await {
                Ok(body) => match s.settlement.open_order(body).await {
                    Ok(result) if result.existing => from_result("Payment already exists", Ok(result)),
                    result => from_create_result("Payment order created", result),
                },
                Err(e) => error_response(e),
            },
            (&Method::POST, ["payments", "verify"]) => match read_json::<VerifyPaymentBody, _>(req).await {
                Ok(body) => from_result(
                    "Payment verified and ownership transferred",
                    s.settlement
                        .verify_gateway_payment(
                            &body.payment_id,
                            &body.razorpay_order_id,
                            &body.razorpay_payment_id,
                            &body.razorpay_signature,
                        )
                        .await,
                ),
                Err(e) => error_response(e),
            },
            (&Method::POST, ["payments", "cash"]) => match read_json::<CashPaymentBody, _>(req).await {
                Ok(body) => from_result(
                    "Cash payment completed and ownership transferred",
                    s.settlement
                        .complete_cash_payment(&body.payment_id, body.receipt, body.proof_images)
                        .await,
                ),
                Err(e) => error_response(e),
            },
            (&Method::POST, ["payments", "offline"]) => {
                match read_json::<OfflinePaymentBody, _>(req).await {
                    Ok(body) => from_result(
                        "Payment completed and ownership transferred",
                        s.settlement
                            .settle_payment(
                                &body.payment_id,
                                SettlementProof::Offline {
                                    reference: body.reference,
                                    proof_urls: body.proof_urls,
                                },
                            )
                            .await,
                    ),
                    Err(e) => error_response(e),
                }
            }
            (&Method::POST, ["payments", id, "refund"]) => match read_json::<RefundBody, _>(req).await {
                Ok(body) => from_result(
                    "Payment refunded",
                    s.settlement.refund(id, &body.requested_by, &body.reason),
                ),
                Err(e) => error_response(e),
            },
            (&Method::GET, ["payments", "user", user_id]) => match payment_query(&query) {
                Ok(q) => from_result("Payments found", s.settlement.list_for_user(user_id, &q)),
                Err(e) => error_response(e),
            },
            (&Method::GET, ["payments", id]) => from_result("Payment found", s.settlement.get_payment(id)),

            // Products
            (&Method::POST, ["products"]) => match read_json::<CreateProductRequest, _>(req).await {
                Ok(body) => from_create_result("Final product created", s.products.create_final_product(body)),
                Err(e) => error_response(e),
            },
            (&Method::GET, ["products", "scan", id]) => match parse_param::<String>(&query, "scannedBy") {
                Ok(scanned_by) => from_result(
                    "Product journey",
                    s.provenance.build_product_journey(id, scanned_by.as_deref()),
                ),
                Err(e) => error_response(e),
            },
            (&Method::GET, ["products", "industry", industry_id]) => {
                match parse_param::<ProductStatus>(&query, "status") {
                    Ok(status) => from_result(
                        "Products found",
                        s.products.list_by_industry(industry_id, status),
                    ),
                    Err(e) => error_response(e),
                }
            }
            (&Method::GET, ["products", "search"]) => match product_query(&query) {
                Ok(q) => from_result("Products found", s.products.search(&q)),
                Err(e) => error_response(e),
            },
            (&Method::GET, ["products", id]) => from_result("Product found", s.products.get(id)),
            (&Method::PATCH, ["products", id, "status"]) => {
                match read_json::<ProductStatusBody, _>(req).await {
                    Ok(body) => from_result(
                        "Product status updated",
                        s.products.update_status(id, &body.industry_id, body.status),
                    ),
                    Err(e) => error_response(e),
                }
            }
            (&Method::POST, ["products", id, "package"]) => match read_json::<IndustryRef, _>(req).await {
                Ok(body) => from_result("Product packaged", s.products.package(id, &body.industry_id)),
                Err(e) => error_response(e),
            },

            _ if is_known_path(&segments) => method_not_allowed(),
            _ => not_found("Not found"),
        }
    }
}

/// Paths that exist under some other method
fn is_known_path(segments: &[&str]) -> bool {
    matches!(
        segments,
        ["health"]
            | ["actors"]
            | ["batches"]
            | ["batches", _]
            | ["batches", _, "journey" | "quality-tests" | "deactivate"]
            | ["events", _, "status" | "verification"]
            | ["payments", "orders" | "verify" | "cash" | "offline"]
            | ["payments", _]
            | ["payments", _, "refund"]
            | ["products"]
            | ["products", _]
            | ["products", _, "status" | "package"]
    )
}

// =============================================================================
// Body & Query Helpers
// =============================================================================

async fn read_json<T, B>(req: Request<B>) -> Result<T, LedgerError>
where
    T: DeserializeOwned,
    B: Body,
    B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
{
    let body = Limited::new(req.into_body(), MAX_BODY_BYTES)
        .collect()
        .await
        .map_err(|e| LedgerError::InvalidInput(format!("Failed to read body: {}", e)))?
        .to_bytes();

    if body.is_empty() {
        return Err(LedgerError::InvalidInput("request body is required".into()));
    }
    Ok(serde_json::from_slice(&body)?)
}

fn parse_query(query: Option<&str>) -> HashMap<String, String> {
    query
        .map(|q| url::form_urlencoded::parse(q.as_bytes()).into_owned().collect())
        .unwrap_or_default()
}

fn parse_param<T>(query: &HashMap<String, String>, key: &str) -> Result<Option<T>, LedgerError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match query.get(key).map(|v| v.trim()).filter(|v| !v.is_empty()) {
        Some(raw) => raw
            .parse()
            .map(Some)
            .map_err(|e| LedgerError::InvalidInput(format!("invalid {}: {}", key, e))),
        None => Ok(None),
    }
}

fn batch_query(query: &HashMap<String, String>) -> Result<BatchQuery, LedgerError> {
    let defaults = BatchQuery { limit: 50, ..Default::default() };
    Ok(BatchQuery {
        herb_name: parse_param(query, "herbName")?,
        status: parse_param(query, "status")?,
        farmer_id: parse_param(query, "farmerId")?,
        include_inactive: parse_param(query, "includeInactive")?.unwrap_or(false),
        limit: parse_param(query, "limit")?.unwrap_or(defaults.limit),
        offset: parse_param(query, "offset")?.unwrap_or(defaults.offset),
    })
}

fn payment_query(query: &HashMap<String, String>) -> Result<PaymentQuery, LedgerError> {
    let defaults = PaymentQuery::default();
    let direction = match query.get("type").map(String::as_str) {
        None | Some("") | Some("all") => PaymentDirection::All,
        Some("sent") => PaymentDirection::Sent,
        Some("received") => PaymentDirection::Received,
        Some(other) => {
            return Err(LedgerError::InvalidInput(format!(
                "invalid type: {} (expected sent, received or all)",
                other
            )))
        }
    };
    Ok(PaymentQuery {
        direction,
        limit: parse_param(query, "limit")?.unwrap_or(defaults.limit),
        offset: parse_param(query, "offset")?.unwrap_or(defaults.offset),
    })
}

fn product_query(query: &HashMap<String, String>) -> Result<ProductQuery, LedgerError> {
    let defaults = ProductQuery::default();
    Ok(ProductQuery {
        name: parse_param(query, "name")?,
        brand: parse_param(query, "brand")?,
        category: parse_param(query, "category")?,
        status: parse_param(query, "status")?,
        limit: parse_param(query, "limit")?.unwrap_or(defaults.limit),
        offset: parse_param(query, "offset")?.unwrap_or(defaults.offset),
    })
}
