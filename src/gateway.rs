//! Payment gateway (trust oracle)
//!
//! The ledger never talks to a payment processor directly. It asks a
//! [`PaymentGateway`] for an order handle when a gateway-mode payment is
//! opened, and asks it again whether a returned signature is genuine before
//! settling. Implementations can be swapped (tests use a mock).

use async_trait::async_trait;
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use uuid::Uuid;

use crate::error::LedgerError;

type HmacSha256 = Hmac<Sha256>;

/// Order handle returned by the gateway
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GatewayOrder {
    pub order_id: String,
    /// Minor units
    pub amount: i64,
    pub currency: String,
    pub receipt: String,
    /// Public key id the client needs to open checkout
    pub key_id: String,
}

#[async_trait]
pub trait PaymentGateway: Send + Sync {
    /// Public key id handed to clients with every order
    fn key_id(&self) -> &str;

    /// Create an order for `amount` minor units, tagged with our `receipt`
    async fn create_order(&self, amount: i64, receipt: &str) -> Result<GatewayOrder, LedgerError>;

    /// Check a signature returned to the client after checkout
    async fn verify_signature(
        &self,
        order_id: &str,
        payment_id: &str,
        signature: &str,
    ) -> Result<bool, LedgerError>;
}

/// Gateway that verifies HMAC-SHA256 signatures over `"{order_id}|{payment_id}"`
/// with a shared secret, and mints order handles locally.
pub struct HmacGateway {
    key_id: String,
    key_secret: String,
    currency: String,
}

impl HmacGateway {
    pub fn new(key_id: impl Into<String>, key_secret: impl Into<String>, currency: impl Into<String>) -> Self {
        Self {
            key_id: key_id.into(),
            key_secret: key_secret.into(),
            currency: currency.into(),
        }
    }

    /// Hex signature the gateway would issue for this order/payment pair
    pub fn sign(&self, order_id: &str, payment_id: &str) -> Result<String, LedgerError> {
        let mut mac = <HmacSha256 as Mac>::new_from_slice(self.key_secret.as_bytes())
            .map_err(|e| LedgerError::Config(format!("invalid gateway secret: {e}")))?;
        mac.update(format!("{}|{}", order_id, payment_id).as_bytes());
        Ok(hex::encode(mac.finalize().into_bytes()))
    }
}

#[async_trait]
impl PaymentGateway for HmacGateway {
    fn key_id(&self) -> &str {
        &self.key_id
    }

    async fn create_order(&self, amount: i64, receipt: &str) -> Result<GatewayOrder, LedgerError> {
        if amount <= 0 {
            return Err(LedgerError::InvalidInput("order amount must be positive".into()));
        }
        Ok(GatewayOrder {
            order_id: format!("order_{}", Uuid::new_v4().simple()),
            amount,
            currency: self.currency.clone(),
            receipt: receipt.to_string(),
            key_id: self.key_id.clone(),
        })
    }

    async fn verify_signature(
        &self,
        order_id: &str,
        payment_id: &str,
        signature: &str,
    ) -> Result<bool, LedgerError> {
        if self.key_secret.is_empty() {
            return Err(LedgerError::Config("gateway secret is not configured".into()));
        }
        let Ok(expected) = hex::decode(signature.trim()) else {
            return Ok(false);
        };

        let mut mac = <HmacSha256 as Mac>::new_from_slice(self.key_secret.as_bytes())
            .map_err(|e| LedgerError::Config(format!("invalid gateway secret: {e}")))?;
        mac.update(format!("{}|{}", order_id, payment_id).as_bytes());
        Ok(mac.verify_slice(&expected).is_ok())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn gateway() -> HmacGateway {
        HmacGateway::new("rzp_test_key", "shh", "INR")
    }

    #[tokio::test]
    async fn test_signature_round_trip() {
        let gw = gateway();
        let sig = gw.sign("order_1", "pay_1").unwrap();
        assert!(gw.verify_signature("order_1", "pay_1", &sig).await.unwrap());
        assert!(!gw.verify_signature("order_1", "pay_2", &sig).await.unwrap());
        assert!(!gw.verify_signature("order_1", "pay_1", "not-hex").await.unwrap());
    }

    #[tokio::test]
    async fn test_known_vector() {
        let sig = gateway().sign("order_1", "pay_1").unwrap();
        assert_eq!(sig, "11875d078d618316e1bd46ff51229da0ad86d74508c45016b5d47305d5720c53");
    }

    #[tokio::test]
    async fn test_create_order_echoes_receipt() {
        let order = gateway().create_order(5_000, "PAY-1").await.unwrap();
        assert!(order.order_id.starts_with("order_"));
        assert_eq!(order.receipt, "PAY-1");
        assert_eq!(order.key_id, "rzp_test_key");
        assert_eq!(gateway().key_id(), order.key_id);
        assert!(gateway().create_order(0, "PAY-1").await.is_err());
    }

    #[tokio::test]
    async fn test_missing_secret_is_config_error() {
        let gw = HmacGateway::new("k", "", "INR");
        assert!(matches!(
            gw.verify_signature("o", "p", "00").await,
            Err(LedgerError::Config(_))
        ));
    }
}
