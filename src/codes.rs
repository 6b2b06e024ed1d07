//! Scannable codes for batches and products
//!
//! The ledger stores whatever the encoder returns as opaque strings. The
//! default encoder points at the public scan page and renders the URL as a
//! `data:` payload that a front end can turn into a QR image.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use serde::{Deserialize, Serialize};
use url::Url;

use crate::error::LedgerError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScanKind {
    Batch,
    Product,
}

impl ScanKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ScanKind::Batch => "batch",
            ScanKind::Product => "product",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScanCode {
    pub url: String,
    pub rendered: String,
}

pub trait CodeEncoder: Send + Sync {
    fn encode(&self, entity_id: &str, kind: ScanKind) -> Result<ScanCode, LedgerError>;
}

/// Encodes `{base}/scan/{kind}/{id}`
pub struct UrlCodeEncoder {
    base: Url,
}

impl UrlCodeEncoder {
    pub fn new(base_url: &str) -> Result<Self, LedgerError> {
        let base = Url::parse(base_url)
            .map_err(|e| LedgerError::Config(format!("invalid scan base url {}: {}", base_url, e)))?;
        Ok(Self { base })
    }
}

impl CodeEncoder for UrlCodeEncoder {
    fn encode(&self, entity_id: &str, kind: ScanKind) -> Result<ScanCode, LedgerError> {
        if entity_id.is_empty() {
            return Err(LedgerError::InvalidInput("cannot encode an empty id".into()));
        }

        let mut url = self.base.clone();
        url.path_segments_mut()
            .map_err(|_| LedgerError::Config("scan base url cannot carry a path".into()))?
            .pop_if_empty()
            .extend(["scan", kind.as_str(), entity_id]);

        let url = url.to_string();
        let rendered = format!("data:text/plain;base64,{}", STANDARD.encode(url.as_bytes()));
        Ok(ScanCode { url, rendered })
    }
}
