//! herbtrack - herb supply-chain ledger
//!
//! Tracks herb batches from harvest to packaged product. A batch changes
//! hands only when a payment for it settles; every custody change,
//! processing step and lab result is an immutable chain event; a final
//! product records which batches went into it and snapshots their history.
//!
//! ## Architecture
//!
//! | Layer | Module |
//! |-------|--------|
//! | HTTP API | [`http`] |
//! | Business rules, transactions | [`services`] |
//! | Actor lookup by kind | [`identity`] |
//! | Payment oracle | [`gateway`] |
//! | Scan codes | [`codes`] |
//! | SQLite ledger | [`db`] |
//!
//! ## Storage Layout
//!
//! ```text
//! ~/.local/share/herbtrack/
//! ├── ledger.db      # SQLite (WAL) ledger
//! └── config.toml    # Configuration
//! ```

pub mod config;
pub mod error;
pub mod db;
pub mod identity;
pub mod gateway;
pub mod codes;
pub mod services;
pub mod http;

// Re-exports
pub use config::Config;
pub use db::LedgerDb;
pub use error::LedgerError;
pub use http::HttpServer;
pub use identity::ActorRegistry;
pub use services::Services;
