//! Catalog store boundary.
//!
//! The reconciler is the only writer. Every write method is atomic: a batch either
//! commits completely or leaves no trace.

mod memory;
mod postgres;

pub use memory::MemoryCatalogStore;
pub use postgres::{PgCatalogStore, PgStoreSettings};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::error::{DatabaseError, ErrorKind};
use std::collections::HashMap;
use std::time::Duration;
use thiserror::Error;

use crate::catalog::{
    HistoryEntry, Listing, NewHistoryEntry, ScanLog, ScanSummary, Seller, SellerProfile,
    SnapshotContext,
};

/// One listing mutation inside a batch transaction.
#[derive(Debug, Clone, PartialEq)]
pub enum ListingWrite {
    /// Listing observed with unchanged content: advance `last_seen_at`, keep it active.
    Touch { id: String, seen_at: DateTime<Utc> },
    /// Full upsert followed by exactly one history row.
    Upsert {
        listing: Listing,
        history: NewHistoryEntry,
    },
}

impl ListingWrite {
    pub fn listing_id(&self) -> &str {
        match self {
            ListingWrite::Touch { id, .. } => id,
            ListingWrite::Upsert { listing, .. } => &listing.id,
        }
    }
}

/// Closing step of a seller scan: deactivation sweep plus scan log.
#[derive(Debug, Clone, PartialEq)]
pub struct ScanFinalization {
    pub seller_phone: String,
    pub seen_ids: Vec<String>,
    pub scan_time: DateTime<Utc>,
    pub context: SnapshotContext,
    pub summary: ScanSummary,
}

#[async_trait]
pub trait CatalogStore: Send + Sync {
    /// Creates the seller or merges non-null profile fields into it; always marks it active.
    async fn upsert_seller(&self, profile: &SellerProfile) -> Result<Seller, StoreError>;

    async fn seller(&self, phone: &str) -> Result<Option<Seller>, StoreError>;

    /// Batch read keyed by listing id. Unknown ids are simply absent.
    async fn load_listings(&self, ids: &[String]) -> Result<HashMap<String, Listing>, StoreError>;

    /// Applies the writes in order inside one transaction.
    async fn apply_batch(&self, writes: &[ListingWrite]) -> Result<(), StoreError>;

    /// Deactivates the seller's active listings missing from `seen_ids`, records one
    /// history row per deactivation and writes the scan log, in one transaction.
    /// Returns the deactivated listings in their new state.
    async fn finalize_scan(&self, scan: &ScanFinalization) -> Result<Vec<Listing>, StoreError>;

    async fn listing(&self, id: &str) -> Result<Option<Listing>, StoreError>;

    async fn seller_listings(&self, phone: &str) -> Result<Vec<Listing>, StoreError>;

    /// History rows for a listing, oldest first.
    async fn listing_history(&self, listing_id: &str) -> Result<Vec<HistoryEntry>, StoreError>;

    /// Scan logs for a seller, oldest first.
    async fn scan_logs(&self, seller_phone: &str) -> Result<Vec<ScanLog>, StoreError>;
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("record already exists")]
    AlreadyExists,

    #[error("record not found: {0}")]
    NotFound(String),

    #[error("related record not found")]
    InvalidReference,

    #[error("missing required data")]
    MissingRequiredData,

    #[error("invalid data: {0}")]
    InvalidData(String),

    #[error("transaction exceeded {0:?}")]
    Timeout(Duration),

    #[error("storage error")]
    Sql(#[source] sqlx::Error),

    #[error("migration failed")]
    Migrate(#[from] sqlx::migrate::MigrateError),
}

impl From<sqlx::Error> for StoreError {
    fn from(error: sqlx::Error) -> Self {
        if matches!(error, sqlx::Error::RowNotFound) {
            return Self::NotFound("row".into());
        }

        match error.as_database_error().map(DatabaseError::kind) {
            Some(ErrorKind::UniqueViolation) => Self::AlreadyExists,
            Some(ErrorKind::ForeignKeyViolation) => Self::InvalidReference,
            Some(ErrorKind::NotNullViolation) => Self::MissingRequiredData,
            Some(ErrorKind::CheckViolation) => Self::InvalidData("check constraint".into()),
            Some(ErrorKind::Other | _) | None => Self::Sql(error),
        }
    }
}
