//! Producers of raw listings.

mod command;
mod file;

pub use command::{CommandSource, ScrapeOutput};
pub use file::JsonFileSource;

use async_trait::async_trait;
use std::collections::HashSet;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::catalog::{RawListing, SkippedListing};

#[derive(Debug, Error)]
pub enum SourceError {
    #[error("listing source unavailable: {0}")]
    Unavailable(String),

    #[error("storefront login required (scan the QR code)")]
    AuthRequired,

    #[error("listing source cancelled")]
    Cancelled,

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Which sellers a run covers.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum SellerScope {
    #[default]
    All,
    Phones(Vec<String>),
}

impl SellerScope {
    pub fn includes(&self, phone: &str) -> bool {
        match self {
            SellerScope::All => true,
            SellerScope::Phones(phones) => phones.iter().any(|p| p == phone),
        }
    }
}

/// Listings produced by one fetch plus the records that could not be used.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SourceBatch {
    pub listings: Vec<RawListing>,
    pub skipped: Vec<SkippedListing>,
    pub output: Option<ScrapeOutput>,
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ListingSource: Send + Sync {
    async fn fetch(
        &self,
        scope: &SellerScope,
        cancel: &CancellationToken,
    ) -> Result<SourceBatch, SourceError>;
}

/// Keeps keyed, in-scope records. Repeated ids keep their first occurrence.
pub(crate) fn admit_records(
    records: Vec<serde_json::Value>,
    scope: &SellerScope,
) -> (Vec<RawListing>, Vec<SkippedListing>) {
    let mut seen = HashSet::new();
    let mut listings = Vec::with_capacity(records.len());
    let mut skipped = Vec::new();

    for (idx, record) in records.into_iter().enumerate() {
        let listing: RawListing = match serde_json::from_value(record) {
            Ok(listing) => listing,
            Err(err) => {
                skipped.push(SkippedListing {
                    id: format!("#{idx}"),
                    reason: format!("malformed record: {err}"),
                });
                continue;
            }
        };
        let reason = if listing.id.trim().is_empty() {
            Some("missing listing id")
        } else if listing.seller_phone.trim().is_empty() {
            Some("missing seller phone")
        } else if !seen.insert(listing.id.clone()) {
            Some("duplicate listing id")
        } else {
            None
        };
        match reason {
            Some(reason) => skipped.push(SkippedListing {
                id: if listing.id.is_empty() { format!("#{idx}") } else { listing.id },
                reason: reason.to_string(),
            }),
            None if scope.includes(&listing.seller_phone) => listings.push(listing),
            None => {}
        }
    }
    (listings, skipped)
}
