use chrono::{DateTime, Utc};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::classify::{ClassifiedChange, classify};
use super::model::{
    ChangeType, EnrichedListing, Listing, NewHistoryEntry, ScanSummary, Seller, SellerProfile,
};
use super::snapshot::{ListingSnapshot, SnapshotContext};
use crate::metrics;
use crate::store::{CatalogStore, ListingWrite, ScanFinalization, StoreError};

#[derive(Debug, Clone)]
pub struct ReconcileSettings {
    pub batch_size: usize,
    pub batch_timeout: Duration,
    pub finalize_timeout: Duration,
}

impl Default for ReconcileSettings {
    fn default() -> Self {
        Self {
            batch_size: 500,
            batch_timeout: Duration::from_secs(60),
            finalize_timeout: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Error)]
pub enum ReconcileError {
    #[error("seller upsert failed")]
    Seller(#[source] StoreError),

    #[error("loading stored listings failed")]
    Load(#[source] StoreError),

    #[error("batch {batch} of {batches} failed ({committed} listings already committed)")]
    Batch {
        batch: usize,
        batches: usize,
        committed: usize,
        #[source]
        source: StoreError,
    },

    #[error("deactivation and scan log failed")]
    Finalize(#[source] StoreError),

    #[error("cancelled after {committed_batches} committed batches")]
    Cancelled { committed_batches: usize },
}

/// An incoming record rejected before classification.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct SkippedListing {
    pub id: String,
    pub reason: String,
}

/// Result of one seller scan.
#[derive(Debug, Clone, PartialEq, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ScanOutcome {
    #[serde(flatten)]
    pub summary: ScanSummary,
    pub unchanged: usize,
    pub deactivated: Vec<String>,
    pub skipped: Vec<SkippedListing>,
    pub batches: usize,
}

/// Sole writer of listings, history and scan logs.
#[derive(Clone)]
pub struct Reconciler {
    store: Arc<dyn CatalogStore>,
    settings: ReconcileSettings,
}

impl Reconciler {
    pub fn new(store: Arc<dyn CatalogStore>, settings: ReconcileSettings) -> Self {
        Self { store, settings }
    }

    /// Applies one seller's scan: seller upsert, batched listing writes, then the
    /// deactivation sweep and scan log.
    ///
    /// Batches commit independently. A failed batch aborts the seller but leaves
    /// earlier batches committed; the next scan reconciles from stored state.
    pub async fn reconcile_seller(
        &self,
        profile: &SellerProfile,
        incoming: Vec<EnrichedListing>,
        scan_time: DateTime<Utc>,
        cancel: &CancellationToken,
    ) -> Result<ScanOutcome, ReconcileError> {
        let phone = profile.phone.as_str();
        let (incoming, skipped) = admit(phone, incoming);

        let seller = self
            .store
            .upsert_seller(profile)
            .await
            .map_err(ReconcileError::Seller)?;

        let ids: Vec<String> = incoming.iter().map(|l| l.raw.id.clone()).collect();
        let existing = self
            .store
            .load_listings(&ids)
            .await
            .map_err(ReconcileError::Load)?;

        let classification = classify(incoming, &existing);
        let unchanged = classification.count(ChangeType::Unchanged);
        debug!(
            target = "catalog.reconcile",
            seller = %phone,
            found = classification.products_found,
            new = classification.products_new,
            updated = classification.products_updated,
            unchanged,
            "scan_classified"
        );

        let writes: Vec<ListingWrite> = classification
            .changes
            .iter()
            .map(|change| plan_write(&seller, change, scan_time))
            .collect();

        let batch_size = self.settings.batch_size.max(1);
        let batches = writes.len().div_ceil(batch_size);
        let mut committed = 0;
        for (idx, chunk) in writes.chunks(batch_size).enumerate() {
            if cancel.is_cancelled() {
                warn!(target = "catalog.reconcile", seller = %phone, batch = idx + 1, "reconcile_cancelled");
                return Err(ReconcileError::Cancelled {
                    committed_batches: idx,
                });
            }
            let started = Instant::now();
            self.with_timeout(self.settings.batch_timeout, self.store.apply_batch(chunk))
                .await
                .map_err(|source| {
                    warn!(
                        target = "catalog.reconcile",
                        seller = %phone,
                        batch = idx + 1,
                        batches,
                        committed,
                        error = %source,
                        "batch_failed"
                    );
                    ReconcileError::Batch {
                        batch: idx + 1,
                        batches,
                        committed,
                        source,
                    }
                })?;
            committed += chunk.len();
            metrics::batch_committed(phone, chunk.len(), started.elapsed().as_millis());
            debug!(target = "catalog.reconcile", seller = %phone, batch = idx + 1, batches, writes = chunk.len(), "batch_committed");
        }

        // deactivating on a partial scan would wrongly retire listings
        if cancel.is_cancelled() {
            return Err(ReconcileError::Cancelled {
                committed_batches: batches,
            });
        }

        let summary = ScanSummary {
            seller_phone: phone.to_string(),
            scan_time,
            products_found: classification.products_found,
            products_new: classification.products_new,
            products_updated: classification.products_updated,
        };
        let finalization = ScanFinalization {
            seller_phone: phone.to_string(),
            seen_ids: ids,
            scan_time,
            context: seller_context(&seller, None),
            summary: summary.clone(),
        };
        let deactivated = self
            .with_timeout(
                self.settings.finalize_timeout,
                self.store.finalize_scan(&finalization),
            )
            .await
            .map_err(ReconcileError::Finalize)?;

        metrics::scan_recorded(
            phone,
            summary.products_found,
            summary.products_new,
            summary.products_updated,
            deactivated.len(),
        );
        info!(
            target = "catalog.reconcile",
            seller = %phone,
            found = summary.products_found,
            new = summary.products_new,
            updated = summary.products_updated,
            deactivated = deactivated.len(),
            skipped = skipped.len(),
            "scan_reconciled"
        );

        Ok(ScanOutcome {
            summary,
            unchanged,
            deactivated: deactivated.into_iter().map(|l| l.id).collect(),
            skipped,
            batches,
        })
    }

    async fn with_timeout<T>(
        &self,
        limit: Duration,
        op: impl Future<Output = Result<T, StoreError>>,
    ) -> Result<T, StoreError> {
        match tokio::time::timeout(limit, op).await {
            Ok(result) => result,
            Err(_) => Err(StoreError::Timeout(limit)),
        }
    }
}

/// Drops records that cannot be keyed: empty ids, foreign sellers and repeated ids
/// (first occurrence wins).
fn admit(
    phone: &str,
    incoming: Vec<EnrichedListing>,
) -> (Vec<EnrichedListing>, Vec<SkippedListing>) {
    let mut seen = HashSet::new();
    let mut admitted = Vec::with_capacity(incoming.len());
    let mut skipped = Vec::new();

    for listing in incoming {
        let id = listing.raw.id.trim();
        let reason = if id.is_empty() {
            Some("missing listing id")
        } else if listing.raw.seller_phone != phone {
            Some("listing belongs to another seller")
        } else if !seen.insert(id.to_string()) {
            Some("duplicate listing id in scan")
        } else {
            None
        };
        match reason {
            Some(reason) => {
                warn!(target = "catalog.reconcile", seller = %phone, id = %listing.raw.id, reason, "listing_skipped");
                skipped.push(SkippedListing {
                    id: listing.raw.id.clone(),
                    reason: reason.to_string(),
                });
            }
            None => admitted.push(listing),
        }
    }
    (admitted, skipped)
}

fn seller_context(seller: &Seller, product_url: Option<&str>) -> SnapshotContext {
    SnapshotContext {
        product_url: product_url.map(str::to_string),
        seller_name: seller.name.clone(),
        seller_city: seller.city.clone(),
        seller_catalogue_url: seller.catalogue_url.clone(),
    }
}

fn plan_write(seller: &Seller, change: &ClassifiedChange, scan_time: DateTime<Utc>) -> ListingWrite {
    let raw = &change.listing.raw;
    if !change.change.is_recorded() {
        return ListingWrite::Touch {
            id: raw.id.clone(),
            seen_at: scan_time,
        };
    }

    let existing = change.existing.as_ref();
    let last_modified_at = match existing {
        None => Some(scan_time),
        Some(stored) => {
            let hash_changed = stored
                .data_hash
                .as_deref()
                .is_some_and(|stored_hash| stored_hash != change.data_hash);
            if hash_changed {
                Some(scan_time)
            } else {
                stored.last_modified_at
            }
        }
    };

    let listing = Listing {
        id: raw.id.clone(),
        seller_phone: seller.phone.clone(),
        raw_name: raw.name.clone(),
        raw_description: raw.description.clone(),
        price: raw.normalized_price(),
        currency: raw.currency.clone(),
        availability: raw.availability_text(),
        attributes: change.listing.attributes.clone(),
        data_hash: Some(change.data_hash.clone()),
        is_active: true,
        first_seen_at: existing.map_or(scan_time, |stored| stored.first_seen_at),
        last_seen_at: scan_time,
        last_modified_at,
    };
    let snapshot = ListingSnapshot::capture(&listing, &seller_context(seller, raw.product_url.as_deref()));

    ListingWrite::Upsert {
        history: NewHistoryEntry {
            listing_id: listing.id.clone(),
            change_type: change.change,
            snapshot,
            recorded_at: scan_time,
        },
        listing,
    }
}
