use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap, HashSet};
use tokio::sync::Mutex;

use super::{CatalogStore, ListingWrite, ScanFinalization, StoreError};
use crate::catalog::{
    ChangeType, HistoryEntry, Listing, ListingSnapshot, NewHistoryEntry, ScanLog, Seller,
    SellerProfile,
};

/// Process-local store with the same batch-atomic semantics as the Postgres store.
///
/// Used when no database is configured and as the backing store in tests.
#[derive(Debug, Default)]
pub struct MemoryCatalogStore {
    state: Mutex<MemoryState>,
}

#[derive(Debug, Default)]
struct MemoryState {
    sellers: BTreeMap<String, Seller>,
    listings: BTreeMap<String, Listing>,
    history: Vec<HistoryEntry>,
    scan_logs: Vec<ScanLog>,
    poisoned: HashSet<String>,
}

impl MemoryCatalogStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes any batch touching `listing_id` fail, simulating a constraint violation.
    #[cfg(test)]
    pub async fn poison(&self, listing_id: &str) {
        self.state.lock().await.poisoned.insert(listing_id.to_string());
    }

    #[cfg(test)]
    pub async fn history_len(&self) -> usize {
        self.state.lock().await.history.len()
    }

    #[cfg(test)]
    pub async fn insert_listing(&self, listing: Listing) {
        let mut state = self.state.lock().await;
        state
            .sellers
            .entry(listing.seller_phone.clone())
            .or_insert_with(|| {
                Seller::from_profile(&SellerProfile {
                    phone: listing.seller_phone.clone(),
                    ..SellerProfile::default()
                })
            });
        state.listings.insert(listing.id.clone(), listing);
    }
}

impl MemoryState {
    fn push_history(&mut self, entry: NewHistoryEntry) {
        let id = i64::try_from(self.history.len()).unwrap_or(i64::MAX) + 1;
        self.history.push(HistoryEntry {
            id,
            listing_id: entry.listing_id,
            change_type: entry.change_type,
            snapshot: entry.snapshot,
            recorded_at: entry.recorded_at,
        });
    }

    /// Checks every write before anything is mutated, so a rejected batch leaves no trace.
    fn validate(&self, writes: &[ListingWrite]) -> Result<(), StoreError> {
        for write in writes {
            let id = write.listing_id();
            if self.poisoned.contains(id) {
                return Err(StoreError::InvalidData(format!("rejected listing {id}")));
            }
            match write {
                ListingWrite::Touch { id, .. } => {
                    if !self.listings.contains_key(id) {
                        return Err(StoreError::NotFound(id.clone()));
                    }
                }
                ListingWrite::Upsert { listing, .. } => {
                    if !self.sellers.contains_key(&listing.seller_phone) {
                        return Err(StoreError::InvalidReference);
                    }
                }
            }
        }
        Ok(())
    }
}

#[async_trait]
impl CatalogStore for MemoryCatalogStore {
    async fn upsert_seller(&self, profile: &SellerProfile) -> Result<Seller, StoreError> {
        let mut state = self.state.lock().await;
        let seller = state
            .sellers
            .entry(profile.phone.clone())
            .and_modify(|seller| seller.absorb(profile))
            .or_insert_with(|| Seller::from_profile(profile));
        Ok(seller.clone())
    }

    async fn seller(&self, phone: &str) -> Result<Option<Seller>, StoreError> {
        Ok(self.state.lock().await.sellers.get(phone).cloned())
    }

    async fn load_listings(
        &self,
        ids: &[String],
    ) -> Result<HashMap<String, Listing>, StoreError> {
        let state = self.state.lock().await;
        Ok(ids
            .iter()
            .filter_map(|id| state.listings.get(id).map(|row| (id.clone(), row.clone())))
            .collect())
    }

    async fn apply_batch(&self, writes: &[ListingWrite]) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        state.validate(writes)?;

        for write in writes {
            match write {
                ListingWrite::Touch { id, seen_at } => {
                    if let Some(row) = state.listings.get_mut(id) {
                        row.last_seen_at = *seen_at;
                        row.is_active = true;
                    }
                }
                ListingWrite::Upsert { listing, history } => {
                    let mut row = listing.clone();
                    if let Some(current) = state.listings.get(&listing.id) {
                        row.first_seen_at = current.first_seen_at;
                    }
                    state.listings.insert(row.id.clone(), row);
                    state.push_history(history.clone());
                }
            }
        }
        Ok(())
    }

    async fn finalize_scan(&self, scan: &ScanFinalization) -> Result<Vec<Listing>, StoreError> {
        let mut state = self.state.lock().await;
        if !state.sellers.contains_key(&scan.seller_phone) {
            return Err(StoreError::InvalidReference);
        }
        let seen: HashSet<&str> = scan.seen_ids.iter().map(String::as_str).collect();

        let stale: Vec<Listing> = state
            .listings
            .values()
            .filter(|row| {
                row.seller_phone == scan.seller_phone
                    && row.is_active
                    && !seen.contains(row.id.as_str())
            })
            .map(|row| row.deactivated(scan.scan_time))
            .collect();

        for row in &stale {
            state.listings.insert(row.id.clone(), row.clone());
            state.push_history(NewHistoryEntry {
                listing_id: row.id.clone(),
                change_type: ChangeType::Deactivated,
                snapshot: ListingSnapshot::capture(row, &scan.context),
                recorded_at: scan.scan_time,
            });
        }

        let id = i64::try_from(state.scan_logs.len()).unwrap_or(i64::MAX) + 1;
        state.scan_logs.push(ScanLog {
            id,
            summary: scan.summary.clone(),
        });
        Ok(stale)
    }

    async fn listing(&self, id: &str) -> Result<Option<Listing>, StoreError> {
        Ok(self.state.lock().await.listings.get(id).cloned())
    }

    async fn seller_listings(&self, phone: &str) -> Result<Vec<Listing>, StoreError> {
        let state = self.state.lock().await;
        Ok(state
            .listings
            .values()
            .filter(|row| row.seller_phone == phone)
            .cloned()
            .collect())
    }

    async fn listing_history(&self, listing_id: &str) -> Result<Vec<HistoryEntry>, StoreError> {
        let state = self.state.lock().await;
        Ok(state
            .history
            .iter()
            .filter(|entry| entry.listing_id == listing_id)
            .cloned()
            .collect())
    }

    async fn scan_logs(&self, seller_phone: &str) -> Result<Vec<ScanLog>, StoreError> {
        let state = self.state.lock().await;
        Ok(state
            .scan_logs
            .iter()
            .filter(|log| log.summary.seller_phone == seller_phone)
            .cloned()
            .collect())
    }
}
