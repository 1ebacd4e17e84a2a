//! Catalog domain: listing model, content hashing, change classification and
//! the batched reconciler that applies a seller's scan to the store.

mod classify;
mod hash;
mod model;
mod reconcile;
mod snapshot;

pub use model::{
    ChangeType, EnrichedListing, HistoryEntry, Listing, ListingAttributes, NewHistoryEntry,
    RawListing, ScanLog, ScanSummary, Seller, SellerProfile,
};
pub use reconcile::{ReconcileError, ReconcileSettings, Reconciler, ScanOutcome, SkippedListing};
pub use snapshot::{ListingSnapshot, SnapshotContext};
