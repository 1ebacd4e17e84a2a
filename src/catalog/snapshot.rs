//! Versioned listing snapshots stored with every history row.
//!
//! Rows written by older builds must stay readable, so the payload is tagged with a
//! schema version and new layouts are added as new variants.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use super::model::{Listing, ListingAttributes};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "version")]
pub enum ListingSnapshot {
    #[serde(rename = "1")]
    V1(SnapshotV1),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SnapshotV1 {
    pub id: String,
    pub seller_phone: String,
    pub seller_name: Option<String>,
    pub seller_city: Option<String>,
    pub seller_catalogue_url: Option<String>,
    pub raw_name: Option<String>,
    pub raw_description: Option<String>,
    pub price_raw: Option<Decimal>,
    pub currency: Option<String>,
    pub availability: Option<String>,
    pub product_url: Option<String>,
    #[serde(flatten)]
    pub attributes: ListingAttributes,
    pub data_hash: Option<String>,
    pub is_active: bool,
    pub first_seen_at: DateTime<Utc>,
    pub last_seen_at: DateTime<Utc>,
    pub last_modified_at: Option<DateTime<Utc>>,
}

/// Denormalised context that is not part of the listing row itself.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SnapshotContext {
    pub product_url: Option<String>,
    pub seller_name: Option<String>,
    pub seller_city: Option<String>,
    pub seller_catalogue_url: Option<String>,
}

impl ListingSnapshot {
    pub fn capture(listing: &Listing, context: &SnapshotContext) -> Self {
        ListingSnapshot::V1(SnapshotV1 {
            id: listing.id.clone(),
            seller_phone: listing.seller_phone.clone(),
            seller_name: context.seller_name.clone(),
            seller_city: context.seller_city.clone(),
            seller_catalogue_url: context.seller_catalogue_url.clone(),
            raw_name: listing.raw_name.clone(),
            raw_description: listing.raw_description.clone(),
            price_raw: listing.price,
            currency: listing.currency.clone(),
            availability: listing.availability.clone(),
            product_url: context.product_url.clone(),
            attributes: listing.attributes.clone(),
            data_hash: listing.data_hash.clone(),
            is_active: listing.is_active,
            first_seen_at: listing.first_seen_at,
            last_seen_at: listing.last_seen_at,
            last_modified_at: listing.last_modified_at,
        })
    }

    pub fn listing_id(&self) -> &str {
        match self {
            ListingSnapshot::V1(v1) => &v1.id,
        }
    }

    pub fn is_active(&self) -> bool {
        match self {
            ListingSnapshot::V1(v1) => v1.is_active,
        }
    }
}
