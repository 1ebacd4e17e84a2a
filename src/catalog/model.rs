use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::str::FromStr;

use super::snapshot::ListingSnapshot;

/// The storefront encodes prices in thousandths of the currency unit.
const PRICE_SCALE: i64 = 1000;

/// One record as emitted by the storefront scraper (`products.json`).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawListing {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub seller_phone: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub price_raw: Option<Value>,
    #[serde(default)]
    pub currency: Option<String>,
    #[serde(default)]
    pub availability: Option<Value>,
    #[serde(default)]
    pub product_url: Option<String>,
    #[serde(default)]
    pub seller_name: Option<String>,
    #[serde(default)]
    pub seller_city: Option<String>,
    #[serde(default)]
    pub seller_catalogue_url: Option<String>,
}

impl RawListing {
    /// Raw price in the scraper's own textual form, empty when absent.
    pub fn price_text(&self) -> String {
        self.price_raw.as_ref().and_then(loose_text).unwrap_or_default()
    }

    pub fn availability_text(&self) -> Option<String> {
        self.availability.as_ref().and_then(loose_text)
    }

    /// Price in whole currency units.
    pub fn normalized_price(&self) -> Option<Decimal> {
        self.price_raw.as_ref().and_then(normalize_price)
    }
}

/// Renders a loosely typed scraper field as text. `null` is treated as absent.
pub fn loose_text(value: &Value) -> Option<String> {
    match value {
        Value::Null => None,
        Value::String(text) => Some(text.clone()),
        Value::Number(number) => Some(number.to_string()),
        Value::Bool(flag) => Some(flag.to_string()),
        other => Some(other.to_string()),
    }
}

/// Converts the storefront's micro-unit price into currency units.
pub fn normalize_price(value: &Value) -> Option<Decimal> {
    let text = match value {
        Value::Number(number) => number.to_string(),
        Value::String(text) => text.trim().to_string(),
        _ => return None,
    };
    let micro = Decimal::from_str(&text)
        .or_else(|_| Decimal::from_scientific(&text))
        .ok()?;
    micro.checked_div(Decimal::from(PRICE_SCALE))
}

/// Normalised descriptive attributes produced by enrichment.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListingAttributes {
    pub model_name: Option<String>,
    pub storage_gb: Option<String>,
    pub color: Option<String>,
    pub warranty: Option<String>,
    pub battery_health: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct EnrichedListing {
    pub raw: RawListing,
    pub attributes: ListingAttributes,
}

impl EnrichedListing {
    pub fn bare(raw: RawListing) -> Self {
        Self {
            raw,
            attributes: ListingAttributes::default(),
        }
    }
}

/// Seller metadata observed for a scan; `None` fields never overwrite stored values.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SellerProfile {
    pub phone: String,
    pub name: Option<String>,
    pub city: Option<String>,
    pub catalogue_url: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Seller {
    pub phone: String,
    pub name: Option<String>,
    pub city: Option<String>,
    pub catalogue_url: Option<String>,
    pub is_active: bool,
}

impl Seller {
    pub fn from_profile(profile: &SellerProfile) -> Self {
        Self {
            phone: profile.phone.clone(),
            name: profile.name.clone(),
            city: profile.city.clone(),
            catalogue_url: profile.catalogue_url.clone(),
            is_active: true,
        }
    }

    /// Non-destructive merge: only fields present in `profile` are taken over.
    pub fn absorb(&mut self, profile: &SellerProfile) {
        if let Some(name) = &profile.name {
            self.name = Some(name.clone());
        }
        if let Some(city) = &profile.city {
            self.city = Some(city.clone());
        }
        if let Some(url) = &profile.catalogue_url {
            self.catalogue_url = Some(url.clone());
        }
        self.is_active = true;
    }
}

/// Durable listing state.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Listing {
    pub id: String,
    pub seller_phone: String,
    pub raw_name: Option<String>,
    pub raw_description: Option<String>,
    pub price: Option<Decimal>,
    pub currency: Option<String>,
    pub availability: Option<String>,
    #[serde(flatten)]
    pub attributes: ListingAttributes,
    pub data_hash: Option<String>,
    pub is_active: bool,
    pub first_seen_at: DateTime<Utc>,
    pub last_seen_at: DateTime<Utc>,
    pub last_modified_at: Option<DateTime<Utc>>,
}

impl Listing {
    /// State after the listing disappeared from its seller's scan.
    pub fn deactivated(&self, scan_time: DateTime<Utc>) -> Self {
        Self {
            is_active: false,
            last_modified_at: Some(scan_time),
            ..self.clone()
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ChangeType {
    Created,
    Updated,
    Reactivated,
    Unchanged,
    Deactivated,
}

impl ChangeType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChangeType::Created => "CREATED",
            ChangeType::Updated => "UPDATED",
            ChangeType::Reactivated => "REACTIVATED",
            ChangeType::Unchanged => "UNCHANGED",
            ChangeType::Deactivated => "DEACTIVATED",
        }
    }

    pub fn parse(input: &str) -> Option<Self> {
        match input {
            "CREATED" => Some(ChangeType::Created),
            "UPDATED" => Some(ChangeType::Updated),
            "REACTIVATED" => Some(ChangeType::Reactivated),
            "UNCHANGED" => Some(ChangeType::Unchanged),
            "DEACTIVATED" => Some(ChangeType::Deactivated),
            _ => None,
        }
    }

    /// Whether this change is recorded in listing history.
    pub fn is_recorded(&self) -> bool {
        !matches!(self, ChangeType::Unchanged)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct NewHistoryEntry {
    pub listing_id: String,
    pub change_type: ChangeType,
    pub snapshot: ListingSnapshot,
    pub recorded_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryEntry {
    pub id: i64,
    pub listing_id: String,
    pub change_type: ChangeType,
    pub snapshot: ListingSnapshot,
    pub recorded_at: DateTime<Utc>,
}

/// Per-seller result of one reconciliation pass.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScanSummary {
    pub seller_phone: String,
    pub scan_time: DateTime<Utc>,
    pub products_found: usize,
    pub products_new: usize,
    pub products_updated: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ScanLog {
    pub id: i64,
    #[serde(flatten)]
    pub summary: ScanSummary,
}
