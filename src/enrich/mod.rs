//! Attribute enrichment boundary.
//!
//! Enrichment is best effort: implementations never fail, they degrade to
//! all-null results and the reconciler stores listings without attributes.

mod llm;

pub use llm::LlmEnricher;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::catalog::{EnrichedListing, ListingAttributes, RawListing};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EnrichmentResult {
    pub id: String,
    #[serde(flatten)]
    pub attributes: ListingAttributes,
}

impl EnrichmentResult {
    pub fn empty(id: &str) -> Self {
        Self {
            id: id.to_string(),
            attributes: ListingAttributes::default(),
        }
    }
}

/// Returns one result per input listing, in input order.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Enricher: Send + Sync {
    async fn enrich(&self, listings: &[RawListing]) -> Vec<EnrichmentResult>;
}

/// Used when no provider is configured.
#[derive(Debug, Clone, Default)]
pub struct NoopEnricher;

#[async_trait]
impl Enricher for NoopEnricher {
    async fn enrich(&self, listings: &[RawListing]) -> Vec<EnrichmentResult> {
        listings
            .iter()
            .map(|listing| EnrichmentResult::empty(&listing.id))
            .collect()
    }
}

/// Attaches enrichment results to their listings by id. Listings without a
/// result keep empty attributes.
pub fn merge_enrichment(
    listings: Vec<RawListing>,
    results: Vec<EnrichmentResult>,
) -> Vec<EnrichedListing> {
    let mut by_id: HashMap<String, ListingAttributes> = HashMap::with_capacity(results.len());
    for result in results {
        by_id.entry(result.id).or_insert(result.attributes);
    }
    listings
        .into_iter()
        .map(|raw| {
            let attributes = by_id.remove(&raw.id).unwrap_or_default();
            EnrichedListing { raw, attributes }
        })
        .collect()
}
